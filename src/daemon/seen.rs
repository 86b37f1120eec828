//! Process-wide bookkeeping of daemon UUIDs

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct SeenInner {
    seen: HashSet<Uuid>,
    /// daemon uuid -> handle currently connected to it
    claims: HashMap<Uuid, Uuid>,
}

/// Outcome of a successful claim
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sighting {
    /// First time this process talks to the daemon
    First,
    Repeat,
}

/// Daemons this process has already talked to, and which handle owns each.
///
/// Both are updated under one lock so the first-contact decision and the
/// ownership check cannot interleave.
#[derive(Default)]
pub struct SeenDaemons {
    inner: Mutex<SeenInner>,
}

impl SeenDaemons {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SeenInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claim `daemon` for `handle`.
    ///
    /// Fails with the owning handle id if another handle holds the claim.
    pub fn claim(&self, daemon: Uuid, handle: Uuid) -> Result<Sighting, Uuid> {
        let mut inner = self.lock();
        match inner.claims.get(&daemon) {
            Some(owner) if *owner != handle => return Err(*owner),
            _ => {}
        }
        inner.claims.insert(daemon, handle);
        if inner.seen.insert(daemon) {
            Ok(Sighting::First)
        } else {
            Ok(Sighting::Repeat)
        }
    }

    /// Drop `handle`'s claim on `daemon`, if it holds one
    pub fn release(&self, daemon: Uuid, handle: Uuid) {
        let mut inner = self.lock();
        if inner.claims.get(&daemon) == Some(&handle) {
            inner.claims.remove(&daemon);
        }
    }

    pub fn has_seen(&self, daemon: Uuid) -> bool {
        self.lock().seen.contains(&daemon)
    }

    pub fn owner(&self, daemon: Uuid) -> Option<Uuid> {
        self.lock().claims.get(&daemon).copied()
    }

    /// Release every claim; the seen set lives as long as the process
    pub fn release_all(&self) {
        self.lock().claims.clear();
    }
}
