//! Daemon registry: every known daemon, unique by hostname and alias

use super::handle::{DaemonError, DaemonHandle, DaemonSettings};
use super::seen::SeenDaemons;
use crate::host::{HostError, RemoteHostDescriptor};
use log::info;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("a daemon with hostname {0} is already registered")]
    DuplicateHostname(String),

    #[error("a daemon with alias {0} is already registered")]
    DuplicateAlias(String),

    #[error("daemon {0} cannot be changed in place; remove it and register again")]
    UpdateUnsupported(String),

    #[error("no daemon {0}")]
    NotFound(String),

    #[error("daemon registry is shut down")]
    ShutDown,

    #[error(transparent)]
    InvalidHost(#[from] HostError),

    #[error(transparent)]
    Daemon(#[from] DaemonError),
}

struct RegistryInner {
    open: bool,
    by_id: HashMap<Uuid, Arc<DaemonHandle>>,
    by_hostname: HashMap<String, Uuid>,
    by_alias: HashMap<String, Uuid>,
}

/// Process-scoped table of daemon handles.
///
/// One lock guards all structural changes; handle operations themselves
/// run under each handle's own lock.
pub struct DaemonRegistry {
    settings: DaemonSettings,
    seen: Arc<SeenDaemons>,
    inner: Mutex<RegistryInner>,
}

impl DaemonRegistry {
    pub fn init(settings: DaemonSettings, seen: Arc<SeenDaemons>) -> Self {
        Self {
            settings,
            seen,
            inner: Mutex::new(RegistryInner {
                open: true,
                by_id: HashMap::new(),
                by_hostname: HashMap::new(),
                by_alias: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn seen(&self) -> &Arc<SeenDaemons> {
        &self.seen
    }

    /// Create and insert a handle for `host`. Nothing changes on error.
    ///
    /// The handle loads key material, so it is built outside the lock and
    /// uniqueness is checked again before inserting.
    pub fn register(&self, host: RemoteHostDescriptor) -> Result<Arc<DaemonHandle>, RegistryError> {
        host.validate()?;
        Self::check_free(&self.lock(), &host)?;

        let handle = Arc::new(DaemonHandle::new(
            host.clone(),
            self.settings.clone(),
            Arc::clone(&self.seen),
        )?);
        let mut inner = self.lock();
        Self::check_free(&inner, &host)?;
        inner.by_hostname.insert(host.hostname.clone(), handle.id());
        inner.by_alias.insert(host.alias.clone(), handle.id());
        inner.by_id.insert(handle.id(), Arc::clone(&handle));
        info!(
            "Registered daemon {} ({}) as {}",
            host.hostname,
            host.alias,
            handle.id()
        );
        Ok(handle)
    }

    fn check_free(inner: &RegistryInner, host: &RemoteHostDescriptor) -> Result<(), RegistryError> {
        if !inner.open {
            return Err(RegistryError::ShutDown);
        }
        if inner.by_hostname.contains_key(&host.hostname) {
            return Err(RegistryError::DuplicateHostname(host.hostname.clone()));
        }
        if inner.by_alias.contains_key(&host.alias) {
            return Err(RegistryError::DuplicateAlias(host.alias.clone()));
        }
        Ok(())
    }

    /// Descriptors are immutable once registered
    pub fn update(&self, hostname: &str, _host: RemoteHostDescriptor) -> Result<(), RegistryError> {
        Err(RegistryError::UpdateUnsupported(hostname.to_string()))
    }

    pub fn get(&self, id: Uuid) -> Option<Arc<DaemonHandle>> {
        self.lock().by_id.get(&id).cloned()
    }

    pub fn by_hostname(&self, hostname: &str) -> Option<Arc<DaemonHandle>> {
        let inner = self.lock();
        let id = inner.by_hostname.get(hostname)?;
        inner.by_id.get(id).cloned()
    }

    pub fn by_alias(&self, alias: &str) -> Option<Arc<DaemonHandle>> {
        let inner = self.lock();
        let id = inner.by_alias.get(alias)?;
        inner.by_id.get(id).cloned()
    }

    /// Resolve a hostname or an alias
    pub fn lookup(&self, name: &str) -> Option<Arc<DaemonHandle>> {
        self.by_hostname(name).or_else(|| self.by_alias(name))
    }

    /// All handles, ordered by hostname
    pub fn list(&self) -> Vec<Arc<DaemonHandle>> {
        let mut handles: Vec<_> = self.lock().by_id.values().cloned().collect();
        handles.sort_by(|a, b| a.hostname().cmp(b.hostname()));
        handles
    }

    pub fn len(&self) -> usize {
        self.lock().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove a handle and close its connection.
    ///
    /// Containers owned by the daemon keep their tunnel listeners;
    /// `Engine::disconnect_daemon` tears those down before calling this.
    pub(crate) async fn remove(&self, id: Uuid) -> Result<Arc<DaemonHandle>, RegistryError> {
        let handle = {
            let mut inner = self.lock();
            let handle = inner
                .by_id
                .remove(&id)
                .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
            inner.by_hostname.remove(handle.hostname());
            inner.by_alias.remove(&handle.host().alias);
            handle
        };
        handle.close().await;
        info!("Removed daemon {}", handle.hostname());
        Ok(handle)
    }

    /// Close every handle and refuse further registrations
    pub async fn shutdown(&self) {
        let handles: Vec<_> = {
            let mut inner = self.lock();
            inner.open = false;
            inner.by_hostname.clear();
            inner.by_alias.clear();
            inner.by_id.drain().map(|(_, h)| h).collect()
        };
        for handle in &handles {
            handle.close().await;
        }
        self.seen.release_all();
        info!("Daemon registry shut down ({} handles closed)", handles.len());
    }
}
