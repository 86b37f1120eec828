//! Container registry: handles by logical name and by remote id

use super::handle::{ContainerError, ContainerHandle};
use crate::daemon::DaemonRegistry;
use log::info;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

struct ContainerTable {
    open: bool,
    by_name: HashMap<String, Arc<ContainerHandle>>,
    by_remote: HashMap<(Uuid, String), String>,
}

/// Process-scoped table of container handles
pub struct ContainerRegistry {
    daemons: Arc<DaemonRegistry>,
    inner: Mutex<ContainerTable>,
}

impl ContainerRegistry {
    pub fn init(daemons: Arc<DaemonRegistry>) -> Self {
        Self {
            daemons,
            inner: Mutex::new(ContainerTable {
                open: true,
                by_name: HashMap::new(),
                by_remote: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ContainerTable> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Track a container. Re-inserting the same remote container returns
    /// the existing handle; reusing a name for another container fails.
    pub fn insert(
        &self,
        daemon_id: Uuid,
        remote_id: &str,
        name: &str,
    ) -> Result<Arc<ContainerHandle>, ContainerError> {
        let mut table = self.lock();
        if !table.open {
            return Err(ContainerError::ShutDown);
        }
        let key = (daemon_id, remote_id.to_string());
        if let Some(existing) = table.by_remote.get(&key) {
            if let Some(handle) = table.by_name.get(existing) {
                return Ok(Arc::clone(handle));
            }
        }
        if table.by_name.contains_key(name) {
            return Err(ContainerError::DuplicateName(name.to_string()));
        }

        let handle = Arc::new(ContainerHandle::new(
            remote_id,
            name,
            daemon_id,
            Arc::clone(&self.daemons),
        ));
        table.by_remote.insert(key, name.to_string());
        table.by_name.insert(name.to_string(), Arc::clone(&handle));
        Ok(handle)
    }

    pub fn get(&self, name: &str) -> Option<Arc<ContainerHandle>> {
        self.lock().by_name.get(name).cloned()
    }

    pub fn by_remote(&self, daemon_id: Uuid, remote_id: &str) -> Option<Arc<ContainerHandle>> {
        let table = self.lock();
        let name = table.by_remote.get(&(daemon_id, remote_id.to_string()))?;
        table.by_name.get(name).cloned()
    }

    /// Handles owned by one daemon, ordered by name
    pub fn for_daemon(&self, daemon_id: Uuid) -> Vec<Arc<ContainerHandle>> {
        let mut handles: Vec<_> = self
            .lock()
            .by_name
            .values()
            .filter(|h| h.owner_id() == daemon_id)
            .cloned()
            .collect();
        handles.sort_by(|a, b| a.name().cmp(b.name()));
        handles
    }

    pub fn count_for_daemon(&self, daemon_id: Uuid) -> usize {
        self.lock()
            .by_name
            .values()
            .filter(|h| h.owner_id() == daemon_id)
            .count()
    }

    pub fn len(&self) -> usize {
        self.lock().by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget a container and close its tunnels. The remote container is left alone.
    pub async fn remove(&self, name: &str) -> Result<Arc<ContainerHandle>, ContainerError> {
        let handle = {
            let mut table = self.lock();
            let handle = table
                .by_name
                .remove(name)
                .ok_or_else(|| ContainerError::NotFound(name.to_string()))?;
            table
                .by_remote
                .remove(&(handle.owner_id(), handle.remote_id().to_string()));
            handle
        };
        handle.close_tunnels().await;
        Ok(handle)
    }

    /// Drop every container owned by `daemon_id`
    pub async fn remove_for_daemon(&self, daemon_id: Uuid) -> usize {
        let names: Vec<String> = self
            .for_daemon(daemon_id)
            .iter()
            .map(|h| h.name().to_string())
            .collect();
        let mut removed = 0;
        for name in names {
            if self.remove(&name).await.is_ok() {
                removed += 1;
            }
        }
        removed
    }

    pub async fn shutdown(&self) {
        let handles: Vec<_> = {
            let mut table = self.lock();
            table.open = false;
            table.by_remote.clear();
            table.by_name.drain().map(|(_, h)| h).collect()
        };
        for handle in &handles {
            handle.close_tunnels().await;
        }
        info!("Container registry shut down ({} handles)", handles.len());
    }
}
