//! Daemon handle: one remote Docker daemon behind one control connection

use super::seen::{SeenDaemons, Sighting};
use crate::channel::{ChannelConnector, ChannelError, SecureChannel};
use crate::host::RemoteHostDescriptor;
use crate::identity::{KeyStore, KeyStoreError};
use crate::rpc::{
    ContainerSpec, ContainerState, ContainerSummary, ControlClient, ExecOutcome, PortMappings,
    RpcError,
};
use log::{debug, info, warn};
use rustls::pki_types::CertificateDer;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex as SyncMutex};
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Connection state of a daemon handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionStatus {
    /// Never connected
    New,
    Connected,
    Disconnected,
}

impl ConnectionStatus {
    pub const ALL: [ConnectionStatus; 3] = [
        ConnectionStatus::New,
        ConnectionStatus::Connected,
        ConnectionStatus::Disconnected,
    ];

    pub fn can_transition_to(self, next: ConnectionStatus) -> bool {
        use ConnectionStatus::*;
        matches!(
            (self, next),
            (New, Connected) | (Connected, Disconnected) | (Disconnected, Connected)
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("{0} is not paired; run pairing first")]
    NotPaired(String),

    #[error("key store: {0}")]
    KeyStore(#[from] KeyStoreError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error("daemon {daemon_id} at {hostname} is already claimed by handle {owner}")]
    AlreadyClaimed {
        daemon_id: Uuid,
        hostname: String,
        owner: Uuid,
    },

    #[error("daemon handle for {0} is closed")]
    Closed(String),
}

/// Settings shared by every handle of one registry
#[derive(Clone)]
pub struct DaemonSettings {
    pub keystore: Arc<KeyStore>,
    pub context: String,
    /// Delete all containers of a daemon the first time this process sees it
    pub reset_on_first_contact: bool,
    pub connect_timeout: Duration,
    pub rpc_timeout: Duration,
}

/// Where tunnel connections for a daemon go
#[derive(Clone)]
pub struct TunnelEndpoint {
    connector: ChannelConnector,
    hostname: String,
    port: u16,
    pinned: CertificateDer<'static>,
}

impl TunnelEndpoint {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }

    /// Open a fresh pinned channel to the tunnel port
    pub async fn connect(&self) -> Result<SecureChannel, ChannelError> {
        self.connector
            .connect_pinned(&self.hostname, self.port, self.pinned.clone())
            .await
    }
}

struct DaemonInner {
    client: Option<ControlClient>,
    closed: bool,
    /// Container ids this handle has listed or created
    known: BTreeSet<String>,
}

/// Handle to one paired daemon.
///
/// Operations lock the handle for their whole duration, so calls on one
/// daemon never overlap. The connection is opened lazily and rebuilt after
/// any transport or protocol failure.
pub struct DaemonHandle {
    id: Uuid,
    host: RemoteHostDescriptor,
    settings: DaemonSettings,
    connector: ChannelConnector,
    seen: Arc<SeenDaemons>,
    status: SyncMutex<ConnectionStatus>,
    daemon_uuid: SyncMutex<Option<Uuid>>,
    inner: Mutex<DaemonInner>,
}

impl DaemonHandle {
    pub fn new(
        host: RemoteHostDescriptor,
        settings: DaemonSettings,
        seen: Arc<SeenDaemons>,
    ) -> Result<Self, DaemonError> {
        let identity = settings
            .keystore
            .load_or_create_identity(&settings.context, &host.hostname)?;
        let connector = ChannelConnector::new(identity, settings.connect_timeout);
        Ok(Self {
            id: Uuid::new_v4(),
            host,
            settings,
            connector,
            seen,
            status: SyncMutex::new(ConnectionStatus::New),
            daemon_uuid: SyncMutex::new(None),
            inner: Mutex::new(DaemonInner {
                client: None,
                closed: false,
                known: BTreeSet::new(),
            }),
        })
    }

    /// Local id of this handle
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn host(&self) -> &RemoteHostDescriptor {
        &self.host
    }

    pub fn hostname(&self) -> &str {
        &self.host.hostname
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// UUID reported by the daemon, once connected
    pub fn daemon_uuid(&self) -> Option<Uuid> {
        *self.daemon_uuid.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_status(&self, next: ConnectionStatus) -> bool {
        let mut status = self.status.lock().unwrap_or_else(|p| p.into_inner());
        if *status == next {
            return true;
        }
        if !status.can_transition_to(next) {
            warn!(
                "Ignoring illegal transition {:?} -> {:?} for daemon {}",
                *status, next, self.host.hostname
            );
            return false;
        }
        info!("Daemon {}: {:?} -> {:?}", self.host.hostname, *status, next);
        *status = next;
        true
    }

    fn pinned_certificate(&self) -> Result<CertificateDer<'static>, DaemonError> {
        self.settings
            .keystore
            .load_pinned_certificate(&self.settings.context, &self.host.hostname)
            .map_err(|e| match e {
                KeyStoreError::NotFound(host) => DaemonError::NotPaired(host),
                other => other.into(),
            })
    }

    /// Endpoint for tunnel connections into this daemon's containers
    pub fn tunnel_endpoint(&self) -> Result<TunnelEndpoint, DaemonError> {
        Ok(TunnelEndpoint {
            connector: self.connector.clone(),
            hostname: self.host.hostname.clone(),
            port: self.host.tunnel_port,
            pinned: self.pinned_certificate()?,
        })
    }

    async fn ensure_connected<'a>(
        &self,
        inner: &'a mut DaemonInner,
    ) -> Result<&'a ControlClient, DaemonError> {
        if inner.closed {
            return Err(DaemonError::Closed(self.host.hostname.clone()));
        }
        let usable = inner.client.as_ref().map_or(false, |c| c.is_usable());
        if !usable {
            if let Some(stale) = inner.client.take() {
                self.set_status(ConnectionStatus::Disconnected);
                stale.close().await;
            }
            inner.client = Some(self.connect().await?);
        }
        inner
            .client
            .as_ref()
            .ok_or_else(|| DaemonError::Closed(self.host.hostname.clone()))
    }

    async fn connect(&self) -> Result<ControlClient, DaemonError> {
        let pinned = self.pinned_certificate()?;
        let channel = self
            .connector
            .connect_pinned(&self.host.hostname, self.host.control_port, pinned)
            .await?;
        let peer = channel.peer().to_string();
        let client = ControlClient::connect(channel.boxed(), peer, self.settings.rpc_timeout).await?;

        let daemon = client.daemon_id();
        let sighting = match self.seen.claim(daemon, self.id) {
            Ok(sighting) => sighting,
            Err(owner) => {
                client.close().await;
                return Err(DaemonError::AlreadyClaimed {
                    daemon_id: daemon,
                    hostname: self.host.hostname.clone(),
                    owner,
                });
            }
        };
        let previous = self
            .daemon_uuid
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .replace(daemon);
        if let Some(previous) = previous.filter(|p| *p != daemon) {
            warn!(
                "Daemon at {} changed identity from {} to {}",
                self.host.hostname, previous, daemon
            );
            self.seen.release(previous, self.id);
        }

        if sighting == Sighting::First && self.settings.reset_on_first_contact {
            if let Err(e) = self.reset_daemon(&client).await {
                if e.is_connection_fatal() {
                    client.close().await;
                    return Err(e.into());
                }
            }
        }
        self.set_status(ConnectionStatus::Connected);
        Ok(client)
    }

    /// Delete every container on a daemon seen for the first time
    async fn reset_daemon(&self, client: &ControlClient) -> Result<usize, RpcError> {
        let containers = client.list_containers().await?;
        if containers.is_empty() {
            return Ok(0);
        }
        warn!(
            "First contact with daemon {} at {}: removing {} existing containers",
            client.daemon_id(),
            self.host.hostname,
            containers.len()
        );
        let mut removed = 0;
        for container in containers {
            match client.delete_container(&container.id).await {
                Ok(()) => removed += 1,
                Err(e) if !e.is_connection_fatal() => {
                    warn!("Could not remove {} on {}: {}", container.id, self.host.hostname, e)
                }
                Err(e) => return Err(e),
            }
        }
        Ok(removed)
    }

    /// Drop the connection after a failure that left it unusable
    fn settle<T>(&self, inner: &mut DaemonInner, result: Result<T, RpcError>) -> Result<T, DaemonError> {
        if let Err(e) = &result {
            if e.is_connection_fatal() {
                warn!("Control connection to {} lost: {}", self.host.hostname, e);
                inner.client = None;
                self.set_status(ConnectionStatus::Disconnected);
            }
        }
        result.map_err(DaemonError::from)
    }

    /// Connect if needed and ping
    pub async fn ping(&self) -> Result<(), DaemonError> {
        let mut inner = self.inner.lock().await;
        let client = self.ensure_connected(&mut inner).await?;
        let result = client.ping().await;
        self.settle(&mut inner, result)
    }

    /// Connectivity probe for status surfaces
    pub async fn is_reachable(&self) -> bool {
        match self.ping().await {
            Ok(()) => true,
            Err(e) => {
                debug!("Daemon {} unreachable: {}", self.host.hostname, e);
                false
            }
        }
    }

    pub async fn list_containers(&self) -> Result<Vec<ContainerSummary>, DaemonError> {
        let mut inner = self.inner.lock().await;
        let client = self.ensure_connected(&mut inner).await?;
        let result = client.list_containers().await;
        let containers = self.settle(&mut inner, result)?;
        inner.known = containers.iter().map(|c| c.id.clone()).collect();
        Ok(containers)
    }

    /// Create a container; the image is resolved against the registry prefix
    pub async fn create_container(&self, mut spec: ContainerSpec) -> Result<String, DaemonError> {
        spec.image = self.host.resolve_image(&spec.image);
        let mut inner = self.inner.lock().await;
        let client = self.ensure_connected(&mut inner).await?;
        let result = client.create_container(spec).await;
        let id = self.settle(&mut inner, result)?;
        inner.known.insert(id.clone());
        Ok(id)
    }

    pub async fn start_container(&self, container_id: &str) -> Result<(), DaemonError> {
        let mut inner = self.inner.lock().await;
        let client = self.ensure_connected(&mut inner).await?;
        let result = client.start_container(container_id).await;
        self.settle(&mut inner, result)
    }

    pub async fn stop_container(&self, container_id: &str) -> Result<(), DaemonError> {
        let mut inner = self.inner.lock().await;
        let client = self.ensure_connected(&mut inner).await?;
        let result = client.stop_container(container_id).await;
        self.settle(&mut inner, result)
    }

    pub async fn destroy_container(&self, container_id: &str) -> Result<(), DaemonError> {
        let mut inner = self.inner.lock().await;
        let client = self.ensure_connected(&mut inner).await?;
        let result = client.delete_container(container_id).await;
        self.settle(&mut inner, result)?;
        inner.known.remove(container_id);
        Ok(())
    }

    pub async fn container_status(&self, container_id: &str) -> Result<ContainerState, DaemonError> {
        let mut inner = self.inner.lock().await;
        let client = self.ensure_connected(&mut inner).await?;
        let result = client.container_status(container_id).await;
        self.settle(&mut inner, result)
    }

    pub async fn exec(&self, container_id: &str, command: &[String]) -> Result<ExecOutcome, DaemonError> {
        let mut inner = self.inner.lock().await;
        let client = self.ensure_connected(&mut inner).await?;
        let result = client.exec(container_id, command).await;
        self.settle(&mut inner, result)
    }

    pub async fn port_mappings(&self, container_ids: &[String]) -> Result<PortMappings, DaemonError> {
        let mut inner = self.inner.lock().await;
        let client = self.ensure_connected(&mut inner).await?;
        let result = client.port_mappings(container_ids).await;
        self.settle(&mut inner, result)
    }

    pub async fn create_volume(&self, name: &str) -> Result<(), DaemonError> {
        let mut inner = self.inner.lock().await;
        let client = self.ensure_connected(&mut inner).await?;
        let result = client.create_volume(name).await;
        self.settle(&mut inner, result)
    }

    pub async fn delete_volume(&self, name: &str) -> Result<(), DaemonError> {
        let mut inner = self.inner.lock().await;
        let client = self.ensure_connected(&mut inner).await?;
        let result = client.delete_volume(name).await;
        self.settle(&mut inner, result)
    }

    /// Container ids seen through this handle, sorted
    pub async fn known_containers(&self) -> Vec<String> {
        self.inner.lock().await.known.iter().cloned().collect()
    }

    /// Close the connection; the next operation reconnects
    pub async fn disconnect(&self) {
        let mut inner = self.inner.lock().await;
        if let Some(client) = inner.client.take() {
            client.close().await;
            self.set_status(ConnectionStatus::Disconnected);
        }
    }

    /// Close for good and give up the daemon UUID claim
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        inner.closed = true;
        if let Some(client) = inner.client.take() {
            client.close().await;
            self.set_status(ConnectionStatus::Disconnected);
        }
        if let Some(daemon) = self.daemon_uuid() {
            self.seen.release(daemon, self.id);
        }
        debug!("Daemon handle for {} closed", self.host.hostname);
    }
}
