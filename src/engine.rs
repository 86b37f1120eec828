//! Engine facade
//!
//! Wires the key store, both registries and the pairing orchestrator
//! together and exposes the operations a frontend needs.

use crate::bootstrap::{BollardDocker, BootstrapError, LocalBootstrap, LocalDocker};
use crate::config::{ConfigError, EngineConfig};
use crate::container::{ContainerError, ContainerHandle, ContainerRegistry};
use crate::daemon::{
    ConnectionStatus, DaemonError, DaemonHandle, DaemonRegistry, DaemonSettings, RegistryError,
    SeenDaemons,
};
use crate::host::RemoteHostDescriptor;
use crate::identity::{KeyStore, KeyStoreError};
use crate::pairing::{PairingError, PairingOrchestrator, PairingState, PairingStatus};
use crate::rpc::{ContainerSpec, ExecOutcome};
use log::{info, warn};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Buffered events per subscriber before the slowest one starts lagging
const EVENT_CAPACITY: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    KeyStore(#[from] KeyStoreError),

    #[error(transparent)]
    Pairing(#[from] PairingError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Daemon(#[from] DaemonError),

    #[error(transparent)]
    Container(#[from] ContainerError),

    #[error(transparent)]
    Bootstrap(#[from] BootstrapError),

    #[error("no daemon {0}")]
    UnknownDaemon(String),

    #[error("daemon {hostname} still has {count} containers; force to remove anyway")]
    StillReferenced { hostname: String, count: usize },
}

/// Lifecycle notifications
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    DaemonRegistered { daemon: Uuid, hostname: String },
    DaemonConnected { daemon: Uuid },
    DaemonDisconnected { daemon: Uuid },
    DaemonRemoved { daemon: Uuid, hostname: String },
    ContainerCreated { name: String, daemon: Uuid },
    ContainerStarted { name: String },
    ContainerStopped { name: String },
    ContainerDestroyed { name: String },
    PairingStateChanged { hostname: String, state: PairingState },
    TunnelOpened { name: String, port: u16, local: SocketAddr },
}

/// Connectivity snapshot of one daemon
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Connectivity {
    pub daemon: Uuid,
    pub hostname: String,
    pub status: ConnectionStatus,
    pub reachable: bool,
}

pub struct Engine {
    config: EngineConfig,
    keystore: Arc<KeyStore>,
    daemons: Arc<DaemonRegistry>,
    containers: Arc<ContainerRegistry>,
    orchestrator: Arc<PairingOrchestrator>,
    events: broadcast::Sender<EngineEvent>,
}

impl Engine {
    /// Open the key store and build empty registries
    pub fn init(config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        let keystore = Arc::new(KeyStore::open(&config.data_dir, config.instance_id)?);
        let settings = DaemonSettings {
            keystore: Arc::clone(&keystore),
            context: config.context.clone(),
            reset_on_first_contact: config.reset_on_first_contact,
            connect_timeout: config.connect_timeout(),
            rpc_timeout: config.rpc_timeout(),
        };
        let daemons = Arc::new(DaemonRegistry::init(settings, Arc::new(SeenDaemons::new())));
        let containers = Arc::new(ContainerRegistry::init(Arc::clone(&daemons)));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let pairing_events = events.clone();
        let orchestrator = Arc::new(
            PairingOrchestrator::new(
                Arc::clone(&keystore),
                config.context.clone(),
                config.connector.clone(),
                config.connect_timeout(),
            )
            .with_observer(Arc::new(move |hostname: &str, state| {
                let _ = pairing_events.send(EngineEvent::PairingStateChanged {
                    hostname: hostname.to_string(),
                    state,
                });
            })),
        );
        info!(
            "Engine {} ready (context {}, data {})",
            keystore.instance_id(),
            config.context,
            config.data_dir.display()
        );
        Ok(Self {
            config,
            keystore,
            daemons,
            containers,
            orchestrator,
            events,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn instance_id(&self) -> Uuid {
        self.keystore.instance_id()
    }

    pub fn keystore(&self) -> &Arc<KeyStore> {
        &self.keystore
    }

    pub fn daemons(&self) -> &Arc<DaemonRegistry> {
        &self.daemons
    }

    pub fn containers(&self) -> &Arc<ContainerRegistry> {
        &self.containers
    }

    pub fn orchestrator(&self) -> &Arc<PairingOrchestrator> {
        &self.orchestrator
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: EngineEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Resolve a daemon by hostname or alias
    pub fn daemon(&self, name: &str) -> Result<Arc<DaemonHandle>, EngineError> {
        self.daemons
            .lookup(name)
            .ok_or_else(|| EngineError::UnknownDaemon(name.to_string()))
    }

    fn daemon_by_id(&self, id: Uuid) -> Result<Arc<DaemonHandle>, EngineError> {
        self.daemons
            .get(id)
            .ok_or_else(|| EngineError::UnknownDaemon(id.to_string()))
    }

    fn container(&self, name: &str) -> Result<Arc<ContainerHandle>, EngineError> {
        self.containers
            .get(name)
            .ok_or_else(|| ContainerError::NotFound(name.to_string()).into())
    }

    /// Register a daemon that is already paired and check it answers
    pub async fn connect_daemon(
        &self,
        host: RemoteHostDescriptor,
    ) -> Result<Arc<DaemonHandle>, EngineError> {
        host.validate().map_err(RegistryError::from)?;
        if let Err(e) = self
            .keystore
            .load_pinned_certificate(&self.config.context, &host.hostname)
        {
            return Err(match e {
                KeyStoreError::NotFound(h) => DaemonError::NotPaired(h).into(),
                other => other.into(),
            });
        }

        let handle = self.daemons.register(host)?;
        self.emit(EngineEvent::DaemonRegistered {
            daemon: handle.id(),
            hostname: handle.hostname().to_string(),
        });
        if let Err(e) = handle.ping().await {
            warn!("Daemon {} did not answer: {}", handle.hostname(), e);
            self.daemons.remove(handle.id()).await?;
            self.emit(EngineEvent::DaemonRemoved {
                daemon: handle.id(),
                hostname: handle.hostname().to_string(),
            });
            return Err(e.into());
        }
        self.emit(EngineEvent::DaemonConnected { daemon: handle.id() });
        Ok(handle)
    }

    /// Start (or keep going) pairing with `host` and return what the operator needs
    pub async fn begin_pairing(
        &self,
        host: RemoteHostDescriptor,
    ) -> Result<PairingStatus, EngineError> {
        let hostname = host.hostname.clone();
        let session = self.orchestrator.session_or_create(host)?;
        session.start_or_restart(self.config.pairing_timeout());
        self.orchestrator
            .status(&hostname)
            .await
            .ok_or_else(|| PairingError::NoSession(hostname).into())
    }

    /// Wait for the pairing with `hostname` to finish and register the daemon
    pub async fn complete_pairing(&self, hostname: &str) -> Result<Arc<DaemonHandle>, EngineError> {
        let session = self
            .orchestrator
            .session(hostname)
            .ok_or_else(|| PairingError::NoSession(hostname.to_string()))?;
        session.wait().await?;
        self.orchestrator.remove(hostname);
        self.register_paired(session.host().clone())
    }

    /// Run the connector on the local Docker daemon and pair with it
    pub async fn bootstrap_local(&self) -> Result<Arc<DaemonHandle>, EngineError> {
        let docker = BollardDocker::connect(&self.config.connector.docker_socket)?;
        self.bootstrap_with(docker).await
    }

    pub async fn bootstrap_with<D: LocalDocker>(
        &self,
        docker: D,
    ) -> Result<Arc<DaemonHandle>, EngineError> {
        self.bootstrap_host(docker, self.config.local_host()).await
    }

    async fn bootstrap_host<D: LocalDocker>(
        &self,
        docker: D,
        host: RemoteHostDescriptor,
    ) -> Result<Arc<DaemonHandle>, EngineError> {
        let bootstrap = LocalBootstrap::new(
            docker,
            self.config.connector.clone(),
            Arc::clone(&self.orchestrator),
        );
        bootstrap.run(host.clone(), self.config.pairing_timeout()).await?;
        self.orchestrator.remove(&host.hostname);
        self.register_paired(host)
    }

    fn register_paired(&self, host: RemoteHostDescriptor) -> Result<Arc<DaemonHandle>, EngineError> {
        if let Some(existing) = self.daemons.by_hostname(&host.hostname) {
            return Ok(existing);
        }
        let handle = self.daemons.register(host)?;
        self.emit(EngineEvent::DaemonRegistered {
            daemon: handle.id(),
            hostname: handle.hostname().to_string(),
        });
        Ok(handle)
    }

    /// Remove a daemon. Refused while containers still reference it unless forced.
    pub async fn disconnect_daemon(&self, id: Uuid, force: bool) -> Result<(), EngineError> {
        let handle = self.daemon_by_id(id)?;
        let count = self.containers.count_for_daemon(id);
        if count > 0 && !force {
            return Err(EngineError::StillReferenced {
                hostname: handle.hostname().to_string(),
                count,
            });
        }
        self.containers.remove_for_daemon(id).await;
        self.daemons.remove(id).await?;
        self.emit(EngineEvent::DaemonDisconnected { daemon: id });
        self.emit(EngineEvent::DaemonRemoved {
            daemon: id,
            hostname: handle.hostname().to_string(),
        });
        Ok(())
    }

    /// Adopt every container the daemon reports
    pub async fn discover_containers(
        &self,
        daemon_id: Uuid,
    ) -> Result<Vec<Arc<ContainerHandle>>, EngineError> {
        let daemon = self.daemon_by_id(daemon_id)?;
        let summaries = daemon.list_containers().await?;
        let mut found = Vec::with_capacity(summaries.len());
        for summary in summaries {
            if let Some(known) = self.containers.by_remote(daemon_id, &summary.id) {
                found.push(known);
                continue;
            }
            let handle = match self.containers.insert(daemon_id, &summary.id, &summary.name) {
                Err(ContainerError::DuplicateName(_)) => {
                    let qualified = format!("{}.{}", summary.name, daemon.host().alias);
                    self.containers.insert(daemon_id, &summary.id, &qualified)?
                }
                other => other?,
            };
            found.push(handle);
        }
        info!(
            "Discovered {} containers on {}",
            found.len(),
            daemon.hostname()
        );
        Ok(found)
    }

    pub async fn create_container(
        &self,
        daemon_id: Uuid,
        spec: ContainerSpec,
    ) -> Result<Arc<ContainerHandle>, EngineError> {
        let daemon = self.daemon_by_id(daemon_id)?;
        let name = spec.name.clone();
        if self.containers.get(&name).is_some() {
            return Err(ContainerError::DuplicateName(name).into());
        }
        let remote_id = daemon.create_container(spec).await?;
        let handle = self.containers.insert(daemon_id, &remote_id, &name)?;
        self.emit(EngineEvent::ContainerCreated {
            name,
            daemon: daemon_id,
        });
        Ok(handle)
    }

    pub async fn start_container(&self, name: &str) -> Result<(), EngineError> {
        self.container(name)?.start().await?;
        self.emit(EngineEvent::ContainerStarted {
            name: name.to_string(),
        });
        Ok(())
    }

    pub async fn stop_container(&self, name: &str) -> Result<(), EngineError> {
        self.container(name)?.stop().await?;
        self.emit(EngineEvent::ContainerStopped {
            name: name.to_string(),
        });
        Ok(())
    }

    /// Delete the remote container and forget it
    pub async fn destroy_container(&self, name: &str) -> Result<(), EngineError> {
        self.container(name)?.destroy().await?;
        self.containers.remove(name).await?;
        self.emit(EngineEvent::ContainerDestroyed {
            name: name.to_string(),
        });
        Ok(())
    }

    pub async fn execute(&self, name: &str, command: &[String]) -> Result<ExecOutcome, EngineError> {
        Ok(self.container(name)?.execute(command).await?)
    }

    pub async fn open_tunnel(&self, name: &str, port: u16) -> Result<SocketAddr, EngineError> {
        let local = self.container(name)?.open_tunnel(port).await?;
        self.emit(EngineEvent::TunnelOpened {
            name: name.to_string(),
            port,
            local,
        });
        Ok(local)
    }

    pub async fn close_tunnel(&self, name: &str, port: u16) -> Result<bool, EngineError> {
        Ok(self.container(name)?.close_tunnel(port).await)
    }

    /// Ping the daemon and report its connection state
    pub async fn daemon_connectivity(&self, id: Uuid) -> Result<Connectivity, EngineError> {
        let daemon = self.daemon_by_id(id)?;
        let before = daemon.status();
        let reachable = daemon.is_reachable().await;
        let status = daemon.status();
        if status != before {
            self.emit(match status {
                ConnectionStatus::Connected => EngineEvent::DaemonConnected { daemon: id },
                _ => EngineEvent::DaemonDisconnected { daemon: id },
            });
        }
        Ok(Connectivity {
            daemon: id,
            hostname: daemon.hostname().to_string(),
            status,
            reachable,
        })
    }

    pub async fn pairing_status(&self, hostname: &str) -> Option<PairingStatus> {
        self.orchestrator.status(hostname).await
    }

    /// Cancel pairings, close tunnels and channels
    pub async fn shutdown(&self) {
        self.orchestrator.shutdown();
        self.containers.shutdown().await;
        self.daemons.shutdown().await;
        info!("Engine {} shut down", self.instance_id());
    }
}
