//! Local bootstrap: run the connector on this machine's Docker and pair with it
//!
//! Steps:
//! 1. ensure the connector volume exists
//! 2. start the existing connector container, or pull the image and create it
//! 3. exec the handshake subcommand inside it with fresh parameters
//! 4. poll the pairing session once per second until it settles

mod docker;

pub use docker::{BollardDocker, ConnectorLaunch, LocalContainer, LocalDocker};

use crate::config::ConnectorConfig;
use crate::host::RemoteHostDescriptor;
use crate::pairing::{handshake_args, PairingError, PairingOrchestrator, PairingSession, PairingState};
use log::{debug, info, warn};
use rustls::pki_types::CertificateDer;
use std::sync::Arc;
use std::time::Duration;

/// Exit code of a process killed by the OOM killer
pub const OOM_EXIT_CODE: i64 = 137;

/// Interval between pairing state polls
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("docker: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("handshake exec exited with code {0}")]
    ExecFailed(i64),

    #[error("handshake exec was killed for running out of memory {0} times")]
    OutOfMemory(u32),

    #[error(transparent)]
    Pairing(#[from] PairingError),
}

/// Drives a full local bootstrap against a [`LocalDocker`]
pub struct LocalBootstrap<D: LocalDocker> {
    docker: D,
    connector: ConnectorConfig,
    orchestrator: Arc<PairingOrchestrator>,
    poll_interval: Duration,
}

impl<D: LocalDocker> LocalBootstrap<D> {
    pub fn new(docker: D, connector: ConnectorConfig, orchestrator: Arc<PairingOrchestrator>) -> Self {
        Self {
            docker,
            connector,
            orchestrator,
            poll_interval: POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Bring the connector up and pair with it. Returns the pinned certificate.
    pub async fn run(
        &self,
        host: RemoteHostDescriptor,
        timeout: Duration,
    ) -> Result<CertificateDer<'static>, BootstrapError> {
        let session = self.orchestrator.create_session(host.clone())?;
        let params = session.handshake_params();

        let prepared = self.prepare(&host, &params).await;
        if let Err(e) = prepared {
            session.cancel();
            return Err(e);
        }

        session.start_or_restart(timeout);
        if let Err(e) = self.exec_handshake(&params).await {
            session.cancel();
            return Err(e);
        }
        self.await_pairing(&session).await
    }

    async fn prepare(&self, host: &RemoteHostDescriptor, params: &str) -> Result<(), BootstrapError> {
        self.docker.ensure_volume(&self.connector.volume_name).await?;
        let name = &self.connector.container_name;
        match self.docker.find_container(name).await? {
            Some(existing) if existing.running => {
                debug!("Connector {} already running ({})", name, existing.id);
            }
            Some(existing) => {
                info!("Starting stopped connector {} ({})", name, existing.id);
                self.docker.start_container(name).await?;
            }
            None => {
                let launch = ConnectorLaunch::new(&self.connector, host, params);
                self.docker.pull_image(&launch.image).await?;
                self.docker.create_container(&launch).await?;
            }
        }
        Ok(())
    }

    /// Run the handshake subcommand, restarting it after OOM kills
    async fn exec_handshake(&self, params: &str) -> Result<(), BootstrapError> {
        let command = handshake_args(params);
        let mut oom_kills = 0;
        loop {
            let code = self
                .docker
                .exec(&self.connector.container_name, &command)
                .await?;
            match code {
                0 => return Ok(()),
                OOM_EXIT_CODE if oom_kills < self.connector.exec_oom_retries => {
                    oom_kills += 1;
                    warn!(
                        "Handshake exec ran out of memory, restarting ({}/{})",
                        oom_kills, self.connector.exec_oom_retries
                    );
                }
                OOM_EXIT_CODE => return Err(BootstrapError::OutOfMemory(oom_kills + 1)),
                other => return Err(BootstrapError::ExecFailed(other)),
            }
        }
    }

    async fn await_pairing(
        &self,
        session: &PairingSession,
    ) -> Result<CertificateDer<'static>, BootstrapError> {
        loop {
            let state = session.state();
            let settled = match state {
                PairingState::Success | PairingState::Failed => true,
                _ => !session.is_worker_active(),
            };
            if settled {
                return Ok(session.wait().await?);
            }
            debug!("Local pairing {:?}", state);
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
