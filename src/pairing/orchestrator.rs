//! Pairing orchestrator: at most one session per hostname

use super::handshake::{PairingClient, PairingError};
use super::session::{PairingSession, PairingState, PairingStatus, TransitionObserver};
use crate::channel::ChannelConnector;
use crate::config::ConnectorConfig;
use crate::host::RemoteHostDescriptor;
use crate::identity::KeyStore;
use log::{debug, info};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Budget for the "container likely exists" probe
pub const PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// Owns the live pairing sessions
pub struct PairingOrchestrator {
    keystore: Arc<KeyStore>,
    context: String,
    connector: ConnectorConfig,
    connect_timeout: Duration,
    sessions: Mutex<HashMap<String, Arc<PairingSession>>>,
    observer: Option<TransitionObserver>,
}

impl PairingOrchestrator {
    pub fn new(
        keystore: Arc<KeyStore>,
        context: impl Into<String>,
        connector: ConnectorConfig,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            keystore,
            context: context.into(),
            connector,
            connect_timeout,
            sessions: Mutex::new(HashMap::new()),
            observer: None,
        }
    }

    /// Report state changes of every session created from now on
    pub fn with_observer(mut self, observer: TransitionObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, Arc<PairingSession>>> {
        self.sessions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Create a session with a fresh PSK, cancelling any previous one for the host
    pub fn create_session(
        &self,
        host: RemoteHostDescriptor,
    ) -> Result<Arc<PairingSession>, PairingError> {
        host.validate()?;
        let identity = self
            .keystore
            .load_or_create_identity(&self.context, &host.hostname)?;
        let connector = ChannelConnector::new(identity, self.connect_timeout);
        let client = PairingClient::new(connector, host.hostname.clone(), host.pairing_port)
            .with_read_timeout(self.connect_timeout * 3);
        let session = PairingSession::new(
            host.clone(),
            client,
            self.context.clone(),
            Arc::clone(&self.keystore),
            self.connector.clone(),
            self.observer.clone(),
        );

        let previous = self
            .sessions()
            .insert(host.hostname.clone(), Arc::clone(&session));
        if let Some(previous) = previous {
            info!("Replacing pairing session for {}", host.hostname);
            previous.cancel();
        }
        Ok(session)
    }

    pub fn session(&self, hostname: &str) -> Option<Arc<PairingSession>> {
        self.sessions().get(hostname).cloned()
    }

    /// Existing session for the host, or a new one
    pub fn session_or_create(
        &self,
        host: RemoteHostDescriptor,
    ) -> Result<Arc<PairingSession>, PairingError> {
        match self.session(&host.hostname) {
            Some(session) if session.host() == &host => Ok(session),
            _ => self.create_session(host),
        }
    }

    pub fn start_or_restart(
        &self,
        hostname: &str,
        deadline: Duration,
    ) -> Result<PairingState, PairingError> {
        let session = self
            .session(hostname)
            .ok_or_else(|| PairingError::NoSession(hostname.to_string()))?;
        Ok(session.start_or_restart(deadline))
    }

    /// Returns false when there was no session to cancel
    pub fn cancel(&self, hostname: &str) -> bool {
        match self.session(hostname) {
            Some(session) => {
                session.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel and forget the session for `hostname`
    pub fn remove(&self, hostname: &str) -> Option<Arc<PairingSession>> {
        let session = self.sessions().remove(hostname)?;
        session.cancel();
        Some(session)
    }

    /// Snapshot including the control-port reachability guess
    pub async fn status(&self, hostname: &str) -> Option<PairingStatus> {
        let session = self.session(hostname)?;
        let mut status = session.status();
        let host = session.host();
        status.container_likely_exists =
            container_likely_exists(&host.hostname, host.control_port).await;
        Some(status)
    }

    pub fn hostnames(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sessions().keys().cloned().collect();
        names.sort();
        names
    }

    /// Cancel every session
    pub fn shutdown(&self) {
        let drained: Vec<_> = self.sessions().drain().collect();
        for (hostname, session) in drained {
            debug!("Shutting down pairing session for {}", hostname);
            session.cancel();
        }
    }
}

/// Whether something accepts TCP connections on `host:port`
pub async fn container_likely_exists(host: &str, port: u16) -> bool {
    matches!(
        timeout(PROBE_TIMEOUT, TcpStream::connect((host, port))).await,
        Ok(Ok(_))
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::KeyStoreError;
    use crate::pairing::RETRY_INTERVAL;
    use crate::testing::{MockDaemon, MockOptions};
    use tempfile::TempDir;

    const CONTEXT: &str = "test";

    fn orchestrator(dir: &TempDir) -> (Arc<KeyStore>, PairingOrchestrator) {
        let keystore = Arc::new(KeyStore::open(dir.path(), None).unwrap());
        let orchestrator = PairingOrchestrator::new(
            Arc::clone(&keystore),
            CONTEXT,
            ConnectorConfig::default(),
            Duration::from_secs(2),
        );
        (keystore, orchestrator)
    }

    /// Host whose three ports have nothing listening
    fn dead_host() -> RemoteHostDescriptor {
        let listeners: Vec<_> = (0..3)
            .map(|_| std::net::TcpListener::bind("127.0.0.1:0").unwrap())
            .collect();
        let port = |i: usize| listeners[i].local_addr().unwrap().port();
        RemoteHostDescriptor::new("127.0.0.1", "ghost").with_ports(port(0), port(1), port(2))
    }

    #[tokio::test]
    async fn test_matching_psk_pins_certificate() {
        let dir = TempDir::new().unwrap();
        let (keystore, orchestrator) = orchestrator(&dir);
        let daemon = MockDaemon::start(MockOptions::default()).await;

        let session = orchestrator.create_session(daemon.host("alpha")).unwrap();
        daemon.accept_params(&session.handshake_params());
        session.start_or_restart(Duration::from_secs(10));

        let pinned = session.wait().await.unwrap();
        assert_eq!(&pinned, daemon.identity().certificate());
        assert_eq!(
            session.history(),
            vec![PairingState::Starting, PairingState::Running, PairingState::Success]
        );
        assert_eq!(session.last_error(), None);
        let stored = keystore
            .load_pinned_certificate(CONTEXT, "127.0.0.1")
            .unwrap();
        assert_eq!(&stored, daemon.identity().certificate());
    }

    #[tokio::test]
    async fn test_flipped_value_fails_and_pins_nothing() {
        let dir = TempDir::new().unwrap();
        let (keystore, orchestrator) = orchestrator(&dir);
        let daemon = MockDaemon::start(MockOptions {
            flip_auth_bit: true,
            ..MockOptions::default()
        })
        .await;

        let session = orchestrator.create_session(daemon.host("alpha")).unwrap();
        daemon.accept_params(&session.handshake_params());
        session.start_or_restart(Duration::from_secs(10));

        let err = session.wait().await.unwrap_err();
        assert!(matches!(err, PairingError::AuthenticationFailed));
        assert_eq!(
            session.history(),
            vec![PairingState::Starting, PairingState::Running, PairingState::Failed]
        );
        assert!(!session.last_error().unwrap_or_default().is_empty());
        assert!(matches!(
            keystore.load_pinned_certificate(CONTEXT, "127.0.0.1"),
            Err(KeyStoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_restart_keeps_session_and_mints_new_psk() {
        let dir = TempDir::new().unwrap();
        let (_keystore, orchestrator) = orchestrator(&dir);
        let daemon = MockDaemon::start(MockOptions {
            flip_auth_bit: true,
            ..MockOptions::default()
        })
        .await;

        let session = orchestrator.create_session(daemon.host("alpha")).unwrap();
        let first_params = session.handshake_params();
        daemon.accept_params(&first_params);
        session.start_or_restart(Duration::from_secs(10));
        assert!(session.wait().await.is_err());
        assert_eq!(session.state(), PairingState::Failed);

        daemon.set_flip_auth_bit(false);
        let state = orchestrator
            .start_or_restart("127.0.0.1", Duration::from_secs(10))
            .unwrap();
        assert_ne!(state, PairingState::Failed);
        let second_params = session.handshake_params();
        assert_ne!(first_params, second_params);
        assert!(Arc::ptr_eq(&session, &orchestrator.session("127.0.0.1").unwrap()));

        // The remote still holds the old PSK, so it cannot prove the new one
        assert!(session.wait().await.is_err());
        assert_eq!(session.state(), PairingState::Failed);

        daemon.accept_params(&session.handshake_params());
        orchestrator
            .start_or_restart("127.0.0.1", Duration::from_secs(10))
            .unwrap();
        session.wait().await.unwrap();
        assert_eq!(session.state(), PairingState::Success);
    }

    #[tokio::test]
    async fn test_restart_is_idempotent_after_success() {
        let dir = TempDir::new().unwrap();
        let (_keystore, orchestrator) = orchestrator(&dir);
        let daemon = MockDaemon::start(MockOptions::default()).await;

        let session = orchestrator.create_session(daemon.host("alpha")).unwrap();
        daemon.accept_params(&session.handshake_params());
        session.start_or_restart(Duration::from_secs(10));
        session.wait().await.unwrap();
        let params = session.handshake_params();
        let history = session.history();

        let state = orchestrator
            .start_or_restart("127.0.0.1", Duration::from_secs(10))
            .unwrap();
        assert_eq!(state, PairingState::Success);
        assert_eq!(session.history(), history);
        assert_eq!(session.handshake_params(), params);
        assert!(!session.is_worker_active());
    }

    #[tokio::test]
    async fn test_second_session_cancels_first() {
        let dir = TempDir::new().unwrap();
        let (_keystore, orchestrator) = orchestrator(&dir);
        // No parameters pasted yet: the listener hangs up and the worker keeps retrying
        let daemon = MockDaemon::start(MockOptions::default()).await;

        let first = orchestrator.create_session(daemon.host("alpha")).unwrap();
        first.start_or_restart(Duration::from_secs(60));
        assert!(first.is_worker_active());
        timeout(Duration::from_secs(10), async {
            while daemon.pairing_connections() < 2 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .expect("first worker never retried");

        let second = orchestrator.create_session(daemon.host("alpha")).unwrap();
        assert!(!first.is_worker_active());
        assert!(matches!(first.wait().await, Err(PairingError::Cancelled(_))));
        assert!(Arc::ptr_eq(&second, &orchestrator.session("127.0.0.1").unwrap()));
        assert_eq!(orchestrator.hostnames(), vec!["127.0.0.1".to_string()]);

        // Let an in-flight connect land, then the count must stay put
        tokio::time::sleep(Duration::from_millis(200)).await;
        let after_cancel = daemon.pairing_connections();
        tokio::time::sleep(RETRY_INTERVAL * 3).await;
        assert_eq!(daemon.pairing_connections(), after_cancel);
        assert_eq!(first.state(), PairingState::NotRunning);
        orchestrator.shutdown();
    }

    #[tokio::test]
    async fn test_unreachable_listener_retries_until_deadline() {
        let dir = TempDir::new().unwrap();
        let (_keystore, orchestrator) = orchestrator(&dir);
        let host = dead_host();

        let session = orchestrator.create_session(host).unwrap();
        session.start_or_restart(Duration::from_millis(1500));
        let err = session.wait().await.unwrap_err();

        assert!(matches!(err, PairingError::Stopped(..)), "got {:?}", err);
        assert_eq!(session.state(), PairingState::NotRunning);
        let last_error = session.last_error().unwrap();
        assert!(last_error.contains("listener unreachable"), "{}", last_error);

        let status = orchestrator.status("127.0.0.1").await.unwrap();
        assert!(!status.container_likely_exists);
        assert!(status.exec_command.contains("./main handshake 1,"));
    }

    #[tokio::test]
    async fn test_bad_certificate_alert_stops_without_retry() {
        let dir = TempDir::new().unwrap();
        let (_keystore, orchestrator) = orchestrator(&dir);
        let daemon = MockDaemon::start(MockOptions {
            reject_clients: true,
            ..MockOptions::default()
        })
        .await;

        let session = orchestrator.create_session(daemon.host("alpha")).unwrap();
        session.start_or_restart(Duration::from_secs(60));
        let err = session.wait().await.unwrap_err();

        assert!(matches!(err, PairingError::Stopped(..)));
        assert_eq!(session.state(), PairingState::NotRunning);
        assert!(session
            .last_error()
            .unwrap()
            .contains("wrong pasted command"));
        assert_eq!(daemon.pairing_connections(), 1);

        let status = orchestrator.status("127.0.0.1").await.unwrap();
        assert!(status.container_likely_exists);
    }

    #[tokio::test]
    async fn test_start_unknown_host() {
        let dir = TempDir::new().unwrap();
        let (_keystore, orchestrator) = orchestrator(&dir);
        assert!(matches!(
            orchestrator.start_or_restart("nowhere", Duration::from_secs(1)),
            Err(PairingError::NoSession(_))
        ));
        assert!(!orchestrator.cancel("nowhere"));
    }
}
