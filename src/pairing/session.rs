//! Pairing sessions and their worker task

use super::commands::OperatorCommands;
use super::handshake::{PairingClient, PairingError};
use crate::config::ConnectorConfig;
use crate::host::RemoteHostDescriptor;
use crate::identity::{KeyStore, KeyStoreError};
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use rustls::pki_types::CertificateDer;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Pause between attempts while the listener is unreachable
pub const RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Told about every state change with the hostname and the new state.
/// Runs under the session lock, so it must not block or call back in.
pub type TransitionObserver = Arc<dyn Fn(&str, PairingState) + Send + Sync>;

/// Lifecycle of one pairing session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PairingState {
    Starting,
    Running,
    NotRunning,
    Success,
    Failed,
}

impl PairingState {
    pub const ALL: [PairingState; 5] = [
        PairingState::Starting,
        PairingState::Running,
        PairingState::NotRunning,
        PairingState::Success,
        PairingState::Failed,
    ];

    /// No worker will ever move the session out of this state
    pub fn is_terminal(self) -> bool {
        matches!(self, PairingState::Success | PairingState::Failed)
    }

    /// Transition table. `Failed -> Starting` is the fresh-PSK recovery path.
    pub fn can_transition_to(self, next: PairingState) -> bool {
        use PairingState::*;
        matches!(
            (self, next),
            (Starting, Running)
                | (Starting, NotRunning)
                | (Running, Success)
                | (Running, Failed)
                | (Running, NotRunning)
                | (NotRunning, Running)
                | (NotRunning, Starting)
                | (Failed, Starting)
        )
    }
}

/// Point-in-time view of a session
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PairingStatus {
    pub hostname: String,
    pub alias: String,
    pub state: PairingState,
    pub last_error: Option<String>,
    pub run_command: String,
    pub exec_command: String,
    pub history: Vec<PairingState>,
    /// When the state last changed
    pub changed_at: DateTime<Utc>,
    /// Best-effort: the control port answered a TCP connect
    pub container_likely_exists: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Progress {
    state: PairingState,
    worker_active: bool,
}

struct SessionInner {
    client: Arc<PairingClient>,
    commands: OperatorCommands,
    state: PairingState,
    last_error: Option<String>,
    deadline: Option<Instant>,
    cancel: CancellationToken,
    cancelled: bool,
    /// Bumped for every worker; updates from older workers are dropped
    generation: u64,
    worker_active: bool,
    history: Vec<PairingState>,
    changed_at: DateTime<Utc>,
    pinned: Option<CertificateDer<'static>>,
}

/// One pairing attempt against one host.
///
/// Callers hold an `Arc` to the session and only ever read snapshots.
/// Restarting a `FAILED` session swaps in a fresh PSK but keeps this object.
pub struct PairingSession {
    host: RemoteHostDescriptor,
    context: String,
    keystore: Arc<KeyStore>,
    connector: ConnectorConfig,
    inner: Mutex<SessionInner>,
    progress: watch::Sender<Progress>,
    observer: Option<TransitionObserver>,
}

impl PairingSession {
    pub(crate) fn new(
        host: RemoteHostDescriptor,
        client: PairingClient,
        context: String,
        keystore: Arc<KeyStore>,
        connector: ConnectorConfig,
        observer: Option<TransitionObserver>,
    ) -> Arc<Self> {
        let commands = OperatorCommands::generate(&connector, &host, &client.handshake_params());
        let (progress, _) = watch::channel(Progress {
            state: PairingState::Starting,
            worker_active: false,
        });
        Arc::new(Self {
            host,
            context,
            keystore,
            connector,
            inner: Mutex::new(SessionInner {
                client: Arc::new(client),
                commands,
                state: PairingState::Starting,
                last_error: None,
                deadline: None,
                cancel: CancellationToken::new(),
                cancelled: false,
                generation: 0,
                worker_active: false,
                history: vec![PairingState::Starting],
                changed_at: Utc::now(),
                pinned: None,
            }),
            progress,
            observer,
        })
    }

    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn host(&self) -> &RemoteHostDescriptor {
        &self.host
    }

    pub fn hostname(&self) -> &str {
        &self.host.hostname
    }

    pub fn state(&self) -> PairingState {
        self.lock().state
    }

    pub fn last_error(&self) -> Option<String> {
        self.lock().last_error.clone()
    }

    pub fn history(&self) -> Vec<PairingState> {
        self.lock().history.clone()
    }

    pub fn commands(&self) -> OperatorCommands {
        self.lock().commands.clone()
    }

    /// Parameter string for the current PSK
    pub fn handshake_params(&self) -> String {
        self.lock().client.handshake_params()
    }

    pub fn is_worker_active(&self) -> bool {
        self.lock().worker_active
    }

    pub fn status(&self) -> PairingStatus {
        let inner = self.lock();
        PairingStatus {
            hostname: self.host.hostname.clone(),
            alias: self.host.alias.clone(),
            state: inner.state,
            last_error: inner.last_error.clone(),
            run_command: inner.commands.run.clone(),
            exec_command: inner.commands.exec.clone(),
            history: inner.history.clone(),
            changed_at: inner.changed_at,
            container_likely_exists: false,
        }
    }

    /// Start the worker, or extend the deadline of the one already running.
    ///
    /// No-op on `RUNNING` and `SUCCESS`. On `FAILED` a new PSK is minted.
    /// Must be called from within a tokio runtime.
    pub fn start_or_restart(self: &Arc<Self>, timeout: Duration) -> PairingState {
        let mut inner = self.lock();
        let state = inner.state;
        let worker_active = inner.worker_active;
        match state {
            PairingState::Running | PairingState::Success => {
                debug!("Pairing with {} already {:?}", self.host.hostname, state);
                return state;
            }
            PairingState::Failed => {
                let connector = inner.client.connector().clone();
                let client =
                    PairingClient::new(connector, self.host.hostname.clone(), self.host.pairing_port);
                inner.commands =
                    OperatorCommands::generate(&self.connector, &self.host, &client.handshake_params());
                inner.client = Arc::new(client);
                inner.last_error = None;
                info!(
                    "Pairing with {} restarted with a fresh pre-shared key",
                    self.host.hostname
                );
                self.apply(&mut inner, PairingState::Starting, None);
            }
            PairingState::NotRunning if !worker_active => {
                self.apply(&mut inner, PairingState::Starting, None);
            }
            PairingState::Starting | PairingState::NotRunning => {}
        }

        inner.deadline = Some(Instant::now() + timeout);
        inner.cancelled = false;
        if inner.worker_active {
            return inner.state;
        }

        inner.generation += 1;
        inner.cancel = CancellationToken::new();
        inner.worker_active = true;
        self.publish(&inner);

        let worker = Worker {
            session: Arc::clone(self),
            generation: inner.generation,
            client: Arc::clone(&inner.client),
            cancel: inner.cancel.clone(),
        };
        tokio::spawn(worker.run());
        inner.state
    }

    /// Zero the deadline and interrupt the worker
    pub fn cancel(&self) {
        let mut inner = self.lock();
        inner.deadline = Some(Instant::now());
        inner.cancel.cancel();
        if inner.state.is_terminal() {
            return;
        }
        inner.cancelled = true;
        inner.generation += 1;
        inner.worker_active = false;
        if inner.state == PairingState::NotRunning {
            inner.last_error = Some("cancelled".into());
            self.publish(&inner);
        } else {
            self.apply(&mut inner, PairingState::NotRunning, Some("cancelled".into()));
        }
        info!("Pairing with {} cancelled", self.host.hostname);
    }

    /// Wait for the session to finish.
    ///
    /// Returns the pinned certificate on success. A session whose worker
    /// has stopped without reaching a terminal state (deadline, wrong
    /// pasted command, cancellation) resolves to an error as well.
    pub async fn wait(&self) -> Result<CertificateDer<'static>, PairingError> {
        let mut rx = self.progress.subscribe();
        loop {
            let progress = *rx.borrow_and_update();
            if let Some(result) = self.outcome(progress) {
                return result;
            }
            if rx.changed().await.is_err() {
                return Err(PairingError::Cancelled(self.host.hostname.clone()));
            }
        }
    }

    fn outcome(&self, progress: Progress) -> Option<Result<CertificateDer<'static>, PairingError>> {
        let inner = self.lock();
        let hostname = self.host.hostname.clone();
        match progress.state {
            PairingState::Success => Some(
                inner
                    .pinned
                    .clone()
                    .ok_or(PairingError::Stopped(hostname, "no certificate recorded".into())),
            ),
            PairingState::Failed => Some(Err(PairingError::AuthenticationFailed)),
            _ if progress.worker_active => None,
            _ if inner.cancelled => Some(Err(PairingError::Cancelled(hostname))),
            _ => Some(Err(PairingError::Stopped(
                hostname,
                inner
                    .last_error
                    .clone()
                    .unwrap_or_else(|| "pairing was never started".into()),
            ))),
        }
    }

    fn publish(&self, inner: &SessionInner) {
        self.progress.send_replace(Progress {
            state: inner.state,
            worker_active: inner.worker_active,
        });
    }

    /// Move to `next`, recording `error`. Same-state moves only update the error.
    fn apply(&self, inner: &mut SessionInner, next: PairingState, error: Option<String>) -> bool {
        if error.is_some() {
            inner.last_error = error;
        }
        if inner.state != next {
            if !inner.state.can_transition_to(next) {
                warn!(
                    "Ignoring illegal pairing transition {:?} -> {:?} for {}",
                    inner.state, next, self.host.hostname
                );
                return false;
            }
            debug!(
                "Pairing {}: {:?} -> {:?}",
                self.host.hostname, inner.state, next
            );
            inner.state = next;
            inner.history.push(next);
            inner.changed_at = Utc::now();
            if let Some(observer) = &self.observer {
                observer(&self.host.hostname, next);
            }
        }
        self.publish(inner);
        true
    }

    fn transition(&self, generation: u64, next: PairingState, error: Option<String>) -> bool {
        let mut inner = self.lock();
        if inner.generation != generation {
            return false;
        }
        self.apply(&mut inner, next, error)
    }

    /// Pin `certificate` and move to `SUCCESS`.
    ///
    /// Returns `Ok(false)` without touching the store when the worker was
    /// cancelled or superseded. `cancel()` takes the same lock, so it cannot
    /// slip in between the check and the write.
    fn succeed(
        &self,
        generation: u64,
        certificate: CertificateDer<'static>,
    ) -> Result<bool, KeyStoreError> {
        let mut inner = self.lock();
        if inner.generation != generation || inner.state != PairingState::Running {
            return Ok(false);
        }
        self.keystore
            .save_pinned_certificate(&self.context, &self.host.hostname, &certificate)?;
        inner.pinned = Some(certificate);
        inner.last_error = None;
        self.apply(&mut inner, PairingState::Success, None);
        Ok(true)
    }

    fn stop_worker(&self, generation: u64, reason: Option<&str>) {
        let mut inner = self.lock();
        if inner.generation != generation {
            return;
        }
        if let Some(reason) = reason {
            inner.last_error = Some(reason.to_string());
        }
        inner.worker_active = false;
        self.publish(&inner);
    }

    fn expired(&self) -> bool {
        self.lock()
            .deadline
            .map_or(true, |deadline| Instant::now() >= deadline)
    }
}

/// Connect-then-read loop for one session generation
struct Worker {
    session: Arc<PairingSession>,
    generation: u64,
    client: Arc<PairingClient>,
    cancel: CancellationToken,
}

impl Worker {
    async fn run(self) {
        let hostname = self.session.host.hostname.clone();
        info!("Pairing worker for {} started", hostname);
        loop {
            if self.cancel.is_cancelled() {
                self.session.stop_worker(self.generation, Some("cancelled"));
                break;
            }
            if self.session.expired() {
                warn!("Pairing with {} gave up: deadline expired", hostname);
                let reason = self
                    .session
                    .last_error()
                    .map(|e| format!("deadline expired; last error: {}", e))
                    .unwrap_or_else(|| "deadline expired".to_string());
                self.session.transition(self.generation, PairingState::NotRunning, None);
                self.session.stop_worker(self.generation, Some(&reason));
                break;
            }

            let result = tokio::select! {
                _ = self.cancel.cancelled() => continue,
                r = self.attempt() => r,
            };

            match result {
                Ok(certificate) => {
                    self.finish(certificate);
                    break;
                }
                Err(e @ PairingError::AuthenticationFailed) => {
                    error!("Pairing with {} failed: {}", hostname, e);
                    self.session
                        .transition(self.generation, PairingState::Failed, Some(e.to_string()));
                    self.session.stop_worker(self.generation, None);
                    break;
                }
                Err(e @ PairingError::WrongPastedCommand) => {
                    error!("Pairing with {} stopped: {}", hostname, e);
                    self.session
                        .transition(self.generation, PairingState::NotRunning, Some(e.to_string()));
                    self.session.stop_worker(self.generation, None);
                    break;
                }
                Err(e) => {
                    debug!("Pairing with {} not ready: {}", hostname, e);
                    if !self.session.transition(
                        self.generation,
                        PairingState::NotRunning,
                        Some(e.to_string()),
                    ) {
                        break;
                    }
                    tokio::select! {
                        _ = self.cancel.cancelled() => {}
                        _ = tokio::time::sleep(RETRY_INTERVAL) => {}
                    }
                }
            }
        }
        debug!("Pairing worker for {} exited", hostname);
    }

    async fn attempt(&self) -> Result<CertificateDer<'static>, PairingError> {
        let channel = self.client.connect().await?;
        if !self
            .session
            .transition(self.generation, PairingState::Running, None)
        {
            return Err(PairingError::Cancelled(self.session.host.hostname.clone()));
        }
        self.client.authenticate(channel).await
    }

    fn finish(&self, certificate: CertificateDer<'static>) {
        let session = &self.session;
        match session.succeed(self.generation, certificate) {
            Ok(true) => {
                info!("Paired with {}", session.host.hostname);
                session.stop_worker(self.generation, None);
            }
            Ok(false) => {
                debug!(
                    "Pairing worker for {} was superseded; certificate not pinned",
                    session.host.hostname
                );
            }
            Err(e) => {
                let e = PairingError::Store(e);
                error!("Pairing with {}: {}", session.host.hostname, e);
                session.transition(self.generation, PairingState::NotRunning, Some(e.to_string()));
                session.stop_worker(self.generation, None);
            }
        }
    }
}
