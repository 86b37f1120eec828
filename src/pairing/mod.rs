//! Pairing: bootstrapping trust with a daemon we have never talked to
//!
//! - [`handshake`]: the PSK + channel-binding proof over an unverified channel
//! - [`PairingSession`]: state machine and retry worker for one host
//! - [`PairingOrchestrator`]: one live session per hostname

mod commands;
pub mod handshake;
mod orchestrator;
mod session;

pub use commands::{handshake_args, server_args, OperatorCommands, CONNECTOR_DATA_DIR, CONNECTOR_DOCKER_SOCKET};
pub use handshake::{
    compute_auth_value, handshake_params, PairingClient, PairingError, Psk, AUTH_VALUE_LEN,
    PAIRING_VERSION, PSK_LEN,
};
pub use orchestrator::{container_likely_exists, PairingOrchestrator, PROBE_TIMEOUT};
pub use session::{PairingSession, PairingState, PairingStatus, TransitionObserver, RETRY_INTERVAL};
