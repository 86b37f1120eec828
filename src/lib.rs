//! Harbor: control remote Docker daemons over pinned TLS
//!
//! A daemon is trusted once, through a pairing handshake that proves
//! knowledge of a pre-shared key bound to the TLS session. Every later
//! connection pins the certificate observed during pairing. Containers on
//! paired daemons can be managed and reached through loopback tunnels.

pub mod bootstrap;
pub mod channel;
pub mod config;
pub mod container;
pub mod daemon;
pub mod engine;
pub mod host;
pub mod identity;
pub mod pairing;
pub mod rpc;

#[cfg(test)]
mod testing;

pub use config::{ConnectorConfig, EngineConfig};
pub use container::{ContainerHandle, ContainerRegistry};
pub use daemon::{ConnectionStatus, DaemonHandle, DaemonRegistry};
pub use engine::{Engine, EngineError, EngineEvent};
pub use host::RemoteHostDescriptor;
pub use identity::KeyStore;
pub use pairing::{PairingOrchestrator, PairingState, PairingStatus};
pub use rpc::{ContainerSpec, ExecOutcome};
