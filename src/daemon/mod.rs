//! Daemon handles and the registry that owns them

mod handle;
mod registry;
mod seen;

pub use handle::{ConnectionStatus, DaemonError, DaemonHandle, DaemonSettings, TunnelEndpoint};
pub use registry::{DaemonRegistry, RegistryError};
pub use seen::{SeenDaemons, Sighting};
