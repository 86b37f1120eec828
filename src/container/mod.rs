//! Remote containers and the loopback tunnels into them

mod handle;
mod registry;
mod tunnel;

pub use handle::{ContainerError, ContainerHandle};
pub use registry::ContainerRegistry;
pub use tunnel::{is_expected_close, tunnel_header, TunnelListener};
