//! Remote Control Protocol: container and volume lifecycle over a pinned channel
//!
//! Length-delimited JSON frames, one outstanding request per connection.

mod client;
pub mod protocol;

pub use client::{ControlClient, RpcError};
pub use protocol::{
    ContainerSpec, ContainerState, ContainerSummary, ExecOutcome, OpResult, Operation,
    PortMappings, RpcRequest, RpcResponse, CONTROL_PROTOCOL_VERSION, MAX_FRAME_LEN,
};
