//! Remote control protocol messages
//!
//! Each frame on the control port holds one JSON document: a
//! [`RpcRequest`] from the engine or an [`RpcResponse`] from the daemon.
//! A response echoes the request id and carries either a result or a
//! non-empty error string.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Version spoken by this client; the daemon must report the same
pub const CONTROL_PROTOCOL_VERSION: u32 = 1;

/// Upper bound on a single frame
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Payload for creating a container
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerSpec {
    /// Logical name, also used as the remote container name
    pub name: String,
    /// Image reference, already resolved against the host's registry prefix
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
    /// Container ports to publish on the remote host (host port chosen remotely)
    #[serde(default)]
    pub ports: Vec<u16>,
    /// `volume:path` mounts
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

/// Runtime state of a remote container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerState {
    Created,
    Running,
    Paused,
    Restarting,
    Exited,
    Dead,
    Unknown,
}

/// One entry of a container listing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerSummary {
    pub id: String,
    pub name: String,
    pub image: String,
    pub state: ContainerState,
}

/// How a command run inside a container ended
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecOutcome {
    pub exit_code: i64,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
}

impl ExecOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// containerId -> {containerPort -> hostPort}
pub type PortMappings = HashMap<String, HashMap<u16, u16>>;

/// Operations a request can carry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    Version { version: u32 },
    ListContainers,
    CreateContainer { spec: ContainerSpec },
    StartContainer { container_id: String },
    StopContainer { container_id: String },
    DeleteContainer { container_id: String },
    ContainerStatus { container_id: String },
    PortMappings { container_ids: Vec<String> },
    Exec { container_id: String, command: Vec<String> },
    CreateVolume { name: String },
    DeleteVolume { name: String },
    Ping,
}

impl Operation {
    /// Short name used in error messages and logs
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Version { .. } => "version",
            Operation::ListContainers => "list_containers",
            Operation::CreateContainer { .. } => "create_container",
            Operation::StartContainer { .. } => "start_container",
            Operation::StopContainer { .. } => "stop_container",
            Operation::DeleteContainer { .. } => "delete_container",
            Operation::ContainerStatus { .. } => "container_status",
            Operation::PortMappings { .. } => "port_mappings",
            Operation::Exec { .. } => "exec",
            Operation::CreateVolume { .. } => "create_volume",
            Operation::DeleteVolume { .. } => "delete_volume",
            Operation::Ping => "ping",
        }
    }
}

/// Results a response can carry.
///
/// Externally tagged: integer-keyed port maps do not survive the
/// buffering an internally tagged enum needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpResult {
    Version { version: u32, daemon_id: Uuid },
    Containers { containers: Vec<ContainerSummary> },
    Created { container_id: String },
    Status { state: ContainerState },
    Ports { mappings: PortMappings },
    Exec { outcome: ExecOutcome },
    Done,
    Pong,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub id: u64,
    #[serde(flatten)]
    pub op: Operation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: u64,
    #[serde(default)]
    pub result: Option<OpResult>,
    /// Empty on success
    #[serde(default)]
    pub error: String,
}

impl RpcResponse {
    pub fn ok(id: u64, result: OpResult) -> Self {
        Self {
            id,
            result: Some(result),
            error: String::new(),
        }
    }

    pub fn err(id: u64, error: impl Into<String>) -> Self {
        Self {
            id,
            result: None,
            error: error.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_shape() {
        let req = RpcRequest {
            id: 7,
            op: Operation::StartContainer {
                container_id: "abc".into(),
            },
        };
        let json: serde_json::Value = serde_json::to_value(&req).unwrap();
        assert_eq!(json["id"], 7);
        assert_eq!(json["op"], "start_container");
        assert_eq!(json["container_id"], "abc");
    }

    #[test]
    fn test_response_error_defaults() {
        let resp: RpcResponse = serde_json::from_str(r#"{"id":3}"#).unwrap();
        assert_eq!(resp.id, 3);
        assert!(resp.result.is_none());
        assert!(resp.error.is_empty());
    }

    #[test]
    fn test_port_mappings_integer_keys() {
        let mut inner = HashMap::new();
        inner.insert(5432u16, 49153u16);
        let mut mappings = PortMappings::new();
        mappings.insert("c1".into(), inner);

        let resp = RpcResponse::ok(1, OpResult::Ports { mappings: mappings.clone() });
        let bytes = serde_json::to_vec(&resp).unwrap();
        let decoded: RpcResponse = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded.result, Some(OpResult::Ports { mappings }));
    }
}
