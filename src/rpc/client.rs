//! Control client: one serialized request/response exchange at a time

use super::protocol::{
    ContainerSpec, ContainerState, ContainerSummary, ExecOutcome, OpResult, Operation,
    PortMappings, RpcRequest, RpcResponse, CONTROL_PROTOCOL_VERSION, MAX_FRAME_LEN,
};
use crate::channel::BoxedStream;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use uuid::Uuid;

/// Errors raised by control calls
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("transport error during {op}: {source}")]
    Transport {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("{op} timed out after {millis}ms")]
    Timeout { op: &'static str, millis: u128 },

    #[error("daemon closed the connection during {0}")]
    Closed(&'static str),

    #[error("protocol violation during {op}: {detail}")]
    Protocol { op: &'static str, detail: String },

    #[error("protocol version mismatch: daemon speaks {remote}, we speak {local}")]
    VersionMismatch { local: u32, remote: u32 },

    #[error("{op} failed: {message}")]
    Application { op: &'static str, message: String },

    #[error("connection is unusable after an earlier failure")]
    Broken,
}

impl RpcError {
    /// Whether the connection must be rebuilt after this error
    pub fn is_connection_fatal(&self) -> bool {
        !matches!(self, RpcError::Application { .. })
    }
}

struct Connection {
    framed: Framed<BoxedStream, LengthDelimitedCodec>,
    next_id: u64,
}

impl Connection {
    async fn exchange(&mut self, request: RpcRequest) -> Result<RpcResponse, RpcError> {
        let op = request.op.name();
        let payload = serde_json::to_vec(&request).map_err(|e| RpcError::Protocol {
            op,
            detail: format!("cannot encode request: {}", e),
        })?;
        self.framed
            .send(Bytes::from(payload))
            .await
            .map_err(|source| RpcError::Transport { op, source })?;

        let frame = match self.framed.next().await {
            None => return Err(RpcError::Closed(op)),
            Some(Err(e)) if e.kind() == io::ErrorKind::InvalidData => {
                return Err(RpcError::Protocol {
                    op,
                    detail: format!("bad frame: {}", e),
                })
            }
            Some(Err(source)) => return Err(RpcError::Transport { op, source }),
            Some(Ok(frame)) => frame,
        };

        let response: RpcResponse =
            serde_json::from_slice(&frame).map_err(|e| RpcError::Protocol {
                op,
                detail: format!("malformed response: {}", e),
            })?;
        if response.id != request.id {
            return Err(RpcError::Protocol {
                op,
                detail: format!(
                    "response id {} does not match request id {}",
                    response.id, request.id
                ),
            });
        }
        Ok(response)
    }
}

/// Client for the remote control protocol.
///
/// Requests on one client never overlap: a call holds the connection lock
/// from writing its request until its response has been read.
pub struct ControlClient {
    conn: Mutex<Connection>,
    broken: AtomicBool,
    daemon_id: Uuid,
    peer: String,
    call_timeout: Duration,
}

impl ControlClient {
    /// Wrap `stream` and perform the version handshake
    pub async fn connect(
        stream: BoxedStream,
        peer: impl Into<String>,
        call_timeout: Duration,
    ) -> Result<Self, RpcError> {
        let codec = LengthDelimitedCodec::builder()
            .max_frame_length(MAX_FRAME_LEN)
            .new_codec();
        let mut client = Self {
            conn: Mutex::new(Connection {
                framed: Framed::new(stream, codec),
                next_id: 0,
            }),
            broken: AtomicBool::new(false),
            daemon_id: Uuid::nil(),
            peer: peer.into(),
            call_timeout,
        };

        let result = client
            .call(Operation::Version {
                version: CONTROL_PROTOCOL_VERSION,
            })
            .await?;
        match result {
            OpResult::Version { version, daemon_id } if version == CONTROL_PROTOCOL_VERSION => {
                client.daemon_id = daemon_id;
                info!(
                    "Control channel to {} ready (daemon {}, protocol v{})",
                    client.peer, daemon_id, version
                );
                Ok(client)
            }
            OpResult::Version { version, .. } => Err(RpcError::VersionMismatch {
                local: CONTROL_PROTOCOL_VERSION,
                remote: version,
            }),
            other => Err(unexpected("version", &other)),
        }
    }

    /// UUID the daemon reported during the handshake
    pub fn daemon_id(&self) -> Uuid {
        self.daemon_id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// False once a transport or protocol failure has poisoned the connection
    pub fn is_usable(&self) -> bool {
        !self.broken.load(Ordering::SeqCst)
    }

    async fn call(&self, op: Operation) -> Result<OpResult, RpcError> {
        let name = op.name();
        let mut conn = self.conn.lock().await;
        if !self.is_usable() {
            return Err(RpcError::Broken);
        }
        conn.next_id += 1;
        let request = RpcRequest {
            id: conn.next_id,
            op,
        };
        debug!("-> {} #{} {}", self.peer, request.id, name);

        let outcome = match timeout(self.call_timeout, conn.exchange(request)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(RpcError::Timeout {
                op: name,
                millis: self.call_timeout.as_millis(),
            }),
        };

        let response = match outcome {
            Ok(response) => response,
            Err(e) => {
                if e.is_connection_fatal() {
                    warn!("Control channel to {} unusable: {}", self.peer, e);
                    self.broken.store(true, Ordering::SeqCst);
                }
                return Err(e);
            }
        };

        if !response.error.is_empty() {
            return Err(RpcError::Application {
                op: name,
                message: response.error,
            });
        }
        response.result.ok_or_else(|| {
            self.broken.store(true, Ordering::SeqCst);
            RpcError::Protocol {
                op: name,
                detail: "response carries neither result nor error".into(),
            }
        })
    }

    pub async fn ping(&self) -> Result<(), RpcError> {
        match self.call(Operation::Ping).await? {
            OpResult::Pong | OpResult::Done => Ok(()),
            other => Err(unexpected("ping", &other)),
        }
    }

    pub async fn list_containers(&self) -> Result<Vec<ContainerSummary>, RpcError> {
        match self.call(Operation::ListContainers).await? {
            OpResult::Containers { containers } => Ok(containers),
            other => Err(unexpected("list_containers", &other)),
        }
    }

    /// Create a container, returning its remote id
    pub async fn create_container(&self, spec: ContainerSpec) -> Result<String, RpcError> {
        match self.call(Operation::CreateContainer { spec }).await? {
            OpResult::Created { container_id } => Ok(container_id),
            other => Err(unexpected("create_container", &other)),
        }
    }

    pub async fn start_container(&self, container_id: &str) -> Result<(), RpcError> {
        self.call_done(Operation::StartContainer {
            container_id: container_id.to_string(),
        })
        .await
    }

    pub async fn stop_container(&self, container_id: &str) -> Result<(), RpcError> {
        self.call_done(Operation::StopContainer {
            container_id: container_id.to_string(),
        })
        .await
    }

    pub async fn delete_container(&self, container_id: &str) -> Result<(), RpcError> {
        self.call_done(Operation::DeleteContainer {
            container_id: container_id.to_string(),
        })
        .await
    }

    pub async fn container_status(&self, container_id: &str) -> Result<ContainerState, RpcError> {
        let op = Operation::ContainerStatus {
            container_id: container_id.to_string(),
        };
        match self.call(op).await? {
            OpResult::Status { state } => Ok(state),
            other => Err(unexpected("container_status", &other)),
        }
    }

    pub async fn port_mappings(&self, container_ids: &[String]) -> Result<PortMappings, RpcError> {
        let op = Operation::PortMappings {
            container_ids: container_ids.to_vec(),
        };
        match self.call(op).await? {
            OpResult::Ports { mappings } => Ok(mappings),
            other => Err(unexpected("port_mappings", &other)),
        }
    }

    pub async fn exec(&self, container_id: &str, command: &[String]) -> Result<ExecOutcome, RpcError> {
        let op = Operation::Exec {
            container_id: container_id.to_string(),
            command: command.to_vec(),
        };
        match self.call(op).await? {
            OpResult::Exec { outcome } => Ok(outcome),
            other => Err(unexpected("exec", &other)),
        }
    }

    pub async fn create_volume(&self, name: &str) -> Result<(), RpcError> {
        self.call_done(Operation::CreateVolume {
            name: name.to_string(),
        })
        .await
    }

    pub async fn delete_volume(&self, name: &str) -> Result<(), RpcError> {
        self.call_done(Operation::DeleteVolume {
            name: name.to_string(),
        })
        .await
    }

    async fn call_done(&self, op: Operation) -> Result<(), RpcError> {
        let name = op.name();
        match self.call(op).await? {
            OpResult::Done => Ok(()),
            other => Err(unexpected(name, &other)),
        }
    }

    /// Shut the underlying stream down
    pub async fn close(self) {
        let mut conn = self.conn.into_inner();
        if let Err(e) = conn.framed.get_mut().shutdown().await {
            debug!("Closing control channel to {}: {}", self.peer, e);
        }
    }
}

fn unexpected(op: &'static str, result: &OpResult) -> RpcError {
    RpcError::Protocol {
        op,
        detail: format!("unexpected result {:?}", result),
    }
}
