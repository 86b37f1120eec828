//! Operator commands that start the remote connector
//!
//! Both strings embed the handshake parameters, so they are regenerated
//! whenever the PSK changes.

use crate::config::ConnectorConfig;
use crate::host::RemoteHostDescriptor;
use serde::Serialize;

/// Path the connector volume is mounted at inside the container
pub const CONNECTOR_DATA_DIR: &str = "/data";

/// Docker socket path inside the connector container
pub const CONNECTOR_DOCKER_SOCKET: &str = "/var/run/docker.sock";

/// Arguments the connector container runs with
pub fn server_args() -> Vec<String> {
    vec!["server".to_string()]
}

/// Arguments of the handshake subcommand exec'd inside the connector
pub fn handshake_args(params: &str) -> Vec<String> {
    vec![
        "./main".to_string(),
        "handshake".to_string(),
        params.to_string(),
    ]
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperatorCommands {
    /// Starts a new connector with the parameters baked in
    pub run: String,
    /// Feeds the parameters to an already running connector
    pub exec: String,
}

impl OperatorCommands {
    pub fn generate(connector: &ConnectorConfig, host: &RemoteHostDescriptor, params: &str) -> Self {
        let image = host.resolve_image(&connector.image);
        let publish = [
            (host.control_port, connector.control_port),
            (host.pairing_port, connector.pairing_port),
            (host.tunnel_port, connector.tunnel_port),
        ]
        .iter()
        .map(|(outside, inside)| format!("-p {}:{}", outside, inside))
        .collect::<Vec<_>>()
        .join(" ");

        let run = format!(
            "docker run -d --name {name} --restart always -v {volume}:{data} -v {socket}:{inner_socket} {publish} {image} {server} {params}",
            name = connector.container_name,
            volume = connector.volume_name,
            data = CONNECTOR_DATA_DIR,
            socket = connector.docker_socket,
            inner_socket = CONNECTOR_DOCKER_SOCKET,
            publish = publish,
            image = image,
            server = server_args().join(" "),
            params = params,
        );
        let exec = format!(
            "docker exec {} {}",
            connector.container_name,
            handshake_args(params).join(" ")
        );
        Self { run, exec }
    }
}
