//! Local Docker access for bootstrapping the connector

use async_trait::async_trait;
use bollard::container::{Config, CreateContainerOptions, StartContainerOptions};
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, PortBinding, RestartPolicy, RestartPolicyNameEnum};
use bollard::volume::CreateVolumeOptions;
use bollard::Docker;
use futures::StreamExt;
use log::{debug, info};
use std::collections::HashMap;

use super::BootstrapError;
use crate::config::ConnectorConfig;
use crate::host::RemoteHostDescriptor;
use crate::pairing::{server_args, CONNECTOR_DATA_DIR, CONNECTOR_DOCKER_SOCKET};

/// Seconds before a Docker API request is abandoned
const DOCKER_TIMEOUT_SECS: u64 = 120;

/// Everything needed to create the connector container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectorLaunch {
    pub name: String,
    pub image: String,
    pub volume: String,
    pub docker_socket: String,
    /// (host port, container port)
    pub ports: Vec<(u16, u16)>,
    pub args: Vec<String>,
}

impl ConnectorLaunch {
    /// Same container the operator `docker run` command would create
    pub fn new(connector: &ConnectorConfig, host: &RemoteHostDescriptor, params: &str) -> Self {
        let mut args = server_args();
        args.push(params.to_string());
        Self {
            name: connector.container_name.clone(),
            image: host.resolve_image(&connector.image),
            volume: connector.volume_name.clone(),
            docker_socket: connector.docker_socket.clone(),
            ports: vec![
                (host.control_port, connector.control_port),
                (host.pairing_port, connector.pairing_port),
                (host.tunnel_port, connector.tunnel_port),
            ],
            args,
        }
    }

    pub fn binds(&self) -> Vec<String> {
        vec![
            format!("{}:{}", self.volume, CONNECTOR_DATA_DIR),
            format!("{}:{}", self.docker_socket, CONNECTOR_DOCKER_SOCKET),
        ]
    }
}

/// A container found on the local daemon
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalContainer {
    pub id: String,
    pub running: bool,
}

/// The handful of Docker calls bootstrapping needs
#[async_trait]
pub trait LocalDocker: Send + Sync {
    /// Create the named volume unless it exists
    async fn ensure_volume(&self, name: &str) -> Result<(), BootstrapError>;

    async fn find_container(&self, name: &str) -> Result<Option<LocalContainer>, BootstrapError>;

    async fn start_container(&self, name: &str) -> Result<(), BootstrapError>;

    async fn pull_image(&self, image: &str) -> Result<(), BootstrapError>;

    /// Create and start; returns the container id
    async fn create_container(&self, launch: &ConnectorLaunch) -> Result<String, BootstrapError>;

    /// Run a command inside a container and return its exit code
    async fn exec(&self, container: &str, command: &[String]) -> Result<i64, BootstrapError>;
}

/// [`LocalDocker`] over the Docker Engine API
pub struct BollardDocker {
    docker: Docker,
}

impl BollardDocker {
    /// Connect through a Unix socket path
    pub fn connect(socket: &str) -> Result<Self, BootstrapError> {
        let docker =
            Docker::connect_with_socket(socket, DOCKER_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)?;
        Ok(Self { docker })
    }

    pub fn from_client(docker: Docker) -> Self {
        Self { docker }
    }
}

fn is_not_found(err: &BollardError) -> bool {
    matches!(
        err,
        BollardError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

#[async_trait]
impl LocalDocker for BollardDocker {
    async fn ensure_volume(&self, name: &str) -> Result<(), BootstrapError> {
        match self.docker.inspect_volume(name).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => {
                self.docker
                    .create_volume(CreateVolumeOptions {
                        name: name.to_string(),
                        ..Default::default()
                    })
                    .await?;
                info!("Created volume {}", name);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn find_container(&self, name: &str) -> Result<Option<LocalContainer>, BootstrapError> {
        match self.docker.inspect_container(name, None).await {
            Ok(response) => Ok(Some(LocalContainer {
                id: response.id.unwrap_or_default(),
                running: response
                    .state
                    .and_then(|s| s.running)
                    .unwrap_or(false),
            })),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn start_container(&self, name: &str) -> Result<(), BootstrapError> {
        self.docker
            .start_container(name, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    async fn pull_image(&self, image: &str) -> Result<(), BootstrapError> {
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let mut progress = self.docker.create_image(Some(options), None, None);
        while let Some(step) = progress.next().await {
            let step = step?;
            if let Some(status) = step.status {
                debug!("Pull {}: {}", image, status);
            }
        }
        info!("Pulled {}", image);
        Ok(())
    }

    async fn create_container(&self, launch: &ConnectorLaunch) -> Result<String, BootstrapError> {
        let mut exposed_ports = HashMap::new();
        let mut port_bindings = HashMap::new();
        for (host_port, container_port) in &launch.ports {
            let key = format!("{}/tcp", container_port);
            exposed_ports.insert(key.clone(), HashMap::new());
            port_bindings.insert(
                key,
                Some(vec![PortBinding {
                    host_ip: None,
                    host_port: Some(host_port.to_string()),
                }]),
            );
        }

        let host_config = HostConfig {
            binds: Some(launch.binds()),
            port_bindings: Some(port_bindings),
            restart_policy: Some(RestartPolicy {
                name: Some(RestartPolicyNameEnum::ALWAYS),
                maximum_retry_count: None,
            }),
            ..Default::default()
        };
        let config = Config {
            image: Some(launch.image.clone()),
            cmd: Some(launch.args.clone()),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        };
        let options = CreateContainerOptions {
            name: launch.name.clone(),
            platform: None,
        };

        let created = self.docker.create_container(Some(options), config).await?;
        self.docker
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await?;
        info!("Created connector {} ({})", launch.name, created.id);
        Ok(created.id)
    }

    async fn exec(&self, container: &str, command: &[String]) -> Result<i64, BootstrapError> {
        let exec = self
            .docker
            .create_exec(
                container,
                CreateExecOptions {
                    cmd: Some(command.to_vec()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await?;

        if let StartExecResults::Attached { mut output, .. } =
            self.docker.start_exec(&exec.id, None).await?
        {
            while let Some(chunk) = output.next().await {
                debug!("exec {}: {}", container, chunk?.to_string().trim_end());
            }
        }

        let inspect = self.docker.inspect_exec(&exec.id).await?;
        Ok(inspect.exit_code.unwrap_or(-1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_launch_matches_operator_command() {
        let connector = ConnectorConfig::default();
        let host = RemoteHostDescriptor::new("localhost", "local");
        let launch = ConnectorLaunch::new(&connector, &host, "1,a,b,c");

        assert_eq!(launch.name, "harbor-connector");
        assert_eq!(launch.image, "harbor/connector:latest");
        assert_eq!(launch.args, vec!["server", "1,a,b,c"]);
        assert_eq!(launch.ports, vec![(7451, 7451), (7452, 7452), (7453, 7453)]);
        assert_eq!(
            launch.binds(),
            vec![
                "harbor-connector-data:/data",
                "/var/run/docker.sock:/var/run/docker.sock"
            ]
        );
    }
}
