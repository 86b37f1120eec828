//! Engine configuration
//!
//! Defaults cover the common single-host setup. A JSON file may override
//! any subset of fields, and a few `HARBOR_*` environment variables take
//! precedence over both.

use crate::host::{
    RemoteHostDescriptor, DEFAULT_CONTROL_PORT, DEFAULT_PAIRING_PORT, DEFAULT_TUNNEL_PORT,
};
use crate::identity::validate_context;
use log::info;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

pub const ENV_DATA_DIR: &str = "HARBOR_DATA_DIR";
pub const ENV_CONTEXT: &str = "HARBOR_CONTEXT";
pub const ENV_RESET_ON_FIRST_CONTACT: &str = "HARBOR_RESET_ON_FIRST_CONTACT";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// The connector container run next to each remote Docker daemon
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectorConfig {
    pub image: String,
    pub container_name: String,
    pub volume_name: String,
    /// Ports the connector listens on inside its container
    pub control_port: u16,
    pub pairing_port: u16,
    pub tunnel_port: u16,
    /// Host path of the Docker socket bind-mounted into the connector
    pub docker_socket: String,
    /// Hostname under which a local connector is reached
    pub hostname: String,
    /// Restarts of an OOM-killed handshake exec before giving up
    pub exec_oom_retries: u32,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            image: "harbor/connector:latest".to_string(),
            container_name: "harbor-connector".to_string(),
            volume_name: "harbor-connector-data".to_string(),
            control_port: DEFAULT_CONTROL_PORT,
            pairing_port: DEFAULT_PAIRING_PORT,
            tunnel_port: DEFAULT_TUNNEL_PORT,
            docker_socket: "/var/run/docker.sock".to_string(),
            hostname: "localhost".to_string(),
            exec_oom_retries: 3,
        }
    }
}

/// Top-level engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Root of the key store
    pub data_dir: PathBuf,
    /// Namespace for identities and pins (one engine may serve several)
    pub context: String,
    /// Fixed instance UUID; generated and persisted when absent
    pub instance_id: Option<Uuid>,
    /// Delete every container of a daemon the first time it is seen
    pub reset_on_first_contact: bool,
    pub pairing_timeout_secs: u64,
    pub rpc_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub connector: ConnectorConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("harbor-data"),
            context: "default".to_string(),
            instance_id: None,
            reset_on_first_contact: false,
            pairing_timeout_secs: 300,
            rpc_timeout_secs: 30,
            connect_timeout_secs: 10,
            connector: ConnectorConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Read a JSON config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// File (if it exists) + process environment, validated
    pub fn resolve(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) if p.exists() => {
                info!("Loading config from {}", p.display());
                Self::load(p)?
            }
            _ => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `HARBOR_*` overrides using `lookup` to read variables
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup(ENV_DATA_DIR) {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(context) = lookup(ENV_CONTEXT) {
            self.context = context;
        }
        if let Some(flag) = lookup(ENV_RESET_ON_FIRST_CONTACT) {
            self.reset_on_first_contact = match flag.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" | "" => false,
                other => {
                    return Err(ConfigError::Invalid(format!(
                        "{} must be a boolean, got '{}'",
                        ENV_RESET_ON_FIRST_CONTACT, other
                    )))
                }
            };
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_context(&self.context).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        if self.pairing_timeout_secs == 0 || self.rpc_timeout_secs == 0 || self.connect_timeout_secs == 0
        {
            return Err(ConfigError::Invalid("timeouts must be non-zero".into()));
        }
        self.local_host()
            .validate()
            .map_err(|e| ConfigError::Invalid(format!("connector: {}", e)))?;
        if self.connector.image.is_empty() || self.connector.container_name.is_empty() {
            return Err(ConfigError::Invalid(
                "connector image and container name are required".into(),
            ));
        }
        Ok(())
    }

    pub fn pairing_timeout(&self) -> Duration {
        Duration::from_secs(self.pairing_timeout_secs)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Descriptor of the connector on the local Docker daemon
    pub fn local_host(&self) -> RemoteHostDescriptor {
        let c = &self.connector;
        RemoteHostDescriptor::new(c.hostname.clone(), "local").with_ports(
            c.control_port,
            c.pairing_port,
            c.tunnel_port,
        )
    }
}
