//! Remote host descriptors

use crate::identity::validate_host;
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONTROL_PORT: u16 = 7451;
pub const DEFAULT_PAIRING_PORT: u16 = 7452;
pub const DEFAULT_TUNNEL_PORT: u16 = 7453;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HostError {
    #[error("invalid hostname '{0}'")]
    Hostname(String),

    #[error("invalid alias '{0}': use letters, digits, '-' or '_'")]
    Alias(String),

    #[error("ports for {0} must be non-zero and distinct")]
    Ports(String),
}

/// Where a remote daemon lives and how to reach its three ports
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteHostDescriptor {
    /// Unique key of the host
    pub hostname: String,
    /// Operator-facing name, also unique
    pub alias: String,
    /// Prepended to image references created on this host
    #[serde(default)]
    pub registry_prefix: String,
    pub control_port: u16,
    pub pairing_port: u16,
    pub tunnel_port: u16,
}

impl RemoteHostDescriptor {
    /// Descriptor with the default connector ports
    pub fn new(hostname: impl Into<String>, alias: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            alias: alias.into(),
            registry_prefix: String::new(),
            control_port: DEFAULT_CONTROL_PORT,
            pairing_port: DEFAULT_PAIRING_PORT,
            tunnel_port: DEFAULT_TUNNEL_PORT,
        }
    }

    pub fn with_ports(mut self, control: u16, pairing: u16, tunnel: u16) -> Self {
        self.control_port = control;
        self.pairing_port = pairing;
        self.tunnel_port = tunnel;
        self
    }

    pub fn with_registry_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.registry_prefix = prefix.into();
        self
    }

    pub fn validate(&self) -> Result<(), HostError> {
        validate_host(&self.hostname).map_err(|_| HostError::Hostname(self.hostname.clone()))?;

        let alias_ok = !self.alias.is_empty()
            && self.alias.len() <= 64
            && self
                .alias
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !alias_ok {
            return Err(HostError::Alias(self.alias.clone()));
        }

        let ports = [self.control_port, self.pairing_port, self.tunnel_port];
        let distinct = ports[0] != ports[1] && ports[1] != ports[2] && ports[0] != ports[2];
        if ports.contains(&0) || !distinct {
            return Err(HostError::Ports(self.hostname.clone()));
        }
        Ok(())
    }

    /// Qualify `image` with this host's registry prefix
    pub fn resolve_image(&self, image: &str) -> String {
        let prefix = self.registry_prefix.trim_end_matches('/');
        if prefix.is_empty() || image.starts_with(&format!("{}/", prefix)) {
            image.to_string()
        } else {
            format!("{}/{}", prefix, image)
        }
    }
}
