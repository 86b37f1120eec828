//! Pairing handshake: PSK-authenticated trust-on-first-use
//!
//! The engine mints a random PSK and shows the operator a parameter string
//! to paste into the remote connector. The remote then proves knowledge of
//! the PSK by sending an HMAC over the TLS channel binding and both
//! certificates, which ties the proof to this exact connection.

use crate::channel::{received_alert, ChannelConnector, ChannelError, UnverifiedChannel};
use crate::host::HostError;
use crate::identity::{fingerprint, short_fingerprint, KeyStoreError};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use log::{debug, info, warn};
use rand::rngs::OsRng;
use rand::RngCore;
use rustls::pki_types::CertificateDer;
use rustls::AlertDescription;
use sha2::Sha256;
use std::io;
use std::time::Duration;
use subtle::ConstantTimeEq;
use tokio::io::AsyncReadExt;
use tokio::time::timeout;
use uuid::Uuid;

/// Bumped whenever the parameter string or MAC input layout changes
pub const PAIRING_VERSION: u8 = 1;

pub const PSK_LEN: usize = 32;
pub const AUTH_VALUE_LEN: usize = 32;

pub type Psk = [u8; PSK_LEN];

#[derive(Debug, thiserror::Error)]
pub enum PairingError {
    #[error("listener unreachable at {addr}: {detail}")]
    Unreachable { addr: String, detail: String },

    #[error("wrong pasted command: the remote connector does not recognise our certificate")]
    WrongPastedCommand,

    #[error("server rejected our certificate ({0:?})")]
    CertificateRejected(AlertDescription),

    #[error("authentication value mismatch: wrong pre-shared key or active interference")]
    AuthenticationFailed,

    #[error("pairing with {0} was cancelled")]
    Cancelled(String),

    #[error("pairing with {0} stopped before completing: {1}")]
    Stopped(String, String),

    #[error("no pairing session for {0}")]
    NoSession(String),

    #[error(transparent)]
    InvalidHost(#[from] HostError),

    #[error("cannot persist pinned certificate: {0}")]
    Store(#[from] KeyStoreError),
}

impl PairingError {
    /// Whether another attempt with the same PSK may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PairingError::Unreachable { .. } | PairingError::CertificateRejected(_)
        )
    }

    fn from_alert(alert: AlertDescription) -> Option<Self> {
        match alert {
            AlertDescription::BadCertificate => Some(PairingError::WrongPastedCommand),
            AlertDescription::UnsupportedCertificate
            | AlertDescription::CertificateRevoked
            | AlertDescription::CertificateExpired
            | AlertDescription::CertificateUnknown
            | AlertDescription::CertificateRequired
            | AlertDescription::UnknownCA
            | AlertDescription::AccessDenied => Some(PairingError::CertificateRejected(alert)),
            _ => None,
        }
    }

    fn from_channel(err: ChannelError, addr: &str) -> Self {
        if let Some(e) = err.peer_alert().and_then(Self::from_alert) {
            return e;
        }
        PairingError::Unreachable {
            addr: addr.to_string(),
            detail: err.to_string(),
        }
    }

    fn from_read(err: io::Error, addr: &str) -> Self {
        if let Some(e) = received_alert(&err).and_then(Self::from_alert) {
            return e;
        }
        let detail = if err.kind() == io::ErrorKind::UnexpectedEof {
            "connection closed before the authentication value arrived".to_string()
        } else {
            err.to_string()
        };
        PairingError::Unreachable {
            addr: addr.to_string(),
            detail,
        }
    }
}

/// `"<version>,<b64 sha256(cert)>,<b64 psk>,<b64 uuid>"`
pub fn handshake_params(client_cert: &[u8], psk: &Psk, instance_id: Uuid) -> String {
    format!(
        "{},{},{},{}",
        PAIRING_VERSION,
        B64.encode(fingerprint(client_cert)),
        B64.encode(psk),
        B64.encode(instance_id.as_bytes())
    )
}

/// HMAC-SHA256 over the version byte and the length-prefixed fields
pub fn compute_auth_value(
    psk: &Psk,
    instance_id: Uuid,
    channel_binding: &[u8],
    server_cert: &[u8],
    client_cert: &[u8],
) -> [u8; AUTH_VALUE_LEN] {
    let mut mac =
        <Hmac<Sha256> as Mac>::new_from_slice(psk).expect("HMAC accepts keys of any length");
    mac.update(&[PAIRING_VERSION]);
    let fields: [&[u8]; 4] = [
        instance_id.as_bytes(),
        channel_binding,
        server_cert,
        client_cert,
    ];
    for field in fields {
        mac.update(&(field.len() as u32).to_le_bytes());
        mac.update(field);
    }
    mac.finalize().into_bytes().into()
}

/// Connects to one remote pairing listener with one PSK
pub struct PairingClient {
    connector: ChannelConnector,
    host: String,
    port: u16,
    psk: Psk,
    read_timeout: Duration,
}

impl PairingClient {
    /// Client with a freshly generated PSK
    pub fn new(connector: ChannelConnector, host: impl Into<String>, port: u16) -> Self {
        let mut psk = [0u8; PSK_LEN];
        OsRng.fill_bytes(&mut psk);
        Self::with_psk(connector, host, port, psk)
    }

    pub fn with_psk(connector: ChannelConnector, host: impl Into<String>, port: u16, psk: Psk) -> Self {
        Self {
            connector,
            host: host.into(),
            port,
            psk,
            read_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    pub fn connector(&self) -> &ChannelConnector {
        &self.connector
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Parameter string for the operator to paste on the remote side
    pub fn handshake_params(&self) -> String {
        let identity = self.connector.identity();
        handshake_params(identity.certificate(), &self.psk, identity.instance_id())
    }

    /// Open the unverified channel to the pairing port
    pub async fn connect(&self) -> Result<UnverifiedChannel, PairingError> {
        let addr = self.addr();
        debug!("Pairing attempt against {}", addr);
        self.connector
            .connect_unverified(&self.host, self.port)
            .await
            .map_err(|e| PairingError::from_channel(e, &addr))
    }

    /// Read the remote's authentication value and check it.
    ///
    /// Returns the server certificate to pin on success.
    pub async fn authenticate(
        &self,
        mut channel: UnverifiedChannel,
    ) -> Result<CertificateDer<'static>, PairingError> {
        let addr = self.addr();
        let mut received = [0u8; AUTH_VALUE_LEN];
        match timeout(
            self.read_timeout,
            channel.insecure_stream().read_exact(&mut received),
        )
        .await
        {
            Err(_) => {
                return Err(PairingError::Unreachable {
                    addr,
                    detail: "timed out waiting for the authentication value".into(),
                })
            }
            Ok(Err(e)) => return Err(PairingError::from_read(e, &addr)),
            Ok(Ok(_)) => {}
        }

        let identity = self.connector.identity();
        let expected = compute_auth_value(
            &self.psk,
            identity.instance_id(),
            &channel.channel_binding(),
            channel.server_certificate(),
            identity.certificate(),
        );
        let server_certificate = channel.server_certificate().clone();
        if let Err(e) = channel.close().await {
            debug!("Closing pairing channel to {}: {}", addr, e);
        }

        if bool::from(expected.ct_eq(&received)) {
            info!(
                "Pairing with {} authenticated server certificate {}",
                addr,
                short_fingerprint(&server_certificate)
            );
            Ok(server_certificate)
        } else {
            warn!("Pairing with {} failed: authentication value mismatch", addr);
            Err(PairingError::AuthenticationFailed)
        }
    }

    /// One full attempt: connect, then authenticate
    pub async fn attempt(&self) -> Result<CertificateDer<'static>, PairingError> {
        let channel = self.connect().await?;
        self.authenticate(channel).await
    }
}
