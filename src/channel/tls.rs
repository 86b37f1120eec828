//! TLS 1.3 client channels built on tokio-rustls

use super::verifier::{PinnedServerVerifier, UnverifiedServerVerifier};
use crate::identity::{short_fingerprint, Identity};
use log::debug;
use rustls::client::danger::ServerCertVerifier;
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::{AlertDescription, ClientConfig};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

/// Exporter label for the channel binding (RFC 9266 `tls-exporter`)
pub const CHANNEL_BINDING_LABEL: &[u8] = b"EXPORTER-Channel-Binding";

/// Length of the exported channel binding
pub const CHANNEL_BINDING_LEN: usize = 32;

/// Any bidirectional async byte stream
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// Type-erased stream, so protocol layers can run over TLS or test pipes
pub type BoxedStream = Box<dyn AsyncStream>;

/// Errors raised while establishing or using a channel
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("connection to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("connection to {0} timed out")]
    Timeout(String),

    #[error("TLS handshake with {addr} failed: {source}")]
    Handshake {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("invalid TLS configuration: {0}")]
    Config(#[from] rustls::Error),

    #[error("invalid server name '{0}'")]
    ServerName(String),

    #[error("server at {0} presented no certificate")]
    NoPeerCertificate(String),

    #[error("channel binding export failed: {0}")]
    Binding(String),
}

impl ChannelError {
    /// Alert sent by the peer, if that is what ended the handshake
    pub fn peer_alert(&self) -> Option<AlertDescription> {
        match self {
            ChannelError::Handshake { source, .. } => received_alert(source),
            _ => None,
        }
    }
}

/// Extract a TLS alert received from the peer out of an I/O error
pub fn received_alert(err: &io::Error) -> Option<AlertDescription> {
    match err.get_ref()?.downcast_ref::<rustls::Error>()? {
        rustls::Error::AlertReceived(alert) => Some(*alert),
        _ => None,
    }
}

/// Builds client channels presenting one local identity
#[derive(Debug, Clone)]
pub struct ChannelConnector {
    identity: Identity,
    connect_timeout: Duration,
}

impl ChannelConnector {
    pub fn new(identity: Identity, connect_timeout: Duration) -> Self {
        Self {
            identity,
            connect_timeout,
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Connect, accepting only the `pinned` server certificate
    pub async fn connect_pinned(
        &self,
        host: &str,
        port: u16,
        pinned: CertificateDer<'static>,
    ) -> Result<SecureChannel, ChannelError> {
        let provider = rustls::crypto::ring::default_provider();
        let verifier = Arc::new(PinnedServerVerifier::new(
            pinned,
            provider.signature_verification_algorithms,
        ));
        let config = self.client_config(provider, verifier)?;
        let stream = self.handshake(host, port, config).await?;
        Ok(SecureChannel {
            stream,
            peer: format!("{}:{}", host, port),
        })
    }

    /// Connect accepting any server certificate; pairing only
    pub async fn connect_unverified(
        &self,
        host: &str,
        port: u16,
    ) -> Result<UnverifiedChannel, ChannelError> {
        let provider = rustls::crypto::ring::default_provider();
        let verifier = Arc::new(UnverifiedServerVerifier::new(
            provider.signature_verification_algorithms,
        ));
        let config = self.client_config(provider, verifier)?;
        let stream = self.handshake(host, port, config).await?;
        let peer = format!("{}:{}", host, port);

        let (_, conn) = stream.get_ref();
        let server_certificate = conn
            .peer_certificates()
            .and_then(|chain| chain.first())
            .cloned()
            .ok_or_else(|| ChannelError::NoPeerCertificate(peer.clone()))?;
        let binding = export_binding(conn)?;
        debug!(
            "Unverified channel to {} presented certificate {}",
            peer,
            short_fingerprint(&server_certificate)
        );

        Ok(UnverifiedChannel {
            stream,
            peer,
            server_certificate,
            binding,
        })
    }

    fn client_config(
        &self,
        provider: rustls::crypto::CryptoProvider,
        verifier: Arc<dyn ServerCertVerifier>,
    ) -> Result<Arc<ClientConfig>, ChannelError> {
        let config = ClientConfig::builder_with_provider(Arc::new(provider))
            .with_protocol_versions(&[&rustls::version::TLS13])?
            .dangerous()
            .with_custom_certificate_verifier(verifier)
            .with_client_auth_cert(
                vec![self.identity.certificate().clone()],
                self.identity.private_key(),
            )?;
        Ok(Arc::new(config))
    }

    async fn handshake(
        &self,
        host: &str,
        port: u16,
        config: Arc<ClientConfig>,
    ) -> Result<TlsStream<TcpStream>, ChannelError> {
        let addr = format!("{}:{}", host, port);
        let tcp = timeout(self.connect_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| ChannelError::Timeout(addr.clone()))?
            .map_err(|source| ChannelError::Connect {
                addr: addr.clone(),
                source,
            })?;
        let _ = tcp.set_nodelay(true);

        let server_name = ServerName::try_from(host.to_string())
            .map_err(|_| ChannelError::ServerName(host.to_string()))?;
        let connector = TlsConnector::from(config);
        timeout(self.connect_timeout, connector.connect(server_name, tcp))
            .await
            .map_err(|_| ChannelError::Timeout(addr.clone()))?
            .map_err(|source| ChannelError::Handshake { addr, source })
    }
}

fn export_binding(conn: &rustls::ClientConnection) -> Result<[u8; CHANNEL_BINDING_LEN], ChannelError> {
    conn.export_keying_material([0u8; CHANNEL_BINDING_LEN], CHANNEL_BINDING_LABEL, None)
        .map_err(|e| ChannelError::Binding(e.to_string()))
}

/// A channel whose server certificate matched the pin
pub struct SecureChannel {
    stream: TlsStream<TcpStream>,
    peer: String,
}

impl SecureChannel {
    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn channel_binding(&self) -> Result<[u8; CHANNEL_BINDING_LEN], ChannelError> {
        export_binding(self.stream.get_ref().1)
    }

    /// Send close_notify and shut the socket down
    pub async fn close(mut self) -> io::Result<()> {
        self.stream.shutdown().await
    }

    pub fn boxed(self) -> BoxedStream {
        Box::new(self)
    }
}

impl AsyncRead for SecureChannel {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for SecureChannel {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().stream).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}

/// A channel to a server nobody has vouched for yet.
///
/// Offers no `AsyncRead`/`AsyncWrite` of its own; reads go through
/// [`UnverifiedChannel::insecure_stream`] so call sites make the lack of
/// trust explicit.
pub struct UnverifiedChannel {
    stream: TlsStream<TcpStream>,
    peer: String,
    server_certificate: CertificateDer<'static>,
    binding: [u8; CHANNEL_BINDING_LEN],
}

impl UnverifiedChannel {
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Raw certificate the server presented
    pub fn server_certificate(&self) -> &CertificateDer<'static> {
        &self.server_certificate
    }

    pub fn channel_binding(&self) -> [u8; CHANNEL_BINDING_LEN] {
        self.binding
    }

    pub fn insecure_stream(&mut self) -> &mut TlsStream<TcpStream> {
        &mut self.stream
    }

    pub async fn close(mut self) -> io::Result<()> {
        self.stream.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{server_binding, test_acceptor, ClientPolicy};
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;
    use uuid::Uuid;

    fn connector() -> ChannelConnector {
        let identity = Identity::generate(Uuid::new_v4()).unwrap();
        ChannelConnector::new(identity, Duration::from_secs(5))
    }

    /// Accept one connection, write the server-side binding, then echo one byte
    async fn spawn_binding_server(server: Identity) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let acceptor = test_acceptor(&server, ClientPolicy::AcceptAny);
        tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                if let Ok(mut tls) = acceptor.accept(tcp).await {
                    let binding = server_binding(&tls);
                    let _ = tls.write_all(&binding).await;
                    let _ = tls.flush().await;
                }
            }
        });
        port
    }

    #[tokio::test]
    async fn test_pinned_accepts_matching_certificate() {
        let server = Identity::generate(Uuid::new_v4()).unwrap();
        let port = spawn_binding_server(server.clone()).await;

        let mut channel = connector()
            .connect_pinned("127.0.0.1", port, server.certificate().clone())
            .await
            .unwrap();
        let mut remote_binding = [0u8; CHANNEL_BINDING_LEN];
        channel.read_exact(&mut remote_binding).await.unwrap();
        assert_eq!(channel.channel_binding().unwrap(), remote_binding);
    }

    #[tokio::test]
    async fn test_pinned_rejects_other_certificate() {
        let server = Identity::generate(Uuid::new_v4()).unwrap();
        let impostor = Identity::generate(Uuid::new_v4()).unwrap();
        let port = spawn_binding_server(server).await;

        let result = connector()
            .connect_pinned("127.0.0.1", port, impostor.certificate().clone())
            .await;
        assert!(matches!(result, Err(ChannelError::Handshake { .. })));
    }

    #[tokio::test]
    async fn test_unverified_captures_certificate_and_binding() {
        let server = Identity::generate(Uuid::new_v4()).unwrap();
        let port = spawn_binding_server(server.clone()).await;

        let mut channel = connector().connect_unverified("127.0.0.1", port).await.unwrap();
        assert_eq!(channel.server_certificate(), server.certificate());

        let mut remote_binding = [0u8; CHANNEL_BINDING_LEN];
        channel
            .insecure_stream()
            .read_exact(&mut remote_binding)
            .await
            .unwrap();
        assert_eq!(channel.channel_binding(), remote_binding);
    }

    #[tokio::test]
    async fn test_connection_refused_is_connect_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = connector().connect_unverified("127.0.0.1", port).await;
        assert!(matches!(result, Err(ChannelError::Connect { .. })));
    }

    #[test]
    fn test_received_alert_extraction() {
        let err = io::Error::new(
            io::ErrorKind::InvalidData,
            rustls::Error::AlertReceived(AlertDescription::BadCertificate),
        );
        assert_eq!(received_alert(&err), Some(AlertDescription::BadCertificate));

        let plain = io::Error::new(io::ErrorKind::ConnectionReset, "reset");
        assert_eq!(received_alert(&plain), None);
    }
}
