//! In-process stand-in for a remote connector.
//!
//! Serves the pairing, control and tunnel ports on loopback with real
//! TLS 1.3, so tests exercise the same code paths as production.

use crate::channel::{CHANNEL_BINDING_LABEL, CHANNEL_BINDING_LEN};
use crate::host::RemoteHostDescriptor;
use crate::identity::Identity;
use crate::pairing::{compute_auth_value, Psk, PSK_LEN};
use crate::rpc::{
    ContainerState, ContainerSummary, ExecOutcome, OpResult, Operation, PortMappings, RpcRequest,
    RpcResponse, CONTROL_PROTOCOL_VERSION,
};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use rustls::client::danger::HandshakeSignatureValid;
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{CertificateError, DigitallySignedStruct, DistinguishedName, ServerConfig, SignatureScheme};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// How a test server treats client certificates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ClientPolicy {
    AcceptAny,
    /// Fail verification so the client receives `bad_certificate`
    Reject,
}

#[derive(Debug)]
struct TestClientVerifier {
    policy: ClientPolicy,
    algorithms: WebPkiSupportedAlgorithms,
}

impl ClientCertVerifier for TestClientVerifier {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        match self.policy {
            ClientPolicy::AcceptAny => Ok(ClientCertVerified::assertion()),
            ClientPolicy::Reject => Err(rustls::Error::InvalidCertificate(
                CertificateError::BadEncoding,
            )),
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// TLS 1.3 acceptor presenting `identity` and requiring a client certificate
pub(crate) fn test_acceptor(identity: &Identity, policy: ClientPolicy) -> TlsAcceptor {
    let provider = rustls::crypto::ring::default_provider();
    let verifier = Arc::new(TestClientVerifier {
        policy,
        algorithms: provider.signature_verification_algorithms,
    });
    let config = ServerConfig::builder_with_provider(Arc::new(provider))
        .with_protocol_versions(&[&rustls::version::TLS13])
        .unwrap()
        .with_client_cert_verifier(verifier)
        .with_single_cert(vec![identity.certificate().clone()], identity.private_key())
        .unwrap();
    TlsAcceptor::from(Arc::new(config))
}

/// Channel binding as seen from the server end
pub(crate) fn server_binding(
    tls: &tokio_rustls::server::TlsStream<TcpStream>,
) -> [u8; CHANNEL_BINDING_LEN] {
    tls.get_ref()
        .1
        .export_keying_material([0u8; CHANNEL_BINDING_LEN], CHANNEL_BINDING_LABEL, None)
        .unwrap()
}

/// Split a handshake parameter string into PSK and instance id
pub(crate) fn parse_params(params: &str) -> (Psk, Uuid) {
    let fields: Vec<&str> = params.split(',').collect();
    assert_eq!(fields.len(), 4, "malformed params {}", params);
    let psk_bytes = B64.decode(fields[2]).unwrap();
    let mut psk = [0u8; PSK_LEN];
    psk.copy_from_slice(&psk_bytes);
    let instance = Uuid::from_slice(&B64.decode(fields[3]).unwrap()).unwrap();
    (psk, instance)
}

#[derive(Clone)]
pub(crate) struct MockOptions {
    pub identity: Option<Identity>,
    /// PSK and engine instance id the pairing listener answers for
    pub pairing: Option<(Psk, Uuid)>,
    pub flip_auth_bit: bool,
    pub reject_clients: bool,
    pub daemon_id: Uuid,
    pub protocol_version: u32,
}

impl Default for MockOptions {
    fn default() -> Self {
        Self {
            identity: None,
            pairing: None,
            flip_auth_bit: false,
            reject_clients: false,
            daemon_id: Uuid::new_v4(),
            protocol_version: CONTROL_PROTOCOL_VERSION,
        }
    }
}

impl MockOptions {
    pub fn pairing(psk: Psk, instance: Uuid) -> Self {
        Self {
            pairing: Some((psk, instance)),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct MockContainer {
    pub name: String,
    pub image: String,
    pub state: ContainerState,
    pub ports: HashMap<u16, u16>,
}

#[derive(Default)]
struct MockState {
    pairing: Option<(Psk, Uuid)>,
    flip_auth_bit: bool,
    containers: BTreeMap<String, MockContainer>,
    volumes: BTreeSet<String>,
    next_container: u16,
    pairing_connections: usize,
    control_connections: usize,
    tunnel_headers: Vec<String>,
    /// One entry per finished tunnel: whether the client sent close_notify
    tunnel_endings: Vec<bool>,
    requests: Vec<String>,
    mismatch_next_id: bool,
    kick: CancellationToken,
}

struct Shared {
    identity: Identity,
    daemon_id: Uuid,
    protocol_version: u32,
    state: Mutex<MockState>,
}

/// A fake remote connector on three loopback ports
pub(crate) struct MockDaemon {
    shared: Arc<Shared>,
    pairing_port: u16,
    control_port: u16,
    tunnel_port: u16,
    shutdown: CancellationToken,
}

impl MockDaemon {
    pub async fn start(options: MockOptions) -> Self {
        let identity = options
            .identity
            .clone()
            .unwrap_or_else(|| Identity::generate(Uuid::new_v4()).unwrap());
        let shared = Arc::new(Shared {
            identity: identity.clone(),
            daemon_id: options.daemon_id,
            protocol_version: options.protocol_version,
            state: Mutex::new(MockState {
                pairing: options.pairing,
                flip_auth_bit: options.flip_auth_bit,
                ..MockState::default()
            }),
        });
        let pairing_policy = if options.reject_clients {
            ClientPolicy::Reject
        } else {
            ClientPolicy::AcceptAny
        };
        let shutdown = CancellationToken::new();

        let pairing_port = spawn_listener(
            test_acceptor(&identity, pairing_policy),
            Arc::clone(&shared),
            shutdown.clone(),
            Service::Pairing,
        )
        .await;
        let control_port = spawn_listener(
            test_acceptor(&identity, ClientPolicy::AcceptAny),
            Arc::clone(&shared),
            shutdown.clone(),
            Service::Control,
        )
        .await;
        let tunnel_port = spawn_listener(
            test_acceptor(&identity, ClientPolicy::AcceptAny),
            Arc::clone(&shared),
            shutdown.clone(),
            Service::Tunnel,
        )
        .await;

        Self {
            shared,
            pairing_port,
            control_port,
            tunnel_port,
            shutdown,
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.shared.identity
    }

    pub fn daemon_id(&self) -> Uuid {
        self.shared.daemon_id
    }

    pub fn pairing_port(&self) -> u16 {
        self.pairing_port
    }

    pub fn control_port(&self) -> u16 {
        self.control_port
    }

    pub fn tunnel_port(&self) -> u16 {
        self.tunnel_port
    }

    /// Descriptor pointing at this daemon's ports on 127.0.0.1
    pub fn host(&self, alias: &str) -> RemoteHostDescriptor {
        RemoteHostDescriptor::new("127.0.0.1", alias).with_ports(
            self.control_port,
            self.pairing_port,
            self.tunnel_port,
        )
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.shared.state.lock().unwrap()
    }

    /// What an operator pasting the handshake command would do
    pub fn accept_params(&self, params: &str) {
        self.state().pairing = Some(parse_params(params));
    }

    pub fn set_flip_auth_bit(&self, flip: bool) {
        self.state().flip_auth_bit = flip;
    }

    pub fn pairing_connections(&self) -> usize {
        self.state().pairing_connections
    }

    pub fn control_connections(&self) -> usize {
        self.state().control_connections
    }

    pub fn tunnel_headers(&self) -> Vec<String> {
        self.state().tunnel_headers.clone()
    }

    pub fn tunnel_endings(&self) -> Vec<bool> {
        self.state().tunnel_endings.clone()
    }

    /// Operation names received on the control port, in order
    pub fn requests(&self) -> Vec<String> {
        self.state().requests.clone()
    }

    pub fn container_ids(&self) -> Vec<String> {
        self.state().containers.keys().cloned().collect()
    }

    pub fn container(&self, id: &str) -> Option<MockContainer> {
        self.state().containers.get(id).cloned()
    }

    pub fn volumes(&self) -> Vec<String> {
        self.state().volumes.iter().cloned().collect()
    }

    /// Seed a running container, as if created by someone else
    pub fn add_container(&self, name: &str) -> String {
        let mut state = self.state();
        state.next_container += 1;
        let id = format!("c{}", state.next_container);
        state.containers.insert(
            id.clone(),
            MockContainer {
                name: name.to_string(),
                image: "busybox".into(),
                state: ContainerState::Running,
                ports: HashMap::new(),
            },
        );
        id
    }

    /// Answer the next control request with a wrong id
    pub fn mismatch_next_id(&self) {
        self.state().mismatch_next_id = true;
    }

    /// Drop every open control connection
    pub fn kick_control_clients(&self) {
        let mut state = self.state();
        state.kick.cancel();
        state.kick = CancellationToken::new();
    }
}

impl Drop for MockDaemon {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[derive(Clone, Copy)]
enum Service {
    Pairing,
    Control,
    Tunnel,
}

async fn spawn_listener(
    acceptor: TlsAcceptor,
    shared: Arc<Shared>,
    shutdown: CancellationToken,
    service: Service,
) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let tcp = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((tcp, _)) => tcp,
                    Err(_) => break,
                },
            };
            let acceptor = acceptor.clone();
            let shared = Arc::clone(&shared);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = shutdown.cancelled() => {}
                    _ = serve(service, acceptor, tcp, shared) => {}
                }
            });
        }
    });
    port
}

async fn serve(service: Service, acceptor: TlsAcceptor, tcp: TcpStream, shared: Arc<Shared>) {
    match service {
        Service::Pairing => serve_pairing(acceptor, tcp, shared).await,
        Service::Control => serve_control(acceptor, tcp, shared).await,
        Service::Tunnel => serve_tunnel(acceptor, tcp, shared).await,
    }
}

async fn serve_pairing(acceptor: TlsAcceptor, tcp: TcpStream, shared: Arc<Shared>) {
    shared.state.lock().unwrap().pairing_connections += 1;
    let Ok(mut tls) = acceptor.accept(tcp).await else {
        return;
    };
    let (pairing, flip) = {
        let state = shared.state.lock().unwrap();
        (state.pairing, state.flip_auth_bit)
    };
    let Some((psk, instance)) = pairing else {
        // Not configured yet: hang up like a connector without parameters
        let _ = tls.shutdown().await;
        return;
    };
    let Some(client_cert) = tls
        .get_ref()
        .1
        .peer_certificates()
        .and_then(|chain| chain.first())
        .cloned()
    else {
        return;
    };

    let binding = server_binding(&tls);
    let mut value = compute_auth_value(
        &psk,
        instance,
        &binding,
        shared.identity.certificate(),
        &client_cert,
    );
    if flip {
        value[0] ^= 0x01;
    }
    let _ = tls.write_all(&value).await;
    let _ = tls.flush().await;
    let mut rest = [0u8; 1];
    let _ = tls.read(&mut rest).await;
}

async fn serve_control(acceptor: TlsAcceptor, tcp: TcpStream, shared: Arc<Shared>) {
    let kick = {
        let mut state = shared.state.lock().unwrap();
        state.control_connections += 1;
        state.kick.clone()
    };
    let Ok(tls) = acceptor.accept(tcp).await else {
        return;
    };
    let mut framed = Framed::new(tls, LengthDelimitedCodec::new());
    loop {
        let frame = tokio::select! {
            biased;
            _ = kick.cancelled() => break,
            frame = framed.next() => frame,
        };
        let Some(Ok(frame)) = frame else {
            break;
        };
        let Ok(request) = serde_json::from_slice::<RpcRequest>(&frame) else {
            break;
        };
        let response = shared.handle(request);
        let bytes = serde_json::to_vec(&response).unwrap();
        if framed.send(Bytes::from(bytes)).await.is_err() {
            break;
        }
    }
}

/// Reads the header line, echoes it back, then echoes every byte
async fn serve_tunnel(acceptor: TlsAcceptor, tcp: TcpStream, shared: Arc<Shared>) {
    let Ok(tls) = acceptor.accept(tcp).await else {
        return;
    };
    let mut reader = BufReader::new(tls);
    let mut header = String::new();
    if reader.read_line(&mut header).await.is_err() || !header.ends_with('\n') {
        return;
    }
    shared
        .state
        .lock()
        .unwrap()
        .tunnel_headers
        .push(header.trim_end().to_string());
    if reader.get_mut().write_all(header.as_bytes()).await.is_err() {
        return;
    }

    let (mut rx, mut tx) = tokio::io::split(reader);
    // A truncated TLS stream surfaces as UnexpectedEof
    let clean = tokio::io::copy(&mut rx, &mut tx).await.is_ok();
    shared.state.lock().unwrap().tunnel_endings.push(clean);
    let _ = tx.shutdown().await;
}

impl Shared {
    fn handle(&self, request: RpcRequest) -> RpcResponse {
        let mut state = self.state.lock().unwrap();
        state.requests.push(request.op.name().to_string());
        let id = if std::mem::take(&mut state.mismatch_next_id) {
            request.id + 100
        } else {
            request.id
        };

        let result = match request.op {
            Operation::Version { .. } => Ok(OpResult::Version {
                version: self.protocol_version,
                daemon_id: self.daemon_id,
            }),
            Operation::Ping => Ok(OpResult::Pong),
            Operation::ListContainers => Ok(OpResult::Containers {
                containers: state
                    .containers
                    .iter()
                    .map(|(id, c)| ContainerSummary {
                        id: id.clone(),
                        name: c.name.clone(),
                        image: c.image.clone(),
                        state: c.state,
                    })
                    .collect(),
            }),
            Operation::CreateContainer { spec } => {
                if state.containers.values().any(|c| c.name == spec.name) {
                    Err(format!("container name {} already in use", spec.name))
                } else {
                    state.next_container += 1;
                    let n = state.next_container;
                    let container_id = format!("c{}", n);
                    let ports = spec
                        .ports
                        .iter()
                        .enumerate()
                        .map(|(i, p)| (*p, 40000 + n * 10 + i as u16))
                        .collect();
                    state.containers.insert(
                        container_id.clone(),
                        MockContainer {
                            name: spec.name,
                            image: spec.image,
                            state: ContainerState::Created,
                            ports,
                        },
                    );
                    Ok(OpResult::Created { container_id })
                }
            }
            Operation::StartContainer { container_id } => {
                set_state(&mut state, &container_id, ContainerState::Running)
            }
            Operation::StopContainer { container_id } => {
                set_state(&mut state, &container_id, ContainerState::Exited)
            }
            Operation::DeleteContainer { container_id } => {
                match state.containers.remove(&container_id) {
                    Some(_) => Ok(OpResult::Done),
                    None => Err(format!("no such container: {}", container_id)),
                }
            }
            Operation::ContainerStatus { container_id } => match state.containers.get(&container_id)
            {
                Some(c) => Ok(OpResult::Status { state: c.state }),
                None => Err(format!("no such container: {}", container_id)),
            },
            Operation::PortMappings { container_ids } => {
                let mut mappings = PortMappings::new();
                for id in container_ids {
                    if let Some(c) = state.containers.get(&id) {
                        mappings.insert(id, c.ports.clone());
                    }
                }
                Ok(OpResult::Ports { mappings })
            }
            Operation::Exec {
                container_id,
                command,
            } => {
                if state.containers.contains_key(&container_id) {
                    let exit_code = if command.first().map(String::as_str) == Some("false") {
                        1
                    } else {
                        0
                    };
                    Ok(OpResult::Exec {
                        outcome: ExecOutcome {
                            exit_code,
                            stdout: command.join(" "),
                            stderr: String::new(),
                        },
                    })
                } else {
                    Err(format!("no such container: {}", container_id))
                }
            }
            Operation::CreateVolume { name } => {
                state.volumes.insert(name);
                Ok(OpResult::Done)
            }
            Operation::DeleteVolume { name } => {
                if state.volumes.remove(&name) {
                    Ok(OpResult::Done)
                } else {
                    Err(format!("no such volume: {}", name))
                }
            }
        };

        match result {
            Ok(result) => RpcResponse::ok(id, result),
            Err(message) => RpcResponse::err(id, message),
        }
    }
}

fn set_state(
    state: &mut MockState,
    container_id: &str,
    next: ContainerState,
) -> Result<OpResult, String> {
    match state.containers.get_mut(container_id) {
        Some(c) => {
            c.state = next;
            Ok(OpResult::Done)
        }
        None => Err(format!("no such container: {}", container_id)),
    }
}
