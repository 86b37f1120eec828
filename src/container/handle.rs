//! Container handle: lifecycle calls and tunnels for one remote container

use super::tunnel::TunnelListener;
use crate::daemon::{DaemonError, DaemonHandle, DaemonRegistry};
use crate::rpc::{ContainerState, ExecOutcome};
use log::{debug, info};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    #[error(transparent)]
    Daemon(#[from] DaemonError),

    #[error("container {0} has no owning daemon")]
    Orphaned(String),

    #[error("container {0} has been destroyed")]
    Destroyed(String),

    #[error("cannot open tunnel to {container}:{port}: {source}")]
    Listen {
        container: String,
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("no container {0}")]
    NotFound(String),

    #[error("container name {0} is already in use")]
    DuplicateName(String),

    #[error("container registry is shut down")]
    ShutDown,
}

/// A container living on a remote daemon
pub struct ContainerHandle {
    remote_id: String,
    name: String,
    owner: Uuid,
    daemons: Arc<DaemonRegistry>,
    tunnels: Mutex<HashMap<u16, TunnelListener>>,
    teardown: CancellationToken,
    destroyed: AtomicBool,
}

impl ContainerHandle {
    pub fn new(
        remote_id: impl Into<String>,
        name: impl Into<String>,
        owner: Uuid,
        daemons: Arc<DaemonRegistry>,
    ) -> Self {
        Self {
            remote_id: remote_id.into(),
            name: name.into(),
            owner,
            daemons,
            tunnels: Mutex::new(HashMap::new()),
            teardown: CancellationToken::new(),
            destroyed: AtomicBool::new(false),
        }
    }

    pub fn remote_id(&self) -> &str {
        &self.remote_id
    }

    /// Logical name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Id of the owning daemon handle
    pub fn owner_id(&self) -> Uuid {
        self.owner
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Owning daemon, if it is still registered
    pub fn owner(&self) -> Result<Arc<DaemonHandle>, ContainerError> {
        if self.is_destroyed() {
            return Err(ContainerError::Destroyed(self.name.clone()));
        }
        self.daemons
            .get(self.owner)
            .ok_or_else(|| ContainerError::Orphaned(self.name.clone()))
    }

    pub async fn start(&self) -> Result<(), ContainerError> {
        Ok(self.owner()?.start_container(&self.remote_id).await?)
    }

    pub async fn stop(&self) -> Result<(), ContainerError> {
        Ok(self.owner()?.stop_container(&self.remote_id).await?)
    }

    pub async fn state(&self) -> Result<ContainerState, ContainerError> {
        Ok(self.owner()?.container_status(&self.remote_id).await?)
    }

    pub async fn execute(&self, command: &[String]) -> Result<ExecOutcome, ContainerError> {
        Ok(self.owner()?.exec(&self.remote_id, command).await?)
    }

    /// containerPort -> hostPort on the remote host
    pub async fn ports(&self) -> Result<HashMap<u16, u16>, ContainerError> {
        let mut mappings = self
            .owner()?
            .port_mappings(std::slice::from_ref(&self.remote_id))
            .await?;
        Ok(mappings.remove(&self.remote_id).unwrap_or_default())
    }

    /// Delete the remote container and close every tunnel
    pub async fn destroy(&self) -> Result<(), ContainerError> {
        let owner = self.owner()?;
        owner.destroy_container(&self.remote_id).await?;
        self.destroyed.store(true, Ordering::SeqCst);
        self.close_tunnels().await;
        info!("Destroyed container {} ({})", self.name, self.remote_id);
        Ok(())
    }

    /// Local loopback address forwarding to `port` inside the container.
    ///
    /// The listener is created on first use and reused afterwards.
    pub async fn open_tunnel(&self, port: u16) -> Result<SocketAddr, ContainerError> {
        let mut tunnels = self.tunnels.lock().await;
        if let Some(existing) = tunnels.get(&port) {
            return Ok(existing.local_addr());
        }
        let owner = self.owner()?;
        if self.teardown.is_cancelled() {
            return Err(ContainerError::Destroyed(self.name.clone()));
        }
        let endpoint = owner.tunnel_endpoint()?;
        let listener = TunnelListener::bind(endpoint, &self.remote_id, port, &self.teardown)
            .await
            .map_err(|source| ContainerError::Listen {
                container: self.name.clone(),
                port,
                source,
            })?;
        let addr = listener.local_addr();
        tunnels.insert(port, listener);
        Ok(addr)
    }

    /// Close the tunnel for one port. Returns whether one was open.
    pub async fn close_tunnel(&self, port: u16) -> bool {
        let listener = self.tunnels.lock().await.remove(&port);
        match listener {
            Some(listener) => {
                listener.close().await;
                true
            }
            None => false,
        }
    }

    /// Ports with an open tunnel, ascending
    pub async fn tunnel_ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.tunnels.lock().await.keys().copied().collect();
        ports.sort_unstable();
        ports
    }

    pub async fn close_tunnels(&self) {
        self.teardown.cancel();
        let drained: Vec<_> = self.tunnels.lock().await.drain().map(|(_, l)| l).collect();
        for listener in drained {
            debug!("Closing tunnel {} for {}", listener.local_addr(), self.name);
            listener.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::{DaemonSettings, SeenDaemons};
    use crate::identity::KeyStore;
    use crate::rpc::ContainerSpec;
    use crate::testing::{MockDaemon, MockOptions};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpStream;

    struct Fixture {
        _dir: TempDir,
        daemon: MockDaemon,
        daemons: Arc<DaemonRegistry>,
        owner: Arc<DaemonHandle>,
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let daemon = MockDaemon::start(MockOptions::default()).await;
        let keystore = Arc::new(KeyStore::open(dir.path(), None).unwrap());
        keystore
            .save_pinned_certificate("test", "127.0.0.1", daemon.identity().certificate())
            .unwrap();
        let settings = DaemonSettings {
            keystore,
            context: "test".into(),
            reset_on_first_contact: false,
            connect_timeout: Duration::from_secs(5),
            rpc_timeout: Duration::from_secs(5),
        };
        let daemons = Arc::new(DaemonRegistry::init(settings, Arc::new(SeenDaemons::new())));
        let owner = daemons.register(daemon.host("mock")).unwrap();
        Fixture {
            _dir: dir,
            daemon,
            daemons,
            owner,
        }
    }

    async fn created(f: &Fixture, name: &str) -> ContainerHandle {
        let id = f
            .owner
            .create_container(ContainerSpec {
                name: name.into(),
                image: "postgres:16".into(),
                ports: vec![5432],
                ..ContainerSpec::default()
            })
            .await
            .unwrap();
        ContainerHandle::new(id, name, f.owner.id(), Arc::clone(&f.daemons))
    }

    /// Connect through the tunnel and consume the echoed header line
    async fn tunnel_client(addr: SocketAddr) -> (BufReader<TcpStream>, String) {
        let mut stream = BufReader::new(TcpStream::connect(addr).await.unwrap());
        let mut header = String::new();
        stream.read_line(&mut header).await.unwrap();
        (stream, header)
    }

    async fn roundtrip(stream: &mut BufReader<TcpStream>, payload: &[u8]) -> Vec<u8> {
        stream.get_mut().write_all(payload).await.unwrap();
        let mut echoed = vec![0u8; payload.len()];
        stream.read_exact(&mut echoed).await.unwrap();
        echoed
    }

    #[tokio::test]
    async fn test_lifecycle_delegates_to_daemon() {
        let f = fixture().await;
        let container = created(&f, "pg").await;

        container.start().await.unwrap();
        assert_eq!(container.state().await.unwrap(), ContainerState::Running);
        let outcome = container.execute(&["false".to_string()]).await.unwrap();
        assert_eq!(outcome.exit_code, 1);
        assert!(container.ports().await.unwrap().contains_key(&5432));
        container.stop().await.unwrap();
        assert_eq!(container.state().await.unwrap(), ContainerState::Exited);
    }

    #[tokio::test]
    async fn test_tunnel_is_memoized_per_port() {
        let f = fixture().await;
        let container = created(&f, "pg").await;

        let a = container.open_tunnel(5432).await.unwrap();
        let b = container.open_tunnel(5432).await.unwrap();
        let c = container.open_tunnel(8080).await.unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.ip().is_loopback());
        assert_eq!(container.tunnel_ports().await, vec![5432, 8080]);

        assert!(container.close_tunnel(8080).await);
        assert!(!container.close_tunnel(8080).await);
        assert!(TcpStream::connect(c).await.is_err());
    }

    #[tokio::test]
    async fn test_tunnel_fan_out() {
        let f = fixture().await;
        let container = created(&f, "pg").await;
        let addr = container.open_tunnel(5432).await.unwrap();
        let expected = format!("{}:5432", container.remote_id());

        let mut clients = Vec::new();
        for _ in 0..3 {
            let (stream, header) = tunnel_client(addr).await;
            assert_eq!(header.trim_end(), expected);
            clients.push(stream);
        }
        assert_eq!(f.daemon.tunnel_headers(), vec![expected.clone(); 3]);

        for (i, client) in clients.iter_mut().enumerate() {
            let payload = format!("hello from {}", i);
            assert_eq!(roundtrip(client, payload.as_bytes()).await, payload.as_bytes());
        }

        // Dropping one connection leaves the others working
        drop(clients.remove(0));
        for client in clients.iter_mut() {
            assert_eq!(roundtrip(client, b"still here").await, b"still here");
        }
    }

    #[tokio::test]
    async fn test_destroy_closes_tunnels() {
        let f = fixture().await;
        let container = created(&f, "pg").await;
        let addr = container.open_tunnel(5432).await.unwrap();
        let (mut client, _) = tunnel_client(addr).await;
        assert_eq!(roundtrip(&mut client, b"ping").await, b"ping");

        container.destroy().await.unwrap();
        assert!(container.is_destroyed());
        assert!(f.daemon.container_ids().is_empty());
        assert!(container.tunnel_ports().await.is_empty());
        assert!(TcpStream::connect(addr).await.is_err());

        // The in-flight pipe is cut as well
        let mut rest = Vec::new();
        let read = client.read_to_end(&mut rest).await;
        assert!(read.is_err() || rest.is_empty());

        assert!(matches!(container.start().await, Err(ContainerError::Destroyed(_))));
    }

    #[tokio::test]
    async fn test_closed_tunnel_ends_remote_stream_cleanly() {
        let f = fixture().await;
        let container = created(&f, "pg").await;
        let addr = container.open_tunnel(5432).await.unwrap();
        let (mut client, _) = tunnel_client(addr).await;
        assert_eq!(roundtrip(&mut client, b"ping").await, b"ping");

        // The local client stays connected, so only teardown ends the pipe
        assert!(container.close_tunnel(5432).await);
        let endings = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let endings = f.daemon.tunnel_endings();
                if !endings.is_empty() {
                    return endings;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(endings, vec![true]);
        drop(client);
    }

    #[tokio::test]
    async fn test_orphaned_after_daemon_removed() {
        let f = fixture().await;
        let container = created(&f, "pg").await;
        f.daemons.remove(f.owner.id()).await.unwrap();
        assert!(matches!(container.start().await, Err(ContainerError::Orphaned(_))));
    }
}
