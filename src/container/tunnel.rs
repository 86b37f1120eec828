//! Loopback tunnels into remote containers
//!
//! Every accepted local connection gets its own pinned channel to the
//! daemon's tunnel port, announced with a `"<containerId>:<port>\n"` header.

use crate::daemon::TunnelEndpoint;
use log::{debug, info, warn};
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// Budget for sending close_notify to the daemon when a pipe ends
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// First line sent on every tunnel connection
pub fn tunnel_header(container_id: &str, port: u16) -> String {
    format!("{}:{}\n", container_id, port)
}

/// Errors that mean the peer went away, not that something broke
pub fn is_expected_close(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::NotConnected
    )
}

/// One local listener forwarding to one container port
pub struct TunnelListener {
    port: u16,
    local_addr: SocketAddr,
    cancel: CancellationToken,
    task: JoinHandle<()>,
    active: Arc<AtomicUsize>,
}

impl TunnelListener {
    /// Bind a loopback listener and start accepting
    pub(crate) async fn bind(
        endpoint: TunnelEndpoint,
        container_id: &str,
        port: u16,
        parent: &CancellationToken,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let local_addr = listener.local_addr()?;
        let cancel = parent.child_token();
        let active = Arc::new(AtomicUsize::new(0));
        let header = tunnel_header(container_id, port);
        info!(
            "Tunnel {} -> {} via {}",
            local_addr,
            header.trim_end(),
            endpoint.addr()
        );

        let task = tokio::spawn(accept_loop(
            listener,
            endpoint,
            header,
            cancel.clone(),
            Arc::clone(&active),
        ));
        Ok(Self {
            port,
            local_addr,
            cancel,
            task,
            active,
        })
    }

    /// Container port this listener forwards to
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Connections currently being piped
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Stop accepting, cut in-flight pipes, and wait for the listener to go
    pub async fn close(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!("Tunnel listener {} ended abnormally: {}", self.local_addr, e);
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    endpoint: TunnelEndpoint,
    header: String,
    cancel: CancellationToken,
    active: Arc<AtomicUsize>,
) {
    loop {
        let accepted = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let (local, peer) = match accepted {
            Ok(conn) => conn,
            Err(e) => {
                warn!("Tunnel accept on {:?} failed: {}", listener.local_addr(), e);
                continue;
            }
        };
        debug!("Tunnel {} accepted {}", header.trim_end(), peer);
        let _ = local.set_nodelay(true);
        tokio::spawn(serve_connection(
            local,
            endpoint.clone(),
            header.clone(),
            cancel.clone(),
            Arc::clone(&active),
        ));
    }
    debug!("Tunnel listener for {} stopped", header.trim_end());
}

/// Supervises one accepted connection until both directions finish
async fn serve_connection(
    local: TcpStream,
    endpoint: TunnelEndpoint,
    header: String,
    cancel: CancellationToken,
    active: Arc<AtomicUsize>,
) {
    let label = header.trim_end().to_string();
    let mut remote = match endpoint.connect().await {
        Ok(channel) => channel,
        Err(e) => {
            warn!("Tunnel {} cannot reach {}: {}", label, endpoint.addr(), e);
            return;
        }
    };
    if let Err(e) = send_header(&mut remote, &header).await {
        warn!("Tunnel {} header failed: {}", label, e);
        return;
    }

    active.fetch_add(1, Ordering::SeqCst);
    let (mut local_rx, mut local_tx) = local.into_split();
    let (mut remote_rx, mut remote_tx) = tokio::io::split(remote);
    tokio::select! {
        _ = cancel.cancelled() => debug!("Tunnel {} cut by teardown", label),
        (up, down) = pipe(&mut local_rx, &mut local_tx, &mut remote_rx, &mut remote_tx) => {
            report(&label, "upstream", up);
            report(&label, "downstream", down);
        }
    }
    match timeout(CLOSE_TIMEOUT, remote_rx.unsplit(remote_tx).close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("Tunnel {} close: {}", label, e),
        Err(_) => debug!("Tunnel {} close timed out", label),
    }
    active.fetch_sub(1, Ordering::SeqCst);
}

async fn send_header(
    remote: &mut crate::channel::SecureChannel,
    header: &str,
) -> io::Result<()> {
    remote.write_all(header.as_bytes()).await?;
    remote.flush().await
}

type RemoteRx = ReadHalf<crate::channel::SecureChannel>;
type RemoteTx = WriteHalf<crate::channel::SecureChannel>;

/// Copy both directions concurrently; each side's writer is shut once its reader ends
async fn pipe(
    local_rx: &mut OwnedReadHalf,
    local_tx: &mut OwnedWriteHalf,
    remote_rx: &mut RemoteRx,
    remote_tx: &mut RemoteTx,
) -> (io::Result<u64>, io::Result<u64>) {
    let upstream = async {
        let copied = tokio::io::copy(&mut *local_rx, &mut *remote_tx).await;
        let _ = remote_tx.shutdown().await;
        copied
    };
    let downstream = async {
        let copied = tokio::io::copy(&mut *remote_rx, &mut *local_tx).await;
        let _ = local_tx.shutdown().await;
        copied
    };
    tokio::join!(upstream, downstream)
}

fn report(label: &str, direction: &str, result: io::Result<u64>) {
    match result {
        Ok(bytes) => debug!("Tunnel {} {} done after {} bytes", label, direction, bytes),
        Err(e) if is_expected_close(&e) => {
            debug!("Tunnel {} {} closed by peer: {}", label, direction, e)
        }
        Err(e) => warn!("Tunnel {} {} failed: {}", label, direction, e),
    }
}
