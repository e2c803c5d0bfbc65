//! Port-forward registry: local listeners relaying to a remote endpoint

use crate::error::ForwardError;
use async_trait::async_trait;
use backhaul_proto::message::PortfwdInfo;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Byte stream returned by a bridge
pub trait BridgeIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> BridgeIo for T {}

/// Boxed bridge stream
pub type BridgeStream = Box<dyn BridgeIo>;

/// Reaches a named remote endpoint on behalf of accepted local connections
#[async_trait]
pub trait TunnelBridge: Send + Sync {
    /// Open a byte stream to `remote_addr`
    async fn open(&self, remote_addr: &str) -> io::Result<BridgeStream>;

    /// Resolves when the bridge can no longer open streams
    async fn closed(&self) {
        std::future::pending::<()>().await
    }
}

/// Bridge that dials the remote address directly from the agent's host
#[derive(Debug, Default, Clone)]
pub struct DirectBridge;

#[async_trait]
impl TunnelBridge for DirectBridge {
    async fn open(&self, remote_addr: &str) -> io::Result<BridgeStream> {
        let stream = TcpStream::connect(remote_addr).await?;
        Ok(Box::new(stream))
    }
}

/// Who started a forward
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardOwner {
    /// Owning session
    pub session_id: Uuid,
    /// Agent process id
    pub pid: u32,
}

impl ForwardOwner {
    /// Owner for a session in this process
    pub fn session(session_id: Uuid) -> Self {
        Self {
            session_id,
            pid: std::process::id(),
        }
    }
}

struct PortForward {
    info: PortfwdInfo,
    session_id: Uuid,
    generation: u64,
    relay: JoinHandle<()>,
}

type Entries = Arc<Mutex<HashMap<u16, PortForward>>>;

/// Registry of active forwards keyed by bind port.
///
/// At most one entry exists per bind port. A relay that ends on its own
/// removes its entry.
#[derive(Default)]
pub struct PortForwardRegistry {
    entries: Entries,
    generation: AtomicU64,
}

impl PortForwardRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `bind_addr` and relay every accepted connection to `remote_addr`
    /// through `bridge`.
    pub async fn start(
        &self,
        bind_addr: &str,
        remote_addr: &str,
        owner: ForwardOwner,
        bridge: Arc<dyn TunnelBridge>,
    ) -> Result<PortfwdInfo, ForwardError> {
        let requested = resolve(bind_addr).await?;

        // Held across bind so the port check and the insert are atomic.
        let mut entries = self.entries.lock().await;
        if requested.port() != 0 && entries.contains_key(&requested.port()) {
            return Err(ForwardError::PortInUse(requested.port()));
        }

        let listener = TcpListener::bind(requested).await?;
        let local = listener.local_addr()?;
        let bind_port = local.port();
        if entries.contains_key(&bind_port) {
            return Err(ForwardError::PortInUse(bind_port));
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let relay = tokio::spawn(relay(
            listener,
            remote_addr.to_string(),
            bridge,
            Arc::clone(&self.entries),
            bind_port,
            generation,
        ));

        let info = PortfwdInfo {
            bind_port,
            bind_addr: local.to_string(),
            remote_addr: remote_addr.to_string(),
            session_id: owner.session_id.to_string(),
            pid: owner.pid,
        };
        entries.insert(
            bind_port,
            PortForward {
                info: info.clone(),
                session_id: owner.session_id,
                generation,
                relay,
            },
        );
        info!("Forwarding {} -> {}", info.bind_addr, info.remote_addr);
        Ok(info)
    }

    /// Close the forward on `bind_port`
    pub async fn stop(&self, bind_port: u16) -> Result<PortfwdInfo, ForwardError> {
        let forward = self
            .entries
            .lock()
            .await
            .remove(&bind_port)
            .ok_or(ForwardError::NotFound(bind_port))?;
        forward.relay.abort();
        info!("Stopped forward on port {}", bind_port);
        Ok(forward.info)
    }

    /// Close every forward started by `session_id`
    pub async fn stop_session(&self, session_id: Uuid) -> Vec<PortfwdInfo> {
        let mut entries = self.entries.lock().await;
        let ports: Vec<u16> = entries
            .iter()
            .filter(|(_, forward)| forward.session_id == session_id)
            .map(|(port, _)| *port)
            .collect();

        let mut stopped = Vec::with_capacity(ports.len());
        for port in ports {
            if let Some(forward) = entries.remove(&port) {
                forward.relay.abort();
                stopped.push(forward.info);
            }
        }
        if !stopped.is_empty() {
            info!("Stopped {} forward(s) owned by session {}", stopped.len(), session_id);
        }
        stopped
    }

    /// Active forwards, by bind port
    pub async fn list(&self) -> Vec<PortfwdInfo> {
        let entries = self.entries.lock().await;
        let mut forwards: Vec<PortfwdInfo> = entries.values().map(|f| f.info.clone()).collect();
        forwards.sort_by_key(|info| info.bind_port);
        forwards
    }

    /// Whether a forward owns `bind_port`
    pub async fn contains(&self, bind_port: u16) -> bool {
        self.entries.lock().await.contains_key(&bind_port)
    }

    /// Number of active forwards
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Whether no forward is active
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

async fn resolve(bind_addr: &str) -> Result<SocketAddr, ForwardError> {
    if let Ok(addr) = bind_addr.parse() {
        return Ok(addr);
    }
    tokio::net::lookup_host(bind_addr)
        .await
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| ForwardError::InvalidAddress(bind_addr.to_string()))
}

async fn relay(
    listener: TcpListener,
    remote_addr: String,
    bridge: Arc<dyn TunnelBridge>,
    entries: Entries,
    bind_port: u16,
    generation: u64,
) {
    // Dropped with the relay, which aborts in-flight connections.
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!("Accepted {} on port {}", peer, bind_port);
                    connections.spawn(relay_connection(stream, peer, remote_addr.clone(), Arc::clone(&bridge)));
                }
                Err(e) => {
                    warn!("Listener on port {} failed: {}", bind_port, e);
                    break;
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            _ = bridge.closed() => {
                info!("Bridge for port {} closed", bind_port);
                break;
            }
        }
    }

    let mut entries = entries.lock().await;
    if entries.get(&bind_port).map(|f| f.generation) == Some(generation) {
        entries.remove(&bind_port);
        debug!("Removed forward on port {}", bind_port);
    }
}

async fn relay_connection(
    mut local: TcpStream,
    peer: SocketAddr,
    remote_addr: String,
    bridge: Arc<dyn TunnelBridge>,
) {
    let mut remote = match bridge.open(&remote_addr).await {
        Ok(remote) => remote,
        Err(e) => {
            warn!("Failed to reach {} for {}: {}", remote_addr, peer, e);
            return;
        }
    };
    match tokio::io::copy_bidirectional(&mut local, &mut remote).await {
        Ok((up, down)) => debug!("Relay {} <-> {} done ({} up, {} down)", peer, remote_addr, up, down),
        Err(e) => debug!("Relay {} <-> {} ended: {}", peer, remote_addr, e),
    }
}
