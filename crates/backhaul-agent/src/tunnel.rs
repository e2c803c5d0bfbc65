//! In-band tunnels: byte streams multiplexed over the control channel

use crate::portfwd::{BridgeStream, TunnelBridge};
use crate::transport::Outbound;
use async_trait::async_trait;
use backhaul_proto::message::{TunnelData, TunnelOpen};
use backhaul_proto::{encode, Envelope, MsgType};
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

const TUNNEL_BUFFER: usize = 64 * 1024;
const READ_CHUNK: usize = 16 * 1024;
/// Out-of-order chunks held per tunnel before it is torn down
const MAX_PENDING: usize = 256;

/// Inbound sinks for open tunnels, keyed by tunnel id
pub struct TunnelRegistry {
    tunnels: Mutex<HashMap<u64, mpsc::Sender<TunnelData>>>,
    next_id: AtomicU64,
}

impl TunnelRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            tunnels: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn allocate(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn insert(&self, tunnel_id: u64, sink: mpsc::Sender<TunnelData>) {
        self.tunnels.lock().await.insert(tunnel_id, sink);
    }

    async fn remove(&self, tunnel_id: u64) {
        if self.tunnels.lock().await.remove(&tunnel_id).is_some() {
            debug!("Tunnel {} removed", tunnel_id);
        }
    }

    /// Route an inbound chunk to its tunnel. Returns `false` when no such
    /// tunnel is open.
    pub async fn deliver(&self, chunk: TunnelData) -> bool {
        let sink = self.tunnels.lock().await.get(&chunk.tunnel_id).cloned();
        match sink {
            Some(sink) => sink.send(chunk).await.is_ok(),
            None => {
                debug!("Data for unknown tunnel {}", chunk.tunnel_id);
                false
            }
        }
    }

    /// Number of open tunnels
    pub async fn len(&self) -> usize {
        self.tunnels.lock().await.len()
    }

    /// Whether no tunnel is open
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for TunnelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Restores sequence order for chunks that may arrive out of order
#[derive(Debug, Default)]
pub struct Reorder {
    next: u64,
    pending: BTreeMap<u64, TunnelData>,
}

impl Reorder {
    /// Accept a chunk and return every chunk now deliverable, in order.
    /// Returns `None` once more than `MAX_PENDING` chunks are waiting on a gap.
    pub fn push(&mut self, chunk: TunnelData) -> Option<Vec<TunnelData>> {
        if chunk.sequence < self.next {
            debug!("Duplicate chunk {} for tunnel {}", chunk.sequence, chunk.tunnel_id);
            return Some(Vec::new());
        }
        self.pending.insert(chunk.sequence, chunk);

        let mut ready = Vec::new();
        while let Some(chunk) = self.pending.remove(&self.next) {
            self.next += 1;
            ready.push(chunk);
        }
        if self.pending.len() > MAX_PENDING {
            return None;
        }
        Some(ready)
    }
}

/// Bridge that carries each relayed connection as an in-band tunnel on the
/// control channel. The far end dials the remote address.
pub struct ChannelBridge {
    outbound: Outbound,
    tunnels: Arc<TunnelRegistry>,
}

impl ChannelBridge {
    /// Bridge over `outbound`, registering tunnels in `tunnels`
    pub fn new(outbound: Outbound, tunnels: Arc<TunnelRegistry>) -> Self {
        Self { outbound, tunnels }
    }
}

#[async_trait]
impl TunnelBridge for ChannelBridge {
    async fn open(&self, remote_addr: &str) -> io::Result<BridgeStream> {
        let tunnel_id = self.tunnels.allocate();
        let (local, bridged) = tokio::io::duplex(TUNNEL_BUFFER);
        let (sink, inbound) = mpsc::channel(64);
        self.tunnels.insert(tunnel_id, sink).await;

        let open = TunnelOpen {
            tunnel_id,
            remote_addr: remote_addr.to_string(),
        };
        let sent = match encode(&open) {
            Ok(data) => self.outbound.send(Envelope::new(MsgType::TUNNEL_OPEN, data)).await.is_ok(),
            Err(e) => {
                warn!("Failed to encode tunnel open: {}", e);
                false
            }
        };
        if !sent {
            self.tunnels.remove(tunnel_id).await;
            return Err(io::Error::new(io::ErrorKind::NotConnected, "control channel closed"));
        }

        debug!("Tunnel {} opened towards {}", tunnel_id, remote_addr);
        tokio::spawn(pump(tunnel_id, bridged, inbound, self.outbound.clone(), Arc::clone(&self.tunnels)));
        Ok(Box::new(local))
    }

    async fn closed(&self) {
        self.outbound.closed().await
    }
}

async fn pump(
    tunnel_id: u64,
    bridged: DuplexStream,
    inbound: mpsc::Receiver<TunnelData>,
    outbound: Outbound,
    tunnels: Arc<TunnelRegistry>,
) {
    let (reader, writer) = tokio::io::split(bridged);
    tokio::join!(
        upstream(tunnel_id, reader, &outbound),
        downstream(writer, inbound, &outbound),
    );
    tunnels.remove(tunnel_id).await;
}

async fn send_chunk(outbound: &Outbound, chunk: &TunnelData) -> bool {
    match encode(chunk) {
        Ok(data) => outbound.send(Envelope::new(MsgType::TUNNEL_DATA, data)).await.is_ok(),
        Err(e) => {
            warn!("Failed to encode tunnel data: {}", e);
            false
        }
    }
}

async fn upstream(tunnel_id: u64, mut reader: ReadHalf<DuplexStream>, outbound: &Outbound) {
    let mut sequence = 0;
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(n) => n,
            Err(e) => {
                debug!("Tunnel {} read failed: {}", tunnel_id, e);
                0
            }
        };
        let chunk = TunnelData {
            tunnel_id,
            sequence,
            data: Bytes::copy_from_slice(&buf[..n]),
            closed: n == 0,
        };
        sequence += 1;
        if !send_chunk(outbound, &chunk).await || chunk.closed {
            break;
        }
    }
}

async fn downstream(
    mut writer: WriteHalf<DuplexStream>,
    mut inbound: mpsc::Receiver<TunnelData>,
    outbound: &Outbound,
) {
    let mut reorder = Reorder::default();
    loop {
        let chunk = tokio::select! {
            chunk = inbound.recv() => match chunk {
                Some(chunk) => chunk,
                None => break,
            },
            _ = outbound.closed() => break,
        };
        let tunnel_id = chunk.tunnel_id;
        let Some(ready) = reorder.push(chunk) else {
            warn!("Tunnel {} exceeded {} out-of-order chunks, closing", tunnel_id, MAX_PENDING);
            break;
        };
        for chunk in ready {
            if !chunk.data.is_empty() && writer.write_all(&chunk.data).await.is_err() {
                return;
            }
            if chunk.closed {
                let _ = writer.shutdown().await;
                return;
            }
        }
    }
    let _ = writer.shutdown().await;
}
