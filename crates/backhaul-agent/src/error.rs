//! Error types for the agent

use backhaul_proto::ProtocolError;
use thiserror::Error;

/// Main error type for agent operations
#[derive(Debug, Error)]
pub enum AgentError {
    /// Connect, read or write failure; counted against the error budget
    #[error("Transport error: {0}")]
    Transport(String),

    /// Undecodable payload
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Too many consecutive connection failures
    #[error("Giving up after {failures} consecutive connection errors (max: {max})")]
    MaxErrorsExceeded {
        /// Consecutive failures observed
        failures: u32,
        /// Configured budget
        max: u32,
    },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AgentError {
    /// Create a transport error from anything displayable
    pub fn transport(err: impl std::fmt::Display) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(err: serde_json::Error) -> Self {
        Self::Config(format!("JSON error: {}", err))
    }
}

/// Errors from the port-forward registry
#[derive(Debug, Error)]
pub enum ForwardError {
    /// The bind port is already owned by another forward
    #[error("Bind port {0} is already forwarded")]
    PortInUse(u16),

    /// No forward on that port
    #[error("No forward on bind port {0}")]
    NotFound(u16),

    /// The bind address could not be parsed
    #[error("Invalid bind address: {0}")]
    InvalidAddress(String),

    /// Listener could not be opened
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors building the handler registry
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// A message type was registered in more than one table
    #[error("Message type {0} is registered more than once")]
    Duplicate(u32),

    /// A handler was registered for a type the engine reserves
    #[error("Message type {0} is reserved")]
    Reserved(u32),

    /// A channel handler was registered under a non-channel class
    #[error("Message type {0} registered as a channel handler in a non-channel table")]
    NotChannelClass(u32),
}

/// Errors changing the C2 transport rotation
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The URL could not be parsed
    #[error("Invalid transport URL {0}")]
    InvalidUrl(String),

    /// No transport with that id
    #[error("No transport with id {0}")]
    NotFound(u64),

    /// The transport is carrying the current connection
    #[error("Transport {0} is in use")]
    Active(u64),
}
