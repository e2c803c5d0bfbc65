//! # Backhaul Agent
//!
//! Control-channel engine for a remote agent: session and beacon operation,
//! task dispatch, reconnection, port forwards and in-band tunnels.

#![warn(missing_docs)]

/// Beacon engine
pub mod beacon;

/// Agent configuration and runtime settings
pub mod config;

/// Shared agent context
pub mod context;

/// Error types
pub mod error;

/// Task batch executor
pub mod executor;

/// Built-in handlers
pub mod handlers;

/// Local TCP port forwards
pub mod portfwd;

/// Reconnection controller
pub mod reconnect;

/// Registration payload collection
pub mod registration;

/// Message type routing
pub mod registry;

/// Session engine
pub mod session;

/// Connections, beacons and dialers
pub mod transport;

/// In-band tunnels over the control channel
pub mod tunnel;

pub use beacon::BeaconEngine;
pub use config::{AgentConfig, Mode, RuntimeSettings};
pub use context::AgentContext;
pub use error::{AgentError, ForwardError, RegistryError};
pub use executor::{BatchReport, TaskBatchExecutor};
pub use reconnect::{Exit, Outcome, Reconnector};
pub use registry::{HandlerClass, HandlerRegistry, Route};
pub use session::SessionEngine;
pub use transport::{Beacon, Connection, Dial, Outbound};
