//! # Backhaul Protocol
//!
//! Envelope data model, message payloads and stream codec for the Backhaul
//! control channel.

#![warn(missing_docs)]

/// The correlated wire unit
pub mod envelope;

/// Message type tags and typed payloads
pub mod message;

/// Length-prefixed envelope codec for async streams
pub mod codec;

/// Error types for protocol operations
pub mod error;

pub use codec::EnvelopeCodec;
pub use envelope::Envelope;
pub use error::ProtocolError;
pub use message::{decode, encode, MsgType};
