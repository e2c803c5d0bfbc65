//! Envelope structure and serialization

use crate::ProtocolError;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// The atomic typed, correlated message unit on the control channel.
///
/// A result envelope always carries the `id` of the request it answers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Message kind tag
    pub msg_type: u32,
    /// Correlation identifier
    pub id: u64,
    /// Opaque payload
    pub data: Bytes,
    /// Set on replies to envelopes no handler recognised
    pub unknown_message_type: bool,
}

impl Envelope {
    /// Create an uncorrelated envelope
    pub fn new(msg_type: u32, data: impl Into<Bytes>) -> Self {
        Self {
            msg_type,
            id: 0,
            data: data.into(),
            unknown_message_type: false,
        }
    }

    /// Create a request envelope with a correlation id
    pub fn request(msg_type: u32, id: u64, data: impl Into<Bytes>) -> Self {
        Self {
            msg_type,
            id,
            data: data.into(),
            unknown_message_type: false,
        }
    }

    /// Create a result envelope answering request `id`
    pub fn result(id: u64, data: impl Into<Bytes>) -> Self {
        Self {
            msg_type: 0,
            id,
            data: data.into(),
            unknown_message_type: false,
        }
    }

    /// Create the reply for an envelope whose type has no handler
    pub fn unknown(id: u64) -> Self {
        Self {
            msg_type: 0,
            id,
            data: Bytes::new(),
            unknown_message_type: true,
        }
    }

    /// Serialize envelope to MessagePack bytes
    pub fn to_msgpack(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(rmp_serde::to_vec(self)?)
    }

    /// Deserialize envelope from MessagePack bytes
    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}
