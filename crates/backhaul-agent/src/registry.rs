//! Handler registry: message type to handler, partitioned by handler shape

use crate::error::RegistryError;
use crate::transport::Outbound;
use async_trait::async_trait;
use backhaul_proto::{Envelope, MsgType};
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

/// Capability handler: payload in, result payload out.
///
/// An error is logged by the dispatcher and answered with an empty result.
#[async_trait]
pub trait CapabilityHandler: Send + Sync {
    /// Handle a request payload
    async fn handle(&self, data: Bytes) -> anyhow::Result<Bytes>;
}

/// Handler that takes the whole envelope and writes back on the connection
/// itself, possibly more than once and long after returning.
#[async_trait]
pub trait ChannelHandler: Send + Sync {
    /// Handle an envelope
    async fn handle(&self, envelope: Envelope, outbound: Outbound);
}

/// Handler whose completion ends the session
#[async_trait]
pub trait SpecialHandler: Send + Sync {
    /// Handle a request payload
    async fn handle(&self, data: Bytes) -> anyhow::Result<()>;
}

/// Handler tables, by shape
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerClass {
    /// Termination handlers
    Special,
    /// Pivot handlers
    Pivot,
    /// Reverse port forward handlers
    ReversePortForward,
    /// Capability handlers
    Capability,
    /// Tunnel data handlers
    TunnelData,
}

/// Lookup order used when routing an envelope
pub const PRECEDENCE: [HandlerClass; 5] = [
    HandlerClass::Special,
    HandlerClass::Pivot,
    HandlerClass::ReversePortForward,
    HandlerClass::Capability,
    HandlerClass::TunnelData,
];

/// Where an envelope goes
#[derive(Clone)]
pub enum Route {
    /// Run, then end the session
    Special(Arc<dyn SpecialHandler>),
    /// Envelope-and-connection handler of the given class
    Channel(HandlerClass, Arc<dyn ChannelHandler>),
    /// Capability handler
    Capability(Arc<dyn CapabilityHandler>),
    /// Open an interactive session (beacon mode)
    OpenSession,
    /// No handler; reply with the unknown marker
    Unknown,
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Special(_) => write!(f, "Special"),
            Self::Channel(class, _) => write!(f, "Channel({:?})", class),
            Self::Capability(_) => write!(f, "Capability"),
            Self::OpenSession => write!(f, "OpenSession"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Read-only routing table built once at startup
#[derive(Default)]
pub struct HandlerRegistry {
    special: HashMap<u32, Arc<dyn SpecialHandler>>,
    channel: HashMap<HandlerClass, HashMap<u32, Arc<dyn ChannelHandler>>>,
    capability: HashMap<u32, Arc<dyn CapabilityHandler>>,
    registration: HashSet<u32>,
}

impl HandlerRegistry {
    /// Start building a registry
    pub fn builder() -> HandlerRegistryBuilder {
        HandlerRegistryBuilder::default()
    }

    /// Route a message type. Never fails: a miss is [`Route::Unknown`].
    pub fn route(&self, msg_type: u32) -> Route {
        for class in PRECEDENCE {
            let hit = match class {
                HandlerClass::Special => self.special.get(&msg_type).cloned().map(Route::Special),
                HandlerClass::Capability => {
                    self.capability.get(&msg_type).cloned().map(Route::Capability)
                }
                _ => self
                    .channel
                    .get(&class)
                    .and_then(|table| table.get(&msg_type))
                    .cloned()
                    .map(|handler| Route::Channel(class, handler)),
            };
            if let Some(route) = hit {
                return route;
            }
        }
        if msg_type == MsgType::OPEN_SESSION {
            return Route::OpenSession;
        }
        Route::Unknown
    }

    /// Whether envelopes of this type must finish before others in a batch
    pub fn is_registration(&self, msg_type: u32) -> bool {
        self.registration.contains(&msg_type)
    }

    /// Number of registered message types
    pub fn len(&self) -> usize {
        self.special.len()
            + self.capability.len()
            + self.channel.values().map(HashMap::len).sum::<usize>()
    }

    /// Whether nothing is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Builder for [`HandlerRegistry`]. The first registration error is kept and
/// reported by [`build`](Self::build).
pub struct HandlerRegistryBuilder {
    registry: HandlerRegistry,
    seen: HashMap<u32, HandlerClass>,
    error: Option<RegistryError>,
}

impl Default for HandlerRegistryBuilder {
    fn default() -> Self {
        let mut registration = HashSet::new();
        registration.insert(MsgType::REGISTER_EXTENSION);
        Self {
            registry: HandlerRegistry {
                registration,
                ..Default::default()
            },
            seen: HashMap::new(),
            error: None,
        }
    }
}

impl HandlerRegistryBuilder {
    fn claim(&mut self, msg_type: u32, class: HandlerClass) -> bool {
        if self.error.is_some() {
            return false;
        }
        if msg_type == MsgType::OPEN_SESSION {
            self.error = Some(RegistryError::Reserved(msg_type));
            return false;
        }
        if self.seen.insert(msg_type, class).is_some() {
            self.error = Some(RegistryError::Duplicate(msg_type));
            return false;
        }
        debug!("Registered {:?} handler for message type {}", class, msg_type);
        true
    }

    /// Register a special (terminating) handler
    pub fn special(mut self, msg_type: u32, handler: Arc<dyn SpecialHandler>) -> Self {
        if self.claim(msg_type, HandlerClass::Special) {
            self.registry.special.insert(msg_type, handler);
        }
        self
    }

    /// Register a capability handler
    pub fn capability(mut self, msg_type: u32, handler: Arc<dyn CapabilityHandler>) -> Self {
        if self.claim(msg_type, HandlerClass::Capability) {
            self.registry.capability.insert(msg_type, handler);
        }
        self
    }

    /// Register an envelope-and-connection handler in one of the channel tables
    pub fn channel(mut self, class: HandlerClass, msg_type: u32, handler: Arc<dyn ChannelHandler>) -> Self {
        if matches!(class, HandlerClass::Special | HandlerClass::Capability) {
            if self.error.is_none() {
                self.error = Some(RegistryError::NotChannelClass(msg_type));
            }
            return self;
        }
        if self.claim(msg_type, class) {
            self.registry
                .channel
                .entry(class)
                .or_default()
                .insert(msg_type, handler);
        }
        self
    }

    /// Mark a message type as registration class
    pub fn registration_class(mut self, msg_type: u32) -> Self {
        self.registry.registration.insert(msg_type);
        self
    }

    /// Finish, failing if any type was claimed twice or is reserved
    pub fn build(self) -> Result<HandlerRegistry, RegistryError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.registry),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl CapabilityHandler for Echo {
        async fn handle(&self, data: Bytes) -> anyhow::Result<Bytes> {
            Ok(data)
        }
    }

    struct Sink;

    #[async_trait]
    impl ChannelHandler for Sink {
        async fn handle(&self, _envelope: Envelope, _outbound: Outbound) {}
    }

    struct Stop;

    #[async_trait]
    impl SpecialHandler for Stop {
        async fn handle(&self, _data: Bytes) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_routes_by_table() {
        let registry = HandlerRegistry::builder()
            .special(5, Arc::new(Stop))
            .capability(10, Arc::new(Echo))
            .channel(HandlerClass::Pivot, 40, Arc::new(Sink))
            .channel(HandlerClass::ReversePortForward, 20, Arc::new(Sink))
            .channel(HandlerClass::TunnelData, 31, Arc::new(Sink))
            .build()
            .unwrap();

        assert_eq!(registry.len(), 5);
        assert!(matches!(registry.route(5), Route::Special(_)));
        assert!(matches!(registry.route(10), Route::Capability(_)));
        assert!(matches!(registry.route(40), Route::Channel(HandlerClass::Pivot, _)));
        assert!(matches!(registry.route(20), Route::Channel(HandlerClass::ReversePortForward, _)));
        assert!(matches!(registry.route(31), Route::Channel(HandlerClass::TunnelData, _)));
    }

    #[test]
    fn test_miss_is_unknown() {
        let registry = HandlerRegistry::builder().build().unwrap();
        assert!(registry.is_empty());
        assert!(matches!(registry.route(9999), Route::Unknown));
    }

    #[test]
    fn test_open_session_is_explicit() {
        let registry = HandlerRegistry::builder().build().unwrap();
        assert!(matches!(registry.route(MsgType::OPEN_SESSION), Route::OpenSession));
    }

    #[test]
    fn test_open_session_is_reserved() {
        let result = HandlerRegistry::builder()
            .capability(MsgType::OPEN_SESSION, Arc::new(Echo))
            .build();
        assert_eq!(result.err(), Some(RegistryError::Reserved(MsgType::OPEN_SESSION)));
    }

    #[test]
    fn test_tables_are_disjoint() {
        let result = HandlerRegistry::builder()
            .capability(10, Arc::new(Echo))
            .channel(HandlerClass::TunnelData, 10, Arc::new(Sink))
            .build();
        assert_eq!(result.err(), Some(RegistryError::Duplicate(10)));
    }

    #[test]
    fn test_registration_class() {
        let registry = HandlerRegistry::builder()
            .registration_class(77)
            .build()
            .unwrap();
        assert!(registry.is_registration(MsgType::REGISTER_EXTENSION));
        assert!(registry.is_registration(77));
        assert!(!registry.is_registration(MsgType::PING));
    }

    #[test]
    fn test_channel_handler_needs_channel_class() {
        let result = HandlerRegistry::builder()
            .channel(HandlerClass::Capability, 30, Arc::new(Sink))
            .build();
        assert_eq!(result.err(), Some(RegistryError::NotChannelClass(30)));

        let result = HandlerRegistry::builder()
            .channel(HandlerClass::Special, 31, Arc::new(Sink))
            .build();
        assert_eq!(result.err(), Some(RegistryError::NotChannelClass(31)));
    }
}
