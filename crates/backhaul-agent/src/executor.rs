//! Task batch executor used by beacon mode

use crate::context::AgentContext;
use crate::registry::Route;
use crate::session;
use backhaul_proto::Envelope;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Results of one batch
#[derive(Debug, Default)]
pub struct BatchReport {
    /// One result per input envelope, correlated by id, in completion order
    pub results: Vec<Envelope>,
    /// A special handler ran; the beacon should stop after reporting
    pub terminate: bool,
}

/// Runs a batch of inbound envelopes through the handler registry.
///
/// Registration-class envelopes all complete before any other envelope is
/// dispatched. Every input yields exactly one result.
#[derive(Clone)]
pub struct TaskBatchExecutor {
    ctx: Arc<AgentContext>,
}

impl TaskBatchExecutor {
    /// Create an executor over the context's registry
    pub fn new(ctx: Arc<AgentContext>) -> Self {
        Self { ctx }
    }

    /// Execute `tasks` and wait for every handler to finish
    pub async fn execute(&self, tasks: Vec<Envelope>) -> BatchReport {
        let mut expected: HashMap<u64, usize> = HashMap::new();
        for task in &tasks {
            *expected.entry(task.id).or_default() += 1;
        }

        let (registration, ordinary): (Vec<_>, Vec<_>) = tasks
            .into_iter()
            .partition(|task| self.ctx.handlers.is_registration(task.msg_type));
        debug!(
            "Executing batch: {} registration, {} ordinary",
            registration.len(),
            ordinary.len()
        );

        let results = Arc::new(Mutex::new(Vec::with_capacity(expected.values().sum())));
        let mut terminate = false;
        for phase in [registration, ordinary] {
            terminate |= self.run_phase(phase, &results).await;
        }

        let mut results = std::mem::take(&mut *results.lock().await);
        for result in &results {
            if let Some(count) = expected.get_mut(&result.id) {
                *count = count.saturating_sub(1);
            }
        }
        for (id, missing) in expected {
            for _ in 0..missing {
                warn!("Task {} produced no result, reporting empty", id);
                results.push(Envelope::result(id, Bytes::new()));
            }
        }

        BatchReport { results, terminate }
    }

    async fn run_phase(&self, tasks: Vec<Envelope>, results: &Arc<Mutex<Vec<Envelope>>>) -> bool {
        let mut running = JoinSet::new();
        let mut terminate = false;

        for task in tasks {
            debug!("Execute task {} (type {})", task.id, task.msg_type);
            match self.ctx.handlers.route(task.msg_type) {
                Route::Capability(handler) => {
                    let results = Arc::clone(results);
                    running.spawn(async move {
                        let data = handler.handle(task.data).await.unwrap_or_else(|e| {
                            debug!("Task {} handler returned an error: {}", task.id, e);
                            Bytes::new()
                        });
                        results.lock().await.push(Envelope::result(task.id, data));
                    });
                }
                Route::Special(handler) => {
                    terminate = true;
                    let results = Arc::clone(results);
                    running.spawn(async move {
                        if let Err(e) = handler.handle(task.data).await {
                            debug!("Task {} special handler returned an error: {}", task.id, e);
                        }
                        results.lock().await.push(Envelope::result(task.id, Bytes::new()));
                    });
                }
                Route::OpenSession => {
                    session::spawn_open_session(Arc::clone(&self.ctx), task.data);
                    results.lock().await.push(Envelope::result(task.id, Bytes::new()));
                }
                Route::Channel(class, _) => {
                    debug!("{:?} handlers need a live connection, task {} unanswered", class, task.id);
                    results.lock().await.push(Envelope::unknown(task.id));
                }
                Route::Unknown => {
                    debug!("Unknown task type {}", task.msg_type);
                    results.lock().await.push(Envelope::unknown(task.id));
                }
            }
        }

        while let Some(joined) = running.join_next().await {
            if let Err(e) = joined {
                warn!("Task panicked: {}", e);
            }
        }
        terminate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;
    use crate::registry::{CapabilityHandler, HandlerRegistry};
    use async_trait::async_trait;
    use backhaul_proto::MsgType;
    use proptest::prelude::*;
    use std::collections::HashSet;
    use std::time::Duration;
    use tokio::time::Instant;

    struct Echo;

    #[async_trait]
    impl CapabilityHandler for Echo {
        async fn handle(&self, data: Bytes) -> anyhow::Result<Bytes> {
            Ok(data)
        }
    }

    struct Failing;

    #[async_trait]
    impl CapabilityHandler for Failing {
        async fn handle(&self, _data: Bytes) -> anyhow::Result<Bytes> {
            anyhow::bail!("capability failed")
        }
    }

    struct Panicking;

    #[async_trait]
    impl CapabilityHandler for Panicking {
        async fn handle(&self, _data: Bytes) -> anyhow::Result<Bytes> {
            panic!("handler bug")
        }
    }

    /// Records when it starts and finishes
    struct Timed {
        delay: Duration,
        log: Arc<std::sync::Mutex<Vec<(&'static str, Instant)>>>,
        name: &'static str,
    }

    #[async_trait]
    impl CapabilityHandler for Timed {
        async fn handle(&self, data: Bytes) -> anyhow::Result<Bytes> {
            self.log.lock().unwrap().push((self.name, Instant::now()));
            tokio::time::sleep(self.delay).await;
            self.log.lock().unwrap().push(("done", Instant::now()));
            Ok(data)
        }
    }

    fn executor(handlers: HandlerRegistry) -> TaskBatchExecutor {
        let config = AgentConfig::new(vec!["tcp://127.0.0.1:1".to_string()]);
        TaskBatchExecutor::new(AgentContext::builder(config).build(handlers))
    }

    #[tokio::test]
    async fn test_results_correlate() {
        let exec = executor(HandlerRegistry::builder().capability(MsgType::PING, Arc::new(Echo)).build().unwrap());
        let tasks = (1..=5)
            .map(|id| Envelope::request(MsgType::PING, id, Bytes::from(format!("task-{}", id))))
            .collect();

        let report = exec.execute(tasks).await;
        assert_eq!(report.results.len(), 5);
        assert!(!report.terminate);
        for result in &report.results {
            assert_eq!(result.data, Bytes::from(format!("task-{}", result.id)));
        }
    }

    #[tokio::test]
    async fn test_unknown_type_is_answered() {
        let exec = executor(HandlerRegistry::builder().build().unwrap());
        let report = exec.execute(vec![Envelope::request(4242, 17, Bytes::from("x"))]).await;

        assert_eq!(report.results.len(), 1);
        assert_eq!(report.results[0].id, 17);
        assert!(report.results[0].unknown_message_type);
        assert!(report.results[0].data.is_empty());
    }

    #[tokio::test]
    async fn test_handler_error_still_reports() {
        let exec = executor(HandlerRegistry::builder().capability(MsgType::PING, Arc::new(Failing)).build().unwrap());
        let report = exec.execute(vec![Envelope::request(MsgType::PING, 3, Bytes::new())]).await;

        assert_eq!(report.results.len(), 1);
        assert_eq!(report.results[0].id, 3);
        assert!(!report.results[0].unknown_message_type);
        assert!(report.results[0].data.is_empty());
    }

    #[tokio::test]
    async fn test_panicking_handler_still_reports() {
        let exec = executor(HandlerRegistry::builder().capability(MsgType::PING, Arc::new(Panicking)).build().unwrap());
        let report = exec.execute(vec![Envelope::request(MsgType::PING, 8, Bytes::new())]).await;

        assert_eq!(report.results.len(), 1);
        assert_eq!(report.results[0].id, 8);
    }

    #[tokio::test]
    async fn test_channel_class_needs_connection() {
        let ctx = AgentContext::with_builtins(AgentConfig::new(vec!["tcp://127.0.0.1:1".to_string()])).unwrap();
        let exec = TaskBatchExecutor::new(ctx);
        let report = exec
            .execute(vec![Envelope::request(MsgType::PORTFWD_LIST, 1, Bytes::new())])
            .await;
        assert!(report.results[0].unknown_message_type);
    }

    #[tokio::test]
    async fn test_special_sets_terminate() {
        let ctx = AgentContext::with_builtins(AgentConfig::new(vec!["tcp://127.0.0.1:1".to_string()])).unwrap();
        let exec = TaskBatchExecutor::new(ctx);
        let report = exec
            .execute(vec![
                Envelope::request(MsgType::PING, 1, Bytes::new()),
                Envelope::request(MsgType::KILL_SESSION, 2, Bytes::new()),
            ])
            .await;
        assert!(report.terminate);
        assert_eq!(report.results.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_registration_completes_first() {
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let handlers = HandlerRegistry::builder()
            .capability(
                MsgType::REGISTER_EXTENSION,
                Arc::new(Timed {
                    delay: Duration::from_secs(3),
                    log: Arc::clone(&log),
                    name: "register",
                }),
            )
            .capability(
                MsgType::PING,
                Arc::new(Timed {
                    delay: Duration::ZERO,
                    log: Arc::clone(&log),
                    name: "ordinary",
                }),
            )
            .build()
            .unwrap();
        let exec = executor(handlers);

        // Ordinary tasks first on the wire
        let tasks = vec![
            Envelope::request(MsgType::PING, 1, Bytes::new()),
            Envelope::request(MsgType::PING, 2, Bytes::new()),
            Envelope::request(MsgType::REGISTER_EXTENSION, 3, Bytes::new()),
            Envelope::request(MsgType::REGISTER_EXTENSION, 4, Bytes::new()),
        ];
        let report = exec.execute(tasks).await;
        assert_eq!(report.results.len(), 4);

        let log = log.lock().unwrap();
        let registration_done = log
            .iter()
            .take(4)
            .filter(|(name, _)| *name == "done")
            .map(|(_, at)| *at)
            .max()
            .unwrap();
        let first_ordinary = log
            .iter()
            .filter(|(name, _)| *name == "ordinary")
            .map(|(_, at)| *at)
            .min()
            .unwrap();
        assert!(log[..4].iter().all(|(name, _)| *name != "ordinary"));
        assert!(first_ordinary >= registration_done);
    }

    proptest! {
        #[test]
        fn test_correlation_for_any_batch(
            tasks in prop::collection::vec((0u32..4, any::<u64>()), 0..32)
        ) {
            let batch: Vec<Envelope> = tasks
                .iter()
                .map(|(kind, id)| {
                    let msg_type = match kind {
                        0 => MsgType::PING,
                        1 => MsgType::REGISTER_EXTENSION,
                        2 => 9999,
                        _ => MsgType::PORTFWD_LIST,
                    };
                    Envelope::request(msg_type, *id, Bytes::new())
                })
                .collect();
            let input_ids: Vec<u64> = batch.iter().map(|e| e.id).collect();

            let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            let report = runtime.block_on(async {
                let ctx = AgentContext::with_builtins(AgentConfig::new(vec!["tcp://127.0.0.1:1".to_string()])).unwrap();
                TaskBatchExecutor::new(ctx).execute(batch).await
            });

            prop_assert_eq!(report.results.len(), input_ids.len());
            let mut output_ids: Vec<u64> = report.results.iter().map(|e| e.id).collect();
            let mut expected = input_ids.clone();
            output_ids.sort_unstable();
            expected.sort_unstable();
            prop_assert_eq!(output_ids, expected);
            let unique: HashSet<u64> = input_ids.into_iter().collect();
            prop_assert!(report.results.iter().all(|e| unique.contains(&e.id)));
        }
    }
}
