//! Background tasks around a [`Dispatcher`] and their orderly shutdown

use std::sync::Arc;
use std::time::Duration;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, timeout_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use crate::channel::{MessageBus, ShutdownReport};
use crate::config::{GoalConfig, ShutdownConfig};
use crate::pool::run_autoscaler;
use super::Dispatcher;

/// How often terminal goals are checked against the retention period
const CLEANUP_PERIOD: Duration = Duration::from_secs(300);

impl Dispatcher {
    /// Runs cycles every `cycle_interval_ms` until `cancel` fires
    ///
    /// A cycle that has started is allowed to finish.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = interval(self.config.cycle_interval().max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(strategy = self.strategy.name(), "Dispatcher loop started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Dispatcher loop shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let outcome = self.run_cycle_guarded().await;
                    if outcome.succeeded {
                        debug!(event = ?outcome.event, goal_id = ?outcome.goal_id, "{}", outcome.detail);
                    } else {
                        warn!(event = ?outcome.event, goal_id = ?outcome.goal_id, kind = ?outcome.error_kind, "{}", outcome.detail);
                    }
                }
            }
        }
    }
}

/// Purges terminal goals older than `retention_secs`
async fn run_goal_cleanup(dispatcher: Arc<Dispatcher>, goals: GoalConfig, cancel: CancellationToken) {
    let retention = Duration::from_secs(goals.retention_secs);
    let mut ticker = interval_at(Instant::now() + CLEANUP_PERIOD, CLEANUP_PERIOD);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                dispatcher.goal_store().cleanup_older_than(retention).await;
            }
        }
    }
}

/// What happened during [`DispatcherRuntime::shutdown`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RuntimeShutdown {
    pub bus: ShutdownReport,
    /// Background tasks that exited within the join timeout
    pub joined: Vec<String>,
    /// Background tasks that were aborted
    pub aborted: Vec<String>,
}

/// A started dispatcher with its autoscaler and maintenance tasks
pub struct DispatcherRuntime {
    dispatcher: Arc<Dispatcher>,
    bus: MessageBus,
    shutdown: ShutdownConfig,
    cancel: CancellationToken,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl DispatcherRuntime {
    /// Spawns the dispatcher loop, the autoscaler and goal cleanup
    pub fn start(dispatcher: Arc<Dispatcher>, bus: MessageBus, goals: GoalConfig, shutdown: ShutdownConfig) -> Self {
        let cancel = CancellationToken::new();
        let mut tasks = Vec::new();

        let loop_dispatcher = Arc::clone(&dispatcher);
        let loop_cancel = cancel.child_token();
        tasks.push((
            "dispatcher",
            tokio::spawn(async move { loop_dispatcher.run(loop_cancel).await }),
        ));
        tasks.push((
            "autoscaler",
            tokio::spawn(run_autoscaler(Arc::clone(dispatcher.registry()), cancel.child_token())),
        ));
        tasks.push((
            "goal_cleanup",
            tokio::spawn(run_goal_cleanup(Arc::clone(&dispatcher), goals, cancel.child_token())),
        ));

        info!(tasks = tasks.len(), "Dispatcher runtime started");
        Self {
            dispatcher,
            bus,
            shutdown,
            cancel,
            tasks,
        }
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    /// Stops the loops, drains the bus and joins every task
    ///
    /// In-flight replies get the grace period; tasks still running after
    /// the join timeout are aborted.
    pub async fn shutdown(self) -> RuntimeShutdown {
        info!("Shutting down dispatcher runtime");
        self.cancel.cancel();

        let bus = self
            .bus
            .shutdown(self.shutdown.grace_period(), self.shutdown.join_timeout())
            .await;

        let mut report = RuntimeShutdown {
            bus,
            ..RuntimeShutdown::default()
        };
        let deadline = Instant::now() + self.shutdown.join_timeout();
        for (name, mut handle) in self.tasks {
            match timeout_at(deadline, &mut handle).await {
                Ok(_) => report.joined.push(name.to_string()),
                Err(_) => {
                    handle.abort();
                    warn!(task = name, "Task did not exit in time, aborted");
                    report.aborted.push(name.to_string());
                }
            }
        }
        self.dispatcher.monitor().report().await;
        info!(joined = report.joined.len(), aborted = report.aborted.len(), "Dispatcher runtime stopped");
        report
    }
}
