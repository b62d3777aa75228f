use std::sync::atomic::Ordering;
use std::sync::{Arc, PoisonError};
use async_trait::async_trait;
use serde::Serialize;
use tokio::time::{interval_at, Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use super::{AgentRecord, AgentRegistry};

/// Direction of a scaling decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleAction {
    /// A new agent was registered
    Up,
    /// An idle agent was retired
    Down,
}

/// One agent added or retired by [`AgentRegistry::auto_scale`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScaleEvent {
    pub persona: String,
    pub action: ScaleAction,
    /// Agent that was added or retired
    pub agent: String,
    /// Agent count for the persona after the change
    pub agent_count: usize,
    pub average_queue_length: f64,
}

/// Notified after each scaling change, e.g. to attach or detach a worker
#[async_trait]
pub trait ScaleHook: Send + Sync {
    async fn on_scale(&self, event: &ScaleEvent);
}

impl AgentRegistry {
    /// Installs the hook told about every scaling change
    pub fn set_scale_hook(&self, hook: Arc<dyn ScaleHook>) {
        *self.hook.write().unwrap_or_else(PoisonError::into_inner) = Some(hook);
    }

    /// One pass of the damped control loop
    ///
    /// For every persona with demand data the agent count moves by at most
    /// one toward what the average queue length asks for, never leaving the
    /// persona's `[min, max]` bounds. Only idle agents are retired; the
    /// least recently used goes first.
    pub async fn auto_scale(&self) -> Vec<ScaleEvent> {
        let mut events = Vec::new();
        let personas: Vec<String> = self.read().demand.keys().cloned().collect();

        for persona in personas {
            let mut state = self.write();
            let Some(demand) = state.demand.get(&persona).cloned() else {
                continue;
            };
            let count = state.count_for(&persona);
            let avg = demand.average_queue_length;
            let bounds = demand.bounds;

            let wants_up = count < bounds.min
                || (avg > self.scaling.scale_up_factor * count as f64 && count < bounds.max);
            let wants_down = count > bounds.max
                || (avg < self.scaling.scale_down_factor * count as f64 && count > bounds.min);

            if wants_up {
                let name = loop {
                    let n = self.spawned.fetch_add(1, Ordering::SeqCst) + 1;
                    let candidate = format!("{}_auto_{}", persona, n);
                    if !state.agents.contains_key(&candidate) {
                        break candidate;
                    }
                };
                let record = AgentRecord::new(&name, &persona, self.trust.initial.min(self.trust.max));
                state.agents.insert(name.clone(), record);
                info!(persona = %persona, agent = %name, avg_queue = avg, "Scaled up");
                events.push(ScaleEvent {
                    persona: persona.clone(),
                    action: ScaleAction::Up,
                    agent: name,
                    agent_count: count + 1,
                    average_queue_length: avg,
                });
            } else if wants_down {
                let victim = state
                    .agents
                    .values()
                    .filter(|a| a.persona == persona && !a.busy)
                    .min_by(|a, b| a.last_used.cmp(&b.last_used).then_with(|| a.name.cmp(&b.name)))
                    .map(|a| a.name.clone());
                match victim {
                    Some(name) => {
                        state.agents.remove(&name);
                        info!(persona = %persona, agent = %name, avg_queue = avg, "Scaled down");
                        events.push(ScaleEvent {
                            persona: persona.clone(),
                            action: ScaleAction::Down,
                            agent: name,
                            agent_count: count - 1,
                            average_queue_length: avg,
                        });
                    }
                    None => debug!(persona = %persona, "Scale down skipped, every agent is busy"),
                }
            }
        }

        let hook = self.hook.read().unwrap_or_else(PoisonError::into_inner).clone();
        if let Some(hook) = hook {
            for event in &events {
                hook.on_scale(event).await;
            }
        }
        events
    }
}

/// Runs [`AgentRegistry::auto_scale`] every `scaling.interval_secs` and
/// re-heals trust every `trust.reheal_interval_secs` until `cancel` fires
pub async fn run_autoscaler(registry: Arc<AgentRegistry>, cancel: CancellationToken) {
    let scale_period = registry.scaling_settings().interval().max(Duration::from_millis(1));
    let reheal_period = registry.trust_config().reheal_interval().max(Duration::from_millis(1));
    let reheal_rate = registry.trust_config().reheal_rate;

    let mut scale_interval = interval_at(Instant::now() + scale_period, scale_period);
    scale_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut reheal_interval = interval_at(Instant::now() + reheal_period, reheal_period);
    reheal_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!(
        interval_secs = scale_period.as_secs(),
        reheal_secs = reheal_period.as_secs(),
        "Autoscaler started"
    );

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Autoscaler shutting down");
                break;
            }
            _ = scale_interval.tick() => {
                let events = registry.auto_scale().await;
                if !events.is_empty() {
                    debug!(changes = events.len(), agents = registry.len(), "Autoscale pass applied changes");
                }
            }
            _ = reheal_interval.tick() => {
                registry.reheal_trust(reheal_rate);
            }
        }
    }
}
