//! Local execution, trust-weighted delegation and the hybrid of both

use std::future::ready;
use std::sync::Arc;
use std::time::{Duration, Instant};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::{debug, instrument, warn};
use crate::capabilities::CapabilityMap;
use crate::channel::{Message, MessageBus};
use crate::config::{Config, DelegationConfig, StrategyKind};
use crate::context::ExecutionContext;
use crate::error::{DispatchError, Result};
use crate::goal::ActionStep;
use crate::metrics::PerformanceMonitor;
use crate::pool::AgentRegistry;
use crate::utils::with_backoff;
use crate::worker::{TASK_FAILED, TASK_MESSAGE};

/// Mailbox address the dispatcher sends from and receives late replies on
pub const DISPATCHER_ADDRESS: &str = "dispatcher";

/// Result of a successfully executed step
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutput {
    /// Value stored in the workspace under the step's action name
    pub output: Value,
    /// Agent that ran the step; `None` for local execution
    pub agent: Option<String>,
    pub elapsed: Duration,
    /// Fallbacks taken before the step succeeded
    pub retries: u32,
}

/// Decides where a step runs and runs it
#[async_trait]
pub trait DelegationStrategy: Send + Sync {
    /// Executes one step whose parameters are already resolved
    async fn execute_step(&self, step: &ActionStep, ctx: &ExecutionContext) -> Result<StepOutput>;

    /// Short name for logs
    fn name(&self) -> &'static str;
}

/// Runs steps through the local capability map
#[derive(Clone)]
pub struct DirectStrategy {
    capabilities: Arc<CapabilityMap>,
    local_personas: Vec<String>,
}

impl DirectStrategy {
    /// `local_personas` are tried, in order, after the step's own persona
    pub fn new(capabilities: Arc<CapabilityMap>, local_personas: Vec<String>) -> Self {
        Self {
            capabilities,
            local_personas: local_personas.into_iter().map(|p| p.to_lowercase()).collect(),
        }
    }
}

#[async_trait]
impl DelegationStrategy for DirectStrategy {
    async fn execute_step(&self, step: &ActionStep, ctx: &ExecutionContext) -> Result<StepOutput> {
        let handler = std::iter::once(step.assigned_persona.as_str())
            .chain(self.local_personas.iter().map(String::as_str))
            .find_map(|persona| self.capabilities.get(persona, &step.action))
            .ok_or_else(|| DispatchError::StepExecutionError {
                action: step.action.clone(),
                reason: format!("no local handler for persona '{}'", step.assigned_persona),
            })?;

        debug!(goal_id = ctx.goal_id(), action = %step.action, "Executing step locally");
        let started = Instant::now();
        let output = handler.call(step.parameters.clone()).await.map_err(|e| match e {
            DispatchError::StepExecutionError { .. } => e,
            other => DispatchError::StepExecutionError {
                action: step.action.clone(),
                reason: other.to_string(),
            },
        })?;
        Ok(StepOutput {
            output,
            agent: None,
            elapsed: started.elapsed(),
            retries: 0,
        })
    }

    fn name(&self) -> &'static str {
        "direct"
    }
}

/// Delegates steps to the most trusted idle agent of the step's persona
pub struct TrustWeightedStrategy {
    direct: DirectStrategy,
    registry: Arc<AgentRegistry>,
    bus: MessageBus,
    monitor: Arc<PerformanceMonitor>,
    delegation: DelegationConfig,
    default_complexity: f64,
}

impl TrustWeightedStrategy {
    pub fn new(
        direct: DirectStrategy,
        registry: Arc<AgentRegistry>,
        bus: MessageBus,
        monitor: Arc<PerformanceMonitor>,
        delegation: DelegationConfig,
        default_complexity: f64,
    ) -> Self {
        Self {
            direct,
            registry,
            bus,
            monitor,
            delegation,
            default_complexity,
        }
    }

    fn is_local(&self, persona: &str) -> bool {
        self.direct.local_personas.iter().any(|p| p.eq_ignore_ascii_case(persona))
    }

    async fn record(&self, agent: &str, success: bool, complexity: f64, elapsed: Duration) {
        if let Err(e) = self.registry.record_outcome(agent, success, complexity) {
            warn!(agent, error = %e, "Could not record agent outcome");
        }
        if success {
            if let Err(e) = self.registry.record_response(agent, elapsed) {
                warn!(agent, error = %e, "Could not record agent response time");
            }
        }
        self.monitor.record_delegation(agent, success, elapsed).await;
    }
}

fn rejection_reason(payload: &Map<String, Value>) -> String {
    payload
        .get("error")
        .and_then(Value::as_str)
        .unwrap_or("agent reported failure")
        .to_string()
}

#[async_trait]
impl DelegationStrategy for TrustWeightedStrategy {
    #[instrument(skip_all, fields(goal_id = ctx.goal_id(), action = %step.action, persona = %step.assigned_persona))]
    async fn execute_step(&self, step: &ActionStep, ctx: &ExecutionContext) -> Result<StepOutput> {
        if self.is_local(&step.assigned_persona) {
            return self.direct.execute_step(step, ctx).await;
        }

        let complexity = step.complexity(self.default_complexity);
        let persona = step.assigned_persona.as_str();
        let guard = with_backoff(&self.delegation.retry, DispatchError::is_transient, || {
            ready(self.registry.acquire(persona, complexity).ok_or_else(|| {
                DispatchError::DelegationUnavailable {
                    persona: persona.to_string(),
                }
            }))
        })
        .await?;
        let agent = guard.name().to_string();

        let mut payload = Map::new();
        payload.insert("goal_id".into(), json!(ctx.goal_id()));
        payload.insert("action".into(), json!(step.action));
        payload.insert("parameters".into(), Value::Object(step.parameters.clone()));
        payload.insert("complexity".into(), json!(complexity));
        let request = Message::new(DISPATCHER_ADDRESS, &agent, TASK_MESSAGE, payload).with_reply_to(DISPATCHER_ADDRESS);

        let timeout = self.delegation.reply_timeout();
        let started = Instant::now();
        let reply = self.bus.request_reply(request, timeout).await;
        let elapsed = started.elapsed();
        drop(guard);

        match reply {
            None => {
                self.record(&agent, false, complexity, elapsed).await;
                warn!(agent = %agent, ?timeout, "Delegation timed out");
                Err(DispatchError::DelegationTimeout { agent, timeout })
            }
            Some(reply)
                if reply.message_type() == TASK_FAILED
                    || reply.payload().get("status").and_then(Value::as_str) == Some("failure") =>
            {
                self.record(&agent, false, complexity, elapsed).await;
                let reason = rejection_reason(reply.payload());
                warn!(agent = %agent, reason = %reason, "Delegation rejected");
                Err(DispatchError::DelegationRejected { agent, reason })
            }
            Some(reply) => {
                self.record(&agent, true, complexity, elapsed).await;
                let output = reply
                    .payload()
                    .get("result")
                    .cloned()
                    .unwrap_or_else(|| Value::Object(reply.payload().clone()));
                debug!(agent = %agent, elapsed_ms = elapsed.as_millis() as u64, "Delegation succeeded");
                Ok(StepOutput {
                    output,
                    agent: Some(agent),
                    elapsed,
                    retries: 0,
                })
            }
        }
    }

    fn name(&self) -> &'static str {
        "trust_weighted"
    }
}

/// Tries remote delegation once, then local execution once
pub struct HybridStrategy {
    remote: TrustWeightedStrategy,
}

impl HybridStrategy {
    pub fn new(remote: TrustWeightedStrategy) -> Self {
        Self { remote }
    }
}

#[async_trait]
impl DelegationStrategy for HybridStrategy {
    async fn execute_step(&self, step: &ActionStep, ctx: &ExecutionContext) -> Result<StepOutput> {
        if self.remote.is_local(&step.assigned_persona) {
            return self.remote.direct.execute_step(step, ctx).await;
        }
        let remote_error = match self.remote.execute_step(step, ctx).await {
            Ok(output) => return Ok(output),
            Err(e) => e,
        };
        warn!(goal_id = ctx.goal_id(), action = %step.action, error = %remote_error, "Remote execution failed, falling back to local");

        match self.remote.direct.execute_step(step, ctx).await {
            Ok(mut output) => {
                output.retries = 1;
                Ok(output)
            }
            Err(local_error) => Err(DispatchError::StepExecutionError {
                action: step.action.clone(),
                reason: format!("{}; local fallback: {}", remote_error, local_error),
            }),
        }
    }

    fn name(&self) -> &'static str {
        "hybrid"
    }
}

/// Builds the strategy named by `config.dispatcher.strategy`
pub fn from_config(
    config: &Config,
    capabilities: Arc<CapabilityMap>,
    registry: Arc<AgentRegistry>,
    bus: MessageBus,
    monitor: Arc<PerformanceMonitor>,
) -> Arc<dyn DelegationStrategy> {
    let direct = DirectStrategy::new(capabilities, config.dispatcher.local_personas.clone());
    if config.dispatcher.strategy == StrategyKind::Direct {
        return Arc::new(direct);
    }
    let remote = TrustWeightedStrategy::new(
        direct,
        registry,
        bus,
        monitor,
        config.delegation.clone(),
        config.dispatcher.default_complexity,
    );
    match config.dispatcher.strategy {
        StrategyKind::Hybrid => Arc::new(HybridStrategy::new(remote)),
        _ => Arc::new(remote),
    }
}
