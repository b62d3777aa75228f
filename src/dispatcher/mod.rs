//! Goal-driven execution engine
//!
//! Each call to [`Dispatcher::run_cycle`] performs at most one unit of work:
//! handle an interrupt, activate a goal, produce a plan, expand a skill or
//! execute one step. Every error is folded into a [`CycleOutcome`]; nothing a
//! collaborator does can stop the loop.

pub mod runtime;

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};
use crate::collaborators::{
    ApproveAll, Evaluator, Memory, MemoryEvent, MetaCognition, NoGoalSynthesis, NoInterrupts, Perception, Planner,
    TracingMemory,
};
use crate::config::DispatcherConfig;
use crate::context::ExecutionContext;
use crate::error::{DispatchError, ErrorKind, Result};
use crate::goal::{ActionStep, Goal, GoalStatus, Parameters};
use crate::goal_store::GoalStore;
use crate::metrics::PerformanceMonitor;
use crate::pool::{AgentRegistry, PoolDashboard};
use crate::skills::SkillLibrary;
use crate::strategy::DelegationStrategy;
use crate::utils::with_retry;

/// Phase the dispatcher is in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatcherState {
    Idle,
    Planning,
    Executing,
    Reflecting,
}

/// What a cycle did
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CycleEvent {
    /// Perception asked for attention; goal work was skipped
    Interrupted { drained: usize },
    /// Nothing to do
    Idle,
    /// A pending goal became active
    GoalActivated,
    /// Meta-cognition produced a new goal, now active
    GoalGenerated,
    /// A plan was stored for the active goal
    PlanCreated { steps: usize },
    /// Planning failed or was rejected; the goal will be replanned
    PlanInvalidated,
    /// A skill step was replaced by the skill's steps
    SkillExpanded { skill: String, steps: usize },
    /// A step succeeded and more remain
    StepCompleted { action: String, remaining: usize },
    /// A step failed; the goal will be replanned
    StepFailed { action: String, failures: u32 },
    /// The last step succeeded
    GoalCompleted,
    /// The failure budget is exhausted
    GoalFailed,
    /// The cycle stopped early on a store error or a panic
    Aborted,
}

/// Structured result of one cycle
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleOutcome {
    pub goal_id: Option<String>,
    pub succeeded: bool,
    pub error_kind: Option<ErrorKind>,
    pub detail: String,
    pub event: CycleEvent,
}

impl CycleOutcome {
    fn ok(goal_id: Option<&str>, event: CycleEvent, detail: impl Into<String>) -> Self {
        Self {
            goal_id: goal_id.map(str::to_string),
            succeeded: true,
            error_kind: None,
            detail: detail.into(),
            event,
        }
    }

    fn failed(goal_id: Option<&str>, error: &DispatchError, event: CycleEvent) -> Self {
        Self {
            goal_id: goal_id.map(str::to_string),
            succeeded: false,
            error_kind: Some(error.kind()),
            detail: error.to_string(),
            event,
        }
    }
}

/// The orchestration loop's state and collaborators
pub struct Dispatcher {
    config: DispatcherConfig,
    goals: Arc<dyn GoalStore>,
    registry: Arc<AgentRegistry>,
    strategy: Arc<dyn DelegationStrategy>,
    planner: Arc<dyn Planner>,
    evaluator: Arc<dyn Evaluator>,
    meta: Arc<dyn MetaCognition>,
    perception: Arc<dyn Perception>,
    memory: Arc<dyn Memory>,
    skills: SkillLibrary,
    monitor: Arc<PerformanceMonitor>,
    state: RwLock<DispatcherState>,
    context: Mutex<Option<ExecutionContext>>,
}

impl Dispatcher {
    /// Creates a dispatcher with default collaborators for everything but planning
    pub fn new(
        config: DispatcherConfig,
        goals: Arc<dyn GoalStore>,
        registry: Arc<AgentRegistry>,
        strategy: Arc<dyn DelegationStrategy>,
        planner: Arc<dyn Planner>,
    ) -> Self {
        Self {
            config,
            goals,
            registry,
            strategy,
            planner,
            evaluator: Arc::new(ApproveAll),
            meta: Arc::new(NoGoalSynthesis),
            perception: Arc::new(NoInterrupts),
            memory: Arc::new(TracingMemory),
            skills: SkillLibrary::new(),
            monitor: Arc::new(PerformanceMonitor::new()),
            state: RwLock::new(DispatcherState::Idle),
            context: Mutex::new(None),
        }
    }

    pub fn with_evaluator(mut self, evaluator: Arc<dyn Evaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    pub fn with_meta_cognition(mut self, meta: Arc<dyn MetaCognition>) -> Self {
        self.meta = meta;
        self
    }

    pub fn with_perception(mut self, perception: Arc<dyn Perception>) -> Self {
        self.perception = perception;
        self
    }

    pub fn with_memory(mut self, memory: Arc<dyn Memory>) -> Self {
        self.memory = memory;
        self
    }

    pub fn with_skills(mut self, skills: SkillLibrary) -> Self {
        self.skills = skills;
        self
    }

    /// Shares a monitor with the delegation strategy
    pub fn with_monitor(mut self, monitor: Arc<PerformanceMonitor>) -> Self {
        self.monitor = monitor;
        self
    }

    /// Current phase
    pub fn state(&self) -> DispatcherState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: DispatcherState) {
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = state;
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn monitor(&self) -> &Arc<PerformanceMonitor> {
        &self.monitor
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn goal_store(&self) -> &Arc<dyn GoalStore> {
        &self.goals
    }

    pub fn skills(&self) -> &SkillLibrary {
        &self.skills
    }

    /// Queues a goal
    pub async fn add_goal(&self, goal: Goal) -> Result<String> {
        self.goals.add_goal(goal).await
    }

    /// Cancels a goal, dropping its execution context if it was active
    pub async fn cancel_goal(&self, id: &str) -> Result<()> {
        self.goals.cancel_goal(id).await?;
        let mut context = self.context.lock().await;
        if context.as_ref().map(|c| c.goal_id() == id).unwrap_or(false) {
            *context = None;
        }
        info!(goal_id = id, "Goal cancelled");
        Ok(())
    }

    pub async fn active_goals(&self) -> Vec<Goal> {
        self.goals.active_goals().await
    }

    pub async fn goal_status(&self, id: &str) -> Option<GoalStatus> {
        self.goals.goal_status(id).await
    }

    pub async fn goal(&self, id: &str) -> Option<Goal> {
        self.goals.goal(id).await
    }

    pub fn pool_dashboard(&self) -> PoolDashboard {
        self.registry.dashboard()
    }

    /// Copy of the live execution context, if any
    ///
    /// Returns `None` while a step is in flight.
    pub async fn context_snapshot(&self) -> Option<ExecutionContext> {
        self.context.lock().await.clone()
    }

    /// Runs one cycle, converting a panic into an [`ErrorKind::Internal`] outcome
    pub async fn run_cycle_guarded(&self) -> CycleOutcome {
        match AssertUnwindSafe(self.run_cycle()).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(panic = %message, "Dispatcher cycle panicked");
                self.set_state(DispatcherState::Idle);
                let err = DispatchError::Message(format!("cycle panicked: {}", message));
                CycleOutcome::failed(None, &err, CycleEvent::Aborted)
            }
        }
    }

    /// Performs one unit of work
    #[instrument(skip(self))]
    pub async fn run_cycle(&self) -> CycleOutcome {
        if self.perception.should_interrupt().await {
            let drained = self.perception.drain().await;
            info!(drained, "Perception interrupt handled");
            return CycleOutcome::ok(None, CycleEvent::Interrupted { drained }, format!("drained {} inputs", drained));
        }

        let goal = match self.goals.active_goal().await {
            Some(goal) => goal,
            None => {
                *self.context.lock().await = None;
                return self.activate_next().await;
            }
        };

        {
            let mut context = self.context.lock().await;
            if context.as_ref().map(|c| c.goal_id() != goal.id).unwrap_or(false) {
                debug!(goal_id = %goal.id, "Dropping context of a goal that is no longer active");
                *context = None;
            }
        }

        if !goal.has_plan() {
            return self.plan(&goal).await;
        }

        // The context lock is not held across the step.
        let mut ctx = self
            .context
            .lock()
            .await
            .take()
            .unwrap_or_else(|| ExecutionContext::new(&goal));
        let outcome = self.execute_next(&goal, &mut ctx).await;
        let finished = matches!(
            outcome.event,
            CycleEvent::GoalCompleted | CycleEvent::GoalFailed | CycleEvent::StepFailed { .. } | CycleEvent::Aborted
        );
        if !finished && self.goals.goal_status(&goal.id).await == Some(GoalStatus::Active) {
            *self.context.lock().await = Some(ctx);
        }
        self.sample_demand().await;
        outcome
    }

    async fn activate_next(&self) -> CycleOutcome {
        self.set_state(DispatcherState::Idle);
        if let Some(next) = self.goals.next_pending().await {
            return match self.goals.set_status(&next.id, GoalStatus::Active).await {
                Ok(()) => {
                    info!(goal_id = %next.id, priority = ?next.priority, "Activated goal: {}", next.description);
                    CycleOutcome::ok(Some(next.id.as_str()), CycleEvent::GoalActivated, next.description)
                }
                Err(e) => CycleOutcome::failed(Some(next.id.as_str()), &e, CycleEvent::Aborted),
            };
        }

        let Some(goal) = self.meta.generate_goal().await else {
            return CycleOutcome::ok(None, CycleEvent::Idle, "no goals");
        };
        let description = goal.description.clone();
        let result = async {
            let id = self.goals.add_goal(goal).await?;
            self.goals.set_status(&id, GoalStatus::Active).await?;
            Ok::<_, DispatchError>(id)
        }
        .await;
        match result {
            Ok(id) => {
                info!(goal_id = %id, "Activated generated goal: {}", description);
                CycleOutcome::ok(Some(id.as_str()), CycleEvent::GoalGenerated, description)
            }
            Err(e) => {
                warn!(error = %e, "Generated goal was not accepted");
                CycleOutcome::failed(None, &e, CycleEvent::Aborted)
            }
        }
    }

    async fn plan(&self, goal: &Goal) -> CycleOutcome {
        self.set_state(DispatcherState::Planning);
        let planned = match self.planner.create_plan(&goal.description).await {
            Err(DispatchError::PlanGenerationFailure(reason)) => Err(DispatchError::PlanGenerationFailure(reason)),
            Err(e) => Err(DispatchError::PlanGenerationFailure(e.to_string())),
            Ok(plan) if plan.is_empty() => Err(DispatchError::PlanGenerationFailure("planner returned an empty plan".into())),
            Ok(plan) => {
                if self.evaluator.approve(&plan).await {
                    Ok(plan)
                } else {
                    Err(DispatchError::PlanRejected(format!("evaluator rejected a {}-step plan", plan.len())))
                }
            }
        };

        match planned {
            Ok(plan) => {
                let steps = plan.len();
                match self.goals.update_plan(&goal.id, plan).await {
                    Ok(()) => {
                        info!(goal_id = %goal.id, steps, "Plan created");
                        CycleOutcome::ok(Some(goal.id.as_str()), CycleEvent::PlanCreated { steps }, format!("{} steps", steps))
                    }
                    Err(e) => CycleOutcome::failed(Some(goal.id.as_str()), &e, CycleEvent::Aborted),
                }
            }
            Err(e) => {
                warn!(goal_id = %goal.id, error = %e, "Planning attempt invalidated");
                if let Err(store_error) = self.goals.invalidate_plan(&goal.id, &e.to_string()).await {
                    return CycleOutcome::failed(Some(goal.id.as_str()), &store_error, CycleEvent::Aborted);
                }
                CycleOutcome::failed(Some(goal.id.as_str()), &e, CycleEvent::PlanInvalidated)
            }
        }
    }

    async fn execute_next(&self, goal: &Goal, ctx: &mut ExecutionContext) -> CycleOutcome {
        self.set_state(DispatcherState::Executing);
        let Some(step) = goal.sub_tasks.first().cloned() else {
            return CycleOutcome::ok(Some(goal.id.as_str()), CycleEvent::Idle, "plan is empty");
        };
        let started = Utc::now();
        let parameters = ctx.resolve_parameters(&step.parameters);

        if self.skills.is_skill(&step.action).await {
            if let Err(e) = ctx.check_skill_expansion(&step.action) {
                return self.handle_failure(goal, ctx, &step, parameters, e, started).await;
            }
            let steps = self.skills.expand(&step.action).await.unwrap_or_default();
            let count = steps.len();
            if let Err(e) = self.goals.expand_front(&goal.id, steps).await {
                return CycleOutcome::failed(Some(goal.id.as_str()), &e, CycleEvent::Aborted);
            }
            ctx.note_skill_expansion(&step.action);
            info!(goal_id = %goal.id, skill = %step.action, steps = count, "Expanded skill");
            return CycleOutcome::ok(
                Some(goal.id.as_str()),
                CycleEvent::SkillExpanded { skill: step.action.clone(), steps: count },
                format!("{} expanded into {} steps", step.action, count),
            );
        }

        let resolved = ActionStep {
            parameters: parameters.clone(),
            ..step.clone()
        };
        match self.strategy.execute_step(&resolved, ctx).await {
            Ok(output) => {
                if let Err(e) = self.goals.pop_step(&goal.id).await {
                    return CycleOutcome::failed(Some(goal.id.as_str()), &e, CycleEvent::Aborted);
                }
                ctx.record_success(&step, parameters, output.output, started, output.retries, output.agent.clone());
                self.monitor.increment("steps_completed").await;
                self.monitor.record_time("last_step", output.elapsed).await;

                let remaining = goal.sub_tasks.len().saturating_sub(1);
                debug!(goal_id = %goal.id, action = %step.action, agent = ?output.agent, remaining, "Step completed");
                if remaining == 0 {
                    return self.complete(goal, ctx).await;
                }
                CycleOutcome::ok(
                    Some(goal.id.as_str()),
                    CycleEvent::StepCompleted { action: step.action.clone(), remaining },
                    format!("{} remaining", remaining),
                )
            }
            Err(e) => self.handle_failure(goal, ctx, &step, parameters, e, started).await,
        }
    }

    async fn complete(&self, goal: &Goal, ctx: &ExecutionContext) -> CycleOutcome {
        if let Err(e) = self.goals.complete_goal(&goal.id).await {
            return CycleOutcome::failed(Some(goal.id.as_str()), &e, CycleEvent::Aborted);
        }
        self.set_state(DispatcherState::Reflecting);

        let elapsed = (Utc::now() - goal.created_at).to_std().unwrap_or(Duration::ZERO);
        self.monitor.record_goal_completion(elapsed).await;
        let metrics = ctx.metrics();
        self.remember(MemoryEvent::new(
            "goal_reflection",
            Some(goal.id.as_str()),
            format!("Completed goal '{}' in {} steps", goal.description, metrics.steps_completed),
            json!({
                "steps_total": metrics.steps_total,
                "steps_failed": metrics.steps_failed,
                "avg_step_secs": metrics.avg_step_secs,
                "workspace_keys": ctx.workspace().keys().collect::<Vec<_>>(),
            }),
            0.8,
        ));
        info!(goal_id = %goal.id, elapsed_secs = elapsed.as_secs_f64(), "Goal completed");

        self.set_state(DispatcherState::Idle);
        CycleOutcome::ok(Some(goal.id.as_str()), CycleEvent::GoalCompleted, goal.description.clone())
    }

    async fn handle_failure(
        &self,
        goal: &Goal,
        ctx: &mut ExecutionContext,
        step: &ActionStep,
        parameters: Parameters,
        error: DispatchError,
        started: DateTime<Utc>,
    ) -> CycleOutcome {
        ctx.record_failure(step, parameters, &error, started);
        self.monitor.increment("steps_failed").await;
        let reason = error.to_string();
        warn!(goal_id = %goal.id, action = %step.action, error = %reason, "Step failed");

        let failures = match self.goals.record_failure(&goal.id, &reason).await {
            Ok(count) => count,
            Err(e) => return CycleOutcome::failed(Some(goal.id.as_str()), &e, CycleEvent::Aborted),
        };
        let max_failures = goal.max_failures.unwrap_or(self.config.max_failures);

        if failures >= max_failures {
            if let Err(e) = self.goals.fail_goal(&goal.id, &reason).await {
                return CycleOutcome::failed(Some(goal.id.as_str()), &e, CycleEvent::Aborted);
            }
            self.monitor.record_goal_failure().await;
            self.remember(MemoryEvent::new(
                "goal_failure",
                Some(goal.id.as_str()),
                format!("Gave up on goal '{}' after {} failures", goal.description, failures),
                json!({ "last_error": reason }),
                0.9,
            ));
            self.set_state(DispatcherState::Idle);
            let terminal = DispatchError::GoalMaxFailuresExceeded {
                goal_id: goal.id.clone(),
                failures,
                reason,
            };
            error!(goal_id = %goal.id, failures, "Goal failed");
            return CycleOutcome::failed(Some(goal.id.as_str()), &terminal, CycleEvent::GoalFailed);
        }

        if let Err(e) = self.goals.invalidate_plan(&goal.id, &reason).await {
            return CycleOutcome::failed(Some(goal.id.as_str()), &e, CycleEvent::Aborted);
        }
        self.set_state(DispatcherState::Planning);
        CycleOutcome::failed(
            Some(goal.id.as_str()),
            &error,
            CycleEvent::StepFailed { action: step.action.clone(), failures },
        )
    }

    /// Hands an event to memory in the background, with one retry; failures are only logged
    fn remember(&self, event: MemoryEvent) {
        let memory = Arc::clone(&self.memory);
        tokio::spawn(async move {
            let result = with_retry(
                move || {
                    let memory = Arc::clone(&memory);
                    let event = event.clone();
                    async move { memory.record(event).await }
                },
                2,
                Duration::from_millis(50),
            )
            .await;
            if let Err(e) = result {
                warn!(error = %e, "Memory record failed");
            }
        });
    }

    /// Feeds the registry one queue-length sample per remote persona
    ///
    /// The queue length is the number of planned steps assigned to the
    /// persona across all open goals. Personas are matched case-insensitively.
    pub async fn sample_demand(&self) {
        let mut queues: BTreeMap<String, usize> = self
            .registry
            .personas()
            .into_iter()
            .map(|persona| (persona.to_lowercase(), 0))
            .collect();
        for goal in self.goals.active_goals().await {
            for step in &goal.sub_tasks {
                if !self.config.is_local(&step.assigned_persona) {
                    *queues.entry(step.assigned_persona.to_lowercase()).or_insert(0) += 1;
                }
            }
        }
        for (persona, queue_length) in queues {
            if !self.config.is_local(&persona) {
                self.registry.sample_demand(&persona, queue_length);
                self.monitor
                    .set_gauge(&format!("queue.{}", persona), queue_length as f64)
                    .await;
            }
        }
        self.monitor
            .set_gauge("agents.busy", self.registry.busy_count() as f64)
            .await;
    }
}

#[cfg(test)]
mod tests;
