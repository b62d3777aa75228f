//! Narrow interfaces to the systems the dispatcher consults
//!
//! Planning, plan review, goal synthesis, perception and memory live outside
//! this crate. The dispatcher only depends on these traits.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::info;
use crate::error::Result;
use crate::goal::{ActionStep, Goal};

#[cfg(test)]
use mockall::automock;

/// Produces a plan for a goal description
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Planner: Send + Sync {
    async fn create_plan(&self, description: &str) -> Result<Vec<ActionStep>>;
}

/// Approves or rejects a plan before it is stored
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Evaluator: Send + Sync {
    async fn approve(&self, plan: &[ActionStep]) -> bool;
}

/// Synthesizes a goal when nothing is queued
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MetaCognition: Send + Sync {
    async fn generate_goal(&self) -> Option<Goal>;
}

/// External input that can preempt goal work
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Perception: Send + Sync {
    async fn should_interrupt(&self) -> bool;

    /// Processes pending input and returns how many items were handled
    async fn drain(&self) -> usize;
}

/// Audit and reflection entry handed to [`Memory`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemoryEvent {
    /// Event category, e.g. `goal_reflection`
    pub kind: String,
    pub goal_id: Option<String>,
    pub summary: String,
    pub details: Value,
    pub importance: f64,
    pub timestamp: DateTime<Utc>,
}

impl MemoryEvent {
    pub fn new(kind: &str, goal_id: Option<&str>, summary: impl Into<String>, details: Value, importance: f64) -> Self {
        Self {
            kind: kind.to_string(),
            goal_id: goal_id.map(str::to_string),
            summary: summary.into(),
            details,
            importance: importance.clamp(0.0, 1.0),
            timestamp: Utc::now(),
        }
    }
}

/// Fire-and-forget sink for reflections
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Memory: Send + Sync {
    async fn record(&self, event: MemoryEvent) -> Result<()>;
}

/// Never interrupts
#[derive(Debug, Default, Clone, Copy)]
pub struct NoInterrupts;

#[async_trait]
impl Perception for NoInterrupts {
    async fn should_interrupt(&self) -> bool {
        false
    }

    async fn drain(&self) -> usize {
        0
    }
}

/// Never proposes goals
#[derive(Debug, Default, Clone, Copy)]
pub struct NoGoalSynthesis;

#[async_trait]
impl MetaCognition for NoGoalSynthesis {
    async fn generate_goal(&self) -> Option<Goal> {
        None
    }
}

/// Approves every non-empty plan
#[derive(Debug, Default, Clone, Copy)]
pub struct ApproveAll;

#[async_trait]
impl Evaluator for ApproveAll {
    async fn approve(&self, plan: &[ActionStep]) -> bool {
        !plan.is_empty()
    }
}

/// Writes memory events to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMemory;

#[async_trait]
impl Memory for TracingMemory {
    async fn record(&self, event: MemoryEvent) -> Result<()> {
        info!(kind = %event.kind, goal_id = ?event.goal_id, importance = event.importance, "{}", event.summary);
        Ok(())
    }
}
