//! Goal and plan data model
//!
//! A [`Goal`] carries its plan as an ordered list of [`ActionStep`]s. The
//! plan is only ever consumed from the front or replaced wholesale.

use std::collections::HashMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Metadata key holding the most recent failure description
pub const LAST_FAILURE_REASON: &str = "last_failure_reason";

/// JSON parameter map carried by a step
pub type Parameters = Map<String, Value>;

/// Goal priority, ordered from lowest to highest
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum GoalPriority {
    /// Background work
    Low,
    /// Default priority
    Medium,
    /// Preferred over medium and low
    High,
    /// Always served first
    Critical,
}

impl Default for GoalPriority {
    fn default() -> Self {
        Self::Medium
    }
}

/// Lifecycle status of a goal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum GoalStatus {
    /// Queued, not yet worked on
    Pending,
    /// Currently owned by the dispatcher
    Active,
    /// All steps executed
    Completed,
    /// Failure budget exhausted
    Failed,
    /// Withdrawn by an operator
    Cancelled,
}

impl GoalStatus {
    /// Terminal statuses accept no further mutation
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Pending and active goals are "open"
    pub fn is_open(self) -> bool {
        matches!(self, Self::Pending | Self::Active)
    }
}

/// A single step in a plan, designed for delegation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionStep {
    /// Action name, or the name of a learned skill
    pub action: String,
    /// Parameters; string values of the form `{a.b}` reference the workspace
    #[serde(default)]
    pub parameters: Parameters,
    /// Capability tag of the worker (or local handler) that runs the step
    pub assigned_persona: String,
    /// Optional human-readable reason for the step
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
}

impl ActionStep {
    /// Creates a step with no parameters
    pub fn new(action: impl Into<String>, persona: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            parameters: Parameters::new(),
            assigned_persona: persona.into().to_lowercase(),
            rationale: None,
        }
    }

    /// Adds a parameter
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    /// Sets the rationale
    pub fn with_rationale(mut self, rationale: impl Into<String>) -> Self {
        self.rationale = Some(rationale.into());
        self
    }

    /// Complexity hint in [0, 1], read from the `complexity` parameter
    pub fn complexity(&self, default: f64) -> f64 {
        self.parameters
            .get("complexity")
            .and_then(Value::as_f64)
            .unwrap_or(default)
            .clamp(0.0, 1.0)
    }
}

/// A prioritized unit of work and its plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Goal {
    /// Unique identifier
    pub id: String,
    /// What the goal should achieve
    pub description: String,
    /// Scheduling priority
    #[serde(default)]
    pub priority: GoalPriority,
    /// Lifecycle status
    pub status: GoalStatus,
    /// Remaining plan, consumed from the front
    #[serde(default)]
    pub sub_tasks: Vec<ActionStep>,
    /// Step failures recorded so far
    #[serde(default)]
    pub failure_count: u32,
    /// Step failures allowed before the goal fails; `None` uses the dispatcher default
    #[serde(default)]
    pub max_failures: Option<u32>,
    /// Goals that must complete before this one may start
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Time of the last mutation
    pub updated_at: DateTime<Utc>,
    /// Free-form metadata; see [`LAST_FAILURE_REASON`]
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Goal {
    /// Creates a pending goal with a random id
    pub fn new(description: impl Into<String>, priority: GoalPriority) -> Self {
        let id = format!("goal_{}", &uuid::Uuid::new_v4().simple().to_string()[..16]);
        Self::with_id(id, description, priority)
    }

    /// Creates a pending goal with the given id
    pub fn with_id(id: impl Into<String>, description: impl Into<String>, priority: GoalPriority) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            description: description.into(),
            priority,
            status: GoalStatus::Pending,
            sub_tasks: Vec::new(),
            failure_count: 0,
            max_failures: None,
            dependencies: Vec::new(),
            created_at: now,
            updated_at: now,
            metadata: HashMap::new(),
        }
    }

    /// Sets a pre-built plan
    pub fn with_plan(mut self, plan: Vec<ActionStep>) -> Self {
        self.sub_tasks = plan;
        self
    }

    /// Overrides the failure budget
    pub fn with_max_failures(mut self, max_failures: u32) -> Self {
        self.max_failures = Some(max_failures);
        self
    }

    /// Adds a dependency on another goal
    pub fn depends_on(mut self, goal_id: impl Into<String>) -> Self {
        self.dependencies.push(goal_id.into());
        self
    }

    /// Whether a plan is currently attached
    pub fn has_plan(&self) -> bool {
        !self.sub_tasks.is_empty()
    }

    /// The most recent failure description, if any
    pub fn last_failure_reason(&self) -> Option<&str> {
        self.metadata.get(LAST_FAILURE_REASON).map(String::as_str)
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
