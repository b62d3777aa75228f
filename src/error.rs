use std::io;
use std::time::Duration;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Custom result type alias for the dispatcher
pub type Result<T> = std::result::Result<T, DispatchError>;

/// Errors that can occur while dispatching goals and steps
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The planner could not produce a plan for a goal
    #[error("Plan generation failed: {0}")]
    PlanGenerationFailure(String),

    /// The evaluator rejected a generated plan
    #[error("Plan rejected: {0}")]
    PlanRejected(String),

    /// A delegated step received no reply in time
    #[error("Delegation to '{agent}' timed out after {timeout:?}")]
    DelegationTimeout {
        /// Agent the step was delegated to
        agent: String,
        /// Timeout that elapsed
        timeout: Duration,
    },

    /// No idle agent exists for the requested persona
    #[error("No idle agent available for persona '{persona}'")]
    DelegationUnavailable {
        /// Persona that was requested
        persona: String,
    },

    /// The agent replied with a failure
    #[error("Agent '{agent}' rejected the task: {reason}")]
    DelegationRejected {
        /// Agent that rejected the task
        agent: String,
        /// Reason reported by the agent
        reason: String,
    },

    /// A local handler failed or does not exist
    #[error("Step '{action}' failed: {reason}")]
    StepExecutionError {
        /// Action name of the step
        action: String,
        /// Failure description
        reason: String,
    },

    /// The same skill kept expanding into itself
    #[error("Infinite recursion detected: skill '{skill}' expanded repeatedly")]
    RecursiveSkillExpansion {
        /// Skill name
        skill: String,
    },

    /// A goal exhausted its failure budget
    #[error("Goal '{goal_id}' failed {failures} times: {reason}")]
    GoalMaxFailuresExceeded {
        /// Goal identifier
        goal_id: String,
        /// Number of failures recorded
        failures: u32,
        /// Last failure reason
        reason: String,
    },

    /// A goal with the same id already exists
    #[error("Goal '{0}' already exists")]
    DuplicateGoal(String),

    /// No goal with the given id
    #[error("Goal '{0}' not found")]
    GoalNotFound(String),

    /// The goal already reached a terminal status
    #[error("Goal '{0}' is terminal and cannot be modified")]
    GoalTerminal(String),

    /// Another goal is already active
    #[error("Goal '{active}' is already active; cannot activate '{requested}'")]
    ActiveGoalConflict {
        /// Currently active goal
        active: String,
        /// Goal that was requested
        requested: String,
    },

    /// No agent with the given name
    #[error("Agent '{0}' not found")]
    UnknownAgent(String),

    /// An agent with the same name is already registered
    #[error("Agent '{0}' already registered")]
    DuplicateAgent(String),

    /// Message channel errors
    #[error("Channel error: {0}")]
    Channel(String),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(String),

    /// General message errors
    #[error("{0}")]
    Message(String),

    /// I/O errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON parsing/serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parsing errors
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Serializable classification of a [`DispatchError`], used in cycle outcomes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Planner failure
    PlanGenerationFailure,
    /// Evaluator rejection
    PlanRejected,
    /// Delegation reply timeout
    DelegationTimeout,
    /// No idle agent
    DelegationUnavailable,
    /// Agent replied with a failure
    DelegationRejected,
    /// Local handler failure
    StepExecutionError,
    /// Skill expansion loop
    RecursiveSkillExpansionError,
    /// Goal failure budget exhausted
    GoalMaxFailuresExceeded,
    /// Goal store rejected the operation
    GoalStore,
    /// Anything else, including caught panics
    Internal,
}

impl DispatchError {
    /// Creates a new error with the specified message
    pub fn new(message: &str) -> Self {
        Self::Message(message.to_string())
    }

    /// Returns the structured kind of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::PlanGenerationFailure(_) => ErrorKind::PlanGenerationFailure,
            Self::PlanRejected(_) => ErrorKind::PlanRejected,
            Self::DelegationTimeout { .. } => ErrorKind::DelegationTimeout,
            Self::DelegationUnavailable { .. } => ErrorKind::DelegationUnavailable,
            Self::DelegationRejected { .. } => ErrorKind::DelegationRejected,
            Self::StepExecutionError { .. } => ErrorKind::StepExecutionError,
            Self::RecursiveSkillExpansion { .. } => ErrorKind::RecursiveSkillExpansionError,
            Self::GoalMaxFailuresExceeded { .. } => ErrorKind::GoalMaxFailuresExceeded,
            Self::DuplicateGoal(_)
            | Self::GoalNotFound(_)
            | Self::GoalTerminal(_)
            | Self::ActiveGoalConflict { .. } => ErrorKind::GoalStore,
            _ => ErrorKind::Internal,
        }
    }

    /// Only an exhausted failure budget ends a goal
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::GoalMaxFailuresExceeded { .. })
    }

    /// Checks if this error is transient and retryable
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::DelegationTimeout { .. } |
            Self::DelegationUnavailable { .. } |
            Self::Io(_)
        )
    }

    /// Name of the agent involved in a delegation failure, if any
    pub fn agent(&self) -> Option<&str> {
        match self {
            Self::DelegationTimeout { agent, .. } | Self::DelegationRejected { agent, .. } => Some(agent),
            _ => None,
        }
    }
}
