//! Transient run state of the goal being executed

use std::collections::VecDeque;
use std::time::Duration;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;
use crate::error::{DispatchError, Result};
use crate::goal::{ActionStep, Goal, Parameters};

/// Workspace key seeded with the goal's description
pub const GOAL_DESCRIPTION_KEY: &str = "goal_description";

/// Consecutive expansions of one skill tolerated before the guard trips
pub const MAX_CONSECUTIVE_EXPANSIONS: usize = 3;

const SKILL_HISTORY_LEN: usize = 5;

static PLACEHOLDER: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"^\{([A-Za-z0-9_\-]+(?:\.[A-Za-z0-9_\-]+)*)\}$").ok());

/// One attempted step
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepRecord {
    pub action: String,
    /// Parameters after placeholder resolution
    pub parameters: Parameters,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub retry_count: u32,
    /// Remote agent that ran the step, if it was delegated
    pub agent: Option<String>,
}

/// Running counters for one context
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ContextMetrics {
    pub steps_total: u32,
    pub steps_completed: u32,
    pub steps_failed: u32,
    /// Mean wall time of attempted steps, in seconds
    pub avg_step_secs: f64,
}

/// Workspace, history and counters for the active goal
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionContext {
    goal_id: String,
    current_step: usize,
    workspace: Parameters,
    history: Vec<StepRecord>,
    metrics: ContextMetrics,
    skill_history: VecDeque<String>,
}

impl ExecutionContext {
    /// Creates the context for `goal`, seeding the workspace with its description
    pub fn new(goal: &Goal) -> Self {
        let mut workspace = Parameters::new();
        workspace.insert(GOAL_DESCRIPTION_KEY.to_string(), Value::String(goal.description.clone()));
        Self {
            goal_id: goal.id.clone(),
            current_step: 0,
            workspace,
            history: Vec::new(),
            metrics: ContextMetrics::default(),
            skill_history: VecDeque::new(),
        }
    }

    pub fn goal_id(&self) -> &str {
        &self.goal_id
    }

    /// Index of the next step within the goal's run
    pub fn current_step(&self) -> usize {
        self.current_step
    }

    pub fn workspace(&self) -> &Parameters {
        &self.workspace
    }

    pub fn history(&self) -> &[StepRecord] {
        &self.history
    }

    pub fn metrics(&self) -> &ContextMetrics {
        &self.metrics
    }

    /// Looks up a dotted path such as `stepA.items.0.name`
    ///
    /// Segments index into objects by key and into arrays by position.
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let mut current = self.workspace.get(segments.next()?)?;
        for segment in segments {
            current = match current {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Replaces `{path}` strings with workspace values, recursing into
    /// nested objects and arrays
    ///
    /// Placeholders that do not resolve are logged and kept verbatim.
    pub fn resolve_parameters(&self, parameters: &Parameters) -> Parameters {
        parameters
            .iter()
            .map(|(key, value)| (key.clone(), self.resolve_value(value)))
            .collect()
    }

    fn resolve_value(&self, value: &Value) -> Value {
        match value {
            Value::String(text) => match PLACEHOLDER.as_ref().and_then(|re| re.captures(text)) {
                Some(captures) => {
                    let path = &captures[1];
                    match self.lookup(path) {
                        Some(resolved) => resolved.clone(),
                        None => {
                            warn!(goal_id = %self.goal_id, placeholder = %text, "Unresolved workspace placeholder");
                            value.clone()
                        }
                    }
                }
                None => value.clone(),
            },
            Value::Object(map) => Value::Object(self.resolve_parameters(map)),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.resolve_value(v)).collect()),
            other => other.clone(),
        }
    }

    /// Fails when `skill` was already the last three consecutive expansions
    pub fn check_skill_expansion(&self, skill: &str) -> Result<()> {
        let repeated = self.skill_history.len() >= MAX_CONSECUTIVE_EXPANSIONS
            && self
                .skill_history
                .iter()
                .rev()
                .take(MAX_CONSECUTIVE_EXPANSIONS)
                .all(|s| s == skill);
        if repeated {
            return Err(DispatchError::RecursiveSkillExpansion { skill: skill.to_string() });
        }
        Ok(())
    }

    /// Remembers an expansion, keeping the last five
    pub fn note_skill_expansion(&mut self, skill: &str) {
        self.skill_history.push_back(skill.to_string());
        while self.skill_history.len() > SKILL_HISTORY_LEN {
            self.skill_history.pop_front();
        }
    }

    /// Records a completed step and stores its output under the action name
    pub fn record_success(
        &mut self,
        step: &ActionStep,
        parameters: Parameters,
        output: Value,
        started_at: DateTime<Utc>,
        retry_count: u32,
        agent: Option<String>,
    ) {
        self.workspace.insert(step.action.clone(), output.clone());
        self.push_record(StepRecord {
            action: step.action.clone(),
            parameters,
            result: Some(output),
            error: None,
            started_at,
            finished_at: Utc::now(),
            retry_count,
            agent,
        });
        self.metrics.steps_completed += 1;
        self.current_step += 1;
    }

    /// Records a failed step
    pub fn record_failure(
        &mut self,
        step: &ActionStep,
        parameters: Parameters,
        error: &DispatchError,
        started_at: DateTime<Utc>,
    ) {
        self.push_record(StepRecord {
            action: step.action.clone(),
            parameters,
            result: None,
            error: Some(error.to_string()),
            started_at,
            finished_at: Utc::now(),
            retry_count: 0,
            agent: error.agent().map(str::to_string),
        });
        self.metrics.steps_failed += 1;
    }

    fn push_record(&mut self, record: StepRecord) {
        let elapsed = (record.finished_at - record.started_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
            .as_secs_f64();
        let n = self.metrics.steps_total as f64;
        self.metrics.avg_step_secs = (self.metrics.avg_step_secs * n + elapsed) / (n + 1.0);
        self.metrics.steps_total += 1;
        self.history.push(record);
    }
}
