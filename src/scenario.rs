//! TOML-described agents, goals, skills and canned plans
//!
//! A scenario wires the whole system together in-process: it registers
//! agents and starts a worker for each, loads skills, queues goals and
//! serves plans by goal description.
//!
//! ```toml
//! [[agents]]
//! name = "coder_1"
//! persona = "coder"
//! trust = 0.7
//!
//! [[handlers]]
//! persona = "coder"
//! actions = ["write_code"]
//! failing = ["deploy"]
//!
//! [[goals]]
//! id = "api"
//! description = "Build the API"
//! priority = "HIGH"
//!
//! [plans]
//! "Build the API" = [{ action = "write_code", assigned_persona = "coder" }]
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};
use crate::capabilities::CapabilityMap;
use crate::channel::MessageBus;
use crate::collaborators::Planner;
use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::error::{DispatchError, Result};
use crate::goal::{ActionStep, Goal, GoalPriority};
use crate::goal_store::InMemoryGoalStore;
use crate::metrics::PerformanceMonitor;
use crate::pool::AgentRegistry;
use crate::skills::{Skill, SkillLibrary};
use crate::strategy;
use crate::worker::{spawn_worker, WorkerAttacher};

/// An agent to register at startup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSpec {
    pub name: String,
    pub persona: String,
    /// Initial trust; the configured default when absent
    #[serde(default)]
    pub trust: Option<f64>,
}

/// Actions a persona can perform
///
/// Every action answers with a JSON object naming the action, the persona
/// and the parameters it received. Actions listed in `failing` always fail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerSpec {
    pub persona: String,
    #[serde(default)]
    pub actions: Vec<String>,
    #[serde(default)]
    pub failing: Vec<String>,
    /// Simulated work time per call
    #[serde(default)]
    pub delay_ms: u64,
}

/// A goal to queue at startup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoalSpec {
    pub id: String,
    pub description: String,
    #[serde(default)]
    pub priority: GoalPriority,
    #[serde(default)]
    pub max_failures: Option<u32>,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl GoalSpec {
    fn to_goal(&self) -> Goal {
        let mut goal = Goal::with_id(&self.id, &self.description, self.priority);
        goal.max_failures = self.max_failures;
        goal.dependencies = self.depends_on.clone();
        goal
    }
}

/// Parsed scenario file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Scenario {
    pub agents: Vec<AgentSpec>,
    pub handlers: Vec<HandlerSpec>,
    pub goals: Vec<GoalSpec>,
    pub skills: Vec<Skill>,
    /// Plans keyed by goal description
    pub plans: HashMap<String, Vec<ActionStep>>,
}

impl Scenario {
    /// Parses a scenario from TOML text
    pub fn parse(content: &str) -> Result<Self> {
        let mut scenario: Scenario = toml::from_str(content)?;
        scenario.normalize();
        scenario.check()?;
        Ok(scenario)
    }

    /// Reads and parses a scenario file
    pub async fn from_file(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        let scenario = Self::parse(&content)?;
        info!(
            path = %path.display(),
            agents = scenario.agents.len(),
            goals = scenario.goals.len(),
            skills = scenario.skills.len(),
            "Loaded scenario"
        );
        Ok(scenario)
    }

    fn normalize(&mut self) {
        for agent in &mut self.agents {
            agent.persona = agent.persona.to_lowercase();
        }
        for handler in &mut self.handlers {
            handler.persona = handler.persona.to_lowercase();
        }
        let steps = self
            .plans
            .values_mut()
            .flatten()
            .chain(self.skills.iter_mut().flat_map(|s| s.action_sequence.iter_mut()));
        for step in steps {
            step.assigned_persona = step.assigned_persona.to_lowercase();
        }
    }

    fn check(&self) -> Result<()> {
        let mut ids = std::collections::HashSet::new();
        for goal in &self.goals {
            if !ids.insert(goal.id.as_str()) {
                return Err(DispatchError::DuplicateGoal(goal.id.clone()));
            }
        }
        for goal in &self.goals {
            if let Some(missing) = goal.depends_on.iter().find(|d| !ids.contains(d.as_str())) {
                return Err(DispatchError::Config(format!(
                    "goal '{}' depends on unknown goal '{}'",
                    goal.id, missing
                )));
            }
        }
        Ok(())
    }

    /// Handlers for every persona named in `handlers`
    pub fn capabilities(&self) -> CapabilityMap {
        let mut map = CapabilityMap::new();
        for handler in &self.handlers {
            let delay = Duration::from_millis(handler.delay_ms);
            for action in &handler.actions {
                let persona = handler.persona.clone();
                let name = action.clone();
                map.register_fn(&handler.persona, action, move |params| {
                    let persona = persona.clone();
                    let name = name.clone();
                    async move {
                        if !delay.is_zero() {
                            tokio::time::sleep(delay).await;
                        }
                        Ok(json!({
                            "action": name,
                            "handled_by": persona,
                            "parameters": Value::Object(params),
                        }))
                    }
                });
            }
            for action in &handler.failing {
                let name = action.clone();
                map.register_fn(&handler.persona, action, move |_| {
                    let name = name.clone();
                    async move {
                        Err(DispatchError::StepExecutionError {
                            action: name,
                            reason: "simulated failure".into(),
                        })
                    }
                });
            }
        }
        map
    }

    /// Planner serving this scenario's canned plans
    pub fn planner(&self) -> ScenarioPlanner {
        ScenarioPlanner::new(self.plans.clone())
    }

    /// Goals in file order, all pending
    pub fn goals(&self) -> Vec<Goal> {
        self.goals.iter().map(GoalSpec::to_goal).collect()
    }

    /// Registers every agent
    pub fn register_agents(&self, registry: &AgentRegistry) -> Result<()> {
        for agent in &self.agents {
            let trust = agent.trust.unwrap_or(registry.trust_config().initial);
            registry.register(&agent.name, &agent.persona, trust)?;
        }
        Ok(())
    }

    /// Builds a skill library that refuses names of handled actions
    pub async fn skill_library(&self) -> Result<SkillLibrary> {
        let reserved = self
            .handlers
            .iter()
            .flat_map(|h| h.actions.iter().chain(h.failing.iter()))
            .cloned();
        let library = SkillLibrary::with_reserved(reserved);
        for skill in &self.skills {
            library.add_skill(skill.clone()).await?;
        }
        Ok(library)
    }

    /// Wires a complete system and queues the scenario's goals
    ///
    /// Every agent gets a worker listening on the bus, and agents added by
    /// the autoscaler get one too.
    pub async fn build(&self, config: &Config) -> Result<ScenarioSystem> {
        let capabilities = self.capabilities();
        let bus = MessageBus::new();
        let monitor = Arc::new(PerformanceMonitor::new());
        let registry = Arc::new(AgentRegistry::from_config(config));

        self.register_agents(&registry)?;
        for agent in &self.agents {
            spawn_worker(&bus, &agent.name, &agent.persona, &capabilities).await;
        }
        registry.set_scale_hook(Arc::new(WorkerAttacher::new(bus.clone(), capabilities.clone())));

        let strategy = strategy::from_config(
            config,
            Arc::new(capabilities),
            Arc::clone(&registry),
            bus.clone(),
            Arc::clone(&monitor),
        );
        let dispatcher = Dispatcher::new(
            config.dispatcher.clone(),
            Arc::new(InMemoryGoalStore::new()),
            Arc::clone(&registry),
            strategy,
            Arc::new(self.planner()),
        )
        .with_skills(self.skill_library().await?)
        .with_monitor(Arc::clone(&monitor));

        for goal in self.goals() {
            dispatcher.add_goal(goal).await?;
        }

        Ok(ScenarioSystem {
            dispatcher: Arc::new(dispatcher),
            bus,
            registry,
            monitor,
        })
    }
}

/// Handles to a system built by [`Scenario::build`]
pub struct ScenarioSystem {
    pub dispatcher: Arc<Dispatcher>,
    pub bus: MessageBus,
    pub registry: Arc<AgentRegistry>,
    pub monitor: Arc<PerformanceMonitor>,
}

/// Serves fixed plans keyed by goal description
#[derive(Debug, Clone, Default)]
pub struct ScenarioPlanner {
    plans: HashMap<String, Vec<ActionStep>>,
}

impl ScenarioPlanner {
    pub fn new(plans: HashMap<String, Vec<ActionStep>>) -> Self {
        Self { plans }
    }
}

#[async_trait]
impl Planner for ScenarioPlanner {
    async fn create_plan(&self, description: &str) -> Result<Vec<ActionStep>> {
        debug!(description, "Looking up canned plan");
        self.plans
            .get(description)
            .cloned()
            .ok_or_else(|| DispatchError::PlanGenerationFailure(format!("no plan for '{}'", description)))
    }
}
