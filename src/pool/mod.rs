//! Agent registry: worker identities, trust, busy state and demand
//!
//! All agent state lives behind one `std::sync::RwLock`. Critical sections
//! never span an `.await`, which lets [`BusyGuard`] release an agent from
//! `Drop` on every exit path of a delegation.

mod scaling;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};
use crate::config::{Config, ScalingBounds, ScalingSettings, TrustConfig};
use crate::error::{DispatchError, Result};

pub use scaling::{run_autoscaler, ScaleAction, ScaleEvent, ScaleHook};

/// Smoothing factor for the response-time moving average
pub const RESPONSE_EMA_ALPHA: f64 = 0.3;

const NEUTRAL_TRUST: f64 = 0.5;
const NEUTRAL_SUCCESS_RATE: f64 = 0.5;

/// Snapshot of one worker agent
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentRecord {
    /// Unique agent name, also its mailbox address
    pub name: String,
    /// Capability tag, lower-case
    pub persona: String,
    /// Reputation in `[0, trust.max]`
    pub trust_score: f64,
    /// Set while a delegated step is outstanding
    pub busy: bool,
    /// Outcomes recorded
    pub total_tasks: u64,
    /// Successful outcomes
    pub successful_tasks: u64,
    /// Failed outcomes
    pub failed_tasks: u64,
    /// Moving average of reply latency in seconds; `None` before the first sample
    pub avg_response_secs: Option<f64>,
    /// Last time the agent was selected or reported an outcome
    pub last_used: DateTime<Utc>,
    recent: VecDeque<bool>,
}

impl AgentRecord {
    fn new(name: &str, persona: &str, trust_score: f64) -> Self {
        Self {
            name: name.to_string(),
            persona: persona.to_string(),
            trust_score,
            busy: false,
            total_tasks: 0,
            successful_tasks: 0,
            failed_tasks: 0,
            avg_response_secs: None,
            last_used: Utc::now(),
            recent: VecDeque::new(),
        }
    }

    /// Success rate over the recent window, 0.5 without history
    pub fn recent_success_rate(&self) -> f64 {
        if self.recent.is_empty() {
            return NEUTRAL_SUCCESS_RATE;
        }
        self.recent.iter().filter(|ok| **ok).count() as f64 / self.recent.len() as f64
    }

    /// Lifetime success rate, 0.5 without history
    pub fn success_rate(&self) -> f64 {
        if self.total_tasks == 0 {
            NEUTRAL_SUCCESS_RATE
        } else {
            self.successful_tasks as f64 / self.total_tasks as f64
        }
    }
}

/// Queue-length samples and scaling bounds for one persona
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PersonaDemand {
    /// Persona key
    pub persona: String,
    /// Most recent queue length sample
    pub current_queue_length: usize,
    /// Average over the sample window
    pub average_queue_length: f64,
    /// Agent-count bounds
    pub bounds: ScalingBounds,
    samples: VecDeque<usize>,
}

impl PersonaDemand {
    fn new(persona: &str, bounds: ScalingBounds) -> Self {
        Self {
            persona: persona.to_string(),
            current_queue_length: 0,
            average_queue_length: 0.0,
            bounds,
            samples: VecDeque::new(),
        }
    }
}

/// Per-persona line of the pool dashboard
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PersonaStats {
    pub agent_count: usize,
    pub busy_agents: usize,
    /// Mean lifetime success rate of the persona's agents
    pub average_success_rate: f64,
    pub current_queue_length: usize,
    pub average_queue_length: f64,
    pub scaling_config: ScalingBounds,
}

/// Read-only overview of the pool
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolDashboard {
    pub total_agents: usize,
    pub total_personas: usize,
    /// Stats keyed by persona, sorted by name
    pub personas: Vec<(String, PersonaStats)>,
}

#[derive(Debug, Default)]
struct PoolState {
    agents: HashMap<String, AgentRecord>,
    demand: HashMap<String, PersonaDemand>,
}

impl PoolState {
    fn agent_mut(&mut self, name: &str) -> Result<&mut AgentRecord> {
        self.agents
            .get_mut(name)
            .ok_or_else(|| DispatchError::UnknownAgent(name.to_string()))
    }

    fn count_for(&self, persona: &str) -> usize {
        self.agents.values().filter(|a| a.persona == persona).count()
    }
}

/// Scoring used by [`AgentRegistry::select_best`]
fn select_from<'a>(candidates: impl Iterator<Item = &'a AgentRecord>) -> Option<&'a AgentRecord> {
    let candidates: Vec<&AgentRecord> = candidates.collect();
    let max_response = candidates
        .iter()
        .filter_map(|a| a.avg_response_secs)
        .fold(0.0_f64, f64::max);

    let score = |agent: &AgentRecord| {
        let normalized = match agent.avg_response_secs {
            Some(secs) if max_response > 0.0 => secs / max_response,
            _ => 0.0,
        };
        0.6 * agent.trust_score + 0.3 * agent.recent_success_rate() + 0.1 * (1.0 - normalized)
    };

    candidates.into_iter().max_by(|a, b| {
        score(a)
            .total_cmp(&score(b))
            .then_with(|| a.total_tasks.cmp(&b.total_tasks))
            .then_with(|| b.name.cmp(&a.name))
    })
}

/// Marks an agent busy for as long as it is alive
///
/// Dropping the guard clears the busy flag, so cancellation and panics
/// cannot leave an agent stuck busy.
#[derive(Debug)]
pub struct BusyGuard {
    state: Arc<RwLock<PoolState>>,
    name: String,
    persona: String,
}

impl BusyGuard {
    /// Name of the acquired agent
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Persona of the acquired agent
    pub fn persona(&self) -> &str {
        &self.persona
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(agent) = state.agents.get_mut(&self.name) {
            agent.busy = false;
        }
    }
}

/// Registry of worker agents
pub struct AgentRegistry {
    state: Arc<RwLock<PoolState>>,
    trust: TrustConfig,
    scaling: ScalingSettings,
    hook: RwLock<Option<Arc<dyn ScaleHook>>>,
    spawned: AtomicU64,
}

impl AgentRegistry {
    /// Creates an empty registry
    pub fn new(trust: TrustConfig, scaling: ScalingSettings) -> Self {
        Self {
            state: Arc::new(RwLock::new(PoolState::default())),
            trust,
            scaling,
            hook: RwLock::new(None),
            spawned: AtomicU64::new(0),
        }
    }

    /// Creates an empty registry using the trust and scaling sections of `config`
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.trust.clone(), config.scaling.clone())
    }

    /// Trust settings in use
    pub fn trust_config(&self) -> &TrustConfig {
        &self.trust
    }

    /// Scaling settings in use
    pub fn scaling_settings(&self) -> &ScalingSettings {
        &self.scaling
    }

    fn read(&self) -> RwLockReadGuard<'_, PoolState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, PoolState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds an agent; the persona is lower-cased
    pub fn register(&self, name: &str, persona: &str, initial_trust: f64) -> Result<()> {
        let persona = persona.to_lowercase();
        let mut state = self.write();
        if state.agents.contains_key(name) {
            return Err(DispatchError::DuplicateAgent(name.to_string()));
        }
        let trust = initial_trust.clamp(0.0, self.trust.max);
        state.agents.insert(name.to_string(), AgentRecord::new(name, &persona, trust));
        info!(agent = name, persona = %persona, trust, "Registered agent");
        Ok(())
    }

    /// Adds an agent with the configured initial trust
    pub fn register_default(&self, name: &str, persona: &str) -> Result<()> {
        self.register(name, persona, self.trust.initial)
    }

    /// Removes an agent and returns its final record
    pub fn unregister(&self, name: &str) -> Result<AgentRecord> {
        let record = self
            .write()
            .agents
            .remove(name)
            .ok_or_else(|| DispatchError::UnknownAgent(name.to_string()))?;
        if record.busy {
            warn!(agent = name, "Unregistered an agent while busy");
        }
        info!(agent = name, persona = %record.persona, "Unregistered agent");
        Ok(record)
    }

    /// Snapshot of one agent
    pub fn agent(&self, name: &str) -> Option<AgentRecord> {
        self.read().agents.get(name).cloned()
    }

    /// Snapshots of a persona's agents, sorted by name
    pub fn agents_by_persona(&self, persona: &str) -> Vec<AgentRecord> {
        let persona = persona.to_lowercase();
        let mut agents: Vec<AgentRecord> = self
            .read()
            .agents
            .values()
            .filter(|a| a.persona == persona)
            .cloned()
            .collect();
        agents.sort_by(|a, b| a.name.cmp(&b.name));
        agents
    }

    /// Every persona that has agents or demand data, sorted
    pub fn personas(&self) -> Vec<String> {
        let state = self.read();
        let mut personas: Vec<String> = state
            .agents
            .values()
            .map(|a| a.persona.clone())
            .chain(state.demand.keys().cloned())
            .collect();
        personas.sort();
        personas.dedup();
        personas
    }

    /// Number of registered agents
    pub fn len(&self) -> usize {
        self.read().agents.len()
    }

    /// Checks whether the registry has no agents
    pub fn is_empty(&self) -> bool {
        self.read().agents.is_empty()
    }

    /// Applies the reward/decay update and returns the new trust
    ///
    /// Success adds `reward_rate * complexity`, failure subtracts
    /// `decay_rate * complexity`; the result is clamped to `[0, trust.max]`.
    pub fn record_outcome(&self, name: &str, success: bool, complexity: f64) -> Result<f64> {
        let complexity = if complexity.is_finite() { complexity.clamp(0.0, 1.0) } else { 0.0 };
        let mut state = self.write();
        let agent = state.agent_mut(name)?;

        let delta = if success {
            self.trust.reward_rate * complexity
        } else {
            -self.trust.decay_rate * complexity
        };
        agent.trust_score = (agent.trust_score + delta).clamp(0.0, self.trust.max);
        agent.total_tasks += 1;
        if success {
            agent.successful_tasks += 1;
        } else {
            agent.failed_tasks += 1;
        }
        agent.recent.push_back(success);
        while agent.recent.len() > self.trust.recent_window {
            agent.recent.pop_front();
        }
        agent.last_used = Utc::now();

        debug!(agent = name, success, trust = agent.trust_score, "Recorded agent outcome");
        Ok(agent.trust_score)
    }

    /// Folds a reply latency into the agent's moving average
    pub fn record_response(&self, name: &str, elapsed: Duration) -> Result<()> {
        let mut state = self.write();
        let agent = state.agent_mut(name)?;
        let secs = elapsed.as_secs_f64();
        agent.avg_response_secs = Some(match agent.avg_response_secs {
            Some(avg) => RESPONSE_EMA_ALPHA * secs + (1.0 - RESPONSE_EMA_ALPHA) * avg,
            None => secs,
        });
        Ok(())
    }

    /// Best idle agent of `persona`, or `None` when all are busy or none exist
    ///
    /// Agents score `0.6 * trust + 0.3 * recent_success + 0.1 * (1 - normalized_response)`.
    /// Ties go to the agent with more tasks, then to the smaller name.
    pub fn select_best(&self, persona: &str, complexity: f64) -> Option<String> {
        let persona = persona.to_lowercase();
        let state = self.read();
        let selected = select_from(state.agents.values().filter(|a| a.persona == persona && !a.busy))
            .map(|a| a.name.clone());
        debug!(persona = %persona, complexity, selected = ?selected, "Selected agent");
        selected
    }

    /// Selects the best idle agent and marks it busy in one step
    pub fn acquire(&self, persona: &str, complexity: f64) -> Option<BusyGuard> {
        let persona = persona.to_lowercase();
        let mut state = self.write();
        let name = select_from(state.agents.values().filter(|a| a.persona == persona && !a.busy))?
            .name
            .clone();
        if let Some(agent) = state.agents.get_mut(&name) {
            agent.busy = true;
            agent.last_used = Utc::now();
        }
        debug!(agent = %name, persona = %persona, complexity, "Acquired agent");
        Some(BusyGuard {
            state: Arc::clone(&self.state),
            name,
            persona,
        })
    }

    /// Sets or clears the busy flag; repeating the same value is a no-op
    pub fn set_busy(&self, name: &str, busy: bool) -> Result<()> {
        let mut state = self.write();
        let agent = state.agent_mut(name)?;
        if agent.busy != busy {
            agent.busy = busy;
            if busy {
                agent.last_used = Utc::now();
            }
        }
        Ok(())
    }

    /// Current busy flag
    pub fn is_busy(&self, name: &str) -> Option<bool> {
        self.read().agents.get(name).map(|a| a.busy)
    }

    /// Number of busy agents
    pub fn busy_count(&self) -> usize {
        self.read().agents.values().filter(|a| a.busy).count()
    }

    /// Overrides the agent-count bounds for a persona
    pub fn set_scaling_config(&self, persona: &str, min: usize, max: usize) -> Result<()> {
        if min > max {
            return Err(DispatchError::Config(format!(
                "scaling bounds for '{}' invalid: min {} > max {}",
                persona, min, max
            )));
        }
        let persona = persona.to_lowercase();
        let bounds = ScalingBounds { min, max };
        let mut state = self.write();
        state
            .demand
            .entry(persona.clone())
            .or_insert_with(|| PersonaDemand::new(&persona, bounds))
            .bounds = bounds;
        info!(persona = %persona, min, max, "Updated scaling bounds");
        Ok(())
    }

    /// Records a queue-length sample and updates the rolling average
    pub fn sample_demand(&self, persona: &str, queue_length: usize) {
        let persona = persona.to_lowercase();
        let bounds = self.scaling.bounds_for(&persona);
        let window = self.scaling.demand_window.max(1);
        let mut state = self.write();
        let demand = state
            .demand
            .entry(persona.clone())
            .or_insert_with(|| PersonaDemand::new(&persona, bounds));
        demand.current_queue_length = queue_length;
        demand.samples.push_back(queue_length);
        while demand.samples.len() > window {
            demand.samples.pop_front();
        }
        demand.average_queue_length =
            demand.samples.iter().sum::<usize>() as f64 / demand.samples.len() as f64;
    }

    /// Demand data for a persona
    pub fn demand(&self, persona: &str) -> Option<PersonaDemand> {
        self.read().demand.get(&persona.to_lowercase()).cloned()
    }

    /// Moves every trust score toward neutral by at most `rate`
    ///
    /// Returns how many agents changed.
    pub fn reheal_trust(&self, rate: f64) -> usize {
        let mut state = self.write();
        let mut changed = 0;
        for agent in state.agents.values_mut() {
            let before = agent.trust_score;
            agent.trust_score = if before < NEUTRAL_TRUST {
                (before + rate).min(NEUTRAL_TRUST)
            } else {
                (before - rate).max(NEUTRAL_TRUST)
            }
            .clamp(0.0, self.trust.max);
            if (agent.trust_score - before).abs() > f64::EPSILON {
                changed += 1;
            }
        }
        if changed > 0 {
            debug!(changed, rate, "Re-healed agent trust");
        }
        changed
    }

    /// Per-persona overview for operators
    pub fn dashboard(&self) -> PoolDashboard {
        let personas = self.personas();
        let state = self.read();
        let rows: Vec<(String, PersonaStats)> = personas
            .into_iter()
            .map(|persona| {
                let agents: Vec<&AgentRecord> = state.agents.values().filter(|a| a.persona == persona).collect();
                let demand = state.demand.get(&persona);
                let average_success_rate = if agents.is_empty() {
                    0.0
                } else {
                    agents.iter().map(|a| a.success_rate()).sum::<f64>() / agents.len() as f64
                };
                let stats = PersonaStats {
                    agent_count: agents.len(),
                    busy_agents: agents.iter().filter(|a| a.busy).count(),
                    average_success_rate,
                    current_queue_length: demand.map(|d| d.current_queue_length).unwrap_or(0),
                    average_queue_length: demand.map(|d| d.average_queue_length).unwrap_or(0.0),
                    scaling_config: demand.map(|d| d.bounds).unwrap_or_else(|| self.scaling.bounds_for(&persona)),
                };
                (persona, stats)
            })
            .collect();
        PoolDashboard {
            total_agents: state.agents.len(),
            total_personas: rows.len(),
            personas: rows,
        }
    }
}
