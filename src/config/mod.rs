mod env_manager;

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;
use serde::{Deserialize, Serialize};
use crate::error::{DispatchError, Result};

pub use env_manager::{apply_env_overrides, get_env_value};

/// Main configuration struct for the dispatcher
///
/// Every section has defaults, so a config file only needs the keys it
/// wants to change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Log level used when RUST_LOG is not set
    pub log_level: String,
    /// Dispatcher loop settings
    pub dispatcher: DispatcherConfig,
    /// Remote delegation settings
    pub delegation: DelegationConfig,
    /// Trust reward/decay tuning
    pub trust: TrustConfig,
    /// Autoscaling control loop settings
    pub scaling: ScalingSettings,
    /// Shutdown timing
    pub shutdown: ShutdownConfig,
    /// Goal retention
    pub goals: GoalConfig,
}

/// Which delegation strategy the dispatcher runs with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// Local capability map only
    Direct,
    /// Remote agents selected by trust
    TrustWeighted,
    /// Remote first, local fallback once
    Hybrid,
}

/// Dispatcher loop settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Step failures a goal may accumulate before it is marked failed
    pub max_failures: u32,
    /// Delay between dispatcher cycles in milliseconds
    pub cycle_interval_ms: u64,
    /// Complexity assumed for steps that do not carry a `complexity` parameter
    pub default_complexity: f64,
    /// Delegation strategy
    pub strategy: StrategyKind,
    /// Personas executed through the local capability map
    pub local_personas: Vec<String>,
}

/// Retry policy for acquiring an agent
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_delay_ms: u64,
    /// Upper bound on any single delay
    pub max_delay_ms: u64,
    /// Multiplier applied after each failed attempt
    pub backoff_multiplier: f64,
}

/// Remote delegation settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DelegationConfig {
    /// How long to wait for an agent's reply
    pub reply_timeout_ms: u64,
    /// Backoff used while no idle agent is available
    pub retry: RetryConfig,
}

/// Trust reward/decay tuning
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TrustConfig {
    /// Trust assigned to newly registered agents
    pub initial: f64,
    /// Upper bound on trust
    pub max: f64,
    /// Trust gained per unit of complexity on success
    pub reward_rate: f64,
    /// Trust lost per unit of complexity on failure
    pub decay_rate: f64,
    /// Amount trust moves toward neutral on each reheal
    pub reheal_rate: f64,
    /// Seconds between reheal passes
    pub reheal_interval_secs: u64,
    /// Number of recent outcomes used for the success rate
    pub recent_window: usize,
}

/// Min/max agent bounds for one persona
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScalingBounds {
    /// Minimum agents kept for the persona
    pub min: usize,
    /// Maximum agents allowed for the persona
    pub max: usize,
}

/// Autoscaling control loop settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScalingSettings {
    /// Seconds between autoscale passes
    pub interval_secs: u64,
    /// Scale up when average queue length exceeds this times agent count
    pub scale_up_factor: f64,
    /// Scale down when average queue length falls below this times agent count
    pub scale_down_factor: f64,
    /// Number of demand samples in the rolling average
    pub demand_window: usize,
    /// Minimum used for personas without explicit bounds
    pub default_min: usize,
    /// Maximum used for personas without explicit bounds
    pub default_max: usize,
    /// Explicit bounds per persona
    pub personas: HashMap<String, ScalingBounds>,
}

/// Shutdown timing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Time in-flight replies get before they are cancelled
    pub grace_period_ms: u64,
    /// Time background tasks get to exit before they are aborted
    pub join_timeout_ms: u64,
}

/// Goal retention
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GoalConfig {
    /// Seconds terminal goals are kept before cleanup
    pub retention_secs: u64,
}

impl Config {
    /// Loads configuration from the default config file location
    ///
    /// If the config file doesn't exist, returns the default configuration.
    /// Environment overrides are applied in both cases.
    pub fn load() -> Result<Self> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| DispatchError::Config("Could not find config directory".into()))?;
        let config_path = config_dir.join("llamadispatch").join("config.toml");

        let mut config = if config_path.exists() {
            Self::read_toml(&config_path)?
        } else {
            Self::default()
        };
        apply_env_overrides(&mut config);
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from an explicit TOML file
    ///
    /// Environment overrides are not applied; call [`apply_env_overrides`]
    /// when they are wanted.
    pub fn from_file(path: &Path) -> Result<Self> {
        let config = Self::read_toml(path)?;
        config.validate()?;
        Ok(config)
    }

    fn read_toml(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| DispatchError::Config(format!("Failed to read config file {}: {}", path.display(), e)))?;
        Ok(toml::from_str(&content)?)
    }

    /// Serializes the configuration back to TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| DispatchError::Config(format!("Failed to serialize config: {}", e)))
    }

    /// Checks the invariants the dispatcher relies on
    pub fn validate(&self) -> Result<()> {
        let trust = &self.trust;
        if self.dispatcher.max_failures == 0 {
            return Err(DispatchError::Config("dispatcher.max_failures must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&trust.max) || trust.initial < 0.0 || trust.initial > trust.max {
            return Err(DispatchError::Config(format!(
                "trust bounds invalid: initial={} max={}",
                trust.initial, trust.max
            )));
        }
        if trust.reward_rate <= 0.0 || trust.decay_rate < trust.reward_rate {
            return Err(DispatchError::Config(format!(
                "trust.decay_rate ({}) must be >= trust.reward_rate ({}) > 0",
                trust.decay_rate, trust.reward_rate
            )));
        }
        if trust.recent_window == 0 {
            return Err(DispatchError::Config("trust.recent_window must be positive".into()));
        }

        let scaling = &self.scaling;
        if scaling.scale_down_factor <= 0.0 || scaling.scale_down_factor >= scaling.scale_up_factor {
            return Err(DispatchError::Config(format!(
                "scaling factors invalid: down={} up={}",
                scaling.scale_down_factor, scaling.scale_up_factor
            )));
        }
        if scaling.interval_secs == 0 || trust.reheal_interval_secs == 0 {
            return Err(DispatchError::Config("scaling.interval_secs and trust.reheal_interval_secs must be positive".into()));
        }
        if scaling.demand_window == 0 {
            return Err(DispatchError::Config("scaling.demand_window must be positive".into()));
        }
        if scaling.default_min > scaling.default_max {
            return Err(DispatchError::Config("scaling.default_min exceeds default_max".into()));
        }
        for (persona, bounds) in &scaling.personas {
            if bounds.min > bounds.max {
                return Err(DispatchError::Config(format!(
                    "scaling bounds for '{}' invalid: min {} > max {}",
                    persona, bounds.min, bounds.max
                )));
            }
        }
        Ok(())
    }

    /// Bounds for a persona, falling back to the defaults
    pub fn bounds_for(&self, persona: &str) -> ScalingBounds {
        self.scaling.bounds_for(persona)
    }
}

impl DispatcherConfig {
    /// Delay between cycles
    pub fn cycle_interval(&self) -> Duration {
        Duration::from_millis(self.cycle_interval_ms)
    }

    /// Checks whether a persona runs through the local capability map
    pub fn is_local(&self, persona: &str) -> bool {
        self.local_personas.iter().any(|p| p.eq_ignore_ascii_case(persona))
    }
}

impl DelegationConfig {
    /// Reply timeout as a duration
    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }
}

impl ScalingSettings {
    /// Interval between autoscale passes
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Bounds for a persona, falling back to the defaults
    pub fn bounds_for(&self, persona: &str) -> ScalingBounds {
        self.personas.get(persona).copied().unwrap_or(ScalingBounds {
            min: self.default_min,
            max: self.default_max,
        })
    }
}

impl TrustConfig {
    /// Interval between reheal passes
    pub fn reheal_interval(&self) -> Duration {
        Duration::from_secs(self.reheal_interval_secs)
    }
}

impl ShutdownConfig {
    /// Grace period as a duration
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    /// Join timeout as a duration
    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            dispatcher: DispatcherConfig::default(),
            delegation: DelegationConfig::default(),
            trust: TrustConfig::default(),
            scaling: ScalingSettings::default(),
            shutdown: ShutdownConfig::default(),
            goals: GoalConfig::default(),
        }
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_failures: 3,
            cycle_interval_ms: 1000,
            default_complexity: 0.5,
            strategy: StrategyKind::Hybrid,
            local_personas: vec!["orchestrator".to_string(), "local".to_string()],
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            initial_delay_ms: 100,
            max_delay_ms: 2000,
            backoff_multiplier: 2.0,
        }
    }
}

impl Default for DelegationConfig {
    fn default() -> Self {
        Self {
            reply_timeout_ms: 30_000,
            retry: RetryConfig::default(),
        }
    }
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            initial: 0.5,
            max: 1.0,
            reward_rate: 0.05,
            decay_rate: 0.1,
            reheal_rate: 0.01,
            reheal_interval_secs: 24 * 3600,
            recent_window: 20,
        }
    }
}

impl Default for ScalingSettings {
    fn default() -> Self {
        Self {
            interval_secs: 15,
            scale_up_factor: 2.0,
            scale_down_factor: 0.5,
            demand_window: 10,
            default_min: 1,
            default_max: 5,
            personas: HashMap::new(),
        }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: 2000,
            join_timeout_ms: 5000,
        }
    }
}

impl Default for GoalConfig {
    fn default() -> Self {
        Self {
            retention_secs: 24 * 3600,
        }
    }
}
