#![doc = include_str!("../README.md")]
#![warn(clippy::all)]

//! LlamaDispatch - goal-driven task dispatching for agent pools
//!
//! The library runs prioritized goals through a plan → delegate → record
//! loop. Steps are executed locally or delegated to a pool of agents chosen
//! by trust, and the pool grows and shrinks with demand.
//!
//! ## Features
//! - Priority-ordered goal store with dependencies and failure budgets
//! - Trust-weighted agent selection with rolling success windows
//! - Damped autoscaling per persona
//! - In-process message bus with request/reply and graceful shutdown
//! - Skill expansion with a recursion guard
//! - Performance monitoring
//!
//! ## Usage
//! ```rust,ignore
//! use llamadispatch::{Config, Scenario};
//! use std::path::Path;
//!
//! async fn example() -> llamadispatch::Result<()> {
//!     let config = Config::load()?;
//!     let scenario = Scenario::from_file(Path::new("demos/release.toml")).await?;
//!     let system = scenario.build(&config).await?;
//!
//!     for _ in 0..20 {
//!         let outcome = system.dispatcher.run_cycle_guarded().await;
//!         println!("{:?}", outcome.event);
//!     }
//!     Ok(())
//! }
//! ```

/// Configuration loading, validation and environment overrides
pub mod config;
/// Error handling types and utilities
pub mod error;
/// Logging configuration and utilities
pub mod logging;
/// Goal and plan data model
pub mod goal;
/// Goal lifecycle and priority ordering
pub mod goal_store;
/// Per-goal workspace and step history
pub mod context;
/// In-process message bus
pub mod channel;
/// Agent registry, trust scoring and autoscaling
pub mod pool;
/// Local action handlers keyed by persona
pub mod capabilities;
/// Where and how steps run
pub mod strategy;
/// Planner, evaluator, perception, goal synthesis and memory interfaces
pub mod collaborators;
/// Learned composite skills
pub mod skills;
/// Performance monitoring
pub mod metrics;
/// Retry helpers
pub mod utils;
/// Agent-side task execution
pub mod worker;
/// The orchestration loop
pub mod dispatcher;
/// TOML scenarios for running the whole system in-process
pub mod scenario;

// Re-export common types
pub use config::Config;
pub use error::{DispatchError, ErrorKind, Result};
pub use goal::{ActionStep, Goal, GoalPriority, GoalStatus};
pub use goal_store::{GoalStore, InMemoryGoalStore};
pub use channel::{Message, MessageBus};
pub use pool::{AgentRegistry, PoolDashboard};
pub use capabilities::CapabilityMap;
pub use strategy::{DelegationStrategy, DirectStrategy, HybridStrategy, TrustWeightedStrategy};
pub use dispatcher::{CycleEvent, CycleOutcome, Dispatcher, DispatcherState};
pub use dispatcher::runtime::DispatcherRuntime;
pub use metrics::PerformanceMonitor;
pub use scenario::Scenario;
