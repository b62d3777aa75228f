use std::time::Duration;
use llamadispatch::{
    capabilities::CapabilityMap,
    config::{Config, StrategyKind},
    error::DispatchError,
    logging,
    scenario::{Scenario, ScenarioSystem},
    CycleOutcome,
};
use serde_json::json;

#[allow(dead_code)]
pub mod test_helpers {
    use super::*;

    pub fn setup_test_logger() {
        logging::init_for_tests();
    }

    /// Config with short timeouts so tests never wait long
    pub fn create_test_config() -> Config {
        let mut config = Config::default();
        config.dispatcher.cycle_interval_ms = 1;
        config.dispatcher.strategy = StrategyKind::Hybrid;
        config.delegation.reply_timeout_ms = 500;
        config.shutdown.grace_period_ms = 50;
        config.shutdown.join_timeout_ms = 500;
        config
    }

    /// Handlers for the personas used across the integration tests
    pub fn test_capabilities() -> CapabilityMap {
        let mut map = CapabilityMap::new();
        map.register_fn("coder", "write_code", |params| async move {
            Ok(json!({"result": params.get("lines").cloned().unwrap_or(json!(10))}))
        })
        .register_fn("coder", "crash", |_| async { Err(DispatchError::new("compiler crashed")) })
        .register_fn("local", "summarize", |params| async move { Ok(json!({"summary": params})) });
        map
    }

    pub async fn build_scenario(toml: &str, config: &Config) -> ScenarioSystem {
        Scenario::parse(toml).unwrap().build(config).await.unwrap()
    }

    /// Runs cycles until no goal is open or `limit` cycles pass
    pub async fn run_to_completion(system: &ScenarioSystem, limit: usize) -> Vec<CycleOutcome> {
        let mut outcomes = Vec::new();
        for _ in 0..limit {
            outcomes.push(system.dispatcher.run_cycle_guarded().await);
            let summary = system.dispatcher.goal_store().status_summary().await;
            if summary.pending == 0 && summary.active == 0 {
                break;
            }
        }
        outcomes
    }

    /// Waits up to `wait` for `check` to hold
    pub async fn eventually<F>(wait: Duration, check: F) -> bool
    where
        F: Fn() -> bool,
    {
        let deadline = tokio::time::Instant::now() + wait;
        while tokio::time::Instant::now() < deadline {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        check()
    }
}
