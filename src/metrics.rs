use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{info, debug};

/// Smoothing factor for goal completion time
pub const GOAL_EMA_ALPHA: f64 = 0.2;
/// Smoothing factor for agent response time
pub const AGENT_EMA_ALPHA: f64 = 0.3;

const TOP_AGENTS: usize = 3;

/// Goal and delegation totals
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExecutionStats {
    pub total_goals: u64,
    pub successful_goals: u64,
    pub failed_goals: u64,
    pub total_delegations: u64,
    pub successful_delegations: u64,
    /// Moving average of goal completion time, in seconds
    pub avg_completion_secs: f64,
}

impl ExecutionStats {
    /// Share of finished goals that completed, 0 when none finished
    pub fn success_rate(&self) -> f64 {
        if self.total_goals == 0 {
            0.0
        } else {
            self.successful_goals as f64 / self.total_goals as f64
        }
    }

    /// Share of delegations that succeeded, 0 when none were made
    pub fn delegation_success_rate(&self) -> f64 {
        if self.total_delegations == 0 {
            0.0
        } else {
            self.successful_delegations as f64 / self.total_delegations as f64
        }
    }
}

/// Delegation history of one agent as seen by the monitor
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentPerformance {
    pub agent: String,
    pub total_tasks: u64,
    pub successful_tasks: u64,
    /// Moving average of response time, in seconds
    pub avg_response_secs: f64,
    pub last_interaction: DateTime<Utc>,
}

impl AgentPerformance {
    fn new(agent: &str) -> Self {
        Self {
            agent: agent.to_string(),
            total_tasks: 0,
            successful_tasks: 0,
            avg_response_secs: 0.0,
            last_interaction: Utc::now(),
        }
    }

    /// Lifetime success rate, 0.5 without history
    pub fn success_rate(&self) -> f64 {
        if self.total_tasks == 0 {
            0.5
        } else {
            self.successful_tasks as f64 / self.total_tasks as f64
        }
    }

    /// Success rate boosted above 0.8 and penalized below 0.3
    pub fn reliability_score(&self) -> f64 {
        let rate = self.success_rate();
        if rate > 0.8 {
            (rate * 1.2).min(1.0)
        } else if rate < 0.3 {
            (rate * 0.8).max(0.1)
        } else {
            rate
        }
    }
}

/// Snapshot returned by [`PerformanceMonitor::status_summary`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonitorSummary {
    pub uptime_secs: f64,
    pub goal_success_rate: f64,
    pub delegation_success_rate: f64,
    pub avg_goal_completion_secs: f64,
    pub total_goals_processed: u64,
    pub active_agents: usize,
    /// Best agents by success rate, then task count
    pub top_agents: Vec<AgentPerformance>,
}

/// Collects dispatcher-wide statistics
///
/// Besides goal and delegation tracking it keeps free-form counters, timers
/// and gauges.
pub struct PerformanceMonitor {
    started: Instant,
    stats: Arc<RwLock<ExecutionStats>>,
    agents: Arc<RwLock<HashMap<String, AgentPerformance>>>,
    counters: Arc<RwLock<HashMap<String, u64>>>,
    timers: Arc<RwLock<HashMap<String, Duration>>>,
    gauges: Arc<RwLock<HashMap<String, f64>>>,
}

impl Default for PerformanceMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl PerformanceMonitor {
    /// Creates a new monitor
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            stats: Arc::new(RwLock::new(ExecutionStats::default())),
            agents: Arc::new(RwLock::new(HashMap::new())),
            counters: Arc::new(RwLock::new(HashMap::new())),
            timers: Arc::new(RwLock::new(HashMap::new())),
            gauges: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Records a completed goal and folds its duration into the average
    pub async fn record_goal_completion(&self, elapsed: Duration) {
        let mut stats = self.stats.write().await;
        stats.avg_completion_secs = if stats.successful_goals == 0 {
            elapsed.as_secs_f64()
        } else {
            GOAL_EMA_ALPHA * elapsed.as_secs_f64() + (1.0 - GOAL_EMA_ALPHA) * stats.avg_completion_secs
        };
        stats.total_goals += 1;
        stats.successful_goals += 1;
    }

    /// Records a failed goal
    pub async fn record_goal_failure(&self) {
        let mut stats = self.stats.write().await;
        stats.total_goals += 1;
        stats.failed_goals += 1;
    }

    /// Records one delegation attempt and updates the agent's tracker
    pub async fn record_delegation(&self, agent: &str, success: bool, elapsed: Duration) {
        {
            let mut stats = self.stats.write().await;
            stats.total_delegations += 1;
            if success {
                stats.successful_delegations += 1;
            }
        }
        let mut agents = self.agents.write().await;
        let tracker = agents
            .entry(agent.to_string())
            .or_insert_with(|| AgentPerformance::new(agent));
        tracker.avg_response_secs = if tracker.total_tasks == 0 {
            elapsed.as_secs_f64()
        } else {
            AGENT_EMA_ALPHA * elapsed.as_secs_f64() + (1.0 - AGENT_EMA_ALPHA) * tracker.avg_response_secs
        };
        tracker.total_tasks += 1;
        if success {
            tracker.successful_tasks += 1;
        }
        tracker.last_interaction = Utc::now();
        debug!(agent, success, "Recorded delegation");
    }

    /// Totals so far
    pub async fn stats(&self) -> ExecutionStats {
        self.stats.read().await.clone()
    }

    /// Tracker for one agent
    pub async fn agent(&self, agent: &str) -> Option<AgentPerformance> {
        self.agents.read().await.get(agent).cloned()
    }

    /// Uptime, success rates and the top three agents
    pub async fn status_summary(&self) -> MonitorSummary {
        let stats = self.stats.read().await.clone();
        let agents = self.agents.read().await;
        let mut top: Vec<AgentPerformance> = agents.values().filter(|a| a.total_tasks > 0).cloned().collect();
        top.sort_by(|a, b| {
            b.success_rate()
                .total_cmp(&a.success_rate())
                .then_with(|| b.total_tasks.cmp(&a.total_tasks))
                .then_with(|| a.agent.cmp(&b.agent))
        });
        top.truncate(TOP_AGENTS);

        MonitorSummary {
            uptime_secs: self.started.elapsed().as_secs_f64(),
            goal_success_rate: stats.success_rate(),
            delegation_success_rate: stats.delegation_success_rate(),
            avg_goal_completion_secs: stats.avg_completion_secs,
            total_goals_processed: stats.total_goals,
            active_agents: agents.len(),
            top_agents: top,
        }
    }

    /// Increments a counter metric by 1
    pub async fn increment(&self, key: &str) {
        let mut counters = self.counters.write().await;
        *counters.entry(key.to_string()).or_insert(0) += 1;
        debug!("Incremented counter {}: {}", key, counters[key]);
    }

    /// Records the latest duration for a timer
    pub async fn record_time(&self, key: &str, duration: Duration) {
        let mut timers = self.timers.write().await;
        timers.insert(key.to_string(), duration);
        debug!("Recorded timer {}: {:?}", key, duration);
    }

    /// Sets a gauge metric to the specified value
    pub async fn set_gauge(&self, key: &str, value: f64) {
        let mut gauges = self.gauges.write().await;
        gauges.insert(key.to_string(), value);
        debug!("Set gauge {}: {}", key, value);
    }

    pub async fn get_counter(&self, key: &str) -> Option<u64> {
        self.counters.read().await.get(key).cloned()
    }

    pub async fn get_timer(&self, key: &str) -> Option<Duration> {
        self.timers.read().await.get(key).cloned()
    }

    pub async fn get_gauge(&self, key: &str) -> Option<f64> {
        self.gauges.read().await.get(key).cloned()
    }

    /// Logs a report of everything collected
    pub async fn report(&self) {
        let summary = self.status_summary().await;
        info!("=== Performance Report ===");
        info!(
            uptime_secs = summary.uptime_secs,
            goals = summary.total_goals_processed,
            goal_success_rate = summary.goal_success_rate,
            delegation_success_rate = summary.delegation_success_rate,
            avg_goal_secs = summary.avg_goal_completion_secs,
            "Execution"
        );
        for agent in &summary.top_agents {
            info!(
                agent = %agent.agent,
                tasks = agent.total_tasks,
                success_rate = agent.success_rate(),
                reliability = agent.reliability_score(),
                "Top agent"
            );
        }

        let counters = self.counters.read().await;
        if !counters.is_empty() {
            info!("Counters:");
            for (k, v) in counters.iter() {
                info!("  {}: {}", k, v);
            }
        }

        let timers = self.timers.read().await;
        if !timers.is_empty() {
            info!("Timers:");
            for (k, v) in timers.iter() {
                info!("  {}: {:?}", k, v);
            }
        }

        let gauges = self.gauges.read().await;
        if !gauges.is_empty() {
            info!("Gauges:");
            for (k, v) in gauges.iter() {
                info!("  {}: {}", k, v);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_counters() {
        let metrics = PerformanceMonitor::new();

        metrics.increment("steps").await;
        metrics.increment("steps").await;
        assert_eq!(metrics.get_counter("steps").await, Some(2));
        assert_eq!(metrics.get_counter("missing").await, None);
    }

    #[tokio::test]
    async fn test_timers_and_gauges() {
        let metrics = PerformanceMonitor::new();
        metrics.record_time("cycle", Duration::from_secs(5)).await;
        metrics.set_gauge("queue", 42.5).await;
        assert_eq!(metrics.get_timer("cycle").await, Some(Duration::from_secs(5)));
        assert_eq!(metrics.get_gauge("queue").await, Some(42.5));
    }

    #[tokio::test]
    async fn test_goal_stats() {
        let metrics = PerformanceMonitor::new();
        assert_eq!(metrics.status_summary().await.goal_success_rate, 0.0);

        metrics.record_goal_completion(Duration::from_secs(10)).await;
        metrics.record_goal_failure().await;

        let stats = metrics.stats().await;
        assert_eq!(stats.total_goals, 2);
        assert!((stats.avg_completion_secs - 2.0).abs() < 1e-9);
        assert!((stats.success_rate() - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_top_agents() {
        let metrics = PerformanceMonitor::new();
        for (agent, outcomes) in [("a", vec![true, true]), ("b", vec![false]), ("c", vec![true]), ("d", vec![true, false])] {
            for success in outcomes {
                metrics.record_delegation(agent, success, Duration::from_millis(100)).await;
            }
        }

        let summary = metrics.status_summary().await;
        let top: Vec<&str> = summary.top_agents.iter().map(|a| a.agent.as_str()).collect();
        assert_eq!(top, vec!["a", "c", "d"]);
        assert_eq!(summary.active_agents, 4);
        assert!((summary.delegation_success_rate - 4.0 / 6.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_first_sample_seeds_averages() {
        let metrics = PerformanceMonitor::new();
        metrics.record_delegation("a", true, Duration::from_secs(2)).await;
        metrics.record_goal_completion(Duration::from_secs(10)).await;
        assert_eq!(metrics.agent("a").await.unwrap().avg_response_secs, 2.0);
        assert_eq!(metrics.stats().await.avg_completion_secs, 10.0);

        metrics.record_delegation("a", true, Duration::from_secs(4)).await;
        let expected = AGENT_EMA_ALPHA * 4.0 + (1.0 - AGENT_EMA_ALPHA) * 2.0;
        assert!((metrics.agent("a").await.unwrap().avg_response_secs - expected).abs() < 1e-9);
    }

    #[test]
    fn test_reliability_score() {
        let mut tracker = AgentPerformance::new("a");
        assert_eq!(tracker.reliability_score(), 0.5);
        tracker.total_tasks = 10;
        tracker.successful_tasks = 9;
        assert_eq!(tracker.reliability_score(), 1.0);
        tracker.successful_tasks = 1;
        assert!((tracker.reliability_score() - 0.1).abs() < 1e-9);
    }
}
