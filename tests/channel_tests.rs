mod common;

use std::sync::Arc;
use std::time::Duration;
use common::test_helpers::*;
use llamadispatch::{
    capabilities::CapabilityMap,
    channel::{Message, MessageBus},
    config::{DelegationConfig, ScalingSettings, TrustConfig},
    context::ExecutionContext,
    error::DispatchError,
    goal::{ActionStep, Goal, GoalPriority},
    metrics::PerformanceMonitor,
    pool::AgentRegistry,
    strategy::{DelegationStrategy, DirectStrategy, TrustWeightedStrategy},
    worker::{spawn_worker, TASK_MESSAGE},
};
use serde_json::{json, Map};

fn slow_capabilities(delay: Duration) -> CapabilityMap {
    let mut map = CapabilityMap::new();
    map.register_fn("coder", "write_code", move |_| async move {
        tokio::time::sleep(delay).await;
        Ok(json!("late"))
    });
    map
}

#[tokio::test]
async fn test_reply_timeout_records_exactly_one_failure() {
    setup_test_logger();
    let bus = MessageBus::new();
    let registry = Arc::new(AgentRegistry::new(TrustConfig::default(), ScalingSettings::default()));
    let monitor = Arc::new(PerformanceMonitor::new());
    let caps = slow_capabilities(Duration::from_millis(100));
    registry.register_default("coder_1", "coder").unwrap();
    spawn_worker(&bus, "coder_1", "coder", &caps).await;

    let strategy = TrustWeightedStrategy::new(
        DirectStrategy::new(Arc::new(caps), vec!["local".into()]),
        registry.clone(),
        bus.clone(),
        monitor.clone(),
        DelegationConfig {
            reply_timeout_ms: 1,
            ..DelegationConfig::default()
        },
        0.5,
    );
    let ctx = ExecutionContext::new(&Goal::with_id("g1", "slow", GoalPriority::Medium));

    let err = strategy
        .execute_step(&ActionStep::new("write_code", "coder"), &ctx)
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::DelegationTimeout { ref agent, .. } if agent == "coder_1"));
    assert_eq!(registry.is_busy("coder_1"), Some(false));

    // the late reply must not be counted
    tokio::time::sleep(Duration::from_millis(200)).await;
    let agent = registry.agent("coder_1").unwrap();
    assert_eq!(agent.total_tasks, 1);
    assert_eq!(agent.failed_tasks, 1);
    assert!((agent.trust_score - 0.45).abs() < 1e-9);

    let seen = monitor.agent("coder_1").await.unwrap();
    assert_eq!(seen.total_tasks, 1);
    assert_eq!(seen.successful_tasks, 0);
    assert_eq!(bus.pending_requests(), 0);
}

#[tokio::test]
async fn test_shutdown_cancels_waiting_requests() {
    let bus = MessageBus::new();
    spawn_worker(&bus, "coder_1", "coder", &slow_capabilities(Duration::from_secs(5))).await;

    let mut payload = Map::new();
    payload.insert("action".into(), json!("write_code"));
    let request = Message::new("dispatcher", "coder_1", TASK_MESSAGE, payload);
    let requester = bus.clone();
    let waiting = tokio::spawn(async move { requester.request_reply(request, Duration::from_secs(10)).await });

    let watched = bus.clone();
    assert!(eventually(Duration::from_secs(1), || watched.pending_requests() == 1).await);

    let report = bus.shutdown(Duration::from_millis(20), Duration::from_millis(50)).await;
    assert_eq!(report.cancelled_requests, 1);
    assert_eq!(report.forced, vec!["coder_1".to_string()]);
    assert!(waiting.await.unwrap().is_none());

    let after = Message::new("dispatcher", "coder_1", TASK_MESSAGE, Map::new());
    assert!(!bus.publish(after).await);
}

#[tokio::test]
async fn test_idle_listeners_exit_cleanly() {
    let bus = MessageBus::new();
    spawn_worker(&bus, "coder_1", "coder", &test_capabilities()).await;
    spawn_worker(&bus, "coder_2", "coder", &test_capabilities()).await;
    assert!(!spawn_worker(&bus, "coder_1", "coder", &test_capabilities()).await);

    let reply = bus
        .request_reply(
            Message::new("dispatcher", "coder_2", TASK_MESSAGE, {
                let mut payload = Map::new();
                payload.insert("action".into(), json!("write_code"));
                payload.insert("parameters".into(), json!({"lines": 3}));
                payload
            }),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
    assert_eq!(reply.payload()["result"], json!({"result": 3}));

    let report = bus.shutdown(Duration::from_millis(20), Duration::from_millis(500)).await;
    assert_eq!(report.clean, vec!["coder_1".to_string(), "coder_2".to_string()]);
    assert!(report.forced.is_empty());
    assert_eq!(report.cancelled_requests, 0);
}
