use super::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use pretty_assertions::assert_eq;
use serde_json::Value;
use crate::capabilities::CapabilityMap;
use crate::collaborators::{MockEvaluator, MockMemory, MockMetaCognition, MockPerception, MockPlanner};
use crate::config::{ScalingSettings, TrustConfig};
use crate::goal::{GoalPriority, LAST_FAILURE_REASON};
use crate::goal_store::InMemoryGoalStore;
use crate::skills::Skill;
use crate::strategy::DirectStrategy;

fn capabilities() -> CapabilityMap {
    let mut map = CapabilityMap::new();
    map.register_fn("local", "compute", |_| async { Ok(json!({"result": 42})) })
        .register_fn("local", "echo", |params| async move { Ok(Value::Object(params)) })
        .register_fn("local", "fail", |_| async { Err(DispatchError::new("disk full")) });
    map
}

fn planner_returning(plan: Vec<ActionStep>) -> MockPlanner {
    let mut planner = MockPlanner::new();
    planner.expect_create_plan().returning(move |_| Ok(plan.clone()));
    planner
}

fn dispatcher(planner: MockPlanner) -> Dispatcher {
    let registry = Arc::new(AgentRegistry::new(TrustConfig::default(), ScalingSettings::default()));
    let strategy = Arc::new(DirectStrategy::new(Arc::new(capabilities()), vec!["local".into()]));
    Dispatcher::new(
        DispatcherConfig::default(),
        Arc::new(InMemoryGoalStore::new()),
        registry,
        strategy,
        Arc::new(planner),
    )
}

/// Runs cycles until `stop` matches or `limit` cycles pass
async fn run_until(d: &Dispatcher, limit: usize, stop: impl Fn(&CycleOutcome) -> bool) -> Vec<CycleOutcome> {
    let mut outcomes = Vec::new();
    for _ in 0..limit {
        let outcome = d.run_cycle_guarded().await;
        let done = stop(&outcome);
        outcomes.push(outcome);
        if done {
            break;
        }
    }
    outcomes
}

#[tokio::test]
async fn test_idle_without_goals() {
    let d = dispatcher(MockPlanner::new());
    let outcome = d.run_cycle().await;
    assert_eq!(outcome.event, CycleEvent::Idle);
    assert!(outcome.succeeded);
    assert_eq!(d.state(), DispatcherState::Idle);
}

#[tokio::test]
async fn test_interrupt_skips_goal_work() {
    let mut perception = MockPerception::new();
    perception.expect_should_interrupt().times(1).returning(|| true);
    perception.expect_drain().times(1).returning(|| 4);
    let d = dispatcher(MockPlanner::new()).with_perception(Arc::new(perception));
    d.add_goal(Goal::with_id("g1", "waiting", GoalPriority::High)).await.unwrap();

    let outcome = d.run_cycle().await;
    assert_eq!(outcome.event, CycleEvent::Interrupted { drained: 4 });
    assert_eq!(d.goal_status("g1").await, Some(GoalStatus::Pending));
}

#[tokio::test]
async fn test_generated_goal_becomes_active() {
    let mut meta = MockMetaCognition::new();
    meta.expect_generate_goal()
        .times(1)
        .returning(|| Some(Goal::with_id("self", "tidy the workspace", GoalPriority::Low)));
    let d = dispatcher(MockPlanner::new()).with_meta_cognition(Arc::new(meta));

    let outcome = d.run_cycle().await;
    assert_eq!(outcome.event, CycleEvent::GoalGenerated);
    assert_eq!(d.goal_status("self").await, Some(GoalStatus::Active));
}

#[tokio::test]
async fn test_pending_goals_activate_by_priority() {
    let d = dispatcher(MockPlanner::new());
    d.add_goal(Goal::with_id("g2", "later", GoalPriority::Low)).await.unwrap();
    d.add_goal(Goal::with_id("g1", "first", GoalPriority::High)).await.unwrap();

    let outcome = d.run_cycle().await;
    assert_eq!(outcome.event, CycleEvent::GoalActivated);
    assert_eq!(outcome.goal_id.as_deref(), Some("g1"));
}

#[tokio::test]
async fn test_goal_runs_to_completion_with_placeholders() {
    let plan = vec![
        ActionStep::new("compute", "local"),
        ActionStep::new("echo", "local").with_param("value", "{compute.result}"),
    ];
    let d = dispatcher(planner_returning(plan));
    d.add_goal(Goal::with_id("g1", "compute and echo", GoalPriority::Medium)).await.unwrap();

    let outcomes = run_until(&d, 10, |o| o.event == CycleEvent::GoalCompleted).await;
    let events: Vec<CycleEvent> = outcomes.iter().map(|o| o.event.clone()).collect();
    assert_eq!(
        events,
        vec![
            CycleEvent::GoalActivated,
            CycleEvent::PlanCreated { steps: 2 },
            CycleEvent::StepCompleted { action: "compute".into(), remaining: 1 },
            CycleEvent::GoalCompleted,
        ]
    );
    assert_eq!(d.goal_status("g1").await, Some(GoalStatus::Completed));
    assert!(d.context_snapshot().await.is_none());
    assert_eq!(d.state(), DispatcherState::Idle);
    assert_eq!(d.monitor().get_counter("steps_completed").await, Some(2));
    assert_eq!(d.monitor().stats().await.successful_goals, 1);
}

#[tokio::test]
async fn test_resolved_parameters_reach_the_handler() {
    let seen = Arc::new(std::sync::Mutex::new(Value::Null));
    let mut caps = capabilities();
    let sink = seen.clone();
    caps.register_fn("local", "capture", move |params| {
        let sink = sink.clone();
        async move {
            *sink.lock().unwrap() = params.get("value").cloned().unwrap_or(Value::Null);
            Ok(json!("captured"))
        }
    });
    let registry = Arc::new(AgentRegistry::new(TrustConfig::default(), ScalingSettings::default()));
    let plan = vec![
        ActionStep::new("compute", "local"),
        ActionStep::new("capture", "local").with_param("value", "{compute.result}"),
    ];
    let d = Dispatcher::new(
        DispatcherConfig::default(),
        Arc::new(InMemoryGoalStore::new()),
        registry,
        Arc::new(DirectStrategy::new(Arc::new(caps), vec!["local".into()])),
        Arc::new(planner_returning(plan)),
    );
    d.add_goal(Goal::with_id("g1", "capture", GoalPriority::Medium)).await.unwrap();

    run_until(&d, 10, |o| o.event == CycleEvent::GoalCompleted).await;
    assert_eq!(*seen.lock().unwrap(), json!(42));
}

#[tokio::test]
async fn test_planning_failure_is_not_counted() {
    let mut planner = MockPlanner::new();
    planner
        .expect_create_plan()
        .returning(|_| Err(DispatchError::new("model offline")));
    let d = dispatcher(planner);
    d.add_goal(Goal::with_id("g1", "plan me", GoalPriority::Medium)).await.unwrap();

    d.run_cycle().await;
    for _ in 0..5 {
        let outcome = d.run_cycle().await;
        assert_eq!(outcome.event, CycleEvent::PlanInvalidated);
        assert_eq!(outcome.error_kind, Some(ErrorKind::PlanGenerationFailure));
    }

    let goal = d.goal("g1").await.unwrap();
    assert_eq!(goal.status, GoalStatus::Active);
    assert_eq!(goal.failure_count, 0);
    assert!(goal.last_failure_reason().unwrap().contains("model offline"));
}

#[tokio::test]
async fn test_empty_and_rejected_plans_are_invalidated() {
    let d = dispatcher(planner_returning(vec![]));
    d.add_goal(Goal::with_id("g1", "nothing to do", GoalPriority::Medium)).await.unwrap();
    d.run_cycle().await;
    let outcome = d.run_cycle().await;
    assert_eq!(outcome.error_kind, Some(ErrorKind::PlanGenerationFailure));

    let mut evaluator = MockEvaluator::new();
    evaluator.expect_approve().returning(|_| false);
    let d = dispatcher(planner_returning(vec![ActionStep::new("compute", "local")]))
        .with_evaluator(Arc::new(evaluator));
    d.add_goal(Goal::with_id("g2", "unsafe", GoalPriority::Medium)).await.unwrap();
    d.run_cycle().await;
    let outcome = d.run_cycle().await;
    assert_eq!(outcome.event, CycleEvent::PlanInvalidated);
    assert_eq!(outcome.error_kind, Some(ErrorKind::PlanRejected));
    assert!(!d.goal("g2").await.unwrap().has_plan());
}

#[tokio::test]
async fn test_goal_fails_after_three_step_failures() {
    let d = dispatcher(planner_returning(vec![ActionStep::new("fail", "local")]));
    d.add_goal(Goal::with_id("g1", "doomed", GoalPriority::Medium)).await.unwrap();

    let outcomes = run_until(&d, 20, |o| o.event == CycleEvent::GoalFailed).await;
    let failures: Vec<u32> = outcomes
        .iter()
        .filter_map(|o| match o.event {
            CycleEvent::StepFailed { failures, .. } => Some(failures),
            _ => None,
        })
        .collect();
    assert_eq!(failures, vec![1, 2]);

    let last = outcomes.last().unwrap();
    assert_eq!(last.event, CycleEvent::GoalFailed);
    assert_eq!(last.error_kind, Some(ErrorKind::GoalMaxFailuresExceeded));

    let goal = d.goal("g1").await.unwrap();
    assert_eq!(goal.status, GoalStatus::Failed);
    assert_eq!(goal.failure_count, 3);
    assert!(goal.metadata[LAST_FAILURE_REASON].contains("disk full"));
    assert_eq!(d.monitor().stats().await.failed_goals, 1);
}

#[tokio::test]
async fn test_goal_failure_budget_overrides_config() {
    let d = dispatcher(planner_returning(vec![ActionStep::new("fail", "local")]));
    d.add_goal(Goal::with_id("g1", "fragile", GoalPriority::Medium).with_max_failures(1))
        .await
        .unwrap();

    let outcomes = run_until(&d, 10, |o| o.event == CycleEvent::GoalFailed).await;
    assert_eq!(outcomes.last().unwrap().event, CycleEvent::GoalFailed);
    assert_eq!(d.goal("g1").await.unwrap().failure_count, 1);
}

#[tokio::test]
async fn test_skill_expands_in_place() {
    let d = dispatcher(planner_returning(vec![
        ActionStep::new("report", "local"),
        ActionStep::new("echo", "local"),
    ]));
    d.skills()
        .add_skill(Skill::new(
            "report",
            "",
            vec![ActionStep::new("compute", "local"), ActionStep::new("compute", "local")],
        ))
        .await
        .unwrap();
    d.add_goal(Goal::with_id("g1", "report", GoalPriority::Medium)).await.unwrap();

    d.run_cycle().await;
    d.run_cycle().await;
    let outcome = d.run_cycle().await;
    assert_eq!(outcome.event, CycleEvent::SkillExpanded { skill: "report".into(), steps: 2 });

    let plan: Vec<String> = d.goal("g1").await.unwrap().sub_tasks.into_iter().map(|s| s.action).collect();
    assert_eq!(plan, vec!["compute", "compute", "echo"]);
    assert_eq!(d.skills().get("report").await.unwrap().usage_count, 1);
}

#[tokio::test]
async fn test_self_expanding_skill_terminates() {
    let d = dispatcher(planner_returning(vec![ActionStep::new("S", "local")]));
    d.skills()
        .add_skill(Skill::new("S", "expands into itself", vec![ActionStep::new("S", "local")]))
        .await
        .unwrap();
    d.add_goal(Goal::with_id("g1", "loop forever", GoalPriority::Medium)).await.unwrap();

    let outcomes = run_until(&d, 50, |o| o.event == CycleEvent::GoalFailed).await;
    assert_eq!(outcomes.last().unwrap().event, CycleEvent::GoalFailed);

    let expansions_before_first_failure = outcomes
        .iter()
        .take_while(|o| !matches!(o.event, CycleEvent::StepFailed { .. }))
        .filter(|o| matches!(o.event, CycleEvent::SkillExpanded { .. }))
        .count();
    assert_eq!(expansions_before_first_failure, 3);

    let first_failure = outcomes
        .iter()
        .find(|o| matches!(o.event, CycleEvent::StepFailed { .. }))
        .unwrap();
    assert_eq!(first_failure.error_kind, Some(ErrorKind::RecursiveSkillExpansionError));
    assert_eq!(d.goal_status("g1").await, Some(GoalStatus::Failed));
}

#[tokio::test]
async fn test_planner_panic_is_contained() {
    let mut planner = MockPlanner::new();
    planner.expect_create_plan().returning(|_| panic!("planner exploded"));
    let d = dispatcher(planner);
    d.add_goal(Goal::with_id("g1", "explode", GoalPriority::Medium)).await.unwrap();
    d.run_cycle_guarded().await;

    let outcome = d.run_cycle_guarded().await;
    assert!(!outcome.succeeded);
    assert_eq!(outcome.event, CycleEvent::Aborted);
    assert_eq!(outcome.error_kind, Some(ErrorKind::Internal));
    assert!(outcome.detail.contains("planner exploded"));

    // the loop can keep going
    let next = d.run_cycle_guarded().await;
    assert!(!next.succeeded);
    assert_eq!(d.goal_status("g1").await, Some(GoalStatus::Active));
}

#[tokio::test]
async fn test_memory_failures_do_not_affect_outcomes() {
    let mut memory = MockMemory::new();
    memory.expect_record().returning(|_| Err(DispatchError::new("memory offline")));
    let d = dispatcher(planner_returning(vec![ActionStep::new("compute", "local")]))
        .with_memory(Arc::new(memory));
    d.add_goal(Goal::with_id("g1", "remember me", GoalPriority::Medium)).await.unwrap();

    let outcomes = run_until(&d, 5, |o| o.event == CycleEvent::GoalCompleted).await;
    let last = outcomes.last().unwrap();
    assert!(last.succeeded);
    assert_eq!(last.event, CycleEvent::GoalCompleted);
}

#[tokio::test]
async fn test_cancelling_active_goal_drops_context() {
    let d = dispatcher(planner_returning(vec![
        ActionStep::new("compute", "local"),
        ActionStep::new("compute", "local"),
    ]));
    d.add_goal(Goal::with_id("g1", "interrupted", GoalPriority::Medium)).await.unwrap();
    d.run_cycle().await;
    d.run_cycle().await;
    d.run_cycle().await;
    assert!(d.context_snapshot().await.is_some());

    d.cancel_goal("g1").await.unwrap();
    assert!(d.context_snapshot().await.is_none());
    assert_eq!(d.goal_status("g1").await, Some(GoalStatus::Cancelled));
    assert_eq!(d.run_cycle().await.event, CycleEvent::Idle);
}

#[tokio::test]
async fn test_demand_sampled_for_remote_personas() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let mut planner = MockPlanner::new();
    planner.expect_create_plan().returning(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(vec![ActionStep::new("write_code", "coder"), ActionStep::new("write_code", "coder")])
    });
    let d = dispatcher(planner);
    d.registry().register_default("coder_1", "coder").unwrap();
    d.add_goal(Goal::with_id("g1", "code", GoalPriority::Medium)).await.unwrap();
    d.run_cycle().await;
    d.run_cycle().await;

    d.sample_demand().await;
    let demand = d.registry().demand("coder").unwrap();
    assert_eq!(demand.current_queue_length, 2);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_demand_matches_personas_case_insensitively() {
    let step: ActionStep =
        serde_json::from_value(json!({"action": "write_code", "assigned_persona": "Coder"})).unwrap();
    let d = dispatcher(planner_returning(vec![step.clone(), step]));
    d.registry().register_default("coder_1", "coder").unwrap();
    d.add_goal(Goal::with_id("g1", "code", GoalPriority::Medium)).await.unwrap();
    d.run_cycle().await;
    d.run_cycle().await;

    d.sample_demand().await;
    let demand = d.registry().demand("coder").unwrap();
    assert_eq!(demand.current_queue_length, 2);
    assert_eq!(demand.average_queue_length, 2.0);
    assert_eq!(d.monitor().get_gauge("queue.coder").await, Some(2.0));
    assert_eq!(d.monitor().get_gauge("agents.busy").await, Some(0.0));
}

#[tokio::test]
async fn test_cancel_does_not_wait_for_a_running_step() {
    let mut caps = capabilities();
    caps.register_fn("local", "slow", |_| async {
        tokio::time::sleep(Duration::from_millis(500)).await;
        Ok(json!("late"))
    });
    let registry = Arc::new(AgentRegistry::new(TrustConfig::default(), ScalingSettings::default()));
    let d = Arc::new(Dispatcher::new(
        DispatcherConfig::default(),
        Arc::new(InMemoryGoalStore::new()),
        registry,
        Arc::new(DirectStrategy::new(Arc::new(caps), vec!["local".into()])),
        Arc::new(planner_returning(vec![
            ActionStep::new("slow", "local"),
            ActionStep::new("compute", "local"),
        ])),
    ));
    d.add_goal(Goal::with_id("g1", "slow work", GoalPriority::Medium)).await.unwrap();
    d.run_cycle().await;
    d.run_cycle().await;

    let running = tokio::spawn({
        let d = Arc::clone(&d);
        async move { d.run_cycle().await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let cancelled = tokio::time::timeout(Duration::from_millis(200), d.cancel_goal("g1")).await;
    assert!(cancelled.is_ok(), "cancel_goal waited for the step");
    cancelled.unwrap().unwrap();

    let outcome = running.await.unwrap();
    assert_eq!(outcome.event, CycleEvent::Aborted);
    assert!(d.context_snapshot().await.is_none());
    assert_eq!(d.goal_status("g1").await, Some(GoalStatus::Cancelled));
}
