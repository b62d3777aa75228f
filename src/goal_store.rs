//! The single authority on goal state
//!
//! Nothing outside a [`GoalStore`] keeps its own copy of a goal's status; the
//! dispatcher re-reads the store on every cycle. Persistence, if any, lives
//! behind this trait.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use crate::error::{DispatchError, Result};
use crate::goal::{ActionStep, Goal, GoalStatus, LAST_FAILURE_REASON};

/// Goal counts per status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GoalSummary {
    /// Goals waiting to be activated
    pub pending: usize,
    /// Goals being worked on (0 or 1)
    pub active: usize,
    /// Completed goals still retained
    pub completed: usize,
    /// Failed goals still retained
    pub failed: usize,
    /// Cancelled goals still retained
    pub cancelled: usize,
}

/// Owns goal lifecycle and priority ordering
#[async_trait]
pub trait GoalStore: Send + Sync {
    /// Inserts a goal as PENDING; duplicate ids are rejected
    async fn add_goal(&self, goal: Goal) -> Result<String>;

    /// Snapshot of a goal
    async fn goal(&self, id: &str) -> Option<Goal>;

    /// Current status of a goal
    async fn goal_status(&self, id: &str) -> Option<GoalStatus>;

    /// Pending and active goals, highest priority first, oldest first on ties
    async fn active_goals(&self) -> Vec<Goal>;

    /// The goal currently marked ACTIVE, if any
    async fn active_goal(&self) -> Option<Goal>;

    /// Highest-priority pending goal whose dependencies have all completed
    async fn next_pending(&self) -> Option<Goal>;

    /// Moves a goal to a new status
    async fn set_status(&self, id: &str, status: GoalStatus) -> Result<()>;

    /// Replaces the plan
    async fn update_plan(&self, id: &str, plan: Vec<ActionStep>) -> Result<()>;

    /// Removes and returns the first step of the plan
    async fn pop_step(&self, id: &str) -> Result<Option<ActionStep>>;

    /// Replaces the first step of the plan with `steps`
    async fn expand_front(&self, id: &str, steps: Vec<ActionStep>) -> Result<()>;

    /// Clears the plan and records why
    async fn invalidate_plan(&self, id: &str, reason: &str) -> Result<()>;

    /// Counts a step failure and returns the new failure count
    async fn record_failure(&self, id: &str, reason: &str) -> Result<u32>;

    /// Terminal transition to COMPLETED
    async fn complete_goal(&self, id: &str) -> Result<()>;

    /// Terminal transition to FAILED
    async fn fail_goal(&self, id: &str, reason: &str) -> Result<()>;

    /// Terminal transition to CANCELLED
    async fn cancel_goal(&self, id: &str) -> Result<()>;

    /// Purges terminal goals not updated within `retention`
    async fn cleanup_older_than(&self, retention: Duration) -> usize;

    /// Goal counts per status
    async fn status_summary(&self) -> GoalSummary;
}

/// In-memory [`GoalStore`]
#[derive(Debug, Default, Clone)]
pub struct InMemoryGoalStore {
    goals: Arc<RwLock<HashMap<String, Goal>>>,
}

impl InMemoryGoalStore {
    /// Creates an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies `f` to an open goal, refreshing `updated_at`
    async fn mutate_open<T>(&self, id: &str, f: impl FnOnce(&mut Goal) -> T + Send) -> Result<T> {
        let mut goals = self.goals.write().await;
        let goal = goals
            .get_mut(id)
            .ok_or_else(|| DispatchError::GoalNotFound(id.to_string()))?;
        if goal.status.is_terminal() {
            return Err(DispatchError::GoalTerminal(id.to_string()));
        }
        let result = f(goal);
        goal.touch();
        Ok(result)
    }

    async fn terminate(&self, id: &str, status: GoalStatus, reason: Option<&str>) -> Result<()> {
        self.mutate_open(id, |goal| {
            goal.status = status;
            goal.sub_tasks.clear();
            if let Some(reason) = reason {
                goal.metadata.insert(LAST_FAILURE_REASON.to_string(), reason.to_string());
            }
        })
        .await?;
        info!(goal_id = id, status = ?status, "Goal reached terminal status");
        Ok(())
    }
}

fn by_priority(a: &Goal, b: &Goal) -> std::cmp::Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.id.cmp(&b.id))
}

#[async_trait]
impl GoalStore for InMemoryGoalStore {
    async fn add_goal(&self, mut goal: Goal) -> Result<String> {
        let mut goals = self.goals.write().await;
        if goals.contains_key(&goal.id) {
            return Err(DispatchError::DuplicateGoal(goal.id));
        }
        goal.status = GoalStatus::Pending;
        goal.touch();
        let id = goal.id.clone();
        info!(goal_id = %id, priority = ?goal.priority, "Added goal: {}", goal.description);
        goals.insert(id.clone(), goal);
        Ok(id)
    }

    async fn goal(&self, id: &str) -> Option<Goal> {
        self.goals.read().await.get(id).cloned()
    }

    async fn goal_status(&self, id: &str) -> Option<GoalStatus> {
        self.goals.read().await.get(id).map(|g| g.status)
    }

    async fn active_goals(&self) -> Vec<Goal> {
        let goals = self.goals.read().await;
        let mut open: Vec<Goal> = goals.values().filter(|g| g.status.is_open()).cloned().collect();
        open.sort_by(by_priority);
        open
    }

    async fn active_goal(&self) -> Option<Goal> {
        let goals = self.goals.read().await;
        goals.values().find(|g| g.status == GoalStatus::Active).cloned()
    }

    async fn next_pending(&self) -> Option<Goal> {
        let goals = self.goals.read().await;
        let mut candidates: Vec<&Goal> = goals
            .values()
            .filter(|g| g.status == GoalStatus::Pending)
            .filter(|g| {
                g.dependencies.iter().all(|dep| {
                    goals.get(dep).map(|d| d.status == GoalStatus::Completed).unwrap_or(false)
                })
            })
            .collect();
        candidates.sort_by(|a, b| by_priority(a, b));
        candidates.first().map(|g| (*g).clone())
    }

    async fn set_status(&self, id: &str, status: GoalStatus) -> Result<()> {
        let mut goals = self.goals.write().await;
        if status == GoalStatus::Active {
            if let Some(active) = goals.values().find(|g| g.status == GoalStatus::Active && g.id != id) {
                return Err(DispatchError::ActiveGoalConflict {
                    active: active.id.clone(),
                    requested: id.to_string(),
                });
            }
        }
        let goal = goals
            .get_mut(id)
            .ok_or_else(|| DispatchError::GoalNotFound(id.to_string()))?;
        if goal.status.is_terminal() {
            return Err(DispatchError::GoalTerminal(id.to_string()));
        }
        debug!(goal_id = id, from = ?goal.status, to = ?status, "Goal status change");
        goal.status = status;
        if status.is_terminal() {
            goal.sub_tasks.clear();
        }
        goal.touch();
        Ok(())
    }

    async fn update_plan(&self, id: &str, plan: Vec<ActionStep>) -> Result<()> {
        self.mutate_open(id, |goal| goal.sub_tasks = plan).await
    }

    async fn pop_step(&self, id: &str) -> Result<Option<ActionStep>> {
        self.mutate_open(id, |goal| {
            if goal.sub_tasks.is_empty() {
                None
            } else {
                Some(goal.sub_tasks.remove(0))
            }
        })
        .await
    }

    async fn expand_front(&self, id: &str, steps: Vec<ActionStep>) -> Result<()> {
        self.mutate_open(id, |goal| {
            let rest = if goal.sub_tasks.is_empty() {
                Vec::new()
            } else {
                goal.sub_tasks.split_off(1)
            };
            goal.sub_tasks = steps;
            goal.sub_tasks.extend(rest);
        })
        .await
    }

    async fn invalidate_plan(&self, id: &str, reason: &str) -> Result<()> {
        self.mutate_open(id, |goal| {
            goal.sub_tasks.clear();
            goal.metadata.insert(LAST_FAILURE_REASON.to_string(), reason.to_string());
        })
        .await?;
        warn!(goal_id = id, "Plan invalidated: {}", reason);
        Ok(())
    }

    async fn record_failure(&self, id: &str, reason: &str) -> Result<u32> {
        self.mutate_open(id, |goal| {
            goal.failure_count += 1;
            goal.metadata.insert(LAST_FAILURE_REASON.to_string(), reason.to_string());
            goal.failure_count
        })
        .await
    }

    async fn complete_goal(&self, id: &str) -> Result<()> {
        self.terminate(id, GoalStatus::Completed, None).await
    }

    async fn fail_goal(&self, id: &str, reason: &str) -> Result<()> {
        self.terminate(id, GoalStatus::Failed, Some(reason)).await
    }

    async fn cancel_goal(&self, id: &str) -> Result<()> {
        self.terminate(id, GoalStatus::Cancelled, None).await
    }

    async fn cleanup_older_than(&self, retention: Duration) -> usize {
        let cutoff = chrono::Duration::from_std(retention)
            .ok()
            .and_then(|retention| Utc::now().checked_sub_signed(retention));
        let mut goals = self.goals.write().await;
        let before = goals.len();
        goals.retain(|_, g| {
            !(g.status.is_terminal() && cutoff.map(|c| g.updated_at < c).unwrap_or(false))
        });
        let purged = before - goals.len();
        if purged > 0 {
            info!(purged, "Purged terminal goals past retention");
        }
        purged
    }

    async fn status_summary(&self) -> GoalSummary {
        let goals = self.goals.read().await;
        let mut summary = GoalSummary::default();
        for goal in goals.values() {
            match goal.status {
                GoalStatus::Pending => summary.pending += 1,
                GoalStatus::Active => summary.active += 1,
                GoalStatus::Completed => summary.completed += 1,
                GoalStatus::Failed => summary.failed += 1,
                GoalStatus::Cancelled => summary.cancelled += 1,
            }
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::goal::GoalPriority;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_priority_ordering() {
        let store = InMemoryGoalStore::new();
        store.add_goal(Goal::with_id("g2", "low work", GoalPriority::Low)).await.unwrap();
        store.add_goal(Goal::with_id("g1", "urgent work", GoalPriority::High)).await.unwrap();

        let goals = store.active_goals().await;
        assert_eq!(goals[0].id, "g1");
        assert_eq!(goals[1].id, "g2");
    }

    #[tokio::test]
    async fn test_ties_prefer_oldest() {
        let store = InMemoryGoalStore::new();
        let mut older = Goal::with_id("b", "older", GoalPriority::Medium);
        older.created_at = Utc::now() - chrono::Duration::seconds(10);
        store.add_goal(Goal::with_id("a", "newer", GoalPriority::Medium)).await.unwrap();
        store.add_goal(older).await.unwrap();

        let ids: Vec<String> = store.active_goals().await.into_iter().map(|g| g.id).collect();
        assert_eq!(ids, vec!["b".to_string(), "a".to_string()]);
    }

    #[tokio::test]
    async fn test_duplicate_ids_rejected() {
        let store = InMemoryGoalStore::new();
        store.add_goal(Goal::with_id("g", "one", GoalPriority::Low)).await.unwrap();
        let err = store.add_goal(Goal::with_id("g", "two", GoalPriority::Low)).await.unwrap_err();
        assert!(matches!(err, DispatchError::DuplicateGoal(id) if id == "g"));
    }

    #[tokio::test]
    async fn test_single_active_goal() {
        let store = InMemoryGoalStore::new();
        store.add_goal(Goal::with_id("a", "a", GoalPriority::Low)).await.unwrap();
        store.add_goal(Goal::with_id("b", "b", GoalPriority::Low)).await.unwrap();
        store.set_status("a", GoalStatus::Active).await.unwrap();

        let err = store.set_status("b", GoalStatus::Active).await.unwrap_err();
        assert!(matches!(err, DispatchError::ActiveGoalConflict { .. }));
        assert_eq!(store.active_goal().await.map(|g| g.id), Some("a".to_string()));
    }

    #[tokio::test]
    async fn test_terminal_goals_reject_mutation() {
        let store = InMemoryGoalStore::new();
        store.add_goal(Goal::with_id("g", "g", GoalPriority::Low)).await.unwrap();
        store.complete_goal("g").await.unwrap();

        assert!(matches!(store.fail_goal("g", "late").await, Err(DispatchError::GoalTerminal(_))));
        assert!(matches!(store.cancel_goal("g").await, Err(DispatchError::GoalTerminal(_))));
        assert!(matches!(
            store.set_status("g", GoalStatus::Active).await,
            Err(DispatchError::GoalTerminal(_))
        ));
        assert_eq!(store.goal_status("g").await, Some(GoalStatus::Completed));
        assert!(store.active_goals().await.is_empty());
    }

    #[tokio::test]
    async fn test_plan_consumed_from_front() {
        let store = InMemoryGoalStore::new();
        let plan = vec![
            ActionStep::new("first", "local"),
            ActionStep::new("skill", "local"),
            ActionStep::new("last", "local"),
        ];
        store.add_goal(Goal::with_id("g", "g", GoalPriority::Low).with_plan(plan)).await.unwrap();

        let popped = store.pop_step("g").await.unwrap().unwrap();
        assert_eq!(popped.action, "first");

        store
            .expand_front("g", vec![ActionStep::new("s1", "local"), ActionStep::new("s2", "local")])
            .await
            .unwrap();
        let actions: Vec<String> = store
            .goal("g")
            .await
            .unwrap()
            .sub_tasks
            .into_iter()
            .map(|s| s.action)
            .collect();
        assert_eq!(actions, vec!["s1", "s2", "last"]);
    }

    #[tokio::test]
    async fn test_failure_recording_sets_reason() {
        let store = InMemoryGoalStore::new();
        store.add_goal(Goal::with_id("g", "g", GoalPriority::Low)).await.unwrap();
        assert_eq!(store.record_failure("g", "first").await.unwrap(), 1);
        assert_eq!(store.record_failure("g", "second").await.unwrap(), 2);

        let goal = store.goal("g").await.unwrap();
        assert_eq!(goal.last_failure_reason(), Some("second"));
    }

    #[tokio::test]
    async fn test_next_pending_respects_dependencies() {
        let store = InMemoryGoalStore::new();
        store.add_goal(Goal::with_id("base", "base", GoalPriority::Low)).await.unwrap();
        store
            .add_goal(Goal::with_id("child", "child", GoalPriority::Critical).depends_on("base"))
            .await
            .unwrap();

        assert_eq!(store.next_pending().await.map(|g| g.id), Some("base".to_string()));
        store.set_status("base", GoalStatus::Active).await.unwrap();
        store.complete_goal("base").await.unwrap();
        assert_eq!(store.next_pending().await.map(|g| g.id), Some("child".to_string()));
    }

    #[tokio::test]
    async fn test_cleanup_only_purges_terminal_goals() {
        let store = InMemoryGoalStore::new();
        store.add_goal(Goal::with_id("open", "open", GoalPriority::Low)).await.unwrap();
        store.add_goal(Goal::with_id("done", "done", GoalPriority::Low)).await.unwrap();
        store.complete_goal("done").await.unwrap();

        assert_eq!(store.cleanup_older_than(Duration::from_secs(3600)).await, 0);
        assert_eq!(store.cleanup_older_than(Duration::ZERO).await, 1);
        assert!(store.goal("done").await.is_none());
        assert!(store.goal("open").await.is_some());
        assert_eq!(store.status_summary().await, GoalSummary { pending: 1, ..Default::default() });
    }
}
