//! Conflict Resolver — keeps autonomous messages away from fresh user replies.

use std::sync::Arc;

use cadence_core::config::ConflictConfig;
use cadence_core::error::Result;
use cadence_core::traits::TaskStore;
use cadence_core::types::{ReplyStatus, ReplyTask, ReplyUpdate, TaskId, TriggerOrigin};
use chrono::{DateTime, Duration, Utc};

/// One autonomous task moved later.
#[derive(Debug, Clone, PartialEq)]
pub struct Shift {
    pub task_id: TaskId,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

/// Shifts pending autonomous tasks that sit within `window` of a new
/// user-triggered task by `shift`. Each conflicting task is shifted once,
/// without re-checking the slot it lands in.
pub struct ConflictResolver {
    store: Arc<dyn TaskStore>,
    window: Duration,
    shift: Duration,
}

impl ConflictResolver {
    pub fn new(store: Arc<dyn TaskStore>, config: &ConflictConfig) -> Self {
        Self {
            store,
            window: Duration::minutes(config.window_minutes),
            shift: Duration::minutes(config.shift_minutes),
        }
    }

    pub async fn resolve(&self, task: &ReplyTask) -> Result<Vec<Shift>> {
        if task.trigger != TriggerOrigin::User {
            return Ok(Vec::new());
        }
        let conflicts = self
            .store
            .find_conflicting(
                task.recipient_id,
                task.scheduled_time - self.window,
                task.scheduled_time + self.window,
                TriggerOrigin::Autonomous,
                ReplyStatus::Pending,
                Some(task.id),
            )
            .await?;

        let mut shifts = Vec::with_capacity(conflicts.len());
        for conflict in conflicts {
            let to = conflict.scheduled_time + self.shift;
            let update = ReplyUpdate::to(ReplyStatus::Pending).rescheduled(to);
            // Guarded on `pending`: a task claimed meanwhile is left alone.
            if self
                .store
                .transition_reply_task(conflict.id, ReplyStatus::Pending, &update)
                .await?
            {
                tracing::info!(
                    recipient = %task.recipient_id,
                    task_id = conflict.id,
                    "↪️ Shifted autonomous task {} → {} (user reply #{})",
                    conflict.scheduled_time.format("%H:%M"),
                    to.format("%H:%M"),
                    task.id
                );
                shifts.push(Shift {
                    task_id: conflict.id,
                    from: conflict.scheduled_time,
                    to,
                });
            }
        }
        Ok(shifts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{add_recipient, memory_store};
    use cadence_core::types::NewReplyTask;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, h, m, 0).unwrap()
    }

    async fn create(
        store: &Arc<dyn TaskStore>,
        recipient: i64,
        trigger: TriggerOrigin,
        when: DateTime<Utc>,
    ) -> ReplyTask {
        store
            .create_reply_task(&NewReplyTask {
                recipient_id: recipient,
                trigger,
                content: "x".into(),
                context: serde_json::json!({}),
                scheduled_time: when,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_user_task_inside_window_shifts_autonomous() {
        let store = memory_store();
        let r = add_recipient(&store, "1").await;
        let auto = create(&store, r.id, TriggerOrigin::Autonomous, at(9, 0)).await;
        let user = create(&store, r.id, TriggerOrigin::User, at(9, 10)).await;

        let resolver = ConflictResolver::new(store.clone(), &ConflictConfig::default());
        let shifts = resolver.resolve(&user).await.unwrap();
        assert_eq!(shifts.len(), 1);

        let moved = store.get_reply_task(auto.id).await.unwrap().unwrap();
        assert_eq!(moved.scheduled_time, at(9, 30));
        assert_eq!(moved.status, ReplyStatus::Pending);
    }

    #[tokio::test]
    async fn test_user_task_outside_window_leaves_autonomous() {
        let store = memory_store();
        let r = add_recipient(&store, "1").await;
        let auto = create(&store, r.id, TriggerOrigin::Autonomous, at(9, 0)).await;
        let user = create(&store, r.id, TriggerOrigin::User, at(10, 0)).await;

        let resolver = ConflictResolver::new(store.clone(), &ConflictConfig::default());
        assert!(resolver.resolve(&user).await.unwrap().is_empty());
        let same = store.get_reply_task(auto.id).await.unwrap().unwrap();
        assert_eq!(same.scheduled_time, at(9, 0));
    }

    #[tokio::test]
    async fn test_each_conflict_shifts_once_without_cascade() {
        let store = memory_store();
        let r = add_recipient(&store, "1").await;
        let first = create(&store, r.id, TriggerOrigin::Autonomous, at(9, 0)).await;
        let second = create(&store, r.id, TriggerOrigin::Autonomous, at(9, 20)).await;
        let other = add_recipient(&store, "2").await;
        let foreign = create(&store, other.id, TriggerOrigin::Autonomous, at(9, 10)).await;
        let user = create(&store, r.id, TriggerOrigin::User, at(9, 10)).await;

        let resolver = ConflictResolver::new(store.clone(), &ConflictConfig::default());
        let shifts = resolver.resolve(&user).await.unwrap();
        assert_eq!(shifts.len(), 2);

        // 09:20 + 30 lands on 09:50; 09:00 + 30 lands on 09:30. No re-check.
        let first = store.get_reply_task(first.id).await.unwrap().unwrap();
        let second = store.get_reply_task(second.id).await.unwrap().unwrap();
        assert_eq!(first.scheduled_time, at(9, 30));
        assert_eq!(second.scheduled_time, at(9, 50));
        let foreign = store.get_reply_task(foreign.id).await.unwrap().unwrap();
        assert_eq!(foreign.scheduled_time, at(9, 10));
    }

    #[tokio::test]
    async fn test_autonomous_tasks_do_not_trigger_resolution() {
        let store = memory_store();
        let r = add_recipient(&store, "1").await;
        create(&store, r.id, TriggerOrigin::Autonomous, at(9, 0)).await;
        let auto = create(&store, r.id, TriggerOrigin::Autonomous, at(9, 5)).await;

        let resolver = ConflictResolver::new(store.clone(), &ConflictConfig::default());
        assert!(resolver.resolve(&auto).await.unwrap().is_empty());
    }
}
