//! Context Builder — bounded, ranked snapshots handed to the AI collaborator.

use std::sync::Arc;

use cadence_core::clock::LocalClock;
use cadence_core::config::ContextConfig;
use cadence_core::error::Result;
use cadence_core::traits::TaskStore;
use cadence_core::types::{ContextBundle, PlannedStatus, Recipient, ReplyStatus};
use chrono::{DateTime, Duration, Utc};

/// Builds per-purpose context bundles from the store.
#[derive(Clone)]
pub struct ContextBuilder {
    store: Arc<dyn TaskStore>,
    clock: LocalClock,
    config: ContextConfig,
}

impl ContextBuilder {
    pub fn new(store: Arc<dyn TaskStore>, clock: LocalClock, config: ContextConfig) -> Self {
        Self { store, clock, config }
    }

    fn stamp(&self, now: DateTime<Utc>) -> ContextBundle {
        ContextBundle {
            local_date: self.clock.local_date(now).format("%Y-%m-%d").to_string(),
            local_time: self.clock.local_hm(now),
            utc_offset_minutes: self.clock.offset().local_minus_utc() / 60,
            ..Default::default()
        }
    }

    /// High-weight memories plus everything planned yesterday.
    pub async fn planning(&self, recipient: &Recipient, now: DateTime<Utc>) -> Result<ContextBundle> {
        let mut bundle = self.stamp(now);
        bundle.memories = self
            .store
            .top_memories(recipient.id, self.config.planning_min_weight, self.config.limit, now)
            .await?;

        let today = self.clock.local_date(now);
        let yesterday = today.pred_opt().unwrap_or(today);
        let (start, end) = self.clock.day_bounds(yesterday);
        bundle.yesterday_tasks = self
            .store
            .planned_tasks_between(recipient.id, start, end, None, self.config.limit)
            .await?;
        Ok(bundle)
    }

    /// Medium-weight memories, today's open plan, recent messages and the
    /// outreach already queued for today.
    pub async fn outreach(&self, recipient: &Recipient, now: DateTime<Utc>) -> Result<ContextBundle> {
        let mut bundle = self.stamp(now);
        let (start, end) = self.clock.day_bounds(self.clock.local_date(now));

        bundle.memories = self
            .store
            .top_memories(recipient.id, self.config.outreach_min_weight, self.config.limit, now)
            .await?;
        bundle.planned_tasks = self
            .store
            .planned_tasks_between(
                recipient.id,
                start,
                end,
                Some(PlannedStatus::Pending),
                self.config.limit,
            )
            .await?;
        bundle.recent_messages = self
            .store
            .recent_messages(
                recipient.id,
                Some(now - Duration::days(self.config.recent_message_days)),
                self.config.limit,
            )
            .await?;
        bundle.reply_tasks = self
            .store
            .reply_tasks_between(
                recipient.id,
                start,
                Some(end),
                Some(ReplyStatus::Pending),
                self.config.limit,
            )
            .await?;
        Ok(bundle)
    }

    /// Today's plan and top memories for the merge-on-send step.
    pub async fn merge(&self, recipient: &Recipient, now: DateTime<Utc>) -> Result<ContextBundle> {
        let mut bundle = self.stamp(now);
        let (start, end) = self.clock.day_bounds(self.clock.local_date(now));
        bundle.planned_tasks = self
            .store
            .planned_tasks_between(recipient.id, start, end, None, self.config.limit)
            .await?;
        bundle.memories = self
            .store
            .top_memories(recipient.id, 0.0, self.config.limit, now)
            .await?;
        Ok(bundle)
    }

    /// Context for answering an incoming message.
    pub async fn reply(&self, recipient: &Recipient, now: DateTime<Utc>) -> Result<ContextBundle> {
        let mut bundle = self.stamp(now);
        let limit = self.config.reply_limit;
        let (start, end) = self.clock.day_bounds(self.clock.local_date(now));

        bundle.memories = self.store.top_memories(recipient.id, 0.0, limit, now).await?;
        bundle.recent_messages = self.store.recent_messages(recipient.id, None, limit).await?;
        bundle.planned_tasks = self
            .store
            .planned_tasks_between(recipient.id, start, end, Some(PlannedStatus::Pending), limit)
            .await?;
        bundle.reply_tasks = self
            .store
            .reply_tasks_between(recipient.id, now, None, Some(ReplyStatus::Pending), limit)
            .await?;
        Ok(bundle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::SqliteStore;
    use cadence_core::types::{
        MemoryKind, NewMemory, NewPlannedTask, NewRecipient, NewReplyTask, PlannedCategory,
        TriggerOrigin,
    };
    use chrono::TimeZone;

    async fn setup() -> (Arc<dyn TaskStore>, Recipient) {
        let store: Arc<dyn TaskStore> = Arc::new(SqliteStore::in_memory().unwrap());
        let recipient = store
            .upsert_recipient(&NewRecipient {
                external_id: "7".into(),
                display_name: "Mai".into(),
            })
            .await
            .unwrap();
        (store, recipient)
    }

    async fn plan(store: &Arc<dyn TaskStore>, r: &Recipient, at: DateTime<Utc>, title: &str) {
        store
            .create_planned_task(&NewPlannedTask {
                recipient_id: r.id,
                title: title.into(),
                description: String::new(),
                category: PlannedCategory::Daily,
                scheduled_time: at,
                metadata: serde_json::json!({}),
            })
            .await
            .unwrap();
    }

    async fn memory(store: &Arc<dyn TaskStore>, r: &Recipient, title: &str, weight: f64) {
        store
            .create_memory(&NewMemory {
                recipient_id: r.id,
                title: title.into(),
                content: title.into(),
                kind: MemoryKind::UserMemory,
                strength: 5,
                weight,
                forget_time: None,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_planning_context_uses_yesterday_and_heavy_memories() {
        let (store, r) = setup().await;
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap();
        plan(&store, &r, Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap(), "yesterday").await;
        plan(&store, &r, Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap(), "today").await;
        memory(&store, &r, "heavy", 6.0).await;
        memory(&store, &r, "light", 3.5).await;

        let builder = ContextBuilder::new(store, LocalClock::utc(), ContextConfig::default());
        let bundle = builder.planning(&r, now).await.unwrap();
        assert_eq!(bundle.local_date, "2026-03-02");
        assert_eq!(bundle.yesterday_tasks.len(), 1);
        assert_eq!(bundle.yesterday_tasks[0].title, "yesterday");
        assert_eq!(bundle.memories.len(), 1);
        assert_eq!(bundle.memories[0].title, "heavy");
    }

    #[tokio::test]
    async fn test_outreach_context_lists_pending_outreach_for_today() {
        let (store, r) = setup().await;
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 0, 5, 0).unwrap();
        memory(&store, &r, "light", 3.5).await;
        store
            .create_reply_task(&NewReplyTask {
                recipient_id: r.id,
                trigger: TriggerOrigin::Autonomous,
                content: "morning!".into(),
                context: serde_json::json!({}),
                scheduled_time: Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap(),
            })
            .await
            .unwrap();

        let builder = ContextBuilder::new(store, LocalClock::utc(), ContextConfig::default());
        let bundle = builder.outreach(&r, now).await.unwrap();
        assert_eq!(bundle.memories.len(), 1);
        assert_eq!(bundle.reply_tasks.len(), 1);
        assert_eq!(bundle.local_time, "00:05");
    }
}
