//! Dispatcher — claims due reply tasks, merges them per recipient, sends,
//! and finalizes their state.
//!
//! ```text
//! tick
//!   ├── claim (one transaction: select due + mark executing)
//!   ├── group by recipient
//!   └── per group (isolated)
//!         ├── transport disabled / no address → failed (permanent)
//!         ├── 1 task → content verbatim, n tasks → AI merge (fallback: concat)
//!         ├── send ok  → completed + one MessageLog for all task ids
//!         └── send err → failed, re-queued while retry_count < max_retries
//! ```

use std::sync::Arc;

use cadence_core::error::{CadenceError, Result};
use cadence_core::traits::{Decider, TaskStore, Transport};
use cadence_core::types::{
    MessageDirection, NewMessageLog, Recipient, RecipientId, ReplyStatus, ReplyTask, ReplyUpdate,
};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::context::ContextBuilder;
use crate::tasks::RetryPolicy;

/// Per-tick totals.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DispatchReport {
    pub claimed: usize,
    pub groups: usize,
    pub messages_sent: usize,
    pub completed: usize,
    pub requeued: usize,
    pub failed: usize,
}

impl std::fmt::Display for DispatchReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "claimed {} in {} group(s): {} sent, {} completed, {} re-queued, {} failed",
            self.claimed, self.groups, self.messages_sent, self.completed, self.requeued, self.failed
        )
    }
}

/// What went out for a delivered group.
struct Delivery {
    content: String,
    address: String,
}

/// Result of recording a failed send for one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailOutcome {
    Requeued,
    Failed,
    /// The row was no longer held by this claim; nothing was written.
    Lost,
}

/// Why a group was not delivered.
#[derive(Debug)]
enum GroupFailure {
    /// Not retried: transport disabled or no address.
    Permanent(String),
    /// Counted against each task's retry budget.
    Transient(String),
}

pub struct Dispatcher {
    store: Arc<dyn TaskStore>,
    decider: Arc<dyn Decider>,
    transport: Arc<dyn Transport>,
    context: ContextBuilder,
    batch_limit: usize,
    retry: RetryPolicy,
    sender: String,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn TaskStore>,
        decider: Arc<dyn Decider>,
        transport: Arc<dyn Transport>,
        context: ContextBuilder,
        batch_limit: usize,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            decider,
            transport,
            context,
            batch_limit,
            retry,
            sender: "cadence".into(),
        }
    }

    /// Name recorded as the sender of outgoing message logs.
    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = sender.into();
        self
    }

    /// One dispatcher tick. Only a failed claim is returned as an error;
    /// everything after the claim is handled per group.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<DispatchReport> {
        let claimed = self.store.claim_due_reply_tasks(self.batch_limit, now).await?;
        let mut report = DispatchReport {
            claimed: claimed.len(),
            ..Default::default()
        };
        if claimed.is_empty() {
            return Ok(report);
        }

        let groups = group_by_recipient(claimed);
        report.groups = groups.len();

        for (recipient_id, tasks) in groups {
            self.dispatch_group(recipient_id, &tasks, now, &mut report).await;
        }
        tracing::info!("📤 Dispatch tick: {report}");
        Ok(report)
    }

    async fn dispatch_group(
        &self,
        recipient_id: RecipientId,
        tasks: &[ReplyTask],
        now: DateTime<Utc>,
        report: &mut DispatchReport,
    ) {
        let failure = match self.deliver(recipient_id, tasks, now).await {
            Ok(delivery) => {
                report.messages_sent += 1;
                for task in tasks {
                    match self.complete(task, now).await {
                        Ok(true) => report.completed += 1,
                        Ok(false) => tracing::warn!(
                            task_id = task.id,
                            "⚠️ Task was no longer held by this claim when completing"
                        ),
                        Err(e) => tracing::error!(task_id = task.id, "❌ Failed to complete task: {e}"),
                    }
                }
                if let Err(e) = self.log_sent(recipient_id, tasks, &delivery, now).await {
                    tracing::error!(recipient = %recipient_id, "❌ Failed to write message log: {e}");
                }
                return;
            }
            Err(failure) => failure,
        };

        let (reason, retryable) = match failure {
            GroupFailure::Permanent(reason) => (reason, false),
            GroupFailure::Transient(reason) => (reason, true),
        };
        tracing::warn!(
            recipient = %recipient_id,
            count = tasks.len(),
            "⚠️ Dispatch failed: {reason}"
        );
        for task in tasks {
            match self.fail(task, &reason, retryable).await {
                Ok(FailOutcome::Requeued) => report.requeued += 1,
                Ok(FailOutcome::Failed) => report.failed += 1,
                Ok(FailOutcome::Lost) => tracing::warn!(
                    task_id = task.id,
                    "⚠️ Task was no longer held by this claim when failing"
                ),
                Err(e) => {
                    report.failed += 1;
                    tracing::error!(task_id = task.id, "❌ Failed to record task failure: {e}");
                }
            }
        }
    }

    /// Everything up to and including the send. Any error here fails the group.
    async fn deliver(
        &self,
        recipient_id: RecipientId,
        tasks: &[ReplyTask],
        now: DateTime<Utc>,
    ) -> std::result::Result<Delivery, GroupFailure> {
        if !self.transport.enabled() {
            return Err(GroupFailure::Permanent(format!(
                "transport disabled ({})",
                self.transport.name()
            )));
        }
        let recipient = match self.store.get_recipient(recipient_id).await {
            Ok(Some(r)) => r,
            Ok(None) => {
                return Err(GroupFailure::Permanent(format!(
                    "recipient {recipient_id} not found"
                )));
            }
            Err(e) => return Err(GroupFailure::Transient(format!("store error: {e}"))),
        };

        // Resolved before composing so an undeliverable group costs no merge call.
        let address = self
            .transport
            .resolve_address(&recipient)
            .map_err(|e| GroupFailure::Permanent(format!("unresolvable address: {e}")))?;
        let content = self.compose(&recipient, tasks, now).await;

        self.transport
            .send(&content, &address)
            .await
            .map_err(|e| GroupFailure::Transient(format!("send failed: {e}")))?;
        tracing::info!(
            recipient = %recipient_id,
            count = tasks.len(),
            "✅ Delivered to {recipient}"
        );
        Ok(Delivery { content, address })
    }

    /// Outgoing text: a single task verbatim, several merged by the AI,
    /// falling back to plain concatenation when the merge fails.
    async fn compose(&self, recipient: &Recipient, tasks: &[ReplyTask], now: DateTime<Utc>) -> String {
        let contents: Vec<String> = tasks.iter().map(|t| t.content.clone()).collect();
        if contents.len() == 1 {
            return contents[0].clone();
        }

        let merged = async {
            let ctx = self.context.merge(recipient, now).await?;
            let text = self.decider.merge_messages(recipient, &contents, &ctx).await?;
            let text = text.trim().to_string();
            if text.is_empty() {
                return Err(CadenceError::Provider("empty merge result".into()));
            }
            Ok::<_, CadenceError>(text)
        }
        .await;

        match merged {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(
                    recipient = %recipient.id,
                    "⚠️ Merge failed, sending concatenation: {e}"
                );
                concat_contents(&contents)
            }
        }
    }

    async fn complete(&self, task: &ReplyTask, now: DateTime<Utc>) -> Result<bool> {
        let mut update = ReplyUpdate::to(ReplyStatus::Completed).executed(now);
        if let Some(token) = &task.claim_token {
            update = update.owned_by(token);
        }
        self.store
            .transition_reply_task(task.id, ReplyStatus::Executing, &update)
            .await
    }

    /// executing → failed, then back to pending while retries remain.
    async fn fail(&self, task: &ReplyTask, reason: &str, retryable: bool) -> Result<FailOutcome> {
        let mut failed = ReplyUpdate::to(ReplyStatus::Failed).with_error(reason);
        if let Some(token) = &task.claim_token {
            failed = failed.owned_by(token);
        }
        if !self
            .store
            .transition_reply_task(task.id, ReplyStatus::Executing, &failed)
            .await?
        {
            return Ok(FailOutcome::Lost);
        }

        let next = if retryable {
            self.retry.next_attempt(task.retry_count)
        } else {
            None
        };
        let Some(retry_count) = next else {
            tracing::error!(
                task_id = task.id,
                retry_count = task.retry_count,
                "❌ Task permanently failed: {reason}"
            );
            return Ok(FailOutcome::Failed);
        };

        let mut requeue = ReplyUpdate::to(ReplyStatus::Pending).with_retry_count(retry_count);
        if let Some(token) = &task.claim_token {
            requeue = requeue.owned_by(token);
        }
        let requeued = self
            .store
            .transition_reply_task(task.id, ReplyStatus::Failed, &requeue)
            .await?;
        if requeued {
            tracing::debug!(task_id = task.id, retry_count, "🔁 Task re-queued");
            Ok(FailOutcome::Requeued)
        } else {
            Ok(FailOutcome::Lost)
        }
    }

    async fn log_sent(
        &self,
        recipient_id: RecipientId,
        tasks: &[ReplyTask],
        delivery: &Delivery,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let contents: Vec<&str> = tasks.iter().map(|t| t.content.as_str()).collect();
        self.store
            .append_message_log(&NewMessageLog {
                recipient_id,
                direction: MessageDirection::Sent,
                sender: self.sender.clone(),
                receiver: delivery.address.clone(),
                content: delivery.content.clone(),
                timestamp: now,
                reply_task_ids: tasks.iter().map(|t| t.id).collect(),
                raw: serde_json::json!({
                    "original_contents": contents,
                    "transport": self.transport.name(),
                }),
            })
            .await?;
        Ok(())
    }
}

/// Groups claimed tasks per recipient. Groups follow the order in which each
/// recipient first appears, so a tick still walks the claim in
/// `scheduled_time` order.
fn group_by_recipient(tasks: Vec<ReplyTask>) -> Vec<(RecipientId, Vec<ReplyTask>)> {
    let mut groups: Vec<(RecipientId, Vec<ReplyTask>)> = Vec::new();
    for task in tasks {
        match groups.iter_mut().find(|(id, _)| *id == task.recipient_id) {
            Some((_, group)) => group.push(task),
            None => groups.push((task.recipient_id, vec![task])),
        }
    }
    groups
}

/// Naive merge used when the AI merge is unavailable.
pub fn concat_contents(contents: &[String]) -> String {
    contents
        .iter()
        .map(|c| c.trim())
        .filter(|c| !c.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FakeDecider, FakeTransport, add_recipient, memory_store};
    use cadence_core::clock::LocalClock;
    use cadence_core::config::ContextConfig;
    use cadence_core::types::{NewReplyTask, TriggerOrigin};
    use chrono::{Duration, TimeZone};
    use std::sync::atomic::Ordering;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap()
    }

    fn dispatcher(
        store: &Arc<dyn TaskStore>,
        decider: Arc<FakeDecider>,
        transport: Arc<FakeTransport>,
    ) -> Dispatcher {
        let ctx = ContextBuilder::new(store.clone(), LocalClock::utc(), ContextConfig::default());
        Dispatcher::new(store.clone(), decider, transport, ctx, 20, RetryPolicy::default())
    }

    async fn due(store: &Arc<dyn TaskStore>, recipient: i64, content: &str, minutes_ago: i64) -> ReplyTask {
        store
            .create_reply_task(&NewReplyTask {
                recipient_id: recipient,
                trigger: TriggerOrigin::Autonomous,
                content: content.into(),
                context: serde_json::json!({}),
                scheduled_time: now() - Duration::minutes(minutes_ago),
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_merge_produces_one_log_for_all_tasks() {
        let store = memory_store();
        let r = add_recipient(&store, "11").await;
        let a = due(&store, r.id, "a", 3).await;
        let b = due(&store, r.id, "b", 2).await;
        let c = due(&store, r.id, "c", 1).await;
        let decider = FakeDecider::new();
        let transport = FakeTransport::new();

        let report = dispatcher(&store, decider.clone(), transport.clone())
            .tick(now())
            .await
            .unwrap();
        assert_eq!(report.claimed, 3);
        assert_eq!(report.messages_sent, 1);
        assert_eq!(report.completed, 3);

        assert_eq!(decider.merge_calls.load(Ordering::SeqCst), 1);
        assert_eq!(decider.merge_inputs.lock().unwrap()[0], vec!["a", "b", "c"]);
        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0], ("merged: a | b | c".to_string(), "11".to_string()));

        let logs = store.recent_messages(r.id, None, 10).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].reply_task_ids, vec![a.id, b.id, c.id]);
        assert_eq!(logs[0].content, "merged: a | b | c");
        for id in [a.id, b.id, c.id] {
            let task = store.get_reply_task(id).await.unwrap().unwrap();
            assert_eq!(task.status, ReplyStatus::Completed);
            assert!(task.executed_at.is_some());
        }
    }

    #[tokio::test]
    async fn test_single_task_skips_merge() {
        let store = memory_store();
        let r = add_recipient(&store, "11").await;
        due(&store, r.id, "just one", 1).await;
        let decider = FakeDecider::new();
        let transport = FakeTransport::new();

        dispatcher(&store, decider.clone(), transport.clone())
            .tick(now())
            .await
            .unwrap();
        assert_eq!(decider.merge_calls.load(Ordering::SeqCst), 0);
        assert_eq!(transport.sent()[0].0, "just one");
    }

    #[tokio::test]
    async fn test_merge_failure_falls_back_to_concat() {
        let store = memory_store();
        let r = add_recipient(&store, "11").await;
        due(&store, r.id, "first", 2).await;
        due(&store, r.id, "second", 1).await;
        let decider = FakeDecider::new();
        *decider.merge_fails.lock().unwrap() = true;
        let transport = FakeTransport::new();

        let report = dispatcher(&store, decider, transport.clone())
            .tick(now())
            .await
            .unwrap();
        assert_eq!(report.completed, 2);
        assert_eq!(transport.sent()[0].0, "first\n\nsecond");
    }

    #[tokio::test]
    async fn test_batch_limit_leaves_rest_pending() {
        let store = memory_store();
        let r = add_recipient(&store, "11").await;
        for i in 0..25 {
            due(&store, r.id, &format!("m{i}"), 30 - i).await;
        }
        let report = dispatcher(&store, FakeDecider::new(), FakeTransport::new())
            .tick(now())
            .await
            .unwrap();
        assert_eq!(report.claimed, 20);
        let stats = store.stats().await.unwrap();
        assert_eq!(stats.reply_by_status.get("pending"), Some(&5));
        assert_eq!(stats.reply_by_status.get("completed"), Some(&20));
    }

    #[tokio::test]
    async fn test_retry_ceiling_after_repeated_send_failures() {
        let store = memory_store();
        let r = add_recipient(&store, "11").await;
        let task = due(&store, r.id, "hello", 1).await;
        let transport = FakeTransport::failing(100);
        let d = dispatcher(&store, FakeDecider::new(), transport);

        for attempt in 1..=4 {
            let report = d.tick(now()).await.unwrap();
            assert_eq!(report.claimed, 1, "attempt {attempt} should claim the task");
        }
        let task = store.get_reply_task(task.id).await.unwrap().unwrap();
        assert_eq!(task.status, ReplyStatus::Failed);
        assert_eq!(task.retry_count, 3);
        assert!(task.error_message.contains("send failed"));

        let report = d.tick(now()).await.unwrap();
        assert_eq!(report.claimed, 0);
    }

    #[tokio::test]
    async fn test_send_failure_requeues_with_original_time() {
        let store = memory_store();
        let r = add_recipient(&store, "11").await;
        let task = due(&store, r.id, "hello", 1).await;
        let transport = FakeTransport::failing(1);
        let d = dispatcher(&store, FakeDecider::new(), transport.clone());

        let report = d.tick(now()).await.unwrap();
        assert_eq!(report.requeued, 1);
        let back = store.get_reply_task(task.id).await.unwrap().unwrap();
        assert_eq!(back.status, ReplyStatus::Pending);
        assert_eq!(back.retry_count, 1);
        assert_eq!(back.scheduled_time, task.scheduled_time);

        let report = d.tick(now()).await.unwrap();
        assert_eq!(report.completed, 1);
        assert_eq!(transport.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_disabled_transport_fails_permanently() {
        let store = memory_store();
        let r = add_recipient(&store, "11").await;
        let task = due(&store, r.id, "hello", 1).await;

        let report = dispatcher(&store, FakeDecider::new(), FakeTransport::disabled())
            .tick(now())
            .await
            .unwrap();
        assert_eq!(report.failed, 1);
        let task = store.get_reply_task(task.id).await.unwrap().unwrap();
        assert_eq!(task.status, ReplyStatus::Failed);
        assert_eq!(task.retry_count, 0);
        assert!(task.error_message.contains("transport disabled"));
    }

    #[tokio::test]
    async fn test_unresolvable_address_does_not_block_other_groups() {
        let store = memory_store();
        let lost = add_recipient(&store, "unknown-1").await;
        let ok = add_recipient(&store, "22").await;
        let lost_task = due(&store, lost.id, "where?", 2).await;
        let ok_task = due(&store, ok.id, "here", 1).await;
        let transport = FakeTransport::new();

        let report = dispatcher(&store, FakeDecider::new(), transport.clone())
            .tick(now())
            .await
            .unwrap();
        assert_eq!(report.groups, 2);
        assert_eq!(report.completed, 1);
        assert_eq!(report.failed, 1);

        let lost_task = store.get_reply_task(lost_task.id).await.unwrap().unwrap();
        assert_eq!(lost_task.status, ReplyStatus::Failed);
        assert!(lost_task.error_message.contains("unresolvable address"));
        let ok_task = store.get_reply_task(ok_task.id).await.unwrap().unwrap();
        assert_eq!(ok_task.status, ReplyStatus::Completed);
        assert_eq!(transport.sent(), vec![("here".to_string(), "22".to_string())]);
    }

    #[tokio::test]
    async fn test_groups_are_sent_in_due_order() {
        let store = memory_store();
        let first = add_recipient(&store, "11").await;
        let second = add_recipient(&store, "22").await;
        due(&store, first.id, "late", 1).await;
        due(&store, second.id, "early", 10).await;
        let transport = FakeTransport::new();

        dispatcher(&store, FakeDecider::new(), transport.clone())
            .tick(now())
            .await
            .unwrap();
        let order: Vec<String> = transport.sent().into_iter().map(|(content, _)| content).collect();
        assert_eq!(order, vec!["early", "late"]);
    }

    #[test]
    fn test_group_by_recipient_keeps_first_seen_order() {
        let task = |id: i64, recipient: i64| ReplyTask {
            id,
            recipient_id: recipient,
            trigger: TriggerOrigin::User,
            content: format!("t{id}"),
            context: serde_json::json!({}),
            scheduled_time: now() + Duration::minutes(id),
            status: ReplyStatus::Executing,
            retry_count: 0,
            error_message: String::new(),
            claim_token: None,
            created_at: now(),
            updated_at: now(),
            executed_at: None,
        };
        let groups = group_by_recipient(vec![task(1, 9), task(2, 3), task(3, 9)]);
        let shape: Vec<(i64, Vec<i64>)> = groups
            .iter()
            .map(|(r, tasks)| (*r, tasks.iter().map(|t| t.id).collect()))
            .collect();
        assert_eq!(shape, vec![(9, vec![1, 3]), (3, vec![2])]);
    }

    #[tokio::test]
    async fn test_fail_without_ownership_is_not_counted() {
        let store = memory_store();
        let r = add_recipient(&store, "11").await;
        due(&store, r.id, "hello", 1).await;
        let d = dispatcher(&store, FakeDecider::new(), FakeTransport::new());

        let mut task = store.claim_due_reply_tasks(1, now()).await.unwrap().remove(0);
        task.claim_token = Some("another-claim".into());
        let outcome = d.fail(&task, "send failed", true).await.unwrap();
        assert_eq!(outcome, FailOutcome::Lost);

        let row = store.get_reply_task(task.id).await.unwrap().unwrap();
        assert_eq!(row.status, ReplyStatus::Executing);
        assert_eq!(row.retry_count, 0);
    }

    #[test]
    fn test_concat_contents_skips_blanks() {
        let contents = vec!["a ".to_string(), "  ".to_string(), "b".to_string()];
        assert_eq!(concat_contents(&contents), "a\n\nb");
    }
}
