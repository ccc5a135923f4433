//! Message intake — turns an incoming user message into a delayed reply task,
//! keeps autonomous outreach out of its way, and records memory points.

use std::sync::Arc;

use cadence_core::error::Result;
use cadence_core::traits::{Decider, TaskStore};
use cadence_core::types::{
    ContextBundle, Memory, MemoryKind, MessageDirection, NewMemory, NewMessageLog, NewReplyTask,
    Recipient, ReplyTask, TriggerOrigin,
};
use chrono::{DateTime, Duration, SecondsFormat, Utc};

use crate::conflict::{ConflictResolver, Shift};
use crate::context::ContextBuilder;

/// What handling one message produced.
#[derive(Debug)]
pub struct IntakeOutcome {
    pub reply_task: ReplyTask,
    pub shifted: Vec<Shift>,
    pub memory: Option<Memory>,
}

pub struct MessageIntake {
    store: Arc<dyn TaskStore>,
    decider: Arc<dyn Decider>,
    context: ContextBuilder,
    resolver: ConflictResolver,
}

impl MessageIntake {
    pub fn new(
        store: Arc<dyn TaskStore>,
        decider: Arc<dyn Decider>,
        context: ContextBuilder,
        resolver: ConflictResolver,
    ) -> Self {
        Self { store, decider, context, resolver }
    }

    /// Handle one incoming message. Only a failure to log the message, decide
    /// the reply or store the reply task is returned; conflict and memory
    /// failures are logged.
    pub async fn handle(
        &self,
        recipient: &Recipient,
        sender: &str,
        content: &str,
        raw: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<IntakeOutcome> {
        self.store
            .append_message_log(&NewMessageLog {
                recipient_id: recipient.id,
                direction: MessageDirection::Received,
                sender: sender.to_string(),
                receiver: recipient.external_id.clone(),
                content: content.to_string(),
                timestamp: now,
                reply_task_ids: Vec::new(),
                raw,
            })
            .await?;

        let ctx = self.context.reply(recipient, now).await?;
        let decision = self.decider.decide_reply(recipient, content, &ctx).await?;
        let delay = decision.delay_minutes.max(0);

        let reply_task = self
            .store
            .create_reply_task(&NewReplyTask {
                recipient_id: recipient.id,
                trigger: TriggerOrigin::User,
                content: decision.content.clone(),
                context: serde_json::json!({
                    "sender": sender,
                    "original_message": content,
                    "received_at": now.to_rfc3339_opts(SecondsFormat::Secs, true),
                    "delay_minutes": delay,
                }),
                scheduled_time: now + Duration::minutes(delay),
            })
            .await?;
        tracing::info!(
            recipient = %recipient.id,
            task_id = reply_task.id,
            "💬 Reply queued in {delay} min"
        );

        let shifted = match self.resolver.resolve(&reply_task).await {
            Ok(shifted) => shifted,
            Err(e) => {
                tracing::warn!(task_id = reply_task.id, "⚠️ Conflict resolution failed: {e}");
                Vec::new()
            }
        };

        let memory = match self.remember(recipient, content, &ctx, now).await {
            Ok(memory) => memory,
            Err(e) => {
                tracing::warn!(recipient = %recipient.id, "⚠️ Memory detection failed: {e}");
                None
            }
        };

        Ok(IntakeOutcome {
            reply_task,
            shifted,
            memory,
        })
    }

    /// Strengthen a same-title memory by 1, or store a new one.
    async fn remember(
        &self,
        recipient: &Recipient,
        content: &str,
        ctx: &ContextBundle,
        now: DateTime<Utc>,
    ) -> Result<Option<Memory>> {
        let Some(proposal) = self.decider.detect_memory(recipient, content, ctx).await? else {
            return Ok(None);
        };
        let title = proposal.title.trim();
        if title.is_empty() {
            return Ok(None);
        }

        if let Some(existing) = self.store.find_memory_by_title(recipient.id, title).await? {
            let strengthened = self.store.strengthen_memory(existing.id, 1).await?;
            tracing::debug!(recipient = %recipient.id, "🧠 Strengthened memory '{title}'");
            return Ok(strengthened);
        }

        let forget_time = (proposal.forget_days > 0).then(|| now + Duration::days(proposal.forget_days));
        let memory = self
            .store
            .create_memory(&NewMemory {
                recipient_id: recipient.id,
                title: title.to_string(),
                content: proposal.content.clone(),
                kind: MemoryKind::UserMemory,
                strength: proposal.strength,
                weight: proposal.weight,
                forget_time,
            })
            .await?;
        tracing::debug!(recipient = %recipient.id, "🧠 New memory '{title}'");
        Ok(Some(memory))
    }
}
