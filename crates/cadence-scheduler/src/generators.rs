//! Job Generators — the Daily Planner and Autonomous Outreach.
//!
//! Both walk every active recipient. A failure for one recipient is logged
//! and recorded in the report; the rest of the batch still runs. Inside a
//! recipient's batch, malformed entries are skipped one by one.

use std::sync::Arc;

use cadence_core::clock::{LocalClock, parse_time_of_day};
use cadence_core::error::{CadenceError, Result};
use cadence_core::traits::{Decider, TaskStore};
use cadence_core::types::{
    NewPlannedTask, NewReplyTask, OutreachProposal, PlannedCategory, Recipient, RecipientId,
    TaskProposal, TriggerOrigin,
};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

use crate::context::ContextBuilder;

/// Outcome of one generator run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct GenerationReport {
    pub recipients: usize,
    pub created: usize,
    pub skipped_entries: usize,
    pub failed_recipients: Vec<(RecipientId, String)>,
}

impl GenerationReport {
    fn absorb(&mut self, recipient: &Recipient, outcome: Result<(usize, usize)>) {
        self.recipients += 1;
        match outcome {
            Ok((created, skipped)) => {
                self.created += created;
                self.skipped_entries += skipped;
            }
            Err(e) => {
                tracing::warn!(recipient = %recipient.id, "⚠️ Generation failed for {recipient}: {e}");
                self.failed_recipients.push((recipient.id, e.to_string()));
            }
        }
    }
}

impl std::fmt::Display for GenerationReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} recipient(s), {} created, {} entries skipped, {} recipient failure(s)",
            self.recipients,
            self.created,
            self.skipped_entries,
            self.failed_recipients.len()
        )
    }
}

/// Resolve an AI "HH:MM" to an instant on the local day of `now`.
fn scheduled_on_day(clock: &LocalClock, now: DateTime<Utc>, time: &str) -> Result<DateTime<Utc>> {
    let tod = parse_time_of_day(time)?;
    Ok(clock.at(clock.local_date(now), tod))
}

// ─── Daily Planner ───────────────────────────────────────────

/// Creates the day's PlannedTasks for every active recipient.
pub struct DailyPlanner {
    store: Arc<dyn TaskStore>,
    decider: Arc<dyn Decider>,
    context: ContextBuilder,
    clock: LocalClock,
}

impl DailyPlanner {
    pub fn new(
        store: Arc<dyn TaskStore>,
        decider: Arc<dyn Decider>,
        context: ContextBuilder,
        clock: LocalClock,
    ) -> Self {
        Self { store, decider, context, clock }
    }

    pub async fn run(&self, now: DateTime<Utc>) -> Result<GenerationReport> {
        let recipients = self.store.active_recipients().await?;
        tracing::info!("📅 Daily planning for {} recipient(s)", recipients.len());

        let mut report = GenerationReport::default();
        for recipient in &recipients {
            let outcome = self.plan_for(recipient, now).await;
            report.absorb(recipient, outcome);
        }
        tracing::info!("📅 Daily planning done: {report}");
        Ok(report)
    }

    /// Plan one recipient's day. Returns (created, skipped) entry counts.
    pub async fn plan_for(&self, recipient: &Recipient, now: DateTime<Utc>) -> Result<(usize, usize)> {
        let context = self.context.planning(recipient, now).await?;
        let proposals = self.decider.propose_daily_tasks(recipient, &context).await?;

        let (mut created, mut skipped) = (0, 0);
        for proposal in proposals {
            let task = match self.to_planned(recipient, &proposal, now) {
                Ok(task) => task,
                Err(e) => {
                    tracing::warn!(recipient = %recipient.id, "⚠️ Skipping plan entry '{}': {e}", proposal.title);
                    skipped += 1;
                    continue;
                }
            };
            self.store.create_planned_task(&task).await?;
            created += 1;
        }
        tracing::debug!(recipient = %recipient.id, "📝 Planned {created} task(s)");
        Ok((created, skipped))
    }

    fn to_planned(
        &self,
        recipient: &Recipient,
        proposal: &TaskProposal,
        now: DateTime<Utc>,
    ) -> Result<NewPlannedTask> {
        let title = proposal.title.trim();
        if title.is_empty() {
            return Err(CadenceError::Parse("empty title".into()));
        }
        let category: PlannedCategory = proposal.category.parse()?;
        Ok(NewPlannedTask {
            recipient_id: recipient.id,
            title: title.to_string(),
            description: proposal.description.trim().to_string(),
            category,
            scheduled_time: scheduled_on_day(&self.clock, now, &proposal.time)?,
            metadata: serde_json::json!({
                "generated_at": now.to_rfc3339_opts(SecondsFormat::Secs, true),
                "source": "daily_planner",
            }),
        })
    }
}

// ─── Autonomous Outreach ─────────────────────────────────────

/// Queues the day's proactive messages as autonomous ReplyTasks.
pub struct AutonomousOutreach {
    store: Arc<dyn TaskStore>,
    decider: Arc<dyn Decider>,
    context: ContextBuilder,
    clock: LocalClock,
}

impl AutonomousOutreach {
    pub fn new(
        store: Arc<dyn TaskStore>,
        decider: Arc<dyn Decider>,
        context: ContextBuilder,
        clock: LocalClock,
    ) -> Self {
        Self { store, decider, context, clock }
    }

    pub async fn run(&self, now: DateTime<Utc>) -> Result<GenerationReport> {
        let recipients = self.store.active_recipients().await?;
        tracing::info!("💬 Autonomous outreach for {} recipient(s)", recipients.len());

        let mut report = GenerationReport::default();
        for recipient in &recipients {
            let outcome = self.outreach_for(recipient, now).await;
            report.absorb(recipient, outcome);
        }
        tracing::info!("💬 Autonomous outreach done: {report}");
        Ok(report)
    }

    pub async fn outreach_for(
        &self,
        recipient: &Recipient,
        now: DateTime<Utc>,
    ) -> Result<(usize, usize)> {
        let context = self.context.outreach(recipient, now).await?;
        let proposals = self.decider.propose_outreach_messages(recipient, &context).await?;

        let (mut created, mut skipped) = (0, 0);
        for proposal in proposals {
            let task = match self.to_reply(recipient, &proposal, now) {
                Ok(task) => task,
                Err(e) => {
                    tracing::warn!(recipient = %recipient.id, "⚠️ Skipping outreach entry at '{}': {e}", proposal.time);
                    skipped += 1;
                    continue;
                }
            };
            let created_task = self.store.create_reply_task(&task).await?;
            tracing::debug!(
                recipient = %recipient.id,
                task_id = created_task.id,
                "📨 Outreach queued for {}",
                self.clock.local_hm(created_task.scheduled_time)
            );
            created += 1;
        }
        Ok((created, skipped))
    }

    fn to_reply(
        &self,
        recipient: &Recipient,
        proposal: &OutreachProposal,
        now: DateTime<Utc>,
    ) -> Result<NewReplyTask> {
        let content = proposal.content.trim();
        if content.is_empty() {
            return Err(CadenceError::Parse("empty content".into()));
        }
        Ok(NewReplyTask {
            recipient_id: recipient.id,
            trigger: TriggerOrigin::Autonomous,
            content: content.to_string(),
            context: serde_json::json!({
                "generated_at": now.to_rfc3339_opts(SecondsFormat::Secs, true),
                "task_context": "autonomous_daily",
            }),
            scheduled_time: scheduled_on_day(&self.clock, now, &proposal.time)?,
        })
    }
}
