//! Storage gateway — typed, atomic operations over recipients, tasks,
//! memories and message logs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::types::{
    Memory, MessageLog, NewMemory, NewMessageLog, NewPlannedTask, NewRecipient, NewReplyTask,
    PlannedStatus, PlannedTask, Recipient, RecipientId, ReplyStatus, ReplyTask, ReplyUpdate,
    StoreStats, TaskId, TriggerOrigin,
};

#[async_trait]
pub trait TaskStore: Send + Sync {
    fn name(&self) -> &str;

    // ─── Recipients ──────────────────────────────────────────

    /// Insert a recipient, or refresh the display name of an existing one.
    async fn upsert_recipient(&self, recipient: &NewRecipient) -> Result<Recipient>;
    async fn get_recipient(&self, id: RecipientId) -> Result<Option<Recipient>>;
    async fn list_recipients(&self) -> Result<Vec<Recipient>>;
    async fn active_recipients(&self) -> Result<Vec<Recipient>>;
    async fn set_recipient_active(&self, id: RecipientId, active: bool) -> Result<bool>;

    // ─── Planned tasks ───────────────────────────────────────

    async fn create_planned_task(&self, task: &NewPlannedTask) -> Result<PlannedTask>;

    /// Tasks with `start <= scheduled_time < end`, ascending.
    async fn planned_tasks_between(
        &self,
        recipient: RecipientId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        status: Option<PlannedStatus>,
        limit: usize,
    ) -> Result<Vec<PlannedTask>>;

    /// Move a pending task to a terminal status. Returns false when the row
    /// was not pending.
    async fn transition_planned_task(
        &self,
        id: TaskId,
        to: PlannedStatus,
        at: DateTime<Utc>,
    ) -> Result<bool>;

    // ─── Reply tasks ─────────────────────────────────────────

    async fn create_reply_task(&self, task: &NewReplyTask) -> Result<ReplyTask>;
    async fn get_reply_task(&self, id: TaskId) -> Result<Option<ReplyTask>>;

    /// Atomically claim up to `limit` due pending tasks of active recipients,
    /// ordered by `scheduled_time`, and mark them `executing` under one fresh
    /// claim token before returning. Rows held by a concurrent claimer are
    /// skipped, never waited on.
    async fn claim_due_reply_tasks(&self, limit: usize, now: DateTime<Utc>)
    -> Result<Vec<ReplyTask>>;

    /// Guarded state change: applied only while the row is in `from` (and
    /// owned by `update.claim_token` when set). Returns whether a row changed.
    async fn transition_reply_task(
        &self,
        id: TaskId,
        from: ReplyStatus,
        update: &ReplyUpdate,
    ) -> Result<bool>;

    /// Tasks of one recipient inside `[start, end]` matching origin and status.
    async fn find_conflicting(
        &self,
        recipient: RecipientId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        trigger: TriggerOrigin,
        status: ReplyStatus,
        exclude: Option<TaskId>,
    ) -> Result<Vec<ReplyTask>>;

    /// Tasks with `start <= scheduled_time < end`, ascending.
    async fn reply_tasks_between(
        &self,
        recipient: RecipientId,
        start: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
        status: Option<ReplyStatus>,
        limit: usize,
    ) -> Result<Vec<ReplyTask>>;

    // ─── Memories ────────────────────────────────────────────

    async fn create_memory(&self, memory: &NewMemory) -> Result<Memory>;
    async fn find_memory_by_title(&self, recipient: RecipientId, title: &str)
    -> Result<Option<Memory>>;

    /// Bounded strengthen; see [`Memory::strengthened`].
    async fn strengthen_memory(&self, id: i64, delta: u8) -> Result<Option<Memory>>;

    /// Not-yet-forgotten memories with `weight >= min_weight`, ordered by
    /// weight then strength, descending.
    async fn top_memories(
        &self,
        recipient: RecipientId,
        min_weight: f64,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Memory>>;

    // ─── Message log ─────────────────────────────────────────

    async fn append_message_log(&self, log: &NewMessageLog) -> Result<MessageLog>;

    /// Newest first.
    async fn recent_messages(
        &self,
        recipient: RecipientId,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<MessageLog>>;

    async fn stats(&self) -> Result<StoreStats>;
}
