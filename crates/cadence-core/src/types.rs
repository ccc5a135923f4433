//! Domain model — recipients, planned tasks, reply tasks, memories, message logs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

use crate::error::CadenceError;

pub type RecipientId = i64;
pub type TaskId = i64;

/// Upper bound on memory strength.
pub const MAX_STRENGTH: u8 = 10;
/// Bounds on memory weight.
pub const MIN_WEIGHT: f64 = 0.1;
pub const MAX_WEIGHT: f64 = 10.0;

// ─── Recipients ──────────────────────────────────────────────

/// The external identity a task or message is destined for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recipient {
    pub id: RecipientId,
    /// Identifier on the transport side (e.g. a chat user id).
    pub external_id: String,
    pub display_name: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl std::fmt::Display for Recipient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.display_name.is_empty() {
            write!(f, "#{} ({})", self.id, self.external_id)
        } else {
            write!(f, "{} (#{})", self.display_name, self.id)
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewRecipient {
    pub external_id: String,
    pub display_name: String,
}

// ─── Planned tasks ───────────────────────────────────────────

/// Kind of self-scheduled activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlannedCategory {
    Daily,
    Special,
    Reminder,
}

impl PlannedCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlannedCategory::Daily => "daily",
            PlannedCategory::Special => "special",
            PlannedCategory::Reminder => "reminder",
        }
    }
}

impl FromStr for PlannedCategory {
    type Err = CadenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "daily" => Ok(PlannedCategory::Daily),
            "special" => Ok(PlannedCategory::Special),
            "reminder" => Ok(PlannedCategory::Reminder),
            other => Err(CadenceError::Parse(format!("unknown task category '{other}'"))),
        }
    }
}

/// PlannedTask status. Every non-pending state is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlannedStatus {
    Pending,
    Completed,
    Cancelled,
    Failed,
}

impl PlannedStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlannedStatus::Pending => "pending",
            PlannedStatus::Completed => "completed",
            PlannedStatus::Cancelled => "cancelled",
            PlannedStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, PlannedStatus::Pending)
    }

    pub fn can_transition_to(&self, next: PlannedStatus) -> bool {
        matches!(self, PlannedStatus::Pending) && next.is_terminal()
    }
}

impl FromStr for PlannedStatus {
    type Err = CadenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PlannedStatus::Pending),
            "completed" => Ok(PlannedStatus::Completed),
            "cancelled" => Ok(PlannedStatus::Cancelled),
            "failed" => Ok(PlannedStatus::Failed),
            other => Err(CadenceError::Parse(format!("unknown planned status '{other}'"))),
        }
    }
}

impl std::fmt::Display for PlannedStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of self-scheduled activity for a recipient on a given day.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedTask {
    pub id: TaskId,
    pub recipient_id: RecipientId,
    pub title: String,
    pub description: String,
    pub category: PlannedCategory,
    pub scheduled_time: DateTime<Utc>,
    pub status: PlannedStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct NewPlannedTask {
    pub recipient_id: RecipientId,
    pub title: String,
    pub description: String,
    pub category: PlannedCategory,
    pub scheduled_time: DateTime<Utc>,
    pub metadata: serde_json::Value,
}

// ─── Reply tasks ─────────────────────────────────────────────

/// Who caused a reply task to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerOrigin {
    /// Created by the reply flow for an incoming user message.
    User,
    /// Created by a scheduled generator.
    Autonomous,
}

impl TriggerOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerOrigin::User => "user",
            TriggerOrigin::Autonomous => "autonomous",
        }
    }
}

impl FromStr for TriggerOrigin {
    type Err = CadenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(TriggerOrigin::User),
            "autonomous" => Ok(TriggerOrigin::Autonomous),
            other => Err(CadenceError::Parse(format!("unknown trigger origin '{other}'"))),
        }
    }
}

/// ReplyTask status.
///
/// ```text
/// pending ──claim──▶ executing ──▶ completed
///    │  ▲                 │
///    │  └──── retry ──── failed (retry_count < max_retries)
///    └──▶ cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyStatus {
    Pending,
    Executing,
    Completed,
    Failed,
    Cancelled,
}

impl ReplyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplyStatus::Pending => "pending",
            ReplyStatus::Executing => "executing",
            ReplyStatus::Completed => "completed",
            ReplyStatus::Failed => "failed",
            ReplyStatus::Cancelled => "cancelled",
        }
    }

    /// Allowed edges of the reply state machine.
    /// `pending → pending` is a reschedule (conflict shift).
    pub fn can_transition_to(&self, next: ReplyStatus) -> bool {
        use ReplyStatus::*;
        matches!(
            (self, next),
            (Pending, Pending)
                | (Pending, Executing)
                | (Pending, Cancelled)
                | (Executing, Completed)
                | (Executing, Failed)
                | (Failed, Pending)
        )
    }
}

impl FromStr for ReplyStatus {
    type Err = CadenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ReplyStatus::Pending),
            "executing" => Ok(ReplyStatus::Executing),
            "completed" => Ok(ReplyStatus::Completed),
            "failed" => Ok(ReplyStatus::Failed),
            "cancelled" => Ok(ReplyStatus::Cancelled),
            other => Err(CadenceError::Parse(format!("unknown reply status '{other}'"))),
        }
    }
}

impl std::fmt::Display for ReplyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of outbound communication awaiting dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyTask {
    pub id: TaskId,
    pub recipient_id: RecipientId,
    pub trigger: TriggerOrigin,
    pub content: String,
    /// Opaque snapshot echoed to the merge step.
    pub context: serde_json::Value,
    pub scheduled_time: DateTime<Utc>,
    pub status: ReplyStatus,
    pub retry_count: u32,
    pub error_message: String,
    /// Token of the dispatcher claim currently holding the row.
    pub claim_token: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub executed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewReplyTask {
    pub recipient_id: RecipientId,
    pub trigger: TriggerOrigin,
    pub content: String,
    pub context: serde_json::Value,
    pub scheduled_time: DateTime<Utc>,
}

/// A guarded state change for one reply task.
///
/// Applied only when the row is still in the expected `from` status (and,
/// when `claim_token` is set, still owned by that claim).
#[derive(Debug, Clone)]
pub struct ReplyUpdate {
    pub status: ReplyStatus,
    pub claim_token: Option<String>,
    pub retry_count: Option<u32>,
    pub error_message: Option<String>,
    pub executed_at: Option<DateTime<Utc>>,
    pub scheduled_time: Option<DateTime<Utc>>,
}

impl ReplyUpdate {
    pub fn to(status: ReplyStatus) -> Self {
        Self {
            status,
            claim_token: None,
            retry_count: None,
            error_message: None,
            executed_at: None,
            scheduled_time: None,
        }
    }

    pub fn owned_by(mut self, token: &str) -> Self {
        self.claim_token = Some(token.to_string());
        self
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    pub fn with_retry_count(mut self, count: u32) -> Self {
        self.retry_count = Some(count);
        self
    }

    pub fn executed(mut self, at: DateTime<Utc>) -> Self {
        self.executed_at = Some(at);
        self
    }

    pub fn rescheduled(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_time = Some(at);
        self
    }
}

// ─── Memories ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryKind {
    Hotspot,
    UserMemory,
    ImportantEvent,
}

impl MemoryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryKind::Hotspot => "hotspot",
            MemoryKind::UserMemory => "user_memory",
            MemoryKind::ImportantEvent => "important_event",
        }
    }
}

impl FromStr for MemoryKind {
    type Err = CadenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hotspot" => Ok(MemoryKind::Hotspot),
            "user_memory" => Ok(MemoryKind::UserMemory),
            "important_event" => Ok(MemoryKind::ImportantEvent),
            other => Err(CadenceError::Parse(format!("unknown memory kind '{other}'"))),
        }
    }
}

/// A weighted, decaying fact used as AI context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Memory {
    pub id: i64,
    pub recipient_id: RecipientId,
    pub title: String,
    pub content: String,
    pub kind: MemoryKind,
    pub strength: u8,
    pub weight: f64,
    pub forget_time: Option<DateTime<Utc>>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Memory {
    pub fn is_forgotten(&self, now: DateTime<Utc>) -> bool {
        self.forget_time.is_some_and(|t| now > t)
    }

    /// Strength/weight after a bounded strengthen by `delta`.
    pub fn strengthened(strength: u8, weight: f64, delta: u8) -> (u8, f64) {
        let strength = strength.saturating_add(delta).min(MAX_STRENGTH);
        let weight = (weight + f64::from(delta) * 0.1).min(MAX_WEIGHT);
        (strength, weight)
    }
}

#[derive(Debug, Clone)]
pub struct NewMemory {
    pub recipient_id: RecipientId,
    pub title: String,
    pub content: String,
    pub kind: MemoryKind,
    pub strength: i64,
    pub weight: f64,
    pub forget_time: Option<DateTime<Utc>>,
}

impl NewMemory {
    /// Strength clamped to 1..=10 and weight to 0.1..=10.0.
    pub fn clamped(&self) -> (u8, f64) {
        let strength = self.strength.clamp(1, i64::from(MAX_STRENGTH)) as u8;
        let weight = if self.weight.is_finite() {
            self.weight.clamp(MIN_WEIGHT, MAX_WEIGHT)
        } else {
            1.0
        };
        (strength, weight)
    }
}

// ─── Message log ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageDirection {
    Sent,
    Received,
}

impl MessageDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageDirection::Sent => "sent",
            MessageDirection::Received => "received",
        }
    }
}

impl FromStr for MessageDirection {
    type Err = CadenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sent" => Ok(MessageDirection::Sent),
            "received" => Ok(MessageDirection::Received),
            other => Err(CadenceError::Parse(format!("unknown direction '{other}'"))),
        }
    }
}

/// Immutable record of a delivered or received message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageLog {
    pub id: i64,
    pub recipient_id: RecipientId,
    pub direction: MessageDirection,
    pub sender: String,
    pub receiver: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    /// Reply tasks merged into this message (empty for received messages).
    pub reply_task_ids: Vec<TaskId>,
    pub raw: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct NewMessageLog {
    pub recipient_id: RecipientId,
    pub direction: MessageDirection,
    pub sender: String,
    pub receiver: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub reply_task_ids: Vec<TaskId>,
    pub raw: serde_json::Value,
}

// ─── AI collaborator inputs/outputs ──────────────────────────

/// Ranked snapshot handed to the AI collaborator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextBundle {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub memories: Vec<Memory>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recent_messages: Vec<MessageLog>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub planned_tasks: Vec<PlannedTask>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub yesterday_tasks: Vec<PlannedTask>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reply_tasks: Vec<ReplyTask>,
    /// Local date the bundle was built for (YYYY-MM-DD).
    #[serde(default)]
    pub local_date: String,
    /// Local wall-clock time at build (HH:MM).
    #[serde(default)]
    pub local_time: String,
    /// Offset of the local calendar, for rendering stored UTC times.
    #[serde(default)]
    pub utc_offset_minutes: i32,
}

/// One planned-task entry proposed by the AI collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskProposal {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_category", alias = "task_type")]
    pub category: String,
    /// Local time of day, "HH:MM".
    #[serde(default = "default_time")]
    pub time: String,
}

/// One proactive message proposed by the AI collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutreachProposal {
    pub content: String,
    #[serde(default = "default_time")]
    pub time: String,
}

fn default_category() -> String { "daily".into() }
fn default_time() -> String { "12:00".into() }

/// Reply text and how long to wait before sending it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyDecision {
    pub content: String,
    #[serde(default)]
    pub delay_minutes: i64,
}

/// A memory point detected in an incoming message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryProposal {
    pub title: String,
    pub content: String,
    #[serde(default = "default_strength")]
    pub strength: i64,
    #[serde(default = "default_weight")]
    pub weight: f64,
    /// Days until forgotten; 0 means never.
    #[serde(default = "default_forget_days")]
    pub forget_days: i64,
}

fn default_strength() -> i64 { 5 }
fn default_weight() -> f64 { 1.0 }
fn default_forget_days() -> i64 { 30 }

// ─── Stats ───────────────────────────────────────────────────

/// Row counts for operators.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreStats {
    pub recipients: u64,
    pub active_recipients: u64,
    pub planned_by_status: BTreeMap<String, u64>,
    pub reply_by_status: BTreeMap<String, u64>,
    pub memories: u64,
    pub messages: u64,
}
