//! PostgreSQL storage gateway (feature `postgres`).
//!
//! The dispatcher claim uses `FOR UPDATE OF t SKIP LOCKED`: rows locked by a
//! concurrent claim are skipped, never waited on.

use async_trait::async_trait;
use cadence_core::error::{CadenceError, Result};
use cadence_core::traits::TaskStore;
use cadence_core::types::{
    Memory, MessageLog, NewMemory, NewMessageLog, NewPlannedTask, NewRecipient, NewReplyTask,
    PlannedStatus, PlannedTask, Recipient, RecipientId, ReplyStatus, ReplyTask, ReplyUpdate,
    StoreStats, TaskId, TriggerOrigin,
};
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, QueryBuilder, Row};
use std::collections::BTreeMap;

const RECIPIENT_COLS: &str = "id, external_id, display_name, is_active, created_at";
const PLANNED_COLS: &str = "id, recipient_id, title, description, category, scheduled_time, \
     status, created_at, updated_at, completed_at, metadata";
const REPLY_COLS: &str = "id, recipient_id, trigger_origin, content, context, scheduled_time, \
     status, retry_count, error_message, claim_token, created_at, updated_at, executed_at";
const MEMORY_COLS: &str = "id, recipient_id, title, content, kind, strength, weight, \
     forget_time, metadata, created_at, updated_at";
const MESSAGE_COLS: &str = "id, recipient_id, direction, sender, receiver, content, timestamp, raw";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS recipients (
    id BIGSERIAL PRIMARY KEY,
    external_id TEXT NOT NULL UNIQUE,
    display_name TEXT NOT NULL DEFAULT '',
    is_active BOOLEAN NOT NULL DEFAULT TRUE,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE TABLE IF NOT EXISTS planned_tasks (
    id BIGSERIAL PRIMARY KEY,
    recipient_id BIGINT NOT NULL REFERENCES recipients(id),
    title TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    category TEXT NOT NULL DEFAULT 'daily',
    scheduled_time TIMESTAMPTZ NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    completed_at TIMESTAMPTZ,
    metadata JSONB NOT NULL DEFAULT '{}'
);
CREATE INDEX IF NOT EXISTS idx_planned_recipient_time ON planned_tasks(recipient_id, scheduled_time);
CREATE TABLE IF NOT EXISTS reply_tasks (
    id BIGSERIAL PRIMARY KEY,
    recipient_id BIGINT NOT NULL REFERENCES recipients(id),
    trigger_origin TEXT NOT NULL,
    content TEXT NOT NULL,
    context JSONB NOT NULL DEFAULT '{}',
    scheduled_time TIMESTAMPTZ NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    retry_count INTEGER NOT NULL DEFAULT 0,
    error_message TEXT NOT NULL DEFAULT '',
    claim_token TEXT,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    executed_at TIMESTAMPTZ
);
CREATE INDEX IF NOT EXISTS idx_reply_status_time ON reply_tasks(status, scheduled_time);
CREATE INDEX IF NOT EXISTS idx_reply_recipient_time ON reply_tasks(recipient_id, scheduled_time);
CREATE TABLE IF NOT EXISTS memories (
    id BIGSERIAL PRIMARY KEY,
    recipient_id BIGINT NOT NULL REFERENCES recipients(id),
    title TEXT NOT NULL,
    content TEXT NOT NULL,
    kind TEXT NOT NULL DEFAULT 'user_memory',
    strength SMALLINT NOT NULL DEFAULT 5,
    weight DOUBLE PRECISION NOT NULL DEFAULT 1.0,
    forget_time TIMESTAMPTZ,
    metadata JSONB NOT NULL DEFAULT '{}',
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE INDEX IF NOT EXISTS idx_memories_recipient_title ON memories(recipient_id, title);
CREATE TABLE IF NOT EXISTS message_logs (
    id BIGSERIAL PRIMARY KEY,
    recipient_id BIGINT NOT NULL REFERENCES recipients(id),
    direction TEXT NOT NULL,
    sender TEXT NOT NULL DEFAULT '',
    receiver TEXT NOT NULL DEFAULT '',
    content TEXT NOT NULL,
    timestamp TIMESTAMPTZ NOT NULL,
    raw JSONB NOT NULL DEFAULT '{}'
);
CREATE INDEX IF NOT EXISTS idx_messages_recipient_time ON message_logs(recipient_id, timestamp);
CREATE TABLE IF NOT EXISTS message_log_tasks (
    message_log_id BIGINT NOT NULL REFERENCES message_logs(id),
    reply_task_id BIGINT NOT NULL REFERENCES reply_tasks(id),
    PRIMARY KEY (message_log_id, reply_task_id)
);
";

/// Postgres storage gateway over a connection pool.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(url)
            .await
            .map_err(|e| CadenceError::Store(format!("PG connect: {e}")))?;
        let store = Self { pool };
        store.migrate().await?;
        tracing::debug!("🗄️ Postgres store connected");
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| CadenceError::Store(format!("Migration: {e}")))?;
        Ok(())
    }
}

// ─── Row mapping ─────────────────────────────────────────────

fn parsed<T>(row: &PgRow, col: &str) -> Result<T>
where
    T: std::str::FromStr<Err = CadenceError>,
{
    let s: String = row.try_get(col).map_err(CadenceError::store)?;
    s.parse()
}

fn recipient_from_row(row: &PgRow) -> Result<Recipient> {
    Ok(Recipient {
        id: row.try_get("id").map_err(CadenceError::store)?,
        external_id: row.try_get("external_id").map_err(CadenceError::store)?,
        display_name: row.try_get("display_name").map_err(CadenceError::store)?,
        is_active: row.try_get("is_active").map_err(CadenceError::store)?,
        created_at: row.try_get("created_at").map_err(CadenceError::store)?,
    })
}

fn planned_from_row(row: &PgRow) -> Result<PlannedTask> {
    Ok(PlannedTask {
        id: row.try_get("id").map_err(CadenceError::store)?,
        recipient_id: row.try_get("recipient_id").map_err(CadenceError::store)?,
        title: row.try_get("title").map_err(CadenceError::store)?,
        description: row.try_get("description").map_err(CadenceError::store)?,
        category: parsed(row, "category")?,
        scheduled_time: row.try_get("scheduled_time").map_err(CadenceError::store)?,
        status: parsed(row, "status")?,
        created_at: row.try_get("created_at").map_err(CadenceError::store)?,
        updated_at: row.try_get("updated_at").map_err(CadenceError::store)?,
        completed_at: row.try_get("completed_at").map_err(CadenceError::store)?,
        metadata: row.try_get("metadata").map_err(CadenceError::store)?,
    })
}

fn reply_from_row(row: &PgRow) -> Result<ReplyTask> {
    let retry_count: i32 = row.try_get("retry_count").map_err(CadenceError::store)?;
    Ok(ReplyTask {
        id: row.try_get("id").map_err(CadenceError::store)?,
        recipient_id: row.try_get("recipient_id").map_err(CadenceError::store)?,
        trigger: parsed(row, "trigger_origin")?,
        content: row.try_get("content").map_err(CadenceError::store)?,
        context: row.try_get("context").map_err(CadenceError::store)?,
        scheduled_time: row.try_get("scheduled_time").map_err(CadenceError::store)?,
        status: parsed(row, "status")?,
        retry_count: retry_count.max(0) as u32,
        error_message: row.try_get("error_message").map_err(CadenceError::store)?,
        claim_token: row.try_get("claim_token").map_err(CadenceError::store)?,
        created_at: row.try_get("created_at").map_err(CadenceError::store)?,
        updated_at: row.try_get("updated_at").map_err(CadenceError::store)?,
        executed_at: row.try_get("executed_at").map_err(CadenceError::store)?,
    })
}

fn memory_from_row(row: &PgRow) -> Result<Memory> {
    let strength: i16 = row.try_get("strength").map_err(CadenceError::store)?;
    Ok(Memory {
        id: row.try_get("id").map_err(CadenceError::store)?,
        recipient_id: row.try_get("recipient_id").map_err(CadenceError::store)?,
        title: row.try_get("title").map_err(CadenceError::store)?,
        content: row.try_get("content").map_err(CadenceError::store)?,
        kind: parsed(row, "kind")?,
        strength: strength.clamp(0, i16::from(u8::MAX)) as u8,
        weight: row.try_get("weight").map_err(CadenceError::store)?,
        forget_time: row.try_get("forget_time").map_err(CadenceError::store)?,
        metadata: row.try_get("metadata").map_err(CadenceError::store)?,
        created_at: row.try_get("created_at").map_err(CadenceError::store)?,
        updated_at: row.try_get("updated_at").map_err(CadenceError::store)?,
    })
}

fn message_from_row(row: &PgRow) -> Result<MessageLog> {
    Ok(MessageLog {
        id: row.try_get("id").map_err(CadenceError::store)?,
        recipient_id: row.try_get("recipient_id").map_err(CadenceError::store)?,
        direction: parsed(row, "direction")?,
        sender: row.try_get("sender").map_err(CadenceError::store)?,
        receiver: row.try_get("receiver").map_err(CadenceError::store)?,
        content: row.try_get("content").map_err(CadenceError::store)?,
        timestamp: row.try_get("timestamp").map_err(CadenceError::store)?,
        reply_task_ids: Vec::new(),
        raw: row.try_get("raw").map_err(CadenceError::store)?,
    })
}

impl PgStore {
    async fn message_task_ids(&self, log_id: i64) -> Result<Vec<TaskId>> {
        let rows = sqlx::query(
            "SELECT reply_task_id FROM message_log_tasks WHERE message_log_id = $1 ORDER BY reply_task_id",
        )
        .bind(log_id)
        .fetch_all(&self.pool)
        .await
        .map_err(CadenceError::store)?;
        rows.iter()
            .map(|r| r.try_get::<i64, _>("reply_task_id").map_err(CadenceError::store))
            .collect()
    }

    async fn counts_by_status(&self, table: &str) -> Result<BTreeMap<String, u64>> {
        let rows = sqlx::query(&format!(
            "SELECT status, COUNT(*) AS n FROM {table} GROUP BY status"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(CadenceError::store)?;
        let mut out = BTreeMap::new();
        for row in rows {
            let status: String = row.try_get("status").map_err(CadenceError::store)?;
            let n: i64 = row.try_get("n").map_err(CadenceError::store)?;
            out.insert(status, n.max(0) as u64);
        }
        Ok(out)
    }

    async fn count(&self, sql: &str) -> Result<u64> {
        let n: i64 = sqlx::query_scalar(sql)
            .fetch_one(&self.pool)
            .await
            .map_err(CadenceError::store)?;
        Ok(n.max(0) as u64)
    }
}

#[async_trait]
impl TaskStore for PgStore {
    fn name(&self) -> &str {
        "postgres"
    }

    // ─── Recipients ──────────────────────────────────────────

    async fn upsert_recipient(&self, recipient: &NewRecipient) -> Result<Recipient> {
        let row = sqlx::query(&format!(
            "INSERT INTO recipients (external_id, display_name) VALUES ($1, $2)
             ON CONFLICT (external_id) DO UPDATE SET display_name =
                CASE WHEN EXCLUDED.display_name = '' THEN recipients.display_name
                     ELSE EXCLUDED.display_name END
             RETURNING {RECIPIENT_COLS}"
        ))
        .bind(&recipient.external_id)
        .bind(&recipient.display_name)
        .fetch_one(&self.pool)
        .await
        .map_err(CadenceError::store)?;
        recipient_from_row(&row)
    }

    async fn get_recipient(&self, id: RecipientId) -> Result<Option<Recipient>> {
        let row = sqlx::query(&format!("SELECT {RECIPIENT_COLS} FROM recipients WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(CadenceError::store)?;
        row.as_ref().map(recipient_from_row).transpose()
    }

    async fn list_recipients(&self) -> Result<Vec<Recipient>> {
        let rows = sqlx::query(&format!("SELECT {RECIPIENT_COLS} FROM recipients ORDER BY id"))
            .fetch_all(&self.pool)
            .await
            .map_err(CadenceError::store)?;
        rows.iter().map(recipient_from_row).collect()
    }

    async fn active_recipients(&self) -> Result<Vec<Recipient>> {
        let rows = sqlx::query(&format!(
            "SELECT {RECIPIENT_COLS} FROM recipients WHERE is_active ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(CadenceError::store)?;
        rows.iter().map(recipient_from_row).collect()
    }

    async fn set_recipient_active(&self, id: RecipientId, active: bool) -> Result<bool> {
        let done = sqlx::query("UPDATE recipients SET is_active = $1 WHERE id = $2")
            .bind(active)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(CadenceError::store)?;
        Ok(done.rows_affected() > 0)
    }

    // ─── Planned tasks ───────────────────────────────────────

    async fn create_planned_task(&self, task: &NewPlannedTask) -> Result<PlannedTask> {
        let row = sqlx::query(&format!(
            "INSERT INTO planned_tasks (recipient_id, title, description, category, scheduled_time, metadata)
             VALUES ($1, $2, $3, $4, $5, $6) RETURNING {PLANNED_COLS}"
        ))
        .bind(task.recipient_id)
        .bind(&task.title)
        .bind(&task.description)
        .bind(task.category.as_str())
        .bind(task.scheduled_time)
        .bind(&task.metadata)
        .fetch_one(&self.pool)
        .await
        .map_err(CadenceError::store)?;
        planned_from_row(&row)
    }

    async fn planned_tasks_between(
        &self,
        recipient: RecipientId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        status: Option<PlannedStatus>,
        limit: usize,
    ) -> Result<Vec<PlannedTask>> {
        let rows = sqlx::query(&format!(
            "SELECT {PLANNED_COLS} FROM planned_tasks
             WHERE recipient_id = $1 AND scheduled_time >= $2 AND scheduled_time < $3
               AND ($4::text IS NULL OR status = $4)
             ORDER BY scheduled_time, id LIMIT $5"
        ))
        .bind(recipient)
        .bind(start)
        .bind(end)
        .bind(status.map(|s| s.as_str()))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(CadenceError::store)?;
        rows.iter().map(planned_from_row).collect()
    }

    async fn transition_planned_task(
        &self,
        id: TaskId,
        to: PlannedStatus,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        if !PlannedStatus::Pending.can_transition_to(to) {
            return Err(CadenceError::InvalidTransition {
                from: PlannedStatus::Pending.to_string(),
                to: to.to_string(),
            });
        }
        let completed_at = (to == PlannedStatus::Completed).then_some(at);
        let done = sqlx::query(
            "UPDATE planned_tasks SET status = $1, updated_at = $2, completed_at = $3
             WHERE id = $4 AND status = 'pending'",
        )
        .bind(to.as_str())
        .bind(at)
        .bind(completed_at)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(CadenceError::store)?;
        Ok(done.rows_affected() > 0)
    }

    // ─── Reply tasks ─────────────────────────────────────────

    async fn create_reply_task(&self, task: &NewReplyTask) -> Result<ReplyTask> {
        let row = sqlx::query(&format!(
            "INSERT INTO reply_tasks (recipient_id, trigger_origin, content, context, scheduled_time)
             VALUES ($1, $2, $3, $4, $5) RETURNING {REPLY_COLS}"
        ))
        .bind(task.recipient_id)
        .bind(task.trigger.as_str())
        .bind(&task.content)
        .bind(&task.context)
        .bind(task.scheduled_time)
        .fetch_one(&self.pool)
        .await
        .map_err(CadenceError::store)?;
        reply_from_row(&row)
    }

    async fn get_reply_task(&self, id: TaskId) -> Result<Option<ReplyTask>> {
        let row = sqlx::query(&format!("SELECT {REPLY_COLS} FROM reply_tasks WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(CadenceError::store)?;
        row.as_ref().map(reply_from_row).transpose()
    }

    async fn claim_due_reply_tasks(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<ReplyTask>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let token = uuid::Uuid::new_v4().to_string();
        let mut tx = self.pool.begin().await.map_err(CadenceError::store)?;
        let rows = sqlx::query(&format!(
            "WITH due AS (
                 SELECT t.id FROM reply_tasks t
                 JOIN recipients r ON r.id = t.recipient_id
                 WHERE t.status = 'pending' AND t.scheduled_time <= $1 AND r.is_active
                 ORDER BY t.scheduled_time, t.id
                 LIMIT $2
                 FOR UPDATE OF t SKIP LOCKED
             )
             UPDATE reply_tasks SET status = 'executing', claim_token = $3, updated_at = now()
             FROM due WHERE reply_tasks.id = due.id
             RETURNING {}",
            REPLY_COLS
                .split(", ")
                .map(|c| format!("reply_tasks.{}", c.trim()))
                .collect::<Vec<_>>()
                .join(", ")
        ))
        .bind(now)
        .bind(limit as i64)
        .bind(&token)
        .fetch_all(&mut *tx)
        .await
        .map_err(CadenceError::store)?;
        tx.commit().await.map_err(CadenceError::store)?;

        let mut claimed = rows.iter().map(reply_from_row).collect::<Result<Vec<_>>>()?;
        // RETURNING order is unspecified.
        claimed.sort_by(|a, b| a.scheduled_time.cmp(&b.scheduled_time).then(a.id.cmp(&b.id)));
        if !claimed.is_empty() {
            tracing::debug!("🔒 Claimed {} reply task(s) [{}]", claimed.len(), token);
        }
        Ok(claimed)
    }

    async fn transition_reply_task(
        &self,
        id: TaskId,
        from: ReplyStatus,
        update: &ReplyUpdate,
    ) -> Result<bool> {
        if !from.can_transition_to(update.status) {
            return Err(CadenceError::InvalidTransition {
                from: from.to_string(),
                to: update.status.to_string(),
            });
        }

        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new("UPDATE reply_tasks SET status = ");
        qb.push_bind(update.status.as_str());
        qb.push(", updated_at = now()");
        if let Some(n) = update.retry_count {
            qb.push(", retry_count = ").push_bind(n as i32);
        }
        if let Some(msg) = &update.error_message {
            qb.push(", error_message = ").push_bind(msg.clone());
        }
        if let Some(at) = update.executed_at {
            qb.push(", executed_at = ").push_bind(at);
        }
        if let Some(at) = update.scheduled_time {
            qb.push(", scheduled_time = ").push_bind(at);
        }
        match (update.status, &update.claim_token) {
            (ReplyStatus::Pending, _) if from != ReplyStatus::Pending => {
                qb.push(", claim_token = NULL");
            }
            (ReplyStatus::Executing, Some(token)) => {
                qb.push(", claim_token = ").push_bind(token.clone());
            }
            _ => {}
        }
        qb.push(" WHERE id = ").push_bind(id);
        qb.push(" AND status = ").push_bind(from.as_str());
        if from != ReplyStatus::Pending {
            if let Some(token) = &update.claim_token {
                qb.push(" AND claim_token = ").push_bind(token.clone());
            }
        }

        let done = qb
            .build()
            .execute(&self.pool)
            .await
            .map_err(CadenceError::store)?;
        Ok(done.rows_affected() > 0)
    }

    async fn find_conflicting(
        &self,
        recipient: RecipientId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        trigger: TriggerOrigin,
        status: ReplyStatus,
        exclude: Option<TaskId>,
    ) -> Result<Vec<ReplyTask>> {
        let rows = sqlx::query(&format!(
            "SELECT {REPLY_COLS} FROM reply_tasks
             WHERE recipient_id = $1 AND trigger_origin = $2 AND status = $3
               AND scheduled_time BETWEEN $4 AND $5
               AND ($6::bigint IS NULL OR id <> $6)
             ORDER BY scheduled_time, id"
        ))
        .bind(recipient)
        .bind(trigger.as_str())
        .bind(status.as_str())
        .bind(start)
        .bind(end)
        .bind(exclude)
        .fetch_all(&self.pool)
        .await
        .map_err(CadenceError::store)?;
        rows.iter().map(reply_from_row).collect()
    }

    async fn reply_tasks_between(
        &self,
        recipient: RecipientId,
        start: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
        status: Option<ReplyStatus>,
        limit: usize,
    ) -> Result<Vec<ReplyTask>> {
        let rows = sqlx::query(&format!(
            "SELECT {REPLY_COLS} FROM reply_tasks
             WHERE recipient_id = $1 AND scheduled_time >= $2
               AND ($3::timestamptz IS NULL OR scheduled_time < $3)
               AND ($4::text IS NULL OR status = $4)
             ORDER BY scheduled_time, id LIMIT $5"
        ))
        .bind(recipient)
        .bind(start)
        .bind(end)
        .bind(status.map(|s| s.as_str()))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(CadenceError::store)?;
        rows.iter().map(reply_from_row).collect()
    }

    // ─── Memories ────────────────────────────────────────────

    async fn create_memory(&self, memory: &NewMemory) -> Result<Memory> {
        let (strength, weight) = memory.clamped();
        let row = sqlx::query(&format!(
            "INSERT INTO memories (recipient_id, title, content, kind, strength, weight, forget_time)
             VALUES ($1, $2, $3, $4, $5, $6, $7) RETURNING {MEMORY_COLS}"
        ))
        .bind(memory.recipient_id)
        .bind(&memory.title)
        .bind(&memory.content)
        .bind(memory.kind.as_str())
        .bind(i16::from(strength))
        .bind(weight)
        .bind(memory.forget_time)
        .fetch_one(&self.pool)
        .await
        .map_err(CadenceError::store)?;
        memory_from_row(&row)
    }

    async fn find_memory_by_title(
        &self,
        recipient: RecipientId,
        title: &str,
    ) -> Result<Option<Memory>> {
        let row = sqlx::query(&format!(
            "SELECT {MEMORY_COLS} FROM memories WHERE recipient_id = $1 AND title = $2
             ORDER BY updated_at DESC, id DESC LIMIT 1"
        ))
        .bind(recipient)
        .bind(title)
        .fetch_optional(&self.pool)
        .await
        .map_err(CadenceError::store)?;
        row.as_ref().map(memory_from_row).transpose()
    }

    async fn strengthen_memory(&self, id: i64, delta: u8) -> Result<Option<Memory>> {
        let row = sqlx::query(&format!(
            "UPDATE memories SET
                 strength = LEAST(10, strength + $2),
                 weight = LEAST(10.0, weight + 0.1::float8 * $2),
                 updated_at = now()
             WHERE id = $1 RETURNING {MEMORY_COLS}"
        ))
        .bind(id)
        .bind(i16::from(delta))
        .fetch_optional(&self.pool)
        .await
        .map_err(CadenceError::store)?;
        row.as_ref().map(memory_from_row).transpose()
    }

    async fn top_memories(
        &self,
        recipient: RecipientId,
        min_weight: f64,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Memory>> {
        let rows = sqlx::query(&format!(
            "SELECT {MEMORY_COLS} FROM memories
             WHERE recipient_id = $1 AND weight >= $2
               AND (forget_time IS NULL OR forget_time >= $3)
             ORDER BY weight DESC, strength DESC, updated_at DESC
             LIMIT $4"
        ))
        .bind(recipient)
        .bind(min_weight)
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(CadenceError::store)?;
        rows.iter().map(memory_from_row).collect()
    }

    // ─── Message log ─────────────────────────────────────────

    async fn append_message_log(&self, log: &NewMessageLog) -> Result<MessageLog> {
        let mut tx = self.pool.begin().await.map_err(CadenceError::store)?;
        let row = sqlx::query(&format!(
            "INSERT INTO message_logs (recipient_id, direction, sender, receiver, content, timestamp, raw)
             VALUES ($1, $2, $3, $4, $5, $6, $7) RETURNING {MESSAGE_COLS}"
        ))
        .bind(log.recipient_id)
        .bind(log.direction.as_str())
        .bind(&log.sender)
        .bind(&log.receiver)
        .bind(&log.content)
        .bind(log.timestamp)
        .bind(&log.raw)
        .fetch_one(&mut *tx)
        .await
        .map_err(CadenceError::store)?;
        let mut entry = message_from_row(&row)?;
        for task_id in &log.reply_task_ids {
            sqlx::query(
                "INSERT INTO message_log_tasks (message_log_id, reply_task_id) VALUES ($1, $2)
                 ON CONFLICT DO NOTHING",
            )
            .bind(entry.id)
            .bind(task_id)
            .execute(&mut *tx)
            .await
            .map_err(CadenceError::store)?;
        }
        tx.commit().await.map_err(CadenceError::store)?;

        let mut ids = log.reply_task_ids.clone();
        ids.sort_unstable();
        ids.dedup();
        entry.reply_task_ids = ids;
        Ok(entry)
    }

    async fn recent_messages(
        &self,
        recipient: RecipientId,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<MessageLog>> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLS} FROM message_logs
             WHERE recipient_id = $1 AND ($2::timestamptz IS NULL OR timestamp >= $2)
             ORDER BY timestamp DESC, id DESC LIMIT $3"
        ))
        .bind(recipient)
        .bind(since)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(CadenceError::store)?;
        let mut entries = rows.iter().map(message_from_row).collect::<Result<Vec<_>>>()?;
        for entry in &mut entries {
            entry.reply_task_ids = self.message_task_ids(entry.id).await?;
        }
        Ok(entries)
    }

    async fn stats(&self) -> Result<StoreStats> {
        Ok(StoreStats {
            recipients: self.count("SELECT COUNT(*) FROM recipients").await?,
            active_recipients: self
                .count("SELECT COUNT(*) FROM recipients WHERE is_active")
                .await?,
            planned_by_status: self.counts_by_status("planned_tasks").await?,
            reply_by_status: self.counts_by_status("reply_tasks").await?,
            memories: self.count("SELECT COUNT(*) FROM memories").await?,
            messages: self.count("SELECT COUNT(*) FROM message_logs").await?,
        })
    }
}
