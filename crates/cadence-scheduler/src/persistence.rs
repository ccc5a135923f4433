//! SQLite-backed storage gateway for recipients, planned tasks, reply tasks,
//! memories and message logs.
//!
//! SQLite has no row-level `SKIP LOCKED`; the dispatcher claim instead runs
//! inside a `BEGIN IMMEDIATE` transaction, which serializes writers across
//! connections. The claim does not wait on the busy timeout: a claimer that
//! finds the write lock taken gets an empty batch instead of an error.

use async_trait::async_trait;
use cadence_core::config::DatabaseConfig;
use cadence_core::error::{CadenceError, Result};
use cadence_core::traits::TaskStore;
use cadence_core::types::{
    Memory, MessageLog, NewMemory, NewMessageLog, NewPlannedTask, NewRecipient, NewReplyTask,
    PlannedStatus, PlannedTask, Recipient, RecipientId, ReplyStatus, ReplyTask, ReplyUpdate,
    StoreStats, TaskId, TriggerOrigin,
};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params, params_from_iter};
use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::Duration;

const RECIPIENT_COLS: &str = "id, external_id, display_name, is_active, created_at";
const PLANNED_COLS: &str = "id, recipient_id, title, description, category, scheduled_time, \
     status, created_at, updated_at, completed_at, metadata";
const REPLY_COLS: &str = "id, recipient_id, trigger_origin, content, context, scheduled_time, \
     status, retry_count, error_message, claim_token, created_at, updated_at, executed_at";
const MEMORY_COLS: &str = "id, recipient_id, title, content, kind, strength, weight, \
     forget_time, metadata, created_at, updated_at";
const MESSAGE_COLS: &str = "id, recipient_id, direction, sender, receiver, content, timestamp, raw";

/// SQLite storage gateway. One connection per store; open several stores on
/// the same file to get independent claimers.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    busy_timeout: Duration,
}

/// Busy timeout while claiming; a locked store is skipped, not waited on.
const CLAIM_BUSY_TIMEOUT: Duration = Duration::ZERO;

impl SqliteStore {
    /// Open or create the database at `path`.
    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path).map_err(|e| CadenceError::Store(format!("DB open: {e}")))?;
        conn.busy_timeout(busy_timeout)
            .map_err(|e| CadenceError::Store(format!("DB pragma: {e}")))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(|e| CadenceError::Store(format!("DB pragma: {e}")))?;
        let store = Self {
            conn: Mutex::new(conn),
            busy_timeout,
        };
        store.migrate()?;
        tracing::debug!("🗄️ Store opened at {}", path.display());
        Ok(store)
    }

    pub fn from_config(config: &DatabaseConfig) -> Result<Self> {
        Self::open(
            &config.expanded_path(),
            Duration::from_millis(config.busy_timeout_ms),
        )
    }

    /// Private in-memory database.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(CadenceError::store)?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .map_err(CadenceError::store)?;
        let store = Self {
            conn: Mutex::new(conn),
            busy_timeout: Duration::ZERO,
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock().map_err(CadenceError::store)?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS recipients (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                external_id TEXT NOT NULL UNIQUE,
                display_name TEXT NOT NULL DEFAULT '',
                is_active INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS planned_tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                recipient_id INTEGER NOT NULL REFERENCES recipients(id),
                title TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                category TEXT NOT NULL DEFAULT 'daily',   -- daily, special, reminder
                scheduled_time TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                completed_at TEXT,
                metadata TEXT NOT NULL DEFAULT '{}'
            );
            CREATE INDEX IF NOT EXISTS idx_planned_recipient_time
                ON planned_tasks(recipient_id, scheduled_time);

            CREATE TABLE IF NOT EXISTS reply_tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                recipient_id INTEGER NOT NULL REFERENCES recipients(id),
                trigger_origin TEXT NOT NULL,              -- user, autonomous
                content TEXT NOT NULL,
                context TEXT NOT NULL DEFAULT '{}',
                scheduled_time TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                retry_count INTEGER NOT NULL DEFAULT 0,
                error_message TEXT NOT NULL DEFAULT '',
                claim_token TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                executed_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_reply_status_time
                ON reply_tasks(status, scheduled_time);
            CREATE INDEX IF NOT EXISTS idx_reply_recipient_time
                ON reply_tasks(recipient_id, scheduled_time);

            CREATE TABLE IF NOT EXISTS memories (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                recipient_id INTEGER NOT NULL REFERENCES recipients(id),
                title TEXT NOT NULL,
                content TEXT NOT NULL,
                kind TEXT NOT NULL DEFAULT 'user_memory',
                strength INTEGER NOT NULL DEFAULT 5,
                weight REAL NOT NULL DEFAULT 1.0,
                forget_time TEXT,
                metadata TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_memories_recipient_title
                ON memories(recipient_id, title);

            CREATE TABLE IF NOT EXISTS message_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                recipient_id INTEGER NOT NULL REFERENCES recipients(id),
                direction TEXT NOT NULL,                   -- sent, received
                sender TEXT NOT NULL DEFAULT '',
                receiver TEXT NOT NULL DEFAULT '',
                content TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                raw TEXT NOT NULL DEFAULT '{}'
            );
            CREATE INDEX IF NOT EXISTS idx_messages_recipient_time
                ON message_logs(recipient_id, timestamp);

            -- Reply tasks merged into one delivered message
            CREATE TABLE IF NOT EXISTS message_log_tasks (
                message_log_id INTEGER NOT NULL REFERENCES message_logs(id),
                reply_task_id INTEGER NOT NULL REFERENCES reply_tasks(id),
                PRIMARY KEY (message_log_id, reply_task_id)
            );
            ",
        )
        .map_err(|e| CadenceError::Store(format!("Migration: {e}")))?;
        Ok(())
    }
}

// ─── Row mapping ─────────────────────────────────────────────

pub(crate) fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn conversion_error(
    idx: usize,
    e: impl Into<Box<dyn std::error::Error + Send + Sync>>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, e.into())
}

fn get_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let s: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn get_opt_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(s) => DateTime::parse_from_rfc3339(&s)
            .map(|d| Some(d.with_timezone(&Utc)))
            .map_err(|e| conversion_error(idx, e)),
        None => Ok(None),
    }
}

fn get_parsed<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = CadenceError>,
{
    let s: String = row.get(idx)?;
    s.parse().map_err(|e| conversion_error(idx, e))
}

fn get_json(row: &Row<'_>, idx: usize) -> rusqlite::Result<serde_json::Value> {
    let s: String = row.get(idx)?;
    serde_json::from_str(&s).map_err(|e| conversion_error(idx, e))
}

fn recipient_from_row(row: &Row<'_>) -> rusqlite::Result<Recipient> {
    Ok(Recipient {
        id: row.get(0)?,
        external_id: row.get(1)?,
        display_name: row.get(2)?,
        is_active: row.get(3)?,
        created_at: get_ts(row, 4)?,
    })
}

fn planned_from_row(row: &Row<'_>) -> rusqlite::Result<PlannedTask> {
    Ok(PlannedTask {
        id: row.get(0)?,
        recipient_id: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        category: get_parsed(row, 4)?,
        scheduled_time: get_ts(row, 5)?,
        status: get_parsed(row, 6)?,
        created_at: get_ts(row, 7)?,
        updated_at: get_ts(row, 8)?,
        completed_at: get_opt_ts(row, 9)?,
        metadata: get_json(row, 10)?,
    })
}

fn reply_from_row(row: &Row<'_>) -> rusqlite::Result<ReplyTask> {
    Ok(ReplyTask {
        id: row.get(0)?,
        recipient_id: row.get(1)?,
        trigger: get_parsed(row, 2)?,
        content: row.get(3)?,
        context: get_json(row, 4)?,
        scheduled_time: get_ts(row, 5)?,
        status: get_parsed(row, 6)?,
        retry_count: row.get(7)?,
        error_message: row.get(8)?,
        claim_token: row.get(9)?,
        created_at: get_ts(row, 10)?,
        updated_at: get_ts(row, 11)?,
        executed_at: get_opt_ts(row, 12)?,
    })
}

fn memory_from_row(row: &Row<'_>) -> rusqlite::Result<Memory> {
    Ok(Memory {
        id: row.get(0)?,
        recipient_id: row.get(1)?,
        title: row.get(2)?,
        content: row.get(3)?,
        kind: get_parsed(row, 4)?,
        strength: row.get(5)?,
        weight: row.get(6)?,
        forget_time: get_opt_ts(row, 7)?,
        metadata: get_json(row, 8)?,
        created_at: get_ts(row, 9)?,
        updated_at: get_ts(row, 10)?,
    })
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<MessageLog> {
    Ok(MessageLog {
        id: row.get(0)?,
        recipient_id: row.get(1)?,
        direction: get_parsed(row, 2)?,
        sender: row.get(3)?,
        receiver: row.get(4)?,
        content: row.get(5)?,
        timestamp: get_ts(row, 6)?,
        reply_task_ids: Vec::new(),
        raw: get_json(row, 7)?,
    })
}

fn fetch_reply(conn: &Connection, id: TaskId) -> Result<Option<ReplyTask>> {
    conn.query_row(
        &format!("SELECT {REPLY_COLS} FROM reply_tasks WHERE id = ?1"),
        params![id],
        reply_from_row,
    )
    .optional()
    .map_err(CadenceError::store)
}

fn fetch_memory(conn: &Connection, id: i64) -> Result<Option<Memory>> {
    conn.query_row(
        &format!("SELECT {MEMORY_COLS} FROM memories WHERE id = ?1"),
        params![id],
        memory_from_row,
    )
    .optional()
    .map_err(CadenceError::store)
}

fn message_task_ids(conn: &Connection, log_id: i64) -> Result<Vec<TaskId>> {
    let mut stmt = conn
        .prepare(
            "SELECT reply_task_id FROM message_log_tasks
             WHERE message_log_id = ?1 ORDER BY reply_task_id",
        )
        .map_err(CadenceError::store)?;
    let ids = stmt
        .query_map(params![log_id], |row| row.get(0))
        .map_err(CadenceError::store)?
        .collect::<rusqlite::Result<Vec<TaskId>>>()
        .map_err(CadenceError::store)?;
    Ok(ids)
}

fn is_busy(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if matches!(err.code, rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked)
    )
}

/// Select due rows and mark them executing in one `BEGIN IMMEDIATE`
/// transaction. A busy store yields an empty batch.
fn claim_due(conn: &mut Connection, limit: usize, now: DateTime<Utc>) -> Result<Vec<ReplyTask>> {
    let tx = match conn.transaction_with_behavior(TransactionBehavior::Immediate) {
        Ok(tx) => tx,
        Err(e) if is_busy(&e) => {
            tracing::debug!("⏭️ Claim skipped: store is locked by another claimer");
            return Ok(Vec::new());
        }
        Err(e) => return Err(CadenceError::store(e)),
    };

    let ids: Vec<TaskId> = {
        let mut stmt = tx
            .prepare(
                "SELECT t.id FROM reply_tasks t
                 JOIN recipients r ON r.id = t.recipient_id
                 WHERE t.status = 'pending' AND t.scheduled_time <= ?1 AND r.is_active = 1
                 ORDER BY t.scheduled_time, t.id
                 LIMIT ?2",
            )
            .map_err(CadenceError::store)?;
        stmt.query_map(params![ts(now), limit as i64], |row| row.get(0))
            .map_err(CadenceError::store)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(CadenceError::store)?
    };

    let token = uuid::Uuid::new_v4().to_string();
    let stamp = ts(Utc::now());
    let mut claimed = Vec::with_capacity(ids.len());
    for id in ids {
        let changed = tx
            .execute(
                "UPDATE reply_tasks SET status = 'executing', claim_token = ?1, updated_at = ?2
                 WHERE id = ?3 AND status = 'pending'",
                params![token, stamp, id],
            )
            .map_err(CadenceError::store)?;
        if changed == 1 {
            if let Some(task) = fetch_reply(&tx, id)? {
                claimed.push(task);
            }
        }
    }

    match tx.commit() {
        Ok(()) => {}
        Err(e) if is_busy(&e) => {
            tracing::debug!("⏭️ Claim rolled back: commit hit a locked store");
            return Ok(Vec::new());
        }
        Err(e) => return Err(CadenceError::store(e)),
    }
    if !claimed.is_empty() {
        tracing::debug!("🔒 Claimed {} reply task(s) [{}]", claimed.len(), token);
    }
    Ok(claimed)
}

fn count_by_status(conn: &Connection, table: &str) -> Result<std::collections::BTreeMap<String, u64>> {
    let mut stmt = conn
        .prepare(&format!("SELECT status, COUNT(*) FROM {table} GROUP BY status"))
        .map_err(CadenceError::store)?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
        .map_err(CadenceError::store)?;
    let mut out = std::collections::BTreeMap::new();
    for row in rows {
        let (status, count) = row.map_err(CadenceError::store)?;
        out.insert(status, count.max(0) as u64);
    }
    Ok(out)
}

fn count(conn: &Connection, sql: &str) -> Result<u64> {
    conn.query_row(sql, [], |row| row.get::<_, i64>(0))
        .map(|n| n.max(0) as u64)
        .map_err(CadenceError::store)
}

#[async_trait]
impl TaskStore for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    // ─── Recipients ──────────────────────────────────────────

    async fn upsert_recipient(&self, recipient: &NewRecipient) -> Result<Recipient> {
        let conn = self.conn.lock().map_err(CadenceError::store)?;
        conn.execute(
            "INSERT INTO recipients (external_id, display_name, is_active, created_at)
             VALUES (?1, ?2, 1, ?3)
             ON CONFLICT(external_id) DO UPDATE SET display_name =
                CASE WHEN excluded.display_name = '' THEN recipients.display_name
                     ELSE excluded.display_name END",
            params![recipient.external_id, recipient.display_name, ts(Utc::now())],
        )
        .map_err(CadenceError::store)?;
        conn.query_row(
            &format!("SELECT {RECIPIENT_COLS} FROM recipients WHERE external_id = ?1"),
            params![recipient.external_id],
            recipient_from_row,
        )
        .map_err(CadenceError::store)
    }

    async fn get_recipient(&self, id: RecipientId) -> Result<Option<Recipient>> {
        let conn = self.conn.lock().map_err(CadenceError::store)?;
        conn.query_row(
            &format!("SELECT {RECIPIENT_COLS} FROM recipients WHERE id = ?1"),
            params![id],
            recipient_from_row,
        )
        .optional()
        .map_err(CadenceError::store)
    }

    async fn list_recipients(&self) -> Result<Vec<Recipient>> {
        let conn = self.conn.lock().map_err(CadenceError::store)?;
        let mut stmt = conn
            .prepare(&format!("SELECT {RECIPIENT_COLS} FROM recipients ORDER BY id"))
            .map_err(CadenceError::store)?;
        let rows = stmt
            .query_map([], recipient_from_row)
            .map_err(CadenceError::store)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(CadenceError::store)
    }

    async fn active_recipients(&self) -> Result<Vec<Recipient>> {
        let conn = self.conn.lock().map_err(CadenceError::store)?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {RECIPIENT_COLS} FROM recipients WHERE is_active = 1 ORDER BY id"
            ))
            .map_err(CadenceError::store)?;
        let rows = stmt
            .query_map([], recipient_from_row)
            .map_err(CadenceError::store)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(CadenceError::store)
    }

    async fn set_recipient_active(&self, id: RecipientId, active: bool) -> Result<bool> {
        let conn = self.conn.lock().map_err(CadenceError::store)?;
        let changed = conn
            .execute(
                "UPDATE recipients SET is_active = ?1 WHERE id = ?2",
                params![active, id],
            )
            .map_err(CadenceError::store)?;
        Ok(changed > 0)
    }

    // ─── Planned tasks ───────────────────────────────────────

    async fn create_planned_task(&self, task: &NewPlannedTask) -> Result<PlannedTask> {
        let conn = self.conn.lock().map_err(CadenceError::store)?;
        let now = ts(Utc::now());
        conn.execute(
            "INSERT INTO planned_tasks
             (recipient_id, title, description, category, scheduled_time, status,
              created_at, updated_at, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6, ?6, ?7)",
            params![
                task.recipient_id,
                task.title,
                task.description,
                task.category.as_str(),
                ts(task.scheduled_time),
                now,
                task.metadata.to_string(),
            ],
        )
        .map_err(CadenceError::store)?;
        let id = conn.last_insert_rowid();
        conn.query_row(
            &format!("SELECT {PLANNED_COLS} FROM planned_tasks WHERE id = ?1"),
            params![id],
            planned_from_row,
        )
        .map_err(CadenceError::store)
    }

    async fn planned_tasks_between(
        &self,
        recipient: RecipientId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        status: Option<PlannedStatus>,
        limit: usize,
    ) -> Result<Vec<PlannedTask>> {
        let conn = self.conn.lock().map_err(CadenceError::store)?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {PLANNED_COLS} FROM planned_tasks
                 WHERE recipient_id = ?1 AND scheduled_time >= ?2 AND scheduled_time < ?3
                   AND (?4 IS NULL OR status = ?4)
                 ORDER BY scheduled_time, id LIMIT ?5"
            ))
            .map_err(CadenceError::store)?;
        let rows = stmt
            .query_map(
                params![
                    recipient,
                    ts(start),
                    ts(end),
                    status.map(|s| s.as_str()),
                    limit as i64
                ],
                planned_from_row,
            )
            .map_err(CadenceError::store)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(CadenceError::store)
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
        let completed_at = (to == PlannedStatus::Completed).then(|| ts(at));
        let conn = self.conn.lock().map_err(CadenceError::store)?;
        let changed = conn
            .execute(
                "UPDATE planned_tasks SET status = ?1, updated_at = ?2, completed_at = ?3
                 WHERE id = ?4 AND status = 'pending'",
                params![to.as_str(), ts(at), completed_at, id],
            )
            .map_err(CadenceError::store)?;
        Ok(changed > 0)
    }

    // ─── Reply tasks ─────────────────────────────────────────

    async fn create_reply_task(&self, task: &NewReplyTask) -> Result<ReplyTask> {
        let conn = self.conn.lock().map_err(CadenceError::store)?;
        let now = ts(Utc::now());
        conn.execute(
            "INSERT INTO reply_tasks
             (recipient_id, trigger_origin, content, context, scheduled_time, status,
              retry_count, error_message, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 'pending', 0, '', ?6, ?6)",
            params![
                task.recipient_id,
                task.trigger.as_str(),
                task.content,
                task.context.to_string(),
                ts(task.scheduled_time),
                now,
            ],
        )
        .map_err(CadenceError::store)?;
        let id = conn.last_insert_rowid();
        fetch_reply(&conn, id)?
            .ok_or_else(|| CadenceError::NotFound(format!("reply task {id}")))
    }

    async fn get_reply_task(&self, id: TaskId) -> Result<Option<ReplyTask>> {
        let conn = self.conn.lock().map_err(CadenceError::store)?;
        fetch_reply(&conn, id)
    }

    async fn claim_due_reply_tasks(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<ReplyTask>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.lock().map_err(CadenceError::store)?;
        conn.busy_timeout(CLAIM_BUSY_TIMEOUT)
            .map_err(CadenceError::store)?;
        let claimed = claim_due(&mut conn, limit, now);
        conn.busy_timeout(self.busy_timeout)
            .map_err(CadenceError::store)?;
        claimed
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

        let mut sql = String::from("UPDATE reply_tasks SET status = ?, updated_at = ?");
        let mut args: Vec<SqlValue> = vec![
            SqlValue::Text(update.status.as_str().into()),
            SqlValue::Text(ts(Utc::now())),
        ];
        if let Some(n) = update.retry_count {
            sql.push_str(", retry_count = ?");
            args.push(SqlValue::Integer(i64::from(n)));
        }
        if let Some(msg) = &update.error_message {
            sql.push_str(", error_message = ?");
            args.push(SqlValue::Text(msg.clone()));
        }
        if let Some(at) = update.executed_at {
            sql.push_str(", executed_at = ?");
            args.push(SqlValue::Text(ts(at)));
        }
        if let Some(at) = update.scheduled_time {
            sql.push_str(", scheduled_time = ?");
            args.push(SqlValue::Text(ts(at)));
        }
        match (update.status, &update.claim_token) {
            (ReplyStatus::Pending, _) if from != ReplyStatus::Pending => {
                sql.push_str(", claim_token = NULL");
            }
            (ReplyStatus::Executing, Some(token)) => {
                sql.push_str(", claim_token = ?");
                args.push(SqlValue::Text(token.clone()));
            }
            _ => {}
        }

        sql.push_str(" WHERE id = ? AND status = ?");
        args.push(SqlValue::Integer(id));
        args.push(SqlValue::Text(from.as_str().into()));
        if from != ReplyStatus::Pending {
            if let Some(token) = &update.claim_token {
                sql.push_str(" AND claim_token = ?");
                args.push(SqlValue::Text(token.clone()));
            }
        }

        let conn = self.conn.lock().map_err(CadenceError::store)?;
        let changed = conn
            .execute(&sql, params_from_iter(args.iter()))
            .map_err(CadenceError::store)?;
        Ok(changed > 0)
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
        let conn = self.conn.lock().map_err(CadenceError::store)?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {REPLY_COLS} FROM reply_tasks
                 WHERE recipient_id = ?1 AND trigger_origin = ?2 AND status = ?3
                   AND scheduled_time >= ?4 AND scheduled_time <= ?5
                   AND (?6 IS NULL OR id != ?6)
                 ORDER BY scheduled_time, id"
            ))
            .map_err(CadenceError::store)?;
        let rows = stmt
            .query_map(
                params![
                    recipient,
                    trigger.as_str(),
                    status.as_str(),
                    ts(start),
                    ts(end),
                    exclude
                ],
                reply_from_row,
            )
            .map_err(CadenceError::store)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(CadenceError::store)
    }

    async fn reply_tasks_between(
        &self,
        recipient: RecipientId,
        start: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
        status: Option<ReplyStatus>,
        limit: usize,
    ) -> Result<Vec<ReplyTask>> {
        let conn = self.conn.lock().map_err(CadenceError::store)?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {REPLY_COLS} FROM reply_tasks
                 WHERE recipient_id = ?1 AND scheduled_time >= ?2
                   AND (?3 IS NULL OR scheduled_time < ?3)
                   AND (?4 IS NULL OR status = ?4)
                 ORDER BY scheduled_time, id LIMIT ?5"
            ))
            .map_err(CadenceError::store)?;
        let rows = stmt
            .query_map(
                params![
                    recipient,
                    ts(start),
                    end.map(ts),
                    status.map(|s| s.as_str()),
                    limit as i64
                ],
                reply_from_row,
            )
            .map_err(CadenceError::store)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(CadenceError::store)
    }

    // ─── Memories ────────────────────────────────────────────

    async fn create_memory(&self, memory: &NewMemory) -> Result<Memory> {
        let (strength, weight) = memory.clamped();
        let conn = self.conn.lock().map_err(CadenceError::store)?;
        let now = ts(Utc::now());
        conn.execute(
            "INSERT INTO memories
             (recipient_id, title, content, kind, strength, weight, forget_time,
              metadata, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, '{}', ?8, ?8)",
            params![
                memory.recipient_id,
                memory.title,
                memory.content,
                memory.kind.as_str(),
                strength,
                weight,
                memory.forget_time.map(ts),
                now,
            ],
        )
        .map_err(CadenceError::store)?;
        let id = conn.last_insert_rowid();
        fetch_memory(&conn, id)?.ok_or_else(|| CadenceError::NotFound(format!("memory {id}")))
    }

    async fn find_memory_by_title(
        &self,
        recipient: RecipientId,
        title: &str,
    ) -> Result<Option<Memory>> {
        let conn = self.conn.lock().map_err(CadenceError::store)?;
        conn.query_row(
            &format!(
                "SELECT {MEMORY_COLS} FROM memories WHERE recipient_id = ?1 AND title = ?2
                 ORDER BY updated_at DESC, id DESC LIMIT 1"
            ),
            params![recipient, title],
            memory_from_row,
        )
        .optional()
        .map_err(CadenceError::store)
    }

    async fn strengthen_memory(&self, id: i64, delta: u8) -> Result<Option<Memory>> {
        let mut conn = self.conn.lock().map_err(CadenceError::store)?;
        let tx = conn.transaction().map_err(CadenceError::store)?;
        let Some(current) = fetch_memory(&tx, id)? else {
            return Ok(None);
        };
        let (strength, weight) = Memory::strengthened(current.strength, current.weight, delta);
        tx.execute(
            "UPDATE memories SET strength = ?1, weight = ?2, updated_at = ?3 WHERE id = ?4",
            params![strength, weight, ts(Utc::now()), id],
        )
        .map_err(CadenceError::store)?;
        let updated = fetch_memory(&tx, id)?;
        tx.commit().map_err(CadenceError::store)?;
        Ok(updated)
    }

    async fn top_memories(
        &self,
        recipient: RecipientId,
        min_weight: f64,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Memory>> {
        let conn = self.conn.lock().map_err(CadenceError::store)?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {MEMORY_COLS} FROM memories
                 WHERE recipient_id = ?1 AND weight >= ?2
                   AND (forget_time IS NULL OR forget_time >= ?3)
                 ORDER BY weight DESC, strength DESC, updated_at DESC
                 LIMIT ?4"
            ))
            .map_err(CadenceError::store)?;
        let rows = stmt
            .query_map(
                params![recipient, min_weight, ts(now), limit as i64],
                memory_from_row,
            )
            .map_err(CadenceError::store)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(CadenceError::store)
    }

    // ─── Message log ─────────────────────────────────────────

    async fn append_message_log(&self, log: &NewMessageLog) -> Result<MessageLog> {
        let mut conn = self.conn.lock().map_err(CadenceError::store)?;
        let tx = conn.transaction().map_err(CadenceError::store)?;
        tx.execute(
            "INSERT INTO message_logs
             (recipient_id, direction, sender, receiver, content, timestamp, raw)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                log.recipient_id,
                log.direction.as_str(),
                log.sender,
                log.receiver,
                log.content,
                ts(log.timestamp),
                log.raw.to_string(),
            ],
        )
        .map_err(CadenceError::store)?;
        let id = tx.last_insert_rowid();
        for task_id in &log.reply_task_ids {
            tx.execute(
                "INSERT OR IGNORE INTO message_log_tasks (message_log_id, reply_task_id)
                 VALUES (?1, ?2)",
                params![id, task_id],
            )
            .map_err(CadenceError::store)?;
        }
        let mut entry = tx
            .query_row(
                &format!("SELECT {MESSAGE_COLS} FROM message_logs WHERE id = ?1"),
                params![id],
                message_from_row,
            )
            .map_err(CadenceError::store)?;
        entry.reply_task_ids = message_task_ids(&tx, id)?;
        tx.commit().map_err(CadenceError::store)?;
        Ok(entry)
    }

    async fn recent_messages(
        &self,
        recipient: RecipientId,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<MessageLog>> {
        let conn = self.conn.lock().map_err(CadenceError::store)?;
        let mut entries = {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {MESSAGE_COLS} FROM message_logs
                     WHERE recipient_id = ?1 AND (?2 IS NULL OR timestamp >= ?2)
                     ORDER BY timestamp DESC, id DESC LIMIT ?3"
                ))
                .map_err(CadenceError::store)?;
            let rows = stmt
                .query_map(
                    params![recipient, since.map(ts), limit as i64],
                    message_from_row,
                )
                .map_err(CadenceError::store)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .map_err(CadenceError::store)?
        };
        for entry in &mut entries {
            entry.reply_task_ids = message_task_ids(&conn, entry.id)?;
        }
        Ok(entries)
    }

    async fn stats(&self) -> Result<StoreStats> {
        let conn = self.conn.lock().map_err(CadenceError::store)?;
        Ok(StoreStats {
            recipients: count(&conn, "SELECT COUNT(*) FROM recipients")?,
            active_recipients: count(&conn, "SELECT COUNT(*) FROM recipients WHERE is_active = 1")?,
            planned_by_status: count_by_status(&conn, "planned_tasks")?,
            reply_by_status: count_by_status(&conn, "reply_tasks")?,
            memories: count(&conn, "SELECT COUNT(*) FROM memories")?,
            messages: count(&conn, "SELECT COUNT(*) FROM message_logs")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::types::{MemoryKind, MessageDirection};
    use chrono::{Duration as ChronoDuration, TimeZone};
    use std::collections::HashSet;
    use std::sync::Arc;

    fn t(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, h, m, 0).unwrap()
    }

    async fn recipient(store: &SqliteStore, ext: &str) -> Recipient {
        store
            .upsert_recipient(&NewRecipient {
                external_id: ext.into(),
                display_name: format!("User {ext}"),
            })
            .await
            .unwrap()
    }

    async fn reply(
        store: &SqliteStore,
        recipient: RecipientId,
        trigger: TriggerOrigin,
        at: DateTime<Utc>,
        content: &str,
    ) -> ReplyTask {
        store
            .create_reply_task(&NewReplyTask {
                recipient_id: recipient,
                trigger,
                content: content.into(),
                context: serde_json::json!({}),
                scheduled_time: at,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_upsert_recipient_is_idempotent() {
        let store = SqliteStore::in_memory().unwrap();
        let a = recipient(&store, "42").await;
        let b = store
            .upsert_recipient(&NewRecipient {
                external_id: "42".into(),
                display_name: String::new(),
            })
            .await
            .unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(b.display_name, "User 42");
        assert_eq!(store.list_recipients().await.unwrap().len(), 1);

        assert!(store.set_recipient_active(a.id, false).await.unwrap());
        assert!(store.active_recipients().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_claim_limit_and_order() {
        let store = SqliteStore::in_memory().unwrap();
        let r = recipient(&store, "1").await;
        for i in 0..25 {
            reply(&store, r.id, TriggerOrigin::Autonomous, t(8, 0) + ChronoDuration::minutes(i), "hi").await;
        }
        let claimed = store.claim_due_reply_tasks(20, t(12, 0)).await.unwrap();
        assert_eq!(claimed.len(), 20);
        assert!(claimed.iter().all(|task| task.status == ReplyStatus::Executing));
        assert!(claimed.windows(2).all(|w| w[0].scheduled_time <= w[1].scheduled_time));
        let token = claimed[0].claim_token.clone();
        assert!(token.is_some());
        assert!(claimed.iter().all(|task| task.claim_token == token));

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.reply_by_status.get("pending"), Some(&5));
        assert_eq!(stats.reply_by_status.get("executing"), Some(&20));
    }

    #[tokio::test]
    async fn test_claim_skips_future_and_inactive() {
        let store = SqliteStore::in_memory().unwrap();
        let active = recipient(&store, "1").await;
        let inactive = recipient(&store, "2").await;
        store.set_recipient_active(inactive.id, false).await.unwrap();

        reply(&store, active.id, TriggerOrigin::User, t(9, 0), "due").await;
        reply(&store, active.id, TriggerOrigin::User, t(11, 0), "later").await;
        reply(&store, inactive.id, TriggerOrigin::User, t(9, 0), "muted").await;

        let claimed = store.claim_due_reply_tasks(20, t(10, 0)).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].content, "due");
        assert!(store.claim_due_reply_tasks(20, t(10, 0)).await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_claims_are_disjoint() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("claims.db");
        let a = Arc::new(SqliteStore::open(&path, Duration::from_secs(5)).unwrap());
        let b = Arc::new(SqliteStore::open(&path, Duration::from_secs(5)).unwrap());

        let r = recipient(&a, "1").await;
        for i in 0..30 {
            reply(&a, r.id, TriggerOrigin::Autonomous, t(8, 0) + ChronoDuration::seconds(i), "x").await;
        }

        // Claimers skip a locked store rather than wait, so each keeps trying.
        let mut handles = Vec::new();
        for store in [a.clone(), b.clone(), a.clone(), b.clone()] {
            handles.push(tokio::spawn(async move {
                let mut mine = Vec::new();
                for _ in 0..20 {
                    mine.extend(store.claim_due_reply_tasks(10, t(12, 0)).await.unwrap());
                    tokio::task::yield_now().await;
                }
                mine
            }));
        }
        let mut seen = HashSet::new();
        for handle in handles {
            for task in handle.await.unwrap() {
                assert!(seen.insert(task.id), "task {} claimed twice", task.id);
            }
        }
        for task in a.claim_due_reply_tasks(30, t(12, 0)).await.unwrap() {
            assert!(seen.insert(task.id), "task {} claimed twice", task.id);
        }
        assert_eq!(seen.len(), 30);
    }

    #[tokio::test]
    async fn test_claim_skips_locked_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("locked.db");
        let store = SqliteStore::open(&path, Duration::from_secs(5)).unwrap();
        let r = recipient(&store, "1").await;
        let task = reply(&store, r.id, TriggerOrigin::User, t(9, 0), "hi").await;

        let other = Connection::open(&path).unwrap();
        other.execute_batch("BEGIN IMMEDIATE").unwrap();

        let started = std::time::Instant::now();
        let claimed = store.claim_due_reply_tasks(20, t(12, 0)).await.unwrap();
        assert!(claimed.is_empty());
        assert!(started.elapsed() < Duration::from_secs(1));

        other.execute_batch("ROLLBACK").unwrap();
        let row = store.get_reply_task(task.id).await.unwrap().unwrap();
        assert_eq!(row.status, ReplyStatus::Pending);
        assert!(row.claim_token.is_none());

        // The normal busy timeout is back for the next claim.
        assert_eq!(store.claim_due_reply_tasks(20, t(12, 0)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_json_column_is_an_error() {
        let store = SqliteStore::in_memory().unwrap();
        let r = recipient(&store, "1").await;
        let task = reply(&store, r.id, TriggerOrigin::User, t(9, 0), "hi").await;
        store
            .conn
            .lock()
            .unwrap()
            .execute("UPDATE reply_tasks SET context = '{not json' WHERE id = ?1", params![task.id])
            .unwrap();

        assert!(matches!(
            store.get_reply_task(task.id).await,
            Err(CadenceError::Store(_))
        ));
    }

    #[tokio::test]
    async fn test_guarded_transitions() {
        let store = SqliteStore::in_memory().unwrap();
        let r = recipient(&store, "1").await;
        reply(&store, r.id, TriggerOrigin::User, t(9, 0), "hello").await;
        let task = store.claim_due_reply_tasks(1, t(9, 0)).await.unwrap().remove(0);
        let token = task.claim_token.clone().unwrap();

        // Wrong owner cannot finalize.
        let stolen = ReplyUpdate::to(ReplyStatus::Completed).owned_by("someone-else");
        assert!(!store.transition_reply_task(task.id, ReplyStatus::Executing, &stolen).await.unwrap());

        let failed = ReplyUpdate::to(ReplyStatus::Failed)
            .owned_by(&token)
            .with_error("boom");
        assert!(store.transition_reply_task(task.id, ReplyStatus::Executing, &failed).await.unwrap());

        // Not executing any more.
        assert!(!store.transition_reply_task(task.id, ReplyStatus::Executing, &failed).await.unwrap());

        let retry = ReplyUpdate::to(ReplyStatus::Pending)
            .owned_by(&token)
            .with_retry_count(1);
        assert!(store.transition_reply_task(task.id, ReplyStatus::Failed, &retry).await.unwrap());
        let back = store.get_reply_task(task.id).await.unwrap().unwrap();
        assert_eq!(back.status, ReplyStatus::Pending);
        assert_eq!(back.retry_count, 1);
        assert_eq!(back.error_message, "boom");
        assert!(back.claim_token.is_none());

        let bad = ReplyUpdate::to(ReplyStatus::Cancelled);
        assert!(matches!(
            store.transition_reply_task(task.id, ReplyStatus::Executing, &bad).await,
            Err(CadenceError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_find_conflicting_window() {
        let store = SqliteStore::in_memory().unwrap();
        let r = recipient(&store, "1").await;
        let inside = reply(&store, r.id, TriggerOrigin::Autonomous, t(9, 0), "a").await;
        reply(&store, r.id, TriggerOrigin::Autonomous, t(10, 0), "b").await;
        let user = reply(&store, r.id, TriggerOrigin::User, t(9, 5), "u").await;

        let found = store
            .find_conflicting(
                r.id,
                t(8, 50),
                t(9, 20),
                TriggerOrigin::Autonomous,
                ReplyStatus::Pending,
                Some(user.id),
            )
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, inside.id);
    }

    #[tokio::test]
    async fn test_planned_tasks_window_and_terminal() {
        let store = SqliteStore::in_memory().unwrap();
        let r = recipient(&store, "1").await;
        let task = store
            .create_planned_task(&NewPlannedTask {
                recipient_id: r.id,
                title: "Morning walk".into(),
                description: String::new(),
                category: cadence_core::types::PlannedCategory::Daily,
                scheduled_time: t(7, 30),
                metadata: serde_json::json!({"source": "planner"}),
            })
            .await
            .unwrap();

        let day = store
            .planned_tasks_between(r.id, t(0, 0), t(23, 59), Some(PlannedStatus::Pending), 20)
            .await
            .unwrap();
        assert_eq!(day.len(), 1);
        assert_eq!(day[0].metadata["source"], "planner");

        assert!(store.transition_planned_task(task.id, PlannedStatus::Completed, t(8, 0)).await.unwrap());
        assert!(!store.transition_planned_task(task.id, PlannedStatus::Cancelled, t(8, 0)).await.unwrap());
    }

    #[tokio::test]
    async fn test_memory_strengthen_and_ranking() {
        let store = SqliteStore::in_memory().unwrap();
        let r = recipient(&store, "1").await;
        let now = t(12, 0);
        let make = |title: &str, weight: f64, forget: Option<DateTime<Utc>>| NewMemory {
            recipient_id: r.id,
            title: title.into(),
            content: format!("{title} content"),
            kind: MemoryKind::UserMemory,
            strength: 5,
            weight,
            forget_time: forget,
        };
        let cat = store.create_memory(&make("cat", 9.95, None)).await.unwrap();
        store.create_memory(&make("tea", 6.0, None)).await.unwrap();
        store.create_memory(&make("old", 8.0, Some(now - ChronoDuration::days(1)))).await.unwrap();
        store.create_memory(&make("minor", 1.0, None)).await.unwrap();

        let top = store.top_memories(r.id, 5.0, 20, now).await.unwrap();
        let titles: Vec<_> = top.iter().map(|m| m.title.as_str()).collect();
        assert_eq!(titles, vec!["cat", "tea"]);

        let strengthened = store.strengthen_memory(cat.id, 7).await.unwrap().unwrap();
        assert_eq!(strengthened.strength, 10);
        assert!(strengthened.weight <= 10.0);
        assert!(store.strengthen_memory(9999, 1).await.unwrap().is_none());

        let found = store.find_memory_by_title(r.id, "tea").await.unwrap();
        assert!(found.is_some());
    }

    #[tokio::test]
    async fn test_message_log_references_tasks() {
        let store = SqliteStore::in_memory().unwrap();
        let r = recipient(&store, "1").await;
        let a = reply(&store, r.id, TriggerOrigin::User, t(9, 0), "a").await;
        let b = reply(&store, r.id, TriggerOrigin::User, t(9, 1), "b").await;
        let log = store
            .append_message_log(&NewMessageLog {
                recipient_id: r.id,
                direction: MessageDirection::Sent,
                sender: "cadence".into(),
                receiver: r.external_id.clone(),
                content: "a and b".into(),
                timestamp: t(9, 2),
                reply_task_ids: vec![b.id, a.id],
                raw: serde_json::json!({}),
            })
            .await
            .unwrap();
        assert_eq!(log.reply_task_ids, vec![a.id, b.id]);

        let recent = store.recent_messages(r.id, Some(t(9, 0)), 10).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].reply_task_ids.len(), 2);
        assert!(store.recent_messages(r.id, Some(t(10, 0)), 10).await.unwrap().is_empty());
    }
}
