//! Embedded persistent store — SQLite via `rusqlite`.
//!
//! Replaces the Postgres-backed store of the system this was built from with
//! an embedded, WAL-mode SQLite database so the daemon has no external
//! database service to operate. Query shapes and row-to-struct mapping are
//! carried over from that Postgres layer; the cursor tables are new, modeling
//! the two-phase commit described in SPEC_FULL.md §3/§4.2 as two genuinely
//! separate tables rather than one JSON blob.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use chrono::{SecondsFormat, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMessage {
    pub id: String,
    pub chat_jid: String,
    pub sender: String,
    pub sender_name: String,
    pub content: String,
    pub timestamp: String,
    #[serde(default)]
    pub is_from_me: bool,
    #[serde(default)]
    pub is_bot_message: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatInfo {
    pub jid: String,
    pub name: String,
    pub last_message_time: String,
    pub channel: Option<String>,
    pub is_group: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub sender_name: String,
    pub content: String,
    pub timestamp: String,
    pub is_bot_message: bool,
}

/// `ScheduledTask.status`. `InProgress` exists solely to let a dispatched-but-
/// not-yet-finished run stay invisible to `get_due_tasks` without losing track
/// of the task entirely (see SPEC_FULL.md §4.6, "double-fire avoidance").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Active,
    Paused,
    Completed,
    InProgress,
}

impl TaskStatus {
    fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Active => "active",
            TaskStatus::Paused => "paused",
            TaskStatus::Completed => "completed",
            TaskStatus::InProgress => "in_progress",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "paused" => TaskStatus::Paused,
            "completed" => TaskStatus::Completed,
            "in_progress" => TaskStatus::InProgress,
            _ => TaskStatus::Active,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub id: String,
    pub group_folder: String,
    pub chat_jid: String,
    pub prompt: String,
    pub schedule_type: String,
    pub schedule_value: String,
    #[serde(default = "default_context_mode")]
    pub context_mode: String,
    pub next_run: Option<String>,
    pub last_run: Option<String>,
    pub last_result: Option<String>,
    #[serde(default = "default_status")]
    pub status: TaskStatus,
    pub created_at: String,
}

fn default_context_mode() -> String {
    "isolated".to_string()
}

fn default_status() -> TaskStatus {
    TaskStatus::Active
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRunLog {
    pub task_id: String,
    pub run_at: String,
    pub duration_ms: i64,
    pub status: String,
    pub result: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisteredGroup {
    pub jid: String,
    pub name: String,
    pub folder: String,
    pub trigger: String,
    pub added_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_config: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requires_trigger: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskUpdate {
    pub prompt: Option<String>,
    pub schedule_type: Option<String>,
    pub schedule_value: Option<String>,
    pub next_run: Option<String>,
    pub status: Option<TaskStatus>,
}

/// Current wall-clock time formatted as millisecond-precision RFC3339 UTC.
/// Fixed width so lexicographic string comparison agrees with chronological
/// order (required by the Message timestamp invariant in SPEC_FULL.md §3).
pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Embedded SQLite store. A single connection behind an async mutex — the
/// orchestrator's write volume is low enough (one row per message/cursor
/// transition) that connection pooling buys nothing a WAL journal doesn't
/// already provide for read/write concurrency.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create store directory {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite store at {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("failed to enable WAL journal mode")?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .context("failed to enable foreign key enforcement")?;
        ensure_schema(&conn).context("failed to create sqlite schema")?;
        info!(path = %path.display(), "sqlite store opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory store, for tests (exported so downstream crates can use it
    /// in their own test suites without a filesystem fixture).
    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory sqlite")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        ensure_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // -- chats ---------------------------------------------------------

    pub async fn store_chat_metadata(
        &self,
        jid: &str,
        timestamp: &str,
        name: Option<&str>,
        channel: Option<&str>,
        is_group: Option<bool>,
    ) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;
        let display_name = name.unwrap_or(jid);
        conn.execute(
            "INSERT INTO chats (jid, name, last_message_time, channel, is_group)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(jid) DO UPDATE SET
               name = CASE WHEN excluded.name != excluded.jid THEN excluded.name ELSE chats.name END,
               last_message_time = MAX(chats.last_message_time, excluded.last_message_time),
               channel = COALESCE(excluded.channel, chats.channel),
               is_group = COALESCE(excluded.is_group, chats.is_group)",
            rusqlite::params![jid, display_name, timestamp, channel, is_group],
        )
        .context("store_chat_metadata")?;
        Ok(())
    }

    pub async fn update_chat_name(&self, jid: &str, name: &str) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;
        let now = now_iso();
        conn.execute(
            "INSERT INTO chats (jid, name, last_message_time) VALUES (?1, ?2, ?3)
             ON CONFLICT(jid) DO UPDATE SET name = excluded.name",
            rusqlite::params![jid, name, now],
        )
        .context("update_chat_name")?;
        Ok(())
    }

    pub async fn get_all_chats(&self) -> anyhow::Result<Vec<ChatInfo>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT jid, name, last_message_time, channel, is_group
             FROM chats ORDER BY last_message_time DESC",
        )?;
        let rows = stmt
            .query_map([], |r| {
                Ok(ChatInfo {
                    jid: r.get(0)?,
                    name: r.get::<_, Option<String>>(1)?.unwrap_or_default(),
                    last_message_time: r.get(2)?,
                    channel: r.get(3)?,
                    is_group: r.get::<_, Option<bool>>(4)?.unwrap_or(false),
                })
            })
            .context("get_all_chats")?;
        rows.collect::<Result<Vec<_>, _>>().context("get_all_chats rows")
    }

    // -- messages --------------------------------------------------------

    pub async fn store_message(&self, msg: &NewMessage) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO messages (id, chat_jid, sender, sender_name, content, timestamp, is_from_me, is_bot_message)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id, chat_jid) DO UPDATE SET
               content = excluded.content,
               is_bot_message = excluded.is_bot_message",
            rusqlite::params![
                msg.id,
                msg.chat_jid,
                msg.sender,
                msg.sender_name,
                msg.content,
                msg.timestamp,
                msg.is_from_me,
                msg.is_bot_message,
            ],
        )
        .context("store_message")?;
        Ok(())
    }

    pub async fn get_recent_conversation(
        &self,
        chat_jid: &str,
        limit: i64,
    ) -> anyhow::Result<Vec<ConversationMessage>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT sender_name, content, timestamp, is_bot_message
             FROM messages
             WHERE chat_jid = ?1 AND content != '' AND content IS NOT NULL
             ORDER BY timestamp DESC
             LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(rusqlite::params![chat_jid, limit], |r| {
                Ok(ConversationMessage {
                    sender_name: r.get::<_, Option<String>>(0)?.unwrap_or_default(),
                    content: r.get::<_, Option<String>>(1)?.unwrap_or_default(),
                    timestamp: r.get(2)?,
                    is_bot_message: r.get::<_, Option<bool>>(3)?.unwrap_or(false),
                })
            })
            .context("get_recent_conversation")?;
        let mut result = rows.collect::<Result<Vec<_>, _>>().context("get_recent_conversation rows")?;
        result.reverse();
        Ok(result)
    }

    pub async fn get_new_messages(
        &self,
        jids: &[String],
        last_timestamp: &str,
        bot_prefix: &str,
    ) -> anyhow::Result<(Vec<NewMessage>, String)> {
        if jids.is_empty() {
            return Ok((vec![], last_timestamp.to_string()));
        }
        let conn = self.conn.lock().await;
        let placeholders: Vec<String> = (0..jids.len()).map(|_| "?".to_string()).collect();
        let sql = format!(
            "SELECT id, chat_jid, sender, sender_name, content, timestamp
             FROM messages
             WHERE timestamp > ? AND chat_jid IN ({})
               AND is_bot_message = 0 AND content NOT LIKE ?
               AND content != '' AND content IS NOT NULL
             ORDER BY timestamp",
            placeholders.join(", ")
        );
        let bot_like = format!("{bot_prefix}:%");
        let mut params: Vec<&dyn rusqlite::ToSql> = Vec::with_capacity(jids.len() + 2);
        params.push(&last_timestamp);
        for jid in jids {
            params.push(jid);
        }
        params.push(&bot_like);

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params.as_slice(), |r| {
                Ok(NewMessage {
                    id: r.get(0)?,
                    chat_jid: r.get(1)?,
                    sender: r.get::<_, Option<String>>(2)?.unwrap_or_default(),
                    sender_name: r.get::<_, Option<String>>(3)?.unwrap_or_default(),
                    content: r.get::<_, Option<String>>(4)?.unwrap_or_default(),
                    timestamp: r.get(5)?,
                    is_from_me: false,
                    is_bot_message: false,
                })
            })
            .context("get_new_messages")?;

        let mut new_timestamp = last_timestamp.to_string();
        let messages = rows
            .collect::<Result<Vec<NewMessage>, _>>()
            .context("get_new_messages rows")?;
        for m in &messages {
            if m.timestamp > new_timestamp {
                new_timestamp = m.timestamp.clone();
            }
        }
        Ok((messages, new_timestamp))
    }

    pub async fn get_messages_since(
        &self,
        chat_jid: &str,
        since_timestamp: &str,
        bot_prefix: &str,
    ) -> anyhow::Result<Vec<NewMessage>> {
        let conn = self.conn.lock().await;
        let bot_like = format!("{bot_prefix}:%");
        let mut stmt = conn.prepare(
            "SELECT id, chat_jid, sender, sender_name, content, timestamp
             FROM messages
             WHERE chat_jid = ?1 AND timestamp > ?2
               AND is_bot_message = 0 AND content NOT LIKE ?3
               AND content != '' AND content IS NOT NULL
             ORDER BY timestamp",
        )?;
        let rows = stmt
            .query_map(rusqlite::params![chat_jid, since_timestamp, bot_like], |r| {
                Ok(NewMessage {
                    id: r.get(0)?,
                    chat_jid: r.get(1)?,
                    sender: r.get::<_, Option<String>>(2)?.unwrap_or_default(),
                    sender_name: r.get::<_, Option<String>>(3)?.unwrap_or_default(),
                    content: r.get::<_, Option<String>>(4)?.unwrap_or_default(),
                    timestamp: r.get(5)?,
                    is_from_me: false,
                    is_bot_message: false,
                })
            })
            .context("get_messages_since")?;
        rows.collect::<Result<Vec<_>, _>>().context("get_messages_since rows")
    }

    // -- agent / pending cursors (two-phase commit) -----------------------

    pub async fn get_agent_cursor(&self, chat_jid: &str) -> anyhow::Result<Option<String>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT confirmed_timestamp FROM agent_cursors WHERE chat_jid = ?1",
            [chat_jid],
            |r| r.get(0),
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other).context("get_agent_cursor"),
        })
    }

    pub async fn set_agent_cursor(&self, chat_jid: &str, confirmed_timestamp: &str) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO agent_cursors (chat_jid, confirmed_timestamp) VALUES (?1, ?2)
             ON CONFLICT(chat_jid) DO UPDATE SET confirmed_timestamp = excluded.confirmed_timestamp",
            rusqlite::params![chat_jid, confirmed_timestamp],
        )
        .context("set_agent_cursor")?;
        Ok(())
    }

    pub async fn get_pending_cursor(&self, chat_jid: &str) -> anyhow::Result<Option<String>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT pending_timestamp FROM pending_cursors WHERE chat_jid = ?1",
            [chat_jid],
            |r| r.get(0),
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other).context("get_pending_cursor"),
        })
    }

    pub async fn set_pending_cursor(&self, chat_jid: &str, pending_timestamp: &str) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO pending_cursors (chat_jid, pending_timestamp) VALUES (?1, ?2)
             ON CONFLICT(chat_jid) DO UPDATE SET pending_timestamp = excluded.pending_timestamp",
            rusqlite::params![chat_jid, pending_timestamp],
        )
        .context("set_pending_cursor")?;
        Ok(())
    }

    pub async fn clear_pending_cursor(&self, chat_jid: &str) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM pending_cursors WHERE chat_jid = ?1", [chat_jid])
            .context("clear_pending_cursor")?;
        Ok(())
    }

    /// All jids with a pending cursor — used at startup to detect crash-in-flight.
    pub async fn get_all_pending_cursors(&self) -> anyhow::Result<HashMap<String, String>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT chat_jid, pending_timestamp FROM pending_cursors")?;
        let rows = stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))?;
        let mut out = HashMap::new();
        for row in rows {
            let (jid, ts) = row.context("get_all_pending_cursors rows")?;
            out.insert(jid, ts);
        }
        Ok(out)
    }

    // -- scheduled tasks ---------------------------------------------------

    pub async fn create_task(&self, task: &ScheduledTask) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO scheduled_tasks
               (id, group_folder, chat_jid, prompt, schedule_type, schedule_value, context_mode, next_run, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            rusqlite::params![
                task.id,
                task.group_folder,
                task.chat_jid,
                task.prompt,
                task.schedule_type,
                task.schedule_value,
                task.context_mode,
                task.next_run,
                task.status.as_str(),
                task.created_at,
            ],
        )
        .context("create_task")?;
        Ok(())
    }

    pub async fn get_task_by_id(&self, id: &str) -> anyhow::Result<Option<ScheduledTask>> {
        let conn = self.conn.lock().await;
        conn.query_row("SELECT * FROM scheduled_tasks WHERE id = ?1", [id], row_to_task)
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other).context("get_task_by_id"),
            })
    }

    pub async fn get_tasks_for_group(&self, group_folder: &str) -> anyhow::Result<Vec<ScheduledTask>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT * FROM scheduled_tasks WHERE group_folder = ?1 ORDER BY created_at DESC",
        )?;
        let rows = stmt.query_map([group_folder], row_to_task).context("get_tasks_for_group")?;
        rows.collect::<Result<Vec<_>, _>>().context("get_tasks_for_group rows")
    }

    pub async fn get_all_tasks(&self) -> anyhow::Result<Vec<ScheduledTask>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT * FROM scheduled_tasks ORDER BY created_at DESC")?;
        let rows = stmt.query_map([], row_to_task).context("get_all_tasks")?;
        rows.collect::<Result<Vec<_>, _>>().context("get_all_tasks rows")
    }

    pub async fn update_task(&self, id: &str, updates: &TaskUpdate) -> anyhow::Result<()> {
        let mut fields = Vec::new();
        let mut params: Vec<String> = Vec::new();

        if let Some(ref prompt) = updates.prompt {
            fields.push("prompt = ?");
            params.push(prompt.clone());
        }
        if let Some(ref schedule_type) = updates.schedule_type {
            fields.push("schedule_type = ?");
            params.push(schedule_type.clone());
        }
        if let Some(ref schedule_value) = updates.schedule_value {
            fields.push("schedule_value = ?");
            params.push(schedule_value.clone());
        }
        if let Some(ref next_run) = updates.next_run {
            fields.push("next_run = ?");
            params.push(next_run.clone());
        }
        if let Some(status) = updates.status {
            fields.push("status = ?");
            params.push(status.as_str().to_string());
        }
        if fields.is_empty() {
            return Ok(());
        }

        params.push(id.to_string());
        let sql = format!("UPDATE scheduled_tasks SET {} WHERE id = ?", fields.join(", "));
        let conn = self.conn.lock().await;
        let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p as &dyn rusqlite::ToSql).collect();
        conn.execute(&sql, param_refs.as_slice()).context("update_task")?;
        Ok(())
    }

    /// Atomically set a task's status to `in_progress`, but only if its
    /// current status is `active` — the race guard the scheduler relies on
    /// between `get_due_tasks` and dispatch (SPEC_FULL.md §4.6).
    pub async fn try_mark_task_in_progress(&self, id: &str) -> anyhow::Result<bool> {
        let conn = self.conn.lock().await;
        let updated = conn
            .execute(
                "UPDATE scheduled_tasks SET status = 'in_progress' WHERE id = ?1 AND status = 'active'",
                [id],
            )
            .context("try_mark_task_in_progress")?;
        Ok(updated == 1)
    }

    pub async fn delete_task(&self, id: &str) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM task_run_logs WHERE task_id = ?1", [id])
            .context("delete_task_logs")?;
        conn.execute("DELETE FROM scheduled_tasks WHERE id = ?1", [id])
            .context("delete_task")?;
        Ok(())
    }

    /// Active tasks whose `next_run` has passed. Excludes `in_progress` rows
    /// so a long-running task is never dispatched twice (§4.6).
    pub async fn get_due_tasks(&self) -> anyhow::Result<Vec<ScheduledTask>> {
        let conn = self.conn.lock().await;
        let now = now_iso();
        let mut stmt = conn.prepare(
            "SELECT * FROM scheduled_tasks
             WHERE status = 'active' AND next_run IS NOT NULL AND next_run <= ?1
             ORDER BY next_run",
        )?;
        let rows = stmt.query_map([now], row_to_task).context("get_due_tasks")?;
        rows.collect::<Result<Vec<_>, _>>().context("get_due_tasks rows")
    }

    /// Record a run's outcome and either clear `in_progress` back to `active`
    /// (recurring task, run completed) or advance straight to `completed`
    /// (one-shot task, `next_run` is `None`). Always advances regardless of
    /// whether the run succeeded, so a wedged task cannot get stuck forever.
    pub async fn update_task_after_run(
        &self,
        id: &str,
        next_run: Option<&str>,
        last_result: &str,
    ) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;
        let now = now_iso();
        let new_status = if next_run.is_none() { "completed" } else { "active" };
        conn.execute(
            "UPDATE scheduled_tasks
             SET next_run = ?1, last_run = ?2, last_result = ?3, status = ?4
             WHERE id = ?5",
            rusqlite::params![next_run, now, last_result, new_status, id],
        )
        .context("update_task_after_run")?;
        Ok(())
    }

    pub async fn log_task_run(&self, log: &TaskRunLog) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO task_run_logs (task_id, run_at, duration_ms, status, result, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![log.task_id, log.run_at, log.duration_ms, log.status, log.result, log.error],
        )
        .context("log_task_run")?;
        Ok(())
    }

    // -- router state -------------------------------------------------------

    pub async fn get_router_state(&self, key: &str) -> anyhow::Result<Option<String>> {
        let conn = self.conn.lock().await;
        conn.query_row("SELECT value FROM router_state WHERE key = ?1", [key], |r| r.get(0))
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other).context("get_router_state"),
            })
    }

    pub async fn set_router_state(&self, key: &str, value: &str) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO router_state (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            rusqlite::params![key, value],
        )
        .context("set_router_state")?;
        Ok(())
    }

    // -- sessions -------------------------------------------------------

    pub async fn get_session(&self, group_folder: &str) -> anyhow::Result<Option<String>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT session_id FROM sessions WHERE group_folder = ?1",
            [group_folder],
            |r| r.get(0),
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other).context("get_session"),
        })
    }

    pub async fn set_session(&self, group_folder: &str, session_id: &str) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO sessions (group_folder, session_id) VALUES (?1, ?2)
             ON CONFLICT(group_folder) DO UPDATE SET session_id = excluded.session_id",
            rusqlite::params![group_folder, session_id],
        )
        .context("set_session")?;
        Ok(())
    }

    pub async fn get_all_sessions(&self) -> anyhow::Result<HashMap<String, String>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT group_folder, session_id FROM sessions")?;
        let rows = stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))?;
        let mut out = HashMap::new();
        for row in rows {
            let (folder, session_id) = row.context("get_all_sessions rows")?;
            out.insert(folder, session_id);
        }
        Ok(out)
    }

    pub async fn delete_session(&self, group_folder: &str) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM sessions WHERE group_folder = ?1", [group_folder])
            .context("delete_session")?;
        Ok(())
    }

    // -- registered groups -------------------------------------------------

    pub async fn get_registered_group(&self, jid: &str) -> anyhow::Result<Option<RegisteredGroup>> {
        let conn = self.conn.lock().await;
        conn.query_row("SELECT * FROM registered_groups WHERE jid = ?1", [jid], row_to_group)
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other).context("get_registered_group"),
            })
    }

    pub async fn get_registered_group_by_folder(&self, folder: &str) -> anyhow::Result<Option<RegisteredGroup>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT * FROM registered_groups WHERE folder = ?1",
            [folder],
            row_to_group,
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other).context("get_registered_group_by_folder"),
        })
    }

    pub async fn set_registered_group(&self, group: &RegisteredGroup) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;
        let config_json = group.agent_config.as_ref().map(|v| v.to_string());
        let requires_trigger = group.requires_trigger.unwrap_or(true);
        conn.execute(
            "INSERT INTO registered_groups
               (jid, name, folder, trigger_pattern, added_at, agent_config, requires_trigger, runtime, model)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(jid) DO UPDATE SET
               name = excluded.name,
               folder = excluded.folder,
               trigger_pattern = excluded.trigger_pattern,
               agent_config = excluded.agent_config,
               requires_trigger = excluded.requires_trigger,
               runtime = excluded.runtime,
               model = excluded.model",
            rusqlite::params![
                group.jid,
                group.name,
                group.folder,
                group.trigger,
                group.added_at,
                config_json,
                requires_trigger,
                group.runtime,
                group.model,
            ],
        )
        .context("set_registered_group")?;
        Ok(())
    }

    pub async fn get_all_registered_groups(&self) -> anyhow::Result<HashMap<String, RegisteredGroup>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT * FROM registered_groups")?;
        let rows = stmt.query_map([], row_to_group).context("get_all_registered_groups")?;
        let mut out = HashMap::new();
        for row in rows {
            let group = row.context("get_all_registered_groups rows")?;
            out.insert(group.jid.clone(), group);
        }
        Ok(out)
    }

    // -- retention ----------------------------------------------------------

    /// Deletes Message rows older than `message_retention_days` and
    /// TaskRunLog rows older than `task_log_retention_days`.
    pub async fn run_retention_sweep(
        &self,
        message_retention_days: i64,
        task_log_retention_days: i64,
    ) -> anyhow::Result<(usize, usize)> {
        let conn = self.conn.lock().await;
        let message_cutoff = (Utc::now() - chrono::Duration::days(message_retention_days))
            .to_rfc3339_opts(SecondsFormat::Millis, true);
        let log_cutoff = (Utc::now() - chrono::Duration::days(task_log_retention_days))
            .to_rfc3339_opts(SecondsFormat::Millis, true);
        let messages_deleted = conn
            .execute("DELETE FROM messages WHERE timestamp < ?1", [message_cutoff])
            .context("retention sweep: messages")?;
        let logs_deleted = conn
            .execute("DELETE FROM task_run_logs WHERE run_at < ?1", [log_cutoff])
            .context("retention sweep: task_run_logs")?;
        Ok((messages_deleted, logs_deleted))
    }
}

fn row_to_task(r: &rusqlite::Row) -> rusqlite::Result<ScheduledTask> {
    Ok(ScheduledTask {
        id: r.get("id")?,
        group_folder: r.get("group_folder")?,
        chat_jid: r.get("chat_jid")?,
        prompt: r.get("prompt")?,
        schedule_type: r.get("schedule_type")?,
        schedule_value: r.get("schedule_value")?,
        context_mode: r.get::<_, Option<String>>("context_mode")?.unwrap_or_else(|| "isolated".into()),
        next_run: r.get("next_run")?,
        last_run: r.get("last_run")?,
        last_result: r.get("last_result")?,
        status: TaskStatus::parse(&r.get::<_, String>("status")?),
        created_at: r.get("created_at")?,
    })
}

fn row_to_group(r: &rusqlite::Row) -> rusqlite::Result<RegisteredGroup> {
    let config_text: Option<String> = r.get("agent_config")?;
    Ok(RegisteredGroup {
        jid: r.get("jid")?,
        name: r.get("name")?,
        folder: r.get("folder")?,
        trigger: r.get("trigger_pattern")?,
        added_at: r.get("added_at")?,
        agent_config: config_text.and_then(|t| serde_json::from_str(&t).ok()),
        requires_trigger: r.get::<_, Option<bool>>("requires_trigger")?,
        runtime: r.get("runtime")?,
        model: r.get("model")?,
    })
}

fn ensure_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS chats (
          jid TEXT PRIMARY KEY,
          name TEXT,
          last_message_time TEXT,
          channel TEXT,
          is_group INTEGER DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS messages (
          id TEXT NOT NULL,
          chat_jid TEXT NOT NULL,
          sender TEXT,
          sender_name TEXT,
          content TEXT,
          timestamp TEXT NOT NULL,
          is_from_me INTEGER DEFAULT 0,
          is_bot_message INTEGER DEFAULT 0,
          PRIMARY KEY (id, chat_jid)
        );
        CREATE INDEX IF NOT EXISTS idx_messages_timestamp ON messages(timestamp);
        CREATE INDEX IF NOT EXISTS idx_messages_chat_jid ON messages(chat_jid);

        CREATE TABLE IF NOT EXISTS agent_cursors (
          chat_jid TEXT PRIMARY KEY,
          confirmed_timestamp TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS pending_cursors (
          chat_jid TEXT PRIMARY KEY,
          pending_timestamp TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS scheduled_tasks (
          id TEXT PRIMARY KEY,
          group_folder TEXT NOT NULL,
          chat_jid TEXT NOT NULL,
          prompt TEXT NOT NULL,
          schedule_type TEXT NOT NULL,
          schedule_value TEXT NOT NULL,
          context_mode TEXT DEFAULT 'isolated',
          next_run TEXT,
          last_run TEXT,
          last_result TEXT,
          status TEXT DEFAULT 'active',
          created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_tasks_next_run ON scheduled_tasks(next_run);
        CREATE INDEX IF NOT EXISTS idx_tasks_status ON scheduled_tasks(status);

        CREATE TABLE IF NOT EXISTS task_run_logs (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          task_id TEXT NOT NULL REFERENCES scheduled_tasks(id) ON DELETE CASCADE,
          run_at TEXT NOT NULL,
          duration_ms INTEGER NOT NULL,
          status TEXT NOT NULL,
          result TEXT,
          error TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_task_run_logs_task ON task_run_logs(task_id, run_at);

        CREATE TABLE IF NOT EXISTS router_state (
          key TEXT PRIMARY KEY,
          value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS sessions (
          group_folder TEXT PRIMARY KEY,
          session_id TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS registered_groups (
          jid TEXT PRIMARY KEY,
          name TEXT NOT NULL,
          folder TEXT NOT NULL UNIQUE,
          trigger_pattern TEXT NOT NULL,
          added_at TEXT NOT NULL,
          agent_config TEXT,
          requires_trigger INTEGER DEFAULT 1,
          runtime TEXT,
          model TEXT
        );
        ",
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_group(jid: &str, folder: &str) -> RegisteredGroup {
        RegisteredGroup {
            jid: jid.to_string(),
            name: folder.to_string(),
            folder: folder.to_string(),
            trigger: "!ai".to_string(),
            added_at: now_iso(),
            agent_config: None,
            requires_trigger: Some(true),
            runtime: None,
            model: None,
        }
    }

    #[tokio::test]
    async fn cursor_two_phase_commit_round_trip() {
        let store = Store::open_in_memory().unwrap();
        assert_eq!(store.get_agent_cursor("tg:1").await.unwrap(), None);
        assert_eq!(store.get_pending_cursor("tg:1").await.unwrap(), None);

        store.set_pending_cursor("tg:1", "2024-01-01T00:00:01.000Z").await.unwrap();
        assert_eq!(
            store.get_pending_cursor("tg:1").await.unwrap().as_deref(),
            Some("2024-01-01T00:00:01.000Z")
        );

        store.set_agent_cursor("tg:1", "2024-01-01T00:00:01.000Z").await.unwrap();
        store.clear_pending_cursor("tg:1").await.unwrap();

        assert_eq!(store.get_pending_cursor("tg:1").await.unwrap(), None);
        assert_eq!(
            store.get_agent_cursor("tg:1").await.unwrap().as_deref(),
            Some("2024-01-01T00:00:01.000Z")
        );
    }

    #[tokio::test]
    async fn crash_in_flight_detected_via_all_pending_cursors() {
        let store = Store::open_in_memory().unwrap();
        store.set_agent_cursor("tg:1", "T0").await.unwrap();
        store.set_pending_cursor("tg:1", "T1").await.unwrap();

        let pending = store.get_all_pending_cursors().await.unwrap();
        assert_eq!(pending.get("tg:1").map(String::as_str), Some("T1"));
    }

    #[tokio::test]
    async fn duplicate_message_insert_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        let msg = NewMessage {
            id: "m1".into(),
            chat_jid: "tg:1".into(),
            sender: "u1".into(),
            sender_name: "User".into(),
            content: "hi".into(),
            timestamp: "2024-01-01T00:00:00.000Z".into(),
            is_from_me: false,
            is_bot_message: false,
        };
        store.store_message(&msg).await.unwrap();
        store.store_message(&msg).await.unwrap();

        let (rows, _) = store
            .get_new_messages(&["tg:1".to_string()], "2023-01-01T00:00:00.000Z", "bot")
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn due_tasks_excludes_in_progress() {
        let store = Store::open_in_memory().unwrap();
        let task = ScheduledTask {
            id: "t1".into(),
            group_folder: "main".into(),
            chat_jid: "tg:1".into(),
            prompt: "ping".into(),
            schedule_type: "interval".into(),
            schedule_value: "60000".into(),
            context_mode: "isolated".into(),
            next_run: Some("2000-01-01T00:00:00.000Z".into()),
            last_run: None,
            last_result: None,
            status: TaskStatus::Active,
            created_at: now_iso(),
        };
        store.create_task(&task).await.unwrap();

        let due = store.get_due_tasks().await.unwrap();
        assert_eq!(due.len(), 1);

        assert!(store.try_mark_task_in_progress("t1").await.unwrap());
        // second mark fails — already in_progress, not active
        assert!(!store.try_mark_task_in_progress("t1").await.unwrap());

        let due = store.get_due_tasks().await.unwrap();
        assert_eq!(due.len(), 0, "in_progress task must not be re-dispatched");

        store.update_task_after_run("t1", Some("2999-01-01T00:00:00.000Z"), "ok").await.unwrap();
        let task = store.get_task_by_id("t1").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Active);
    }

    #[tokio::test]
    async fn one_shot_task_completes_when_next_run_is_none() {
        let store = Store::open_in_memory().unwrap();
        let task = ScheduledTask {
            id: "t1".into(),
            group_folder: "main".into(),
            chat_jid: "tg:1".into(),
            prompt: "once".into(),
            schedule_type: "once".into(),
            schedule_value: "2024-01-01T00:00:00Z".into(),
            context_mode: "isolated".into(),
            next_run: Some("2000-01-01T00:00:00.000Z".into()),
            last_run: None,
            last_result: None,
            status: TaskStatus::Active,
            created_at: now_iso(),
        };
        store.create_task(&task).await.unwrap();
        store.try_mark_task_in_progress("t1").await.unwrap();
        store.update_task_after_run("t1", None, "done").await.unwrap();

        let task = store.get_task_by_id("t1").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn registered_group_round_trip() {
        let store = Store::open_in_memory().unwrap();
        let group = sample_group("tg:-100", "main");
        store.set_registered_group(&group).await.unwrap();

        let fetched = store.get_registered_group("tg:-100").await.unwrap().unwrap();
        assert_eq!(fetched.folder, "main");

        let by_folder = store.get_registered_group_by_folder("main").await.unwrap().unwrap();
        assert_eq!(by_folder.jid, "tg:-100");

        let all = store.get_all_registered_groups().await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn retention_sweep_deletes_old_rows() {
        let store = Store::open_in_memory().unwrap();
        let old = NewMessage {
            id: "old".into(),
            chat_jid: "tg:1".into(),
            sender: "u".into(),
            sender_name: "U".into(),
            content: "ancient".into(),
            timestamp: "2000-01-01T00:00:00.000Z".into(),
            is_from_me: false,
            is_bot_message: false,
        };
        store.store_message(&old).await.unwrap();

        let (deleted, _) = store.run_retention_sweep(90, 30).await.unwrap();
        assert_eq!(deleted, 1);
    }
}
