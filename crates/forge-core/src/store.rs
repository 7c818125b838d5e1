//! Task Store: persists task rows, agent session tokens per
//! (folder, persona), and group-chat message history; exposes aggregate
//! statistics in a single query and expires stale sessions by relative
//! age (spec §4.4).

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Mutex;

use crate::types::{GroupMessage, PipelineStats, Task};

const SCHEMA_SQL: &str = include_str!("../schema.sql");
const TS_FMT: &str = "%Y-%m-%d %H:%M:%S%.f";

pub struct Store {
    conn: Mutex<Connection>,
}

fn now_str() -> String {
    Utc::now().format(TS_FMT).to_string()
}

fn to_ts(dt: DateTime<Utc>) -> String {
    dt.format(TS_FMT).to_string()
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    NaiveDateTime::parse_from_str(s, TS_FMT)
        .map(|ndt| ndt.and_utc())
        .unwrap_or_else(|_| Utc::now())
}

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    let created_at: String = row.get(7)?;
    let updated_at: String = row.get(8)?;
    let scheduled_at: String = row.get(12)?;
    Ok(Task {
        id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        repo_path: row.get(3)?,
        creator: row.get(4)?,
        notify_chat: row.get(5)?,
        status: row.get(6)?,
        created_at: parse_ts(&created_at),
        updated_at: parse_ts(&updated_at),
        branch: row.get(9)?,
        last_error: row.get(10)?,
        attempt: row.get(11)?,
        scheduled_at: parse_ts(&scheduled_at),
    })
}

impl Store {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open SQLite database at {path:?}"))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .context("failed to set PRAGMAs")?;
        let store = Self { conn: Mutex::new(conn) };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory SQLite db")?;
        let store = Self { conn: Mutex::new(conn) };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute_batch(SCHEMA_SQL).context("failed to apply schema")?;
        Ok(())
    }

    pub fn create_task(
        &self,
        title: &str,
        description: &str,
        repo_path: &str,
        creator: &str,
        notify_chat: &str,
    ) -> Result<i64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let now = now_str();
        conn.execute(
            "INSERT INTO tasks (title, description, repo_path, creator, notify_chat, status, \
             created_at, updated_at, branch, last_error, attempt, scheduled_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, 'backlog', ?6, ?6, NULL, NULL, 0, ?6)",
            params![title, description, repo_path, creator, notify_chat, now],
        )
        .context("create_task")?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_task(&self, id: i64) -> Result<Option<Task>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.query_row(
            "SELECT id, title, description, repo_path, creator, notify_chat, status, \
             created_at, updated_at, branch, last_error, attempt, scheduled_at \
             FROM tasks WHERE id = ?1",
            params![id],
            row_to_task,
        )
        .optional()
        .context("get_task")
    }

    pub fn list_active_tasks(&self) -> Result<Vec<Task>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT id, title, description, repo_path, creator, notify_chat, status, \
             created_at, updated_at, branch, last_error, attempt, scheduled_at \
             FROM tasks WHERE status IN ('backlog','spec','qa','impl','retry','rebase') \
             ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map([], row_to_task)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().context("list_active_tasks")
    }

    pub fn update_status(&self, id: i64, status: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE tasks SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status, now_str(), id],
        )
        .context("update_status")?;
        Ok(())
    }

    pub fn fail_task(&self, id: i64, detail: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE tasks SET status = 'failed', last_error = ?1, updated_at = ?2 WHERE id = ?3",
            params![detail, now_str(), id],
        )
        .context("fail_task")?;
        Ok(())
    }

    pub fn retry_task(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE tasks SET status = 'retry', attempt = attempt + 1, updated_at = ?1 WHERE id = ?2",
            params![now_str(), id],
        )
        .context("retry_task")?;
        Ok(())
    }

    pub fn set_branch(&self, id: i64, branch: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE tasks SET branch = ?1, updated_at = ?2 WHERE id = ?3",
            params![branch, now_str(), id],
        )
        .context("set_branch")?;
        Ok(())
    }

    // ── Agent sessions ───────────────────────────────────────────────────

    pub fn get_session(&self, folder: &str, persona: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.query_row(
            "SELECT session_token FROM agent_sessions WHERE folder = ?1 AND persona = ?2",
            params![folder, persona],
            |row| row.get(0),
        )
        .optional()
        .context("get_session")
    }

    pub fn set_session(&self, folder: &str, persona: &str, token: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO agent_sessions (folder, persona, session_token, updated_at) \
             VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(folder, persona) DO UPDATE SET session_token = excluded.session_token, \
             updated_at = excluded.updated_at",
            params![folder, persona, token, now_str()],
        )
        .context("set_session")?;
        Ok(())
    }

    /// Deletes agent-session rows strictly older than `now - max_age_hours`.
    /// Rows at exactly `now` survive. Accepts any non-negative value,
    /// including very large ones (999999 hours ≈ 114 years).
    pub fn expire_sessions(&self, max_age_hours: i64) -> Result<usize> {
        let cutoff = Utc::now() - ChronoDuration::hours(max_age_hours.max(0));
        let cutoff_str = to_ts(cutoff);
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let n = conn
            .execute(
                "DELETE FROM agent_sessions WHERE updated_at < ?1",
                params![cutoff_str],
            )
            .context("expire_sessions")?;
        Ok(n)
    }

    // ── Aggregate stats ──────────────────────────────────────────────────

    /// One query; empty table returns all zeros.
    pub fn get_pipeline_stats(&self) -> Result<PipelineStats> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.query_row(
            "SELECT COUNT(*), \
                    SUM(CASE WHEN status IN ('backlog','spec','qa','impl','retry','rebase') THEN 1 ELSE 0 END), \
                    SUM(CASE WHEN status = 'merged' THEN 1 ELSE 0 END), \
                    SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END) \
             FROM tasks",
            [],
            |row| {
                Ok(PipelineStats {
                    total: row.get(0)?,
                    active: row.get::<_, Option<i64>>(1)?.unwrap_or(0),
                    merged: row.get::<_, Option<i64>>(2)?.unwrap_or(0),
                    failed: row.get::<_, Option<i64>>(3)?.unwrap_or(0),
                })
            },
        )
        .context("get_pipeline_stats")
    }

    // ── Group messages ───────────────────────────────────────────────────

    pub fn insert_group_message(&self, msg: &GroupMessage) -> Result<i64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO group_messages (chat_id, sender, sender_name, text, timestamp, \
             is_from_bot, is_bot_reply) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                msg.chat_id,
                msg.sender,
                msg.sender_name,
                msg.text,
                msg.timestamp,
                msg.is_from_bot,
                msg.is_bot_reply
            ],
        )
        .context("insert_group_message")?;
        Ok(conn.last_insert_rowid())
    }

    /// A group is "unanswered" iff its newest user message is strictly
    /// newer (lexicographically, on the ISO-8601 string) than its newest
    /// bot message, and that user message's timestamp is within
    /// `max_age_s` seconds of now. Groups with no user messages are
    /// excluded. `max_age_s = 0` excludes all stored past-dated rows
    /// (spec §4.4; the lower-bound comparison is strict, per DESIGN.md's
    /// resolution of the open question in spec §9).
    pub fn get_unanswered_groups(&self, max_age_s: i64) -> Result<Vec<(String, String)>> {
        let cutoff = to_ts(Utc::now() - ChronoDuration::seconds(max_age_s.max(0)));
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT chat_id, \
                    MAX(CASE WHEN is_from_bot = 0 THEN timestamp END) AS last_user_ts, \
                    MAX(CASE WHEN is_from_bot = 1 THEN timestamp END) AS last_bot_ts \
             FROM group_messages \
             GROUP BY chat_id \
             HAVING last_user_ts IS NOT NULL \
                AND (last_bot_ts IS NULL OR last_user_ts > last_bot_ts) \
                AND last_user_ts > ?1",
        )?;
        let rows = stmt.query_map(params![cutoff], |row| {
            let chat_id: String = row.get(0)?;
            let last_user_ts: String = row.get(1)?;
            Ok((chat_id, last_user_ts))
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().context("get_unanswered_groups")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_table_stats_are_zero() {
        let store = Store::open_in_memory().unwrap();
        let stats = store.get_pipeline_stats().unwrap();
        assert_eq!(stats, PipelineStats::default());
    }

    #[test]
    fn active_matches_spec_status_set() {
        let store = Store::open_in_memory().unwrap();
        let a = store.create_task("a", "d", "/r", "u", "").unwrap();
        let b = store.create_task("b", "d", "/r", "u", "").unwrap();
        let c = store.create_task("c", "d", "/r", "u", "").unwrap();
        store.update_status(a, "qa").unwrap();
        store.update_status(b, "merged").unwrap();
        store.update_status(c, "failed").unwrap();
        let stats = store.get_pipeline_stats().unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.active, 1);
        assert_eq!(stats.merged, 1);
        assert_eq!(stats.failed, 1);
    }

    #[test]
    fn expire_sessions_succeeds_on_empty_table() {
        let store = Store::open_in_memory().unwrap();
        let n = store.expire_sessions(24).unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn expire_sessions_strict_less_than() {
        let store = Store::open_in_memory().unwrap();
        store.set_session("/repo", "worker", "tok1").unwrap();
        // Directly backdate the row far in the past.
        {
            let conn = store.conn.lock().unwrap();
            let old = to_ts(Utc::now() - ChronoDuration::hours(100));
            conn.execute(
                "UPDATE agent_sessions SET updated_at = ?1 WHERE folder = '/repo'",
                params![old],
            )
            .unwrap();
        }
        store.set_session("/repo2", "worker", "tok2").unwrap();
        let removed = store.expire_sessions(24).unwrap();
        assert_eq!(removed, 1);
        assert!(store.get_session("/repo", "worker").unwrap().is_none());
        assert!(store.get_session("/repo2", "worker").unwrap().is_some());
    }

    #[test]
    fn get_session_returns_most_recent_token() {
        let store = Store::open_in_memory().unwrap();
        store.set_session("/repo", "worker", "tok1").unwrap();
        store.set_session("/repo", "worker", "tok2").unwrap();
        assert_eq!(store.get_session("/repo", "worker").unwrap().unwrap(), "tok2");
    }

    #[test]
    fn unanswered_groups_excludes_bot_answered() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        let msg = |chat: &str, from_bot: bool, secs_ago: i64| GroupMessage {
            id: 0,
            chat_id: chat.to_string(),
            sender: "u".into(),
            sender_name: "U".into(),
            text: "hi".into(),
            timestamp: to_ts(now - ChronoDuration::seconds(secs_ago)),
            is_from_bot: from_bot,
            is_bot_reply: false,
        };
        // chat A: user message only, recent -> unanswered
        store.insert_group_message(&msg("A", false, 10)).unwrap();
        // chat B: user then bot reply -> answered
        store.insert_group_message(&msg("B", false, 20)).unwrap();
        store.insert_group_message(&msg("B", true, 5)).unwrap();
        // chat C: user message far in the past -> outside max_age_s
        store.insert_group_message(&msg("C", false, 100_000)).unwrap();

        let unanswered = store.get_unanswered_groups(3600).unwrap();
        let ids: Vec<&str> = unanswered.iter().map(|(c, _)| c.as_str()).collect();
        assert_eq!(ids, vec!["A"]);
    }
}
