use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A pipeline task as persisted in the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub title: String,
    pub description: String,
    pub repo_path: String,
    pub creator: String,
    pub notify_chat: String,
    /// Current state-machine status; see [`crate::state::TaskState`].
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub branch: Option<String>,
    pub last_error: Option<String>,
    pub attempt: i64,
    pub scheduled_at: DateTime<Utc>,
}

/// An agent session token keyed by (folder, persona).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSession {
    pub folder: String,
    pub persona: String,
    pub session_token: String,
    pub updated_at: DateTime<Utc>,
}

/// A repository under pipeline supervision. Derived from configuration,
/// never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchedRepo {
    pub path: String,
    pub is_self: bool,
    pub test_cmd: String,
    pub auto_merge: bool,
}

/// A single message in a watched group chat; input only to
/// `Store::get_unanswered_groups`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupMessage {
    pub id: i64,
    pub chat_id: String,
    pub sender: String,
    pub sender_name: String,
    pub text: String,
    /// ISO-8601 string; compared lexicographically, not parsed.
    pub timestamp: String,
    pub is_from_bot: bool,
    pub is_bot_reply: bool,
}

/// Aggregate counts over the task table.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PipelineStats {
    pub total: i64,
    pub active: i64,
    pub merged: i64,
    pub failed: i64,
}

/// Which fixed persona an agent invocation runs as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Persona {
    /// Writes spec; tools: Read/Glob/Grep/Write.
    Manager,
    /// Writes tests only; tools: Read/Glob/Grep/Write.
    Qa,
    /// Writes implementation and runs commands; tools: Read/Glob/Grep/Write/Edit/Bash.
    Worker,
}

impl Persona {
    pub fn allowed_tools(self) -> &'static str {
        match self {
            Persona::Manager | Persona::Qa => "Read,Glob,Grep,Write",
            Persona::Worker => "Read,Glob,Grep,Write,Edit,Bash",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Persona::Manager => "manager",
            Persona::Qa => "qa",
            Persona::Worker => "worker",
        }
    }
}
