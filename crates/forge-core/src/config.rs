//! Application configuration, loaded from the environment with an optional
//! `.env` file as fallback (spec §6). Boolean keys each have their own
//! strictness rule rather than a shared "truthy" parser: some default to
//! enabled and only a literal `"false"` turns them off, others default to
//! disabled and only a literal `"true"` turns them on.

use anyhow::Result;
use std::collections::HashMap;

use crate::types::WatchedRepo;

#[derive(Debug, Clone)]
pub struct Config {
    pub oauth_token: String,
    pub credentials_path: String,
    pub model: String,
    pub assistant_name: String,
    pub data_dir: String,

    pub pipeline_repo: String,
    pub pipeline_test_cmd: String,
    pub pipeline_auto_merge: bool,
    pub pipeline_max_backlog: u32,
    pub pipeline_tick_s: u64,
    pub pipeline_seed_cooldown_s: i64,
    pub pipeline_max_agents: u32,
    pub agent_timeout_s: i64,
    pub session_max_age_hours: i64,

    pub container_image: String,
    pub container_memory_mb: u64,
    pub sandbox_backend: String,

    pub web_port: u16,

    pub continuous_mode: bool,
    pub whatsapp_enabled: bool,
    pub discord_enabled: bool,

    pub watched_repos: Vec<WatchedRepo>,
}

fn parse_dotenv() -> HashMap<String, String> {
    let mut map = HashMap::new();
    let Ok(contents) = std::fs::read_to_string(".env") else {
        return map;
    };
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((k, v)) = line.split_once('=') {
            map.insert(k.trim().to_string(), v.trim().to_string());
        }
    }
    map
}

fn get(key: &str, dotenv: &HashMap<String, String>) -> Option<String> {
    std::env::var(key).ok().or_else(|| dotenv.get(key).cloned())
}

fn get_str(key: &str, dotenv: &HashMap<String, String>, default: &str) -> String {
    get(key, dotenv).unwrap_or_else(|| default.to_string())
}

/// Parses a key that invalid/absent values fall back to `default` for —
/// used for the numeric tuning knobs, which accept `0` as a real value but
/// silently ignore anything unparseable (spec §6: "invalid value falls
/// back to default; 0 accepted").
fn get_num<T: std::str::FromStr>(key: &str, dotenv: &HashMap<String, String>, default: T) -> T {
    get(key, dotenv).and_then(|v| v.parse().ok()).unwrap_or(default)
}

/// Default-enabled boolean: only the literal string `"false"` disables it.
fn get_bool_default_true(key: &str, dotenv: &HashMap<String, String>) -> bool {
    get(key, dotenv).as_deref() != Some("false")
}

/// Default-disabled boolean: only the literal string `"true"` enables it.
fn get_bool_default_false(key: &str, dotenv: &HashMap<String, String>) -> bool {
    get(key, dotenv).as_deref() == Some("true")
}

fn resolve_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return format!("{home}/{rest}");
        }
    }
    path.to_string()
}

fn read_oauth_from_credentials(path: &str) -> Option<String> {
    let contents = std::fs::read_to_string(path).ok()?;
    let v: serde_json::Value = serde_json::from_str(&contents).ok()?;
    v.get("claudeAiOauth")
        .and_then(|o| o.get("accessToken"))
        .and_then(|t| t.as_str())
        .map(str::to_string)
        .or_else(|| v.get("oauthToken").and_then(|t| t.as_str()).map(str::to_string))
}

/// Re-reads the OAuth token from the credentials file, falling back to
/// `fallback` (typically the last known-good token) if the file is
/// missing or unparseable.
pub fn refresh_oauth_token(credentials_path: &str, fallback: &str) -> String {
    read_oauth_from_credentials(credentials_path).unwrap_or_else(|| fallback.to_string())
}

/// Parses `WATCHED_REPOS` entries of the form `path[:test_cmd[!manual]]`,
/// separated by `|`. A path already seen (including the primary repo) is
/// skipped. An empty `test_cmd` segment uses `default_test_cmd`.
fn parse_watched_repos(raw: &str, pipeline_repo: &str, default_test_cmd: &str) -> Vec<WatchedRepo> {
    let mut repos = Vec::new();
    let mut seen = std::collections::HashSet::new();

    if !pipeline_repo.is_empty() {
        repos.push(WatchedRepo {
            path: pipeline_repo.to_string(),
            is_self: true,
            test_cmd: default_test_cmd.to_string(),
            auto_merge: true,
        });
        seen.insert(pipeline_repo.to_string());
    }

    for entry in raw.split('|') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let mut parts = entry.splitn(2, ':');
        let path = parts.next().unwrap_or("").to_string();
        if path.is_empty() || seen.contains(&path) {
            continue;
        }
        let mut test_cmd = parts.next().unwrap_or("").to_string();
        let auto_merge = if let Some(stripped) = test_cmd.strip_suffix("!manual") {
            test_cmd = stripped.trim().to_string();
            false
        } else {
            true
        };
        if test_cmd.is_empty() {
            test_cmd = default_test_cmd.to_string();
        }
        seen.insert(path.clone());
        repos.push(WatchedRepo { path, is_self: false, test_cmd, auto_merge });
    }

    repos
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let dotenv = parse_dotenv();

        let home = std::env::var("HOME").unwrap_or_default();
        let credentials_path = resolve_tilde(&get_str(
            "CREDENTIALS_PATH",
            &dotenv,
            &format!("{home}/.claude/.credentials.json"),
        ));

        let oauth_token = get("CLAUDE_CODE_OAUTH_TOKEN", &dotenv)
            .filter(|s| !s.is_empty())
            .or_else(|| read_oauth_from_credentials(&credentials_path))
            .unwrap_or_default();

        let pipeline_repo = get_str("PIPELINE_REPO", &dotenv, "");
        let pipeline_test_cmd = get_str("PIPELINE_TEST_CMD", &dotenv, "make test");
        let watched_raw = get_str("WATCHED_REPOS", &dotenv, "");
        let watched_repos = parse_watched_repos(&watched_raw, &pipeline_repo, &pipeline_test_cmd);

        Ok(Config {
            oauth_token,
            credentials_path,
            model: get_str("MODEL", &dotenv, "claude-sonnet-4-6"),
            assistant_name: get_str("ASSISTANT_NAME", &dotenv, "Forge"),
            data_dir: get_str("DATA_DIR", &dotenv, "store"),

            pipeline_repo,
            pipeline_test_cmd,
            pipeline_auto_merge: get_bool_default_true("PIPELINE_AUTO_MERGE", &dotenv),
            pipeline_max_backlog: get_num("PIPELINE_MAX_BACKLOG", &dotenv, 5),
            pipeline_tick_s: get_num("PIPELINE_TICK_S", &dotenv, 30),
            pipeline_seed_cooldown_s: get_num("PIPELINE_SEED_COOLDOWN_S", &dotenv, 3600),
            pipeline_max_agents: get_num("PIPELINE_MAX_AGENTS", &dotenv, 4),
            agent_timeout_s: get_num("AGENT_TIMEOUT_S", &dotenv, 1000),
            session_max_age_hours: get_num("SESSION_MAX_AGE_HOURS", &dotenv, 24),

            container_image: get_str("CONTAINER_IMAGE", &dotenv, "forge-agent"),
            container_memory_mb: get_num("CONTAINER_MEMORY_MB", &dotenv, 1024),
            sandbox_backend: get_str("SANDBOX_BACKEND", &dotenv, "auto"),

            web_port: get_num("WEB_PORT", &dotenv, 3131),

            continuous_mode: get_bool_default_false("CONTINUOUS_MODE", &dotenv),
            whatsapp_enabled: get_bool_default_false("WHATSAPP_ENABLED", &dotenv),
            discord_enabled: get_bool_default_false("DISCORD_ENABLED", &dotenv),

            watched_repos,
        })
    }
}
