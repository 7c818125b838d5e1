//! Agent Invoker contract (spec §4.2): a blocking trait implemented by the
//! concrete backend (`forge-agent`'s `invoker.rs`). Kept here so
//! `forge-server` can depend on the trait without depending on any one
//! backend's implementation.

use anyhow::Result;

use crate::subprocess::StreamCallback;
use crate::types::Persona;

#[derive(Debug, Clone)]
pub struct AgentRunConfig {
    pub model: String,
    pub credential: String,
    pub session_id: Option<String>,
    pub session_dir: String,
    pub worktree_path: String,
    pub assistant_name: String,
    pub timeout_s: i64,
    pub persona: Persona,
    pub system_prompt_suffix: String,
    /// `"<prefix>-<persona>-<n>"` (spec §4.7); only consumed by the Docker
    /// sandbox backend, via `--name`. `None` lets Docker assign one.
    pub container_name: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct AgentRunResult {
    pub output: String,
    pub raw_stream: String,
    pub new_session_id: Option<String>,
    pub success: bool,
    /// Set when the run was cut short by `cfg.timeout_s`, distinct from an
    /// ordinary non-zero exit (spec §7: the worker needs to tell these
    /// apart to format the `"timed out after <N>s"` error string).
    pub timed_out: bool,
}

/// Runs one agent turn to completion (or until `cfg.timeout_s` elapses) and
/// returns the parsed output alongside the raw NDJSON transcript. `prompt`
/// is the fully composed instruction text; `stream_cb` is invoked once per
/// byte-chunk of raw child stdout, before any line-boundary resolution.
pub trait AgentBackend: Send + Sync {
    fn run_agent(
        &self,
        cfg: &AgentRunConfig,
        prompt: &str,
        stream_cb: StreamCallback,
    ) -> Result<AgentRunResult>;
}
