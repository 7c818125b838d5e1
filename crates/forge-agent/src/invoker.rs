use anyhow::{Context, Result};
use std::process::Stdio;
use tracing::{info, warn};

use forge_core::agent::{AgentBackend, AgentRunConfig, AgentRunResult};
use forge_core::config::refresh_oauth_token;
use forge_core::sandbox::{Sandbox, SandboxMode};
use forge_core::subprocess::{self, StreamCallback, GRACE_S};

/// Runs Claude Code as a subprocess, with configurable sandbox isolation.
pub struct ClaudeInvoker {
    /// Path to the `claude` CLI binary.
    pub claude_bin: String,
    pub sandbox_mode: SandboxMode,
    pub docker_image: String,
    pub credentials_path: String,
}

impl ClaudeInvoker {
    pub fn new(claude_bin: impl Into<String>, sandbox_mode: SandboxMode, docker_image: impl Into<String>) -> Self {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/root".to_string());
        Self {
            claude_bin: claude_bin.into(),
            sandbox_mode,
            docker_image: docker_image.into(),
            credentials_path: format!("{home}/.claude/.credentials.json"),
        }
    }

    fn fresh_oauth_token(&self, fallback: &str) -> String {
        refresh_oauth_token(&self.credentials_path, fallback)
    }
}

impl AgentBackend for ClaudeInvoker {
    fn run_agent(
        &self,
        cfg: &AgentRunConfig,
        prompt: &str,
        stream_cb: StreamCallback,
    ) -> Result<AgentRunResult> {
        let allowed_tools = cfg.persona.allowed_tools().to_string();

        let mut claude_args = vec![
            "--model".to_string(),
            cfg.model.clone(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
            "--allowedTools".to_string(),
            allowed_tools,
            "--max-turns".to_string(),
            "200".to_string(),
        ];

        if !cfg.system_prompt_suffix.is_empty() {
            claude_args.push("--append-system-prompt".to_string());
            claude_args.push(cfg.system_prompt_suffix.clone());
        }

        if let Some(session_id) = &cfg.session_id {
            if !session_id.is_empty() {
                claude_args.push("--resume".to_string());
                claude_args.push(session_id.clone());
            }
        }

        claude_args.push("--print".to_string());
        claude_args.push(prompt.to_string());

        let oauth_token = self.fresh_oauth_token(&cfg.credential);

        info!(
            persona = cfg.persona.as_str(),
            session_id = ?cfg.session_id,
            sandbox = ?self.sandbox_mode,
            "spawning claude subprocess"
        );

        let mut full_cmd: Vec<String> = vec![self.claude_bin.clone()];
        full_cmd.extend(claude_args);

        let mut cmd = match self.sandbox_mode {
            SandboxMode::Bwrap => {
                let writable = [cfg.worktree_path.as_str(), cfg.session_dir.as_str()];
                let mut c = Sandbox::bwrap_command(&writable, &cfg.worktree_path, &full_cmd);
                c.env("HOME", &cfg.session_dir).env("CLAUDE_CODE_OAUTH_TOKEN", &oauth_token);
                c
            }
            SandboxMode::Docker => {
                let binds = [
                    (cfg.worktree_path.as_str(), cfg.worktree_path.as_str()),
                    (cfg.session_dir.as_str(), cfg.session_dir.as_str()),
                ];
                let mut c = Sandbox::docker_command(
                    &self.docker_image,
                    &binds,
                    &cfg.worktree_path,
                    &full_cmd,
                    cfg.container_name.as_deref(),
                );
                c.env("HOME", &cfg.session_dir).env("CLAUDE_CODE_OAUTH_TOKEN", &oauth_token);
                c
            }
            SandboxMode::Direct => {
                let path = std::env::var("PATH").unwrap_or_default();
                let user = std::env::var("USER").or_else(|_| std::env::var("LOGNAME")).unwrap_or_default();
                let augmented_path = format!("{path}:/home/{user}/.local/bin:/usr/local/bin");
                let mut c = std::process::Command::new(&self.claude_bin);
                c.args(&full_cmd[1..])
                    .current_dir(&cfg.worktree_path)
                    .env("HOME", &cfg.session_dir)
                    .env("PATH", &augmented_path)
                    .env("CLAUDE_CODE_OAUTH_TOKEN", &oauth_token);
                c
            }
        };
        cmd.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());

        let child = subprocess::spawn_piped(cmd)
            .with_context(|| format!("failed to spawn claude: {}", self.claude_bin))?;

        let result = subprocess::run_with_deadline(child, 16 << 20, cfg.timeout_s, GRACE_S, stream_cb)
            .context("failed to run claude subprocess")?;

        if result.timed_out {
            warn!(persona = cfg.persona.as_str(), timeout_s = cfg.timeout_s, "claude subprocess timed out");
            return Ok(AgentRunResult {
                output: String::new(),
                raw_stream: String::new(),
                new_session_id: None,
                success: false,
                timed_out: true,
            });
        }

        if !result.stderr.is_empty() {
            for line in String::from_utf8_lossy(&result.stderr).lines() {
                if !line.is_empty() {
                    warn!(persona = cfg.persona.as_str(), "claude stderr: {}", line);
                }
            }
        }

        let raw_stream = String::from_utf8_lossy(&result.stdout).into_owned();
        let (output, new_session_id) = crate::event::parse_stream(&raw_stream);
        let success = result.exit_code == 0;

        info!(
            persona = cfg.persona.as_str(),
            success,
            new_session_id = ?new_session_id,
            output_len = output.len(),
            "claude subprocess finished"
        );

        Ok(AgentRunResult { output, raw_stream, new_session_id, success, timed_out: false })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forge_core::types::Persona;

    #[test]
    fn echo_backend_round_trips_ndjson() {
        // Exercise the non-sandboxed path against a fake "claude" that is
        // really just `cat` echoing a canned NDJSON transcript.
        let script = r#"#!/bin/sh
printf '{"type":"system","session_id":"sess-1"}\n'
printf '{"type":"assistant","message":{"content":[{"type":"text","text":"hello"}]}}\n'
printf '{"type":"result","result":"hello"}\n'
"#;
        let dir = tempfile::tempdir().unwrap();
        let bin_path = dir.path().join("fake-claude");
        std::fs::write(&bin_path, script).unwrap();
        let mut perms = std::fs::metadata(&bin_path).unwrap().permissions();
        std::os::unix::fs::PermissionsExt::set_mode(&mut perms, 0o755);
        std::fs::set_permissions(&bin_path, perms).unwrap();

        let invoker = ClaudeInvoker::new(bin_path.to_str().unwrap(), SandboxMode::Direct, "");
        let cfg = AgentRunConfig {
            model: "claude-sonnet-4-6".to_string(),
            credential: "tok".to_string(),
            session_id: None,
            session_dir: dir.path().to_string_lossy().into_owned(),
            worktree_path: dir.path().to_string_lossy().into_owned(),
            assistant_name: "Forge".to_string(),
            timeout_s: 0,
            persona: Persona::Worker,
            system_prompt_suffix: String::new(),
            container_name: None,
        };
        let result = invoker.run_agent(&cfg, "do the thing", StreamCallback::none()).unwrap();
        assert!(result.success);
        assert_eq!(result.output, "hello");
        assert_eq!(result.new_session_id.as_deref(), Some("sess-1"));
    }
}
