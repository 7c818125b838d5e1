//! Worker (spec §4.8): runs exactly one phase transition for one task —
//! acquires the repo mutex, creates or reuses the task's worktree, invokes
//! the Agent Invoker with the phase's prompt, interprets the result,
//! updates persisted state, optionally runs the test command, and releases
//! the repo mutex.
//!
//! Grounded on the teacher's `Pipeline::run_agent_phase`/`run_rebase_phase`/
//! `setup_branch`/`fail_or_retry` (`pipeline.rs`): worktree-under-a-single-
//! lock pattern, commit-then-test-then-advance sequencing, and the
//! attempt-count-driven retry-vs-fail branch. `advance_phase`'s "done ⇒
//! cleanup worktree" special case has no counterpart in spec.md's fixed
//! 11-state machine and is folded into the `merged`/`failed` transitions
//! directly.

use std::sync::Arc;

use forge_agent::instruction::{build_instruction, read_repo_prompt};
use forge_core::agent::{AgentBackend, AgentRunConfig};
use forge_core::config::Config;
use forge_core::state::{transition, PhaseOutcome, TaskState};
use forge_core::store::Store;
use forge_core::types::{Persona, Task, WatchedRepo};
use forge_core::vcs::Git;
use tracing::{info, warn};

use crate::supervisor::Supervisor;

/// Matches the teacher's `PipelineMode` default (`max_attempts: 5`); not a
/// spec.md-named config key, so it is kept as a fixed constant rather than
/// threaded through `Config`.
const MAX_ATTEMPTS: i64 = 5;

fn persona_for(state: TaskState) -> Option<Persona> {
    match state {
        TaskState::Backlog => Some(Persona::Manager),
        TaskState::Spec => Some(Persona::Qa),
        TaskState::Qa | TaskState::Retry | TaskState::Rebase => Some(Persona::Worker),
        TaskState::Impl => None,
        _ => None,
    }
}

fn branch_name(task: &Task) -> String {
    format!("forge/task-{}", task.id)
}

/// `retry`/`rebase` feed `transition()` a `FixApplied` outcome so the
/// `retry → impl`/`rebase → impl` back-edges (spec §4.6's only cycles) can
/// fire; every other agent-driven phase reports a plain `AgentSuccess`.
fn agent_phase_outcome(state: TaskState) -> PhaseOutcome {
    match state {
        TaskState::Retry | TaskState::Rebase => PhaseOutcome::FixApplied,
        _ => PhaseOutcome::AgentSuccess,
    }
}

fn worktree_path(git: &Git, branch: &str) -> String {
    git.worktree_path(branch)
}

fn watched_repo_for<'a>(config: &'a Config, repo_path: &str) -> Option<&'a WatchedRepo> {
    config.watched_repos.iter().find(|r| r.path == repo_path)
}

/// Ensures a worktree checked out on the task's branch exists, creating it
/// (and the branch) on first use. Runs entirely under the repo mutex.
fn ensure_worktree(git: &Git, task: &Task, branch: &str) -> Result<String, String> {
    let wt_path = worktree_path(git, branch);
    if std::path::Path::new(&wt_path).exists() {
        return Ok(wt_path);
    }
    let _ = git.fetch(&task.repo_path);
    let result = if task.branch.is_some() {
        git.worktree_add_existing_branch(branch)
    } else {
        git.worktree_add_new_branch(branch, "HEAD")
    };
    if !result.success() {
        return Err(result.combined_output());
    }
    Ok(wt_path)
}

/// Bundles a phase's dependencies so the two phase-driving functions below
/// take one reference instead of a growing positional-argument list.
#[derive(Clone, Copy)]
struct PhaseCtx<'a> {
    store: &'a Store,
    config: &'a Config,
    backend: &'a dyn AgentBackend,
    git: &'a Git,
    supervisor: &'a Arc<Supervisor>,
}

fn session_dir_for(data_dir: &str, task: &Task) -> String {
    let dir = format!("{data_dir}/sessions/task-{}", task.id);
    std::fs::create_dir_all(&dir).ok();
    std::fs::canonicalize(&dir).map(|p| p.to_string_lossy().into_owned()).unwrap_or(dir)
}

fn run_test_command(dir: &str, cmd: &str) -> std::io::Result<(bool, String)> {
    let output = std::process::Command::new("sh").arg("-c").arg(cmd).current_dir(dir).output()?;
    let combined = format!(
        "{}\n{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    Ok((output.status.success(), combined))
}

/// Runs one phase for `task` to completion. Cleanup is scoped so that on
/// every exit path — success, a recoverable error, or an early `return` —
/// the worker still (a) removes itself from the inflight set, (b)
/// decrements `active_agent_count`, (c) has already released the repo
/// mutex. The repo mutex is always released before `finish_worker` is
/// called (spec §4.8's ordering requirement).
pub fn run_task_phase(
    task: Task,
    store: &Store,
    config: &Config,
    backend: &dyn AgentBackend,
    supervisor: &Arc<Supervisor>,
) {
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        run_task_phase_inner(&task, store, config, backend, supervisor)
    }));
    if let Err(e) = result {
        warn!(task_id = task.id, "worker panicked: {e:?}");
        let _ = store.fail_task(task.id, "worker panicked");
    }
    supervisor.finish_worker(task.id, &task.repo_path);
}

fn run_task_phase_inner(
    task: &Task,
    store: &Store,
    config: &Config,
    backend: &dyn AgentBackend,
    supervisor: &Arc<Supervisor>,
) {
    let Some(state) = TaskState::parse(&task.status) else {
        warn!(task_id = task.id, status = %task.status, "unknown task status, skipping");
        return;
    };

    let git = Git::new(task.repo_path.clone());
    let branch = task.branch.clone().unwrap_or_else(|| branch_name(task));
    let ctx = PhaseCtx { store, config, backend, git: &git, supervisor };

    let wt_path = match supervisor.repo_locks.with_lock(&task.repo_path, || ensure_worktree(&git, task, &branch)) {
        Ok(p) => p,
        Err(e) => {
            warn!(task_id = task.id, "worktree setup failed: {e}");
            let _ = store.fail_task(task.id, &format!("worktree setup failed: {e}"));
            return;
        }
    };
    if task.branch.is_none() {
        let _ = store.set_branch(task.id, &branch);
    }

    let outcome = match state {
        TaskState::Impl => run_impl_phase(task, &wt_path, &branch, &ctx),
        _ => run_agent_driven_phase(task, state, &wt_path, &ctx),
    };

    let Some(outcome) = outcome else { return };

    let attempts_exhausted = task.attempt >= MAX_ATTEMPTS;
    let next = transition(state, outcome, attempts_exhausted);

    match next {
        TaskState::Failed => {
            let detail = task.last_error.clone().unwrap_or_else(|| "unrecoverable error".to_string());
            let _ = store.fail_task(task.id, &detail);
        }
        TaskState::Retry => {
            let _ = store.retry_task(task.id);
        }
        other => {
            let _ = store.update_status(task.id, other.as_str());
        }
    }

    info!(task_id = task.id, from = state.as_str(), to = next.as_str(), "phase transition");
}

/// Drives the `backlog`/`spec`/`qa`/`retry`/`rebase` phases: all of them
/// invoke exactly one agent turn and, on success, commit whatever it wrote.
fn run_agent_driven_phase(task: &Task, state: TaskState, wt_path: &str, ctx: &PhaseCtx) -> Option<PhaseOutcome> {
    let Some(persona) = persona_for(state) else {
        return Some(PhaseOutcome::Unrecoverable);
    };
    let PhaseCtx { store, config, backend, git, supervisor } = *ctx;

    let session_dir = session_dir_for(&config.data_dir, task);
    let session_id = store.get_session(wt_path, persona.as_str()).ok().flatten();
    let repo_prompt = read_repo_prompt("", wt_path, &task.repo_path);

    let prompt = build_instruction(task, persona, repo_prompt.as_deref(), None);

    let run_cfg = AgentRunConfig {
        model: config.model.clone(),
        credential: config.oauth_token.clone(),
        session_id,
        session_dir,
        worktree_path: wt_path.to_string(),
        assistant_name: config.assistant_name.clone(),
        timeout_s: config.agent_timeout_s,
        persona,
        system_prompt_suffix: String::new(),
        container_name: Some(supervisor.container_name(&config.assistant_name, persona)),
    };

    let run_result = match backend.run_agent(&run_cfg, &prompt, Default::default()) {
        Ok(r) => r,
        Err(e) => {
            warn!(task_id = task.id, "agent invocation failed: {e}");
            let _ = store.fail_task(task.id, &format!("agent invocation error: {e}"));
            return None;
        }
    };

    if let Some(sid) = &run_result.new_session_id {
        let _ = store.set_session(wt_path, persona.as_str(), sid);
    }

    if run_result.timed_out {
        let detail = format!("timed out after {}s", config.agent_timeout_s);
        warn!(task_id = task.id, "{detail}");
        let _ = store.fail_task(task.id, &detail);
        if task.attempt < MAX_ATTEMPTS {
            let _ = store.retry_task(task.id);
        }
        return None;
    }

    if !run_result.success {
        warn!(task_id = task.id, "agent run failed (persona {})", persona.as_str());
        return Some(PhaseOutcome::Unrecoverable);
    }

    let commit_msg = format!("{}: {} ({})", persona.as_str(), task.title, task.id);
    let _ = git.add_all(wt_path);
    let _ = git.commit_message(wt_path, &commit_msg, None);

    Some(agent_phase_outcome(state))
}

/// The `impl` phase never invokes the agent directly — the implementation
/// work already happened on the `qa → impl` transition. Here the worker
/// only runs the configured test command and, if it passes, attempts the
/// merge back to trunk. The whole merge/push/branch-cleanup sequence runs
/// as one critical section under the repo mutex (spec §4.5: every VCS
/// mutation on the primary clone is serialized per-repo), reacquired here
/// rather than held across the test run above.
fn run_impl_phase(task: &Task, wt_path: &str, branch: &str, ctx: &PhaseCtx) -> Option<PhaseOutcome> {
    let PhaseCtx { store, config, git, supervisor, .. } = *ctx;
    let watched = watched_repo_for(config, &task.repo_path);
    let test_cmd = watched.map(|r| r.test_cmd.as_str()).unwrap_or(&config.pipeline_test_cmd);
    let auto_merge = watched.map(|r| r.auto_merge).unwrap_or(config.pipeline_auto_merge);

    if !test_cmd.is_empty() {
        match run_test_command(wt_path, test_cmd) {
            Ok((true, _)) => {}
            Ok((false, output)) => {
                warn!(task_id = task.id, "tests failed");
                let _ = store.fail_task(task.id, &output);
                return Some(PhaseOutcome::TestsFailed);
            }
            Err(e) => {
                warn!(task_id = task.id, "failed to run test command: {e}");
                let _ = store.fail_task(task.id, &format!("failed to run test command: {e}"));
                return Some(PhaseOutcome::TestsFailed);
            }
        }
    }

    if !auto_merge {
        // Tests passed but this repo requires manual merge review; the task
        // simply stays in `impl` — there is no spec.md-named "awaiting
        // review" state, so the worker leaves it for an operator.
        return None;
    }

    supervisor.repo_locks.with_lock(&task.repo_path, || {
        let merge = git.merge_no_ff(&task.repo_path, branch);
        if merge.success() {
            let _ = git.push(&task.repo_path, "HEAD");
            let _ = git.branch_delete(&task.repo_path, branch);
            let _ = git.worktree_remove_force(wt_path);
            Some(PhaseOutcome::MergeClean)
        } else {
            let _ = git.merge_abort(&task.repo_path);
            let _ = store.fail_task(task.id, &merge.combined_output());
            Some(PhaseOutcome::MergeConflict)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persona_mapping_matches_spec_table() {
        assert_eq!(persona_for(TaskState::Backlog), Some(Persona::Manager));
        assert_eq!(persona_for(TaskState::Spec), Some(Persona::Qa));
        assert_eq!(persona_for(TaskState::Qa), Some(Persona::Worker));
        assert_eq!(persona_for(TaskState::Retry), Some(Persona::Worker));
        assert_eq!(persona_for(TaskState::Rebase), Some(Persona::Worker));
        assert_eq!(persona_for(TaskState::Impl), None);
    }

    #[test]
    fn retry_and_rebase_outcomes_feed_the_fix_applied_back_edge() {
        use forge_core::state::transition;

        assert_eq!(agent_phase_outcome(TaskState::Retry), PhaseOutcome::FixApplied);
        assert_eq!(agent_phase_outcome(TaskState::Rebase), PhaseOutcome::FixApplied);
        assert_eq!(agent_phase_outcome(TaskState::Backlog), PhaseOutcome::AgentSuccess);

        // These would previously panic inside `transition()` since only
        // `FixApplied` has a `retry`/`rebase` arm, not `AgentSuccess`.
        assert_eq!(
            transition(TaskState::Retry, agent_phase_outcome(TaskState::Retry), false),
            TaskState::Impl
        );
        assert_eq!(
            transition(TaskState::Rebase, agent_phase_outcome(TaskState::Rebase), false),
            TaskState::Impl
        );
    }
}
