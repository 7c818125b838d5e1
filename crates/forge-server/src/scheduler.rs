//! Scheduler (spec §4.7): the outer loop. Ticks on a configurable
//! interval, picks at most one ready task per tick while under the
//! parallel-agent cap, and spawns a worker thread for each transition that
//! requires agent work. When no task is ready it optionally runs a seed
//! scan that rotates through a fixed five-angle table to propose new
//! backlog tasks.
//!
//! Grounded on the teacher's `Pipeline::tick`/`seed_if_idle` (`pipeline.rs`):
//! same capacity-check-then-dispatch shape and per-(repo, angle) cooldown
//! map, adapted to spec.md §4.7's exact fixed five-element rotation (an
//! `unreachable!()` else arm, never a default case) and single
//! process-wide container-name counter.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use forge_agent::instruction::build_instruction;
use forge_core::agent::{AgentBackend, AgentRunConfig};
use forge_core::config::Config;
use forge_core::store::Store;
use forge_core::types::{Persona, Task, WatchedRepo};
use tracing::{info, warn};

use crate::supervisor::Supervisor;
use crate::taskblock::{extract_blocks, parse_task_block};
use crate::worker;

/// A fixed five-element rotation table (spec §4.7); the scheduler steps
/// through it as `(prev + 1) mod 5` and never falls back to a default arm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum SeedAngle {
    Refactoring,
    SecurityAudit,
    TestCoverage,
    FeatureDiscovery,
    ArchitectureReview,
}

impl SeedAngle {
    fn from_index(idx: u8) -> Self {
        match idx % 5 {
            0 => SeedAngle::Refactoring,
            1 => SeedAngle::SecurityAudit,
            2 => SeedAngle::TestCoverage,
            3 => SeedAngle::FeatureDiscovery,
            4 => SeedAngle::ArchitectureReview,
            _ => unreachable!("SeedAngle index is always reduced mod 5"),
        }
    }

    fn name(self) -> &'static str {
        match self {
            SeedAngle::Refactoring => "refactoring",
            SeedAngle::SecurityAudit => "security_audit",
            SeedAngle::TestCoverage => "test_coverage",
            SeedAngle::FeatureDiscovery => "feature_discovery",
            SeedAngle::ArchitectureReview => "architecture_review",
        }
    }

    fn prompt(self) -> &'static str {
        match self {
            SeedAngle::Refactoring => {
                "Review this repository for refactoring opportunities. Propose 1-3 \
                 concrete, scoped tasks as TASK_START/TASK_END blocks, each with a \
                 TITLE: and DESCRIPTION: line."
            }
            SeedAngle::SecurityAudit => {
                "Audit this repository for bugs or security issues. Propose 1-3 \
                 concrete, scoped tasks as TASK_START/TASK_END blocks, each with a \
                 TITLE: and DESCRIPTION: line."
            }
            SeedAngle::TestCoverage => {
                "Identify under-tested areas of this repository. Propose 1-3 \
                 concrete, scoped tasks as TASK_START/TASK_END blocks, each with a \
                 TITLE: and DESCRIPTION: line."
            }
            SeedAngle::FeatureDiscovery => {
                "Propose small, high-value features missing from this repository as \
                 TASK_START/TASK_END blocks, each with a TITLE: and DESCRIPTION: line."
            }
            SeedAngle::ArchitectureReview => {
                "Review this repository's architecture for structural improvements. \
                 Propose 1-3 concrete, scoped tasks as TASK_START/TASK_END blocks, \
                 each with a TITLE: and DESCRIPTION: line."
            }
        }
    }
}

pub struct Scheduler {
    store: Arc<Store>,
    config: Arc<Config>,
    backend: Arc<dyn AgentBackend>,
    supervisor: Arc<Supervisor>,
    next_seed_angle: AtomicU8,
    seed_cooldowns: Mutex<HashMap<(String, String), Instant>>,
}

impl Scheduler {
    pub fn new(
        store: Arc<Store>,
        config: Arc<Config>,
        backend: Arc<dyn AgentBackend>,
        supervisor: Arc<Supervisor>,
    ) -> Self {
        Self {
            store,
            config,
            backend,
            supervisor,
            next_seed_angle: AtomicU8::new(0),
            seed_cooldowns: Mutex::new(HashMap::new()),
        }
    }

    /// Runs the tick loop until the supervisor's running flag drops, then
    /// performs the scheduler's own final `join_agents()` call (spec §5's
    /// documented shutdown order: `stop()` → join scheduler thread → the
    /// scheduler's final `join_agents()` → `deinit()`).
    pub fn run(&self) {
        let tick_interval = Duration::from_secs(self.config.pipeline_tick_s.max(1));
        while self.supervisor.is_running() {
            if let Err(e) = self.tick() {
                warn!("scheduler tick error: {e}");
            }
            let slept = Instant::now();
            while self.supervisor.is_running() && slept.elapsed() < tick_interval {
                std::thread::sleep(Duration::from_millis(100));
            }
        }
        self.supervisor.join_agents();
    }

    fn tick(&self) -> anyhow::Result<()> {
        let max_agents = self.config.pipeline_max_agents;
        if self.supervisor.active_agent_count() >= max_agents {
            return Ok(());
        }

        let tasks = self.store.list_active_tasks()?;
        let ready = tasks
            .into_iter()
            .find(|t| !self.supervisor.is_inflight(t.id) && !self.supervisor.repo_inflight(&t.repo_path));

        match ready {
            Some(task) => self.spawn_agent(task),
            None => self.seed_if_idle(),
        }

        Ok(())
    }

    fn spawn_agent(&self, task: Task) {
        let store = Arc::clone(&self.store);
        let config = Arc::clone(&self.config);
        let backend = Arc::clone(&self.backend);
        let supervisor = Arc::clone(&self.supervisor);
        let repo_path = task.repo_path.clone();
        let task_id = task.id;

        self.supervisor.reserve_worker(task_id, &repo_path);
        info!(task_id, status = %task.status, "spawning worker");
        let handle = std::thread::spawn(move || {
            worker::run_task_phase(task, &store, &config, backend.as_ref(), &supervisor);
        });
        self.supervisor.attach_handle(handle);
    }

    fn seed_if_idle(&self) {
        if !self.config.continuous_mode {
            return;
        }
        if self.store.list_active_tasks().map(|t| t.len() as u32).unwrap_or(0) >= self.config.pipeline_max_backlog {
            return;
        }

        for repo in &self.config.watched_repos {
            self.seed_repo(repo);
        }
    }

    fn seed_repo(&self, repo: &WatchedRepo) {
        let idx = self.next_seed_angle.fetch_add(1, Ordering::SeqCst);
        let angle = SeedAngle::from_index(idx);
        let key = (repo.path.clone(), angle.name().to_string());

        {
            let mut cooldowns = self.seed_cooldowns.lock().unwrap_or_else(|e| e.into_inner());
            let cooldown = Duration::from_secs(self.config.pipeline_seed_cooldown_s.max(0) as u64);
            if let Some(last) = cooldowns.get(&key) {
                if last.elapsed() < cooldown {
                    return;
                }
            }
            cooldowns.insert(key, Instant::now());
        }

        info!(repo = %repo.path, angle = angle.name(), "running seed scan");
        if let Err(e) = self.run_seed(repo, angle) {
            warn!(repo = %repo.path, angle = angle.name(), "seed scan failed: {e}");
        }
    }

    fn run_seed(&self, repo: &WatchedRepo, angle: SeedAngle) -> anyhow::Result<()> {
        let session_dir = format!("{}/sessions/seed", self.config.data_dir);
        std::fs::create_dir_all(&session_dir)?;
        let session_dir = std::fs::canonicalize(&session_dir)
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or(session_dir);

        let seed_task = Task {
            id: 0,
            title: format!("seed:{}", angle.name()),
            description: String::new(),
            repo_path: repo.path.clone(),
            creator: "seed".to_string(),
            notify_chat: String::new(),
            status: "backlog".to_string(),
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
            branch: None,
            last_error: None,
            attempt: 0,
            scheduled_at: chrono::Utc::now(),
        };
        let folder_key = format!("seed:{}:{}", repo.path, angle.name());
        let prompt = build_instruction(&seed_task, Persona::Manager, Some(angle.prompt()), None);

        let session_id = self.store.get_session(&folder_key, "seed")?;
        let run_cfg = AgentRunConfig {
            model: self.config.model.clone(),
            credential: self.config.oauth_token.clone(),
            session_id,
            session_dir,
            worktree_path: repo.path.clone(),
            assistant_name: self.config.assistant_name.clone(),
            timeout_s: self.config.agent_timeout_s,
            persona: Persona::Manager,
            system_prompt_suffix: String::new(),
            container_name: Some(self.supervisor.container_name(&self.config.assistant_name, Persona::Manager)),
        };

        let result = self.backend.run_agent(&run_cfg, &prompt, Default::default())?;
        if let Some(sid) = &result.new_session_id {
            self.store.set_session(&folder_key, "seed", sid)?;
        }
        if !result.success {
            return Ok(());
        }

        for block in extract_blocks(&result.output, "TASK_START", "TASK_END") {
            let Some(proposal) = parse_task_block(block) else { continue };
            self.store.create_task(&proposal.title, &proposal.description, &repo.path, "seed", "")?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seed_angle_rotation_cycles_through_all_five() {
        let seen: std::collections::HashSet<SeedAngle> =
            (0u8..10).map(SeedAngle::from_index).collect();
        assert_eq!(seen.len(), 5);
    }

    #[test]
    fn seed_angle_wraps_deterministically() {
        assert_eq!(SeedAngle::from_index(0), SeedAngle::from_index(5));
        assert_eq!(SeedAngle::from_index(4), SeedAngle::ArchitectureReview);
    }
}
