mod scheduler;
mod supervisor;
mod taskblock;
mod worker;

use std::sync::Arc;

use forge_agent::ClaudeInvoker;
use forge_core::agent::AgentBackend;
use forge_core::config::Config;
use forge_core::sandbox::Sandbox;
use forge_core::store::Store;
use tracing::info;

use scheduler::Scheduler;
use supervisor::Supervisor;

/// CLI driver: wires `Config` → `Store` → sandboxed `ClaudeInvoker` →
/// `Supervisor` and runs the scheduler loop until interrupted.
fn main() -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "forge_server=info,forge_core=info,forge_agent=info".into());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = Arc::new(Config::from_env()?);
    std::fs::create_dir_all(&config.data_dir)?;

    let db_path = format!("{}/forge.db", config.data_dir);
    let store = Arc::new(Store::open(&db_path)?);
    store.expire_sessions(config.session_max_age_hours)?;

    let sandbox_mode = Sandbox::detect(&config.sandbox_backend);
    let backend: Arc<dyn AgentBackend> =
        Arc::new(ClaudeInvoker::new("claude", sandbox_mode, &config.container_image));

    let supervisor = Arc::new(Supervisor::new());

    // A task left in `retry`/`rebase` (or any other active status) at
    // startup is simply re-queued on the next tick — never resumed
    // mid-phase — since the scheduler's `list_active_tasks` query already
    // picks it up with its attempt counter intact (spec §4.6/§9).
    let active = store.list_active_tasks().map(|t| t.len()).unwrap_or(0);
    if active > 0 {
        info!(active, "resuming active tasks from persisted state");
    }

    let scheduler = Arc::new(Scheduler::new(
        Arc::clone(&store),
        Arc::clone(&config),
        backend,
        Arc::clone(&supervisor),
    ));

    {
        let supervisor = Arc::clone(&supervisor);
        ctrlc::set_handler(move || {
            info!("received interrupt, shutting down");
            supervisor.stop();
        })?;
    }

    info!(
        max_agents = config.pipeline_max_agents,
        tick_s = config.pipeline_tick_s,
        watched_repos = config.watched_repos.len(),
        "forge-server starting"
    );

    let scheduler_thread = {
        let scheduler = Arc::clone(&scheduler);
        std::thread::spawn(move || scheduler.run())
    };

    // Shutdown order (spec §5): stop() has already been called by the
    // ctrlc handler by the time this join returns; the scheduler thread
    // performs its own final `join_agents()` before exiting its `run()`
    // loop, so by the time we reach `deinit()` every worker has returned.
    let _ = scheduler_thread.join();
    supervisor.deinit();

    info!("forge-server stopped");
    Ok(())
}
