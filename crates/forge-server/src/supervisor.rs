//! Supervisor (spec §4.9): owns the collection of in-flight worker thread
//! handles, the process-wide repo mutex map, the inflight task-id set, and
//! the shared atomics workers and the scheduler coordinate through.
//!
//! Grounded on the teacher's `Pipeline` struct in `pipeline.rs`, which keeps
//! the equivalent bookkeeping (`in_flight: Mutex<HashSet<i64>>`,
//! `force_restart: AtomicBool`) inline on the pipeline type itself; here it
//! is pulled out into its own type per spec.md's component split, with the
//! exact shutdown ordering spec §4.9/§5 requires: the repo mutex is always
//! released before `active_agent_count` is decremented, so shutdown only
//! observes "no live work" once every repo is actually free.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::thread::JoinHandle;

use forge_core::repo_lock::RepoMutexMap;
use forge_core::types::Persona;

#[derive(Default)]
pub struct Supervisor {
    running: AtomicBool,
    active_agent_count: AtomicU32,
    agent_threads: Mutex<Vec<JoinHandle<()>>>,
    inflight_task_ids: Mutex<HashSet<i64>>,
    inflight_repos: Mutex<HashSet<String>>,
    pub repo_locks: RepoMutexMap,
    container_seq: AtomicU32,
}

impl Supervisor {
    pub fn new() -> Self {
        Self {
            running: AtomicBool::new(true),
            ..Default::default()
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub fn active_agent_count(&self) -> u32 {
        self.active_agent_count.load(Ordering::SeqCst)
    }

    /// Reserves a slot for a worker about to be spawned: bumps the active
    /// count and marks the task and its repo as in-flight. Called *before*
    /// `std::thread::spawn` (spec §4.7 step 4) so a worker that finishes
    /// before its handle is attached can never observe itself as not yet
    /// inflight, nor drive `active_agent_count` below zero on exit.
    pub fn reserve_worker(&self, task_id: i64, repo_path: &str) {
        self.active_agent_count.fetch_add(1, Ordering::SeqCst);
        self.inflight_task_ids.lock().unwrap_or_else(|e| e.into_inner()).insert(task_id);
        self.inflight_repos
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(repo_path.to_string());
    }

    /// Records the join handle for a worker already reserved via
    /// `reserve_worker`.
    pub fn attach_handle(&self, handle: JoinHandle<()>) {
        self.agent_threads.lock().unwrap_or_else(|e| e.into_inner()).push(handle);
    }

    pub fn is_inflight(&self, task_id: i64) -> bool {
        self.inflight_task_ids.lock().unwrap_or_else(|e| e.into_inner()).contains(&task_id)
    }

    pub fn repo_inflight(&self, repo_path: &str) -> bool {
        self.inflight_repos.lock().unwrap_or_else(|e| e.into_inner()).contains(repo_path)
    }

    /// Called by a worker on every exit path (success, error, or an
    /// equivalent of panic unwinding caught at the thread boundary).
    /// Releasing the repo mutex is the worker's own responsibility and
    /// always happens before this call (spec §4.8's ordering requirement).
    pub fn finish_worker(&self, task_id: i64, repo_path: &str) {
        self.inflight_task_ids.lock().unwrap_or_else(|e| e.into_inner()).remove(&task_id);
        self.inflight_repos.lock().unwrap_or_else(|e| e.into_inner()).remove(repo_path);
        self.active_agent_count.fetch_sub(1, Ordering::SeqCst);
    }

    /// A single process-wide monotonic counter for container names:
    /// `"<prefix>-<persona>-<n>"`. Wrapping on overflow is acceptable and
    /// unreachable in practice (spec §4.7/§5).
    pub fn next_container_seq(&self) -> u32 {
        self.container_seq.fetch_add(1, Ordering::SeqCst)
    }

    /// Builds the next `"<prefix>-<persona>-<n>"` container name, drawing
    /// `n` from the shared counter above. The old
    /// `prefix-persona-timestamp-counter` scheme is prohibited (spec §4.7):
    /// same-second concurrent launches must still be pairwise distinct.
    pub fn container_name(&self, prefix: &str, persona: Persona) -> String {
        format!("{prefix}-{}-{}", persona.as_str(), self.next_container_seq())
    }

    /// Drains the handle collection under the mutex into a local snapshot,
    /// then joins outside the mutex so a blocking wait never holds the
    /// lock. Leaves the collection empty, so a second call is a no-op.
    pub fn join_agents(&self) {
        let handles: Vec<JoinHandle<()>> =
            std::mem::take(&mut *self.agent_threads.lock().unwrap_or_else(|e| e.into_inner()));
        for handle in handles {
            let _ = handle.join();
        }
    }

    /// Safe to call after `stop()` + `join_agents()`; releases every
    /// collection and map the supervisor owns.
    pub fn deinit(&self) {
        self.agent_threads.lock().unwrap_or_else(|e| e.into_inner()).clear();
        self.inflight_task_ids.lock().unwrap_or_else(|e| e.into_inner()).clear();
        self.inflight_repos.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32 as StdAtomicU32;
    use std::sync::{Arc, Barrier};

    #[test]
    fn container_seq_pairwise_distinct_under_concurrency() {
        let sup = Arc::new(Supervisor::new());
        let barrier = Arc::new(Barrier::new(8));
        let mut handles = vec![];
        for _ in 0..8 {
            let sup = sup.clone();
            let barrier = barrier.clone();
            handles.push(std::thread::spawn(move || {
                barrier.wait();
                sup.next_container_seq()
            }));
        }
        let mut values: Vec<u32> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        values.sort_unstable();
        assert_eq!(values, (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn shutdown_with_active_agents_reaches_zero_and_drains() {
        let sup = Arc::new(Supervisor::new());
        let counter = Arc::new(StdAtomicU32::new(0));
        for i in 0..4 {
            let sup2 = sup.clone();
            let counter = counter.clone();
            sup.reserve_worker(i, "/repo");
            let handle = std::thread::spawn(move || {
                std::thread::sleep(std::time::Duration::from_millis(20));
                counter.fetch_add(1, Ordering::SeqCst);
                sup2.finish_worker(i, "/repo");
            });
            sup.attach_handle(handle);
        }
        sup.stop();
        sup.join_agents();
        assert_eq!(sup.active_agent_count(), 0);
        assert_eq!(counter.load(Ordering::SeqCst), 4);
        sup.deinit();
        assert!(!sup.is_inflight(0));
    }

    #[test]
    fn join_agents_twice_is_a_no_op() {
        let sup = Supervisor::new();
        sup.reserve_worker(1, "/repo");
        let handle = std::thread::spawn(|| {});
        sup.attach_handle(handle);
        sup.join_agents();
        sup.join_agents();
    }
}
