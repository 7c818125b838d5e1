//! Repository Mutex Map (spec §4.5 / §9): a process-wide mapping from
//! canonicalised repo path to an exclusive lock. The outer mutex guards
//! only the map's shape (insertion of new repos); each value is an owned
//! heap-allocated lock held only for the duration of a VCS-mutating
//! critical section inside a worker — an agent subprocess never runs
//! while the lock is held, since agents may take minutes.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

#[derive(Default)]
pub struct RepoMutexMap {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl RepoMutexMap {
    pub fn new() -> Self {
        Self::default()
    }

    fn canonical_key(path: &str) -> String {
        Path::new(path)
            .canonicalize()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|_| path.to_string())
    }

    /// Returns the (possibly newly inserted) lock for `repo_path`. Insertion
    /// happens once per repo; the map itself never shrinks (process-lifetime
    /// entries, per spec §9).
    fn lock_for(&self, repo_path: &str) -> Arc<Mutex<()>> {
        let key = Self::canonical_key(repo_path);
        let mut map = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        map.entry(key).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    /// Runs `f` with `repo_path`'s exclusive lock held for exactly the
    /// duration of the call — never longer, so callers cannot accidentally
    /// hold the lock across an agent invocation.
    pub fn with_lock<T>(&self, repo_path: &str, f: impl FnOnce() -> T) -> T {
        let lock = self.lock_for(repo_path);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        f()
    }

    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Barrier;

    #[test]
    fn same_path_serialises_two_threads() {
        let map = Arc::new(RepoMutexMap::new());
        let counter = Arc::new(AtomicU32::new(0));
        let barrier = Arc::new(Barrier::new(2));
        let mut handles = vec![];
        for _ in 0..2 {
            let map = map.clone();
            let counter = counter.clone();
            let barrier = barrier.clone();
            handles.push(std::thread::spawn(move || {
                barrier.wait();
                map.with_lock("/tmp/same-repo-lock-test", || {
                    let before = counter.fetch_add(1, Ordering::SeqCst);
                    std::thread::sleep(std::time::Duration::from_millis(20));
                    assert_eq!(counter.load(Ordering::SeqCst), before + 1);
                });
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn insertion_happens_once_per_repo() {
        let map = RepoMutexMap::new();
        map.with_lock("/tmp/repo-a", || {});
        map.with_lock("/tmp/repo-a", || {});
        assert_eq!(map.len(), 1);
    }
}
