//! The fixed task state machine (spec §4.6). Unlike a general workflow
//! engine, the phase sequence here is closed: there is exactly one state
//! type and the transitions below are the only legal ones.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    Backlog,
    Spec,
    Qa,
    Impl,
    Retry,
    Rebase,
    Merged,
    Failed,
    Done,
    Test,
    Deleted,
}

impl TaskState {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Backlog => "backlog",
            TaskState::Spec => "spec",
            TaskState::Qa => "qa",
            TaskState::Impl => "impl",
            TaskState::Retry => "retry",
            TaskState::Rebase => "rebase",
            TaskState::Merged => "merged",
            TaskState::Failed => "failed",
            TaskState::Done => "done",
            TaskState::Test => "test",
            TaskState::Deleted => "deleted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "backlog" => TaskState::Backlog,
            "spec" => TaskState::Spec,
            "qa" => TaskState::Qa,
            "impl" => TaskState::Impl,
            "retry" => TaskState::Retry,
            "rebase" => TaskState::Rebase,
            "merged" => TaskState::Merged,
            "failed" => TaskState::Failed,
            "done" => TaskState::Done,
            "test" => TaskState::Test,
            "deleted" => TaskState::Deleted,
            _ => return None,
        })
    }

    /// Statuses counted in `PipelineStats::active`.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            TaskState::Backlog
                | TaskState::Spec
                | TaskState::Qa
                | TaskState::Impl
                | TaskState::Retry
                | TaskState::Rebase
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Merged | TaskState::Failed | TaskState::Done | TaskState::Deleted
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of driving one phase to completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseOutcome {
    AgentSuccess,
    /// `impl` only: auto-merge enabled, tests passed, merge was clean.
    MergeClean,
    /// `impl` only: merge produced conflicts.
    MergeConflict,
    /// `impl`/`retry` only: tests failed and attempts remain.
    TestsFailed,
    /// `retry`/`rebase` only: the fix-up agent run completed.
    FixApplied,
    Unrecoverable,
}

/// Applies one phase-completion event to `from`, returning the next state.
///
/// Mirrors spec §4.6's transition diagram exactly:
///
/// ```text
/// backlog → spec        (on worker spawn, after agent success)
/// spec    → qa
/// qa      → impl
/// impl    → merged      (if auto_merge && tests pass && clean merge)
/// impl    → rebase      (if merge reveals conflicts)
/// impl    → retry       (if tests fail and attempt_count < cap)
/// retry   → impl        (after agent attempts a fix)
/// rebase  → impl        (after agent resolves rebase conflicts)
/// any     → failed      (on attempt_count >= cap or unrecoverable error)
/// ```
///
/// `attempts_exhausted` gates the universal `any → failed` edge; it is
/// consulted before the state-specific edges so a capped task always
/// fails regardless of phase outcome.
pub fn transition(from: TaskState, outcome: PhaseOutcome, attempts_exhausted: bool) -> TaskState {
    if attempts_exhausted || outcome == PhaseOutcome::Unrecoverable {
        return TaskState::Failed;
    }

    match (from, outcome) {
        (TaskState::Backlog, PhaseOutcome::AgentSuccess) => TaskState::Spec,
        (TaskState::Spec, PhaseOutcome::AgentSuccess) => TaskState::Qa,
        (TaskState::Qa, PhaseOutcome::AgentSuccess) => TaskState::Impl,
        (TaskState::Impl, PhaseOutcome::MergeClean) => TaskState::Merged,
        (TaskState::Impl, PhaseOutcome::MergeConflict) => TaskState::Rebase,
        (TaskState::Impl, PhaseOutcome::TestsFailed) => TaskState::Retry,
        (TaskState::Retry, PhaseOutcome::FixApplied) => TaskState::Impl,
        (TaskState::Rebase, PhaseOutcome::FixApplied) => TaskState::Impl,
        // Every other (state, outcome) pair is not reachable by the
        // Worker: it only ever requests an outcome valid for the phase
        // it is currently driving.
        _ => unreachable!(
            "invalid task state transition: {from:?} with outcome {outcome:?}"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_sequence() {
        let mut s = TaskState::Backlog;
        s = transition(s, PhaseOutcome::AgentSuccess, false);
        assert_eq!(s, TaskState::Spec);
        s = transition(s, PhaseOutcome::AgentSuccess, false);
        assert_eq!(s, TaskState::Qa);
        s = transition(s, PhaseOutcome::AgentSuccess, false);
        assert_eq!(s, TaskState::Impl);
        s = transition(s, PhaseOutcome::MergeClean, false);
        assert_eq!(s, TaskState::Merged);
        assert!(s.is_terminal());
    }

    #[test]
    fn impl_conflict_goes_to_rebase_then_back() {
        let s = transition(TaskState::Impl, PhaseOutcome::MergeConflict, false);
        assert_eq!(s, TaskState::Rebase);
        let s = transition(s, PhaseOutcome::FixApplied, false);
        assert_eq!(s, TaskState::Impl);
    }

    #[test]
    fn exhausted_attempts_always_fail() {
        let s = transition(TaskState::Qa, PhaseOutcome::AgentSuccess, true);
        assert_eq!(s, TaskState::Failed);
    }

    #[test]
    fn active_set_matches_spec() {
        for st in [
            TaskState::Backlog,
            TaskState::Spec,
            TaskState::Qa,
            TaskState::Impl,
            TaskState::Retry,
            TaskState::Rebase,
        ] {
            assert!(st.is_active());
        }
        for st in [TaskState::Merged, TaskState::Failed, TaskState::Done, TaskState::Test, TaskState::Deleted] {
            assert!(!st.is_active());
        }
    }

    #[test]
    #[should_panic]
    fn invalid_transition_is_unreachable() {
        let _ = transition(TaskState::Backlog, PhaseOutcome::MergeClean, false);
    }
}
