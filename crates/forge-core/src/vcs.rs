//! Source-control driver: a thin, synchronous command-oriented façade over
//! `git`. Every operation returns an [`ExecResult`]; a non-zero exit is
//! reported to the caller, never converted into a thrown error (spec §4.3).
//! The one exception is the underlying process failing to spawn at all
//! (binary not found, fork failure) — that is folded into the same
//! `ExecResult` shape as exit code `-1` so callers never have to branch on
//! two different failure channels.

use std::path::Path;
use std::process::Command;

#[derive(Debug, Clone)]
pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }

    fn spawn_failed(err: impl std::fmt::Display) -> Self {
        Self {
            stdout: String::new(),
            stderr: err.to_string(),
            exit_code: -1,
        }
    }
}

pub struct Git {
    pub repo_path: String,
}

impl Git {
    pub fn new(repo_path: impl Into<String>) -> Self {
        Self {
            repo_path: repo_path.into(),
        }
    }

    pub fn worktree_path(&self, branch: &str) -> String {
        let parent = Path::new(&self.repo_path).parent().unwrap_or(Path::new("/tmp"));
        parent.join("worktrees").join(branch).to_string_lossy().into_owned()
    }

    pub fn exec(&self, dir: &str, args: &[&str]) -> ExecResult {
        let mut cmd = Command::new("git");
        cmd.arg("-C").arg(dir);
        cmd.args(args);
        match cmd.output() {
            Ok(output) => ExecResult {
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                exit_code: output.status.code().unwrap_or(1),
            },
            Err(e) => ExecResult::spawn_failed(format!(
                "failed to spawn git -C {dir} {}: {e}",
                args.join(" ")
            )),
        }
    }

    pub fn checkout(&self, branch: &str) -> ExecResult {
        self.exec(&self.repo_path, &["checkout", branch])
    }

    pub fn branch_create_from(&self, dir: &str, branch: &str, base: &str) -> ExecResult {
        self.exec(dir, &["checkout", "-b", branch, base])
    }

    pub fn pull_fast_forward(&self, dir: &str) -> ExecResult {
        self.exec(dir, &["pull", "--ff-only", "origin", "main"])
    }

    pub fn add_all(&self, dir: &str) -> ExecResult {
        self.exec(dir, &["add", "-A"])
    }

    pub fn commit_message(&self, dir: &str, message: &str, author: Option<(&str, &str)>) -> ExecResult {
        let mut args = vec!["commit", "-m", message];
        let author_str;
        if let Some((name, email)) = author {
            author_str = format!("{name} <{email}>");
            args.push("--author");
            args.push(&author_str);
        }
        self.exec(dir, &args)
    }

    pub fn merge_no_ff(&self, dir: &str, branch: &str) -> ExecResult {
        self.exec(dir, &["merge", "--no-ff", branch])
    }

    pub fn merge_abort(&self, dir: &str) -> ExecResult {
        self.exec(dir, &["merge", "--abort"])
    }

    pub fn fetch(&self, dir: &str) -> ExecResult {
        self.exec(dir, &["fetch", "origin"])
    }

    pub fn rebase_onto(&self, dir: &str, onto: &str) -> ExecResult {
        self.exec(dir, &["rebase", onto])
    }

    pub fn rebase_abort(&self, dir: &str) -> ExecResult {
        self.exec(dir, &["rebase", "--abort"])
    }

    pub fn push(&self, dir: &str, branch: &str) -> ExecResult {
        self.exec(dir, &["push", "origin", branch])
    }

    pub fn push_force(&self, dir: &str, branch: &str) -> ExecResult {
        self.exec(dir, &["push", "--force", "origin", branch])
    }

    pub fn branch_delete(&self, dir: &str, branch: &str) -> ExecResult {
        self.exec(dir, &["branch", "-D", branch])
    }

    pub fn diff_stat(&self, dir: &str) -> ExecResult {
        self.exec(dir, &["diff", "--stat", "HEAD"])
    }

    pub fn diff_name_only(&self, dir: &str) -> ExecResult {
        self.exec(dir, &["diff", "--name-only", "HEAD"])
    }

    pub fn status_porcelain(&self, dir: &str) -> ExecResult {
        self.exec(dir, &["status", "--porcelain"])
    }

    /// "clean?" predicate: empty stdout AND exit 0.
    pub fn status_clean(&self, dir: &str) -> bool {
        let r = self.status_porcelain(dir);
        r.success() && r.stdout.trim().is_empty()
    }

    pub fn log_oneline(&self, dir: &str, range: &str) -> ExecResult {
        self.exec(dir, &["log", "--oneline", range])
    }

    pub fn current_branch(&self, dir: &str) -> ExecResult {
        self.exec(dir, &["rev-parse", "--abbrev-ref", "HEAD"])
    }

    pub fn reset_hard(&self, dir: &str, ref_: &str) -> ExecResult {
        self.exec(dir, &["reset", "--hard", ref_])
    }

    pub fn stash(&self, dir: &str) -> ExecResult {
        self.exec(dir, &["stash"])
    }

    pub fn stash_pop(&self, dir: &str) -> ExecResult {
        self.exec(dir, &["stash", "pop"])
    }

    pub fn worktree_add_new_branch(&self, branch: &str, base: &str) -> ExecResult {
        let wt_path = self.worktree_path(branch);
        self.exec(&self.repo_path, &["worktree", "add", &wt_path, "-b", branch, base])
    }

    pub fn worktree_add_existing_branch(&self, branch: &str) -> ExecResult {
        let wt_path = self.worktree_path(branch);
        self.exec(&self.repo_path, &["worktree", "add", &wt_path, branch])
    }

    pub fn worktree_remove_force(&self, worktree_path: &str) -> ExecResult {
        self.exec(&self.repo_path, &["worktree", "remove", "--force", worktree_path])
    }

    pub fn worktree_list_porcelain(&self) -> ExecResult {
        self.exec(&self.repo_path, &["worktree", "list", "--porcelain"])
    }

    pub fn rev_parse(&self, dir: &str, refname: &str) -> ExecResult {
        self.exec(dir, &["rev-parse", refname])
    }

    pub fn rebase_in_progress(&self, dir: &str) -> bool {
        let merge = self.rev_parse(dir, "--git-path=rebase-merge");
        let apply = self.rev_parse(dir, "--git-path=rebase-apply");
        if !merge.success() || !apply.success() {
            return false;
        }
        Path::new(merge.stdout.trim()).exists() || Path::new(apply.stdout.trim()).exists()
    }

    pub fn set_author_config(&self, dir: &str, name: &str, email: &str) -> ExecResult {
        let name_result = self.exec(dir, &["config", "user.name", name]);
        if !name_result.success() {
            return name_result;
        }
        self.exec(dir, &["config", "user.email", email])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command as StdCommand;
    use tempfile::tempdir;

    fn init_repo() -> tempfile::TempDir {
        let dir = tempdir().unwrap();
        let p = dir.path().to_str().unwrap();
        StdCommand::new("git").args(["init", "-q", "-b", "main", p]).output().unwrap();
        StdCommand::new("git").args(["-C", p, "config", "user.email", "a@b.c"]).output().unwrap();
        StdCommand::new("git").args(["-C", p, "config", "user.name", "t"]).output().unwrap();
        std::fs::write(dir.path().join("f.txt"), "hi").unwrap();
        StdCommand::new("git").args(["-C", p, "add", "-A"]).output().unwrap();
        StdCommand::new("git").args(["-C", p, "commit", "-q", "-m", "init"]).output().unwrap();
        dir
    }

    #[test]
    fn checkout_unknown_branch_is_nonzero_not_error() {
        let dir = init_repo();
        let git = Git::new(dir.path().to_str().unwrap());
        let result = git.checkout("does-not-exist");
        assert!(!result.success());
        assert_ne!(result.exit_code, 0);
    }

    #[test]
    fn status_clean_on_fresh_checkout() {
        let dir = init_repo();
        let git = Git::new(dir.path().to_str().unwrap());
        assert!(git.status_clean(dir.path().to_str().unwrap()));
    }

    #[test]
    fn spawn_failure_is_reported_as_exec_result() {
        let git = Git {
            repo_path: "/nonexistent/path/xyz".to_string(),
        };
        // git itself still spawns fine (it's on PATH); it's the repo
        // path that is bogus, which git reports via a non-zero exit.
        let result = git.exec("/nonexistent/path/xyz", &["status"]);
        assert!(!result.success());
    }
}
