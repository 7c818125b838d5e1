use forge_core::types::{Persona, Task};

fn persona_instruction(persona: Persona) -> &'static str {
    match persona {
        Persona::Manager => {
            "You are the spec-writing persona for this task. Read the task title and \
             description, explore the repository as needed, and write a clear, \
             actionable implementation spec as files in the working tree. Do not \
             write implementation code or tests."
        }
        Persona::Qa => {
            "You are the test-writing persona for this task. Read the spec produced \
             for this task and write tests that capture its acceptance criteria. Do \
             not modify implementation code; only add or adjust tests."
        }
        Persona::Worker => {
            "You are the implementation persona for this task. Make the failing \
             tests pass and satisfy the spec, running commands as needed to verify \
             your work."
        }
    }
}

/// Composes the prompt string passed to [`forge_core::agent::AgentBackend::run_agent`]
/// for one phase of a task. `file_listing` and `repo_prompt` are both optional
/// context the worker may or may not have available.
pub fn build_instruction(
    task: &Task,
    persona: Persona,
    repo_prompt: Option<&str>,
    file_listing: Option<&str>,
) -> String {
    let mut s = String::new();

    if let Some(repo_prompt) = repo_prompt.filter(|p| !p.is_empty()) {
        s.push_str("## Project Context\n\n");
        s.push_str(repo_prompt);
        s.push_str("\n\n---\n\n");
    }

    s.push_str(&format!("Task: {}\n\n{}\n\n---\n\n", task.title, task.description));
    s.push_str(persona_instruction(persona));

    if let Some(files) = file_listing.filter(|f| !f.is_empty()) {
        s.push_str("\n\n---\n\nFiles in repository:\n```\n");
        s.push_str(files);
        s.push_str("```\n");
    }

    if let Some(err) = task.last_error.as_deref().filter(|e| !e.is_empty()) {
        s.push_str("\n\n---\n\nThe previous attempt failed with:\n");
        s.push_str(err);
    }

    s
}

/// Reads the per-repo prompt from an explicit path, or by auto-detecting
/// `.forge/prompt.md` in the worktree, then the repo root.
pub fn read_repo_prompt(explicit_path: &str, worktree_path: &str, repo_path: &str) -> Option<String> {
    let try_read = |path: &str| -> Option<String> {
        let content = std::fs::read_to_string(path).ok()?;
        let trimmed = content.trim().to_string();
        (!trimmed.is_empty()).then_some(trimmed)
    };

    if !explicit_path.is_empty() {
        if let Some(c) = try_read(explicit_path) {
            return Some(c);
        }
    }

    let worktree_prompt = format!("{worktree_path}/.forge/prompt.md");
    if let Some(c) = try_read(&worktree_prompt) {
        return Some(c);
    }

    let repo_prompt = format!("{repo_path}/.forge/prompt.md");
    if repo_prompt != worktree_prompt {
        if let Some(c) = try_read(&repo_prompt) {
            return Some(c);
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn task() -> Task {
        Task {
            id: 1,
            title: "Add widget".to_string(),
            description: "Implement the widget.".to_string(),
            repo_path: "/repo".to_string(),
            creator: "u".to_string(),
            notify_chat: String::new(),
            status: "impl".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            branch: None,
            last_error: None,
            attempt: 0,
            scheduled_at: Utc::now(),
        }
    }

    #[test]
    fn includes_title_description_and_persona_instruction() {
        let t = task();
        let s = build_instruction(&t, Persona::Worker, None, None);
        assert!(s.contains("Add widget"));
        assert!(s.contains("Implement the widget."));
        assert!(s.contains("implementation persona"));
    }

    #[test]
    fn appends_error_context_when_present() {
        let mut t = task();
        t.last_error = Some("tests failed: foo".to_string());
        let s = build_instruction(&t, Persona::Worker, None, None);
        assert!(s.contains("tests failed: foo"));
    }
}
