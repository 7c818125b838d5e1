//! Process sandbox for agent invocations.
//!
//! Supports two isolation backends (preferred order when `auto`):
//! 1. **bwrap** — bubblewrap-based namespace isolation (no daemon, no image).
//!    Mounts the host filesystem read-only with selective read-write bind
//!    mounts for working dirs.
//! 2. **docker** — Docker container via `docker run`.
//!
//! Set `SANDBOX_BACKEND=auto|bwrap|docker|none` in the environment.
//! Default is `auto` (bwrap if available, else docker, else direct).

use std::path::Path;
use std::process::{Command, Stdio};

use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SandboxMode {
    Bwrap,
    Docker,
    Direct,
}

impl SandboxMode {
    pub fn from_str_or_auto(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "bwrap" => Some(Self::Bwrap),
            "docker" => Some(Self::Docker),
            "none" | "direct" => Some(Self::Direct),
            _ => None,
        }
    }
}

pub struct Sandbox;

impl Sandbox {
    pub fn detect(preferred: &str) -> SandboxMode {
        if let Some(forced) = SandboxMode::from_str_or_auto(preferred) {
            return forced;
        }
        if Self::bwrap_available() {
            info!("sandbox: bwrap detected, using namespace sandbox");
            SandboxMode::Bwrap
        } else if Self::docker_available() {
            info!("sandbox: bwrap not found, falling back to docker");
            SandboxMode::Docker
        } else {
            warn!("sandbox: neither bwrap nor docker available, running agents directly (no isolation)");
            SandboxMode::Direct
        }
    }

    pub fn bwrap_available() -> bool {
        if cfg!(not(target_os = "linux")) {
            return false;
        }
        Command::new("bwrap")
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    pub fn docker_available() -> bool {
        Command::new("docker")
            .arg("version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// Mount order:
    /// 1. `--ro-bind / /`    — read-only root filesystem
    /// 2. `--dev /dev`       — minimal device tree
    /// 3. `--bind X X`       — per writable_dir (worktree, session dir)
    /// 4. `--bind /tmp /tmp` — shared /tmp
    /// 5. `--unshare-pid`    — isolated PID namespace
    /// 6. `--new-session`    — setsid
    /// 7. `--die-with-parent`
    /// 8. `--proc /proc`
    /// 9. `--chdir`
    /// 10. `--` then command
    pub fn bwrap_args(writable_dirs: &[&str], working_dir: &str, command: &[String]) -> Vec<String> {
        let mut args: Vec<String> = Vec::new();

        args.extend(["--ro-bind", "/", "/", "--dev", "/dev"].map(str::to_string));

        for dir in writable_dirs {
            if !Path::new(dir).exists() {
                warn!("sandbox: skipping non-existent writable dir: {dir}");
                continue;
            }
            args.extend(["--bind", dir, dir].map(str::to_string));
        }

        args.extend(["--bind", "/tmp", "/tmp"].map(str::to_string));

        args.extend(
            ["--unshare-pid", "--new-session", "--die-with-parent", "--proc", "/proc"]
                .map(str::to_string),
        );

        args.extend(["--chdir", working_dir].map(str::to_string));

        args.push("--".into());
        args.extend_from_slice(command);

        args
    }

    pub fn bwrap_command(writable_dirs: &[&str], working_dir: &str, command: &[String]) -> Command {
        let args = Self::bwrap_args(writable_dirs, working_dir, command);
        let mut cmd = Command::new("bwrap");
        cmd.args(args);
        cmd
    }

    pub fn docker_command(
        image: &str,
        binds: &[(&str, &str)],
        working_dir: &str,
        command: &[String],
        container_name: Option<&str>,
    ) -> Command {
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "-i".to_string(),
            "--pids-limit".to_string(),
            "256".to_string(),
        ];

        if let Some(name) = container_name {
            args.push("--name".to_string());
            args.push(name.to_string());
        }

        if cfg!(target_os = "linux") {
            args.extend(
                [
                    "--security-opt",
                    "no-new-privileges:true",
                    "--cap-drop",
                    "ALL",
                    "--network",
                    "host",
                ]
                .map(str::to_string),
            );
        }

        for (host, container) in binds {
            args.push("-v".to_string());
            args.push(format!("{host}:{container}"));
        }

        args.push("-w".to_string());
        args.push(working_dir.to_string());
        args.push(image.to_string());

        args.extend_from_slice(command);

        let mut cmd = Command::new("docker");
        cmd.args(args);
        cmd
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bwrap_args_order() {
        let args = Sandbox::bwrap_args(&["/tmp"], "/tmp", &["echo".to_string(), "hi".to_string()]);
        assert_eq!(args[0], "--ro-bind");
        assert!(args.contains(&"--chdir".to_string()));
        assert_eq!(args.last().unwrap(), "hi");
    }

    #[test]
    fn docker_command_passes_container_name_through() {
        let cmd = Sandbox::docker_command(
            "forge-agent",
            &[("/a", "/a")],
            "/a",
            &["echo".to_string(), "hi".to_string()],
            Some("forge-worker-7"),
        );
        let args: Vec<String> = cmd.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        let name_idx = args.iter().position(|a| a == "--name").unwrap();
        assert_eq!(args[name_idx + 1], "forge-worker-7");
    }

    #[test]
    fn docker_command_omits_name_flag_when_none() {
        let cmd = Sandbox::docker_command("forge-agent", &[], "/a", &["true".to_string()], None);
        let args: Vec<String> = cmd.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert!(!args.iter().any(|a| a == "--name"));
    }

    #[test]
    fn from_str_or_auto_recognises_known_values() {
        assert_eq!(SandboxMode::from_str_or_auto("bwrap"), Some(SandboxMode::Bwrap));
        assert_eq!(SandboxMode::from_str_or_auto("none"), Some(SandboxMode::Direct));
        assert_eq!(SandboxMode::from_str_or_auto("auto"), None);
    }
}
