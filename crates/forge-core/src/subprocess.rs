//! Subprocess Runner: spawns a child with stdout/stderr piped, drains both
//! streams concurrently so a child that fills one pipe's buffer never
//! deadlocks the parent, and optionally bounds the child by a deadline with
//! signal escalation across its whole process group.

use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use std::os::unix::process::CommandExt;

/// Interval between watchdog `try_wait` polls. Small enough that a
/// deadline/kill is observed promptly, large enough not to busy-spin.
const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Fixed across both host-agent and container-agent paths (spec §4.1).
pub const GRACE_S: u64 = 30;

#[derive(Debug, Clone)]
pub struct CollectResult {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i32,
    pub timed_out: bool,
}

/// Spawn `cmd` in its own process group (so the whole tree can be
/// signalled at once) with stdin closed and stdout/stderr piped.
pub fn spawn_piped(mut cmd: Command) -> std::io::Result<Child> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0);
    cmd.spawn()
}

/// Reads in 8 KiB chunks, invoking `cb` with each raw chunk as it arrives
/// (before any line-boundary resolution) and separately accumulating an
/// up-to-`max_bytes` buffer for the caller. Bytes beyond `max_bytes` are
/// still read from the pipe — and still delivered live to `cb` — so the
/// writer never blocks on a full buffer and no output is lost to the
/// streaming subscriber even once the stored buffer is full.
fn drain_stream<R: Read + Send + 'static>(
    mut reader: R,
    max_bytes: usize,
    cb: StreamCallback,
) -> std::thread::JoinHandle<Vec<u8>> {
    std::thread::spawn(move || {
        let mut out = Vec::new();
        let mut chunk = [0u8; 8192];
        loop {
            match reader.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    cb.call(&chunk[..n]);
                    if out.len() < max_bytes {
                        let take = (max_bytes - out.len()).min(n);
                        out.extend_from_slice(&chunk[..take]);
                    }
                }
                Err(_) => break,
            }
        }
        out
    })
}

/// Drains both pipes concurrently and returns when the child exits. Each
/// stream is independently truncated at `max_bytes`. A null pipe on
/// either stream is treated as a zero-length stream without error.
/// `stdout_cb` is invoked live, once per raw read chunk, as stdout arrives.
pub fn collect_output(
    mut child: Child,
    max_bytes: usize,
    stdout_cb: StreamCallback,
) -> std::io::Result<CollectResult> {
    let stdout_handle = child.stdout.take().map(|s| drain_stream(s, max_bytes, stdout_cb));
    let stderr_handle = child.stderr.take().map(|s| drain_stream(s, max_bytes, StreamCallback::none()));

    let status = child.wait()?;

    let stdout = stdout_handle.map(|h| h.join().unwrap_or_default()).unwrap_or_default();
    let stderr = stderr_handle.map(|h| h.join().unwrap_or_default()).unwrap_or_default();

    Ok(CollectResult {
        stdout,
        stderr,
        exit_code: status.code().unwrap_or(-1),
        timed_out: false,
    })
}

/// `deadline_s <= 0` behaves exactly like [`collect_output`]. Otherwise a
/// watchdog sends SIGTERM to the child's whole process group at
/// `deadline_s`, waits up to `grace_s` for a natural exit, then sends
/// SIGKILL. `stdout_cb` is invoked live, once per raw read chunk, as
/// stdout arrives — streaming is preserved regardless of deadline/kill.
pub fn run_with_deadline(
    mut child: Child,
    max_bytes: usize,
    deadline_s: i64,
    grace_s: u64,
    stdout_cb: StreamCallback,
) -> std::io::Result<CollectResult> {
    if deadline_s <= 0 {
        return collect_output(child, max_bytes, stdout_cb);
    }

    let pid = child.id() as i32;
    let stdout_handle = child.stdout.take().map(|s| drain_stream(s, max_bytes, stdout_cb));
    let stderr_handle = child.stderr.take().map(|s| drain_stream(s, max_bytes, StreamCallback::none()));

    let exited = Arc::new(AtomicBool::new(false));
    let timed_out = Arc::new(AtomicBool::new(false));

    let watchdog = {
        let exited = exited.clone();
        let timed_out = timed_out.clone();
        std::thread::spawn(move || {
            let deadline = Duration::from_secs(deadline_s as u64);
            let start = Instant::now();
            while start.elapsed() < deadline {
                if exited.load(Ordering::Acquire) {
                    return;
                }
                std::thread::sleep(POLL_INTERVAL);
            }
            if exited.load(Ordering::Acquire) {
                return;
            }
            timed_out.store(true, Ordering::Release);
            unsafe {
                libc::kill(-pid, libc::SIGTERM);
            }
            let grace = Duration::from_secs(grace_s);
            let grace_start = Instant::now();
            while grace_start.elapsed() < grace {
                if exited.load(Ordering::Acquire) {
                    return;
                }
                std::thread::sleep(POLL_INTERVAL);
            }
            if !exited.load(Ordering::Acquire) {
                unsafe {
                    libc::kill(-pid, libc::SIGKILL);
                }
            }
        })
    };

    let status = child.wait()?;
    exited.store(true, Ordering::Release);
    let _ = watchdog.join();

    let stdout = stdout_handle.map(|h| h.join().unwrap_or_default()).unwrap_or_default();
    let stderr = stderr_handle.map(|h| h.join().unwrap_or_default()).unwrap_or_default();

    Ok(CollectResult {
        stdout,
        stderr,
        exit_code: status.code().unwrap_or(-1),
        timed_out: timed_out.load(Ordering::Acquire),
    })
}

/// A value-type streaming callback (spec §9): holds a plain function
/// pointer plus an opaque context, so it can be stored in a record rather
/// than captured by a closure. A `None` context is a no-op subscriber.
#[derive(Clone)]
pub struct StreamCallback {
    inner: Option<Arc<Mutex<dyn FnMut(&[u8]) + Send>>>,
}

impl StreamCallback {
    pub fn none() -> Self {
        Self { inner: None }
    }

    pub fn new<F: FnMut(&[u8]) + Send + 'static>(f: F) -> Self {
        Self { inner: Some(Arc::new(Mutex::new(f))) }
    }

    pub fn call(&self, chunk: &[u8]) {
        if let Some(f) = &self.inner {
            if let Ok(mut f) = f.lock() {
                f(chunk);
            }
        }
    }
}

impl Default for StreamCallback {
    fn default() -> Self {
        Self::none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn concurrent_drain_large_stderr_zero_stdout() {
        // 128 KiB to stderr, nothing to stdout — would deadlock a
        // sequential drain once the pipe buffer (usually 64 KiB) fills.
        let cmd = sh("dd if=/dev/zero bs=1024 count=128 2>/dev/null | tr '\\0' 'a' >&2");
        let child = spawn_piped(cmd).unwrap();
        let result = collect_output(child, 1 << 20, StreamCallback::none()).unwrap();
        assert_eq!(result.stdout.len(), 0);
        assert_eq!(result.stderr.len(), 131072);
        assert_eq!(result.exit_code, 0);
    }

    #[test]
    fn truncates_at_max_bytes_without_hanging() {
        let cmd = sh("dd if=/dev/zero bs=1024 count=256 2>/dev/null");
        let child = spawn_piped(cmd).unwrap();
        let result = collect_output(child, 1024, StreamCallback::none()).unwrap();
        assert_eq!(result.stdout.len(), 1024);
    }

    #[test]
    fn null_pipe_is_zero_length() {
        let mut cmd = Command::new("true");
        cmd.stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::null());
        let child = cmd.spawn().unwrap();
        let result = collect_output(child, 1024, StreamCallback::none()).unwrap();
        assert_eq!(result.stdout.len(), 0);
        assert_eq!(result.stderr.len(), 0);
    }

    #[test]
    fn deadline_kills_long_running_child() {
        let cmd = sh("trap '' TERM; sleep 30");
        let child = spawn_piped(cmd).unwrap();
        let start = Instant::now();
        let result = run_with_deadline(child, 1024, 1, 1, StreamCallback::none()).unwrap();
        assert!(result.timed_out);
        // deadline (1s) + grace (1s) + slack
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(!result_exited_cleanly(&result));
    }

    fn result_exited_cleanly(r: &CollectResult) -> bool {
        r.exit_code == 0
    }

    #[test]
    fn no_deadline_runs_to_completion() {
        let cmd = sh("echo hi");
        let child = spawn_piped(cmd).unwrap();
        let result = run_with_deadline(child, 1024, 0, GRACE_S, StreamCallback::none()).unwrap();
        assert!(!result.timed_out);
        assert_eq!(result.stdout, b"hi\n");
    }

    #[test]
    fn stream_callback_sees_chunks_live_before_child_exits() {
        // Two writes separated by a sleep: a post-hoc replay over the
        // buffered result would deliver both in one shot after `wait()`
        // returns; a live callback must observe the first one while the
        // child is still running.
        let cmd = sh("printf first; sleep 0.3; printf second");
        let child = spawn_piped(cmd).unwrap();

        let seen = Arc::new(Mutex::new(Vec::<Vec<u8>>::new()));
        let seen_cb = seen.clone();
        let first_seen_while_running = Arc::new(AtomicBool::new(false));
        let flag = first_seen_while_running.clone();
        let cb = StreamCallback::new(move |chunk: &[u8]| {
            let mut chunks = seen_cb.lock().unwrap();
            if chunks.is_empty() {
                flag.store(true, Ordering::SeqCst);
            }
            chunks.push(chunk.to_vec());
        });

        let start = Instant::now();
        let result = collect_output(child, 1024, cb).unwrap();
        assert!(first_seen_while_running.load(Ordering::SeqCst));

        let chunks = seen.lock().unwrap();
        assert!(chunks.len() >= 2, "expected at least 2 live chunks, got {}", chunks.len());
        assert_eq!(chunks[0], b"first");
        assert_eq!(result.stdout, b"firstsecond");
        assert!(start.elapsed() >= Duration::from_millis(250));
    }
}
