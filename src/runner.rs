use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

pub const MAX_OUTPUT_BYTES: usize = 2 * 1024 * 1024; // 2MB

/// Which pipe a streamed line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// Line-oriented observation sink. Called for each line boundary the
/// runner observes; trailing partial data is flushed as a final line on
/// close. Delivery is best-effort: a slow sink may drop lines and
/// correctness never depends on them.
pub trait OutputSink: Send + Sync {
    fn on_line(&self, stream: StreamKind, line: &str);
}

/// Sink that discards everything.
pub struct NullSink;

impl OutputSink for NullSink {
    fn on_line(&self, _stream: StreamKind, _line: &str) {}
}

/// One child-process invocation.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub executable: String,
    pub args: Vec<String>,
    /// Overrides layered on top of the inherited process environment.
    pub env: HashMap<String, String>,
    /// Payload written to the child's stdin, then closed. `None` closes
    /// stdin immediately.
    pub stdin: Option<String>,
    pub timeout: Duration,
    /// How long to wait between graceful termination and hard kill.
    pub kill_grace: Duration,
    pub cwd: Option<PathBuf>,
}

impl RunRequest {
    pub fn new(executable: impl Into<String>) -> Self {
        Self {
            executable: executable.into(),
            args: Vec::new(),
            env: HashMap::new(),
            stdin: None,
            timeout: Duration::from_secs(300),
            kill_grace: Duration::from_millis(5000),
            cwd: None,
        }
    }
}

/// Why the runner terminated the child (or failed to start it).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillReason {
    Timeout,
    Cancelled,
    SpawnError,
    OutputOverflow,
}

/// Structured outcome of one invocation. Spawn failure is data, not an
/// error: `exit_code = -1`, `kill_reason = SpawnError`.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub stdout_bytes: u64,
    pub stderr_bytes: u64,
    pub wall_ms: u64,
    pub kill_reason: Option<KillReason>,
}

impl RunOutcome {
    fn spawn_error(message: String, wall_ms: u64) -> Self {
        Self {
            exit_code: -1,
            stdout: String::new(),
            stderr: message,
            stdout_bytes: 0,
            stderr_bytes: 0,
            wall_ms,
            kill_reason: Some(KillReason::SpawnError),
        }
    }

    /// stdout and stderr joined for pattern classification.
    pub fn combined_output(&self) -> String {
        let mut combined = String::with_capacity(self.stdout.len() + self.stderr.len() + 1);
        combined.push_str(&self.stdout);
        if !self.stderr.is_empty() {
            combined.push('\n');
            combined.push_str(&self.stderr);
        }
        combined
    }
}

/// Drop guard that kills the entire process group (not just the leader
/// PID). The child is spawned as a group leader via `process_group(0)`;
/// killing the negative PID reaps grandchildren the leader spawned.
struct ProcessGroupGuard {
    pid: Option<u32>,
}

impl ProcessGroupGuard {
    fn new(pid: Option<u32>) -> Self {
        Self { pid }
    }

    fn disarm(&mut self) {
        self.pid = None;
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        if let Some(pid) = self.pid {
            unsafe {
                libc::kill(-(pid as i32), libc::SIGKILL);
            }
        }
    }
}

fn signal_group(pid: Option<u32>, signal: i32) {
    if let Some(pid) = pid {
        unsafe {
            libc::kill(-(pid as i32), signal);
        }
    }
}

/// Spawns, streams, time-bounds, and terminates one CLI child process.
pub struct ProcessRunner {
    max_output_bytes: usize,
}

#[allow(clippy::new_without_default)]
impl ProcessRunner {
    pub fn new() -> Self {
        Self {
            max_output_bytes: MAX_OUTPUT_BYTES,
        }
    }

    pub fn with_output_cap(max_output_bytes: usize) -> Self {
        Self { max_output_bytes }
    }

    /// Execute one invocation to completion.
    ///
    /// - stdin is written from a separate task so a large prompt cannot
    ///   deadlock against a child that echoes output early;
    /// - stdout/stderr are read incrementally, capped at the output
    ///   limit plus one sentinel byte (the extra byte distinguishes
    ///   "exactly at the cap" from "exceeded it");
    /// - on timeout or cancellation the group gets SIGTERM, then SIGKILL
    ///   after `kill_grace`; the runner never waits past the grace
    ///   window after the hard kill.
    pub async fn run(
        &self,
        req: RunRequest,
        sink: Arc<dyn OutputSink>,
        cancel: CancellationToken,
    ) -> RunOutcome {
        let start = Instant::now();

        let mut cmd = Command::new(&req.executable);
        cmd.args(&req.args)
            .envs(&req.env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .process_group(0);
        if let Some(ref cwd) = req.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(executable = %req.executable, "spawn failed: {e}");
                return RunOutcome::spawn_error(
                    format!("failed to spawn {}: {e}", req.executable),
                    start.elapsed().as_millis() as u64,
                );
            }
        };

        let child_pid = child.id();
        let mut guard = ProcessGroupGuard::new(child_pid);

        // Write the prompt concurrently with pipe reading. Awaiting the
        // write inline can deadlock when the prompt exceeds the OS pipe
        // buffer and the child echoes output before draining stdin.
        {
            let mut stdin = child.stdin.take().expect("stdin was piped");
            let payload = req.stdin.clone();
            tokio::spawn(async move {
                if let Some(payload) = payload {
                    let _ = stdin.write_all(payload.as_bytes()).await;
                }
                // drop closes the pipe: the child sees EOF
            });
        }

        let stdout_pipe = child.stdout.take().expect("stdout was piped");
        let stderr_pipe = child.stderr.take().expect("stderr was piped");

        let cap = self.max_output_bytes;
        let stdout_task = tokio::spawn(read_stream(
            stdout_pipe,
            cap,
            StreamKind::Stdout,
            sink.clone(),
            child_pid,
        ));
        let stderr_task = tokio::spawn(read_stream(
            stderr_pipe,
            cap,
            StreamKind::Stderr,
            sink,
            child_pid,
        ));

        let mut kill_reason: Option<KillReason> = None;

        // The wait future borrows the child mutably, so the escalation
        // runs after the select resolves, not inside an arm.
        let natural_exit = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                kill_reason = Some(KillReason::Cancelled);
                None
            }
            _ = tokio::time::sleep(req.timeout) => {
                kill_reason = Some(KillReason::Timeout);
                None
            }
            status = child.wait() => Some(status.ok()),
        };
        let status = match natural_exit {
            Some(status) => status,
            None => escalate_and_reap(&mut child, child_pid, req.kill_grace).await,
        };

        // The child is dead (or abandoned); readers drain to EOF fast.
        // Bound the join anyway so an unreapable child cannot wedge us.
        let (stdout_buf, stdout_total) = join_reader(stdout_task, req.kill_grace).await;
        let (stderr_buf, stderr_total) = join_reader(stderr_task, req.kill_grace).await;

        if kill_reason.is_none()
            && (stdout_total as usize > cap || stderr_total as usize > cap)
        {
            kill_reason = Some(KillReason::OutputOverflow);
        }

        guard.disarm();
        // One final sweep for grandchildren the leader left behind.
        signal_group(child_pid, libc::SIGKILL);

        let exit_code = status.map_or(-1, |s| s.code().unwrap_or(-1));
        let wall_ms = start.elapsed().as_millis() as u64;

        if exit_code != 0 {
            tracing::debug!(
                executable = %req.executable,
                code = exit_code,
                reason = ?kill_reason,
                "CLI process exited nonzero"
            );
        }

        RunOutcome {
            exit_code,
            stdout: String::from_utf8_lossy(&stdout_buf[..stdout_buf.len().min(cap)]).to_string(),
            stderr: String::from_utf8_lossy(&stderr_buf[..stderr_buf.len().min(cap)]).to_string(),
            stdout_bytes: stdout_total,
            stderr_bytes: stderr_total,
            wall_ms,
            kill_reason,
        }
    }
}

/// Graceful-then-hard escalation: SIGTERM the group, wait the grace
/// window for a clean exit, then SIGKILL and wait one more grace window
/// at most. Returns the exit status when the child was reaped in time.
async fn escalate_and_reap(
    child: &mut tokio::process::Child,
    pid: Option<u32>,
    grace: Duration,
) -> Option<std::process::ExitStatus> {
    signal_group(pid, libc::SIGTERM);
    if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
        return status.ok();
    }

    signal_group(pid, libc::SIGKILL);
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => status.ok(),
        Err(_) => {
            tracing::warn!(?pid, "child not reaped within grace window after SIGKILL");
            None
        }
    }
}

/// Read one pipe incrementally: accumulate up to `cap + 1` bytes (the
/// sentinel byte proves overflow), emit complete lines to the sink as
/// they appear, and SIGKILL the group on overflow so the sibling reader
/// is not left waiting on an EOF that never comes.
async fn read_stream<R>(
    mut pipe: R,
    cap: usize,
    kind: StreamKind,
    sink: Arc<dyn OutputSink>,
    pid: Option<u32>,
) -> (Vec<u8>, u64)
where
    R: AsyncRead + Unpin,
{
    let mut buf: Vec<u8> = Vec::with_capacity(cap.min(64 * 1024));
    let mut total: u64 = 0;
    let mut line_start = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        match pipe.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                total += n as u64;
                let room = (cap + 1).saturating_sub(buf.len());
                if room > 0 {
                    buf.extend_from_slice(&chunk[..n.min(room)]);
                }

                while let Some(offset) = buf[line_start..].iter().position(|&b| b == b'\n') {
                    let end = line_start + offset;
                    let line = String::from_utf8_lossy(&buf[line_start..end]);
                    sink.on_line(kind, line.trim_end_matches('\r'));
                    line_start = end + 1;
                }

                if total as usize > cap {
                    // Unblock the sibling reader and stop the flood.
                    signal_group(pid, libc::SIGKILL);
                    break;
                }
            }
            Err(e) => {
                tracing::warn!("{kind:?} pipe read error: {e}");
                break;
            }
        }
    }

    // Sentinel flush of trailing partial data.
    if line_start < buf.len() {
        let line = String::from_utf8_lossy(&buf[line_start..buf.len().min(cap)]);
        sink.on_line(kind, line.trim_end_matches('\r'));
    }

    (buf, total)
}

async fn join_reader(
    mut task: tokio::task::JoinHandle<(Vec<u8>, u64)>,
    grace: Duration,
) -> (Vec<u8>, u64) {
    match tokio::time::timeout(grace, &mut task).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            tracing::warn!("pipe reader task failed: {e}");
            (Vec::new(), 0)
        }
        Err(_) => {
            task.abort();
            (Vec::new(), 0)
        }
    }
}
