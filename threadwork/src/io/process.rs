//! Helpers for running child processes with timeouts and bounded output.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, error, instrument, warn};

/// How long output readers may keep draining after the child is killed.
///
/// Grandchildren can hold the pipes open past the kill; their output is
/// abandoned after this.
const DRAIN_AFTER_KILL: Duration = Duration::from_secs(2);

/// How a command ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "code", rename_all = "snake_case")]
pub enum ExitStatus {
    /// Normal exit with a code.
    Exited(i32),
    /// Terminated by a signal.
    Signaled,
    /// Killed after exceeding its timeout.
    TimedOut,
}

impl ExitStatus {
    pub fn success(self) -> bool {
        self == ExitStatus::Exited(0)
    }
}

/// Result of a command run in a sandbox or directly in a worktree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub exit: ExitStatus,
    /// True when any output beyond the byte cap was discarded.
    pub truncated: bool,
}

impl ExecResult {
    /// Render as a model-facing observation.
    pub fn render(&self) -> String {
        let mut buf = String::new();
        match self.exit {
            ExitStatus::Exited(code) => buf.push_str(&format!("exit code: {code}\n")),
            ExitStatus::Signaled => buf.push_str("exit: terminated by signal\n"),
            ExitStatus::TimedOut => buf.push_str("exit: timed out (command was killed)\n"),
        }
        if !self.stdout.is_empty() {
            buf.push_str("--- stdout ---\n");
            buf.push_str(&self.stdout);
            if !self.stdout.ends_with('\n') {
                buf.push('\n');
            }
        }
        if !self.stderr.is_empty() {
            buf.push_str("--- stderr ---\n");
            buf.push_str(&self.stderr);
            if !self.stderr.ends_with('\n') {
                buf.push('\n');
            }
        }
        if self.truncated {
            buf.push_str("[output truncated at byte limit]\n");
        }
        buf
    }
}

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub exit: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
}

impl CommandOutput {
    pub fn into_exec_result(self) -> ExecResult {
        ExecResult {
            truncated: self.stdout_truncated > 0 || self.stderr_truncated > 0,
            stdout: String::from_utf8_lossy(&self.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&self.stderr).into_owned(),
            exit: self.exit,
        }
    }
}

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// Output is read concurrently while the child runs. `output_limit_bytes` bounds the amount of
/// stdout/stderr stored in memory (bytes beyond this are discarded while still draining the pipe).
/// A timed-out child is killed and reported as [`ExitStatus::TimedOut`] rather than an error.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub async fn run_command_with_timeout(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;
    let stdout_handle = tokio::spawn(read_stream_limited(stdout, output_limit_bytes));
    let stderr_handle = tokio::spawn(read_stream_limited(stderr, output_limit_bytes));

    // The write runs alongside the wait so a child that never reads its
    // input still hits the timeout.
    let stdin_handle = match stdin {
        Some(input) => {
            let mut child_stdin = child
                .stdin
                .take()
                .ok_or_else(|| anyhow!("stdin was not piped"))?;
            let input = input.to_vec();
            Some(tokio::spawn(async move {
                // A child that exits without reading stdin closes the pipe; that is not our error.
                if let Err(e) = child_stdin.write_all(&input).await {
                    debug!(err = %e, "child closed stdin early");
                }
            }))
        }
        None => None,
    };

    let (exit, killed) = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(status) => {
            let status = status.context("wait for command")?;
            let exit = match status.code() {
                Some(code) => ExitStatus::Exited(code),
                None => ExitStatus::Signaled,
            };
            (exit, false)
        }
        Err(_) => {
            warn!(
                timeout_secs = timeout.as_secs(),
                "command timed out, killing"
            );
            child.kill().await.context("kill command")?;
            (ExitStatus::TimedOut, true)
        }
    };
    if let Some(handle) = stdin_handle {
        handle.abort();
    }

    let (stdout, stdout_truncated) = join_output(stdout_handle, killed)
        .await
        .context("join stdout")?;
    let (stderr, stderr_truncated) = join_output(stderr_handle, killed)
        .await
        .context("join stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(?exit, "command finished");
    Ok(CommandOutput {
        exit,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
    })
}

async fn join_output(
    handle: JoinHandle<Result<(Vec<u8>, usize)>>,
    killed: bool,
) -> Result<(Vec<u8>, usize)> {
    if !killed {
        return handle
            .await
            .map_err(|_| anyhow!("output reader task panicked"))?;
    }
    let abort = handle.abort_handle();
    match tokio::time::timeout(DRAIN_AFTER_KILL, handle).await {
        Ok(joined) => joined.map_err(|_| anyhow!("output reader task panicked"))?,
        Err(_) => {
            abort.abort();
            warn!("output pipe still open after kill, abandoning reader");
            Ok((Vec::new(), 0))
        }
    }
}

async fn read_stream_limited<R: AsyncRead + Unpin>(
    mut reader: R,
    limit: usize,
) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).await.context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}

/// Build a `sh -c <script>` command.
pub fn shell_command(script: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(script);
    cmd
}
