//! `docker` CLI backend.

use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use tracing::{debug, instrument};

use super::{ExecRequest, IsolationRuntime, StartSpec};
use crate::io::process::{ExecResult, run_command_with_timeout};

/// Label attached to every container we start.
const THREAD_LABEL: &str = "threadwork.thread";

const CONTROL_TIMEOUT: Duration = Duration::from_secs(60);
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const CONTROL_OUTPUT_LIMIT: usize = 64 * 1024;

/// Runs sandboxes as containers through a docker-compatible CLI.
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    binary: String,
    image: String,
}

impl DockerRuntime {
    pub fn new(binary: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            image: image.into(),
        }
    }

    fn command(&self) -> tokio::process::Command {
        tokio::process::Command::new(&self.binary)
    }

    /// Run a control command and return trimmed stdout.
    async fn control(&self, args: &[&str], timeout: Duration) -> Result<String> {
        let mut cmd = self.command();
        cmd.args(args);
        let out = run_command_with_timeout(cmd, None, timeout, CONTROL_OUTPUT_LIMIT)
            .await
            .with_context(|| format!("spawn {} {}", self.binary, args.join(" ")))?;
        if !out.exit.success() {
            return Err(anyhow!(
                "{} {} failed ({:?}): {}",
                self.binary,
                args.first().copied().unwrap_or_default(),
                out.exit,
                String::from_utf8_lossy(&out.stderr).trim()
            ));
        }
        Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
    }
}

#[async_trait]
impl IsolationRuntime for DockerRuntime {
    async fn probe(&self) -> Result<()> {
        let version = self
            .control(&["version", "--format", "{{.Server.Version}}"], PROBE_TIMEOUT)
            .await?;
        debug!(version = %version, "container runtime reachable");
        Ok(())
    }

    #[instrument(skip_all, fields(thread = %spec.thread_id))]
    async fn start(&self, spec: &StartSpec) -> Result<String> {
        let host = spec
            .host_path
            .to_str()
            .ok_or_else(|| anyhow!("non-utf8 worktree path {}", spec.host_path.display()))?;
        let volume = format!("{host}:{}", spec.mount_path);
        let label = format!("{THREAD_LABEL}={}", spec.thread_id);
        let id = self
            .control(
                &[
                    "run",
                    "-d",
                    "--rm",
                    "-v",
                    &volume,
                    "-w",
                    &spec.mount_path,
                    "--label",
                    &label,
                    &self.image,
                    "sleep",
                    "infinity",
                ],
                CONTROL_TIMEOUT,
            )
            .await?;
        if id.is_empty() {
            return Err(anyhow!("{} run returned no container id", self.binary));
        }
        debug!(container = %id, image = %self.image, "container started");
        Ok(id)
    }

    async fn exec(&self, id: &str, request: &ExecRequest) -> Result<ExecResult> {
        let mut cmd = self.command();
        cmd.args(exec_args(id, request));
        let out = run_command_with_timeout(
            cmd,
            request.stdin.as_deref(),
            request.timeout,
            request.output_limit_bytes,
        )
        .await?;
        Ok(out.into_exec_result())
    }

    async fn stop(&self, id: &str) -> Result<()> {
        match self.control(&["rm", "-f", id], CONTROL_TIMEOUT).await {
            Ok(_) => Ok(()),
            Err(err) if err.to_string().contains("No such container") => Ok(()),
            Err(err) => Err(err),
        }
    }
}

/// `exec` arguments for `request`.
///
/// Killing the local client does not stop the process inside the container,
/// so the command also runs under the container's own `timeout`.
fn exec_args(id: &str, request: &ExecRequest) -> Vec<String> {
    let mut args = vec!["exec".to_string()];
    if request.stdin.is_some() {
        args.push("-i".to_string());
    }
    let limit = request.timeout.as_secs() + u64::from(request.timeout.subsec_nanos() > 0);
    args.extend([
        id.to_string(),
        "timeout".to_string(),
        "-s".to_string(),
        "KILL".to_string(),
        limit.max(1).to_string(),
    ]);
    args.extend(request.argv.iter().cloned());
    args
}
