//! Isolated command execution per thread.
//!
//! A sandbox is a long-lived container with the thread's worktree mounted at
//! a fixed path. The manager owns the table of live sandboxes; callers only
//! hold [`SandboxHandle`] snapshots. When the runtime cannot be reached,
//! provisioning reports [`Provision::Unavailable`] and the caller falls back to
//! running directly in the worktree.

mod docker;

pub use docker::DockerRuntime;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::core::types::ThreadId;
use crate::io::process::ExecResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxState {
    Provisioning,
    Ready,
    Terminated,
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxHandle {
    /// Runtime identifier (container id).
    pub id: String,
    pub thread_id: ThreadId,
    /// Mount path of the worktree inside the sandbox.
    pub workspace: String,
    pub host_path: PathBuf,
    pub state: SandboxState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Provision {
    Ready(SandboxHandle),
    /// The runtime is unreachable; run unsandboxed.
    Unavailable(String),
}

/// What a runtime needs to start one sandbox.
#[derive(Debug, Clone)]
pub struct StartSpec {
    pub thread_id: ThreadId,
    pub host_path: PathBuf,
    pub mount_path: String,
}

/// A command to run inside a started sandbox.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub argv: Vec<String>,
    pub stdin: Option<Vec<u8>>,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

impl ExecRequest {
    /// `sh -c <script>` in the workspace.
    pub fn shell(script: &str, timeout: Duration, output_limit_bytes: usize) -> Self {
        Self {
            argv: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            stdin: None,
            timeout,
            output_limit_bytes,
        }
    }
}

/// Container backend.
#[async_trait]
pub trait IsolationRuntime: Send + Sync {
    /// Cheap reachability check.
    async fn probe(&self) -> Result<()>;

    /// Start a sandbox and return its id.
    async fn start(&self, spec: &StartSpec) -> Result<String>;

    /// Run a command with the workspace as working directory.
    async fn exec(&self, id: &str, request: &ExecRequest) -> Result<ExecResult>;

    /// Stop and remove; stopping an unknown sandbox is not an error.
    async fn stop(&self, id: &str) -> Result<()>;
}

#[derive(Debug)]
struct Entry {
    handle: SandboxHandle,
    exec_lock: Arc<tokio::sync::Mutex<()>>,
}

pub struct SandboxManager {
    runtime: Arc<dyn IsolationRuntime>,
    mount_path: String,
    active: Mutex<HashMap<ThreadId, Entry>>,
}

impl std::fmt::Debug for SandboxManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxManager")
            .field("mount_path", &self.mount_path)
            .finish_non_exhaustive()
    }
}

impl SandboxManager {
    pub fn new(runtime: Arc<dyn IsolationRuntime>, mount_path: impl Into<String>) -> Self {
        Self {
            runtime,
            mount_path: mount_path.into(),
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Start (or reuse) the sandbox for `thread_id` with `host_path` mounted.
    #[instrument(skip_all, fields(thread = %thread_id))]
    pub async fn provision(&self, thread_id: &ThreadId, host_path: PathBuf) -> Result<Provision> {
        let existing = self.get(thread_id)?;
        if let Some(handle) = existing {
            if handle.state == SandboxState::Ready {
                debug!(sandbox = %handle.id, "reusing sandbox");
                return Ok(Provision::Ready(handle));
            }
            // A previous teardown failed; the old sandbox must go first.
            if let Err(err) = self.teardown(&handle).await {
                warn!(err = %err, sandbox = %handle.id, "stale sandbox still running");
                return Ok(Provision::Unavailable(format!("{err:#}")));
            }
        }

        if let Err(err) = self.runtime.probe().await {
            warn!(err = %err, "isolation runtime unavailable");
            return Ok(Provision::Unavailable(format!("{err:#}")));
        }
        let spec = StartSpec {
            thread_id: thread_id.clone(),
            host_path: host_path.clone(),
            mount_path: self.mount_path.clone(),
        };
        let id = match self.runtime.start(&spec).await {
            Ok(id) => id,
            Err(err) => {
                warn!(err = %err, "sandbox start failed");
                return Ok(Provision::Unavailable(format!("{err:#}")));
            }
        };

        let handle = SandboxHandle {
            id,
            thread_id: thread_id.clone(),
            workspace: self.mount_path.clone(),
            host_path,
            state: SandboxState::Ready,
        };
        let raced = {
            let mut table = self.table()?;
            match table.get(thread_id) {
                Some(existing) => Some(existing.handle.clone()),
                None => {
                    table.insert(
                        thread_id.clone(),
                        Entry {
                            handle: handle.clone(),
                            exec_lock: Arc::new(tokio::sync::Mutex::new(())),
                        },
                    );
                    None
                }
            }
        };
        if let Some(existing) = raced {
            // Another caller provisioned first; drop ours.
            if let Err(err) = self.runtime.stop(&handle.id).await {
                warn!(err = %err, sandbox = %handle.id, "failed to stop duplicate sandbox");
            }
            return Ok(Provision::Ready(existing));
        }
        info!(sandbox = %handle.id, "sandbox ready");
        Ok(Provision::Ready(handle))
    }

    /// Live handle for a thread, if any.
    pub fn get(&self, thread_id: &ThreadId) -> Result<Option<SandboxHandle>> {
        Ok(self.table()?.get(thread_id).map(|e| e.handle.clone()))
    }

    /// Run one command; commands on the same sandbox are serialized.
    #[instrument(skip_all, fields(sandbox = %handle.id))]
    pub async fn exec(&self, handle: &SandboxHandle, request: &ExecRequest) -> Result<ExecResult> {
        let exec_lock = {
            let table = self.table()?;
            match table.get(&handle.thread_id) {
                Some(entry)
                    if entry.handle.id == handle.id
                        && entry.handle.state == SandboxState::Ready =>
                {
                    entry.exec_lock.clone()
                }
                _ => return Err(anyhow!("sandbox {} is not running", handle.id)),
            }
        };
        let _guard = exec_lock.lock().await;
        self.runtime.exec(&handle.id, request).await
    }

    /// Stop the sandbox. Safe to call more than once.
    ///
    /// The entry stays in the table until the runtime confirms the stop, so a
    /// failed stop can be retried here or by [`Self::teardown_all`].
    #[instrument(skip_all, fields(sandbox = %handle.id))]
    pub async fn teardown(&self, handle: &SandboxHandle) -> Result<()> {
        let found = {
            let mut table = self.table()?;
            match table.get_mut(&handle.thread_id) {
                Some(entry) if entry.handle.id == handle.id => {
                    // No new commands start once teardown begins.
                    entry.handle.state = SandboxState::Terminated;
                    true
                }
                _ => false,
            }
        };
        if !found {
            debug!("sandbox already torn down");
            return Ok(());
        }
        // Stopping also kills a command that is still running.
        self.runtime.stop(&handle.id).await?;
        {
            let mut table = self.table()?;
            if table
                .get(&handle.thread_id)
                .is_some_and(|entry| entry.handle.id == handle.id)
            {
                table.remove(&handle.thread_id);
            }
        }
        info!("sandbox terminated");
        Ok(())
    }

    /// Stop a sandbox known only by its recorded id, e.g. one left behind
    /// by an earlier process.
    #[instrument(skip_all, fields(thread = %thread_id, sandbox = %id))]
    pub async fn teardown_id(&self, thread_id: &ThreadId, id: &str) -> Result<()> {
        if let Some(handle) = self.get(thread_id)?
            && handle.id == id
        {
            return self.teardown(&handle).await;
        }
        self.runtime.stop(id).await?;
        info!("leftover sandbox stopped");
        Ok(())
    }

    /// Tear down the thread's sandbox if one is live.
    pub async fn teardown_thread(&self, thread_id: &ThreadId) -> Result<()> {
        match self.get(thread_id)? {
            Some(handle) => self.teardown(&handle).await,
            None => Ok(()),
        }
    }

    /// Stop every live sandbox; errors are logged and the first is returned.
    pub async fn teardown_all(&self) -> Result<()> {
        let handles: Vec<SandboxHandle> = self
            .table()?
            .values()
            .map(|e| e.handle.clone())
            .collect();
        let mut first_err = None;
        for handle in handles {
            if let Err(err) = self.teardown(&handle).await {
                warn!(sandbox = %handle.id, err = %err, "teardown failed");
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub fn active_count(&self) -> Result<usize> {
        Ok(self.table()?.len())
    }

    fn table(&self) -> Result<MutexGuard<'_, HashMap<ThreadId, Entry>>> {
        self.active
            .lock()
            .map_err(|_| anyhow!("sandbox table lock poisoned"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::process::ExitStatus;
    use crate::test_support::FakeRuntime;

    #[tokio::test]
    async fn unreachable_runtime_reports_unavailable() {
        let runtime = Arc::new(FakeRuntime::unavailable());
        let manager = SandboxManager::new(runtime, "/workspace");
        let temp = tempfile::tempdir().expect("tempdir");

        let provision = manager
            .provision(&ThreadId::new("t"), temp.path().to_path_buf())
            .await
            .expect("provision");
        assert!(matches!(provision, Provision::Unavailable(_)));
        assert_eq!(manager.active_count().expect("count"), 0);
    }

    #[tokio::test]
    async fn provision_is_reused_per_thread() {
        let runtime = Arc::new(FakeRuntime::available());
        let manager = SandboxManager::new(runtime.clone(), "/workspace");
        let temp = tempfile::tempdir().expect("tempdir");
        let id = ThreadId::new("t");

        let Provision::Ready(first) = manager
            .provision(&id, temp.path().to_path_buf())
            .await
            .expect("provision")
        else {
            panic!("expected ready");
        };
        let Provision::Ready(second) = manager
            .provision(&id, temp.path().to_path_buf())
            .await
            .expect("provision")
        else {
            panic!("expected ready");
        };
        assert_eq!(first.id, second.id);
        assert_eq!(runtime.started(), 1);
    }

    #[tokio::test]
    async fn exec_runs_in_workspace_and_teardown_is_idempotent() {
        let runtime = Arc::new(FakeRuntime::available());
        let manager = SandboxManager::new(runtime.clone(), "/workspace");
        let temp = tempfile::tempdir().expect("tempdir");
        std::fs::write(temp.path().join("hello.txt"), "hi").expect("write");

        let Provision::Ready(handle) = manager
            .provision(&ThreadId::new("t"), temp.path().to_path_buf())
            .await
            .expect("provision")
        else {
            panic!("expected ready");
        };
        let result = manager
            .exec(
                &handle,
                &ExecRequest::shell("cat hello.txt", Duration::from_secs(10), 1024),
            )
            .await
            .expect("exec");
        assert_eq!(result.stdout, "hi");
        assert_eq!(result.exit, ExitStatus::Exited(0));

        manager.teardown(&handle).await.expect("teardown");
        manager.teardown(&handle).await.expect("second teardown");
        assert_eq!(runtime.stopped(), 1);
        let after = manager
            .exec(&handle, &ExecRequest::shell("true", Duration::from_secs(1), 16))
            .await;
        assert!(after.is_err());
    }

    #[tokio::test]
    async fn failed_stop_keeps_sandbox_reachable() {
        let runtime = Arc::new(FakeRuntime::available());
        let manager = SandboxManager::new(runtime.clone(), "/workspace");
        let temp = tempfile::tempdir().expect("tempdir");

        let Provision::Ready(handle) = manager
            .provision(&ThreadId::new("t"), temp.path().to_path_buf())
            .await
            .expect("provision")
        else {
            panic!("expected ready");
        };
        runtime.fail_next_stop();
        assert!(manager.teardown(&handle).await.is_err());
        assert_eq!(manager.active_count().expect("count"), 1);
        let refused = manager
            .exec(&handle, &ExecRequest::shell("true", Duration::from_secs(1), 16))
            .await;
        assert!(refused.is_err());

        manager.teardown_all().await.expect("retry");
        assert_eq!(runtime.stopped(), 1);
        assert_eq!(manager.active_count().expect("count"), 0);
    }

    #[tokio::test]
    async fn teardown_id_stops_sandbox_missing_from_table() {
        let runtime = Arc::new(FakeRuntime::available());
        let temp = tempfile::tempdir().expect("tempdir");
        let id = ThreadId::new("t");

        // Started by one manager, cleaned up by another that never saw it.
        let first = SandboxManager::new(runtime.clone(), "/workspace");
        let Provision::Ready(handle) = first
            .provision(&id, temp.path().to_path_buf())
            .await
            .expect("provision")
        else {
            panic!("expected ready");
        };
        let second = SandboxManager::new(runtime.clone(), "/workspace");
        second.teardown_id(&id, &handle.id).await.expect("teardown");
        assert_eq!(runtime.stopped(), 1);
        second.teardown_id(&id, &handle.id).await.expect("repeat");
        assert_eq!(runtime.stopped(), 1);
    }
}
