//! Test fixtures: throwaway git repositories, a scripted model client and an
//! in-process isolation runtime.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tempfile::TempDir;

use crate::core::types::{Message, ToolCall};
use crate::io::config::{DomainConfig, EngineConfig};
use crate::io::model::{GenerationEvent, GenerationStream, ModelClient, ToolDeclaration};
use crate::io::process::{ExecResult, run_command_with_timeout};
use crate::sandbox::{ExecRequest, IsolationRuntime, StartSpec};

/// A git repository on `main` with one commit, plus a data directory.
#[derive(Debug)]
pub struct TestRepo {
    _temp: TempDir,
    root: PathBuf,
    data_dir: PathBuf,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir().context("create temp dir")?;
        let base = temp.path().canonicalize().context("resolve temp dir")?;
        let root = base.join("repo");
        let data_dir = base.join("data");
        std::fs::create_dir_all(&root).context("create repo dir")?;
        std::fs::create_dir_all(&data_dir).context("create data dir")?;

        git(&root, &["init", "-q"])?;
        git(&root, &["symbolic-ref", "HEAD", "refs/heads/main"])?;
        git(&root, &["config", "user.email", "threads@example.com"])?;
        git(&root, &["config", "user.name", "Thread Tests"])?;
        git(&root, &["config", "commit.gpgsign", "false"])?;

        let repo = Self {
            _temp: temp,
            root,
            data_dir,
        };
        repo.commit_file("README.md", "# notes\n", "initial commit")?;
        Ok(repo)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn domain_config(&self, name: &str) -> DomainConfig {
        DomainConfig::new(name, &self.root)
    }

    /// Engine config with this repo as domain `notes` and fast retries.
    pub fn engine_config(&self) -> EngineConfig {
        let mut config = EngineConfig {
            data_dir: self.data_dir.clone(),
            domains: vec![self.domain_config("notes")],
            exec_timeout_secs: 10,
            ..EngineConfig::default()
        };
        config.generation.backoff_ms = 1;
        config.sandbox.cancel_grace_secs = 1;
        config
    }

    /// Write `path` in the primary checkout and commit it on the current branch.
    pub fn commit_file(&self, path: &str, content: &str, message: &str) -> Result<()> {
        let full = self.root.join(path);
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent).context("create parent dir")?;
        }
        std::fs::write(&full, content).with_context(|| format!("write {path}"))?;
        git(&self.root, &["add", "--", path])?;
        git(&self.root, &["commit", "-q", "-m", message])?;
        Ok(())
    }

    /// Contents of `path` at `rev`.
    pub fn show(&self, rev: &str, path: &str) -> Result<String> {
        git(&self.root, &["show", &format!("{rev}:{path}")])
    }

    /// Subject line of the commit at `rev`.
    pub fn subject(&self, rev: &str) -> Result<String> {
        Ok(git(&self.root, &["log", "-1", "--format=%s", rev])?
            .trim()
            .to_string())
    }

    pub fn rev(&self, rev: &str) -> Result<String> {
        Ok(git(&self.root, &["rev-parse", rev])?.trim().to_string())
    }
}

fn git(dir: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .with_context(|| format!("run git {}", args.join(" ")))?;
    if !output.status.success() {
        bail!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Build a tool call for scripts.
pub fn tool_call(id: &str, name: &str, arguments: serde_json::Value) -> ToolCall {
    ToolCall {
        id: id.to_string(),
        name: name.to_string(),
        arguments,
    }
}

/// One scripted model reply.
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    /// Final text, streamed in two deltas.
    Text(String),
    /// Tool calls with no text.
    Calls(Vec<ToolCall>),
    /// `generate` itself fails.
    Fail(String),
    /// Text that ends without `Finished`.
    Truncated(String),
    /// A stream that never yields.
    Hang,
}

/// Model client that plays back replies in order.
#[derive(Debug, Default)]
pub struct ScriptedModel {
    replies: Mutex<VecDeque<ScriptedReply>>,
    fallback: Option<ScriptedReply>,
    views: Mutex<Vec<Vec<Message>>>,
    calls: AtomicUsize,
}

impl ScriptedModel {
    pub fn new(replies: Vec<ScriptedReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            ..Self::default()
        }
    }

    /// Reply used once the script runs out.
    pub fn with_fallback(mut self, reply: ScriptedReply) -> Self {
        self.fallback = Some(reply);
        self
    }

    /// Number of `generate` calls so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Views passed to each `generate` call.
    pub fn views(&self) -> Vec<Vec<Message>> {
        self.views.lock().map(|v| v.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ModelClient for ScriptedModel {
    async fn generate(
        &self,
        view: &[Message],
        _tools: &[ToolDeclaration],
    ) -> Result<GenerationStream> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut views) = self.views.lock() {
            views.push(view.to_vec());
        }
        let next = self
            .replies
            .lock()
            .map_err(|_| anyhow!("script lock poisoned"))?
            .pop_front()
            .or_else(|| self.fallback.clone())
            .ok_or_else(|| anyhow!("model script exhausted"))?;

        let events: Vec<Result<GenerationEvent>> = match next {
            ScriptedReply::Text(text) => {
                let split = text.len() / 2;
                let split = (0..=split)
                    .rev()
                    .find(|i| text.is_char_boundary(*i))
                    .unwrap_or(0);
                vec![
                    Ok(GenerationEvent::TextDelta(text[..split].to_string())),
                    Ok(GenerationEvent::TextDelta(text[split..].to_string())),
                    Ok(GenerationEvent::Finished),
                ]
            }
            ScriptedReply::Calls(calls) => calls
                .into_iter()
                .map(|call| Ok(GenerationEvent::ToolCall(call)))
                .chain(std::iter::once(Ok(GenerationEvent::Finished)))
                .collect(),
            ScriptedReply::Fail(message) => bail!(message),
            ScriptedReply::Truncated(text) => vec![Ok(GenerationEvent::TextDelta(text))],
            ScriptedReply::Hang => return Ok(stream::pending().boxed()),
        };
        Ok(stream::iter(events).boxed())
    }
}

/// Isolation runtime that runs commands on the host in the mounted directory.
#[derive(Debug)]
pub struct FakeRuntime {
    available: bool,
    sandboxes: Mutex<HashMap<String, PathBuf>>,
    started: AtomicUsize,
    stopped: AtomicUsize,
    failing_stops: AtomicUsize,
}

impl FakeRuntime {
    pub fn available() -> Self {
        Self::with_availability(true)
    }

    /// A runtime whose probe always fails.
    pub fn unavailable() -> Self {
        Self::with_availability(false)
    }

    fn with_availability(available: bool) -> Self {
        Self {
            available,
            sandboxes: Mutex::new(HashMap::new()),
            started: AtomicUsize::new(0),
            stopped: AtomicUsize::new(0),
            failing_stops: AtomicUsize::new(0),
        }
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn stopped(&self) -> usize {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Make the next `stop` call fail without removing anything.
    pub fn fail_next_stop(&self) {
        self.failing_stops.fetch_add(1, Ordering::SeqCst);
    }

    fn table(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, PathBuf>>> {
        self.sandboxes
            .lock()
            .map_err(|_| anyhow!("fake runtime lock poisoned"))
    }
}

#[async_trait]
impl IsolationRuntime for FakeRuntime {
    async fn probe(&self) -> Result<()> {
        if !self.available {
            bail!("Cannot connect to the container daemon");
        }
        Ok(())
    }

    async fn start(&self, spec: &StartSpec) -> Result<String> {
        self.probe().await?;
        let n = self.started.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("fake-{n}");
        self.table()?.insert(id.clone(), spec.host_path.clone());
        Ok(id)
    }

    async fn exec(&self, id: &str, request: &ExecRequest) -> Result<ExecResult> {
        let dir = self
            .table()?
            .get(id)
            .cloned()
            .ok_or_else(|| anyhow!("no such sandbox: {id}"))?;
        let (program, args) = request
            .argv
            .split_first()
            .ok_or_else(|| anyhow!("empty command"))?;
        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args).current_dir(dir);
        let output = run_command_with_timeout(
            cmd,
            request.stdin.as_deref(),
            request.timeout,
            request.output_limit_bytes,
        )
        .await?;
        Ok(output.into_exec_result())
    }

    async fn stop(&self, id: &str) -> Result<()> {
        if self
            .failing_stops
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            bail!("container {id} could not be removed");
        }
        if self.table()?.remove(id).is_some() {
            self.stopped.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}
