//! Thread-level API over the shared engine components.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Result, anyhow};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::agent::{AgentLoop, Services, TurnOutcome};
use crate::core::types::{Content, FailureReason, Message, Role, Thread, ThreadId, ThreadStatus};
use crate::domain::{BranchHandle, DomainManager, MergeOutcome};
use crate::error::EngineError;
use crate::io::config::EngineConfig;
use crate::io::git::Change;
use crate::io::model::{ModelClient, complete};
use crate::io::prompt::{MergeSummaryInputs, PromptEngine};
use crate::io::thread_store::ThreadStore;
use crate::sandbox::{DockerRuntime, IsolationRuntime, SandboxManager};
use crate::stream::{self, StreamReader, StreamSink};
use crate::tools::ToolRegistry;

/// Longest merge commit subject taken from a generated summary.
const SUMMARY_MAX_CHARS: usize = 72;

/// Commit subjects of the default branch shown to the summarizer.
const SUMMARY_RECENT_COMMITS: usize = 20;

/// Longest generated thread title.
const TITLE_MAX_CHARS: usize = 60;

/// Transcript text handed to the title request.
const TITLE_CONTEXT_BYTES: usize = 4_000;

/// A turn running in the background.
#[derive(Debug)]
pub struct Turn {
    pub reader: StreamReader,
    pub handle: JoinHandle<Result<TurnOutcome>>,
}

#[derive(Debug)]
pub struct Engine {
    services: Services,
    run_locks: Mutex<HashMap<ThreadId, Arc<tokio::sync::Mutex<()>>>>,
    active: Mutex<HashMap<ThreadId, CancellationToken>>,
    shutdown: CancellationToken,
}

impl Engine {
    /// Build the engine with an explicit isolation runtime.
    pub fn new(
        config: EngineConfig,
        model: Arc<dyn ModelClient>,
        runtime: Arc<dyn IsolationRuntime>,
    ) -> Result<Self> {
        config.validate()?;
        let services = Services {
            store: ThreadStore::open(config.threads_dir())?,
            domains: DomainManager::new(&config.domains, &config.data_dir),
            sandboxes: Arc::new(SandboxManager::new(
                runtime,
                config.sandbox.mount_path.clone(),
            )),
            tools: ToolRegistry::from_names(&config.tools)?,
            prompts: PromptEngine::new()?,
            model,
            config,
        };
        info!(
            domains = services.config.domains.len(),
            tools = services.tools.kinds().len(),
            "engine started"
        );
        Ok(Self {
            services,
            run_locks: Mutex::new(HashMap::new()),
            active: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        })
    }

    /// Build the engine with the configured container CLI.
    pub fn with_docker(config: EngineConfig, model: Arc<dyn ModelClient>) -> Result<Self> {
        let runtime = DockerRuntime::new(&config.sandbox.runtime, &config.sandbox.image);
        Self::new(config, model, Arc::new(runtime))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.services.config
    }

    /// Create a thread against `domain`, or the only configured domain.
    #[instrument(skip_all, fields(domain = ?domain))]
    pub async fn create_thread(&self, domain: Option<&str>) -> Result<ThreadId> {
        let domain = self.select_domain(domain)?;
        let id = ThreadId::generate();
        self.services
            .store
            .create(Thread::new(id.clone(), domain))
            .await?;
        info!(thread = %id, domain, "thread created");
        Ok(id)
    }

    fn select_domain<'c>(&'c self, requested: Option<&str>) -> Result<&'c str> {
        let domains = &self.services.config.domains;
        match requested {
            Some(name) => self
                .services
                .config
                .domain(name)
                .map(|d| d.name.as_str())
                .ok_or_else(|| EngineError::DomainSelection(format!("unknown domain '{name}'")).into()),
            None => match domains.as_slice() {
                [] => Err(EngineError::DomainSelection("no domains configured".to_string()).into()),
                [only] => Ok(only.name.as_str()),
                many => {
                    let names: Vec<&str> = many.iter().map(|d| d.name.as_str()).collect();
                    Err(EngineError::DomainSelection(format!(
                        "several domains configured, choose one of: {}",
                        names.join(", ")
                    ))
                    .into())
                }
            },
        }
    }

    /// Append a user message and run the turn to completion.
    pub async fn send(
        &self,
        id: &ThreadId,
        text: impl Into<String>,
        sink: StreamSink,
        cancel: CancellationToken,
    ) -> Result<TurnOutcome> {
        self.run(id, Some(text.into()), sink, cancel).await
    }

    /// Continue a thread whose last turn was interrupted.
    pub async fn resume(
        &self,
        id: &ThreadId,
        sink: StreamSink,
        cancel: CancellationToken,
    ) -> Result<TurnOutcome> {
        let thread = self.services.store.snapshot(id).await?;
        if !thread.status.is_in_flight() {
            return Err(anyhow!("thread {id} is {}, nothing to resume", thread.status));
        }
        self.run(id, None, sink, cancel).await
    }

    /// Run a turn in the background and hand back its event reader.
    pub fn start_turn(self: &Arc<Self>, id: &ThreadId, text: impl Into<String>) -> Turn {
        let cancel = CancellationToken::new();
        let (sink, reader) = stream::channel(cancel.clone());
        let engine = Arc::clone(self);
        let id = id.clone();
        let text = text.into();
        let handle = tokio::spawn(async move { engine.send(&id, text, sink, cancel).await });
        Turn { reader, handle }
    }

    async fn run(
        &self,
        id: &ThreadId,
        text: Option<String>,
        sink: StreamSink,
        cancel: CancellationToken,
    ) -> Result<TurnOutcome> {
        if self.shutdown.is_cancelled() {
            return Err(anyhow!("engine is shutting down"));
        }
        self.exclusive(id, self.run_locked(id, text, sink, cancel)).await
    }

    async fn run_locked(
        &self,
        id: &ThreadId,
        text: Option<String>,
        sink: StreamSink,
        cancel: CancellationToken,
    ) -> Result<TurnOutcome> {
        let cancel = {
            // Engine shutdown cancels every turn.
            let linked = self.shutdown.child_token();
            let caller = cancel.clone();
            let linked_clone = linked.clone();
            tokio::spawn(async move {
                tokio::select! {
                    () = caller.cancelled() => linked_clone.cancel(),
                    () = linked_clone.cancelled() => {}
                }
            });
            linked
        };
        lock(&self.active)?.insert(id.clone(), cancel.clone());

        let mut agent = AgentLoop::new(&self.services, id.clone(), sink, cancel.clone());
        let outcome = agent.run_turn(text).await;

        lock(&self.active)?.remove(id);
        // Ends the forwarding task.
        cancel.cancel();
        outcome
    }

    /// Cancel the running turn of a thread. Returns false when none is running.
    pub fn cancel(&self, id: &ThreadId) -> Result<bool> {
        match lock(&self.active)?.get(id) {
            Some(token) => {
                token.cancel();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn thread(&self, id: &ThreadId) -> Result<Thread> {
        self.services.store.snapshot(id).await
    }

    pub async fn list_threads(&self) -> Result<Vec<Thread>> {
        self.services.store.list().await
    }

    /// Commit outstanding work and merge the thread branch into the default branch.
    ///
    /// A conflict leaves the thread open with its branch intact. Asking again
    /// after a successful merge returns the recorded outcome.
    #[instrument(skip_all, fields(thread = %id))]
    pub async fn finish(&self, id: &ThreadId) -> Result<MergeOutcome> {
        self.exclusive(id, self.finish_locked(id)).await
    }

    async fn finish_locked(&self, id: &ThreadId) -> Result<MergeOutcome> {
        let thread = self.services.store.snapshot(id).await?;
        let domains = &self.services.domains;

        match thread.status {
            ThreadStatus::Completed | ThreadStatus::Cancelled => {}
            ThreadStatus::Merged if thread.merge.is_some() => {
                debug!("thread already merged, replaying outcome");
                return thread.merge.ok_or_else(|| anyhow!("merge outcome missing"));
            }
            status => {
                return Err(EngineError::ThreadClosed {
                    id: id.clone(),
                    status,
                }
                .into());
            }
        }

        let handle = domains.open(id, &thread.domain).await?;
        self.stop_sandboxes(&thread).await?;
        domains
            .commit(&handle, &format!("thread {id}: finish"))
            .await?;
        let message = self.merge_message(&thread, &handle).await;
        let outcome = domains.merge(&handle, None, &message).await?;
        if outcome.is_success() {
            let branch = handle.branch.clone();
            let recorded = outcome.clone();
            self.services
                .store
                .update(id, |t| {
                    t.status = ThreadStatus::Merged;
                    t.merge = Some(recorded);
                    t.branch = Some(branch);
                    t.worktree = None;
                    t.sandbox_id = None;
                })
                .await?;
            self.services.store.evict(id)?;
            info!(?outcome, "thread merged");
        } else {
            warn!(?outcome, "merge conflict, thread left open");
        }
        Ok(outcome)
    }

    /// Commit message for a merge that cannot fast-forward.
    ///
    /// Asks the model for a one-line summary of the branch and falls back to a
    /// fixed message when it cannot answer in time.
    async fn merge_message(&self, thread: &Thread, handle: &BranchHandle) -> String {
        let fallback = format!("Merge thread {}", thread.id);
        match self.services.domains.can_fast_forward(handle).await {
            Ok(true) => return fallback,
            Ok(false) => {}
            Err(err) => debug!(err = %err, "ancestry check failed"),
        }
        let timeout = self.services.config.generation.side_request_timeout();
        match tokio::time::timeout(timeout, self.summarize_merge(thread, handle)).await {
            Ok(Ok(Some(summary))) => summary,
            Ok(Ok(None)) => fallback,
            Ok(Err(err)) => {
                warn!(err = %err, "merge summary failed, using default message");
                fallback
            }
            Err(_) => {
                warn!(timeout_secs = timeout.as_secs(), "merge summary timed out");
                fallback
            }
        }
    }

    async fn summarize_merge(
        &self,
        thread: &Thread,
        handle: &BranchHandle,
    ) -> Result<Option<String>> {
        let domains = &self.services.domains;
        let changes = domains.changes(handle).await?;
        if changes.is_empty() {
            return Ok(None);
        }
        let domain = domains.domain(&thread.domain)?;
        let recent_commits = domains
            .base_log(&thread.domain, SUMMARY_RECENT_COMMITS)
            .await?;
        let prompt = self
            .services
            .prompts
            .render_merge_summary(&MergeSummaryInputs {
                default_branch: &domain.default_branch,
                title: thread.title.as_deref(),
                recent_commits: &recent_commits,
                changes: &changes,
            })?;
        let reply = complete(self.services.model.as_ref(), &[Message::user(prompt)]).await?;
        Ok(first_line(&reply, SUMMARY_MAX_CHARS))
    }

    /// Short title of the thread, generated once and then kept in the record.
    ///
    /// Returns `None` while the thread has no user or assistant text, or when
    /// the model cannot produce one.
    #[instrument(skip_all, fields(thread = %id))]
    pub async fn describe(&self, id: &ThreadId) -> Result<Option<String>> {
        let thread = self.services.store.snapshot(id).await?;
        if thread.title.is_some() {
            return Ok(thread.title);
        }
        let Some(conversation) = conversation_text(&thread) else {
            return Ok(None);
        };
        let instruction = self.services.prompts.render_title()?;
        let request = [Message::system(instruction), Message::user(conversation)];
        let timeout = self.services.config.generation.side_request_timeout();
        let reply =
            match tokio::time::timeout(timeout, complete(self.services.model.as_ref(), &request))
                .await
            {
                Ok(Ok(reply)) => reply,
                Ok(Err(err)) => {
                    warn!(err = %err, "title request failed");
                    return Ok(None);
                }
                Err(_) => {
                    warn!(timeout_secs = timeout.as_secs(), "title request timed out");
                    return Ok(None);
                }
            };
        let Some(title) = first_line(reply.trim_matches(['"', '\'']), TITLE_MAX_CHARS) else {
            return Ok(None);
        };
        let stored = title.clone();
        self.services
            .store
            .update(id, |t| t.title = Some(stored))
            .await?;
        debug!(title = %title, "thread titled");
        Ok(Some(title))
    }

    /// Remove the thread's branch, worktree and sandbox and close it.
    #[instrument(skip_all, fields(thread = %id))]
    pub async fn discard(&self, id: &ThreadId) -> Result<()> {
        self.cancel(id)?;
        self.exclusive(id, self.discard_locked(id)).await
    }

    async fn discard_locked(&self, id: &ThreadId) -> Result<()> {
        let thread = self.services.store.snapshot(id).await?;
        if thread.status == ThreadStatus::Merged {
            debug!("thread already merged, nothing to discard");
            return Ok(());
        }

        self.stop_sandboxes(&thread).await?;
        let handle = self.recorded_handle(&thread)?;
        self.services.domains.discard(&handle).await?;
        self.services
            .store
            .update(id, |t| {
                if t.status != ThreadStatus::Failed {
                    t.fail(FailureReason::Discarded);
                }
                t.worktree = None;
                t.sandbox_id = None;
            })
            .await?;
        self.services.store.evict(id)?;
        info!("thread discarded");
        Ok(())
    }

    /// Stop the thread's live sandbox and any sandbox a crashed turn left behind.
    async fn stop_sandboxes(&self, thread: &Thread) -> Result<()> {
        let sandboxes = &self.services.sandboxes;
        if let Some(sandbox_id) = &thread.sandbox_id {
            sandboxes.teardown_id(&thread.id, sandbox_id).await?;
        }
        sandboxes.teardown_thread(&thread.id).await
    }

    /// Diff of the thread branch against the default branch.
    pub async fn changes(&self, id: &ThreadId) -> Result<Vec<Change>> {
        let thread = self.services.store.snapshot(id).await?;
        if thread.branch.is_none() || thread.status == ThreadStatus::Merged {
            return Ok(Vec::new());
        }
        let handle = self.recorded_handle(&thread)?;
        self.services.domains.changes(&handle).await
    }

    /// Cancel running turns and stop every sandbox.
    pub async fn shutdown(&self) -> Result<()> {
        info!("engine shutting down");
        self.shutdown.cancel();
        self.services.sandboxes.teardown_all().await
    }

    fn recorded_handle(&self, thread: &Thread) -> Result<BranchHandle> {
        let mut handle = self
            .services
            .domains
            .handle_for(&thread.id, &thread.domain)?;
        if let Some(branch) = &thread.branch {
            handle.branch = branch.clone();
        }
        if let Some(worktree) = &thread.worktree {
            handle.worktree = worktree.clone();
        }
        Ok(handle)
    }

    /// Run `work` holding the thread's run lock, then drop the lock entry if
    /// nobody else is waiting on it.
    async fn exclusive<T>(&self, id: &ThreadId, work: impl Future<Output = Result<T>>) -> Result<T> {
        let run_lock = lock(&self.run_locks)?
            .entry(id.clone())
            .or_default()
            .clone();
        let out = {
            let _guard = run_lock.lock().await;
            work.await
        };
        let mut locks = lock(&self.run_locks)?;
        // One reference is the map's, one is `run_lock`.
        if Arc::strong_count(&run_lock) <= 2 {
            locks.remove(id);
        }
        out
    }
}

/// First non-empty line of `text`, cut to `max_chars`.
fn first_line(text: &str, max_chars: usize) -> Option<String> {
    let line = text.lines().map(str::trim).find(|l| !l.is_empty())?;
    Some(line.chars().take(max_chars).collect::<String>().trim_end().to_string())
}

/// User and assistant text of the thread, capped for a side request.
fn conversation_text(thread: &Thread) -> Option<String> {
    let mut out = String::new();
    for message in thread.transcript.messages() {
        let text = match (&message.role, &message.content) {
            (Role::User | Role::Assistant, Content::Text { text }) => text,
            (Role::Assistant, Content::ToolCalls { text, .. }) if !text.is_empty() => text,
            _ => continue,
        };
        out.push_str(&format!("{}: {}\n", message.role.as_str(), text.trim()));
        if out.len() >= TITLE_CONTEXT_BYTES {
            let cut = crate::core::context::floor_char_boundary(&out, TITLE_CONTEXT_BYTES);
            out.truncate(cut);
            break;
        }
    }
    (!out.trim().is_empty()).then_some(out)
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex.lock().map_err(|_| anyhow!("engine lock poisoned"))
}
