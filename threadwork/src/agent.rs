//! The reasoning/acting loop for one turn of a thread.
//!
//! ```text
//! Idle -> Thinking -> Replying -> Done
//!            ^  \
//!            |   -> ActingTools
//!            +-------/
//! ```
//!
//! Every append and status change is persisted through the thread store
//! before the loop moves on, so a crash leaves a record that `resume` can
//! repair. The branch and sandbox are acquired on the first tool call that
//! needs them.

use std::borrow::Cow;
use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::core::context::{ContextOverflow, ContextWindow, estimate_tokens};
use crate::core::retry::backoff_delay;
use crate::core::sanitize::sanitize_view;
use crate::core::types::{
    FailureReason, Message, ThreadId, ThreadStatus, ToolCall, ToolErrorKind, ToolResult,
};
use crate::domain::{BranchHandle, CommitOutcome, DomainManager};
use crate::error::{EngineError, GenerationError};
use crate::io::config::EngineConfig;
use crate::io::model::{GenerationEvent, ModelClient, ToolDeclaration};
use crate::io::prompt::{PromptEngine, PromptInputs};
use crate::io::thread_store::ThreadStore;
use crate::sandbox::{Provision, SandboxHandle, SandboxManager};
use crate::stream::{StreamEvent, StreamSink};
use crate::tools::{ExecTarget, ToolContext, ToolRegistry};

/// From this attempt on, retried requests also get large tool outputs cut.
const AGGRESSIVE_SANITIZE_ATTEMPT: u32 = 3;

/// Process-wide components shared by every loop.
pub struct Services {
    pub config: EngineConfig,
    pub store: ThreadStore,
    pub domains: DomainManager,
    pub sandboxes: Arc<SandboxManager>,
    pub tools: ToolRegistry,
    pub model: Arc<dyn ModelClient>,
    pub prompts: PromptEngine,
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services")
            .field("store", &self.store)
            .field("tools", &self.tools)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Thinking,
    ActingTools,
    Replying,
    Done,
    Failed,
    Cancelled,
}

/// Result of a turn that ended normally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnOutcome {
    pub status: ThreadStatus,
    /// Final assistant text.
    pub reply: String,
    /// Model calls made in this turn.
    pub steps: u32,
}

/// How `run_steps` ended.
enum Exit {
    Completed(String),
    Cancelled,
    Failed(FailureReason, EngineError),
}

struct Reply {
    text: String,
    calls: Vec<ToolCall>,
}

pub struct AgentLoop<'a> {
    services: &'a Services,
    thread_id: ThreadId,
    sink: StreamSink,
    cancel: CancellationToken,
    window: ContextWindow,
    state: LoopState,
    turn_steps: u32,
    branch: Option<BranchHandle>,
    sandbox: Option<SandboxHandle>,
    unsandboxed: bool,
}

impl<'a> AgentLoop<'a> {
    pub fn new(
        services: &'a Services,
        thread_id: ThreadId,
        sink: StreamSink,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            window: ContextWindow::new(services.config.tool_preview_bytes),
            services,
            thread_id,
            sink,
            cancel,
            state: LoopState::Idle,
            turn_steps: 0,
            branch: None,
            sandbox: None,
            unsandboxed: false,
        }
    }

    /// Run one turn, optionally starting with a new user message.
    ///
    /// A thread left mid-turn by a crash first gets `interrupted` results for
    /// its unanswered calls. Fatal conditions mark the thread `failed` and are
    /// returned as [`EngineError`].
    #[instrument(skip_all, fields(thread = %self.thread_id))]
    pub async fn run_turn(&mut self, user_text: Option<String>) -> Result<TurnOutcome> {
        let thread = self.services.store.snapshot(&self.thread_id).await?;
        if thread.status.is_terminal() {
            return Err(EngineError::ThreadClosed {
                id: self.thread_id.clone(),
                status: thread.status,
            }
            .into());
        }
        self.unsandboxed = thread.unsandboxed;

        let interrupted = thread.status.is_in_flight();
        self.services
            .store
            .update(&self.thread_id, |t| {
                if interrupted {
                    for call in t.transcript.unresolved_calls() {
                        t.transcript.append(Message::tool_result(ToolResult::error(
                            &call.id,
                            ToolErrorKind::Interrupted,
                            "the engine stopped before this call finished; it may be retried",
                        )));
                    }
                }
                if let Some(text) = &user_text {
                    t.transcript.append(Message::user(text));
                }
                t.status = ThreadStatus::Running;
            })
            .await?;
        if interrupted {
            info!("resuming interrupted turn");
            if let Some(id) = &thread.sandbox_id {
                self.stop_leftover_sandbox(id).await?;
            }
        }

        let exit = self.run_steps().await;
        self.release_sandbox().await;
        match exit {
            Ok(Exit::Completed(reply)) => {
                self.enter(LoopState::Done);
                self.sink.emit(StreamEvent::Done {
                    status: ThreadStatus::Completed,
                });
                Ok(TurnOutcome {
                    status: ThreadStatus::Completed,
                    reply,
                    steps: self.turn_steps,
                })
            }
            Ok(Exit::Cancelled) => {
                self.enter(LoopState::Cancelled);
                self.services
                    .store
                    .update(&self.thread_id, |t| t.status = ThreadStatus::Cancelled)
                    .await?;
                info!("turn cancelled");
                self.sink.emit(StreamEvent::Done {
                    status: ThreadStatus::Cancelled,
                });
                Err(EngineError::Cancelled.into())
            }
            Ok(Exit::Failed(reason, err)) => {
                self.record_failure(reason, &err.to_string()).await?;
                Err(err.into())
            }
            Err(err) => {
                let reason = FailureReason::Internal {
                    message: format!("{err:#}"),
                };
                if let Err(store_err) = self.record_failure(reason, &format!("{err:#}")).await {
                    warn!(err = %store_err, "could not record failure");
                }
                Err(err)
            }
        }
    }

    async fn record_failure(&mut self, reason: FailureReason, message: &str) -> Result<()> {
        self.enter(LoopState::Failed);
        warn!(reason = %reason, "thread failed");
        let result = self
            .services
            .store
            .update(&self.thread_id, |t| t.fail(reason))
            .await;
        self.sink.emit(StreamEvent::Error {
            message: message.to_string(),
        });
        result
    }

    async fn run_steps(&mut self) -> Result<Exit> {
        let services = self.services;
        let config = &services.config;
        loop {
            if self.cancel.is_cancelled() {
                return Ok(Exit::Cancelled);
            }
            if self.turn_steps >= config.max_steps {
                return Ok(Exit::Failed(
                    FailureReason::StepLimitExceeded {
                        steps: self.turn_steps,
                    },
                    EngineError::StepLimitExceeded {
                        limit: config.max_steps,
                    },
                ));
            }

            self.enter(LoopState::Thinking);
            let view = match self.build_view().await? {
                Ok(view) => view,
                Err(overflow) => {
                    return Ok(Exit::Failed(
                        FailureReason::ContextOverflow {
                            required: overflow.required,
                            budget: overflow.budget,
                        },
                        EngineError::ContextOverflow(overflow),
                    ));
                }
            };

            let declarations = services.tools.declarations();
            let reply = match self.generate(&view, &declarations).await {
                Ok(Some(reply)) => reply,
                Ok(None) => return Ok(Exit::Cancelled),
                Err(err) => {
                    let attempts = config.generation.max_retries + 1;
                    let message = format!("{err:#}");
                    return Ok(Exit::Failed(
                        FailureReason::GenerationError {
                            message: message.clone(),
                        },
                        EngineError::Generation { attempts, message },
                    ));
                }
            };
            self.turn_steps += 1;

            if reply.calls.is_empty() {
                self.enter(LoopState::Replying);
                let text = reply.text.clone();
                self.services
                    .store
                    .update(&self.thread_id, |t| {
                        t.steps += 1;
                        t.transcript.append(Message::assistant(text));
                        t.status = ThreadStatus::Completed;
                    })
                    .await?;
                return Ok(Exit::Completed(reply.text));
            }

            let text = reply.text;
            let calls = self
                .services
                .store
                .update(&self.thread_id, |t| {
                    t.steps += 1;
                    let calls = normalize_call_ids(
                        reply.calls,
                        &t.transcript.correlation_ids(),
                        t.steps,
                    );
                    t.transcript.append(Message::tool_calls(text, calls.clone()));
                    t.status = ThreadStatus::AwaitingTool;
                    calls
                })
                .await?;
            for call in &calls {
                self.sink.emit(StreamEvent::ToolStarted { call: call.clone() });
            }

            self.enter(LoopState::ActingTools);
            let needs_workspace = calls.iter().any(|call| {
                self.services
                    .tools
                    .resolve(&call.name)
                    .is_some_and(|kind| kind.requirement().needs_workspace())
            });
            if needs_workspace && let Err(err) = self.ensure_workspace().await {
                let message = format!("{err:#}");
                let engine_err = match err.downcast::<EngineError>() {
                    Ok(engine_err) => engine_err,
                    Err(_) => EngineError::DomainOpen(message.clone()),
                };
                return Ok(Exit::Failed(FailureReason::DomainOpen { message }, engine_err));
            }

            let (results, cancelled) = self.dispatch_all(&calls).await?;
            {
                let results = results.clone();
                self.services
                    .store
                    .update(&self.thread_id, |t| {
                        for result in results {
                            t.transcript.append(Message::tool_result(result));
                        }
                        t.status = ThreadStatus::Running;
                    })
                    .await?;
            }
            for result in &results {
                self.sink.emit(StreamEvent::tool_finished(result));
            }

            if needs_workspace {
                self.commit_step().await?;
            }
            if cancelled {
                return Ok(Exit::Cancelled);
            }
        }
    }

    /// System prompt plus the bounded view of the transcript.
    async fn build_view(
        &self,
    ) -> Result<std::result::Result<Vec<Message>, ContextOverflow>> {
        let thread = self.services.store.snapshot(&self.thread_id).await?;
        let domain = self.services.domains.domain(&thread.domain)?;
        let kinds = self.services.tools.kinds();
        let workspace = match (&self.sandbox, &self.branch) {
            (Some(sandbox), _) => sandbox.workspace.clone(),
            (None, Some(branch)) => branch.worktree.display().to_string(),
            (None, None) => ".".to_string(),
        };
        let prompt = self.services.prompts.render_system(&PromptInputs {
            domain: &domain.name,
            default_branch: &domain.default_branch,
            branch: thread.branch.as_deref(),
            sandboxed: self.services.config.sandbox.enabled && !self.unsandboxed,
            workspace: &workspace,
            tools: &kinds,
        })?;
        let system = Message::system(prompt);
        let system_cost = estimate_tokens(&system);
        let budget = self.services.config.context_budget_tokens;

        let view = self
            .window
            .view(&thread.transcript, budget.saturating_sub(system_cost))
            .map(|mut view| {
                view.insert(0, system);
                view
            })
            .map_err(|mut overflow| {
                overflow.required += system_cost;
                overflow.budget = budget;
                overflow
            });
        Ok(view)
    }

    /// Call the model with retries. `Ok(None)` means the turn was cancelled.
    ///
    /// Text is streamed as it arrives. Before a retry, text already sent for
    /// the failed attempt is voided with a `Retry` event, and the request is
    /// resent with control characters stripped.
    async fn generate(
        &self,
        view: &[Message],
        declarations: &[ToolDeclaration],
    ) -> Result<Option<Reply>> {
        let generation = &self.services.config.generation;
        let mut request = Cow::Borrowed(view);
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let mut streamed = 0;
            let outcome = tokio::select! {
                () = self.cancel.cancelled() => return Ok(None),
                outcome = self.generate_once(&request, declarations, &mut streamed) => outcome,
            };
            match outcome {
                Ok(reply) => return Ok(Some(reply)),
                Err(err) if attempt <= generation.max_retries => {
                    let delay = backoff_delay(attempt, generation.backoff());
                    warn!(attempt, delay_ms = delay.as_millis() as u64, err = %err, "generation failed, retrying");
                    if streamed > 0 {
                        self.sink.emit(StreamEvent::Retry {
                            attempt: attempt + 1,
                            discard_bytes: streamed,
                        });
                    }
                    let aggressive = attempt + 1 >= AGGRESSIVE_SANITIZE_ATTEMPT;
                    request = Cow::Owned(sanitize_view(view, aggressive));
                    tokio::select! {
                        () = self.cancel.cancelled() => return Ok(None),
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// One attempt. `streamed` counts the text bytes emitted so far.
    async fn generate_once(
        &self,
        view: &[Message],
        declarations: &[ToolDeclaration],
        streamed: &mut usize,
    ) -> Result<Reply> {
        let mut stream = self
            .services
            .model
            .generate(view, declarations)
            .await
            .context("start generation")?;
        let mut reply = Reply {
            text: String::new(),
            calls: Vec::new(),
        };
        while let Some(event) = stream.next().await {
            match event? {
                GenerationEvent::TextDelta(delta) => {
                    if delta.is_empty() {
                        continue;
                    }
                    *streamed += delta.len();
                    reply.text.push_str(&delta);
                    self.sink.emit(StreamEvent::Delta { text: delta });
                }
                GenerationEvent::ToolCall(call) => reply.calls.push(call),
                GenerationEvent::Finished => {
                    debug!(calls = reply.calls.len(), "generation finished");
                    return Ok(reply);
                }
            }
        }
        Err(GenerationError("stream ended before the reply finished".to_string()).into())
    }

    /// Open the branch and provision the sandbox if not done yet this turn.
    async fn ensure_workspace(&mut self) -> Result<()> {
        if self.branch.is_none() {
            let thread = self.services.store.snapshot(&self.thread_id).await?;
            let handle = self
                .services
                .domains
                .open(&self.thread_id, &thread.domain)
                .await?;
            let (branch, worktree) = (handle.branch.clone(), handle.worktree.clone());
            self.services
                .store
                .update(&self.thread_id, |t| {
                    t.branch = Some(branch);
                    t.worktree = Some(worktree);
                })
                .await?;
            self.branch = Some(handle);
        }

        if self.sandbox.is_some() || self.unsandboxed {
            return Ok(());
        }
        let worktree = self
            .branch
            .as_ref()
            .map(|b| b.worktree.clone())
            .ok_or_else(|| anyhow!("branch missing after open"))?;
        if !self.services.config.sandbox.enabled {
            debug!("sandbox disabled, running in worktree");
            self.mark_unsandboxed().await?;
            return Ok(());
        }
        match self
            .services
            .sandboxes
            .provision(&self.thread_id, worktree)
            .await?
        {
            Provision::Ready(handle) => {
                let id = handle.id.clone();
                self.services
                    .store
                    .update(&self.thread_id, |t| t.sandbox_id = Some(id))
                    .await?;
                self.sandbox = Some(handle);
            }
            Provision::Unavailable(reason) => {
                warn!(reason = %reason, "sandbox unavailable, running unsandboxed");
                self.mark_unsandboxed().await?;
            }
        }
        Ok(())
    }

    async fn mark_unsandboxed(&mut self) -> Result<()> {
        self.unsandboxed = true;
        self.services
            .store
            .update(&self.thread_id, |t| {
                t.unsandboxed = true;
                t.sandbox_id = None;
            })
            .await
    }

    /// Run all calls concurrently; results come back in call order.
    ///
    /// On cancellation, calls still running get the grace period to finish;
    /// the rest are reported as cancelled. Returns whether the turn was
    /// cancelled.
    async fn dispatch_all(&self, calls: &[ToolCall]) -> Result<(Vec<ToolResult>, bool)> {
        let thread = self.services.store.snapshot(&self.thread_id).await?;
        let target = match (&self.sandbox, &self.branch) {
            (Some(handle), _) => ExecTarget::Sandbox {
                manager: self.services.sandboxes.clone(),
                handle: handle.clone(),
            },
            (None, Some(branch)) => ExecTarget::Host {
                root: branch.worktree.clone(),
            },
            (None, None) => ExecTarget::Detached,
        };
        let ctx = ToolContext {
            target,
            transcript: &thread.transcript,
            exec_timeout: self.services.config.exec_timeout(),
            output_limit_bytes: self.services.config.exec_output_limit_bytes,
        };

        let tools = &self.services.tools;
        let ctx = &ctx;
        let mut pending: FuturesUnordered<_> = calls
            .iter()
            .enumerate()
            .map(|(idx, call)| async move { (idx, tools.dispatch(call, ctx).await) })
            .collect();
        let mut slots: Vec<Option<ToolResult>> = vec![None; calls.len()];

        let mut cancelled = false;
        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
                next = pending.next() => match next {
                    Some((idx, result)) => slots[idx] = Some(result),
                    None => break,
                },
            }
        }
        if cancelled {
            let grace = self.services.config.cancel_grace();
            debug!(grace_secs = grace.as_secs(), "cancelled, waiting for in-flight calls");
            let drain = async {
                while let Some((idx, result)) = pending.next().await {
                    slots[idx] = Some(result);
                }
            };
            if tokio::time::timeout(grace, drain).await.is_err() {
                warn!("in-flight tool calls did not finish within grace period");
            }
        }

        let results = calls
            .iter()
            .zip(slots)
            .map(|(call, slot)| {
                slot.unwrap_or_else(|| {
                    ToolResult::error(
                        &call.id,
                        ToolErrorKind::Cancelled,
                        "the turn was cancelled before this call finished",
                    )
                })
            })
            .collect();
        Ok((results, cancelled))
    }

    async fn commit_step(&self) -> Result<()> {
        let Some(branch) = &self.branch else {
            return Ok(());
        };
        let message = format!("thread {}: step {}", self.thread_id, self.turn_steps);
        match self.services.domains.commit(branch, &message).await? {
            CommitOutcome::Committed(commit) => debug!(commit = %commit, "step committed"),
            CommitOutcome::NothingToCommit => {}
        }
        Ok(())
    }

    async fn release_sandbox(&mut self) {
        let Some(handle) = self.sandbox.take() else {
            return;
        };
        if let Err(err) = self.services.sandboxes.teardown(&handle).await {
            warn!(sandbox = %handle.id, err = %err, "sandbox teardown failed");
            return;
        }
        let cleared = self
            .services
            .store
            .update(&self.thread_id, |t| {
                if t.sandbox_id.as_deref() == Some(handle.id.as_str()) {
                    t.sandbox_id = None;
                }
            })
            .await;
        if let Err(err) = cleared {
            warn!(sandbox = %handle.id, err = %err, "could not clear sandbox id");
        }
    }

    /// Stop a sandbox recorded by a turn that never finished.
    async fn stop_leftover_sandbox(&self, id: &str) -> Result<()> {
        match self.services.sandboxes.teardown_id(&self.thread_id, id).await {
            Ok(()) => {
                self.services
                    .store
                    .update(&self.thread_id, |t| t.sandbox_id = None)
                    .await
            }
            Err(err) => {
                warn!(sandbox = %id, err = %err, "leftover sandbox could not be stopped");
                Ok(())
            }
        }
    }

    fn enter(&mut self, next: LoopState) {
        if self.state != next {
            debug!(from = ?self.state, to = ?next, "loop state");
            self.state = next;
        }
    }
}

/// Give every call a correlation id that is non-empty and unused in the
/// thread. `taken` holds the ids already in the transcript; `step` is the
/// thread's cumulative step count.
fn normalize_call_ids(calls: Vec<ToolCall>, taken: &HashSet<&str>, step: u32) -> Vec<ToolCall> {
    let mut seen: HashSet<String> = HashSet::new();
    let is_free =
        |id: &str, seen: &HashSet<String>| !taken.contains(id) && !seen.contains(id);
    calls
        .into_iter()
        .enumerate()
        .map(|(idx, mut call)| {
            if call.id.trim().is_empty() || !is_free(&call.id, &seen) {
                let base = format!("call-{step}-{idx}");
                let mut id = base.clone();
                let mut n = 1;
                while !is_free(&id, &seen) {
                    id = format!("{base}-{n}");
                    n += 1;
                }
                call.id = id;
            }
            seen.insert(call.id.clone());
            call
        })
        .collect()
}
