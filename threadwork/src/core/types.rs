//! Shared thread, message and tool types.
//!
//! These types are the persisted contract between the agent loop, the thread
//! store and the client stream. They carry no I/O and must serialize stably.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::context::Transcript;

/// Stable identifier of a thread.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ThreadId(String);

impl ThreadId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Time-ordered id for a fresh thread.
    pub fn generate() -> Self {
        Self(uuid::Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle status of a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadStatus {
    Created,
    Running,
    AwaitingTool,
    Completed,
    Cancelled,
    Failed,
    Merged,
}

impl ThreadStatus {
    /// `failed` and `merged` accept no further turns.
    pub fn is_terminal(self) -> bool {
        matches!(self, ThreadStatus::Failed | ThreadStatus::Merged)
    }

    /// A loop was mid-turn when this status was persisted.
    pub fn is_in_flight(self) -> bool {
        matches!(self, ThreadStatus::Running | ThreadStatus::AwaitingTool)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ThreadStatus::Created => "created",
            ThreadStatus::Running => "running",
            ThreadStatus::AwaitingTool => "awaiting_tool",
            ThreadStatus::Completed => "completed",
            ThreadStatus::Cancelled => "cancelled",
            ThreadStatus::Failed => "failed",
            ThreadStatus::Merged => "merged",
        }
    }
}

impl fmt::Display for ThreadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a thread ended up `failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    StepLimitExceeded { steps: u32 },
    ContextOverflow { required: usize, budget: usize },
    GenerationError { message: String },
    DomainOpen { message: String },
    Internal { message: String },
    /// Closed by an explicit discard.
    Discarded,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::StepLimitExceeded { steps } => {
                write!(f, "step limit exceeded after {steps} steps")
            }
            FailureReason::ContextOverflow { required, budget } => {
                write!(f, "context overflow: need {required} tokens, budget {budget}")
            }
            FailureReason::GenerationError { message } => write!(f, "generation error: {message}"),
            FailureReason::DomainOpen { message } => write!(f, "domain open failed: {message}"),
            FailureReason::Internal { message } => write!(f, "internal error: {message}"),
            FailureReason::Discarded => f.write_str("discarded"),
        }
    }
}

/// Author of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

/// A tool invocation requested by the model. Consumed exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Correlation id linking the call to its result.
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    Ok,
    Error,
}

/// Classification of an error result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorKind {
    InvalidArguments,
    UnknownTool,
    ExecutionFailed,
    Interrupted,
    Cancelled,
}

impl ToolErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ToolErrorKind::InvalidArguments => "invalid_arguments",
            ToolErrorKind::UnknownTool => "unknown_tool",
            ToolErrorKind::ExecutionFailed => "execution_failed",
            ToolErrorKind::Interrupted => "interrupted",
            ToolErrorKind::Cancelled => "cancelled",
        }
    }
}

/// Observation produced for exactly one [`ToolCall`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolResult {
    pub correlation_id: String,
    pub status: ToolStatus,
    /// Payload for `ok`, error detail for `error`.
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ToolErrorKind>,
    /// Byte length of `output`.
    pub size: usize,
}

impl ToolResult {
    pub fn ok(correlation_id: impl Into<String>, output: impl Into<String>) -> Self {
        let output = output.into();
        Self {
            correlation_id: correlation_id.into(),
            status: ToolStatus::Ok,
            size: output.len(),
            output,
            error_kind: None,
        }
    }

    pub fn error(
        correlation_id: impl Into<String>,
        kind: ToolErrorKind,
        detail: impl Into<String>,
    ) -> Self {
        let output = detail.into();
        Self {
            correlation_id: correlation_id.into(),
            status: ToolStatus::Error,
            size: output.len(),
            output,
            error_kind: Some(kind),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == ToolStatus::Ok
    }
}

/// Message body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Content {
    Text { text: String },
    ToolCalls { text: String, calls: Vec<ToolCall> },
    ToolResult { result: ToolResult },
}

/// One entry of the append-only thread log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Content,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Self::text(Role::System, text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::text(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::text(Role::Assistant, text)
    }

    fn text(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: Content::Text { text: text.into() },
            correlation_id: None,
        }
    }

    pub fn tool_calls(text: impl Into<String>, calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content: Content::ToolCalls {
                text: text.into(),
                calls,
            },
            correlation_id: None,
        }
    }

    pub fn tool_result(result: ToolResult) -> Self {
        Self {
            role: Role::Tool,
            correlation_id: Some(result.correlation_id.clone()),
            content: Content::ToolResult { result },
        }
    }

    /// Calls carried by an assistant message, empty otherwise.
    pub fn calls(&self) -> &[ToolCall] {
        match &self.content {
            Content::ToolCalls { calls, .. } => calls,
            _ => &[],
        }
    }

    pub fn as_tool_result(&self) -> Option<&ToolResult> {
        match &self.content {
            Content::ToolResult { result } => Some(result),
            _ => None,
        }
    }

    /// Human readable text of the message body.
    pub fn text_content(&self) -> &str {
        match &self.content {
            Content::Text { text } | Content::ToolCalls { text, .. } => text,
            Content::ToolResult { result } => &result.output,
        }
    }
}

/// A persisted agent session.
/// Id of a commit in a domain repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommitId(pub String);

impl fmt::Display for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How merging a thread branch ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MergeOutcome {
    FastForward { commit: CommitId },
    Merged { commit: CommitId },
    Conflict { paths: Vec<String> },
}

impl MergeOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, MergeOutcome::Conflict { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thread {
    pub id: ThreadId,
    /// Name of the configured domain this thread works against.
    pub domain: String,
    /// Short description, generated on request and cached.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub worktree: Option<PathBuf>,
    #[serde(default)]
    pub sandbox_id: Option<String>,
    /// Set once sandbox provisioning degraded to direct execution.
    #[serde(default)]
    pub unsandboxed: bool,
    pub status: ThreadStatus,
    #[serde(default)]
    pub failure: Option<FailureReason>,
    /// Outcome of the merge that closed the thread; replayed on repeat requests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge: Option<MergeOutcome>,
    pub transcript: Transcript,
    /// Model calls made so far.
    pub steps: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Thread {
    pub fn new(id: ThreadId, domain: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            domain: domain.into(),
            title: None,
            branch: None,
            worktree: None,
            sandbox_id: None,
            unsandboxed: false,
            status: ThreadStatus::Created,
            failure: None,
            merge: None,
            transcript: Transcript::default(),
            steps: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Move to `failed` and record why.
    pub fn fail(&mut self, reason: FailureReason) {
        self.status = ThreadStatus::Failed;
        self.failure = Some(reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_result_records_output_size() {
        let result = ToolResult::ok("c1", "hello");
        assert_eq!(result.size, 5);
        assert!(result.is_ok());

        let err = ToolResult::error("c2", ToolErrorKind::InvalidArguments, "missing path");
        assert_eq!(err.status, ToolStatus::Error);
        assert_eq!(err.error_kind, Some(ToolErrorKind::InvalidArguments));
    }

    #[test]
    fn tool_result_message_carries_correlation_id() {
        let msg = Message::tool_result(ToolResult::ok("call-7", "x"));
        assert_eq!(msg.role, Role::Tool);
        assert_eq!(msg.correlation_id.as_deref(), Some("call-7"));
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&ThreadStatus::AwaitingTool).expect("serialize");
        assert_eq!(json, "\"awaiting_tool\"");
        assert!(ThreadStatus::Merged.is_terminal());
        assert!(!ThreadStatus::Completed.is_terminal());
    }
}
