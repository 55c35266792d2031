//! Error taxonomy for thread execution.
//!
//! Plumbing errors travel as `anyhow::Error`. The variants here are the ones
//! callers branch on; recover them with `err.downcast_ref::<EngineError>()`.
//! Recoverable conditions (merge conflicts, sandbox unavailability, tool
//! failures) are returned as values and never appear here as errors.

use thiserror::Error;

use crate::core::context::ContextOverflow;
use crate::core::types::{ThreadId, ThreadStatus};

#[derive(Debug, Error)]
pub enum EngineError {
    /// The derived branch is owned by another open thread.
    #[error("branch '{branch}' is owned by open thread {owner}")]
    DomainConflict { branch: String, owner: ThreadId },

    /// The thread's branch or worktree could not be opened.
    #[error("domain open failed: {0}")]
    DomainOpen(String),

    /// The view could not be reduced under the context budget.
    #[error(transparent)]
    ContextOverflow(#[from] ContextOverflow),

    /// The step limit was reached before a final reply.
    #[error("step limit of {limit} reached without a final reply")]
    StepLimitExceeded { limit: u32 },

    /// Model generation kept failing after retries.
    #[error("generation failed after {attempts} attempts: {message}")]
    Generation { attempts: u32, message: String },

    /// The turn was cancelled by the caller.
    #[error("turn cancelled")]
    Cancelled,

    #[error("thread {0} not found")]
    ThreadNotFound(ThreadId),

    /// Thread creation could not pick a domain.
    #[error("{0}")]
    DomainSelection(String),

    /// The thread no longer accepts turns.
    #[error("thread {id} is {status}")]
    ThreadClosed { id: ThreadId, status: ThreadStatus },
}

/// Single-attempt failure of the model stream; retried by the agent loop.
#[derive(Debug, Error)]
#[error("generation error: {0}")]
pub struct GenerationError(pub String);
