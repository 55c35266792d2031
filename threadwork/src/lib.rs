//! Local-first engine for autonomous, multi-step agent threads.
//!
//! Every thread works on its own git branch, checked out in a dedicated
//! worktree, and runs commands in an isolated container when one is
//! available. The crate keeps a strict split:
//!
//! - **[`core`]**: Pure, deterministic logic (transcript views, branch naming,
//!   status transitions, backoff). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting adapters (git, child processes, config, thread
//!   records, prompt rendering, the model seam).
//!
//! Orchestration modules ([`domain`], [`sandbox`], [`tools`], [`agent`],
//! [`engine`]) combine the two; [`stream`] carries a running turn's events to
//! its client.

pub mod agent;
pub mod core;
pub mod domain;
pub mod engine;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod sandbox;
pub mod stream;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod tools;

pub use engine::{Engine, Turn};
pub use error::EngineError;
