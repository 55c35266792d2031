//! I/O adapters: git, child processes, configuration, persistence, prompts
//! and the model seam.

pub mod config;
pub mod git;
pub mod model;
pub mod process;
pub mod prompt;
pub mod thread_store;
