//! Deterministic, pure logic shared by the engine.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod branch;
pub mod context;
pub mod retry;
pub mod sanitize;
pub mod transitions;
pub mod types;
