//! Stable exit codes for `threadwork` CLI commands.

/// Command succeeded.
pub const OK: i32 = 0;
/// Invalid config, unknown thread, or any other error.
pub const INVALID: i32 = 1;
/// `threadwork merge` hit a conflict; the thread branch was kept.
pub const CONFLICT: i32 = 2;
/// The thread is closed (merged or failed) and the command does not apply.
pub const CLOSED: i32 = 3;
