//! Deterministic branch names for threads.

use anyhow::{Result, anyhow};
use sha2::{Digest, Sha256};

use crate::core::types::ThreadId;

/// Namespace under which every thread branch lives.
pub const BRANCH_PREFIX: &str = "thread/";

/// Hex digits of the id hash appended to sanitized names.
const HASH_SUFFIX_LEN: usize = 12;

/// Derive the branch name owned by `thread_id`.
///
/// Ids made only of `[A-Za-z0-9_-]` map to `thread/<id>` verbatim, so distinct
/// ids give distinct names. Any other id is sanitized and suffixed with a
/// hash of the original id, which keeps the mapping injective in practice
/// while producing a valid ref name.
pub fn branch_name(thread_id: &ThreadId) -> Result<String> {
    let id = thread_id.as_str();
    if id.is_empty() {
        return Err(anyhow!("thread id must not be empty"));
    }
    if id.chars().all(is_ref_safe) && !id.starts_with('-') {
        return Ok(format!("{BRANCH_PREFIX}{id}"));
    }

    let mut sanitized = String::with_capacity(id.len());
    for ch in id.chars() {
        let ch = if is_ref_safe(ch) { ch } else { '-' };
        if ch == '-' && sanitized.ends_with('-') {
            continue;
        }
        sanitized.push(ch);
    }
    let sanitized = sanitized.trim_matches('-');
    let digest = hex::encode(Sha256::digest(id.as_bytes()));
    let hash = &digest[..HASH_SUFFIX_LEN];
    if sanitized.is_empty() {
        return Ok(format!("{BRANCH_PREFIX}{hash}"));
    }
    Ok(format!("{BRANCH_PREFIX}{sanitized}-h{hash}"))
}

/// Directory-safe form of a branch name (for worktree paths).
pub fn worktree_dir_name(branch: &str) -> String {
    branch.replace('/', "__")
}

fn is_ref_safe(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || ch == '_' || ch == '-'
}
