//! Per-thread branches and worktrees in configured git repositories.
//!
//! Each thread writes to its own branch, checked out in a dedicated worktree
//! so threads never share a working directory. The domain's primary checkout
//! is only touched by merges, which are serialized per domain.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::core::branch::{branch_name, worktree_dir_name};
pub use crate::core::types::{CommitId, MergeOutcome};

use crate::core::types::ThreadId;
use crate::error::EngineError;
use crate::io::config::DomainConfig;
use crate::io::git::{Change, Git, MergeAttempt};

/// A thread's opened branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchHandle {
    pub thread_id: ThreadId,
    pub domain: String,
    pub branch: String,
    pub worktree: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed(CommitId),
    NothingToCommit,
}

#[derive(Debug)]
struct DomainState {
    config: DomainConfig,
    worktree_root: PathBuf,
    merge_lock: tokio::sync::Mutex<()>,
}

type BranchKey = (String, String);

/// Owns branch/worktree bookkeeping for every configured domain.
#[derive(Debug)]
pub struct DomainManager {
    domains: HashMap<String, Arc<DomainState>>,
    owners: Mutex<HashMap<BranchKey, ThreadId>>,
    branch_locks: Mutex<HashMap<BranchKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl DomainManager {
    pub fn new(domains: &[DomainConfig], data_dir: &std::path::Path) -> Self {
        let domains = domains
            .iter()
            .map(|config| {
                let state = DomainState {
                    worktree_root: config.resolved_worktree_root(data_dir),
                    config: config.clone(),
                    merge_lock: tokio::sync::Mutex::new(()),
                };
                (config.name.clone(), Arc::new(state))
            })
            .collect();
        Self {
            domains,
            owners: Mutex::new(HashMap::new()),
            branch_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn domain(&self, name: &str) -> Result<&DomainConfig> {
        Ok(&self.state(name)?.config)
    }

    /// Open (or reattach to) the thread's branch and worktree.
    #[instrument(skip_all, fields(thread = %thread_id, domain = %domain))]
    pub async fn open(&self, thread_id: &ThreadId, domain: &str) -> Result<BranchHandle> {
        let state = self.state(domain)?.clone();
        let branch = branch_name(thread_id)?;
        let key = (domain.to_string(), branch.clone());

        let newly_owned = {
            let mut owners = lock(&self.owners)?;
            match owners.get(&key) {
                Some(owner) if owner != thread_id => {
                    warn!(branch = %branch, owner = %owner, "branch owned by another thread");
                    return Err(EngineError::DomainConflict {
                        branch,
                        owner: owner.clone(),
                    }
                    .into());
                }
                Some(_) => false,
                None => {
                    owners.insert(key.clone(), thread_id.clone());
                    true
                }
            }
        };

        let branch_lock = self.branch_lock(&key)?;
        let _guard = branch_lock.lock().await;

        let worktree = state
            .worktree_root
            .join(worktree_dir_name(&branch));
        let result = {
            let state = state.clone();
            let branch = branch.clone();
            let worktree = worktree.clone();
            blocking(move || attach_worktree(&state, &branch, &worktree)).await
        };
        let worktree = match result {
            Ok(path) => path,
            Err(err) => {
                if newly_owned {
                    lock(&self.owners)?.remove(&key);
                }
                return Err(err);
            }
        };

        info!(branch = %branch, worktree = %worktree.display(), "domain opened");
        Ok(BranchHandle {
            thread_id: thread_id.clone(),
            domain: domain.to_string(),
            branch,
            worktree,
        })
    }

    /// Handle with the derived branch and worktree names, without touching git.
    pub fn handle_for(&self, thread_id: &ThreadId, domain: &str) -> Result<BranchHandle> {
        let state = self.state(domain)?;
        let branch = branch_name(thread_id)?;
        let worktree = state.worktree_root.join(worktree_dir_name(&branch));
        Ok(BranchHandle {
            thread_id: thread_id.clone(),
            domain: domain.to_string(),
            branch,
            worktree,
        })
    }

    /// Stage and commit everything in the worktree.
    #[instrument(skip_all, fields(branch = %handle.branch))]
    pub async fn commit(&self, handle: &BranchHandle, message: &str) -> Result<CommitOutcome> {
        let branch_lock = self.branch_lock(&key_of(handle))?;
        let _guard = branch_lock.lock().await;
        let worktree = handle.worktree.clone();
        let message = message.to_string();
        let outcome = blocking(move || {
            let git = Git::new(worktree);
            git.add_all()?;
            if !git.commit_staged(&message)? {
                return Ok(CommitOutcome::NothingToCommit);
            }
            Ok(CommitOutcome::Committed(CommitId(git.rev_parse("HEAD")?)))
        })
        .await?;
        match &outcome {
            CommitOutcome::Committed(id) => debug!(commit = %id, "turn committed"),
            CommitOutcome::NothingToCommit => debug!("nothing to commit"),
        }
        Ok(outcome)
    }

    /// Merge the thread branch into `target` (the default branch when `None`).
    ///
    /// `message` is used when git has to create a merge commit. Conflicts
    /// abort the merge and keep the branch. A successful merge removes the
    /// worktree and branch; callers record the outcome to answer repeats.
    #[instrument(skip_all, fields(branch = %handle.branch))]
    pub async fn merge(
        &self,
        handle: &BranchHandle,
        target: Option<&str>,
        message: &str,
    ) -> Result<MergeOutcome> {
        let key = key_of(handle);
        let state = self.state(&handle.domain)?.clone();
        let branch_lock = self.branch_lock(&key)?;
        let outcome = {
            let _branch_guard = branch_lock.lock().await;
            let _merge_guard = state.merge_lock.lock().await;
            let target = target
                .unwrap_or(&state.config.default_branch)
                .to_string();
            let handle = handle.clone();
            let message = message.to_string();
            let state = state.clone();
            blocking(move || merge_branch(&state, &handle, &target, &message)).await?
        };

        match &outcome {
            MergeOutcome::Conflict { paths } => {
                warn!(conflicts = paths.len(), "merge conflict, branch retained");
            }
            MergeOutcome::FastForward { commit } | MergeOutcome::Merged { commit } => {
                info!(commit = %commit, "thread branch merged");
                lock(&self.owners)?.remove(&key);
                self.release_branch_lock(&key, branch_lock)?;
            }
        }
        Ok(outcome)
    }

    /// Recent one-line commit subjects on the domain's default branch.
    pub async fn base_log(&self, domain: &str, limit: usize) -> Result<String> {
        let state = self.state(domain)?.clone();
        blocking(move || {
            Git::new(&state.config.path).log_oneline(&state.config.default_branch, limit)
        })
        .await
    }

    /// Whether merging the thread branch would be a fast-forward.
    pub async fn can_fast_forward(&self, handle: &BranchHandle) -> Result<bool> {
        let state = self.state(&handle.domain)?.clone();
        let branch = handle.branch.clone();
        blocking(move || {
            Git::new(&state.config.path).is_ancestor(&state.config.default_branch, &branch)
        })
        .await
    }

    /// Remove the worktree and branch without merging. Idempotent.
    #[instrument(skip_all, fields(branch = %handle.branch))]
    pub async fn discard(&self, handle: &BranchHandle) -> Result<()> {
        let key = key_of(handle);
        let state = self.state(&handle.domain)?.clone();
        let branch_lock = self.branch_lock(&key)?;
        {
            let _guard = branch_lock.lock().await;
            let handle = handle.clone();
            blocking(move || remove_branch(&state, &handle)).await?;
        }
        lock(&self.owners)?.remove(&key);
        self.release_branch_lock(&key, branch_lock)?;
        info!("thread branch discarded");
        Ok(())
    }

    /// Per-file diff of the thread branch against the default branch.
    pub async fn changes(&self, handle: &BranchHandle) -> Result<Vec<Change>> {
        let state = self.state(&handle.domain)?.clone();
        let handle = handle.clone();
        blocking(move || {
            let base = &state.config.default_branch;
            if handle.worktree.exists() {
                Git::new(&handle.worktree).changes_against(base, &handle.branch, true)
            } else {
                Git::new(&state.config.path).changes_against(base, &handle.branch, false)
            }
        })
        .await
    }

    fn state(&self, name: &str) -> Result<&Arc<DomainState>> {
        self.domains
            .get(name)
            .ok_or_else(|| anyhow!("unknown domain '{name}'"))
    }

    fn branch_lock(&self, key: &BranchKey) -> Result<Arc<tokio::sync::Mutex<()>>> {
        Ok(lock(&self.branch_locks)?
            .entry(key.clone())
            .or_default()
            .clone())
    }

    /// Forget the lock of a closed branch unless another caller holds or awaits it.
    fn release_branch_lock(
        &self,
        key: &BranchKey,
        held: Arc<tokio::sync::Mutex<()>>,
    ) -> Result<()> {
        let mut locks = lock(&self.branch_locks)?;
        // One reference is the map's, one is `held`.
        if Arc::strong_count(&held) <= 2 {
            locks.remove(key);
        }
        Ok(())
    }
}

fn key_of(handle: &BranchHandle) -> BranchKey {
    (handle.domain.clone(), handle.branch.clone())
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex.lock().map_err(|_| anyhow!("domain bookkeeping lock poisoned"))
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .context("join git task")?
}

fn attach_worktree(state: &DomainState, branch: &str, worktree: &std::path::Path) -> Result<PathBuf> {
    let primary = Git::new(&state.config.path);
    if !primary.is_repo() {
        return Err(anyhow!(
            "domain '{}' path {} is not a git repository",
            state.config.name,
            state.config.path.display()
        ));
    }
    if let Some(existing) = primary.worktree_for_branch(branch)? {
        if existing.exists() {
            debug!(worktree = %existing.display(), "reattaching to worktree");
            return Ok(existing);
        }
        primary.worktree_remove(&existing)?;
    }
    std::fs::create_dir_all(&state.worktree_root)
        .with_context(|| format!("create worktree root {}", state.worktree_root.display()))?;
    if primary.branch_exists(branch)? {
        primary.worktree_add_existing(worktree, branch)?;
    } else {
        primary.worktree_add_new_branch(worktree, branch, &state.config.default_branch)?;
    }
    worktree
        .canonicalize()
        .with_context(|| format!("resolve worktree {}", worktree.display()))
}

fn merge_branch(
    state: &DomainState,
    handle: &BranchHandle,
    target: &str,
    message: &str,
) -> Result<MergeOutcome> {
    let primary = Git::new(&state.config.path);
    if !primary.branch_exists(&handle.branch)? {
        return Err(anyhow!("branch '{}' does not exist", handle.branch));
    }
    primary
        .ensure_clean()
        .context("primary checkout has uncommitted changes")?;
    let previous = primary.current_branch().ok();
    if previous.as_deref() != Some(target) {
        primary
            .checkout_branch(target)
            .with_context(|| format!("checkout {target} for merge"))?;
    }

    let attempt = primary.merge(&handle.branch, message);
    let outcome = match attempt {
        Ok(MergeAttempt::Clean { fast_forward }) => {
            let commit = CommitId(primary.rev_parse("HEAD")?);
            remove_branch(state, handle)?;
            if fast_forward {
                MergeOutcome::FastForward { commit }
            } else {
                MergeOutcome::Merged { commit }
            }
        }
        Ok(MergeAttempt::Conflict { paths }) => MergeOutcome::Conflict { paths },
        Err(err) => {
            restore_checkout(&primary, previous.as_deref(), target);
            return Err(err);
        }
    };
    restore_checkout(&primary, previous.as_deref(), target);
    Ok(outcome)
}

fn restore_checkout(primary: &Git, previous: Option<&str>, target: &str) {
    if let Some(prev) = previous
        && prev != target
        && let Err(err) = primary.checkout_branch(prev)
    {
        warn!(branch = prev, err = %err, "could not restore checkout after merge");
    }
}

fn remove_branch(state: &DomainState, handle: &BranchHandle) -> Result<()> {
    let primary = Git::new(&state.config.path);
    let registered = primary.worktree_for_branch(&handle.branch)?;
    if let Some(path) = registered.as_ref() {
        primary.worktree_remove(path)?;
    }
    if registered.as_deref() != Some(handle.worktree.as_path()) && handle.worktree.exists() {
        primary.worktree_remove(&handle.worktree)?;
    }
    if primary.branch_exists(&handle.branch)? {
        primary.delete_branch(&handle.branch)?;
    }
    Ok(())
}
