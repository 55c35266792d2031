//! Git adapter for domain repositories.
//!
//! Thread isolation relies on branches and worktrees, and merges must report
//! conflicts as data, so we keep a small, explicit wrapper around `git`
//! subprocess calls. Calls are blocking; async callers run them on the
//! blocking pool.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code.
    pub code: String,
    /// Path for the changed file.
    pub path: String,
}

/// Per-file diff of a branch against its base.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    pub path: String,
    pub diff: String,
}

/// Result of `git merge` in a checkout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeAttempt {
    /// Merge completed; `fast_forward` is true when no merge commit was made.
    Clean { fast_forward: bool },
    /// Merge stopped on conflicts and was aborted.
    Conflict { paths: Vec<String> },
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    /// True if the workdir is inside a git work tree.
    pub fn is_repo(&self) -> bool {
        self.run(&["rev-parse", "--is-inside-work-tree"])
            .map(|out| out.status.success())
            .unwrap_or(false)
    }

    /// Return the current branch name (errors on detached HEAD).
    #[instrument(skip_all)]
    pub fn current_branch(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        let name = out.trim().to_string();
        if name == "HEAD" {
            warn!("detached HEAD detected");
            return Err(anyhow!("detached HEAD in {}", self.workdir.display()));
        }
        debug!(branch = %name, "current branch");
        Ok(name)
    }

    /// Resolve a revision to its full SHA.
    pub fn rev_parse(&self, rev: &str) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "--verify", &format!("{rev}^{{commit}}")])?;
        Ok(out.trim().to_string())
    }

    /// Status entries of tracked files in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "--untracked-files=no"])?;
        let mut entries = Vec::new();
        for line in out.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(parse_status_line(line)?);
        }
        Ok(entries)
    }

    /// Ensure no tracked file has uncommitted changes.
    ///
    /// Untracked files are allowed; worktrees or data directories may live
    /// inside the checkout.
    pub fn ensure_clean(&self) -> Result<()> {
        let entries = self.status_porcelain()?;
        if entries.is_empty() {
            debug!("worktree is clean");
            return Ok(());
        }
        warn!(dirty_count = entries.len(), "worktree not clean");
        let mut msg = format!("working tree not clean in {}:\n", self.workdir.display());
        for entry in entries {
            msg.push_str(&format!("{} {}\n", entry.code, entry.path));
        }
        Err(anyhow!(msg.trim_end().to_string()))
    }

    /// Check whether a local branch exists.
    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let status = self
            .run(&[
                "show-ref",
                "--verify",
                "--quiet",
                &format!("refs/heads/{branch}"),
            ])?
            .status;
        Ok(status.success())
    }

    /// Checkout an existing branch.
    #[instrument(skip_all, fields(branch))]
    pub fn checkout_branch(&self, branch: &str) -> Result<()> {
        debug!(branch, "checking out branch");
        self.run_checked(&["checkout", branch])?;
        Ok(())
    }

    /// Delete a local branch, merged or not.
    #[instrument(skip_all, fields(branch))]
    pub fn delete_branch(&self, branch: &str) -> Result<()> {
        debug!(branch, "deleting branch");
        self.run_checked(&["branch", "-D", branch])?;
        Ok(())
    }

    /// Create `branch` at `start_point` and check it out in a new worktree at `path`.
    #[instrument(skip_all, fields(branch, path = %path.display()))]
    pub fn worktree_add_new_branch(&self, path: &Path, branch: &str, start_point: &str) -> Result<()> {
        debug!(branch, start_point, "adding worktree with new branch");
        let path_str = path_arg(path)?;
        self.run_checked(&["worktree", "add", "-b", branch, path_str, start_point])?;
        Ok(())
    }

    /// Check out an existing `branch` in a new worktree at `path`.
    #[instrument(skip_all, fields(branch, path = %path.display()))]
    pub fn worktree_add_existing(&self, path: &Path, branch: &str) -> Result<()> {
        debug!(branch, "adding worktree for existing branch");
        let path_str = path_arg(path)?;
        self.run_checked(&["worktree", "add", path_str, branch])?;
        Ok(())
    }

    /// Remove the worktree at `path` (discarding local changes) and prune stale entries.
    #[instrument(skip_all, fields(path = %path.display()))]
    pub fn worktree_remove(&self, path: &Path) -> Result<()> {
        let path_str = path_arg(path)?;
        if path.exists() {
            self.run_checked(&["worktree", "remove", "--force", path_str])?;
        }
        self.run_checked(&["worktree", "prune"])?;
        Ok(())
    }

    /// Worktree path that currently has `branch` checked out, if any.
    pub fn worktree_for_branch(&self, branch: &str) -> Result<Option<PathBuf>> {
        let out = self.run_capture(&["worktree", "list", "--porcelain"])?;
        Ok(parse_worktree_list(&out, branch))
    }

    /// Stage all changes (respects .gitignore).
    pub fn add_all(&self) -> Result<()> {
        self.run_checked(&["add", "-A"])?;
        Ok(())
    }

    /// True if there is anything staged for commit.
    pub fn has_staged_changes(&self) -> Result<bool> {
        let out = self.run(&["diff", "--cached", "--name-only"])?;
        Ok(!String::from_utf8_lossy(&out.stdout).trim().is_empty())
    }

    /// Commit staged changes with a message.
    ///
    /// If there are no staged changes, this returns Ok(false) and does nothing.
    #[instrument(skip_all)]
    pub fn commit_staged(&self, message: &str) -> Result<bool> {
        if !self.has_staged_changes()? {
            debug!("no staged changes, skipping commit");
            return Ok(false);
        }
        debug!("committing staged changes");
        self.run_checked(&["commit", "-m", message])?;
        Ok(true)
    }

    /// `git log --oneline` of the last `limit` commits on `rev`.
    pub fn log_oneline(&self, rev: &str, limit: usize) -> Result<String> {
        self.run_capture(&["log", "--oneline", &format!("-{limit}"), rev])
    }

    /// True if `ancestor` is reachable from `descendant`.
    pub fn is_ancestor(&self, ancestor: &str, descendant: &str) -> Result<bool> {
        let out = self.run(&["merge-base", "--is-ancestor", ancestor, descendant])?;
        match out.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(anyhow!(
                "git merge-base --is-ancestor failed: {}",
                String::from_utf8_lossy(&out.stderr).trim()
            )),
        }
    }

    /// Merge `branch` into the checked-out branch.
    ///
    /// Conflicts are aborted and returned as [`MergeAttempt::Conflict`]; any other
    /// failure is an error.
    #[instrument(skip_all, fields(branch))]
    pub fn merge(&self, branch: &str, message: &str) -> Result<MergeAttempt> {
        let head = self.rev_parse("HEAD")?;
        let fast_forward = self.is_ancestor(&head, branch)?;
        let out = self.run(&["merge", "--no-edit", "-m", message, branch])?;
        if out.status.success() {
            debug!(fast_forward, "merge succeeded");
            return Ok(MergeAttempt::Clean { fast_forward });
        }
        let paths = self.conflicted_paths()?;
        if paths.is_empty() {
            return Err(anyhow!(
                "git merge {branch} failed: {}",
                String::from_utf8_lossy(&out.stderr).trim()
            ));
        }
        warn!(conflicts = paths.len(), "merge conflict, aborting");
        self.run_checked(&["merge", "--abort"])?;
        Ok(MergeAttempt::Conflict { paths })
    }

    fn conflicted_paths(&self) -> Result<Vec<String>> {
        let out = self.run_capture(&["diff", "--name-only", "--diff-filter=U"])?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Diffs of `branch` relative to its merge base with `base`.
    ///
    /// With `include_untracked`, untracked files in this workdir are appended
    /// as additions.
    pub fn changes_against(
        &self,
        base: &str,
        branch: &str,
        include_untracked: bool,
    ) -> Result<Vec<Change>> {
        let range = format!("{base}...{branch}");
        let names = self.run_capture(&["diff", "--name-only", &range])?;
        let mut changes = Vec::new();
        for path in names.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let diff = self.run_capture(&["diff", "--no-color", &range, "--", path])?;
            if !diff.is_empty() {
                changes.push(Change {
                    path: path.to_string(),
                    diff,
                });
            }
        }

        if !include_untracked {
            return Ok(changes);
        }
        let untracked = self.run_capture(&["ls-files", "--others", "--exclude-standard"])?;
        for path in untracked.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let out = self.run(&["diff", "--no-index", "--no-color", "--", "/dev/null", path])?;
            // --no-index exits 1 when the files differ.
            if !matches!(out.status.code(), Some(0) | Some(1)) {
                return Err(anyhow!(
                    "git diff --no-index failed for {path}: {}",
                    String::from_utf8_lossy(&out.stderr).trim()
                ));
            }
            let diff = String::from_utf8_lossy(&out.stdout).to_string();
            if !diff.is_empty() {
                changes.push(Change {
                    path: path.to_string(),
                    diff,
                });
            }
        }
        Ok(changes)
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

fn path_arg(path: &Path) -> Result<&str> {
    path.to_str()
        .ok_or_else(|| anyhow!("non-utf8 path {}", path.display()))
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if line.len() < 4 {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once("->") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry { code, path })
}

/// Find the worktree path whose `branch refs/heads/<branch>` line matches.
fn parse_worktree_list(porcelain: &str, branch: &str) -> Option<PathBuf> {
    let wanted = format!("refs/heads/{branch}");
    let mut current: Option<&str> = None;
    for line in porcelain.lines() {
        if let Some(path) = line.strip_prefix("worktree ") {
            current = Some(path);
        } else if let Some(reference) = line.strip_prefix("branch ")
            && reference == wanted
        {
            return current.map(PathBuf::from);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_modified_line() {
        let e = parse_status_line(" M notes.txt").expect("parse");
        assert_eq!(
            e,
            StatusEntry {
                code: " M".to_string(),
                path: "notes.txt".to_string()
            }
        );
    }

    #[test]
    fn parses_rename_line_uses_new_path() {
        let e = parse_status_line("R  old.txt -> new.txt").expect("parse");
        assert_eq!(e.path, "new.txt");
    }

    #[test]
    fn finds_worktree_for_branch() {
        let porcelain = "worktree /repo\nHEAD abc\nbranch refs/heads/main\n\n\
                         worktree /wt/thread__a\nHEAD def\nbranch refs/heads/thread/a\n";
        assert_eq!(
            parse_worktree_list(porcelain, "thread/a"),
            Some(PathBuf::from("/wt/thread__a"))
        );
        assert_eq!(parse_worktree_list(porcelain, "thread/b"), None);
    }
}
