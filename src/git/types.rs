//! Git data structures

use std::path::PathBuf;

/// One entry of `git worktree list --porcelain`.
#[derive(Debug, Clone, PartialEq)]
pub struct WorktreeInfo {
    pub path: PathBuf,
    pub head: Option<String>,
    /// Full ref name when attached (e.g. `refs/heads/main`), `None` when
    /// detached or bare.
    pub branch: Option<String>,
    pub bare: bool,
    pub detached: bool,
}

/// Working-tree status distilled from `git status --porcelain`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GitStatus {
    pub staged: Vec<PathBuf>,
    pub modified: Vec<PathBuf>,
    pub deleted: Vec<PathBuf>,
    pub untracked: Vec<PathBuf>,
    pub conflicts: Vec<PathBuf>,
}

impl GitStatus {
    pub fn is_clean(&self) -> bool {
        self.staged.is_empty()
            && self.modified.is_empty()
            && self.deleted.is_empty()
            && self.untracked.is_empty()
            && self.conflicts.is_empty()
    }

    pub fn has_staged_changes(&self) -> bool {
        !self.staged.is_empty()
    }

    pub fn has_conflicts(&self) -> bool {
        !self.conflicts.is_empty()
    }
}

/// How much history a fetch pulls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStrategy {
    /// No tags, pruned. The default for sync traffic.
    Fast,
    /// Tags included.
    Full,
    /// `--unshallow`; only valid against a shallow clone.
    Unshallow,
}

/// A push request.
#[derive(Debug, Clone)]
pub struct PushStrategy {
    pub remote: String,
    pub refspec: String,
    pub force_with_lease: bool,
    /// When the remote rejects the push, fetch + rebase the branch and retry
    /// exactly once with this flag cleared.
    pub sync_on_fail: bool,
}

impl PushStrategy {
    pub fn new(remote: impl Into<String>, refspec: impl Into<String>) -> Self {
        Self {
            remote: remote.into(),
            refspec: refspec.into(),
            force_with_lease: false,
            sync_on_fail: false,
        }
    }

    pub fn force_with_lease(mut self) -> Self {
        self.force_with_lease = true;
        self
    }

    pub fn sync_on_fail(mut self) -> Self {
        self.sync_on_fail = true;
        self
    }
}

/// Options for creating a commit.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommitOptions {
    /// Stage all tracked modifications first (`-a`).
    pub all: bool,
    pub allow_empty: bool,
}

/// Options for a merge.
#[derive(Debug, Clone, Default)]
pub struct MergeOptions {
    pub no_ff: bool,
    pub message: Option<String>,
}

/// Result of a `merge-tree` conflict probe.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeTreeResult {
    pub clean: bool,
    pub conflicted_files: Vec<PathBuf>,
}
