//! Git operation error types

use std::path::PathBuf;
use thiserror::Error;

/// Git-specific errors
#[derive(Debug, Error, Clone)]
pub enum GitError {
    #[error("Not a git repository")]
    NotARepository,

    #[error("Branch not found: {0}")]
    BranchNotFound(String),

    #[error("Branch already exists: {0}")]
    BranchExists(String),

    #[error("Reference not found: {0}")]
    RefNotFound(String),

    #[error("Commit not found: {0}")]
    CommitNotFound(String),

    #[error("Merge conflict in files: {files:?}")]
    MergeConflict { files: Vec<PathBuf> },

    #[error("Uncommitted changes present")]
    UncommittedChanges,

    #[error("Nothing to commit, working tree clean")]
    NothingToCommit,

    #[error("Worktree already exists: {0}")]
    WorktreeExists(String),

    #[error("Worktree not found: {0}")]
    WorktreeNotFound(String),

    #[error("Repository is in detached HEAD state")]
    DetachedHead,

    #[error("Remote not found: {0}")]
    RemoteNotFound(String),

    #[error("Remote already exists: {0}")]
    RemoteExists(String),

    #[error("Push rejected: {0}")]
    PushRejected(String),

    #[error("Git command failed: {0}")]
    CommandFailed(String),
}

impl GitError {
    /// Transient errors may succeed when the next periodic tick retries.
    pub fn is_transient(&self) -> bool {
        matches!(self, GitError::CommandFailed(_))
    }
}
