use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by the supervisor core.
///
/// Subsystems recover locally where a retry is safe (per-repo PR sync,
/// per-commit sync, per-state onboarding); anything a caller must act on
/// arrives as one of these.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Repository not found: {0}")]
    RepoMissing(String),

    #[error("Repository unavailable: {0}")]
    RepoUnavailable(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("{operation} produced conflicts in {worktree_name}: {message}")]
    Conflict {
        operation: String,
        worktree_name: String,
        worktree_path: PathBuf,
        conflict_files: Vec<String>,
        message: String,
    },

    #[error("Push rejected by remote: {0}")]
    PushRejected(String),

    #[error("You have uncommitted staged changes. Please commit or unstage them before syncing.")]
    UncommittedChanges,

    #[error("Git error: {0}")]
    TransientGit(String),

    #[error("{0}")]
    Onboarding(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Notify error: {0}")]
    Notify(#[from] notify::Error),

    #[error("Anyhow error: {0}")]
    Anyhow(#[from] anyhow::Error),
}

impl Error {
    /// Transient errors are retried by the next tick of whichever periodic
    /// subsystem drove the call.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::TransientGit(_) | Error::Io(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
