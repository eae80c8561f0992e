//! Persistent data model: repositories, worktrees, and their satellites.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Prefix of the private ref namespace agents work on.
pub const CATNIP_REF_PREFIX: &str = "refs/catnip/";

/// Git config section holding private-ref → nice-branch mappings.
pub const BRANCH_MAP_CONFIG_PREFIX: &str = "catnip.branch-map";

/// A logical repository known to the supervisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Repository {
    /// `"local/<name>"` or `"<owner>/<name>"`.
    pub id: String,
    pub url: String,
    /// Filesystem path of the bare or working clone.
    pub path: PathBuf,
    pub default_branch: String,
    #[serde(default)]
    pub description: String,
    /// Cleared when the filesystem path is missing at restore. While false,
    /// no worktree operations are permitted against this repository.
    #[serde(default = "default_true")]
    pub available: bool,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
}

fn default_true() -> bool {
    true
}

/// Agent liveness classification for a worktree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ClaudeActivityState {
    #[default]
    Inactive,
    Running,
    Active,
}

impl ClaudeActivityState {
    /// Active and Running both imply a live session.
    pub fn implies_active_session(self) -> bool {
        matches!(self, ClaudeActivityState::Active | ClaudeActivityState::Running)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    Pending,
    InProgress,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TodoItem {
    pub content: String,
    pub status: TodoStatus,
}

/// One entry of a worktree's session title history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TitleEntry {
    pub title: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit_hash: Option<String>,
}

/// A checked-out working copy bound to a repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Worktree {
    pub id: String,
    pub repo_id: String,
    /// Human-readable `"<repo>/<workspace>"`.
    pub name: String,
    pub path: PathBuf,
    /// The branch this work was forked from.
    pub source_branch: String,
    /// Displayed branch: starts as `refs/catnip/<workspace>`, becomes the
    /// nice name after rename. The git HEAD stays on the private ref either
    /// way.
    pub branch: String,
    #[serde(default)]
    pub commit_hash: String,
    /// Commits ahead of `source_branch`.
    #[serde(default)]
    pub commit_count: u32,
    #[serde(default)]
    pub commits_behind: u32,
    #[serde(default)]
    pub is_dirty: bool,
    #[serde(default)]
    pub has_conflicts: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_request_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_request_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_request_body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_request_state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_request_last_synced: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_title: Option<String>,
    #[serde(default)]
    pub session_title_history: Vec<TitleEntry>,
    #[serde(default)]
    pub has_active_claude_session: bool,
    #[serde(default)]
    pub claude_activity_state: ClaudeActivityState,
    #[serde(default)]
    pub todos: Vec<TodoItem>,
    #[serde(default)]
    pub has_been_renamed: bool,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
}

impl Worktree {
    /// The workspace segment of the name (`"<repo>/<workspace>"`).
    pub fn workspace(&self) -> &str {
        self.name.rsplit('/').next().unwrap_or(&self.name)
    }

    /// The private ref this worktree's HEAD is pinned to.
    pub fn private_ref(&self) -> String {
        format!("{CATNIP_REF_PREFIX}{}", self.workspace())
    }

    pub fn is_on_private_ref(&self) -> bool {
        self.branch.starts_with(CATNIP_REF_PREFIX)
    }
}

/// Cached state of a pull request, keyed `"<owner>/<repo>#<number>"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullRequestState {
    pub number: u64,
    /// `OPEN`, `CLOSED`, or `MERGED`.
    pub state: String,
    /// `"<owner>/<repo>"`.
    pub repository: String,
    pub url: String,
    pub title: String,
    pub last_synced: DateTime<Utc>,
    pub worktree_ids: Vec<String>,
}

impl PullRequestState {
    pub fn cache_key(repository: &str, number: u64) -> String {
        format!("{repository}#{number}")
    }
}

/// Live-session registry entry, keyed by workspace path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveSessionEntry {
    pub claude_session_uuid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default)]
    pub title_history: Vec<TitleEntry>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resumed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

/// Encode a full ref name for use as a git config key segment.
///
/// `refs/catnip/alpha` → `refs.catnip.alpha`, giving config keys like
/// `catnip.branch-map.refs.catnip.alpha`.
pub fn encode_ref_for_config(refname: &str) -> String {
    refname.replace('/', ".")
}

/// The config key mapping a private ref to its nice branch.
pub fn branch_map_key(private_ref: &str) -> String {
    format!(
        "{BRANCH_MAP_CONFIG_PREFIX}.{}",
        encode_ref_for_config(private_ref)
    )
}
