//! State management for repositories and worktrees.
//!
//! The single source of truth for `{repositories, worktrees}`: atomic
//! field-level updates, JSON persistence, typed change events, and the
//! boot-time restoration driver.

pub mod events;
pub mod manager;
pub mod models;
pub mod restore;
pub mod update;

pub use events::StateEvent;
pub use manager::StateManager;
pub use models::{
    branch_map_key, encode_ref_for_config, ActiveSessionEntry, ClaudeActivityState,
    PullRequestState, Repository, TitleEntry, TodoItem, TodoStatus, Worktree,
    BRANCH_MAP_CONFIG_PREFIX, CATNIP_REF_PREFIX,
};
pub use restore::RestoreReport;
pub use update::WorktreeUpdate;
