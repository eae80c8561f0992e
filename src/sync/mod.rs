//! Commit-sync engine.
//!
//! Ensures every commit created in any worktree appears in its canonical
//! repository, and keeps each private-ref / nice-branch pair aligned in
//! both directions.

pub mod engine;
pub mod watcher;

pub use engine::{temp_remote_name, CommitSyncEngine};
pub use watcher::RefsWatcher;
