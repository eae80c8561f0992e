//! Typed change events emitted by the state manager.
//!
//! Events are buffered while the state lock is held and flushed after
//! release, so subscribers can call back into the manager without
//! deadlocking. Delivery is fan-out over a broadcast channel; the external
//! event bus (HTTP/SSE layer) subscribes at the boundary.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::models::{TitleEntry, TodoItem, Worktree};
use super::update::WorktreeUpdate;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StateEvent {
    WorktreeCreated {
        worktree: Worktree,
    },
    WorktreeUpdated {
        id: String,
        fields: WorktreeUpdate,
    },
    WorktreeDeleted {
        id: String,
        name: String,
    },
    /// One aggregate per batch, carrying only git-status-shaped fields.
    WorktreeBatchUpdated {
        statuses: HashMap<String, WorktreeUpdate>,
    },
    WorktreeTodosUpdated {
        id: String,
        todos: Vec<TodoItem>,
    },
    SessionTitleUpdated {
        workspace: String,
        id: String,
        title: String,
        history: Vec<TitleEntry>,
    },
}

impl StateEvent {
    /// Short human-readable description, used in debug logging.
    pub fn description(&self) -> String {
        match self {
            StateEvent::WorktreeCreated { worktree } => {
                format!("worktree {} created", worktree.name)
            }
            StateEvent::WorktreeUpdated { id, fields } => {
                format!("worktree {id} updated: {:?}", fields.changed_fields())
            }
            StateEvent::WorktreeDeleted { id, name } => {
                format!("worktree {id} ({name}) deleted")
            }
            StateEvent::WorktreeBatchUpdated { statuses } => {
                format!("batch status update for {} worktrees", statuses.len())
            }
            StateEvent::WorktreeTodosUpdated { id, todos } => {
                format!("worktree {id} todos updated ({} items)", todos.len())
            }
            StateEvent::SessionTitleUpdated { workspace, title, .. } => {
                format!("session title for {workspace}: {title}")
            }
        }
    }
}
