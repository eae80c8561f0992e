//! Typed, whitelisted field updates for worktrees.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::models::{ClaudeActivityState, TitleEntry, TodoItem, Worktree};

/// A sparse update: only set fields are applied. This is the payload of
/// `worktree_updated` events, so unset fields stay off the wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorktreeUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commits_behind: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_dirty: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_conflicts: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pull_request_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pull_request_title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pull_request_body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pull_request_state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pull_request_last_synced: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_title_history: Option<Vec<TitleEntry>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_active_claude_session: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claude_activity_state: Option<ClaudeActivityState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub todos: Option<Vec<TodoItem>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_been_renamed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_accessed: Option<DateTime<Utc>>,
}

impl WorktreeUpdate {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Names of the fields this update touches.
    pub fn changed_fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        macro_rules! record {
            ($($field:ident),* $(,)?) => {
                $(if self.$field.is_some() { fields.push(stringify!($field)); })*
            };
        }
        record!(
            branch,
            commit_hash,
            commit_count,
            commits_behind,
            is_dirty,
            has_conflicts,
            pull_request_url,
            pull_request_title,
            pull_request_body,
            pull_request_state,
            pull_request_last_synced,
            session_title,
            session_title_history,
            has_active_claude_session,
            claude_activity_state,
            todos,
            has_been_renamed,
            last_accessed,
        );
        fields
    }

    /// Apply to a worktree, returning a copy of this update narrowed to the
    /// fields whose values actually changed.
    pub fn apply(&self, wt: &mut Worktree) -> WorktreeUpdate {
        let mut applied = WorktreeUpdate::default();
        macro_rules! apply_field {
            ($($field:ident),* $(,)?) => {
                $(
                    if let Some(value) = &self.$field {
                        if wt.$field != *value {
                            wt.$field = value.clone();
                            applied.$field = Some(value.clone());
                        }
                    }
                )*
            };
        }
        apply_field!(
            branch,
            commit_hash,
            commit_count,
            commits_behind,
            is_dirty,
            has_conflicts,
            session_title_history,
            has_active_claude_session,
            claude_activity_state,
            todos,
            has_been_renamed,
            last_accessed,
        );
        // Option-valued worktree fields: a set value always overwrites.
        macro_rules! apply_option_field {
            ($($field:ident),* $(,)?) => {
                $(
                    if let Some(value) = &self.$field {
                        if wt.$field.as_ref() != Some(value) {
                            wt.$field = Some(value.clone());
                            applied.$field = Some(value.clone());
                        }
                    }
                )*
            };
        }
        apply_option_field!(
            pull_request_url,
            pull_request_title,
            pull_request_body,
            pull_request_state,
            pull_request_last_synced,
            session_title,
        );
        applied
    }

    /// The subset of fields carried by `worktree_batch_updated` events
    /// (git-status-shaped facts only).
    pub fn status_fields(&self) -> WorktreeUpdate {
        WorktreeUpdate {
            commit_hash: self.commit_hash.clone(),
            commit_count: self.commit_count,
            commits_behind: self.commits_behind,
            is_dirty: self.is_dirty,
            has_conflicts: self.has_conflicts,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn worktree() -> Worktree {
        Worktree {
            id: "w1".into(),
            repo_id: "local/alpha".into(),
            name: "alpha/feline".into(),
            path: PathBuf::from("/work/feline"),
            source_branch: "main".into(),
            branch: "refs/catnip/feline".into(),
            commit_hash: "aaaa".into(),
            commit_count: 0,
            commits_behind: 0,
            is_dirty: false,
            has_conflicts: false,
            pull_request_url: None,
            pull_request_title: None,
            pull_request_body: None,
            pull_request_state: None,
            pull_request_last_synced: None,
            session_title: None,
            session_title_history: Vec::new(),
            has_active_claude_session: false,
            claude_activity_state: ClaudeActivityState::Inactive,
            todos: Vec::new(),
            has_been_renamed: false,
            created_at: Utc::now(),
            last_accessed: Utc::now(),
        }
    }

    #[test]
    fn apply_narrows_to_actual_changes() {
        let mut wt = worktree();
        let update = WorktreeUpdate {
            commit_hash: Some("aaaa".into()), // unchanged
            is_dirty: Some(true),             // changed
            ..Default::default()
        };
        let applied = update.apply(&mut wt);
        assert_eq!(applied.changed_fields(), vec!["is_dirty"]);
        assert!(wt.is_dirty);
        assert_eq!(wt.commit_hash, "aaaa");
    }

    #[test]
    fn empty_update_applies_nothing() {
        let mut wt = worktree();
        let before = wt.clone();
        let applied = WorktreeUpdate::default().apply(&mut wt);
        assert!(applied.is_empty());
        assert_eq!(wt, before);
    }

    #[test]
    fn changed_fields_lists_set_fields() {
        let update = WorktreeUpdate {
            branch: Some("feature/x".into()),
            has_been_renamed: Some(true),
            ..Default::default()
        };
        assert_eq!(update.changed_fields(), vec!["branch", "has_been_renamed"]);
    }

    #[test]
    fn status_fields_drops_non_git_facts() {
        let update = WorktreeUpdate {
            commit_count: Some(3),
            session_title: Some("hello".into()),
            ..Default::default()
        };
        let status = update.status_fields();
        assert_eq!(status.commit_count, Some(3));
        assert!(status.session_title.is_none());
    }

    #[test]
    fn sparse_serialization_omits_unset_fields() {
        let update = WorktreeUpdate {
            is_dirty: Some(true),
            ..Default::default()
        };
        let json = serde_json::to_string(&update).unwrap();
        assert_eq!(json, r#"{"is_dirty":true}"#);
    }
}
