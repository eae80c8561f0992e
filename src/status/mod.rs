//! Memoized per-worktree git status facts.
//!
//! The cache answers "is this worktree dirty / conflicted / how far ahead"
//! without hitting git on every read. Refreshes happen on demand and when
//! the commit-sync engine observes filesystem events; results flow into the
//! state manager through its batch update path.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::Result;

use crate::git::GitService;
use crate::state::{Worktree, WorktreeUpdate};

/// One worktree's memoized facts.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedStatus {
    pub commit_hash: String,
    pub commit_count: u32,
    pub commits_behind: u32,
    pub is_dirty: bool,
    pub has_conflicts: bool,
    pub refreshed_at: DateTime<Utc>,
}

impl CachedStatus {
    /// Shape the facts as a sparse state-manager update.
    pub fn as_update(&self) -> WorktreeUpdate {
        WorktreeUpdate {
            commit_hash: Some(self.commit_hash.clone()),
            commit_count: Some(self.commit_count),
            commits_behind: Some(self.commits_behind),
            is_dirty: Some(self.is_dirty),
            has_conflicts: Some(self.has_conflicts),
            ..Default::default()
        }
    }
}

#[derive(Default)]
pub struct StatusCache {
    entries: RwLock<HashMap<String, CachedStatus>>,
}

impl StatusCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, worktree_id: &str) -> Option<CachedStatus> {
        self.entries.read().unwrap().get(worktree_id).cloned()
    }

    pub fn invalidate(&self, worktree_id: &str) {
        self.entries.write().unwrap().remove(worktree_id);
    }

    /// Recompute the facts for one worktree and memoize them. The git calls
    /// run without any cache lock held.
    pub async fn refresh(&self, wt: &Worktree, git: &dyn GitService) -> Result<CachedStatus> {
        let commit_hash = git.get_commit_hash(&wt.path, "HEAD").await?;
        let status = git.get_status(&wt.path).await?;
        let ahead_range = format!("{}..HEAD", wt.source_branch);
        let behind_range = format!("HEAD..{}", wt.source_branch);
        // Counting against a source branch that no longer resolves is not
        // an error; the worktree simply reads as even.
        let commit_count = git.get_commit_count(&wt.path, &ahead_range).await.unwrap_or(0);
        let commits_behind = git
            .get_commit_count(&wt.path, &behind_range)
            .await
            .unwrap_or(0);

        let fresh = CachedStatus {
            commit_hash,
            commit_count,
            commits_behind,
            is_dirty: !status.is_clean(),
            has_conflicts: status.has_conflicts(),
            refreshed_at: Utc::now(),
        };

        self.entries
            .write()
            .unwrap()
            .insert(wt.id.clone(), fresh.clone());
        Ok(fresh)
    }

    /// Refresh only when the cached facts changed, returning the sparse
    /// update to feed into a batch. `None` means nothing moved.
    pub async fn refresh_if_changed(
        &self,
        wt: &Worktree,
        git: &dyn GitService,
    ) -> Result<Option<WorktreeUpdate>> {
        let previous = self.get(&wt.id);
        let fresh = self.refresh(wt, git).await?;
        let changed = previous.map_or(true, |p| {
            p.commit_hash != fresh.commit_hash
                || p.commit_count != fresh.commit_count
                || p.commits_behind != fresh.commits_behind
                || p.is_dirty != fresh.is_dirty
                || p.has_conflicts != fresh.has_conflicts
        });
        Ok(changed.then(|| fresh.as_update()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::GitCommandRunner;
    use crate::state::ClaudeActivityState;
    use crate::subprocess::{MockProcessRunner, ProcessRunner};
    use std::path::PathBuf;
    use std::sync::Arc;

    fn worktree() -> Worktree {
        Worktree {
            id: "w1".into(),
            repo_id: "local/alpha".into(),
            name: "alpha/feline".into(),
            path: PathBuf::from("/t/w1"),
            source_branch: "main".into(),
            branch: "refs/catnip/feline".into(),
            commit_hash: String::new(),
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

    fn scripted_git(mock: &MockProcessRunner, head: &str, dirty: bool, ahead: u32) {
        mock.expect_success("git", &["rev-parse", "HEAD"], &format!("{head}\n"));
        mock.expect_success(
            "git",
            &["status", "--porcelain"],
            if dirty { " M src/lib.rs\n" } else { "" },
        );
        let ahead_s = format!("{ahead}\n");
        mock.expect_command("git")
            .with_args(|a| {
                a.first().map(String::as_str) == Some("rev-list")
                    && a.last().map(|s| s.ends_with("..HEAD")) == Some(true)
            })
            .returns_stdout(&ahead_s)
            .finish();
        mock.expect_command("git")
            .with_args(|a| {
                a.first().map(String::as_str) == Some("rev-list")
                    && a.last().map(|s| s.starts_with("HEAD..")) == Some(true)
            })
            .returns_stdout("0\n")
            .finish();
    }

    #[tokio::test]
    async fn refresh_memoizes_facts() {
        let mock = MockProcessRunner::new();
        scripted_git(&mock, "abcd", true, 3);
        let git = GitCommandRunner::new(Arc::new(mock.clone()) as Arc<dyn ProcessRunner>);

        let cache = StatusCache::new();
        let wt = worktree();
        assert!(cache.get("w1").is_none());

        let status = cache.refresh(&wt, &git).await.unwrap();
        assert_eq!(status.commit_hash, "abcd");
        assert_eq!(status.commit_count, 3);
        assert!(status.is_dirty);
        assert!(!status.has_conflicts);
        assert_eq!(cache.get("w1").unwrap(), status);

        cache.invalidate("w1");
        assert!(cache.get("w1").is_none());
    }

    #[tokio::test]
    async fn refresh_if_changed_reports_only_movement() {
        let mock = MockProcessRunner::new();
        scripted_git(&mock, "abcd", false, 1);
        let git = GitCommandRunner::new(Arc::new(mock.clone()) as Arc<dyn ProcessRunner>);

        let cache = StatusCache::new();
        let wt = worktree();

        let first = cache.refresh_if_changed(&wt, &git).await.unwrap();
        assert!(first.is_some(), "first refresh always reports");

        let second = cache.refresh_if_changed(&wt, &git).await.unwrap();
        assert!(second.is_none(), "identical facts are not re-reported");
    }

    #[tokio::test]
    async fn missing_source_branch_reads_as_even() {
        let mock = MockProcessRunner::new();
        mock.expect_success("git", &["rev-parse", "HEAD"], "abcd\n");
        mock.expect_success("git", &["status", "--porcelain"], "");
        mock.expect_command("git")
            .with_args(|a| a.first().map(String::as_str) == Some("rev-list"))
            .returns_exit_code(128)
            .returns_stderr("fatal: bad revision")
            .finish();
        let git = GitCommandRunner::new(Arc::new(mock.clone()) as Arc<dyn ProcessRunner>);

        let cache = StatusCache::new();
        let status = cache.refresh(&worktree(), &git).await.unwrap();
        assert_eq!(status.commit_count, 0);
        assert_eq!(status.commits_behind, 0);
    }

    #[test]
    fn cached_status_update_shape() {
        let status = CachedStatus {
            commit_hash: "abcd".into(),
            commit_count: 2,
            commits_behind: 1,
            is_dirty: true,
            has_conflicts: false,
            refreshed_at: Utc::now(),
        };
        let update = status.as_update();
        assert_eq!(update.commit_hash.as_deref(), Some("abcd"));
        assert_eq!(update.commit_count, Some(2));
        assert_eq!(update.is_dirty, Some(true));
        assert!(update.session_title.is_none());
    }
}
