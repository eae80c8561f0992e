//! The authoritative `{repositories, worktrees}` store.
//!
//! All mutations funnel through this manager: it takes the write lock,
//! applies the change in memory, persists the full state as one JSON
//! document (atomic sibling-write + rename), and emits typed events after
//! the lock is released. Snapshot readers get deep copies, so no caller
//! ever holds the lock across an external call.

use chrono::Utc;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::git::GitService;

use super::events::StateEvent;
use super::models::{branch_map_key, Repository, TitleEntry, Worktree, CATNIP_REF_PREFIX};
use super::update::WorktreeUpdate;

const STATE_FILE: &str = "state.json";

/// Session title history is bounded; older entries fall off.
const TITLE_HISTORY_LIMIT: usize = 20;

#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub(crate) struct StateData {
    pub repositories: HashMap<String, Repository>,
    pub worktrees: HashMap<String, Worktree>,
}

pub struct StateManager {
    inner: RwLock<StateData>,
    state_path: PathBuf,
    events: broadcast::Sender<StateEvent>,
}

impl StateManager {
    /// Load state from `<state_dir>/state.json`, tolerating absence.
    pub fn load(state_dir: &Path) -> Result<Self> {
        fs::create_dir_all(state_dir)?;
        let state_path = state_dir.join(STATE_FILE);

        let data = if state_path.exists() {
            let raw = fs::read_to_string(&state_path)?;
            serde_json::from_str(&raw)?
        } else {
            StateData::default()
        };

        let (events, _) = broadcast::channel(256);
        Ok(Self {
            inner: RwLock::new(data),
            state_path,
            events,
        })
    }

    /// Subscribe to change events. Slow subscribers may observe lag; the
    /// state itself is always recoverable through snapshot reads.
    pub fn subscribe(&self) -> broadcast::Receiver<StateEvent> {
        self.events.subscribe()
    }

    // --- Snapshot reads ---

    pub fn get_repository(&self, id: &str) -> Option<Repository> {
        self.inner.read().unwrap().repositories.get(id).cloned()
    }

    pub fn get_worktree(&self, id: &str) -> Option<Worktree> {
        self.inner.read().unwrap().worktrees.get(id).cloned()
    }

    pub fn all_repositories(&self) -> Vec<Repository> {
        self.inner
            .read()
            .unwrap()
            .repositories
            .values()
            .cloned()
            .collect()
    }

    pub fn all_worktrees(&self) -> Vec<Worktree> {
        self.inner
            .read()
            .unwrap()
            .worktrees
            .values()
            .cloned()
            .collect()
    }

    pub fn find_worktree_by_path(&self, path: &Path) -> Option<Worktree> {
        self.inner
            .read()
            .unwrap()
            .worktrees
            .values()
            .find(|wt| wt.path == path)
            .cloned()
    }

    /// Resolve a workspace name (the `<workspace>` of `refs/catnip/<workspace>`).
    pub fn find_worktree_by_workspace(&self, workspace: &str) -> Option<Worktree> {
        self.inner
            .read()
            .unwrap()
            .worktrees
            .values()
            .find(|wt| wt.workspace() == workspace)
            .cloned()
    }

    // --- Mutations ---

    /// Upsert a repository. New repositories default to available.
    pub fn add_repository(&self, repo: Repository) -> Result<()> {
        {
            let mut data = self.inner.write().unwrap();
            data.repositories.insert(repo.id.clone(), repo);
            self.persist(&data)?;
        }
        Ok(())
    }

    pub fn add_worktree(&self, worktree: Worktree) -> Result<()> {
        let event = {
            let mut data = self.inner.write().unwrap();

            let repo = data
                .repositories
                .get(&worktree.repo_id)
                .ok_or_else(|| Error::RepoMissing(worktree.repo_id.clone()))?;
            if !repo.available {
                return Err(Error::RepoUnavailable(worktree.repo_id.clone()));
            }
            let duplicate = data.worktrees.values().any(|wt| {
                wt.id != worktree.id && wt.repo_id == worktree.repo_id && wt.path == worktree.path
            });
            if duplicate {
                return Err(Error::InvalidOperation(format!(
                    "a worktree already exists at {}",
                    worktree.path.display()
                )));
            }

            data.worktrees.insert(worktree.id.clone(), worktree.clone());
            self.persist(&data)?;
            StateEvent::WorktreeCreated { worktree }
        };
        self.emit(vec![event]);
        Ok(())
    }

    /// Apply a whitelisted field update; persists and emits
    /// `worktree_updated` (plus `worktree_todos_updated` when todos moved).
    /// Returns the narrowed update that actually changed anything.
    pub fn update_worktree(&self, id: &str, update: WorktreeUpdate) -> Result<WorktreeUpdate> {
        let (applied, events) = {
            let mut data = self.inner.write().unwrap();
            let wt = data
                .worktrees
                .get_mut(id)
                .ok_or_else(|| Error::NotFound(format!("worktree {id}")))?;

            let applied = update.apply(wt);
            if applied.is_empty() {
                return Ok(applied);
            }
            self.persist(&data)?;

            let mut events = vec![StateEvent::WorktreeUpdated {
                id: id.to_string(),
                fields: applied.clone(),
            }];
            if let Some(todos) = &applied.todos {
                events.push(StateEvent::WorktreeTodosUpdated {
                    id: id.to_string(),
                    todos: todos.clone(),
                });
            }
            (applied, events)
        };
        self.emit(events);
        Ok(applied)
    }

    /// Apply many small updates under a single persistence round-trip.
    ///
    /// Emits one `worktree_updated` per id plus a single
    /// `worktree_batch_updated` aggregating the git-status-shaped fields.
    /// Unknown ids are skipped with a warning rather than failing the batch.
    pub fn batch_update_worktrees(
        &self,
        updates: HashMap<String, WorktreeUpdate>,
    ) -> Result<()> {
        let events = {
            let mut data = self.inner.write().unwrap();
            let mut events = Vec::new();
            let mut statuses = HashMap::new();

            for (id, update) in updates {
                let Some(wt) = data.worktrees.get_mut(&id) else {
                    warn!("batch update references unknown worktree {id}");
                    continue;
                };
                let applied = update.apply(wt);
                if applied.is_empty() {
                    continue;
                }
                let status = applied.status_fields();
                if !status.is_empty() {
                    statuses.insert(id.clone(), status);
                }
                if let Some(todos) = &applied.todos {
                    events.push(StateEvent::WorktreeTodosUpdated {
                        id: id.clone(),
                        todos: todos.clone(),
                    });
                }
                events.push(StateEvent::WorktreeUpdated {
                    id,
                    fields: applied,
                });
            }

            if events.is_empty() {
                return Ok(());
            }
            self.persist(&data)?;
            if !statuses.is_empty() {
                events.push(StateEvent::WorktreeBatchUpdated { statuses });
            }
            events
        };
        self.emit(events);
        Ok(())
    }

    pub fn delete_worktree(&self, id: &str) -> Result<()> {
        let event = {
            let mut data = self.inner.write().unwrap();
            let wt = data
                .worktrees
                .remove(id)
                .ok_or_else(|| Error::NotFound(format!("worktree {id}")))?;
            self.persist(&data)?;
            StateEvent::WorktreeDeleted {
                id: id.to_string(),
                name: wt.name,
            }
        };
        self.emit(vec![event]);
        Ok(())
    }

    /// Record a new session title: sets `session_title`, appends to the
    /// bounded history, and emits `session_title_updated`.
    pub fn update_session_title(
        &self,
        id: &str,
        title: &str,
        commit_hash: Option<String>,
    ) -> Result<()> {
        let events = {
            let mut data = self.inner.write().unwrap();
            let wt = data
                .worktrees
                .get_mut(id)
                .ok_or_else(|| Error::NotFound(format!("worktree {id}")))?;

            if wt.session_title.as_deref() == Some(title) {
                return Ok(());
            }

            wt.session_title = Some(title.to_string());
            wt.session_title_history.push(TitleEntry {
                title: title.to_string(),
                timestamp: Utc::now(),
                commit_hash,
            });
            let overflow = wt.session_title_history.len().saturating_sub(TITLE_HISTORY_LIMIT);
            if overflow > 0 {
                wt.session_title_history.drain(..overflow);
            }

            let workspace = wt.workspace().to_string();
            let history = wt.session_title_history.clone();
            let fields = WorktreeUpdate {
                session_title: Some(title.to_string()),
                session_title_history: Some(history.clone()),
                ..Default::default()
            };
            self.persist(&data)?;

            vec![
                StateEvent::WorktreeUpdated {
                    id: id.to_string(),
                    fields,
                },
                StateEvent::SessionTitleUpdated {
                    workspace,
                    id: id.to_string(),
                    title: title.to_string(),
                    history,
                },
            ]
        };
        self.emit(events);
        Ok(())
    }

    /// Expose a nice branch for a worktree working on a private ref.
    ///
    /// Idempotent: once `has_been_renamed` is set this returns without
    /// error. Creates `refs/heads/<nice_name>` at the worktree's current
    /// HEAD commit, records the mapping in git config, and flips the
    /// displayed branch. The git HEAD itself stays on the private ref.
    pub async fn rename_worktree_branch(
        &self,
        id: &str,
        nice_name: &str,
        git: &dyn GitService,
    ) -> Result<()> {
        let wt = self
            .get_worktree(id)
            .ok_or_else(|| Error::NotFound(format!("worktree {id}")))?;

        if wt.has_been_renamed {
            return Ok(());
        }
        if !wt.branch.starts_with(CATNIP_REF_PREFIX) {
            return Err(Error::InvalidOperation(format!(
                "worktree {} is not on a private ref (branch: {})",
                wt.name, wt.branch
            )));
        }

        // External calls happen before the write lock is taken.
        let head = git
            .get_commit_hash(&wt.path, "HEAD")
            .await
            .map_err(|e| Error::TransientGit(format!("{e:#}")))?;
        let nice_ref = format!("refs/heads/{nice_name}");
        git.update_ref(&wt.path, &nice_ref, &head)
            .await
            .map_err(|e| Error::TransientGit(format!("{e:#}")))?;
        git.set_config(&wt.path, &branch_map_key(&wt.branch), nice_name)
            .await
            .map_err(|e| Error::TransientGit(format!("{e:#}")))?;

        let events = {
            let mut data = self.inner.write().unwrap();
            let Some(wt) = data.worktrees.get_mut(id) else {
                return Err(Error::NotFound(format!("worktree {id}")));
            };
            // Lost a race with another rename; the first one won.
            if wt.has_been_renamed {
                return Ok(());
            }
            wt.branch = nice_name.to_string();
            wt.has_been_renamed = true;
            self.persist(&data)?;

            vec![StateEvent::WorktreeUpdated {
                id: id.to_string(),
                fields: WorktreeUpdate {
                    branch: Some(nice_name.to_string()),
                    has_been_renamed: Some(true),
                    ..Default::default()
                },
            }]
        };
        self.emit(events);
        debug!("renamed worktree {id} branch to {nice_name}");
        Ok(())
    }

    /// Mark repositories available/unavailable, persisting once. Used by
    /// the restore driver.
    pub(crate) fn set_repository_availability(
        &self,
        availability: HashMap<String, bool>,
    ) -> Result<()> {
        let mut data = self.inner.write().unwrap();
        let mut dirty = false;
        for (id, available) in availability {
            if let Some(repo) = data.repositories.get_mut(&id) {
                if repo.available != available {
                    repo.available = available;
                    dirty = true;
                }
            }
        }
        if dirty {
            self.persist(&data)?;
        }
        Ok(())
    }

    /// Persist the current state unconditionally (used on shutdown).
    pub fn flush(&self) -> Result<()> {
        let data = self.inner.read().unwrap();
        self.persist(&data)
    }

    fn persist(&self, data: &StateData) -> Result<()> {
        let json = serde_json::to_string_pretty(data)?;
        let tmp = self.state_path.with_extension("json.tmp");
        fs::write(&tmp, &json)?;
        fs::rename(&tmp, &self.state_path)?;
        Ok(())
    }

    fn emit(&self, events: Vec<StateEvent>) {
        for event in events {
            debug!("state event: {}", event.description());
            // No subscribers is fine; events are advisory.
            let _ = self.events.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::models::ClaudeActivityState;
    use tempfile::TempDir;

    fn repo(id: &str, path: &Path) -> Repository {
        Repository {
            id: id.to_string(),
            url: format!("file://{}", path.display()),
            path: path.to_path_buf(),
            default_branch: "main".to_string(),
            description: String::new(),
            available: true,
            created_at: Utc::now(),
            last_accessed: Utc::now(),
        }
    }

    fn worktree(id: &str, repo_id: &str, path: &Path) -> Worktree {
        Worktree {
            id: id.to_string(),
            repo_id: repo_id.to_string(),
            name: format!("{repo_id}/{id}"),
            path: path.to_path_buf(),
            source_branch: "main".to_string(),
            branch: format!("refs/catnip/{id}"),
            commit_hash: "aaaa".to_string(),
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

    fn manager(dir: &TempDir) -> StateManager {
        StateManager::load(dir.path()).unwrap()
    }

    #[test]
    fn add_worktree_requires_known_repository() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir);

        let err = mgr
            .add_worktree(worktree("w1", "local/ghost", Path::new("/t/w1")))
            .unwrap_err();
        assert!(matches!(err, Error::RepoMissing(_)));
    }

    #[test]
    fn add_worktree_refuses_unavailable_repository() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir);

        let mut r = repo("local/alpha", Path::new("/repos/alpha"));
        r.available = false;
        mgr.add_repository(r).unwrap();

        let err = mgr
            .add_worktree(worktree("w1", "local/alpha", Path::new("/t/w1")))
            .unwrap_err();
        assert!(matches!(err, Error::RepoUnavailable(_)));
    }

    #[test]
    fn add_worktree_emits_single_created_event() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir);
        let mut rx = mgr.subscribe();

        mgr.add_repository(repo("local/alpha", Path::new("/repos/alpha")))
            .unwrap();
        mgr.add_worktree(worktree("w1", "local/alpha", Path::new("/t/w1")))
            .unwrap();

        let event = rx.try_recv().unwrap();
        assert!(matches!(event, StateEvent::WorktreeCreated { .. }));
        assert!(rx.try_recv().is_err());

        let wt = mgr.get_worktree("w1").unwrap();
        assert_eq!(wt.branch, "refs/catnip/w1");
    }

    #[test]
    fn duplicate_path_rejected() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir);
        mgr.add_repository(repo("local/alpha", Path::new("/repos/alpha")))
            .unwrap();
        mgr.add_worktree(worktree("w1", "local/alpha", Path::new("/t/w1")))
            .unwrap();

        let err = mgr
            .add_worktree(worktree("w2", "local/alpha", Path::new("/t/w1")))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidOperation(_)));
    }

    #[test]
    fn add_then_delete_roundtrips() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir);
        mgr.add_repository(repo("local/alpha", Path::new("/repos/alpha")))
            .unwrap();

        assert!(mgr.all_worktrees().is_empty());
        mgr.add_worktree(worktree("w1", "local/alpha", Path::new("/t/w1")))
            .unwrap();
        mgr.delete_worktree("w1").unwrap();
        assert!(mgr.all_worktrees().is_empty());
    }

    #[test]
    fn update_emits_only_actual_changes() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir);
        mgr.add_repository(repo("local/alpha", Path::new("/repos/alpha")))
            .unwrap();
        mgr.add_worktree(worktree("w1", "local/alpha", Path::new("/t/w1")))
            .unwrap();
        let mut rx = mgr.subscribe();

        let applied = mgr
            .update_worktree(
                "w1",
                WorktreeUpdate {
                    commit_hash: Some("aaaa".into()), // unchanged
                    commit_count: Some(2),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(applied.changed_fields(), vec!["commit_count"]);

        match rx.try_recv().unwrap() {
            StateEvent::WorktreeUpdated { id, fields } => {
                assert_eq!(id, "w1");
                assert_eq!(fields.commit_count, Some(2));
                assert!(fields.commit_hash.is_none());
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn todos_update_emits_dedicated_event() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir);
        mgr.add_repository(repo("local/alpha", Path::new("/repos/alpha")))
            .unwrap();
        mgr.add_worktree(worktree("w1", "local/alpha", Path::new("/t/w1")))
            .unwrap();
        let mut rx = mgr.subscribe();

        mgr.update_worktree(
            "w1",
            WorktreeUpdate {
                todos: Some(vec![crate::state::models::TodoItem {
                    content: "write tests".into(),
                    status: crate::state::models::TodoStatus::Pending,
                }]),
                ..Default::default()
            },
        )
        .unwrap();

        assert!(matches!(
            rx.try_recv().unwrap(),
            StateEvent::WorktreeUpdated { .. }
        ));
        assert!(matches!(
            rx.try_recv().unwrap(),
            StateEvent::WorktreeTodosUpdated { .. }
        ));
    }

    #[test]
    fn batch_update_emits_one_aggregate() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir);
        mgr.add_repository(repo("local/alpha", Path::new("/repos/alpha")))
            .unwrap();
        mgr.add_worktree(worktree("w1", "local/alpha", Path::new("/t/w1")))
            .unwrap();
        mgr.add_worktree(worktree("w2", "local/alpha", Path::new("/t/w2")))
            .unwrap();
        let mut rx = mgr.subscribe();

        let mut updates = HashMap::new();
        updates.insert(
            "w1".to_string(),
            WorktreeUpdate {
                is_dirty: Some(true),
                ..Default::default()
            },
        );
        updates.insert(
            "w2".to_string(),
            WorktreeUpdate {
                commit_count: Some(4),
                ..Default::default()
            },
        );
        mgr.batch_update_worktrees(updates).unwrap();

        let mut updated = 0;
        let mut batches = 0;
        while let Ok(event) = rx.try_recv() {
            match event {
                StateEvent::WorktreeUpdated { .. } => updated += 1,
                StateEvent::WorktreeBatchUpdated { statuses } => {
                    batches += 1;
                    assert_eq!(statuses.len(), 2);
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert_eq!(updated, 2);
        assert_eq!(batches, 1);
    }

    #[test]
    fn persistence_roundtrip_is_identical() {
        let dir = TempDir::new().unwrap();
        {
            let mgr = manager(&dir);
            mgr.add_repository(repo("local/alpha", Path::new("/repos/alpha")))
                .unwrap();
            mgr.add_worktree(worktree("w1", "local/alpha", Path::new("/t/w1")))
                .unwrap();
        }
        let reloaded = manager(&dir);
        assert_eq!(reloaded.all_repositories().len(), 1);
        let wt = reloaded.get_worktree("w1").unwrap();
        assert_eq!(wt.branch, "refs/catnip/w1");
        assert_eq!(wt.repo_id, "local/alpha");
    }

    #[test]
    fn title_history_is_bounded() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir);
        mgr.add_repository(repo("local/alpha", Path::new("/repos/alpha")))
            .unwrap();
        mgr.add_worktree(worktree("w1", "local/alpha", Path::new("/t/w1")))
            .unwrap();

        for i in 0..30 {
            mgr.update_session_title("w1", &format!("title {i}"), None)
                .unwrap();
        }
        let wt = mgr.get_worktree("w1").unwrap();
        assert_eq!(wt.session_title_history.len(), TITLE_HISTORY_LIMIT);
        assert_eq!(wt.session_title.as_deref(), Some("title 29"));
        assert_eq!(wt.session_title_history[0].title, "title 10");
    }

    #[tokio::test]
    async fn rename_creates_nice_ref_and_mapping() {
        use crate::git::GitCommandRunner;
        use crate::subprocess::{MockProcessRunner, ProcessRunner};
        use std::sync::Arc;

        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir);
        mgr.add_repository(repo("local/alpha", Path::new("/repos/alpha")))
            .unwrap();
        mgr.add_worktree(worktree("alpha", "local/alpha", Path::new("/t/alpha")))
            .unwrap();
        let mut rx = mgr.subscribe();

        let mock = MockProcessRunner::new();
        mock.expect_success("git", &["rev-parse", "HEAD"], "aaaa\n");
        mock.expect_success("git", &["update-ref"], "");
        mock.expect_success("git", &["config"], "");
        let git = GitCommandRunner::new(Arc::new(mock.clone()) as Arc<dyn ProcessRunner>);

        mgr.rename_worktree_branch("alpha", "feature/alpha", &git)
            .await
            .unwrap();

        let wt = mgr.get_worktree("alpha").unwrap();
        assert_eq!(wt.branch, "feature/alpha");
        assert!(wt.has_been_renamed);

        match rx.try_recv().unwrap() {
            StateEvent::WorktreeUpdated { fields, .. } => {
                assert_eq!(fields.branch.as_deref(), Some("feature/alpha"));
                assert_eq!(fields.has_been_renamed, Some(true));
            }
            other => panic!("unexpected event {other:?}"),
        }

        let config_calls = mock
            .calls_for("git")
            .into_iter()
            .filter(|c| c.args.first().map(String::as_str) == Some("config"))
            .collect::<Vec<_>>();
        assert_eq!(
            config_calls[0].args,
            vec![
                "config",
                "catnip.branch-map.refs.catnip.alpha",
                "feature/alpha"
            ]
        );
        let update_ref_calls = mock
            .calls_for("git")
            .into_iter()
            .filter(|c| c.args.first().map(String::as_str) == Some("update-ref"))
            .collect::<Vec<_>>();
        assert_eq!(
            update_ref_calls[0].args,
            vec!["update-ref", "refs/heads/feature/alpha", "aaaa"]
        );

        // Second rename is a no-op: no further git calls, no events.
        let calls_before = mock.get_calls().len();
        mgr.rename_worktree_branch("alpha", "feature/other", &git)
            .await
            .unwrap();
        assert_eq!(mock.get_calls().len(), calls_before);
        assert!(rx.try_recv().is_err());
        assert_eq!(
            mgr.get_worktree("alpha").unwrap().branch,
            "feature/alpha"
        );
    }

    #[tokio::test]
    async fn rename_requires_private_ref() {
        use crate::git::GitCommandRunner;
        use crate::subprocess::{MockProcessRunner, ProcessRunner};
        use std::sync::Arc;

        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir);
        mgr.add_repository(repo("local/alpha", Path::new("/repos/alpha")))
            .unwrap();
        let mut wt = worktree("w1", "local/alpha", Path::new("/t/w1"));
        wt.branch = "main".to_string();
        mgr.add_worktree(wt).unwrap();

        let mock = MockProcessRunner::new();
        let git = GitCommandRunner::new(Arc::new(mock.clone()) as Arc<dyn ProcessRunner>);
        let err = mgr
            .rename_worktree_branch("w1", "feature/x", &git)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidOperation(_)));
        assert!(mock.get_calls().is_empty(), "no git calls expected");
    }
}
