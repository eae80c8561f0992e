//! Top-level wiring of the supervisor subsystems.
//!
//! The supervisor owns the long-lived singletons (state manager, sync
//! engine, PR syncer, activity tracker, agent monitor) and passes them into
//! each other as explicit dependencies. It also runs the activity sync
//! ticker, the one writer of `claude_activity_state`.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::activity::{ActivityTracker, SysinfoScanner};
use crate::config::SupervisorConfig;
use crate::error::Result;
use crate::git::{CommitOptions, GitCommandRunner, GitService};
use crate::monitor::AgentMonitor;
use crate::pr::{GhCliClient, PullRequestSyncer};
use crate::state::{
    branch_map_key, ClaudeActivityState, RestoreReport, StateManager, Worktree, WorktreeUpdate,
};
use crate::status::StatusCache;
use crate::subprocess::SubprocessManager;
use crate::sync::CommitSyncEngine;

pub struct Supervisor {
    config: SupervisorConfig,
    state: Arc<StateManager>,
    git: Arc<dyn GitService>,
    status: Arc<StatusCache>,
    sync_engine: Arc<CommitSyncEngine>,
    pr_syncer: Arc<PullRequestSyncer>,
    activity: Arc<ActivityTracker>,
    monitor: Arc<AgentMonitor>,
    stop_tx: watch::Sender<bool>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Supervisor {
    /// Wire the production object graph.
    pub fn new(config: SupervisorConfig, subprocess: SubprocessManager) -> Result<Arc<Self>> {
        let state = Arc::new(StateManager::load(&config.state_dir)?);
        let git: Arc<dyn GitService> = Arc::new(GitCommandRunner::new(subprocess.runner()));
        let status = Arc::new(StatusCache::new());
        let sync_engine = Arc::new(CommitSyncEngine::new(
            Arc::clone(&state),
            Arc::clone(&git),
            Arc::clone(&status),
            config.live_remote.clone(),
        ));
        let pr_syncer = Arc::new(PullRequestSyncer::new(
            Arc::clone(&state),
            Arc::new(GhCliClient::new(subprocess.runner())),
        ));
        let projects_root = config
            .claude_projects_dir
            .clone()
            .unwrap_or_else(ActivityTracker::default_projects_root);
        let activity = Arc::new(ActivityTracker::new(
            projects_root.clone(),
            Arc::new(SysinfoScanner::new()),
        ));
        let monitor = Arc::new(AgentMonitor::new(Arc::clone(&state), projects_root));

        let (stop_tx, _) = watch::channel(false);
        Ok(Arc::new(Self {
            config,
            state,
            git,
            status,
            sync_engine,
            pr_syncer,
            activity,
            monitor,
            stop_tx,
            tasks: std::sync::Mutex::new(Vec::new()),
        }))
    }

    pub fn state(&self) -> Arc<StateManager> {
        Arc::clone(&self.state)
    }

    pub fn git(&self) -> Arc<dyn GitService> {
        Arc::clone(&self.git)
    }

    pub fn status_cache(&self) -> Arc<StatusCache> {
        Arc::clone(&self.status)
    }

    pub fn monitor(&self) -> Arc<AgentMonitor> {
        Arc::clone(&self.monitor)
    }

    /// Restore state, run housekeeping, and start every subsystem.
    pub async fn run(self: &Arc<Self>) -> Result<RestoreReport> {
        let report = self.state.restore_state(self.git.as_ref()).await?;

        for repo in self.state.all_repositories() {
            if !repo.available {
                continue;
            }
            if let Err(e) = self.git.prune_worktrees(&repo.path).await {
                debug!("worktree prune for {} failed: {e:#}", repo.id);
            }
            if let Err(e) = self.git.garbage_collect(&repo.path).await {
                debug!("gc for {} failed: {e:#}", repo.id);
            }
        }

        self.sync_engine.start().await?;
        self.pr_syncer.start();
        self.monitor.start();
        self.spawn_activity_ticker();

        info!("supervisor running");
        Ok(report)
    }

    /// Graceful shutdown: stop subsystems, join tasks, flush state.
    /// Idempotent.
    pub async fn shutdown(&self) {
        let _ = self.stop_tx.send(true);
        let tasks: Vec<_> = self.tasks.lock().unwrap().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        self.sync_engine.stop().await;
        self.pr_syncer.stop().await;
        self.monitor.stop().await;
        if let Err(e) = self.state.flush() {
            warn!("final state flush failed: {e}");
        }
        info!("supervisor stopped");
    }

    fn spawn_activity_ticker(self: &Arc<Self>) {
        let supervisor = Arc::clone(self);
        let mut stop_rx = self.stop_tx.subscribe();
        let interval = self.config.activity_interval();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = supervisor.sync_activity().await {
                            warn!("activity sync failed: {e}");
                        }
                    }
                }
            }
        });
        self.tasks.lock().unwrap().push(task);
    }

    /// One activity pass: reclassify every worktree and batch the fields
    /// that actually changed. Also the trigger point for optional
    /// auto-capture of work from sessions that just went quiet.
    pub async fn sync_activity(&self) -> Result<()> {
        let mut updates = HashMap::new();
        for wt in self.state.all_worktrees() {
            let (activity_state, has_session) = self.activity.state_for(&wt.path);

            if self.config.auto_commit
                && wt.claude_activity_state != ClaudeActivityState::Inactive
                && activity_state == ClaudeActivityState::Inactive
                && wt.is_dirty
            {
                match self
                    .git
                    .commit(&wt.path, "Auto-save agent work", CommitOptions {
                        all: true,
                        allow_empty: false,
                    })
                    .await
                {
                    Ok(hash) => info!("auto-captured work in {} as {hash}", wt.name),
                    Err(e) => debug!("auto-capture for {} skipped: {e:#}", wt.name),
                }
            }

            let mut update = WorktreeUpdate::default();
            if wt.claude_activity_state != activity_state {
                update.claude_activity_state = Some(activity_state);
            }
            if wt.has_active_claude_session != has_session {
                update.has_active_claude_session = Some(has_session);
            }
            if !update.is_empty() {
                updates.insert(wt.id, update);
            }
        }
        if !updates.is_empty() {
            self.state.batch_update_worktrees(updates)?;
        }
        Ok(())
    }

    /// Worktree snapshots with cached PR facts folded in for outbound reads.
    pub fn worktrees_with_pr_state(&self) -> Vec<Worktree> {
        self.state
            .all_worktrees()
            .into_iter()
            .map(|mut wt| {
                if let Some(update) = self.pr_syncer.enhancement_for(&wt) {
                    update.apply(&mut wt);
                }
                wt
            })
            .collect()
    }

    /// Create a new agent workspace: a private ref at the repository's
    /// default branch head, a worktree checked out on it, and a state
    /// entry. The worktree's HEAD is pinned to `refs/catnip/<workspace>`.
    pub async fn create_worktree(&self, repo_id: &str, workspace: &str) -> Result<Worktree> {
        let repo = self
            .state
            .get_repository(repo_id)
            .ok_or_else(|| crate::error::Error::RepoMissing(repo_id.to_string()))?;
        if !repo.available {
            return Err(crate::error::Error::RepoUnavailable(repo_id.to_string()));
        }

        let repo_short = repo_id.rsplit('/').next().unwrap_or(repo_id);
        let path = self
            .config
            .worktree_base_dir
            .join(repo_short)
            .join(workspace);
        if self.state.find_worktree_by_path(&path).is_some() {
            return Err(crate::error::Error::InvalidOperation(format!(
                "a worktree already exists at {}",
                path.display()
            )));
        }

        let private_ref = format!("refs/catnip/{workspace}");
        let head = self
            .git
            .get_commit_hash(&repo.path, &repo.default_branch)
            .await
            .map_err(|e| crate::error::Error::TransientGit(format!("{e:#}")))?;
        self.git
            .update_ref(&repo.path, &private_ref, &head)
            .await
            .map_err(|e| crate::error::Error::TransientGit(format!("{e:#}")))?;

        let path_str = path.to_string_lossy().to_string();
        let output = self
            .git
            .execute_git(
                &repo.path,
                &["worktree", "add", "--detach", &path_str, &private_ref],
            )
            .await
            .context("creating worktree")?;
        if !output.status.success() {
            return Err(crate::error::Error::TransientGit(format!(
                "worktree add failed: {}",
                output.stderr.trim()
            )));
        }
        // Re-attach HEAD to the private ref; `add --detach` leaves it loose.
        let output = self
            .git
            .execute_git(&path, &["symbolic-ref", "HEAD", &private_ref])
            .await
            .context("pinning worktree HEAD")?;
        if !output.status.success() {
            return Err(crate::error::Error::TransientGit(format!(
                "pinning HEAD failed: {}",
                output.stderr.trim()
            )));
        }

        let now = chrono::Utc::now();
        let worktree = Worktree {
            id: format!("{repo_short}-{workspace}"),
            repo_id: repo_id.to_string(),
            name: format!("{repo_short}/{workspace}"),
            path,
            source_branch: repo.default_branch.clone(),
            branch: private_ref,
            commit_hash: head,
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
            created_at: now,
            last_accessed: now,
        };
        self.state.add_worktree(worktree.clone())?;
        info!("created worktree {} on {}", worktree.name, worktree.branch);
        Ok(worktree)
    }

    /// Delete every fully-merged, clean worktree of one repository. The
    /// worktree, its private ref, and the nice-branch mapping all go.
    pub async fn cleanup_merged_worktrees(&self, repo_id: &str) -> Result<usize> {
        let repo = self
            .state
            .get_repository(repo_id)
            .ok_or_else(|| crate::error::Error::RepoMissing(repo_id.to_string()))?;
        if !repo.available {
            return Err(crate::error::Error::RepoUnavailable(repo_id.to_string()));
        }

        let mut removed = 0;
        for wt in self.state.all_worktrees() {
            if wt.repo_id != repo_id {
                continue;
            }
            let merged = self.is_fully_merged(&wt, &repo.path, &repo.default_branch).await;
            if !merged {
                continue;
            }

            let path = wt.path.to_string_lossy().to_string();
            let output = self
                .git
                .execute_git(&repo.path, &["worktree", "remove", "--force", &path])
                .await
                .context("removing worktree")?;
            if !output.status.success() {
                warn!(
                    "cleanup of {} failed: {}",
                    wt.name,
                    output.stderr.trim()
                );
                continue;
            }
            let private_ref = wt.private_ref();
            let _ = self.git.delete_ref(&repo.path, &private_ref).await;
            let _ = self
                .git
                .unset_config(&repo.path, &branch_map_key(&private_ref))
                .await;
            self.state.delete_worktree(&wt.id)?;
            self.status.invalidate(&wt.id);
            info!("cleaned up merged worktree {}", wt.name);
            removed += 1;
        }
        Ok(removed)
    }

    async fn is_fully_merged(&self, wt: &Worktree, repo_path: &std::path::Path, default_branch: &str) -> bool {
        let Ok(head) = self.git.get_commit_hash(&wt.path, "HEAD").await else {
            return false;
        };
        let Ok(dirty) = self.git.has_uncommitted_changes(&wt.path).await else {
            return false;
        };
        if dirty {
            return false;
        }
        match self.git.merge_base(repo_path, &head, default_branch).await {
            Ok(Some(base)) => base == head,
            _ => false,
        }
    }
}
