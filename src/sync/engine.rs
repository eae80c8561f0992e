//! Commit propagation between worktrees and canonical repositories.
//!
//! Two triggers funnel into one sync routine: the refs watcher (near-real-
//! time) and a 30-second periodic pass (correctness backstop). The routine
//! runs under the engine's own mutex; the state-manager lock is never held
//! across git calls.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::git::{self, GitError, GitService, MergeOptions, PushStrategy};
use crate::state::{branch_map_key, StateManager, Worktree, CATNIP_REF_PREFIX};
use crate::status::StatusCache;

use super::watcher::RefsWatcher;

/// Stale temporary remotes carry one of these prefixes.
const STALE_REMOTE_PREFIXES: [&str; 2] = ["sync-", "worktree-"];

const PERIODIC_INTERVAL: Duration = Duration::from_secs(30);

/// Encode a repo id or ref name into a remote-name-safe token.
fn encode_remote_token(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect()
}

/// Unique name for the temporary remote used by a fetch-based sync.
pub fn temp_remote_name(repo_id: &str, refname: &str) -> String {
    format!(
        "sync-{}-{}",
        encode_remote_token(repo_id),
        encode_remote_token(refname)
    )
}

pub struct CommitSyncEngine {
    state: Arc<StateManager>,
    git: Arc<dyn GitService>,
    status: Arc<StatusCache>,
    /// Remote that nice branches of locally-mounted repositories are pushed
    /// to with `--force-with-lease`.
    live_remote: String,
    sync_lock: Mutex<()>,
    stop_tx: watch::Sender<bool>,
    started: AtomicBool,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
    watcher: std::sync::Mutex<Option<RefsWatcher>>,
}

impl CommitSyncEngine {
    pub fn new(
        state: Arc<StateManager>,
        git: Arc<dyn GitService>,
        status: Arc<StatusCache>,
        live_remote: impl Into<String>,
    ) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            state,
            git,
            status,
            live_remote: live_remote.into(),
            sync_lock: Mutex::new(()),
            stop_tx,
            started: AtomicBool::new(false),
            tasks: std::sync::Mutex::new(Vec::new()),
            watcher: std::sync::Mutex::new(None),
        }
    }

    /// Start watchers and the periodic fallback. Idempotent.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.cleanup_stale_remotes().await;

        let dirs = self.watch_dirs().await;
        let (watcher, mut events) = RefsWatcher::spawn(dirs)?;
        *self.watcher.lock().unwrap() = Some(watcher);

        let engine = Arc::clone(self);
        let mut stop_rx = self.stop_tx.subscribe();
        let event_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    event = events.recv() => match event {
                        Some(path) => {
                            if let Err(e) = engine.handle_ref_event(&path).await {
                                warn!("ref event for {} failed: {e}", path.display());
                            }
                        }
                        None => break,
                    }
                }
            }
        });

        let engine = Arc::clone(self);
        let mut stop_rx = self.stop_tx.subscribe();
        let periodic_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PERIODIC_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = ticker.tick() => engine.periodic_pass().await,
                }
            }
        });

        self.tasks
            .lock()
            .unwrap()
            .extend([event_task, periodic_task]);
        info!("commit-sync engine started");
        Ok(())
    }

    /// Stop all tasks and close the watcher. Idempotent.
    pub async fn stop(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.stop_tx.send(true);
        let tasks: Vec<_> = self.tasks.lock().unwrap().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        if let Some(watcher) = self.watcher.lock().unwrap().take() {
            watcher.stop();
        }
        info!("commit-sync engine stopped");
    }

    /// Directories to watch: each worktree's `refs/heads/` plus each
    /// canonical repository's `refs/catnip/`.
    async fn watch_dirs(&self) -> Vec<PathBuf> {
        let mut dirs = Vec::new();
        for wt in self.state.all_worktrees() {
            match self.git.common_dir(&wt.path).await {
                Ok(common) => dirs.push(common.join("refs/heads")),
                Err(e) => debug!("no common dir for {}: {e:#}", wt.path.display()),
            }
        }
        for repo in self.state.all_repositories() {
            if !repo.available {
                continue;
            }
            match self.git.common_dir(&repo.path).await {
                Ok(common) => {
                    let catnip = common.join("refs/catnip");
                    // Ensure the namespace exists so the watcher can arm.
                    let _ = std::fs::create_dir_all(&catnip);
                    dirs.push(catnip);
                }
                Err(e) => debug!("no common dir for {}: {e:#}", repo.path.display()),
            }
        }
        dirs.sort();
        dirs.dedup();
        dirs
    }

    /// Drop leftover `sync-` / `worktree-` remotes from previous runs.
    async fn cleanup_stale_remotes(&self) {
        for repo in self.state.all_repositories() {
            if !repo.available {
                continue;
            }
            let remotes = match self.git.get_remotes(&repo.path).await {
                Ok(remotes) => remotes,
                Err(e) => {
                    debug!("listing remotes for {} failed: {e:#}", repo.id);
                    continue;
                }
            };
            for remote in remotes {
                if STALE_REMOTE_PREFIXES.iter().any(|p| remote.starts_with(p)) {
                    debug!("removing stale remote {remote} from {}", repo.id);
                    if let Err(e) = self.git.remove_remote(&repo.path, &remote).await {
                        warn!("failed to remove stale remote {remote}: {e:#}");
                    }
                }
            }
        }
    }

    /// Resolve the worktree a refs write belongs to and sync its commit.
    pub async fn handle_ref_event(&self, path: &Path) -> Result<()> {
        let Some(wt) = self.resolve_worktree(path) else {
            debug!("no worktree resolves {}", path.display());
            return Ok(());
        };

        let head = match self.git.get_commit_hash(&wt.path, "HEAD").await {
            Ok(head) => head,
            Err(e) => {
                debug!("cannot read HEAD of {}: {e:#}", wt.name);
                return Ok(());
            }
        };
        let full_ref = self.read_head_ref(&wt.path).await;

        if let (Ok(message), Ok(author)) = (
            self.git.get_commit_message(&wt.path, "HEAD").await,
            self.git.get_commit_author(&wt.path, "HEAD").await,
        ) {
            debug!("commit {head} on {full_ref} by {author}: {message}");
        }

        self.sync_commit(&wt, &full_ref, &head).await?;

        // Refresh the memoized status and publish git-shaped changes.
        if let Ok(Some(update)) = self.status.refresh_if_changed(&wt, self.git.as_ref()).await {
            let mut batch = std::collections::HashMap::new();
            batch.insert(wt.id.clone(), update);
            self.state.batch_update_worktrees(batch)?;
        }
        Ok(())
    }

    /// A `refs/catnip/<workspace>` path names a workspace directly; for
    /// anything else, walk upward until a `.git` component marks the
    /// owning worktree.
    fn resolve_worktree(&self, path: &Path) -> Option<Worktree> {
        let text = path.to_string_lossy();
        if let Some(idx) = text.find("refs/catnip/") {
            let workspace = &text[idx + "refs/catnip/".len()..];
            let workspace = workspace.trim_end_matches('/');
            if let Some(wt) = self.state.find_worktree_by_workspace(workspace) {
                return Some(wt);
            }
        }
        for ancestor in path.ancestors() {
            if ancestor.join(".git").exists() {
                if let Some(wt) = self.state.find_worktree_by_path(ancestor) {
                    return Some(wt);
                }
            }
        }
        None
    }

    /// Full symbolic ref of HEAD, falling back to the current branch name,
    /// then `"HEAD"` for detached worktrees.
    async fn read_head_ref(&self, worktree: &Path) -> String {
        if let Ok(Some(full)) = self.git.symbolic_ref(worktree, "HEAD").await {
            return full;
        }
        if let Ok(Some(branch)) = self.git.current_branch(worktree).await {
            return branch;
        }
        "HEAD".to_string()
    }

    /// Mirror a commit from a worktree into its canonical repository.
    pub async fn sync_commit(&self, wt: &Worktree, full_ref: &str, hash: &str) -> Result<()> {
        let _guard = self.sync_lock.lock().await;

        let repo = self
            .state
            .get_repository(&wt.repo_id)
            .ok_or_else(|| Error::RepoMissing(wt.repo_id.clone()))?;
        if !repo.available {
            return Err(Error::RepoUnavailable(repo.id));
        }

        // A ref write for a commit the worktree no longer has is stale, not
        // an error.
        let exists = self
            .git
            .commit_exists(&wt.path, hash)
            .await
            .map_err(transient)?;
        if !exists {
            debug!("commit {hash} not present in {}, skipping", wt.name);
            return Ok(());
        }

        if full_ref.starts_with(CATNIP_REF_PREFIX) {
            if let Err(e) = self.nice_branch_sync(&repo.path, &repo.id, full_ref, hash).await {
                warn!("nice-branch sync for {full_ref} failed: {e}");
            }
        }

        let target_ref = if full_ref.starts_with("refs/") {
            full_ref.to_string()
        } else {
            format!("refs/heads/{full_ref}")
        };

        let in_canonical = self
            .git
            .commit_exists(&repo.path, hash)
            .await
            .map_err(transient)?;
        if in_canonical {
            self.git
                .update_ref(&repo.path, &target_ref, hash)
                .await
                .map_err(transient)?;
            debug!("updated canonical {target_ref} to {hash}");
            return Ok(());
        }

        // The canonical repository is missing the objects: fetch them over
        // a uniquely-named temporary remote pointing at the worktree.
        let remote = temp_remote_name(&repo.id, full_ref);
        // A crashed previous run may have left this name behind.
        let _ = self.git.remove_remote(&repo.path, &remote).await;
        self.git
            .add_remote(&repo.path, &remote, &wt.path.to_string_lossy())
            .await
            .map_err(transient)?;

        let refspec = if full_ref.starts_with("refs/") {
            format!("{full_ref}:{full_ref}")
        } else {
            full_ref.to_string()
        };

        let result = async {
            git::fetch_unshallow_first(self.git.as_ref(), &repo.path, &remote, &refspec)
                .await
                .map_err(transient)?;
            self.git
                .update_ref(&repo.path, &target_ref, hash)
                .await
                .map_err(transient)
        }
        .await;

        // The temporary remote never outlives the sync, success or not.
        if let Err(e) = self.git.remove_remote(&repo.path, &remote).await {
            warn!("failed to remove temporary remote {remote}: {e:#}");
        }
        result?;
        debug!("fetched and updated canonical {target_ref} to {hash}");
        Ok(())
    }

    /// Forward sync: fast-forward the mapped nice branch to a private-ref
    /// commit, and push it to the live remote for locally-mounted repos.
    async fn nice_branch_sync(
        &self,
        repo_path: &Path,
        repo_id: &str,
        private_ref: &str,
        hash: &str,
    ) -> Result<()> {
        let key = branch_map_key(private_ref);
        let Some(nice) = self.git.get_config(repo_path, &key).await.map_err(transient)? else {
            return Ok(());
        };
        if !self.git.branch_exists(repo_path, &nice).await.map_err(transient)? {
            return Ok(());
        }

        let nice_ref = format!("refs/heads/{nice}");
        let nice_head = self
            .git
            .show_ref(repo_path, &nice_ref)
            .await
            .map_err(transient)?;
        if nice_head.as_deref() != Some(hash) {
            let base = self
                .git
                .merge_base(repo_path, &nice_ref, hash)
                .await
                .map_err(transient)?;
            if base == nice_head {
                self.git
                    .update_ref(repo_path, &nice_ref, hash)
                    .await
                    .map_err(transient)?;
                debug!("fast-forwarded {nice_ref} to {hash}");
            } else {
                debug!("{nice_ref} has diverged from {private_ref}; reverse sync will handle it");
                return Ok(());
            }
        }

        if repo_id.starts_with("local/") {
            let has_live = self
                .git
                .get_remote_url(repo_path, &self.live_remote)
                .await
                .map_err(transient)?
                .is_some();
            if has_live {
                let push = PushStrategy::new(self.live_remote.clone(), nice.clone())
                    .force_with_lease();
                if let Err(e) = self.git.push(repo_path, &push).await {
                    warn!("live push of {nice} failed: {e:#}");
                }
            }
        }
        Ok(())
    }

    /// Reverse sync: bring commits made on the nice branch back into the
    /// private ref.
    pub async fn reverse_sync(&self, wt: &Worktree) -> Result<()> {
        let private_ref = wt.private_ref();
        let key = branch_map_key(&private_ref);
        let Some(nice) = self.git.get_config(&wt.path, &key).await.map_err(transient)? else {
            return Ok(());
        };

        let nice_ref = format!("refs/heads/{nice}");
        let Some(nice_hash) = self
            .git
            .show_ref(&wt.path, &nice_ref)
            .await
            .map_err(transient)?
        else {
            return Ok(());
        };
        let Some(private_hash) = self
            .git
            .show_ref(&wt.path, &private_ref)
            .await
            .map_err(transient)?
        else {
            return Ok(());
        };
        if nice_hash == private_hash {
            return Ok(());
        }

        let base = self
            .git
            .merge_base(&wt.path, &private_ref, &nice_ref)
            .await
            .map_err(transient)?;

        if base.as_deref() == Some(private_hash.as_str()) {
            // The nice branch is strictly ahead: fast-forward the private ref.
            self.git
                .update_ref(&wt.path, &private_ref, &nice_hash)
                .await
                .map_err(transient)?;
            debug!("fast-forwarded {private_ref} to {nice_hash}");
            return Ok(());
        }
        if base.as_deref() == Some(nice_hash.as_str()) {
            // The private ref is ahead; forward sync covers this direction.
            return Ok(());
        }

        // Diverged: merge the nice branch into the private ref with HEAD
        // temporarily pointed at the private ref.
        if self
            .git
            .has_staged_changes(&wt.path)
            .await
            .map_err(transient)?
        {
            return Err(Error::UncommittedChanges);
        }

        let original_head = self
            .git
            .symbolic_ref(&wt.path, "HEAD")
            .await
            .map_err(transient)?;
        if original_head.as_deref() != Some(private_ref.as_str()) {
            self.git
                .execute_git(&wt.path, &["symbolic-ref", "HEAD", &private_ref])
                .await
                .map_err(transient)?;
        }

        let message = format!("Merge branch '{nice}' into {}", wt.workspace());
        let merge_result = self
            .git
            .merge(
                &wt.path,
                &nice_ref,
                &MergeOptions {
                    no_ff: true,
                    message: Some(message),
                },
            )
            .await;

        if let Some(original) = original_head.as_deref() {
            if original != private_ref {
                let restore = self
                    .git
                    .execute_git(&wt.path, &["symbolic-ref", "HEAD", original])
                    .await;
                if restore.is_err() {
                    warn!("failed to restore HEAD of {} to {original}", wt.name);
                }
            }
        }

        match merge_result {
            Ok(()) => {
                debug!("merged {nice_ref} into {private_ref}");
                Ok(())
            }
            Err(e) => match e.downcast_ref::<GitError>() {
                Some(GitError::MergeConflict { files }) => {
                    // Left for the user to resolve; never fatal.
                    warn!(
                        "reverse sync of {} hit conflicts in {} file(s)",
                        wt.name,
                        files.len()
                    );
                    Err(Error::Conflict {
                        operation: "merge".to_string(),
                        worktree_name: wt.name.clone(),
                        worktree_path: wt.path.clone(),
                        conflict_files: files
                            .iter()
                            .map(|f| f.to_string_lossy().to_string())
                            .collect(),
                        message: format!("merging '{nice}' back into the workspace"),
                    })
                }
                _ => Err(transient(e)),
            },
        }
    }

    /// The 30-second correctness backstop: apply the same detection as the
    /// watcher across every worktree.
    pub async fn periodic_pass(&self) {
        for wt in self.state.all_worktrees() {
            if let Err(e) = self.sync_worktree(&wt).await {
                if matches!(e, Error::Conflict { .. }) {
                    warn!("{e}");
                } else {
                    debug!("periodic sync of {} deferred: {e}", wt.name);
                }
            }
        }
    }

    /// One worktree's periodic check: push an unsynced commit, then
    /// reconcile the private/nice pair.
    pub async fn sync_worktree(&self, wt: &Worktree) -> Result<()> {
        let repo = self
            .state
            .get_repository(&wt.repo_id)
            .ok_or_else(|| Error::RepoMissing(wt.repo_id.clone()))?;
        if !repo.available {
            return Ok(());
        }

        let Ok(head) = self.git.get_commit_hash(&wt.path, "HEAD").await else {
            return Ok(());
        };
        let full_ref = self.read_head_ref(&wt.path).await;

        let target_ref = if full_ref.starts_with("refs/") {
            full_ref.clone()
        } else {
            format!("refs/heads/{full_ref}")
        };
        let canonical = self
            .git
            .show_ref(&repo.path, &target_ref)
            .await
            .map_err(transient)?;
        if canonical.as_deref() != Some(head.as_str()) {
            self.sync_commit(wt, &full_ref, &head).await?;
        }

        if wt.is_on_private_ref() {
            self.reverse_sync(wt).await?;
        }
        Ok(())
    }
}

fn transient(e: anyhow::Error) -> Error {
    Error::TransientGit(format!("{e:#}"))
}
