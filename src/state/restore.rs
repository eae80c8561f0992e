//! Boot-time restoration of repositories and worktrees.
//!
//! After a process restart the state file describes worktrees whose
//! directories may no longer exist (container rebuilds, volume remounts).
//! Restoration re-creates them: preferentially by re-linking the surviving
//! worktree metadata inside the parent repository, otherwise by a fresh
//! `worktree add` driven from the recorded ref.

use std::collections::HashMap;
use std::fs;

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::git::GitService;

use super::manager::StateManager;
use super::models::{branch_map_key, Repository, Worktree};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RestoreReport {
    pub restored: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl StateManager {
    /// Run the restoration protocol. Idempotent when all paths are present.
    pub async fn restore_state(&self, git: &dyn GitService) -> Result<RestoreReport> {
        let repositories = self.all_repositories();

        let mut availability = HashMap::new();
        for repo in &repositories {
            let present = repo.path.exists();
            if !present {
                warn!(
                    "repository {} missing at {}, marking unavailable",
                    repo.id,
                    repo.path.display()
                );
            }
            availability.insert(repo.id.clone(), present);
        }

        let mut report = RestoreReport::default();
        for wt in self.all_worktrees() {
            let available = availability.get(&wt.repo_id).copied().unwrap_or(false);
            if !available {
                report.skipped += 1;
                continue;
            }
            let Some(repo) = repositories.iter().find(|r| r.id == wt.repo_id) else {
                report.skipped += 1;
                continue;
            };

            match self.restore_worktree(&wt, repo, git).await {
                Ok(()) => report.restored += 1,
                Err(e) => {
                    warn!("failed to restore worktree {}: {e:#}", wt.name);
                    report.failed += 1;
                }
            }
        }

        self.set_repository_availability(availability)?;
        info!(
            "state restored: {} restored, {} skipped, {} failed",
            report.restored, report.skipped, report.failed
        );
        Ok(report)
    }

    async fn restore_worktree(
        &self,
        wt: &Worktree,
        repo: &Repository,
        git: &dyn GitService,
    ) -> Result<()> {
        if !wt.path.exists() {
            let workspace = wt.workspace().to_string();
            // Bare repositories keep worktree metadata at the top level;
            // working clones keep it under .git/.
            let bare = !repo.path.join(".git").exists();
            let metadata = if bare {
                repo.path.join("worktrees").join(&workspace)
            } else {
                repo.path.join(".git").join("worktrees").join(&workspace)
            };

            if metadata.exists() {
                self.relink_worktree(wt, &metadata, git).await?;
            } else {
                self.recreate_worktree(wt, repo, git).await?;
            }
        }

        if wt.has_been_renamed {
            self.restore_nice_ref(wt, git).await?;
        }
        Ok(())
    }

    /// The parent repo still has the worktree's metadata: re-create the
    /// directory, point it at the metadata, and restore files from the index.
    async fn relink_worktree(
        &self,
        wt: &Worktree,
        metadata: &std::path::Path,
        git: &dyn GitService,
    ) -> Result<()> {
        debug!(
            "relinking worktree {} against metadata {}",
            wt.name,
            metadata.display()
        );
        fs::create_dir_all(&wt.path)?;
        fs::write(
            wt.path.join(".git"),
            format!("gitdir: {}\n", metadata.display()),
        )?;
        git.checkout_index(&wt.path)
            .await
            .map_err(|e| Error::TransientGit(format!("{e:#}")))?;

        let dirty = git
            .has_uncommitted_changes(&wt.path)
            .await
            .map_err(|e| Error::TransientGit(format!("{e:#}")))?;
        if dirty {
            warn!("worktree {} restored but not clean", wt.name);
        }
        Ok(())
    }

    /// No surviving metadata: create a fresh worktree. When the branch has
    /// been renamed, creation is driven from the private ref so the
    /// nice-branch mapping survives; otherwise the recorded branch is used.
    async fn recreate_worktree(
        &self,
        wt: &Worktree,
        repo: &Repository,
        git: &dyn GitService,
    ) -> Result<()> {
        let start = if wt.has_been_renamed {
            wt.private_ref()
        } else {
            wt.branch.clone()
        };
        debug!("recreating worktree {} from {start}", wt.name);

        let path = wt.path.to_string_lossy().to_string();
        let output = git
            .execute_git(
                &repo.path,
                &["worktree", "add", "--force", &path, &start],
            )
            .await
            .map_err(|e| Error::TransientGit(format!("{e:#}")))?;
        if !output.status.success() {
            return Err(Error::TransientGit(format!(
                "worktree add failed: {}",
                output.stderr.trim()
            )));
        }
        Ok(())
    }

    /// Re-create `refs/heads/<nice>` from the config mapping when missing.
    async fn restore_nice_ref(&self, wt: &Worktree, git: &dyn GitService) -> Result<()> {
        let key = branch_map_key(&wt.private_ref());
        let Some(nice) = git
            .get_config(&wt.path, &key)
            .await
            .map_err(|e| Error::TransientGit(format!("{e:#}")))?
        else {
            return Ok(());
        };

        let nice_ref = format!("refs/heads/{nice}");
        let existing = git
            .show_ref(&wt.path, &nice_ref)
            .await
            .map_err(|e| Error::TransientGit(format!("{e:#}")))?;
        if existing.is_none() {
            let head = git
                .get_commit_hash(&wt.path, "HEAD")
                .await
                .map_err(|e| Error::TransientGit(format!("{e:#}")))?;
            debug!("re-creating missing nice ref {nice_ref} at {head}");
            git.update_ref(&wt.path, &nice_ref, &head)
                .await
                .map_err(|e| Error::TransientGit(format!("{e:#}")))?;
        }
        Ok(())
    }
}
