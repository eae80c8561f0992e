//! Git operations layer.
//!
//! The supervisor never manipulates git objects itself; every operation
//! shells out through [`GitService`], implemented by [`GitCommandRunner`]
//! over the subprocess abstraction. Keeping the surface trait-shaped lets
//! unit tests script git behavior with a mock runner and assert the exact
//! commands issued.

pub mod error;
pub mod parsers;
pub mod types;

pub use error::GitError;
pub use types::{
    CommitOptions, FetchStrategy, GitStatus, MergeOptions, MergeTreeResult, PushStrategy,
    WorktreeInfo,
};

use crate::subprocess::{ProcessCommandBuilder, ProcessOutput, ProcessRunner};
use anyhow::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// The git operations the supervisor core consumes.
///
/// Every method takes the path of a working or bare repository. Ref
/// arguments are passed through verbatim; callers decide between short
/// branch names and fully-qualified refs.
#[async_trait]
pub trait GitService: Send + Sync {
    // --- Refs ---

    async fn rev_parse(&self, repo: &Path, rev: &str) -> Result<String>;

    /// Escape hatch: run an arbitrary git command and hand back the raw
    /// output. The call itself succeeding does not imply exit code zero.
    async fn execute_git(&self, repo: &Path, args: &[&str]) -> Result<ProcessOutput>;

    async fn get_commit_hash(&self, repo: &Path, refname: &str) -> Result<String>;

    /// Resolve a fully-qualified ref, `None` when it does not exist.
    async fn show_ref(&self, repo: &Path, refname: &str) -> Result<Option<String>>;

    /// Read a symbolic ref (usually `HEAD`); `None` when detached.
    async fn symbolic_ref(&self, repo: &Path, name: &str) -> Result<Option<String>>;

    /// Short name of the checked-out branch, `None` when detached.
    async fn current_branch(&self, repo: &Path) -> Result<Option<String>>;

    async fn update_ref(&self, repo: &Path, refname: &str, hash: &str) -> Result<()>;

    async fn delete_ref(&self, repo: &Path, refname: &str) -> Result<()>;

    async fn branch_exists(&self, repo: &Path, name: &str) -> Result<bool>;

    async fn list_branches(&self, repo: &Path) -> Result<Vec<String>>;

    async fn rename_branch(&self, repo: &Path, old: &str, new: &str) -> Result<()>;

    async fn create_branch(&self, repo: &Path, name: &str, start_point: &str) -> Result<()>;

    async fn delete_branch(&self, repo: &Path, name: &str) -> Result<()>;

    /// `rev-list --count <range>`, e.g. `main..HEAD`.
    async fn get_commit_count(&self, repo: &Path, range: &str) -> Result<u32>;

    async fn get_commit_message(&self, repo: &Path, refname: &str) -> Result<String>;

    async fn get_commit_author(&self, repo: &Path, refname: &str) -> Result<String>;

    /// `cat-file -e <hash>^{commit}`.
    async fn commit_exists(&self, repo: &Path, hash: &str) -> Result<bool>;

    /// `None` when the two commits share no history.
    async fn merge_base(&self, repo: &Path, a: &str, b: &str) -> Result<Option<String>>;

    // --- Worktrees ---

    async fn list_worktrees(&self, repo: &Path) -> Result<Vec<WorktreeInfo>>;

    async fn prune_worktrees(&self, repo: &Path) -> Result<()>;

    // --- Config ---

    async fn get_config(&self, repo: &Path, key: &str) -> Result<Option<String>>;

    async fn set_config(&self, repo: &Path, key: &str, value: &str) -> Result<()>;

    async fn unset_config(&self, repo: &Path, key: &str) -> Result<()>;

    // --- Remotes ---

    async fn get_remotes(&self, repo: &Path) -> Result<Vec<String>>;

    async fn add_remote(&self, repo: &Path, name: &str, url: &str) -> Result<()>;

    async fn remove_remote(&self, repo: &Path, name: &str) -> Result<()>;

    async fn get_remote_url(&self, repo: &Path, name: &str) -> Result<Option<String>>;

    // --- Transfer ---

    async fn fetch(
        &self,
        repo: &Path,
        remote: &str,
        refspec: &str,
        strategy: FetchStrategy,
    ) -> Result<()>;

    async fn push(&self, repo: &Path, strategy: &PushStrategy) -> Result<()>;

    // --- Integration ---

    async fn merge(&self, repo: &Path, refname: &str, opts: &MergeOptions) -> Result<()>;

    async fn rebase(&self, repo: &Path, refname: &str) -> Result<()>;

    /// Conflict probe without touching the working tree.
    async fn merge_tree(&self, repo: &Path, a: &str, b: &str) -> Result<MergeTreeResult>;

    async fn has_uncommitted_changes(&self, repo: &Path) -> Result<bool>;

    async fn has_staged_changes(&self, repo: &Path) -> Result<bool>;

    async fn get_status(&self, repo: &Path) -> Result<GitStatus>;

    async fn get_conflicted_files(&self, repo: &Path) -> Result<Vec<PathBuf>>;

    async fn has_conflict_markers(&self, repo: &Path) -> Result<bool>;

    /// Returns the new commit hash.
    async fn commit(&self, repo: &Path, message: &str, opts: CommitOptions) -> Result<String>;

    async fn reset_mixed(&self, repo: &Path, refname: &str) -> Result<()>;

    /// Restore all files from the index into the working tree.
    async fn checkout_index(&self, repo: &Path) -> Result<()>;

    // --- Housekeeping ---

    async fn garbage_collect(&self, repo: &Path) -> Result<()>;

    async fn is_bare(&self, repo: &Path) -> Result<bool>;

    /// The repository's common git directory (shared across worktrees).
    async fn common_dir(&self, repo: &Path) -> Result<PathBuf>;
}

/// Fetch with `--unshallow` first when the repository is shallow, falling
/// back to a regular fetch when the unshallow attempt fails.
pub async fn fetch_unshallow_first(
    git: &dyn GitService,
    repo: &Path,
    remote: &str,
    refspec: &str,
) -> Result<()> {
    let shallow_marker = git.common_dir(repo).await?.join("shallow");
    if shallow_marker.exists() {
        match git.fetch(repo, remote, refspec, FetchStrategy::Unshallow).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                tracing::debug!("unshallow fetch failed, retrying regular fetch: {e:#}");
            }
        }
    }
    git.fetch(repo, remote, refspec, FetchStrategy::Fast).await
}

/// Push with rejection recovery: when the remote rejects and the strategy
/// asks for it, fetch + rebase the branch and retry exactly once.
pub async fn push_with_recovery(
    git: &dyn GitService,
    repo: &Path,
    strategy: &PushStrategy,
) -> Result<()> {
    match git.push(repo, strategy).await {
        Ok(()) => Ok(()),
        Err(e) => {
            let rejected = matches!(
                e.downcast_ref::<GitError>(),
                Some(GitError::PushRejected(_))
            );
            if !(rejected && strategy.sync_on_fail) {
                return Err(e);
            }
            tracing::warn!(
                "push of {} rejected, syncing and retrying once",
                strategy.refspec
            );
            let branch = strategy
                .refspec
                .split(':')
                .next()
                .unwrap_or(&strategy.refspec);
            git.fetch(repo, &strategy.remote, branch, FetchStrategy::Fast)
                .await?;
            git.rebase(repo, &format!("{}/{}", strategy.remote, branch))
                .await?;
            let retry = PushStrategy {
                sync_on_fail: false,
                ..strategy.clone()
            };
            git.push(repo, &retry).await
        }
    }
}

/// Production implementation shelling out through the subprocess layer.
pub struct GitCommandRunner {
    process_runner: Arc<dyn ProcessRunner>,
}

impl GitCommandRunner {
    pub fn new(process_runner: Arc<dyn ProcessRunner>) -> Self {
        Self { process_runner }
    }

    async fn run_git(&self, path: &Path, args: &[&str]) -> Result<ProcessOutput> {
        let command = ProcessCommandBuilder::new("git")
            .args(args)
            .current_dir(path)
            .build();

        self.process_runner
            .run(command)
            .await
            .map_err(|e| GitError::CommandFailed(format!("git {}: {e}", args.join(" "))).into())
    }

    async fn run_git_checked(&self, path: &Path, args: &[&str]) -> Result<ProcessOutput> {
        let output = self.run_git(path, args).await?;
        if !output.status.success() {
            return Err(GitError::CommandFailed(format!(
                "git {} failed: {}",
                args.join(" "),
                output.stderr.trim()
            ))
            .into());
        }
        Ok(output)
    }
}

#[async_trait]
impl GitService for GitCommandRunner {
    async fn rev_parse(&self, repo: &Path, rev: &str) -> Result<String> {
        let output = self.run_git(repo, &["rev-parse", rev]).await?;
        if !output.status.success() {
            return Err(GitError::RefNotFound(rev.to_string()).into());
        }
        Ok(output.stdout.trim().to_string())
    }

    async fn execute_git(&self, repo: &Path, args: &[&str]) -> Result<ProcessOutput> {
        self.run_git(repo, args).await
    }

    async fn get_commit_hash(&self, repo: &Path, refname: &str) -> Result<String> {
        self.rev_parse(repo, refname).await
    }

    async fn show_ref(&self, repo: &Path, refname: &str) -> Result<Option<String>> {
        let output = self
            .run_git(repo, &["show-ref", "--verify", "--hash", refname])
            .await?;
        if !output.status.success() {
            return Ok(None);
        }
        let hash = output.stdout.trim().to_string();
        Ok((!hash.is_empty()).then_some(hash))
    }

    async fn symbolic_ref(&self, repo: &Path, name: &str) -> Result<Option<String>> {
        let output = self.run_git(repo, &["symbolic-ref", "-q", name]).await?;
        if !output.status.success() {
            return Ok(None);
        }
        Ok(Some(output.stdout.trim().to_string()))
    }

    async fn current_branch(&self, repo: &Path) -> Result<Option<String>> {
        let output = self
            .run_git_checked(repo, &["branch", "--show-current"])
            .await?;
        let branch = output.stdout.trim();
        Ok((!branch.is_empty()).then(|| branch.to_string()))
    }

    async fn update_ref(&self, repo: &Path, refname: &str, hash: &str) -> Result<()> {
        self.run_git_checked(repo, &["update-ref", refname, hash])
            .await?;
        Ok(())
    }

    async fn delete_ref(&self, repo: &Path, refname: &str) -> Result<()> {
        self.run_git_checked(repo, &["update-ref", "-d", refname])
            .await?;
        Ok(())
    }

    async fn branch_exists(&self, repo: &Path, name: &str) -> Result<bool> {
        let refname = format!("refs/heads/{name}");
        Ok(self.show_ref(repo, &refname).await?.is_some())
    }

    async fn list_branches(&self, repo: &Path) -> Result<Vec<String>> {
        let output = self
            .run_git_checked(
                repo,
                &["for-each-ref", "--format=%(refname:short)", "refs/heads/"],
            )
            .await?;
        Ok(output
            .stdout
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect())
    }

    async fn rename_branch(&self, repo: &Path, old: &str, new: &str) -> Result<()> {
        let output = self.run_git(repo, &["branch", "-m", old, new]).await?;
        if !output.status.success() {
            if output.stderr.contains("already exists") {
                return Err(GitError::BranchExists(new.to_string()).into());
            }
            if output.stderr.contains("No branch named") || output.stderr.contains("doesn't exist")
            {
                return Err(GitError::BranchNotFound(old.to_string()).into());
            }
            return Err(GitError::CommandFailed(output.stderr.trim().to_string()).into());
        }
        Ok(())
    }

    async fn create_branch(&self, repo: &Path, name: &str, start_point: &str) -> Result<()> {
        let output = self.run_git(repo, &["branch", name, start_point]).await?;
        if !output.status.success() {
            if output.stderr.contains("already exists") {
                return Err(GitError::BranchExists(name.to_string()).into());
            }
            return Err(GitError::CommandFailed(output.stderr.trim().to_string()).into());
        }
        Ok(())
    }

    async fn delete_branch(&self, repo: &Path, name: &str) -> Result<()> {
        let output = self.run_git(repo, &["branch", "-D", name]).await?;
        if !output.status.success() {
            if output.stderr.contains("not found") {
                return Err(GitError::BranchNotFound(name.to_string()).into());
            }
            return Err(GitError::CommandFailed(output.stderr.trim().to_string()).into());
        }
        Ok(())
    }

    async fn get_commit_count(&self, repo: &Path, range: &str) -> Result<u32> {
        let output = self
            .run_git_checked(repo, &["rev-list", "--count", range])
            .await?;
        output
            .stdout
            .trim()
            .parse::<u32>()
            .map_err(|e| GitError::CommandFailed(format!("bad rev-list count: {e}")).into())
    }

    async fn get_commit_message(&self, repo: &Path, refname: &str) -> Result<String> {
        let output = self
            .run_git(repo, &["log", "-1", "--pretty=format:%s", refname])
            .await?;
        if !output.status.success() {
            return Err(GitError::CommitNotFound(refname.to_string()).into());
        }
        Ok(output.stdout.trim().to_string())
    }

    async fn get_commit_author(&self, repo: &Path, refname: &str) -> Result<String> {
        let output = self
            .run_git(repo, &["log", "-1", "--pretty=format:%an <%ae>", refname])
            .await?;
        if !output.status.success() {
            return Err(GitError::CommitNotFound(refname.to_string()).into());
        }
        Ok(output.stdout.trim().to_string())
    }

    async fn commit_exists(&self, repo: &Path, hash: &str) -> Result<bool> {
        let probe = format!("{hash}^{{commit}}");
        let output = self.run_git(repo, &["cat-file", "-e", &probe]).await?;
        Ok(output.status.success())
    }

    async fn merge_base(&self, repo: &Path, a: &str, b: &str) -> Result<Option<String>> {
        let output = self.run_git(repo, &["merge-base", a, b]).await?;
        if !output.status.success() {
            return Ok(None);
        }
        Ok(Some(output.stdout.trim().to_string()))
    }

    async fn list_worktrees(&self, repo: &Path) -> Result<Vec<WorktreeInfo>> {
        let output = self
            .run_git_checked(repo, &["worktree", "list", "--porcelain"])
            .await?;
        parsers::parse_worktree_list(&output.stdout)
    }

    async fn prune_worktrees(&self, repo: &Path) -> Result<()> {
        self.run_git_checked(repo, &["worktree", "prune"]).await?;
        Ok(())
    }

    async fn get_config(&self, repo: &Path, key: &str) -> Result<Option<String>> {
        let output = self.run_git(repo, &["config", "--get", key]).await?;
        if !output.status.success() {
            return Ok(None);
        }
        Ok(Some(output.stdout.trim().to_string()))
    }

    async fn set_config(&self, repo: &Path, key: &str, value: &str) -> Result<()> {
        self.run_git_checked(repo, &["config", key, value]).await?;
        Ok(())
    }

    async fn unset_config(&self, repo: &Path, key: &str) -> Result<()> {
        let output = self.run_git(repo, &["config", "--unset", key]).await?;
        // Exit code 5 means the key was not set, which is fine here.
        if !output.status.success() && output.status.code() != Some(5) {
            return Err(GitError::CommandFailed(output.stderr.trim().to_string()).into());
        }
        Ok(())
    }

    async fn get_remotes(&self, repo: &Path) -> Result<Vec<String>> {
        let output = self.run_git_checked(repo, &["remote"]).await?;
        Ok(output
            .stdout
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect())
    }

    async fn add_remote(&self, repo: &Path, name: &str, url: &str) -> Result<()> {
        let output = self.run_git(repo, &["remote", "add", name, url]).await?;
        if !output.status.success() {
            if output.stderr.contains("already exists") {
                return Err(GitError::RemoteExists(name.to_string()).into());
            }
            return Err(GitError::CommandFailed(output.stderr.trim().to_string()).into());
        }
        Ok(())
    }

    async fn remove_remote(&self, repo: &Path, name: &str) -> Result<()> {
        let output = self.run_git(repo, &["remote", "remove", name]).await?;
        if !output.status.success() {
            if output.stderr.contains("No such remote") {
                return Err(GitError::RemoteNotFound(name.to_string()).into());
            }
            return Err(GitError::CommandFailed(output.stderr.trim().to_string()).into());
        }
        Ok(())
    }

    async fn get_remote_url(&self, repo: &Path, name: &str) -> Result<Option<String>> {
        let output = self.run_git(repo, &["remote", "get-url", name]).await?;
        if !output.status.success() {
            return Ok(None);
        }
        Ok(Some(output.stdout.trim().to_string()))
    }

    async fn fetch(
        &self,
        repo: &Path,
        remote: &str,
        refspec: &str,
        strategy: FetchStrategy,
    ) -> Result<()> {
        let mut args = vec!["fetch"];
        match strategy {
            FetchStrategy::Fast => args.extend(["--no-tags", "--prune"]),
            FetchStrategy::Full => args.push("--tags"),
            FetchStrategy::Unshallow => args.push("--unshallow"),
        }
        args.push(remote);
        args.push(refspec);
        self.run_git_checked(repo, &args).await?;
        Ok(())
    }

    async fn push(&self, repo: &Path, strategy: &PushStrategy) -> Result<()> {
        let mut args = vec!["push"];
        if strategy.force_with_lease {
            args.push("--force-with-lease");
        }
        args.push(&strategy.remote);
        args.push(&strategy.refspec);

        let output = self.run_git(repo, &args).await?;
        if !output.status.success() {
            let stderr = output.stderr.trim().to_string();
            if stderr.contains("[rejected]")
                || stderr.contains("failed to push some refs")
                || stderr.contains("stale info")
            {
                return Err(GitError::PushRejected(stderr).into());
            }
            return Err(GitError::CommandFailed(stderr).into());
        }
        Ok(())
    }

    async fn merge(&self, repo: &Path, refname: &str, opts: &MergeOptions) -> Result<()> {
        let mut args = vec!["merge"];
        if opts.no_ff {
            args.push("--no-ff");
        }
        if let Some(message) = &opts.message {
            args.push("-m");
            args.push(message);
        }
        args.push(refname);

        let output = self.run_git(repo, &args).await?;
        if !output.status.success() {
            if output.stdout.contains("CONFLICT") || output.stderr.contains("CONFLICT") {
                let files = self.get_conflicted_files(repo).await.unwrap_or_default();
                return Err(GitError::MergeConflict { files }.into());
            }
            return Err(GitError::CommandFailed(output.stderr.trim().to_string()).into());
        }
        Ok(())
    }

    async fn rebase(&self, repo: &Path, refname: &str) -> Result<()> {
        let output = self.run_git(repo, &["rebase", refname]).await?;
        if !output.status.success() {
            if output.stdout.contains("CONFLICT") || output.stderr.contains("CONFLICT") {
                let files = self.get_conflicted_files(repo).await.unwrap_or_default();
                // Leave the tree usable for the caller.
                let _ = self.run_git(repo, &["rebase", "--abort"]).await;
                return Err(GitError::MergeConflict { files }.into());
            }
            return Err(GitError::CommandFailed(output.stderr.trim().to_string()).into());
        }
        Ok(())
    }

    async fn merge_tree(&self, repo: &Path, a: &str, b: &str) -> Result<MergeTreeResult> {
        let output = self
            .run_git(repo, &["merge-tree", "--write-tree", "--name-only", a, b])
            .await?;
        match output.status.code() {
            Some(0) => Ok(parsers::parse_merge_tree(&output.stdout, true)),
            Some(1) => Ok(parsers::parse_merge_tree(&output.stdout, false)),
            _ => Err(GitError::CommandFailed(output.stderr.trim().to_string()).into()),
        }
    }

    async fn has_uncommitted_changes(&self, repo: &Path) -> Result<bool> {
        let output = self
            .run_git_checked(repo, &["status", "--porcelain"])
            .await?;
        Ok(!output.stdout.trim().is_empty())
    }

    async fn has_staged_changes(&self, repo: &Path) -> Result<bool> {
        let output = self
            .run_git(repo, &["diff", "--cached", "--quiet"])
            .await?;
        Ok(!output.status.success())
    }

    async fn get_status(&self, repo: &Path) -> Result<GitStatus> {
        let output = self
            .run_git_checked(repo, &["status", "--porcelain"])
            .await?;
        Ok(parsers::parse_status(&output.stdout))
    }

    async fn get_conflicted_files(&self, repo: &Path) -> Result<Vec<PathBuf>> {
        let output = self
            .run_git_checked(repo, &["diff", "--name-only", "--diff-filter=U"])
            .await?;
        Ok(output
            .stdout
            .lines()
            .map(|l| PathBuf::from(l.trim()))
            .filter(|p| !p.as_os_str().is_empty())
            .collect())
    }

    async fn has_conflict_markers(&self, repo: &Path) -> Result<bool> {
        let output = self
            .run_git(repo, &["grep", "-l", "-E", "^(<{7}|={7}|>{7})( |$)"])
            .await?;
        // grep exits 1 when nothing matches.
        Ok(output.status.success() && !output.stdout.trim().is_empty())
    }

    async fn commit(&self, repo: &Path, message: &str, opts: CommitOptions) -> Result<String> {
        let mut args = vec!["commit"];
        if opts.all {
            args.push("-a");
        }
        if opts.allow_empty {
            args.push("--allow-empty");
        }
        args.push("-m");
        args.push(message);

        let output = self.run_git(repo, &args).await?;
        if !output.status.success() {
            if output.stdout.contains("nothing to commit")
                || output.stderr.contains("nothing to commit")
            {
                return Err(GitError::NothingToCommit.into());
            }
            return Err(GitError::CommandFailed(output.stderr.trim().to_string()).into());
        }
        self.rev_parse(repo, "HEAD").await
    }

    async fn reset_mixed(&self, repo: &Path, refname: &str) -> Result<()> {
        self.run_git_checked(repo, &["reset", "--mixed", refname])
            .await?;
        Ok(())
    }

    async fn checkout_index(&self, repo: &Path) -> Result<()> {
        self.run_git_checked(repo, &["checkout-index", "-a", "-f"])
            .await?;
        Ok(())
    }

    async fn garbage_collect(&self, repo: &Path) -> Result<()> {
        self.run_git_checked(repo, &["gc", "--auto", "--quiet"])
            .await?;
        Ok(())
    }

    async fn is_bare(&self, repo: &Path) -> Result<bool> {
        let output = self
            .run_git_checked(repo, &["rev-parse", "--is-bare-repository"])
            .await?;
        Ok(output.stdout.trim() == "true")
    }

    async fn common_dir(&self, repo: &Path) -> Result<PathBuf> {
        let output = self
            .run_git_checked(repo, &["rev-parse", "--git-common-dir"])
            .await?;
        let dir = PathBuf::from(output.stdout.trim());
        if dir.is_absolute() {
            Ok(dir)
        } else {
            Ok(repo.join(dir))
        }
    }
}
