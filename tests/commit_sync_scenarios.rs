//! Commit-sync scenarios: mirroring worktree commits into the canonical
//! repository, with and without an object fetch.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use tempfile::TempDir;

use catnip::git::{GitCommandRunner, GitService};
use catnip::state::{ClaudeActivityState, Repository, StateManager, Worktree};
use catnip::status::StatusCache;
use catnip::subprocess::{MockProcessRunner, ProcessRunner};
use catnip::sync::{temp_remote_name, CommitSyncEngine};

struct Fixture {
    engine: CommitSyncEngine,
    state: Arc<StateManager>,
    mock: MockProcessRunner,
    _state_dir: TempDir,
}

fn fixture(repo_path: &Path, wt_path: &Path) -> Fixture {
    let state_dir = TempDir::new().unwrap();
    let state = Arc::new(StateManager::load(state_dir.path()).unwrap());
    state
        .add_repository(Repository {
            id: "local/alpha".into(),
            url: String::new(),
            path: repo_path.to_path_buf(),
            default_branch: "main".into(),
            description: String::new(),
            available: true,
            created_at: Utc::now(),
            last_accessed: Utc::now(),
        })
        .unwrap();
    state
        .add_worktree(Worktree {
            id: "w1".into(),
            repo_id: "local/alpha".into(),
            name: "alpha/feline".into(),
            path: wt_path.to_path_buf(),
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
        })
        .unwrap();

    let mock = MockProcessRunner::new();
    let git: Arc<dyn GitService> = Arc::new(GitCommandRunner::new(
        Arc::new(mock.clone()) as Arc<dyn ProcessRunner>
    ));
    let engine = CommitSyncEngine::new(
        Arc::clone(&state),
        git,
        Arc::new(StatusCache::new()),
        "live",
    );
    Fixture {
        engine,
        state,
        mock,
        _state_dir: state_dir,
    }
}

/// The canonical repository already holds the commit: the ref is
/// updated in place, no temporary remote, no fetch.
#[tokio::test]
async fn sync_to_existing_commit_updates_ref_only() {
    let f = fixture(Path::new("/repos/alpha"), Path::new("/t/w1"));

    // Both existence probes succeed.
    f.mock
        .expect_command("git")
        .with_args(|a| a.first().map(String::as_str) == Some("cat-file"))
        .finish();
    // No nice-branch mapping.
    f.mock
        .expect_command("git")
        .with_args(|a| a.first().map(String::as_str) == Some("config"))
        .returns_exit_code(1)
        .finish();
    f.mock.expect_success("git", &["update-ref"], "");

    let wt = f.state.get_worktree("w1").unwrap();
    f.engine
        .sync_commit(&wt, "refs/catnip/feline", "bbbb")
        .await
        .unwrap();

    let calls = f.mock.get_calls();
    assert!(calls.iter().all(|c| c.args[0] != "fetch"), "no fetch");
    assert!(
        calls.iter().all(|c| c.args[0] != "remote"),
        "no temporary remote"
    );
    let update = calls.iter().find(|c| c.args[0] == "update-ref").unwrap();
    assert_eq!(update.args, vec!["update-ref", "refs/catnip/feline", "bbbb"]);
}

/// The canonical repository lacks the commit: a `sync-` remote is
/// created, the objects are fetched with a full-ref refspec, the ref is
/// updated, and the remote is removed afterwards.
#[tokio::test]
async fn sync_missing_commit_fetches_and_removes_remote() {
    let repo_dir = TempDir::new().unwrap();
    let wt_dir = TempDir::new().unwrap();
    let f = fixture(repo_dir.path(), wt_dir.path());

    f.mock
        .expect_command("git")
        .with_args(|a| a.first().map(String::as_str) == Some("cat-file"))
        .in_dir(wt_dir.path())
        .finish();
    f.mock
        .expect_command("git")
        .with_args(|a| a.first().map(String::as_str) == Some("cat-file"))
        .in_dir(repo_dir.path())
        .returns_exit_code(1)
        .finish();
    f.mock
        .expect_command("git")
        .with_args(|a| a.first().map(String::as_str) == Some("config"))
        .returns_exit_code(1)
        .finish();
    f.mock
        .expect_command("git")
        .with_args(|a| a.first().map(String::as_str) == Some("remote"))
        .finish();
    f.mock
        .expect_success("git", &["rev-parse", "--git-common-dir"], ".");
    f.mock.expect_success("git", &["fetch"], "");
    f.mock.expect_success("git", &["update-ref"], "");

    let wt = f.state.get_worktree("w1").unwrap();
    f.engine
        .sync_commit(&wt, "refs/catnip/feline", "cccc")
        .await
        .unwrap();

    let calls = f.mock.get_calls();
    let expected_remote = temp_remote_name("local/alpha", "refs/catnip/feline");
    assert!(expected_remote.starts_with("sync-"));

    let add_idx = calls
        .iter()
        .position(|c| c.args.first().map(String::as_str) == Some("remote")
            && c.args.get(1).map(String::as_str) == Some("add"))
        .expect("temporary remote added");
    assert_eq!(calls[add_idx].args[2], expected_remote);

    let fetch_idx = calls
        .iter()
        .position(|c| c.args[0] == "fetch")
        .expect("fetch issued");
    assert!(calls[fetch_idx]
        .args
        .contains(&"refs/catnip/feline:refs/catnip/feline".to_string()));

    let update_idx = calls
        .iter()
        .position(|c| c.args[0] == "update-ref")
        .expect("canonical ref updated");

    let cleanup_idx = calls
        .iter()
        .rposition(|c| c.args.first().map(String::as_str) == Some("remote")
            && c.args.get(1).map(String::as_str) == Some("remove")
            && c.args.get(2).map(String::as_str) == Some(expected_remote.as_str()))
        .expect("temporary remote removed");

    assert!(add_idx < fetch_idx);
    assert!(fetch_idx < update_idx);
    assert!(update_idx < cleanup_idx, "remote outlived the sync");
}

/// With a mapped nice branch, the nice-branch sync runs first and
/// fast-forwards the nice ref.
#[tokio::test]
async fn sync_with_mapping_also_updates_nice_branch() {
    let repo_dir = TempDir::new().unwrap();
    let wt_dir = TempDir::new().unwrap();
    let f = fixture(repo_dir.path(), wt_dir.path());

    f.mock
        .expect_command("git")
        .with_args(|a| a.first().map(String::as_str) == Some("cat-file"))
        .finish();
    f.mock.expect_success(
        "git",
        &["config", "--get", "catnip.branch-map.refs.catnip.feline"],
        "feature/feline\n",
    );
    // Nice branch exists at an older commit that is an ancestor.
    f.mock
        .expect_command("git")
        .with_args(|a| a.first().map(String::as_str) == Some("show-ref"))
        .returns_stdout("oldd\n")
        .finish();
    f.mock.expect_success("git", &["merge-base"], "oldd\n");
    f.mock.expect_success("git", &["update-ref"], "");
    // No live remote configured for this repository.
    f.mock
        .expect_command("git")
        .with_args(|a| a.get(1).map(String::as_str) == Some("get-url"))
        .returns_exit_code(2)
        .returns_stderr("error: No such remote 'live'")
        .finish();

    let wt = f.state.get_worktree("w1").unwrap();
    f.engine
        .sync_commit(&wt, "refs/catnip/feline", "bbbb")
        .await
        .unwrap();

    let updates: Vec<_> = f
        .mock
        .get_calls()
        .into_iter()
        .filter(|c| c.args[0] == "update-ref")
        .collect();
    assert!(updates
        .iter()
        .any(|c| c.args == vec!["update-ref", "refs/heads/feature/feline", "bbbb"]));
    assert!(updates
        .iter()
        .any(|c| c.args == vec!["update-ref", "refs/catnip/feline", "bbbb"]));
}
