//! Pull-request state syncer.
//!
//! A process-wide singleton that polls GitHub once a minute with one
//! alias-batched GraphQL query per repository, caching the results keyed
//! `"<owner>/<repo>#<number>"`. The state manager reads from this cache
//! when enhancing worktree snapshots for outbound reads.

pub mod github;

pub use github::{GhCliClient, GithubClient};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::state::{PullRequestState, StateManager, Worktree, WorktreeUpdate};

const TICK_INTERVAL: Duration = Duration::from_secs(60);

static PR_URL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"github\.com/([^/\s]+)/([^/\s]+)/pull/(\d+)").expect("valid regex")
});

/// Parse `"<owner>/<repo>"` and the PR number out of a GitHub PR URL.
pub fn parse_pr_url(url: &str) -> Option<(String, u64)> {
    let caps = PR_URL_RE.captures(url)?;
    let repo = format!("{}/{}", &caps[1], &caps[2]);
    let number = caps[3].parse().ok()?;
    Some((repo, number))
}

/// One aliased GraphQL query fetching every PR of one repository.
pub fn build_batch_query(owner: &str, name: &str, numbers: &[u64]) -> String {
    let mut fields = String::new();
    for n in numbers {
        fields.push_str(&format!(
            "pr{n}: pullRequest(number: {n}) {{ number title state url }} "
        ));
    }
    format!(
        "query {{ repository(owner: \"{owner}\", name: \"{name}\") {{ {fields}}} }}"
    )
}

pub struct PullRequestSyncer {
    state: Arc<StateManager>,
    github: Arc<dyn GithubClient>,
    cache: RwLock<HashMap<String, PullRequestState>>,
    stop_tx: watch::Sender<bool>,
    started: AtomicBool,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl PullRequestSyncer {
    pub fn new(state: Arc<StateManager>, github: Arc<dyn GithubClient>) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            state,
            github,
            cache: RwLock::new(HashMap::new()),
            stop_tx,
            started: AtomicBool::new(false),
            task: std::sync::Mutex::new(None),
        }
    }

    /// Start the 60-second ticker. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let syncer = Arc::clone(self);
        let mut stop_rx = self.stop_tx.subscribe();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(TICK_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = ticker.tick() => syncer.tick().await,
                }
            }
        });
        *self.task.lock().unwrap() = Some(task);
        info!("pull-request syncer started");
    }

    /// Stop the ticker. Idempotent.
    pub async fn stop(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.stop_tx.send(true);
        let task = self.task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        info!("pull-request syncer stopped");
    }

    /// One polling pass: group worktrees by repository, query each group,
    /// refresh the cache. Per-repository failures do not abort the tick.
    pub async fn tick(&self) {
        let worktrees = self.state.all_worktrees();

        let mut groups: HashMap<String, Vec<u64>> = HashMap::new();
        for wt in &worktrees {
            let Some(url) = &wt.pull_request_url else {
                continue;
            };
            let Some((repo, number)) = parse_pr_url(url) else {
                continue;
            };
            let numbers = groups.entry(repo).or_default();
            if !numbers.contains(&number) {
                numbers.push(number);
            }
        }

        for (repo, numbers) in groups {
            if let Err(e) = self.sync_repository(&repo, &numbers, &worktrees).await {
                warn!("PR sync for {repo} failed: {e:#}");
            }
        }
    }

    async fn sync_repository(
        &self,
        repo: &str,
        numbers: &[u64],
        worktrees: &[Worktree],
    ) -> anyhow::Result<()> {
        let (owner, name) = repo
            .split_once('/')
            .ok_or_else(|| anyhow::anyhow!("malformed repository id: {repo}"))?;
        let query = build_batch_query(owner, name, numbers);
        let response = self.github.graphql(&query).await?;

        let repository = &response["data"]["repository"];
        let mut fresh = Vec::new();
        for n in numbers {
            let node = &repository[format!("pr{n}")];
            if node.is_null() {
                debug!("PR {repo}#{n} not returned");
                continue;
            }
            let url = node["url"].as_str().unwrap_or_default().to_string();
            let worktree_ids: Vec<String> = worktrees
                .iter()
                .filter(|wt| {
                    wt.pull_request_url
                        .as_deref()
                        .and_then(parse_pr_url)
                        .is_some_and(|(r, num)| r == repo && num == *n)
                })
                .map(|wt| wt.id.clone())
                .collect();

            fresh.push(PullRequestState {
                number: *n,
                state: node["state"].as_str().unwrap_or("UNKNOWN").to_string(),
                repository: repo.to_string(),
                url,
                title: node["title"].as_str().unwrap_or_default().to_string(),
                last_synced: Utc::now(),
                worktree_ids,
            });
        }

        let mut cache = self.cache.write().unwrap();
        for pr in fresh {
            let key = PullRequestState::cache_key(repo, pr.number);
            cache.insert(key, pr);
        }
        Ok(())
    }

    pub fn get(&self, repo: &str, number: u64) -> Option<PullRequestState> {
        self.cache
            .read()
            .unwrap()
            .get(&PullRequestState::cache_key(repo, number))
            .cloned()
    }

    pub fn all(&self) -> Vec<PullRequestState> {
        self.cache.read().unwrap().values().cloned().collect()
    }

    /// The sparse update that folds a worktree's cached PR facts into its
    /// snapshot, `None` when nothing is cached for it.
    pub fn enhancement_for(&self, wt: &Worktree) -> Option<WorktreeUpdate> {
        let (repo, number) = wt.pull_request_url.as_deref().and_then(parse_pr_url)?;
        let pr = self.get(&repo, number)?;
        Some(WorktreeUpdate {
            pull_request_title: Some(pr.title),
            pull_request_state: Some(pr.state),
            pull_request_last_synced: Some(pr.last_synced),
            ..Default::default()
        })
    }
}
