//! Agent session monitor.
//!
//! Tails each worktree's Claude session log, surfacing todos, the latest
//! user prompt, the last assistant message, and session titles. Structured
//! facts flow into the state manager (`todos`, `session_title`); transient
//! ones (prompts, messages) are answered from the in-memory registry.
//! A notify watcher over the projects root triggers immediate scans; a
//! periodic poller backstops it.

pub mod session;

pub use session::{parse_session_line, SessionRecord};

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use notify::{RecursiveMode, Watcher};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::activity::{newest_session_file, session_dir_for};
use crate::error::Result;
use crate::state::{ActiveSessionEntry, StateManager, TitleEntry, WorktreeUpdate};

const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Title history inside a session entry is bounded like the worktree's.
const ENTRY_TITLE_LIMIT: usize = 20;

#[derive(Debug, Default)]
struct SessionWatch {
    session_uuid: Option<String>,
    /// Byte offset already consumed from the current session file.
    offset: u64,
    entry: Option<ActiveSessionEntry>,
    latest_user_prompt: Option<String>,
    last_assistant_message: Option<String>,
}

pub struct AgentMonitor {
    state: Arc<StateManager>,
    projects_root: PathBuf,
    watches: Mutex<HashMap<String, SessionWatch>>,
    stop_tx: watch::Sender<bool>,
    started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl AgentMonitor {
    pub fn new(state: Arc<StateManager>, projects_root: PathBuf) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            state,
            projects_root,
            watches: Mutex::new(HashMap::new()),
            stop_tx,
            started: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Start the watcher and the periodic poller. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        // Change notifications from the projects root, when it exists.
        let (notify_tx, mut notify_rx) = tokio::sync::mpsc::channel::<()>(8);
        let watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            if res.is_ok() {
                let _ = notify_tx.try_send(());
            }
        })
        .ok()
        .and_then(|mut w| {
            w.watch(&self.projects_root, RecursiveMode::Recursive)
                .ok()
                .map(|()| w)
        });
        if watcher.is_none() {
            debug!(
                "projects root {} not watchable yet; relying on polling",
                self.projects_root.display()
            );
        }

        let monitor = Arc::clone(self);
        let mut stop_rx = self.stop_tx.subscribe();
        let task = tokio::spawn(async move {
            // Keep the watcher alive for the task's lifetime.
            let _watcher = watcher;
            let mut ticker = tokio::time::interval(POLL_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = ticker.tick() => monitor.scan_all(),
                    _ = notify_rx.recv() => monitor.scan_all(),
                }
            }
        });
        self.tasks.lock().unwrap().push(task);
        info!("agent monitor started");
    }

    /// Stop the poller. Idempotent.
    pub async fn stop(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.stop_tx.send(true);
        let tasks: Vec<_> = self.tasks.lock().unwrap().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        info!("agent monitor stopped");
    }

    /// One scan over every known worktree.
    pub fn scan_all(&self) {
        for wt in self.state.all_worktrees() {
            if let Err(e) = self.scan_worktree(&wt.id) {
                warn!("session scan for {} failed: {e}", wt.name);
            }
        }
    }

    /// Tail the newest session file of one worktree and absorb new records.
    pub fn scan_worktree(&self, worktree_id: &str) -> Result<()> {
        let Some(wt) = self.state.get_worktree(worktree_id) else {
            return Ok(());
        };
        let dir = session_dir_for(&self.projects_root, &wt.path);
        let Some((file, _)) = newest_session_file(&dir) else {
            return Ok(());
        };
        let uuid = file
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();

        // Registration happens under the registry mutex; file reads do not.
        let offset = {
            let mut watches = self.watches.lock().unwrap();
            let watch = watches.entry(wt.id.clone()).or_default();
            if watch.session_uuid.as_deref() != Some(uuid.as_str()) {
                if let Some(entry) = watch.entry.as_mut() {
                    entry.ended_at = Some(Utc::now());
                    debug!("session {} ended for {}", entry.claude_session_uuid, wt.name);
                }
                watch.session_uuid = Some(uuid.clone());
                watch.offset = 0;
                watch.entry = Some(ActiveSessionEntry {
                    claude_session_uuid: uuid.clone(),
                    title: None,
                    title_history: Vec::new(),
                    started_at: Utc::now(),
                    resumed_at: None,
                    ended_at: None,
                });
                debug!("session {uuid} started for {}", wt.name);
            }
            watch.offset
        };

        let (records, new_offset) = read_records_from(&file, offset)?;
        if records.is_empty() {
            return Ok(());
        }

        let mut todos_update = None;
        let mut new_title = None;
        {
            let mut watches = self.watches.lock().unwrap();
            let watch = watches.entry(wt.id.clone()).or_default();
            watch.offset = new_offset;
            for record in records {
                match record {
                    SessionRecord::UserPrompt { text } => {
                        watch.latest_user_prompt = Some(text);
                    }
                    SessionRecord::AssistantMessage { text } => {
                        watch.last_assistant_message = Some(text);
                    }
                    SessionRecord::Todos(todos) => {
                        todos_update = Some(todos);
                    }
                    SessionRecord::Summary { title } => {
                        if let Some(entry) = watch.entry.as_mut() {
                            if entry.title.as_deref() != Some(title.as_str()) {
                                entry.title = Some(title.clone());
                                entry.title_history.push(TitleEntry {
                                    title: title.clone(),
                                    timestamp: Utc::now(),
                                    commit_hash: (!wt.commit_hash.is_empty())
                                        .then(|| wt.commit_hash.clone()),
                                });
                                let overflow =
                                    entry.title_history.len().saturating_sub(ENTRY_TITLE_LIMIT);
                                if overflow > 0 {
                                    entry.title_history.drain(..overflow);
                                }
                            }
                        }
                        new_title = Some(title);
                    }
                    SessionRecord::Other => {}
                }
            }
        }

        // State-manager writes happen with the registry mutex released.
        if let Some(todos) = todos_update {
            self.state.update_worktree(
                &wt.id,
                WorktreeUpdate {
                    todos: Some(todos),
                    ..Default::default()
                },
            )?;
        }
        if let Some(title) = new_title {
            let commit = (!wt.commit_hash.is_empty()).then(|| wt.commit_hash.clone());
            self.state.update_session_title(&wt.id, &title, commit)?;
        }
        Ok(())
    }

    /// The live-session registry, keyed by workspace path.
    pub fn session_entries(&self) -> HashMap<PathBuf, ActiveSessionEntry> {
        let watches = self.watches.lock().unwrap();
        let mut entries = HashMap::new();
        for (id, watch) in watches.iter() {
            let (Some(entry), Some(wt)) = (&watch.entry, self.state.get_worktree(id)) else {
                continue;
            };
            entries.insert(wt.path, entry.clone());
        }
        entries
    }

    pub fn latest_user_prompt(&self, worktree_id: &str) -> Option<String> {
        self.watches
            .lock()
            .unwrap()
            .get(worktree_id)
            .and_then(|w| w.latest_user_prompt.clone())
    }

    pub fn last_assistant_message(&self, worktree_id: &str) -> Option<String> {
        self.watches
            .lock()
            .unwrap()
            .get(worktree_id)
            .and_then(|w| w.last_assistant_message.clone())
    }
}

/// Read complete JSONL lines appended since `offset`. A trailing partial
/// line is left for the next scan.
fn read_records_from(file: &Path, offset: u64) -> Result<(Vec<SessionRecord>, u64)> {
    let handle = std::fs::File::open(file)?;
    let mut reader = BufReader::new(handle);
    reader.seek(SeekFrom::Start(offset))?;

    let mut records = Vec::new();
    let mut consumed = offset;
    let mut line = String::new();
    loop {
        line.clear();
        let n = reader.read_line(&mut line)?;
        if n == 0 {
            break;
        }
        if !line.ends_with('\n') {
            // Mid-append; retry on the next scan.
            break;
        }
        consumed += n as u64;
        if let Some(record) = parse_session_line(&line) {
            records.push(record);
        }
    }
    Ok((records, consumed))
}
