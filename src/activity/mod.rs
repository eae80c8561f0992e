//! Agent liveness classification.
//!
//! Claude writes an append-only JSONL log per session under
//! `~/.claude/projects/<flattened-worktree-path>/`. The tracker combines the
//! newest session file's modification time with a live-process probe to
//! classify each worktree as Inactive / Running / Active. It never mutates
//! state; the state manager's activity ticker is the only writer.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};
use tracing::trace;
use uuid::Uuid;

use crate::state::ClaudeActivityState;

/// A session file touched within this window means the agent is active.
const ACTIVE_WINDOW: Duration = Duration::from_secs(5 * 60);

/// Without a live process the window shrinks: a dead agent's file goes
/// stale quickly.
const ACTIVE_WINDOW_NO_PROCESS: Duration = Duration::from_secs(2 * 60);

/// Probe for live agent processes working in a given directory.
pub trait ProcessScanner: Send + Sync {
    fn has_live_agent(&self, worktree: &Path) -> bool;
}

/// Production scanner over the system process table: a process whose
/// current working directory is inside the worktree counts as live.
pub struct SysinfoScanner {
    system: std::sync::Mutex<System>,
}

impl SysinfoScanner {
    pub fn new() -> Self {
        Self {
            system: std::sync::Mutex::new(System::new()),
        }
    }
}

impl Default for SysinfoScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessScanner for SysinfoScanner {
    fn has_live_agent(&self, worktree: &Path) -> bool {
        let mut system = self.system.lock().unwrap();
        system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::nothing().with_cwd(UpdateKind::Always),
        );
        system.processes().values().any(|process| {
            process
                .cwd()
                .is_some_and(|cwd| cwd.starts_with(worktree))
        })
    }
}

/// Map a worktree path to its Claude projects directory:
/// `/a/b/c` → `<projects_root>/-a-b-c`.
pub fn session_dir_for(projects_root: &Path, worktree: &Path) -> PathBuf {
    let flattened: String = worktree
        .to_string_lossy()
        .chars()
        .map(|c| if c == '/' || c == '.' { '-' } else { c })
        .collect();
    projects_root.join(flattened)
}

/// Newest `.jsonl` session file whose basename is a valid UUID, with its
/// modification time.
pub fn newest_session_file(dir: &Path) -> Option<(PathBuf, SystemTime)> {
    let entries = std::fs::read_dir(dir).ok()?;
    let mut newest: Option<(PathBuf, SystemTime)> = None;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().is_none_or(|e| e != "jsonl") {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if Uuid::parse_str(stem).is_err() {
            continue;
        }
        let Ok(modified) = entry.metadata().and_then(|m| m.modified()) else {
            continue;
        };
        if newest.as_ref().is_none_or(|(_, t)| modified > *t) {
            newest = Some((path, modified));
        }
    }
    newest
}

/// Pure classification over the two observations.
pub fn classify(last_modified: Option<Duration>, live_process: bool) -> ClaudeActivityState {
    match last_modified {
        None => {
            if live_process {
                ClaudeActivityState::Running
            } else {
                ClaudeActivityState::Inactive
            }
        }
        Some(age) => {
            let window = if live_process {
                ACTIVE_WINDOW
            } else {
                ACTIVE_WINDOW_NO_PROCESS
            };
            if age <= window {
                ClaudeActivityState::Active
            } else if live_process {
                ClaudeActivityState::Running
            } else {
                ClaudeActivityState::Inactive
            }
        }
    }
}

pub struct ActivityTracker {
    projects_root: PathBuf,
    scanner: Arc<dyn ProcessScanner>,
}

impl ActivityTracker {
    pub fn new(projects_root: PathBuf, scanner: Arc<dyn ProcessScanner>) -> Self {
        Self {
            projects_root,
            scanner,
        }
    }

    /// Default projects root: `~/.claude/projects`.
    pub fn default_projects_root() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/"))
            .join(".claude/projects")
    }

    /// Current activity classification for a worktree, plus whether a live
    /// session should be assumed.
    pub fn state_for(&self, worktree: &Path) -> (ClaudeActivityState, bool) {
        let dir = session_dir_for(&self.projects_root, worktree);
        let age = newest_session_file(&dir)
            .and_then(|(_, modified)| SystemTime::now().duration_since(modified).ok());
        let live = self.scanner.has_live_agent(worktree);
        let state = classify(age, live);
        trace!(
            "activity for {}: {:?} (age {:?}, live {})",
            worktree.display(),
            state,
            age,
            live
        );
        (state, state.implies_active_session())
    }

    /// The newest session file's UUID for a worktree, if any.
    pub fn current_session_uuid(&self, worktree: &Path) -> Option<String> {
        let dir = session_dir_for(&self.projects_root, worktree);
        let (path, _) = newest_session_file(&dir)?;
        path.file_stem().map(|s| s.to_string_lossy().into_owned())
    }
}
