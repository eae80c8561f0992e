//! Supervisor configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Runtime configuration. Everything has a sensible default; the CLI may
/// override directories.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Directory holding `state.json`.
    pub state_dir: PathBuf,
    /// Where new worktrees are created.
    pub worktree_base_dir: PathBuf,
    /// Remote that nice branches of locally-mounted repositories are pushed
    /// to.
    pub live_remote: String,
    /// Override for the Claude projects directory (session logs).
    pub claude_projects_dir: Option<PathBuf>,
    /// Seconds between activity reclassification passes.
    pub activity_interval_secs: u64,
    /// Capture dirty agent work into an automatic commit when a session
    /// goes inactive.
    pub auto_commit: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/"));
        Self {
            state_dir: home.join(".catnip"),
            worktree_base_dir: home.join(".catnip/worktrees"),
            live_remote: "live".to_string(),
            claude_projects_dir: None,
            activity_interval_secs: 30,
            auto_commit: false,
        }
    }
}

impl SupervisorConfig {
    pub fn activity_interval(&self) -> Duration {
        Duration::from_secs(self.activity_interval_secs.max(1))
    }

    pub fn state_file(&self) -> PathBuf {
        self.state_dir.join("state.json")
    }
}
