//! Filesystem watching for ref updates.
//!
//! A notify watcher feeds raw events into a bridge thread that filters for
//! ref writes, coalesces bursts per path, and forwards the surviving paths
//! to the async engine over a tokio channel.

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::Result;

/// Rapid bursts of writes to the same refs file collapse into one event.
pub const DEBOUNCE: Duration = Duration::from_millis(75);

/// True when a filesystem path names a ref the engine cares about.
pub fn is_commit_event_path(path: &Path) -> bool {
    let p = path.to_string_lossy();
    p.contains("refs/heads/") || p.contains("refs/catnip/")
}

/// True for event kinds that can signify a ref write.
fn is_write_kind(kind: &EventKind) -> bool {
    matches!(kind, EventKind::Create(_) | EventKind::Modify(_))
}

pub struct RefsWatcher {
    // Dropping the watcher stops the stream; keep it alive with the handle.
    _watcher: RecommendedWatcher,
    bridge: Option<std::thread::JoinHandle<()>>,
    stop_tx: std::sync::mpsc::Sender<()>,
}

impl RefsWatcher {
    /// Watch the given directories for ref writes. Missing directories are
    /// skipped with a warning; the periodic fallback covers them.
    pub fn spawn(dirs: Vec<PathBuf>) -> Result<(Self, mpsc::Receiver<PathBuf>)> {
        let (raw_tx, raw_rx) = std::sync::mpsc::channel::<Event>();
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();
        let (out_tx, out_rx) = mpsc::channel::<PathBuf>(128);

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            if let Ok(event) = res {
                let _ = raw_tx.send(event);
            }
        })?;

        for dir in &dirs {
            if !dir.exists() {
                warn!("refs directory missing, not watching: {}", dir.display());
                continue;
            }
            if let Err(e) = watcher.watch(dir, RecursiveMode::Recursive) {
                warn!("failed to watch {}: {e}", dir.display());
            } else {
                debug!("watching refs under {}", dir.display());
            }
        }

        let bridge = std::thread::spawn(move || {
            let mut last_sent: HashMap<PathBuf, Instant> = HashMap::new();
            loop {
                if stop_rx.try_recv().is_ok() {
                    break;
                }
                let event = match raw_rx.recv_timeout(Duration::from_millis(250)) {
                    Ok(event) => event,
                    Err(std::sync::mpsc::RecvTimeoutError::Timeout) => continue,
                    Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
                };
                if !is_write_kind(&event.kind) {
                    continue;
                }
                for path in event.paths {
                    if !is_commit_event_path(&path) {
                        continue;
                    }
                    // Lock files and temp refs are not commit events.
                    if path.extension().is_some_and(|e| e == "lock") {
                        continue;
                    }
                    let now = Instant::now();
                    let debounced = last_sent
                        .get(&path)
                        .is_some_and(|t| now.duration_since(*t) < DEBOUNCE);
                    if debounced {
                        continue;
                    }
                    last_sent.insert(path.clone(), now);
                    if out_tx.blocking_send(path).is_err() {
                        return;
                    }
                }
            }
        });

        Ok((
            Self {
                _watcher: watcher,
                bridge: Some(bridge),
                stop_tx,
            },
            out_rx,
        ))
    }

    pub fn stop(mut self) {
        let _ = self.stop_tx.send(());
        if let Some(handle) = self.bridge.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ref_paths_are_classified() {
        assert!(is_commit_event_path(Path::new(
            "/repo/.git/refs/heads/main"
        )));
        assert!(is_commit_event_path(Path::new(
            "/repo/refs/catnip/feline"
        )));
        assert!(!is_commit_event_path(Path::new("/repo/.git/HEAD")));
        assert!(!is_commit_event_path(Path::new(
            "/repo/.git/refs/tags/v1.0"
        )));
    }

    #[tokio::test]
    async fn watcher_reports_ref_writes() {
        let dir = tempfile::tempdir().unwrap();
        let heads = dir.path().join("refs/heads");
        std::fs::create_dir_all(&heads).unwrap();

        let (watcher, mut rx) = RefsWatcher::spawn(vec![heads.clone()]).unwrap();

        // Give the backend a beat to arm before writing.
        tokio::time::sleep(Duration::from_millis(200)).await;
        std::fs::write(heads.join("main"), "aaaa\n").unwrap();

        let path = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("watcher should observe the write")
            .expect("channel open");
        assert!(path.ends_with("refs/heads/main"));

        watcher.stop();
    }

    #[tokio::test]
    async fn lock_files_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let heads = dir.path().join("refs/heads");
        std::fs::create_dir_all(&heads).unwrap();

        let (watcher, mut rx) = RefsWatcher::spawn(vec![heads.clone()]).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        std::fs::write(heads.join("main.lock"), "").unwrap();
        std::fs::write(heads.join("main"), "bbbb\n").unwrap();

        let path = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("watcher should observe the write")
            .expect("channel open");
        assert!(path.ends_with("refs/heads/main"), "got {}", path.display());

        watcher.stop();
    }
}
