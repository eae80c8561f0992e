//! Parsers for git porcelain output

use super::types::{GitStatus, MergeTreeResult, WorktreeInfo};
use anyhow::Result;
use std::path::PathBuf;

/// Parse `git worktree list --porcelain` output.
pub fn parse_worktree_list(output: &str) -> Result<Vec<WorktreeInfo>> {
    let mut worktrees = Vec::new();
    let mut current: Option<WorktreeInfo> = None;

    for line in output.lines() {
        if let Some(path) = line.strip_prefix("worktree ") {
            if let Some(wt) = current.take() {
                worktrees.push(wt);
            }
            current = Some(WorktreeInfo {
                path: PathBuf::from(path),
                head: None,
                branch: None,
                bare: false,
                detached: false,
            });
        } else if let Some(wt) = current.as_mut() {
            if let Some(head) = line.strip_prefix("HEAD ") {
                wt.head = Some(head.to_string());
            } else if let Some(branch) = line.strip_prefix("branch ") {
                wt.branch = Some(branch.to_string());
            } else if line == "bare" {
                wt.bare = true;
            } else if line == "detached" {
                wt.detached = true;
            }
        }
    }
    if let Some(wt) = current.take() {
        worktrees.push(wt);
    }

    Ok(worktrees)
}

/// Parse `git status --porcelain` (v1) output.
pub fn parse_status(output: &str) -> GitStatus {
    let mut status = GitStatus::default();

    for line in output.lines() {
        if line.len() < 3 {
            continue;
        }
        let (xy, rest) = line.split_at(2);
        let path = PathBuf::from(rest.trim_start());
        let x = xy.chars().next().unwrap_or(' ');
        let y = xy.chars().nth(1).unwrap_or(' ');

        match (x, y) {
            ('?', '?') => status.untracked.push(path),
            ('U', _) | (_, 'U') | ('A', 'A') | ('D', 'D') => status.conflicts.push(path),
            _ => {
                if x == 'D' || y == 'D' {
                    status.deleted.push(path);
                } else if x != ' ' && x != '.' {
                    status.staged.push(path);
                } else {
                    status.modified.push(path);
                }
            }
        }
    }

    status
}

/// Parse `git merge-tree --write-tree --name-only` output.
///
/// Exit code 0 means a clean merge (stdout is the tree OID); exit code 1
/// means conflicts, with the conflicted paths listed after the OID line and
/// an informational section separated by a blank line.
pub fn parse_merge_tree(output: &str, clean: bool) -> MergeTreeResult {
    if clean {
        return MergeTreeResult {
            clean: true,
            conflicted_files: Vec::new(),
        };
    }

    let mut conflicted_files = Vec::new();
    for line in output.lines().skip(1) {
        if line.is_empty() {
            break;
        }
        conflicted_files.push(PathBuf::from(line));
    }
    conflicted_files.sort();
    conflicted_files.dedup();

    MergeTreeResult {
        clean: false,
        conflicted_files,
    }
}
