//! Catnip, a per-workspace agent supervisor.
//!
//! Runs multiple isolated coding-agent sessions against a shared set of git
//! repositories. Each session lives in its own git worktree pinned to a
//! private ref under `refs/catnip/`; the supervisor captures the agent's work
//! into commits, mirrors them to the canonical repository, keeps a
//! user-visible "nice branch" in lockstep, tracks the agent's session logs,
//! and automates the agent's first-run authentication dialog.
//!
//! The main subsystems:
//! - [`state`]: the authoritative `{repositories, worktrees}` store with
//!   JSON persistence, change events, and restart restoration.
//! - [`sync`]: filesystem-watched commit propagation between worktrees and
//!   canonical repositories.
//! - [`pr`]: batched pull-request state polling.
//! - [`onboarding`]: PTY-scraping automation of the agent's interactive
//!   login flow.
//! - [`activity`] / [`monitor`]: agent liveness classification and session
//!   log tracking.

pub mod activity;
pub mod config;
pub mod error;
pub mod git;
pub mod monitor;
pub mod onboarding;
pub mod pr;
pub mod state;
pub mod status;
pub mod subprocess;
pub mod supervisor;
pub mod sync;

pub use error::{Error, Result};
pub use supervisor::Supervisor;
