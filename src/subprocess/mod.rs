//! Subprocess abstraction for external tool integration.
//!
//! Everything the supervisor runs out-of-process (`git`, `gh`) goes through
//! the [`ProcessRunner`] trait so unit tests can script responses with
//! [`MockProcessRunner`] and assert the exact commands issued.

pub mod builder;
pub mod error;
pub mod mock;
pub mod runner;

pub use builder::ProcessCommandBuilder;
pub use error::ProcessError;
pub use mock::{MockCommandConfig, MockProcessRunner};
pub use runner::{ExitStatus, ProcessCommand, ProcessOutput, ProcessRunner, TokioProcessRunner};

use std::sync::Arc;

/// Central handle for subprocess execution.
///
/// Holds the active [`ProcessRunner`] and hands out clones of it to the
/// subsystems that shell out. Construction picks the implementation:
/// `production()` for real tokio-driven processes, `mock()` in tests.
#[derive(Clone)]
pub struct SubprocessManager {
    runner: Arc<dyn ProcessRunner>,
}

impl SubprocessManager {
    pub fn new(runner: Arc<dyn ProcessRunner>) -> Self {
        Self { runner }
    }

    /// Production manager backed by real tokio subprocesses.
    pub fn production() -> Self {
        Self::new(Arc::new(TokioProcessRunner))
    }

    /// Mock manager for tests; returns the mock so expectations can be set.
    pub fn mock() -> (Self, MockProcessRunner) {
        let mock = MockProcessRunner::new();
        let runner = Arc::new(mock.clone()) as Arc<dyn ProcessRunner>;
        (Self::new(runner), mock)
    }

    pub fn runner(&self) -> Arc<dyn ProcessRunner> {
        Arc::clone(&self.runner)
    }
}
