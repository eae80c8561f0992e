//! GitHub access for the PR syncer.
//!
//! Queries go through the `gh` CLI rather than a direct HTTP client, so the
//! user's existing authentication is reused. The trait seam keeps the
//! syncer testable without a network or a `gh` install.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::subprocess::{ProcessCommandBuilder, ProcessRunner};

#[async_trait]
pub trait GithubClient: Send + Sync {
    /// Execute a GraphQL query and return the parsed response body.
    async fn graphql(&self, query: &str) -> Result<serde_json::Value>;
}

/// Production client shelling out to `gh api graphql`.
pub struct GhCliClient {
    runner: Arc<dyn ProcessRunner>,
}

impl GhCliClient {
    pub fn new(runner: Arc<dyn ProcessRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl GithubClient for GhCliClient {
    async fn graphql(&self, query: &str) -> Result<serde_json::Value> {
        let command = ProcessCommandBuilder::new("gh")
            .args(["api", "graphql", "-f"])
            .arg(&format!("query={query}"))
            .timeout(Duration::from_secs(30))
            .build();

        let output = self
            .runner
            .run(command)
            .await
            .map_err(|e| anyhow!("gh invocation failed: {e}"))?;
        if !output.status.success() {
            return Err(anyhow!("gh api graphql failed: {}", output.stderr.trim()));
        }
        Ok(serde_json::from_str(&output.stdout)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subprocess::MockProcessRunner;

    #[tokio::test]
    async fn graphql_passes_query_and_parses_json() {
        let mock = MockProcessRunner::new();
        mock.expect_command("gh")
            .returns_stdout(r#"{"data":{"repository":null}}"#)
            .finish();
        let client = GhCliClient::new(Arc::new(mock.clone()) as Arc<dyn ProcessRunner>);

        let value = client.graphql("query { viewer { login } }").await.unwrap();
        assert!(value["data"].is_object());

        let calls = mock.calls_for("gh");
        assert_eq!(calls[0].args[0], "api");
        assert_eq!(calls[0].args[1], "graphql");
        assert!(calls[0].args[3].starts_with("query="));
    }

    #[tokio::test]
    async fn graphql_failure_is_an_error() {
        let mock = MockProcessRunner::new();
        mock.expect_command("gh")
            .returns_exit_code(1)
            .returns_stderr("gh: Not Found (HTTP 404)")
            .finish();
        let client = GhCliClient::new(Arc::new(mock.clone()) as Arc<dyn ProcessRunner>);

        let err = client.graphql("query {}").await.unwrap_err();
        assert!(err.to_string().contains("gh api graphql failed"));
    }
}
