use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use tern_types::TargetRepository;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueRef {
    pub number: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    pub number: u64,
    pub title: String,
    #[serde(default)]
    pub body: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequestRef {
    pub number: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// The version-control host (issues and pull requests). Implementations
/// wrap a concrete forge API; local mode skips this entirely.
#[async_trait]
pub trait VcsClient: Send + Sync {
    async fn create_issue(
        &self,
        repo: &TargetRepository,
        title: &str,
        body: &str,
    ) -> anyhow::Result<IssueRef>;

    async fn get_issue(
        &self,
        repo: &TargetRepository,
        number: u64,
    ) -> anyhow::Result<Option<Issue>>;

    async fn create_issue_comment(
        &self,
        repo: &TargetRepository,
        number: u64,
        body: &str,
    ) -> anyhow::Result<()>;

    async fn create_pull_request(
        &self,
        repo: &TargetRepository,
        head: &str,
        base: &str,
        title: &str,
        body: &str,
    ) -> anyhow::Result<PullRequestRef>;
}
