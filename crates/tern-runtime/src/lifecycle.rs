use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tern_types::TargetRepository;

use crate::sandbox::{
    env_fingerprint, SandboxCreateParams, SandboxInstance, SandboxProvider, SandboxState,
    ENV_FINGERPRINT_LABEL,
};

const CREATE_ATTEMPTS: u32 = 3;
const CLONE_TIMEOUT_SECS: u64 = 900;
const PULL_TIMEOUT_SECS: u64 = 300;
const TREE_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Clone)]
pub struct AcquireOutcome {
    pub sandbox: SandboxInstance,
    /// `git ls-files` listing of the cloned repository. Absent when tree
    /// generation failed; callers proceed without it.
    pub codebase_tree: Option<String>,
    /// `Some(false)` after a fresh clone; `None` when reusing a sandbox
    /// whose install state is unknown.
    pub dependencies_installed: Option<bool>,
}

/// Decides whether a stored sandbox can be reused, resumed, or must be
/// recreated, and provisions fresh sandboxes when needed. Reuse failures
/// of any kind funnel into recreation rather than surfacing to callers.
pub struct SandboxLifecycleManager {
    provider: Arc<dyn SandboxProvider>,
    image: Option<String>,
}

impl SandboxLifecycleManager {
    pub fn new(provider: Arc<dyn SandboxProvider>, image: Option<String>) -> Self {
        Self { provider, image }
    }

    pub async fn acquire(
        &self,
        existing_id: Option<&str>,
        repo: &TargetRepository,
        branch: &str,
        env_vars: &BTreeMap<String, String>,
        token: Option<&str>,
    ) -> anyhow::Result<AcquireOutcome> {
        let fingerprint = env_fingerprint(env_vars);

        if let Some(id) = existing_id {
            match self.try_reuse(id, repo, branch, &fingerprint, token).await {
                Ok(outcome) => return Ok(outcome),
                Err(err) => {
                    tracing::warn!(
                        sandbox_id = id,
                        error = %format!("{err:#}"),
                        "stored sandbox unusable, recreating"
                    );
                }
            }
        }

        self.recreate(repo, branch, &fingerprint, token).await
    }

    async fn try_reuse(
        &self,
        id: &str,
        repo: &TargetRepository,
        branch: &str,
        fingerprint: &str,
        token: Option<&str>,
    ) -> anyhow::Result<AcquireOutcome> {
        let instance = self.provider.get(id).await?;

        match instance.fingerprint_label() {
            Some(stored) if stored == fingerprint => {}
            stored => anyhow::bail!(
                "environment fingerprint mismatch for sandbox `{}` (stored: {})",
                id,
                stored.unwrap_or("<none>")
            ),
        }

        match instance.state {
            // Still running: hand it straight back, nothing to refresh.
            SandboxState::Started => Ok(AcquireOutcome {
                sandbox: instance,
                codebase_tree: None,
                dependencies_installed: None,
            }),
            SandboxState::Stopped | SandboxState::Archived => {
                tracing::info!(sandbox_id = id, "resuming stopped sandbox");
                let instance = self.provider.start(id).await?;
                // The checkout may be behind the remote; a failed pull
                // makes the sandbox unusable and the caller recreates.
                self.pull_latest(&instance.id, repo, branch, token).await?;
                let codebase_tree = self.try_generate_tree(&instance.id, repo).await;
                Ok(AcquireOutcome {
                    sandbox: instance,
                    codebase_tree,
                    dependencies_installed: None,
                })
            }
            SandboxState::Unknown => {
                anyhow::bail!("sandbox `{}` is in an unknown state", id)
            }
        }
    }

    async fn recreate(
        &self,
        repo: &TargetRepository,
        branch: &str,
        fingerprint: &str,
        token: Option<&str>,
    ) -> anyhow::Result<AcquireOutcome> {
        let mut labels = HashMap::new();
        labels.insert(ENV_FINGERPRINT_LABEL.to_string(), fingerprint.to_string());
        let params = SandboxCreateParams {
            image: self.image.clone(),
            labels,
        };

        let mut last_error: Option<anyhow::Error> = None;
        let mut instance: Option<SandboxInstance> = None;
        for attempt in 1..=CREATE_ATTEMPTS {
            match self.provider.create(params.clone()).await {
                Ok(created) => {
                    instance = Some(created);
                    break;
                }
                Err(err) => {
                    tracing::warn!(
                        attempt,
                        total = CREATE_ATTEMPTS,
                        error = %format!("{err:#}"),
                        "sandbox creation failed"
                    );
                    last_error = Some(err);
                }
            }
        }
        let instance = match instance {
            Some(instance) => instance,
            None => {
                let err = last_error.unwrap_or_else(|| anyhow::anyhow!("no attempts made"));
                return Err(err.context(format!(
                    "failed to create sandbox after {CREATE_ATTEMPTS} attempts"
                )));
            }
        };

        self.clone_repository(&instance.id, repo, branch, token)
            .await?;

        let codebase_tree = self.try_generate_tree(&instance.id, repo).await;
        Ok(AcquireOutcome {
            sandbox: instance,
            codebase_tree,
            dependencies_installed: Some(false),
        })
    }

    async fn clone_repository(
        &self,
        sandbox_id: &str,
        repo: &TargetRepository,
        branch: &str,
        token: Option<&str>,
    ) -> anyhow::Result<()> {
        let url = remote_url(repo, token);
        let path = repo_path(repo);
        let command = format!("git clone --branch {} {} {}", branch, url, path);

        let outcome = self
            .provider
            .execute(sandbox_id, &command, None, &HashMap::new(), CLONE_TIMEOUT_SECS)
            .await?;
        if !outcome.success() {
            // The clone output can echo the tokenized URL.
            anyhow::bail!(
                "git clone of {} exited with code {}",
                repo.full_name(),
                outcome.exit_code
            );
        }
        Ok(())
    }

    async fn pull_latest(
        &self,
        sandbox_id: &str,
        repo: &TargetRepository,
        branch: &str,
        token: Option<&str>,
    ) -> anyhow::Result<()> {
        let url = remote_url(repo, token);
        let command = format!("git pull {} {}", url, branch);
        let path = repo_path(repo);

        let outcome = self
            .provider
            .execute(
                sandbox_id,
                &command,
                Some(&path),
                &HashMap::new(),
                PULL_TIMEOUT_SECS,
            )
            .await?;
        if !outcome.success() {
            // The pull output can echo the tokenized URL.
            anyhow::bail!(
                "git pull of {} exited with code {}",
                repo.full_name(),
                outcome.exit_code
            );
        }
        Ok(())
    }

    /// Best effort. A sandbox without a tree listing is still usable.
    async fn try_generate_tree(&self, sandbox_id: &str, repo: &TargetRepository) -> Option<String> {
        let path = repo_path(repo);
        match self
            .provider
            .execute(
                sandbox_id,
                "git ls-files",
                Some(&path),
                &HashMap::new(),
                TREE_TIMEOUT_SECS,
            )
            .await
        {
            Ok(outcome) if outcome.success() => Some(outcome.output),
            Ok(outcome) => {
                tracing::warn!(
                    sandbox_id,
                    exit_code = outcome.exit_code,
                    "codebase tree generation failed"
                );
                None
            }
            Err(err) => {
                tracing::warn!(
                    sandbox_id,
                    error = %format!("{err:#}"),
                    "codebase tree generation errored"
                );
                None
            }
        }
    }

    pub async fn stop(&self, sandbox_id: &str) -> anyhow::Result<()> {
        self.provider.stop(sandbox_id).await
    }

    pub async fn restart(&self, sandbox_id: &str) -> anyhow::Result<SandboxInstance> {
        self.provider.start(sandbox_id).await
    }

    /// Deletion failures are logged, not raised; a leaked sandbox expires
    /// on the provider side.
    pub async fn teardown(&self, sandbox_id: &str) {
        if let Err(err) = self.provider.delete(sandbox_id).await {
            tracing::warn!(
                sandbox_id,
                error = %format!("{err:#}"),
                "sandbox deletion failed"
            );
        }
    }
}

fn repo_path(repo: &TargetRepository) -> String {
    format!("/workspace/{}", repo.repo)
}

fn remote_url(repo: &TargetRepository, token: Option<&str>) -> String {
    match token {
        Some(token) => format!(
            "https://x-access-token:{}@github.com/{}/{}.git",
            token, repo.owner, repo.repo
        ),
        None => format!("https://github.com/{}/{}.git", repo.owner, repo.repo),
    }
}
