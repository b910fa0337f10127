use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Label key carrying the environment fingerprint on a sandbox.
pub const ENV_FINGERPRINT_LABEL: &str = "tern.env-fingerprint";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxState {
    Started,
    Stopped,
    Archived,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxInstance {
    pub id: String,
    pub state: SandboxState,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

impl SandboxInstance {
    pub fn fingerprint_label(&self) -> Option<&str> {
        self.labels.get(ENV_FINGERPRINT_LABEL).map(|s| s.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecOutcome {
    pub exit_code: i32,
    pub output: String,
}

impl ExecOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug, Clone, Default)]
pub struct SandboxCreateParams {
    pub image: Option<String>,
    pub labels: HashMap<String, String>,
}

/// The remote sandbox service. Implementations wrap a concrete container
/// provider; tests use an in-memory fake.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    async fn create(&self, params: SandboxCreateParams) -> anyhow::Result<SandboxInstance>;
    async fn get(&self, id: &str) -> anyhow::Result<SandboxInstance>;
    async fn start(&self, id: &str) -> anyhow::Result<SandboxInstance>;
    async fn stop(&self, id: &str) -> anyhow::Result<()>;
    async fn delete(&self, id: &str) -> anyhow::Result<()>;
    async fn execute(
        &self,
        id: &str,
        command: &str,
        cwd: Option<&str>,
        env: &HashMap<String, String>,
        timeout_secs: u64,
    ) -> anyhow::Result<ExecOutcome>;
}

/// Order-independent digest of the environment variables a sandbox was
/// provisioned with. Two sandboxes with the same variables always produce
/// the same fingerprint, so a stored sandbox can be checked against the
/// current run's environment before reuse.
pub fn env_fingerprint(env: &BTreeMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    for (key, value) in env {
        hasher.update(key.as_bytes());
        hasher.update(b"=");
        hasher.update(value.as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}
