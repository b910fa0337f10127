pub mod approvals;
pub mod config;
pub mod event_bus;
pub mod runtime_client;
pub mod safety;
pub mod vcs;

pub use approvals::{derive_approval_key, ApprovalCache, ApprovalGate, ApprovalRequest};
pub use config::{AppConfig, ConfigStore, SandboxConfig};
pub use event_bus::EventBus;
pub use runtime_client::{
    DurableRuntime, IfNotExists, MultitaskStrategy, RunInfo, RunOptions, ThreadSnapshot,
};
pub use safety::{CommandSafetyEvaluator, RiskLevel, SafetyVerdict};
pub use vcs::{Issue, IssueRef, PullRequestRef, VcsClient};
