use serde::{Deserialize, Serialize};

/// The three tiers of the session hierarchy. A Manager owns at most one
/// Planner session, a Planner owns at most one Programmer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionRole {
    Manager,
    Planner,
    Programmer,
}

impl SessionRole {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionRole::Manager => "manager",
            SessionRole::Planner => "planner",
            SessionRole::Programmer => "programmer",
        }
    }

    /// Graph id in the durable-execution runtime.
    pub fn graph_id(self) -> &'static str {
        self.as_str()
    }
}

/// Thread status as reported by the durable-execution runtime.
/// `NotStarted` is the default when no session exists yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    NotStarted,
    Running,
    Interrupted,
    Success,
    Error,
}

/// A parent's record of a launched child session. Immutable once written:
/// follow-up runs reuse the same `thread_id`, a fresh attempt gets a whole
/// new `SessionRef`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRef {
    #[serde(alias = "threadId", alias = "threadID")]
    pub thread_id: String,
    #[serde(alias = "runId", alias = "runID")]
    pub run_id: String,
}

/// User-facing status exposed to polling UI/CLI collaborators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplayStatus {
    Running,
    Completed,
    Failed,
    Pending,
    Idle,
    Paused,
    Error,
}

impl DisplayStatus {
    pub fn from_session_status(status: SessionStatus) -> Self {
        match status {
            SessionStatus::NotStarted => DisplayStatus::Idle,
            SessionStatus::Running => DisplayStatus::Running,
            SessionStatus::Interrupted => DisplayStatus::Paused,
            SessionStatus::Success => DisplayStatus::Idle,
            SessionStatus::Error => DisplayStatus::Error,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DisplayStatus::Running => "running",
            DisplayStatus::Completed => "completed",
            DisplayStatus::Failed => "failed",
            DisplayStatus::Pending => "pending",
            DisplayStatus::Idle => "idle",
            DisplayStatus::Paused => "paused",
            DisplayStatus::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetRepository {
    pub owner: String,
    pub repo: String,
}

impl TargetRepository {
    pub fn new(owner: impl Into<String>, repo: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            repo: repo.into(),
        }
    }

    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.repo)
    }

    /// Work branch for a session thread.
    pub fn branch_for(&self, thread_id: &str) -> String {
        format!("tern/{thread_id}")
    }
}

impl std::fmt::Display for TargetRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.owner, self.repo)
    }
}
