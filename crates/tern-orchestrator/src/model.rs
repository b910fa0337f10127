use serde::{Deserialize, Serialize};

use tern_types::{DisplayStatus, SessionRef, TargetRepository, TaskPlan};

/// Where an incoming user message should go. Closed set: every consumer
/// matches exhaustively, so an unknown route is a deserialization error
/// rather than a silent fallthrough.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Route {
    /// Conversational reply only; no session work.
    NoOp,
    /// Unrelated new work; hand the conversation to a fresh manager
    /// session.
    CreateNewIssue,
    /// Open a tracking issue and start planning against it.
    NewIssue,
    /// Start (or resume) the planner on the existing work.
    StartPlanner,
}

impl Route {
    pub fn as_str(self) -> &'static str {
        match self {
            Route::NoOp => "no_op",
            Route::CreateNewIssue => "create_new_issue",
            Route::NewIssue => "new_issue",
            Route::StartPlanner => "start_planner",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClassifyOutcome {
    pub route: Route,
    /// The assistant's reply to surface in the manager conversation.
    pub response: String,
    /// Set when the route created a tracking issue.
    pub issue_number: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEntry {
    pub role: String,
    pub content: String,
}

impl MessageEntry {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// The manager thread's persisted state values.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManagerState {
    #[serde(default)]
    pub messages: Vec<MessageEntry>,
    #[serde(default, alias = "plannerSession")]
    pub planner_session: Option<SessionRef>,
    #[serde(default, alias = "taskPlan")]
    pub task_plan: Option<TaskPlan>,
    #[serde(default, alias = "targetRepository")]
    pub target_repository: Option<TargetRepository>,
    #[serde(default, alias = "branchName")]
    pub branch_name: Option<String>,
    #[serde(default, alias = "issueNumber")]
    pub issue_number: Option<u64>,
    #[serde(default, alias = "localMode")]
    pub local_mode: bool,
}

impl ManagerState {
    pub fn latest_user_message(&self) -> Option<&MessageEntry> {
        self.messages.iter().rev().find(|m| m.role == "user")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub status: DisplayStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
}

impl StatusSnapshot {
    pub fn new(status: DisplayStatus) -> Self {
        Self {
            status,
            thread_id: None,
            run_id: None,
        }
    }

    pub fn for_thread(status: DisplayStatus, thread_id: impl Into<String>) -> Self {
        Self {
            status,
            thread_id: Some(thread_id.into()),
            run_id: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_round_trips_snake_case() {
        let parsed: Route = serde_json::from_str("\"new_issue\"").expect("parse");
        assert_eq!(parsed, Route::NewIssue);
        assert_eq!(
            serde_json::to_value(Route::StartPlanner).unwrap(),
            serde_json::json!("start_planner")
        );
    }

    #[test]
    fn unknown_route_is_an_error() {
        assert!(serde_json::from_str::<Route>("\"reboot\"").is_err());
    }

    #[test]
    fn manager_state_accepts_camel_case_aliases() {
        let state: ManagerState = serde_json::from_str(
            r#"{
                "messages": [{"role": "user", "content": "fix the bug"}],
                "plannerSession": {"threadId": "t-p", "runId": "r-p"},
                "issueNumber": 12,
                "localMode": true
            }"#,
        )
        .expect("parse");
        assert_eq!(state.planner_session.unwrap().thread_id, "t-p");
        assert_eq!(state.issue_number, Some(12));
        assert!(state.local_mode);
    }

    #[test]
    fn latest_user_message_skips_assistant_turns() {
        let state = ManagerState {
            messages: vec![
                MessageEntry::user("first"),
                MessageEntry::assistant("ack"),
                MessageEntry::user("second"),
                MessageEntry::assistant("done"),
            ],
            ..Default::default()
        };
        assert_eq!(state.latest_user_message().unwrap().content, "second");
    }
}
