use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use tern_types::{AssistantTurn, EngineEvent, ToolCall};

use crate::event_bus::EventBus;

/// Tools that mutate the workspace and therefore require user approval.
pub fn is_write_command(name: &str) -> bool {
    is_file_edit_command(name) || is_shell_command(name)
}

fn is_file_edit_command(name: &str) -> bool {
    matches!(
        name,
        "edit_file" | "write_file" | "create_file" | "delete_file" | "apply_patch"
    )
}

fn is_shell_command(name: &str) -> bool {
    matches!(name, "shell" | "bash" | "execute_bash")
}

fn is_listing_command(name: &str) -> bool {
    matches!(name, "list_files" | "search_files" | "grep_search" | "ls")
}

/// Approval key for a proposed tool call: `"{command}:{directory}"`.
///
/// The directory is the scope the approval covers, so editing two files in
/// the same directory produces the same key and asks only once:
/// file-edit tools use the parent of `file_path`/`path`, shell tools their
/// `cwd`, listing tools their `path`/`directory`, and everything else the
/// session working directory.
pub fn derive_approval_key(call: &ToolCall, session_cwd: &str) -> String {
    let dir = if is_file_edit_command(&call.name) {
        call.args
            .get("file_path")
            .or_else(|| call.args.get("path"))
            .and_then(|v| v.as_str())
            .map(|p| parent_dir(p, session_cwd))
            .unwrap_or_else(|| session_cwd.to_string())
    } else if is_shell_command(&call.name) {
        call.args
            .get("cwd")
            .and_then(|v| v.as_str())
            .unwrap_or(session_cwd)
            .to_string()
    } else if is_listing_command(&call.name) {
        call.args
            .get("path")
            .or_else(|| call.args.get("directory"))
            .and_then(|v| v.as_str())
            .unwrap_or(session_cwd)
            .to_string()
    } else {
        session_cwd.to_string()
    };
    format!("{}:{}", call.name, normalize_dir(&dir, session_cwd))
}

fn parent_dir(file_path: &str, session_cwd: &str) -> String {
    match file_path.rfind('/') {
        Some(0) => "/".to_string(),
        Some(idx) => file_path[..idx].to_string(),
        None => session_cwd.to_string(),
    }
}

/// Lexical normalization: resolves relative paths against the session cwd
/// and collapses `.` and `..` components without touching the filesystem.
fn normalize_dir(path: &str, session_cwd: &str) -> String {
    let absolute = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("{}/{}", session_cwd.trim_end_matches('/'), path)
    };
    let mut parts: Vec<&str> = Vec::new();
    for component in absolute.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", parts.join("/"))
    }
}

/// Per-session set of approvals already granted. Persists as part of the
/// session state, so resumed sessions keep their grants.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApprovalCache {
    #[serde(default)]
    approved: HashSet<String>,
}

impl ApprovalCache {
    pub fn is_approved(&self, key: &str) -> bool {
        self.approved.contains(key)
    }

    pub fn record_approval(&mut self, key: impl Into<String>) {
        self.approved.insert(key.into());
    }

    pub fn len(&self) -> usize {
        self.approved.len()
    }

    pub fn is_empty(&self) -> bool {
        self.approved.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none", rename = "sessionID")]
    pub session_id: Option<String>,
    pub key: String,
    pub tool: String,
    pub args: Value,
    pub status: String,
}

/// Suspends tool execution until a human answers. Mirrors are kept in a
/// pending map so collaborators can list outstanding requests; replies wake
/// the waiting task through a watch channel.
#[derive(Clone)]
pub struct ApprovalGate {
    requests: Arc<RwLock<HashMap<String, ApprovalRequest>>>,
    waiters: Arc<RwLock<HashMap<String, watch::Sender<Option<bool>>>>>,
    event_bus: EventBus,
}

impl ApprovalGate {
    pub fn new(event_bus: EventBus) -> Self {
        Self {
            requests: Arc::new(RwLock::new(HashMap::new())),
            waiters: Arc::new(RwLock::new(HashMap::new())),
            event_bus,
        }
    }

    pub async fn ask(
        &self,
        session_id: Option<&str>,
        call: &ToolCall,
        key: &str,
    ) -> ApprovalRequest {
        let req = ApprovalRequest {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.map(ToString::to_string),
            key: key.to_string(),
            tool: call.name.clone(),
            args: call.args.clone(),
            status: "pending".to_string(),
        };
        let (tx, _rx) = watch::channel(None);
        self.requests
            .write()
            .await
            .insert(req.id.clone(), req.clone());
        self.waiters.write().await.insert(req.id.clone(), tx);
        self.event_bus.publish(EngineEvent::new(
            "approval.asked",
            json!({
                "sessionID": session_id.unwrap_or_default(),
                "requestID": req.id,
                "key": key,
                "tool": call.name,
                "args": call.args,
            }),
        ));
        req
    }

    pub async fn list(&self) -> Vec<ApprovalRequest> {
        self.requests.read().await.values().cloned().collect()
    }

    pub async fn reply(&self, id: &str, approved: bool) -> bool {
        {
            let mut requests = self.requests.write().await;
            let Some(req) = requests.get_mut(id) else {
                return false;
            };
            req.status = if approved { "approved" } else { "rejected" }.to_string();
        }
        self.event_bus.publish(EngineEvent::new(
            "approval.replied",
            json!({"requestID": id, "approved": approved}),
        ));
        if let Some(waiter) = self.waiters.read().await.get(id).cloned() {
            let _ = waiter.send(Some(approved));
        }
        true
    }

    /// Blocks until the request is answered or the token fires. A
    /// cancelled wait counts as a rejection.
    pub async fn wait_for_reply(&self, id: &str, cancel: CancellationToken) -> Option<bool> {
        let mut rx = {
            let waiters = self.waiters.read().await;
            waiters.get(id).map(|tx| tx.subscribe())?
        };
        let immediate = { *rx.borrow() };
        if let Some(reply) = immediate {
            self.waiters.write().await.remove(id);
            return Some(reply);
        }
        let waited: Option<bool> = tokio::select! {
            _ = cancel.cancelled() => None,
            changed = rx.changed() => {
                if changed.is_ok() {
                    *rx.borrow()
                } else {
                    None
                }
            }
        };
        self.waiters.write().await.remove(id);
        waited
    }

    /// Post-model filter: write-class tool calls must be approved before
    /// they reach execution. Cached approvals pass silently; fresh
    /// approvals are recorded in the cache; rejections drop the call and
    /// the turn is rewritten with a note so the transcript stays coherent.
    pub async fn filter_turn(
        &self,
        session_id: Option<&str>,
        turn: AssistantTurn,
        cache: &mut ApprovalCache,
        session_cwd: &str,
        cancel: &CancellationToken,
    ) -> AssistantTurn {
        let mut kept = Vec::with_capacity(turn.tool_calls.len());
        let mut rejected: Vec<String> = Vec::new();

        for call in turn.tool_calls {
            if !is_write_command(&call.name) {
                kept.push(call);
                continue;
            }
            let key = derive_approval_key(&call, session_cwd);
            if cache.is_approved(&key) {
                kept.push(call);
                continue;
            }
            let request = self.ask(session_id, &call, &key).await;
            match self.wait_for_reply(&request.id, cancel.clone()).await {
                Some(true) => {
                    cache.record_approval(key);
                    kept.push(call);
                }
                Some(false) | None => {
                    tracing::info!(tool = %call.name, key = %key, "tool call rejected");
                    rejected.push(call.name.clone());
                }
            }
        }

        let content = if rejected.is_empty() {
            turn.content
        } else {
            let note = format!("The user rejected these tool calls: {}", rejected.join(", "));
            match turn.content {
                Some(existing) if !existing.is_empty() => Some(format!("{existing}\n\n{note}")),
                _ => Some(note),
            }
        };

        AssistantTurn {
            content,
            tool_calls: kept,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(name: &str, args: Value) -> ToolCall {
        ToolCall {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            args,
        }
    }

    #[test]
    fn edits_in_same_directory_share_a_key() {
        let a = call("edit_file", json!({"file_path": "/repo/src/a.ts"}));
        let b = call("edit_file", json!({"file_path": "/repo/src/b.ts"}));
        assert_eq!(derive_approval_key(&a, "/repo"), "edit_file:/repo/src");
        assert_eq!(
            derive_approval_key(&a, "/repo"),
            derive_approval_key(&b, "/repo")
        );
    }

    #[test]
    fn edit_key_accepts_path_argument_spelling() {
        let by_file_path = call("edit_file", json!({"file_path": "/repo/src/a.ts"}));
        let by_path = call("edit_file", json!({"path": "/repo/src/a.ts"}));
        assert_eq!(derive_approval_key(&by_path, "/repo"), "edit_file:/repo/src");
        assert_eq!(
            derive_approval_key(&by_file_path, "/repo"),
            derive_approval_key(&by_path, "/repo")
        );
    }

    #[test]
    fn shell_key_uses_cwd_argument() {
        let with_cwd = call("shell", json!({"command": "npm test", "cwd": "/repo/pkg"}));
        let without = call("shell", json!({"command": "npm test"}));
        assert_eq!(derive_approval_key(&with_cwd, "/repo"), "shell:/repo/pkg");
        assert_eq!(derive_approval_key(&without, "/repo"), "shell:/repo");
    }

    #[test]
    fn relative_and_dotted_paths_normalize() {
        let dotted = call(
            "edit_file",
            json!({"file_path": "/repo/src/../src/./a.ts"}),
        );
        assert_eq!(derive_approval_key(&dotted, "/repo"), "edit_file:/repo/src");

        let relative = call("edit_file", json!({"file_path": "src/a.ts"}));
        assert_eq!(
            derive_approval_key(&relative, "/repo"),
            "edit_file:/repo/src"
        );
    }

    #[test]
    fn listing_key_uses_path_or_directory() {
        let by_path = call("search_files", json!({"path": "/repo/docs"}));
        let by_dir = call("list_files", json!({"directory": "/repo/docs"}));
        assert_eq!(
            derive_approval_key(&by_path, "/repo"),
            "search_files:/repo/docs"
        );
        assert_eq!(
            derive_approval_key(&by_dir, "/repo"),
            "list_files:/repo/docs"
        );
    }

    #[tokio::test]
    async fn wait_for_reply_returns_user_response() {
        let gate = ApprovalGate::new(EventBus::new());
        let request = gate
            .ask(
                Some("ses_1"),
                &call("shell", json!({"command": "echo hi"})),
                "shell:/repo",
            )
            .await;

        let id = request.id.clone();
        let gate_clone = gate.clone();
        tokio::spawn(async move {
            let _ = gate_clone.reply(&id, true).await;
        });

        let reply = gate
            .wait_for_reply(&request.id, CancellationToken::new())
            .await;
        assert_eq!(reply, Some(true));
    }

    #[tokio::test]
    async fn approval_asked_event_carries_key_and_tool() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let gate = ApprovalGate::new(bus);

        let _ = gate
            .ask(
                Some("ses_1"),
                &call("edit_file", json!({"file_path": "/repo/src/a.ts"})),
                "edit_file:/repo/src",
            )
            .await;
        let event = rx.recv().await.expect("event");
        assert_eq!(event.event_type, "approval.asked");
        assert_eq!(
            event.properties.get("key").and_then(|v| v.as_str()),
            Some("edit_file:/repo/src")
        );
    }

    #[tokio::test]
    async fn cached_approval_skips_the_gate() {
        let gate = ApprovalGate::new(EventBus::new());
        let mut cache = ApprovalCache::default();
        cache.record_approval("edit_file:/repo/src");

        let turn = AssistantTurn {
            content: None,
            tool_calls: vec![call("edit_file", json!({"file_path": "/repo/src/b.ts"}))],
        };
        // No reply task needed: the cache hit never asks.
        let filtered = gate
            .filter_turn(
                Some("ses_1"),
                turn,
                &mut cache,
                "/repo",
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(filtered.tool_calls.len(), 1);
    }

    #[tokio::test]
    async fn rejection_drops_the_call_and_rewrites_the_turn() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let gate = ApprovalGate::new(bus);
        let mut cache = ApprovalCache::default();

        let gate_clone = gate.clone();
        tokio::spawn(async move {
            let event = rx.recv().await.expect("event");
            let id = event
                .properties
                .get("requestID")
                .and_then(|v| v.as_str())
                .expect("request id")
                .to_string();
            let _ = gate_clone.reply(&id, false).await;
        });

        let turn = AssistantTurn {
            content: Some("Removing the build artifacts.".to_string()),
            tool_calls: vec![
                call("shell", json!({"command": "rm -rf dist"})),
                call("list_files", json!({"path": "/repo"})),
            ],
        };
        let filtered = gate
            .filter_turn(
                Some("ses_1"),
                turn,
                &mut cache,
                "/repo",
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(filtered.tool_calls.len(), 1);
        assert_eq!(filtered.tool_calls[0].name, "list_files");
        assert!(filtered
            .content
            .as_deref()
            .unwrap_or("")
            .contains("rejected these tool calls: shell"));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn approval_is_recorded_for_reuse() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let gate = ApprovalGate::new(bus);
        let mut cache = ApprovalCache::default();

        let gate_clone = gate.clone();
        tokio::spawn(async move {
            let event = rx.recv().await.expect("event");
            let id = event
                .properties
                .get("requestID")
                .and_then(|v| v.as_str())
                .expect("request id")
                .to_string();
            let _ = gate_clone.reply(&id, true).await;
        });

        let turn = AssistantTurn {
            content: None,
            tool_calls: vec![call("edit_file", json!({"file_path": "/repo/src/a.ts"}))],
        };
        let filtered = gate
            .filter_turn(
                Some("ses_1"),
                turn,
                &mut cache,
                "/repo",
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(filtered.tool_calls.len(), 1);
        assert!(cache.is_approved("edit_file:/repo/src"));
    }
}
