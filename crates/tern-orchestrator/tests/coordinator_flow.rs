use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use tern_core::{
    DurableRuntime, EventBus, IfNotExists, MultitaskStrategy, RunInfo, RunOptions,
    ThreadSnapshot, VcsClient,
};
use tern_orchestrator::{Coordinator, ManagerState, MessageEntry, Route};
use tern_providers::{
    ChatMessage, CircuitRegistry, GatewayConfig, ModelGateway, ModelResponse, Provider,
    RetryPolicy,
};
use tern_types::{
    AssistantTurn, DisplayStatus, EngineEvent, ModelInfo, ModelSpec, ProviderInfo, SessionRef,
    SessionStatus, TargetRepository, ToolCall, ToolSchema,
};

#[derive(Clone, Debug)]
struct RecordedRun {
    thread_id: String,
    graph_id: String,
    input: Value,
    options: RunOptions,
}

#[derive(Default)]
struct FakeRuntime {
    runs: Mutex<Vec<RecordedRun>>,
    threads: Mutex<HashMap<String, ThreadSnapshot>>,
    next_run: AtomicU32,
    fail_create: std::sync::atomic::AtomicBool,
}

impl FakeRuntime {
    fn set_thread(&self, thread_id: &str, status: SessionStatus, values: Value) {
        self.threads
            .lock()
            .unwrap()
            .insert(thread_id.to_string(), ThreadSnapshot { status, values });
    }

    fn recorded(&self) -> Vec<RecordedRun> {
        self.runs.lock().unwrap().clone()
    }
}

#[async_trait]
impl DurableRuntime for FakeRuntime {
    async fn create_run(
        &self,
        thread_id: &str,
        graph_id: &str,
        input: Value,
        options: RunOptions,
    ) -> anyhow::Result<RunInfo> {
        if self.fail_create.load(Ordering::SeqCst) {
            anyhow::bail!("runtime unavailable");
        }
        let run_id = format!("run-{}", self.next_run.fetch_add(1, Ordering::SeqCst));
        self.runs.lock().unwrap().push(RecordedRun {
            thread_id: thread_id.to_string(),
            graph_id: graph_id.to_string(),
            input,
            options,
        });
        Ok(RunInfo { run_id })
    }

    async fn get_thread(&self, thread_id: &str) -> anyhow::Result<Option<ThreadSnapshot>> {
        Ok(self.threads.lock().unwrap().get(thread_id).cloned())
    }

    async fn update_thread_state(&self, thread_id: &str, patch: Value) -> anyhow::Result<()> {
        self.threads
            .lock()
            .unwrap()
            .entry(thread_id.to_string())
            .or_insert_with(|| ThreadSnapshot {
                status: SessionStatus::NotStarted,
                values: json!({}),
            })
            .values = patch;
        Ok(())
    }

    async fn join_stream(
        &self,
        _thread_id: &str,
        _run_id: &str,
    ) -> anyhow::Result<futures::stream::BoxStream<'static, EngineEvent>> {
        Ok(Box::pin(futures::stream::empty()))
    }
}

#[derive(Default)]
struct FakeVcs {
    issues_created: AtomicU32,
    fail_create: std::sync::atomic::AtomicBool,
}

#[async_trait]
impl VcsClient for FakeVcs {
    async fn create_issue(
        &self,
        _repo: &TargetRepository,
        _title: &str,
        _body: &str,
    ) -> anyhow::Result<tern_core::IssueRef> {
        if self.fail_create.load(Ordering::SeqCst) {
            anyhow::bail!("forge is down");
        }
        let number = 100 + self.issues_created.fetch_add(1, Ordering::SeqCst) as u64;
        Ok(tern_core::IssueRef { number, url: None })
    }

    async fn get_issue(
        &self,
        _repo: &TargetRepository,
        _number: u64,
    ) -> anyhow::Result<Option<tern_core::Issue>> {
        Ok(None)
    }

    async fn create_issue_comment(
        &self,
        _repo: &TargetRepository,
        _number: u64,
        _body: &str,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn create_pull_request(
        &self,
        _repo: &TargetRepository,
        _head: &str,
        _base: &str,
        _title: &str,
        _body: &str,
    ) -> anyhow::Result<tern_core::PullRequestRef> {
        Ok(tern_core::PullRequestRef {
            number: 1,
            url: None,
        })
    }
}

/// Answers every router invocation with a scripted route, or with no tool
/// call at all when `route` is `None`.
struct RouterProvider {
    route: Option<&'static str>,
}

#[async_trait]
impl Provider for RouterProvider {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            id: "fake".to_string(),
            name: "Fake".to_string(),
            models: vec![ModelInfo {
                id: "m".to_string(),
                provider_id: "fake".to_string(),
                display_name: "m".to_string(),
                context_window: 8192,
            }],
        }
    }

    async fn invoke(
        &self,
        _model_id: &str,
        _messages: &[ChatMessage],
        tools: &[ToolSchema],
    ) -> anyhow::Result<ModelResponse> {
        assert_eq!(tools.len(), 1, "router binds exactly one tool");
        assert_eq!(tools[0].name, "respond_and_route");
        let tool_calls = match self.route {
            Some(route) => vec![ToolCall {
                id: "call-1".to_string(),
                name: "respond_and_route".to_string(),
                args: json!({"route": route, "response": "On it."}),
            }],
            None => Vec::new(),
        };
        Ok(ModelResponse {
            turn: AssistantTurn {
                content: None,
                tool_calls,
            },
            usage: None,
        })
    }
}

fn gateway(route: Option<&'static str>) -> Arc<ModelGateway> {
    let mut providers: HashMap<String, Arc<dyn Provider>> = HashMap::new();
    providers.insert("fake".to_string(), Arc::new(RouterProvider { route }));
    Arc::new(ModelGateway::new(
        providers,
        CircuitRegistry::default(),
        GatewayConfig {
            task_models: HashMap::new(),
            fallback_order: vec![ModelSpec::new("fake", "m")],
        },
        RetryPolicy {
            initial_delay_ms: 1,
            multiplier: 2.0,
            max_delay_ms: 2,
            max_retries: 0,
        },
    ))
}

fn coordinator(
    runtime: Arc<FakeRuntime>,
    vcs: Arc<FakeVcs>,
    route: Option<&'static str>,
) -> Coordinator<FakeRuntime, FakeVcs> {
    Coordinator::new(runtime, vcs, gateway(route), EventBus::new(), false)
}

fn base_state() -> ManagerState {
    ManagerState {
        messages: vec![
            MessageEntry::user("Please fix the login bug"),
            MessageEntry::assistant("Looking into it."),
            MessageEntry::user("Also add a regression test"),
        ],
        target_repository: Some(TargetRepository::new("acme", "widgets")),
        branch_name: Some("main".to_string()),
        ..Default::default()
    }
}

#[tokio::test]
async fn fresh_planner_gets_full_history_and_new_thread() {
    let runtime = Arc::new(FakeRuntime::default());
    let vcs = Arc::new(FakeVcs::default());
    let coordinator = coordinator(runtime.clone(), vcs, Some("start_planner"));

    let mut state = base_state();
    let outcome = coordinator
        .classify(&state, &CancellationToken::new())
        .await
        .expect("classify");
    assert_eq!(outcome.route, Route::StartPlanner);
    assert_eq!(outcome.issue_number, None);

    let session = coordinator
        .dispatch(&mut state, &outcome)
        .await
        .expect("dispatch")
        .expect("planner launched");

    let runs = runtime.recorded();
    assert_eq!(runs.len(), 1);
    let run = &runs[0];
    assert_eq!(run.graph_id, "planner");
    assert_eq!(run.thread_id, session.thread_id);
    assert_eq!(session.run_id, "run-0");
    // brand-new thread receives the entire conversation
    assert_eq!(run.input["messages"].as_array().unwrap().len(), 3);
    assert_eq!(run.options.multitask_strategy, MultitaskStrategy::Enqueue);
    assert_eq!(run.options.if_not_exists, IfNotExists::Create);
    assert_eq!(
        run.options.stream_modes,
        vec!["values", "messages", "custom"]
    );
    assert_eq!(state.planner_session.as_ref(), Some(&session));
}

#[tokio::test]
async fn resumed_planner_keeps_thread_and_forwards_latest_only() {
    let runtime = Arc::new(FakeRuntime::default());
    let vcs = Arc::new(FakeVcs::default());
    let coordinator = coordinator(runtime.clone(), vcs, Some("start_planner"));

    let mut state = base_state();
    state.planner_session = Some(SessionRef {
        thread_id: "planner-t1".to_string(),
        run_id: "run-old".to_string(),
    });

    let outcome = coordinator
        .classify(&state, &CancellationToken::new())
        .await
        .expect("classify");
    let session = coordinator
        .dispatch(&mut state, &outcome)
        .await
        .expect("dispatch")
        .expect("planner resumed");

    assert_eq!(session.thread_id, "planner-t1");
    assert_ne!(session.run_id, "run-old");
    let runs = runtime.recorded();
    let messages = runs[0].input["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["content"], "Also add a regression test");
}

#[tokio::test]
async fn new_issue_route_creates_issue_then_plans() {
    let runtime = Arc::new(FakeRuntime::default());
    let vcs = Arc::new(FakeVcs::default());
    let coordinator = coordinator(runtime.clone(), vcs.clone(), Some("new_issue"));

    let mut state = base_state();
    let outcome = coordinator
        .classify(&state, &CancellationToken::new())
        .await
        .expect("classify");
    assert_eq!(outcome.route, Route::NewIssue);
    assert_eq!(outcome.issue_number, Some(100));
    assert_eq!(vcs.issues_created.load(Ordering::SeqCst), 1);

    coordinator
        .dispatch(&mut state, &outcome)
        .await
        .expect("dispatch")
        .expect("planner launched");
    assert_eq!(state.issue_number, Some(100));
    assert_eq!(runtime.recorded().len(), 1);
}

#[tokio::test]
async fn create_new_issue_hands_off_to_fresh_manager_session() {
    let runtime = Arc::new(FakeRuntime::default());
    let vcs = Arc::new(FakeVcs::default());
    let coordinator = coordinator(runtime.clone(), vcs.clone(), Some("create_new_issue"));

    let mut state = base_state();
    let outcome = coordinator
        .classify(&state, &CancellationToken::new())
        .await
        .expect("classify");
    assert_eq!(outcome.route, Route::CreateNewIssue);
    // classification opens no issue for this route
    assert_eq!(outcome.issue_number, None);
    assert_eq!(vcs.issues_created.load(Ordering::SeqCst), 0);

    let session = coordinator
        .dispatch(&mut state, &outcome)
        .await
        .expect("dispatch")
        .expect("manager launched");

    let runs = runtime.recorded();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].graph_id, "manager");
    assert_eq!(runs[0].thread_id, session.thread_id);
    // the fresh session takes over with the entire conversation
    assert_eq!(runs[0].input["messages"].as_array().unwrap().len(), 3);
    assert_eq!(runs[0].options.multitask_strategy, MultitaskStrategy::Enqueue);
    // the originating session keeps its own planner linkage untouched
    assert!(state.planner_session.is_none());
    assert_eq!(vcs.issues_created.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn issue_creation_failure_is_fatal() {
    let runtime = Arc::new(FakeRuntime::default());
    let vcs = Arc::new(FakeVcs::default());
    vcs.fail_create.store(true, Ordering::SeqCst);
    let coordinator = coordinator(runtime, vcs, Some("new_issue"));

    let err = coordinator
        .classify(&base_state(), &CancellationToken::new())
        .await
        .expect_err("should fail");
    assert!(format!("{err:#}").contains("tracking issue"));
}

#[tokio::test]
async fn no_op_route_launches_nothing() {
    let runtime = Arc::new(FakeRuntime::default());
    let vcs = Arc::new(FakeVcs::default());
    let coordinator = coordinator(runtime.clone(), vcs.clone(), Some("no_op"));

    let mut state = base_state();
    let outcome = coordinator
        .classify(&state, &CancellationToken::new())
        .await
        .expect("classify");
    assert_eq!(outcome.route, Route::NoOp);

    let launched = coordinator
        .dispatch(&mut state, &outcome)
        .await
        .expect("dispatch");
    assert!(launched.is_none());
    assert!(runtime.recorded().is_empty());
    assert_eq!(vcs.issues_created.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn missing_tool_call_is_an_error() {
    let runtime = Arc::new(FakeRuntime::default());
    let vcs = Arc::new(FakeVcs::default());
    let coordinator = coordinator(runtime, vcs, None);

    let err = coordinator
        .classify(&base_state(), &CancellationToken::new())
        .await
        .expect_err("should fail");
    assert!(err.to_string().contains("no tool call"));
}

#[tokio::test]
async fn planner_launch_failure_surfaces_without_retry() {
    let runtime = Arc::new(FakeRuntime::default());
    runtime.fail_create.store(true, Ordering::SeqCst);
    let vcs = Arc::new(FakeVcs::default());
    let coordinator = coordinator(runtime.clone(), vcs, Some("start_planner"));

    let err = coordinator
        .start_planner(&base_state())
        .await
        .expect_err("should fail");
    assert!(format!("{err:#}").contains("failed to launch planner run"));
    assert!(runtime.recorded().is_empty());
}

#[tokio::test]
async fn status_reports_paused_planner_over_running_programmer() {
    let runtime = Arc::new(FakeRuntime::default());
    let vcs = Arc::new(FakeVcs::default());
    let coordinator = coordinator(runtime.clone(), vcs, Some("no_op"));

    runtime.set_thread("manager-t", SessionStatus::Success, json!({}));
    runtime.set_thread(
        "planner-t",
        SessionStatus::Interrupted,
        json!({"programmer_session": {"thread_id": "programmer-t", "run_id": "run-p"}}),
    );
    runtime.set_thread("programmer-t", SessionStatus::Running, json!({}));

    let mut state = base_state();
    state.planner_session = Some(SessionRef {
        thread_id: "planner-t".to_string(),
        run_id: "run-1".to_string(),
    });

    let snapshot = coordinator
        .status("manager-t", &state)
        .await
        .expect("status");
    assert_eq!(snapshot.status, DisplayStatus::Paused);
    assert_eq!(snapshot.thread_id.as_deref(), Some("planner-t"));
}

#[tokio::test]
async fn programmer_hand_off_uses_programmer_graph() {
    let runtime = Arc::new(FakeRuntime::default());
    let vcs = Arc::new(FakeVcs::default());
    let coordinator = coordinator(runtime.clone(), vcs, Some("no_op"));

    let session = coordinator
        .start_programmer(
            None,
            json!({"task_plan": {"tasks": []}, "sandbox_id": "sb-1"}),
        )
        .await
        .expect("launch");

    let runs = runtime.recorded();
    assert_eq!(runs[0].graph_id, "programmer");
    assert_eq!(runs[0].input["sandbox_id"], "sb-1");
    assert_eq!(runs[0].thread_id, session.thread_id);
}
