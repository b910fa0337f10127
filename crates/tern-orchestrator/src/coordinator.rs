use std::sync::Arc;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::Level;
use uuid::Uuid;

use tern_core::{DurableRuntime, EventBus, RunOptions, VcsClient};
use tern_observability::{emit_event, ObservabilityEvent, ProcessKind};
use tern_providers::{ChatMessage, ModelGateway, TaskKind};
use tern_types::{
    DisplayStatus, EngineEvent, SessionRef, SessionStatus, TaskPlan, ToolSchema,
};

use crate::model::{ClassifyOutcome, ManagerState, Route, StatusSnapshot};
use crate::status::{programmer_display_status, resolve_status};

const ROUTER_PROMPT: &str = "You are the manager of a coding-agent session hierarchy. \
Read the user's latest message together with the current planner and programmer status \
and decide where it should go. Always call the respond_and_route tool exactly once. \
Routes: no_op (conversational reply, no session work), create_new_issue (the \
request is unrelated new work; hand the conversation to a fresh manager session), \
new_issue (open a tracking issue and start planning), start_planner (start or \
resume planning on the existing work).";

/// Drives the Manager tier: classifies incoming messages, opens tracking
/// issues, and hands work off to planner and programmer sessions on the
/// durable-execution runtime.
pub struct Coordinator<R, V> {
    runtime: Arc<R>,
    vcs: Arc<V>,
    gateway: Arc<ModelGateway>,
    event_bus: EventBus,
    local_mode: bool,
}

impl<R: DurableRuntime, V: VcsClient> Coordinator<R, V> {
    pub fn new(
        runtime: Arc<R>,
        vcs: Arc<V>,
        gateway: Arc<ModelGateway>,
        event_bus: EventBus,
        local_mode: bool,
    ) -> Self {
        Self {
            runtime,
            vcs,
            gateway,
            event_bus,
            local_mode,
        }
    }

    /// Routes the latest user message. The model is bound to a single
    /// tool; an answer without a tool call is an error, not a default
    /// route.
    pub async fn classify(
        &self,
        state: &ManagerState,
        cancel: &CancellationToken,
    ) -> anyhow::Result<ClassifyOutcome> {
        let Some(latest) = state.latest_user_message() else {
            anyhow::bail!("no user message to classify");
        };

        let planner_status = self.session_status(state.planner_session.as_ref()).await;
        let programmer_ref = self.programmer_ref(state.planner_session.as_ref()).await;
        let programmer_status = self.session_status(programmer_ref.as_ref()).await;
        let task_plan = self.current_task_plan(state).await;

        let context = format!(
            "planner status: {}\nprogrammer status: {}\ntask plan: {}\nissue linked: {}",
            DisplayStatus::from_session_status(planner_status).as_str(),
            DisplayStatus::from_session_status(programmer_status).as_str(),
            match &task_plan {
                Some(plan) if plan.active_items_completed() => "all active items completed",
                Some(_) => "in progress",
                None => "none",
            },
            state.issue_number.is_some(),
        );

        let messages = vec![
            ChatMessage::system(ROUTER_PROMPT),
            ChatMessage::system(context),
            ChatMessage::user(latest.content.clone()),
        ];
        let tools = vec![respond_and_route_tool()];
        let out = self
            .gateway
            .invoke(TaskKind::Router, &messages, &tools, cancel)
            .await?;

        let Some(call) = out.response.turn.tool_calls.first() else {
            anyhow::bail!("classification produced no tool call");
        };
        let route: Route = serde_json::from_value(
            call.args
                .get("route")
                .cloned()
                .unwrap_or(Value::Null),
        )
        .map_err(|err| anyhow::anyhow!("classification returned an invalid route: {err}"))?;
        let response = call
            .args
            .get("response")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        // Only the new_issue route opens a tracking issue here. A
        // create_new_issue hand-off leaves that to the fresh session.
        let issue_number = match route {
            Route::NewIssue => self.create_issue_for(state, &latest.content).await?,
            Route::NoOp | Route::CreateNewIssue | Route::StartPlanner => None,
        };

        emit_event(
            Level::INFO,
            ProcessKind::Engine,
            ObservabilityEvent {
                event: "manager.classified",
                component: "coordinator",
                correlation_id: None,
                session_id: None,
                thread_id: state.planner_session.as_ref().map(|s| s.thread_id.as_str()),
                run_id: None,
                sandbox_id: None,
                provider_id: Some(out.model.provider_id.as_str()),
                model_id: Some(out.model.model_id.as_str()),
                status: Some(route.as_str()),
                error_code: None,
                detail: None,
            },
        );
        self.event_bus.publish(EngineEvent::new(
            "manager.classified",
            json!({"route": route.as_str(), "issueNumber": issue_number}),
        ));

        Ok(ClassifyOutcome {
            route,
            response,
            issue_number,
        })
    }

    /// Applies a classification to the manager state: launches the
    /// planner, or hands the conversation to a fresh manager session,
    /// where the route calls for it.
    pub async fn dispatch(
        &self,
        state: &mut ManagerState,
        outcome: &ClassifyOutcome,
    ) -> anyhow::Result<Option<SessionRef>> {
        if outcome.issue_number.is_some() {
            state.issue_number = outcome.issue_number;
        }
        match outcome.route {
            Route::NoOp => Ok(None),
            Route::CreateNewIssue => Ok(Some(self.start_manager(state).await?)),
            Route::NewIssue | Route::StartPlanner => {
                let session = self.start_planner(state).await?;
                state.planner_session = Some(session.clone());
                Ok(Some(session))
            }
        }
    }

    /// Hands the conversation to a brand-new top-level manager session.
    /// The fresh thread always gets a new id and the full message
    /// history; the originating session keeps none of the new work.
    pub async fn start_manager(&self, state: &ManagerState) -> anyhow::Result<SessionRef> {
        let thread_id = Uuid::new_v4().to_string();
        let messages: Vec<Value> = state
            .messages
            .iter()
            .map(|m| json!({"role": m.role, "content": m.content}))
            .collect();
        let input = json!({
            "messages": messages,
            "target_repository": state.target_repository,
            "branch_name": state.branch_name,
            "local_mode": state.local_mode || self.local_mode,
        });

        let run = self
            .runtime
            .create_run(
                &thread_id,
                "manager",
                input,
                RunOptions::enqueue_with_streams(),
            )
            .await
            .map_err(|err| err.context("failed to launch manager run"))?;

        self.event_bus.publish(EngineEvent::new(
            "manager.started",
            json!({"threadId": thread_id, "runId": run.run_id}),
        ));

        Ok(SessionRef {
            thread_id,
            run_id: run.run_id,
        })
    }

    /// Launches or resumes the planner session. A stored planner thread
    /// is reused and receives only the latest user message; a brand-new
    /// thread gets the whole conversation. Launch failures surface
    /// immediately, there is no retry.
    pub async fn start_planner(&self, state: &ManagerState) -> anyhow::Result<SessionRef> {
        let resuming = state.planner_session.is_some();
        let thread_id = state
            .planner_session
            .as_ref()
            .map(|s| s.thread_id.clone())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let messages: Vec<Value> = if resuming {
            state
                .latest_user_message()
                .map(|m| vec![json!({"role": m.role, "content": m.content})])
                .unwrap_or_default()
        } else {
            state
                .messages
                .iter()
                .map(|m| json!({"role": m.role, "content": m.content}))
                .collect()
        };

        let input = json!({
            "messages": messages,
            "target_repository": state.target_repository,
            "branch_name": state.branch_name,
            "issue_number": state.issue_number,
            "local_mode": state.local_mode || self.local_mode,
        });

        let run = match self
            .runtime
            .create_run(
                &thread_id,
                "planner",
                input,
                RunOptions::enqueue_with_streams(),
            )
            .await
        {
            Ok(run) => run,
            Err(err) => {
                emit_event(
                    Level::ERROR,
                    ProcessKind::Engine,
                    ObservabilityEvent {
                        event: "planner.launch_failed",
                        component: "coordinator",
                        correlation_id: None,
                        session_id: None,
                        thread_id: Some(&thread_id),
                        run_id: None,
                        sandbox_id: None,
                        provider_id: None,
                        model_id: None,
                        status: None,
                        error_code: None,
                        detail: Some(&format!("{err:#}")),
                    },
                );
                return Err(err.context("failed to launch planner run"));
            }
        };

        self.event_bus.publish(EngineEvent::new(
            "planner.started",
            json!({"threadId": thread_id, "runId": run.run_id, "resumed": resuming}),
        ));

        Ok(SessionRef {
            thread_id,
            run_id: run.run_id,
        })
    }

    /// Planner-to-programmer hand-off, same launch contract as
    /// `start_planner`. `input` carries the plan and sandbox linkage the
    /// programmer graph needs.
    pub async fn start_programmer(
        &self,
        existing: Option<&SessionRef>,
        input: Value,
    ) -> anyhow::Result<SessionRef> {
        let thread_id = existing
            .map(|s| s.thread_id.clone())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let run = self
            .runtime
            .create_run(
                &thread_id,
                "programmer",
                input,
                RunOptions::enqueue_with_streams(),
            )
            .await
            .map_err(|err| err.context("failed to launch programmer run"))?;

        self.event_bus.publish(EngineEvent::new(
            "programmer.started",
            json!({"threadId": thread_id, "runId": run.run_id}),
        ));

        Ok(SessionRef {
            thread_id,
            run_id: run.run_id,
        })
    }

    /// The hierarchy's single user-facing status.
    pub async fn status(
        &self,
        manager_thread_id: &str,
        state: &ManagerState,
    ) -> anyhow::Result<StatusSnapshot> {
        let manager_status = self.thread_status(manager_thread_id).await;
        let manager = StatusSnapshot::for_thread(
            DisplayStatus::from_session_status(manager_status),
            manager_thread_id,
        );

        let planner = match state.planner_session.as_ref() {
            Some(session) => {
                let status = self.thread_status(&session.thread_id).await;
                Some(StatusSnapshot {
                    status: DisplayStatus::from_session_status(status),
                    thread_id: Some(session.thread_id.clone()),
                    run_id: Some(session.run_id.clone()),
                })
            }
            None => None,
        };

        let programmer_ref = self.programmer_ref(state.planner_session.as_ref()).await;
        let programmer = match programmer_ref {
            Some(session) => {
                let status = self.thread_status(&session.thread_id).await;
                let display = programmer_display_status(
                    status,
                    status == SessionStatus::Success,
                    state.task_plan.as_ref(),
                );
                Some(StatusSnapshot {
                    status: display,
                    thread_id: Some(session.thread_id),
                    run_id: Some(session.run_id),
                })
            }
            None => None,
        };

        Ok(resolve_status(manager, planner, programmer))
    }

    /// Missing or unreachable threads read as not started.
    async fn thread_status(&self, thread_id: &str) -> SessionStatus {
        match self.runtime.get_thread(thread_id).await {
            Ok(Some(snapshot)) => snapshot.status,
            Ok(None) => SessionStatus::NotStarted,
            Err(err) => {
                tracing::warn!(
                    thread_id,
                    error = %format!("{err:#}"),
                    "thread status lookup failed"
                );
                SessionStatus::NotStarted
            }
        }
    }

    async fn session_status(&self, session: Option<&SessionRef>) -> SessionStatus {
        match session {
            Some(session) => self.thread_status(&session.thread_id).await,
            None => SessionStatus::NotStarted,
        }
    }

    /// The programmer session ref lives in the planner thread's values.
    async fn programmer_ref(&self, planner: Option<&SessionRef>) -> Option<SessionRef> {
        let planner = planner?;
        let snapshot = self.runtime.get_thread(&planner.thread_id).await.ok()??;
        let raw = snapshot
            .values
            .get("programmer_session")
            .or_else(|| snapshot.values.get("programmerSession"))?
            .clone();
        serde_json::from_value(raw).ok()
    }

    /// The linked issue is the source of truth for the task plan; the
    /// manager state is the fallback (and the only source in local mode).
    async fn current_task_plan(&self, state: &ManagerState) -> Option<TaskPlan> {
        if !state.local_mode && !self.local_mode {
            if let (Some(repo), Some(number)) =
                (state.target_repository.as_ref(), state.issue_number)
            {
                match self.vcs.get_issue(repo, number).await {
                    Ok(Some(issue)) => {
                        if let Some(plan) = extract_plan_from_issue_body(&issue.body) {
                            return Some(plan);
                        }
                    }
                    Ok(None) => {}
                    Err(err) => {
                        tracing::warn!(
                            issue = number,
                            error = %format!("{err:#}"),
                            "issue fetch failed, using cached task plan"
                        );
                    }
                }
            }
        }
        state.task_plan.clone()
    }

    /// Issue creation is fatal when the route demands it; partial routing
    /// without the tracking issue would strand the plan.
    async fn create_issue_for(
        &self,
        state: &ManagerState,
        request: &str,
    ) -> anyhow::Result<Option<u64>> {
        if state.local_mode || self.local_mode {
            return Ok(None);
        }
        let Some(repo) = state.target_repository.as_ref() else {
            anyhow::bail!("cannot create an issue without a target repository");
        };
        let title = issue_title(request);
        let issue = self
            .vcs
            .create_issue(repo, &title, request)
            .await
            .map_err(|err| err.context("failed to create tracking issue"))?;
        Ok(Some(issue.number))
    }
}

fn respond_and_route_tool() -> ToolSchema {
    ToolSchema {
        name: "respond_and_route".to_string(),
        description: "Reply to the user and route their message.".to_string(),
        input_schema: json!({
            "type": "object",
            "properties": {
                "route": {
                    "type": "string",
                    "enum": ["no_op", "create_new_issue", "new_issue", "start_planner"]
                },
                "response": {
                    "type": "string",
                    "description": "Reply shown to the user."
                }
            },
            "required": ["route", "response"]
        }),
    }
}

/// Issues embed the task plan as a fenced JSON block in their body.
fn extract_plan_from_issue_body(body: &str) -> Option<TaskPlan> {
    let start = body.find("```json")?;
    let rest = &body[start + "```json".len()..];
    let end = rest.find("```")?;
    serde_json::from_str(rest[..end].trim()).ok()
}

fn issue_title(request: &str) -> String {
    let first_line = request.lines().next().unwrap_or("").trim();
    if first_line.chars().count() <= 72 {
        first_line.to_string()
    } else {
        let truncated: String = first_line.chars().take(71).collect();
        format!("{truncated}…")
    }
}
