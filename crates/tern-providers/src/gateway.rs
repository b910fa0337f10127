use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use tern_types::{ModelSpec, ToolSchema};

use crate::circuit::CircuitRegistry;
use crate::retry::{with_overload_retry, RetryPolicy};
use crate::{ChatMessage, ModelResponse, Provider};

/// What the model is being asked to do. Each task kind can carry its own
/// preferred model in config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Router,
    Planner,
    Programmer,
    Summarizer,
    SafetyEvaluator,
}

impl TaskKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskKind::Router => "router",
            TaskKind::Planner => "planner",
            TaskKind::Programmer => "programmer",
            TaskKind::Summarizer => "summarizer",
            TaskKind::SafetyEvaluator => "safety_evaluator",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GatewayConfig {
    /// Preferred model per task kind, keyed by `TaskKind::as_str()`.
    #[serde(default)]
    pub task_models: HashMap<String, ModelSpec>,
    /// Models tried in order once the preferred one is unavailable.
    #[serde(default)]
    pub fallback_order: Vec<ModelSpec>,
}

impl GatewayConfig {
    /// Ordered, de-duplicated candidate list for a task: the task's
    /// preferred model first, then the global fallback chain.
    pub fn candidates(&self, task: TaskKind) -> Vec<ModelSpec> {
        let mut out: Vec<ModelSpec> = Vec::new();
        if let Some(preferred) = self.task_models.get(task.as_str()) {
            out.push(preferred.clone());
        }
        for spec in &self.fallback_order {
            if !out.contains(spec) {
                out.push(spec.clone());
            }
        }
        out
    }
}

#[derive(Debug, Clone)]
pub struct GatewayResponse {
    /// The model that actually answered, which callers surface so a
    /// fallback is visible in transcripts.
    pub model: ModelSpec,
    pub response: ModelResponse,
}

/// Routes model invocations through the circuit-breaker fallback chain.
/// Every candidate attempt gets the same messages and the same tool
/// bindings, so a fallback model sees an identical request.
pub struct ModelGateway {
    providers: HashMap<String, Arc<dyn Provider>>,
    circuits: CircuitRegistry,
    config: GatewayConfig,
    retry: RetryPolicy,
}

impl ModelGateway {
    pub fn new(
        providers: HashMap<String, Arc<dyn Provider>>,
        circuits: CircuitRegistry,
        config: GatewayConfig,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            providers,
            circuits,
            config,
            retry,
        }
    }

    pub fn circuits(&self) -> &CircuitRegistry {
        &self.circuits
    }

    pub async fn invoke(
        &self,
        task: TaskKind,
        messages: &[ChatMessage],
        tools: &[ToolSchema],
        cancel: &CancellationToken,
    ) -> anyhow::Result<GatewayResponse> {
        let candidates = self.config.candidates(task);
        if candidates.is_empty() {
            anyhow::bail!(
                "no models configured for task `{}` (set a task model or a fallback order)",
                task.as_str()
            );
        }

        let total = candidates.len();
        let mut last_error: Option<anyhow::Error> = None;
        let mut skipped_open = 0usize;

        for (index, spec) in candidates.iter().enumerate() {
            if cancel.is_cancelled() {
                anyhow::bail!("cancelled before invoking task `{}`", task.as_str());
            }

            let key = spec.circuit_key();
            if self.circuits.is_open(&key).await {
                tracing::debug!(
                    task = task.as_str(),
                    model = %spec,
                    attempt = index + 1,
                    total,
                    "skipping model with open circuit"
                );
                skipped_open += 1;
                continue;
            }

            let Some(provider) = self.providers.get(&spec.provider_id) else {
                tracing::warn!(
                    task = task.as_str(),
                    model = %spec,
                    "provider not configured, skipping candidate"
                );
                last_error = Some(anyhow::anyhow!(
                    "provider `{}` is not configured",
                    spec.provider_id
                ));
                continue;
            };

            tracing::info!(
                task = task.as_str(),
                model = %spec,
                attempt = index + 1,
                total,
                "invoking model"
            );

            let result = with_overload_retry(&self.retry, cancel, || {
                provider.invoke(&spec.model_id, messages, tools)
            })
            .await;

            match result {
                Ok(response) => {
                    self.circuits.record_success(&key).await;
                    return Ok(GatewayResponse {
                        model: spec.clone(),
                        response,
                    });
                }
                Err(err) => {
                    self.circuits.record_failure(&key).await;
                    tracing::warn!(
                        task = task.as_str(),
                        model = %spec,
                        attempt = index + 1,
                        total,
                        error = %format!("{err:#}"),
                        "model invocation failed, trying next candidate"
                    );
                    last_error = Some(err);
                }
            }
        }

        match last_error {
            Some(err) => Err(err.context(format!(
                "all {} model candidates exhausted for task `{}`",
                total,
                task.as_str()
            ))),
            None => anyhow::bail!(
                "all {} model candidates for task `{}` have open circuits ({} skipped)",
                total,
                task.as_str(),
                skipped_open
            ),
        }
    }
}
