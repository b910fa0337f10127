use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use tern_types::{EngineEvent, SessionStatus};

/// What the runtime does when a run is enqueued on a thread that already
/// has one in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MultitaskStrategy {
    /// Queue behind the in-flight run; never abort it.
    Enqueue,
    Interrupt,
    Reject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IfNotExists {
    Create,
    Reject,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOptions {
    pub multitask_strategy: MultitaskStrategy,
    /// Stream channels the caller wants to observe on the run.
    #[serde(default)]
    pub stream_modes: Vec<String>,
    pub if_not_exists: IfNotExists,
}

impl RunOptions {
    /// Options every child-session launch uses: queue new work, observe
    /// all stream channels, create the thread on first use.
    pub fn enqueue_with_streams() -> Self {
        Self {
            multitask_strategy: MultitaskStrategy::Enqueue,
            stream_modes: vec![
                "values".to_string(),
                "messages".to_string(),
                "custom".to_string(),
            ],
            if_not_exists: IfNotExists::Create,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunInfo {
    pub run_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadSnapshot {
    pub status: SessionStatus,
    /// The thread's persisted state values as raw JSON.
    #[serde(default)]
    pub values: Value,
}

/// The durable-execution runtime that owns threads, runs, and persisted
/// state. Tern treats it as a black box behind this seam.
#[async_trait]
pub trait DurableRuntime: Send + Sync {
    async fn create_run(
        &self,
        thread_id: &str,
        graph_id: &str,
        input: Value,
        options: RunOptions,
    ) -> anyhow::Result<RunInfo>;

    /// `None` when the thread does not exist.
    async fn get_thread(&self, thread_id: &str) -> anyhow::Result<Option<ThreadSnapshot>>;

    async fn update_thread_state(&self, thread_id: &str, patch: Value) -> anyhow::Result<()>;

    async fn join_stream(
        &self,
        thread_id: &str,
        run_id: &str,
    ) -> anyhow::Result<BoxStream<'static, EngineEvent>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enqueue_options_request_all_stream_channels() {
        let options = RunOptions::enqueue_with_streams();
        assert_eq!(options.multitask_strategy, MultitaskStrategy::Enqueue);
        assert_eq!(options.stream_modes, vec!["values", "messages", "custom"]);
        assert_eq!(options.if_not_exists, IfNotExists::Create);
    }

    #[test]
    fn multitask_strategy_serializes_snake_case() {
        assert_eq!(
            serde_json::to_value(MultitaskStrategy::Enqueue).unwrap(),
            serde_json::json!("enqueue")
        );
    }
}
