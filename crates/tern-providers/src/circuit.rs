use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before a circuit opens.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Seconds an open circuit stays open before it is considered
    /// available again.
    #[serde(default = "default_open_timeout_secs")]
    pub open_timeout_secs: u64,
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_open_timeout_secs() -> u64 {
    300
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            open_timeout_secs: default_open_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct CircuitState {
    failure_count: u32,
    opened_at: Option<Instant>,
    last_failure_at: Option<Instant>,
}

/// Per-model failure tracker keyed by `provider:model`. Constructed by the
/// caller and shared by handle, so tests and separate gateways get
/// independent failure state.
#[derive(Clone)]
pub struct CircuitRegistry {
    config: CircuitBreakerConfig,
    circuits: Arc<RwLock<HashMap<String, CircuitState>>>,
}

impl CircuitRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            circuits: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Closes the circuit and zeroes the failure count.
    pub async fn record_success(&self, key: &str) {
        let mut circuits = self.circuits.write().await;
        circuits.remove(key);
    }

    /// Increments the failure count; at the threshold the circuit opens.
    pub async fn record_failure(&self, key: &str) {
        let mut circuits = self.circuits.write().await;
        let state = circuits.entry(key.to_string()).or_default();
        state.failure_count += 1;
        state.last_failure_at = Some(Instant::now());
        if state.failure_count >= self.config.failure_threshold && state.opened_at.is_none() {
            state.opened_at = Some(Instant::now());
            tracing::warn!(
                circuit = key,
                failures = state.failure_count,
                "model circuit opened"
            );
        }
    }

    /// True when the circuit is open and its timeout has not elapsed.
    /// An expired open circuit auto-closes here.
    pub async fn is_open(&self, key: &str) -> bool {
        let timeout = Duration::from_secs(self.config.open_timeout_secs);
        let mut circuits = self.circuits.write().await;
        let Some(state) = circuits.get_mut(key) else {
            return false;
        };
        match state.opened_at {
            None => false,
            Some(opened) if opened.elapsed() >= timeout => {
                circuits.remove(key);
                tracing::info!(circuit = key, "model circuit re-closed after timeout");
                false
            }
            Some(_) => true,
        }
    }

    pub async fn failure_count(&self, key: &str) -> u32 {
        self.circuits
            .read()
            .await
            .get(key)
            .map(|s| s.failure_count)
            .unwrap_or(0)
    }
}

impl Default for CircuitRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
