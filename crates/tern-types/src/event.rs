use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single event on the session event stream. `properties` is a free-form
/// JSON object so graph-specific payloads pass through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub properties: Value,
    pub created_at: DateTime<Utc>,
}

impl EngineEvent {
    pub fn new(event_type: impl Into<String>, properties: Value) -> Self {
        Self {
            event_type: event_type.into(),
            properties,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn serializes_type_field() {
        let ev = EngineEvent::new("approval.asked", json!({"id": "a-1"}));
        let v = serde_json::to_value(&ev).expect("serialize");
        assert_eq!(v["type"], "approval.asked");
        assert_eq!(v["properties"]["id"], "a-1");
    }
}
