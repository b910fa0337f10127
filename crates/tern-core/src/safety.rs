use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use tern_providers::{ChatMessage, ModelGateway, TaskKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyVerdict {
    pub safe: bool,
    pub risk_level: RiskLevel,
    pub reasoning: String,
}

const SAFETY_PROMPT: &str = "You evaluate whether a shell command is safe to run \
inside an isolated development sandbox. Respond with a JSON object only, no prose: \
{\"safe\": bool, \"risk_level\": \"low\"|\"medium\"|\"high\", \"reasoning\": string}. \
Commands that exfiltrate secrets, modify systems outside the workspace, or destroy \
data irrecoverably are unsafe.";

/// Model-backed command screening. Fails closed: when the model cannot be
/// reached or answers with something unparseable, the command is treated
/// as unsafe.
pub struct CommandSafetyEvaluator;

impl CommandSafetyEvaluator {
    pub async fn evaluate(
        gateway: &ModelGateway,
        command: &str,
        cancel: &CancellationToken,
    ) -> SafetyVerdict {
        let messages = vec![
            ChatMessage::system(SAFETY_PROMPT),
            ChatMessage::user(format!("Command:\n{command}")),
        ];
        let response = match gateway
            .invoke(TaskKind::SafetyEvaluator, &messages, &[], cancel)
            .await
        {
            Ok(out) => out,
            Err(err) => {
                tracing::warn!(
                    error = %format!("{err:#}"),
                    "safety evaluation unavailable, refusing command"
                );
                return Self::unsafe_verdict(format!("evaluation failed: {err:#}"));
            }
        };

        let content = response.response.turn.content.unwrap_or_default();
        match parse_verdict(&content) {
            Some(verdict) => verdict,
            None => {
                tracing::warn!("safety evaluation returned unparseable verdict");
                Self::unsafe_verdict("evaluator response was not a valid verdict".to_string())
            }
        }
    }

    fn unsafe_verdict(reasoning: String) -> SafetyVerdict {
        SafetyVerdict {
            safe: false,
            risk_level: RiskLevel::High,
            reasoning,
        }
    }
}

fn parse_verdict(content: &str) -> Option<SafetyVerdict> {
    let trimmed = content.trim();
    // Models occasionally wrap the JSON in a fenced block.
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .map(|s| s.trim_end_matches("```").trim())
        .unwrap_or(trimmed);
    serde_json::from_str::<SafetyVerdict>(body).ok()
}
