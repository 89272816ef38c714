use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::LlmError;
use crate::message::{Message, ToolCallRequest};
use crate::tool::ToolDefinition;
use crate::usage::Usage;

/// Why a generation ended.
///
/// `Unknown` captures any value the wire protocol produced that this crate
/// does not model; the run engine treats it as protocol drift and aborts
/// rather than guessing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FinishReason {
    Stop,
    ToolCalls,
    Length,
    Error,
    Unknown,
}

impl<'de> Deserialize<'de> for FinishReason {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        Ok(match value.as_str() {
            "stop" => FinishReason::Stop,
            "tool-calls" => FinishReason::ToolCalls,
            "length" => FinishReason::Length,
            "error" => FinishReason::Error,
            _ => FinishReason::Unknown,
        })
    }
}

/// Per-request generation knobs. All optional; backends apply their own
/// defaults for anything unset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

/// One request to the model: the full message history plus the tools the
/// agent may call this step.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    pub model: String,
    pub settings: GenerateSettings,
}

/// What the model produced for one request.
#[derive(Debug, Clone)]
pub struct Generation {
    pub text: Option<String>,
    pub tool_calls: Vec<ToolCallRequest>,
    pub finish_reason: FinishReason,
    pub usage: Usage,
}

impl Generation {
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }

    /// True when the response carries neither text nor tool calls.
    pub fn is_empty(&self) -> bool {
        self.tool_calls.is_empty() && self.text.as_deref().unwrap_or("").trim().is_empty()
    }
}

/// The model call, abstracted. The run engine never talks HTTP; it hands a
/// [`GenerateRequest`] to whatever implementation the caller injected.
#[async_trait]
pub trait LlmExecutor: Send + Sync {
    async fn generate(&self, request: GenerateRequest) -> Result<Generation, LlmError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finish_reason_wire_names() {
        assert_eq!(
            serde_json::to_string(&FinishReason::ToolCalls).unwrap(),
            "\"tool-calls\""
        );
        assert_eq!(
            serde_json::to_string(&FinishReason::Stop).unwrap(),
            "\"stop\""
        );
        let drifted: FinishReason = serde_json::from_str("\"content-filter\"").unwrap();
        assert_eq!(drifted, FinishReason::Unknown);
    }

    #[test]
    fn empty_detection_ignores_whitespace() {
        let r#gen = Generation {
            text: Some("   \n".to_string()),
            tool_calls: vec![],
            finish_reason: FinishReason::Stop,
            usage: Usage::default(),
        };
        assert!(r#gen.is_empty());

        let r#gen = Generation {
            text: None,
            tool_calls: vec![ToolCallRequest {
                id: "tc_1".to_string(),
                name: "search".to_string(),
                arguments: serde_json::json!({}),
            }],
            finish_reason: FinishReason::ToolCalls,
            usage: Usage::default(),
        };
        assert!(!r#gen.is_empty());
        assert!(r#gen.has_tool_calls());
    }
}
