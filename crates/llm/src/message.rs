use serde::{Deserialize, Serialize};

/// Author of a message in the conversation history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A tool invocation as proposed by the model.
///
/// `arguments` is kept as raw JSON; argument validation belongs to the
/// backend that owns the tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// One ordered piece of message content.
///
/// Messages are sequences of parts rather than plain strings so that tool
/// traffic and multimodal payloads keep their position in the timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all_fields = "camelCase")]
pub enum ContentPart {
    Text {
        text: String,
    },
    /// Reasoning produced by the agent itself (think tool output or model
    /// reasoning), kept distinct from user-visible text.
    Thought {
        text: String,
    },
    Image {
        media_type: String,
        /// Base64-encoded payload.
        data: String,
    },
    Document {
        media_type: String,
        /// Base64-encoded payload.
        data: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    ToolUse(ToolCallRequest),
    ToolResult {
        id: String,
        tool_name: String,
        parts: Vec<ContentPart>,
    },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        ContentPart::Text { text: text.into() }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            ContentPart::Text { .. } => "text",
            ContentPart::Thought { .. } => "thought",
            ContentPart::Image { .. } => "image",
            ContentPart::Document { .. } => "document",
            ContentPart::ToolUse(_) => "tool_use",
            ContentPart::ToolResult { .. } => "tool_result",
        }
    }

    /// Text carried directly by this part, if any.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ContentPart::Text { text } => Some(text),
            _ => None,
        }
    }
}

/// A single entry in the conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub role: Role,
    pub parts: Vec<ContentPart>,
}

impl Message {
    pub fn new(role: Role, parts: Vec<ContentPart>) -> Self {
        Self { role, parts }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, vec![ContentPart::text(text)])
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, vec![ContentPart::text(text)])
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, vec![ContentPart::text(text)])
    }

    pub fn is_assistant(&self) -> bool {
        self.role == Role::Assistant
    }

    /// Concatenated `Text` parts, or `None` when the message carries no text.
    pub fn text(&self) -> Option<String> {
        let mut out = String::new();
        for part in &self.parts {
            if let Some(t) = part.as_text() {
                out.push_str(t);
            }
        }
        if out.is_empty() { None } else { Some(out) }
    }

    /// Tool invocations proposed by this message, in proposal order.
    pub fn tool_uses(&self) -> Vec<&ToolCallRequest> {
        self.parts
            .iter()
            .filter_map(|part| match part {
                ContentPart::ToolUse(call) => Some(call),
                _ => None,
            })
            .collect()
    }
}
