//! Shared stub collaborators for the integration suites.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use relay_engine::{Checkpoint, CheckpointStore, EngineError, SkillKind, SkillManager};
use relay_llm::{
    ContentPart, FinishReason, GenerateRequest, Generation, LlmError, LlmExecutor,
    ToolCallRequest, ToolDefinition, Usage,
};

/// Route engine logs through the test harness when `RUST_LOG` is set.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// LLM stub that replays a fixed script of responses in call order.
pub struct ScriptedLlm {
    script: Mutex<VecDeque<Result<Generation, LlmError>>>,
}

impl ScriptedLlm {
    pub fn new(script: Vec<Result<Generation, LlmError>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
        })
    }
}

#[async_trait]
impl LlmExecutor for ScriptedLlm {
    async fn generate(&self, _request: GenerateRequest) -> Result<Generation, LlmError> {
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .expect("llm called more often than the script allows")
    }
}

pub fn text_response(text: &str) -> Result<Generation, LlmError> {
    Ok(Generation {
        text: Some(text.to_string()),
        tool_calls: vec![],
        finish_reason: FinishReason::Stop,
        usage: Usage::new(10, 5),
    })
}

pub fn tool_response(calls: Vec<(&str, &str, serde_json::Value)>) -> Result<Generation, LlmError> {
    Ok(Generation {
        text: None,
        tool_calls: calls
            .into_iter()
            .map(|(id, name, arguments)| ToolCallRequest {
                id: id.to_string(),
                name: name.to_string(),
                arguments,
            })
            .collect(),
        finish_reason: FinishReason::ToolCalls,
        usage: Usage::new(10, 5),
    })
}

pub fn rate_limited() -> Result<Generation, LlmError> {
    Err(LlmError::RateLimited {
        message: "slow down".to_string(),
        retry_after_secs: Some(0),
    })
}

/// Checkpoint store that records every save in order.
#[derive(Default)]
pub struct MemoryStore {
    pub saves: Mutex<Vec<Checkpoint>>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn save_count(&self) -> usize {
        self.saves.lock().unwrap().len()
    }
}

#[async_trait]
impl CheckpointStore for MemoryStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), EngineError> {
        self.saves.lock().unwrap().push(checkpoint.clone());
        Ok(())
    }
}

/// In-process skill whose tools echo their input, sleeping for
/// `args.delay_ms` first when present.
pub struct EchoSkill {
    name: String,
    tools: Vec<String>,
}

impl EchoSkill {
    pub fn new(name: &str, tools: &[&str]) -> Arc<dyn SkillManager> {
        Arc::new(Self {
            name: name.to_string(),
            tools: tools.iter().map(|t| t.to_string()).collect(),
        })
    }
}

#[async_trait]
impl SkillManager for EchoSkill {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> SkillKind {
        SkillKind::Mcp
    }

    fn list_tool_definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .iter()
            .map(|t| ToolDefinition::new(t.clone(), "", serde_json::json!({"type": "object"})))
            .collect()
    }

    async fn call_tool(
        &self,
        name: &str,
        args: serde_json::Value,
    ) -> Result<Vec<ContentPart>, EngineError> {
        if let Some(delay) = args.get("delay_ms").and_then(|v| v.as_u64()) {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        let input = args
            .get("input")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        Ok(vec![ContentPart::text(format!("{name}({input})"))])
    }
}

/// Backend whose tools never resolve in-process (interactive or delegate).
pub struct PassiveSkill {
    name: String,
    kind: SkillKind,
    tools: Vec<String>,
}

impl PassiveSkill {
    pub fn new(name: &str, kind: SkillKind, tools: &[&str]) -> Arc<dyn SkillManager> {
        Arc::new(Self {
            name: name.to_string(),
            kind,
            tools: tools.iter().map(|t| t.to_string()).collect(),
        })
    }
}

#[async_trait]
impl SkillManager for PassiveSkill {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> SkillKind {
        self.kind
    }

    fn list_tool_definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .iter()
            .map(|t| ToolDefinition::new(t.clone(), "", serde_json::json!({"type": "object"})))
            .collect()
    }

    async fn call_tool(
        &self,
        name: &str,
        _args: serde_json::Value,
    ) -> Result<Vec<ContentPart>, EngineError> {
        Err(EngineError::Skill {
            skill: self.name.clone(),
            reason: format!("tool '{name}' does not resolve in-process"),
        })
    }
}

/// Ids of tool-result messages in history order.
pub fn result_ids(checkpoint: &Checkpoint) -> Vec<String> {
    checkpoint
        .messages
        .iter()
        .flat_map(|message| {
            message.parts.iter().filter_map(|part| match part {
                ContentPart::ToolResult { id, .. } => Some(id.clone()),
                _ => None,
            })
        })
        .collect()
}
