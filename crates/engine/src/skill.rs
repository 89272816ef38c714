//! Skill backend contracts and tool-name routing.
//!
//! A skill is a pluggable provider of tools. The engine never mutates a
//! backend; it looks tools up, invokes `call_tool` on in-process backends,
//! and suspends the run for the other two kinds.

use async_trait::async_trait;
use relay_llm::{ContentPart, ToolDefinition};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::checkpoint::TodoItem;
use crate::error::EngineError;

/// Tool name of the reasoning scratchpad tool.
pub const THINK_TOOL: &str = "think";
/// Tool name of the completion signal tool.
pub const ATTEMPT_COMPLETION_TOOL: &str = "attempt_completion";
/// Tool name of the multimodal file loader.
pub const LOAD_FILE_TOOL: &str = "load_file";
/// Tool name of the todo-list update tool.
pub const UPDATE_TODOS_TOOL: &str = "update_todos";

/// How a backend's tool results come into existence.
///
/// Closed on purpose: adding a backend kind is a compile-time decision
/// point for every match in the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkillKind {
    /// Result resolvable in-process via `call_tool`.
    Mcp,
    /// Result can only come from a human; the run suspends.
    Interactive,
    /// Result requires spawning a sub-run; the run suspends.
    Delegate,
}

/// A pluggable provider of tools.
#[async_trait]
pub trait SkillManager: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> SkillKind;

    fn list_tool_definitions(&self) -> Vec<ToolDefinition>;

    /// Execute a tool in-process. Only meaningful for [`SkillKind::Mcp`];
    /// interactive and delegate backends never resolve here.
    async fn call_tool(
        &self,
        name: &str,
        args: serde_json::Value,
    ) -> Result<Vec<ContentPart>, EngineError>;
}

/// Name → backend lookup built once per run from the caller's backends.
///
/// Later registrations win on name collisions, matching the registry
/// overwrite semantics callers expect.
pub struct SkillRouter {
    skills: Vec<Arc<dyn SkillManager>>,
    by_tool: HashMap<String, usize>,
}

impl SkillRouter {
    pub fn new(skills: Vec<Arc<dyn SkillManager>>) -> Self {
        let mut by_tool = HashMap::new();
        for (idx, skill) in skills.iter().enumerate() {
            for def in skill.list_tool_definitions() {
                by_tool.insert(def.name, idx);
            }
        }
        Self { skills, by_tool }
    }

    /// The backend advertising `tool_name`, with its kind.
    pub fn resolve(&self, tool_name: &str) -> Option<(&Arc<dyn SkillManager>, SkillKind)> {
        self.by_tool
            .get(tool_name)
            .map(|&idx| (&self.skills[idx], self.skills[idx].kind()))
    }

    /// All tool definitions across backends, in registration order.
    pub fn tool_definitions(&self) -> Vec<ToolDefinition> {
        self.skills
            .iter()
            .flat_map(|skill| skill.list_tool_definitions())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.by_tool.is_empty()
    }
}

// ── Reserved tool argument shapes ─────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ThinkArgs {
    /// The agent's private reasoning for this step.
    pub thought: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AttemptCompletionArgs {
    /// Summary of the completed work.
    pub result: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct LoadFileArgs {
    /// Path or URI of the file to load.
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct UpdateTodosArgs {
    /// Full replacement todo list.
    pub todos: Vec<TodoArg>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TodoArg {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub done: bool,
}

impl From<TodoArg> for TodoItem {
    fn from(arg: TodoArg) -> Self {
        TodoItem {
            id: arg.id,
            title: arg.title,
            done: arg.done,
        }
    }
}

fn schema_of<T: JsonSchema>() -> serde_json::Value {
    serde_json::to_value(schemars::schema_for!(T)).unwrap_or_else(|_| serde_json::json!({}))
}

/// Definitions for the engine-reserved tools, for backends that host them.
pub fn reserved_tool_definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition::new(
            THINK_TOOL,
            "Record intermediate reasoning without acting",
            schema_of::<ThinkArgs>(),
        ),
        ToolDefinition::new(
            ATTEMPT_COMPLETION_TOOL,
            "Signal that the task is finished and provide the result",
            schema_of::<AttemptCompletionArgs>(),
        ),
        ToolDefinition::new(
            LOAD_FILE_TOOL,
            "Load a file (pdf or image) into the conversation",
            schema_of::<LoadFileArgs>(),
        ),
        ToolDefinition::new(
            UPDATE_TODOS_TOOL,
            "Replace the run's todo list",
            schema_of::<UpdateTodosArgs>(),
        ),
    ]
}
