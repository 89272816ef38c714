//! Durable and transient state of a run.
//!
//! The [`Checkpoint`] is the unit of resumability: everything needed to
//! continue a run after a process restart is in it, serialized in camelCase
//! — that wire shape is the cross-process resume contract. The [`Step`] is
//! the scratch state of one model-generation cycle and is folded into the
//! checkpoint when the cycle settles.

use async_trait::async_trait;
use relay_llm::{ContentPart, Message, Usage};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, RunErrorRecord};

/// Lifecycle of a run as recorded in its checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RunStatus {
    Init,
    Proceeding,
    Completed,
    StoppedByError,
    StoppedByDelegate,
    StoppedByInteractiveTool,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed
                | RunStatus::StoppedByError
                | RunStatus::StoppedByDelegate
                | RunStatus::StoppedByInteractiveTool
        )
    }
}

/// What a run starts (or resumes) from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum RunInput {
    /// Free-text task description for a fresh run.
    Text(String),
    /// The resolved result of a previously suspended tool call
    /// (interactive tool answered, or a delegated child's outcome).
    ToolResult(ToolResult),
}

/// Immutable per-run configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSetting {
    pub job_id: String,
    pub run_id: String,
    /// Key of the expert (agent configuration) this run executes as.
    pub expert: String,
    pub model: String,
    pub max_steps: u32,
    pub max_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_budget_secs: Option<u64>,
    pub initial_input: RunInput,
}

impl RunSetting {
    pub fn new(
        job_id: impl Into<String>,
        expert: impl Into<String>,
        model: impl Into<String>,
        initial_input: RunInput,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            run_id: uuid::Uuid::new_v4().to_string(),
            expert: expert.into(),
            model: model.into(),
            max_steps: 50,
            max_retries: 3,
            time_budget_secs: None,
            initial_input,
        }
    }

    pub fn with_max_steps(mut self, max_steps: u32) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_time_budget_secs(mut self, secs: u64) -> Self {
        self.time_budget_secs = Some(secs);
        self
    }
}

/// A tool invocation the engine has committed to execute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    pub id: String,
    pub skill_name: String,
    pub tool_name: String,
    pub args: serde_json::Value,
}

/// The settled outcome of a [`ToolCall`], matched by `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResult {
    pub id: String,
    pub skill_name: String,
    pub tool_name: String,
    pub result: Vec<ContentPart>,
}

impl ToolResult {
    /// Concatenated text carried by the result parts, if any.
    pub fn text(&self) -> Option<String> {
        let mut out = String::new();
        for part in &self.result {
            if let Some(t) = part.as_text() {
                out.push_str(t);
            }
        }
        if out.is_empty() { None } else { Some(out) }
    }
}

/// Which expert a delegation is addressed to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpertDescriptor {
    pub key: String,
    /// Model override for the child run; the parent's model when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// One requested hand-off to a sub-agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelegationTarget {
    pub expert: ExpertDescriptor,
    /// The tool call that requested this delegation; the child's outcome
    /// resolves it.
    pub tool_call_id: String,
    pub tool_name: String,
    pub query: String,
}

/// Provenance of a delegated run: who spawned it and through which call.
/// Chains across levels — a grandchild still sees its own parent here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelegatedBy {
    pub expert_key: String,
    pub tool_call_id: String,
    pub tool_name: String,
    pub checkpoint_id: String,
}

/// A single item on the run's todo list; only completion matters to the
/// engine (outstanding items veto the completion-summary path).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TodoItem {
    pub id: String,
    pub title: String,
    pub done: bool,
}

/// Durable snapshot of run progress; the resumable unit of truth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub id: String,
    pub run_id: String,
    pub job_id: String,
    pub status: RunStatus,
    pub step_number: u32,
    pub messages: Vec<Message>,
    pub usage: Usage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delegate_to: Option<Vec<DelegationTarget>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partial_tool_results: Option<Vec<ToolResult>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delegated_by: Option<DelegatedBy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RunErrorRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub todos: Vec<TodoItem>,
    /// Context-window size hint for the model behind this run, carried for
    /// delegation context extraction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_window: Option<u32>,
}

impl Checkpoint {
    /// Fresh checkpoint for a run that has not received input yet.
    pub fn new(setting: &RunSetting) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            run_id: setting.run_id.clone(),
            job_id: setting.job_id.clone(),
            status: RunStatus::Init,
            step_number: 0,
            messages: Vec::new(),
            usage: Usage::default(),
            delegate_to: None,
            pending_tool_calls: None,
            partial_tool_results: None,
            delegated_by: None,
            error: None,
            todos: Vec::new(),
            context_window: None,
        }
    }

    pub fn with_delegated_by(mut self, delegated_by: DelegatedBy) -> Self {
        self.delegated_by = Some(delegated_by);
        self
    }

    pub fn pending(&self) -> &[ToolCall] {
        self.pending_tool_calls.as_deref().unwrap_or(&[])
    }

    pub fn partial(&self) -> &[ToolResult] {
        self.partial_tool_results.as_deref().unwrap_or(&[])
    }

    /// Whether any todo item is still open.
    pub fn outstanding_todos(&self) -> bool {
        self.todos.iter().any(|todo| !todo.done)
    }

    /// Enforce the structural invariants of the durable format.
    ///
    /// - `delegateTo` is non-empty exactly when `status = stoppedByDelegate`;
    /// - ids are unique within `pendingToolCalls` and within
    ///   `partialToolResults`, and never appear in both (a resolved call is
    ///   no longer pending).
    pub fn validate(&self) -> Result<(), EngineError> {
        let delegate_count = self.delegate_to.as_ref().map_or(0, |d| d.len());
        if self.status == RunStatus::StoppedByDelegate && delegate_count == 0 {
            return Err(EngineError::InvalidCheckpoint {
                reason: "status is stoppedByDelegate but delegateTo is empty".to_string(),
            });
        }
        if self.status != RunStatus::StoppedByDelegate && delegate_count > 0 {
            return Err(EngineError::InvalidCheckpoint {
                reason: format!(
                    "delegateTo has {delegate_count} entries but status is not stoppedByDelegate"
                ),
            });
        }

        let mut seen = std::collections::HashSet::new();
        for call in self.pending() {
            if !seen.insert(call.id.as_str()) {
                return Err(EngineError::InvalidCheckpoint {
                    reason: format!("duplicate id '{}' in pendingToolCalls", call.id),
                });
            }
        }
        let mut seen_results = std::collections::HashSet::new();
        for result in self.partial() {
            if !seen_results.insert(result.id.as_str()) {
                return Err(EngineError::InvalidCheckpoint {
                    reason: format!("duplicate id '{}' in partialToolResults", result.id),
                });
            }
            if seen.contains(result.id.as_str()) {
                return Err(EngineError::InvalidCheckpoint {
                    reason: format!(
                        "id '{}' appears in both pendingToolCalls and partialToolResults",
                        result.id
                    ),
                });
            }
        }
        Ok(())
    }
}

/// Scratch state of one model-generation cycle. Never persisted; its
/// contents fold into the checkpoint when the step settles.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub step_number: u32,
    pub input_messages: Vec<Message>,
    pub new_messages: Vec<Message>,
    pub proposed_tool_calls: Vec<ToolCall>,
    pub resolved_tool_results: Vec<ToolResult>,
    pub usage_delta: Usage,
    pub started_at: i64,
    pub finished_at: Option<i64>,
}

impl Step {
    /// Open a step against the current checkpoint state.
    pub fn begin(checkpoint: &Checkpoint) -> Self {
        Self {
            step_number: checkpoint.step_number,
            input_messages: checkpoint.messages.clone(),
            new_messages: Vec::new(),
            proposed_tool_calls: Vec::new(),
            resolved_tool_results: Vec::new(),
            usage_delta: Usage::default(),
            started_at: time::OffsetDateTime::now_utc().unix_timestamp(),
            finished_at: None,
        }
    }

    pub fn finish(mut self) -> Self {
        self.finished_at = Some(time::OffsetDateTime::now_utc().unix_timestamp());
        self
    }
}

/// Persistence callback for checkpoints.
///
/// The engine awaits `save` after every transition that changed the
/// checkpoint, before the next transition begins; what "save" means
/// (database row, file, API call) is the caller's business.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), EngineError>;
}
