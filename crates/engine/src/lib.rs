//! Run engine for autonomous agents.
//!
//! Given a task, the engine repeatedly asks a language model to choose and
//! invoke tools, executes those tools, feeds results back, and repeats until
//! the agent completes, fails, or needs external input. Every intermediate
//! state is captured in a resumable [`Checkpoint`]; suspension (interactive
//! tools, delegation to sub-agents) and resumption are first-class.
//!
//! The model call ([`relay_llm::LlmExecutor`]), tool backends
//! ([`SkillManager`]), and checkpoint persistence ([`CheckpointStore`]) are
//! injected contracts; the engine owns only the state machine, the tool
//! dispatcher, and the delegation coordinator.

pub mod checkpoint;
pub mod config;
pub mod delegation;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod runner;
pub mod skill;

pub use checkpoint::{
    Checkpoint, CheckpointStore, DelegatedBy, DelegationTarget, ExpertDescriptor, RunInput,
    RunSetting, RunStatus, Step, TodoItem, ToolCall, ToolResult,
};
pub use config::{RetryConfig, RunConfig, ToolOutputConfig};
pub use delegation::{
    DelegationContext, DelegationReturn, DelegationStrategy, ParallelDelegationStrategy,
    PreparedDelegation, RunFunction, SingleDelegationStrategy, build_return_from_delegation,
    extract_delegation_context, select_delegation_strategy,
};
pub use dispatch::{DispatchOutcome, ResultRouting, dispatch_tool_calls};
pub use error::{EngineError, RunErrorRecord};
pub use events::{EventObserver, EventSink, RunEvent, RunEventKind, StopReason};
pub use runner::{Engine, RunOptions, RunReport};
pub use skill::{
    ATTEMPT_COMPLETION_TOOL, LOAD_FILE_TOOL, SkillKind, SkillManager, SkillRouter, THINK_TOOL,
    UPDATE_TODOS_TOOL, reserved_tool_definitions,
};
