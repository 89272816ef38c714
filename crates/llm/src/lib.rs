//! Provider-facing half of the relay run engine.
//!
//! This crate defines what a language-model backend consumes and produces:
//! the message/content-part model, tool definitions, token usage counters,
//! and the [`LlmExecutor`] contract with its structured error type. The run
//! engine itself lives in `relay-engine`; backends implement [`LlmExecutor`]
//! without depending on it.

pub mod error;
pub mod executor;
pub mod message;
pub mod tool;
pub mod usage;

pub use error::LlmError;
pub use executor::{FinishReason, GenerateRequest, GenerateSettings, Generation, LlmExecutor};
pub use message::{ContentPart, Message, Role, ToolCallRequest};
pub use tool::ToolDefinition;
pub use usage::Usage;
