//! Structured error type for the run engine.
//!
//! Every variant carries typed context. Retry-vs-proceed decisions inside
//! the step loop are expressed as returned events, never as errors; anything
//! surfacing here either terminates the run or indicates a contract
//! violation by a collaborator.

use relay_llm::LlmError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EngineError {
    // --- Configuration / contract violations ---
    #[error("tool not found: {tool_name}")]
    ToolNotFound { tool_name: String },

    #[error("missing required data: {what}")]
    MissingData { what: String },

    #[error("invalid checkpoint: {reason}")]
    InvalidCheckpoint { reason: String },

    #[error("unexpected finish reason: {reason}")]
    UnexpectedFinishReason { reason: String },

    // --- Delegation ---
    #[error("single delegation strategy requires exactly one delegation, got {count}")]
    SingleDelegationRequiresOne { count: usize },

    #[error("parallel delegation strategy requires at least two delegations, got {count}")]
    ParallelDelegationRequiresTwo { count: usize },

    #[error("delegation result message does not contain text (child run {run_id})")]
    DelegationResultMalformed { run_id: String },

    // --- Collaborators ---
    #[error("llm error: {0}")]
    Llm(#[from] LlmError),

    #[error("skill backend '{skill}' failed: {reason}")]
    Skill { skill: String, reason: String },

    #[error("checkpoint persistence failed: {0}")]
    Persistence(String),

    // --- Serialization / generic ---
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<anyhow::Error> for EngineError {
    fn from(e: anyhow::Error) -> Self {
        EngineError::Internal(e.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Serialization(e.to_string())
    }
}

/// Durable capture of a terminal run failure, embedded in the checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunErrorRecord {
    pub name: String,
    pub message: String,
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
}

impl RunErrorRecord {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            retryable: false,
            status_code: None,
        }
    }

    pub fn from_llm_error(error: &LlmError) -> Self {
        Self {
            name: llm_error_name(error).to_string(),
            message: error.to_string(),
            retryable: error.is_retryable(),
            status_code: error.status_code(),
        }
    }

    pub fn from_engine_error(error: &EngineError) -> Self {
        match error {
            EngineError::Llm(inner) => Self::from_llm_error(inner),
            other => Self::new(engine_error_name(other), other.to_string()),
        }
    }
}

fn llm_error_name(error: &LlmError) -> &'static str {
    match error {
        LlmError::RateLimited { .. } => "RateLimited",
        LlmError::Overloaded(_) => "Overloaded",
        LlmError::Timeout { .. } => "Timeout",
        LlmError::Auth(_) => "Auth",
        LlmError::InvalidRequest(_) => "InvalidRequest",
        LlmError::ResponseFormat { .. } => "ResponseFormat",
        LlmError::Http { .. } => "Http",
        LlmError::Provider(_) => "Provider",
        _ => "Llm",
    }
}

fn engine_error_name(error: &EngineError) -> &'static str {
    match error {
        EngineError::ToolNotFound { .. } => "ToolNotFound",
        EngineError::MissingData { .. } => "MissingData",
        EngineError::InvalidCheckpoint { .. } => "InvalidCheckpoint",
        EngineError::UnexpectedFinishReason { .. } => "UnexpectedFinishReason",
        EngineError::SingleDelegationRequiresOne { .. } => "SingleDelegationRequiresOne",
        EngineError::ParallelDelegationRequiresTwo { .. } => "ParallelDelegationRequiresTwo",
        EngineError::DelegationResultMalformed { .. } => "DelegationResultMalformed",
        EngineError::Llm(_) => "Llm",
        EngineError::Skill { .. } => "Skill",
        EngineError::Persistence(_) => "Persistence",
        EngineError::Serialization(_) => "Serialization",
        EngineError::Internal(_) => "Internal",
    }
}
