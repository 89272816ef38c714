//! Observability event stream.
//!
//! Every state transition of a run emits one discriminated event record.
//! Events are additive: observer failures are logged and dropped, never
//! allowed to gate the run itself.

use async_trait::async_trait;
use log::warn;
use relay_llm::{FinishReason, Usage};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::checkpoint::{DelegationTarget, RunStatus};
use crate::error::{EngineError, RunErrorRecord};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunEvent {
    pub seq: u64,
    pub timestamp: i64,
    pub run_id: String,
    pub kind: RunEventKind,
}

/// Why a run loop returned control to its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Completed,
    FatalError,
    Delegation,
    InteractiveTool,
    ExceededMaxSteps,
    ExceededTimeBudget,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum RunEventKind {
    RunStarted {
        expert: String,
        model: String,
    },
    StepStarted {
        step_number: u32,
    },
    LlmRequestStart {
        message_count: usize,
    },
    LlmRequestEnd {
        usage: Usage,
        tool_calls: usize,
        finish_reason: FinishReason,
    },
    GenerationRetried {
        attempt: u32,
        max_attempts: u32,
        reason: String,
        wait_secs: u64,
    },
    ToolCallStart {
        tool_call_id: String,
        skill_name: String,
        tool_name: String,
    },
    ToolCallEnd {
        tool_call_id: String,
        tool_name: String,
        is_error: bool,
    },
    ThoughtRecorded {
        thought: String,
    },
    FileResolved {
        tool_call_id: String,
        media_type: String,
    },
    TodosUpdated {
        outstanding: usize,
        total: usize,
    },
    DelegationRequested {
        targets: Vec<DelegationTarget>,
    },
    InteractiveToolRequested {
        tool_call_id: String,
        tool_name: String,
    },
    StepFinished {
        step_number: u32,
        retried: bool,
    },
    RunStopped {
        status: RunStatus,
        reason: StopReason,
    },
    Error {
        error: RunErrorRecord,
    },
}

/// Receives every [`RunEvent`] a run emits.
#[async_trait]
pub trait EventObserver: Send + Sync {
    async fn on_event(&self, event: &RunEvent) -> Result<(), EngineError>;
}

/// Single producer-facing API for event emission.
///
/// Stamps sequence numbers and timestamps, then fans out to all observers.
/// An observer error is logged and swallowed.
pub struct EventSink {
    run_id: String,
    observers: Vec<Arc<dyn EventObserver>>,
    seq: AtomicU64,
}

impl EventSink {
    pub fn new(run_id: impl Into<String>, observers: Vec<Arc<dyn EventObserver>>) -> Self {
        Self {
            run_id: run_id.into(),
            observers,
            seq: AtomicU64::new(0),
        }
    }

    pub async fn emit(&self, kind: RunEventKind) {
        let event = RunEvent {
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            timestamp: time::OffsetDateTime::now_utc().unix_timestamp(),
            run_id: self.run_id.clone(),
            kind,
        };
        for observer in &self.observers {
            if let Err(e) = observer.on_event(&event).await {
                warn!("event observer failed for run {}: {}", self.run_id, e);
            }
        }
    }
}
