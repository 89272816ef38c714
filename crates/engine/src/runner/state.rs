//! States, outcome events, and the transition function of the run loop.
//!
//! Each state variant holds only the data valid in that state. Logic
//! functions (elsewhere in this module tree) do the async work and return
//! exactly one [`StepEvent`]; [`apply_event`] consumes the previous
//! (checkpoint, step) pair and produces the next state and pair in one
//! indivisible move — there is no partially applied transition.

use relay_llm::{Message, Usage};

use crate::checkpoint::{
    Checkpoint, DelegationTarget, RunStatus, Step, TodoItem, ToolCall, ToolResult,
};
use crate::error::{EngineError, RunErrorRecord};
use crate::events::StopReason;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum StepDisposition {
    Advance,
    Retry { reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FileKind {
    Pdf,
    Image,
}

#[derive(Debug)]
pub(crate) enum RunState {
    Init,
    PreparingForStep,
    GeneratingToolCall,
    CallingTool {
        calls: Vec<ToolCall>,
    },
    CallingInteractiveTool {
        pending: Vec<ToolCall>,
        partial: Vec<ToolResult>,
    },
    CallingDelegate {
        targets: Vec<DelegationTarget>,
        pending: Vec<ToolCall>,
        partial: Vec<ToolResult>,
    },
    ResolvingToolResult {
        results: Vec<ToolResult>,
        todos_update: Option<Vec<TodoItem>>,
    },
    ResolvingThought {
        result: ToolResult,
    },
    ResolvingPdfFile {
        result: ToolResult,
    },
    ResolvingImageFile {
        result: ToolResult,
    },
    GeneratingRunResult,
    FinishingStep {
        disposition: StepDisposition,
    },
    Stopped {
        reason: StopReason,
    },
}

impl RunState {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            RunState::Init => "Init",
            RunState::PreparingForStep => "PreparingForStep",
            RunState::GeneratingToolCall => "GeneratingToolCall",
            RunState::CallingTool { .. } => "CallingTool",
            RunState::CallingInteractiveTool { .. } => "CallingInteractiveTool",
            RunState::CallingDelegate { .. } => "CallingDelegate",
            RunState::ResolvingToolResult { .. } => "ResolvingToolResult",
            RunState::ResolvingThought { .. } => "ResolvingThought",
            RunState::ResolvingPdfFile { .. } => "ResolvingPdfFile",
            RunState::ResolvingImageFile { .. } => "ResolvingImageFile",
            RunState::GeneratingRunResult => "GeneratingRunResult",
            RunState::FinishingStep { .. } => "FinishingStep",
            RunState::Stopped { .. } => "Stopped",
        }
    }
}

/// The single outcome a logic function returns for its state.
#[derive(Debug)]
pub(crate) enum StepEvent {
    /// First input received; seed history and/or fold a resumed result.
    InputSeeded {
        messages: Vec<Message>,
        resolved: Option<ToolResult>,
    },
    /// Fresh model generation should start.
    GenerationRequested,
    /// A previously interrupted tool batch resumes with these calls.
    BatchResumed { calls: Vec<ToolCall> },
    /// The interrupted batch is already fully resolved; finish the step.
    BatchAlreadyComplete { results: Vec<ToolResult> },

    /// Model proposed tool calls.
    ToolCallsProposed {
        message: Message,
        calls: Vec<ToolCall>,
        usage: Usage,
    },
    /// Model answered with final text and no tool calls.
    GenerationCompleted { message: Message, usage: Usage },
    /// Retryable generation failure (or empty/truncated response).
    GenerationRetry {
        reason: String,
        usage: Usage,
        retry_after: Option<u64>,
    },
    /// Non-retryable generation failure.
    GenerationFatal { record: RunErrorRecord },

    /// All calls resolved in-process; resolve as a batch.
    ResultsRouted {
        results: Vec<ToolResult>,
        todos_update: Option<Vec<TodoItem>>,
    },
    /// Sole result is a loaded file needing dedicated resolution.
    FileRouted { result: ToolResult, kind: FileKind },
    /// Completion signalled with a clear todo list; results are folded and
    /// the final summary generation follows.
    CompletionRouted {
        messages: Vec<Message>,
        results: Vec<ToolResult>,
        todos_update: Option<Vec<TodoItem>>,
    },
    /// Batch contains delegation calls; hand over to the delegate path.
    DelegateRouted {
        targets: Vec<DelegationTarget>,
        pending: Vec<ToolCall>,
        partial: Vec<ToolResult>,
    },
    /// Batch contains interactive calls (and no delegations).
    InteractiveRouted {
        pending: Vec<ToolCall>,
        partial: Vec<ToolResult>,
    },
    /// Suspend the run for its caller to drive the delegation(s).
    DelegationSuspended {
        targets: Vec<DelegationTarget>,
        pending: Vec<ToolCall>,
        partial: Vec<ToolResult>,
    },
    /// Suspend the run until a human answers.
    InteractiveSuspended {
        pending: Vec<ToolCall>,
        partial: Vec<ToolResult>,
    },

    /// Sole resolved result is the think tool; record it as a thought.
    ThoughtRouted { result: ToolResult },
    /// Resolved results are folded into the history as messages.
    ResultsFolded {
        messages: Vec<Message>,
        results: Vec<ToolResult>,
        todos_update: Option<Vec<TodoItem>>,
    },

    /// Final summary produced; the run completes.
    RunResultGenerated { message: Message, usage: Usage },
    /// Summary generation hit a retryable condition; try again in place.
    RunResultRetry {
        reason: String,
        usage: Usage,
        retry_after: Option<u64>,
    },

    /// Step folded; continue (or re-enter generation after a retry).
    StepFolded { retried: bool },
    /// A budget was exhausted at step finish; stop without error.
    BudgetExhausted { reason: StopReason },
    /// Continuation predicate tripped between steps.
    RunCancelled,
}

impl StepEvent {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            StepEvent::InputSeeded { .. } => "InputSeeded",
            StepEvent::GenerationRequested => "GenerationRequested",
            StepEvent::BatchResumed { .. } => "BatchResumed",
            StepEvent::BatchAlreadyComplete { .. } => "BatchAlreadyComplete",
            StepEvent::ToolCallsProposed { .. } => "ToolCallsProposed",
            StepEvent::GenerationCompleted { .. } => "GenerationCompleted",
            StepEvent::GenerationRetry { .. } => "GenerationRetry",
            StepEvent::GenerationFatal { .. } => "GenerationFatal",
            StepEvent::ResultsRouted { .. } => "ResultsRouted",
            StepEvent::FileRouted { .. } => "FileRouted",
            StepEvent::CompletionRouted { .. } => "CompletionRouted",
            StepEvent::DelegateRouted { .. } => "DelegateRouted",
            StepEvent::InteractiveRouted { .. } => "InteractiveRouted",
            StepEvent::DelegationSuspended { .. } => "DelegationSuspended",
            StepEvent::InteractiveSuspended { .. } => "InteractiveSuspended",
            StepEvent::ThoughtRouted { .. } => "ThoughtRouted",
            StepEvent::ResultsFolded { .. } => "ResultsFolded",
            StepEvent::RunResultGenerated { .. } => "RunResultGenerated",
            StepEvent::RunResultRetry { .. } => "RunResultRetry",
            StepEvent::StepFolded { .. } => "StepFolded",
            StepEvent::BudgetExhausted { .. } => "BudgetExhausted",
            StepEvent::RunCancelled => "RunCancelled",
        }
    }
}

/// Result of applying one event: the next state and the new owned pair.
#[derive(Debug)]
pub(crate) struct Applied {
    pub state: RunState,
    pub checkpoint: Checkpoint,
    pub step: Step,
    /// Whether the checkpoint changed and must be persisted before the next
    /// transition.
    pub dirty: bool,
}

fn merged_partial(existing: &[ToolResult], new: Vec<ToolResult>) -> Vec<ToolResult> {
    let mut merged = existing.to_vec();
    for result in new {
        if !merged.iter().any(|r| r.id == result.id) {
            merged.push(result);
        }
    }
    merged
}

/// Apply one event: consume the previous (checkpoint, step) pair, produce
/// the next state and pair. Pure with respect to collaborators; all async
/// work happened in the logic function that produced the event.
pub(crate) fn apply_event(
    state: RunState,
    event: StepEvent,
    mut checkpoint: Checkpoint,
    mut step: Step,
) -> Result<Applied, EngineError> {
    let from = state.name();
    let applied = match event {
        StepEvent::InputSeeded { messages, resolved } => {
            checkpoint.status = RunStatus::Proceeding;
            checkpoint.messages.extend(messages);
            if let Some(result) = resolved {
                let pending: Vec<ToolCall> = checkpoint
                    .pending()
                    .iter()
                    .filter(|call| call.id != result.id)
                    .cloned()
                    .collect();
                checkpoint.pending_tool_calls = if pending.is_empty() {
                    None
                } else {
                    Some(pending)
                };
                let merged = merged_partial(checkpoint.partial(), vec![result]);
                checkpoint.partial_tool_results = Some(merged);
            }
            Applied {
                state: RunState::PreparingForStep,
                step: Step::begin(&checkpoint),
                checkpoint,
                dirty: true,
            }
        }

        StepEvent::GenerationRequested => Applied {
            state: RunState::GeneratingToolCall,
            checkpoint,
            step,
            dirty: false,
        },

        StepEvent::BatchResumed { calls } => Applied {
            state: RunState::CallingTool { calls },
            checkpoint,
            step,
            dirty: false,
        },

        StepEvent::BatchAlreadyComplete { results } => Applied {
            state: RunState::ResolvingToolResult {
                results,
                todos_update: None,
            },
            checkpoint,
            step,
            dirty: false,
        },

        StepEvent::ToolCallsProposed {
            message,
            calls,
            usage,
        } => {
            checkpoint.messages.push(message.clone());
            checkpoint.usage = checkpoint.usage.add(&usage);
            // Persisted before execution so a crash mid-batch resumes here.
            checkpoint.pending_tool_calls = Some(calls.clone());
            step.new_messages.push(message);
            step.usage_delta = step.usage_delta.add(&usage);
            step.proposed_tool_calls = calls.clone();
            Applied {
                state: RunState::CallingTool { calls },
                checkpoint,
                step,
                dirty: true,
            }
        }

        StepEvent::GenerationCompleted { message, usage } => {
            checkpoint.messages.push(message.clone());
            checkpoint.usage = checkpoint.usage.add(&usage);
            checkpoint.status = RunStatus::Completed;
            step.new_messages.push(message);
            step.usage_delta = step.usage_delta.add(&usage);
            step = step.finish();
            Applied {
                state: RunState::Stopped {
                    reason: StopReason::Completed,
                },
                checkpoint,
                step,
                dirty: true,
            }
        }

        StepEvent::GenerationRetry { reason, usage, .. } => {
            checkpoint.usage = checkpoint.usage.add(&usage);
            step.usage_delta = step.usage_delta.add(&usage);
            Applied {
                state: RunState::FinishingStep {
                    disposition: StepDisposition::Retry { reason },
                },
                checkpoint,
                step,
                dirty: true,
            }
        }

        StepEvent::GenerationFatal { record } => {
            checkpoint.status = RunStatus::StoppedByError;
            checkpoint.error = Some(record);
            step = step.finish();
            Applied {
                state: RunState::Stopped {
                    reason: StopReason::FatalError,
                },
                checkpoint,
                step,
                dirty: true,
            }
        }

        StepEvent::ResultsRouted {
            results,
            todos_update,
        } => Applied {
            state: RunState::ResolvingToolResult {
                results,
                todos_update,
            },
            checkpoint,
            step,
            dirty: false,
        },

        StepEvent::FileRouted { result, kind } => Applied {
            state: match kind {
                FileKind::Pdf => RunState::ResolvingPdfFile { result },
                FileKind::Image => RunState::ResolvingImageFile { result },
            },
            checkpoint,
            step,
            dirty: false,
        },

        StepEvent::CompletionRouted {
            messages,
            results,
            todos_update,
        } => {
            checkpoint.messages.extend(messages.iter().cloned());
            checkpoint.pending_tool_calls = None;
            checkpoint.partial_tool_results = None;
            if let Some(todos) = todos_update {
                checkpoint.todos = todos;
            }
            step.new_messages.extend(messages);
            step.resolved_tool_results.extend(results);
            Applied {
                state: RunState::GeneratingRunResult,
                checkpoint,
                step,
                dirty: true,
            }
        }

        StepEvent::DelegateRouted {
            targets,
            pending,
            partial,
        } => Applied {
            state: RunState::CallingDelegate {
                targets,
                pending,
                partial,
            },
            checkpoint,
            step,
            dirty: false,
        },

        StepEvent::InteractiveRouted { pending, partial } => Applied {
            state: RunState::CallingInteractiveTool { pending, partial },
            checkpoint,
            step,
            dirty: false,
        },

        StepEvent::DelegationSuspended {
            targets,
            pending,
            partial,
        } => {
            checkpoint.status = RunStatus::StoppedByDelegate;
            checkpoint.delegate_to = Some(targets);
            checkpoint.pending_tool_calls = if pending.is_empty() {
                None
            } else {
                Some(pending)
            };
            let merged = merged_partial(checkpoint.partial(), partial);
            checkpoint.partial_tool_results = if merged.is_empty() {
                None
            } else {
                Some(merged)
            };
            step = step.finish();
            Applied {
                state: RunState::Stopped {
                    reason: StopReason::Delegation,
                },
                checkpoint,
                step,
                dirty: true,
            }
        }

        StepEvent::InteractiveSuspended { pending, partial } => {
            checkpoint.status = RunStatus::StoppedByInteractiveTool;
            checkpoint.pending_tool_calls = if pending.is_empty() {
                None
            } else {
                Some(pending)
            };
            let merged = merged_partial(checkpoint.partial(), partial);
            checkpoint.partial_tool_results = if merged.is_empty() {
                None
            } else {
                Some(merged)
            };
            step = step.finish();
            Applied {
                state: RunState::Stopped {
                    reason: StopReason::InteractiveTool,
                },
                checkpoint,
                step,
                dirty: true,
            }
        }

        StepEvent::ThoughtRouted { result } => Applied {
            state: RunState::ResolvingThought { result },
            checkpoint,
            step,
            dirty: false,
        },

        StepEvent::ResultsFolded {
            messages,
            results,
            todos_update,
        } => {
            checkpoint.messages.extend(messages.iter().cloned());
            checkpoint.pending_tool_calls = None;
            checkpoint.partial_tool_results = None;
            if let Some(todos) = todos_update {
                checkpoint.todos = todos;
            }
            step.new_messages.extend(messages);
            step.resolved_tool_results.extend(results);
            Applied {
                state: RunState::FinishingStep {
                    disposition: StepDisposition::Advance,
                },
                checkpoint,
                step,
                dirty: true,
            }
        }

        StepEvent::RunResultGenerated { message, usage } => {
            checkpoint.messages.push(message.clone());
            checkpoint.usage = checkpoint.usage.add(&usage);
            checkpoint.status = RunStatus::Completed;
            step.new_messages.push(message);
            step.usage_delta = step.usage_delta.add(&usage);
            step = step.finish();
            Applied {
                state: RunState::Stopped {
                    reason: StopReason::Completed,
                },
                checkpoint,
                step,
                dirty: true,
            }
        }

        StepEvent::RunResultRetry { usage, .. } => {
            checkpoint.usage = checkpoint.usage.add(&usage);
            step.usage_delta = step.usage_delta.add(&usage);
            Applied {
                state: RunState::GeneratingRunResult,
                checkpoint,
                step,
                dirty: true,
            }
        }

        StepEvent::StepFolded { retried } => {
            if !retried {
                checkpoint.step_number += 1;
            }
            // The settled step is folded; the next cycle opens fresh.
            Applied {
                state: RunState::PreparingForStep,
                step: Step::begin(&checkpoint),
                checkpoint,
                dirty: !retried,
            }
        }

        StepEvent::BudgetExhausted { reason } => {
            // Not an error and not completion: the checkpoint stays
            // proceeding so the run can resume under a raised budget.
            checkpoint.step_number += 1;
            step = step.finish();
            Applied {
                state: RunState::Stopped { reason },
                checkpoint,
                step,
                dirty: true,
            }
        }

        StepEvent::RunCancelled => {
            step = step.finish();
            Applied {
                state: RunState::Stopped {
                    reason: StopReason::Cancelled,
                },
                checkpoint,
                step,
                dirty: false,
            }
        }
    };

    log::trace!(
        "transition {} -> {} (dirty: {})",
        from,
        applied.state.name(),
        applied.dirty
    );
    Ok(applied)
}
