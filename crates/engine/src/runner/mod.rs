//! The run state machine coordinator.
//!
//! Owns the (Checkpoint, Step) pair for the duration of a run. Each loop
//! iteration asks the current state's logic function for its one outcome
//! event, applies it atomically, persists the checkpoint when it changed,
//! and emits observability events. Cancellation is checked between steps,
//! never mid-step.

mod generation;
mod resolve;
mod state;

use log::{debug, info};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::checkpoint::{
    Checkpoint, CheckpointStore, DelegationTarget, RunInput, RunSetting, RunStatus, Step, ToolCall,
    ToolResult,
};
use crate::config::RunConfig;
use crate::delegation::RunFunction;
use crate::dispatch::{DispatchOutcome, ResultRouting, dispatch_tool_calls};
use crate::error::{EngineError, RunErrorRecord};
use crate::events::{EventObserver, EventSink, RunEventKind, StopReason};
use crate::skill::{SkillManager, SkillRouter};
use relay_llm::{LlmExecutor, Message};
use state::{Applied, FileKind, RunState, StepDisposition, StepEvent, apply_event};

/// Caller-supplied controls for one run.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Continuation predicate: once cancelled, the run stops cleanly at the
    /// next between-steps check.
    pub cancellation: CancellationToken,
}

impl RunOptions {
    /// Options for a child run whose lifetime is bounded by this run's.
    pub fn child(&self) -> RunOptions {
        RunOptions {
            cancellation: self.cancellation.child_token(),
        }
    }
}

/// Terminal outcome of one `Engine::run` invocation.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub checkpoint: Checkpoint,
    pub reason: StopReason,
}

/// Collaborators and per-run facts shared by the logic functions.
pub(crate) struct RunContext<'a> {
    pub(crate) llm: &'a dyn LlmExecutor,
    pub(crate) router: &'a SkillRouter,
    pub(crate) config: &'a RunConfig,
    pub(crate) events: &'a EventSink,
    pub(crate) setting: &'a RunSetting,
    pub(crate) options: &'a RunOptions,
    pub(crate) started: Instant,
}

/// The run engine: wires an LLM executor, skill backends, and a checkpoint
/// store into the step-execution state machine.
pub struct Engine {
    llm: Arc<dyn LlmExecutor>,
    router: SkillRouter,
    store: Arc<dyn CheckpointStore>,
    observers: Vec<Arc<dyn EventObserver>>,
    config: RunConfig,
}

impl Engine {
    pub fn new(
        llm: Arc<dyn LlmExecutor>,
        skills: Vec<Arc<dyn SkillManager>>,
        store: Arc<dyn CheckpointStore>,
    ) -> Self {
        Self {
            llm,
            router: SkillRouter::new(skills),
            store,
            observers: Vec::new(),
            config: RunConfig::default(),
        }
    }

    pub fn with_config(mut self, config: RunConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn EventObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Drive a run from the given checkpoint until it completes, fails,
    /// suspends, or exhausts a budget. Returns the terminal checkpoint and
    /// the reason control came back.
    #[instrument(name = "engine.run", skip_all, fields(run_id = %setting.run_id, expert = %setting.expert))]
    pub async fn run(
        &self,
        setting: RunSetting,
        checkpoint: Checkpoint,
        options: RunOptions,
    ) -> Result<RunReport, EngineError> {
        checkpoint.validate()?;
        if matches!(
            checkpoint.status,
            RunStatus::Completed | RunStatus::StoppedByError
        ) {
            return Err(EngineError::InvalidCheckpoint {
                reason: format!("cannot resume a run in terminal status {:?}", checkpoint.status),
            });
        }

        let events = EventSink::new(setting.run_id.clone(), self.observers.clone());
        events
            .emit(RunEventKind::RunStarted {
                expert: setting.expert.clone(),
                model: setting.model.clone(),
            })
            .await;
        info!(
            "run {} starting as expert '{}' at step {}",
            setting.run_id, setting.expert, checkpoint.step_number
        );

        let ctx = RunContext {
            llm: self.llm.as_ref(),
            router: &self.router,
            config: &self.config,
            events: &events,
            setting: &setting,
            options: &options,
            started: Instant::now(),
        };

        let mut state = RunState::Init;
        let mut checkpoint = checkpoint;
        let mut step = Step::begin(&checkpoint);
        let mut retries_used: u32 = 0;

        let reason = loop {
            if let RunState::Stopped { reason } = &state {
                break *reason;
            }

            let event = next_event(&ctx, &state, &checkpoint).await?;
            let event = account_retries(&ctx, event, &mut retries_used);
            let backoff = retry_backoff(&event, retries_used);

            self.emit_for_event(&ctx, &event, &checkpoint).await;

            let Applied {
                state: next_state,
                checkpoint: next_checkpoint,
                step: next_step,
                dirty,
            } = apply_event(state, event, checkpoint, step)?;
            state = next_state;
            checkpoint = next_checkpoint;
            step = next_step;

            if dirty {
                self.store.save(&checkpoint).await?;
                debug!(
                    "run {} persisted checkpoint at step {} ({:?})",
                    setting.run_id, checkpoint.step_number, checkpoint.status
                );
            }

            if let Some((attempt, retry_after, reason)) = backoff
                && !matches!(state, RunState::Stopped { .. })
            {
                let wait_secs = self.config.retry.wait_secs(attempt, retry_after);
                events
                    .emit(RunEventKind::GenerationRetried {
                        attempt,
                        max_attempts: setting.max_retries,
                        reason,
                        wait_secs,
                    })
                    .await;
                let cancelled = tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(wait_secs)) => false,
                    _ = options.cancellation.cancelled() => true,
                };
                if cancelled {
                    let applied = apply_event(state, StepEvent::RunCancelled, checkpoint, step)?;
                    state = applied.state;
                    checkpoint = applied.checkpoint;
                    step = applied.step;
                }
            }
        };

        events
            .emit(RunEventKind::RunStopped {
                status: checkpoint.status,
                reason,
            })
            .await;
        info!(
            "run {} stopped: {:?} (status {:?}, step {})",
            setting.run_id, reason, checkpoint.status, checkpoint.step_number
        );

        Ok(RunReport { checkpoint, reason })
    }

    /// Events that belong to the transition itself rather than to work done
    /// inside a logic function.
    async fn emit_for_event(&self, ctx: &RunContext<'_>, event: &StepEvent, cp: &Checkpoint) {
        match event {
            StepEvent::GenerationRequested => {
                ctx.events
                    .emit(RunEventKind::StepStarted {
                        step_number: cp.step_number,
                    })
                    .await;
            }
            StepEvent::StepFolded { retried } => {
                ctx.events
                    .emit(RunEventKind::StepFinished {
                        step_number: cp.step_number,
                        retried: *retried,
                    })
                    .await;
            }
            StepEvent::BudgetExhausted { .. } => {
                ctx.events
                    .emit(RunEventKind::StepFinished {
                        step_number: cp.step_number,
                        retried: false,
                    })
                    .await;
            }
            StepEvent::GenerationFatal { record } => {
                ctx.events
                    .emit(RunEventKind::Error {
                        error: record.clone(),
                    })
                    .await;
            }
            _ => {}
        }
    }
}

/// Retry accounting: every retry event consumes one unit of the run's retry
/// budget; once the budget is gone the retry hardens into a fatal stop.
fn account_retries(ctx: &RunContext<'_>, event: StepEvent, retries_used: &mut u32) -> StepEvent {
    let exhausted_record = |reason: &str| RunErrorRecord {
        name: "RetryBudgetExhausted".to_string(),
        message: format!(
            "retry budget of {} exhausted; last retryable condition: {reason}",
            ctx.setting.max_retries
        ),
        retryable: false,
        status_code: None,
    };

    match event {
        StepEvent::GenerationRetry {
            reason,
            usage,
            retry_after,
        } => {
            *retries_used += 1;
            if *retries_used > ctx.setting.max_retries {
                StepEvent::GenerationFatal {
                    record: exhausted_record(&reason),
                }
            } else {
                StepEvent::GenerationRetry {
                    reason,
                    usage,
                    retry_after,
                }
            }
        }
        StepEvent::RunResultRetry {
            reason,
            usage,
            retry_after,
        } => {
            *retries_used += 1;
            if *retries_used > ctx.setting.max_retries {
                StepEvent::GenerationFatal {
                    record: exhausted_record(&reason),
                }
            } else {
                StepEvent::RunResultRetry {
                    reason,
                    usage,
                    retry_after,
                }
            }
        }
        other => other,
    }
}

/// Backoff parameters when the (post-accounting) event is still a retry.
fn retry_backoff(event: &StepEvent, retries_used: u32) -> Option<(u32, Option<u64>, String)> {
    match event {
        StepEvent::GenerationRetry {
            reason, retry_after, ..
        }
        | StepEvent::RunResultRetry {
            reason, retry_after, ..
        } => Some((retries_used, *retry_after, reason.clone())),
        _ => None,
    }
}

async fn next_event(
    ctx: &RunContext<'_>,
    state: &RunState,
    checkpoint: &Checkpoint,
) -> Result<StepEvent, EngineError> {
    match state {
        RunState::Init => Ok(seed_input(ctx)),
        RunState::PreparingForStep => Ok(prepare_for_step(ctx, checkpoint)),
        RunState::GeneratingToolCall => generation::generating_tool_call(ctx, checkpoint).await,
        RunState::CallingTool { calls } => calling_tool(ctx, checkpoint, calls).await,
        RunState::CallingDelegate {
            targets,
            pending,
            partial,
        } => calling_delegate(ctx, targets, pending, partial).await,
        RunState::CallingInteractiveTool { pending, partial } => {
            calling_interactive(ctx, pending, partial).await
        }
        RunState::ResolvingToolResult {
            results,
            todos_update,
        } => resolve::resolving_tool_result(ctx, checkpoint, results, todos_update.clone()).await,
        RunState::ResolvingThought { result } => {
            resolve::resolving_thought(ctx, checkpoint, result).await
        }
        RunState::ResolvingPdfFile { result } => {
            resolve::resolving_pdf_file(ctx, checkpoint, result).await
        }
        RunState::ResolvingImageFile { result } => {
            resolve::resolving_image_file(ctx, checkpoint, result).await
        }
        RunState::GeneratingRunResult => generation::generating_run_result(ctx, checkpoint).await,
        RunState::FinishingStep { disposition } => Ok(finishing_step(ctx, checkpoint, disposition)),
        RunState::Stopped { .. } => Err(EngineError::Internal(
            "no transitions out of Stopped".to_string(),
        )),
    }
}

/// Init: seed the history from the run's initial input. A resumed tool
/// result folds into the partial set instead of producing a message.
fn seed_input(ctx: &RunContext<'_>) -> StepEvent {
    match &ctx.setting.initial_input {
        RunInput::Text(text) => StepEvent::InputSeeded {
            messages: vec![Message::user(text.clone())],
            resolved: None,
        },
        RunInput::ToolResult(result) => StepEvent::InputSeeded {
            messages: vec![],
            resolved: Some(result.clone()),
        },
    }
}

/// PreparingForStep: between-steps decision point. Checks the continuation
/// predicate, then picks fresh generation, batch resume, or batch finish
/// from the checkpoint's pending/partial tool state.
fn prepare_for_step(ctx: &RunContext<'_>, checkpoint: &Checkpoint) -> StepEvent {
    if ctx.options.cancellation.is_cancelled() {
        return StepEvent::RunCancelled;
    }
    if !checkpoint.pending().is_empty() {
        return StepEvent::BatchResumed {
            calls: checkpoint.pending().to_vec(),
        };
    }
    if !checkpoint.partial().is_empty() {
        return StepEvent::BatchAlreadyComplete {
            results: checkpoint.partial().to_vec(),
        };
    }
    StepEvent::GenerationRequested
}

/// CallingTool: hand the batch to the dispatcher and lift its outcome into
/// the state machine's event space.
async fn calling_tool(
    ctx: &RunContext<'_>,
    checkpoint: &Checkpoint,
    calls: &[ToolCall],
) -> Result<StepEvent, EngineError> {
    let outcome = dispatch_tool_calls(
        ctx.router,
        calls.to_vec(),
        &checkpoint.todos,
        &ctx.config.tool_output,
        ctx.events,
    )
    .await?;

    match outcome {
        DispatchOutcome::Resolved {
            mut results,
            routing,
            todos_update,
        } => match routing {
            ResultRouting::Batch => Ok(StepEvent::ResultsRouted {
                results,
                todos_update,
            }),
            ResultRouting::PdfFile => Ok(StepEvent::FileRouted {
                result: results.pop().ok_or_else(|| EngineError::MissingData {
                    what: "file result in single-result routing".to_string(),
                })?,
                kind: FileKind::Pdf,
            }),
            ResultRouting::ImageFile => Ok(StepEvent::FileRouted {
                result: results.pop().ok_or_else(|| EngineError::MissingData {
                    what: "file result in single-result routing".to_string(),
                })?,
                kind: FileKind::Image,
            }),
            ResultRouting::CompletionSummary => {
                let (messages, folded) = resolve::fold_messages(checkpoint, &results);
                Ok(StepEvent::CompletionRouted {
                    messages,
                    results: folded,
                    todos_update,
                })
            }
        },
        DispatchOutcome::Delegate {
            targets,
            pending,
            partial,
        } => Ok(StepEvent::DelegateRouted {
            targets,
            pending,
            partial,
        }),
        DispatchOutcome::Interactive { pending, partial } => Ok(StepEvent::InteractiveRouted {
            pending,
            partial,
        }),
    }
}

/// CallingDelegate: suspend the run; the caller drives the delegation via
/// the coordinator and resumes the parent afterwards.
async fn calling_delegate(
    ctx: &RunContext<'_>,
    targets: &[DelegationTarget],
    pending: &[ToolCall],
    partial: &[ToolResult],
) -> Result<StepEvent, EngineError> {
    ctx.events
        .emit(RunEventKind::DelegationRequested {
            targets: targets.to_vec(),
        })
        .await;
    info!(
        "run {} suspending for {} delegation(s)",
        ctx.setting.run_id,
        targets.len()
    );
    Ok(StepEvent::DelegationSuspended {
        targets: targets.to_vec(),
        pending: pending.to_vec(),
        partial: partial.to_vec(),
    })
}

/// CallingInteractiveTool: suspend the run until a human answers.
async fn calling_interactive(
    ctx: &RunContext<'_>,
    pending: &[ToolCall],
    partial: &[ToolResult],
) -> Result<StepEvent, EngineError> {
    for call in pending {
        ctx.events
            .emit(RunEventKind::InteractiveToolRequested {
                tool_call_id: call.id.clone(),
                tool_name: call.tool_name.clone(),
            })
            .await;
    }
    Ok(StepEvent::InteractiveSuspended {
        pending: pending.to_vec(),
        partial: partial.to_vec(),
    })
}

/// FinishingStep: a retry loops straight back; an advance increments the
/// counter unless a budget ran out.
fn finishing_step(
    ctx: &RunContext<'_>,
    checkpoint: &Checkpoint,
    disposition: &StepDisposition,
) -> StepEvent {
    match disposition {
        StepDisposition::Retry { .. } => StepEvent::StepFolded { retried: true },
        StepDisposition::Advance => {
            let next_step = checkpoint.step_number + 1;
            if next_step >= ctx.setting.max_steps {
                return StepEvent::BudgetExhausted {
                    reason: StopReason::ExceededMaxSteps,
                };
            }
            if let Some(budget) = ctx.setting.time_budget_secs
                && ctx.started.elapsed().as_secs() >= budget
            {
                return StepEvent::BudgetExhausted {
                    reason: StopReason::ExceededTimeBudget,
                };
            }
            StepEvent::StepFolded { retried: false }
        }
    }
}

/// An engine is itself a valid run function for delegated children, when
/// the caller wants children hosted in-process with the same wiring.
#[async_trait::async_trait]
impl RunFunction for Engine {
    async fn run(
        &self,
        setting: RunSetting,
        checkpoint: Checkpoint,
        options: RunOptions,
    ) -> Result<Checkpoint, EngineError> {
        Engine::run(self, setting, checkpoint, options)
            .await
            .map(|report| report.checkpoint)
    }
}
