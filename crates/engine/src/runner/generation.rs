//! Model-generation logic: the `GeneratingToolCall` and
//! `GeneratingRunResult` states.
//!
//! Retry-vs-fatal classification lives here; the decision is returned as an
//! event, never thrown. The only thrown condition is a finish reason the
//! engine does not model, which aborts the run on purpose.

use log::{debug, info};
use relay_llm::{
    ContentPart, FinishReason, GenerateRequest, GenerateSettings, Generation, LlmError, Message,
    Role, Usage,
};
use tracing::instrument;

use super::RunContext;
use super::state::StepEvent;
use crate::checkpoint::{Checkpoint, ToolCall};
use crate::error::{EngineError, RunErrorRecord};
use crate::events::RunEventKind;

/// Instruction appended for the final-summary generation.
const RUN_RESULT_PROMPT: &str =
    "The task is complete. Produce the final result as a single message for the requester.";

async fn call_model(
    ctx: &RunContext<'_>,
    request: GenerateRequest,
) -> Result<Generation, LlmError> {
    ctx.events
        .emit(RunEventKind::LlmRequestStart {
            message_count: request.messages.len(),
        })
        .await;

    let outcome = ctx.llm.generate(request).await;

    if let Ok(generation) = &outcome {
        ctx.events
            .emit(RunEventKind::LlmRequestEnd {
                usage: generation.usage,
                tool_calls: generation.tool_calls.len(),
                finish_reason: generation.finish_reason,
            })
            .await;
    }
    outcome
}

fn retry_event(error: &LlmError) -> StepEvent {
    StepEvent::GenerationRetry {
        reason: error.to_string(),
        usage: Usage::default(),
        retry_after: error.retry_after_secs(),
    }
}

/// Ask the model for the next action and classify the response.
#[instrument(name = "engine.generate", skip_all, fields(step = checkpoint.step_number))]
pub(super) async fn generating_tool_call(
    ctx: &RunContext<'_>,
    checkpoint: &Checkpoint,
) -> Result<StepEvent, EngineError> {
    let request = GenerateRequest {
        messages: checkpoint.messages.clone(),
        tools: ctx.router.tool_definitions(),
        model: ctx.setting.model.clone(),
        settings: GenerateSettings::default(),
    };

    match call_model(ctx, request).await {
        Err(error) if error.is_retryable() => {
            debug!("retryable generation failure: {error}");
            Ok(retry_event(&error))
        }
        Err(error) => {
            info!("fatal generation failure: {error}");
            Ok(StepEvent::GenerationFatal {
                record: RunErrorRecord::from_llm_error(&error),
            })
        }
        Ok(generation) => classify_action_generation(ctx, generation),
    }
}

fn classify_action_generation(
    ctx: &RunContext<'_>,
    generation: Generation,
) -> Result<StepEvent, EngineError> {
    match generation.finish_reason {
        FinishReason::Unknown => {
            // Protocol drift: surface it instead of misinterpreting.
            Err(EngineError::UnexpectedFinishReason {
                reason: "finish reason not modeled by this engine".to_string(),
            })
        }
        FinishReason::Error => Ok(StepEvent::GenerationFatal {
            record: RunErrorRecord::new(
                "GenerationFinishError",
                "model reported an error finish reason",
            ),
        }),
        FinishReason::Length => Ok(StepEvent::GenerationRetry {
            reason: "response truncated by length limit".to_string(),
            usage: generation.usage,
            retry_after: None,
        }),
        FinishReason::Stop | FinishReason::ToolCalls => {
            if generation.has_tool_calls() {
                let calls = engine_calls(ctx, &generation);
                let message = assistant_message(&generation);
                Ok(StepEvent::ToolCallsProposed {
                    message,
                    calls,
                    usage: generation.usage,
                })
            } else if !generation.is_empty() {
                Ok(StepEvent::GenerationCompleted {
                    message: assistant_message(&generation),
                    usage: generation.usage,
                })
            } else {
                Ok(StepEvent::GenerationRetry {
                    reason: "model returned no actionable content".to_string(),
                    usage: generation.usage,
                    retry_after: None,
                })
            }
        }
    }
}

/// Second model call producing the final summary after completion was
/// signalled. Retries in place; no tools are offered.
#[instrument(name = "engine.generate_run_result", skip_all)]
pub(super) async fn generating_run_result(
    ctx: &RunContext<'_>,
    checkpoint: &Checkpoint,
) -> Result<StepEvent, EngineError> {
    let mut messages = checkpoint.messages.clone();
    messages.push(Message::user(RUN_RESULT_PROMPT));
    let request = GenerateRequest {
        messages,
        tools: Vec::new(),
        model: ctx.setting.model.clone(),
        settings: GenerateSettings::default(),
    };

    match call_model(ctx, request).await {
        Err(error) if error.is_retryable() => Ok(StepEvent::RunResultRetry {
            reason: error.to_string(),
            usage: Usage::default(),
            retry_after: error.retry_after_secs(),
        }),
        Err(error) => Ok(StepEvent::GenerationFatal {
            record: RunErrorRecord::from_llm_error(&error),
        }),
        Ok(generation) => {
            if generation.finish_reason == FinishReason::Unknown {
                return Err(EngineError::UnexpectedFinishReason {
                    reason: "finish reason not modeled by this engine".to_string(),
                });
            }
            match generation.text.as_deref().map(str::trim) {
                Some(text) if !text.is_empty() => Ok(StepEvent::RunResultGenerated {
                    message: Message::assistant(text),
                    usage: generation.usage,
                }),
                _ => Ok(StepEvent::RunResultRetry {
                    reason: "summary generation returned no text".to_string(),
                    usage: generation.usage,
                    retry_after: None,
                }),
            }
        }
    }
}

fn assistant_message(generation: &Generation) -> Message {
    let mut parts = Vec::new();
    if let Some(text) = generation.text.as_deref()
        && !text.trim().is_empty()
    {
        parts.push(ContentPart::text(text));
    }
    for call in &generation.tool_calls {
        parts.push(ContentPart::ToolUse(call.clone()));
    }
    Message::new(Role::Assistant, parts)
}

/// Lift the model's tool-call requests into engine calls, stamping the
/// owning skill where one is registered. Unknown names are left for the
/// dispatcher, whose lookup failure is the authoritative one.
fn engine_calls(ctx: &RunContext<'_>, generation: &Generation) -> Vec<ToolCall> {
    generation
        .tool_calls
        .iter()
        .map(|call| ToolCall {
            id: call.id.clone(),
            skill_name: ctx
                .router
                .resolve(&call.name)
                .map(|(skill, _)| skill.name().to_string())
                .unwrap_or_default(),
            tool_name: call.name.clone(),
            args: call.arguments.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{RunInput, RunSetting};
    use crate::config::RunConfig;
    use crate::events::EventSink;
    use crate::runner::RunOptions;
    use crate::skill::{SkillKind, SkillManager, SkillRouter};
    use async_trait::async_trait;
    use relay_llm::{LlmExecutor, ToolCallRequest, ToolDefinition};
    use std::sync::Arc;

    struct ScriptedLlm {
        outcome: std::sync::Mutex<Option<Result<Generation, LlmError>>>,
    }

    impl ScriptedLlm {
        fn new(outcome: Result<Generation, LlmError>) -> Self {
            Self {
                outcome: std::sync::Mutex::new(Some(outcome)),
            }
        }
    }

    #[async_trait]
    impl LlmExecutor for ScriptedLlm {
        async fn generate(&self, _request: GenerateRequest) -> Result<Generation, LlmError> {
            self.outcome.lock().unwrap().take().expect("one call only")
        }
    }

    struct WebSkill;

    #[async_trait]
    impl SkillManager for WebSkill {
        fn name(&self) -> &str {
            "web"
        }

        fn kind(&self) -> SkillKind {
            SkillKind::Mcp
        }

        fn list_tool_definitions(&self) -> Vec<ToolDefinition> {
            vec![ToolDefinition::new(
                "search",
                "",
                serde_json::json!({"type": "object"}),
            )]
        }

        async fn call_tool(
            &self,
            _name: &str,
            _args: serde_json::Value,
        ) -> Result<Vec<ContentPart>, EngineError> {
            Ok(vec![])
        }
    }

    struct Fixture {
        llm: ScriptedLlm,
        router: SkillRouter,
        config: RunConfig,
        events: EventSink,
        setting: RunSetting,
        options: RunOptions,
    }

    impl Fixture {
        fn new(outcome: Result<Generation, LlmError>) -> Self {
            Self {
                llm: ScriptedLlm::new(outcome),
                router: SkillRouter::new(vec![Arc::new(WebSkill)]),
                config: RunConfig::default(),
                events: EventSink::new("run-test", vec![]),
                setting: RunSetting::new(
                    "job-1",
                    "researcher",
                    "relay-large",
                    RunInput::Text("task".to_string()),
                ),
                options: RunOptions::default(),
            }
        }

        fn ctx(&self) -> RunContext<'_> {
            RunContext {
                llm: &self.llm,
                router: &self.router,
                config: &self.config,
                events: &self.events,
                setting: &self.setting,
                options: &self.options,
                started: std::time::Instant::now(),
            }
        }
    }

    fn generation(
        text: Option<&str>,
        calls: Vec<ToolCallRequest>,
        finish: FinishReason,
    ) -> Generation {
        Generation {
            text: text.map(|t| t.to_string()),
            tool_calls: calls,
            finish_reason: finish,
            usage: Usage::new(10, 5),
        }
    }

    fn checkpoint(setting: &RunSetting) -> Checkpoint {
        let mut cp = Checkpoint::new(setting);
        cp.messages.push(Message::user("task"));
        cp
    }

    #[tokio::test]
    async fn proposed_calls_carry_owning_skill() {
        let fixture = Fixture::new(Ok(generation(
            Some("searching"),
            vec![ToolCallRequest {
                id: "tc_1".to_string(),
                name: "search".to_string(),
                arguments: serde_json::json!({"query": "x"}),
            }],
            FinishReason::ToolCalls,
        )));
        let cp = checkpoint(&fixture.setting);

        let event = generating_tool_call(&fixture.ctx(), &cp).await.unwrap();
        match event {
            StepEvent::ToolCallsProposed {
                message,
                calls,
                usage,
            } => {
                assert_eq!(calls.len(), 1);
                assert_eq!(calls[0].skill_name, "web");
                assert_eq!(message.tool_uses().len(), 1);
                assert_eq!(message.text().as_deref(), Some("searching"));
                assert_eq!(usage.input_tokens, 10);
            }
            other => panic!("expected proposal, got {}", other.name()),
        }
    }

    #[tokio::test]
    async fn plain_text_stop_completes_the_run() {
        let fixture = Fixture::new(Ok(generation(
            Some("the answer is 42"),
            vec![],
            FinishReason::Stop,
        )));
        let cp = checkpoint(&fixture.setting);

        let event = generating_tool_call(&fixture.ctx(), &cp).await.unwrap();
        assert!(matches!(event, StepEvent::GenerationCompleted { .. }));
    }

    #[tokio::test]
    async fn empty_response_is_a_retry() {
        let fixture = Fixture::new(Ok(generation(Some("  "), vec![], FinishReason::Stop)));
        let cp = checkpoint(&fixture.setting);

        let event = generating_tool_call(&fixture.ctx(), &cp).await.unwrap();
        match event {
            StepEvent::GenerationRetry { reason, .. } => {
                assert!(reason.contains("no actionable content"));
            }
            other => panic!("expected retry, got {}", other.name()),
        }
    }

    #[tokio::test]
    async fn length_truncation_is_a_retry() {
        let fixture = Fixture::new(Ok(generation(Some("partial"), vec![], FinishReason::Length)));
        let cp = checkpoint(&fixture.setting);

        let event = generating_tool_call(&fixture.ctx(), &cp).await.unwrap();
        assert!(matches!(event, StepEvent::GenerationRetry { .. }));
    }

    #[tokio::test]
    async fn retryable_error_becomes_retry_with_hint() {
        let fixture = Fixture::new(Err(LlmError::RateLimited {
            message: "slow down".to_string(),
            retry_after_secs: Some(9),
        }));
        let cp = checkpoint(&fixture.setting);

        let event = generating_tool_call(&fixture.ctx(), &cp).await.unwrap();
        match event {
            StepEvent::GenerationRetry { retry_after, .. } => assert_eq!(retry_after, Some(9)),
            other => panic!("expected retry, got {}", other.name()),
        }
    }

    #[tokio::test]
    async fn fatal_error_captures_record() {
        let fixture = Fixture::new(Err(LlmError::Auth("expired key".to_string())));
        let cp = checkpoint(&fixture.setting);

        let event = generating_tool_call(&fixture.ctx(), &cp).await.unwrap();
        match event {
            StepEvent::GenerationFatal { record } => {
                assert_eq!(record.name, "Auth");
                assert_eq!(record.status_code, Some(401));
                assert!(!record.retryable);
            }
            other => panic!("expected fatal, got {}", other.name()),
        }
    }

    #[tokio::test]
    async fn unmodeled_finish_reason_is_thrown() {
        let fixture = Fixture::new(Ok(generation(Some("x"), vec![], FinishReason::Unknown)));
        let cp = checkpoint(&fixture.setting);

        let err = generating_tool_call(&fixture.ctx(), &cp).await.unwrap_err();
        assert!(matches!(err, EngineError::UnexpectedFinishReason { .. }));
    }

    #[tokio::test]
    async fn run_result_uses_text_and_completes() {
        let fixture = Fixture::new(Ok(generation(
            Some("final summary"),
            vec![],
            FinishReason::Stop,
        )));
        let cp = checkpoint(&fixture.setting);

        let event = generating_run_result(&fixture.ctx(), &cp).await.unwrap();
        match event {
            StepEvent::RunResultGenerated { message, .. } => {
                assert_eq!(message.text().as_deref(), Some("final summary"));
            }
            other => panic!("expected run result, got {}", other.name()),
        }
    }

    #[tokio::test]
    async fn run_result_without_text_retries_in_place() {
        let fixture = Fixture::new(Ok(generation(None, vec![], FinishReason::Stop)));
        let cp = checkpoint(&fixture.setting);

        let event = generating_run_result(&fixture.ctx(), &cp).await.unwrap();
        assert!(matches!(event, StepEvent::RunResultRetry { .. }));
    }
}
