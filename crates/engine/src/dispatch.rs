//! Tool dispatch for one step's batch of proposed calls.
//!
//! Partitions calls by backend kind, resolves every in-process call
//! concurrently while preserving proposal order, and decides which routing
//! outcome the step takes. Delegation outranks interactive suspension when
//! one batch proposes both: subdividing work is the agent's own choice,
//! a human block is not.

use futures_util::future::join_all;
use log::{debug, warn};
use tracing::instrument;

use crate::checkpoint::{DelegationTarget, ExpertDescriptor, TodoItem, ToolCall, ToolResult};
use crate::config::ToolOutputConfig;
use crate::error::EngineError;
use crate::events::{EventSink, RunEventKind};
use crate::skill::{
    ATTEMPT_COMPLETION_TOOL, LOAD_FILE_TOOL, SkillKind, SkillRouter, UPDATE_TODOS_TOOL,
    UpdateTodosArgs,
};
use relay_llm::ContentPart;

/// Where a fully resolved (all-mcp) batch goes next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultRouting {
    /// Ordinary batch resolution into the message history.
    Batch,
    /// Sole result is a loaded pdf document needing dedicated resolution.
    PdfFile,
    /// Sole result is a loaded image needing dedicated resolution.
    ImageFile,
    /// Completion was signalled with no outstanding todos; generate the
    /// final run result next.
    CompletionSummary,
}

/// Terminal decision of one dispatch.
#[derive(Debug)]
pub enum DispatchOutcome {
    Resolved {
        /// All results, in original proposal order.
        results: Vec<ToolResult>,
        routing: ResultRouting,
        /// Replacement todo list requested via the todo tool, if any.
        todos_update: Option<Vec<TodoItem>>,
    },
    Delegate {
        targets: Vec<DelegationTarget>,
        /// Calls that remain unresolved (delegate and interactive classes).
        pending: Vec<ToolCall>,
        /// Already-resolved mcp results carried across the suspension.
        partial: Vec<ToolResult>,
    },
    Interactive {
        pending: Vec<ToolCall>,
        partial: Vec<ToolResult>,
    },
}

/// Resolve one step's batch of tool calls.
#[instrument(name = "engine.dispatch", skip_all, fields(calls = calls.len()))]
pub async fn dispatch_tool_calls(
    router: &SkillRouter,
    calls: Vec<ToolCall>,
    todos: &[TodoItem],
    config: &ToolOutputConfig,
    events: &EventSink,
) -> Result<DispatchOutcome, EngineError> {
    // Classify up front so an unknown tool fails before any side effects.
    let mut classified = Vec::with_capacity(calls.len());
    for call in calls {
        let Some((_, kind)) = router.resolve(&call.tool_name) else {
            return Err(EngineError::ToolNotFound {
                tool_name: call.tool_name,
            });
        };
        classified.push((call, kind));
    }

    let mcp_count = classified
        .iter()
        .filter(|(_, kind)| *kind == SkillKind::Mcp)
        .count();
    debug!(
        "dispatching {} calls ({} in-process)",
        classified.len(),
        mcp_count
    );

    // Fan out every in-process call; join_all yields results in future
    // order, which is proposal order, regardless of completion order.
    let results: Vec<ToolResult> = join_all(
        classified
            .iter()
            .filter(|(_, kind)| *kind == SkillKind::Mcp)
            .map(|(call, _)| execute_mcp_call(router, call, config, events)),
    )
    .await;

    let has_delegate = classified
        .iter()
        .any(|(_, kind)| *kind == SkillKind::Delegate);
    let has_interactive = classified
        .iter()
        .any(|(_, kind)| *kind == SkillKind::Interactive);

    if has_delegate || has_interactive {
        let pending: Vec<ToolCall> = classified
            .iter()
            .filter(|(_, kind)| *kind != SkillKind::Mcp)
            .map(|(call, _)| call.clone())
            .collect();

        if has_delegate {
            let targets = classified
                .iter()
                .filter(|(_, kind)| *kind == SkillKind::Delegate)
                .map(|(call, _)| delegation_target_from_call(call))
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(DispatchOutcome::Delegate {
                targets,
                pending,
                partial: results,
            });
        }

        return Ok(DispatchOutcome::Interactive {
            pending,
            partial: results,
        });
    }

    // All calls resolved in-process; route on tool identity.
    let calls: Vec<ToolCall> = classified.into_iter().map(|(call, _)| call).collect();
    let todos_update = extract_todos_update(&calls);
    let routing = route_resolved_batch(&calls, &results, todos, todos_update.as_deref());
    Ok(DispatchOutcome::Resolved {
        results,
        routing,
        todos_update,
    })
}

async fn execute_mcp_call(
    router: &SkillRouter,
    call: &ToolCall,
    config: &ToolOutputConfig,
    events: &EventSink,
) -> ToolResult {
    // Presence was checked during classification.
    let (skill, _) = router
        .resolve(&call.tool_name)
        .expect("classified call lost its backend");

    events
        .emit(RunEventKind::ToolCallStart {
            tool_call_id: call.id.clone(),
            skill_name: skill.name().to_string(),
            tool_name: call.tool_name.clone(),
        })
        .await;

    let (parts, is_error) = match skill.call_tool(&call.tool_name, call.args.clone()).await {
        Ok(parts) => (truncate_parts(parts, config), false),
        Err(e) => {
            warn!("tool '{}' failed: {}", call.tool_name, e);
            (vec![ContentPart::text(format!("Error: {e}"))], true)
        }
    };

    events
        .emit(RunEventKind::ToolCallEnd {
            tool_call_id: call.id.clone(),
            tool_name: call.tool_name.clone(),
            is_error,
        })
        .await;

    ToolResult {
        id: call.id.clone(),
        skill_name: skill.name().to_string(),
        tool_name: call.tool_name.clone(),
        result: parts,
    }
}

fn route_resolved_batch(
    calls: &[ToolCall],
    results: &[ToolResult],
    todos: &[TodoItem],
    todos_update: Option<&[TodoItem]>,
) -> ResultRouting {
    if calls
        .iter()
        .any(|call| call.tool_name == ATTEMPT_COMPLETION_TOOL)
    {
        // An update in the same batch takes effect before the check.
        let outstanding = todos_update
            .unwrap_or(todos)
            .iter()
            .any(|todo| !todo.done);
        return if outstanding {
            ResultRouting::Batch
        } else {
            ResultRouting::CompletionSummary
        };
    }

    if calls.len() == 1 && calls[0].tool_name == LOAD_FILE_TOOL {
        if let Some(result) = results.first() {
            for part in &result.result {
                match part {
                    ContentPart::Document { .. } => return ResultRouting::PdfFile,
                    ContentPart::Image { .. } => return ResultRouting::ImageFile,
                    _ => {}
                }
            }
        }
    }

    ResultRouting::Batch
}

/// Latest todo replacement in the batch, if the todo tool was called.
fn extract_todos_update(calls: &[ToolCall]) -> Option<Vec<TodoItem>> {
    calls
        .iter()
        .rev()
        .find(|call| call.tool_name == UPDATE_TODOS_TOOL)
        .and_then(|call| serde_json::from_value::<UpdateTodosArgs>(call.args.clone()).ok())
        .map(|args| args.todos.into_iter().map(TodoItem::from).collect())
}

fn delegation_target_from_call(call: &ToolCall) -> Result<DelegationTarget, EngineError> {
    let expert = call
        .args
        .get("expert")
        .and_then(|v| v.as_str())
        .ok_or_else(|| EngineError::MissingData {
            what: format!("'expert' argument on delegation call {}", call.id),
        })?;
    let query = call
        .args
        .get("query")
        .and_then(|v| v.as_str())
        .ok_or_else(|| EngineError::MissingData {
            what: format!("'query' argument on delegation call {}", call.id),
        })?;
    let model = call
        .args
        .get("model")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    Ok(DelegationTarget {
        expert: ExpertDescriptor {
            key: expert.to_string(),
            model,
        },
        tool_call_id: call.id.clone(),
        tool_name: call.tool_name.clone(),
        query: query.to_string(),
    })
}

fn truncate_parts(parts: Vec<ContentPart>, config: &ToolOutputConfig) -> Vec<ContentPart> {
    parts
        .into_iter()
        .map(|part| match part {
            ContentPart::Text { text } => ContentPart::Text {
                text: truncate_output(&text, config),
            },
            other => other,
        })
        .collect()
}

/// Head-first cap on tool output text. Oversize content is elided and a
/// notice appended so the model knows it saw a prefix.
fn truncate_output(text: &str, config: &ToolOutputConfig) -> String {
    let line_count = text.lines().count();
    let over_lines = line_count > config.max_lines;
    let over_bytes = text.len() > config.max_bytes;
    if !over_lines && !over_bytes {
        return text.to_string();
    }

    let mut kept = String::new();
    for (i, line) in text.lines().enumerate() {
        if i >= config.max_lines || kept.len() + line.len() + 1 > config.max_bytes {
            break;
        }
        kept.push_str(line);
        kept.push('\n');
    }

    let elided_lines = line_count.saturating_sub(kept.lines().count());
    format!(
        "{kept}\n[output truncated: {} of {} lines shown, {} elided]",
        kept.lines().count(),
        line_count,
        elided_lines
    )
}
