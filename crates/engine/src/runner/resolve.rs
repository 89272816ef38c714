//! Result resolution: turning settled tool results into history messages.
//!
//! Covers the ordinary batch fold plus the three special-cased single
//! results: thoughts, pdf documents, and images. Multimodal payloads are
//! promoted to message parts the model can consume directly.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use log::debug;

use super::RunContext;
use super::state::StepEvent;
use crate::checkpoint::{Checkpoint, TodoItem, ToolResult};
use crate::error::EngineError;
use crate::events::RunEventKind;
use crate::skill::THINK_TOOL;
use relay_llm::{ContentPart, Message, Role};

/// Ids in original proposal order, recovered from the most recent
/// assistant message that proposed tool calls. Survives restarts because
/// that message is part of the persisted history.
fn proposal_order(messages: &[Message]) -> Vec<String> {
    messages
        .iter()
        .rev()
        .find(|message| message.is_assistant() && !message.tool_uses().is_empty())
        .map(|message| {
            message
                .tool_uses()
                .iter()
                .map(|call| call.id.clone())
                .collect()
        })
        .unwrap_or_default()
}

/// Merge carried partial results with freshly resolved ones (partial first,
/// deduplicated by id) and order the whole batch by proposal order. Ids the
/// proposing message does not know keep their arrival order at the end.
pub(super) fn merge_and_order(checkpoint: &Checkpoint, results: &[ToolResult]) -> Vec<ToolResult> {
    let mut merged: Vec<ToolResult> = checkpoint.partial().to_vec();
    for result in results {
        if !merged.iter().any(|r| r.id == result.id) {
            merged.push(result.clone());
        }
    }

    let order = proposal_order(&checkpoint.messages);
    let rank = |id: &str| {
        order
            .iter()
            .position(|known| known == id)
            .unwrap_or(usize::MAX)
    };
    let mut indexed: Vec<(usize, usize, ToolResult)> = merged
        .into_iter()
        .enumerate()
        .map(|(arrival, result)| (rank(&result.id), arrival, result))
        .collect();
    indexed.sort_by_key(|(rank, arrival, _)| (*rank, *arrival));
    indexed.into_iter().map(|(_, _, result)| result).collect()
}

fn result_message(result: &ToolResult) -> Message {
    Message::new(
        Role::User,
        vec![ContentPart::ToolResult {
            id: result.id.clone(),
            tool_name: result.tool_name.clone(),
            parts: result.result.clone(),
        }],
    )
}

/// Fold an ordered batch into one message per result.
pub(super) fn fold_messages(
    checkpoint: &Checkpoint,
    results: &[ToolResult],
) -> (Vec<Message>, Vec<ToolResult>) {
    let ordered = merge_and_order(checkpoint, results);
    let messages = ordered.iter().map(result_message).collect();
    (messages, ordered)
}

/// Resolve a settled batch. A sole think-tool result detours through its
/// dedicated state; everything else folds directly.
pub(super) async fn resolving_tool_result(
    ctx: &RunContext<'_>,
    checkpoint: &Checkpoint,
    results: &[ToolResult],
    todos_update: Option<Vec<TodoItem>>,
) -> Result<StepEvent, EngineError> {
    if checkpoint.partial().is_empty()
        && results.len() == 1
        && results[0].tool_name == THINK_TOOL
    {
        return Ok(StepEvent::ThoughtRouted {
            result: results[0].clone(),
        });
    }

    if let Some(todos) = &todos_update {
        ctx.events
            .emit(RunEventKind::TodosUpdated {
                outstanding: todos.iter().filter(|t| !t.done).count(),
                total: todos.len(),
            })
            .await;
    }

    let (messages, ordered) = fold_messages(checkpoint, results);
    debug!("folding {} tool results into history", ordered.len());
    Ok(StepEvent::ResultsFolded {
        messages,
        results: ordered,
        todos_update,
    })
}

/// Resolve a think-tool result: the text becomes a thought part, keeping
/// the call/result pairing intact in history.
pub(super) async fn resolving_thought(
    ctx: &RunContext<'_>,
    _checkpoint: &Checkpoint,
    result: &ToolResult,
) -> Result<StepEvent, EngineError> {
    let thought = result.text().unwrap_or_default();
    ctx.events
        .emit(RunEventKind::ThoughtRecorded {
            thought: thought.clone(),
        })
        .await;

    let message = Message::new(
        Role::User,
        vec![ContentPart::ToolResult {
            id: result.id.clone(),
            tool_name: result.tool_name.clone(),
            parts: vec![ContentPart::Thought { text: thought }],
        }],
    );
    Ok(StepEvent::ResultsFolded {
        messages: vec![message],
        results: vec![result.clone()],
        todos_update: None,
    })
}

pub(super) async fn resolving_pdf_file(
    ctx: &RunContext<'_>,
    checkpoint: &Checkpoint,
    result: &ToolResult,
) -> Result<StepEvent, EngineError> {
    resolve_file(ctx, checkpoint, result, FilePartKind::Document).await
}

pub(super) async fn resolving_image_file(
    ctx: &RunContext<'_>,
    checkpoint: &Checkpoint,
    result: &ToolResult,
) -> Result<StepEvent, EngineError> {
    resolve_file(ctx, checkpoint, result, FilePartKind::Image).await
}

enum FilePartKind {
    Document,
    Image,
}

/// Turn a loaded-file result into model-consumable message parts: a short
/// tool-result note plus the file part itself, after validating the
/// payload encoding.
async fn resolve_file(
    ctx: &RunContext<'_>,
    checkpoint: &Checkpoint,
    result: &ToolResult,
    kind: FilePartKind,
) -> Result<StepEvent, EngineError> {
    let file_part = result
        .result
        .iter()
        .find(|part| match kind {
            FilePartKind::Document => matches!(part, ContentPart::Document { .. }),
            FilePartKind::Image => matches!(part, ContentPart::Image { .. }),
        })
        .cloned()
        .ok_or_else(|| EngineError::MissingData {
            what: format!("file content part on tool result {}", result.id),
        })?;

    let (media_type, data, name) = match &file_part {
        ContentPart::Document {
            media_type,
            data,
            name,
        } => (media_type.clone(), data, name.clone()),
        ContentPart::Image { media_type, data } => (media_type.clone(), data, None),
        _ => unreachable!("filtered above"),
    };

    let decoded_len = BASE64
        .decode(data.as_bytes())
        .map_err(|e| EngineError::Skill {
            skill: result.skill_name.clone(),
            reason: format!("file payload is not valid base64: {e}"),
        })?
        .len();

    ctx.events
        .emit(RunEventKind::FileResolved {
            tool_call_id: result.id.clone(),
            media_type: media_type.clone(),
        })
        .await;

    let note = match name {
        Some(name) => format!("Loaded {name} ({media_type}, {decoded_len} bytes)"),
        None => format!("Loaded file ({media_type}, {decoded_len} bytes)"),
    };
    let message = Message::new(
        Role::User,
        vec![
            ContentPart::ToolResult {
                id: result.id.clone(),
                tool_name: result.tool_name.clone(),
                parts: vec![ContentPart::text(note)],
            },
            file_part,
        ],
    );

    // Carried partial results (from a resumed batch) fold ahead of the file.
    let (mut messages, mut folded) = fold_messages(checkpoint, &[]);
    messages.push(message);
    folded.push(result.clone());
    Ok(StepEvent::ResultsFolded {
        messages,
        results: folded,
        todos_update: None,
    })
}
