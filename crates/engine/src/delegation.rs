//! Delegation: fanning a run's decision out to sub-agent runs and folding
//! their outcomes back into the parent's timeline.
//!
//! Strategies never execute a child themselves beyond calling the injected
//! run function, so the same code drives in-process, subprocess, or
//! containerized children.

use async_trait::async_trait;
use futures_util::future::join_all;
use log::{debug, info};
use relay_llm::{ContentPart, Message, Usage};
use tracing::instrument;

use crate::checkpoint::{
    Checkpoint, DelegatedBy, DelegationTarget, RunInput, RunSetting, RunStatus, ToolCall,
    ToolResult,
};
use crate::error::EngineError;
use crate::runner::RunOptions;

/// Executes one sub-run to its terminal checkpoint. Supplied by the caller;
/// the coordinator never depends on how the child is actually hosted.
#[async_trait]
pub trait RunFunction: Send + Sync {
    async fn run(
        &self,
        setting: RunSetting,
        checkpoint: Checkpoint,
        options: RunOptions,
    ) -> Result<Checkpoint, EngineError>;
}

/// The slice of a parent checkpoint a delegation strategy needs.
/// A read-only projection; building one never mutates the checkpoint.
#[derive(Debug, Clone)]
pub struct DelegationContext {
    pub checkpoint_id: String,
    pub step_number: u32,
    pub context_window: Option<u32>,
    pub usage: Usage,
    pub pending_tool_calls: Vec<ToolCall>,
    pub partial_tool_results: Vec<ToolResult>,
    pub delegated_by: Option<DelegatedBy>,
    pub messages: Vec<Message>,
}

pub fn extract_delegation_context(checkpoint: &Checkpoint) -> DelegationContext {
    DelegationContext {
        checkpoint_id: checkpoint.id.clone(),
        step_number: checkpoint.step_number,
        context_window: checkpoint.context_window,
        usage: checkpoint.usage,
        pending_tool_calls: checkpoint.pending().to_vec(),
        partial_tool_results: checkpoint.partial().to_vec(),
        delegated_by: checkpoint.delegated_by.clone(),
        messages: checkpoint.messages.clone(),
    }
}

/// A child run ready for the caller to drive.
#[derive(Debug, Clone)]
pub struct PreparedDelegation {
    pub setting: RunSetting,
    pub checkpoint: Checkpoint,
    pub target: DelegationTarget,
}

/// The parent's rebuilt continuation after its delegations settled.
#[derive(Debug, Clone)]
pub struct DelegationReturn {
    pub setting: RunSetting,
    pub checkpoint: Checkpoint,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelegationStrategy {
    Single,
    Parallel,
}

/// Strategy selection by delegation count. A count of zero falls through to
/// Parallel, whose own arity guard then rejects it.
pub fn select_delegation_strategy(count: usize) -> DelegationStrategy {
    if count == 1 {
        DelegationStrategy::Single
    } else {
        DelegationStrategy::Parallel
    }
}

/// Build the child setting/checkpoint pair for one delegation target.
fn prepare_child(
    target: &DelegationTarget,
    parent_setting: &RunSetting,
    parent: &DelegationContext,
) -> PreparedDelegation {
    let child_setting = RunSetting {
        job_id: parent_setting.job_id.clone(),
        run_id: uuid::Uuid::new_v4().to_string(),
        expert: target.expert.key.clone(),
        model: target
            .expert
            .model
            .clone()
            .unwrap_or_else(|| parent_setting.model.clone()),
        max_steps: parent_setting.max_steps,
        max_retries: parent_setting.max_retries,
        time_budget_secs: parent_setting.time_budget_secs,
        initial_input: RunInput::Text(target.query.clone()),
    };

    let mut checkpoint = Checkpoint::new(&child_setting).with_delegated_by(DelegatedBy {
        expert_key: parent_setting.expert.clone(),
        tool_call_id: target.tool_call_id.clone(),
        tool_name: target.tool_name.clone(),
        checkpoint_id: parent.checkpoint_id.clone(),
    });
    checkpoint.context_window = parent.context_window;

    PreparedDelegation {
        setting: child_setting,
        checkpoint,
        target: target.clone(),
    }
}

/// Skill name stamped on a tool result produced by a delegated child, so the
/// parent's history shows which child resolved the call.
fn delegate_skill_name(target: &DelegationTarget) -> String {
    format!("delegate:{}", target.expert.key)
}

/// Final agent-authored text of a terminated child run.
///
/// The terminal message must be assistant-authored and carry a text part;
/// anything else is a malformed delegation result and fatal to the parent.
fn final_agent_text(checkpoint: &Checkpoint) -> Result<String, EngineError> {
    checkpoint
        .messages
        .last()
        .filter(|message| message.is_assistant())
        .and_then(|message| message.text())
        .ok_or_else(|| EngineError::DelegationResultMalformed {
            run_id: checkpoint.run_id.clone(),
        })
}

fn delegation_tool_result(
    target: &DelegationTarget,
    child: &Checkpoint,
) -> Result<ToolResult, EngineError> {
    let text = final_agent_text(child)?;
    Ok(ToolResult {
        id: target.tool_call_id.clone(),
        skill_name: delegate_skill_name(target),
        tool_name: target.tool_name.clone(),
        result: vec![ContentPart::text(text)],
    })
}

/// Single delegation: prepare the child pair, nothing more. Driving the
/// child and rejoining the parent are the caller's moves.
#[derive(Debug, Default)]
pub struct SingleDelegationStrategy;

impl SingleDelegationStrategy {
    pub fn execute(
        &self,
        targets: &[DelegationTarget],
        parent_setting: &RunSetting,
        parent: &DelegationContext,
    ) -> Result<PreparedDelegation, EngineError> {
        if targets.len() != 1 {
            return Err(EngineError::SingleDelegationRequiresOne {
                count: targets.len(),
            });
        }
        let prepared = prepare_child(&targets[0], parent_setting, parent);
        debug!(
            "prepared single delegation to expert '{}' as run {}",
            prepared.target.expert.key, prepared.setting.run_id
        );
        Ok(prepared)
    }
}

/// Parallel delegation: run every child concurrently, join, and rebuild the
/// parent's continuation.
#[derive(Debug, Default)]
pub struct ParallelDelegationStrategy;

impl ParallelDelegationStrategy {
    #[instrument(name = "engine.delegation.parallel", skip_all, fields(targets = targets.len()))]
    pub async fn execute(
        &self,
        targets: &[DelegationTarget],
        parent_setting: &RunSetting,
        parent_checkpoint: &Checkpoint,
        run_fn: &dyn RunFunction,
        options: &RunOptions,
    ) -> Result<DelegationReturn, EngineError> {
        if targets.len() < 2 {
            return Err(EngineError::ParallelDelegationRequiresTwo {
                count: targets.len(),
            });
        }

        let parent = extract_delegation_context(parent_checkpoint);
        let prepared: Vec<PreparedDelegation> = targets
            .iter()
            .map(|target| prepare_child(target, parent_setting, &parent))
            .collect();

        info!(
            "running {} delegations in parallel for run {}",
            prepared.len(),
            parent_setting.run_id
        );

        let terminals: Vec<Checkpoint> = join_all(prepared.iter().map(|child| {
            run_fn.run(
                child.setting.clone(),
                child.checkpoint.clone(),
                options.child(),
            )
        }))
        .await
        .into_iter()
        .collect::<Result<Vec<_>, _>>()?;

        let mut results = Vec::with_capacity(terminals.len());
        for (target, terminal) in targets.iter().zip(&terminals) {
            results.push(delegation_tool_result(target, terminal)?);
        }

        let usage = terminals
            .iter()
            .fold(parent.usage, |acc, child| acc.add(&child.usage));
        let step_number = terminals
            .iter()
            .map(|child| child.step_number)
            .max()
            .unwrap_or(parent.step_number);

        let delegated_ids: std::collections::HashSet<&str> =
            targets.iter().map(|t| t.tool_call_id.as_str()).collect();
        let pending: Vec<ToolCall> = parent
            .pending_tool_calls
            .iter()
            .filter(|call| !delegated_ids.contains(call.id.as_str()))
            .cloned()
            .collect();

        let mut remaining = results;
        let current = remaining.remove(0);
        let mut partial = parent.partial_tool_results.clone();
        partial.extend(remaining);

        let mut checkpoint = parent_checkpoint.clone();
        checkpoint.status = RunStatus::Proceeding;
        checkpoint.delegate_to = None;
        // Children never touch the parent's history; the persisted snapshot
        // carries forward untouched.
        checkpoint.messages = parent.messages;
        checkpoint.usage = usage;
        checkpoint.step_number = step_number;
        checkpoint.pending_tool_calls = if pending.is_empty() {
            None
        } else {
            Some(pending)
        };
        checkpoint.partial_tool_results = if partial.is_empty() {
            None
        } else {
            Some(partial)
        };
        checkpoint.delegated_by = parent.delegated_by;

        let mut setting = parent_setting.clone();
        setting.initial_input = RunInput::ToolResult(current);

        Ok(DelegationReturn {
            setting,
            checkpoint,
        })
    }
}

/// Rejoin a parent suspended on a *single* delegation once the child run
/// terminated: the parent resumes its own step loop with the child's result
/// as input.
pub fn build_return_from_delegation(
    parent_setting: &RunSetting,
    parent_checkpoint: &Checkpoint,
    child_terminal: &Checkpoint,
) -> Result<DelegationReturn, EngineError> {
    let targets = parent_checkpoint
        .delegate_to
        .as_deref()
        .filter(|targets| !targets.is_empty())
        .ok_or_else(|| EngineError::InvalidCheckpoint {
            reason: "cannot rejoin: checkpoint has no delegation targets".to_string(),
        })?;
    let target = &targets[0];
    let result = delegation_tool_result(target, child_terminal)?;

    let mut checkpoint = parent_checkpoint.clone();
    checkpoint.status = RunStatus::Proceeding;
    checkpoint.delegate_to = None;
    checkpoint.usage = checkpoint.usage.add(&child_terminal.usage);
    let pending: Vec<ToolCall> = checkpoint
        .pending()
        .iter()
        .filter(|call| call.id != target.tool_call_id)
        .cloned()
        .collect();
    checkpoint.pending_tool_calls = if pending.is_empty() {
        None
    } else {
        Some(pending)
    };

    let mut setting = parent_setting.clone();
    setting.initial_input = RunInput::ToolResult(result);

    Ok(DelegationReturn {
        setting,
        checkpoint,
    })
}
