//! Delegation flows across suspension, child runs, and parent resumption.

mod common;

use async_trait::async_trait;
use common::{EchoSkill, MemoryStore, PassiveSkill, ScriptedLlm, result_ids, text_response,
    tool_response};
use std::sync::Arc;

use relay_engine::{
    Checkpoint, DelegationStrategy, Engine, EngineError, ParallelDelegationStrategy, RunFunction,
    RunInput, RunOptions, RunSetting, RunStatus, SingleDelegationStrategy, SkillKind, StopReason,
    build_return_from_delegation, extract_delegation_context, select_delegation_strategy,
};
use relay_llm::{Message, Usage};

fn setting(task: &str) -> RunSetting {
    RunSetting::new("job-1", "orchestrator", "relay-large", RunInput::Text(task.to_string()))
}

fn delegate_args(expert: &str, query: &str) -> serde_json::Value {
    serde_json::json!({"expert": expert, "query": query})
}

fn skills() -> Vec<Arc<dyn relay_engine::SkillManager>> {
    vec![
        EchoSkill::new("web", &["search"]),
        PassiveSkill::new("experts", SkillKind::Delegate, &["ask_expert"]),
        PassiveSkill::new("human", SkillKind::Interactive, &["ask_user"]),
    ]
}

#[tokio::test]
async fn delegate_call_suspends_run_with_targets() {
    common::init_logging();
    let llm = ScriptedLlm::new(vec![tool_response(vec![
        ("tc_1", "search", serde_json::json!({"input": "context"})),
        ("tc_2", "ask_expert", delegate_args("coder", "fix the bug")),
        ("tc_3", "ask_user", serde_json::json!({"question": "ok?"})),
    ])]);
    let store = MemoryStore::new();
    let engine = Engine::new(llm, skills(), store);

    let setting = setting("coordinate work");
    let checkpoint = Checkpoint::new(&setting);
    let report = engine
        .run(setting, checkpoint, RunOptions::default())
        .await
        .unwrap();

    // Delegate outranks interactive when one step proposes both.
    assert_eq!(report.reason, StopReason::Delegation);
    let cp = &report.checkpoint;
    assert_eq!(cp.status, RunStatus::StoppedByDelegate);
    let targets = cp.delegate_to.as_ref().unwrap();
    assert_eq!(targets.len(), 1);
    assert_eq!(targets[0].expert.key, "coder");
    assert_eq!(targets[0].query, "fix the bug");
    // The mcp result was kept, the non-mcp calls stayed pending.
    assert_eq!(cp.partial().len(), 1);
    assert_eq!(cp.partial()[0].id, "tc_1");
    let pending_ids: Vec<&str> = cp.pending().iter().map(|c| c.id.as_str()).collect();
    assert_eq!(pending_ids, vec!["tc_2", "tc_3"]);
    cp.validate().unwrap();
}

#[tokio::test]
async fn single_delegation_round_trip_through_child_run() {
    common::init_logging();
    // Parent suspends on one delegation.
    let llm = ScriptedLlm::new(vec![tool_response(vec![(
        "tc_1",
        "ask_expert",
        delegate_args("coder", "implement the parser"),
    )])]);
    let store = MemoryStore::new();
    let engine = Engine::new(llm, skills(), store.clone());

    let parent_setting = setting("build a parser");
    let checkpoint = Checkpoint::new(&parent_setting);
    let report = engine
        .run(parent_setting.clone(), checkpoint, RunOptions::default())
        .await
        .unwrap();
    assert_eq!(report.reason, StopReason::Delegation);
    let suspended = report.checkpoint;
    let targets = suspended.delegate_to.clone().unwrap();

    // Strategy selection and child preparation.
    assert_eq!(select_delegation_strategy(targets.len()), DelegationStrategy::Single);
    let parent_ctx = extract_delegation_context(&suspended);
    let prepared = SingleDelegationStrategy
        .execute(&targets, &parent_setting, &parent_ctx)
        .unwrap();
    assert_eq!(prepared.setting.expert, "coder");
    assert_eq!(
        prepared.setting.initial_input,
        RunInput::Text("implement the parser".to_string())
    );
    let provenance = prepared.checkpoint.delegated_by.clone().unwrap();
    assert_eq!(provenance.expert_key, "orchestrator");
    assert_eq!(provenance.tool_call_id, "tc_1");

    // Drive the child to completion with its own engine instance.
    let child_llm = ScriptedLlm::new(vec![text_response("parser implemented in src/parse.rs")]);
    let child_engine = Engine::new(child_llm, skills(), store.clone());
    let child_report = child_engine
        .run(prepared.setting, prepared.checkpoint, RunOptions::default())
        .await
        .unwrap();
    assert_eq!(child_report.reason, StopReason::Completed);
    // Provenance chains through the child's persisted state.
    assert_eq!(
        child_report.checkpoint.delegated_by.as_ref().unwrap().checkpoint_id,
        suspended.id
    );

    // Rejoin and finish the parent.
    let rejoined =
        build_return_from_delegation(&parent_setting, &suspended, &child_report.checkpoint)
            .unwrap();
    assert_eq!(rejoined.checkpoint.status, RunStatus::Proceeding);

    let parent_llm = ScriptedLlm::new(vec![text_response("parser delivered")]);
    let parent_engine = Engine::new(parent_llm, skills(), store);
    let final_report = parent_engine
        .run(rejoined.setting, rejoined.checkpoint, RunOptions::default())
        .await
        .unwrap();

    assert_eq!(final_report.reason, StopReason::Completed);
    assert_eq!(result_ids(&final_report.checkpoint), vec!["tc_1"]);
    let folded = final_report
        .checkpoint
        .messages
        .iter()
        .find_map(|m| {
            m.parts.iter().find_map(|part| match part {
                relay_llm::ContentPart::ToolResult { id, parts, .. } if id == "tc_1" => {
                    Some(parts.clone())
                }
                _ => None,
            })
        })
        .expect("child result folded into parent history");
    assert_eq!(
        folded[0].as_text(),
        Some("parser implemented in src/parse.rs")
    );
}

/// Run function returning pre-baked terminal checkpoints keyed by expert.
struct FixedChildren;

#[async_trait]
impl RunFunction for FixedChildren {
    async fn run(
        &self,
        setting: RunSetting,
        mut checkpoint: Checkpoint,
        _options: RunOptions,
    ) -> Result<Checkpoint, EngineError> {
        let (steps, usage, answer) = match setting.expert.as_str() {
            "coder" => (7, Usage::new(40, 20), "patch written"),
            "tester" => (11, Usage::new(15, 5), "suite green"),
            other => panic!("unexpected expert {other}"),
        };
        checkpoint.status = RunStatus::Completed;
        checkpoint.step_number = steps;
        checkpoint.usage = usage;
        checkpoint.messages = vec![
            Message::user(match &setting.initial_input {
                RunInput::Text(text) => text.clone(),
                other => panic!("unexpected input {other:?}"),
            }),
            Message::assistant(answer),
        ];
        Ok(checkpoint)
    }
}

#[tokio::test]
async fn parallel_delegation_rejoins_and_parent_completes() {
    common::init_logging();
    let llm = ScriptedLlm::new(vec![tool_response(vec![
        ("tc_1", "ask_expert", delegate_args("coder", "write the patch")),
        ("tc_2", "ask_expert", delegate_args("tester", "run the suite")),
    ])]);
    let store = MemoryStore::new();
    let engine = Engine::new(llm, skills(), store.clone());

    let parent_setting = setting("ship the fix");
    let checkpoint = Checkpoint::new(&parent_setting);
    let report = engine
        .run(parent_setting.clone(), checkpoint, RunOptions::default())
        .await
        .unwrap();
    assert_eq!(report.reason, StopReason::Delegation);
    let suspended = report.checkpoint;
    let targets = suspended.delegate_to.clone().unwrap();
    assert_eq!(select_delegation_strategy(targets.len()), DelegationStrategy::Parallel);

    let snapshot = suspended.messages.clone();
    let parent_usage = suspended.usage;

    let rejoined = ParallelDelegationStrategy
        .execute(
            &targets,
            &parent_setting,
            &suspended,
            &FixedChildren,
            &RunOptions::default(),
        )
        .await
        .unwrap();

    let cp = &rejoined.checkpoint;
    assert_eq!(cp.status, RunStatus::Proceeding);
    assert_eq!(cp.messages, snapshot, "parent history untouched by children");
    assert_eq!(cp.step_number, 11, "max of child step numbers");
    assert_eq!(cp.usage, parent_usage.add(&Usage::new(40, 20)).add(&Usage::new(15, 5)));

    // Resume the parent: both child results fold in proposal order, then
    // the parent wraps up.
    let parent_llm = ScriptedLlm::new(vec![text_response("fix shipped")]);
    let parent_engine = Engine::new(parent_llm, skills(), store);
    let final_report = parent_engine
        .run(rejoined.setting, rejoined.checkpoint, RunOptions::default())
        .await
        .unwrap();

    assert_eq!(final_report.reason, StopReason::Completed);
    assert_eq!(result_ids(&final_report.checkpoint), vec!["tc_1", "tc_2"]);
    assert_eq!(
        final_report.checkpoint.messages.last().unwrap().text().as_deref(),
        Some("fix shipped")
    );
}
