use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use flowline_core::state::chain;
use flowline_core::{
    CallActivityDefinition, ChildOutcome, ConnectorDefinition, ConnectorEvent, CoreError, DataDefinition, DataPacket,
    EngineConfig, EventTrigger, Expression, FailAction, FinishedChild, FlowNodeDefinition, FlowNodeInstance, FlowNodeKind,
    FlowNodeType, GatewayType, InstanceRole, LoopCharacteristics, MultiInstanceLoop, NodeFamily, Operation,
    ProcessDefinition, ProcessInstanceId, StandardLoop, StateCategory, StateId, Variables,
};
use flowline_state_inmemory::{init_tracing, InMemoryEngine, Job};

fn engine() -> InMemoryEngine {
    init_tracing("warn");
    InMemoryEngine::new(EngineConfig::default()).unwrap()
}

fn node(id: &str, node_type: FlowNodeType) -> FlowNodeDefinition {
    FlowNodeDefinition::new(id, id, node_type)
}

fn john() -> Expression {
    Expression::constant(json!("john"))
}

fn vars(pairs: &[(&str, serde_json::Value)]) -> Variables {
    pairs
        .iter()
        .map(|(name, value)| (name.to_string(), DataPacket::new(value.clone())))
        .collect()
}

async fn active_node(engine: &InMemoryEngine, process: &ProcessInstanceId, definition: &str) -> FlowNodeInstance {
    engine
        .runtime()
        .active_flow_nodes(process)
        .await
        .unwrap()
        .into_iter()
        .find(|n| n.definition_id.0 == definition)
        .unwrap_or_else(|| panic!("no active flow node {}", definition))
}

async fn archived(engine: &InMemoryEngine, process: &ProcessInstanceId, definition: &str) -> Vec<FlowNodeInstance> {
    engine
        .runtime()
        .archived_flow_nodes(process)
        .await
        .unwrap()
        .into_iter()
        .filter(|n| n.definition_id.0 == definition)
        .collect()
}

async fn state_of(engine: &InMemoryEngine, process: &ProcessInstanceId) -> (String, bool) {
    let summary = engine.runtime().process_summary(process).await.unwrap().unwrap();
    (summary.state, summary.archived)
}

async fn variable(engine: &InMemoryEngine, process: &ProcessInstanceId, name: &str) -> serde_json::Value {
    engine
        .runtime()
        .process_variables(process)
        .await
        .unwrap()
        .get(name)
        .map(|v| v.as_value().clone())
        .unwrap_or(serde_json::Value::Null)
}

#[tokio::test]
async fn test_state_manager_follows_static_chains() {
    let engine = engine();
    let manager = engine.executor().manager();

    for kind in [
        FlowNodeKind::AutomaticTask,
        FlowNodeKind::UserTask,
        FlowNodeKind::ReceiveTask,
        FlowNodeKind::CallActivity,
        FlowNodeKind::LoopActivity,
        FlowNodeKind::MultiInstanceActivity,
        FlowNodeKind::Gateway,
        FlowNodeKind::StartEvent,
        FlowNodeKind::EndEvent,
        FlowNodeKind::BoundaryEvent,
    ] {
        let family = NodeFamily::of(kind);
        let first = manager.first_state(kind).unwrap();
        assert_eq!(first.id(), chain(family, StateCategory::Normal)[0], "{:?}", kind);

        let supported = manager.supported_states(kind);
        for category in [StateCategory::Normal, StateCategory::Aborting, StateCategory::Cancelling] {
            for id in chain(family, category) {
                assert!(supported.contains(id), "{:?} misses {}", kind, id);
            }
        }
        assert!(supported.contains(&StateId::FAILED));
    }

    assert!(manager.state(FlowNodeKind::Gateway, StateId::READY).is_err());

    let names = manager.supported_state_names(FlowNodeKind::UserTask);
    for name in ["initializing", "ready", "executing", "completing", "completed", "aborted", "cancelled", "failed"] {
        assert!(names.contains(name), "user task misses {}", name);
    }
    assert!(!manager.supported_state_names(FlowNodeKind::Gateway).contains("ready"));
}

#[tokio::test]
async fn test_automatic_process_completes_and_is_archived() {
    let engine = engine();
    let runtime = engine.runtime();
    runtime
        .deploy(
            ProcessDefinition::new("simple", "1.0")
                .with_data(DataDefinition::new("greeting", None))
                .with_flow_node(node("start", FlowNodeType::StartEvent))
                .with_flow_node(
                    node("task", FlowNodeType::AutomaticTask)
                        .with_operation(Operation::assign("greeting", Expression::constant(json!("hello")))),
                )
                .with_flow_node(node("end", FlowNodeType::EndEvent))
                .with_transition("start", "task")
                .with_transition("task", "end"),
        )
        .await
        .unwrap();

    let process = runtime.start_process("simple", None, Variables::new()).await.unwrap();
    engine.run_until_idle().await.unwrap();

    assert_eq!(state_of(&engine, &process.id).await, ("Completed".to_string(), true));
    assert!(runtime.list_active_processes().await.unwrap().is_empty());
    assert!(runtime.active_flow_nodes(&process.id).await.unwrap().is_empty());
    assert_eq!(variable(&engine, &process.id, "greeting").await, json!("hello"));

    let finished = runtime.archived_flow_nodes(&process.id).await.unwrap();
    assert_eq!(finished.len(), 3);
    assert!(finished.iter().all(|n| n.state_id == StateId::COMPLETED));
    assert_eq!(engine.events().of_type("process_instance.finished").len(), 1);
}

#[tokio::test]
async fn test_unknown_process_cannot_start() {
    let engine = engine();
    let err = engine
        .runtime()
        .start_process("missing", None, Variables::new())
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Definition(_)));
}

#[tokio::test]
async fn test_latest_version_is_started() {
    let engine = engine();
    let runtime = engine.runtime();
    for version in ["1.0", "2.0"] {
        runtime
            .deploy(
                ProcessDefinition::new("versioned", version)
                    .with_data(DataDefinition::new("version", Some(Expression::constant(json!(version)))))
                    .with_flow_node(node("start", FlowNodeType::StartEvent)),
            )
            .await
            .unwrap();
    }

    let latest = runtime.start_process("versioned", None, Variables::new()).await.unwrap();
    let pinned = runtime
        .start_process("versioned", Some("1.0"), Variables::new())
        .await
        .unwrap();
    engine.run_until_idle().await.unwrap();

    assert_eq!(variable(&engine, &latest.id, "version").await, json!("2.0"));
    assert_eq!(variable(&engine, &pinned.id, "version").await, json!("1.0"));
}

fn approval_process() -> ProcessDefinition {
    ProcessDefinition::new("approval", "1.0")
        .with_flow_node(node("start", FlowNodeType::StartEvent))
        .with_flow_node(node("review", FlowNodeType::UserTask).with_actor(john()))
        .with_flow_node(node("end", FlowNodeType::EndEvent))
        .with_transition("start", "review")
        .with_transition("review", "end")
}

#[tokio::test]
async fn test_human_task_waits_for_its_assignee() {
    let engine = engine();
    let runtime = engine.runtime();
    runtime.deploy(approval_process()).await.unwrap();
    let process = runtime.start_process("approval", None, Variables::new()).await.unwrap();
    engine.run_until_idle().await.unwrap();

    let review = active_node(&engine, &process.id, "review").await;
    assert_eq!(review.state_id, StateId::READY);
    assert_eq!(review.assignee.as_deref(), Some("john"));

    let err = runtime.execute_user_task(&review.id, "jane").await.unwrap_err();
    assert!(matches!(err, CoreError::NotAssigned(_)));

    runtime.execute_user_task(&review.id, "john").await.unwrap();
    engine.run_until_idle().await.unwrap();
    assert_eq!(state_of(&engine, &process.id).await, ("Completed".to_string(), true));

    // the task is gone, a second completion is rejected
    assert!(runtime.execute_user_task(&review.id, "john").await.is_err());
}

#[tokio::test]
async fn test_human_task_can_be_reassigned() {
    let engine = engine();
    let runtime = engine.runtime();
    runtime.deploy(approval_process()).await.unwrap();
    let process = runtime.start_process("approval", None, Variables::new()).await.unwrap();
    engine.run_until_idle().await.unwrap();

    let review = active_node(&engine, &process.id, "review").await;
    runtime.assign_user_task(&review.id, Some("jane")).await.unwrap();
    runtime.execute_user_task(&review.id, "jane").await.unwrap();
    engine.run_until_idle().await.unwrap();

    let done = archived(&engine, &process.id, "review").await;
    assert_eq!(done[0].assignee.as_deref(), Some("jane"));
    assert_eq!(done[0].state_id, StateId::COMPLETED);
}

#[tokio::test]
async fn test_human_task_without_actor_fails() {
    let engine = engine();
    let runtime = engine.runtime();
    runtime
        .deploy(
            ProcessDefinition::new("orphan", "1.0")
                .with_flow_node(node("start", FlowNodeType::StartEvent))
                .with_flow_node(node("review", FlowNodeType::UserTask))
                .with_transition("start", "review"),
        )
        .await
        .unwrap();
    let process = runtime.start_process("orphan", None, Variables::new()).await.unwrap();
    engine.run_until_idle().await.unwrap();

    let review = active_node(&engine, &process.id, "review").await;
    assert_eq!(review.state_id, StateId::FAILED);
    assert_eq!(engine.events().of_type("flow_node.failed").len(), 1);
    assert!(engine
        .events()
        .comments(&process.id)
        .iter()
        .any(|c| c.starts_with("The flow node failed: 'review': ") && c.ends_with("is not assigned")));
    assert!(!state_of(&engine, &process.id).await.1);
}

#[tokio::test]
async fn test_parallel_gateways_fork_and_join() {
    let engine = engine();
    let runtime = engine.runtime();
    runtime
        .deploy(
            ProcessDefinition::new("fork", "1.0")
                .with_flow_node(node("start", FlowNodeType::StartEvent))
                .with_flow_node(node("fork", FlowNodeType::Gateway(GatewayType::Parallel)))
                .with_flow_node(node("a", FlowNodeType::AutomaticTask))
                .with_flow_node(node("b", FlowNodeType::UserTask).with_actor(john()))
                .with_flow_node(node("join", FlowNodeType::Gateway(GatewayType::Parallel)))
                .with_flow_node(node("end", FlowNodeType::EndEvent))
                .with_transition("start", "fork")
                .with_transition("fork", "a")
                .with_transition("fork", "b")
                .with_transition("a", "join")
                .with_transition("b", "join")
                .with_transition("join", "end"),
        )
        .await
        .unwrap();
    let process = runtime.start_process("fork", None, Variables::new()).await.unwrap();
    engine.run_until_idle().await.unwrap();

    let join = active_node(&engine, &process.id, "join").await;
    assert_eq!(join.state_id, StateId::WAITING);
    assert_eq!(join.gateway_hits.len(), 1);

    let b = active_node(&engine, &process.id, "b").await;
    runtime.execute_user_task(&b.id, "john").await.unwrap();
    engine.run_until_idle().await.unwrap();

    assert_eq!(state_of(&engine, &process.id).await, ("Completed".to_string(), true));
    assert_eq!(archived(&engine, &process.id, "join").await.len(), 1);
    assert_eq!(archived(&engine, &process.id, "end").await.len(), 1);
}

#[tokio::test]
async fn test_exclusive_gateway_takes_first_matching_or_default_transition() {
    let engine = engine();
    let runtime = engine.runtime();
    runtime
        .deploy(
            ProcessDefinition::new("route", "1.0")
                .with_flow_node(node("start", FlowNodeType::StartEvent))
                .with_flow_node(node("check", FlowNodeType::Gateway(GatewayType::Exclusive)))
                .with_flow_node(node("big", FlowNodeType::EndEvent))
                .with_flow_node(node("small", FlowNodeType::EndEvent))
                .with_transition("start", "check")
                .with_conditional_transition("check", "big", Some(Expression::jmespath("amount > `100`")), false)
                .with_conditional_transition("check", "small", None, true),
        )
        .await
        .unwrap();

    let large = runtime
        .start_process("route", None, vars(&[("amount", json!(250))]))
        .await
        .unwrap();
    let small = runtime
        .start_process("route", None, vars(&[("amount", json!(20))]))
        .await
        .unwrap();
    engine.run_until_idle().await.unwrap();

    assert_eq!(archived(&engine, &large.id, "big").await.len(), 1);
    assert!(archived(&engine, &large.id, "small").await.is_empty());
    assert_eq!(archived(&engine, &small.id, "small").await.len(), 1);
    assert!(archived(&engine, &small.id, "big").await.is_empty());
}

#[tokio::test]
async fn test_inclusive_join_waits_only_for_taken_branches() {
    let engine = engine();
    let runtime = engine.runtime();
    runtime
        .deploy(
            ProcessDefinition::new("review-order", "1.0")
                .with_flow_node(node("start", FlowNodeType::StartEvent))
                .with_flow_node(node("split", FlowNodeType::Gateway(GatewayType::Inclusive)))
                .with_flow_node(node("book", FlowNodeType::AutomaticTask))
                .with_flow_node(node("approve", FlowNodeType::UserTask).with_actor(john()))
                .with_flow_node(node("join", FlowNodeType::Gateway(GatewayType::Inclusive)))
                .with_flow_node(node("end", FlowNodeType::EndEvent))
                .with_transition("start", "split")
                .with_conditional_transition("split", "book", Some(Expression::jmespath("amount > `10`")), false)
                .with_conditional_transition("split", "approve", Some(Expression::jmespath("amount > `100`")), false)
                .with_transition("book", "join")
                .with_transition("approve", "join")
                .with_transition("join", "end"),
        )
        .await
        .unwrap();

    let small = runtime
        .start_process("review-order", None, vars(&[("amount", json!(50))]))
        .await
        .unwrap();
    let large = runtime
        .start_process("review-order", None, vars(&[("amount", json!(250))]))
        .await
        .unwrap();
    engine.run_until_idle().await.unwrap();

    assert_eq!(state_of(&engine, &small.id).await, ("Completed".to_string(), true));
    assert!(archived(&engine, &small.id, "approve").await.is_empty());
    let joins = archived(&engine, &small.id, "join").await;
    assert_eq!(joins.len(), 1);
    assert_eq!(joins[0].gateway_hits.len(), 1);

    let join = active_node(&engine, &large.id, "join").await;
    assert_eq!(join.state_id, StateId::WAITING);
    let approve = active_node(&engine, &large.id, "approve").await;
    runtime.execute_user_task(&approve.id, "john").await.unwrap();
    engine.run_until_idle().await.unwrap();

    assert_eq!(state_of(&engine, &large.id).await, ("Completed".to_string(), true));
    let joins = archived(&engine, &large.id, "join").await;
    assert_eq!(joins.len(), 1);
    assert_eq!(joins[0].gateway_hits.len(), 2);
    assert_eq!(archived(&engine, &large.id, "end").await.len(), 1);
}

fn message_process() -> ProcessDefinition {
    ProcessDefinition::new("await-approval", "1.0")
        .with_flow_node(node("start", FlowNodeType::StartEvent))
        .with_flow_node(
            node("wait", FlowNodeType::IntermediateCatchEvent)
                .with_trigger(EventTrigger::Message("approve".to_string())),
        )
        .with_flow_node(node("end", FlowNodeType::EndEvent))
        .with_transition("start", "wait")
        .with_transition("wait", "end")
}

#[tokio::test]
async fn test_message_wakes_only_the_scoped_process() {
    let engine = engine();
    let runtime = engine.runtime();
    runtime.deploy(message_process()).await.unwrap();
    let first = runtime.start_process("await-approval", None, Variables::new()).await.unwrap();
    let second = runtime.start_process("await-approval", None, Variables::new()).await.unwrap();
    engine.run_until_idle().await.unwrap();
    assert_eq!(active_node(&engine, &first.id, "wait").await.state_id, StateId::WAITING);

    let delivered = runtime
        .send_message("approve", Some(&first.id), vars(&[("approved", json!(true))]))
        .await
        .unwrap();
    assert_eq!(delivered, 1);
    engine.run_until_idle().await.unwrap();

    assert_eq!(state_of(&engine, &first.id).await, ("Completed".to_string(), true));
    assert_eq!(variable(&engine, &first.id, "approved").await, json!(true));
    assert!(!state_of(&engine, &second.id).await.1);

    assert_eq!(runtime.send_message("approve", None, Variables::new()).await.unwrap(), 1);
    assert_eq!(runtime.send_message("approve", None, Variables::new()).await.unwrap(), 0);
    engine.run_until_idle().await.unwrap();
    assert_eq!(state_of(&engine, &second.id).await, ("Completed".to_string(), true));
}

#[tokio::test]
async fn test_thrown_message_reaches_catching_process() {
    let engine = engine();
    let runtime = engine.runtime();
    runtime.deploy(message_process()).await.unwrap();
    runtime
        .deploy(
            ProcessDefinition::new("approver", "1.0")
                .with_flow_node(node("start", FlowNodeType::StartEvent))
                .with_flow_node(
                    node("end", FlowNodeType::EndEvent).with_trigger(EventTrigger::Message("approve".to_string())),
                )
                .with_transition("start", "end"),
        )
        .await
        .unwrap();

    let waiting = runtime.start_process("await-approval", None, Variables::new()).await.unwrap();
    engine.run_until_idle().await.unwrap();
    let approver = runtime.start_process("approver", None, Variables::new()).await.unwrap();
    engine.run_until_idle().await.unwrap();

    assert_eq!(state_of(&engine, &approver.id).await.0, "Completed");
    assert_eq!(state_of(&engine, &waiting.id).await, ("Completed".to_string(), true));
}

#[tokio::test]
async fn test_timer_is_fired_by_trigger() {
    let engine = engine();
    let runtime = engine.runtime();
    runtime
        .deploy(
            ProcessDefinition::new("delay", "1.0")
                .with_flow_node(node("start", FlowNodeType::StartEvent))
                .with_flow_node(node("timer", FlowNodeType::IntermediateCatchEvent).with_trigger(EventTrigger::Timer(60_000)))
                .with_flow_node(node("end", FlowNodeType::EndEvent))
                .with_transition("start", "timer")
                .with_transition("timer", "end"),
        )
        .await
        .unwrap();
    let process = runtime.start_process("delay", None, Variables::new()).await.unwrap();
    engine.run_until_idle().await.unwrap();

    let timer = active_node(&engine, &process.id, "timer").await;
    runtime.trigger_flow_node(&timer.id).await.unwrap();
    engine.run_until_idle().await.unwrap();
    assert_eq!(state_of(&engine, &process.id).await, ("Completed".to_string(), true));

    assert!(runtime.trigger_flow_node(&timer.id).await.is_err());
}

#[tokio::test]
async fn test_cancel_process_cancels_waiting_nodes() {
    let engine = engine();
    let runtime = engine.runtime();
    runtime.deploy(approval_process()).await.unwrap();
    let process = runtime.start_process("approval", None, Variables::new()).await.unwrap();
    engine.run_until_idle().await.unwrap();

    runtime.cancel_process(&process.id).await.unwrap();
    engine.run_until_idle().await.unwrap();

    assert_eq!(state_of(&engine, &process.id).await, ("Cancelled".to_string(), true));
    let review = archived(&engine, &process.id, "review").await;
    assert_eq!(review[0].state_id, StateId::CANCELLED);
    assert!(archived(&engine, &process.id, "end").await.is_empty());
}

#[tokio::test]
async fn test_terminate_end_event_aborts_other_branches() {
    let engine = engine();
    let runtime = engine.runtime();
    runtime
        .deploy(
            ProcessDefinition::new("terminate", "1.0")
                .with_flow_node(node("start", FlowNodeType::StartEvent))
                .with_flow_node(node("fork", FlowNodeType::Gateway(GatewayType::Parallel)))
                .with_flow_node(node("review", FlowNodeType::UserTask).with_actor(john()))
                .with_flow_node(node("kill", FlowNodeType::EndEvent).with_trigger(EventTrigger::Terminate))
                .with_transition("start", "fork")
                .with_transition("fork", "review")
                .with_transition("fork", "kill"),
        )
        .await
        .unwrap();
    let process = runtime.start_process("terminate", None, Variables::new()).await.unwrap();
    engine.run_until_idle().await.unwrap();

    assert!(state_of(&engine, &process.id).await.1);
    assert_eq!(archived(&engine, &process.id, "review").await[0].state_id, StateId::ABORTED);
}

#[tokio::test]
async fn test_interrupting_boundary_signal_aborts_activity() {
    let engine = engine();
    let runtime = engine.runtime();
    runtime
        .deploy(
            ProcessDefinition::new("escalation", "1.0")
                .with_flow_node(node("start", FlowNodeType::StartEvent))
                .with_flow_node(node("review", FlowNodeType::UserTask).with_actor(john()))
                .with_flow_node(FlowNodeDefinition::boundary(
                    "stop",
                    "Stop",
                    "review",
                    true,
                    EventTrigger::Signal("stop".to_string()),
                ))
                .with_flow_node(node("done", FlowNodeType::EndEvent))
                .with_flow_node(node("escalated", FlowNodeType::EndEvent))
                .with_transition("start", "review")
                .with_transition("review", "done")
                .with_transition("stop", "escalated"),
        )
        .await
        .unwrap();
    let process = runtime.start_process("escalation", None, Variables::new()).await.unwrap();
    engine.run_until_idle().await.unwrap();

    let boundary = active_node(&engine, &process.id, "stop").await;
    assert_eq!(boundary.role, InstanceRole::Boundary);
    assert_eq!(boundary.state_id, StateId::WAITING);

    assert_eq!(runtime.send_signal("stop").await.unwrap(), 1);
    engine.run_until_idle().await.unwrap();

    assert_eq!(state_of(&engine, &process.id).await, ("Completed".to_string(), true));
    assert_eq!(archived(&engine, &process.id, "review").await[0].state_id, StateId::ABORTED);
    assert_eq!(archived(&engine, &process.id, "escalated").await.len(), 1);
    assert!(archived(&engine, &process.id, "done").await.is_empty());
}

#[tokio::test]
async fn test_boundary_is_cancelled_when_activity_completes() {
    let engine = engine();
    let runtime = engine.runtime();
    runtime
        .deploy(
            ProcessDefinition::new("deadline", "1.0")
                .with_flow_node(node("start", FlowNodeType::StartEvent))
                .with_flow_node(node("review", FlowNodeType::UserTask).with_actor(john()))
                .with_flow_node(FlowNodeDefinition::boundary(
                    "late",
                    "Late",
                    "review",
                    true,
                    EventTrigger::Timer(1_000),
                ))
                .with_flow_node(node("done", FlowNodeType::EndEvent))
                .with_flow_node(node("escalated", FlowNodeType::EndEvent))
                .with_transition("start", "review")
                .with_transition("review", "done")
                .with_transition("late", "escalated"),
        )
        .await
        .unwrap();
    let process = runtime.start_process("deadline", None, Variables::new()).await.unwrap();
    engine.run_until_idle().await.unwrap();

    let review = active_node(&engine, &process.id, "review").await;
    runtime.execute_user_task(&review.id, "john").await.unwrap();
    engine.run_until_idle().await.unwrap();

    assert_eq!(state_of(&engine, &process.id).await, ("Completed".to_string(), true));
    assert_eq!(archived(&engine, &process.id, "late").await[0].state_id, StateId::CANCELLED);
    assert!(archived(&engine, &process.id, "escalated").await.is_empty());
}

#[tokio::test]
async fn test_standard_loop_runs_up_to_its_maximum() {
    let engine = engine();
    let runtime = engine.runtime();
    runtime
        .deploy(
            ProcessDefinition::new("repeat", "1.0")
                .with_flow_node(node("start", FlowNodeType::StartEvent))
                .with_flow_node(node("work", FlowNodeType::AutomaticTask).with_loop(
                    LoopCharacteristics::StandardLoop(StandardLoop {
                        condition: None,
                        max: Some(Expression::constant(json!(3))),
                        test_before: false,
                    }),
                ))
                .with_flow_node(node("end", FlowNodeType::EndEvent))
                .with_transition("start", "work")
                .with_transition("work", "end"),
        )
        .await
        .unwrap();
    let process = runtime.start_process("repeat", None, Variables::new()).await.unwrap();
    engine.run_until_idle().await.unwrap();

    assert_eq!(state_of(&engine, &process.id).await, ("Completed".to_string(), true));
    let work = archived(&engine, &process.id, "work").await;
    let mut counters: Vec<u32> = work
        .iter()
        .filter(|n| n.role == InstanceRole::Iteration)
        .map(|n| n.loop_counter)
        .collect();
    counters.sort_unstable();
    assert_eq!(counters, vec![0, 1, 2]);

    let container: Vec<_> = work.iter().filter(|n| n.kind == FlowNodeKind::LoopActivity).collect();
    assert_eq!(container.len(), 1);
    assert_eq!(container[0].loop_counter, 3);
}

#[tokio::test]
async fn test_loop_with_holding_condition_stops_at_its_maximum() {
    let engine = engine();
    let runtime = engine.runtime();
    runtime
        .deploy(
            ProcessDefinition::new("forever", "1.0")
                .with_flow_node(node("start", FlowNodeType::StartEvent))
                .with_flow_node(node("work", FlowNodeType::AutomaticTask).with_loop(
                    LoopCharacteristics::StandardLoop(StandardLoop {
                        condition: Some(Expression::jmespath("`true`")),
                        max: Some(Expression::constant(json!(4))),
                        test_before: true,
                    }),
                ))
                .with_flow_node(node("end", FlowNodeType::EndEvent))
                .with_transition("start", "work")
                .with_transition("work", "end"),
        )
        .await
        .unwrap();
    let process = runtime.start_process("forever", None, Variables::new()).await.unwrap();
    engine.run_until_idle().await.unwrap();

    assert_eq!(state_of(&engine, &process.id).await, ("Completed".to_string(), true));
    let work = archived(&engine, &process.id, "work").await;
    assert_eq!(work.iter().filter(|n| n.role == InstanceRole::Iteration).count(), 4);
    let container = work.iter().find(|n| n.kind == FlowNodeKind::LoopActivity).unwrap();
    assert_eq!(container.loop_counter, 4);
    assert_eq!(archived(&engine, &process.id, "end").await.len(), 1);
}

#[tokio::test]
async fn test_loop_tested_before_may_never_run() {
    let engine = engine();
    let runtime = engine.runtime();
    runtime
        .deploy(
            ProcessDefinition::new("skip", "1.0")
                .with_flow_node(node("start", FlowNodeType::StartEvent))
                .with_flow_node(node("work", FlowNodeType::AutomaticTask).with_loop(
                    LoopCharacteristics::StandardLoop(StandardLoop {
                        condition: Some(Expression::jmespath("`false`")),
                        max: None,
                        test_before: true,
                    }),
                ))
                .with_flow_node(node("end", FlowNodeType::EndEvent))
                .with_transition("start", "work")
                .with_transition("work", "end"),
        )
        .await
        .unwrap();
    let process = runtime.start_process("skip", None, Variables::new()).await.unwrap();
    engine.run_until_idle().await.unwrap();

    assert_eq!(state_of(&engine, &process.id).await, ("Completed".to_string(), true));
    let work = archived(&engine, &process.id, "work").await;
    assert!(work.iter().all(|n| n.role != InstanceRole::Iteration));
}

#[tokio::test]
async fn test_multi_instance_completion_condition_aborts_remaining_instances() {
    let engine = engine();
    let runtime = engine.runtime();
    runtime
        .deploy(
            ProcessDefinition::new("votes", "1.0")
                .with_flow_node(node("start", FlowNodeType::StartEvent))
                .with_flow_node(
                    node("vote", FlowNodeType::UserTask).with_actor(john()).with_loop(
                        LoopCharacteristics::MultiInstance(
                            MultiInstanceLoop::with_cardinality(false, Expression::constant(json!(3)))
                                .until(Expression::jmespath("numberOfCompletedInstances >= `2`")),
                        ),
                    ),
                )
                .with_flow_node(node("end", FlowNodeType::EndEvent))
                .with_transition("start", "vote")
                .with_transition("vote", "end"),
        )
        .await
        .unwrap();
    let process = runtime.start_process("votes", None, Variables::new()).await.unwrap();
    engine.run_until_idle().await.unwrap();

    let instances: Vec<_> = runtime
        .active_flow_nodes(&process.id)
        .await
        .unwrap()
        .into_iter()
        .filter(|n| n.role == InstanceRole::Iteration)
        .collect();
    assert_eq!(instances.len(), 3);
    assert!(instances.iter().all(|n| n.state_id == StateId::READY));

    for instance in &instances[..2] {
        runtime.execute_user_task(&instance.id, "john").await.unwrap();
        engine.run_until_idle().await.unwrap();
    }

    assert_eq!(state_of(&engine, &process.id).await, ("Completed".to_string(), true));
    let votes = archived(&engine, &process.id, "vote").await;
    let completed = votes
        .iter()
        .filter(|n| n.role == InstanceRole::Iteration && n.state_id == StateId::COMPLETED)
        .count();
    let aborted = votes
        .iter()
        .filter(|n| n.role == InstanceRole::Iteration && n.state_id == StateId::ABORTED)
        .count();
    assert_eq!((completed, aborted), (2, 1));
}

#[tokio::test]
async fn test_sequential_multi_instance_collects_outputs() {
    let engine = engine();
    let runtime = engine.runtime();
    runtime
        .deploy(
            ProcessDefinition::new("shout", "1.0")
                .with_data(DataDefinition::new("words", Some(Expression::constant(json!(["a", "b", "c"])))))
                .with_flow_node(node("start", FlowNodeType::StartEvent))
                .with_flow_node(
                    node("upper", FlowNodeType::AutomaticTask)
                        .with_operation(Operation::assign("out", Expression::jmespath("join('!', [word, ''])")))
                        .with_loop(LoopCharacteristics::MultiInstance(
                            MultiInstanceLoop::over_collection(true, "words", "word").collecting("shouted", "out"),
                        )),
                )
                .with_flow_node(node("end", FlowNodeType::EndEvent))
                .with_transition("start", "upper")
                .with_transition("upper", "end"),
        )
        .await
        .unwrap();
    let process = runtime.start_process("shout", None, Variables::new()).await.unwrap();
    engine.run_until_idle().await.unwrap();

    assert_eq!(state_of(&engine, &process.id).await, ("Completed".to_string(), true));
    assert_eq!(variable(&engine, &process.id, "shouted").await, json!(["a!", "b!", "c!"]));
}

#[tokio::test]
async fn test_call_activity_maps_data_and_archives_child_once() {
    let engine = engine();
    let runtime = engine.runtime();
    runtime
        .deploy(
            ProcessDefinition::new("child", "1.0")
                .with_data(DataDefinition::new("x", None))
                .with_flow_node(node("start", FlowNodeType::StartEvent))
                .with_flow_node(
                    node("echo", FlowNodeType::AutomaticTask)
                        .with_operation(Operation::assign("echoed", Expression::jmespath("x"))),
                )
                .with_flow_node(node("end", FlowNodeType::EndEvent))
                .with_transition("start", "echo")
                .with_transition("echo", "end"),
        )
        .await
        .unwrap();
    runtime
        .deploy(
            ProcessDefinition::new("parent", "1.0")
                .with_flow_node(node("start", FlowNodeType::StartEvent))
                .with_flow_node(
                    node("invoke", FlowNodeType::CallActivity).with_call(
                        CallActivityDefinition::calling(Expression::constant(json!("child")))
                            .with_input(Operation::assign("x", Expression::jmespath("seed")))
                            .with_output(Operation::assign("result", Expression::jmespath("echoed"))),
                    ),
                )
                .with_flow_node(node("end", FlowNodeType::EndEvent))
                .with_transition("start", "invoke")
                .with_transition("invoke", "end"),
        )
        .await
        .unwrap();

    let parent = runtime
        .start_process("parent", None, vars(&[("seed", json!(42))]))
        .await
        .unwrap();
    engine.run_until_idle().await.unwrap();

    assert_eq!(state_of(&engine, &parent.id).await, ("Completed".to_string(), true));
    assert_eq!(variable(&engine, &parent.id, "result").await, json!(42));
    assert!(runtime.list_active_processes().await.unwrap().is_empty());

    let started = engine.events().of_type("process_instance.started");
    assert_eq!(started.len(), 2);
    let child = started
        .iter()
        .map(|e| e.process_instance_id.clone())
        .find(|id| id != &parent.id)
        .unwrap();
    let instance = runtime.process_instance(&child).await.unwrap().unwrap();
    assert_eq!(instance.root_process_instance_id, parent.id);
    assert_eq!(state_of(&engine, &child).await, ("Completed".to_string(), true));
    assert_eq!(engine.events().of_type("process_instance.finished").len(), 2);
}

#[tokio::test]
async fn test_call_activity_of_a_process_that_ends_at_once() {
    let engine = engine();
    let runtime = engine.runtime();
    runtime
        .deploy(
            ProcessDefinition::new("constant", "1.0")
                .with_data(DataDefinition::new("answer", Some(Expression::constant(json!(7))))),
        )
        .await
        .unwrap();
    runtime
        .deploy(
            ProcessDefinition::new("ask", "1.0")
                .with_flow_node(node("start", FlowNodeType::StartEvent))
                .with_flow_node(
                    node("invoke", FlowNodeType::CallActivity).with_call(
                        CallActivityDefinition::calling(Expression::constant(json!("constant")))
                            .with_output(Operation::assign("result", Expression::jmespath("answer"))),
                    ),
                )
                .with_flow_node(node("end", FlowNodeType::EndEvent))
                .with_transition("start", "invoke")
                .with_transition("invoke", "end"),
        )
        .await
        .unwrap();

    let caller = runtime.start_process("ask", None, Variables::new()).await.unwrap();
    engine.run_until_idle().await.unwrap();

    assert_eq!(state_of(&engine, &caller.id).await, ("Completed".to_string(), true));
    assert_eq!(variable(&engine, &caller.id, "result").await, json!(7));
    assert!(runtime.list_active_processes().await.unwrap().is_empty());
    assert_eq!(archived(&engine, &caller.id, "invoke").await[0].state_id, StateId::COMPLETED);

    let child = engine
        .events()
        .of_type("process_instance.started")
        .into_iter()
        .map(|e| e.process_instance_id)
        .find(|id| id != &caller.id)
        .unwrap();
    assert_eq!(state_of(&engine, &child).await, ("Completed".to_string(), true));
}

#[tokio::test]
async fn test_cancelling_caller_cancels_called_process() {
    let engine = engine();
    let runtime = engine.runtime();
    runtime.deploy(approval_process()).await.unwrap();
    runtime
        .deploy(
            ProcessDefinition::new("caller", "1.0")
                .with_flow_node(node("start", FlowNodeType::StartEvent))
                .with_flow_node(
                    node("invoke", FlowNodeType::CallActivity)
                        .with_call(CallActivityDefinition::calling(Expression::constant(json!("approval")))),
                )
                .with_transition("start", "invoke"),
        )
        .await
        .unwrap();
    let caller = runtime.start_process("caller", None, Variables::new()).await.unwrap();
    engine.run_until_idle().await.unwrap();
    assert_eq!(runtime.list_active_processes().await.unwrap().len(), 2);

    runtime.cancel_process(&caller.id).await.unwrap();
    engine.run_until_idle().await.unwrap();

    assert_eq!(state_of(&engine, &caller.id).await, ("Cancelled".to_string(), true));
    assert!(runtime.list_active_processes().await.unwrap().is_empty());
    assert_eq!(archived(&engine, &caller.id, "invoke").await[0].state_id, StateId::CANCELLED);
}

fn connector_process(fail_action: FailAction) -> ProcessDefinition {
    ProcessDefinition::new("enrich", "1.0")
        .with_flow_node(node("start", FlowNodeType::StartEvent))
        .with_flow_node(
            node("lookup", FlowNodeType::AutomaticTask).with_connector(
                ConnectorDefinition::new("crm", "crm-lookup", ConnectorEvent::OnEnter)
                    .with_input("customer", Expression::jmespath("customerId"))
                    .with_output(Operation::assign("tier", Expression::jmespath("tier")))
                    .with_fail_action(fail_action),
            ),
        )
        .with_flow_node(node("end", FlowNodeType::EndEvent))
        .with_transition("start", "lookup")
        .with_transition("lookup", "end")
}

#[tokio::test]
async fn test_connector_outputs_are_mapped() {
    let engine = engine();
    engine.connectors().register(
        "crm-lookup",
        Arc::new(|inputs: Variables| -> anyhow::Result<Variables> {
            let customer = inputs.get("customer").and_then(|c| c.as_str()).unwrap_or_default();
            let tier = if customer == "c-1" { "gold" } else { "basic" };
            Ok(vars(&[("tier", json!(tier))]))
        }),
    );
    let runtime = engine.runtime();
    runtime.deploy(connector_process(FailAction::Fail)).await.unwrap();
    let process = runtime
        .start_process("enrich", None, vars(&[("customerId", json!("c-1"))]))
        .await
        .unwrap();
    engine.run_until_idle().await.unwrap();

    assert_eq!(state_of(&engine, &process.id).await, ("Completed".to_string(), true));
    assert_eq!(variable(&engine, &process.id, "tier").await, json!("gold"));
}

#[tokio::test]
async fn test_failing_connector_fails_flow_node() {
    let engine = engine();
    engine.connectors().register(
        "crm-lookup",
        Arc::new(|_: Variables| -> anyhow::Result<Variables> { Err(anyhow::anyhow!("crm unavailable")) }),
    );
    let runtime = engine.runtime();
    runtime.deploy(connector_process(FailAction::Fail)).await.unwrap();
    let process = runtime.start_process("enrich", None, Variables::new()).await.unwrap();
    engine.run_until_idle().await.unwrap();

    let lookup = active_node(&engine, &process.id, "lookup").await;
    assert_eq!(lookup.state_id, StateId::FAILED);
    assert_eq!(state_of(&engine, &process.id).await, ("Started".to_string(), false));
    assert!(engine
        .events()
        .comments(&process.id)
        .iter()
        .any(|c| c.starts_with("The flow node failed: 'lookup': ") && c.contains("crm unavailable")));
    assert_eq!(engine.events().of_type("flow_node.failed").len(), 1);

    // a failed flow node can still be cancelled with its process
    runtime.cancel_process(&process.id).await.unwrap();
    engine.run_until_idle().await.unwrap();
    assert_eq!(state_of(&engine, &process.id).await, ("Cancelled".to_string(), true));
}

#[tokio::test]
async fn test_driving_a_flow_node_again_keeps_its_running_connector() {
    let engine = engine();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    engine.connectors().register(
        "crm-lookup",
        Arc::new(move |_: Variables| -> anyhow::Result<Variables> {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(vars(&[("tier", json!("basic"))]))
        }),
    );
    let runtime = engine.runtime();
    runtime.deploy(connector_process(FailAction::Fail)).await.unwrap();
    let process = runtime.start_process("enrich", None, Variables::new()).await.unwrap();

    // run flow node work until the connector is handed out, but hold it back
    let request = loop {
        let job = engine.queue().pop().expect("connector never dispatched");
        match job {
            Job::Work(work) => {
                engine.executor().handle(work).await.unwrap();
                engine.queue().finish();
            }
            Job::Connector(request) => {
                engine.queue().finish();
                break request;
            }
        }
    };
    let lookup = active_node(&engine, &process.id, "lookup").await;
    assert_eq!(lookup.id, request.flow_node_instance_id);

    let dispatched = engine.queue().dispatched();
    engine.executor().execute_flow_node(&lookup.id, None).await.unwrap();
    engine
        .executor()
        .execute_flow_node(&lookup.id, Some(lookup.state_id))
        .await
        .unwrap();
    assert_eq!(engine.queue().dispatched(), dispatched);
    assert_eq!(active_node(&engine, &process.id, "lookup").await.state_id, lookup.state_id);

    let result = engine.connectors().execute(&request).await;
    engine.executor().connector_finished(&request, result).await.unwrap();
    engine.run_until_idle().await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(state_of(&engine, &process.id).await, ("Completed".to_string(), true));
    assert_eq!(variable(&engine, &process.id, "tier").await, json!("basic"));
}

#[tokio::test]
async fn test_ignored_connector_failure_lets_flow_node_complete() {
    let engine = engine();
    engine.connectors().register(
        "crm-lookup",
        Arc::new(|_: Variables| -> anyhow::Result<Variables> { Err(anyhow::anyhow!("crm unavailable")) }),
    );
    let runtime = engine.runtime();
    runtime.deploy(connector_process(FailAction::Ignore)).await.unwrap();
    let process = runtime.start_process("enrich", None, Variables::new()).await.unwrap();
    engine.run_until_idle().await.unwrap();

    assert_eq!(state_of(&engine, &process.id).await, ("Completed".to_string(), true));
    assert_eq!(variable(&engine, &process.id, "tier").await, serde_json::Value::Null);
}

#[tokio::test]
async fn test_unregistered_connector_fails_flow_node() {
    let engine = engine();
    let runtime = engine.runtime();
    runtime.deploy(connector_process(FailAction::Fail)).await.unwrap();
    let process = runtime.start_process("enrich", None, Variables::new()).await.unwrap();
    engine.run_until_idle().await.unwrap();

    assert_eq!(active_node(&engine, &process.id, "lookup").await.state_id, StateId::FAILED);
}

#[tokio::test]
async fn test_only_one_interrupting_boundary_wins() {
    let engine = engine();
    let runtime = engine.runtime();
    let mut definition = ProcessDefinition::new("race", "1.0")
        .with_flow_node(node("start", FlowNodeType::StartEvent))
        .with_flow_node(node("review", FlowNodeType::UserTask).with_actor(john()))
        .with_flow_node(node("done", FlowNodeType::EndEvent))
        .with_transition("start", "review")
        .with_transition("review", "done");
    for id in ["first", "second"] {
        definition = definition
            .with_flow_node(FlowNodeDefinition::boundary(
                id,
                id,
                "review",
                true,
                EventTrigger::Signal("stop".to_string()),
            ))
            .with_flow_node(node(&format!("{}-end", id), FlowNodeType::EndEvent))
            .with_transition(id, &format!("{}-end", id));
    }
    runtime.deploy(definition).await.unwrap();
    let process = runtime.start_process("race", None, Variables::new()).await.unwrap();
    engine.run_until_idle().await.unwrap();

    assert_eq!(runtime.send_signal("stop").await.unwrap(), 2);
    engine.run_until_idle().await.unwrap();

    assert_eq!(state_of(&engine, &process.id).await, ("Completed".to_string(), true));
    let mut outcomes = Vec::new();
    for id in ["first", "second"] {
        outcomes.push(archived(&engine, &process.id, id).await[0].state_id);
    }
    assert_eq!(outcomes.iter().filter(|s| **s == StateId::COMPLETED).count(), 1);
    assert_eq!(outcomes.iter().filter(|s| **s == StateId::CANCELLED).count(), 1);

    let escalations = archived(&engine, &process.id, "first-end").await.len()
        + archived(&engine, &process.id, "second-end").await.len();
    assert_eq!(escalations, 1);
    assert_eq!(archived(&engine, &process.id, "review").await[0].state_id, StateId::ABORTED);
}

#[tokio::test]
async fn test_cancellation_reaches_multi_instance_children() {
    let engine = engine();
    let runtime = engine.runtime();
    runtime
        .deploy(
            ProcessDefinition::new("panel", "1.0")
                .with_flow_node(node("start", FlowNodeType::StartEvent))
                .with_flow_node(node("vote", FlowNodeType::UserTask).with_actor(john()).with_loop(
                    LoopCharacteristics::MultiInstance(MultiInstanceLoop::with_cardinality(
                        false,
                        Expression::constant(json!(2)),
                    )),
                ))
                .with_transition("start", "vote"),
        )
        .await
        .unwrap();
    let process = runtime.start_process("panel", None, Variables::new()).await.unwrap();
    engine.run_until_idle().await.unwrap();

    runtime.cancel_process(&process.id).await.unwrap();
    engine.run_until_idle().await.unwrap();

    assert_eq!(state_of(&engine, &process.id).await, ("Cancelled".to_string(), true));
    let votes = archived(&engine, &process.id, "vote").await;
    assert_eq!(votes.len(), 3);
    assert!(votes.iter().all(|n| n.state_id == StateId::CANCELLED));
}

#[tokio::test]
async fn test_duplicate_child_notification_is_ignored() {
    let engine = engine();
    let runtime = engine.runtime();
    runtime
        .deploy(
            ProcessDefinition::new("pair", "1.0")
                .with_flow_node(node("start", FlowNodeType::StartEvent))
                .with_flow_node(node("vote", FlowNodeType::UserTask).with_actor(john()).with_loop(
                    LoopCharacteristics::MultiInstance(MultiInstanceLoop::with_cardinality(
                        false,
                        Expression::constant(json!(2)),
                    )),
                ))
                .with_transition("start", "vote"),
        )
        .await
        .unwrap();
    let process = runtime.start_process("pair", None, Variables::new()).await.unwrap();
    engine.run_until_idle().await.unwrap();

    let first = runtime
        .active_flow_nodes(&process.id)
        .await
        .unwrap()
        .into_iter()
        .find(|n| n.role == InstanceRole::Iteration)
        .unwrap();
    runtime.execute_user_task(&first.id, "john").await.unwrap();
    engine.run_until_idle().await.unwrap();

    let finished = archived(&engine, &process.id, "vote").await.remove(0);
    let container_id = finished.parent_activity_id.clone().unwrap();
    engine
        .executor()
        .notify_child_finished(&container_id, &FinishedChild::flow_node(&finished, ChildOutcome::Completed))
        .await
        .unwrap();
    engine.run_until_idle().await.unwrap();

    let container = runtime
        .active_flow_nodes(&process.id)
        .await
        .unwrap()
        .into_iter()
        .find(|n| n.id == container_id)
        .unwrap();
    assert_eq!(container.state_id, StateId::EXECUTING);
    assert_eq!(container.multi_instance.completed, 1);
    assert_eq!(container.multi_instance.active, 1);
    assert_eq!(container.token_count, 1);
}
