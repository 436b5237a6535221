use serde_json::json;
use std::time::Duration;

use flowline_core::{
    EngineConfig, Expression, FlowNodeDefinition, FlowNodeType, GatewayType, InstanceRole, LoopCharacteristics,
    MultiInstanceLoop, ProcessDefinition, StateId, Variables,
};
use flowline_state_inmemory::{init_tracing, InMemoryEngine};

fn wide_process(branches: usize) -> ProcessDefinition {
    let mut definition = ProcessDefinition::new("wide", "1.0")
        .with_flow_node(FlowNodeDefinition::new("start", "Start", FlowNodeType::StartEvent))
        .with_flow_node(FlowNodeDefinition::new(
            "fork",
            "Fork",
            FlowNodeType::Gateway(GatewayType::Parallel),
        ))
        .with_flow_node(FlowNodeDefinition::new(
            "join",
            "Join",
            FlowNodeType::Gateway(GatewayType::Parallel),
        ))
        .with_flow_node(FlowNodeDefinition::new("end", "End", FlowNodeType::EndEvent))
        .with_transition("start", "fork")
        .with_transition("join", "end");
    for branch in 0..branches {
        let id = format!("branch-{}", branch);
        definition = definition
            .with_flow_node(FlowNodeDefinition::new(id.as_str(), id.as_str(), FlowNodeType::AutomaticTask))
            .with_transition("fork", &id)
            .with_transition(&id, "join");
    }
    definition
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_workers_join_concurrent_branches_once() {
    init_tracing("warn");

    let config = EngineConfig {
        worker_count: 4,
        idle_poll_ms: 5,
        ..EngineConfig::default()
    };
    let engine = InMemoryEngine::new(config).unwrap();
    let runtime = engine.runtime();
    runtime.deploy(wide_process(12)).await.unwrap();

    let workers = engine.start_workers();
    let mut processes = Vec::new();
    for _ in 0..5 {
        processes.push(runtime.start_process("wide", None, Variables::new()).await.unwrap());
    }
    assert!(workers.wait_idle(Duration::from_secs(10)).await);
    workers.shutdown().await;

    for process in &processes {
        let summary = runtime.process_summary(&process.id).await.unwrap().unwrap();
        assert_eq!(summary.state, "Completed");
        assert!(summary.archived);

        let nodes = runtime.archived_flow_nodes(&process.id).await.unwrap();
        let joins: Vec<_> = nodes.iter().filter(|n| n.definition_id.0 == "join").collect();
        assert_eq!(joins.len(), 1);
        assert_eq!(joins[0].gateway_hits.len(), 12);
        assert_eq!(nodes.iter().filter(|n| n.definition_id.0 == "end").count(), 1);
    }
    assert!(runtime.list_active_processes().await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_workers_count_parallel_instances_exactly() {
    let config = EngineConfig {
        worker_count: 4,
        idle_poll_ms: 5,
        ..EngineConfig::default()
    };
    let engine = InMemoryEngine::new(config).unwrap();
    let runtime = engine.runtime();
    runtime
        .deploy(
            ProcessDefinition::new("fan-out", "1.0")
                .with_flow_node(FlowNodeDefinition::new("start", "Start", FlowNodeType::StartEvent))
                .with_flow_node(
                    FlowNodeDefinition::new("work", "Work", FlowNodeType::AutomaticTask).with_loop(
                        LoopCharacteristics::MultiInstance(MultiInstanceLoop::with_cardinality(
                            false,
                            Expression::constant(json!(20)),
                        )),
                    ),
                )
                .with_flow_node(FlowNodeDefinition::new("end", "End", FlowNodeType::EndEvent))
                .with_transition("start", "work")
                .with_transition("work", "end"),
        )
        .await
        .unwrap();

    let workers = engine.start_workers();
    let process = runtime.start_process("fan-out", None, Variables::new()).await.unwrap();
    assert!(workers.wait_idle(Duration::from_secs(10)).await);
    workers.shutdown().await;

    let nodes = runtime.archived_flow_nodes(&process.id).await.unwrap();
    let container = nodes
        .iter()
        .find(|n| n.definition_id.0 == "work" && n.role != InstanceRole::Iteration)
        .unwrap();
    assert_eq!(container.state_id, StateId::COMPLETED);
    assert_eq!(container.multi_instance.number_of_instances, 20);
    assert_eq!(container.multi_instance.completed, 20);
    assert_eq!(container.multi_instance.active, 0);
    assert_eq!(
        nodes
            .iter()
            .filter(|n| n.role == InstanceRole::Iteration && n.state_id == StateId::COMPLETED)
            .count(),
        20
    );
}
