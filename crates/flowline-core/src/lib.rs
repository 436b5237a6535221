//!
//! Flowline Core - Flow node execution for the Flowline process engine
//!
//! This crate defines the process model, the flow node and process
//! instance records, the repository interfaces a state store implements,
//! and the state machine that moves flow nodes through their states.
//! Storage and work dispatch are supplied by other crates.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Domain layer - process model, instances, events and repository interfaces
pub mod domain;

/// Application services - the execution engine
pub mod application;

/// Flow node states
pub mod state;

/// Core types
pub mod types;

/// Error types
pub mod error;

/// Engine configuration
pub mod config;

// Re-export key types
pub use config::EngineConfig;
pub use error::{CoreError, CoreResult};
pub use types::{DataPacket, Variables};

// Application interfaces
pub use application::flow_node_executor::FlowNodeExecutor;
pub use application::process_executor::ProcessExecutor;
pub use application::runtime_interface::{ProcessInstanceSummary, RuntimeInterface};
pub use application::services::EngineServices;
pub use application::state_behaviors::StateBehaviors;
pub use application::state_manager::FlowNodeStateManager;
pub use application::work::{ConnectorExecutor, ConnectorRequest, WorkDispatcher, WorkItem};

// Re-export main API types for easy use
pub use domain::flow_node_instance::{
    ChildOutcome, FinishedChild, FlowNodeInstance, FlowNodeInstanceId, FlowNodeKind, InstanceRole,
    ProcessInstanceId, StateCategory,
};
pub use domain::process_definition::{
    CallActivityDefinition, ConnectorDefinition, ConnectorEvent, DataDefinition, EventTrigger,
    Expression, FailAction, FlowNodeDefinition, FlowNodeType, GatewayType, LoopCharacteristics,
    MultiInstanceLoop, Operation, ProcessDefinition, ProcessDefinitionId, StandardLoop,
};
pub use domain::process_instance::{ProcessInstance, ProcessState};
pub use domain::repository::{
    ConnectorInstanceRepository, DataInstanceRepository, EventSubscriptionRepository,
    FlowNodeInstanceRepository, ProcessDefinitionRepository, ProcessInstanceRepository,
};
pub use state::{FlowNodeState, NodeFamily, StateCode, StateId};
