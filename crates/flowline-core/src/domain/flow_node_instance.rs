use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

use crate::domain::process_definition::{
    FlowNodeDefinition, FlowNodeDefinitionId, FlowNodeType, LoopCharacteristics,
    ProcessDefinitionId, TransitionId,
};
use crate::state::StateId;

/// Value object: Flow node instance ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FlowNodeInstanceId(pub String);

impl FlowNodeInstanceId {
    /// Generate a fresh id
    pub fn generate() -> Self {
        FlowNodeInstanceId(Uuid::new_v4().to_string())
    }
}

impl fmt::Display for FlowNodeInstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Value object: Process instance ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProcessInstanceId(pub String);

impl ProcessInstanceId {
    /// Generate a fresh id
    pub fn generate() -> Self {
        ProcessInstanceId(Uuid::new_v4().to_string())
    }
}

impl fmt::Display for ProcessInstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Subtree-wide execution mode, propagated top-down
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StateCategory {
    /// Ordinary execution
    Normal,
    /// An interrupting event is unwinding the subtree
    Aborting,
    /// A deliberate cancel is unwinding the subtree
    Cancelling,
}

/// Runtime type of a flow node instance.
///
/// Same as the definition type, except that activities with loop
/// characteristics are instantiated as loop or multi-instance containers
/// whose iteration children carry the plain type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FlowNodeKind {
    /// Automatic task
    AutomaticTask,
    /// User task
    UserTask,
    /// Manual task
    ManualTask,
    /// Receive task
    ReceiveTask,
    /// Send task
    SendTask,
    /// Call activity
    CallActivity,
    /// Sub-process
    SubProcess,
    /// Standard loop container
    LoopActivity,
    /// Multi-instance container
    MultiInstanceActivity,
    /// Gateway
    Gateway,
    /// Start event
    StartEvent,
    /// End event
    EndEvent,
    /// Intermediate catch event
    IntermediateCatchEvent,
    /// Intermediate throw event
    IntermediateThrowEvent,
    /// Boundary event
    BoundaryEvent,
}

impl FlowNodeKind {
    /// Kind of the instance created for `definition` at process level
    pub fn for_definition(definition: &FlowNodeDefinition) -> Self {
        match definition.loop_characteristics {
            LoopCharacteristics::StandardLoop(_) => FlowNodeKind::LoopActivity,
            LoopCharacteristics::MultiInstance(_) => FlowNodeKind::MultiInstanceActivity,
            LoopCharacteristics::None => Self::for_iteration(definition),
        }
    }

    /// Kind of the instance created for `definition` inside a loop or multi-instance container
    pub fn for_iteration(definition: &FlowNodeDefinition) -> Self {
        match definition.node_type {
            FlowNodeType::AutomaticTask => FlowNodeKind::AutomaticTask,
            FlowNodeType::UserTask => FlowNodeKind::UserTask,
            FlowNodeType::ManualTask => FlowNodeKind::ManualTask,
            FlowNodeType::ReceiveTask => FlowNodeKind::ReceiveTask,
            FlowNodeType::SendTask => FlowNodeKind::SendTask,
            FlowNodeType::CallActivity => FlowNodeKind::CallActivity,
            FlowNodeType::SubProcess => FlowNodeKind::SubProcess,
            FlowNodeType::Gateway(_) => FlowNodeKind::Gateway,
            FlowNodeType::StartEvent => FlowNodeKind::StartEvent,
            FlowNodeType::EndEvent => FlowNodeKind::EndEvent,
            FlowNodeType::IntermediateCatchEvent => FlowNodeKind::IntermediateCatchEvent,
            FlowNodeType::IntermediateThrowEvent => FlowNodeKind::IntermediateThrowEvent,
            FlowNodeType::BoundaryEvent => FlowNodeKind::BoundaryEvent,
        }
    }

    /// Whether the kind is a human task
    pub fn is_human_task(self) -> bool {
        matches!(self, FlowNodeKind::UserTask | FlowNodeKind::ManualTask)
    }
}

/// How an instance relates to its parent activity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceRole {
    /// Child of the process instance
    Standalone,
    /// One iteration of a loop or multi-instance container
    Iteration,
    /// Boundary event of the parent activity
    Boundary,
}

/// Counters of a multi-instance container
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiInstanceCounters {
    /// Total number of instances to run
    pub number_of_instances: u32,
    /// Instances created and not finished yet
    pub active: u32,
    /// Instances that completed
    pub completed: u32,
    /// Instances that were aborted or cancelled
    pub terminated: u32,
}

impl MultiInstanceCounters {
    /// Instances that reached a terminal state
    pub fn finished(&self) -> u32 {
        self.completed + self.terminated
    }
}

/// Aggregate: runtime state of one flow node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowNodeInstance {
    /// Unique identifier
    pub id: FlowNodeInstanceId,

    /// Node definition
    pub definition_id: FlowNodeDefinitionId,

    /// Process definition the node belongs to
    pub process_definition_id: ProcessDefinitionId,

    /// Name copied from the definition
    pub name: String,

    /// Runtime type
    pub kind: FlowNodeKind,

    /// Relationship with the parent activity
    pub role: InstanceRole,

    /// Current state
    pub state_id: StateId,

    /// The current state returned `Executing` (or was just entered) and must be re-run
    pub state_executing: bool,

    /// Interrupt flag
    pub state_category: StateCategory,

    /// Active direct children / pending continuations
    pub token_count: i64,

    /// Containers: iterations done so far. Iterations: their index.
    pub loop_counter: u32,

    /// Maximum iterations of a standard loop
    pub loop_max: Option<u32>,

    /// Multi-instance counters
    pub multi_instance: MultiInstanceCounters,

    /// Incoming transitions that reached this gateway
    pub gateway_hits: BTreeSet<TransitionId>,

    /// User a human task is assigned to
    pub assignee: Option<String>,

    /// Loop/multi-instance container or activity a boundary event is attached to
    pub parent_activity_id: Option<FlowNodeInstanceId>,

    /// Process instance the node runs in
    pub parent_process_instance_id: ProcessInstanceId,

    /// Outermost process instance
    pub root_process_instance_id: ProcessInstanceId,

    /// Children whose completion was already counted
    pub finished_children: BTreeSet<String>,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last updated timestamp
    pub updated_at: DateTime<Utc>,
}

impl FlowNodeInstance {
    /// Create a standalone instance in its first state
    pub fn new(
        process_definition_id: ProcessDefinitionId,
        definition: &FlowNodeDefinition,
        kind: FlowNodeKind,
        first_state: StateId,
        parent_process_instance_id: ProcessInstanceId,
        root_process_instance_id: ProcessInstanceId,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: FlowNodeInstanceId::generate(),
            definition_id: definition.id.clone(),
            process_definition_id,
            name: definition.name.clone(),
            kind,
            role: InstanceRole::Standalone,
            state_id: first_state,
            state_executing: true,
            state_category: StateCategory::Normal,
            token_count: 0,
            loop_counter: 0,
            loop_max: None,
            multi_instance: MultiInstanceCounters::default(),
            gateway_hits: BTreeSet::new(),
            assignee: None,
            parent_activity_id: None,
            parent_process_instance_id,
            root_process_instance_id,
            finished_children: BTreeSet::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Attach the instance to a parent activity
    pub fn with_parent_activity(
        mut self,
        parent: &FlowNodeInstanceId,
        role: InstanceRole,
        loop_counter: u32,
    ) -> Self {
        self.parent_activity_id = Some(parent.clone());
        self.role = role;
        self.loop_counter = loop_counter;
        self
    }

    /// Update the timestamp
    #[inline]
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// How a child ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChildOutcome {
    /// Completed normally
    Completed,
    /// Aborted by an interrupting event
    Aborted,
    /// Cancelled
    Cancelled,
}

/// A child (flow node or called process) that reached a terminal state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinishedChild {
    /// Flow node instance id or process instance id of the child
    pub id: String,

    /// How it ended
    pub outcome: ChildOutcome,

    /// Relationship with the parent
    pub role: InstanceRole,

    /// Iteration index for loop and multi-instance children
    pub loop_counter: u32,
}

impl FinishedChild {
    /// Describe a finished flow node
    pub fn flow_node(instance: &FlowNodeInstance, outcome: ChildOutcome) -> Self {
        Self {
            id: instance.id.0.clone(),
            outcome,
            role: instance.role,
            loop_counter: instance.loop_counter,
        }
    }

    /// Describe a finished called process
    pub fn process(id: &ProcessInstanceId, outcome: ChildOutcome) -> Self {
        Self {
            id: id.0.clone(),
            outcome,
            role: InstanceRole::Standalone,
            loop_counter: 0,
        }
    }
}

/// Counters of a parent right after a child completion was recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildTally {
    /// False when this child had already been counted
    pub counted: bool,

    /// Token count after the update
    pub token_count: i64,

    /// Multi-instance counters after the update
    pub multi_instance: MultiInstanceCounters,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::process_definition::{MultiInstanceLoop, StandardLoop, Expression};

    #[test]
    fn test_kind_for_definition() {
        let task = FlowNodeDefinition::new("t", "T", FlowNodeType::UserTask);
        assert_eq!(FlowNodeKind::for_definition(&task), FlowNodeKind::UserTask);

        let looping = task.clone().with_loop(LoopCharacteristics::StandardLoop(StandardLoop {
            condition: None,
            max: Some(Expression::constant(serde_json::json!(3))),
            test_before: false,
        }));
        assert_eq!(FlowNodeKind::for_definition(&looping), FlowNodeKind::LoopActivity);
        assert_eq!(FlowNodeKind::for_iteration(&looping), FlowNodeKind::UserTask);

        let fan_out = task.with_loop(LoopCharacteristics::MultiInstance(
            MultiInstanceLoop::with_cardinality(false, Expression::constant(serde_json::json!(2))),
        ));
        assert_eq!(
            FlowNodeKind::for_definition(&fan_out),
            FlowNodeKind::MultiInstanceActivity
        );
    }

    #[test]
    fn test_new_instance_starts_executing_in_normal_category() {
        let definition = FlowNodeDefinition::new("t", "T", FlowNodeType::AutomaticTask);
        let process = ProcessInstanceId::generate();
        let instance = FlowNodeInstance::new(
            ProcessDefinitionId("p".into()),
            &definition,
            FlowNodeKind::AutomaticTask,
            StateId::INITIALIZING,
            process.clone(),
            process,
        );
        assert!(instance.state_executing);
        assert_eq!(instance.state_category, StateCategory::Normal);
        assert_eq!(instance.role, InstanceRole::Standalone);
        assert_eq!(instance.token_count, 0);
    }

    #[test]
    fn test_multi_instance_finished() {
        let counters = MultiInstanceCounters {
            number_of_instances: 3,
            active: 1,
            completed: 1,
            terminated: 1,
        };
        assert_eq!(counters.finished(), 2);
    }
}
