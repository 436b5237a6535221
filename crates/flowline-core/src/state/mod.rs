//! Flow node states
//!
//! Each flow node runs through an ordered chain of states picked by its
//! [`NodeFamily`] and its current [`StateCategory`]. A state decides whether
//! it has work to do, does it (possibly suspending on a connector), and
//! decides when a container may leave it after its children finished.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::domain::flow_node_instance::{
    ChildOutcome, FinishedChild, FlowNodeInstance, FlowNodeKind, StateCategory,
};
use crate::domain::process_definition::ProcessDefinition;
use crate::CoreResult;

/// Connector phase runners shared by connector-aware states
pub mod phase;

/// Automatic, human and catch activities
pub mod activity;

/// Standard loop containers
pub mod loop_activity;

/// Multi-instance containers
pub mod multi_instance;

/// Boundary events
pub mod boundary;

/// Call activities and sub-processes
pub mod call_activity;

/// Gateways, start, catch and throw events
pub mod event;

/// Aborting and cancelling states
pub mod interrupt;

/// Terminal states
pub mod terminal;

/// Identifier of a state within a node family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StateId(pub u16);

impl StateId {
    /// Data and connectors are being set up
    pub const INITIALIZING: StateId = StateId(0);
    /// The flow node does its work
    pub const EXECUTING: StateId = StateId(1);
    /// Finished normally
    pub const COMPLETED: StateId = StateId(2);
    /// An unrecoverable error occurred
    pub const FAILED: StateId = StateId(3);
    /// A human task waits for its user
    pub const READY: StateId = StateId(4);
    /// Waits for remaining boundary events to go away
    pub const COMPLETING: StateId = StateId(5);
    /// Waits for an event or for merging branches
    pub const WAITING: StateId = StateId(6);
    /// Unwinding after an interrupting event
    pub const ABORTING: StateId = StateId(7);
    /// Finished by an interrupting event
    pub const ABORTED: StateId = StateId(8);
    /// Unwinding after a cancel request
    pub const CANCELLING: StateId = StateId(9);
    /// Finished by a cancel request
    pub const CANCELLED: StateId = StateId(10);
    /// A call activity collects the results of its process
    pub const ENDING: StateId = StateId(11);

    /// Whether no further state follows
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StateId::COMPLETED | StateId::ABORTED | StateId::CANCELLED | StateId::FAILED
        )
    }

    /// How a flow node ending in this state ended
    pub fn outcome(self) -> Option<ChildOutcome> {
        match self {
            StateId::COMPLETED => Some(ChildOutcome::Completed),
            StateId::ABORTED => Some(ChildOutcome::Aborted),
            StateId::CANCELLED => Some(ChildOutcome::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Result of [`FlowNodeState::execute`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateCode {
    /// The state finished its work
    Done,
    /// Asynchronous work was scheduled; the state is re-entered when it completes
    Executing,
}

/// Group of flow node kinds sharing the same state chains
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeFamily {
    /// Automatic and send tasks
    AutomaticActivity,
    /// User and manual tasks
    HumanTask,
    /// Receive tasks and intermediate catch events
    CatchEvent,
    /// Call activities and sub-processes
    CallActivity,
    /// Standard loop containers
    StandardLoop,
    /// Multi-instance containers
    MultiInstance,
    /// Gateways
    Gateway,
    /// Start events
    StartEvent,
    /// End and intermediate throw events
    ThrowEvent,
    /// Boundary events
    BoundaryEvent,
}

impl NodeFamily {
    /// Every family
    pub const ALL: [NodeFamily; 10] = [
        NodeFamily::AutomaticActivity,
        NodeFamily::HumanTask,
        NodeFamily::CatchEvent,
        NodeFamily::CallActivity,
        NodeFamily::StandardLoop,
        NodeFamily::MultiInstance,
        NodeFamily::Gateway,
        NodeFamily::StartEvent,
        NodeFamily::ThrowEvent,
        NodeFamily::BoundaryEvent,
    ];

    /// Family of a flow node kind
    pub fn of(kind: FlowNodeKind) -> Self {
        match kind {
            FlowNodeKind::AutomaticTask | FlowNodeKind::SendTask => NodeFamily::AutomaticActivity,
            FlowNodeKind::UserTask | FlowNodeKind::ManualTask => NodeFamily::HumanTask,
            FlowNodeKind::ReceiveTask | FlowNodeKind::IntermediateCatchEvent => NodeFamily::CatchEvent,
            FlowNodeKind::CallActivity | FlowNodeKind::SubProcess => NodeFamily::CallActivity,
            FlowNodeKind::LoopActivity => NodeFamily::StandardLoop,
            FlowNodeKind::MultiInstanceActivity => NodeFamily::MultiInstance,
            FlowNodeKind::Gateway => NodeFamily::Gateway,
            FlowNodeKind::StartEvent => NodeFamily::StartEvent,
            FlowNodeKind::EndEvent | FlowNodeKind::IntermediateThrowEvent => NodeFamily::ThrowEvent,
            FlowNodeKind::BoundaryEvent => NodeFamily::BoundaryEvent,
        }
    }
}

const ACTIVITY: &[StateId] = &[
    StateId::INITIALIZING,
    StateId::EXECUTING,
    StateId::COMPLETING,
    StateId::COMPLETED,
];
const HUMAN_TASK: &[StateId] = &[
    StateId::INITIALIZING,
    StateId::READY,
    StateId::EXECUTING,
    StateId::COMPLETING,
    StateId::COMPLETED,
];
const CATCH: &[StateId] = &[
    StateId::INITIALIZING,
    StateId::WAITING,
    StateId::EXECUTING,
    StateId::COMPLETING,
    StateId::COMPLETED,
];
const CALL: &[StateId] = &[
    StateId::INITIALIZING,
    StateId::EXECUTING,
    StateId::ENDING,
    StateId::COMPLETING,
    StateId::COMPLETED,
];
const BOUNDARY: &[StateId] = &[
    StateId::INITIALIZING,
    StateId::WAITING,
    StateId::EXECUTING,
    StateId::COMPLETED,
];
const GATEWAY: &[StateId] = &[StateId::WAITING, StateId::EXECUTING, StateId::COMPLETED];
const EVENT: &[StateId] = &[StateId::EXECUTING, StateId::COMPLETED];
const ABORTING: &[StateId] = &[StateId::ABORTING, StateId::ABORTED];
const CANCELLING: &[StateId] = &[StateId::CANCELLING, StateId::CANCELLED];

/// Ordered state ids a flow node of `family` runs through in `category`
pub fn chain(family: NodeFamily, category: StateCategory) -> &'static [StateId] {
    match category {
        StateCategory::Aborting => ABORTING,
        StateCategory::Cancelling => CANCELLING,
        StateCategory::Normal => match family {
            NodeFamily::AutomaticActivity | NodeFamily::StandardLoop | NodeFamily::MultiInstance => {
                ACTIVITY
            }
            NodeFamily::HumanTask => HUMAN_TASK,
            NodeFamily::CatchEvent => CATCH,
            NodeFamily::CallActivity => CALL,
            NodeFamily::BoundaryEvent => BOUNDARY,
            NodeFamily::Gateway => GATEWAY,
            NodeFamily::StartEvent | NodeFamily::ThrowEvent => EVENT,
        },
    }
}

/// State a new flow node of `kind` starts in
pub fn first_state_id(kind: FlowNodeKind) -> StateId {
    chain(NodeFamily::of(kind), StateCategory::Normal)[0]
}

/// Static properties of a state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateDescriptor {
    /// State id
    pub id: StateId,
    /// Human-readable name
    pub name: &'static str,
    /// The flow node stays here until woken up
    pub stable: bool,
    /// No state follows
    pub terminal: bool,
    /// Belongs to an aborting or cancelling chain
    pub interrupting: bool,
    /// Category of the chain the state belongs to
    pub category: StateCategory,
    /// Comment added to the process when a flow node enters the state
    pub system_comment: Option<&'static str>,
}

impl StateDescriptor {
    /// A transient state of the normal chain
    pub const fn normal(id: StateId, name: &'static str) -> Self {
        Self {
            id,
            name,
            stable: false,
            terminal: false,
            interrupting: false,
            category: StateCategory::Normal,
            system_comment: None,
        }
    }

    /// A stable state of the normal chain
    pub const fn stable(id: StateId, name: &'static str) -> Self {
        Self {
            stable: true,
            ..Self::normal(id, name)
        }
    }
}

/// Behaviour of a flow node while it is in one state
#[async_trait]
pub trait FlowNodeState: Send + Sync + fmt::Debug {
    /// Static properties
    fn descriptor(&self) -> &StateDescriptor;

    /// Whether the state has work to do; skipped otherwise.
    ///
    /// May act on the way (dispatch children, interrupt sub-activities),
    /// since it is re-evaluated when the flow node is driven again.
    async fn should_execute_state(
        &self,
        _process: &ProcessDefinition,
        _instance: &FlowNodeInstance,
    ) -> CoreResult<bool> {
        Ok(true)
    }

    /// Do the work of the state
    async fn execute(&self, process: &ProcessDefinition, instance: &FlowNodeInstance) -> CoreResult<StateCode>;

    /// Account for a finished child; true when the parent may leave this state
    async fn notify_child_flow_node_has_finished(
        &self,
        process: &ProcessDefinition,
        parent: &FlowNodeInstance,
        child: &FinishedChild,
    ) -> CoreResult<bool>;

    /// Whether a stable state may be left right away, given the counters of `instance`
    async fn completion_reached(&self, _process: &ProcessDefinition, _instance: &FlowNodeInstance) -> CoreResult<bool> {
        Ok(false)
    }

    /// State id
    fn id(&self) -> StateId {
        self.descriptor().id
    }

    /// Human-readable name
    fn name(&self) -> &'static str {
        self.descriptor().name
    }

    /// The flow node stays here until woken up
    fn is_stable(&self) -> bool {
        self.descriptor().stable
    }

    /// No state follows
    fn is_terminal(&self) -> bool {
        self.descriptor().terminal
    }

    /// Belongs to an aborting or cancelling chain
    fn is_interrupting(&self) -> bool {
        self.descriptor().interrupting
    }

    /// Category of the chain the state belongs to
    fn state_category(&self) -> StateCategory {
        self.descriptor().category
    }

    /// Whether entering the state adds a comment to the process
    fn must_add_system_comment(&self, _instance: &FlowNodeInstance) -> bool {
        self.descriptor().system_comment.is_some()
    }

    /// Comment added to the process
    fn system_comment(&self, instance: &FlowNodeInstance) -> String {
        format!(
            "{} '{}'",
            self.descriptor().system_comment.unwrap_or(self.name()),
            instance.name
        )
    }
}
