//! Immutable process model consumed by the engine.
//!
//! Definitions are constructed with plain constructors and `with_*`
//! methods. They are never mutated by the runtime and are referenced by id
//! from instances.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use crate::{CoreError, CoreResult};

/// Value object: Process definition ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessDefinitionId(pub String);

/// Value object: Flow node definition ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FlowNodeDefinitionId(pub String);

impl From<&str> for FlowNodeDefinitionId {
    fn from(id: &str) -> Self {
        FlowNodeDefinitionId(id.to_string())
    }
}

/// Value object: Transition ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransitionId(pub String);

/// Language an expression is written in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExpressionLanguage {
    /// JMESPath evaluated against the expression context
    JmesPath,
    /// A JSON literal
    Constant,
}

/// An expression evaluated by the [`ExpressionEvaluator`](crate::domain::expression::ExpressionEvaluator)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Expression {
    /// The expression source
    pub content: String,

    /// The language of `content`
    pub language: ExpressionLanguage,
}

impl Expression {
    /// A JMESPath expression
    pub fn jmespath<S: Into<String>>(content: S) -> Self {
        Self {
            content: content.into(),
            language: ExpressionLanguage::JmesPath,
        }
    }

    /// A constant JSON value
    pub fn constant(value: serde_json::Value) -> Self {
        Self {
            content: value.to_string(),
            language: ExpressionLanguage::Constant,
        }
    }
}

/// Assigns the result of an expression to a variable
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    /// Variable receiving the value
    pub target_variable: String,

    /// Expression producing the value
    pub expression: Expression,
}

impl Operation {
    /// Create an assignment operation
    pub fn assign<S: Into<String>>(target_variable: S, expression: Expression) -> Self {
        Self {
            target_variable: target_variable.into(),
            expression,
        }
    }
}

/// A variable declared by a process or a flow node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataDefinition {
    /// Variable name
    pub name: String,

    /// Initial value, `null` when absent
    pub default_value: Option<Expression>,
}

impl DataDefinition {
    /// Declare a variable
    pub fn new<S: Into<String>>(name: S, default_value: Option<Expression>) -> Self {
        Self {
            name: name.into(),
            default_value,
        }
    }
}

/// When a connector runs relative to the flow node's own work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ConnectorEvent {
    /// Before the flow node does its work
    OnEnter,
    /// After the flow node did its work
    OnFinish,
}

/// What happens when a connector fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailAction {
    /// The flow node fails
    Fail,
    /// The failure is logged and the connector counts as done
    Ignore,
}

/// A connector attached to a flow node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectorDefinition {
    /// Name, unique within the flow node
    pub name: String,

    /// Implementation to run
    pub connector_id: String,

    /// On-enter or on-finish
    pub event: ConnectorEvent,

    /// Input expressions keyed by input name
    pub inputs: BTreeMap<String, Expression>,

    /// Operations run against the connector outputs
    pub outputs: Vec<Operation>,

    /// Failure policy
    pub fail_action: FailAction,
}

impl ConnectorDefinition {
    /// Create a connector definition that fails the flow node on error
    pub fn new<N: Into<String>, C: Into<String>>(
        name: N,
        connector_id: C,
        event: ConnectorEvent,
    ) -> Self {
        Self {
            name: name.into(),
            connector_id: connector_id.into(),
            event,
            inputs: BTreeMap::new(),
            outputs: Vec::new(),
            fail_action: FailAction::Fail,
        }
    }

    /// Add an input
    pub fn with_input<S: Into<String>>(mut self, name: S, expression: Expression) -> Self {
        self.inputs.insert(name.into(), expression);
        self
    }

    /// Add an output operation
    pub fn with_output(mut self, operation: Operation) -> Self {
        self.outputs.push(operation);
        self
    }

    /// Set the failure policy
    pub fn with_fail_action(mut self, fail_action: FailAction) -> Self {
        self.fail_action = fail_action;
        self
    }
}

/// Gateway behaviour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GatewayType {
    /// Fork to every branch, join all incoming branches
    Parallel,
    /// Take the first matching branch, join on the first arrival
    Exclusive,
    /// Take every matching branch, join all incoming branches
    Inclusive,
}

/// Type of a node in the process model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FlowNodeType {
    /// Task run entirely by the engine
    AutomaticTask,
    /// Task performed by a user
    UserTask,
    /// Task performed by a user outside the engine
    ManualTask,
    /// Task waiting for a message
    ReceiveTask,
    /// Task sending a message
    SendTask,
    /// Activity starting another process
    CallActivity,
    /// Activity running an embedded process
    SubProcess,
    /// Gateway
    Gateway(GatewayType),
    /// Start event
    StartEvent,
    /// End event
    EndEvent,
    /// Intermediate catch event
    IntermediateCatchEvent,
    /// Intermediate throw event
    IntermediateThrowEvent,
    /// Event attached to an activity
    BoundaryEvent,
}

impl FlowNodeType {
    /// Whether nodes of this type may carry loop characteristics and boundary events
    pub fn is_activity(self) -> bool {
        matches!(
            self,
            FlowNodeType::AutomaticTask
                | FlowNodeType::UserTask
                | FlowNodeType::ManualTask
                | FlowNodeType::ReceiveTask
                | FlowNodeType::SendTask
                | FlowNodeType::CallActivity
                | FlowNodeType::SubProcess
        )
    }
}

/// What an event waits for or throws
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventTrigger {
    /// No trigger
    None,
    /// Named message
    Message(String),
    /// Broadcast signal
    Signal(String),
    /// Timer, in milliseconds
    Timer(u64),
    /// Ends the whole process instance
    Terminate,
}

/// Standard loop configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StandardLoop {
    /// Loop continues while this is true; an absent condition is always true
    pub condition: Option<Expression>,

    /// Maximum number of iterations
    pub max: Option<Expression>,

    /// Evaluate the condition before the first iteration too
    pub test_before: bool,
}

/// Multi-instance configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiInstanceLoop {
    /// One instance at a time instead of all at once
    pub sequential: bool,

    /// Number of instances
    pub cardinality: Option<Expression>,

    /// Collection variable; one instance per element
    pub data_input: Option<String>,

    /// Local variable receiving the current element
    pub data_input_item: Option<String>,

    /// Collection variable receiving each instance's output item
    pub data_output: Option<String>,

    /// Local variable read from each instance when it completes
    pub data_output_item: Option<String>,

    /// Ends the fan-out early when true
    pub completion_condition: Option<Expression>,
}

impl MultiInstanceLoop {
    /// Multi-instance with a fixed cardinality expression
    pub fn with_cardinality(sequential: bool, cardinality: Expression) -> Self {
        Self {
            sequential,
            cardinality: Some(cardinality),
            data_input: None,
            data_input_item: None,
            data_output: None,
            data_output_item: None,
            completion_condition: None,
        }
    }

    /// Multi-instance iterating over a collection variable
    pub fn over_collection<S: Into<String>, I: Into<String>>(
        sequential: bool,
        data_input: S,
        data_input_item: I,
    ) -> Self {
        Self {
            sequential,
            cardinality: None,
            data_input: Some(data_input.into()),
            data_input_item: Some(data_input_item.into()),
            data_output: None,
            data_output_item: None,
            completion_condition: None,
        }
    }

    /// Collect each instance's `item` into `collection`
    pub fn collecting<S: Into<String>, I: Into<String>>(mut self, collection: S, item: I) -> Self {
        self.data_output = Some(collection.into());
        self.data_output_item = Some(item.into());
        self
    }

    /// Set the completion condition
    pub fn until(mut self, completion_condition: Expression) -> Self {
        self.completion_condition = Some(completion_condition);
        self
    }
}

/// Loop characteristics of an activity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoopCharacteristics {
    /// Runs once
    None,
    /// Re-executes while a condition holds
    StandardLoop(StandardLoop),
    /// Fans out into several instances
    MultiInstance(MultiInstanceLoop),
}

/// Process started by a call activity or sub-process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallTarget {
    /// Resolved at runtime from the callable element (process name) and optional version
    Expression {
        /// Evaluates to the name of the process to start
        callable_element: Option<Expression>,
        /// Evaluates to the version; latest deployed when absent
        version: Option<Expression>,
    },
    /// A process definition known when the model is built
    Embedded(ProcessDefinitionId),
}

/// Call activity and sub-process configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallActivityDefinition {
    /// Process to start
    pub target: CallTarget,

    /// Evaluated in the caller's context, assigned in the child process
    pub data_input_operations: Vec<Operation>,

    /// Evaluated in the child process's context, assigned in the caller
    pub data_output_operations: Vec<Operation>,
}

impl CallActivityDefinition {
    /// Call the process named by `callable_element`
    pub fn calling(callable_element: Expression) -> Self {
        Self {
            target: CallTarget::Expression {
                callable_element: Some(callable_element),
                version: None,
            },
            data_input_operations: Vec::new(),
            data_output_operations: Vec::new(),
        }
    }

    /// Run an embedded process definition
    pub fn embedded(definition_id: ProcessDefinitionId) -> Self {
        Self {
            target: CallTarget::Embedded(definition_id),
            data_input_operations: Vec::new(),
            data_output_operations: Vec::new(),
        }
    }

    /// Add a data input operation
    pub fn with_input(mut self, operation: Operation) -> Self {
        self.data_input_operations.push(operation);
        self
    }

    /// Add a data output operation
    pub fn with_output(mut self, operation: Operation) -> Self {
        self.data_output_operations.push(operation);
        self
    }
}

/// A node of the process model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowNodeDefinition {
    /// ID of the node, unique within its process
    pub id: FlowNodeDefinitionId,

    /// Human-readable name
    pub name: String,

    /// Node type
    pub node_type: FlowNodeType,

    /// Loop characteristics (activities only)
    pub loop_characteristics: LoopCharacteristics,

    /// Activity this boundary event is attached to
    pub attached_to: Option<FlowNodeDefinitionId>,

    /// Whether this boundary event interrupts the activity it is attached to
    pub interrupting: bool,

    /// Event trigger (events and receive/send tasks)
    pub event_trigger: EventTrigger,

    /// Connectors run around the node's work
    pub connectors: Vec<ConnectorDefinition>,

    /// Operations run when the node does its work
    pub operations: Vec<Operation>,

    /// Local variables
    pub data: Vec<DataDefinition>,

    /// Evaluates to the user a human task is assigned to
    pub actor: Option<Expression>,

    /// Call activity / sub-process configuration
    pub call: Option<CallActivityDefinition>,
}

impl FlowNodeDefinition {
    /// Create a node definition
    pub fn new<I: Into<FlowNodeDefinitionId>, N: Into<String>>(
        id: I,
        name: N,
        node_type: FlowNodeType,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            node_type,
            loop_characteristics: LoopCharacteristics::None,
            attached_to: None,
            interrupting: true,
            event_trigger: EventTrigger::None,
            connectors: Vec::new(),
            operations: Vec::new(),
            data: Vec::new(),
            actor: None,
            call: None,
        }
    }

    /// Create a boundary event attached to `activity`
    pub fn boundary<I: Into<FlowNodeDefinitionId>, N: Into<String>>(
        id: I,
        name: N,
        activity: &str,
        interrupting: bool,
        trigger: EventTrigger,
    ) -> Self {
        let mut definition = Self::new(id, name, FlowNodeType::BoundaryEvent);
        definition.attached_to = Some(FlowNodeDefinitionId(activity.to_string()));
        definition.interrupting = interrupting;
        definition.event_trigger = trigger;
        definition
    }

    /// Set the loop characteristics
    pub fn with_loop(mut self, loop_characteristics: LoopCharacteristics) -> Self {
        self.loop_characteristics = loop_characteristics;
        self
    }

    /// Add a connector
    pub fn with_connector(mut self, connector: ConnectorDefinition) -> Self {
        self.connectors.push(connector);
        self
    }

    /// Add an operation
    pub fn with_operation(mut self, operation: Operation) -> Self {
        self.operations.push(operation);
        self
    }

    /// Declare a local variable
    pub fn with_data(mut self, data: DataDefinition) -> Self {
        self.data.push(data);
        self
    }

    /// Set the actor expression
    pub fn with_actor(mut self, actor: Expression) -> Self {
        self.actor = Some(actor);
        self
    }

    /// Set the event trigger
    pub fn with_trigger(mut self, trigger: EventTrigger) -> Self {
        self.event_trigger = trigger;
        self
    }

    /// Set the call activity configuration
    pub fn with_call(mut self, call: CallActivityDefinition) -> Self {
        self.call = Some(call);
        self
    }

    /// Connectors bound to `event`, in declaration order
    pub fn connectors_for(&self, event: ConnectorEvent) -> impl Iterator<Item = &ConnectorDefinition> {
        self.connectors.iter().filter(move |c| c.event == event)
    }

    /// Connector definition by name
    pub fn connector(&self, name: &str) -> Option<&ConnectorDefinition> {
        self.connectors.iter().find(|c| c.name == name)
    }
}

/// A sequence flow between two nodes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    /// ID of the transition
    pub id: TransitionId,

    /// Source node
    pub source: FlowNodeDefinitionId,

    /// Target node
    pub target: FlowNodeDefinitionId,

    /// Taken only when true (exclusive and inclusive gateways)
    pub condition: Option<Expression>,

    /// Taken when no conditional transition matched
    pub is_default: bool,
}

/// Represents an immutable process model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessDefinition {
    /// ID of the process definition
    pub id: ProcessDefinitionId,

    /// Name, used by call activities to resolve their target
    pub name: String,

    /// Version
    pub version: String,

    /// Nodes
    pub flow_nodes: Vec<FlowNodeDefinition>,

    /// Sequence flows
    pub transitions: Vec<Transition>,

    /// Process variables
    pub data: Vec<DataDefinition>,
}

impl ProcessDefinition {
    /// Create an empty process definition
    pub fn new<N: Into<String>, V: Into<String>>(name: N, version: V) -> Self {
        Self {
            id: ProcessDefinitionId(uuid::Uuid::new_v4().to_string()),
            name: name.into(),
            version: version.into(),
            flow_nodes: Vec::new(),
            transitions: Vec::new(),
            data: Vec::new(),
        }
    }

    /// Add a node
    pub fn with_flow_node(mut self, flow_node: FlowNodeDefinition) -> Self {
        self.flow_nodes.push(flow_node);
        self
    }

    /// Add an unconditional transition
    pub fn with_transition(self, source: &str, target: &str) -> Self {
        self.with_conditional_transition(source, target, None, false)
    }

    /// Add a transition with an optional condition, or the default transition
    pub fn with_conditional_transition(
        mut self,
        source: &str,
        target: &str,
        condition: Option<Expression>,
        is_default: bool,
    ) -> Self {
        let id = TransitionId(format!("{}->{}", source, target));
        self.transitions.push(Transition {
            id,
            source: FlowNodeDefinitionId(source.to_string()),
            target: FlowNodeDefinitionId(target.to_string()),
            condition,
            is_default,
        });
        self
    }

    /// Declare a process variable
    pub fn with_data(mut self, data: DataDefinition) -> Self {
        self.data.push(data);
        self
    }

    /// Node definition by id
    pub fn flow_node(&self, id: &FlowNodeDefinitionId) -> CoreResult<&FlowNodeDefinition> {
        self.flow_nodes.iter().find(|n| &n.id == id).ok_or_else(|| {
            CoreError::definition(format!(
                "Flow node {} is not part of process {} ({})",
                id.0, self.name, self.version
            ))
        })
    }

    /// Transitions leaving `id`
    pub fn outgoing(&self, id: &FlowNodeDefinitionId) -> Vec<&Transition> {
        self.transitions.iter().filter(|t| &t.source == id).collect()
    }

    /// Transitions entering `id`
    pub fn incoming(&self, id: &FlowNodeDefinitionId) -> Vec<&Transition> {
        self.transitions.iter().filter(|t| &t.target == id).collect()
    }

    /// Number of transitions entering `id`
    pub fn incoming_count(&self, id: &FlowNodeDefinitionId) -> usize {
        self.incoming(id).len()
    }

    /// Whether a token on `from` can still arrive at `to`, following
    /// transitions and the boundary events of the nodes on the way
    pub fn can_reach(&self, from: &FlowNodeDefinitionId, to: &FlowNodeDefinitionId) -> bool {
        let mut seen = HashSet::new();
        let mut pending = vec![from];
        while let Some(current) = pending.pop() {
            if !seen.insert(current) {
                continue;
            }
            for transition in self.outgoing(current) {
                if &transition.target == to {
                    return true;
                }
                pending.push(&transition.target);
            }
            pending.extend(self.boundary_events_of(current).into_iter().map(|b| &b.id));
        }
        false
    }

    /// Boundary events attached to `activity`
    pub fn boundary_events_of(&self, activity: &FlowNodeDefinitionId) -> Vec<&FlowNodeDefinition> {
        self.flow_nodes
            .iter()
            .filter(|n| n.attached_to.as_ref() == Some(activity))
            .collect()
    }

    /// Nodes started with the process: start events, or every node without
    /// incoming transitions when the model declares no start event.
    pub fn start_nodes(&self) -> Vec<&FlowNodeDefinition> {
        let start_events: Vec<_> = self
            .flow_nodes
            .iter()
            .filter(|n| n.node_type == FlowNodeType::StartEvent)
            .collect();
        if !start_events.is_empty() {
            return start_events;
        }
        self.flow_nodes
            .iter()
            .filter(|n| n.node_type != FlowNodeType::BoundaryEvent)
            .filter(|n| self.incoming_count(&n.id) == 0)
            .collect()
    }
}
