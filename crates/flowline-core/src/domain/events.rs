use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::any::Any;
use std::fmt::Debug;

use crate::domain::flow_node_instance::{FlowNodeInstanceId, ProcessInstanceId};
use crate::domain::process_instance::ProcessState;
use crate::state::StateId;
use crate::CoreError;

/// Domain event trait for all events in the system
pub trait DomainEvent: Debug + Send + Sync {
    /// Returns the type of the event as a string
    fn event_type(&self) -> &'static str;

    /// Returns the process instance ID this event is associated with
    fn process_instance_id(&self) -> &ProcessInstanceId;

    /// Returns the flow node instance ID, for flow-node level events
    fn flow_node_instance_id(&self) -> Option<&FlowNodeInstanceId> {
        None
    }

    /// Returns the timestamp when the event occurred
    fn timestamp(&self) -> DateTime<Utc>;

    /// Access to the concrete event
    fn as_any(&self) -> &dyn Any;
}

/// Receives the audit trail of the engine
#[async_trait]
pub trait DomainEventHandler: Send + Sync {
    /// Handle a domain event
    async fn handle_event(&self, event: Box<dyn DomainEvent>) -> Result<(), CoreError>;
}

/// Event handler that only traces events
#[derive(Debug, Default)]
pub struct TracingEventHandler;

#[async_trait]
impl DomainEventHandler for TracingEventHandler {
    async fn handle_event(&self, event: Box<dyn DomainEvent>) -> Result<(), CoreError> {
        tracing::trace!(
            event_type = event.event_type(),
            process_instance = %event.process_instance_id(),
            "domain event"
        );
        Ok(())
    }
}

/// Event: Flow node entered a new state
#[derive(Debug)]
pub struct FlowNodeStateChanged {
    /// Process instance of the flow node
    pub process_instance_id: ProcessInstanceId,
    /// The flow node
    pub flow_node_instance_id: FlowNodeInstanceId,
    /// New state
    pub state_id: StateId,
    /// Name of the new state
    pub state_name: &'static str,
    /// The timestamp when the event occurred
    pub timestamp: DateTime<Utc>,
}

impl DomainEvent for FlowNodeStateChanged {
    fn event_type(&self) -> &'static str {
        "flow_node.state_changed"
    }

    fn process_instance_id(&self) -> &ProcessInstanceId {
        &self.process_instance_id
    }

    fn flow_node_instance_id(&self) -> Option<&FlowNodeInstanceId> {
        Some(&self.flow_node_instance_id)
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Event: Flow node moved to the failed state
#[derive(Debug)]
pub struct FlowNodeFailed {
    /// Process instance of the flow node
    pub process_instance_id: ProcessInstanceId,
    /// The flow node
    pub flow_node_instance_id: FlowNodeInstanceId,
    /// The error that failed the unit of work
    pub error: CoreError,
    /// The timestamp when the event occurred
    pub timestamp: DateTime<Utc>,
}

impl DomainEvent for FlowNodeFailed {
    fn event_type(&self) -> &'static str {
        "flow_node.failed"
    }

    fn process_instance_id(&self) -> &ProcessInstanceId {
        &self.process_instance_id
    }

    fn flow_node_instance_id(&self) -> Option<&FlowNodeInstanceId> {
        Some(&self.flow_node_instance_id)
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Event: Human-readable comment attached to a process instance
#[derive(Debug)]
pub struct SystemCommentAdded {
    /// Process instance receiving the comment
    pub process_instance_id: ProcessInstanceId,
    /// Flow node the comment is about
    pub flow_node_instance_id: FlowNodeInstanceId,
    /// Comment text
    pub comment: String,
    /// The timestamp when the event occurred
    pub timestamp: DateTime<Utc>,
}

impl DomainEvent for SystemCommentAdded {
    fn event_type(&self) -> &'static str {
        "process_instance.system_comment"
    }

    fn process_instance_id(&self) -> &ProcessInstanceId {
        &self.process_instance_id
    }

    fn flow_node_instance_id(&self) -> Option<&FlowNodeInstanceId> {
        Some(&self.flow_node_instance_id)
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Event: Process instance started
#[derive(Debug)]
pub struct ProcessInstanceStarted {
    /// The process instance
    pub process_instance_id: ProcessInstanceId,
    /// Calling activity, if any
    pub caller_id: Option<FlowNodeInstanceId>,
    /// The timestamp when the event occurred
    pub timestamp: DateTime<Utc>,
}

impl DomainEvent for ProcessInstanceStarted {
    fn event_type(&self) -> &'static str {
        "process_instance.started"
    }

    fn process_instance_id(&self) -> &ProcessInstanceId {
        &self.process_instance_id
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Event: Process instance reached an end state
#[derive(Debug)]
pub struct ProcessInstanceFinished {
    /// The process instance
    pub process_instance_id: ProcessInstanceId,
    /// End state
    pub state: ProcessState,
    /// The timestamp when the event occurred
    pub timestamp: DateTime<Utc>,
}

impl DomainEvent for ProcessInstanceFinished {
    fn event_type(&self) -> &'static str {
        "process_instance.finished"
    }

    fn process_instance_id(&self) -> &ProcessInstanceId {
        &self.process_instance_id
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
