use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::flow_node_instance::FlowNodeInstanceId;
use crate::domain::process_definition::{ConnectorDefinition, ConnectorEvent};

/// Value object: Connector instance ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectorInstanceId(pub String);

/// Progress of one connector instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectorState {
    /// Not dispatched yet
    ToBeExecuted,
    /// Dispatched, waiting for the result
    Executing,
    /// Finished (successfully or with an ignored failure)
    Done,
    /// Failed with the `Fail` policy
    Failed,
}

/// A connector bound to one flow node instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectorInstance {
    /// Unique identifier
    pub id: ConnectorInstanceId,

    /// Flow node instance owning the connector
    pub container_id: FlowNodeInstanceId,

    /// Connector definition name
    pub name: String,

    /// On-enter or on-finish
    pub event: ConnectorEvent,

    /// Execution order within the event
    pub position: usize,

    /// Progress
    pub state: ConnectorState,
}

impl ConnectorInstance {
    /// Create the connector instance for `definition`
    pub fn new(container_id: FlowNodeInstanceId, definition: &ConnectorDefinition, position: usize) -> Self {
        Self {
            id: ConnectorInstanceId(Uuid::new_v4().to_string()),
            container_id,
            name: definition.name.clone(),
            event: definition.event,
            position,
            state: ConnectorState::ToBeExecuted,
        }
    }
}

/// Progress of every connector bound to one event of a flow node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectorProgress {
    /// The event has no connector
    NoConnector,
    /// No connector of the event has been dispatched
    NotStarted(ConnectorInstance),
    /// Some connectors ran; this one is next (or still running)
    Pending(ConnectorInstance),
    /// Every connector of the event is done
    Drained,
}
