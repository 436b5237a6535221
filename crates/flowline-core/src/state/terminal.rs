use async_trait::async_trait;
use std::sync::Arc;

use super::{FlowNodeState, StateCode, StateDescriptor, StateId};
use crate::application::state_behaviors::StateBehaviors;
use crate::domain::flow_node_instance::{FinishedChild, FlowNodeInstance, StateCategory};
use crate::domain::process_definition::ProcessDefinition;
use crate::CoreResult;

/// A state no flow node leaves.
///
/// The executor archives the flow node and notifies its parent once it
/// gets here, except for the failed state which keeps the flow node around
/// for inspection.
#[derive(Debug)]
pub struct Terminal {
    descriptor: StateDescriptor,
    behaviors: Arc<StateBehaviors>,
}

impl Terminal {
    fn new(descriptor: StateDescriptor, behaviors: Arc<StateBehaviors>) -> Self {
        Self {
            descriptor,
            behaviors,
        }
    }

    /// Finished normally
    pub fn completed(behaviors: Arc<StateBehaviors>) -> Self {
        Self::new(
            StateDescriptor {
                terminal: true,
                ..StateDescriptor::normal(StateId::COMPLETED, "completed")
            },
            behaviors,
        )
    }

    /// Finished by an interrupting event
    pub fn aborted(behaviors: Arc<StateBehaviors>) -> Self {
        Self::new(
            StateDescriptor {
                id: StateId::ABORTED,
                name: "aborted",
                stable: false,
                terminal: true,
                interrupting: true,
                category: StateCategory::Aborting,
                system_comment: None,
            },
            behaviors,
        )
    }

    /// Finished by a cancel request
    pub fn cancelled(behaviors: Arc<StateBehaviors>) -> Self {
        Self::new(
            StateDescriptor {
                id: StateId::CANCELLED,
                name: "cancelled",
                stable: false,
                terminal: true,
                interrupting: true,
                category: StateCategory::Cancelling,
                system_comment: None,
            },
            behaviors,
        )
    }

    /// An unrecoverable error occurred
    pub fn failed(behaviors: Arc<StateBehaviors>) -> Self {
        Self::new(
            StateDescriptor {
                terminal: true,
                system_comment: Some("The flow node failed:"),
                ..StateDescriptor::normal(StateId::FAILED, "failed")
            },
            behaviors,
        )
    }
}

#[async_trait]
impl FlowNodeState for Terminal {
    fn descriptor(&self) -> &StateDescriptor {
        &self.descriptor
    }

    async fn execute(&self, _process: &ProcessDefinition, _instance: &FlowNodeInstance) -> CoreResult<StateCode> {
        Ok(StateCode::Done)
    }

    async fn notify_child_flow_node_has_finished(
        &self,
        _process: &ProcessDefinition,
        parent: &FlowNodeInstance,
        child: &FinishedChild,
    ) -> CoreResult<bool> {
        self.behaviors.record_child(parent, child).await?;
        Ok(false)
    }
}
