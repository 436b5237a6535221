//! Units of work and the traits used to schedule them

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::connector::ConnectorInstanceId;
use crate::domain::flow_node_instance::{FinishedChild, FlowNodeInstanceId, ProcessInstanceId};
use crate::domain::process_definition::ConnectorDefinition;
use crate::state::StateId;
use crate::types::Variables;
use crate::CoreError;

/// One asynchronously dispatched unit of work
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkItem {
    /// Drive a flow node forward.
    ///
    /// With an expected state, the work is dropped unless the flow node is
    /// still in that state, and a stable state is left without re-checking
    /// its completion.
    ExecuteFlowNode {
        /// The flow node
        flow_node_instance_id: FlowNodeInstanceId,
        /// State the flow node must be in
        expected_state: Option<StateId>,
    },

    /// Make a flow node follow a category change of its own
    InterruptFlowNode {
        /// The flow node
        flow_node_instance_id: FlowNodeInstanceId,
    },

    /// A child of a flow node (or the process a call activity started) finished
    NotifyChildFinished {
        /// The parent flow node
        parent: FlowNodeInstanceId,
        /// The finished child
        child: FinishedChild,
    },
}

impl WorkItem {
    /// Flow node the work is about; work on the same flow node must not run concurrently
    pub fn key(&self) -> &FlowNodeInstanceId {
        match self {
            WorkItem::ExecuteFlowNode {
                flow_node_instance_id,
                ..
            } => flow_node_instance_id,
            WorkItem::InterruptFlowNode {
                flow_node_instance_id,
            } => flow_node_instance_id,
            WorkItem::NotifyChildFinished { parent, .. } => parent,
        }
    }
}

/// Schedules units of work
#[async_trait]
pub trait WorkDispatcher: Send + Sync {
    /// Enqueue a unit of work
    async fn dispatch(&self, work: WorkItem) -> Result<(), CoreError>;

    /// Enqueue the execution of a flow node
    async fn execute_flow_node(
        &self,
        flow_node_instance_id: &FlowNodeInstanceId,
        expected_state: Option<StateId>,
    ) -> Result<(), CoreError> {
        self.dispatch(WorkItem::ExecuteFlowNode {
            flow_node_instance_id: flow_node_instance_id.clone(),
            expected_state,
        })
        .await
    }

    /// Enqueue the interruption of a flow node
    async fn interrupt_flow_node(&self, flow_node_instance_id: &FlowNodeInstanceId) -> Result<(), CoreError> {
        self.dispatch(WorkItem::InterruptFlowNode {
            flow_node_instance_id: flow_node_instance_id.clone(),
        })
        .await
    }

    /// Enqueue a child completion notification
    async fn notify_child_finished(
        &self,
        parent: &FlowNodeInstanceId,
        child: FinishedChild,
    ) -> Result<(), CoreError> {
        self.dispatch(WorkItem::NotifyChildFinished {
            parent: parent.clone(),
            child,
        })
        .await
    }
}

/// Everything needed to run one connector outside of the flow node's unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectorRequest {
    /// Connector instance
    pub connector_instance_id: ConnectorInstanceId,

    /// Flow node owning the connector
    pub flow_node_instance_id: FlowNodeInstanceId,

    /// Process instance of the flow node
    pub process_instance_id: ProcessInstanceId,

    /// Connector definition
    pub definition: ConnectorDefinition,

    /// Evaluated inputs
    pub inputs: Variables,

    /// State to re-enter once the connector finished
    pub expected_state: StateId,
}

/// Runs connectors asynchronously
#[async_trait]
pub trait ConnectorExecutor: Send + Sync {
    /// Schedule the execution of a connector and return immediately
    async fn execute_connector_in_work(&self, request: ConnectorRequest) -> Result<(), CoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::flow_node_instance::{ChildOutcome, InstanceRole};

    #[test]
    fn test_work_key_is_the_driven_flow_node() {
        let parent = FlowNodeInstanceId("parent".into());
        let work = WorkItem::NotifyChildFinished {
            parent: parent.clone(),
            child: FinishedChild {
                id: "child".into(),
                outcome: ChildOutcome::Completed,
                role: InstanceRole::Iteration,
                loop_counter: 0,
            },
        };
        assert_eq!(work.key(), &parent);

        let work = WorkItem::ExecuteFlowNode {
            flow_node_instance_id: FlowNodeInstanceId("a".into()),
            expected_state: Some(StateId::READY),
        };
        assert_eq!(work.key().0, "a");
    }
}
