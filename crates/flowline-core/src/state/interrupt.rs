use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use super::{FlowNodeState, StateCode, StateDescriptor, StateId};
use crate::application::process_executor::ProcessExecutor;
use crate::application::state_behaviors::StateBehaviors;
use crate::domain::flow_node_instance::{
    FinishedChild, FlowNodeInstance, InstanceRole, ProcessInstanceId, StateCategory,
};
use crate::domain::process_definition::ProcessDefinition;
use crate::CoreResult;

/// First state of the aborting and cancelling chains.
///
/// Pushes the category down to the children, then stays until every child
/// reported back. The call activity variant also interrupts the process the
/// activity started and archives it once it ended.
#[derive(Debug)]
pub struct Interrupting {
    descriptor: StateDescriptor,
    behaviors: Arc<StateBehaviors>,
    called_process: Option<Arc<ProcessExecutor>>,
}

impl Interrupting {
    /// Interrupting state for `category`
    pub fn new(category: StateCategory, behaviors: Arc<StateBehaviors>) -> Self {
        let (id, name) = match category {
            StateCategory::Cancelling => (StateId::CANCELLING, "cancelling"),
            _ => (StateId::ABORTING, "aborting"),
        };
        Self {
            descriptor: StateDescriptor {
                id,
                name,
                stable: true,
                terminal: false,
                interrupting: true,
                category,
                system_comment: None,
            },
            behaviors,
            called_process: None,
        }
    }

    /// Interrupting state of a call activity
    pub fn call_activity(
        category: StateCategory,
        behaviors: Arc<StateBehaviors>,
        process_executor: Arc<ProcessExecutor>,
    ) -> Self {
        Self {
            called_process: Some(process_executor),
            ..Self::new(category, behaviors)
        }
    }
}

#[async_trait]
impl FlowNodeState for Interrupting {
    fn descriptor(&self) -> &StateDescriptor {
        &self.descriptor
    }

    async fn should_execute_state(&self, _process: &ProcessDefinition, instance: &FlowNodeInstance) -> CoreResult<bool> {
        let category = self.descriptor.category;
        let interrupted = self.behaviors.interrupt_children(instance, category).await?;
        debug!(
            flow_node = %instance.id,
            ?category,
            interrupted,
            "interrupting children"
        );

        if let Some(process_executor) = &self.called_process {
            if let Some(child) = self.behaviors.child_process_of(instance).await? {
                if child.state.is_terminal() {
                    self.behaviors.archive_child_process(&child.id).await?;
                } else {
                    process_executor.interrupt_process(&child.id, category).await?;
                }
            }
        }
        Ok(true)
    }

    async fn execute(&self, _process: &ProcessDefinition, instance: &FlowNodeInstance) -> CoreResult<StateCode> {
        self.behaviors.unregister_waiting_events(instance).await?;
        Ok(StateCode::Done)
    }

    async fn notify_child_flow_node_has_finished(
        &self,
        _process: &ProcessDefinition,
        parent: &FlowNodeInstance,
        child: &FinishedChild,
    ) -> CoreResult<bool> {
        let Some(tally) = self.behaviors.record_child(parent, child).await? else {
            return Ok(false);
        };
        if self.called_process.is_some() && child.role == InstanceRole::Standalone {
            self.behaviors
                .archive_child_process(&ProcessInstanceId(child.id.clone()))
                .await?;
        }
        Ok(tally.token_count <= 0)
    }

    async fn completion_reached(&self, _process: &ProcessDefinition, instance: &FlowNodeInstance) -> CoreResult<bool> {
        Ok(instance.token_count <= 0)
    }
}
