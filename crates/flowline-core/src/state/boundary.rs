use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use super::phase::{PhaseHooks, PhaseRunner, PhasedState};
use super::{FlowNodeState, StateCode, StateDescriptor, StateId};
use crate::application::state_behaviors::StateBehaviors;
use crate::domain::flow_node_instance::{FinishedChild, FlowNodeInstance, StateCategory};
use crate::domain::process_definition::{ConnectorEvent, ProcessDefinition};
use crate::{CoreError, CoreResult};

struct InitializingHooks {
    behaviors: Arc<StateBehaviors>,
}

#[async_trait]
impl PhaseHooks for InitializingHooks {
    async fn before_connectors(&self, process: &ProcessDefinition, instance: &FlowNodeInstance) -> CoreResult<()> {
        self.behaviors.create_local_data(process, instance).await
    }

    async fn after_connectors(&self, process: &ProcessDefinition, instance: &FlowNodeInstance) -> CoreResult<()> {
        self.behaviors.register_waiting_event(process, instance).await
    }
}

/// Initializing state of boundary events; subscribes to the trigger once the
/// on-enter connectors ran
pub fn initializing(behaviors: Arc<StateBehaviors>) -> Arc<dyn FlowNodeState> {
    let hooks = Arc::new(InitializingHooks {
        behaviors: behaviors.clone(),
    });
    Arc::new(PhasedState::new(
        StateDescriptor::normal(StateId::INITIALIZING, "initializing"),
        PhaseRunner::Single(ConnectorEvent::OnEnter),
        hooks,
        behaviors,
    ))
}

/// A boundary event whose trigger fired.
///
/// An interrupting boundary claims the attached activity by switching its
/// category from normal to aborting. The winner cancels its sibling
/// boundaries and aborts the activity. A boundary that loses the race
/// cancels itself.
#[derive(Debug)]
pub struct Executing {
    descriptor: StateDescriptor,
    behaviors: Arc<StateBehaviors>,
}

impl Executing {
    /// Create the state
    pub fn new(behaviors: Arc<StateBehaviors>) -> Self {
        Self {
            descriptor: StateDescriptor::normal(StateId::EXECUTING, "executing"),
            behaviors,
        }
    }
}

#[async_trait]
impl FlowNodeState for Executing {
    fn descriptor(&self) -> &StateDescriptor {
        &self.descriptor
    }

    async fn execute(&self, process: &ProcessDefinition, instance: &FlowNodeInstance) -> CoreResult<StateCode> {
        let definition = process.flow_node(&instance.definition_id)?;
        if !definition.interrupting {
            return Ok(StateCode::Done);
        }
        let activity = instance.parent_activity_id.as_ref().ok_or_else(|| {
            CoreError::execution(format!("Boundary event {} is not attached to an activity", instance.id))
        })?;

        let services = self.behaviors.services();
        let claimed = services
            .flow_nodes
            .compare_and_set_state_category(activity, StateCategory::Normal, StateCategory::Aborting)
            .await?;
        if claimed {
            let cancelled = self
                .behaviors
                .cancel_boundary_events(activity, Some(&instance.id))
                .await?;
            debug!(
                boundary = %instance.id,
                %activity,
                cancelled,
                "interrupting the attached activity"
            );
            services.dispatcher.interrupt_flow_node(activity).await?;
        } else {
            debug!(boundary = %instance.id, %activity, "attached activity already interrupted");
            services
                .flow_nodes
                .set_state_category(&instance.id, StateCategory::Cancelling)
                .await?;
        }
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
