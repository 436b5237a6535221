use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use super::phase::{PhaseHooks, PhaseRunner, PhasedState};
use super::{FlowNodeState, StateCode, StateDescriptor, StateId};
use crate::application::state_behaviors::StateBehaviors;
use crate::domain::flow_node_instance::{FinishedChild, FlowNodeInstance, FlowNodeKind};
use crate::domain::process_definition::{ConnectorEvent, ProcessDefinition};
use crate::{CoreError, CoreResult};

struct InitializingHooks {
    behaviors: Arc<StateBehaviors>,
    human_task: bool,
}

#[async_trait]
impl PhaseHooks for InitializingHooks {
    async fn before_connectors(&self, process: &ProcessDefinition, instance: &FlowNodeInstance) -> CoreResult<()> {
        self.behaviors.create_local_data(process, instance).await?;
        self.behaviors.create_boundary_events(process, instance).await
    }

    async fn after_connectors(&self, process: &ProcessDefinition, instance: &FlowNodeInstance) -> CoreResult<()> {
        if self.human_task {
            self.behaviors.map_actor(process, instance).await?;
        }
        Ok(())
    }
}

struct ExecutingHooks {
    behaviors: Arc<StateBehaviors>,
}

#[async_trait]
impl PhaseHooks for ExecutingHooks {
    async fn before_connectors(&self, process: &ProcessDefinition, instance: &FlowNodeInstance) -> CoreResult<()> {
        let definition = process.flow_node(&instance.definition_id)?;
        self.behaviors
            .execute_operations(instance, &definition.operations, None)
            .await?;
        if instance.kind == FlowNodeKind::SendTask {
            self.behaviors.throw_event(process, instance).await?;
        }
        Ok(())
    }
}

/// Initializing state of automatic, human and catch activities
pub fn initializing(behaviors: Arc<StateBehaviors>, human_task: bool) -> Arc<dyn FlowNodeState> {
    let hooks = Arc::new(InitializingHooks {
        behaviors: behaviors.clone(),
        human_task,
    });
    Arc::new(PhasedState::new(
        StateDescriptor::normal(StateId::INITIALIZING, "initializing"),
        PhaseRunner::Single(ConnectorEvent::OnEnter),
        hooks,
        behaviors,
    ))
}

/// Executing state of automatic, human and catch activities
pub fn executing(behaviors: Arc<StateBehaviors>) -> Arc<dyn FlowNodeState> {
    let hooks = Arc::new(ExecutingHooks {
        behaviors: behaviors.clone(),
    });
    Arc::new(PhasedState::new(
        StateDescriptor::normal(StateId::EXECUTING, "executing"),
        PhaseRunner::Single(ConnectorEvent::OnFinish),
        hooks,
        behaviors,
    ))
}

/// A human task waiting for its assignee
#[derive(Debug)]
pub struct Ready {
    descriptor: StateDescriptor,
    behaviors: Arc<StateBehaviors>,
}

impl Ready {
    /// Create the state
    pub fn new(behaviors: Arc<StateBehaviors>) -> Self {
        Self {
            descriptor: StateDescriptor::stable(StateId::READY, "ready"),
            behaviors,
        }
    }
}

#[async_trait]
impl FlowNodeState for Ready {
    fn descriptor(&self) -> &StateDescriptor {
        &self.descriptor
    }

    async fn execute(&self, _process: &ProcessDefinition, instance: &FlowNodeInstance) -> CoreResult<StateCode> {
        if instance.assignee.is_none() {
            return Err(CoreError::NotAssigned(instance.id.to_string()));
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

/// Waits for the boundary events still attached to a finished activity
#[derive(Debug)]
pub struct Completing {
    descriptor: StateDescriptor,
    behaviors: Arc<StateBehaviors>,
}

impl Completing {
    /// Create the state
    pub fn new(behaviors: Arc<StateBehaviors>) -> Self {
        Self {
            descriptor: StateDescriptor::stable(StateId::COMPLETING, "completing"),
            behaviors,
        }
    }
}

#[async_trait]
impl FlowNodeState for Completing {
    fn descriptor(&self) -> &StateDescriptor {
        &self.descriptor
    }

    async fn should_execute_state(&self, _process: &ProcessDefinition, instance: &FlowNodeInstance) -> CoreResult<bool> {
        if instance.token_count <= 0 {
            return Ok(false);
        }
        let cancelled = self.behaviors.cancel_boundary_events(&instance.id, None).await?;
        debug!(
            flow_node = %instance.id,
            cancelled,
            tokens = instance.token_count,
            "waiting for boundary events before completing"
        );
        Ok(true)
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
        Ok(match self.behaviors.record_child(parent, child).await? {
            Some(tally) => tally.token_count <= 0,
            None => false,
        })
    }

    async fn completion_reached(&self, _process: &ProcessDefinition, instance: &FlowNodeInstance) -> CoreResult<bool> {
        Ok(instance.token_count <= 0)
    }
}
