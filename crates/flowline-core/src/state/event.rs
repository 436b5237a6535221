use async_trait::async_trait;
use std::sync::Arc;

use super::phase::{PhaseHooks, PhaseRunner, PhasedState};
use super::{FlowNodeState, StateCode, StateDescriptor, StateId};
use crate::application::process_executor::ProcessExecutor;
use crate::application::state_behaviors::StateBehaviors;
use crate::domain::flow_node_instance::{FinishedChild, FlowNodeInstance};
use crate::domain::process_definition::{EventTrigger, FlowNodeType, GatewayType, ProcessDefinition};
use crate::CoreResult;

/// Waits for a message, signal or timer, or for the branches a gateway merges
#[derive(Debug)]
pub struct Waiting {
    descriptor: StateDescriptor,
    behaviors: Arc<StateBehaviors>,
    register: bool,
}

impl Waiting {
    /// Waiting state that subscribes to the flow node's trigger on entry
    pub fn subscribing(behaviors: Arc<StateBehaviors>) -> Self {
        Self {
            descriptor: StateDescriptor::stable(StateId::WAITING, "waiting"),
            behaviors,
            register: true,
        }
    }

    /// Waiting state of a flow node that subscribed earlier
    pub fn subscribed(behaviors: Arc<StateBehaviors>) -> Self {
        Self {
            register: false,
            ..Self::subscribing(behaviors)
        }
    }
}

#[async_trait]
impl FlowNodeState for Waiting {
    fn descriptor(&self) -> &StateDescriptor {
        &self.descriptor
    }

    async fn should_execute_state(&self, process: &ProcessDefinition, instance: &FlowNodeInstance) -> CoreResult<bool> {
        if !self.register {
            return Ok(true);
        }
        let definition = process.flow_node(&instance.definition_id)?;
        Ok(!matches!(definition.event_trigger, EventTrigger::None))
    }

    async fn execute(&self, process: &ProcessDefinition, instance: &FlowNodeInstance) -> CoreResult<StateCode> {
        if self.register {
            self.behaviors.register_waiting_event(process, instance).await?;
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

/// A gateway waiting for enough incoming branches
#[derive(Debug)]
pub struct MergeWaiting {
    descriptor: StateDescriptor,
    behaviors: Arc<StateBehaviors>,
}

impl MergeWaiting {
    /// Create the state
    pub fn new(behaviors: Arc<StateBehaviors>) -> Self {
        Self {
            descriptor: StateDescriptor::stable(StateId::WAITING, "waiting"),
            behaviors,
        }
    }

    /// Number of distinct incoming transitions after which the gateway fires
    /// without looking further upstream
    pub fn required_hits(process: &ProcessDefinition, instance: &FlowNodeInstance) -> usize {
        let Ok(definition) = process.flow_node(&instance.definition_id) else {
            return usize::MAX;
        };
        match definition.node_type {
            FlowNodeType::Gateway(GatewayType::Exclusive) => 1,
            _ => process.incoming_count(&definition.id).max(1),
        }
    }
}

#[async_trait]
impl FlowNodeState for MergeWaiting {
    fn descriptor(&self) -> &StateDescriptor {
        &self.descriptor
    }

    async fn execute(&self, _process: &ProcessDefinition, _instance: &FlowNodeInstance) -> CoreResult<StateCode> {
        Ok(StateCode::Done)
    }

    async fn notify_child_flow_node_has_finished(
        &self,
        _process: &ProcessDefinition,
        _parent: &FlowNodeInstance,
        _child: &FinishedChild,
    ) -> CoreResult<bool> {
        Ok(false)
    }

    /// An inclusive gateway also fires once no live token can reach it anymore
    async fn completion_reached(&self, process: &ProcessDefinition, instance: &FlowNodeInstance) -> CoreResult<bool> {
        if instance.gateway_hits.len() >= Self::required_hits(process, instance) {
            return Ok(true);
        }
        let inclusive = process
            .flow_node(&instance.definition_id)
            .map(|d| d.node_type == FlowNodeType::Gateway(GatewayType::Inclusive))
            .unwrap_or(false);
        if !inclusive || instance.gateway_hits.is_empty() {
            return Ok(false);
        }
        Ok(!self.behaviors.tokens_upstream_of(process, instance).await?)
    }
}

struct OperationHooks {
    behaviors: Arc<StateBehaviors>,
}

#[async_trait]
impl PhaseHooks for OperationHooks {
    async fn before_connectors(&self, process: &ProcessDefinition, instance: &FlowNodeInstance) -> CoreResult<()> {
        self.behaviors.create_local_data(process, instance).await
    }

    async fn between_connectors(&self, process: &ProcessDefinition, instance: &FlowNodeInstance) -> CoreResult<()> {
        let definition = process.flow_node(&instance.definition_id)?;
        self.behaviors
            .execute_operations(instance, &definition.operations, None)
            .await
    }
}

struct ThrowHooks {
    behaviors: Arc<StateBehaviors>,
    process_executor: Arc<ProcessExecutor>,
}

#[async_trait]
impl PhaseHooks for ThrowHooks {
    async fn before_connectors(&self, process: &ProcessDefinition, instance: &FlowNodeInstance) -> CoreResult<()> {
        self.behaviors.create_local_data(process, instance).await
    }

    async fn between_connectors(&self, process: &ProcessDefinition, instance: &FlowNodeInstance) -> CoreResult<()> {
        let definition = process.flow_node(&instance.definition_id)?;
        self.behaviors
            .execute_operations(instance, &definition.operations, None)
            .await?;
        match definition.event_trigger {
            EventTrigger::Terminate => self.process_executor.terminate(instance).await,
            EventTrigger::Message(_) | EventTrigger::Signal(_) => {
                self.behaviors.throw_event(process, instance).await
            }
            EventTrigger::None | EventTrigger::Timer(_) => Ok(()),
        }
    }
}

/// Executing state of gateways and start events
pub fn executing(behaviors: Arc<StateBehaviors>) -> Arc<dyn FlowNodeState> {
    let hooks = Arc::new(OperationHooks {
        behaviors: behaviors.clone(),
    });
    Arc::new(PhasedState::new(
        StateDescriptor::normal(StateId::EXECUTING, "executing"),
        PhaseRunner::Sequential,
        hooks,
        behaviors,
    ))
}

/// Executing state of end and intermediate throw events
pub fn throwing(behaviors: Arc<StateBehaviors>, process_executor: Arc<ProcessExecutor>) -> Arc<dyn FlowNodeState> {
    let hooks = Arc::new(ThrowHooks {
        behaviors: behaviors.clone(),
        process_executor,
    });
    Arc::new(PhasedState::new(
        StateDescriptor::normal(StateId::EXECUTING, "executing"),
        PhaseRunner::Sequential,
        hooks,
        behaviors,
    ))
}
