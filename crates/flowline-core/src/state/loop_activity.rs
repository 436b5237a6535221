use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

use super::{FlowNodeState, StateCode, StateDescriptor, StateId};
use crate::application::state_behaviors::StateBehaviors;
use crate::domain::expression::LOOP_COUNTER;
use crate::domain::flow_node_instance::{
    ChildOutcome, FinishedChild, FlowNodeInstance, InstanceRole, StateCategory,
};
use crate::domain::process_definition::{LoopCharacteristics, ProcessDefinition, StandardLoop};
use crate::{CoreError, CoreResult};

fn standard_loop<'a>(process: &'a ProcessDefinition, instance: &FlowNodeInstance) -> CoreResult<&'a StandardLoop> {
    match &process.flow_node(&instance.definition_id)?.loop_characteristics {
        LoopCharacteristics::StandardLoop(standard_loop) => Ok(standard_loop),
        _ => Err(CoreError::execution(format!(
            "Flow node {} has no standard loop characteristics",
            instance.definition_id.0
        ))),
    }
}

/// Evaluates the loop maximum and attaches boundary events to the container
#[derive(Debug)]
pub struct Initializing {
    descriptor: StateDescriptor,
    behaviors: Arc<StateBehaviors>,
}

impl Initializing {
    /// Create the state
    pub fn new(behaviors: Arc<StateBehaviors>) -> Self {
        Self {
            descriptor: StateDescriptor::normal(StateId::INITIALIZING, "initializing"),
            behaviors,
        }
    }
}

#[async_trait]
impl FlowNodeState for Initializing {
    fn descriptor(&self) -> &StateDescriptor {
        &self.descriptor
    }

    async fn execute(&self, process: &ProcessDefinition, instance: &FlowNodeInstance) -> CoreResult<StateCode> {
        let standard_loop = standard_loop(process, instance)?;
        if let Some(max) = &standard_loop.max {
            let context = self.behaviors.evaluation_context(instance).await?;
            let value = self.behaviors.evaluate(max, &context)?;
            let max = value.as_u64().ok_or_else(|| {
                CoreError::execution(format!(
                    "Loop maximum of {} evaluated to {} instead of a non-negative integer",
                    instance.definition_id.0, value.value
                ))
            })?;
            let max = u32::try_from(max)
                .map_err(|_| CoreError::execution(format!("Loop maximum {} is too large", max)))?;
            self.behaviors.services().flow_nodes.set_loop_max(&instance.id, max).await?;
        }
        self.behaviors.create_boundary_events(process, instance).await?;
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

/// Runs one iteration at a time until the loop ends
#[derive(Debug)]
pub struct Executing {
    descriptor: StateDescriptor,
    behaviors: Arc<StateBehaviors>,
}

impl Executing {
    /// Create the state
    pub fn new(behaviors: Arc<StateBehaviors>) -> Self {
        Self {
            descriptor: StateDescriptor::stable(StateId::EXECUTING, "executing"),
            behaviors,
        }
    }

    async fn condition_holds(
        &self,
        standard_loop: &StandardLoop,
        instance: &FlowNodeInstance,
        loop_counter: u32,
    ) -> CoreResult<bool> {
        let Some(condition) = &standard_loop.condition else {
            return Ok(true);
        };
        let context = self
            .behaviors
            .evaluation_context(instance)
            .await?
            .with_variable(LOOP_COUNTER, json!(loop_counter));
        self.behaviors.evaluate_condition(condition, &context)
    }

    async fn start_iteration(
        &self,
        process: &ProcessDefinition,
        instance: &FlowNodeInstance,
        index: u32,
    ) -> CoreResult<()> {
        let services = self.behaviors.services();
        services.flow_nodes.add_tokens(&instance.id, 1).await?;
        let iteration = self.behaviors.create_iteration(process, instance, index).await?;
        debug!(loop_activity = %instance.id, iteration = index, "starting loop iteration");
        services.dispatcher.execute_flow_node(&iteration.id, None).await
    }
}

#[async_trait]
impl FlowNodeState for Executing {
    fn descriptor(&self) -> &StateDescriptor {
        &self.descriptor
    }

    async fn should_execute_state(&self, process: &ProcessDefinition, instance: &FlowNodeInstance) -> CoreResult<bool> {
        if instance.loop_max == Some(0) {
            return Ok(false);
        }
        let standard_loop = standard_loop(process, instance)?;
        if standard_loop.test_before {
            return self.condition_holds(standard_loop, instance, 0).await;
        }
        Ok(true)
    }

    async fn execute(&self, process: &ProcessDefinition, instance: &FlowNodeInstance) -> CoreResult<StateCode> {
        if !self.behaviors.iterations_of(instance).await?.is_empty() {
            return Ok(StateCode::Done);
        }
        self.start_iteration(process, instance, 0).await?;
        Ok(StateCode::Done)
    }

    async fn notify_child_flow_node_has_finished(
        &self,
        process: &ProcessDefinition,
        parent: &FlowNodeInstance,
        child: &FinishedChild,
    ) -> CoreResult<bool> {
        let Some(tally) = self.behaviors.record_child(parent, child).await? else {
            return Ok(false);
        };
        if child.role != InstanceRole::Iteration || parent.state_category != StateCategory::Normal {
            return Ok(false);
        }
        if child.outcome != ChildOutcome::Completed {
            return Ok(tally.token_count <= 0);
        }

        let done = self
            .behaviors
            .services()
            .flow_nodes
            .increment_loop_counter(&parent.id)
            .await?;
        if parent.loop_max.map_or(false, |max| done >= max) {
            debug!(loop_activity = %parent.id, iterations = done, "loop maximum reached");
            return Ok(true);
        }
        let standard_loop = standard_loop(process, parent)?;
        if !self.condition_holds(standard_loop, parent, done).await? {
            debug!(loop_activity = %parent.id, iterations = done, "loop condition is false");
            return Ok(true);
        }
        self.start_iteration(process, parent, done).await?;
        Ok(false)
    }
}
