use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

use super::{FlowNodeState, StateCode, StateDescriptor, StateId};
use crate::application::state_behaviors::StateBehaviors;
use crate::domain::expression::{
    NUMBER_OF_ACTIVE_INSTANCES, NUMBER_OF_COMPLETED_INSTANCES, NUMBER_OF_INSTANCES,
    NUMBER_OF_TERMINATED_INSTANCES,
};
use crate::domain::flow_node_instance::{
    ChildOutcome, FinishedChild, FlowNodeInstance, FlowNodeInstanceId, InstanceRole,
    MultiInstanceCounters, StateCategory,
};
use crate::domain::process_definition::{LoopCharacteristics, MultiInstanceLoop, ProcessDefinition};
use crate::types::DataPacket;
use crate::{CoreError, CoreResult};

fn multi_instance<'a>(process: &'a ProcessDefinition, instance: &FlowNodeInstance) -> CoreResult<&'a MultiInstanceLoop> {
    match &process.flow_node(&instance.definition_id)?.loop_characteristics {
        LoopCharacteristics::MultiInstance(multi_instance) => Ok(multi_instance),
        _ => Err(CoreError::execution(format!(
            "Flow node {} has no multi-instance characteristics",
            instance.definition_id.0
        ))),
    }
}

/// Computes the number of instances and prepares the output collection
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

    async fn cardinality(&self, multi_instance: &MultiInstanceLoop, instance: &FlowNodeInstance) -> CoreResult<u32> {
        let count = if let Some(cardinality) = &multi_instance.cardinality {
            let context = self.behaviors.evaluation_context(instance).await?;
            let value = self.behaviors.evaluate(cardinality, &context)?;
            value.as_u64().ok_or_else(|| {
                CoreError::execution(format!(
                    "Cardinality of {} evaluated to {} instead of a non-negative integer",
                    instance.definition_id.0, value.value
                ))
            })?
        } else if let Some(data_input) = &multi_instance.data_input {
            let collection = self.behaviors.read_variable(instance, data_input).await?;
            match collection.as_ref().and_then(DataPacket::as_array) {
                Some(items) => items.len() as u64,
                None => {
                    return Err(CoreError::execution(format!(
                        "Loop data input {} of {} is not a list",
                        data_input, instance.definition_id.0
                    )))
                }
            }
        } else {
            return Err(CoreError::execution(format!(
                "Multi-instance {} has neither a cardinality nor a loop data input",
                instance.definition_id.0
            )));
        };
        u32::try_from(count).map_err(|_| CoreError::execution(format!("Cardinality {} is too large", count)))
    }
}

#[async_trait]
impl FlowNodeState for Initializing {
    fn descriptor(&self) -> &StateDescriptor {
        &self.descriptor
    }

    async fn execute(&self, process: &ProcessDefinition, instance: &FlowNodeInstance) -> CoreResult<StateCode> {
        let multi_instance = multi_instance(process, instance)?;
        let cardinality = self.cardinality(multi_instance, instance).await?;
        self.behaviors
            .services()
            .flow_nodes
            .set_loop_cardinality(&instance.id, cardinality)
            .await?;

        if let Some(data_output) = &multi_instance.data_output {
            let current = self.behaviors.read_variable(instance, data_output).await?;
            if current.as_ref().and_then(DataPacket::as_array).is_none() {
                self.behaviors
                    .write_variable(instance, data_output, DataPacket::new(json!([])))
                    .await?;
            }
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

/// Fans out into the instances and waits for them.
///
/// Sequential multi-instances run one instance at a time, each finished
/// instance starting the next. Parallel ones start every instance at once.
/// The completion condition is evaluated after each finished instance and,
/// when true, aborts the instances still running.
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

    async fn start_instance(
        &self,
        process: &ProcessDefinition,
        multi_instance: &MultiInstanceLoop,
        parent: &FlowNodeInstance,
        index: u32,
    ) -> CoreResult<FlowNodeInstanceId> {
        let child = self.behaviors.create_iteration(process, parent, index).await?;
        let data = &self.behaviors.services().data;

        if let (Some(data_input), Some(item)) = (&multi_instance.data_input, &multi_instance.data_input_item) {
            let value = self
                .behaviors
                .read_variable(parent, data_input)
                .await?
                .and_then(|collection| collection.as_array().and_then(|items| items.get(index as usize).cloned()))
                .map(DataPacket::new)
                .unwrap_or_else(DataPacket::null);
            data.create(&child.id.0, item, value).await?;
        }
        if let Some(item) = &multi_instance.data_output_item {
            data.create(&child.id.0, item, DataPacket::null()).await?;
        }
        Ok(child.id)
    }

    async fn start_instances(
        &self,
        process: &ProcessDefinition,
        multi_instance: &MultiInstanceLoop,
        parent: &FlowNodeInstance,
        first_index: u32,
        count: u32,
    ) -> CoreResult<()> {
        let services = self.behaviors.services();
        services.flow_nodes.add_active_instances(&parent.id, count).await?;
        let mut started = Vec::with_capacity(count as usize);
        for index in first_index..first_index + count {
            started.push(self.start_instance(process, multi_instance, parent, index).await?);
        }
        debug!(multi_instance = %parent.id, first_index, count, "starting instances");
        for id in started {
            services.dispatcher.execute_flow_node(&id, None).await?;
        }
        Ok(())
    }

    async fn collect_output(
        &self,
        multi_instance: &MultiInstanceLoop,
        parent: &FlowNodeInstance,
        child: &FinishedChild,
    ) -> CoreResult<()> {
        let (Some(data_output), Some(item)) = (&multi_instance.data_output, &multi_instance.data_output_item) else {
            return Ok(());
        };
        let data = &self.behaviors.services().data;
        let value = data
            .get_variable(&child.id, item)
            .await?
            .unwrap_or_else(DataPacket::null);
        let container = self.behaviors.variable_container(parent, data_output).await?;
        data.set_collection_item(&container, data_output, child.loop_counter as usize, value)
            .await
    }

    async fn completion_condition_holds(
        &self,
        multi_instance: &MultiInstanceLoop,
        parent: &FlowNodeInstance,
        counters: &MultiInstanceCounters,
    ) -> CoreResult<bool> {
        let Some(condition) = &multi_instance.completion_condition else {
            return Ok(false);
        };
        let context = self
            .behaviors
            .evaluation_context(parent)
            .await?
            .with_variable(NUMBER_OF_INSTANCES, json!(counters.number_of_instances))
            .with_variable(NUMBER_OF_ACTIVE_INSTANCES, json!(counters.active))
            .with_variable(NUMBER_OF_COMPLETED_INSTANCES, json!(counters.completed))
            .with_variable(NUMBER_OF_TERMINATED_INSTANCES, json!(counters.terminated));
        self.behaviors.evaluate_condition(condition, &context)
    }
}

#[async_trait]
impl FlowNodeState for Executing {
    fn descriptor(&self) -> &StateDescriptor {
        &self.descriptor
    }

    async fn should_execute_state(&self, _process: &ProcessDefinition, instance: &FlowNodeInstance) -> CoreResult<bool> {
        Ok(instance.multi_instance.number_of_instances > 0)
    }

    async fn execute(&self, process: &ProcessDefinition, instance: &FlowNodeInstance) -> CoreResult<StateCode> {
        let counters = instance.multi_instance;
        if counters.active + counters.finished() > 0 {
            return Ok(StateCode::Done);
        }
        let multi_instance = multi_instance(process, instance)?;
        let count = if multi_instance.sequential {
            1
        } else {
            counters.number_of_instances
        };
        self.start_instances(process, multi_instance, instance, 0, count).await?;
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
        if child.role != InstanceRole::Iteration {
            return Ok(false);
        }
        let multi_instance = multi_instance(process, parent)?;
        if child.outcome == ChildOutcome::Completed {
            self.collect_output(multi_instance, parent, child).await?;
        }
        if parent.state_category != StateCategory::Normal {
            return Ok(false);
        }

        let counters = tally.multi_instance;
        if self.completion_condition_holds(multi_instance, parent, &counters).await? {
            let aborted = self
                .behaviors
                .interrupt_iterations(parent, StateCategory::Aborting)
                .await?;
            debug!(
                multi_instance = %parent.id,
                completed = counters.completed,
                aborted,
                "completion condition reached"
            );
            return Ok(counters.active == 0);
        }

        if multi_instance.sequential {
            if counters.finished() < counters.number_of_instances {
                self.start_instances(process, multi_instance, parent, counters.finished(), 1)
                    .await?;
                return Ok(false);
            }
            return Ok(true);
        }
        Ok(counters.active == 0)
    }

    async fn completion_reached(&self, _process: &ProcessDefinition, instance: &FlowNodeInstance) -> CoreResult<bool> {
        let counters = instance.multi_instance;
        Ok(counters.active == 0 && counters.finished() >= counters.number_of_instances)
    }
}
