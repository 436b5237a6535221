use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

use super::phase::{PhaseHooks, PhaseRunner, PhasedState};
use super::{FlowNodeState, StateCode, StateDescriptor, StateId};
use crate::application::process_executor::ProcessExecutor;
use crate::application::state_behaviors::StateBehaviors;
use crate::domain::flow_node_instance::{FinishedChild, FlowNodeInstance, InstanceRole};
use crate::domain::process_definition::{
    CallActivityDefinition, CallTarget, ConnectorEvent, ProcessDefinition,
};
use crate::types::Variables;
use crate::{CoreError, CoreResult};

fn call_definition<'a>(process: &'a ProcessDefinition, instance: &FlowNodeInstance) -> CoreResult<&'a CallActivityDefinition> {
    process
        .flow_node(&instance.definition_id)?
        .call
        .as_ref()
        .ok_or_else(|| {
            CoreError::execution(format!(
                "Call activity {} has no call configuration",
                instance.definition_id.0
            ))
        })
}

struct InitializingHooks {
    behaviors: Arc<StateBehaviors>,
    process_executor: Arc<ProcessExecutor>,
}

impl InitializingHooks {
    async fn resolve_target(
        &self,
        call: &CallActivityDefinition,
        instance: &FlowNodeInstance,
    ) -> CoreResult<Arc<ProcessDefinition>> {
        let definitions = &self.behaviors.services().definitions;
        let (callable_element, version) = match &call.target {
            CallTarget::Embedded(id) => return definitions.get(id).await,
            CallTarget::Expression {
                callable_element,
                version,
            } => (callable_element, version),
        };
        let callable_element = callable_element.as_ref().ok_or_else(|| {
            CoreError::execution(format!(
                "Call activity {} has no callable element",
                instance.definition_id.0
            ))
        })?;

        let context = self.behaviors.evaluation_context(instance).await?;
        let name = self.behaviors.evaluate(callable_element, &context)?;
        let name = name.as_str().ok_or_else(|| {
            CoreError::execution(format!("Callable element evaluated to {} instead of a name", name.value))
        })?;
        let version = match version {
            Some(version) => {
                let value = self.behaviors.evaluate(version, &context)?;
                Some(match value.as_str() {
                    Some(s) => s.to_string(),
                    None => value.value.to_string(),
                })
            }
            None => None,
        };

        definitions
            .find_by_name(name, version.as_deref())
            .await?
            .ok_or_else(|| {
                CoreError::execution(format!(
                    "No process {} ({}) is deployed",
                    name,
                    version.as_deref().unwrap_or("latest")
                ))
            })
    }

    async fn data_inputs(&self, call: &CallActivityDefinition, instance: &FlowNodeInstance) -> CoreResult<Variables> {
        let context = self.behaviors.evaluation_context(instance).await?;
        let mut inputs = Variables::new();
        for operation in &call.data_input_operations {
            let value = self.behaviors.evaluate(&operation.expression, &context)?;
            inputs.insert(operation.target_variable.clone(), value);
        }
        Ok(inputs)
    }
}

#[async_trait]
impl PhaseHooks for InitializingHooks {
    async fn before_connectors(&self, process: &ProcessDefinition, instance: &FlowNodeInstance) -> CoreResult<()> {
        self.behaviors.create_local_data(process, instance).await?;
        self.behaviors.create_boundary_events(process, instance).await
    }

    async fn after_connectors(&self, process: &ProcessDefinition, instance: &FlowNodeInstance) -> CoreResult<()> {
        if self.behaviors.child_process_of(instance).await?.is_some() {
            return Ok(());
        }
        let call = call_definition(process, instance)?;
        let target = self.resolve_target(call, instance).await?;
        let inputs = self.data_inputs(call, instance).await?;

        self.behaviors
            .services()
            .flow_nodes
            .add_tokens(&instance.id, 1)
            .await?;
        let child = self
            .process_executor
            .start_process(&target, Some(instance), inputs)
            .await?;
        info!(
            call_activity = %instance.id,
            process = %child.id,
            target = %target.name,
            "called process started"
        );
        Ok(())
    }
}

/// Initializing state of call activities and sub-processes; starts the called process
pub fn initializing(behaviors: Arc<StateBehaviors>, process_executor: Arc<ProcessExecutor>) -> Arc<dyn FlowNodeState> {
    let hooks = Arc::new(InitializingHooks {
        behaviors: behaviors.clone(),
        process_executor,
    });
    Arc::new(PhasedState::new(
        StateDescriptor::normal(StateId::INITIALIZING, "initializing"),
        PhaseRunner::Single(ConnectorEvent::OnEnter),
        hooks,
        behaviors,
    ))
}

/// Waits for the called process
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
}

#[async_trait]
impl FlowNodeState for Executing {
    fn descriptor(&self) -> &StateDescriptor {
        &self.descriptor
    }

    async fn should_execute_state(&self, _process: &ProcessDefinition, instance: &FlowNodeInstance) -> CoreResult<bool> {
        Ok(self
            .behaviors
            .child_process_of(instance)
            .await?
            .map_or(false, |child| !child.state.is_terminal()))
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
        if self.behaviors.record_child(parent, child).await?.is_none() {
            return Ok(false);
        }
        Ok(child.role == InstanceRole::Standalone)
    }
}

/// Copies the results of the called process back and archives it
#[derive(Debug)]
pub struct Ending {
    descriptor: StateDescriptor,
    behaviors: Arc<StateBehaviors>,
}

impl Ending {
    /// Create the state
    pub fn new(behaviors: Arc<StateBehaviors>) -> Self {
        Self {
            descriptor: StateDescriptor::normal(StateId::ENDING, "ending"),
            behaviors,
        }
    }
}

#[async_trait]
impl FlowNodeState for Ending {
    fn descriptor(&self) -> &StateDescriptor {
        &self.descriptor
    }

    async fn execute(&self, process: &ProcessDefinition, instance: &FlowNodeInstance) -> CoreResult<StateCode> {
        let Some(child) = self.behaviors.child_process_of(instance).await? else {
            debug!(call_activity = %instance.id, "called process already archived");
            return Ok(StateCode::Done);
        };

        let call = call_definition(process, instance)?;
        let context = self.behaviors.process_context(&child.id).await?;
        for operation in &call.data_output_operations {
            let value = self.behaviors.evaluate(&operation.expression, &context)?;
            self.behaviors
                .write_variable(instance, &operation.target_variable, value)
                .await?;
        }
        self.behaviors.archive_child_process(&child.id).await?;
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
