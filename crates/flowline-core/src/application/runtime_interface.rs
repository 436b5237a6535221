use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::application::process_executor::ProcessExecutor;
use crate::application::services::EngineServices;
use crate::application::state_behaviors::StateBehaviors;
use crate::domain::flow_node_instance::{FlowNodeInstance, FlowNodeInstanceId, ProcessInstanceId, StateCategory};
use crate::domain::process_definition::{EventTrigger, ProcessDefinition};
use crate::domain::process_instance::ProcessInstance;
use crate::state::StateId;
use crate::types::Variables;
use crate::CoreError;

/// Summary information about a process instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessInstanceSummary {
    /// Process instance ID
    pub id: String,

    /// Process name
    pub name: String,

    /// Current status
    pub state: String,

    /// Whether the instance was archived
    pub archived: bool,

    /// Creation timestamp
    pub created_at: String,

    /// Last updated timestamp
    pub updated_at: String,
}

impl ProcessInstanceSummary {
    fn of(process: &ProcessInstance, archived: bool) -> Self {
        Self {
            id: process.id.0.clone(),
            name: process.name.clone(),
            state: format!("{:?}", process.state),
            archived,
            created_at: process.created_at.to_rfc3339(),
            updated_at: process.updated_at.to_rfc3339(),
        }
    }
}

/// The API the engine offers to its users
#[derive(Debug, Clone)]
pub struct RuntimeInterface {
    services: Arc<EngineServices>,
    behaviors: Arc<StateBehaviors>,
    process_executor: Arc<ProcessExecutor>,
}

impl RuntimeInterface {
    /// Create a new runtime interface
    pub fn new(
        services: Arc<EngineServices>,
        behaviors: Arc<StateBehaviors>,
        process_executor: Arc<ProcessExecutor>,
    ) -> Self {
        Self {
            services,
            behaviors,
            process_executor,
        }
    }

    /// Deploy a process definition
    pub async fn deploy(&self, definition: ProcessDefinition) -> Result<Arc<ProcessDefinition>, CoreError> {
        info!(name = %definition.name, version = %definition.version, "deploying process definition");
        self.services.definitions.save(definition).await
    }

    /// Start the process named `name`, latest version unless `version` is given
    pub async fn start_process(
        &self,
        name: &str,
        version: Option<&str>,
        inputs: Variables,
    ) -> Result<ProcessInstance, CoreError> {
        let definition = self
            .services
            .definitions
            .find_by_name(name, version)
            .await?
            .ok_or_else(|| {
                CoreError::definition(format!(
                    "Process {} ({}) is not deployed",
                    name,
                    version.unwrap_or("latest")
                ))
            })?;
        self.process_executor
            .start_process(&definition, None, inputs)
            .await
    }

    /// Assign a human task, or release it with `None`
    pub async fn assign_user_task(&self, id: &FlowNodeInstanceId, user: Option<&str>) -> Result<(), CoreError> {
        let task = self.human_task(id).await?;
        self.services
            .flow_nodes
            .set_assignee(&task.id, user.map(str::to_string))
            .await
    }

    /// Complete a ready human task on behalf of `user`
    pub async fn execute_user_task(&self, id: &FlowNodeInstanceId, user: &str) -> Result<(), CoreError> {
        let task = self.human_task(id).await?;
        if task.state_id != StateId::READY {
            return Err(CoreError::execution(format!(
                "Human task {} is not ready (state {})",
                id, task.state_id
            )));
        }
        match task.assignee.as_deref() {
            Some(assignee) if assignee == user => {}
            Some(_) => return Err(CoreError::NotAssigned(id.to_string())),
            None => {
                self.services
                    .flow_nodes
                    .set_assignee(id, Some(user.to_string()))
                    .await?
            }
        }
        info!(flow_node = %id, user, "human task executed");
        self.services
            .dispatcher
            .execute_flow_node(id, Some(StateId::READY))
            .await
    }

    async fn human_task(&self, id: &FlowNodeInstanceId) -> Result<FlowNodeInstance, CoreError> {
        let task = self.services.flow_nodes.get(id).await?;
        if !task.kind.is_human_task() {
            return Err(CoreError::execution(format!("Flow node {} is not a human task", id)));
        }
        Ok(task)
    }

    /// Send a message, to one process instance when `scope` is given.
    ///
    /// Returns how many waiting flow nodes received it.
    pub async fn send_message(
        &self,
        name: &str,
        scope: Option<&ProcessInstanceId>,
        payload: Variables,
    ) -> Result<usize, CoreError> {
        self.behaviors
            .deliver_event(&EventTrigger::Message(name.to_string()), scope, &payload)
            .await
    }

    /// Broadcast a signal
    pub async fn send_signal(&self, name: &str) -> Result<usize, CoreError> {
        self.behaviors
            .deliver_event(&EventTrigger::Signal(name.to_string()), None, &Variables::new())
            .await
    }

    /// Fire the event a flow node waits for, typically an elapsed timer
    pub async fn trigger_flow_node(&self, id: &FlowNodeInstanceId) -> Result<(), CoreError> {
        let taken = self.services.subscriptions.take_for_flow_node(id).await?;
        if taken.is_empty() {
            return Err(CoreError::execution(format!("Flow node {} is not waiting for an event", id)));
        }
        self.services
            .dispatcher
            .execute_flow_node(id, Some(StateId::WAITING))
            .await
    }

    /// Cancel a process instance and everything it started
    pub async fn cancel_process(&self, id: &ProcessInstanceId) -> Result<(), CoreError> {
        self.process_executor
            .interrupt_process(id, StateCategory::Cancelling)
            .await
    }

    /// A process instance, active or archived
    pub async fn process_instance(&self, id: &ProcessInstanceId) -> Result<Option<ProcessInstance>, CoreError> {
        match self.services.processes.find_by_id(id).await? {
            Some(process) => Ok(Some(process)),
            None => self.services.processes.find_archived(id).await,
        }
    }

    /// Summaries of the active process instances
    pub async fn list_active_processes(&self) -> Result<Vec<ProcessInstanceSummary>, CoreError> {
        Ok(self
            .services
            .processes
            .list_active()
            .await?
            .iter()
            .map(|process| ProcessInstanceSummary::of(process, false))
            .collect())
    }

    /// Summary of a process instance
    pub async fn process_summary(&self, id: &ProcessInstanceId) -> Result<Option<ProcessInstanceSummary>, CoreError> {
        if let Some(process) = self.services.processes.find_by_id(id).await? {
            return Ok(Some(ProcessInstanceSummary::of(&process, false)));
        }
        Ok(self
            .services
            .processes
            .find_archived(id)
            .await?
            .map(|process| ProcessInstanceSummary::of(&process, true)))
    }

    /// Active flow nodes of a process instance
    pub async fn active_flow_nodes(&self, id: &ProcessInstanceId) -> Result<Vec<FlowNodeInstance>, CoreError> {
        self.services.flow_nodes.list_by_process(id).await
    }

    /// Archived flow nodes of a process instance
    pub async fn archived_flow_nodes(&self, id: &ProcessInstanceId) -> Result<Vec<FlowNodeInstance>, CoreError> {
        self.services.flow_nodes.list_archived_by_process(id).await
    }

    /// Variables of a process instance
    pub async fn process_variables(&self, id: &ProcessInstanceId) -> Result<Variables, CoreError> {
        self.services.data.get_variables(&id.0).await
    }

    /// Local variables of a flow node instance
    pub async fn flow_node_variables(&self, id: &FlowNodeInstanceId) -> Result<Variables, CoreError> {
        self.services.data.get_variables(&id.0).await
    }
}
