//! Drives flow node instances through their state chains
//!
//! Every unit of work ends up here. The executor loads the instance, picks
//! its current state from the [`FlowNodeStateManager`] and advances until
//! the flow node reaches a stable state, a terminal state, or a state that
//! waits for asynchronous work.

use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::application::process_executor::ProcessExecutor;
use crate::application::services::EngineServices;
use crate::application::state_behaviors::StateBehaviors;
use crate::application::state_manager::FlowNodeStateManager;
use crate::application::work::{ConnectorRequest, WorkItem};
use crate::domain::connector::ConnectorState;
use crate::domain::events::{FlowNodeFailed, FlowNodeStateChanged, SystemCommentAdded};
use crate::domain::flow_node_instance::{
    ChildOutcome, FinishedChild, FlowNodeInstance, FlowNodeInstanceId, FlowNodeKind, StateCategory,
};
use crate::domain::process_definition::{FailAction, ProcessDefinition};
use crate::state::{FlowNodeState, StateCode, StateId};
use crate::types::Variables;
use crate::{CoreError, CoreResult};

/// Executes units of work against flow node instances
#[derive(Debug)]
pub struct FlowNodeExecutor {
    services: Arc<EngineServices>,
    behaviors: Arc<StateBehaviors>,
    manager: Arc<FlowNodeStateManager>,
    process_executor: Arc<ProcessExecutor>,
}

impl FlowNodeExecutor {
    /// Create a new flow node executor
    pub fn new(
        services: Arc<EngineServices>,
        behaviors: Arc<StateBehaviors>,
        manager: Arc<FlowNodeStateManager>,
        process_executor: Arc<ProcessExecutor>,
    ) -> Self {
        Self {
            services,
            behaviors,
            manager,
            process_executor,
        }
    }

    /// The state registry
    pub fn manager(&self) -> &FlowNodeStateManager {
        &self.manager
    }

    /// Run one unit of work.
    ///
    /// Only retryable store errors are returned; every other failure moves
    /// the flow node to the failed state.
    pub async fn handle(&self, work: WorkItem) -> CoreResult<()> {
        match work {
            WorkItem::ExecuteFlowNode {
                flow_node_instance_id,
                expected_state,
            } => self.execute_flow_node(&flow_node_instance_id, expected_state).await,
            WorkItem::InterruptFlowNode {
                flow_node_instance_id,
            } => self.interrupt(&flow_node_instance_id).await,
            WorkItem::NotifyChildFinished { parent, child } => self.notify_child_finished(&parent, &child).await,
        }
    }

    /// Drive a flow node forward
    pub async fn execute_flow_node(&self, id: &FlowNodeInstanceId, expected_state: Option<StateId>) -> CoreResult<()> {
        let result = self.try_execute(id, expected_state).await;
        self.settle(id, result).await
    }

    /// Make a flow node follow a change of its category
    pub async fn interrupt(&self, id: &FlowNodeInstanceId) -> CoreResult<()> {
        let result = self.try_interrupt(id).await;
        self.settle(id, result).await
    }

    /// Account for a finished child of `parent`
    pub async fn notify_child_finished(&self, parent: &FlowNodeInstanceId, child: &FinishedChild) -> CoreResult<()> {
        let result = self.try_notify(parent, child).await;
        self.settle(parent, result).await
    }

    /// A connector dispatched by `request` finished with `result`
    pub async fn connector_finished(&self, request: &ConnectorRequest, result: CoreResult<Variables>) -> CoreResult<()> {
        let id = &request.flow_node_instance_id;
        let outcome = self.try_connector_finished(request, result).await;
        match outcome {
            Ok(true) => self.execute_flow_node(id, Some(request.expected_state)).await,
            Ok(false) => Ok(()),
            Err(err) => self.settle(id, Err(err)).await,
        }
    }

    async fn settle(&self, id: &FlowNodeInstanceId, result: CoreResult<()>) -> CoreResult<()> {
        match result {
            Ok(()) => Ok(()),
            Err(err) if err.is_retryable() => Err(err),
            Err(err) if err.is_not_found() => {
                warn!(flow_node = %id, error = %err, "flow node vanished while it was driven");
                Ok(())
            }
            Err(err) => self.fail(id, err).await,
        }
    }

    async fn load(&self, id: &FlowNodeInstanceId) -> CoreResult<Option<(FlowNodeInstance, Arc<ProcessDefinition>)>> {
        let Some(instance) = self.services.flow_nodes.find_by_id(id).await? else {
            debug!(flow_node = %id, "flow node already archived");
            return Ok(None);
        };
        let process = self
            .services
            .definitions
            .get(&instance.process_definition_id)
            .await?;
        Ok(Some((instance, process)))
    }

    async fn try_execute(&self, id: &FlowNodeInstanceId, expected_state: Option<StateId>) -> CoreResult<()> {
        let Some((instance, process)) = self.load(id).await? else {
            return Ok(());
        };
        if let Some(expected) = expected_state {
            if instance.state_id != expected {
                debug!(
                    flow_node = %id,
                    expected = %expected,
                    actual = %instance.state_id,
                    "stale work dropped"
                );
                return Ok(());
            }
        }

        let current = self.manager.state(instance.kind, instance.state_id)?;
        if current.is_terminal() {
            return Ok(());
        }
        if current.state_category() == instance.state_category {
            if instance.state_executing {
                return self.drive(&process, instance, current, true).await;
            }
            if expected_state.is_none() && !current.completion_reached(&process, &instance).await? {
                return Ok(());
            }
        }
        self.drive(&process, instance, current, false).await
    }

    async fn try_interrupt(&self, id: &FlowNodeInstanceId) -> CoreResult<()> {
        let Some((instance, process)) = self.load(id).await? else {
            return Ok(());
        };
        if instance.state_category == StateCategory::Normal {
            return Ok(());
        }
        let current = self.manager.state(instance.kind, instance.state_id)?;
        if current.is_terminal() && instance.state_id != StateId::FAILED {
            return Ok(());
        }
        if !current.is_terminal() && current.state_category() == instance.state_category {
            return Ok(());
        }
        debug!(
            flow_node = %id,
            category = ?instance.state_category,
            state = current.name(),
            "flow node interrupted"
        );
        self.drive(&process, instance, current, false).await
    }

    async fn try_notify(&self, parent: &FlowNodeInstanceId, child: &FinishedChild) -> CoreResult<()> {
        let Some((instance, process)) = self.load(parent).await? else {
            return Ok(());
        };
        let current = self.manager.state(instance.kind, instance.state_id)?;
        let proceed = current
            .notify_child_flow_node_has_finished(&process, &instance, child)
            .await?;
        if proceed {
            debug!(
                parent = %parent,
                child = %child.id,
                state = current.name(),
                "last awaited child finished"
            );
            self.services
                .dispatcher
                .execute_flow_node(parent, Some(instance.state_id))
                .await?;
        }
        Ok(())
    }

    /// Records the connector result; true when the flow node should be driven again
    async fn try_connector_finished(&self, request: &ConnectorRequest, result: CoreResult<Variables>) -> CoreResult<bool> {
        let Some(instance) = self
            .services
            .flow_nodes
            .find_by_id(&request.flow_node_instance_id)
            .await?
        else {
            return Ok(false);
        };
        if instance.state_id != request.expected_state {
            debug!(
                flow_node = %instance.id,
                connector = %request.definition.name,
                "connector finished after its flow node moved on"
            );
            return Ok(false);
        }

        let connectors = &self.services.connectors;
        match result {
            Ok(outputs) => {
                self.behaviors
                    .execute_operations(&instance, &request.definition.outputs, Some(&outputs))
                    .await?;
                connectors
                    .set_state(&request.connector_instance_id, ConnectorState::Done)
                    .await?;
                Ok(true)
            }
            Err(err) if request.definition.fail_action == FailAction::Ignore => {
                warn!(
                    flow_node = %instance.id,
                    connector = %request.definition.name,
                    error = %err,
                    "connector failed, failure ignored"
                );
                connectors
                    .set_state(&request.connector_instance_id, ConnectorState::Done)
                    .await?;
                Ok(true)
            }
            Err(err) => {
                connectors
                    .set_state(&request.connector_instance_id, ConnectorState::Failed)
                    .await?;
                Err(CoreError::Connector(format!(
                    "{} failed: {}",
                    request.definition.name, err
                )))
            }
        }
    }

    async fn drive(
        &self,
        process: &ProcessDefinition,
        mut instance: FlowNodeInstance,
        mut current: Arc<dyn FlowNodeState>,
        mut rerun: bool,
    ) -> CoreResult<()> {
        loop {
            if !rerun {
                let next = self
                    .manager
                    .get_next_normal_state(process, &instance, current.id())
                    .await?;
                instance = self.enter(&instance, next.as_ref()).await?;
                current = next;
            }
            rerun = false;

            if current.execute(process, &instance).await? == StateCode::Executing {
                return Ok(());
            }
            instance = self
                .services
                .flow_nodes
                .set_state(&instance.id, current.id(), false)
                .await?;

            if current.is_terminal() {
                return self.on_terminal(process, &instance).await;
            }
            if current.is_stable()
                && current.state_category() == instance.state_category
                && !current.completion_reached(process, &instance).await?
            {
                return Ok(());
            }
        }
    }

    async fn enter(&self, instance: &FlowNodeInstance, state: &dyn FlowNodeState) -> CoreResult<FlowNodeInstance> {
        self.enter_with_detail(instance, state, None).await
    }

    /// Enter `state`; `detail` is appended to the system comment of the state
    async fn enter_with_detail(
        &self,
        instance: &FlowNodeInstance,
        state: &dyn FlowNodeState,
        detail: Option<&str>,
    ) -> CoreResult<FlowNodeInstance> {
        let updated = self
            .services
            .flow_nodes
            .set_state(&instance.id, state.id(), true)
            .await?;
        debug!(
            flow_node = %updated.id,
            name = %updated.name,
            from = %instance.state_id,
            to = state.name(),
            "state changed"
        );
        self.behaviors
            .emit(FlowNodeStateChanged {
                process_instance_id: updated.parent_process_instance_id.clone(),
                flow_node_instance_id: updated.id.clone(),
                state_id: state.id(),
                state_name: state.name(),
                timestamp: Utc::now(),
            })
            .await?;
        if state.must_add_system_comment(&updated) {
            let comment = match detail {
                Some(detail) => format!("{}: {}", state.system_comment(&updated), detail),
                None => state.system_comment(&updated),
            };
            self.behaviors
                .emit(SystemCommentAdded {
                    process_instance_id: updated.parent_process_instance_id.clone(),
                    flow_node_instance_id: updated.id.clone(),
                    comment,
                    timestamp: Utc::now(),
                })
                .await?;
        }
        Ok(updated)
    }

    async fn on_terminal(&self, process: &ProcessDefinition, instance: &FlowNodeInstance) -> CoreResult<()> {
        let Some(outcome) = instance.state_id.outcome() else {
            return Ok(());
        };
        info!(
            flow_node = %instance.id,
            name = %instance.name,
            ?outcome,
            "flow node finished"
        );

        if instance.kind == FlowNodeKind::BoundaryEvent && outcome == ChildOutcome::Completed {
            self.process_executor.follow_transitions(process, instance).await?;
        }
        match &instance.parent_activity_id {
            Some(parent) => {
                self.services
                    .dispatcher
                    .notify_child_finished(parent, FinishedChild::flow_node(instance, outcome))
                    .await?
            }
            None => {
                self.process_executor
                    .root_flow_node_finished(process, instance, outcome)
                    .await?
            }
        }

        self.services.connectors.delete_for_container(&instance.id).await?;
        match self.services.flow_nodes.archive(&instance.id).await {
            Err(err) if err.is_not_found() => {}
            result => result?,
        }
        if instance.parent_activity_id.is_none() {
            self.process_executor
                .wake_inclusive_gateways(process, &instance.parent_process_instance_id)
                .await?;
        }
        Ok(())
    }

    async fn fail(&self, id: &FlowNodeInstanceId, err: CoreError) -> CoreResult<()> {
        let Some(instance) = self.services.flow_nodes.find_by_id(id).await? else {
            warn!(flow_node = %id, error = %err, "failure of an archived flow node");
            return Ok(());
        };
        if instance.state_id == StateId::FAILED {
            return Ok(());
        }
        error!(
            flow_node = %id,
            name = %instance.name,
            state = %instance.state_id,
            error = %err,
            "flow node failed"
        );

        let failed_state = self.manager.failed_state();
        let failed = self
            .enter_with_detail(&instance, failed_state.as_ref(), Some(&err.to_string()))
            .await?;
        self.services
            .flow_nodes
            .set_state(&failed.id, StateId::FAILED, false)
            .await?;
        self.behaviors
            .emit(FlowNodeFailed {
                process_instance_id: failed.parent_process_instance_id.clone(),
                flow_node_instance_id: failed.id.clone(),
                error: err,
                timestamp: Utc::now(),
            })
            .await
    }
}
