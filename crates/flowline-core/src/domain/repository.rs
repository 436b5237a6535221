//! Repository traits for the Flowline engine
//!
//! This module defines the store interfaces consumed by the state machine.
//! External crates implement these traits to provide different persistence
//! mechanisms.
//!
//! Every counter update on [`FlowNodeInstanceRepository`] is a single atomic
//! read-modify-write on one instance. Implementations must never split them
//! into a read followed by a write, since sibling children complete
//! concurrently and race on the same parent.

use async_trait::async_trait;
use std::sync::Arc;

use super::connector::{ConnectorInstance, ConnectorInstanceId, ConnectorProgress, ConnectorState};
use super::event_subscription::EventSubscription;
use super::flow_node_instance::{
    ChildTally, FinishedChild, FlowNodeInstance, FlowNodeInstanceId, MultiInstanceCounters,
    ProcessInstanceId, StateCategory,
};
use super::process_definition::{
    ConnectorEvent, EventTrigger, ProcessDefinition, ProcessDefinitionId, TransitionId,
};
use super::process_instance::{ProcessInstance, ProcessState};
use crate::state::StateId;
use crate::types::{DataPacket, Variables};
use crate::CoreError;

/// A page of query results
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    /// Index of the first result
    pub offset: usize,
    /// Maximum number of results
    pub limit: usize,
}

impl Page {
    /// First page of `limit` results
    pub fn first(limit: usize) -> Self {
        Self { offset: 0, limit }
    }

    /// The page following this one
    pub fn next(self) -> Self {
        Self {
            offset: self.offset + self.limit,
            limit: self.limit,
        }
    }
}

/// Repository for deployed process definitions
#[async_trait]
pub trait ProcessDefinitionRepository: Send + Sync {
    /// Find a process definition by ID
    async fn find_by_id(
        &self,
        id: &ProcessDefinitionId,
    ) -> Result<Option<Arc<ProcessDefinition>>, CoreError>;

    /// Find a process definition by name, latest deployed version when `version` is absent
    async fn find_by_name(
        &self,
        name: &str,
        version: Option<&str>,
    ) -> Result<Option<Arc<ProcessDefinition>>, CoreError>;

    /// Save a process definition
    async fn save(&self, definition: ProcessDefinition) -> Result<Arc<ProcessDefinition>, CoreError>;

    /// Get a process definition, failing when it is not deployed
    async fn get(&self, id: &ProcessDefinitionId) -> Result<Arc<ProcessDefinition>, CoreError> {
        self.find_by_id(id)
            .await?
            .ok_or_else(|| CoreError::definition(format!("Process definition {} is not deployed", id.0)))
    }
}

/// Repository for flow node instances
#[async_trait]
pub trait FlowNodeInstanceRepository: Send + Sync {
    /// Find an active flow node instance by ID
    async fn find_by_id(&self, id: &FlowNodeInstanceId) -> Result<Option<FlowNodeInstance>, CoreError>;

    /// Store a new flow node instance
    async fn create(&self, instance: FlowNodeInstance) -> Result<(), CoreError>;

    /// Move the instance to `state`
    async fn set_state(
        &self,
        id: &FlowNodeInstanceId,
        state: StateId,
        executing: bool,
    ) -> Result<FlowNodeInstance, CoreError>;

    /// Set the state category
    async fn set_state_category(
        &self,
        id: &FlowNodeInstanceId,
        category: StateCategory,
    ) -> Result<(), CoreError>;

    /// Set the state category only if it currently equals `expected`.
    ///
    /// Returns whether the category was changed.
    async fn compare_and_set_state_category(
        &self,
        id: &FlowNodeInstanceId,
        expected: StateCategory,
        category: StateCategory,
    ) -> Result<bool, CoreError>;

    /// Overwrite the token count
    async fn set_token_count(&self, id: &FlowNodeInstanceId, count: i64) -> Result<(), CoreError>;

    /// Add `delta` tokens and return the new count
    async fn add_tokens(&self, id: &FlowNodeInstanceId, delta: i64) -> Result<i64, CoreError>;

    /// Record that a child reached a terminal state.
    ///
    /// Removes one token and, for iteration children, moves one active
    /// instance to completed or terminated. Keyed by the child id: a second
    /// call for the same child changes nothing and reports `counted: false`.
    async fn record_child_finished(
        &self,
        id: &FlowNodeInstanceId,
        child: &FinishedChild,
    ) -> Result<ChildTally, CoreError>;

    /// Increment the loop counter and return the new value
    async fn increment_loop_counter(&self, id: &FlowNodeInstanceId) -> Result<u32, CoreError>;

    /// Set the maximum iterations of a standard loop
    async fn set_loop_max(&self, id: &FlowNodeInstanceId, max: u32) -> Result<(), CoreError>;

    /// Set the number of instances of a multi-instance container
    async fn set_loop_cardinality(&self, id: &FlowNodeInstanceId, cardinality: u32) -> Result<(), CoreError>;

    /// Add `count` active instances, and as many tokens, to a multi-instance container
    async fn add_active_instances(
        &self,
        id: &FlowNodeInstanceId,
        count: u32,
    ) -> Result<MultiInstanceCounters, CoreError>;

    /// Record that `transition` reached a merging gateway.
    ///
    /// The hit goes to a waiting instance of the candidate's definition in
    /// the same process instance that was not hit by `transition` yet;
    /// otherwise the candidate is stored with that single hit. Returns the
    /// gateway and whether the candidate was created.
    async fn merge_gateway_hit(
        &self,
        candidate: FlowNodeInstance,
        waiting_state: StateId,
        transition: &TransitionId,
    ) -> Result<(FlowNodeInstance, bool), CoreError>;

    /// Set or clear the assignee of a human task
    async fn set_assignee(&self, id: &FlowNodeInstanceId, assignee: Option<String>) -> Result<(), CoreError>;

    /// Active children of a flow node, oldest first
    async fn get_children(
        &self,
        id: &FlowNodeInstanceId,
        page: Page,
    ) -> Result<Vec<FlowNodeInstance>, CoreError>;

    /// Active flow nodes of a process instance that have no parent activity
    async fn get_root_flow_nodes(
        &self,
        process_instance_id: &ProcessInstanceId,
    ) -> Result<Vec<FlowNodeInstance>, CoreError>;

    /// Every active flow node of a process instance
    async fn list_by_process(
        &self,
        process_instance_id: &ProcessInstanceId,
    ) -> Result<Vec<FlowNodeInstance>, CoreError>;

    /// Move the instance to the archive
    async fn archive(&self, id: &FlowNodeInstanceId) -> Result<(), CoreError>;

    /// Find an archived flow node instance
    async fn find_archived(&self, id: &FlowNodeInstanceId) -> Result<Option<FlowNodeInstance>, CoreError>;

    /// Archived flow nodes of a process instance
    async fn list_archived_by_process(
        &self,
        process_instance_id: &ProcessInstanceId,
    ) -> Result<Vec<FlowNodeInstance>, CoreError>;

    /// Get an active flow node instance, failing with `NotFound`
    async fn get(&self, id: &FlowNodeInstanceId) -> Result<FlowNodeInstance, CoreError> {
        self.find_by_id(id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("Flow node instance {}", id)))
    }
}

/// Repository for process instances
#[async_trait]
pub trait ProcessInstanceRepository: Send + Sync {
    /// Find an active process instance by ID
    async fn find_by_id(&self, id: &ProcessInstanceId) -> Result<Option<ProcessInstance>, CoreError>;

    /// Store a new process instance
    async fn create(&self, instance: ProcessInstance) -> Result<(), CoreError>;

    /// Set the process state
    async fn set_state(&self, id: &ProcessInstanceId, state: ProcessState) -> Result<(), CoreError>;

    /// Set the state category
    async fn set_state_category(
        &self,
        id: &ProcessInstanceId,
        category: StateCategory,
    ) -> Result<(), CoreError>;

    /// Add `delta` tokens and return the new count
    async fn add_tokens(&self, id: &ProcessInstanceId, delta: i64) -> Result<i64, CoreError>;

    /// Record that a root flow node reached a terminal state; idempotent per child
    async fn record_child_finished(
        &self,
        id: &ProcessInstanceId,
        child: &FinishedChild,
    ) -> Result<ChildTally, CoreError>;

    /// Flag the process as ended by a terminate end event
    async fn set_terminated(&self, id: &ProcessInstanceId) -> Result<(), CoreError>;

    /// The process started by a call activity
    async fn find_by_caller(&self, caller: &FlowNodeInstanceId) -> Result<Option<ProcessInstance>, CoreError>;

    /// Active process instances
    async fn list_active(&self) -> Result<Vec<ProcessInstance>, CoreError>;

    /// Move the instance to the archive; `NotFound` when already archived
    async fn archive(&self, id: &ProcessInstanceId) -> Result<(), CoreError>;

    /// Find an archived process instance
    async fn find_archived(&self, id: &ProcessInstanceId) -> Result<Option<ProcessInstance>, CoreError>;

    /// Get an active process instance, failing with `NotFound`
    async fn get(&self, id: &ProcessInstanceId) -> Result<ProcessInstance, CoreError> {
        self.find_by_id(id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("Process instance {}", id)))
    }
}

/// Repository for connector instances
#[async_trait]
pub trait ConnectorInstanceRepository: Send + Sync {
    /// Store a new connector instance
    async fn create(&self, instance: ConnectorInstance) -> Result<(), CoreError>;

    /// Find a connector instance by ID
    async fn find_by_id(&self, id: &ConnectorInstanceId) -> Result<Option<ConnectorInstance>, CoreError>;

    /// Set the state of a connector instance
    async fn set_state(&self, id: &ConnectorInstanceId, state: ConnectorState) -> Result<(), CoreError>;

    /// Whether the flow node has connectors for `event`
    async fn has_connectors(
        &self,
        container: &FlowNodeInstanceId,
        event: ConnectorEvent,
    ) -> Result<bool, CoreError>;

    /// First connector of `event`, in position order, that is not done
    async fn next_connector_instance(
        &self,
        container: &FlowNodeInstanceId,
        event: ConnectorEvent,
    ) -> Result<Option<ConnectorInstance>, CoreError>;

    /// Whether every connector of `event` is still to be executed
    async fn no_connector_has_started(
        &self,
        container: &FlowNodeInstanceId,
        event: ConnectorEvent,
    ) -> Result<bool, CoreError>;

    /// Connectors of a flow node
    async fn list_for_container(&self, container: &FlowNodeInstanceId) -> Result<Vec<ConnectorInstance>, CoreError>;

    /// Remove the connectors of a flow node
    async fn delete_for_container(&self, container: &FlowNodeInstanceId) -> Result<(), CoreError>;

    /// Progress of the connectors bound to `event`
    async fn progress(
        &self,
        container: &FlowNodeInstanceId,
        event: ConnectorEvent,
    ) -> Result<ConnectorProgress, CoreError> {
        if !self.has_connectors(container, event).await? {
            return Ok(ConnectorProgress::NoConnector);
        }
        match self.next_connector_instance(container, event).await? {
            None => Ok(ConnectorProgress::Drained),
            Some(next) => {
                if self.no_connector_has_started(container, event).await? {
                    Ok(ConnectorProgress::NotStarted(next))
                } else {
                    Ok(ConnectorProgress::Pending(next))
                }
            }
        }
    }
}

/// Repository for variables of process and flow node instances.
///
/// Containers are identified by the id of the owning instance. Variables
/// outlive the archival of their container.
#[async_trait]
pub trait DataInstanceRepository: Send + Sync {
    /// Declare a variable in a container, overwriting any previous value
    async fn create(&self, container: &str, name: &str, value: DataPacket) -> Result<(), CoreError>;

    /// All variables of a container
    async fn get_variables(&self, container: &str) -> Result<Variables, CoreError>;

    /// Update an existing variable
    async fn set_variable(&self, container: &str, name: &str, value: DataPacket) -> Result<(), CoreError>;

    /// Atomically set element `index` of the list held by `name`, growing it with nulls
    async fn set_collection_item(
        &self,
        container: &str,
        name: &str,
        index: usize,
        value: DataPacket,
    ) -> Result<(), CoreError>;

    /// Read one variable
    async fn get_variable(&self, container: &str, name: &str) -> Result<Option<DataPacket>, CoreError> {
        Ok(self.get_variables(container).await?.remove(name))
    }
}

/// Repository for event subscriptions of waiting flow nodes
#[async_trait]
pub trait EventSubscriptionRepository: Send + Sync {
    /// Store a subscription
    async fn subscribe(&self, subscription: EventSubscription) -> Result<(), CoreError>;

    /// Remove the subscriptions of a flow node
    async fn unsubscribe_flow_node(&self, flow_node: &FlowNodeInstanceId) -> Result<(), CoreError>;

    /// Remove the subscriptions of every flow node of a process instance
    async fn unsubscribe_process(&self, process: &ProcessInstanceId) -> Result<(), CoreError>;

    /// Remove and return the subscriptions reached by a thrown event
    async fn take_matching(
        &self,
        trigger: &EventTrigger,
        process: Option<&ProcessInstanceId>,
    ) -> Result<Vec<EventSubscription>, CoreError>;

    /// Remove and return the subscriptions of a flow node
    async fn take_for_flow_node(&self, flow_node: &FlowNodeInstanceId) -> Result<Vec<EventSubscription>, CoreError>;

    /// Subscriptions of a flow node
    async fn list_for_flow_node(&self, flow_node: &FlowNodeInstanceId) -> Result<Vec<EventSubscription>, CoreError>;
}
