use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, trace};

use flowline_core::domain::connector::{ConnectorInstance, ConnectorInstanceId, ConnectorState};
use flowline_core::domain::event_subscription::{EventSubscription, SubscriptionId};
use flowline_core::domain::flow_node_instance::{
    ChildOutcome, ChildTally, FinishedChild, FlowNodeInstance, FlowNodeInstanceId, InstanceRole,
    MultiInstanceCounters, ProcessInstanceId, StateCategory,
};
use flowline_core::domain::process_definition::{
    ConnectorEvent, EventTrigger, ProcessDefinition, ProcessDefinitionId, TransitionId,
};
use flowline_core::domain::process_instance::{ProcessInstance, ProcessState};
use flowline_core::domain::repository::{
    ConnectorInstanceRepository, DataInstanceRepository, EventSubscriptionRepository,
    FlowNodeInstanceRepository, Page, ProcessDefinitionRepository, ProcessInstanceRepository,
};
use flowline_core::{CoreError, DataPacket, StateId, Variables};

use crate::error::InMemoryError;

/// In-memory implementation of the ProcessDefinitionRepository
#[derive(Debug, Default)]
pub struct InMemoryProcessDefinitionRepository {
    definitions: DashMap<ProcessDefinitionId, (u64, Arc<ProcessDefinition>)>,
    deployments: AtomicU64,
}

impl InMemoryProcessDefinitionRepository {
    /// Create an empty repository
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProcessDefinitionRepository for InMemoryProcessDefinitionRepository {
    async fn find_by_id(&self, id: &ProcessDefinitionId) -> Result<Option<Arc<ProcessDefinition>>, CoreError> {
        Ok(self.definitions.get(id).map(|entry| entry.1.clone()))
    }

    async fn find_by_name(
        &self,
        name: &str,
        version: Option<&str>,
    ) -> Result<Option<Arc<ProcessDefinition>>, CoreError> {
        // Latest deployment wins
        Ok(self
            .definitions
            .iter()
            .filter(|entry| entry.1.name == name)
            .filter(|entry| version.map_or(true, |v| entry.1.version == v))
            .max_by_key(|entry| entry.0)
            .map(|entry| entry.1.clone()))
    }

    async fn save(&self, definition: ProcessDefinition) -> Result<Arc<ProcessDefinition>, CoreError> {
        let sequence = self.deployments.fetch_add(1, Ordering::SeqCst);
        let definition = Arc::new(definition);
        self.definitions
            .insert(definition.id.clone(), (sequence, definition.clone()));
        debug!(definition = %definition.id.0, name = %definition.name, "process definition saved");
        Ok(definition)
    }
}

/// In-memory implementation of the FlowNodeInstanceRepository.
///
/// Each update runs under the entry lock of the instance, so counter
/// updates are atomic without any store-wide lock.
#[derive(Debug, Default)]
pub struct InMemoryFlowNodeInstanceRepository {
    active: DashMap<FlowNodeInstanceId, FlowNodeInstance>,
    archived: DashMap<FlowNodeInstanceId, FlowNodeInstance>,
    gateway_merge: Mutex<()>,
}

impl InMemoryFlowNodeInstanceRepository {
    /// Create an empty repository
    pub fn new() -> Self {
        Self::default()
    }

    fn update<T>(
        &self,
        id: &FlowNodeInstanceId,
        f: impl FnOnce(&mut FlowNodeInstance) -> T,
    ) -> Result<T, CoreError> {
        let mut entry = self
            .active
            .get_mut(id)
            .ok_or_else(|| InMemoryError::FlowNodeNotFound(id.0.clone()))?;
        let result = f(entry.value_mut());
        entry.touch();
        Ok(result)
    }

    fn sorted(mut instances: Vec<FlowNodeInstance>) -> Vec<FlowNodeInstance> {
        instances.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        instances
    }

    fn waiting_gateway(
        &self,
        candidate: &FlowNodeInstance,
        waiting_state: StateId,
        transition: &TransitionId,
    ) -> Option<FlowNodeInstanceId> {
        let matching: Vec<FlowNodeInstance> = self
            .active
            .iter()
            .filter(|entry| {
                let gateway = entry.value();
                gateway.parent_process_instance_id == candidate.parent_process_instance_id
                    && gateway.definition_id == candidate.definition_id
                    && gateway.parent_activity_id == candidate.parent_activity_id
                    && gateway.state_id == waiting_state
                    && gateway.state_category == StateCategory::Normal
                    && !gateway.gateway_hits.contains(transition)
            })
            .map(|entry| entry.value().clone())
            .collect();
        Self::sorted(matching).into_iter().next().map(|gateway| gateway.id)
    }
}

#[async_trait]
impl FlowNodeInstanceRepository for InMemoryFlowNodeInstanceRepository {
    async fn find_by_id(&self, id: &FlowNodeInstanceId) -> Result<Option<FlowNodeInstance>, CoreError> {
        Ok(self.active.get(id).map(|entry| entry.value().clone()))
    }

    async fn create(&self, instance: FlowNodeInstance) -> Result<(), CoreError> {
        if self.active.contains_key(&instance.id) || self.archived.contains_key(&instance.id) {
            return Err(InMemoryError::Duplicate(instance.id.0.clone()).into());
        }
        trace!(flow_node = %instance.id, kind = ?instance.kind, "flow node instance created");
        self.active.insert(instance.id.clone(), instance);
        Ok(())
    }

    async fn set_state(
        &self,
        id: &FlowNodeInstanceId,
        state: StateId,
        executing: bool,
    ) -> Result<FlowNodeInstance, CoreError> {
        self.update(id, |instance| {
            instance.state_id = state;
            instance.state_executing = executing;
            instance.clone()
        })
    }

    async fn set_state_category(&self, id: &FlowNodeInstanceId, category: StateCategory) -> Result<(), CoreError> {
        self.update(id, |instance| instance.state_category = category)
    }

    async fn compare_and_set_state_category(
        &self,
        id: &FlowNodeInstanceId,
        expected: StateCategory,
        category: StateCategory,
    ) -> Result<bool, CoreError> {
        self.update(id, |instance| {
            if instance.state_category != expected {
                return false;
            }
            instance.state_category = category;
            true
        })
    }

    async fn set_token_count(&self, id: &FlowNodeInstanceId, count: i64) -> Result<(), CoreError> {
        self.update(id, |instance| instance.token_count = count)
    }

    async fn add_tokens(&self, id: &FlowNodeInstanceId, delta: i64) -> Result<i64, CoreError> {
        self.update(id, |instance| {
            instance.token_count += delta;
            instance.token_count
        })
    }

    async fn record_child_finished(
        &self,
        id: &FlowNodeInstanceId,
        child: &FinishedChild,
    ) -> Result<ChildTally, CoreError> {
        self.update(id, |instance| {
            let counted = instance.finished_children.insert(child.id.clone());
            if counted {
                instance.token_count -= 1;
                if child.role == InstanceRole::Iteration {
                    let counters = &mut instance.multi_instance;
                    counters.active = counters.active.saturating_sub(1);
                    match child.outcome {
                        ChildOutcome::Completed => counters.completed += 1,
                        ChildOutcome::Aborted | ChildOutcome::Cancelled => counters.terminated += 1,
                    }
                }
            }
            ChildTally {
                counted,
                token_count: instance.token_count,
                multi_instance: instance.multi_instance,
            }
        })
    }

    async fn increment_loop_counter(&self, id: &FlowNodeInstanceId) -> Result<u32, CoreError> {
        self.update(id, |instance| {
            instance.loop_counter += 1;
            instance.loop_counter
        })
    }

    async fn set_loop_max(&self, id: &FlowNodeInstanceId, max: u32) -> Result<(), CoreError> {
        self.update(id, |instance| instance.loop_max = Some(max))
    }

    async fn set_loop_cardinality(&self, id: &FlowNodeInstanceId, cardinality: u32) -> Result<(), CoreError> {
        self.update(id, |instance| instance.multi_instance.number_of_instances = cardinality)
    }

    async fn add_active_instances(
        &self,
        id: &FlowNodeInstanceId,
        count: u32,
    ) -> Result<MultiInstanceCounters, CoreError> {
        self.update(id, |instance| {
            instance.multi_instance.active += count;
            instance.token_count += i64::from(count);
            instance.multi_instance
        })
    }

    async fn merge_gateway_hit(
        &self,
        mut candidate: FlowNodeInstance,
        waiting_state: StateId,
        transition: &TransitionId,
    ) -> Result<(FlowNodeInstance, bool), CoreError> {
        // Merges of the same gateway must not both create an instance
        let _merging = self
            .gateway_merge
            .lock()
            .map_err(|_| CoreError::StateStore("gateway merge lock poisoned".to_string()))?;

        if let Some(id) = self.waiting_gateway(&candidate, waiting_state, transition) {
            if let Some(mut gateway) = self.active.get_mut(&id) {
                // the gateway may have moved on since the scan
                if gateway.state_id == waiting_state && !gateway.gateway_hits.contains(transition) {
                    gateway.gateway_hits.insert(transition.clone());
                    gateway.touch();
                    trace!(gateway = %id, transition = %transition.0, "gateway hit merged");
                    return Ok((gateway.clone(), false));
                }
            }
        }

        candidate.gateway_hits.insert(transition.clone());
        self.active.insert(candidate.id.clone(), candidate.clone());
        trace!(gateway = %candidate.id, transition = %transition.0, "gateway created");
        Ok((candidate, true))
    }

    async fn set_assignee(&self, id: &FlowNodeInstanceId, assignee: Option<String>) -> Result<(), CoreError> {
        self.update(id, |instance| instance.assignee = assignee)
    }

    async fn get_children(&self, id: &FlowNodeInstanceId, page: Page) -> Result<Vec<FlowNodeInstance>, CoreError> {
        let children: Vec<FlowNodeInstance> = self
            .active
            .iter()
            .filter(|entry| entry.parent_activity_id.as_ref() == Some(id))
            .map(|entry| entry.value().clone())
            .collect();
        Ok(Self::sorted(children)
            .into_iter()
            .skip(page.offset)
            .take(page.limit)
            .collect())
    }

    async fn get_root_flow_nodes(
        &self,
        process_instance_id: &ProcessInstanceId,
    ) -> Result<Vec<FlowNodeInstance>, CoreError> {
        let roots: Vec<FlowNodeInstance> = self
            .active
            .iter()
            .filter(|entry| {
                &entry.parent_process_instance_id == process_instance_id && entry.parent_activity_id.is_none()
            })
            .map(|entry| entry.value().clone())
            .collect();
        Ok(Self::sorted(roots))
    }

    async fn list_by_process(
        &self,
        process_instance_id: &ProcessInstanceId,
    ) -> Result<Vec<FlowNodeInstance>, CoreError> {
        let nodes: Vec<FlowNodeInstance> = self
            .active
            .iter()
            .filter(|entry| &entry.parent_process_instance_id == process_instance_id)
            .map(|entry| entry.value().clone())
            .collect();
        Ok(Self::sorted(nodes))
    }

    async fn archive(&self, id: &FlowNodeInstanceId) -> Result<(), CoreError> {
        let (_, mut instance) = self
            .active
            .remove(id)
            .ok_or_else(|| InMemoryError::FlowNodeNotFound(id.0.clone()))?;
        instance.touch();
        self.archived.insert(id.clone(), instance);
        Ok(())
    }

    async fn find_archived(&self, id: &FlowNodeInstanceId) -> Result<Option<FlowNodeInstance>, CoreError> {
        Ok(self.archived.get(id).map(|entry| entry.value().clone()))
    }

    async fn list_archived_by_process(
        &self,
        process_instance_id: &ProcessInstanceId,
    ) -> Result<Vec<FlowNodeInstance>, CoreError> {
        let nodes: Vec<FlowNodeInstance> = self
            .archived
            .iter()
            .filter(|entry| &entry.parent_process_instance_id == process_instance_id)
            .map(|entry| entry.value().clone())
            .collect();
        Ok(Self::sorted(nodes))
    }
}

/// In-memory implementation of the ProcessInstanceRepository
#[derive(Debug, Default)]
pub struct InMemoryProcessInstanceRepository {
    active: DashMap<ProcessInstanceId, ProcessInstance>,
    archived: DashMap<ProcessInstanceId, ProcessInstance>,
}

impl InMemoryProcessInstanceRepository {
    /// Create an empty repository
    pub fn new() -> Self {
        Self::default()
    }

    fn update<T>(&self, id: &ProcessInstanceId, f: impl FnOnce(&mut ProcessInstance) -> T) -> Result<T, CoreError> {
        let mut entry = self
            .active
            .get_mut(id)
            .ok_or_else(|| InMemoryError::ProcessNotFound(id.0.clone()))?;
        let result = f(entry.value_mut());
        entry.updated_at = Utc::now();
        Ok(result)
    }
}

#[async_trait]
impl ProcessInstanceRepository for InMemoryProcessInstanceRepository {
    async fn find_by_id(&self, id: &ProcessInstanceId) -> Result<Option<ProcessInstance>, CoreError> {
        Ok(self.active.get(id).map(|entry| entry.value().clone()))
    }

    async fn create(&self, instance: ProcessInstance) -> Result<(), CoreError> {
        if self.active.contains_key(&instance.id) || self.archived.contains_key(&instance.id) {
            return Err(InMemoryError::Duplicate(instance.id.0.clone()).into());
        }
        self.active.insert(instance.id.clone(), instance);
        Ok(())
    }

    async fn set_state(&self, id: &ProcessInstanceId, state: ProcessState) -> Result<(), CoreError> {
        self.update(id, |process| process.state = state)
    }

    async fn set_state_category(&self, id: &ProcessInstanceId, category: StateCategory) -> Result<(), CoreError> {
        self.update(id, |process| process.state_category = category)
    }

    async fn add_tokens(&self, id: &ProcessInstanceId, delta: i64) -> Result<i64, CoreError> {
        self.update(id, |process| {
            process.token_count += delta;
            process.token_count
        })
    }

    async fn record_child_finished(
        &self,
        id: &ProcessInstanceId,
        child: &FinishedChild,
    ) -> Result<ChildTally, CoreError> {
        self.update(id, |process| {
            let counted = process.finished_children.insert(child.id.clone());
            if counted {
                process.token_count -= 1;
            }
            ChildTally {
                counted,
                token_count: process.token_count,
                multi_instance: MultiInstanceCounters::default(),
            }
        })
    }

    async fn set_terminated(&self, id: &ProcessInstanceId) -> Result<(), CoreError> {
        self.update(id, |process| process.terminated = true)
    }

    async fn find_by_caller(&self, caller: &FlowNodeInstanceId) -> Result<Option<ProcessInstance>, CoreError> {
        Ok(self
            .active
            .iter()
            .find(|entry| entry.caller_id.as_ref() == Some(caller))
            .map(|entry| entry.value().clone()))
    }

    async fn list_active(&self) -> Result<Vec<ProcessInstance>, CoreError> {
        let mut processes: Vec<ProcessInstance> = self.active.iter().map(|entry| entry.value().clone()).collect();
        processes.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(processes)
    }

    async fn archive(&self, id: &ProcessInstanceId) -> Result<(), CoreError> {
        let (_, mut process) = self
            .active
            .remove(id)
            .ok_or_else(|| InMemoryError::ProcessNotFound(id.0.clone()))?;
        process.updated_at = Utc::now();
        debug!(process = %id, state = ?process.state, "process instance archived");
        self.archived.insert(id.clone(), process);
        Ok(())
    }

    async fn find_archived(&self, id: &ProcessInstanceId) -> Result<Option<ProcessInstance>, CoreError> {
        Ok(self.archived.get(id).map(|entry| entry.value().clone()))
    }
}

/// In-memory implementation of the ConnectorInstanceRepository
#[derive(Debug, Default)]
pub struct InMemoryConnectorInstanceRepository {
    connectors: DashMap<ConnectorInstanceId, ConnectorInstance>,
}

impl InMemoryConnectorInstanceRepository {
    /// Create an empty repository
    pub fn new() -> Self {
        Self::default()
    }

    fn of_event(&self, container: &FlowNodeInstanceId, event: ConnectorEvent) -> Vec<ConnectorInstance> {
        let mut connectors: Vec<ConnectorInstance> = self
            .connectors
            .iter()
            .filter(|entry| &entry.container_id == container && entry.event == event)
            .map(|entry| entry.value().clone())
            .collect();
        connectors.sort_by_key(|connector| connector.position);
        connectors
    }
}

#[async_trait]
impl ConnectorInstanceRepository for InMemoryConnectorInstanceRepository {
    async fn create(&self, instance: ConnectorInstance) -> Result<(), CoreError> {
        self.connectors.insert(instance.id.clone(), instance);
        Ok(())
    }

    async fn find_by_id(&self, id: &ConnectorInstanceId) -> Result<Option<ConnectorInstance>, CoreError> {
        Ok(self.connectors.get(id).map(|entry| entry.value().clone()))
    }

    async fn set_state(&self, id: &ConnectorInstanceId, state: ConnectorState) -> Result<(), CoreError> {
        let mut entry = self
            .connectors
            .get_mut(id)
            .ok_or_else(|| InMemoryError::ConnectorNotFound(id.0.clone()))?;
        entry.state = state;
        Ok(())
    }

    async fn has_connectors(&self, container: &FlowNodeInstanceId, event: ConnectorEvent) -> Result<bool, CoreError> {
        Ok(self
            .connectors
            .iter()
            .any(|entry| &entry.container_id == container && entry.event == event))
    }

    async fn next_connector_instance(
        &self,
        container: &FlowNodeInstanceId,
        event: ConnectorEvent,
    ) -> Result<Option<ConnectorInstance>, CoreError> {
        Ok(self
            .of_event(container, event)
            .into_iter()
            .find(|connector| connector.state != ConnectorState::Done))
    }

    async fn no_connector_has_started(
        &self,
        container: &FlowNodeInstanceId,
        event: ConnectorEvent,
    ) -> Result<bool, CoreError> {
        Ok(self
            .of_event(container, event)
            .iter()
            .all(|connector| connector.state == ConnectorState::ToBeExecuted))
    }

    async fn list_for_container(&self, container: &FlowNodeInstanceId) -> Result<Vec<ConnectorInstance>, CoreError> {
        let mut connectors: Vec<ConnectorInstance> = self
            .connectors
            .iter()
            .filter(|entry| &entry.container_id == container)
            .map(|entry| entry.value().clone())
            .collect();
        connectors.sort_by_key(|connector| (connector.event, connector.position));
        Ok(connectors)
    }

    async fn delete_for_container(&self, container: &FlowNodeInstanceId) -> Result<(), CoreError> {
        self.connectors.retain(|_, connector| &connector.container_id != container);
        Ok(())
    }
}

/// In-memory implementation of the DataInstanceRepository
#[derive(Debug, Default)]
pub struct InMemoryDataInstanceRepository {
    containers: DashMap<String, HashMap<String, DataPacket>>,
}

impl InMemoryDataInstanceRepository {
    /// Create an empty repository
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DataInstanceRepository for InMemoryDataInstanceRepository {
    async fn create(&self, container: &str, name: &str, value: DataPacket) -> Result<(), CoreError> {
        self.containers
            .entry(container.to_string())
            .or_default()
            .insert(name.to_string(), value);
        Ok(())
    }

    async fn get_variables(&self, container: &str) -> Result<Variables, CoreError> {
        Ok(self
            .containers
            .get(container)
            .map(|entry| entry.value().clone())
            .unwrap_or_default())
    }

    async fn set_variable(&self, container: &str, name: &str, value: DataPacket) -> Result<(), CoreError> {
        let not_found = || InMemoryError::VariableNotFound {
            container: container.to_string(),
            name: name.to_string(),
        };
        let mut variables = self.containers.get_mut(container).ok_or_else(not_found)?;
        let slot = variables.get_mut(name).ok_or_else(not_found)?;
        *slot = value;
        Ok(())
    }

    async fn set_collection_item(
        &self,
        container: &str,
        name: &str,
        index: usize,
        value: DataPacket,
    ) -> Result<(), CoreError> {
        let mut variables = self.containers.entry(container.to_string()).or_default();
        let slot = variables.entry(name.to_string()).or_insert_with(DataPacket::null);
        if !slot.value.is_array() {
            slot.value = serde_json::Value::Array(Vec::new());
        }
        if let serde_json::Value::Array(items) = &mut slot.value {
            if items.len() <= index {
                items.resize(index + 1, serde_json::Value::Null);
            }
            items[index] = value.into_value();
        }
        Ok(())
    }
}

/// In-memory implementation of the EventSubscriptionRepository
#[derive(Debug, Default)]
pub struct InMemoryEventSubscriptionRepository {
    subscriptions: DashMap<SubscriptionId, EventSubscription>,
}

impl InMemoryEventSubscriptionRepository {
    /// Create an empty repository
    pub fn new() -> Self {
        Self::default()
    }

    fn take_where(&self, keep: impl Fn(&EventSubscription) -> bool) -> Vec<EventSubscription> {
        let ids: Vec<SubscriptionId> = self
            .subscriptions
            .iter()
            .filter(|entry| keep(entry.value()))
            .map(|entry| entry.key().clone())
            .collect();
        // a concurrent taker may win some of them
        let mut taken: Vec<EventSubscription> = ids
            .iter()
            .filter_map(|id| self.subscriptions.remove(id).map(|(_, subscription)| subscription))
            .collect();
        taken.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        taken
    }
}

#[async_trait]
impl EventSubscriptionRepository for InMemoryEventSubscriptionRepository {
    async fn subscribe(&self, subscription: EventSubscription) -> Result<(), CoreError> {
        self.subscriptions.insert(subscription.id.clone(), subscription);
        Ok(())
    }

    async fn unsubscribe_flow_node(&self, flow_node: &FlowNodeInstanceId) -> Result<(), CoreError> {
        self.subscriptions
            .retain(|_, subscription| &subscription.flow_node_instance_id != flow_node);
        Ok(())
    }

    async fn unsubscribe_process(&self, process: &ProcessInstanceId) -> Result<(), CoreError> {
        self.subscriptions
            .retain(|_, subscription| &subscription.process_instance_id != process);
        Ok(())
    }

    async fn take_matching(
        &self,
        trigger: &EventTrigger,
        process: Option<&ProcessInstanceId>,
    ) -> Result<Vec<EventSubscription>, CoreError> {
        Ok(self.take_where(|subscription| subscription.matches(trigger, process)))
    }

    async fn take_for_flow_node(&self, flow_node: &FlowNodeInstanceId) -> Result<Vec<EventSubscription>, CoreError> {
        Ok(self.take_where(|subscription| &subscription.flow_node_instance_id == flow_node))
    }

    async fn list_for_flow_node(&self, flow_node: &FlowNodeInstanceId) -> Result<Vec<EventSubscription>, CoreError> {
        Ok(self
            .subscriptions
            .iter()
            .filter(|entry| &entry.flow_node_instance_id == flow_node)
            .map(|entry| entry.value().clone())
            .collect())
    }
}
