//! Operations shared by the flow node states
//!
//! States never talk to the stores directly for anything beyond a single
//! counter update. Creating instances, resolving variables across scopes,
//! running connectors and operations, and interrupting subtrees all go
//! through [`StateBehaviors`].

use serde_json::json;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, trace};

use crate::application::services::EngineServices;
use crate::application::work::ConnectorRequest;
use crate::domain::connector::{ConnectorInstance, ConnectorProgress, ConnectorState};
use crate::domain::event_subscription::EventSubscription;
use crate::domain::events::DomainEvent;
use crate::domain::expression::{
    EvaluationContext, LOOP_COUNTER, NUMBER_OF_ACTIVE_INSTANCES, NUMBER_OF_COMPLETED_INSTANCES,
    NUMBER_OF_INSTANCES, NUMBER_OF_TERMINATED_INSTANCES,
};
use crate::domain::flow_node_instance::{
    ChildTally, FinishedChild, FlowNodeInstance, FlowNodeInstanceId, FlowNodeKind, InstanceRole,
    ProcessInstanceId, StateCategory,
};
use crate::domain::process_definition::{
    ConnectorEvent, EventTrigger, Expression, Operation, ProcessDefinition,
};
use crate::domain::process_instance::ProcessInstance;
use crate::domain::repository::Page;
use crate::state::{first_state_id, StateCode, StateId};
use crate::types::{DataPacket, Variables};
use crate::{CoreError, CoreResult};

/// Parent chains deeper than this are treated as corrupt
const MAX_SCOPE_DEPTH: usize = 32;

/// Store-backed operations used by the states
pub struct StateBehaviors {
    services: Arc<EngineServices>,
}

impl fmt::Debug for StateBehaviors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateBehaviors").finish_non_exhaustive()
    }
}

impl StateBehaviors {
    /// Create the behaviours on top of the engine services
    pub fn new(services: Arc<EngineServices>) -> Self {
        Self { services }
    }

    /// The engine services
    pub fn services(&self) -> &EngineServices {
        &self.services
    }

    /// Publish a domain event
    pub async fn emit<E: DomainEvent + 'static>(&self, event: E) -> CoreResult<()> {
        self.services.events.handle_event(Box::new(event)).await
    }

    // ---- connectors ----

    /// Progress of the connectors bound to `event`
    pub async fn connector_progress(
        &self,
        instance: &FlowNodeInstance,
        event: ConnectorEvent,
    ) -> CoreResult<ConnectorProgress> {
        self.services.connectors.progress(&instance.id, event).await
    }

    /// Create the connector instances of a new flow node
    pub async fn create_connectors(&self, process: &ProcessDefinition, instance: &FlowNodeInstance) -> CoreResult<()> {
        let definition = process.flow_node(&instance.definition_id)?;
        for event in [ConnectorEvent::OnEnter, ConnectorEvent::OnFinish] {
            for (position, connector) in definition.connectors_for(event).enumerate() {
                self.services
                    .connectors
                    .create(ConnectorInstance::new(instance.id.clone(), connector, position))
                    .await?;
            }
        }
        Ok(())
    }

    /// Dispatch a connector, at most once.
    ///
    /// Returns `Executing` while the connector runs; the flow node is driven
    /// again in `expected_state` once the connector reports back.
    pub async fn execute_connector(
        &self,
        instance: &FlowNodeInstance,
        connector: &ConnectorInstance,
        expected_state: StateId,
    ) -> CoreResult<StateCode> {
        match connector.state {
            ConnectorState::Done => Ok(StateCode::Done),
            ConnectorState::Executing => {
                trace!(flow_node = %instance.id, connector = %connector.name, "connector still running");
                Ok(StateCode::Executing)
            }
            ConnectorState::Failed => Err(CoreError::execution(format!(
                "Connector {} of flow node {} failed",
                connector.name, instance.id
            ))),
            ConnectorState::ToBeExecuted => {
                let process = self
                    .services
                    .definitions
                    .get(&instance.process_definition_id)
                    .await?;
                let definition = process
                    .flow_node(&instance.definition_id)?
                    .connector(&connector.name)
                    .cloned()
                    .ok_or_else(|| {
                        CoreError::definition(format!(
                            "Connector {} is not declared on {}",
                            connector.name, instance.definition_id.0
                        ))
                    })?;

                let context = self.evaluation_context(instance).await?;
                let mut inputs = Variables::new();
                for (name, expression) in &definition.inputs {
                    inputs.insert(name.clone(), self.evaluate(expression, &context)?);
                }

                self.services
                    .connectors
                    .set_state(&connector.id, ConnectorState::Executing)
                    .await?;
                debug!(
                    flow_node = %instance.id,
                    connector = %connector.name,
                    implementation = %definition.connector_id,
                    "dispatching connector"
                );
                self.services
                    .connector_executor
                    .execute_connector_in_work(ConnectorRequest {
                        connector_instance_id: connector.id.clone(),
                        flow_node_instance_id: instance.id.clone(),
                        process_instance_id: instance.parent_process_instance_id.clone(),
                        definition,
                        inputs,
                        expected_state,
                    })
                    .await?;
                Ok(StateCode::Executing)
            }
        }
    }

    // ---- flow node instances ----

    /// Store a new flow node instance with its connectors
    pub async fn create_flow_node(
        &self,
        process: &ProcessDefinition,
        instance: FlowNodeInstance,
    ) -> CoreResult<FlowNodeInstance> {
        self.services.flow_nodes.create(instance.clone()).await?;
        self.create_connectors(process, &instance).await?;
        trace!(flow_node = %instance.id, kind = ?instance.kind, "flow node created");
        Ok(instance)
    }

    /// Create iteration `index` of a loop or multi-instance container; the
    /// caller accounts for its token and dispatches it
    pub async fn create_iteration(
        &self,
        process: &ProcessDefinition,
        parent: &FlowNodeInstance,
        index: u32,
    ) -> CoreResult<FlowNodeInstance> {
        let definition = process.flow_node(&parent.definition_id)?;
        let kind = FlowNodeKind::for_iteration(definition);
        let iteration = FlowNodeInstance::new(
            process.id.clone(),
            definition,
            kind,
            first_state_id(kind),
            parent.parent_process_instance_id.clone(),
            parent.root_process_instance_id.clone(),
        )
        .with_parent_activity(&parent.id, InstanceRole::Iteration, index);
        self.create_flow_node(process, iteration).await
    }

    /// Create and start the boundary events attached to an activity.
    ///
    /// Iterations never get boundary events; their container does.
    pub async fn create_boundary_events(&self, process: &ProcessDefinition, instance: &FlowNodeInstance) -> CoreResult<()> {
        if instance.role == InstanceRole::Iteration {
            return Ok(());
        }
        let definitions = process.boundary_events_of(&instance.definition_id);
        if definitions.is_empty() {
            return Ok(());
        }
        if self
            .children(&instance.id)
            .await?
            .iter()
            .any(|child| child.role == InstanceRole::Boundary)
        {
            return Ok(());
        }

        self.services
            .flow_nodes
            .add_tokens(&instance.id, definitions.len() as i64)
            .await?;
        let mut created = Vec::with_capacity(definitions.len());
        for definition in definitions {
            let boundary = FlowNodeInstance::new(
                process.id.clone(),
                definition,
                FlowNodeKind::BoundaryEvent,
                first_state_id(FlowNodeKind::BoundaryEvent),
                instance.parent_process_instance_id.clone(),
                instance.root_process_instance_id.clone(),
            )
            .with_parent_activity(&instance.id, InstanceRole::Boundary, 0);
            created.push(self.create_flow_node(process, boundary).await?.id);
        }
        debug!(activity = %instance.id, count = created.len(), "boundary events attached");
        for id in created {
            self.services.dispatcher.execute_flow_node(&id, None).await?;
        }
        Ok(())
    }

    /// Every active child of a flow node, oldest first
    pub async fn children(&self, id: &FlowNodeInstanceId) -> CoreResult<Vec<FlowNodeInstance>> {
        let mut page = Page::first(self.services.config.children_page_size);
        let mut children = Vec::new();
        loop {
            let batch = self.services.flow_nodes.get_children(id, page).await?;
            let complete = batch.len() < page.limit;
            children.extend(batch);
            if complete {
                return Ok(children);
            }
            page = page.next();
        }
    }

    /// Whether another live token of the process can still arrive at `join`.
    ///
    /// Root flow nodes stay in the store until they have followed their
    /// transitions, so any of them except failed ones still counts.
    pub async fn tokens_upstream_of(&self, process: &ProcessDefinition, join: &FlowNodeInstance) -> CoreResult<bool> {
        let roots = self
            .services
            .flow_nodes
            .get_root_flow_nodes(&join.parent_process_instance_id)
            .await?;
        let pending = roots
            .iter()
            .filter(|root| root.id != join.id && root.state_id != StateId::FAILED)
            .find(|root| process.can_reach(&root.definition_id, &join.definition_id));
        if let Some(root) = pending {
            trace!(gateway = %join.id, upstream = %root.id, "inclusive gateway still waiting");
        }
        Ok(pending.is_some())
    }

    /// Active iterations of a loop or multi-instance container
    pub async fn iterations_of(&self, instance: &FlowNodeInstance) -> CoreResult<Vec<FlowNodeInstance>> {
        Ok(self
            .children(&instance.id)
            .await?
            .into_iter()
            .filter(|child| child.role == InstanceRole::Iteration)
            .collect())
    }

    /// Count a finished child; `None` when it was already counted
    pub async fn record_child(&self, parent: &FlowNodeInstance, child: &FinishedChild) -> CoreResult<Option<ChildTally>> {
        let tally = self
            .services
            .flow_nodes
            .record_child_finished(&parent.id, child)
            .await?;
        if !tally.counted {
            debug!(parent = %parent.id, child = %child.id, "child already counted");
            return Ok(None);
        }
        trace!(
            parent = %parent.id,
            child = %child.id,
            outcome = ?child.outcome,
            tokens = tally.token_count,
            "child recorded"
        );
        Ok(Some(tally))
    }

    // ---- data ----

    /// Data containers visible from a flow node, innermost first: the node,
    /// its parent activities, then its process
    async fn scopes(&self, instance: &FlowNodeInstance) -> CoreResult<Vec<String>> {
        let mut scopes = vec![instance.id.0.clone()];
        let mut parent = instance.parent_activity_id.clone();
        while let Some(id) = parent {
            if scopes.len() > MAX_SCOPE_DEPTH {
                return Err(CoreError::execution(format!(
                    "Parent chain of flow node {} is too deep",
                    instance.id
                )));
            }
            scopes.push(id.0.clone());
            parent = match self.services.flow_nodes.find_by_id(&id).await? {
                Some(activity) => activity.parent_activity_id,
                None => None,
            };
        }
        scopes.push(instance.parent_process_instance_id.0.clone());
        Ok(scopes)
    }

    /// Declare the local variables of a flow node; existing ones are kept
    pub async fn create_local_data(&self, process: &ProcessDefinition, instance: &FlowNodeInstance) -> CoreResult<()> {
        let definition = process.flow_node(&instance.definition_id)?;
        if definition.data.is_empty() {
            return Ok(());
        }
        let existing = self.services.data.get_variables(&instance.id.0).await?;
        let context = self.evaluation_context(instance).await?;
        for data in &definition.data {
            if existing.contains_key(&data.name) {
                continue;
            }
            let value = match &data.default_value {
                Some(expression) => self.evaluate(expression, &context)?,
                None => DataPacket::null(),
            };
            self.services
                .data
                .create(&instance.id.0, &data.name, value)
                .await?;
        }
        Ok(())
    }

    /// Context of an expression evaluated for a flow node.
    ///
    /// Process variables come first, then the variables of the parent
    /// activities, then the local ones, then the loop variables.
    pub async fn evaluation_context(&self, instance: &FlowNodeInstance) -> CoreResult<EvaluationContext> {
        let mut context = EvaluationContext::new().for_container(instance.id.0.clone());
        for scope in self.scopes(instance).await?.iter().rev() {
            let variables = self.services.data.get_variables(scope).await?;
            context = context.with_variables(&variables);
        }

        context = context.with_variable(LOOP_COUNTER, json!(instance.loop_counter));
        if instance.kind == FlowNodeKind::MultiInstanceActivity {
            let counters = instance.multi_instance;
            context = context
                .with_variable(NUMBER_OF_INSTANCES, json!(counters.number_of_instances))
                .with_variable(NUMBER_OF_ACTIVE_INSTANCES, json!(counters.active))
                .with_variable(NUMBER_OF_COMPLETED_INSTANCES, json!(counters.completed))
                .with_variable(NUMBER_OF_TERMINATED_INSTANCES, json!(counters.terminated));
        }
        Ok(context)
    }

    /// Context made of the variables of a process instance
    pub async fn process_context(&self, id: &ProcessInstanceId) -> CoreResult<EvaluationContext> {
        let variables = self.services.data.get_variables(&id.0).await?;
        Ok(EvaluationContext::new()
            .for_container(id.0.clone())
            .with_variables(&variables))
    }

    /// Evaluate an expression
    pub fn evaluate(&self, expression: &Expression, context: &EvaluationContext) -> CoreResult<DataPacket> {
        self.services.expressions.evaluate(expression, context)
    }

    /// Evaluate a boolean expression
    pub fn evaluate_condition(&self, expression: &Expression, context: &EvaluationContext) -> CoreResult<bool> {
        self.services.expressions.evaluate_condition(expression, context)
    }

    /// Value of a variable visible from a flow node
    pub async fn read_variable(&self, instance: &FlowNodeInstance, name: &str) -> CoreResult<Option<DataPacket>> {
        for scope in self.scopes(instance).await? {
            if let Some(value) = self.services.data.get_variable(&scope, name).await? {
                return Ok(Some(value));
            }
        }
        Ok(None)
    }

    /// Container declaring `name` as seen from a flow node; the process
    /// instance when no scope declares it
    pub async fn variable_container(&self, instance: &FlowNodeInstance, name: &str) -> CoreResult<String> {
        for scope in self.scopes(instance).await? {
            if self.services.data.get_variable(&scope, name).await?.is_some() {
                return Ok(scope);
            }
        }
        Ok(instance.parent_process_instance_id.0.clone())
    }

    /// Update the variable `name` where it is declared, or declare it on the process
    pub async fn write_variable(&self, instance: &FlowNodeInstance, name: &str, value: DataPacket) -> CoreResult<()> {
        for scope in self.scopes(instance).await? {
            if self.services.data.get_variable(&scope, name).await?.is_some() {
                return self.services.data.set_variable(&scope, name, value).await;
            }
        }
        self.services
            .data
            .create(&instance.parent_process_instance_id.0, name, value)
            .await
    }

    /// Run assignments in order; each one sees the results of the previous ones.
    ///
    /// `extra` variables (connector outputs) shadow every scope.
    pub async fn execute_operations(
        &self,
        instance: &FlowNodeInstance,
        operations: &[Operation],
        extra: Option<&Variables>,
    ) -> CoreResult<()> {
        if operations.is_empty() {
            return Ok(());
        }
        let mut context = self.evaluation_context(instance).await?;
        if let Some(extra) = extra {
            context = context.with_variables(extra);
        }
        for operation in operations {
            let value = self.evaluate(&operation.expression, &context)?;
            self.write_variable(instance, &operation.target_variable, value.clone())
                .await?;
            context = context.with_variable(operation.target_variable.clone(), value.into_value());
        }
        Ok(())
    }

    /// Assign a human task to the user its actor expression names
    pub async fn map_actor(&self, process: &ProcessDefinition, instance: &FlowNodeInstance) -> CoreResult<()> {
        let definition = process.flow_node(&instance.definition_id)?;
        let Some(actor) = &definition.actor else {
            return Ok(());
        };
        let context = self.evaluation_context(instance).await?;
        let user = self.evaluate(actor, &context)?;
        let user = user.as_str().ok_or_else(|| {
            CoreError::execution(format!(
                "Actor of {} evaluated to {} instead of a user name",
                instance.definition_id.0, user.value
            ))
        })?;
        debug!(flow_node = %instance.id, user, "human task assigned");
        self.services
            .flow_nodes
            .set_assignee(&instance.id, Some(user.to_string()))
            .await
    }

    // ---- events ----

    /// Subscribe a flow node to its trigger
    pub async fn register_waiting_event(&self, process: &ProcessDefinition, instance: &FlowNodeInstance) -> CoreResult<()> {
        let definition = process.flow_node(&instance.definition_id)?;
        match &definition.event_trigger {
            EventTrigger::None | EventTrigger::Terminate => Ok(()),
            trigger => {
                trace!(flow_node = %instance.id, ?trigger, "waiting for event");
                self.services
                    .subscriptions
                    .subscribe(EventSubscription::new(
                        instance.parent_process_instance_id.clone(),
                        instance.id.clone(),
                        trigger.clone(),
                    ))
                    .await
            }
        }
    }

    /// Drop the subscriptions of a flow node
    pub async fn unregister_waiting_events(&self, instance: &FlowNodeInstance) -> CoreResult<()> {
        self.services
            .subscriptions
            .unsubscribe_flow_node(&instance.id)
            .await
    }

    /// Throw the message or signal of a flow node
    pub async fn throw_event(&self, process: &ProcessDefinition, instance: &FlowNodeInstance) -> CoreResult<()> {
        let definition = process.flow_node(&instance.definition_id)?;
        let trigger = &definition.event_trigger;
        if !matches!(trigger, EventTrigger::Message(_) | EventTrigger::Signal(_)) {
            return Ok(());
        }
        let delivered = self.deliver_event(trigger, None, &Variables::new()).await?;
        debug!(flow_node = %instance.id, ?trigger, delivered, "event thrown");
        Ok(())
    }

    /// Wake the flow nodes waiting for `trigger`, handing them `payload`.
    ///
    /// Returns how many flow nodes were woken.
    pub async fn deliver_event(
        &self,
        trigger: &EventTrigger,
        scope: Option<&ProcessInstanceId>,
        payload: &Variables,
    ) -> CoreResult<usize> {
        let subscriptions = self.services.subscriptions.take_matching(trigger, scope).await?;
        let mut delivered = 0;
        for subscription in subscriptions {
            let Some(target) = self
                .services
                .flow_nodes
                .find_by_id(&subscription.flow_node_instance_id)
                .await?
            else {
                continue;
            };
            for (name, value) in payload {
                self.write_variable(&target, name, value.clone()).await?;
            }
            self.services
                .dispatcher
                .execute_flow_node(&target.id, Some(StateId::WAITING))
                .await?;
            delivered += 1;
        }
        Ok(delivered)
    }

    // ---- interruption ----

    /// Set the category of a flow node and have it follow the change
    pub async fn interrupt_flow_node(&self, id: &FlowNodeInstanceId, category: StateCategory) -> CoreResult<()> {
        match self.services.flow_nodes.set_state_category(id, category).await {
            Ok(()) => self.services.dispatcher.interrupt_flow_node(id).await,
            Err(err) if err.is_not_found() => {
                debug!(flow_node = %id, "flow node finished before it could be interrupted");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Push `category` down to the children of a flow node.
    ///
    /// Boundary events that did not fire are cancelled; the ones that fired
    /// are left to finish. Failed children are interrupted too, so that
    /// they report back to their parent.
    pub async fn interrupt_children(&self, instance: &FlowNodeInstance, category: StateCategory) -> CoreResult<usize> {
        let mut interrupted = 0;
        for child in self.children(&instance.id).await? {
            if child.state_id.is_terminal() && child.state_id != StateId::FAILED {
                continue;
            }
            let child_category = if child.role == InstanceRole::Boundary {
                if !is_unfired_boundary(&child) {
                    continue;
                }
                StateCategory::Cancelling
            } else {
                category
            };
            if child.state_category == child_category {
                continue;
            }
            self.interrupt_flow_node(&child.id, child_category).await?;
            interrupted += 1;
        }
        Ok(interrupted)
    }

    /// Push `category` down to the running iterations of a container
    pub async fn interrupt_iterations(&self, instance: &FlowNodeInstance, category: StateCategory) -> CoreResult<usize> {
        let mut interrupted = 0;
        for child in self.iterations_of(instance).await? {
            if child.state_id.is_terminal() && child.state_id != StateId::FAILED {
                continue;
            }
            if child.state_category != StateCategory::Normal {
                continue;
            }
            self.interrupt_flow_node(&child.id, category).await?;
            interrupted += 1;
        }
        Ok(interrupted)
    }

    /// Cancel the boundary events of `activity` that did not fire, except `except`
    pub async fn cancel_boundary_events(
        &self,
        activity: &FlowNodeInstanceId,
        except: Option<&FlowNodeInstanceId>,
    ) -> CoreResult<usize> {
        let mut cancelled = 0;
        for child in self.children(activity).await? {
            if child.role != InstanceRole::Boundary || Some(&child.id) == except {
                continue;
            }
            if !is_unfired_boundary(&child) || child.state_category != StateCategory::Normal {
                continue;
            }
            self.interrupt_flow_node(&child.id, StateCategory::Cancelling)
                .await?;
            cancelled += 1;
        }
        Ok(cancelled)
    }

    // ---- called processes ----

    /// Process started by a call activity, while it is not archived
    pub async fn child_process_of(&self, instance: &FlowNodeInstance) -> CoreResult<Option<ProcessInstance>> {
        self.services.processes.find_by_caller(&instance.id).await
    }

    /// Archive a finished called process; false when it was already archived
    pub async fn archive_child_process(&self, id: &ProcessInstanceId) -> CoreResult<bool> {
        match self.services.processes.archive(id).await {
            Ok(()) => {
                info!(process = %id, "called process archived");
                Ok(true)
            }
            Err(err) if err.is_not_found() => {
                debug!(process = %id, "called process already archived");
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }
}

fn is_unfired_boundary(instance: &FlowNodeInstance) -> bool {
    matches!(
        instance.state_id,
        StateId::INITIALIZING | StateId::WAITING | StateId::FAILED
    )
}
