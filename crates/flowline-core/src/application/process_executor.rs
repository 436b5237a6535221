//! Process-level execution: starting processes, following transitions,
//! finishing, interrupting and terminating process instances

use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::application::services::EngineServices;
use crate::application::state_behaviors::StateBehaviors;
use crate::domain::events::{ProcessInstanceFinished, ProcessInstanceStarted};
use crate::domain::expression::EvaluationContext;
use crate::domain::flow_node_instance::{
    ChildOutcome, FinishedChild, FlowNodeInstance, FlowNodeKind, ProcessInstanceId, StateCategory,
};
use crate::domain::process_definition::{
    FlowNodeDefinition, FlowNodeType, GatewayType, ProcessDefinition, Transition,
};
use crate::domain::process_instance::ProcessInstance;
use crate::state::{first_state_id, StateId};
use crate::types::{DataPacket, Variables};
use crate::{CoreError, CoreResult};

/// Drives process instances around their flow nodes
#[derive(Debug)]
pub struct ProcessExecutor {
    services: Arc<EngineServices>,
    behaviors: Arc<StateBehaviors>,
}

impl ProcessExecutor {
    /// Create a new process executor
    pub fn new(services: Arc<EngineServices>, behaviors: Arc<StateBehaviors>) -> Self {
        Self { services, behaviors }
    }

    /// Start a process instance, called by `caller` when it is a call activity
    pub async fn start_process(
        &self,
        definition: &ProcessDefinition,
        caller: Option<&FlowNodeInstance>,
        inputs: Variables,
    ) -> CoreResult<ProcessInstance> {
        let process = ProcessInstance::new(
            definition.id.clone(),
            definition.name.clone(),
            caller.map(|c| (c.id.clone(), c.root_process_instance_id.clone())),
        );
        self.services.processes.create(process.clone()).await?;

        // Process variables: inputs win over declared defaults
        let context = EvaluationContext::new()
            .for_container(process.id.0.clone())
            .with_variables(&inputs);
        for data in &definition.data {
            let value = match (inputs.get(&data.name), &data.default_value) {
                (Some(value), _) => value.clone(),
                (None, Some(expression)) => self.behaviors.evaluate(expression, &context)?,
                (None, None) => DataPacket::null(),
            };
            self.services.data.create(&process.id.0, &data.name, value).await?;
        }
        for (name, value) in &inputs {
            if !definition.data.iter().any(|d| &d.name == name) {
                self.services.data.create(&process.id.0, name, value.clone()).await?;
            }
        }

        self.behaviors
            .emit(ProcessInstanceStarted {
                process_instance_id: process.id.clone(),
                caller_id: process.caller_id.clone(),
                timestamp: Utc::now(),
            })
            .await?;
        info!(
            process = %process.id,
            name = %definition.name,
            version = %definition.version,
            "process instance started"
        );

        // Start nodes
        let start_nodes = definition.start_nodes();
        if start_nodes.is_empty() {
            self.finish_process(&process.id).await?;
            return self.services.processes.get(&process.id).await;
        }
        self.services
            .processes
            .add_tokens(&process.id, start_nodes.len() as i64)
            .await?;
        let mut started = Vec::with_capacity(start_nodes.len());
        for node in start_nodes {
            let instance = self.root_instance(definition, node, &process.id, &process.root_process_instance_id);
            started.push(self.behaviors.create_flow_node(definition, instance).await?.id);
        }
        for id in started {
            self.services.dispatcher.execute_flow_node(&id, None).await?;
        }

        self.services.processes.get(&process.id).await
    }

    fn root_instance(
        &self,
        definition: &ProcessDefinition,
        node: &FlowNodeDefinition,
        process: &ProcessInstanceId,
        root: &ProcessInstanceId,
    ) -> FlowNodeInstance {
        let kind = FlowNodeKind::for_definition(node);
        FlowNodeInstance::new(
            definition.id.clone(),
            node,
            kind,
            first_state_id(kind),
            process.clone(),
            root.clone(),
        )
    }

    /// A flow node without parent activity reached a terminal state.
    ///
    /// Completed nodes first hand their token over to the targets of their
    /// outgoing transitions, so the process never sees a zero count in
    /// between. The process finishes when its last token is gone.
    pub async fn root_flow_node_finished(
        &self,
        definition: &ProcessDefinition,
        instance: &FlowNodeInstance,
        outcome: ChildOutcome,
    ) -> CoreResult<()> {
        if outcome == ChildOutcome::Completed {
            self.follow_transitions(definition, instance).await?;
        }
        let tally = self
            .services
            .processes
            .record_child_finished(
                &instance.parent_process_instance_id,
                &FinishedChild::flow_node(instance, outcome),
            )
            .await?;
        if tally.counted && tally.token_count <= 0 {
            self.finish_process(&instance.parent_process_instance_id).await?;
        }
        Ok(())
    }

    /// Create the targets of the transitions a completed flow node takes.
    ///
    /// Nothing is followed once the process is interrupted or terminated.
    pub async fn follow_transitions(&self, definition: &ProcessDefinition, instance: &FlowNodeInstance) -> CoreResult<()> {
        let process = match self
            .services
            .processes
            .find_by_id(&instance.parent_process_instance_id)
            .await?
        {
            Some(process) => process,
            None => {
                warn!(process = %instance.parent_process_instance_id, "process instance vanished");
                return Ok(());
            }
        };
        if process.terminated || process.state_category != StateCategory::Normal {
            debug!(process = %process.id, flow_node = %instance.id, "process interrupted, transitions not followed");
            return Ok(());
        }

        let source = definition.flow_node(&instance.definition_id)?;
        let context = self.behaviors.evaluation_context(instance).await?;
        let taken = self.select_transitions(definition, source, &context)?;
        if taken.is_empty() {
            return Ok(());
        }
        debug!(
            flow_node = %instance.id,
            transitions = taken.len(),
            "following transitions"
        );

        self.services
            .processes
            .add_tokens(&process.id, taken.len() as i64)
            .await?;
        let mut targets = Vec::with_capacity(taken.len());
        for transition in taken {
            let target = definition.flow_node(&transition.target)?;
            let candidate = self.root_instance(definition, target, &process.id, &process.root_process_instance_id);
            match target.node_type {
                FlowNodeType::Gateway(GatewayType::Exclusive) => {
                    let mut gateway = candidate;
                    gateway.gateway_hits.insert(transition.id.clone());
                    targets.push(self.behaviors.create_flow_node(definition, gateway).await?.id);
                }
                FlowNodeType::Gateway(_) => {
                    let (gateway, created) = self
                        .services
                        .flow_nodes
                        .merge_gateway_hit(candidate, StateId::WAITING, &transition.id)
                        .await?;
                    if created {
                        self.behaviors.create_connectors(definition, &gateway).await?;
                    } else {
                        // the waiting gateway already holds a token for this branch
                        self.services.processes.add_tokens(&process.id, -1).await?;
                    }
                    targets.push(gateway.id);
                }
                _ => {
                    targets.push(self.behaviors.create_flow_node(definition, candidate).await?.id);
                }
            }
        }
        for id in targets {
            self.services.dispatcher.execute_flow_node(&id, None).await?;
        }
        Ok(())
    }

    /// Re-check the inclusive gateways of a process that wait for branches
    /// which may no longer come
    pub async fn wake_inclusive_gateways(&self, definition: &ProcessDefinition, id: &ProcessInstanceId) -> CoreResult<()> {
        let inclusive = |node: &FlowNodeDefinition| node.node_type == FlowNodeType::Gateway(GatewayType::Inclusive);
        if !definition.flow_nodes.iter().any(inclusive) {
            return Ok(());
        }
        for root in self.services.flow_nodes.get_root_flow_nodes(id).await? {
            if root.state_id != StateId::WAITING
                || root.state_executing
                || root.state_category != StateCategory::Normal
            {
                continue;
            }
            if definition.flow_node(&root.definition_id).map(inclusive).unwrap_or(false) {
                debug!(gateway = %root.id, "waking inclusive gateway");
                self.services.dispatcher.execute_flow_node(&root.id, None).await?;
            }
        }
        Ok(())
    }

    fn select_transitions<'a>(
        &self,
        definition: &'a ProcessDefinition,
        source: &FlowNodeDefinition,
        context: &EvaluationContext,
    ) -> CoreResult<Vec<&'a Transition>> {
        let outgoing = definition.outgoing(&source.id);
        let default = outgoing.iter().copied().find(|t| t.is_default);

        match source.node_type {
            FlowNodeType::Gateway(GatewayType::Parallel) => Ok(outgoing),
            FlowNodeType::Gateway(GatewayType::Exclusive) => {
                for transition in outgoing.iter().copied().filter(|t| !t.is_default) {
                    if self.transition_holds(transition, context)? {
                        return Ok(vec![transition]);
                    }
                }
                default.map(|t| vec![t]).ok_or_else(|| {
                    CoreError::execution(format!(
                        "No transition of exclusive gateway {} matched and it has no default",
                        source.id.0
                    ))
                })
            }
            _ => {
                let mut taken = Vec::new();
                for transition in outgoing.iter().copied().filter(|t| !t.is_default) {
                    if self.transition_holds(transition, context)? {
                        taken.push(transition);
                    }
                }
                if taken.is_empty() {
                    taken.extend(default);
                }
                Ok(taken)
            }
        }
    }

    fn transition_holds(&self, transition: &Transition, context: &EvaluationContext) -> CoreResult<bool> {
        match &transition.condition {
            Some(condition) => self.behaviors.evaluate_condition(condition, context),
            None => Ok(true),
        }
    }

    /// End a process instance whose last token is gone.
    ///
    /// A called process reports to its call activity, which archives it; a
    /// root process is archived right away.
    pub async fn finish_process(&self, id: &ProcessInstanceId) -> CoreResult<()> {
        let process = self.services.processes.get(id).await?;
        if process.state.is_terminal() {
            debug!(process = %id, "process instance already finished");
            return Ok(());
        }
        let state = process.end_state();
        self.services.processes.set_state(id, state).await?;
        self.services.subscriptions.unsubscribe_process(id).await?;
        self.behaviors
            .emit(ProcessInstanceFinished {
                process_instance_id: id.clone(),
                state,
                timestamp: Utc::now(),
            })
            .await?;
        info!(process = %id, ?state, "process instance finished");

        match &process.caller_id {
            Some(caller) => {
                self.services
                    .dispatcher
                    .notify_child_finished(caller, FinishedChild::process(id, state.outcome()))
                    .await
            }
            None => match self.services.processes.archive(id).await {
                Err(err) if err.is_not_found() => Ok(()),
                result => result,
            },
        }
    }

    /// Abort or cancel a process instance by interrupting its root flow nodes
    pub async fn interrupt_process(&self, id: &ProcessInstanceId, category: StateCategory) -> CoreResult<()> {
        let process = self.services.processes.get(id).await?;
        if process.state.is_terminal() {
            return Ok(());
        }
        self.services.processes.set_state_category(id, category).await?;

        let roots = self.services.flow_nodes.get_root_flow_nodes(id).await?;
        let mut interrupted = 0;
        for root in &roots {
            if root.state_id.is_terminal() && root.state_id != StateId::FAILED {
                continue;
            }
            self.behaviors.interrupt_flow_node(&root.id, category).await?;
            interrupted += 1;
        }
        info!(process = %id, ?category, interrupted, "process instance interrupted");

        if process.token_count <= 0 {
            self.finish_process(id).await?;
        }
        Ok(())
    }

    /// A terminate end event was reached: abort every other root flow node
    pub async fn terminate(&self, instance: &FlowNodeInstance) -> CoreResult<()> {
        let id = &instance.parent_process_instance_id;
        self.services.processes.set_terminated(id).await?;
        let roots = self.services.flow_nodes.get_root_flow_nodes(id).await?;
        let mut aborted = 0;
        for root in roots.iter().filter(|root| root.id != instance.id) {
            if root.state_id.is_terminal() && root.state_id != StateId::FAILED {
                continue;
            }
            self.behaviors
                .interrupt_flow_node(&root.id, StateCategory::Aborting)
                .await?;
            aborted += 1;
        }
        info!(process = %id, flow_node = %instance.id, aborted, "process instance terminated");
        Ok(())
    }
}
