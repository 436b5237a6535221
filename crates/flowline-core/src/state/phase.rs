//! Connector phases
//!
//! A connector-aware state runs its on-enter connectors, does its own work,
//! then runs its on-finish connectors. Which part is pending is recomputed
//! on every call from the persisted connector instances, so calling
//! [`PhasedState::execute`] again without connector progress dispatches
//! nothing new and returns the same result.

use async_trait::async_trait;
use std::fmt;
use std::ops::BitOr;
use std::sync::Arc;
use tracing::trace;

use super::{FlowNodeState, StateCode, StateDescriptor};
use crate::application::state_behaviors::StateBehaviors;
use crate::domain::connector::ConnectorProgress;
use crate::domain::flow_node_instance::{FinishedChild, FlowNodeInstance};
use crate::domain::process_definition::{ConnectorEvent, ProcessDefinition};
use crate::CoreResult;

/// Set of connector phases still to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Phases(u8);

impl Phases {
    /// Nothing left
    pub const NONE: Phases = Phases(0);
    /// Hook before the on-enter connectors
    pub const BEFORE_ON_ENTER: Phases = Phases(1);
    /// An on-enter connector must run
    pub const DURING_ON_ENTER: Phases = Phases(2);
    /// Hook between on-enter and on-finish connectors
    pub const BEFORE_ON_FINISH: Phases = Phases(4);
    /// An on-finish connector must run
    pub const DURING_ON_FINISH: Phases = Phases(8);
    /// Hook after the on-finish connectors
    pub const AFTER_ON_FINISH: Phases = Phases(16);

    /// Whether every phase of `other` is included
    pub fn contains(self, other: Phases) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    /// Raw bits
    pub fn bits(self) -> u8 {
        self.0
    }
}

impl BitOr for Phases {
    type Output = Phases;

    fn bitor(self, rhs: Phases) -> Phases {
        Phases(self.0 | rhs.0)
    }
}

fn started(progress: &ConnectorProgress) -> bool {
    matches!(progress, ConnectorProgress::Pending(_) | ConnectorProgress::Drained)
}

/// Pending phases of a state running both connector events
pub fn sequential_phases(on_enter: &ConnectorProgress, on_finish: &ConnectorProgress) -> Phases {
    match on_enter {
        ConnectorProgress::NotStarted(_) => Phases::BEFORE_ON_ENTER | Phases::DURING_ON_ENTER,
        ConnectorProgress::Pending(_) => Phases::DURING_ON_ENTER,
        ConnectorProgress::NoConnector | ConnectorProgress::Drained => {
            // Without on-enter connectors, the first hook already ran once on-finish connectors started.
            let before = if matches!(on_enter, ConnectorProgress::NoConnector) && !started(on_finish) {
                Phases::BEFORE_ON_ENTER
            } else {
                Phases::NONE
            };
            before
                | match on_finish {
                    ConnectorProgress::NotStarted(_) => {
                        Phases::BEFORE_ON_FINISH | Phases::DURING_ON_FINISH
                    }
                    ConnectorProgress::Pending(_) => Phases::DURING_ON_FINISH,
                    ConnectorProgress::NoConnector => {
                        Phases::BEFORE_ON_FINISH | Phases::AFTER_ON_FINISH
                    }
                    ConnectorProgress::Drained => Phases::AFTER_ON_FINISH,
                }
        }
    }
}

/// Pending phases of a state running a single connector event.
///
/// The before, during and after parts are reported as
/// `BEFORE_ON_ENTER`, `DURING_ON_ENTER` and `AFTER_ON_FINISH`.
pub fn single_phases(progress: &ConnectorProgress) -> Phases {
    match progress {
        ConnectorProgress::NotStarted(_) => Phases::BEFORE_ON_ENTER | Phases::DURING_ON_ENTER,
        ConnectorProgress::Pending(_) => Phases::DURING_ON_ENTER,
        ConnectorProgress::NoConnector => Phases::BEFORE_ON_ENTER | Phases::AFTER_ON_FINISH,
        ConnectorProgress::Drained => Phases::AFTER_ON_FINISH,
    }
}

/// Which connectors a phased state runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseRunner {
    /// On-enter connectors, then on-finish connectors
    Sequential,
    /// Connectors of one event only
    Single(ConnectorEvent),
}

/// Work a phased state does around its connectors
#[async_trait]
pub trait PhaseHooks: Send + Sync {
    /// Whether the state has work to do
    async fn should_execute(
        &self,
        _process: &ProcessDefinition,
        _instance: &FlowNodeInstance,
    ) -> CoreResult<bool> {
        Ok(true)
    }

    /// Before the first connector
    async fn before_connectors(
        &self,
        _process: &ProcessDefinition,
        _instance: &FlowNodeInstance,
    ) -> CoreResult<()> {
        Ok(())
    }

    /// Between on-enter and on-finish connectors (sequential runner only)
    async fn between_connectors(
        &self,
        _process: &ProcessDefinition,
        _instance: &FlowNodeInstance,
    ) -> CoreResult<()> {
        Ok(())
    }

    /// After the last connector
    async fn after_connectors(
        &self,
        _process: &ProcessDefinition,
        _instance: &FlowNodeInstance,
    ) -> CoreResult<()> {
        Ok(())
    }
}

/// A state made of a descriptor, a phase runner and hooks
pub struct PhasedState {
    descriptor: StateDescriptor,
    runner: PhaseRunner,
    hooks: Arc<dyn PhaseHooks>,
    behaviors: Arc<StateBehaviors>,
}

impl PhasedState {
    /// Assemble a phased state
    pub fn new(
        descriptor: StateDescriptor,
        runner: PhaseRunner,
        hooks: Arc<dyn PhaseHooks>,
        behaviors: Arc<StateBehaviors>,
    ) -> Self {
        Self {
            descriptor,
            runner,
            hooks,
            behaviors,
        }
    }

    /// Pending phases of `instance`
    pub async fn pending_phases(&self, instance: &FlowNodeInstance) -> CoreResult<(Phases, Option<ConnectorProgress>, Option<ConnectorProgress>)> {
        match self.runner {
            PhaseRunner::Sequential => {
                let on_enter = self
                    .behaviors
                    .connector_progress(instance, ConnectorEvent::OnEnter)
                    .await?;
                let on_finish = self
                    .behaviors
                    .connector_progress(instance, ConnectorEvent::OnFinish)
                    .await?;
                Ok((
                    sequential_phases(&on_enter, &on_finish),
                    Some(on_enter),
                    Some(on_finish),
                ))
            }
            PhaseRunner::Single(event) => {
                let progress = self.behaviors.connector_progress(instance, event).await?;
                Ok((single_phases(&progress), Some(progress), None))
            }
        }
    }

    async fn run_connector(
        &self,
        instance: &FlowNodeInstance,
        progress: Option<ConnectorProgress>,
    ) -> CoreResult<StateCode> {
        match progress {
            Some(ConnectorProgress::NotStarted(connector)) | Some(ConnectorProgress::Pending(connector)) => {
                self.behaviors
                    .execute_connector(instance, &connector, self.descriptor.id)
                    .await
            }
            _ => Ok(StateCode::Done),
        }
    }
}

impl fmt::Debug for PhasedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhasedState")
            .field("descriptor", &self.descriptor)
            .field("runner", &self.runner)
            .finish()
    }
}

#[async_trait]
impl FlowNodeState for PhasedState {
    fn descriptor(&self) -> &StateDescriptor {
        &self.descriptor
    }

    async fn should_execute_state(
        &self,
        process: &ProcessDefinition,
        instance: &FlowNodeInstance,
    ) -> CoreResult<bool> {
        self.hooks.should_execute(process, instance).await
    }

    async fn execute(&self, process: &ProcessDefinition, instance: &FlowNodeInstance) -> CoreResult<StateCode> {
        let (phases, first, second) = self.pending_phases(instance).await?;
        trace!(
            flow_node = %instance.id,
            state = self.descriptor.name,
            phases = phases.bits(),
            "connector phases"
        );

        if phases.contains(Phases::BEFORE_ON_ENTER) {
            self.hooks.before_connectors(process, instance).await?;
        }
        if phases.contains(Phases::DURING_ON_ENTER) {
            return self.run_connector(instance, first).await;
        }
        if phases.contains(Phases::BEFORE_ON_FINISH) {
            self.hooks.between_connectors(process, instance).await?;
        }
        if phases.contains(Phases::DURING_ON_FINISH) {
            return self.run_connector(instance, second).await;
        }
        if phases.contains(Phases::AFTER_ON_FINISH) {
            self.hooks.after_connectors(process, instance).await?;
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::connector::ConnectorInstance;
    use crate::domain::flow_node_instance::FlowNodeInstanceId;
    use crate::domain::process_definition::ConnectorDefinition;

    fn connector(event: ConnectorEvent) -> ConnectorInstance {
        ConnectorInstance::new(
            FlowNodeInstanceId("f".into()),
            &ConnectorDefinition::new("c", "noop", event),
            0,
        )
    }

    #[test]
    fn test_single_phases() {
        let c = connector(ConnectorEvent::OnEnter);
        assert_eq!(
            single_phases(&ConnectorProgress::NotStarted(c.clone())),
            Phases::BEFORE_ON_ENTER | Phases::DURING_ON_ENTER
        );
        assert_eq!(
            single_phases(&ConnectorProgress::Pending(c)),
            Phases::DURING_ON_ENTER
        );
        assert_eq!(
            single_phases(&ConnectorProgress::NoConnector),
            Phases::BEFORE_ON_ENTER | Phases::AFTER_ON_FINISH
        );
        assert_eq!(
            single_phases(&ConnectorProgress::Drained),
            Phases::AFTER_ON_FINISH
        );
    }

    #[test]
    fn test_sequential_phases_without_connectors_run_every_hook() {
        let phases = sequential_phases(&ConnectorProgress::NoConnector, &ConnectorProgress::NoConnector);
        assert!(phases.contains(Phases::BEFORE_ON_ENTER));
        assert!(phases.contains(Phases::BEFORE_ON_FINISH));
        assert!(phases.contains(Phases::AFTER_ON_FINISH));
        assert!(!phases.contains(Phases::DURING_ON_ENTER));
        assert!(!phases.contains(Phases::DURING_ON_FINISH));
    }

    #[test]
    fn test_sequential_phases_stop_at_on_enter_connectors() {
        let c = connector(ConnectorEvent::OnEnter);
        let f = connector(ConnectorEvent::OnFinish);
        assert_eq!(
            sequential_phases(&ConnectorProgress::NotStarted(c.clone()), &ConnectorProgress::NotStarted(f.clone())),
            Phases::BEFORE_ON_ENTER | Phases::DURING_ON_ENTER
        );
        assert_eq!(
            sequential_phases(&ConnectorProgress::Pending(c), &ConnectorProgress::NotStarted(f)),
            Phases::DURING_ON_ENTER
        );
    }

    #[test]
    fn test_sequential_phases_do_not_repeat_hooks() {
        let f = connector(ConnectorEvent::OnFinish);

        // on-enter drained: the first hook is never run again
        assert_eq!(
            sequential_phases(&ConnectorProgress::Drained, &ConnectorProgress::NotStarted(f.clone())),
            Phases::BEFORE_ON_FINISH | Phases::DURING_ON_FINISH
        );
        // no on-enter connector, on-finish started: both earlier hooks already ran
        assert_eq!(
            sequential_phases(&ConnectorProgress::NoConnector, &ConnectorProgress::Pending(f)),
            Phases::DURING_ON_FINISH
        );
        assert_eq!(
            sequential_phases(&ConnectorProgress::NoConnector, &ConnectorProgress::Drained),
            Phases::AFTER_ON_FINISH
        );
    }

    #[test]
    fn test_recomputation_is_stable() {
        let c = connector(ConnectorEvent::OnEnter);
        let progress = ConnectorProgress::Pending(c);
        let first = sequential_phases(&progress, &ConnectorProgress::NoConnector);
        let second = sequential_phases(&progress, &ConnectorProgress::NoConnector);
        assert_eq!(first, second);
    }
}
