use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::domain::flow_node_instance::{
    ChildOutcome, FlowNodeInstanceId, ProcessInstanceId, StateCategory,
};
use crate::domain::process_definition::ProcessDefinitionId;

/// Process instance status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessState {
    /// Flow nodes are running
    Started,
    /// Every flow node finished normally
    Completed,
    /// Unwound by an interrupting event or an aborting caller
    Aborted,
    /// Unwound by a cancel request
    Cancelled,
}

impl ProcessState {
    /// Whether the process reached an end state
    pub fn is_terminal(self) -> bool {
        !matches!(self, ProcessState::Started)
    }

    /// Outcome reported to a calling activity
    pub fn outcome(self) -> ChildOutcome {
        match self {
            ProcessState::Aborted => ChildOutcome::Aborted,
            ProcessState::Cancelled => ChildOutcome::Cancelled,
            ProcessState::Started | ProcessState::Completed => ChildOutcome::Completed,
        }
    }
}

/// Aggregate: Process instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessInstance {
    /// Unique identifier
    pub id: ProcessInstanceId,

    /// Process definition
    pub definition_id: ProcessDefinitionId,

    /// Name copied from the definition
    pub name: String,

    /// Current status
    pub state: ProcessState,

    /// Interrupt flag applied to every root flow node
    pub state_category: StateCategory,

    /// Active root flow nodes
    pub token_count: i64,

    /// Root flow nodes whose completion was already counted
    pub finished_children: BTreeSet<String>,

    /// Call activity that started this process
    pub caller_id: Option<FlowNodeInstanceId>,

    /// Outermost process instance
    pub root_process_instance_id: ProcessInstanceId,

    /// A terminate end event was reached; no further transitions are followed
    pub terminated: bool,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last updated timestamp
    pub updated_at: DateTime<Utc>,
}

impl ProcessInstance {
    /// Create a started process instance
    pub fn new(
        definition_id: ProcessDefinitionId,
        name: String,
        caller: Option<(FlowNodeInstanceId, ProcessInstanceId)>,
    ) -> Self {
        let id = ProcessInstanceId::generate();
        let now = Utc::now();
        let (caller_id, root_process_instance_id) = match caller {
            Some((caller_id, root)) => (Some(caller_id), root),
            None => (None, id.clone()),
        };
        Self {
            id,
            definition_id,
            name,
            state: ProcessState::Started,
            state_category: StateCategory::Normal,
            token_count: 0,
            finished_children: BTreeSet::new(),
            caller_id,
            root_process_instance_id,
            terminated: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// State the process ends in, given its category
    pub fn end_state(&self) -> ProcessState {
        match self.state_category {
            StateCategory::Normal => ProcessState::Completed,
            StateCategory::Aborting => ProcessState::Aborted,
            StateCategory::Cancelling => ProcessState::Cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_process_is_its_own_root() {
        let process = ProcessInstance::new(ProcessDefinitionId("d".into()), "p".into(), None);
        assert_eq!(process.root_process_instance_id, process.id);
        assert!(process.caller_id.is_none());
        assert_eq!(process.state, ProcessState::Started);
    }

    #[test]
    fn test_called_process_keeps_caller_root() {
        let root = ProcessInstanceId::generate();
        let caller = FlowNodeInstanceId::generate();
        let process = ProcessInstance::new(
            ProcessDefinitionId("d".into()),
            "p".into(),
            Some((caller.clone(), root.clone())),
        );
        assert_eq!(process.caller_id, Some(caller));
        assert_eq!(process.root_process_instance_id, root);
    }

    #[test]
    fn test_end_state_follows_category() {
        let mut process = ProcessInstance::new(ProcessDefinitionId("d".into()), "p".into(), None);
        assert_eq!(process.end_state(), ProcessState::Completed);
        process.state_category = StateCategory::Cancelling;
        assert_eq!(process.end_state(), ProcessState::Cancelled);
        assert_eq!(process.end_state().outcome(), ChildOutcome::Cancelled);
    }
}
