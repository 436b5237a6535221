//! Registry of the state instances of every node family

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::trace;

use crate::application::process_executor::ProcessExecutor;
use crate::application::state_behaviors::StateBehaviors;
use crate::domain::flow_node_instance::{FlowNodeInstance, FlowNodeKind, StateCategory};
use crate::domain::process_definition::ProcessDefinition;
use crate::state::event::{MergeWaiting, Waiting};
use crate::state::interrupt::Interrupting;
use crate::state::terminal::Terminal;
use crate::state::{
    activity, boundary, call_activity, chain, event, loop_activity, multi_instance, FlowNodeState,
    NodeFamily, StateId,
};
use crate::{CoreError, CoreResult};

const CATEGORIES: [StateCategory; 3] = [
    StateCategory::Normal,
    StateCategory::Aborting,
    StateCategory::Cancelling,
];

/// Maps node families and categories to their ordered state chains.
///
/// Built once at startup; holds no per-instance data. The order of every
/// chain is the static table of [`chain`].
#[derive(Debug)]
pub struct FlowNodeStateManager {
    chains: HashMap<(NodeFamily, StateCategory), Vec<Arc<dyn FlowNodeState>>>,
    failed: Arc<dyn FlowNodeState>,
}

impl FlowNodeStateManager {
    /// Build every chain.
    ///
    /// Fails when the states of a family do not match its static table.
    pub fn new(behaviors: Arc<StateBehaviors>, process_executor: Arc<ProcessExecutor>) -> CoreResult<Self> {
        let mut chains = HashMap::new();
        for family in NodeFamily::ALL {
            for category in CATEGORIES {
                let states = match category {
                    StateCategory::Normal => normal_states(family, &behaviors, &process_executor),
                    _ => interrupt_states(family, category, &behaviors, &process_executor),
                };
                chains.insert((family, category), ordered(family, category, states)?);
            }
        }
        Ok(Self {
            chains,
            failed: Arc::new(Terminal::failed(behaviors)),
        })
    }

    fn chain(&self, family: NodeFamily, category: StateCategory) -> CoreResult<&[Arc<dyn FlowNodeState>]> {
        self.chains
            .get(&(family, category))
            .map(Vec::as_slice)
            .ok_or_else(|| CoreError::execution(format!("No {:?} chain for {:?}", category, family)))
    }

    /// State a new flow node of `kind` starts in
    pub fn first_state(&self, kind: FlowNodeKind) -> CoreResult<Arc<dyn FlowNodeState>> {
        self.chain(NodeFamily::of(kind), StateCategory::Normal)?
            .first()
            .cloned()
            .ok_or_else(|| CoreError::execution(format!("Empty state chain for {:?}", kind)))
    }

    /// The failed state, shared by every family
    pub fn failed_state(&self) -> Arc<dyn FlowNodeState> {
        self.failed.clone()
    }

    /// State `id` of a flow node of `kind`
    pub fn state(&self, kind: FlowNodeKind, id: StateId) -> CoreResult<Arc<dyn FlowNodeState>> {
        if id == StateId::FAILED {
            return Ok(self.failed_state());
        }
        let family = NodeFamily::of(kind);
        for category in CATEGORIES {
            if let Some(state) = self.chain(family, category)?.iter().find(|s| s.id() == id) {
                return Ok(state.clone());
            }
        }
        Err(CoreError::execution(format!(
            "State {} is not supported by {:?}",
            id, kind
        )))
    }

    /// Every state id a flow node of `kind` may be in
    pub fn supported_states(&self, kind: FlowNodeKind) -> Vec<StateId> {
        self.supported(kind).map(|state| state.id()).collect()
    }

    /// Names of the states a flow node of `kind` may be in
    pub fn supported_state_names(&self, kind: FlowNodeKind) -> BTreeSet<&'static str> {
        self.supported(kind).map(|state| state.name()).collect()
    }

    fn supported(&self, kind: FlowNodeKind) -> impl Iterator<Item = &Arc<dyn FlowNodeState>> {
        let family = NodeFamily::of(kind);
        CATEGORIES
            .into_iter()
            .filter_map(move |category| self.chains.get(&(family, category)))
            .flatten()
            .chain(std::iter::once(&self.failed))
    }

    /// State following `current` for the category of `instance`.
    ///
    /// When `current` is not part of the category's chain (the category just
    /// changed) the chain is entered at its head. States with nothing to do
    /// are skipped; terminal states always apply.
    pub async fn get_next_normal_state(
        &self,
        process: &ProcessDefinition,
        instance: &FlowNodeInstance,
        current: StateId,
    ) -> CoreResult<Arc<dyn FlowNodeState>> {
        let chain = self.chain(NodeFamily::of(instance.kind), instance.state_category)?;
        let start = chain
            .iter()
            .position(|state| state.id() == current)
            .map_or(0, |index| index + 1);

        for state in &chain[start..] {
            if state.is_terminal() || state.should_execute_state(process, instance).await? {
                return Ok(state.clone());
            }
            trace!(flow_node = %instance.id, state = state.name(), "state skipped");
        }
        Err(CoreError::execution(format!(
            "No state follows {} for flow node {} in {:?}",
            current, instance.id, instance.state_category
        )))
    }
}

/// Arrange `states` in the order of the static table of `family`
fn ordered(
    family: NodeFamily,
    category: StateCategory,
    states: Vec<Arc<dyn FlowNodeState>>,
) -> CoreResult<Vec<Arc<dyn FlowNodeState>>> {
    let ids = chain(family, category);
    if states.len() != ids.len() {
        return Err(CoreError::Configuration(format!(
            "{:?} has {} {:?} states, its chain lists {}",
            family,
            states.len(),
            category,
            ids.len()
        )));
    }
    ids.iter()
        .map(|id| {
            states.iter().find(|state| state.id() == *id).cloned().ok_or_else(|| {
                CoreError::Configuration(format!("{:?} has no {:?} state {}", family, category, id))
            })
        })
        .collect()
}

fn normal_states(
    family: NodeFamily,
    behaviors: &Arc<StateBehaviors>,
    process_executor: &Arc<ProcessExecutor>,
) -> Vec<Arc<dyn FlowNodeState>> {
    let b = behaviors;
    let completing = || -> Arc<dyn FlowNodeState> { Arc::new(activity::Completing::new(b.clone())) };
    let completed = || -> Arc<dyn FlowNodeState> { Arc::new(Terminal::completed(b.clone())) };

    match family {
        NodeFamily::AutomaticActivity => vec![
            activity::initializing(b.clone(), false),
            activity::executing(b.clone()),
            completing(),
            completed(),
        ],
        NodeFamily::HumanTask => vec![
            activity::initializing(b.clone(), true),
            Arc::new(activity::Ready::new(b.clone())),
            activity::executing(b.clone()),
            completing(),
            completed(),
        ],
        NodeFamily::CatchEvent => vec![
            activity::initializing(b.clone(), false),
            Arc::new(Waiting::subscribing(b.clone())),
            activity::executing(b.clone()),
            completing(),
            completed(),
        ],
        NodeFamily::CallActivity => vec![
            call_activity::initializing(b.clone(), process_executor.clone()),
            Arc::new(call_activity::Executing::new(b.clone())),
            Arc::new(call_activity::Ending::new(b.clone())),
            completing(),
            completed(),
        ],
        NodeFamily::StandardLoop => vec![
            Arc::new(loop_activity::Initializing::new(b.clone())),
            Arc::new(loop_activity::Executing::new(b.clone())),
            completing(),
            completed(),
        ],
        NodeFamily::MultiInstance => vec![
            Arc::new(multi_instance::Initializing::new(b.clone())),
            Arc::new(multi_instance::Executing::new(b.clone())),
            completing(),
            completed(),
        ],
        NodeFamily::Gateway => vec![
            Arc::new(MergeWaiting::new(b.clone())),
            event::executing(b.clone()),
            completed(),
        ],
        NodeFamily::StartEvent => vec![event::executing(b.clone()), completed()],
        NodeFamily::ThrowEvent => vec![
            event::throwing(b.clone(), process_executor.clone()),
            completed(),
        ],
        NodeFamily::BoundaryEvent => vec![
            boundary::initializing(b.clone()),
            Arc::new(Waiting::subscribed(b.clone())),
            Arc::new(boundary::Executing::new(b.clone())),
            completed(),
        ],
    }
}

fn interrupt_states(
    family: NodeFamily,
    category: StateCategory,
    behaviors: &Arc<StateBehaviors>,
    process_executor: &Arc<ProcessExecutor>,
) -> Vec<Arc<dyn FlowNodeState>> {
    let interrupting: Arc<dyn FlowNodeState> = if family == NodeFamily::CallActivity {
        Arc::new(Interrupting::call_activity(
            category,
            behaviors.clone(),
            process_executor.clone(),
        ))
    } else {
        Arc::new(Interrupting::new(category, behaviors.clone()))
    };
    let end: Arc<dyn FlowNodeState> = match category {
        StateCategory::Cancelling => Arc::new(Terminal::cancelled(behaviors.clone())),
        _ => Arc::new(Terminal::aborted(behaviors.clone())),
    };
    vec![interrupting, end]
}
