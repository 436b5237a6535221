use std::sync::Arc;

use crate::application::work::{ConnectorExecutor, WorkDispatcher};
use crate::config::EngineConfig;
use crate::domain::events::DomainEventHandler;
use crate::domain::expression::ExpressionEvaluator;
use crate::domain::repository::{
    ConnectorInstanceRepository, DataInstanceRepository, EventSubscriptionRepository,
    FlowNodeInstanceRepository, ProcessDefinitionRepository, ProcessInstanceRepository,
};

/// The collaborators the engine runs against
#[derive(Clone)]
pub struct EngineServices {
    /// Engine configuration
    pub config: EngineConfig,

    /// Deployed process definitions
    pub definitions: Arc<dyn ProcessDefinitionRepository>,

    /// Flow node instance store
    pub flow_nodes: Arc<dyn FlowNodeInstanceRepository>,

    /// Process instance store
    pub processes: Arc<dyn ProcessInstanceRepository>,

    /// Connector instance store
    pub connectors: Arc<dyn ConnectorInstanceRepository>,

    /// Variables
    pub data: Arc<dyn DataInstanceRepository>,

    /// Waiting events
    pub subscriptions: Arc<dyn EventSubscriptionRepository>,

    /// Expression evaluator
    pub expressions: Arc<dyn ExpressionEvaluator>,

    /// Asynchronous connector execution
    pub connector_executor: Arc<dyn ConnectorExecutor>,

    /// Work dispatch
    pub dispatcher: Arc<dyn WorkDispatcher>,

    /// Audit trail
    pub events: Arc<dyn DomainEventHandler>,
}

impl std::fmt::Debug for EngineServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineServices")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
