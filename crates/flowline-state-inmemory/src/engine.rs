use std::sync::Arc;
use tracing::info;

use flowline_core::domain::expression::JmesPathEvaluator;
use flowline_core::{
    CoreResult, EngineConfig, EngineServices, FlowNodeExecutor, FlowNodeStateManager, ProcessExecutor,
    RuntimeInterface, StateBehaviors,
};

use crate::connectors::ConnectorRegistry;
use crate::events::RecordingEventHandler;
use crate::work_queue::{drain, InMemoryWorkQueue, JobRunner, WorkerPool};
use crate::InMemoryStateStoreProvider;

/// Upper bound of jobs handled by one [`InMemoryEngine::run_until_idle`] call
const DRAIN_LIMIT: usize = 100_000;

/// A complete engine running against the in-memory store
#[derive(Debug)]
pub struct InMemoryEngine {
    config: EngineConfig,
    store: InMemoryStateStoreProvider,
    queue: Arc<InMemoryWorkQueue>,
    connectors: Arc<ConnectorRegistry>,
    events: Arc<RecordingEventHandler>,
    executor: Arc<FlowNodeExecutor>,
    runner: Arc<JobRunner>,
    runtime: RuntimeInterface,
}

impl InMemoryEngine {
    /// Assemble an engine
    pub fn new(config: EngineConfig) -> CoreResult<Self> {
        config.validate()?;

        let store = InMemoryStateStoreProvider::new();
        let queue = Arc::new(InMemoryWorkQueue::new());
        let connectors = Arc::new(ConnectorRegistry::new());
        let events = Arc::new(RecordingEventHandler::with_capacity(config.event_log_capacity));

        let services = Arc::new(EngineServices {
            config: config.clone(),
            definitions: store.definitions.clone(),
            flow_nodes: store.flow_nodes.clone(),
            processes: store.processes.clone(),
            connectors: store.connectors.clone(),
            data: store.data.clone(),
            subscriptions: store.subscriptions.clone(),
            expressions: Arc::new(JmesPathEvaluator),
            connector_executor: queue.clone(),
            dispatcher: queue.clone(),
            events: events.clone(),
        });
        let behaviors = Arc::new(StateBehaviors::new(services.clone()));
        let process_executor = Arc::new(ProcessExecutor::new(services.clone(), behaviors.clone()));
        let manager = Arc::new(FlowNodeStateManager::new(behaviors.clone(), process_executor.clone())?);
        let executor = Arc::new(FlowNodeExecutor::new(
            services.clone(),
            behaviors.clone(),
            manager,
            process_executor.clone(),
        ));
        let runner = Arc::new(JobRunner::new(executor.clone(), connectors.clone(), &config));
        let runtime = RuntimeInterface::new(services, behaviors, process_executor);

        info!(workers = config.worker_count, "in-memory engine assembled");
        Ok(Self {
            config,
            store,
            queue,
            connectors,
            events,
            executor,
            runner,
            runtime,
        })
    }

    /// Assemble an engine configured from the environment
    pub fn from_env() -> CoreResult<Self> {
        Self::new(EngineConfig::load()?)
    }

    /// The API offered to engine users
    pub fn runtime(&self) -> &RuntimeInterface {
        &self.runtime
    }

    /// The stores
    pub fn store(&self) -> &InMemoryStateStoreProvider {
        &self.store
    }

    /// Connector implementations
    pub fn connectors(&self) -> &ConnectorRegistry {
        &self.connectors
    }

    /// Domain events emitted so far
    pub fn events(&self) -> &RecordingEventHandler {
        &self.events
    }

    /// The flow node executor
    pub fn executor(&self) -> &Arc<FlowNodeExecutor> {
        &self.executor
    }

    /// The work queue
    pub fn queue(&self) -> &Arc<InMemoryWorkQueue> {
        &self.queue
    }

    /// Handle queued jobs on the current task until none is left
    pub async fn run_until_idle(&self) -> CoreResult<usize> {
        drain(&self.queue, &self.runner, DRAIN_LIMIT).await
    }

    /// Start the configured number of workers
    pub fn start_workers(&self) -> WorkerPool {
        WorkerPool::start(self.queue.clone(), self.runner.clone(), &self.config)
    }
}
