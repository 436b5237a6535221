//! In-memory state store and engine for Flowline
//!
//! This crate provides in-memory implementations of the repository
//! interfaces defined in flowline-core, a work queue with a tokio worker
//! pool, a connector registry, and [`InMemoryEngine`] wiring them to the
//! core executors. It is primarily useful for development, testing, and
//! simple deployments where persistence is not required.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::sync::Arc;

/// Repository implementations
pub mod repositories;
pub use repositories::{
    InMemoryConnectorInstanceRepository, InMemoryDataInstanceRepository,
    InMemoryEventSubscriptionRepository, InMemoryFlowNodeInstanceRepository,
    InMemoryProcessDefinitionRepository, InMemoryProcessInstanceRepository,
};

/// Work queue, job runner and workers
pub mod work_queue;
pub use work_queue::{InMemoryWorkQueue, Job, JobRunner, WorkerPool};

/// Connector implementations
pub mod connectors;
pub use connectors::{Connector, ConnectorRegistry};

/// Recorded domain events
pub mod events;
pub use events::{RecordedEvent, RecordingEventHandler};

/// Error types
pub mod error;
pub use error::InMemoryError;

/// Engine facade
pub mod engine;
pub use engine::InMemoryEngine;

/// Provider for in-memory state store repositories
#[derive(Debug, Clone, Default)]
pub struct InMemoryStateStoreProvider {
    /// Deployed process definitions
    pub definitions: Arc<InMemoryProcessDefinitionRepository>,
    /// Flow node instances
    pub flow_nodes: Arc<InMemoryFlowNodeInstanceRepository>,
    /// Process instances
    pub processes: Arc<InMemoryProcessInstanceRepository>,
    /// Connector instances
    pub connectors: Arc<InMemoryConnectorInstanceRepository>,
    /// Variables
    pub data: Arc<InMemoryDataInstanceRepository>,
    /// Waiting events
    pub subscriptions: Arc<InMemoryEventSubscriptionRepository>,
}

impl InMemoryStateStoreProvider {
    /// Create a new in-memory state store provider
    pub fn new() -> Self {
        Self::default()
    }
}

/// Initialize tracing, filtered by `RUST_LOG` or else by `default_level`.
///
/// Does nothing when a global subscriber is already installed.
pub fn init_tracing(default_level: &str) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = fmt().with_env_filter(filter).with_target(true).try_init();
}
