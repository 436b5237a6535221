//! Connector implementations run by the work queue

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

use flowline_core::application::work::ConnectorRequest;
use flowline_core::{CoreError, Variables};

use crate::error::InMemoryError;

/// A connector implementation, registered under a connector id
#[async_trait]
pub trait Connector: Send + Sync {
    /// Run the connector with its evaluated inputs and return its outputs
    async fn execute(&self, inputs: Variables) -> anyhow::Result<Variables>;
}

#[async_trait]
impl<F> Connector for F
where
    F: Fn(Variables) -> anyhow::Result<Variables> + Send + Sync,
{
    async fn execute(&self, inputs: Variables) -> anyhow::Result<Variables> {
        self(inputs)
    }
}

/// Connector implementations by connector id
#[derive(Default)]
pub struct ConnectorRegistry {
    connectors: DashMap<String, Arc<dyn Connector>>,
}

impl std::fmt::Debug for ConnectorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectorRegistry")
            .field("connectors", &self.connectors.len())
            .finish()
    }
}

impl ConnectorRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `connector` under `connector_id`, replacing any previous one
    pub fn register<S: Into<String>>(&self, connector_id: S, connector: Arc<dyn Connector>) {
        self.connectors.insert(connector_id.into(), connector);
    }

    /// Run the connector a request names
    pub async fn execute(&self, request: &ConnectorRequest) -> Result<Variables, CoreError> {
        let connector_id = &request.definition.connector_id;
        let connector = self
            .connectors
            .get(connector_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| InMemoryError::UnknownConnector(connector_id.clone()))?;

        debug!(
            connector = %request.definition.name,
            connector_id = %connector_id,
            flow_node = %request.flow_node_instance_id,
            "running connector"
        );
        connector
            .execute(request.inputs.clone())
            .await
            .map_err(|err| CoreError::Connector(format!("{}: {:#}", request.definition.name, err)))
    }
}
