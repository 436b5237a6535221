use flowline_core::CoreError;
use thiserror::Error;

/// Errors raised by the in-memory store and work queue
#[derive(Error, Debug)]
pub enum InMemoryError {
    /// No active flow node instance with this id
    #[error("Flow node instance {0} not found")]
    FlowNodeNotFound(String),

    /// No active process instance with this id
    #[error("Process instance {0} not found")]
    ProcessNotFound(String),

    /// No connector instance with this id
    #[error("Connector instance {0} not found")]
    ConnectorNotFound(String),

    /// The variable was never declared in its container
    #[error("Variable {name} not found in {container}")]
    VariableNotFound {
        /// Data container
        container: String,
        /// Variable name
        name: String,
    },

    /// An instance with this id is already stored
    #[error("Duplicate id: {0}")]
    Duplicate(String),

    /// No connector implementation is registered under this id
    #[error("No connector registered as {0}")]
    UnknownConnector(String),

    /// The queue kept producing work past the drain limit
    #[error("Work queue still busy after {0} units of work")]
    QueueStalled(usize),
}

impl From<InMemoryError> for CoreError {
    fn from(err: InMemoryError) -> Self {
        match err {
            InMemoryError::FlowNodeNotFound(_)
            | InMemoryError::ProcessNotFound(_)
            | InMemoryError::ConnectorNotFound(_)
            | InMemoryError::VariableNotFound { .. } => CoreError::NotFound(err.to_string()),
            InMemoryError::UnknownConnector(_) => CoreError::Connector(err.to_string()),
            InMemoryError::Duplicate(_) | InMemoryError::QueueStalled(_) => {
                CoreError::StateStore(err.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_records_map_to_not_found() {
        let err: CoreError = InMemoryError::FlowNodeNotFound("f1".into()).into();
        assert!(err.is_not_found());

        let err: CoreError = InMemoryError::VariableNotFound {
            container: "p1".into(),
            name: "x".into(),
        }
        .into();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_unknown_connector_is_a_connector_error() {
        let err: CoreError = InMemoryError::UnknownConnector("http".into()).into();
        assert!(matches!(err, CoreError::Connector(_)));
        assert!(!err.is_retryable());
    }
}
