use thiserror::Error;

/// Core error type for the Flowline engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// A state invariant was violated while executing a flow node
    #[error("Flow node execution error: {0}")]
    FlowNodeExecution(String),

    /// A human task reached a state that requires an assignee
    #[error("Flow node instance {0} is not assigned")]
    NotAssigned(String),

    /// Transient contention in a store; the whole unit of work should be retried
    #[error("Retryable store error: {0}")]
    RetryableStore(String),

    /// The requested element does not exist (or was already archived)
    #[error("Not found: {0}")]
    NotFound(String),

    /// Non-transient store failure
    #[error("State store error: {0}")]
    StateStore(String),

    /// Expression evaluation error
    #[error("Expression evaluation error: {0}")]
    Expression(String),

    /// Connector execution error
    #[error("Connector error: {0}")]
    Connector(String),

    /// The process definition is inconsistent
    #[error("Definition error: {0}")]
    Definition(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

/// Result alias used throughout the engine
pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    /// Create a flow node execution error
    pub fn execution<S: Into<String>>(msg: S) -> Self {
        CoreError::FlowNodeExecution(msg.into())
    }

    /// Create a not-found error
    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        CoreError::NotFound(msg.into())
    }

    /// Create a definition error
    pub fn definition<S: Into<String>>(msg: S) -> Self {
        CoreError::Definition(msg.into())
    }

    /// Whether the work-dispatch layer should retry the unit of work
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::RetryableStore(_))
    }

    /// Whether this error is a benign read race
    pub fn is_not_found(&self) -> bool {
        matches!(self, CoreError::NotFound(_))
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Serialization(err.to_string())
    }
}

impl From<jmespath::JmespathError> for CoreError {
    fn from(err: jmespath::JmespathError) -> Self {
        CoreError::Expression(err.to_string())
    }
}

impl From<String> for CoreError {
    fn from(err: String) -> Self {
        CoreError::Other(err)
    }
}

impl From<&str> for CoreError {
    fn from(err: &str) -> Self {
        CoreError::Other(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let errors = vec![
            (CoreError::FlowNodeExecution("bad".to_string()), "Flow node execution error: bad"),
            (CoreError::NotAssigned("42".to_string()), "Flow node instance 42 is not assigned"),
            (CoreError::RetryableStore("stale row".to_string()), "Retryable store error: stale row"),
            (CoreError::NotFound("p1".to_string()), "Not found: p1"),
            (CoreError::StateStore("db".to_string()), "State store error: db"),
            (CoreError::Expression("syntax".to_string()), "Expression evaluation error: syntax"),
            (CoreError::Connector("timeout".to_string()), "Connector error: timeout"),
            (CoreError::Definition("missing".to_string()), "Definition error: missing"),
            (CoreError::Configuration("workers".to_string()), "Configuration error: workers"),
            (CoreError::Serialization("eof".to_string()), "Serialization error: eof"),
            (CoreError::Other("other".to_string()), "other"),
        ];

        for (error, expected_msg) in errors {
            assert_eq!(error.to_string(), expected_msg);
        }
    }

    #[test]
    fn test_classification() {
        assert!(CoreError::RetryableStore("lock".into()).is_retryable());
        assert!(!CoreError::StateStore("disk".into()).is_retryable());
        assert!(CoreError::not_found("x").is_not_found());
        assert!(!CoreError::execution("x").is_not_found());
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_error = serde_json::from_str::<serde_json::Value>("invalid json").unwrap_err();
        let error: CoreError = json_error.into();

        match error {
            CoreError::Serialization(msg) => assert!(msg.contains("expected value")),
            _ => panic!("Expected Serialization variant"),
        }
    }

    #[test]
    fn test_from_str() {
        let error: CoreError = "test error message".into();
        assert_eq!(error, CoreError::Other("test error message".to_string()));
    }
}
