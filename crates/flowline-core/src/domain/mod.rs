/// Process and flow node definitions
pub mod process_definition;

/// Flow node instance domain models
pub mod flow_node_instance;

/// Process instance domain models
pub mod process_instance;

/// Connector instances
pub mod connector;

/// Waiting event subscriptions
pub mod event_subscription;

/// Domain events
pub mod events;

/// Expression evaluation
pub mod expression;

/// Repository interfaces
pub mod repository;
