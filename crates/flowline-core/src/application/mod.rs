/// Shared services handed to every component of the engine
pub mod services;

/// Units of work and the dispatch seam
pub mod work;

/// Behaviors shared by flow node states
pub mod state_behaviors;

/// Process-level execution
pub mod process_executor;

/// State chains of every node family
pub mod state_manager;

/// Flow node state machine driver
pub mod flow_node_executor;

/// API offered to engine users
pub mod runtime_interface;
