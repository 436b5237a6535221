//! Configuration for the Flowline engine
//!
//! Values come from defaults, optionally overridden by `FLOWLINE_*`
//! environment variables.

use serde::{Deserialize, Serialize};
use std::env;
use tracing::warn;

use crate::{CoreError, CoreResult};

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Number of workers draining the work queue
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// Page size used when iterating the children of a flow node
    #[serde(default = "default_children_page_size")]
    pub children_page_size: usize,

    /// How many times a unit of work is retried after a retryable store error
    #[serde(default = "default_max_work_retries")]
    pub max_work_retries: u32,

    /// Delay between two attempts of the same unit of work
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Idle workers re-check the queue at least this often
    #[serde(default = "default_idle_poll_ms")]
    pub idle_poll_ms: u64,

    /// Most recent domain events kept in memory, 0 keeps none
    #[serde(default = "default_event_log_capacity")]
    pub event_log_capacity: usize,

    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_worker_count() -> usize {
    4
}

fn default_children_page_size() -> usize {
    100
}

fn default_max_work_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    20
}

fn default_idle_poll_ms() -> u64 {
    50
}

fn default_event_log_capacity() -> usize {
    10_000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            children_page_size: default_children_page_size(),
            max_work_retries: default_max_work_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            idle_poll_ms: default_idle_poll_ms(),
            event_log_capacity: default_event_log_capacity(),
            log_level: default_log_level(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables on top of the defaults
    pub fn load() -> CoreResult<Self> {
        let mut config = Self::default();

        if let Some(workers) = parse_env::<usize>("FLOWLINE_WORKER_COUNT") {
            config.worker_count = workers;
        }
        if let Some(page) = parse_env::<usize>("FLOWLINE_CHILDREN_PAGE_SIZE") {
            config.children_page_size = page;
        }
        if let Some(retries) = parse_env::<u32>("FLOWLINE_MAX_WORK_RETRIES") {
            config.max_work_retries = retries;
        }
        if let Some(backoff) = parse_env::<u64>("FLOWLINE_RETRY_BACKOFF_MS") {
            config.retry_backoff_ms = backoff;
        }
        if let Some(poll) = parse_env::<u64>("FLOWLINE_IDLE_POLL_MS") {
            config.idle_poll_ms = poll;
        }
        if let Some(capacity) = parse_env::<usize>("FLOWLINE_EVENT_LOG_CAPACITY") {
            config.event_log_capacity = capacity;
        }
        if let Ok(level) = env::var("FLOWLINE_LOG_LEVEL") {
            config.log_level = level;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> CoreResult<()> {
        if self.worker_count == 0 {
            return Err(CoreError::Configuration(
                "worker_count must be at least 1".to_string(),
            ));
        }
        if self.children_page_size == 0 {
            return Err(CoreError::Configuration(
                "children_page_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = env::var(key).ok()?;
    match raw.parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Invalid {} value: {}", key, raw);
            None
        }
    }
}
