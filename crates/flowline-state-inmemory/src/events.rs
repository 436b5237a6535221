use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use tracing::trace;

use flowline_core::domain::events::{DomainEvent, DomainEventHandler, SystemCommentAdded};
use flowline_core::{CoreError, FlowNodeInstanceId, ProcessInstanceId};

/// A domain event as kept by [`RecordingEventHandler`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    /// Event type
    pub event_type: &'static str,
    /// Process instance
    pub process_instance_id: ProcessInstanceId,
    /// Flow node, for flow-node level events
    pub flow_node_instance_id: Option<FlowNodeInstanceId>,
    /// Comment text of system comments
    pub comment: Option<String>,
}

/// Event handler keeping the most recent events in memory, in emission order.
///
/// Once `capacity` events are held the oldest one is dropped for each new
/// event. A capacity of 0 only traces.
#[derive(Debug)]
pub struct RecordingEventHandler {
    capacity: usize,
    events: Mutex<VecDeque<RecordedEvent>>,
}

impl RecordingEventHandler {
    /// Create an empty handler holding at most `capacity` events
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            events: Mutex::new(VecDeque::new()),
        }
    }

    /// Maximum number of events held
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Events recorded and still held
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events
            .lock()
            .map(|events| events.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Events of one type
    pub fn of_type(&self, event_type: &str) -> Vec<RecordedEvent> {
        self.events()
            .into_iter()
            .filter(|event| event.event_type == event_type)
            .collect()
    }

    /// System comments attached to a process instance
    pub fn comments(&self, process: &ProcessInstanceId) -> Vec<String> {
        self.events()
            .into_iter()
            .filter(|event| &event.process_instance_id == process)
            .filter_map(|event| event.comment)
            .collect()
    }
}

#[async_trait]
impl DomainEventHandler for RecordingEventHandler {
    async fn handle_event(&self, event: Box<dyn DomainEvent>) -> Result<(), CoreError> {
        trace!(
            event_type = event.event_type(),
            process_instance = %event.process_instance_id(),
            "domain event"
        );
        if self.capacity == 0 {
            return Ok(());
        }
        let comment = event
            .as_any()
            .downcast_ref::<SystemCommentAdded>()
            .map(|added| added.comment.clone());
        let recorded = RecordedEvent {
            event_type: event.event_type(),
            process_instance_id: event.process_instance_id().clone(),
            flow_node_instance_id: event.flow_node_instance_id().cloned(),
            comment,
        };
        let mut events = self
            .events
            .lock()
            .map_err(|_| CoreError::Other("event log poisoned".to_string()))?;
        if events.len() >= self.capacity {
            events.pop_front();
        }
        events.push_back(recorded);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn comment(text: &str) -> Box<dyn DomainEvent> {
        Box::new(SystemCommentAdded {
            process_instance_id: ProcessInstanceId("p".into()),
            flow_node_instance_id: FlowNodeInstanceId("f".into()),
            comment: text.to_string(),
            timestamp: Utc::now(),
        })
    }

    #[tokio::test]
    async fn test_keeps_only_the_latest_events() {
        let handler = RecordingEventHandler::with_capacity(2);
        for text in ["one", "two", "three"] {
            handler.handle_event(comment(text)).await.unwrap();
        }

        assert_eq!(
            handler.comments(&ProcessInstanceId("p".into())),
            vec!["two".to_string(), "three".to_string()]
        );
    }

    #[tokio::test]
    async fn test_zero_capacity_records_nothing() {
        let handler = RecordingEventHandler::with_capacity(0);
        handler.handle_event(comment("dropped")).await.unwrap();

        assert!(handler.events().is_empty());
        assert_eq!(handler.capacity(), 0);
    }
}
