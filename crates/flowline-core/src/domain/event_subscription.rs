use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::flow_node_instance::{FlowNodeInstanceId, ProcessInstanceId};
use crate::domain::process_definition::EventTrigger;

/// Value object: Event subscription ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(pub String);

/// A flow node waiting for a message, signal or timer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventSubscription {
    /// Unique identifier
    pub id: SubscriptionId,

    /// Process instance of the waiting flow node
    pub process_instance_id: ProcessInstanceId,

    /// The waiting flow node
    pub flow_node_instance_id: FlowNodeInstanceId,

    /// What the flow node waits for
    pub trigger: EventTrigger,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

impl EventSubscription {
    /// Create a subscription
    pub fn new(
        process_instance_id: ProcessInstanceId,
        flow_node_instance_id: FlowNodeInstanceId,
        trigger: EventTrigger,
    ) -> Self {
        Self {
            id: SubscriptionId(Uuid::new_v4().to_string()),
            process_instance_id,
            flow_node_instance_id,
            trigger,
            created_at: Utc::now(),
        }
    }

    /// Whether a thrown `trigger` reaches this subscription.
    ///
    /// Messages are scoped to `process` when one is given; signals are
    /// broadcast. Timers only fire through their flow node.
    pub fn matches(&self, trigger: &EventTrigger, process: Option<&ProcessInstanceId>) -> bool {
        match (&self.trigger, trigger) {
            (EventTrigger::Message(expected), EventTrigger::Message(name)) => {
                expected == name && process.map_or(true, |p| p == &self.process_instance_id)
            }
            (EventTrigger::Signal(expected), EventTrigger::Signal(name)) => expected == name,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subscription(trigger: EventTrigger) -> EventSubscription {
        EventSubscription::new(
            ProcessInstanceId("p1".into()),
            FlowNodeInstanceId("f1".into()),
            trigger,
        )
    }

    #[test]
    fn test_message_matching_is_scoped() {
        let sub = subscription(EventTrigger::Message("paid".into()));
        let paid = EventTrigger::Message("paid".into());

        assert!(sub.matches(&paid, None));
        assert!(sub.matches(&paid, Some(&ProcessInstanceId("p1".into()))));
        assert!(!sub.matches(&paid, Some(&ProcessInstanceId("p2".into()))));
        assert!(!sub.matches(&EventTrigger::Message("shipped".into()), None));
    }

    #[test]
    fn test_signals_are_broadcast() {
        let sub = subscription(EventTrigger::Signal("stop".into()));
        assert!(sub.matches(
            &EventTrigger::Signal("stop".into()),
            Some(&ProcessInstanceId("other".into()))
        ));
        assert!(!sub.matches(&EventTrigger::Message("stop".into()), None));
    }

    #[test]
    fn test_timers_never_match_thrown_events() {
        let sub = subscription(EventTrigger::Timer(500));
        assert!(!sub.matches(&EventTrigger::Timer(500), None));
    }
}
