//! Event bus - synchronous fan-out with per-subscriber isolation
//!
//! Subscriptions are fixed when the bus is built. A failing or panicking
//! handler is logged and skipped; the publisher never sees the failure.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::core::Result;
use crate::events::{EVENT_VERSION, EventType};

/// Envelope delivered to handlers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub event_type: EventType,
    pub version: String,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
}

/// Subscribers must be fast and non-blocking; they run on the publisher's task.
pub trait EventHandler: Send + Sync {
    fn name(&self) -> &str;

    fn handle(&self, event: &Event) -> Result<()>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PublishReport {
    pub delivered: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct BusHealth {
    pub topics: Vec<String>,
    pub total_subscribers: usize,
}

#[derive(Default)]
pub struct EventBusBuilder {
    handlers: BTreeMap<EventType, Vec<Arc<dyn EventHandler>>>,
}

impl EventBusBuilder {
    pub fn subscribe(mut self, event_type: EventType, handler: Arc<dyn EventHandler>) -> Self {
        debug!("📬 {} subscribed to {}", handler.name(), event_type);
        self.handlers.entry(event_type).or_default().push(handler);
        self
    }

    pub fn build(self) -> EventBus {
        EventBus {
            handlers: self.handlers,
        }
    }
}

pub struct EventBus {
    handlers: BTreeMap<EventType, Vec<Arc<dyn EventHandler>>>,
}

impl EventBus {
    pub fn builder() -> EventBusBuilder {
        EventBusBuilder::default()
    }

    /// A bus with no subscribers
    pub fn empty() -> Self {
        Self::builder().build()
    }

    pub fn publish<T: Serialize>(&self, event_type: EventType, payload: &T) -> PublishReport {
        let payload = match serde_json::to_value(payload) {
            Ok(v) => v,
            Err(e) => {
                warn!("⚠️ Could not encode {} event: {}", event_type, e);
                return PublishReport {
                    delivered: 0,
                    failed: 1,
                };
            }
        };

        let Some(handlers) = self.handlers.get(&event_type).filter(|h| !h.is_empty()) else {
            debug!("No subscribers for {}", event_type);
            return PublishReport::default();
        };

        let event = Event {
            id: Uuid::new_v4(),
            event_type,
            version: EVENT_VERSION.to_string(),
            timestamp: Utc::now(),
            payload,
        };

        let mut report = PublishReport::default();
        for handler in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler.handle(&event))) {
                Ok(Ok(())) => report.delivered += 1,
                Ok(Err(e)) => {
                    warn!("⚠️ Subscriber {} failed on {}: {}", handler.name(), event_type, e);
                    report.failed += 1;
                }
                Err(_) => {
                    error!("💥 Subscriber {} panicked on {}", handler.name(), event_type);
                    report.failed += 1;
                }
            }
        }
        report
    }

    pub fn subscriber_count(&self, event_type: EventType) -> usize {
        self.handlers.get(&event_type).map_or(0, Vec::len)
    }

    pub fn topics(&self) -> Vec<EventType> {
        self.handlers.keys().copied().collect()
    }

    pub fn health(&self) -> BusHealth {
        BusHealth {
            topics: self.handlers.keys().map(|t| t.to_string()).collect(),
            total_subscribers: self.handlers.values().map(Vec::len).sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Error;
    use parking_lot::Mutex;
    use serde_json::json;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<Event>>,
    }

    impl EventHandler for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        fn handle(&self, event: &Event) -> Result<()> {
            self.seen.lock().push(event.clone());
            Ok(())
        }
    }

    struct Failing;

    impl EventHandler for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        fn handle(&self, _event: &Event) -> Result<()> {
            Err(Error::EventDelivery("boom".into()))
        }
    }

    struct Panicking;

    impl EventHandler for Panicking {
        fn name(&self) -> &str {
            "panicking"
        }

        fn handle(&self, _event: &Event) -> Result<()> {
            panic!("subscriber bug")
        }
    }

    #[test]
    fn test_failures_are_isolated() {
        let recorder = Arc::new(Recorder::default());
        let bus = EventBus::builder()
            .subscribe(EventType::TradeExecuted, Arc::new(Failing))
            .subscribe(EventType::TradeExecuted, Arc::new(Panicking))
            .subscribe(EventType::TradeExecuted, recorder.clone())
            .build();

        let report = bus.publish(EventType::TradeExecuted, &json!({"trade_id": 1}));
        assert_eq!(report, PublishReport { delivered: 1, failed: 2 });

        let seen = recorder.seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].version, "v1");
        assert_eq!(seen[0].payload["trade_id"], 1);
    }

    #[test]
    fn test_no_subscribers_is_not_an_error() {
        let bus = EventBus::empty();
        assert_eq!(bus.publish(EventType::DecisionCompleted, &json!({})), PublishReport::default());
    }

    #[test]
    fn test_health_counts_subscribers() {
        let bus = EventBus::builder()
            .subscribe(EventType::TradeExecuted, Arc::new(Recorder::default()))
            .subscribe(EventType::TradeExecuted, Arc::new(Recorder::default()))
            .subscribe(EventType::TradeProposed, Arc::new(Recorder::default()))
            .build();
        let health = bus.health();
        assert_eq!(health.total_subscribers, 3);
        assert_eq!(health.topics, vec!["trade_proposed".to_string(), "trade_executed".to_string()]);
        assert_eq!(bus.subscriber_count(EventType::TradeExecuted), 2);
        assert_eq!(bus.subscriber_count(EventType::DecisionCompleted), 0);
    }
}
