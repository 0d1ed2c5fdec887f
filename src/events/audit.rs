//! Audit subscriber - normalizes trade events into durable audit rows

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::core::{Error, Result, Store};
use crate::events::{Event, EventHandler, TradeExecutedEvent};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeAuditLog {
    pub event_id: Uuid,
    pub trade_id: Uuid,
    pub event_type: String,
    pub pair: String,
    pub direction: String,
    pub size: f64,
    pub price: f64,
    pub environment: String,
    pub status: String,
    pub execution_time_ms: u64,
    pub created_at: DateTime<Utc>,
    /// Full event payload as published
    pub raw: serde_json::Value,
}

impl TradeAuditLog {
    pub fn from_event(event: &Event) -> Result<Self> {
        let trade: TradeExecutedEvent = serde_json::from_value(event.payload.clone())
            .map_err(|e| Error::EventDelivery(format!("unexpected {} payload: {}", event.event_type, e)))?;

        Ok(Self {
            event_id: event.id,
            trade_id: trade.trade_id,
            event_type: event.event_type.to_string(),
            pair: trade.symbol,
            direction: trade.side,
            size: trade.amount,
            price: trade.price,
            environment: trade.exchange_id,
            status: trade.status,
            execution_time_ms: trade.execution_time_ms,
            created_at: event.timestamp,
            raw: event.payload.clone(),
        })
    }
}

pub struct AuditSubscriber {
    store: Arc<dyn Store>,
}

impl AuditSubscriber {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }
}

impl EventHandler for AuditSubscriber {
    fn name(&self) -> &str {
        "trade_audit"
    }

    fn handle(&self, event: &Event) -> Result<()> {
        let log = TradeAuditLog::from_event(event)?;
        match self.store.save_audit_log(&log) {
            Ok(()) => debug!("📝 Audit logged {} {}", log.status, log.trade_id),
            Err(e) => warn!("⚠️ Audit log for trade {} not stored: {}", log.trade_id, e),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventBus, EventType};
    use crate::storage::MemoryStore;

    fn executed() -> TradeExecutedEvent {
        TradeExecutedEvent {
            trade_id: Uuid::new_v4(),
            owner: "alice".into(),
            symbol: "BTC/USDC".into(),
            side: "BUY".into(),
            amount: 500.0,
            price: 43_250.0,
            executed_at: Utc::now(),
            exchange_id: "sandbox".into(),
            status: "OPEN".into(),
            execution_time_ms: 3,
            pnl: None,
        }
    }

    #[test]
    fn test_audit_row_keeps_raw_payload() {
        let store = Arc::new(MemoryStore::new());
        let bus = EventBus::builder()
            .subscribe(EventType::TradeExecuted, Arc::new(AuditSubscriber::new(store.clone())))
            .build();
        let ev = executed();
        assert_eq!(bus.publish(EventType::TradeExecuted, &ev).delivered, 1);

        let logs = store.audit_logs(10).unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].trade_id, ev.trade_id);
        assert_eq!(logs[0].environment, "sandbox");
        assert_eq!(logs[0].raw["side"], "BUY");
    }

    #[test]
    fn test_store_outage_is_logged_only() {
        let store = Arc::new(MemoryStore::new());
        store.set_unavailable(true);
        let bus = EventBus::builder()
            .subscribe(EventType::TradeExecuted, Arc::new(AuditSubscriber::new(store.clone())))
            .build();
        let report = bus.publish(EventType::TradeExecuted, &executed());
        assert_eq!(report.failed, 0);
    }
}
