//! Events - in-process pub/sub and its subscribers

pub mod analytics;
pub mod audit;
pub mod bus;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use analytics::{AnalyticsSnapshot, TradeAnalytics};
pub use audit::{AuditSubscriber, TradeAuditLog};
pub use bus::{BusHealth, Event, EventBus, EventBusBuilder, EventHandler, PublishReport};

pub const EVENT_VERSION: &str = "v1";
pub const EXCHANGE_ID: &str = "sandbox";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    TradeProposed,
    TradeExecuted,
    DecisionCompleted,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventType::TradeProposed => write!(f, "trade_proposed"),
            EventType::TradeExecuted => write!(f, "trade_executed"),
            EventType::DecisionCompleted => write!(f, "decision_completed"),
        }
    }
}

/// Payload of `trade_executed`, published on open (OPEN) and close (CLOSED)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeExecutedEvent {
    pub trade_id: Uuid,
    pub owner: String,
    pub symbol: String,
    pub side: String,
    pub amount: f64,
    pub price: f64,
    pub executed_at: DateTime<Utc>,
    pub exchange_id: String,
    pub status: String,
    pub execution_time_ms: u64,
    #[serde(default)]
    pub pnl: Option<f64>,
}

/// Payload of `trade_proposed`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeProposedEvent {
    pub owner: String,
    pub symbol: String,
    pub side: String,
    pub amount: f64,
    pub confidence: f64,
    pub rationale: String,
}

/// Payload of `decision_completed`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionCompletedEvent {
    pub trace_id: Option<Uuid>,
    pub action: String,
    pub confidence: f64,
    pub acted: bool,
    pub persisted: bool,
    pub rationale: String,
}
