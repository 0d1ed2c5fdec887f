//! Persistence - store backends and the retrying write queue

pub mod memory;
pub mod queue;
pub mod sqlite;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use memory::MemoryStore;
pub use queue::{DeadLetter, DropReason, FlushReport, QueueStats, WriteQueue};
pub use sqlite::SqliteStore;

/// Target table of a queued write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Balances,
    Trades,
    DecisionTraces,
    AuditLogs,
    Memories,
}

impl std::fmt::Display for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Table::Balances => write!(f, "balances"),
            Table::Trades => write!(f, "trades"),
            Table::DecisionTraces => write!(f, "decision_traces"),
            Table::AuditLogs => write!(f, "trade_audit_logs"),
            Table::Memories => write!(f, "agent_memories"),
        }
    }
}

/// Operation kind. Both replay as an idempotent upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteOp {
    Create,
    Update,
}

impl std::fmt::Display for WriteOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WriteOp::Create => write!(f, "create"),
            WriteOp::Update => write!(f, "update"),
        }
    }
}

/// A persistence attempt waiting to be retried
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedWrite {
    pub id: Uuid,
    pub operation: WriteOp,
    pub table: Table,
    pub payload: serde_json::Value,
    pub enqueued_at: DateTime<Utc>,
    pub attempts: u32,
    pub max_attempts: u32,
}
