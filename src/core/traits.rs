//! Core traits - Seams for external boundaries

use async_trait::async_trait;
use uuid::Uuid;

use crate::agent::memory::MemoryRecord;
use crate::core::{Balance, PriceQuote, Result, Symbol, Trade};
use crate::events::audit::TradeAuditLog;
use crate::glassbox::DecisionTrace;
use crate::storage::{QueuedWrite, Table};

/// Market data provider - flaky and rate limited by assumption
#[async_trait]
pub trait PriceSource: Send + Sync {
    /// Fetch the current quote for a symbol
    async fn fetch_quote(&self, symbol: &Symbol) -> Result<PriceQuote>;

    /// Source name for logs
    fn name(&self) -> &str;
}

/// Durable storage. Every write is an upsert under a stable key.
pub trait Store: Send + Sync {
    fn save_balance(&self, balance: &Balance) -> Result<()>;

    fn load_balance(&self, owner: &str) -> Result<Option<Balance>>;

    fn save_trade(&self, trade: &Trade) -> Result<()>;

    fn load_trades(&self, owner: &str) -> Result<Vec<Trade>>;

    /// Trace row plus all of its spans
    fn save_trace(&self, trace: &DecisionTrace) -> Result<()>;

    fn load_trace(&self, id: Uuid) -> Result<Option<DecisionTrace>>;

    fn save_audit_log(&self, log: &TradeAuditLog) -> Result<()>;

    /// Newest first
    fn audit_logs(&self, limit: usize) -> Result<Vec<TradeAuditLog>>;

    fn save_memory(&self, memory: &MemoryRecord) -> Result<()>;

    /// Newest first
    fn recent_memories(&self, limit: usize) -> Result<Vec<MemoryRecord>>;

    /// Replay a queued write against the matching upsert.
    fn apply(&self, write: &QueuedWrite) -> Result<()> {
        let payload = write.payload.clone();
        match write.table {
            Table::Balances => self.save_balance(&serde_json::from_value(payload)?),
            Table::Trades => self.save_trade(&serde_json::from_value(payload)?),
            Table::DecisionTraces => self.save_trace(&serde_json::from_value(payload)?),
            Table::AuditLogs => self.save_audit_log(&serde_json::from_value(payload)?),
            Table::Memories => self.save_memory(&serde_json::from_value(payload)?),
        }
    }
}
