//! In-process store with an outage switch

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;
use uuid::Uuid;

use crate::agent::memory::MemoryRecord;
use crate::core::{Balance, Error, Result, Store, Trade};
use crate::events::TradeAuditLog;
use crate::glassbox::DecisionTrace;

#[derive(Default)]
pub struct MemoryStore {
    balances: RwLock<HashMap<String, Balance>>,
    trades: RwLock<HashMap<Uuid, Trade>>,
    traces: RwLock<HashMap<Uuid, DecisionTrace>>,
    audit_logs: RwLock<Vec<TradeAuditLog>>,
    memories: RwLock<Vec<MemoryRecord>>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with a persistence error
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Relaxed);
    }

    fn check(&self) -> Result<()> {
        if self.unavailable.load(Ordering::Relaxed) {
            return Err(Error::Persistence("store unavailable".into()));
        }
        Ok(())
    }

    /// Direct access for tamper tests
    pub fn with_trace_mut<F: FnOnce(&mut DecisionTrace)>(&self, id: Uuid, f: F) -> bool {
        match self.traces.write().get_mut(&id) {
            Some(t) => {
                f(t);
                true
            }
            None => false,
        }
    }
}

impl Store for MemoryStore {
    fn save_balance(&self, balance: &Balance) -> Result<()> {
        self.check()?;
        let mut balances = self.balances.write();
        match balances.get(&balance.owner) {
            Some(current) if current.version > balance.version => {
                debug!("Skipping stale balance v{} for {} (stored v{})", balance.version, balance.owner, current.version);
            }
            _ => {
                balances.insert(balance.owner.clone(), balance.clone());
            }
        }
        Ok(())
    }

    fn load_balance(&self, owner: &str) -> Result<Option<Balance>> {
        self.check()?;
        Ok(self.balances.read().get(owner).cloned())
    }

    fn save_trade(&self, trade: &Trade) -> Result<()> {
        self.check()?;
        let mut trades = self.trades.write();
        match trades.get(&trade.id) {
            Some(current) if !current.is_open() && trade.is_open() => {
                debug!("Skipping stale open snapshot of closed trade {}", trade.id);
            }
            _ => {
                trades.insert(trade.id, trade.clone());
            }
        }
        Ok(())
    }

    fn load_trades(&self, owner: &str) -> Result<Vec<Trade>> {
        self.check()?;
        let mut trades: Vec<Trade> = self
            .trades
            .read()
            .values()
            .filter(|t| t.owner == owner)
            .cloned()
            .collect();
        trades.sort_by_key(|t| t.opened_at);
        Ok(trades)
    }

    fn save_trace(&self, trace: &DecisionTrace) -> Result<()> {
        self.check()?;
        self.traces.write().insert(trace.id, trace.clone());
        Ok(())
    }

    fn load_trace(&self, id: Uuid) -> Result<Option<DecisionTrace>> {
        self.check()?;
        Ok(self.traces.read().get(&id).cloned())
    }

    fn save_audit_log(&self, log: &TradeAuditLog) -> Result<()> {
        self.check()?;
        let mut logs = self.audit_logs.write();
        match logs.iter_mut().find(|l| l.event_id == log.event_id) {
            Some(existing) => *existing = log.clone(),
            None => logs.push(log.clone()),
        }
        Ok(())
    }

    fn audit_logs(&self, limit: usize) -> Result<Vec<TradeAuditLog>> {
        self.check()?;
        Ok(self.audit_logs.read().iter().rev().take(limit).cloned().collect())
    }

    fn save_memory(&self, memory: &MemoryRecord) -> Result<()> {
        self.check()?;
        let mut memories = self.memories.write();
        match memories.iter_mut().find(|m| m.id == memory.id) {
            Some(existing) => *existing = memory.clone(),
            None => memories.push(memory.clone()),
        }
        Ok(())
    }

    fn recent_memories(&self, limit: usize) -> Result<Vec<MemoryRecord>> {
        self.check()?;
        Ok(self.memories.read().iter().rev().take(limit).cloned().collect())
    }
}
