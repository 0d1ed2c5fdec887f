//! Write queue - bounded buffer of failed writes with a single FIFO flusher
//!
//! Ordering is per table: once an item for a table fails during a flush,
//! later items for that table wait for the next pass.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::core::config::WriteQueueConfig;
use crate::core::{Result, Store};
use crate::storage::{QueuedWrite, Table, WriteOp};

/// Why a write left the queue without being stored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    Evicted,
    RetriesExhausted,
}

/// A write that was given up on
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetter {
    pub write: QueuedWrite,
    pub reason: DropReason,
    pub last_error: Option<String>,
    pub dropped_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    pub flushed: usize,
    pub retried: usize,
    pub dropped: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub queue_size: usize,
    pub max_queue_size: usize,
    pub oldest_write_age_secs: Option<i64>,
    pub dead_letters: usize,
}

pub struct WriteQueue {
    items: Mutex<VecDeque<QueuedWrite>>,
    dead_letters: Mutex<VecDeque<DeadLetter>>,
    capacity: usize,
    max_attempts: u32,
}

impl WriteQueue {
    pub fn new(capacity: usize, max_attempts: u32) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            dead_letters: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn from_config(config: &WriteQueueConfig) -> Self {
        Self::new(config.capacity, config.max_attempts)
    }

    /// Buffer a failed write. Never blocks beyond a brief lock; evicts the
    /// oldest 10% when full.
    pub fn enqueue<T: Serialize>(&self, operation: WriteOp, table: Table, payload: &T) -> Result<()> {
        let payload = serde_json::to_value(payload)?;
        self.enqueue_value(operation, table, payload);
        Ok(())
    }

    pub fn enqueue_value(&self, operation: WriteOp, table: Table, payload: serde_json::Value) {
        let write = QueuedWrite {
            id: Uuid::new_v4(),
            operation,
            table,
            payload,
            enqueued_at: Utc::now(),
            attempts: 0,
            max_attempts: self.max_attempts,
        };

        let evicted: Vec<QueuedWrite> = {
            let mut items = self.items.lock();
            let len = items.len();
            let evicted = if len >= self.capacity {
                let n = (self.capacity / 10).max(1);
                items.drain(..n.min(len)).collect()
            } else {
                Vec::new()
            };
            items.push_back(write);
            evicted
        };

        if !evicted.is_empty() {
            error!(
                "❌ Write queue full ({}), evicted {} oldest writes",
                self.capacity,
                evicted.len()
            );
            for w in evicted {
                self.bury(w, DropReason::Evicted, None);
            }
        }
        debug!("Queued {} on {} for retry", operation, table);
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Retry every queued write once, oldest first.
    pub fn flush(&self, store: &dyn Store) -> FlushReport {
        let batch = std::mem::take(&mut *self.items.lock());
        if batch.is_empty() {
            return FlushReport::default();
        }

        let mut report = FlushReport::default();
        let mut blocked: HashSet<Table> = HashSet::new();
        let mut retained: Vec<QueuedWrite> = Vec::new();

        for mut write in batch {
            if blocked.contains(&write.table) {
                retained.push(write);
                continue;
            }
            match store.apply(&write) {
                Ok(()) => report.flushed += 1,
                Err(e) => {
                    write.attempts += 1;
                    blocked.insert(write.table);
                    if write.attempts >= write.max_attempts {
                        error!(
                            "❌ Dropping {} on {} after {} attempts: {}",
                            write.operation, write.table, write.attempts, e
                        );
                        self.bury(write, DropReason::RetriesExhausted, Some(e.to_string()));
                        report.dropped += 1;
                    } else {
                        warn!(
                            "⚠️ Retry {}/{} failed for {} on {}: {}",
                            write.attempts, write.max_attempts, write.operation, write.table, e
                        );
                        retained.push(write);
                        report.retried += 1;
                    }
                }
            }
        }

        // writes enqueued while the batch was out went in unchecked
        let overflow: Vec<QueuedWrite> = {
            let mut items = self.items.lock();
            for write in retained.into_iter().rev() {
                items.push_front(write);
            }
            let len = items.len();
            if len > self.capacity {
                items.drain(..len - self.capacity).collect()
            } else {
                Vec::new()
            }
        };
        if !overflow.is_empty() {
            error!(
                "❌ Write queue over capacity ({}) after flush, evicted {} oldest writes",
                self.capacity,
                overflow.len()
            );
            for w in overflow {
                self.bury(w, DropReason::Evicted, None);
            }
        }

        if report.flushed > 0 {
            info!("💾 Write queue flushed {} writes ({} pending)", report.flushed, self.len());
        }
        report
    }

    /// Writes that were evicted or exhausted their retries
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.dead_letters.lock().iter().cloned().collect()
    }

    pub fn stats(&self) -> QueueStats {
        let items = self.items.lock();
        QueueStats {
            queue_size: items.len(),
            max_queue_size: self.capacity,
            oldest_write_age_secs: items
                .front()
                .map(|w| (Utc::now() - w.enqueued_at).num_seconds()),
            dead_letters: self.dead_letters.lock().len(),
        }
    }

    /// Flush every `every` until shutdown, then flush once more.
    /// Store I/O runs on the blocking pool.
    pub fn spawn_flusher(
        self: Arc<Self>,
        store: Arc<dyn Store>,
        every: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.clone().flush_blocking(store.clone()).await;
                    }
                    _ = shutdown.changed() => {
                        let report = self.clone().flush_blocking(store.clone()).await;
                        info!("Write queue flusher stopping ({:?}, {} pending)", report, self.len());
                        break;
                    }
                }
            }
        })
    }

    async fn flush_blocking(self: Arc<Self>, store: Arc<dyn Store>) -> FlushReport {
        match tokio::task::spawn_blocking(move || self.flush(store.as_ref())).await {
            Ok(report) => report,
            Err(e) => {
                error!("❌ Write queue flush task failed: {}", e);
                FlushReport::default()
            }
        }
    }

    fn bury(&self, write: QueuedWrite, reason: DropReason, last_error: Option<String>) {
        let mut dead = self.dead_letters.lock();
        if dead.len() >= self.capacity {
            dead.pop_front();
        }
        dead.push_back(DeadLetter {
            write,
            reason,
            last_error,
            dropped_at: Utc::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Balance;
    use crate::storage::MemoryStore;
    use rust_decimal::Decimal;

    fn balance(owner: &str) -> Balance {
        Balance::new(owner, Decimal::from(10_000), None)
    }

    #[test]
    fn test_overflow_evicts_oldest_tenth() {
        let q = WriteQueue::new(20, 5);
        for i in 0..20 {
            q.enqueue(WriteOp::Create, Table::Balances, &balance(&format!("u{}", i)))
                .unwrap();
        }
        assert_eq!(q.len(), 20);

        q.enqueue(WriteOp::Create, Table::Balances, &balance("late")).unwrap();
        assert_eq!(q.len(), 19);

        let dead = q.dead_letters();
        assert_eq!(dead.len(), 2);
        assert!(dead.iter().all(|d| d.reason == DropReason::Evicted));
        assert_eq!(dead[0].write.payload["owner"], "u0");
        assert_eq!(dead[1].write.payload["owner"], "u1");
    }

    #[test]
    fn test_successful_flush_removes_item() {
        let q = WriteQueue::new(10, 5);
        let store = MemoryStore::new();
        q.enqueue(WriteOp::Create, Table::Balances, &balance("alice")).unwrap();

        let report = q.flush(&store);
        assert_eq!(report.flushed, 1);
        assert!(q.is_empty());
        assert!(store.load_balance("alice").unwrap().is_some());
    }

    #[test]
    fn test_failed_flush_retries_then_drops() {
        let q = WriteQueue::new(10, 3);
        let store = MemoryStore::new();
        store.set_unavailable(true);
        q.enqueue(WriteOp::Update, Table::Balances, &balance("alice")).unwrap();

        assert_eq!(q.flush(&store).retried, 1);
        assert_eq!(q.flush(&store).retried, 1);
        assert_eq!(q.len(), 1);

        let last = q.flush(&store);
        assert_eq!(last.dropped, 1);
        assert!(q.is_empty());
        let dead = q.dead_letters();
        assert_eq!(dead[0].reason, DropReason::RetriesExhausted);
        assert_eq!(dead[0].write.attempts, 3);
        assert!(dead[0].last_error.is_some());
    }

    #[test]
    fn test_per_table_fifo_after_failure() {
        let q = WriteQueue::new(10, 5);
        let store = MemoryStore::new();
        q.enqueue(WriteOp::Create, Table::Balances, &balance("first")).unwrap();
        q.enqueue(WriteOp::Create, Table::Balances, &balance("second")).unwrap();

        store.set_unavailable(true);
        let report = q.flush(&store);
        // second item is held back behind the failed first one
        assert_eq!(report.retried, 1);
        assert_eq!(q.len(), 2);

        store.set_unavailable(false);
        assert_eq!(q.flush(&store).flushed, 2);
        assert!(store.load_balance("second").unwrap().is_some());
    }

    /// Fails balance writes and enqueues more work from inside the flush.
    struct EnqueueingStore {
        inner: MemoryStore,
        queue: Arc<WriteQueue>,
    }

    impl Store for EnqueueingStore {
        fn save_balance(&self, b: &Balance) -> Result<()> {
            for i in 0..5 {
                self.queue
                    .enqueue(WriteOp::Create, Table::Balances, &balance(&format!("{}-{}", b.owner, i)))?;
            }
            Err(crate::core::Error::Persistence("down".into()))
        }
        fn load_balance(&self, owner: &str) -> Result<Option<Balance>> {
            self.inner.load_balance(owner)
        }
        fn save_trade(&self, t: &crate::core::Trade) -> Result<()> {
            self.inner.save_trade(t)
        }
        fn load_trades(&self, owner: &str) -> Result<Vec<crate::core::Trade>> {
            self.inner.load_trades(owner)
        }
        fn save_trace(&self, t: &crate::glassbox::DecisionTrace) -> Result<()> {
            self.inner.save_trace(t)
        }
        fn load_trace(&self, id: Uuid) -> Result<Option<crate::glassbox::DecisionTrace>> {
            self.inner.load_trace(id)
        }
        fn save_audit_log(&self, l: &crate::events::TradeAuditLog) -> Result<()> {
            self.inner.save_audit_log(l)
        }
        fn audit_logs(&self, limit: usize) -> Result<Vec<crate::events::TradeAuditLog>> {
            self.inner.audit_logs(limit)
        }
        fn save_memory(&self, m: &crate::agent::memory::MemoryRecord) -> Result<()> {
            self.inner.save_memory(m)
        }
        fn recent_memories(&self, limit: usize) -> Result<Vec<crate::agent::memory::MemoryRecord>> {
            self.inner.recent_memories(limit)
        }
    }

    #[test]
    fn test_enqueue_during_flush_respects_capacity() {
        let q = Arc::new(WriteQueue::new(10, 5));
        for i in 0..8 {
            q.enqueue(WriteOp::Create, Table::Balances, &balance(&format!("u{}", i)))
                .unwrap();
        }
        let store = EnqueueingStore {
            inner: MemoryStore::new(),
            queue: q.clone(),
        };

        // first write fails and enqueues 5 more while all 8 are out of the queue
        let report = q.flush(&store);
        assert_eq!(report.retried, 1);
        assert!(q.len() <= 10);
        assert_eq!(q.len(), 10);

        let dead = q.dead_letters();
        assert_eq!(dead.len(), 3);
        assert!(dead.iter().all(|d| d.reason == DropReason::Evicted));
        // the oldest retained writes went first
        assert_eq!(dead[0].write.payload["owner"], "u0");
    }

    #[tokio::test]
    async fn test_flusher_drains_on_shutdown() {
        let q = Arc::new(WriteQueue::new(10, 5));
        let store = Arc::new(MemoryStore::new());
        q.enqueue(WriteOp::Create, Table::Balances, &balance("alice")).unwrap();

        let (tx, rx) = watch::channel(false);
        let task = q.clone().spawn_flusher(store.clone(), Duration::from_secs(3600), rx);
        tx.send(true).unwrap();
        task.await.unwrap();

        assert!(q.is_empty());
        assert!(store.load_balance("alice").unwrap().is_some());
    }

    #[test]
    fn test_stats_report_oldest_age() {
        let q = WriteQueue::new(10, 5);
        assert!(q.stats().oldest_write_age_secs.is_none());
        q.enqueue(WriteOp::Create, Table::Balances, &balance("alice")).unwrap();
        let stats = q.stats();
        assert_eq!(stats.queue_size, 1);
        assert_eq!(stats.max_queue_size, 10);
        assert!(stats.oldest_write_age_secs.unwrap() >= 0);
    }
}
