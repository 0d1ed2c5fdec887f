//! SQLite store - idempotent upserts keyed by stable ids

use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};
use serde::de::DeserializeOwned;
use uuid::Uuid;

use crate::agent::memory::MemoryRecord;
use crate::core::{Balance, Result, Store, Trade};
use crate::events::TradeAuditLog;
use crate::glassbox::{DecisionSpan, DecisionTrace};

const SCHEMA: &str = "BEGIN;
CREATE TABLE IF NOT EXISTS balances (
    owner TEXT PRIMARY KEY,
    available TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    version INTEGER NOT NULL DEFAULT 0,
    body TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS trades (
    id TEXT PRIMARY KEY,
    owner TEXT NOT NULL,
    pair TEXT NOT NULL,
    status TEXT NOT NULL,
    opened_at TEXT NOT NULL,
    body TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_trades_owner ON trades (owner, opened_at);
CREATE TABLE IF NOT EXISTS decision_traces (
    id TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    status TEXT NOT NULL,
    started_at TEXT NOT NULL,
    merkle_root TEXT,
    body TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS decision_spans (
    trace_id TEXT NOT NULL,
    position INTEGER NOT NULL,
    name TEXT NOT NULL,
    previous_hash TEXT NOT NULL,
    hash TEXT NOT NULL,
    body TEXT NOT NULL,
    PRIMARY KEY (trace_id, position)
);
CREATE TABLE IF NOT EXISTS trade_audit_logs (
    event_id TEXT PRIMARY KEY,
    trade_id TEXT NOT NULL,
    event_type TEXT NOT NULL,
    pair TEXT NOT NULL,
    direction TEXT NOT NULL,
    size REAL NOT NULL,
    price REAL NOT NULL,
    environment TEXT NOT NULL,
    status TEXT NOT NULL,
    execution_time_ms INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    raw TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS agent_memories (
    id TEXT PRIMARY KEY,
    action TEXT NOT NULL,
    confidence REAL NOT NULL,
    created_at TEXT NOT NULL,
    body TEXT NOT NULL
);
COMMIT;";

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database and apply the schema.
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn in_memory() -> Result<Self> {
        Self::open(":memory:")
    }

    /// Raw access for maintenance and tamper tests
    pub fn execute(&self, sql: &str, args: &[&dyn rusqlite::ToSql]) -> Result<usize> {
        Ok(self.conn.lock().execute(sql, args)?)
    }

    fn bodies<T: DeserializeOwned>(&self, sql: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<T>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map(args, |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        rows.iter()
            .map(|body| serde_json::from_str(body).map_err(Into::into))
            .collect()
    }
}

impl Store for SqliteStore {
    fn save_balance(&self, balance: &Balance) -> Result<()> {
        let body = serde_json::to_string(balance)?;
        self.conn.lock().execute(
            "INSERT INTO balances (owner, available, updated_at, version, body) VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(owner) DO UPDATE SET
                available = excluded.available,
                updated_at = excluded.updated_at,
                version = excluded.version,
                body = excluded.body
             WHERE excluded.version >= balances.version",
            params![
                balance.owner,
                balance.available.to_string(),
                balance.updated_at.to_rfc3339(),
                balance.version as i64,
                body
            ],
        )?;
        Ok(())
    }

    fn load_balance(&self, owner: &str) -> Result<Option<Balance>> {
        let body: Option<String> = self
            .conn
            .lock()
            .query_row(
                "SELECT body FROM balances WHERE owner = ?1",
                params![owner],
                |row| row.get(0),
            )
            .optional()?;
        body.map(|b| serde_json::from_str(&b).map_err(Into::into))
            .transpose()
    }

    fn save_trade(&self, trade: &Trade) -> Result<()> {
        let body = serde_json::to_string(trade)?;
        self.conn.lock().execute(
            "INSERT INTO trades (id, owner, pair, status, opened_at, body) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                body = excluded.body
             WHERE trades.status = 'OPEN' OR excluded.status = 'CLOSED'",
            params![
                trade.id.to_string(),
                trade.owner,
                trade.pair.as_str(),
                trade.status.to_string(),
                trade.opened_at.to_rfc3339(),
                body
            ],
        )?;
        Ok(())
    }

    fn load_trades(&self, owner: &str) -> Result<Vec<Trade>> {
        self.bodies(
            "SELECT body FROM trades WHERE owner = ?1 ORDER BY opened_at",
            &[&owner],
        )
    }

    fn save_trace(&self, trace: &DecisionTrace) -> Result<()> {
        let mut header = trace.clone();
        let spans = std::mem::take(&mut header.spans);
        let body = serde_json::to_string(&header)?;

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO decision_traces (id, kind, status, started_at, merkle_root, body)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                merkle_root = excluded.merkle_root,
                body = excluded.body",
            params![
                trace.id.to_string(),
                trace.kind.to_string(),
                trace.status.to_string(),
                trace.started_at.to_rfc3339(),
                trace.merkle_root,
                body
            ],
        )?;
        for span in &spans {
            tx.execute(
                "INSERT INTO decision_spans (trace_id, position, name, previous_hash, hash, body)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(trace_id, position) DO UPDATE SET
                    name = excluded.name,
                    previous_hash = excluded.previous_hash,
                    hash = excluded.hash,
                    body = excluded.body",
                params![
                    trace.id.to_string(),
                    span.position as i64,
                    span.name,
                    span.previous_hash,
                    span.hash,
                    serde_json::to_string(span)?
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn load_trace(&self, id: Uuid) -> Result<Option<DecisionTrace>> {
        let key = id.to_string();
        let header: Option<String> = self
            .conn
            .lock()
            .query_row(
                "SELECT body FROM decision_traces WHERE id = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        let Some(header) = header else {
            return Ok(None);
        };

        let mut trace: DecisionTrace = serde_json::from_str(&header)?;
        trace.spans = self.bodies::<DecisionSpan>(
            "SELECT body FROM decision_spans WHERE trace_id = ?1 ORDER BY position",
            &[&key],
        )?;
        Ok(Some(trace))
    }

    fn save_audit_log(&self, log: &TradeAuditLog) -> Result<()> {
        self.conn.lock().execute(
            "INSERT INTO trade_audit_logs
                (event_id, trade_id, event_type, pair, direction, size, price, environment, status, execution_time_ms, created_at, raw)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT(event_id) DO NOTHING",
            params![
                log.event_id.to_string(),
                log.trade_id.to_string(),
                log.event_type,
                log.pair,
                log.direction,
                log.size,
                log.price,
                log.environment,
                log.status,
                log.execution_time_ms as i64,
                log.created_at.to_rfc3339(),
                log.raw.to_string()
            ],
        )?;
        Ok(())
    }

    fn audit_logs(&self, limit: usize) -> Result<Vec<TradeAuditLog>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT event_id, trade_id, event_type, pair, direction, size, price, environment, status,
                    execution_time_ms, created_at, raw
             FROM trade_audit_logs ORDER BY created_at DESC, rowid DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, f64>(5)?,
                    row.get::<_, f64>(6)?,
                    row.get::<_, String>(7)?,
                    row.get::<_, String>(8)?,
                    row.get::<_, i64>(9)?,
                    row.get::<_, String>(10)?,
                    row.get::<_, String>(11)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(event_id, trade_id, event_type, pair, direction, size, price, environment, status, ms, created_at, raw)| {
                Ok(TradeAuditLog {
                    event_id: parse_uuid(&event_id)?,
                    trade_id: parse_uuid(&trade_id)?,
                    event_type,
                    pair,
                    direction,
                    size,
                    price,
                    environment,
                    status,
                    execution_time_ms: ms.max(0) as u64,
                    created_at: chrono::DateTime::parse_from_rfc3339(&created_at)
                        .map_err(|e| crate::core::Error::Persistence(e.to_string()))?
                        .with_timezone(&chrono::Utc),
                    raw: serde_json::from_str(&raw)?,
                })
            })
            .collect()
    }

    fn save_memory(&self, memory: &MemoryRecord) -> Result<()> {
        let body = serde_json::to_string(memory)?;
        self.conn.lock().execute(
            "INSERT INTO agent_memories (id, action, confidence, created_at, body) VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET body = excluded.body",
            params![
                memory.id.to_string(),
                memory.action,
                memory.confidence,
                memory.created_at.to_rfc3339(),
                body
            ],
        )?;
        Ok(())
    }

    fn recent_memories(&self, limit: usize) -> Result<Vec<MemoryRecord>> {
        let limit = limit as i64;
        self.bodies(
            "SELECT body FROM agent_memories ORDER BY created_at DESC, rowid DESC LIMIT ?1",
            &[&limit],
        )
    }
}

fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| crate::core::Error::Persistence(format!("bad uuid '{}': {}", s, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Error;
    use crate::glassbox::{SpanKind, SpanOutcome, TraceKind};
    use crate::storage::{Table, WriteOp, WriteQueue};
    use rust_decimal::Decimal;
    use serde_json::json;

    fn file_store() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sandbox.db");
        let store = SqliteStore::open(path.to_str().unwrap()).unwrap();
        (dir, store)
    }

    fn trace() -> DecisionTrace {
        let mut t = DecisionTrace::new(TraceKind::TradeExecution, json!({"owner": "alice"}));
        t.record("input_validation", SpanKind::Validation, json!({"size": "500"}), SpanOutcome::ok(json!({"valid": true})))
            .unwrap();
        t.record("market_pricing", SpanKind::Computation, json!({}), SpanOutcome::ok(json!({"price": 43250.5})))
            .unwrap();
        t.finalize("executed", 1.0).unwrap();
        t
    }

    #[test]
    fn test_balance_upsert_roundtrip() {
        let (_dir, store) = file_store();
        let mut b = Balance::new("alice", Decimal::from(10_000), None);
        store.save_balance(&b).unwrap();
        b.debit(Decimal::new(50050, 2)).unwrap();
        store.save_balance(&b).unwrap();

        let loaded = store.load_balance("alice").unwrap().unwrap();
        assert_eq!(loaded.available, Decimal::new(949950, 2));
        assert!(store.load_balance("bob").unwrap().is_none());
    }

    #[test]
    fn test_trace_survives_reload_and_verifies() {
        let (_dir, store) = file_store();
        let t = trace();
        store.save_trace(&t).unwrap();
        // replay is harmless
        store.save_trace(&t).unwrap();

        let loaded = store.load_trace(t.id).unwrap().unwrap();
        assert_eq!(loaded.spans.len(), 2);
        assert_eq!(loaded.merkle_root, t.merkle_root);
        loaded.verify_chain().unwrap();
    }

    #[test]
    fn test_tampered_span_row_detected() {
        let (_dir, store) = file_store();
        let t = trace();
        store.save_trace(&t).unwrap();

        let mut forged = t.spans[1].clone();
        forged.output = json!({"price": 1.0});
        let body = serde_json::to_string(&forged).unwrap();
        let id = t.id.to_string();
        store
            .execute(
                "UPDATE decision_spans SET body = ?1 WHERE trace_id = ?2 AND position = 1",
                &[&body, &id],
            )
            .unwrap();

        let loaded = store.load_trace(t.id).unwrap().unwrap();
        assert!(matches!(loaded.verify_chain(), Err(Error::Integrity { position: 1, .. })));
    }

    #[test]
    fn test_queued_write_replays_through_apply() {
        let store = SqliteStore::in_memory().unwrap();
        let queue = WriteQueue::new(10, 5);
        let b = Balance::new("carol", Decimal::from(42), None);
        queue.enqueue(WriteOp::Create, Table::Balances, &b).unwrap();
        queue.enqueue(WriteOp::Update, Table::Balances, &b).unwrap();

        assert_eq!(queue.flush(&store).flushed, 2);
        assert_eq!(store.load_balance("carol").unwrap().unwrap().available, Decimal::from(42));
    }

    fn open_trade() -> Trade {
        use crate::core::{Direction, MarketSnapshot, PriceTier, Symbol, TradeStatus};
        let now = chrono::Utc::now();
        Trade {
            id: Uuid::new_v4(),
            owner: "alice".into(),
            pair: Symbol::new("BTC/USDC"),
            direction: Direction::Buy,
            size: Decimal::from(500),
            entry_price: Decimal::from(43_250),
            exit_price: None,
            fees: Decimal::new(5, 1),
            status: TradeStatus::Open,
            pnl: None,
            pnl_percent: None,
            opened_at: now,
            closed_at: None,
            reasoning: String::new(),
            content_hash: String::new(),
            market: MarketSnapshot {
                price: Decimal::from(43_250),
                change_24h: 0.0,
                volume_24h: 0.0,
                market_cap: 0.0,
                tier: PriceTier::Live,
                captured_at: now,
            },
            trace_id: None,
        }
    }

    #[test]
    fn test_stale_replay_keeps_newer_rows() {
        let store = SqliteStore::in_memory().unwrap();
        let queue = WriteQueue::new(10, 5);

        let opened = open_trade();
        let mut closed = opened.clone();
        closed.status = crate::core::TradeStatus::Closed;
        closed.exit_price = Some(Decimal::from(44_000));
        let before = Balance::new("alice", Decimal::from(10_000), None);
        let mut after = before.clone();
        after.debit(Decimal::new(50050, 2)).unwrap();
        after.credit(Decimal::from(508));

        queue.enqueue(WriteOp::Create, Table::Trades, &opened).unwrap();
        queue.enqueue(WriteOp::Update, Table::Balances, &before).unwrap();
        store.save_trade(&closed).unwrap();
        store.save_balance(&after).unwrap();

        assert_eq!(queue.flush(&store).flushed, 2);
        let trades = store.load_trades("alice").unwrap();
        assert_eq!(trades[0].status, crate::core::TradeStatus::Closed);
        assert_eq!(store.load_balance("alice").unwrap().unwrap(), after);
    }

    #[test]
    fn test_memories_newest_first() {
        let store = SqliteStore::in_memory().unwrap();
        for (i, action) in ["wait", "trade"].iter().enumerate() {
            store
                .save_memory(&MemoryRecord {
                    id: Uuid::new_v4(),
                    action: action.to_string(),
                    detail: json!({}),
                    rationale: String::new(),
                    confidence: 0.7,
                    acted: i == 1,
                    success: None,
                    outcome: None,
                    trace_id: None,
                    created_at: chrono::Utc::now() + chrono::Duration::seconds(i as i64),
                })
                .unwrap();
        }
        let recent = store.recent_memories(1).unwrap();
        assert_eq!(recent[0].action, "trade");
    }
}
