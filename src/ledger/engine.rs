//! Trading engine - execute/close against virtual balances
//!
//! Money-moving checks are strict and synchronous. Persistence, tracing and
//! event delivery are advisory: a trade that passed its checks is executed
//! even when those subsystems fail.

use chrono::Utc;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

use crate::core::config::TradingConfig;
use crate::core::{
    Advisory, Balance, Direction, Error, MarketSnapshot, Result, Store, Symbol, Trade, TradeStatus,
};
use crate::events::{EXCHANGE_ID, EventBus, EventType, TradeExecutedEvent};
use crate::glassbox::{self, DecisionTrace, GlassBox, SpanKind, SpanOutcome, TraceKind};
use crate::glassbox::hasher::sha256_hex;
use crate::ledger::{BalanceBook, PerformanceReport};
use crate::market::{PriceResolver, ResolvedPrice};
use crate::storage::{Table, WriteOp, WriteQueue};

/// Result of closing one trade during a kill-switch sweep
#[derive(Debug)]
pub struct CloseOutcome {
    pub trade_id: Uuid,
    pub result: Result<Trade>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UnrealizedPnl {
    pub owner: String,
    pub open_positions: usize,
    pub unrealized_pnl: Decimal,
}

pub struct TradingEngine {
    config: TradingConfig,
    balances: BalanceBook,
    trades: RwLock<HashMap<Uuid, Trade>>,
    prices: PriceResolver,
    store: Arc<dyn Store>,
    queue: Arc<WriteQueue>,
    bus: Arc<EventBus>,
    glassbox: Arc<GlassBox>,
}

/// SHA-256 over the entry fields of a trade
pub fn trade_hash(
    owner: &str,
    pair: &Symbol,
    direction: Direction,
    size: Decimal,
    price: Decimal,
    unix: i64,
) -> String {
    sha256_hex(format!(
        "{}-{}-{}-{:.8}-{:.8}-{}",
        owner, pair, direction, size, price, unix
    ))
}

impl TradingEngine {
    pub fn new(
        config: TradingConfig,
        prices: PriceResolver,
        store: Arc<dyn Store>,
        queue: Arc<WriteQueue>,
        bus: Arc<EventBus>,
        glassbox: Arc<GlassBox>,
    ) -> Self {
        let balances = BalanceBook::new(config.starting_balance, config.topup_policy(), store.clone());
        Self {
            config,
            balances,
            trades: RwLock::new(HashMap::new()),
            prices,
            store,
            queue,
            bus,
            glassbox,
        }
    }

    /// Load an owner's persisted trades into memory. Returns how many were new.
    pub fn restore(&self, owner: &str) -> Result<usize> {
        let stored = self.store.load_trades(owner)?;
        let mut trades = self.trades.write();
        let before = trades.len();
        for t in stored {
            trades.entry(t.id).or_insert(t);
        }
        let restored = trades.len() - before;
        if restored > 0 {
            info!("♻️ Restored {} trades for {}", restored, owner);
        }
        Ok(restored)
    }

    pub fn fee_for(&self, size: Decimal) -> Decimal {
        (size * self.config.fee_rate).round_dp(8)
    }

    /// Open a position of `size` USD.
    pub async fn execute_trade(
        &self,
        owner: &str,
        pair: &str,
        direction: Direction,
        size: Decimal,
        reasoning: &str,
    ) -> Result<Trade> {
        let started = Instant::now();
        let pair = Symbol::new(pair);
        let mut trace = self
            .glassbox
            .start(
                TraceKind::TradeExecution,
                json!({
                    "owner": owner,
                    "pair": pair.as_str(),
                    "direction": direction.to_string(),
                    "size": size.to_string(),
                }),
            )
            .advisory("start trade trace");

        let input = json!({ "pair": pair.as_str(), "size": size.to_string() });
        if let Err(e) = self.validate(owner, &pair, size) {
            self.abandon(&mut trace, "input_validation", SpanKind::Validation, input, &e);
            return Err(e);
        }
        glassbox::record(&mut trace, "input_validation", SpanKind::Validation, input, SpanOutcome::ok(json!({ "valid": true })));

        let fee = self.fee_for(size);
        let required = size + fee;
        let handle = match self.balances.handle(owner) {
            Ok(h) => h,
            Err(e) => {
                self.abandon(&mut trace, "balance_check", SpanKind::Validation, json!({ "owner": owner }), &e);
                return Err(e);
            }
        };
        let available = handle.lock().available;
        let input = json!({ "available": available.to_string(), "required": required.to_string() });
        if required > available {
            let e = Error::InsufficientBalance { available, required };
            self.abandon(&mut trace, "balance_check", SpanKind::Validation, input, &e);
            return Err(e);
        }
        glassbox::record(&mut trace, "balance_check", SpanKind::Validation, input, SpanOutcome::ok(json!({ "sufficient": true })));

        let resolved = match self.prices.resolve(&pair).await {
            Ok(r) => r,
            Err(e) => {
                self.abandon(&mut trace, "market_pricing", SpanKind::Computation, json!({ "pair": pair.as_str() }), &e);
                return Err(e);
            }
        };
        glassbox::record(
            &mut trace,
            "market_pricing",
            SpanKind::Computation,
            json!({ "pair": pair.as_str() }),
            SpanOutcome::ok(json!({ "price": resolved.quote.price.to_string(), "tier": resolved.tier }))
                .reasoning(format!("price from {}", resolved.tier)),
        );

        let trace_id = trace.as_ref().map(|t| t.id);
        let settled = {
            let mut balance = handle.lock();
            balance.debit(required).map(|()| {
                let now = Utc::now();
                let price = resolved.quote.price;
                let trade = Trade {
                    id: Uuid::new_v4(),
                    owner: owner.to_string(),
                    pair: pair.clone(),
                    direction,
                    size,
                    entry_price: price,
                    exit_price: None,
                    fees: fee,
                    status: TradeStatus::Open,
                    pnl: None,
                    pnl_percent: None,
                    opened_at: now,
                    closed_at: None,
                    reasoning: reasoning.to_string(),
                    content_hash: trade_hash(owner, &pair, direction, size, price, now.timestamp()),
                    market: MarketSnapshot::from_quote(&resolved.quote, resolved.tier),
                    trace_id,
                };
                self.trades.write().insert(trade.id, trade.clone());
                let topup = balance.apply_auto_topup();
                (trade, balance.clone(), topup)
            })
        };
        let (trade, balance, topup) = match settled {
            Ok(s) => s,
            Err(e) => {
                self.abandon(&mut trace, "trade_execution", SpanKind::Execution, json!({ "required": required.to_string() }), &e);
                return Err(e);
            }
        };

        info!(
            "✅ {} {} {} ${} @ {} (fee ${}, available ${})",
            owner, trade.direction, trade.pair, trade.size, trade.entry_price, trade.fees, balance.available
        );
        if let Some(amount) = topup {
            info!("💰 Auto top-up: credited ${} to {} (available ${})", amount, owner, balance.available);
        }
        glassbox::record(
            &mut trace,
            "trade_execution",
            SpanKind::Execution,
            json!({ "required": required.to_string() }),
            SpanOutcome::ok(json!({
                "trade_id": trade.id,
                "entry_price": trade.entry_price.to_string(),
                "fees": trade.fees.to_string(),
                "content_hash": trade.content_hash,
                "auto_topup": topup.map(|a| a.to_string()),
            })),
        );

        let stored = self.persist(WriteOp::Create, Table::Trades, &trade, |s| s.save_trade(&trade))
            & self.persist(WriteOp::Update, Table::Balances, &balance, |s| s.save_balance(&balance));
        glassbox::record(
            &mut trace,
            "database_persistence",
            SpanKind::Persistence,
            json!({ "trade_id": trade.id }),
            SpanOutcome::ok(json!({ "stored": stored, "queued": !stored })),
        );

        let elapsed_ms = started.elapsed().as_millis() as u64;
        self.publish_trade(&trade, elapsed_ms);

        if let Some(t) = trace.as_mut() {
            t.record_metric("execution_time", elapsed_ms as f64, "ms");
        }
        self.seal(trace, "executed", 1.0);
        Ok(trade)
    }

    /// Close an open trade at the current price.
    pub async fn close_trade(&self, trade_id: Uuid) -> Result<Trade> {
        let started = Instant::now();
        let existing = self
            .trades
            .read()
            .get(&trade_id)
            .cloned()
            .ok_or(Error::TradeNotFound(trade_id))?;
        if !existing.is_open() {
            return Err(Error::TradeAlreadyClosed(trade_id));
        }

        let mut trace = self
            .glassbox
            .start(TraceKind::TradeClose, json!({ "trade_id": trade_id, "owner": existing.owner }))
            .advisory("start close trace");

        let resolved = match self.prices.resolve(&existing.pair).await {
            Ok(r) => r,
            Err(e) => {
                self.abandon(&mut trace, "market_pricing", SpanKind::Computation, json!({ "pair": existing.pair.as_str() }), &e);
                return Err(e);
            }
        };
        glassbox::record(
            &mut trace,
            "market_pricing",
            SpanKind::Computation,
            json!({ "pair": existing.pair.as_str() }),
            SpanOutcome::ok(json!({ "price": resolved.quote.price.to_string(), "tier": resolved.tier })),
        );

        let handle = match self.balances.handle(&existing.owner) {
            Ok(h) => h,
            Err(e) => {
                self.abandon(&mut trace, "trade_settlement", SpanKind::Execution, json!({ "trade_id": trade_id }), &e);
                return Err(e);
            }
        };
        let settled = {
            let mut balance = handle.lock();
            let mut trades = self.trades.write();
            match trades.get_mut(&trade_id) {
                None => Err(Error::TradeNotFound(trade_id)),
                Some(trade) if !trade.is_open() => Err(Error::TradeAlreadyClosed(trade_id)),
                Some(trade) => {
                    let exit = resolved.quote.price;
                    let pnl = trade.pnl_at(exit).round_dp(8);
                    trade.exit_price = Some(exit);
                    trade.pnl = Some(pnl);
                    if !trade.size.is_zero() {
                        trade.pnl_percent = Some((pnl / trade.size * Decimal::ONE_HUNDRED).round_dp(4));
                    }
                    trade.closed_at = Some(Utc::now());
                    trade.status = TradeStatus::Closed;

                    let shortfall = balance.settle(trade.size + pnl);
                    balance.realized_pnl += pnl;
                    Ok((trade.clone(), balance.clone(), shortfall))
                }
            }
        };
        let (trade, balance, shortfall) = match settled {
            Ok(s) => s,
            Err(e) => {
                self.abandon(&mut trace, "trade_settlement", SpanKind::Execution, json!({ "trade_id": trade_id }), &e);
                return Err(e);
            }
        };

        let pnl = trade.pnl.unwrap_or_default();
        info!(
            "🔒 Closed {} {} {} @ {} pnl ${} (available ${})",
            trade.owner, trade.direction, trade.pair, resolved.quote.price, pnl, balance.available
        );
        if !shortfall.is_zero() {
            warn!("⚠️ Loss on {} exceeded available funds by ${}; floored at zero", trade.id, shortfall);
        }
        glassbox::record(
            &mut trace,
            "trade_settlement",
            SpanKind::Execution,
            json!({ "trade_id": trade.id, "exit_price": resolved.quote.price.to_string() }),
            SpanOutcome::ok(json!({ "pnl": pnl.to_string(), "credited": (trade.size + pnl).to_string() })),
        );

        let stored = self.persist(WriteOp::Update, Table::Trades, &trade, |s| s.save_trade(&trade))
            & self.persist(WriteOp::Update, Table::Balances, &balance, |s| s.save_balance(&balance));
        glassbox::record(
            &mut trace,
            "database_persistence",
            SpanKind::Persistence,
            json!({ "trade_id": trade.id }),
            SpanOutcome::ok(json!({ "stored": stored, "queued": !stored })),
        );

        self.publish_trade(&trade, started.elapsed().as_millis() as u64);
        self.seal(trace, "closed", 1.0);
        Ok(trade)
    }

    /// Kill-switch: close every open trade of `owner` independently.
    pub async fn close_all_trades(&self, owner: &str) -> Vec<CloseOutcome> {
        let ids: Vec<Uuid> = self.open_trades(owner).into_iter().map(|t| t.id).collect();
        if ids.is_empty() {
            return Vec::new();
        }
        warn!("🛑 Kill-switch: closing {} open trades for {}", ids.len(), owner);

        let outcomes = futures::future::join_all(ids.into_iter().map(|id| async move {
            CloseOutcome {
                trade_id: id,
                result: self.close_trade(id).await,
            }
        }))
        .await;

        let failed = outcomes.iter().filter(|o| o.result.is_err()).count();
        for o in outcomes.iter() {
            if let Err(e) = &o.result {
                warn!("⚠️ Could not close {}: {}", o.trade_id, e);
            }
        }
        info!("Kill-switch done: {} closed, {} failed", outcomes.len() - failed, failed);
        outcomes
    }

    /// Open trades of `owner`, oldest first
    pub fn open_trades(&self, owner: &str) -> Vec<Trade> {
        let mut open: Vec<Trade> = self
            .trades
            .read()
            .values()
            .filter(|t| t.owner == owner && t.is_open())
            .cloned()
            .collect();
        open.sort_by_key(|t| t.opened_at);
        open
    }

    /// Newest first. `None` uses the configured page size.
    pub fn trade_history(&self, owner: &str, limit: Option<usize>) -> Vec<Trade> {
        let limit = limit.filter(|l| *l > 0).unwrap_or(self.config.history_limit);
        let mut all: Vec<Trade> = self
            .trades
            .read()
            .values()
            .filter(|t| t.owner == owner)
            .cloned()
            .collect();
        all.sort_by(|a, b| b.opened_at.cmp(&a.opened_at));
        all.truncate(limit);
        all
    }

    pub fn trade(&self, trade_id: Uuid) -> Option<Trade> {
        self.trades.read().get(&trade_id).cloned()
    }

    pub fn balance(&self, owner: &str) -> Result<Balance> {
        self.balances.snapshot(owner)
    }

    pub fn performance(&self, owner: &str) -> PerformanceReport {
        let trades: Vec<Trade> = self
            .trades
            .read()
            .values()
            .filter(|t| t.owner == owner)
            .cloned()
            .collect();
        PerformanceReport::from_trades(&trades)
    }

    /// Current price through the fallback chain
    pub async fn quote(&self, symbol: &Symbol) -> Result<ResolvedPrice> {
        self.prices.resolve(symbol).await
    }

    /// Mark open positions to market and store the result on the balance.
    pub async fn unrealized_pnl(&self, owner: &str) -> Result<UnrealizedPnl> {
        let open = self.open_trades(owner);
        let mut total = Decimal::ZERO;
        for trade in &open {
            let resolved = self.prices.resolve(&trade.pair).await?;
            total += trade.pnl_at(resolved.quote.price);
        }
        let total = total.round_dp(8);

        let handle = self.balances.handle(owner)?;
        let balance = {
            let mut b = handle.lock();
            b.unrealized_pnl = total;
            b.touch();
            b.clone()
        };
        self.persist(WriteOp::Update, Table::Balances, &balance, |s| s.save_balance(&balance));

        Ok(UnrealizedPnl {
            owner: owner.to_string(),
            open_positions: open.len(),
            unrealized_pnl: total,
        })
    }

    fn validate(&self, owner: &str, pair: &Symbol, size: Decimal) -> Result<()> {
        if owner.trim().is_empty() {
            return Err(Error::Validation("owner must not be empty".into()));
        }
        if pair.as_str().is_empty() {
            return Err(Error::Validation("pair must not be empty".into()));
        }
        if size <= Decimal::ZERO {
            return Err(Error::Validation(format!("size must be positive, got {}", size)));
        }
        Ok(())
    }

    /// Try the store; on failure hand the write to the queue. Returns whether
    /// the write landed directly.
    fn persist<T, F>(&self, op: WriteOp, table: Table, record: &T, write: F) -> bool
    where
        T: Serialize,
        F: FnOnce(&dyn Store) -> Result<()>,
    {
        match write(self.store.as_ref()) {
            Ok(()) => true,
            Err(e) => {
                warn!("⚠️ {} write to {} failed ({}), queued for retry", op, table, e);
                self.queue.enqueue(op, table, record).advisory("queue write");
                false
            }
        }
    }

    fn publish_trade(&self, trade: &Trade, execution_time_ms: u64) {
        let event = TradeExecutedEvent {
            trade_id: trade.id,
            owner: trade.owner.clone(),
            symbol: trade.pair.to_string(),
            side: trade.direction.to_string(),
            amount: crate::core::to_f64(trade.size),
            price: crate::core::to_f64(trade.exit_price.unwrap_or(trade.entry_price)),
            executed_at: trade.closed_at.unwrap_or(trade.opened_at),
            exchange_id: EXCHANGE_ID.to_string(),
            status: trade.status.to_string(),
            execution_time_ms,
            pnl: trade.pnl.map(crate::core::to_f64),
        };
        let report = self.bus.publish(EventType::TradeExecuted, &event);
        if report.failed > 0 {
            warn!("⚠️ {} subscriber(s) failed on trade {}", report.failed, trade.id);
        }
    }

    /// Record a failed step and seal the trace as aborted.
    fn abandon(
        &self,
        trace: &mut Option<DecisionTrace>,
        step: &str,
        kind: SpanKind,
        input: serde_json::Value,
        error: &Error,
    ) {
        glassbox::record(trace, step, kind, input, SpanOutcome::failed(error.to_string()));
        if let Some(mut t) = trace.take() {
            if t.abort(error.to_string()).advisory("abort trace").is_some() {
                self.glassbox.commit(&t).advisory("commit trace");
            }
        }
    }

    fn seal(&self, trace: Option<DecisionTrace>, decision: &str, confidence: f64) {
        let Some(mut t) = trace else {
            return;
        };
        if t.finalize(decision, confidence).advisory("finalize trace").is_some() {
            self.glassbox.commit(&t).advisory("commit trace");
        }
    }
}
