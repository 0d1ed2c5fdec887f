//! Analytics subscriber - rolling in-memory trade aggregates
//!
//! Resets on restart; the audit log is the durable record.

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};

use crate::core::{Error, Result};
use crate::events::{Event, EventHandler, TradeExecutedEvent};

const EMA_WEIGHT: f64 = 0.1;
const RATE_WINDOW_SECS: i64 = 60;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AnalyticsSnapshot {
    pub total_trades: u64,
    pub total_volume: f64,
    pub buy_count: u64,
    pub sell_count: u64,
    pub closed_trades: u64,
    pub realized_pnl: f64,
    pub avg_execution_ms: f64,
    pub trades_per_minute: usize,
    pub pair_volumes: BTreeMap<String, f64>,
    pub last_trade_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct AnalyticsState {
    totals: AnalyticsSnapshot,
    recent: VecDeque<DateTime<Utc>>,
}

#[derive(Default)]
pub struct TradeAnalytics {
    state: RwLock<AnalyticsState>,
}

impl TradeAnalytics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, trade: &TradeExecutedEvent) {
        let now = Utc::now();
        let mut state = self.state.write();

        if trade.status.eq_ignore_ascii_case("CLOSED") {
            state.totals.closed_trades += 1;
            state.totals.realized_pnl += trade.pnl.unwrap_or(0.0);
            return;
        }

        let t = &mut state.totals;
        t.total_trades += 1;
        t.total_volume += trade.amount;
        if matches!(trade.side.to_uppercase().as_str(), "BUY" | "LONG") {
            t.buy_count += 1;
        } else {
            t.sell_count += 1;
        }
        let ms = trade.execution_time_ms as f64;
        t.avg_execution_ms = if t.total_trades == 1 {
            ms
        } else {
            (1.0 - EMA_WEIGHT) * t.avg_execution_ms + EMA_WEIGHT * ms
        };
        *t.pair_volumes.entry(trade.symbol.clone()).or_insert(0.0) += trade.amount;
        t.last_trade_at = Some(now);

        let cutoff = now - Duration::seconds(RATE_WINDOW_SECS);
        state.recent.push_back(now);
        while state.recent.front().is_some_and(|ts| *ts < cutoff) {
            state.recent.pop_front();
        }
    }

    /// Copy of the current aggregates
    pub fn snapshot(&self) -> AnalyticsSnapshot {
        let cutoff = Utc::now() - Duration::seconds(RATE_WINDOW_SECS);
        let state = self.state.read();
        let mut snap = state.totals.clone();
        snap.trades_per_minute = state.recent.iter().filter(|ts| **ts >= cutoff).count();
        snap
    }
}

impl EventHandler for TradeAnalytics {
    fn name(&self) -> &str {
        "trade_analytics"
    }

    fn handle(&self, event: &Event) -> Result<()> {
        let trade: TradeExecutedEvent = serde_json::from_value(event.payload.clone())
            .map_err(|e| Error::EventDelivery(format!("analytics: {}", e)))?;
        self.record(&trade);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn trade(symbol: &str, side: &str, amount: f64, ms: u64) -> TradeExecutedEvent {
        TradeExecutedEvent {
            trade_id: Uuid::new_v4(),
            owner: "alice".into(),
            symbol: symbol.into(),
            side: side.into(),
            amount,
            price: 100.0,
            executed_at: Utc::now(),
            exchange_id: "sandbox".into(),
            status: "OPEN".into(),
            execution_time_ms: ms,
            pnl: None,
        }
    }

    #[test]
    fn test_aggregates_and_ema() {
        let a = TradeAnalytics::new();
        a.record(&trade("BTC/USDC", "BUY", 500.0, 10));
        a.record(&trade("BTC/USDC", "SELL", 250.0, 20));
        a.record(&trade("ETH/USDC", "BUY", 100.0, 10));

        let s = a.snapshot();
        assert_eq!(s.total_trades, 3);
        assert_eq!(s.buy_count, 2);
        assert_eq!(s.sell_count, 1);
        assert!((s.total_volume - 850.0).abs() < 1e-9);
        assert!((s.pair_volumes["BTC/USDC"] - 750.0).abs() < 1e-9);
        // 10, then 0.9*10 + 0.1*20 = 11, then 0.9*11 + 0.1*10 = 10.9
        assert!((s.avg_execution_ms - 10.9).abs() < 1e-9);
        assert_eq!(s.trades_per_minute, 3);
        assert!(s.last_trade_at.is_some());
    }

    #[test]
    fn test_closes_tracked_separately() {
        let a = TradeAnalytics::new();
        a.record(&trade("BTC/USDC", "BUY", 500.0, 5));
        let mut close = trade("BTC/USDC", "BUY", 500.0, 5);
        close.status = "CLOSED".into();
        close.pnl = Some(8.17);
        a.record(&close);

        let s = a.snapshot();
        assert_eq!(s.total_trades, 1);
        assert_eq!(s.closed_trades, 1);
        assert!((s.realized_pnl - 8.17).abs() < 1e-9);
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let a = TradeAnalytics::new();
        let before = a.snapshot();
        a.record(&trade("SOL/USDC", "BUY", 50.0, 1));
        assert_eq!(before.total_trades, 0);
        assert_eq!(a.snapshot().total_trades, 1);
    }
}
