//! Performance metrics over closed trades

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

use crate::core::{Trade, to_f64};

const PROMOTION_MIN_TRADES: usize = 100;
const PROMOTION_MIN_WIN_RATE: f64 = 60.0;
const PROMOTION_MIN_SHARPE: f64 = 1.0;

#[derive(Debug, Clone, Serialize)]
pub struct PerformanceReport {
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    /// Percent
    pub win_rate: f64,
    pub total_pnl: Decimal,
    pub avg_profit: Option<Decimal>,
    pub avg_loss: Option<Decimal>,
    pub largest_win: Option<Decimal>,
    pub largest_loss: Option<Decimal>,
    /// Deepest peak-to-trough fall of cumulative P&L
    pub max_drawdown: Decimal,
    /// Mean P&L over its sample standard deviation
    pub sharpe_ratio: f64,
    pub can_promote_to_live: bool,
    pub missing_criteria: Vec<String>,
    pub calculated_at: DateTime<Utc>,
}

impl PerformanceReport {
    /// Build from any trades; open ones are ignored.
    pub fn from_trades(trades: &[Trade]) -> Self {
        let mut closed: Vec<&Trade> = trades
            .iter()
            .filter(|t| !t.is_open() && t.pnl.is_some())
            .collect();
        closed.sort_by_key(|t| t.closed_at);

        let pnls: Vec<Decimal> = closed.iter().filter_map(|t| t.pnl).collect();
        let wins: Vec<Decimal> = pnls.iter().copied().filter(|p| *p > Decimal::ZERO).collect();
        let losses: Vec<Decimal> = pnls.iter().copied().filter(|p| *p <= Decimal::ZERO).collect();

        let total_pnl: Decimal = pnls.iter().copied().sum();
        let avg = |v: &[Decimal]| -> Option<Decimal> {
            (!v.is_empty()).then(|| v.iter().copied().sum::<Decimal>() / Decimal::from(v.len()))
        };

        let mut peak = Decimal::ZERO;
        let mut running = Decimal::ZERO;
        let mut max_drawdown = Decimal::ZERO;
        for p in &pnls {
            running += *p;
            peak = peak.max(running);
            max_drawdown = max_drawdown.max(peak - running);
        }

        let win_rate = if pnls.is_empty() {
            0.0
        } else {
            wins.len() as f64 / pnls.len() as f64 * 100.0
        };
        let sharpe_ratio = sharpe(&pnls);

        let mut missing_criteria = Vec::new();
        if pnls.len() < PROMOTION_MIN_TRADES {
            missing_criteria.push(format!(
                "Need {} more trades (have {}, need {})",
                PROMOTION_MIN_TRADES - pnls.len(),
                pnls.len(),
                PROMOTION_MIN_TRADES
            ));
        }
        if win_rate < PROMOTION_MIN_WIN_RATE {
            missing_criteria.push(format!("Win rate too low ({:.2}%, need 60%)", win_rate));
        }
        if sharpe_ratio <= PROMOTION_MIN_SHARPE {
            missing_criteria.push(format!("Sharpe ratio too low ({:.2}, need >1.0)", sharpe_ratio));
        }

        Self {
            total_trades: pnls.len(),
            winning_trades: wins.len(),
            losing_trades: losses.len(),
            win_rate,
            total_pnl,
            avg_profit: avg(&wins),
            avg_loss: avg(&losses),
            largest_win: wins.iter().copied().max(),
            largest_loss: losses.iter().copied().min(),
            max_drawdown,
            sharpe_ratio,
            can_promote_to_live: missing_criteria.is_empty(),
            missing_criteria,
            calculated_at: Utc::now(),
        }
    }
}

fn sharpe(pnls: &[Decimal]) -> f64 {
    if pnls.len() < 2 {
        return 0.0;
    }
    let values: Vec<f64> = pnls.iter().map(|p| to_f64(*p)).collect();
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
    let std_dev = variance.sqrt();
    if std_dev > 0.0 { mean / std_dev } else { 0.0 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Direction, MarketSnapshot, PriceTier, Symbol, TradeStatus};
    use uuid::Uuid;

    fn closed(pnl: i64, minute: i64) -> Trade {
        let opened = Utc::now() - chrono::Duration::hours(1);
        Trade {
            id: Uuid::new_v4(),
            owner: "alice".into(),
            pair: Symbol::new("BTC/USDC"),
            direction: Direction::Buy,
            size: Decimal::from(100),
            entry_price: Decimal::from(100),
            exit_price: Some(Decimal::from(100)),
            fees: Decimal::ZERO,
            status: TradeStatus::Closed,
            pnl: Some(Decimal::from(pnl)),
            pnl_percent: None,
            opened_at: opened,
            closed_at: Some(opened + chrono::Duration::minutes(minute)),
            reasoning: String::new(),
            content_hash: String::new(),
            market: MarketSnapshot {
                price: Decimal::from(100),
                change_24h: 0.0,
                volume_24h: 0.0,
                market_cap: 0.0,
                tier: PriceTier::Live,
                captured_at: opened,
            },
            trace_id: None,
        }
    }

    #[test]
    fn test_empty_history() {
        let r = PerformanceReport::from_trades(&[]);
        assert_eq!(r.total_trades, 0);
        assert_eq!(r.win_rate, 0.0);
        assert!(r.avg_profit.is_none());
        assert!(!r.can_promote_to_live);
    }

    #[test]
    fn test_wins_losses_and_drawdown() {
        // cumulative: 10, 30, 15, 5, 25 -> peak 30, trough 5
        let trades = vec![closed(10, 1), closed(20, 2), closed(-15, 3), closed(-10, 4), closed(20, 5)];
        let r = PerformanceReport::from_trades(&trades);
        assert_eq!(r.total_trades, 5);
        assert_eq!(r.winning_trades, 3);
        assert_eq!(r.losing_trades, 2);
        assert!((r.win_rate - 60.0).abs() < 1e-9);
        assert_eq!(r.total_pnl, Decimal::from(25));
        assert_eq!(r.largest_win, Some(Decimal::from(20)));
        assert_eq!(r.largest_loss, Some(Decimal::from(-15)));
        assert_eq!(r.avg_loss, Some(Decimal::new(-125, 1)));
        assert_eq!(r.max_drawdown, Decimal::from(25));
        assert!(r.sharpe_ratio > 0.0);
        assert!(r.missing_criteria.iter().any(|m| m.contains("more trades")));
    }

    #[test]
    fn test_drawdown_follows_close_order() {
        let trades = vec![closed(-10, 2), closed(10, 1)];
        let r = PerformanceReport::from_trades(&trades);
        // closes: +10 then -10
        assert_eq!(r.max_drawdown, Decimal::from(10));
    }

    #[test]
    fn test_open_trades_ignored() {
        let mut open = closed(0, 1);
        open.status = TradeStatus::Open;
        open.pnl = None;
        let r = PerformanceReport::from_trades(&[open, closed(5, 2)]);
        assert_eq!(r.total_trades, 1);
    }
}
