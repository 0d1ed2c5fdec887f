//! Working memory - bounded, time-windowed buffer feeding the decision context

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt::Write as _;
use std::time::Duration;
use uuid::Uuid;

use crate::core::Symbol;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PerceivedKind {
    PriceMovement,
    ProfitOpportunity,
    StopLossAlert,
}

impl PerceivedKind {
    pub fn importance(&self) -> f64 {
        match self {
            PerceivedKind::PriceMovement => 0.7,
            PerceivedKind::ProfitOpportunity => 0.8,
            PerceivedKind::StopLossAlert => 0.9,
        }
    }
}

impl std::fmt::Display for PerceivedKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PerceivedKind::PriceMovement => write!(f, "price_movement"),
            PerceivedKind::ProfitOpportunity => write!(f, "profit_opportunity"),
            PerceivedKind::StopLossAlert => write!(f, "stop_loss_alert"),
        }
    }
}

/// Something the perceive step noticed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerceivedEvent {
    pub kind: PerceivedKind,
    pub symbol: Symbol,
    pub description: String,
    pub importance: f64,
    /// Price change or position P&L, in percent
    pub change_pct: f64,
    pub trade_id: Option<Uuid>,
    pub observed_at: DateTime<Utc>,
}

impl PerceivedEvent {
    pub fn new(kind: PerceivedKind, symbol: Symbol, change_pct: f64, description: impl Into<String>) -> Self {
        Self {
            kind,
            importance: kind.importance(),
            symbol,
            description: description.into(),
            change_pct,
            trade_id: None,
            observed_at: Utc::now(),
        }
    }

    pub fn for_trade(mut self, trade_id: Uuid) -> Self {
        self.trade_id = Some(trade_id);
        self
    }
}

/// A decision as remembered, both in working memory and long-term storage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: Uuid,
    pub action: String,
    pub detail: serde_json::Value,
    pub rationale: String,
    pub confidence: f64,
    pub acted: bool,
    /// Set once an acted decision has run
    pub success: Option<bool>,
    pub outcome: Option<String>,
    pub trace_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

pub struct WorkingMemory {
    window: Duration,
    max_decisions: usize,
    events: VecDeque<PerceivedEvent>,
    decisions: VecDeque<MemoryRecord>,
    last_prices: HashMap<Symbol, Decimal>,
}

impl WorkingMemory {
    pub fn new(window: Duration, max_decisions: usize) -> Self {
        Self {
            window,
            max_decisions: max_decisions.max(1),
            events: VecDeque::new(),
            decisions: VecDeque::new(),
            last_prices: HashMap::new(),
        }
    }

    pub fn push_event(&mut self, event: PerceivedEvent) {
        self.events.push_back(event);
        self.prune();
    }

    pub fn push_decision(&mut self, record: MemoryRecord) {
        self.decisions.push_back(record);
        while self.decisions.len() > self.max_decisions {
            self.decisions.pop_front();
        }
    }

    /// Drop events older than the window.
    pub fn prune(&mut self) {
        let window = chrono::Duration::from_std(self.window).unwrap_or(chrono::Duration::hours(2));
        let cutoff = Utc::now() - window;
        while self.events.front().is_some_and(|e| e.observed_at < cutoff) {
            self.events.pop_front();
        }
    }

    pub fn last_price(&self, symbol: &Symbol) -> Option<Decimal> {
        self.last_prices.get(symbol).copied()
    }

    pub fn set_last_price(&mut self, symbol: Symbol, price: Decimal) {
        self.last_prices.insert(symbol, price);
    }

    /// Newest last
    pub fn recent_events(&self, n: usize) -> Vec<PerceivedEvent> {
        let skip = self.events.len().saturating_sub(n);
        self.events.iter().skip(skip).cloned().collect()
    }

    /// Newest last
    pub fn recent_decisions(&self, n: usize) -> Vec<MemoryRecord> {
        let skip = self.decisions.len().saturating_sub(n);
        self.decisions.iter().skip(skip).cloned().collect()
    }

    /// Success flags of the last `n` acted decisions that have an outcome
    pub fn acted_outcomes(&self, n: usize) -> Vec<bool> {
        let mut outcomes: Vec<bool> = self
            .decisions
            .iter()
            .rev()
            .filter(|d| d.acted)
            .filter_map(|d| d.success)
            .take(n)
            .collect();
        outcomes.reverse();
        outcomes
    }

    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    pub fn decision_count(&self) -> usize {
        self.decisions.len()
    }

    pub fn summary(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Recent events ({} in window):", self.events.len());
        for e in self.recent_events(3) {
            let _ = writeln!(
                out,
                "- [{}] {} {} (importance {:.1})",
                e.observed_at.format("%H:%M:%S"),
                e.kind,
                e.description,
                e.importance
            );
        }
        let _ = writeln!(out, "Recent decisions ({} kept):", self.decisions.len());
        for d in self.recent_decisions(3) {
            let outcome = d.outcome.as_deref().unwrap_or("pending");
            let _ = writeln!(
                out,
                "- {} (confidence {:.2}, acted: {}) -> {}",
                d.action, d.confidence, d.acted, outcome
            );
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decision(action: &str, acted: bool, success: Option<bool>) -> MemoryRecord {
        MemoryRecord {
            id: Uuid::new_v4(),
            action: action.into(),
            detail: serde_json::Value::Null,
            rationale: String::new(),
            confidence: 0.8,
            acted,
            success,
            outcome: None,
            trace_id: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_events_outside_window_pruned() {
        let mut m = WorkingMemory::new(Duration::from_secs(3600), 50);
        let mut old = PerceivedEvent::new(PerceivedKind::PriceMovement, Symbol::new("BTC/USDC"), 2.5, "up");
        old.observed_at = Utc::now() - chrono::Duration::hours(3);
        m.push_event(old);
        m.push_event(PerceivedEvent::new(PerceivedKind::StopLossAlert, Symbol::new("ETH/USDC"), -4.0, "down"));
        assert_eq!(m.event_count(), 1);
        assert_eq!(m.recent_events(5)[0].importance, 0.9);
    }

    #[test]
    fn test_decisions_bounded() {
        let mut m = WorkingMemory::new(Duration::from_secs(3600), 3);
        for i in 0..5 {
            m.push_decision(decision(&format!("d{}", i), false, None));
        }
        assert_eq!(m.decision_count(), 3);
        assert_eq!(m.recent_decisions(1)[0].action, "d4");
    }

    #[test]
    fn test_acted_outcomes_skip_unacted() {
        let mut m = WorkingMemory::new(Duration::from_secs(3600), 50);
        m.push_decision(decision("trade", true, Some(true)));
        m.push_decision(decision("wait", false, None));
        m.push_decision(decision("trade", true, Some(false)));
        assert_eq!(m.acted_outcomes(20), vec![true, false]);
        assert_eq!(m.acted_outcomes(1), vec![false]);
    }

    #[test]
    fn test_summary_mentions_latest() {
        let mut m = WorkingMemory::new(Duration::from_secs(3600), 50);
        m.push_event(PerceivedEvent::new(PerceivedKind::ProfitOpportunity, Symbol::new("SOL/USDC"), 6.0, "SOL position +6.0%"));
        m.push_decision(decision("close", true, Some(true)));
        let s = m.summary();
        assert!(s.contains("profit_opportunity"));
        assert!(s.contains("close"));
    }
}
