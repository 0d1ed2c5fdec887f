//! Ledger - virtual balances, trade lifecycle and performance

pub mod balance;
pub mod engine;
pub mod performance;

pub use balance::{BalanceBook, BalanceHandle};
pub use engine::{CloseOutcome, TradingEngine, UnrealizedPnl, trade_hash};
pub use performance::PerformanceReport;
