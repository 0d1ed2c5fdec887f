//! Core types - Strong typing for safety

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::{Error, Result};

/// Tradeable pair (e.g., "BTC/USDC")
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Symbol(String);

impl Symbol {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into().trim().to_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Base asset ("BTC" for "BTC/USDC")
    pub fn base(&self) -> &str {
        self.0
            .split(['/', '-'])
            .next()
            .unwrap_or(self.0.as_str())
    }
}

impl std::fmt::Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Trade direction. BUY opens a long, SELL opens a short.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Buy,
    Sell,
}

impl Direction {
    pub fn is_long(&self) -> bool {
        matches!(self, Direction::Buy)
    }
}

impl std::str::FromStr for Direction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_uppercase().as_str() {
            "BUY" | "LONG" => Ok(Direction::Buy),
            "SELL" | "SHORT" => Ok(Direction::Sell),
            other => Err(Error::Validation(format!(
                "direction must be BUY or SELL, got '{}'",
                other
            ))),
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Buy => write!(f, "BUY"),
            Direction::Sell => write!(f, "SELL"),
        }
    }
}

/// Trade status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeStatus {
    Open,
    Closed,
}

impl std::fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TradeStatus::Open => write!(f, "OPEN"),
            TradeStatus::Closed => write!(f, "CLOSED"),
        }
    }
}

/// Which tier of the fallback chain produced a price
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriceTier {
    Fresh,
    Live,
    Stale,
    Sandbox,
}

impl std::fmt::Display for PriceTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PriceTier::Fresh => write!(f, "fresh-cache"),
            PriceTier::Live => write!(f, "live"),
            PriceTier::Stale => write!(f, "stale-cache"),
            PriceTier::Sandbox => write!(f, "sandbox-default"),
        }
    }
}

/// Market data for one symbol as returned by a price source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceQuote {
    pub symbol: Symbol,
    pub price: Decimal,
    pub change_24h: f64,
    pub volume_24h: f64,
    pub market_cap: f64,
    pub fetched_at: DateTime<Utc>,
}

/// Market conditions captured when a trade is opened
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub price: Decimal,
    pub change_24h: f64,
    pub volume_24h: f64,
    pub market_cap: f64,
    pub tier: PriceTier,
    pub captured_at: DateTime<Utc>,
}

impl MarketSnapshot {
    pub fn from_quote(quote: &PriceQuote, tier: PriceTier) -> Self {
        Self {
            price: quote.price,
            change_24h: quote.change_24h,
            volume_24h: quote.volume_24h,
            market_cap: quote.market_cap,
            tier,
            captured_at: Utc::now(),
        }
    }
}

/// Auto-topup policy attached to a balance
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TopupPolicy {
    pub threshold: Decimal,
    pub amount: Decimal,
}

/// Virtual USD balance of one owner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    pub owner: String,
    pub asset: String,
    pub available: Decimal,
    pub total_deposits: Decimal,
    pub total_withdrawals: Decimal,
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
    pub auto_topup: Option<TopupPolicy>,
    pub updated_at: DateTime<Utc>,
    /// Bumped on every mutation; stores never replace a newer version
    #[serde(default)]
    pub version: u64,
}

impl Balance {
    pub fn new(owner: impl Into<String>, starting: Decimal, auto_topup: Option<TopupPolicy>) -> Self {
        Self {
            owner: owner.into(),
            asset: "USD".to_string(),
            available: starting,
            total_deposits: starting,
            total_withdrawals: Decimal::ZERO,
            realized_pnl: Decimal::ZERO,
            unrealized_pnl: Decimal::ZERO,
            auto_topup,
            updated_at: Utc::now(),
            version: 0,
        }
    }

    /// Mark the balance as changed
    pub fn touch(&mut self) {
        self.version += 1;
        self.updated_at = Utc::now();
    }

    /// Remove funds. Never lets `available` go negative.
    pub fn debit(&mut self, amount: Decimal) -> Result<()> {
        if amount < Decimal::ZERO {
            return Err(Error::Validation(format!("negative debit {}", amount)));
        }
        if amount > self.available {
            return Err(Error::InsufficientBalance {
                available: self.available,
                required: amount,
            });
        }
        self.available -= amount;
        self.touch();
        Ok(())
    }

    pub fn credit(&mut self, amount: Decimal) {
        self.available += amount;
        self.touch();
    }

    /// Apply a signed settlement. A negative amount larger than `available`
    /// floors at zero; the absorbed shortfall is returned.
    pub fn settle(&mut self, amount: Decimal) -> Decimal {
        if amount >= Decimal::ZERO {
            self.credit(amount);
            return Decimal::ZERO;
        }
        let owed = -amount;
        let taken = owed.min(self.available);
        self.available -= taken;
        self.touch();
        owed - taken
    }

    /// Credit the top-up amount when enabled and below threshold.
    pub fn apply_auto_topup(&mut self) -> Option<Decimal> {
        let policy = self.auto_topup?;
        if self.available >= policy.threshold {
            return None;
        }
        self.credit(policy.amount);
        self.total_deposits += policy.amount;
        Some(policy.amount)
    }
}

/// A sandbox trade
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub id: Uuid,
    pub owner: String,
    pub pair: Symbol,
    pub direction: Direction,
    /// Notional in USD
    pub size: Decimal,
    pub entry_price: Decimal,
    pub exit_price: Option<Decimal>,
    pub fees: Decimal,
    pub status: TradeStatus,
    pub pnl: Option<Decimal>,
    pub pnl_percent: Option<Decimal>,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub reasoning: String,
    pub content_hash: String,
    pub market: MarketSnapshot,
    pub trace_id: Option<Uuid>,
}

impl Trade {
    pub fn is_open(&self) -> bool {
        self.status == TradeStatus::Open
    }

    /// P&L if the position were closed at `price`.
    pub fn pnl_at(&self, price: Decimal) -> Decimal {
        position_pnl(self.direction, self.entry_price, price, self.size, self.fees)
    }
}

/// Long: (exit - entry) * size / entry - fees.
/// Short: (entry - exit) * size / entry - fees.
pub fn position_pnl(
    direction: Direction,
    entry: Decimal,
    exit: Decimal,
    size: Decimal,
    fees: Decimal,
) -> Decimal {
    if entry.is_zero() {
        return -fees;
    }
    let gross = match direction {
        Direction::Buy => (exit - entry) * size / entry,
        Direction::Sell => (entry - exit) * size / entry,
    };
    gross - fees
}

/// Lossy view of a decimal for analytics and prompts
pub fn to_f64(value: Decimal) -> f64 {
    value.to_f64().unwrap_or(0.0)
}
