//! Safety gate - hard limits checked before the agent opens a position.

use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use thiserror::Error;
use tracing::{info, warn};

use crate::core::config::AgentConfig;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SafetyError {
    #[error("trade size {0} exceeds max {1}")]
    TradeTooLarge(Decimal, Decimal),

    #[error("daily loss {0} reached limit {1}")]
    DailyLossLimit(Decimal, Decimal),

    #[error("{0} open positions, max {1}")]
    TooManyPositions(usize, usize),

    #[error("trading disabled: {0}")]
    TradingDisabled(String),
}

#[derive(Debug, Clone)]
pub struct SafetyLimits {
    pub max_trade_size: Decimal,
    pub daily_loss_limit: Decimal,
    pub max_open_positions: usize,
}

impl From<&AgentConfig> for SafetyLimits {
    fn from(c: &AgentConfig) -> Self {
        Self {
            max_trade_size: c.max_trade_size,
            daily_loss_limit: c.daily_loss_limit,
            max_open_positions: c.max_open_positions,
        }
    }
}

pub struct SafetyGate {
    limits: SafetyLimits,
    enabled: bool,
    disabled_reason: Option<String>,
    daily_loss: Decimal,
    day: NaiveDate,
}

impl SafetyGate {
    pub fn new(limits: SafetyLimits, enabled: bool) -> Self {
        Self {
            limits,
            enabled,
            disabled_reason: (!enabled).then(|| "disabled by config".to_string()),
            daily_loss: Decimal::ZERO,
            day: Utc::now().date_naive(),
        }
    }

    /// Check a proposed trade of `size` USD.
    pub fn check_trade(&mut self, size: Decimal, open_positions: usize) -> Result<(), SafetyError> {
        self.roll_to(Utc::now().date_naive());

        if !self.enabled {
            return Err(SafetyError::TradingDisabled(
                self.disabled_reason.clone().unwrap_or_else(|| "unknown".into()),
            ));
        }
        if size > self.limits.max_trade_size {
            return Err(SafetyError::TradeTooLarge(size, self.limits.max_trade_size));
        }
        if self.daily_loss >= self.limits.daily_loss_limit {
            return Err(SafetyError::DailyLossLimit(self.daily_loss, self.limits.daily_loss_limit));
        }
        if open_positions >= self.limits.max_open_positions {
            return Err(SafetyError::TooManyPositions(open_positions, self.limits.max_open_positions));
        }
        Ok(())
    }

    /// Feed back realized P&L of a closed position.
    pub fn record_outcome(&mut self, pnl: Decimal) {
        self.roll_to(Utc::now().date_naive());
        if pnl < Decimal::ZERO {
            self.daily_loss += -pnl;
            if self.daily_loss >= self.limits.daily_loss_limit {
                warn!(
                    "🛑 Daily loss ${} reached limit ${}, no new trades today",
                    self.daily_loss, self.limits.daily_loss_limit
                );
            }
        }
    }

    pub fn kill_switch(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        warn!("🛑 Kill switch engaged: {}", reason);
        self.enabled = false;
        self.disabled_reason = Some(reason);
    }

    pub fn enable(&mut self) {
        info!("▶️ Trading re-enabled");
        self.enabled = true;
        self.disabled_reason = None;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn daily_loss(&self) -> Decimal {
        self.daily_loss
    }

    fn roll_to(&mut self, today: NaiveDate) {
        if today != self.day {
            if !self.daily_loss.is_zero() {
                info!("📅 New trading day, resetting daily loss (was ${})", self.daily_loss);
            }
            self.day = today;
            self.daily_loss = Decimal::ZERO;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate() -> SafetyGate {
        SafetyGate::new(SafetyLimits::from(&AgentConfig::default()), true)
    }

    #[test]
    fn test_trade_too_large() {
        let mut g = gate();
        assert!(g.check_trade(Decimal::from(100), 0).is_ok());
        assert_eq!(
            g.check_trade(Decimal::from(101), 0),
            Err(SafetyError::TradeTooLarge(Decimal::from(101), Decimal::from(100)))
        );
    }

    #[test]
    fn test_position_cap() {
        let mut g = gate();
        assert!(matches!(
            g.check_trade(Decimal::from(50), 3),
            Err(SafetyError::TooManyPositions(3, 3))
        ));
    }

    #[test]
    fn test_daily_loss_blocks_until_next_day() {
        let mut g = gate();
        g.record_outcome(Decimal::from(-300));
        g.record_outcome(Decimal::from(120));
        assert!(g.check_trade(Decimal::from(50), 0).is_ok());
        g.record_outcome(Decimal::from(-200));
        assert_eq!(g.daily_loss(), Decimal::from(500));
        assert!(matches!(
            g.check_trade(Decimal::from(50), 0),
            Err(SafetyError::DailyLossLimit(..))
        ));

        let tomorrow = g.day.succ_opt().unwrap();
        g.roll_to(tomorrow);
        assert_eq!(g.daily_loss(), Decimal::ZERO);
    }

    #[test]
    fn test_kill_switch() {
        let mut g = gate();
        g.kill_switch("manual");
        assert_eq!(
            g.check_trade(Decimal::from(10), 0),
            Err(SafetyError::TradingDisabled("manual".into()))
        );
        g.enable();
        assert!(g.check_trade(Decimal::from(10), 0).is_ok());
    }

    #[test]
    fn test_disabled_by_config() {
        let mut g = SafetyGate::new(SafetyLimits::from(&AgentConfig::default()), false);
        assert!(!g.is_enabled());
        assert!(g.check_trade(Decimal::from(10), 0).is_err());
    }
}
