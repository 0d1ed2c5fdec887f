//! Error handling - Hierarchical errors with an explicit severity policy

use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, Error>;

/// Sandbox error hierarchy
#[derive(Debug, Error)]
pub enum Error {
    /// Bad input (non-positive size, unknown direction, ...)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Not enough virtual funds for the requested debit
    #[error("Insufficient balance: available {available}, required {required}")]
    InsufficientBalance { available: Decimal, required: Decimal },

    /// Every tier of the price fallback chain failed
    #[error("Price unavailable for {0}")]
    PriceUnavailable(String),

    #[error("Trade not found: {0}")]
    TradeNotFound(Uuid),

    #[error("Trade already closed: {0}")]
    TradeAlreadyClosed(Uuid),

    /// Stored balance could not be read; never replaced by a fresh one
    #[error("Balance unavailable for {owner}: {reason}")]
    BalanceUnavailable { owner: String, reason: String },

    /// Storage errors
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Network/IO errors
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Upstream answered 429
    #[error("Rate limited by {0}")]
    RateLimited(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Decision tracer failures
    #[error("Tracer error: {0}")]
    Tracer(String),

    #[error("Event delivery error: {0}")]
    EventDelivery(String),

    /// Hash chain mismatch
    #[error("Hash chain broken at span {position}: expected {expected}, found {found}")]
    Integrity {
        position: usize,
        expected: String,
        found: String,
    },

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Reasoning provider returned something we can't use
    #[error("Malformed response: {0}")]
    MalformedResponse(String),
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Persistence(e.to_string())
    }
}

/// How a call site must treat a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Money-moving or caller-facing: propagate
    Critical,
    /// Auxiliary subsystem: log and continue
    Advisory,
}

impl Error {
    pub fn severity(&self) -> Severity {
        match self {
            Error::Validation(_)
            | Error::InsufficientBalance { .. }
            | Error::PriceUnavailable(_)
            | Error::TradeNotFound(_)
            | Error::TradeAlreadyClosed(_)
            | Error::BalanceUnavailable { .. }
            | Error::Config(_)
            | Error::InvalidState(_) => Severity::Critical,
            Error::Persistence(_)
            | Error::Network(_)
            | Error::RateLimited(_)
            | Error::Serialization(_)
            | Error::Tracer(_)
            | Error::EventDelivery(_)
            | Error::Integrity { .. }
            | Error::MalformedResponse(_) => Severity::Advisory,
        }
    }

    pub fn is_advisory(&self) -> bool {
        self.severity() == Severity::Advisory
    }
}

/// Swallow-and-continue, made explicit at the call site.
pub trait Advisory<T> {
    /// Logs the failure as a warning and yields `None`.
    fn advisory(self, context: &str) -> Option<T>;
}

impl<T> Advisory<T> for Result<T> {
    fn advisory(self, context: &str) -> Option<T> {
        match self {
            Ok(v) => Some(v),
            Err(e) => {
                if e.is_advisory() {
                    tracing::warn!("⚠️ {} failed (continuing): {}", context, e);
                } else {
                    tracing::error!("{} failed with a critical error treated as advisory: {}", context, e);
                }
                None
            }
        }
    }
}
