//! Price source adapters

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use rust_decimal::prelude::FromPrimitive;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::core::config::PriceSourceConfig;
use crate::core::{Error, PriceQuote, PriceSource, Result, Symbol};
use crate::market::sandbox::coin_id;

/// CoinGecko-compatible REST source
pub struct HttpPriceSource {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpPriceSource {
    pub fn new(config: &PriceSourceConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            client,
        })
    }
}

#[async_trait]
impl PriceSource for HttpPriceSource {
    async fn fetch_quote(&self, symbol: &Symbol) -> Result<PriceQuote> {
        let id = coin_id(symbol.base())
            .ok_or_else(|| Error::PriceUnavailable(format!("{} has no market id", symbol)))?;
        let url = format!("{}/coins/markets?vs_currency=usd&ids={}", self.base_url, id);

        let mut req = self.client.get(&url);
        if let Some(key) = &self.api_key {
            req = req.header("x-cg-demo-api-key", key);
        }
        let resp = req.send().await?;

        if resp.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(Error::RateLimited(self.name().to_string()));
        }
        let resp = resp.error_for_status()?.json::<serde_json::Value>().await?;

        let row = resp
            .as_array()
            .and_then(|rows| rows.first())
            .ok_or_else(|| Error::PriceUnavailable(format!("{}: empty market response", symbol)))?;
        let price = row["current_price"]
            .as_f64()
            .and_then(Decimal::from_f64)
            .ok_or_else(|| Error::PriceUnavailable(format!("{}: missing current_price", symbol)))?;

        Ok(PriceQuote {
            symbol: symbol.clone(),
            price,
            change_24h: row["price_change_percentage_24h"].as_f64().unwrap_or(0.0),
            volume_24h: row["total_volume"].as_f64().unwrap_or(0.0),
            market_cap: row["market_cap"].as_f64().unwrap_or(0.0),
            fetched_at: Utc::now(),
        })
    }

    fn name(&self) -> &str {
        "coingecko"
    }
}

/// How a `StaticPriceSource` should fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFailure {
    Unreachable,
    RateLimited,
}

/// In-process source with settable prices, for offline runs and tests
#[derive(Default)]
pub struct StaticPriceSource {
    prices: RwLock<HashMap<Symbol, Decimal>>,
    failure: RwLock<Option<SourceFailure>>,
    calls: AtomicUsize,
}

impl StaticPriceSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_price(self, symbol: &str, price: Decimal) -> Self {
        self.set_price(symbol, price);
        self
    }

    pub fn set_price(&self, symbol: &str, price: Decimal) {
        self.prices.write().insert(Symbol::new(symbol), price);
    }

    pub fn fail_with(&self, failure: Option<SourceFailure>) {
        *self.failure.write() = failure;
    }

    /// Number of fetch attempts so far
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl PriceSource for StaticPriceSource {
    async fn fetch_quote(&self, symbol: &Symbol) -> Result<PriceQuote> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        match *self.failure.read() {
            Some(SourceFailure::Unreachable) => {
                return Err(Error::PriceUnavailable(format!("{} unreachable", self.name())));
            }
            Some(SourceFailure::RateLimited) => {
                return Err(Error::RateLimited(self.name().to_string()));
            }
            None => {}
        }
        let price = self
            .prices
            .read()
            .get(symbol)
            .copied()
            .ok_or_else(|| Error::PriceUnavailable(symbol.to_string()))?;

        Ok(PriceQuote {
            symbol: symbol.clone(),
            price,
            change_24h: 0.0,
            volume_24h: 0.0,
            market_cap: 0.0,
            fetched_at: Utc::now(),
        })
    }

    fn name(&self) -> &str {
        "static"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_source_failure_modes() {
        let src = StaticPriceSource::new().with_price("BTC/USDC", Decimal::from(43_250));
        let sym = Symbol::new("BTC/USDC");

        assert_eq!(src.fetch_quote(&sym).await.unwrap().price, Decimal::from(43_250));

        src.fail_with(Some(SourceFailure::RateLimited));
        assert!(matches!(src.fetch_quote(&sym).await, Err(Error::RateLimited(_))));

        src.fail_with(None);
        assert!(src.fetch_quote(&Symbol::new("XYZ/USDC")).await.is_err());
        assert_eq!(src.calls(), 3);
    }
}
