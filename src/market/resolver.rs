//! Price resolver - fresh cache -> live fetch -> stale cache -> sandbox default

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::core::{Error, PriceQuote, PriceSource, PriceTier, Result, Symbol};
use crate::market::{PriceCache, SandboxPrices};

/// A price plus the tier that produced it
#[derive(Debug, Clone)]
pub struct ResolvedPrice {
    pub quote: PriceQuote,
    pub tier: PriceTier,
    /// Cache age for cache tiers
    pub age: Option<Duration>,
}

pub struct PriceResolver {
    cache: Arc<PriceCache>,
    source: Arc<dyn PriceSource>,
    sandbox: SandboxPrices,
    fetch_timeout: Duration,
}

impl PriceResolver {
    pub fn new(cache: Arc<PriceCache>, source: Arc<dyn PriceSource>) -> Self {
        Self {
            cache,
            source,
            sandbox: SandboxPrices,
            fetch_timeout: Duration::from_secs(10),
        }
    }

    /// Upper bound on a single live fetch
    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    pub fn cache(&self) -> &Arc<PriceCache> {
        &self.cache
    }

    pub async fn resolve(&self, symbol: &Symbol) -> Result<ResolvedPrice> {
        if let Some(quote) = self.cache.get(symbol) {
            return Ok(ResolvedPrice {
                quote,
                tier: PriceTier::Fresh,
                age: None,
            });
        }
        debug!("{}: no fresh cache entry, fetching from {}", symbol, self.source.name());

        let reason = match tokio::time::timeout(self.fetch_timeout, self.source.fetch_quote(symbol)).await {
            Ok(Ok(quote)) => {
                self.cache.set(quote.clone());
                return Ok(ResolvedPrice {
                    quote,
                    tier: PriceTier::Live,
                    age: None,
                });
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("timed out after {:?}", self.fetch_timeout),
        };

        if let Some((quote, age)) = self.cache.get_stale(symbol) {
            warn!(
                "⚠️ {}: live fetch failed ({}), using stale price {} aged {}s",
                symbol,
                reason,
                quote.price,
                age.as_secs()
            );
            return Ok(ResolvedPrice {
                quote,
                tier: PriceTier::Stale,
                age: Some(age),
            });
        }

        if let Some(quote) = self.sandbox.quote(symbol) {
            info!(
                "🧪 {}: live fetch failed ({}) and no stale price, using sandbox default {}",
                symbol, reason, quote.price
            );
            return Ok(ResolvedPrice {
                quote,
                tier: PriceTier::Sandbox,
                age: None,
            });
        }

        error!("{}: price unavailable through every tier ({})", symbol, reason);
        Err(Error::PriceUnavailable(symbol.to_string()))
    }
}
