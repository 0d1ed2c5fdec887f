//! Price cache - TTL-bound fresh reads plus a long-horizon stale fallback

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::core::{PriceQuote, Symbol};

#[derive(Debug, Clone)]
struct CacheEntry {
    quote: PriceQuote,
    stored_at: DateTime<Utc>,
}

impl CacheEntry {
    fn age(&self) -> Duration {
        (Utc::now() - self.stored_at).to_std().unwrap_or_default()
    }
}

/// Cache counters
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CacheStats {
    pub total: usize,
    pub fresh: usize,
    pub stale: usize,
    pub ttl_secs: u64,
}

/// Many-readers/one-writer price cache
pub struct PriceCache {
    entries: RwLock<HashMap<Symbol, CacheEntry>>,
    ttl: Duration,
    stale_horizon: Duration,
}

impl PriceCache {
    pub fn new(ttl: Duration, stale_horizon: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
            stale_horizon,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Fresh read: `None` once the entry is older than the TTL.
    pub fn get(&self, symbol: &Symbol) -> Option<PriceQuote> {
        let entries = self.entries.read();
        let entry = entries.get(symbol)?;
        let age = entry.age();
        if age >= self.ttl {
            return None;
        }
        debug!("[CACHE][HIT] {} (age {:?})", symbol, age);
        Some(entry.quote.clone())
    }

    /// Last known quote within the stale horizon, with its age.
    pub fn get_stale(&self, symbol: &Symbol) -> Option<(PriceQuote, Duration)> {
        let entries = self.entries.read();
        let entry = entries.get(symbol)?;
        let age = entry.age();
        if age > self.stale_horizon {
            return None;
        }
        Some((entry.quote.clone(), age))
    }

    pub fn set(&self, quote: PriceQuote) {
        let entry = CacheEntry {
            quote,
            stored_at: Utc::now(),
        };
        self.entries.write().insert(entry.quote.symbol.clone(), entry);
    }

    /// Purge entries past the stale horizon. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        let horizon = self.stale_horizon;
        entries.retain(|_, e| e.age() <= horizon);
        let removed = before - entries.len();
        if removed > 0 {
            info!("🧹 Price cache swept {} expired entries", removed);
        }
        removed
    }

    pub fn stats(&self) -> CacheStats {
        let entries = self.entries.read();
        let fresh = entries.values().filter(|e| e.age() < self.ttl).count();
        CacheStats {
            total: entries.len(),
            fresh,
            stale: entries.len() - fresh,
            ttl_secs: self.ttl.as_secs(),
        }
    }

    /// Run `sweep` every `every` until shutdown is signalled.
    pub fn spawn_sweeper(
        self: Arc<Self>,
        every: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.sweep();
                    }
                    _ = shutdown.changed() => {
                        debug!("Price cache sweeper stopping");
                        break;
                    }
                }
            }
        })
    }

    #[cfg(test)]
    pub(crate) fn backdate(&self, symbol: &Symbol, by: Duration) {
        if let Some(entry) = self.entries.write().get_mut(symbol) {
            entry.stored_at -= chrono::Duration::from_std(by).unwrap_or(chrono::Duration::zero());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    fn quote(symbol: &str, price: i64) -> PriceQuote {
        PriceQuote {
            symbol: Symbol::new(symbol),
            price: Decimal::from(price),
            change_24h: 1.5,
            volume_24h: 1_000.0,
            market_cap: 0.0,
            fetched_at: Utc::now(),
        }
    }

    fn cache() -> PriceCache {
        PriceCache::new(Duration::from_secs(120), Duration::from_secs(24 * 3600))
    }

    #[test]
    fn test_fresh_hit_within_ttl() {
        let c = cache();
        c.set(quote("BTC/USDC", 43_250));
        let hit = c.get(&Symbol::new("BTC/USDC")).unwrap();
        assert_eq!(hit.price, Decimal::from(43_250));
    }

    #[test]
    fn test_expired_entry_is_stale_only() {
        let c = cache();
        let sym = Symbol::new("ETH/USDC");
        c.set(quote("ETH/USDC", 4_000));
        c.backdate(&sym, Duration::from_secs(600));

        assert!(c.get(&sym).is_none());
        let (stale, age) = c.get_stale(&sym).unwrap();
        assert_eq!(stale.price, Decimal::from(4_000));
        assert!(age >= Duration::from_secs(600));
    }

    #[test]
    fn test_sweep_purges_past_horizon() {
        let c = cache();
        let old = Symbol::new("SOL/USDC");
        c.set(quote("SOL/USDC", 190));
        c.set(quote("BTC/USDC", 43_000));
        c.backdate(&old, Duration::from_secs(25 * 3600));

        assert!(c.get_stale(&old).is_none());
        assert_eq!(c.sweep(), 1);
        let stats = c.stats();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.fresh, 1);
        assert_eq!(stats.ttl_secs, 120);
    }

    #[test]
    fn test_stats_split_fresh_and_stale() {
        let c = cache();
        c.set(quote("BTC/USDC", 1));
        c.set(quote("ETH/USDC", 2));
        c.backdate(&Symbol::new("ETH/USDC"), Duration::from_secs(300));
        let stats = c.stats();
        assert_eq!(stats.fresh, 1);
        assert_eq!(stats.stale, 1);
    }

    #[tokio::test]
    async fn test_sweeper_stops_on_shutdown() {
        let c = Arc::new(cache());
        let (tx, rx) = watch::channel(false);
        let handle = c.clone().spawn_sweeper(Duration::from_millis(10), rx);
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
