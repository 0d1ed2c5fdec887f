//! Configuration - Type-safe config loaded from TOML
//!
//! Every field has a default, so a partial file (or none at all) is valid.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::core::{Error, Result, TopupPolicy};

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub trading: TradingConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub write_queue: WriteQueueConfig,

    #[serde(default)]
    pub price_source: PriceSourceConfig,

    #[serde(default)]
    pub reasoning: ReasoningConfig,

    #[serde(default)]
    pub agent: AgentConfig,

    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingConfig {
    /// Fee as a fraction of notional (0.001 = 0.1%)
    #[serde(default = "default_fee_rate")]
    pub fee_rate: Decimal,

    /// Balance granted on first use
    #[serde(default = "default_starting_balance")]
    pub starting_balance: Decimal,

    #[serde(default = "default_true")]
    pub auto_topup: bool,

    #[serde(default = "default_topup_threshold")]
    pub topup_threshold: Decimal,

    #[serde(default = "default_topup_amount")]
    pub topup_amount: Decimal,

    /// Default page size for trade history
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

fn default_fee_rate() -> Decimal {
    Decimal::new(1, 3)
}
fn default_starting_balance() -> Decimal {
    Decimal::from(10_000)
}
fn default_true() -> bool {
    true
}
fn default_topup_threshold() -> Decimal {
    Decimal::from(1_000)
}
fn default_topup_amount() -> Decimal {
    Decimal::from(10_000)
}
fn default_history_limit() -> usize {
    50
}

impl TradingConfig {
    pub fn topup_policy(&self) -> Option<TopupPolicy> {
        self.auto_topup.then_some(TopupPolicy {
            threshold: self.topup_threshold,
            amount: self.topup_amount,
        })
    }
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            fee_rate: default_fee_rate(),
            starting_balance: default_starting_balance(),
            auto_topup: true,
            topup_threshold: default_topup_threshold(),
            topup_amount: default_topup_amount(),
            history_limit: default_history_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,

    #[serde(default = "default_stale_horizon_secs")]
    pub stale_horizon_secs: u64,

    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_ttl_secs() -> u64 {
    120
}
fn default_stale_horizon_secs() -> u64 {
    24 * 60 * 60
}
fn default_sweep_interval_secs() -> u64 {
    300
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn stale_horizon(&self) -> Duration {
        Duration::from_secs(self.stale_horizon_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
            stale_horizon_secs: default_stale_horizon_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteQueueConfig {
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,
}

fn default_capacity() -> usize {
    1_000
}
fn default_max_attempts() -> u32 {
    5
}
fn default_flush_interval_secs() -> u64 {
    5
}

impl WriteQueueConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }
}

impl Default for WriteQueueConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            max_attempts: default_max_attempts(),
            flush_interval_secs: default_flush_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceSourceConfig {
    /// CoinGecko-compatible API root
    #[serde(default = "default_price_base_url")]
    pub base_url: String,

    #[serde(default = "default_price_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default)]
    pub api_key: Option<String>,
}

fn default_price_base_url() -> String {
    "https://api.coingecko.com/api/v3".to_string()
}
fn default_price_timeout_secs() -> u64 {
    10
}

impl Default for PriceSourceConfig {
    fn default() -> Self {
        Self {
            base_url: default_price_base_url(),
            timeout_secs: default_price_timeout_secs(),
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Rules,
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningConfig {
    #[serde(default = "default_provider")]
    pub provider: ProviderKind,

    /// Chat-completions endpoint
    #[serde(default = "default_reasoning_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_model")]
    pub model: String,

    /// Name of the env var holding the API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_reasoning_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_provider() -> ProviderKind {
    ProviderKind::Rules
}
fn default_reasoning_endpoint() -> String {
    "https://api.openai.com/v1/chat/completions".to_string()
}
fn default_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_api_key_env() -> String {
    "REASONING_API_KEY".to_string()
}
fn default_reasoning_timeout_secs() -> u64 {
    30
}

impl ReasoningConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for ReasoningConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            endpoint: default_reasoning_endpoint(),
            model: default_model(),
            api_key_env: default_api_key_env(),
            timeout_secs: default_reasoning_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Balance owner the agent trades for
    #[serde(default = "default_owner")]
    pub owner: String,

    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    /// Confidence required to act
    #[serde(default = "default_decision_threshold")]
    pub decision_threshold: f64,

    #[serde(default = "default_min_threshold")]
    pub min_threshold: f64,

    #[serde(default = "default_max_threshold")]
    pub max_threshold: f64,

    /// Confidence required to persist a decision
    #[serde(default = "default_persist_threshold")]
    pub persist_threshold: f64,

    /// Price change (%) that raises a price_movement event
    #[serde(default = "default_price_move_pct")]
    pub price_move_pct: f64,

    #[serde(default = "default_profit_take_pct")]
    pub profit_take_pct: f64,

    #[serde(default = "default_stop_loss_pct")]
    pub stop_loss_pct: f64,

    #[serde(default = "default_memory_window_secs")]
    pub memory_window_secs: u64,

    #[serde(default = "default_max_decisions")]
    pub max_decisions: usize,

    /// Acted decisions considered when adapting the threshold
    #[serde(default = "default_adapt_window")]
    pub adapt_window: usize,

    /// Notional the rule-based provider proposes
    #[serde(default = "default_trade_size_usd")]
    pub trade_size_usd: Decimal,

    #[serde(default = "default_max_trade_size")]
    pub max_trade_size: Decimal,

    #[serde(default = "default_daily_loss_limit")]
    pub daily_loss_limit: Decimal,

    #[serde(default = "default_max_open_positions")]
    pub max_open_positions: usize,

    #[serde(default = "default_true")]
    pub trading_enabled: bool,
}

fn default_owner() -> String {
    "solace".to_string()
}
fn default_interval_secs() -> u64 {
    10
}
fn default_symbols() -> Vec<String> {
    vec!["SOL/USDC".into(), "BTC/USDC".into(), "ETH/USDC".into()]
}
fn default_decision_threshold() -> f64 {
    0.70
}
fn default_min_threshold() -> f64 {
    0.65
}
fn default_max_threshold() -> f64 {
    0.80
}
fn default_persist_threshold() -> f64 {
    0.6
}
fn default_price_move_pct() -> f64 {
    2.0
}
fn default_profit_take_pct() -> f64 {
    5.0
}
fn default_stop_loss_pct() -> f64 {
    3.0
}
fn default_memory_window_secs() -> u64 {
    2 * 60 * 60
}
fn default_max_decisions() -> usize {
    50
}
fn default_adapt_window() -> usize {
    20
}
fn default_trade_size_usd() -> Decimal {
    Decimal::from(50)
}
fn default_max_trade_size() -> Decimal {
    Decimal::from(100)
}
fn default_daily_loss_limit() -> Decimal {
    Decimal::from(500)
}
fn default_max_open_positions() -> usize {
    3
}

impl AgentConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn memory_window(&self) -> Duration {
        Duration::from_secs(self.memory_window_secs)
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            owner: default_owner(),
            interval_secs: default_interval_secs(),
            symbols: default_symbols(),
            decision_threshold: default_decision_threshold(),
            min_threshold: default_min_threshold(),
            max_threshold: default_max_threshold(),
            persist_threshold: default_persist_threshold(),
            price_move_pct: default_price_move_pct(),
            profit_take_pct: default_profit_take_pct(),
            stop_loss_pct: default_stop_loss_pct(),
            memory_window_secs: default_memory_window_secs(),
            max_decisions: default_max_decisions(),
            adapt_window: default_adapt_window(),
            trade_size_usd: default_trade_size_usd(),
            max_trade_size: default_max_trade_size(),
            daily_loss_limit: default_daily_loss_limit(),
            max_open_positions: default_max_open_positions(),
            trading_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite file (":memory:" for a throwaway database)
    #[serde(default = "default_storage_path")]
    pub path: String,
}

fn default_storage_path() -> String {
    "aleph-sandbox.db".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
        }
    }
}

impl Config {
    /// Load from TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config: {}", e)))?;

        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from the working directory, falling back to defaults.
    pub fn load_default() -> Self {
        let candidates = ["aleph-sandbox.toml", "config.toml"];

        for path in &candidates {
            let path = Path::new(path);
            if !path.exists() {
                continue;
            }
            match Self::load(path) {
                Ok(cfg) => {
                    tracing::info!("📋 Loaded config from {}", path.display());
                    return cfg;
                }
                Err(e) => tracing::warn!("⚠️ Ignoring {}: {}", path.display(), e),
            }
        }

        tracing::warn!("⚠️ No config file found, using defaults");
        Self::default()
    }

    fn validate(&self) -> Result<()> {
        let a = &self.agent;
        if a.min_threshold > a.max_threshold {
            return Err(Error::Config(format!(
                "agent.min_threshold {} exceeds agent.max_threshold {}",
                a.min_threshold, a.max_threshold
            )));
        }
        if self.trading.fee_rate < Decimal::ZERO {
            return Err(Error::Config("trading.fee_rate must not be negative".into()));
        }
        if self.write_queue.capacity == 0 {
            return Err(Error::Config("write_queue.capacity must be positive".into()));
        }
        // tokio intervals reject a zero period
        for (name, secs) in [
            ("agent.interval_secs", a.interval_secs),
            ("cache.sweep_interval_secs", self.cache.sweep_interval_secs),
            ("write_queue.flush_interval_secs", self.write_queue.flush_interval_secs),
        ] {
            if secs == 0 {
                return Err(Error::Config(format!("{} must be positive", name)));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_yields_defaults() {
        let cfg = Config::parse("").unwrap();
        assert_eq!(cfg.trading.fee_rate, Decimal::new(1, 3));
        assert_eq!(cfg.trading.starting_balance, Decimal::from(10_000));
        assert_eq!(cfg.cache.ttl(), Duration::from_secs(120));
        assert_eq!(cfg.write_queue.capacity, 1_000);
        assert_eq!(cfg.write_queue.max_attempts, 5);
        assert_eq!(cfg.agent.interval(), Duration::from_secs(10));
        assert!((cfg.agent.decision_threshold - 0.70).abs() < f64::EPSILON);
        assert_eq!(cfg.reasoning.provider, ProviderKind::Rules);
    }

    #[test]
    fn test_partial_sections_override() {
        let cfg = Config::parse(
            r#"
            [trading]
            auto_topup = false
            fee_rate = 0.002

            [agent]
            owner = "bob"
            symbols = ["BTC/USDC"]

            [reasoning]
            provider = "http"
            "#,
        )
        .unwrap();
        assert!(cfg.trading.topup_policy().is_none());
        assert_eq!(cfg.trading.fee_rate, Decimal::new(2, 3));
        assert_eq!(cfg.agent.owner, "bob");
        assert_eq!(cfg.agent.symbols, vec!["BTC/USDC".to_string()]);
        assert_eq!(cfg.agent.max_open_positions, 3);
        assert_eq!(cfg.reasoning.provider, ProviderKind::Http);
    }

    #[test]
    fn test_inverted_threshold_band_rejected() {
        let err = Config::parse(
            r#"
            [agent]
            min_threshold = 0.9
            max_threshold = 0.7
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let err = Config::parse("[write_queue]\nflush_interval_secs = 0\n").unwrap_err();
        assert!(err.to_string().contains("flush_interval_secs"));
    }
}
