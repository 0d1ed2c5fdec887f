use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing_subscriber::{EnvFilter, fmt};

use aleph_sandbox::agent::{AutonomousAgent, DecisionProvider, HttpReasoningProvider, RuleBasedProvider};
use aleph_sandbox::core::config::ProviderKind;
use aleph_sandbox::core::{Config, PriceSource};
use aleph_sandbox::events::{AuditSubscriber, EventBus, EventType, TradeAnalytics};
use aleph_sandbox::glassbox::GlassBox;
use aleph_sandbox::ledger::TradingEngine;
use aleph_sandbox::market::{HttpPriceSource, PriceCache, PriceResolver};
use aleph_sandbox::storage::{SqliteStore, WriteQueue};

const ANALYTICS_EVERY: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    // 1. Logger
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,aleph_sandbox=debug"));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_level(true)
        .init();

    let config = Config::load_default();
    tracing::info!("🦀 Aleph Sandbox starting (owner {})", config.agent.owner);

    // 2. Storage
    let store = Arc::new(SqliteStore::open(&config.storage.path)?);
    tracing::info!("💾 Store at {}", config.storage.path);
    let queue = Arc::new(WriteQueue::from_config(&config.write_queue));

    // 3. Prices
    let cache = Arc::new(PriceCache::new(config.cache.ttl(), config.cache.stale_horizon()));
    let source: Arc<dyn PriceSource> = Arc::new(HttpPriceSource::new(&config.price_source)?);
    let resolver = PriceResolver::new(cache.clone(), source);

    // 4. Event bus
    let analytics = Arc::new(TradeAnalytics::new());
    let bus = Arc::new(
        EventBus::builder()
            .subscribe(EventType::TradeExecuted, Arc::new(AuditSubscriber::new(store.clone())))
            .subscribe(EventType::TradeExecuted, analytics.clone())
            .build(),
    );
    let health = bus.health();
    tracing::info!("📨 Event bus: {} subscribers on {:?}", health.total_subscribers, health.topics);

    // 5. Tracer, engine, agent
    let glassbox = Arc::new(GlassBox::new(store.clone(), queue.clone()));
    let engine = Arc::new(TradingEngine::new(
        config.trading.clone(),
        resolver,
        store.clone(),
        queue.clone(),
        bus.clone(),
        glassbox.clone(),
    ));
    engine.restore(&config.agent.owner)?;

    let provider: Arc<dyn DecisionProvider> = match config.reasoning.provider {
        ProviderKind::Rules => Arc::new(RuleBasedProvider::new(
            config.agent.trade_size_usd,
            config.agent.price_move_pct,
        )),
        ProviderKind::Http => Arc::new(HttpReasoningProvider::new(&config.reasoning)?),
    };
    let agent = Arc::new(
        AutonomousAgent::new(
            config.agent.clone(),
            engine.clone(),
            provider,
            store.clone(),
            queue.clone(),
            bus.clone(),
            glassbox,
        )
        .with_decide_timeout(config.reasoning.timeout()),
    );

    // 6. Background tasks
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = cache.clone().spawn_sweeper(config.cache.sweep_interval(), shutdown_rx.clone());
    let flusher = queue
        .clone()
        .spawn_flusher(store.clone(), config.write_queue.flush_interval(), shutdown_rx.clone());
    let agent_task = tokio::spawn(agent.clone().run(shutdown_rx.clone()));

    let notifications = agent.notifications();
    let notifier = tokio::spawn(async move {
        while let Ok(n) = notifications.recv_async().await {
            tracing::info!("🔔 [{}] {}", n.kind, n.message);
        }
    });

    let reporter = {
        let analytics = analytics.clone();
        let queue = queue.clone();
        let agent = agent.clone();
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(ANALYTICS_EVERY);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let s = analytics.snapshot();
                        let q = queue.stats();
                        let a = agent.status();
                        tracing::info!(
                            "📊 trades={} volume=${:.2} buys={} sells={} closed={} pnl=${:.2} | queue={} dead={} | threshold={:.2} ticks={}",
                            s.total_trades, s.total_volume, s.buy_count, s.sell_count, s.closed_trades,
                            s.realized_pnl, q.queue_size, q.dead_letters, a.decision_threshold, a.ticks
                        );
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    };

    // 7. Wait for Ctrl-C
    tokio::signal::ctrl_c().await?;
    tracing::info!("🛑 Shutting down...");
    shutdown_tx.send(true)?;

    let _ = agent_task.await;
    let _ = sweeper.await;
    let _ = flusher.await;
    let _ = reporter.await;
    notifier.abort();

    match engine.balance(&config.agent.owner) {
        Ok(balance) => tracing::info!(
            "👋 Final balance for {}: ${} (realized ${})",
            balance.owner, balance.available, balance.realized_pnl
        ),
        Err(e) => tracing::warn!("👋 Final balance unavailable: {}", e),
    }
    Ok(())
}
