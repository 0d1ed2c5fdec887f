//! Autonomous agent - perceive, recall, decide, act, reflect, adapt
//!
//! One tick at a time. A tick that overruns the interval makes the next one
//! skip; shutdown is only observed between ticks.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::agent::memory::{MemoryRecord, PerceivedEvent, PerceivedKind, WorkingMemory};
use crate::agent::provider::{Action, Decision, DecisionContext, DecisionProvider, Goal};
use crate::agent::safety::{SafetyGate, SafetyLimits};
use crate::core::config::AgentConfig;
use crate::core::{Advisory, Error, Result, Store, Symbol, to_f64};
use crate::events::{DecisionCompletedEvent, EventBus, EventType, TradeProposedEvent};
use crate::glassbox::{self, DecisionTrace, GlassBox, SpanKind, SpanOutcome, TraceKind};
use crate::ledger::{CloseOutcome, TradingEngine};
use crate::storage::{Table, WriteOp, WriteQueue};

const RECALL_LIMIT: usize = 5;
const MIN_ADAPT_SAMPLES: usize = 10;
const ADAPT_STEP: f64 = 0.02;
const NOTIFICATION_BUFFER: usize = 256;

/// Message for whoever watches the agent
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub kind: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentStatus {
    pub owner: String,
    pub decision_threshold: f64,
    pub events_in_memory: usize,
    pub decisions_in_memory: usize,
    pub daily_loss: Decimal,
    pub trading_enabled: bool,
    pub ticks: u64,
    pub last_tick_at: Option<DateTime<Utc>>,
}

/// What one tick did
#[derive(Debug, Clone)]
pub struct TickReport {
    pub events: usize,
    /// `None` on an idle tick
    pub decision: Option<Decision>,
    pub acted: bool,
    pub persisted: bool,
    pub outcome: Option<String>,
    pub threshold: f64,
    pub trace_id: Option<Uuid>,
}

/// Nudge the act threshold from the success rate of recent acted decisions.
pub fn adapt_threshold(current: f64, outcomes: &[bool], min: f64, max: f64) -> f64 {
    if outcomes.len() <= MIN_ADAPT_SAMPLES {
        return current.clamp(min, max);
    }
    let rate = outcomes.iter().filter(|ok| **ok).count() as f64 / outcomes.len() as f64;
    let next = if rate < 0.5 {
        current + ADAPT_STEP
    } else if rate > 0.7 {
        current - ADAPT_STEP
    } else {
        current
    };
    next.clamp(min, max)
}

pub struct AutonomousAgent {
    config: AgentConfig,
    engine: Arc<TradingEngine>,
    provider: Arc<dyn DecisionProvider>,
    store: Arc<dyn Store>,
    queue: Arc<WriteQueue>,
    bus: Arc<EventBus>,
    glassbox: Arc<GlassBox>,
    goals: Vec<Goal>,
    memory: Mutex<WorkingMemory>,
    safety: Mutex<SafetyGate>,
    threshold: RwLock<f64>,
    decide_timeout: Duration,
    ticks: AtomicU64,
    last_tick_at: RwLock<Option<DateTime<Utc>>>,
    notify_tx: flume::Sender<Notification>,
    notify_rx: flume::Receiver<Notification>,
}

impl AutonomousAgent {
    pub fn new(
        config: AgentConfig,
        engine: Arc<TradingEngine>,
        provider: Arc<dyn DecisionProvider>,
        store: Arc<dyn Store>,
        queue: Arc<WriteQueue>,
        bus: Arc<EventBus>,
        glassbox: Arc<GlassBox>,
    ) -> Self {
        let (notify_tx, notify_rx) = flume::bounded(NOTIFICATION_BUFFER);
        let threshold = config
            .decision_threshold
            .clamp(config.min_threshold, config.max_threshold);
        Self {
            memory: Mutex::new(WorkingMemory::new(config.memory_window(), config.max_decisions)),
            safety: Mutex::new(SafetyGate::new(SafetyLimits::from(&config), config.trading_enabled)),
            threshold: RwLock::new(threshold),
            goals: vec![Goal::default()],
            decide_timeout: Duration::from_secs(30),
            ticks: AtomicU64::new(0),
            last_tick_at: RwLock::new(None),
            config,
            engine,
            provider,
            store,
            queue,
            bus,
            glassbox,
            notify_tx,
            notify_rx,
        }
    }

    /// Upper bound on one provider call
    pub fn with_decide_timeout(mut self, timeout: Duration) -> Self {
        self.decide_timeout = timeout;
        self
    }

    pub fn with_goals(mut self, goals: Vec<Goal>) -> Self {
        self.goals = goals;
        self
    }

    /// Receiving end of the notification channel
    pub fn notifications(&self) -> flume::Receiver<Notification> {
        self.notify_rx.clone()
    }

    pub fn threshold(&self) -> f64 {
        *self.threshold.read()
    }

    pub fn status(&self) -> AgentStatus {
        let (events_in_memory, decisions_in_memory) = {
            let m = self.memory.lock();
            (m.event_count(), m.decision_count())
        };
        let (daily_loss, trading_enabled) = {
            let s = self.safety.lock();
            (s.daily_loss(), s.is_enabled())
        };
        AgentStatus {
            owner: self.config.owner.clone(),
            decision_threshold: self.threshold(),
            events_in_memory,
            decisions_in_memory,
            daily_loss,
            trading_enabled,
            ticks: self.ticks.load(Ordering::Relaxed),
            last_tick_at: *self.last_tick_at.read(),
        }
    }

    /// Stop opening positions and close everything the agent holds.
    pub async fn kill_switch(&self, reason: &str) -> Vec<CloseOutcome> {
        self.safety.lock().kill_switch(reason);
        self.notify("kill_switch", format!("Trading halted: {}", reason));
        self.engine.close_all_trades(&self.config.owner).await
    }

    pub fn resume_trading(&self) {
        self.safety.lock().enable();
    }

    /// Tick on the configured interval until `shutdown` turns true.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            "🤖 Agent for {} started (every {:?}, provider {}, threshold {:.2})",
            self.config.owner,
            self.config.interval(),
            self.provider.name(),
            self.threshold()
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.tick().await;
                    if let Some(d) = &report.decision {
                        info!(
                            "🧠 {} (confidence {:.2}, threshold {:.2}) acted={} persisted={}",
                            d.action.name(), d.confidence, report.threshold, report.acted, report.persisted
                        );
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("🤖 Agent stopped after {} ticks", self.ticks.load(Ordering::Relaxed));
    }

    /// One full cycle.
    pub async fn tick(&self) -> TickReport {
        let tick_no = self.ticks.fetch_add(1, Ordering::Relaxed) + 1;
        *self.last_tick_at.write() = Some(Utc::now());

        let mut trace = self
            .glassbox
            .start(
                TraceKind::DecisionCycle,
                json!({ "owner": self.config.owner, "tick": tick_no }),
            )
            .advisory("start decision trace");
        let trace_id = trace.as_ref().map(|t| t.id);

        let events = self.perceive().await;
        glassbox::record(
            &mut trace,
            "perceive",
            SpanKind::Computation,
            json!({ "symbols": self.config.symbols }),
            SpanOutcome::ok(json!({
                "events": events.iter().map(|e| e.kind.to_string()).collect::<Vec<_>>(),
            })),
        );

        if events.is_empty() {
            debug!("Tick {}: nothing perceived", tick_no);
            self.seal(trace, "idle", 0.0);
            return TickReport {
                events: 0,
                decision: None,
                acted: false,
                persisted: false,
                outcome: None,
                threshold: self.threshold(),
                trace_id,
            };
        }

        let recalled = self
            .store
            .recent_memories(RECALL_LIMIT)
            .advisory("recall memories")
            .unwrap_or_default();
        let memory_summary = self.memory.lock().summary();
        glassbox::record(
            &mut trace,
            "recall",
            SpanKind::Computation,
            json!({ "limit": RECALL_LIMIT }),
            SpanOutcome::ok(json!({ "recalled": recalled.len() })),
        );

        let threshold = self.threshold();
        // an unreadable balance reads as no funds
        let available = match self.engine.balance(&self.config.owner) {
            Ok(b) => b.available,
            Err(e) => {
                warn!("⚠️ Balance unavailable during recall: {}", e);
                Decimal::ZERO
            }
        };
        let context = DecisionContext {
            owner: self.config.owner.clone(),
            events: events.clone(),
            memory_summary,
            recalled,
            goals: self.goals.clone(),
            open_positions: self.engine.open_trades(&self.config.owner),
            available,
            threshold,
        };
        let decision = self.decide(&context).await;
        glassbox::record(
            &mut trace,
            "decide",
            SpanKind::Decision,
            json!({ "provider": self.provider.name(), "events": events.len() }),
            SpanOutcome::ok(serde_json::to_value(&decision.action).unwrap_or_default())
                .reasoning(decision.rationale.clone())
                .confidence(decision.confidence),
        );

        let should_act = decision.confidence >= threshold && decision.action != Action::Wait;
        let outcome = if should_act {
            Some(self.act(&decision).await)
        } else {
            None
        };
        let act_outcome = match &outcome {
            None => SpanOutcome::ok(json!({ "acted": false }))
                .reasoning(format!("confidence {:.2} below {:.2}", decision.confidence, threshold)),
            Some(Ok(summary)) => SpanOutcome::ok(json!({ "acted": true, "result": summary })),
            Some(Err(e)) => SpanOutcome::failed(e.to_string()),
        };
        glassbox::record(
            &mut trace,
            "act",
            SpanKind::Execution,
            json!({ "action": decision.action.name(), "threshold": threshold }),
            act_outcome,
        );

        let persisted = self.reflect(&decision, outcome.as_ref(), trace_id);
        glassbox::record(
            &mut trace,
            "reflect",
            SpanKind::Persistence,
            json!({ "confidence": decision.confidence }),
            SpanOutcome::ok(json!({ "persisted": persisted })),
        );

        let (before, after) = self.adapt();
        glassbox::record(
            &mut trace,
            "adapt",
            SpanKind::Computation,
            json!({ "threshold": before }),
            SpanOutcome::ok(json!({ "threshold": after })),
        );

        let acted = outcome.is_some();
        self.bus.publish(
            EventType::DecisionCompleted,
            &DecisionCompletedEvent {
                trace_id,
                action: decision.action.name().to_string(),
                confidence: decision.confidence,
                acted,
                persisted,
                rationale: decision.rationale.clone(),
            },
        );
        self.seal(trace, decision.action.name(), decision.confidence);

        TickReport {
            events: events.len(),
            acted,
            persisted,
            outcome: outcome.map(|r| match r {
                Ok(s) => s,
                Err(e) => format!("failed: {}", e),
            }),
            threshold: after,
            trace_id,
            decision: Some(decision),
        }
    }

    async fn perceive(&self) -> Vec<PerceivedEvent> {
        let mut events = Vec::new();

        for raw in &self.config.symbols {
            let symbol = Symbol::new(raw.as_str());
            let price = match self.engine.quote(&symbol).await {
                Ok(r) => r.quote.price,
                Err(e) => {
                    warn!("⚠️ No price for {}: {}", symbol, e);
                    continue;
                }
            };
            let last = self.memory.lock().last_price(&symbol);
            self.memory.lock().set_last_price(symbol.clone(), price);

            let Some(last) = last.filter(|l| !l.is_zero()) else {
                continue;
            };
            let change = to_f64((price - last) / last * Decimal::ONE_HUNDRED);
            if change.abs() > self.config.price_move_pct {
                let direction = if change > 0.0 { "up" } else { "down" };
                let description = format!("{} {} {:.2}% to {}", symbol, direction, change.abs(), price);
                events.push(PerceivedEvent::new(PerceivedKind::PriceMovement, symbol, change, description));
            }
        }

        for trade in self.engine.open_trades(&self.config.owner) {
            if trade.size.is_zero() {
                continue;
            }
            let price = match self.engine.quote(&trade.pair).await {
                Ok(r) => r.quote.price,
                Err(e) => {
                    warn!("⚠️ Cannot mark {} to market: {}", trade.id, e);
                    continue;
                }
            };
            // gross move of the position, fees excluded
            let gross = trade.pnl_at(price) + trade.fees;
            let pct = to_f64(gross / trade.size * Decimal::ONE_HUNDRED);
            let kind = if pct > self.config.profit_take_pct {
                PerceivedKind::ProfitOpportunity
            } else if pct < -self.config.stop_loss_pct {
                PerceivedKind::StopLossAlert
            } else {
                continue;
            };
            let description = format!("{} {} position {:+.2}%", trade.pair, trade.direction, pct);
            events.push(PerceivedEvent::new(kind, trade.pair.clone(), pct, description).for_trade(trade.id));
        }

        let mut memory = self.memory.lock();
        for e in &events {
            memory.push_event(e.clone());
        }
        memory.prune();
        events
    }

    async fn decide(&self, context: &DecisionContext) -> Decision {
        match tokio::time::timeout(self.decide_timeout, self.provider.decide(context)).await {
            Ok(Ok(decision)) => decision,
            Ok(Err(e)) => {
                warn!("⚠️ {} gave no usable decision: {}", self.provider.name(), e);
                Decision::wait(format!("provider error: {}", e))
            }
            Err(_) => {
                warn!("⏱️ {} timed out after {:?}", self.provider.name(), self.decide_timeout);
                Decision::wait("provider timed out")
            }
        }
    }

    async fn act(&self, decision: &Decision) -> Result<String> {
        let owner = &self.config.owner;
        match &decision.action {
            Action::Trade {
                pair,
                direction,
                size_usd,
            } => {
                self.bus.publish(
                    EventType::TradeProposed,
                    &TradeProposedEvent {
                        owner: owner.clone(),
                        symbol: pair.clone(),
                        side: direction.to_string(),
                        amount: to_f64(*size_usd),
                        confidence: decision.confidence,
                        rationale: decision.rationale.clone(),
                    },
                );
                let open = self.engine.open_trades(owner).len();
                self.safety
                    .lock()
                    .check_trade(*size_usd, open)
                    .map_err(|e| Error::Validation(format!("safety gate: {}", e)))?;

                let trade = self
                    .engine
                    .execute_trade(owner, pair, *direction, *size_usd, &decision.rationale)
                    .await?;
                Ok(format!(
                    "opened {} {} {} ${} @ {}",
                    trade.id, trade.direction, trade.pair, trade.size, trade.entry_price
                ))
            }
            Action::Close { trade_id } => {
                match self.engine.trade(*trade_id) {
                    Some(t) if t.owner == *owner => {}
                    Some(_) => {
                        return Err(Error::Validation(format!("trade {} belongs to another owner", trade_id)));
                    }
                    None => return Err(Error::TradeNotFound(*trade_id)),
                }
                let trade = self.engine.close_trade(*trade_id).await?;
                let pnl = trade.pnl.unwrap_or_default();
                self.safety.lock().record_outcome(pnl);
                Ok(format!("closed {} pnl ${}", trade.id, pnl))
            }
            Action::Notify { message } => {
                self.notify("notice", message.clone());
                Ok("notified".to_string())
            }
            Action::Research { topic } => {
                self.notify("research", format!("Research requested: {}", topic));
                Ok(format!("research queued: {}", topic))
            }
            Action::Wait => Ok("waited".to_string()),
        }
    }

    /// Keep every decision in working memory; persist the confident ones.
    fn reflect(&self, decision: &Decision, outcome: Option<&Result<String>>, trace_id: Option<Uuid>) -> bool {
        let record = MemoryRecord {
            id: Uuid::new_v4(),
            action: decision.action.name().to_string(),
            detail: serde_json::to_value(&decision.action).unwrap_or_default(),
            rationale: decision.rationale.clone(),
            confidence: decision.confidence,
            acted: outcome.is_some(),
            success: outcome.map(|r| r.is_ok()),
            outcome: outcome.map(|r| match r {
                Ok(s) => s.clone(),
                Err(e) => format!("failed: {}", e),
            }),
            trace_id,
            created_at: Utc::now(),
        };
        self.memory.lock().push_decision(record.clone());

        if decision.confidence < self.config.persist_threshold {
            return false;
        }
        if let Err(e) = self.store.save_memory(&record) {
            warn!("⚠️ Memory {} not persisted ({}), queued for retry", record.id, e);
            self.queue
                .enqueue(WriteOp::Create, Table::Memories, &record)
                .advisory("queue memory");
        }
        true
    }

    fn adapt(&self) -> (f64, f64) {
        let outcomes = self.memory.lock().acted_outcomes(self.config.adapt_window);
        let mut threshold = self.threshold.write();
        let before = *threshold;
        let after = adapt_threshold(before, &outcomes, self.config.min_threshold, self.config.max_threshold);
        if (after - before).abs() > f64::EPSILON {
            info!("🎚️ Decision threshold {:.2} -> {:.2} over {} outcomes", before, after, outcomes.len());
        }
        *threshold = after;
        (before, after)
    }

    fn notify(&self, kind: &str, message: impl Into<String>) {
        let n = Notification {
            kind: kind.to_string(),
            message: message.into(),
            created_at: Utc::now(),
        };
        if let Err(e) = self.notify_tx.try_send(n) {
            debug!("Notification dropped: {}", e);
        }
    }

    fn seal(&self, trace: Option<DecisionTrace>, decision: &str, confidence: f64) {
        let Some(mut t) = trace else {
            return;
        };
        if t.finalize(decision, confidence).advisory("finalize decision trace").is_some() {
            self.glassbox.commit(&t).advisory("commit decision trace");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::TradingConfig;
    use crate::core::Direction;
    use crate::agent::provider::RuleBasedProvider;
    use crate::market::{PriceCache, PriceResolver, StaticPriceSource};
    use crate::storage::MemoryStore;
    use async_trait::async_trait;
    use std::collections::VecDeque;

    /// Replays a fixed list of decisions
    struct Scripted {
        decisions: Mutex<VecDeque<Result<Decision>>>,
        delay: Duration,
    }

    impl Scripted {
        fn new(decisions: Vec<Result<Decision>>) -> Self {
            Self {
                decisions: Mutex::new(decisions.into()),
                delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl DecisionProvider for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn decide(&self, _context: &DecisionContext) -> Result<Decision> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.decisions
                .lock()
                .pop_front()
                .unwrap_or_else(|| Ok(Decision::wait("script exhausted")))
        }
    }

    struct Harness {
        agent: AutonomousAgent,
        engine: Arc<TradingEngine>,
        source: Arc<StaticPriceSource>,
        store: Arc<MemoryStore>,
    }

    fn harness(provider: Arc<dyn DecisionProvider>) -> Harness {
        let source = Arc::new(StaticPriceSource::new().with_price("BTC/USDC", dec("43250")));
        let cache = Arc::new(PriceCache::new(Duration::ZERO, Duration::from_secs(3600)));
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(WriteQueue::new(100, 5));
        let bus = Arc::new(EventBus::empty());
        let glassbox = Arc::new(GlassBox::new(store.clone(), queue.clone()));
        let engine = Arc::new(TradingEngine::new(
            TradingConfig::default(),
            PriceResolver::new(cache, source.clone()),
            store.clone(),
            queue.clone(),
            bus.clone(),
            glassbox.clone(),
        ));
        let config = AgentConfig {
            symbols: vec!["BTC/USDC".into()],
            ..AgentConfig::default()
        };
        let agent = AutonomousAgent::new(
            config,
            engine.clone(),
            provider,
            store.clone(),
            queue,
            bus,
            glassbox,
        );
        Harness {
            agent,
            engine,
            source,
            store,
        }
    }

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn buy_btc(confidence: f64) -> Result<Decision> {
        Ok(Decision::new(
            Action::Trade {
                pair: "BTC/USDC".into(),
                direction: Direction::Buy,
                size_usd: dec("50"),
            },
            confidence,
            "momentum",
        ))
    }

    /// Raise BTC 5% so the next tick perceives a price movement
    fn pump(h: &Harness, price: &mut Decimal) {
        *price *= dec("1.05");
        h.source.set_price("BTC/USDC", *price);
    }

    #[tokio::test]
    async fn test_first_tick_is_idle() {
        let h = harness(Arc::new(Scripted::new(vec![buy_btc(0.99)])));
        let report = h.agent.tick().await;
        assert_eq!(report.events, 0);
        assert!(report.decision.is_none());
        assert!(h.store.recent_memories(10).unwrap().is_empty());
        assert_eq!(h.agent.status().ticks, 1);
    }

    #[tokio::test]
    async fn test_confidence_gates_persist_and_act() {
        let h = harness(Arc::new(Scripted::new(vec![buy_btc(0.55), buy_btc(0.65), buy_btc(0.75)])));
        let mut price = dec("43250");
        h.agent.tick().await;

        pump(&h, &mut price);
        let low = h.agent.tick().await;
        assert_eq!(low.events, 1);
        assert!(!low.persisted);
        assert!(!low.acted);
        assert!(h.store.recent_memories(10).unwrap().is_empty());

        pump(&h, &mut price);
        let mid = h.agent.tick().await;
        assert!(mid.persisted);
        assert!(!mid.acted);
        assert!(h.engine.open_trades("solace").is_empty());

        pump(&h, &mut price);
        let high = h.agent.tick().await;
        assert!(high.persisted);
        assert!(high.acted);
        assert!(high.outcome.unwrap().starts_with("opened"));
        assert_eq!(h.engine.open_trades("solace").len(), 1);

        let stored = h.store.recent_memories(10).unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(h.agent.status().decisions_in_memory, 3);
    }

    #[tokio::test]
    async fn test_provider_failures_degrade_to_wait() {
        let h = harness(Arc::new(Scripted::new(vec![Err(Error::MalformedResponse("garbage".into()))])));
        let mut price = dec("43250");
        h.agent.tick().await;
        pump(&h, &mut price);
        let report = h.agent.tick().await;
        let decision = report.decision.unwrap();
        assert_eq!(decision.action, Action::Wait);
        assert!(!report.acted);
        assert!(!report.persisted);
    }

    #[tokio::test]
    async fn test_provider_timeout_degrades_to_wait() {
        let slow = Scripted {
            decisions: Mutex::new(vec![buy_btc(0.95)].into()),
            delay: Duration::from_millis(500),
        };
        let h = harness(Arc::new(slow));
        let agent = h.agent.with_decide_timeout(Duration::from_millis(20));
        let mut price = dec("43250");
        agent.tick().await;
        price *= dec("1.05");
        h.source.set_price("BTC/USDC", price);

        let report = agent.tick().await;
        assert_eq!(report.decision.unwrap().action, Action::Wait);
        assert!(h.engine.open_trades("solace").is_empty());
    }

    #[tokio::test]
    async fn test_decision_cycle_is_traced() {
        let h = harness(Arc::new(Scripted::new(vec![buy_btc(0.75)])));
        let mut price = dec("43250");
        h.agent.tick().await;
        pump(&h, &mut price);
        let report = h.agent.tick().await;

        let trace = h.store.load_trace(report.trace_id.unwrap()).unwrap().unwrap();
        let names: Vec<&str> = trace.spans.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["perceive", "recall", "decide", "act", "reflect", "adapt"]);
        assert_eq!(trace.final_decision.as_deref(), Some("trade"));
        trace.verify_chain().unwrap();
    }

    #[tokio::test]
    async fn test_rules_close_on_stop_loss() {
        let h = harness(Arc::new(RuleBasedProvider::new(dec("50"), 2.0)));
        let trade = h
            .engine
            .execute_trade("solace", "BTC/USDC", Direction::Buy, dec("100"), "manual")
            .await
            .unwrap();
        h.agent.tick().await;

        h.source.set_price("BTC/USDC", dec("41087.5"));
        let report = h.agent.tick().await;
        assert_eq!(report.decision.unwrap().action, Action::Close { trade_id: trade.id });
        assert!(report.acted);
        assert!(!h.engine.trade(trade.id).unwrap().is_open());
        assert!(h.agent.status().daily_loss > Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_position_triggers_are_strict_and_gross() {
        let h = harness(Arc::new(Scripted::new(Vec::new())));
        h.source.set_price("BTC/USDC", dec("100"));
        h.engine
            .execute_trade("solace", "BTC/USDC", Direction::Buy, dec("100"), "")
            .await
            .unwrap();

        let position_kinds = |events: Vec<PerceivedEvent>| -> Vec<PerceivedKind> {
            events
                .into_iter()
                .filter(|e| e.trade_id.is_some())
                .map(|e| e.kind)
                .collect()
        };

        for price in ["105", "97", "97.1", "104.9"] {
            h.source.set_price("BTC/USDC", dec(price));
            assert!(position_kinds(h.agent.perceive().await).is_empty(), "no trigger at {}", price);
        }

        h.source.set_price("BTC/USDC", dec("105.01"));
        assert_eq!(position_kinds(h.agent.perceive().await), vec![PerceivedKind::ProfitOpportunity]);

        h.source.set_price("BTC/USDC", dec("96.99"));
        assert_eq!(position_kinds(h.agent.perceive().await), vec![PerceivedKind::StopLossAlert]);
    }

    #[tokio::test]
    async fn test_notify_reaches_channel() {
        let notice = Decision::new(Action::Notify { message: "BTC waking up".into() }, 0.9, "heads up");
        let h = harness(Arc::new(Scripted::new(vec![Ok(notice)])));
        let rx = h.agent.notifications();
        let mut price = dec("43250");
        h.agent.tick().await;
        pump(&h, &mut price);
        h.agent.tick().await;

        let n = rx.try_recv().unwrap();
        assert_eq!(n.kind, "notice");
        assert_eq!(n.message, "BTC waking up");
    }

    #[tokio::test]
    async fn test_kill_switch_blocks_new_trades() {
        let h = harness(Arc::new(Scripted::new(vec![buy_btc(0.95)])));
        h.engine
            .execute_trade("solace", "BTC/USDC", Direction::Buy, dec("50"), "")
            .await
            .unwrap();
        let closed = h.agent.kill_switch("test").await;
        assert_eq!(closed.len(), 1);
        assert!(!h.agent.status().trading_enabled);

        let mut price = dec("43250");
        h.agent.tick().await;
        pump(&h, &mut price);
        let report = h.agent.tick().await;
        assert!(report.acted);
        assert!(report.outcome.unwrap().contains("safety gate"));
        assert!(h.engine.open_trades("solace").is_empty());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let h = harness(Arc::new(Scripted::new(Vec::new())));
        let agent = Arc::new(h.agent);
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(agent.clone().run(rx));

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(agent.status().ticks >= 1);
    }

    #[test]
    fn test_adapt_threshold() {
        let failures = vec![false; 11];
        let successes = vec![true; 11];
        assert!((adapt_threshold(0.70, &failures, 0.65, 0.80) - 0.72).abs() < 1e-9);
        assert!((adapt_threshold(0.70, &successes, 0.65, 0.80) - 0.68).abs() < 1e-9);
        assert_eq!(adapt_threshold(0.80, &failures, 0.65, 0.80), 0.80);
        assert_eq!(adapt_threshold(0.65, &successes, 0.65, 0.80), 0.65);
        // ten samples is not enough
        assert_eq!(adapt_threshold(0.70, &failures[..10], 0.65, 0.80), 0.70);

        // 9 of 15 succeeded: inside the dead band
        let mixed: Vec<bool> = (0..15).map(|i| i % 5 < 3).collect();
        assert_eq!(adapt_threshold(0.70, &mixed, 0.65, 0.80), 0.70);
    }
}
