//! Decision providers - turn a decision context into an action
//!
//! The loop only sees `DecisionProvider`. Rules, a remote model, or a test
//! script can sit behind it.

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal::prelude::FromPrimitive;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt::Write as _;
use uuid::Uuid;

use crate::agent::memory::{MemoryRecord, PerceivedEvent, PerceivedKind};
use crate::core::config::ReasoningConfig;
use crate::core::{Direction, Error, Result, Trade};

/// Something the agent works towards
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Goal {
    pub description: String,
    /// 1 (low) ..= 10 (high)
    pub priority: u8,
}

impl Default for Goal {
    fn default() -> Self {
        Self {
            description: "Monitor markets and identify trading opportunities".to_string(),
            priority: 8,
        }
    }
}

/// Everything a provider gets to look at
#[derive(Debug, Clone)]
pub struct DecisionContext {
    pub owner: String,
    pub events: Vec<PerceivedEvent>,
    pub memory_summary: String,
    pub recalled: Vec<MemoryRecord>,
    pub goals: Vec<Goal>,
    pub open_positions: Vec<Trade>,
    pub available: Decimal,
    pub threshold: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    Trade {
        pair: String,
        direction: Direction,
        size_usd: Decimal,
    },
    Close {
        trade_id: Uuid,
    },
    Notify {
        message: String,
    },
    Research {
        topic: String,
    },
    Wait,
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::Trade { .. } => "trade",
            Action::Close { .. } => "close",
            Action::Notify { .. } => "notify",
            Action::Research { .. } => "research",
            Action::Wait => "wait",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub action: Action,
    pub confidence: f64,
    pub rationale: String,
}

impl Decision {
    pub fn new(action: Action, confidence: f64, rationale: impl Into<String>) -> Self {
        Self {
            action,
            confidence: confidence.clamp(0.0, 1.0),
            rationale: rationale.into(),
        }
    }

    /// The no-op every failure degrades to
    pub fn wait(rationale: impl Into<String>) -> Self {
        Self::new(Action::Wait, 0.0, rationale)
    }
}

#[async_trait]
pub trait DecisionProvider: Send + Sync {
    /// Provider name for logs and traces
    fn name(&self) -> &str;

    async fn decide(&self, context: &DecisionContext) -> Result<Decision>;
}

/// Render the context as a prompt for a language model.
pub fn build_prompt(ctx: &DecisionContext) -> String {
    let mut p = String::new();

    let _ = writeln!(p, "CURRENT SITUATION");
    let _ = writeln!(p, "Time: {}", Utc::now().to_rfc3339());
    let _ = writeln!(p, "Account: {} (available ${})", ctx.owner, ctx.available);
    let _ = writeln!(p, "Open positions: {}", ctx.open_positions.len());
    for t in &ctx.open_positions {
        let _ = writeln!(
            p,
            "- {} {} {} ${} @ {} (opened {})",
            t.id,
            t.direction,
            t.pair,
            t.size,
            t.entry_price,
            t.opened_at.format("%H:%M:%S")
        );
    }
    let _ = writeln!(p, "Events:");
    for e in &ctx.events {
        let _ = writeln!(
            p,
            "- [{}] {} ({:+.2}%, importance {:.1}){}",
            e.kind,
            e.description,
            e.change_pct,
            e.importance,
            e.trade_id.map(|id| format!(" trade {}", id)).unwrap_or_default()
        );
    }

    let _ = writeln!(p, "\nWORKING MEMORY");
    p.push_str(&ctx.memory_summary);
    if !ctx.recalled.is_empty() {
        let _ = writeln!(p, "Earlier decisions:");
        for m in &ctx.recalled {
            let _ = writeln!(
                p,
                "- {} {} conf {:.2}: {}",
                m.created_at.format("%Y-%m-%d %H:%M"),
                m.action,
                m.confidence,
                m.rationale
            );
        }
    }

    let _ = writeln!(p, "\nGOALS");
    for g in &ctx.goals {
        let _ = writeln!(p, "- (priority {}) {}", g.priority, g.description);
    }

    let _ = writeln!(p, "\nDECISION REQUIRED");
    let _ = writeln!(
        p,
        "Actions below confidence {:.2} are recorded but not executed.",
        ctx.threshold
    );
    let _ = writeln!(p, "Respond with a single JSON object:");
    let _ = writeln!(
        p,
        r#"{{"action": "trade|close|notify|research|wait", "pair": "BTC/USDC", "direction": "BUY|SELL", "size_usd": 50, "trade_id": "<uuid>", "message": "...", "topic": "...", "confidence": 0.0, "rationale": "..."}}"#
    );
    p
}

#[derive(Debug, Deserialize)]
struct RawDecision {
    action: String,
    confidence: f64,
    #[serde(default)]
    rationale: String,
    pair: Option<String>,
    direction: Option<String>,
    size_usd: Option<f64>,
    trade_id: Option<Uuid>,
    message: Option<String>,
    topic: Option<String>,
}

/// Slice out the first balanced `{...}`, ignoring braces inside strings.
fn first_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in text[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + i + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Parse free text into a decision.
pub fn parse_decision(text: &str) -> Result<Decision> {
    let malformed = |why: &str| Error::MalformedResponse(why.to_string());

    let body = first_json_object(text).ok_or_else(|| malformed("no JSON object in response"))?;
    let raw: RawDecision =
        serde_json::from_str(body).map_err(|e| Error::MalformedResponse(e.to_string()))?;
    if !raw.confidence.is_finite() {
        return Err(malformed("confidence is not a number"));
    }

    let action = match raw.action.trim().to_lowercase().as_str() {
        "trade" | "buy" | "sell" => {
            let pair = raw.pair.ok_or_else(|| malformed("trade without pair"))?;
            let direction = match raw.direction {
                Some(d) => d.parse::<Direction>().map_err(|e| Error::MalformedResponse(e.to_string()))?,
                None if raw.action.eq_ignore_ascii_case("sell") => Direction::Sell,
                None if raw.action.eq_ignore_ascii_case("buy") => Direction::Buy,
                None => return Err(malformed("trade without direction")),
            };
            let size_usd = raw
                .size_usd
                .filter(|s| *s > 0.0)
                .and_then(Decimal::from_f64)
                .ok_or_else(|| malformed("trade without a positive size_usd"))?;
            Action::Trade {
                pair,
                direction,
                size_usd: size_usd.round_dp(2),
            }
        }
        "close" => Action::Close {
            trade_id: raw.trade_id.ok_or_else(|| malformed("close without trade_id"))?,
        },
        "notify" => Action::Notify {
            message: raw.message.unwrap_or_else(|| raw.rationale.clone()),
        },
        "research" => Action::Research {
            topic: raw.topic.ok_or_else(|| malformed("research without topic"))?,
        },
        "wait" | "hold" | "none" => Action::Wait,
        other => return Err(Error::MalformedResponse(format!("unknown action '{}'", other))),
    };

    Ok(Decision::new(action, raw.confidence, raw.rationale))
}

/// Deterministic provider used when no model is configured
pub struct RuleBasedProvider {
    trade_size_usd: Decimal,
    strong_move_pct: f64,
}

impl RuleBasedProvider {
    pub fn new(trade_size_usd: Decimal, price_move_pct: f64) -> Self {
        Self {
            trade_size_usd,
            strong_move_pct: price_move_pct * 2.0,
        }
    }
}

#[async_trait]
impl DecisionProvider for RuleBasedProvider {
    fn name(&self) -> &str {
        "rules"
    }

    async fn decide(&self, ctx: &DecisionContext) -> Result<Decision> {
        let mut events: Vec<&PerceivedEvent> = ctx.events.iter().collect();
        events.sort_by(|a, b| b.importance.total_cmp(&a.importance));

        let Some(top) = events.first() else {
            return Ok(Decision::new(Action::Wait, 0.5, "nothing happened"));
        };

        let decision = match (top.kind, top.trade_id) {
            (PerceivedKind::StopLossAlert, Some(trade_id)) => Decision::new(
                Action::Close { trade_id },
                0.85,
                format!("stop loss: {}", top.description),
            ),
            (PerceivedKind::ProfitOpportunity, Some(trade_id)) => Decision::new(
                Action::Close { trade_id },
                0.75,
                format!("taking profit: {}", top.description),
            ),
            (PerceivedKind::PriceMovement, _) if top.change_pct > 0.0 => {
                let already_open = ctx
                    .open_positions
                    .iter()
                    .any(|t| t.pair == top.symbol);
                if already_open {
                    Decision::new(
                        Action::Notify {
                            message: format!("{} still moving, position already open", top.description),
                        },
                        0.6,
                        "avoid doubling an open position",
                    )
                } else {
                    let confidence = if top.change_pct >= self.strong_move_pct { 0.75 } else { 0.65 };
                    Decision::new(
                        Action::Trade {
                            pair: top.symbol.to_string(),
                            direction: Direction::Buy,
                            size_usd: self.trade_size_usd,
                        },
                        confidence,
                        format!("momentum: {}", top.description),
                    )
                }
            }
            _ => Decision::new(
                Action::Notify {
                    message: top.description.clone(),
                },
                0.6,
                "worth watching",
            ),
        };
        Ok(decision)
    }
}

/// OpenAI-compatible chat-completions provider
pub struct HttpReasoningProvider {
    endpoint: String,
    model: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

const SYSTEM_PROMPT: &str = "You are a cautious trading agent operating a sandbox account. \
Answer with exactly one JSON object and nothing else.";

impl HttpReasoningProvider {
    pub fn new(config: &ReasoningConfig) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(config.timeout()).build()?;
        let api_key = std::env::var(&config.api_key_env).ok().filter(|k| !k.is_empty());
        if api_key.is_none() {
            tracing::warn!("⚠️ {} not set, reasoning requests go out unauthenticated", config.api_key_env);
        }
        Ok(Self {
            endpoint: config.endpoint.clone(),
            model: config.model.clone(),
            api_key,
            client,
        })
    }
}

#[async_trait]
impl DecisionProvider for HttpReasoningProvider {
    fn name(&self) -> &str {
        &self.model
    }

    async fn decide(&self, ctx: &DecisionContext) -> Result<Decision> {
        let body = json!({
            "model": self.model,
            "temperature": 0.2,
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": build_prompt(ctx) },
            ],
        });

        let mut req = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req.send().await?;
        if resp.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(Error::RateLimited(self.endpoint.clone()));
        }
        let resp = resp.error_for_status()?.json::<serde_json::Value>().await?;

        let content = resp["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| Error::MalformedResponse("no message content in completion".into()))?;
        parse_decision(content)
    }
}
