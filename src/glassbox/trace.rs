//! Decision traces - an append-only arena of hash-chained spans
//!
//! Spans are indexed by chain position. At most one span is open at a time,
//! so spans are always sealed in chain order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::error;
use uuid::Uuid;

use crate::core::{Error, Result};
use crate::glassbox::hasher::{self, ProofStep};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceKind {
    TradeExecution,
    TradeClose,
    DecisionCycle,
}

impl std::fmt::Display for TraceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TraceKind::TradeExecution => write!(f, "trade_execution"),
            TraceKind::TradeClose => write!(f, "trade_close"),
            TraceKind::DecisionCycle => write!(f, "decision_cycle"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceStatus {
    Started,
    Finalized,
    Aborted,
}

impl std::fmt::Display for TraceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TraceStatus::Started => write!(f, "started"),
            TraceStatus::Finalized => write!(f, "finalized"),
            TraceStatus::Aborted => write!(f, "aborted"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanKind {
    Validation,
    Computation,
    Decision,
    Execution,
    Persistence,
}

impl std::fmt::Display for SpanKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SpanKind::Validation => write!(f, "validation"),
            SpanKind::Computation => write!(f, "computation"),
            SpanKind::Decision => write!(f, "decision"),
            SpanKind::Execution => write!(f, "execution"),
            SpanKind::Persistence => write!(f, "persistence"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanStatus {
    Open,
    Completed,
    Failed,
}

impl std::fmt::Display for SpanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SpanStatus::Open => write!(f, "open"),
            SpanStatus::Completed => write!(f, "completed"),
            SpanStatus::Failed => write!(f, "failed"),
        }
    }
}

/// What a span produced
#[derive(Debug, Clone)]
pub struct SpanOutcome {
    pub output: Value,
    pub reasoning: String,
    pub confidence: f64,
    pub status: SpanStatus,
}

impl SpanOutcome {
    pub fn ok(output: Value) -> Self {
        Self {
            output,
            reasoning: String::new(),
            confidence: 1.0,
            status: SpanStatus::Completed,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self {
            output: Value::Null,
            reasoning: reason,
            confidence: 0.0,
            status: SpanStatus::Failed,
        }
    }

    pub fn reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = reasoning.into();
        self
    }

    pub fn confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionSpan {
    pub position: usize,
    pub name: String,
    pub kind: SpanKind,
    pub input: Value,
    pub output: Value,
    pub reasoning: String,
    pub confidence: f64,
    pub status: SpanStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub previous_hash: String,
    /// Empty until sealed
    pub hash: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub name: String,
    pub value: f64,
    pub unit: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionTrace {
    pub id: Uuid,
    pub kind: TraceKind,
    pub context: Value,
    pub status: TraceStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub root_hash: String,
    pub spans: Vec<DecisionSpan>,
    pub final_decision: Option<String>,
    pub confidence: Option<f64>,
    pub merkle_root: Option<String>,
    pub abort_reason: Option<String>,
    pub metrics: Vec<Metric>,
    /// Set when sealed; see `hasher::seal_hash`
    #[serde(default)]
    pub seal_hash: Option<String>,
}

impl DecisionTrace {
    pub fn new(kind: TraceKind, context: Value) -> Self {
        let id = Uuid::new_v4();
        let started_at = Utc::now();
        Self {
            id,
            kind,
            context,
            status: TraceStatus::Started,
            root_hash: hasher::root_anchor(id, &started_at),
            started_at,
            ended_at: None,
            spans: Vec::new(),
            final_decision: None,
            confidence: None,
            merkle_root: None,
            abort_reason: None,
            metrics: Vec::new(),
            seal_hash: None,
        }
    }

    pub fn is_sealed(&self) -> bool {
        self.status != TraceStatus::Started
    }

    /// Hash the next span will chain from
    pub fn head_hash(&self) -> &str {
        self.spans
            .last()
            .map(|s| s.hash.as_str())
            .unwrap_or(self.root_hash.as_str())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_sealed() {
            return Err(Error::InvalidState(format!(
                "trace {} is {}",
                self.id, self.status
            )));
        }
        Ok(())
    }

    fn open_span(&self) -> Option<&DecisionSpan> {
        self.spans.last().filter(|s| s.status == SpanStatus::Open)
    }

    /// Open a span at the next chain position.
    pub fn start_span(&mut self, name: &str, kind: SpanKind, input: Value) -> Result<usize> {
        self.ensure_open()?;
        if let Some(open) = self.open_span() {
            return Err(Error::InvalidState(format!(
                "span '{}' at {} is still open",
                open.name, open.position
            )));
        }
        let position = self.spans.len();
        let previous_hash = self.head_hash().to_string();
        self.spans.push(DecisionSpan {
            position,
            name: name.to_string(),
            kind,
            input,
            output: Value::Null,
            reasoning: String::new(),
            confidence: 0.0,
            status: SpanStatus::Open,
            started_at: Utc::now(),
            ended_at: None,
            previous_hash,
            hash: String::new(),
        });
        Ok(position)
    }

    /// Seal the open span with its outcome.
    pub fn end_span(&mut self, position: usize, outcome: SpanOutcome) -> Result<&DecisionSpan> {
        self.ensure_open()?;
        let trace_id = self.id;
        let span = self
            .spans
            .get_mut(position)
            .filter(|s| s.status == SpanStatus::Open)
            .ok_or_else(|| Error::InvalidState(format!("no open span at {}", position)))?;

        span.output = outcome.output;
        span.reasoning = outcome.reasoning;
        span.confidence = outcome.confidence;
        span.status = match outcome.status {
            SpanStatus::Open => SpanStatus::Completed,
            other => other,
        };
        span.ended_at = Some(Utc::now());
        span.hash = hasher::span_hash(trace_id, span);
        Ok(span)
    }

    /// Start and immediately seal a span.
    pub fn record(&mut self, name: &str, kind: SpanKind, input: Value, outcome: SpanOutcome) -> Result<usize> {
        let position = self.start_span(name, kind, input)?;
        self.end_span(position, outcome)?;
        Ok(position)
    }

    pub fn record_metric(&mut self, name: &str, value: f64, unit: &str) {
        self.metrics.push(Metric {
            name: name.to_string(),
            value,
            unit: unit.to_string(),
        });
    }

    fn compute_merkle_root(&self) -> String {
        let leaves: Vec<String> = self.spans.iter().map(|s| s.hash.clone()).collect();
        hasher::merkle_root(&leaves).unwrap_or_else(|| self.root_hash.clone())
    }

    fn seal(&mut self, status: TraceStatus) {
        self.merkle_root = Some(self.compute_merkle_root());
        self.status = status;
        self.ended_at = Some(Utc::now());
        self.seal_hash = Some(hasher::seal_hash(self));
    }

    /// Seal the trace with its final decision.
    pub fn finalize(&mut self, decision: impl Into<String>, confidence: f64) -> Result<()> {
        self.ensure_open()?;
        if let Some(open) = self.open_span() {
            return Err(Error::InvalidState(format!(
                "cannot finalize with span '{}' open",
                open.name
            )));
        }
        self.final_decision = Some(decision.into());
        self.confidence = Some(confidence);
        self.seal(TraceStatus::Finalized);
        Ok(())
    }

    /// Seal the trace as aborted. An open span is sealed as failed.
    pub fn abort(&mut self, reason: impl Into<String>) -> Result<()> {
        self.ensure_open()?;
        let reason = reason.into();
        if let Some(position) = self.open_span().map(|s| s.position) {
            self.end_span(position, SpanOutcome::failed(reason.clone()))?;
        }
        self.abort_reason = Some(reason);
        self.seal(TraceStatus::Aborted);
        Ok(())
    }

    /// Recompute every sealed span hash from position 0 forward, then the
    /// merkle root and seal of a sealed trace. Reports the first divergence;
    /// a bad header is reported at `spans.len()`.
    pub fn verify_chain(&self) -> Result<()> {
        let anchor = hasher::root_anchor(self.id, &self.started_at);
        if anchor != self.root_hash {
            return self.broken(0, anchor, self.root_hash.clone());
        }

        let mut previous = self.root_hash.clone();
        for (index, span) in self.spans.iter().enumerate() {
            if span.position != index {
                return self.broken(index, index.to_string(), span.position.to_string());
            }
            if span.status == SpanStatus::Open {
                if index + 1 == self.spans.len() && !self.is_sealed() {
                    break;
                }
                return self.broken(index, "sealed span".into(), "open span".into());
            }
            if span.previous_hash != previous {
                return self.broken(index, previous, span.previous_hash.clone());
            }
            let expected = hasher::span_hash(self.id, span);
            if expected != span.hash {
                return self.broken(index, expected, span.hash.clone());
            }
            previous = span.hash.clone();
        }

        if self.is_sealed() {
            let tail = self.spans.len();
            let root = self.compute_merkle_root();
            if self.merkle_root.as_deref() != Some(root.as_str()) {
                return self.broken(tail, root, self.merkle_root.clone().unwrap_or_default());
            }
            let seal = hasher::seal_hash(self);
            if self.seal_hash.as_deref() != Some(seal.as_str()) {
                return self.broken(tail, seal, self.seal_hash.clone().unwrap_or_default());
            }
        }
        Ok(())
    }

    fn broken(&self, position: usize, expected: String, found: String) -> Result<()> {
        error!(
            "🔗 Hash chain broken at span {} of trace {}",
            position, self.id
        );
        Err(Error::Integrity {
            position,
            expected,
            found,
        })
    }

    /// Inclusion proof of one span against the sealed merkle root
    pub fn merkle_proof(&self, position: usize) -> Option<Vec<ProofStep>> {
        let leaves: Vec<String> = self.spans.iter().map(|s| s.hash.clone()).collect();
        hasher::merkle_proof(&leaves, position)
    }
}
