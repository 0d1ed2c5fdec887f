//! Glass Box - hash-chained, append-only decision records

pub mod hasher;
pub mod trace;
pub mod tracer;

use serde_json::Value;
use tracing::warn;

pub use hasher::{ProofStep, merkle_root, verify_merkle_proof};
pub use trace::{
    DecisionSpan, DecisionTrace, Metric, SpanKind, SpanOutcome, SpanStatus, TraceKind, TraceStatus,
};
pub use tracer::GlassBox;

/// Record one step on an optional trace. A failure drops the trace and the
/// caller carries on untraced.
pub fn record(
    trace: &mut Option<DecisionTrace>,
    name: &str,
    kind: SpanKind,
    input: Value,
    outcome: SpanOutcome,
) {
    let Some(t) = trace.as_mut() else {
        return;
    };
    if let Err(e) = t.record(name, kind, input, outcome) {
        warn!("⚠️ Tracing step '{}' failed, continuing untraced: {}", name, e);
        *trace = None;
    }
}
