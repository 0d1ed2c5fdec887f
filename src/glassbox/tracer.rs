//! Glass Box tracer - creates traces and persists sealed ones
//!
//! Callers treat every failure here as advisory: trading continues untraced.

use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::core::{Error, Result, Store};
use crate::glassbox::{DecisionTrace, TraceKind};
use crate::storage::{Table, WriteOp, WriteQueue};

pub struct GlassBox {
    store: Arc<dyn Store>,
    queue: Arc<WriteQueue>,
    enabled: AtomicBool,
}

impl GlassBox {
    pub fn new(store: Arc<dyn Store>, queue: Arc<WriteQueue>) -> Self {
        Self {
            store,
            queue,
            enabled: AtomicBool::new(true),
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn start(&self, kind: TraceKind, context: Value) -> Result<DecisionTrace> {
        if !self.enabled.load(Ordering::Relaxed) {
            return Err(Error::Tracer("glass box disabled".into()));
        }
        let trace = DecisionTrace::new(kind, context);
        debug!("🔍 Trace {} started ({})", trace.id, kind);
        Ok(trace)
    }

    /// Persist a sealed trace; a store failure hands it to the write queue.
    pub fn commit(&self, trace: &DecisionTrace) -> Result<()> {
        if !trace.is_sealed() {
            return Err(Error::Tracer(format!("trace {} is not sealed", trace.id)));
        }
        if let Err(e) = self.store.save_trace(trace) {
            warn!("⚠️ Trace {} not persisted ({}), queued for retry", trace.id, e);
            self.queue.enqueue(WriteOp::Create, Table::DecisionTraces, trace)?;
        }
        Ok(())
    }

    /// Load a stored trace and recompute its chain.
    pub fn verify(&self, id: Uuid) -> Result<()> {
        let trace = self
            .store
            .load_trace(id)?
            .ok_or_else(|| Error::Tracer(format!("trace {} not found", id)))?;
        trace.verify_chain()
    }
}
