//! Hashing primitives for the decision chain

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::glassbox::{DecisionSpan, DecisionTrace};

pub fn sha256_hex(data: impl AsRef<[u8]>) -> String {
    hex::encode(Sha256::digest(data.as_ref()))
}

pub(crate) fn timestamp(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Anchor the first span chains from
pub fn root_anchor(trace_id: Uuid, started_at: &DateTime<Utc>) -> String {
    sha256_hex(format!("ROOT:{}|START:{}", trace_id, timestamp(started_at)))
}

/// Canonical form of a sealed span. Field order is fixed.
pub fn canonical_span(trace_id: Uuid, span: &DecisionSpan) -> String {
    let sealed = span.ended_at.as_ref().map(timestamp).unwrap_or_default();
    format!(
        "TRACE:{}|POS:{}|NAME:{}|KIND:{}|TIME:{}|IN:{}|OUT:{}|STATUS:{}|REASON:{}|CONF:{:.2}|PREV:{}",
        trace_id,
        span.position,
        span.name,
        span.kind,
        sealed,
        span.input,
        span.output,
        span.status,
        span.reasoning,
        span.confidence,
        span.previous_hash,
    )
}

pub fn span_hash(trace_id: Uuid, span: &DecisionSpan) -> String {
    sha256_hex(canonical_span(trace_id, span))
}

/// Commits the sealed header: status, merkle root and the final verdict.
pub fn seal_hash(trace: &DecisionTrace) -> String {
    sha256_hex(format!(
        "SEAL:{}|STATUS:{}|MERKLE:{}|DECISION:{}|CONF:{}|ABORT:{}|END:{}",
        trace.id,
        trace.status,
        trace.merkle_root.as_deref().unwrap_or_default(),
        trace.final_decision.as_deref().unwrap_or_default(),
        trace.confidence.map(|c| format!("{:.4}", c)).unwrap_or_default(),
        trace.abort_reason.as_deref().unwrap_or_default(),
        trace.ended_at.as_ref().map(timestamp).unwrap_or_default(),
    ))
}

fn hash_pair(left: &str, right: &str) -> String {
    sha256_hex(format!("{}{}", left, right))
}

/// Pairwise SHA-256 up to a single root; an odd tail is paired with itself.
pub fn merkle_root(leaves: &[String]) -> Option<String> {
    if leaves.is_empty() {
        return None;
    }
    let mut level: Vec<String> = leaves.to_vec();
    while level.len() > 1 {
        if level.len() % 2 == 1 {
            if let Some(last) = level.last().cloned() {
                level.push(last);
            }
        }
        level = level
            .chunks(2)
            .map(|pair| hash_pair(&pair[0], &pair[1]))
            .collect();
    }
    level.pop()
}

/// One step of an inclusion proof
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofStep {
    pub sibling: String,
    pub sibling_on_left: bool,
}

pub fn merkle_proof(leaves: &[String], index: usize) -> Option<Vec<ProofStep>> {
    if index >= leaves.len() {
        return None;
    }
    let mut proof = Vec::new();
    let mut level: Vec<String> = leaves.to_vec();
    let mut idx = index;
    while level.len() > 1 {
        if level.len() % 2 == 1 {
            if let Some(last) = level.last().cloned() {
                level.push(last);
            }
        }
        let sibling_idx = idx ^ 1;
        proof.push(ProofStep {
            sibling: level[sibling_idx].clone(),
            sibling_on_left: sibling_idx < idx,
        });
        level = level
            .chunks(2)
            .map(|pair| hash_pair(&pair[0], &pair[1]))
            .collect();
        idx /= 2;
    }
    Some(proof)
}

pub fn verify_merkle_proof(leaf: &str, proof: &[ProofStep], root: &str) -> bool {
    let computed = proof.iter().fold(leaf.to_string(), |acc, step| {
        if step.sibling_on_left {
            hash_pair(&step.sibling, &acc)
        } else {
            hash_pair(&acc, &step.sibling)
        }
    });
    computed == root
}
