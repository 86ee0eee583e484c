//! Pure decision logic for the idempotent event pipeline.
//!
//! Nothing in this crate performs I/O or reads the clock; callers pass
//! `now_ms` explicitly so every function here is deterministic.

pub mod canonical_key;
pub mod closure;
pub mod reason;
pub mod retry;

use chrono::{DateTime, Utc};
use mediator_contracts::EventType;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

pub use canonical_key::{resolve_canonical_key, CanonicalKey, KeySource, ResolveError};
pub use closure::{archive_record_key, closure_status, ClosureStatus, RecordStatus, RecordType};
pub use reason::{ArchiveReason, EmitKind, EmitReason, GateReason};
pub use retry::{BackoffSchedule, RetryBudget, RetryStep};

/// Bucket modulus for deterministic sampling (1 bucket = 1 basis point).
pub const SAMPLING_MODULUS: u32 = 10_000;

pub fn parse_rfc3339(ts: &str) -> Option<DateTime<Utc>> {
    chrono::DateTime::parse_from_rfc3339(ts)
        .ok()
        .map(|v| v.with_timezone(&Utc))
}

pub fn parse_rfc3339_ms(ts: &str) -> Option<i64> {
    parse_rfc3339(ts).map(|v| v.timestamp_millis())
}

/// SHA-256 over the RFC 8785 canonical form, so key order, whitespace and
/// number spelling never change the digest.
pub fn jcs_sha256_hex(value: &Value) -> Result<String, String> {
    let canonical = serde_jcs::to_string(value)
        .map_err(|err| format!("failed to canonicalize JSON via JCS: {err}"))?;
    Ok(sha256_hex(canonical.as_bytes()))
}

/// Serializes `value` and hashes its canonical JSON form.
pub fn content_hash<T: Serialize>(value: &T) -> Result<String, String> {
    let json = serde_json::to_value(value)
        .map_err(|err| format!("failed to serialize for content hash: {err}"))?;
    jcs_sha256_hex(&json)
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Full-length digest over NUL-separated parts.
pub fn sha256_parts_hex(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0]);
    }
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// `{prefix}:{sha256(parts)}`, used for emitter idempotency keys.
pub fn stable_key(prefix: &str, parts: &[&str]) -> String {
    format!("{prefix}:{}", sha256_parts_hex(parts))
}

/// Retention class of an event type; controls the dedup window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Layer {
    Billing,
    Diagnostics,
}

impl Layer {
    pub fn as_str(self) -> &'static str {
        match self {
            Layer::Billing => "billing",
            Layer::Diagnostics => "diagnostics",
        }
    }
}

pub fn classify_layer(event_type: EventType) -> Layer {
    match event_type {
        EventType::Impression | EventType::Click | EventType::Postback | EventType::Failure => {
            Layer::Billing
        }
        EventType::OpportunityCreated
        | EventType::AuctionStarted
        | EventType::AdFilled
        | EventType::Interaction
        | EventType::Error => Layer::Diagnostics,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DedupWindows {
    pub billing_ms: u64,
    pub diagnostics_ms: u64,
}

impl DedupWindows {
    pub fn window_ms(&self, layer: Layer) -> u64 {
        match layer {
            Layer::Billing => self.billing_ms,
            Layer::Diagnostics => self.diagnostics_ms,
        }
    }
}

impl Default for DedupWindows {
    fn default() -> Self {
        Self {
            billing_ms: 14 * 24 * 60 * 60 * 1000,
            diagnostics_ms: 3 * 24 * 60 * 60 * 1000,
        }
    }
}

/// `true` once strictly more than `window_ms` has passed since `since_ms`.
pub fn window_elapsed(since_ms: i64, now_ms: i64, window_ms: u64) -> bool {
    let age = now_ms.saturating_sub(since_ms);
    age > 0 && age as u64 > window_ms
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SamplingDecision {
    pub sampled_in: bool,
    pub bucket: u32,
    pub forced: bool,
}

/// Deterministic in/out decision for a trace under one sampling rule.
///
/// The bucket is the first 8 hex characters of
/// `sha256(traceKey|samplingRuleVersion)` read as a u32, reduced mod 10000.
pub fn compute_signal_sampling_decision(
    trace_key: &str,
    sampling_rule_version: &str,
    sample_rate_bps: u32,
    debug_force_sample: bool,
) -> SamplingDecision {
    let mut hasher = Sha256::new();
    hasher.update(format!("{trace_key}|{sampling_rule_version}").as_bytes());
    let digest = hasher.finalize();
    let head = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    let bucket = head % SAMPLING_MODULUS;
    SamplingDecision {
        sampled_in: debug_force_sample || bucket < sample_rate_bps,
        bucket,
        forced: debug_force_sample,
    }
}
