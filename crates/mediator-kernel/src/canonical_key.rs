use mediator_contracts::{EventEnvelope, EventIdScope, EventType, NOT_APPLICABLE};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::reason::GateReason;
use crate::sha256_hex;

pub const DEDUP_KEY_PREFIX: &str = "f_dedup_v1";

const IDEMPOTENCY_KEY_LEN: std::ops::RangeInclusive<usize> = 8..=200;
const EVENT_ID_LEN: std::ops::RangeInclusive<usize> = 1..=128;

/// Which rung of the priority chain produced the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeySource {
    ClientIdempotency,
    ClientEventId,
    Computed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalKey {
    pub key: String,
    pub source: KeySource,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("eventId declared global_unique without out-of-band verification")]
    GlobalUniquenessUnverified,
    #[error("no client identity and computed fallback is missing {missing}")]
    InvalidNoFallback { missing: &'static str },
}

impl ResolveError {
    pub fn reason(&self) -> GateReason {
        match self {
            ResolveError::GlobalUniquenessUnverified => GateReason::GlobalUniquenessUnverified,
            ResolveError::InvalidNoFallback { .. } => GateReason::InvalidNoFallback,
        }
    }
}

/// Derives the canonical dedup key for one inbound event.
///
/// Client-declared identity wins over computed identity. A syntactically
/// invalid client token is ignored rather than rejected, so the chain falls
/// through to the next rung.
pub fn resolve_canonical_key(
    app_id: &str,
    batch_id: &str,
    event: &EventEnvelope,
    global_unique_verified: bool,
) -> Result<CanonicalKey, ResolveError> {
    if let Some(idempotency_key) = event
        .idempotency_key
        .as_deref()
        .filter(|v| is_valid_token(v, IDEMPOTENCY_KEY_LEN))
    {
        return Ok(CanonicalKey {
            key: format!("{DEDUP_KEY_PREFIX}:client_idempotency:{app_id}|{idempotency_key}"),
            source: KeySource::ClientIdempotency,
        });
    }

    if let Some(event_id) = event
        .event_id
        .as_deref()
        .filter(|v| is_valid_token(v, EVENT_ID_LEN))
    {
        let key = match event.event_id_scope {
            Some(EventIdScope::GlobalUnique) => {
                if !global_unique_verified {
                    return Err(ResolveError::GlobalUniquenessUnverified);
                }
                format!("{DEDUP_KEY_PREFIX}:client_event_id:{app_id}|global|{event_id}")
            }
            Some(EventIdScope::BatchScoped) | None => {
                format!("{DEDUP_KEY_PREFIX}:client_event_id:{app_id}|{batch_id}|{event_id}")
            }
        };
        return Ok(CanonicalKey {
            key,
            source: KeySource::ClientEventId,
        });
    }

    let request_key = required(&event.request_key, "requestKey")?;
    let attempt_key = required(&event.attempt_key, "attemptKey")?;
    let opportunity_key = required(&event.opportunity_key, "opportunityKey")?;
    let digest = semantic_payload_digest(event).ok_or(ResolveError::InvalidNoFallback {
        missing: "semantic payload digest",
    })?;

    let material = [
        app_id,
        event.event_type.as_str(),
        request_key,
        attempt_key,
        opportunity_key,
        non_empty(&event.response_reference).unwrap_or(NOT_APPLICABLE),
        non_empty(&event.render_attempt_id).unwrap_or(NOT_APPLICABLE),
        digest.as_str(),
    ]
    .join("|");

    Ok(CanonicalKey {
        key: format!(
            "{DEDUP_KEY_PREFIX}:computed:{}",
            sha256_hex(material.as_bytes())
        ),
        source: KeySource::Computed,
    })
}

/// Joins the semantically load-bearing fields for the event type.
///
/// Returns `None` when any of them is absent, since a partial digest would let
/// distinct events collide.
pub fn semantic_payload_digest(event: &EventEnvelope) -> Option<String> {
    let seq = event.event_seq.map(|v| v.to_string());
    let parts: Vec<Option<&str>> = match event.event_type {
        EventType::OpportunityCreated => vec![non_empty(&event.placement_id), seq.as_deref()],
        EventType::AuctionStarted => vec![non_empty(&event.auction_id), seq.as_deref()],
        EventType::AdFilled => vec![non_empty(&event.creative_id), seq.as_deref()],
        EventType::Impression => vec![
            non_empty(&event.render_attempt_id),
            non_empty(&event.creative_id),
            seq.as_deref(),
        ],
        EventType::Click => vec![
            non_empty(&event.render_attempt_id),
            non_empty(&event.click_target),
            seq.as_deref(),
        ],
        EventType::Interaction => vec![
            non_empty(&event.render_attempt_id),
            non_empty(&event.interaction_type),
            seq.as_deref(),
        ],
        EventType::Postback => vec![
            non_empty(&event.postback_type),
            non_empty(&event.postback_status),
            seq.as_deref(),
        ],
        EventType::Error => vec![non_empty(&event.error_code), seq.as_deref()],
        EventType::Failure => vec![non_empty(&event.failure_code), seq.as_deref()],
    };
    let parts: Option<Vec<&str>> = parts.into_iter().collect();
    parts.map(|p| p.join("|")).filter(|d| !d.is_empty())
}

fn is_valid_token(value: &str, len: std::ops::RangeInclusive<usize>) -> bool {
    len.contains(&value.len())
        && value
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b':' | b'-'))
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.trim().is_empty())
}

fn required<'a>(
    value: &'a Option<String>,
    field: &'static str,
) -> Result<&'a str, ResolveError> {
    non_empty(value).ok_or(ResolveError::InvalidNoFallback { missing: field })
}
