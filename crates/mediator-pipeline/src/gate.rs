//! Per-key dedup state machine over the shared store.

use std::sync::Arc;

use mediator_contracts::{AckStatus, IngestRequest};
use mediator_kernel::{
    classify_layer, content_hash, parse_rfc3339_ms, resolve_canonical_key, window_elapsed,
    CanonicalKey, DedupWindows, GateReason, KeySource, Layer,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn, Instrument};

use crate::observability::gate_span;
use crate::store::{Cas, KvStore, RecordStore};
use crate::{PipelineError, MAX_CAS_ATTEMPTS};

pub const DEDUP_NAMESPACE: &str = "dedup";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupState {
    New,
    InflightLocked,
    AcceptedCommitted,
    DuplicateInflight,
    DuplicateCommitted,
    RejectedConflict,
    Expired,
}

impl DedupState {
    pub fn as_str(self) -> &'static str {
        match self {
            DedupState::New => "new",
            DedupState::InflightLocked => "inflight_locked",
            DedupState::AcceptedCommitted => "accepted_committed",
            DedupState::DuplicateInflight => "duplicate_inflight",
            DedupState::DuplicateCommitted => "duplicate_committed",
            DedupState::RejectedConflict => "rejected_conflict",
            DedupState::Expired => "expired",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DedupTransition {
    pub from: DedupState,
    pub to: DedupState,
    pub at_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DedupRecord {
    pub canonical_key: String,
    pub key_source: KeySource,
    pub layer: Layer,
    pub state: DedupState,
    pub payload_hash: String,
    #[serde(default)]
    pub locked_at_ms: Option<i64>,
    #[serde(default)]
    pub committed_at_ms: Option<i64>,
    /// Bumped on every claim; a commit must present the epoch it claimed.
    pub lock_epoch: u64,
    pub dedup_fingerprint_version: String,
    #[serde(default)]
    pub history: Vec<DedupTransition>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Open,
    Inflight { locked_at_ms: i64 },
    Committed { committed_at_ms: i64 },
}

impl DedupRecord {
    fn first_sighting(
        key: &CanonicalKey,
        layer: Layer,
        payload_hash: &str,
        dedup_fingerprint_version: &str,
    ) -> Self {
        Self {
            canonical_key: key.key.clone(),
            key_source: key.source,
            layer,
            state: DedupState::New,
            payload_hash: payload_hash.to_string(),
            locked_at_ms: None,
            committed_at_ms: None,
            lock_epoch: 0,
            dedup_fingerprint_version: dedup_fingerprint_version.to_string(),
            history: Vec::new(),
        }
    }

    // Duplicate and conflict markers leave the underlying lock/commit intact,
    // so the phase comes from the timestamps.
    fn phase(&self) -> Phase {
        match (self.state, self.committed_at_ms, self.locked_at_ms) {
            (DedupState::New | DedupState::Expired, _, _) => Phase::Open,
            (_, Some(committed_at_ms), _) => Phase::Committed { committed_at_ms },
            (_, None, Some(locked_at_ms)) => Phase::Inflight { locked_at_ms },
            (_, None, None) => Phase::Open,
        }
    }

    fn transition(&mut self, to: DedupState, at_ms: i64, reason: Option<GateReason>) {
        self.history.push(DedupTransition {
            from: self.state,
            to,
            at_ms,
            reason_code: reason.map(|r| r.as_str().to_string()),
        });
        self.state = to;
    }

    fn claim(&mut self, now_ms: i64) {
        self.lock_epoch += 1;
        self.locked_at_ms = Some(now_ms);
        self.committed_at_ms = None;
        self.transition(
            DedupState::InflightLocked,
            now_ms,
            Some(GateReason::InflightLocked),
        );
    }
}

#[derive(Debug, Clone)]
pub struct GateConfig {
    pub inflight_lock_ttl_ms: u64,
    pub windows: DedupWindows,
    pub dedup_fingerprint_version: String,
}

impl GateConfig {
    pub fn from_config(cfg: &mediator_config::Gate) -> Self {
        Self {
            inflight_lock_ttl_ms: cfg.inflight_lock_ttl_ms,
            windows: DedupWindows {
                billing_ms: cfg.billing_window_ms,
                diagnostics_ms: cfg.diagnostics_window_ms,
            },
            dedup_fingerprint_version: cfg.dedup_fingerprint_version.clone(),
        }
    }
}

impl Default for GateConfig {
    fn default() -> Self {
        Self::from_config(&mediator_config::Gate::default())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GateOutcome {
    pub ok: bool,
    pub ack_status: AckStatus,
    pub retryable: bool,
    pub reason_code: GateReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub canonical_dedup_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_source: Option<KeySource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub layer: Option<Layer>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<DedupState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dedup_fingerprint_version: Option<String>,
    /// Present only after a successful claim; pass it to `commit`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock_token: Option<u64>,
}

impl GateOutcome {
    fn rejected(reason: GateReason, key: Option<&CanonicalKey>, retryable: bool) -> Self {
        Self {
            ok: false,
            ack_status: AckStatus::Rejected,
            retryable,
            reason_code: reason,
            canonical_dedup_key: key.map(|k| k.key.clone()),
            key_source: key.map(|k| k.source),
            layer: None,
            state: None,
            dedup_fingerprint_version: None,
            lock_token: None,
        }
    }

    fn for_record(record: &DedupRecord, ack_status: AckStatus, reason: GateReason) -> Self {
        let ok = ack_status != AckStatus::Rejected;
        Self {
            ok,
            ack_status,
            retryable: false,
            reason_code: reason,
            canonical_dedup_key: Some(record.canonical_key.clone()),
            key_source: Some(record.key_source),
            layer: Some(record.layer),
            state: Some(record.state),
            dedup_fingerprint_version: ok.then(|| record.dedup_fingerprint_version.clone()),
            lock_token: None,
        }
    }
}

enum Verdict {
    Claimed,
    Conflict,
    DuplicateInflight,
    DuplicateCommitted,
}

enum Admission {
    Decided(GateOutcome),
    Claimed { record: DedupRecord, token: u64 },
}

pub struct IdempotencyGate {
    records: RecordStore<DedupRecord>,
    config: GateConfig,
}

impl IdempotencyGate {
    pub fn new(store: Arc<dyn KvStore>, config: GateConfig) -> Self {
        Self {
            records: RecordStore::new(store, DEDUP_NAMESPACE),
            config,
        }
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    /// Claims and commits in one call for callers with no work in between.
    pub async fn evaluate(
        &self,
        request: &IngestRequest,
        now_ms: i64,
    ) -> Result<GateOutcome, PipelineError> {
        let span = gate_span("evaluate", &request.app_id, &request.batch_id);
        async move {
            match self.admit(request, now_ms).await? {
                Admission::Decided(outcome) => Ok(outcome),
                Admission::Claimed { record, token } => {
                    self.commit(&record.canonical_key, token, now_ms).await
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Claims the key and leaves it `inflight_locked`.
    ///
    /// The returned `lock_token` must be handed back to [`Self::commit`]. If the
    /// caller never commits, the lock expires after the configured TTL and the
    /// next sighting of the key claims it again.
    pub async fn begin_in_flight(
        &self,
        request: &IngestRequest,
        now_ms: i64,
    ) -> Result<GateOutcome, PipelineError> {
        let span = gate_span("begin_in_flight", &request.app_id, &request.batch_id);
        async move {
            match self.admit(request, now_ms).await? {
                Admission::Decided(outcome) => Ok(outcome),
                Admission::Claimed { record, token } => {
                    let mut outcome = GateOutcome::for_record(
                        &record,
                        AckStatus::Accepted,
                        GateReason::InflightLocked,
                    );
                    outcome.lock_token = Some(token);
                    Ok(outcome)
                }
            }
        }
        .instrument(span)
        .await
    }

    pub async fn commit(
        &self,
        canonical_key: &str,
        lock_token: u64,
        now_ms: i64,
    ) -> Result<GateOutcome, PipelineError> {
        // Marker writers try at most once per call, so every round lost here
        // is paid for by another caller's write and the holder gets through.
        let mut lost_rounds = 0u32;
        loop {
            let Some((mut record, version)) = self.records.load(canonical_key).await? else {
                warn!(canonical_key, "commit without any dedup record");
                let mut outcome = GateOutcome::rejected(GateReason::CommitWithoutLock, None, false);
                outcome.canonical_dedup_key = Some(canonical_key.to_string());
                return Ok(outcome);
            };

            let phase = record.phase();
            if phase == Phase::Open {
                warn!(canonical_key, state = record.state.as_str(), "commit without lock");
                return Ok(GateOutcome::for_record(
                    &record,
                    AckStatus::Rejected,
                    GateReason::CommitWithoutLock,
                ));
            }
            if record.lock_epoch != lock_token {
                warn!(
                    canonical_key,
                    presented = lock_token,
                    current = record.lock_epoch,
                    "dedup lock was taken over"
                );
                let mut outcome =
                    GateOutcome::for_record(&record, AckStatus::Rejected, GateReason::LockLost);
                outcome.retryable = true;
                return Ok(outcome);
            }
            if let Phase::Committed { .. } = phase {
                return Ok(GateOutcome::for_record(
                    &record,
                    AckStatus::Duplicate,
                    GateReason::CommittedDuplicate,
                ));
            }

            record.committed_at_ms = Some(now_ms);
            record.transition(
                DedupState::AcceptedCommitted,
                now_ms,
                Some(GateReason::Accepted),
            );
            match self.records.replace(canonical_key, &record, version).await? {
                Cas::Written => {
                    info!(
                        canonical_key,
                        reason_code = GateReason::Accepted.as_str(),
                        "dedup record committed"
                    );
                    return Ok(GateOutcome::for_record(
                        &record,
                        AckStatus::Accepted,
                        GateReason::Accepted,
                    ));
                }
                Cas::Lost(_) => {
                    lost_rounds += 1;
                    debug!(canonical_key, lost_rounds, "commit lost a race, re-reading");
                }
            }
        }
    }

    /// Stored record for audit; never mutates.
    pub async fn replay(&self, canonical_key: &str) -> Result<Option<DedupRecord>, PipelineError> {
        Ok(self
            .records
            .load(canonical_key)
            .await?
            .map(|(record, _)| record))
    }

    async fn admit(
        &self,
        request: &IngestRequest,
        now_ms: i64,
    ) -> Result<Admission, PipelineError> {
        let key = match resolve_canonical_key(
            &request.app_id,
            &request.batch_id,
            &request.event,
            request.global_unique_verified,
        ) {
            Ok(key) => key,
            Err(err) => {
                warn!(reason_code = err.reason().as_str(), error = %err, "event identity rejected");
                return Ok(Admission::Decided(GateOutcome::rejected(
                    err.reason(),
                    None,
                    false,
                )));
            }
        };

        let layer = classify_layer(request.event.event_type);
        let Some(event_at_ms) = parse_rfc3339_ms(&request.event.event_at) else {
            return Ok(Admission::Decided(GateOutcome::rejected(
                GateReason::EventAtInvalid,
                Some(&key),
                false,
            )));
        };
        if window_elapsed(event_at_ms, now_ms, self.config.windows.window_ms(layer)) {
            info!(
                canonical_key = %key.key,
                layer = layer.as_str(),
                reason_code = GateReason::EventStale.as_str(),
                "event outside dedup window"
            );
            let mut outcome = GateOutcome::rejected(GateReason::EventStale, Some(&key), false);
            outcome.layer = Some(layer);
            return Ok(Admission::Decided(outcome));
        }

        let payload_hash =
            content_hash(&request.event).map_err(PipelineError::Serialization)?;

        for _ in 0..MAX_CAS_ATTEMPTS {
            let existing = self.records.load(&key.key).await?;
            let previous = existing.as_ref().map(|(r, v)| (r.state, *v));
            let (record, verdict) =
                self.next_record(existing.map(|(r, _)| r), &key, layer, &payload_hash, now_ms);

            let outcome = match verdict {
                Verdict::Claimed => {
                    let written = match previous {
                        None => self.records.insert_new(&key.key, &record).await?,
                        Some((_, version)) => {
                            self.records.replace(&key.key, &record, version).await?
                        }
                    };
                    if let Cas::Lost(_) = written {
                        debug!(canonical_key = %key.key, "dedup claim lost a race, re-classifying");
                        continue;
                    }
                    let token = record.lock_epoch;
                    debug!(canonical_key = %key.key, lock_token = token, "dedup key claimed");
                    return Ok(Admission::Claimed { record, token });
                }
                Verdict::Conflict => GateOutcome::for_record(
                    &record,
                    AckStatus::Rejected,
                    GateReason::PayloadConflict,
                ),
                Verdict::DuplicateInflight => GateOutcome::for_record(
                    &record,
                    AckStatus::Duplicate,
                    GateReason::InflightDuplicate,
                ),
                Verdict::DuplicateCommitted => GateOutcome::for_record(
                    &record,
                    AckStatus::Duplicate,
                    GateReason::CommittedDuplicate,
                ),
            };
            if let Some((previous_state, version)) = previous {
                self.mark(&record, previous_state, version).await?;
            }
            info!(
                canonical_key = %key.key,
                state = record.state.as_str(),
                reason_code = outcome.reason_code.as_str(),
                "dedup decision"
            );
            return Ok(Admission::Decided(outcome));
        }

        Err(PipelineError::Contention {
            key: key.key,
            attempts: MAX_CAS_ATTEMPTS,
        })
    }

    /// Records a duplicate or conflict marker in the history.
    ///
    /// The verdict does not depend on this write, so it is tried once and
    /// dropped on a lost race. A repeat of the current marker is not written
    /// at all, which keeps a burst of duplicates from churning the version
    /// the lock holder commits against.
    async fn mark(
        &self,
        record: &DedupRecord,
        previous_state: DedupState,
        version: u64,
    ) -> Result<(), PipelineError> {
        if previous_state == record.state {
            return Ok(());
        }
        if let Cas::Lost(_) = self
            .records
            .replace(&record.canonical_key, record, version)
            .await?
        {
            debug!(
                canonical_key = %record.canonical_key,
                state = record.state.as_str(),
                "dedup marker dropped after a lost race"
            );
        }
        Ok(())
    }

    fn next_record(
        &self,
        existing: Option<DedupRecord>,
        key: &CanonicalKey,
        layer: Layer,
        payload_hash: &str,
        now_ms: i64,
    ) -> (DedupRecord, Verdict) {
        let Some(mut record) = existing else {
            let mut record = DedupRecord::first_sighting(
                key,
                layer,
                payload_hash,
                &self.config.dedup_fingerprint_version,
            );
            record.claim(now_ms);
            return (record, Verdict::Claimed);
        };

        // An elapsed window frees the key before any payload comparison.
        if let Phase::Committed { committed_at_ms } = record.phase() {
            if window_elapsed(
                committed_at_ms,
                now_ms,
                self.config.windows.window_ms(record.layer),
            ) {
                record.transition(DedupState::Expired, now_ms, None);
                record.payload_hash = payload_hash.to_string();
                record.layer = layer;
                record.key_source = key.source;
                record.dedup_fingerprint_version = self.config.dedup_fingerprint_version.clone();
                record.claim(now_ms);
                return (record, Verdict::Claimed);
            }
        }

        if record.payload_hash != payload_hash {
            record.transition(
                DedupState::RejectedConflict,
                now_ms,
                Some(GateReason::PayloadConflict),
            );
            return (record, Verdict::Conflict);
        }

        match record.phase() {
            Phase::Inflight { locked_at_ms }
                if !window_elapsed(locked_at_ms, now_ms, self.config.inflight_lock_ttl_ms) =>
            {
                record.transition(
                    DedupState::DuplicateInflight,
                    now_ms,
                    Some(GateReason::InflightDuplicate),
                );
                (record, Verdict::DuplicateInflight)
            }
            Phase::Committed { .. } => {
                record.transition(
                    DedupState::DuplicateCommitted,
                    now_ms,
                    Some(GateReason::CommittedDuplicate),
                );
                (record, Verdict::DuplicateCommitted)
            }
            Phase::Inflight { .. } | Phase::Open => {
                record.claim(now_ms);
                (record, Verdict::Claimed)
            }
        }
    }
}
