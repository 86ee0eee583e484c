//! Idempotent archive records with a bounded compensation protocol.
//!
//! `build_archive_records` only stages records as `new`. The real sink
//! reports back through `apply_archive_write_outcome`, which moves a record
//! to `committed`, keeps it `new` with a backoff, or gives up and marks it
//! `conflicted`.

use std::sync::Arc;

use async_trait::async_trait;
use mediator_contracts::{MappingResult, VersionAnchors};
use mediator_kernel::{
    archive_record_key, closure_status, jcs_sha256_hex, stable_key, window_elapsed,
    ArchiveReason, BackoffSchedule, ClosureStatus, RecordStatus, RecordType,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn, Instrument};

use crate::observability::archive_span;
use crate::runtime::{Clock, Scheduler, SystemClock, TokioScheduler};
use crate::store::{Cas, KvStore, RecordStore};
use crate::{PipelineError, MAX_CAS_ATTEMPTS};

pub const ARCHIVE_NAMESPACE: &str = "archive";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationKeys {
    pub closure_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub billing_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribution_key: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryState {
    pub next_backoff_sec: u64,
    pub failure_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_failure_at_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveRecord {
    pub record_key: String,
    pub record_type: RecordType,
    pub payload_key: String,
    pub canonical_dedup_key: String,
    pub record_status: RecordStatus,
    /// Immutable once the record exists.
    pub payload_digest: String,
    pub payload: Value,
    pub relation_keys: RelationKeys,
    pub version_anchors: VersionAnchors,
    pub retry_state: RetryState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason_code: Option<String>,
    #[serde(default)]
    pub created_at_ms: i64,
    #[serde(default)]
    pub updated_at_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkFailure {
    RateLimited,
    Timeout,
    TemporarilyUnavailable,
    /// Not retryable; carries the sink's own code.
    Rejected(String),
}

impl SinkFailure {
    pub fn retryable(&self) -> bool {
        match self {
            SinkFailure::RateLimited | SinkFailure::Timeout | SinkFailure::TemporarilyUnavailable => {
                true
            }
            SinkFailure::Rejected(_) => false,
        }
    }

    pub fn code(&self) -> &str {
        match self {
            SinkFailure::RateLimited => "rate_limited",
            SinkFailure::Timeout => "timeout",
            SinkFailure::TemporarilyUnavailable => "temporarily_unavailable",
            SinkFailure::Rejected(code) => code,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkOutcome {
    Committed,
    Failed(SinkFailure),
}

/// The durable archive a staged record is eventually written to.
#[async_trait]
pub trait ArchiveSink: Send + Sync + 'static {
    async fn write(&self, record: &ArchiveRecord) -> SinkOutcome;
}

#[derive(Debug, Clone)]
pub struct ArchiveConfig {
    pub backoff_schedule_sec: Vec<u64>,
    pub compensation_window_ms: u64,
}

impl ArchiveConfig {
    pub fn from_config(cfg: &mediator_config::Archive) -> Self {
        Self {
            backoff_schedule_sec: cfg.backoff_schedule_sec.clone(),
            compensation_window_ms: cfg.compensation_window_ms,
        }
    }
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self::from_config(&mediator_config::Archive::default())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveEntry {
    pub record_key: String,
    pub record_type: RecordType,
    pub payload_key: String,
    /// Outcome of this call, which may differ from the stored status.
    pub status: RecordStatus,
    pub reason_code: ArchiveReason,
    pub record: ArchiveRecord,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveBuildResult {
    pub ok: bool,
    pub reason_code: ArchiveReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub records: Vec<ArchiveEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub closure_status: Option<ClosureStatus>,
}

impl ArchiveBuildResult {
    fn rejected(reason: ArchiveReason, detail: String) -> Self {
        Self {
            ok: false,
            reason_code: reason,
            detail: Some(detail),
            records: Vec::new(),
            closure_status: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteOutcomeResult {
    pub record_key: String,
    pub reason_code: ArchiveReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_status: Option<RecordStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record: Option<ArchiveRecord>,
}

impl WriteOutcomeResult {
    fn for_record(record: ArchiveRecord, reason: ArchiveReason) -> Self {
        Self {
            record_key: record.record_key.clone(),
            reason_code: reason,
            record_status: Some(record.record_status),
            record: Some(record),
        }
    }
}

struct Staged {
    record_type: RecordType,
    payload_key: String,
    payload: Value,
}

pub struct ArchiveBuilder {
    records: RecordStore<ArchiveRecord>,
    clock: Arc<dyn Clock>,
    scheduler: Arc<dyn Scheduler>,
    config: ArchiveConfig,
}

impl ArchiveBuilder {
    pub fn new(store: Arc<dyn KvStore>, config: ArchiveConfig) -> Self {
        Self {
            records: RecordStore::new(store, ARCHIVE_NAMESPACE),
            clock: Arc::new(SystemClock),
            scheduler: Arc::new(TokioScheduler),
            config,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// Stages one decision audit plus its facts under `canonical_dedup_key`.
    ///
    /// Anchors and payload keys are checked for the whole batch before any
    /// write, so a rejected batch leaves the store untouched.
    pub async fn build_archive_records(
        &self,
        canonical_dedup_key: &str,
        mapping: &MappingResult,
        anchors: &VersionAnchors,
        now_ms: i64,
    ) -> Result<ArchiveBuildResult, PipelineError> {
        let span = archive_span("build_archive_records");
        async move {
            let missing = anchors.missing();
            if !missing.is_empty() {
                warn!(
                    missing = ?missing,
                    reason_code = ArchiveReason::MissingVersionAnchor.as_str(),
                    "archive batch rejected"
                );
                return Ok(ArchiveBuildResult::rejected(
                    ArchiveReason::MissingVersionAnchor,
                    format!("missing version anchors: {}", missing.join(", ")),
                ));
            }
            if canonical_dedup_key.trim().is_empty() {
                return Ok(ArchiveBuildResult::rejected(
                    ArchiveReason::PayloadKeyMissing,
                    "canonicalDedupKey is blank".to_string(),
                ));
            }
            let staged = match stage(mapping) {
                Ok(staged) => staged,
                Err(detail) => {
                    warn!(
                        detail = %detail,
                        reason_code = ArchiveReason::PayloadKeyMissing.as_str(),
                        "archive batch rejected"
                    );
                    return Ok(ArchiveBuildResult::rejected(
                        ArchiveReason::PayloadKeyMissing,
                        detail,
                    ));
                }
            };

            // Both anchors were checked above.
            let archive_version = anchors.archive_contract_version.clone().unwrap_or_default();
            let closure_key = stable_key(
                "g_closure",
                &[
                    canonical_dedup_key,
                    anchors.closure_rule_version.as_deref().unwrap_or_default(),
                ],
            );

            let mut entries = Vec::with_capacity(staged.len());
            for item in staged {
                let record_key = archive_record_key(
                    item.record_type,
                    &item.payload_key,
                    canonical_dedup_key,
                    &archive_version,
                );
                let payload_digest =
                    jcs_sha256_hex(&item.payload).map_err(PipelineError::Serialization)?;
                let candidate = ArchiveRecord {
                    record_key: record_key.clone(),
                    record_type: item.record_type,
                    payload_key: item.payload_key.clone(),
                    canonical_dedup_key: canonical_dedup_key.to_string(),
                    record_status: RecordStatus::New,
                    payload_digest,
                    relation_keys: RelationKeys {
                        closure_key: closure_key.clone(),
                        billing_key: string_field(&item.payload, "billingKey"),
                        attribution_key: string_field(&item.payload, "attributionKey"),
                    },
                    payload: item.payload,
                    version_anchors: anchors.clone(),
                    retry_state: RetryState::default(),
                    reason_code: Some(ArchiveReason::RecordNew.as_str().to_string()),
                    created_at_ms: now_ms,
                    updated_at_ms: now_ms,
                };
                entries.push(self.upsert(candidate).await?);
            }

            let mismatch = entries
                .iter()
                .any(|e| e.reason_code == ArchiveReason::RecordKeyPayloadMismatch);
            let reason_code = if mismatch {
                ArchiveReason::RecordKeyPayloadMismatch
            } else if entries.iter().any(|e| e.status == RecordStatus::New) {
                ArchiveReason::RecordNew
            } else {
                ArchiveReason::RecordDuplicate
            };
            let closure = closure_status(entries.iter().map(|e| {
                let status = if e.status == RecordStatus::Conflicted {
                    RecordStatus::Conflicted
                } else {
                    e.record.record_status
                };
                (e.record_type, status)
            }));
            info!(
                records = entries.len(),
                reason_code = reason_code.as_str(),
                closure_status = ?closure,
                "archive batch staged"
            );
            Ok(ArchiveBuildResult {
                ok: !mismatch,
                reason_code,
                detail: None,
                records: entries,
                closure_status: Some(closure),
            })
        }
        .instrument(span)
        .await
    }

    pub async fn apply_archive_write_outcome(
        &self,
        record_key: &str,
        outcome: &SinkOutcome,
        now_ms: i64,
    ) -> Result<WriteOutcomeResult, PipelineError> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let Some((mut record, version)) = self.records.load(record_key).await? else {
                return Ok(WriteOutcomeResult {
                    record_key: record_key.to_string(),
                    reason_code: ArchiveReason::RecordNotFound,
                    record_status: None,
                    record: None,
                });
            };
            if record.record_status.is_terminal() {
                debug!(record_key, "write outcome for terminal record ignored");
                return Ok(WriteOutcomeResult::for_record(
                    record,
                    ArchiveReason::RecordAlreadyTerminal,
                ));
            }

            let reason = self.next_state(&mut record, outcome, now_ms);
            record.reason_code = Some(reason.as_str().to_string());
            record.updated_at_ms = now_ms;
            match self.records.replace(record_key, &record, version).await? {
                Cas::Written => {
                    match reason {
                        ArchiveReason::ArchiveRetryScheduled => debug!(
                            record_key,
                            failures = record.retry_state.failure_count,
                            next_backoff_sec = record.retry_state.next_backoff_sec,
                            "archive write retry scheduled"
                        ),
                        ArchiveReason::ArchiveCommitted => {
                            info!(record_key, "archive record committed")
                        }
                        _ => warn!(
                            record_key,
                            reason_code = reason.as_str(),
                            "archive record conflicted"
                        ),
                    }
                    return Ok(WriteOutcomeResult::for_record(record, reason));
                }
                Cas::Lost(_) => continue,
            }
        }
        Err(PipelineError::Contention {
            key: record_key.to_string(),
            attempts: MAX_CAS_ATTEMPTS,
        })
    }

    fn next_state(
        &self,
        record: &mut ArchiveRecord,
        outcome: &SinkOutcome,
        now_ms: i64,
    ) -> ArchiveReason {
        let failure = match outcome {
            SinkOutcome::Committed => {
                record.record_status = RecordStatus::Committed;
                record.retry_state.next_backoff_sec = 0;
                return ArchiveReason::ArchiveCommitted;
            }
            SinkOutcome::Failed(failure) => failure,
        };

        let retry = &mut record.retry_state;
        retry.failure_count += 1;
        retry.last_failure_code = Some(failure.code().to_string());
        let first_failure_at_ms = *retry.first_failure_at_ms.get_or_insert(now_ms);

        if !failure.retryable() {
            record.record_status = RecordStatus::Conflicted;
            return ArchiveReason::ArchiveWriteRejected;
        }
        if window_elapsed(first_failure_at_ms, now_ms, self.config.compensation_window_ms) {
            record.record_status = RecordStatus::Conflicted;
            return ArchiveReason::CompensationExhausted;
        }
        retry.next_backoff_sec =
            BackoffSchedule::new(self.config.backoff_schedule_sec.clone())
                .delay_after(retry.failure_count);
        ArchiveReason::ArchiveRetryScheduled
    }

    /// Stored record for audit; never mutates.
    pub async fn replay_record(
        &self,
        record_key: &str,
    ) -> Result<Option<ArchiveRecord>, PipelineError> {
        Ok(self.records.load(record_key).await?.map(|(record, _)| record))
    }

    /// Closure verdict over the current stored statuses. Unknown keys count
    /// as pending.
    pub async fn batch_closure_status(
        &self,
        record_keys: &[String],
    ) -> Result<ClosureStatus, PipelineError> {
        let mut statuses = Vec::with_capacity(record_keys.len());
        for key in record_keys {
            match self.records.load(key).await? {
                Some((record, _)) => statuses.push((record.record_type, record.record_status)),
                None => statuses.push((RecordType::DecisionAudit, RecordStatus::New)),
            }
        }
        Ok(closure_status(statuses))
    }

    /// Writes one staged record through `sink` until it is terminal, sleeping
    /// the scheduled backoff between attempts.
    pub async fn flush_record(
        &self,
        record_key: &str,
        sink: &dyn ArchiveSink,
    ) -> Result<WriteOutcomeResult, PipelineError> {
        let span = archive_span("flush_record");
        async move {
            loop {
                let Some(record) = self.replay_record(record_key).await? else {
                    return Ok(WriteOutcomeResult {
                        record_key: record_key.to_string(),
                        reason_code: ArchiveReason::RecordNotFound,
                        record_status: None,
                        record: None,
                    });
                };
                if record.record_status.is_terminal() {
                    return Ok(WriteOutcomeResult::for_record(
                        record,
                        ArchiveReason::RecordAlreadyTerminal,
                    ));
                }

                let outcome = sink.write(&record).await;
                let result = self
                    .apply_archive_write_outcome(record_key, &outcome, self.clock.now_ms())
                    .await?;
                if result.reason_code != ArchiveReason::ArchiveRetryScheduled {
                    return Ok(result);
                }
                let delay_sec = result
                    .record
                    .as_ref()
                    .map(|r| r.retry_state.next_backoff_sec)
                    .unwrap_or_default();
                self.scheduler.sleep_ms(delay_sec.saturating_mul(1_000)).await;
            }
        }
        .instrument(span)
        .await
    }

    async fn upsert(&self, candidate: ArchiveRecord) -> Result<ArchiveEntry, PipelineError> {
        let record_key = candidate.record_key.clone();
        let entry = |record: ArchiveRecord, status: RecordStatus, reason: ArchiveReason| {
            ArchiveEntry {
                record_key: record_key.clone(),
                record_type: candidate.record_type,
                payload_key: candidate.payload_key.clone(),
                status,
                reason_code: reason,
                record,
            }
        };

        let existing = match self.records.insert_new(&record_key, &candidate).await? {
            Cas::Written => {
                debug!(record_key = %record_key, "archive record staged");
                return Ok(entry(
                    candidate.clone(),
                    RecordStatus::New,
                    ArchiveReason::RecordNew,
                ));
            }
            Cas::Lost(Some((existing, _))) => existing,
            Cas::Lost(None) => {
                return Err(PipelineError::Contention {
                    key: record_key.clone(),
                    attempts: 1,
                })
            }
        };

        if existing.payload_digest == candidate.payload_digest {
            Ok(entry(
                existing,
                RecordStatus::Duplicate,
                ArchiveReason::RecordDuplicate,
            ))
        } else {
            warn!(
                record_key = %record_key,
                reason_code = ArchiveReason::RecordKeyPayloadMismatch.as_str(),
                "archive record key reused with a different payload"
            );
            Ok(entry(
                existing,
                RecordStatus::Conflicted,
                ArchiveReason::RecordKeyPayloadMismatch,
            ))
        }
    }
}

fn stage(mapping: &MappingResult) -> Result<Vec<Staged>, String> {
    let groups: [(RecordType, Vec<&Value>); 3] = [
        (
            RecordType::DecisionAudit,
            mapping.fact_decision_audit_lite.iter().collect(),
        ),
        (RecordType::BillableFact, mapping.billable_facts.iter().collect()),
        (
            RecordType::AttributionFact,
            mapping.attribution_facts.iter().collect(),
        ),
    ];
    let mut staged = Vec::new();
    for (record_type, payloads) in groups {
        let field = record_type.payload_key_field();
        for (index, payload) in payloads.into_iter().enumerate() {
            let payload_key = string_field(payload, field)
                .ok_or_else(|| format!("{}[{index}] is missing {field}", record_type.as_str()))?;
            staged.push(Staged {
                record_type,
                payload_key,
                payload: payload.clone(),
            });
        }
    }
    Ok(staged)
}

fn string_field(payload: &Value, field: &str) -> Option<String> {
    payload
        .get(field)
        .and_then(Value::as_str)
        .filter(|v| !v.trim().is_empty())
        .map(str::to_string)
}
