//! Reliable delivery of normalized events with bounded retry.
//!
//! Each logical event gets one idempotency key derived from its identity
//! tuple and one externally visible event key, assigned at first write.
//! Retries and later duplicate emits reuse both.

use std::sync::Arc;

use async_trait::async_trait;
use mediator_contracts::{
    AckContext, AckResult, AckStatus, OpportunityCreatedInput, SignalNormalizedInput,
    NOT_APPLICABLE,
};
use mediator_kernel::{
    compute_signal_sampling_decision, jcs_sha256_hex, parse_rfc3339, stable_key, window_elapsed,
    BackoffSchedule, EmitKind, EmitReason, RetryBudget, RetryStep, SamplingDecision,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn, Instrument};

use crate::observability::emitter_span;
use crate::runtime::{
    Clock, EventKeyFactory, Scheduler, SystemClock, TokioScheduler, UuidKeyFactory,
};
use crate::store::{Cas, KvStore, RecordStore};
use crate::{PipelineError, MAX_CAS_ATTEMPTS};

pub const EMIT_NAMESPACE: &str = "emit_events";

/// The downstream transport. Transport errors are reported as a rejected
/// ack with `retryable` set accordingly.
#[async_trait]
pub trait AckFn: Send + Sync + 'static {
    async fn ack(&self, event: &Value, context: &AckContext) -> AckResult;
}

#[derive(Debug, Clone)]
pub struct EmitterConfig {
    pub retry_schedule_ms: Vec<u64>,
    pub max_retry_window_ms: u64,
    pub sample_rate_bps: u32,
    pub sampling_rule_version: String,
}

impl EmitterConfig {
    pub fn from_config(cfg: &mediator_config::Emitter) -> Self {
        Self {
            retry_schedule_ms: cfg.retry_schedule_ms.clone(),
            max_retry_window_ms: cfg.max_retry_window_ms,
            sample_rate_bps: cfg.sample_rate_bps,
            sampling_rule_version: cfg.sampling_rule_version.clone(),
        }
    }
}

impl Default for EmitterConfig {
    fn default() -> Self {
        Self::from_config(&mediator_config::Emitter::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Delivered,
    AckDuplicate,
    Rejected,
    Exhausted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundEventRecord {
    pub idempotency_key: String,
    pub event_key: String,
    pub kind: EmitKind,
    /// Hash of the body without `eventKey`.
    pub payload_hash: String,
    pub event: Value,
    pub delivery_status: DeliveryStatus,
    pub attempt_count: u32,
    #[serde(default)]
    pub last_ack: Option<AckResult>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EmitAction {
    Emitted,
    DuplicateNoop,
    SampledOut,
    Rejected,
    Exhausted,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EmitResult {
    pub emit_accepted: bool,
    pub emit_action: EmitAction,
    pub reason_code: &'static str,
    pub event_ref_or_na: String,
    pub event_or_na: Value,
    pub ack: Option<AckResult>,
    pub attempt_count: u32,
    pub retry_schedule_applied_ms: Vec<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sampling: Option<SamplingDecision>,
}

impl EmitResult {
    fn without_event(kind: EmitKind, action: EmitAction, reason: EmitReason) -> Self {
        Self {
            emit_accepted: false,
            emit_action: action,
            reason_code: reason.code(kind),
            event_ref_or_na: NOT_APPLICABLE.to_string(),
            event_or_na: Value::String(NOT_APPLICABLE.to_string()),
            ack: None,
            attempt_count: 0,
            retry_schedule_applied_ms: Vec::new(),
            idempotency_key: None,
            sampling: None,
        }
    }

    /// Settles a repeat emit against the stored record without delivering.
    ///
    /// Only a delivered event counts as accepted; a stored terminal failure
    /// is reported again so the caller can dead-letter it.
    fn duplicate_noop(kind: EmitKind, existing: &OutboundEventRecord) -> Self {
        let (accepted, reason) = match existing.delivery_status {
            DeliveryStatus::Delivered | DeliveryStatus::AckDuplicate => {
                (true, EmitReason::DuplicateNoop)
            }
            DeliveryStatus::Rejected => (false, EmitReason::AckRejected),
            DeliveryStatus::Exhausted => (false, EmitReason::RetryExhausted),
            DeliveryStatus::Pending => (false, EmitReason::DuplicateNoop),
        };
        Self {
            emit_accepted: accepted,
            emit_action: EmitAction::DuplicateNoop,
            reason_code: reason.code(kind),
            event_ref_or_na: existing.event_key.clone(),
            event_or_na: existing.event.clone(),
            ack: existing.last_ack.clone(),
            attempt_count: 0,
            retry_schedule_applied_ms: Vec::new(),
            idempotency_key: Some(existing.idempotency_key.clone()),
            sampling: None,
        }
    }
}

/// A validated event ready for the store and delivery loop.
struct Provisional {
    kind: EmitKind,
    idempotency_key: String,
    body: Value,
    sampling: Option<SamplingDecision>,
}

pub struct ReliableEmitter {
    events: RecordStore<OutboundEventRecord>,
    ack: Arc<dyn AckFn>,
    clock: Arc<dyn Clock>,
    scheduler: Arc<dyn Scheduler>,
    keys: Arc<dyn EventKeyFactory>,
    config: EmitterConfig,
}

impl ReliableEmitter {
    pub fn new(store: Arc<dyn KvStore>, ack: Arc<dyn AckFn>, config: EmitterConfig) -> Self {
        Self {
            events: RecordStore::new(store, EMIT_NAMESPACE),
            ack,
            clock: Arc::new(SystemClock),
            scheduler: Arc::new(TokioScheduler),
            keys: Arc::new(UuidKeyFactory),
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

    pub fn with_key_factory(mut self, keys: Arc<dyn EventKeyFactory>) -> Self {
        self.keys = keys;
        self
    }

    pub async fn emit_opportunity_created(
        &self,
        input: &OpportunityCreatedInput,
    ) -> Result<EmitResult, PipelineError> {
        let kind = EmitKind::OpportunityCreated;
        let span = emitter_span(kind.as_str(), &input.trace_key);
        async move {
            if let Some(field) = missing_opportunity_field(input) {
                warn!(field, "opportunity_created input failed contract checks");
                return Ok(EmitResult::without_event(
                    kind,
                    EmitAction::Rejected,
                    EmitReason::ContractInvalid,
                ));
            }

            let idempotency_key = stable_key(
                "b_opp_evt",
                &[
                    input.trace_key.as_str(),
                    input.opportunity_key.as_str(),
                    kind.as_str(),
                    input.event_contract_version.as_str(),
                ],
            );
            let body = json!({
                "eventType": kind.as_str(),
                "traceKey": input.trace_key,
                "requestKey": input.request_key,
                "opportunityKey": input.opportunity_key,
                "appId": input.app_id,
                "placementId": input.placement_id.as_deref().unwrap_or(NOT_APPLICABLE),
                "occurredAt": input.occurred_at,
                "eventContractVersion": input.event_contract_version,
                "mappingRuleVersion": input.mapping_rule_version.as_deref().unwrap_or(NOT_APPLICABLE),
                "context": input.context,
            });
            self.deliver_once(Provisional {
                kind,
                idempotency_key,
                body,
                sampling: None,
            })
            .await
        }
        .instrument(span)
        .await
    }

    pub async fn emit_signal_normalized(
        &self,
        input: &SignalNormalizedInput,
    ) -> Result<EmitResult, PipelineError> {
        let kind = EmitKind::SignalNormalized;
        let span = emitter_span(kind.as_str(), &input.trace_key);
        async move {
            if let Some(field) = missing_signal_field(input) {
                warn!(field, "signal_normalized input failed contract checks");
                return Ok(EmitResult::without_event(
                    kind,
                    EmitAction::Rejected,
                    EmitReason::ContractInvalid,
                ));
            }

            let rule = input
                .sampling_rule_version
                .as_deref()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(&self.config.sampling_rule_version);
            let rate = input.sample_rate_bps.unwrap_or(self.config.sample_rate_bps);
            let decision =
                compute_signal_sampling_decision(&input.trace_key, rule, rate, input.debug_force_sample);
            if !decision.sampled_in {
                debug!(bucket = decision.bucket, rate, "signal sampled out");
                let mut result =
                    EmitResult::without_event(kind, EmitAction::SampledOut, EmitReason::SampledOut);
                result.sampling = Some(decision);
                return Ok(result);
            }

            let idempotency_key = stable_key(
                "b_sig_evt",
                &[
                    input.trace_key.as_str(),
                    input.opportunity_key.as_str(),
                    kind.as_str(),
                    input.signal_type.as_str(),
                    input.event_contract_version.as_str(),
                ],
            );
            let body = json!({
                "eventType": kind.as_str(),
                "traceKey": input.trace_key,
                "requestKey": input.request_key,
                "opportunityKey": input.opportunity_key,
                "signalType": input.signal_type,
                "normalizedSignal": input.normalized_signal,
                "occurredAt": input.occurred_at,
                "eventContractVersion": input.event_contract_version,
                "samplingRuleVersion": rule,
                "sampleRateBps": rate,
            });
            self.deliver_once(Provisional {
                kind,
                idempotency_key,
                body,
                sampling: Some(decision),
            })
            .await
        }
        .instrument(span)
        .await
    }

    /// Stored outbound record for audit; never mutates.
    pub async fn replay_event(
        &self,
        idempotency_key: &str,
    ) -> Result<Option<OutboundEventRecord>, PipelineError> {
        Ok(self
            .events
            .load(idempotency_key)
            .await?
            .map(|(record, _)| record))
    }

    async fn deliver_once(&self, provisional: Provisional) -> Result<EmitResult, PipelineError> {
        let Provisional {
            kind,
            idempotency_key,
            body,
            sampling,
        } = provisional;
        let payload_hash = jcs_sha256_hex(&body).map_err(PipelineError::Serialization)?;

        let record = match self
            .first_write(kind, &idempotency_key, &payload_hash, body)
            .await?
        {
            Ok(record) => record,
            Err(mut settled) => {
                settled.sampling = sampling;
                return Ok(settled);
            }
        };

        let mut budget = RetryBudget::new(
            BackoffSchedule::new(self.config.retry_schedule_ms.clone()),
            self.config.max_retry_window_ms,
            self.clock.now_ms(),
        );
        let (settled, ack) = loop {
            let attempt = budget.begin_attempt();
            let context = AckContext {
                attempt_index: attempt - 1,
                retry_schedule_ms: budget.schedule().delays().to_vec(),
                max_retry_window_ms: budget.max_window_ms(),
            };
            let ack = self.ack.ack(&record.event, &context).await;
            debug!(
                attempt,
                ack_status = ack.ack_status.as_str(),
                retryable = ack.retryable,
                "delivery attempt finished"
            );
            match (ack.ack_status, ack.retryable) {
                (AckStatus::Accepted, _) => break (DeliveryStatus::Delivered, ack),
                (AckStatus::Duplicate, _) => break (DeliveryStatus::AckDuplicate, ack),
                (AckStatus::Rejected, false) => break (DeliveryStatus::Rejected, ack),
                (AckStatus::Rejected, true) => {
                    match budget.after_retryable_failure(self.clock.now_ms()) {
                        RetryStep::Wait { delay_ms } => self.scheduler.sleep_ms(delay_ms).await,
                        RetryStep::Exhausted {
                            elapsed_ms,
                            next_delay_ms,
                        } => {
                            warn!(
                                attempt,
                                elapsed_ms,
                                next_delay_ms,
                                reason_code = EmitReason::RetryExhausted.code(kind),
                                "delivery retry window exhausted"
                            );
                            break (DeliveryStatus::Exhausted, ack);
                        }
                    }
                }
            }
        };

        let (action, reason, accepted) = match settled {
            DeliveryStatus::Delivered => (EmitAction::Emitted, EmitReason::Emitted, true),
            DeliveryStatus::AckDuplicate => (EmitAction::Emitted, EmitReason::AckDuplicate, true),
            DeliveryStatus::Rejected => (EmitAction::Rejected, EmitReason::AckRejected, false),
            DeliveryStatus::Exhausted | DeliveryStatus::Pending => {
                (EmitAction::Exhausted, EmitReason::RetryExhausted, false)
            }
        };
        self.record_delivery(&idempotency_key, settled, budget.attempts(), &ack)
            .await?;
        if accepted {
            info!(
                event_key = %record.event_key,
                attempts = budget.attempts(),
                reason_code = reason.code(kind),
                "event delivered"
            );
        }

        Ok(EmitResult {
            emit_accepted: accepted,
            emit_action: action,
            reason_code: reason.code(kind),
            event_ref_or_na: record.event_key.clone(),
            event_or_na: record.event,
            ack: Some(ack),
            attempt_count: budget.attempts(),
            retry_schedule_applied_ms: budget.applied_ms().to_vec(),
            idempotency_key: Some(idempotency_key),
            sampling,
        })
    }

    /// Persists the event under its key, or settles against the record that
    /// is already there.
    async fn first_write(
        &self,
        kind: EmitKind,
        idempotency_key: &str,
        payload_hash: &str,
        body: Value,
    ) -> Result<Result<OutboundEventRecord, EmitResult>, PipelineError> {
        let existing = match self.events.load(idempotency_key).await? {
            Some(found) => found,
            None => {
                let event_key = self.keys.new_event_key();
                let mut event = body;
                if let Value::Object(fields) = &mut event {
                    fields.insert("eventKey".to_string(), Value::String(event_key.clone()));
                }
                let now_ms = self.clock.now_ms();
                let record = OutboundEventRecord {
                    idempotency_key: idempotency_key.to_string(),
                    event_key,
                    kind,
                    payload_hash: payload_hash.to_string(),
                    event,
                    delivery_status: DeliveryStatus::Pending,
                    attempt_count: 0,
                    last_ack: None,
                    created_at_ms: now_ms,
                    updated_at_ms: now_ms,
                };
                match self.events.insert_new(idempotency_key, &record).await? {
                    Cas::Written => return Ok(Ok(record)),
                    Cas::Lost(Some(winner)) => winner,
                    Cas::Lost(None) => {
                        return Err(PipelineError::Contention {
                            key: idempotency_key.to_string(),
                            attempts: 1,
                        })
                    }
                }
            }
        };
        self.settle_existing(kind, idempotency_key, payload_hash, existing)
            .await
    }

    async fn settle_existing(
        &self,
        kind: EmitKind,
        idempotency_key: &str,
        payload_hash: &str,
        (existing, version): (OutboundEventRecord, u64),
    ) -> Result<Result<OutboundEventRecord, EmitResult>, PipelineError> {
        if existing.payload_hash != payload_hash {
            warn!(
                idempotency_key,
                reason_code = EmitReason::PayloadConflict.code(kind),
                "event identity reused with a different body"
            );
            let mut result =
                EmitResult::without_event(kind, EmitAction::Rejected, EmitReason::PayloadConflict);
            result.idempotency_key = Some(idempotency_key.to_string());
            return Ok(Err(result));
        }

        // A delivery loop never outlives the retry window, so a record still
        // pending past it was left behind by a crashed emitter.
        let now_ms = self.clock.now_ms();
        if existing.delivery_status == DeliveryStatus::Pending
            && window_elapsed(existing.updated_at_ms, now_ms, self.config.max_retry_window_ms)
        {
            let mut resumed = existing.clone();
            resumed.updated_at_ms = now_ms;
            match self.events.replace(idempotency_key, &resumed, version).await? {
                Cas::Written => {
                    warn!(
                        event_key = %resumed.event_key,
                        "resuming abandoned delivery"
                    );
                    return Ok(Ok(resumed));
                }
                Cas::Lost(Some((current, _))) => {
                    return Ok(Err(EmitResult::duplicate_noop(kind, &current)));
                }
                Cas::Lost(None) => {}
            }
        }

        debug!(
            event_key = %existing.event_key,
            delivery_status = ?existing.delivery_status,
            "event already stored"
        );
        Ok(Err(EmitResult::duplicate_noop(kind, &existing)))
    }

    async fn record_delivery(
        &self,
        idempotency_key: &str,
        status: DeliveryStatus,
        attempts: u32,
        ack: &AckResult,
    ) -> Result<(), PipelineError> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let Some((mut record, version)) = self.events.load(idempotency_key).await? else {
                return Err(PipelineError::Contention {
                    key: idempotency_key.to_string(),
                    attempts: 1,
                });
            };
            record.delivery_status = status;
            record.attempt_count += attempts;
            record.last_ack = Some(ack.clone());
            record.updated_at_ms = self.clock.now_ms();
            if let Cas::Written = self.events.replace(idempotency_key, &record, version).await? {
                return Ok(());
            }
        }
        Err(PipelineError::Contention {
            key: idempotency_key.to_string(),
            attempts: MAX_CAS_ATTEMPTS,
        })
    }
}

fn blank(value: &str) -> bool {
    value.trim().is_empty()
}

fn missing_opportunity_field(input: &OpportunityCreatedInput) -> Option<&'static str> {
    [
        ("traceKey", blank(&input.trace_key)),
        ("requestKey", blank(&input.request_key)),
        ("opportunityKey", blank(&input.opportunity_key)),
        ("appId", blank(&input.app_id)),
        ("occurredAt", parse_rfc3339(&input.occurred_at).is_none()),
        ("eventContractVersion", blank(&input.event_contract_version)),
    ]
    .into_iter()
    .find(|(_, missing)| *missing)
    .map(|(field, _)| field)
}

fn missing_signal_field(input: &SignalNormalizedInput) -> Option<&'static str> {
    [
        ("traceKey", blank(&input.trace_key)),
        ("requestKey", blank(&input.request_key)),
        ("opportunityKey", blank(&input.opportunity_key)),
        ("signalType", blank(&input.signal_type)),
        ("normalizedSignal", input.normalized_signal.is_null()),
        ("occurredAt", parse_rfc3339(&input.occurred_at).is_none()),
        ("eventContractVersion", blank(&input.event_contract_version)),
    ]
    .into_iter()
    .find(|(_, missing)| *missing)
    .map(|(field, _)| field)
}
