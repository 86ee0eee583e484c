use async_trait::async_trait;
use mediator_contracts::{
    contract_schema, AckContext, AckResult, AckStatus, EventEnvelope, EventType,
    IngestRequest, MappingResult, OpportunityCreatedInput, SignalNormalizedInput, VersionAnchors,
};
use mediator_kernel::{
    compute_signal_sampling_decision, ArchiveReason, ClosureStatus, DedupWindows, GateReason,
    KeySource, RecordStatus,
};
use mediator_pipeline::{
    AckFn, ArchiveBuilder, ArchiveConfig, ArchiveRecord, ArchiveSink, Clock, DedupState,
    DeliveryStatus, EmitAction, EmitterConfig, EventKeyFactory, GateConfig, IdempotencyGate,
    KvStore, MemoryStore, ReliableEmitter, Scheduler, SinkFailure, SinkOutcome, SqliteStore,
};
use serde_json::{json, Value};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

const NOW: i64 = 1_771_027_200_000; // 2026-02-14T00:00:00Z
const MINUTE: i64 = 60_000;
const DAY: i64 = 24 * 60 * MINUTE;

struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    fn new(start: i64) -> Arc<Self> {
        Arc::new(Self {
            now: AtomicI64::new(start),
        })
    }

    fn advance(&self, ms: i64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Sleeps by moving the manual clock forward.
struct ManualScheduler {
    clock: Arc<ManualClock>,
    slept: Mutex<Vec<u64>>,
}

impl ManualScheduler {
    fn new(clock: Arc<ManualClock>) -> Arc<Self> {
        Arc::new(Self {
            clock,
            slept: Mutex::new(Vec::new()),
        })
    }

    fn slept(&self) -> Vec<u64> {
        self.slept.lock().unwrap().clone()
    }
}

#[async_trait]
impl Scheduler for ManualScheduler {
    async fn sleep_ms(&self, delay_ms: u64) {
        self.slept.lock().unwrap().push(delay_ms);
        self.clock.advance(delay_ms as i64);
    }
}

struct SequentialKeys {
    next: AtomicU64,
}

impl SequentialKeys {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            next: AtomicU64::new(1),
        })
    }
}

impl EventKeyFactory for SequentialKeys {
    fn new_event_key(&self) -> String {
        format!("evt_{:04}", self.next.fetch_add(1, Ordering::SeqCst))
    }
}

/// Plays back scripted acks, then repeats `fallback`.
struct ScriptedAck {
    script: Mutex<VecDeque<AckResult>>,
    fallback: AckResult,
    seen: Mutex<Vec<(Value, AckContext)>>,
}

impl ScriptedAck {
    fn new(script: Vec<AckResult>, fallback: AckResult) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            fallback,
            seen: Mutex::new(Vec::new()),
        })
    }

    fn always(ack: AckResult) -> Arc<Self> {
        Self::new(Vec::new(), ack)
    }

    fn calls(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    fn seen(&self) -> Vec<(Value, AckContext)> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl AckFn for ScriptedAck {
    async fn ack(&self, event: &Value, context: &AckContext) -> AckResult {
        self.seen
            .lock()
            .unwrap()
            .push((event.clone(), context.clone()));
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

struct ScriptedSink {
    script: Mutex<VecDeque<SinkOutcome>>,
    fallback: SinkOutcome,
    writes: AtomicU64,
}

impl ScriptedSink {
    fn new(script: Vec<SinkOutcome>, fallback: SinkOutcome) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback,
            writes: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl ArchiveSink for ScriptedSink {
    async fn write(&self, _record: &ArchiveRecord) -> SinkOutcome {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

fn retryable_failure() -> AckResult {
    AckResult::rejected(true, "downstream_unavailable")
}

fn gate() -> IdempotencyGate {
    IdempotencyGate::new(Arc::new(MemoryStore::new()), GateConfig::default())
}

fn click_request(idempotency_key: Option<&str>, target: &str) -> IngestRequest {
    let mut event = EventEnvelope::new(EventType::Click, "2026-02-14T00:00:00Z");
    event.idempotency_key = idempotency_key.map(str::to_string);
    event.request_key = Some("req-1".to_string());
    event.attempt_key = Some("att-1".to_string());
    event.opportunity_key = Some("opp-1".to_string());
    event.render_attempt_id = Some("render-1".to_string());
    event.click_target = Some(target.to_string());
    event.event_seq = Some(1);
    IngestRequest {
        app_id: "app1".to_string(),
        batch_id: "batch-1".to_string(),
        event,
        global_unique_verified: false,
    }
}

fn opportunity_input() -> OpportunityCreatedInput {
    OpportunityCreatedInput {
        trace_key: "trace-1".to_string(),
        request_key: "req-1".to_string(),
        opportunity_key: "opp-1".to_string(),
        app_id: "app1".to_string(),
        placement_id: Some("chat_inline".to_string()),
        occurred_at: "2026-02-14T00:00:00Z".to_string(),
        event_contract_version: "b_evt_v1".to_string(),
        mapping_rule_version: Some("f_map_v2".to_string()),
        context: BTreeMap::new(),
    }
}

fn signal_input(trace_key: &str) -> SignalNormalizedInput {
    SignalNormalizedInput {
        trace_key: trace_key.to_string(),
        request_key: "req-1".to_string(),
        opportunity_key: "opp-1".to_string(),
        signal_type: "intent".to_string(),
        normalized_signal: json!({"intent": "travel", "score": 0.82}),
        occurred_at: "2026-02-14T00:00:00Z".to_string(),
        event_contract_version: "b_evt_v1".to_string(),
        sampling_rule_version: Some("b_sig_sampling_v1".to_string()),
        sample_rate_bps: Some(0),
        debug_force_sample: false,
    }
}

struct EmitterRig {
    emitter: Arc<ReliableEmitter>,
    ack: Arc<ScriptedAck>,
    scheduler: Arc<ManualScheduler>,
}

fn emitter_rig(ack: Arc<ScriptedAck>, config: EmitterConfig) -> EmitterRig {
    let clock = ManualClock::new(NOW);
    let scheduler = ManualScheduler::new(clock.clone());
    let emitter = ReliableEmitter::new(Arc::new(MemoryStore::new()), ack.clone(), config)
        .with_clock(clock)
        .with_scheduler(scheduler.clone())
        .with_key_factory(SequentialKeys::new());
    EmitterRig {
        emitter: Arc::new(emitter),
        ack,
        scheduler,
    }
}

fn anchors() -> VersionAnchors {
    VersionAnchors {
        event_contract_version: Some("b_evt_v1".to_string()),
        mapping_rule_version: Some("f_map_v2".to_string()),
        dedup_fingerprint_version: Some("f_dedup_v1".to_string()),
        closure_rule_version: Some("g_closure_v1".to_string()),
        billing_rule_version: Some("g_bill_v1".to_string()),
        archive_contract_version: Some("g_arch_v1".to_string()),
    }
}

fn mapping(amount: u64) -> MappingResult {
    MappingResult {
        fact_decision_audit_lite: Some(json!({
            "sourceEventId": "evt-src-1",
            "decision": "served",
        })),
        billable_facts: vec![json!({
            "billingKey": "bill-1",
            "amountMicros": amount,
            "currency": "USD",
        })],
        attribution_facts: vec![json!({
            "attributionKey": "attr-1",
            "network": "partner-a",
        })],
    }
}

// ---------------------------------------------------------------- gate

#[tokio::test]
async fn same_event_twice_is_accepted_then_duplicate() {
    let gate = gate();
    let request = click_request(Some("abc123XYZ"), "https://offers.test/c/1");

    let first = gate.evaluate(&request, NOW).await.unwrap();
    assert!(first.ok);
    assert_eq!(first.ack_status, AckStatus::Accepted);
    assert_eq!(first.reason_code, GateReason::Accepted);
    assert_eq!(first.state, Some(DedupState::AcceptedCommitted));
    assert_eq!(first.dedup_fingerprint_version.as_deref(), Some("f_dedup_v1"));

    let second = gate.evaluate(&request, NOW + 1_000).await.unwrap();
    assert!(second.ok);
    assert_eq!(second.ack_status, AckStatus::Duplicate);
    assert_eq!(second.reason_code, GateReason::CommittedDuplicate);
    assert_eq!(second.state, Some(DedupState::DuplicateCommitted));
}

#[tokio::test]
async fn client_idempotency_key_wins_on_both_submissions() {
    let gate = gate();
    let mut request = click_request(Some("abc123XYZ"), "https://offers.test/c/1");
    request.event.event_id = Some("evt-77".to_string());

    let first = gate.evaluate(&request, NOW).await.unwrap();
    let second = gate.evaluate(&request, NOW + 5).await.unwrap();
    for outcome in [&first, &second] {
        assert_eq!(
            outcome.canonical_dedup_key.as_deref(),
            Some("f_dedup_v1:client_idempotency:app1|abc123XYZ")
        );
        assert_eq!(outcome.key_source, Some(KeySource::ClientIdempotency));
    }
    assert_eq!(second.ack_status, AckStatus::Duplicate);
}

#[tokio::test]
async fn computed_fallback_collides_across_json_layouts() {
    let compact = r#"{"appId":"app1","batchId":"b1","event":{"eventType":"click","eventAt":"2026-02-14T00:00:00Z","requestKey":"req-1","attemptKey":"att-1","opportunityKey":"opp-1","renderAttemptId":"r-1","clickTarget":"https://offers.test/c/1","eventSeq":1}}"#;
    let reordered = r#"
        {
          "event": {
            "eventSeq": 1,
            "clickTarget": "https://offers.test/c/1",
            "renderAttemptId": "r-1",
            "opportunityKey": "opp-1",
            "attemptKey": "att-1",
            "requestKey": "req-1",
            "eventAt": "2026-02-14T00:00:00Z",
            "eventType": "click"
          },
          "batchId": "b1",
          "appId": "app1"
        }"#;
    let a: IngestRequest = serde_json::from_str(compact).unwrap();
    let b: IngestRequest = serde_json::from_str(reordered).unwrap();

    let gate = gate();
    let first = gate.evaluate(&a, NOW).await.unwrap();
    let second = gate.evaluate(&b, NOW).await.unwrap();
    assert_eq!(first.key_source, Some(KeySource::Computed));
    assert!(first
        .canonical_dedup_key
        .as_deref()
        .is_some_and(|k| k.starts_with("f_dedup_v1:computed:")));
    assert_eq!(first.canonical_dedup_key, second.canonical_dedup_key);
    assert_eq!(first.ack_status, AckStatus::Accepted);
    assert_eq!(second.ack_status, AckStatus::Duplicate);
}

#[tokio::test]
async fn payload_conflict_is_detected_in_either_order() {
    let a = click_request(Some("abc123XYZ"), "https://offers.test/a");
    let b = click_request(Some("abc123XYZ"), "https://offers.test/b");

    for (first, second) in [(&a, &b), (&b, &a)] {
        let gate = gate();
        assert_eq!(
            gate.evaluate(first, NOW).await.unwrap().ack_status,
            AckStatus::Accepted
        );
        let outcome = gate.evaluate(second, NOW + 1).await.unwrap();
        assert!(!outcome.ok);
        assert!(!outcome.retryable);
        assert_eq!(outcome.ack_status, AckStatus::Rejected);
        assert_eq!(outcome.reason_code.as_str(), "f_dedup_payload_conflict");
        assert_eq!(outcome.state, Some(DedupState::RejectedConflict));

        let key = outcome.canonical_dedup_key.unwrap();
        let record = gate.replay(&key).await.unwrap().unwrap();
        assert_eq!(record.state, DedupState::RejectedConflict);
    }
}

#[tokio::test]
async fn committed_record_expires_after_its_layer_window() {
    let windows = DedupWindows::default();
    let gate = gate();
    let mut event = EventEnvelope::new(EventType::AdFilled, "2026-02-14T00:00:00Z");
    event.idempotency_key = Some("fill-0000001".to_string());
    let first = IngestRequest {
        app_id: "app1".to_string(),
        batch_id: "batch-1".to_string(),
        event,
        global_unique_verified: false,
    };
    assert_eq!(
        gate.evaluate(&first, NOW).await.unwrap().reason_code,
        GateReason::Accepted
    );

    let at_boundary = NOW + windows.diagnostics_ms as i64;
    assert_eq!(
        gate.evaluate(&first, at_boundary).await.unwrap().reason_code,
        GateReason::CommittedDuplicate
    );

    let later = at_boundary + 1;
    let mut resent = first.clone();
    resent.event.event_at = "2026-02-17T00:00:00.001Z".to_string();
    let outcome = gate.evaluate(&resent, later).await.unwrap();
    assert_eq!(outcome.ack_status, AckStatus::Accepted);
    assert_eq!(outcome.reason_code, GateReason::Accepted);

    let key = outcome.canonical_dedup_key.unwrap();
    let record = gate.replay(&key).await.unwrap().unwrap();
    assert!(record.history.iter().any(|t| t.to == DedupState::Expired));
    assert_eq!(record.committed_at_ms, Some(later));
}

#[tokio::test]
async fn stale_billing_event_is_rejected() {
    let gate = gate();
    let request = click_request(Some("abc123XYZ"), "https://offers.test/c/1");
    let outcome = gate.evaluate(&request, NOW + 14 * DAY + 1).await.unwrap();
    assert_eq!(outcome.reason_code.as_str(), "f_event_stale_outside_dedup_window");
    assert!(!outcome.retryable);

    let within = gate.evaluate(&request, NOW + 14 * DAY).await.unwrap();
    assert_eq!(within.ack_status, AckStatus::Accepted);
}

#[tokio::test]
async fn unverified_global_event_id_is_rejected() {
    let gate = gate();
    let mut request = click_request(None, "https://offers.test/c/1");
    request.event.event_id = Some("evt-global-1".to_string());
    request.event.event_id_scope = Some(mediator_contracts::EventIdScope::GlobalUnique);

    let outcome = gate.evaluate(&request, NOW).await.unwrap();
    assert_eq!(
        outcome.reason_code.as_str(),
        "f_event_id_global_uniqueness_unverified"
    );
    assert!(!outcome.retryable);

    request.global_unique_verified = true;
    let verified = gate.evaluate(&request, NOW).await.unwrap();
    assert_eq!(
        verified.canonical_dedup_key.as_deref(),
        Some("f_dedup_v1:client_event_id:app1|global|evt-global-1")
    );
}

#[tokio::test]
async fn unidentifiable_event_is_rejected_without_touching_store() {
    let gate = gate();
    let mut request = click_request(None, "https://offers.test/c/1");
    request.event.opportunity_key = None;
    let outcome = gate.evaluate(&request, NOW).await.unwrap();
    assert_eq!(outcome.reason_code.as_str(), "f_event_id_invalid_no_fallback");
    assert_eq!(outcome.ack_status, AckStatus::Rejected);
    assert!(outcome.canonical_dedup_key.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_first_sightings_accept_exactly_once() {
    for round in 0..10 {
        let gate = Arc::new(gate());
        let key = format!("race-key-{round:04}");
        let request = click_request(Some(&key), "https://offers.test/c/1");
        let mut handles = Vec::new();
        for _ in 0..64 {
            let gate = gate.clone();
            let request = request.clone();
            handles.push(tokio::spawn(async move {
                gate.evaluate(&request, NOW).await
            }));
        }
        let mut accepted = 0;
        for handle in handles {
            let outcome = match handle.await.unwrap() {
                Ok(outcome) => outcome,
                Err(err) => panic!("round {round}: duplicate surfaced as error: {err}"),
            };
            assert!(outcome.ok);
            if outcome.ack_status == AckStatus::Accepted {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 1, "round {round}");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn lock_holder_commits_through_a_duplicate_burst() {
    let gate = Arc::new(gate());
    let request = click_request(Some("burst-key-0001"), "https://offers.test/c/1");
    let locked = gate.begin_in_flight(&request, NOW).await.unwrap();
    let key = locked.canonical_dedup_key.clone().unwrap();
    let token = locked.lock_token.unwrap();

    let mut handles = Vec::new();
    for _ in 0..64 {
        let gate = gate.clone();
        let request = request.clone();
        handles.push(tokio::spawn(async move {
            gate.begin_in_flight(&request, NOW + 1).await
        }));
    }
    let committed = gate.commit(&key, token, NOW + 2).await.unwrap();
    assert_eq!(committed.reason_code, GateReason::Accepted);

    for handle in handles {
        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(outcome.ack_status, AckStatus::Duplicate);
    }

    let record = gate.replay(&key).await.unwrap().unwrap();
    let markers = record
        .history
        .iter()
        .filter(|t| {
            matches!(
                t.to,
                DedupState::DuplicateInflight | DedupState::DuplicateCommitted
            )
        })
        .count();
    assert!(markers <= 2, "repeat duplicates collapse, got {markers} markers");
}

#[tokio::test]
async fn sqlite_dedup_state_survives_reopen() {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time before unix epoch")
        .as_nanos();
    let db_path = std::env::temp_dir()
        .join(format!("mediator-pipeline-{nanos}.db"))
        .to_string_lossy()
        .to_string();
    let request = click_request(Some("abc123XYZ"), "https://offers.test/c/1");

    {
        let store: Arc<dyn KvStore> = Arc::new(SqliteStore::open(&db_path).unwrap());
        let gate = IdempotencyGate::new(store, GateConfig::default());
        let first = gate.evaluate(&request, NOW).await.unwrap();
        assert_eq!(first.ack_status, AckStatus::Accepted);
    }

    let store: Arc<dyn KvStore> = Arc::new(SqliteStore::open(&db_path).unwrap());
    let gate = IdempotencyGate::new(store, GateConfig::default());
    let again = gate.evaluate(&request, NOW + 10).await.unwrap();
    assert_eq!(again.ack_status, AckStatus::Duplicate);
    assert_eq!(again.reason_code, GateReason::CommittedDuplicate);
}

// ---------------------------------------------------------------- emitter

#[tokio::test]
async fn retry_exhaustion_stops_after_second_attempt() {
    let rig = emitter_rig(
        ScriptedAck::always(retryable_failure()),
        EmitterConfig {
            retry_schedule_ms: vec![1_000, 5_000],
            max_retry_window_ms: 6_000,
            ..EmitterConfig::default()
        },
    );
    let result = rig
        .emitter
        .emit_opportunity_created(&opportunity_input())
        .await
        .unwrap();

    assert!(!result.emit_accepted);
    assert_eq!(result.emit_action, EmitAction::Exhausted);
    assert_eq!(result.reason_code, "b_opp_evt_retry_exhausted");
    assert_eq!(result.attempt_count, 2);
    assert_eq!(result.retry_schedule_applied_ms, vec![1_000]);
    assert_eq!(rig.scheduler.slept(), vec![1_000]);

    let contexts: Vec<u32> = rig.ack.seen().iter().map(|(_, c)| c.attempt_index).collect();
    assert_eq!(contexts, vec![0, 1]);
    assert_eq!(rig.ack.seen()[0].1.max_retry_window_ms, 6_000);
    assert_eq!(rig.ack.seen()[1].1.retry_schedule_ms, vec![1_000, 5_000]);

    let stored = rig
        .emitter
        .replay_event(result.idempotency_key.as_deref().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.delivery_status, DeliveryStatus::Exhausted);
    assert_eq!(stored.attempt_count, 2);

    let again = rig
        .emitter
        .emit_opportunity_created(&opportunity_input())
        .await
        .unwrap();
    assert!(!again.emit_accepted);
    assert_eq!(again.emit_action, EmitAction::DuplicateNoop);
    assert_eq!(again.reason_code, "b_opp_evt_retry_exhausted");
    assert_eq!(again.event_ref_or_na, result.event_ref_or_na);
    assert_eq!(rig.ack.calls(), 2);
}

#[tokio::test]
async fn retries_follow_schedule_and_keep_event_key() {
    let rig = emitter_rig(
        ScriptedAck::new(
            vec![retryable_failure(), retryable_failure(), retryable_failure()],
            AckResult::accepted(),
        ),
        EmitterConfig::default(),
    );
    let result = rig
        .emitter
        .emit_opportunity_created(&opportunity_input())
        .await
        .unwrap();

    assert!(result.emit_accepted);
    assert_eq!(result.emit_action, EmitAction::Emitted);
    assert_eq!(result.reason_code, "b_opp_evt_emitted");
    assert_eq!(result.attempt_count, 4);
    assert_eq!(result.retry_schedule_applied_ms, vec![1_000, 5_000, 30_000]);
    assert_eq!(result.event_ref_or_na, "evt_0001");

    let keys: Vec<Value> = rig
        .ack
        .seen()
        .iter()
        .map(|(event, _)| event["eventKey"].clone())
        .collect();
    assert_eq!(keys, vec![json!("evt_0001"); 4]);
}

#[tokio::test]
async fn repeated_emit_is_a_duplicate_noop() {
    let rig = emitter_rig(
        ScriptedAck::always(AckResult::accepted()),
        EmitterConfig::default(),
    );
    let first = rig
        .emitter
        .emit_opportunity_created(&opportunity_input())
        .await
        .unwrap();
    let second = rig
        .emitter
        .emit_opportunity_created(&opportunity_input())
        .await
        .unwrap();

    assert_eq!(second.emit_action, EmitAction::DuplicateNoop);
    assert_eq!(second.reason_code, "b_opp_evt_duplicate_noop");
    assert!(second.emit_accepted);
    assert_eq!(second.event_ref_or_na, first.event_ref_or_na);
    assert_eq!(second.event_or_na, first.event_or_na);
    assert_eq!(rig.ack.calls(), 1);
}

#[tokio::test]
async fn redefined_event_identity_is_a_payload_conflict() {
    let rig = emitter_rig(
        ScriptedAck::always(AckResult::accepted()),
        EmitterConfig::default(),
    );
    rig.emitter
        .emit_opportunity_created(&opportunity_input())
        .await
        .unwrap();

    let mut changed = opportunity_input();
    changed.placement_id = Some("sidebar".to_string());
    let result = rig.emitter.emit_opportunity_created(&changed).await.unwrap();
    assert!(!result.emit_accepted);
    assert_eq!(result.reason_code, "b_opp_evt_payload_conflict");
    assert_eq!(result.event_ref_or_na, "NA");
    assert_eq!(rig.ack.calls(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_emits_share_one_event_key() {
    let rig = emitter_rig(
        ScriptedAck::always(AckResult::accepted()),
        EmitterConfig::default(),
    );
    let mut handles = Vec::new();
    for _ in 0..8 {
        let emitter = rig.emitter.clone();
        handles.push(tokio::spawn(async move {
            emitter
                .emit_opportunity_created(&opportunity_input())
                .await
                .unwrap()
        }));
    }
    let mut refs = Vec::new();
    let mut emitted = 0;
    for handle in handles {
        let result = handle.await.unwrap();
        if result.emit_action == EmitAction::Emitted {
            emitted += 1;
        } else {
            assert_eq!(result.emit_action, EmitAction::DuplicateNoop);
        }
        refs.push(result.event_ref_or_na);
    }
    assert_eq!(emitted, 1);
    refs.dedup();
    assert_eq!(refs.len(), 1);
    assert_eq!(rig.ack.calls(), 1);
}

#[tokio::test]
async fn non_retryable_and_duplicate_acks_return_immediately() {
    let rejected = emitter_rig(
        ScriptedAck::always(AckResult::rejected(false, "schema_mismatch")),
        EmitterConfig::default(),
    );
    let result = rejected
        .emitter
        .emit_signal_normalized(&SignalNormalizedInput {
            debug_force_sample: true,
            ..signal_input("trace-9")
        })
        .await
        .unwrap();
    assert_eq!(result.reason_code, "b_sig_evt_ack_rejected");
    assert_eq!(result.emit_action, EmitAction::Rejected);
    assert_eq!(result.attempt_count, 1);
    assert!(rejected.scheduler.slept().is_empty());

    let duplicate = emitter_rig(
        ScriptedAck::always(AckResult {
            ack_status: AckStatus::Duplicate,
            retryable: false,
            ack_reason_code: None,
            acked_at: Some("2026-02-14T00:00:01Z".to_string()),
        }),
        EmitterConfig::default(),
    );
    let result = duplicate
        .emitter
        .emit_opportunity_created(&opportunity_input())
        .await
        .unwrap();
    assert!(result.emit_accepted);
    assert_eq!(result.reason_code, "b_opp_evt_ack_duplicate");
}

#[tokio::test]
async fn sampled_out_signal_never_reaches_delivery() {
    let rig = emitter_rig(
        ScriptedAck::always(AckResult::accepted()),
        EmitterConfig::default(),
    );
    let result = rig
        .emitter
        .emit_signal_normalized(&signal_input("trace-1"))
        .await
        .unwrap();
    assert!(!result.emit_accepted);
    assert_eq!(result.emit_action, EmitAction::SampledOut);
    assert_eq!(result.reason_code, "b_sig_evt_sampled_out");
    assert_eq!(result.event_ref_or_na, "NA");
    assert_eq!(result.event_or_na, json!("NA"));
    assert_eq!(rig.ack.calls(), 0);

    let forced = rig
        .emitter
        .emit_signal_normalized(&SignalNormalizedInput {
            debug_force_sample: true,
            ..signal_input("trace-1")
        })
        .await
        .unwrap();
    assert_eq!(forced.reason_code, "b_sig_evt_emitted");
    assert!(forced.sampling.is_some_and(|s| s.forced));
    assert_eq!(rig.ack.calls(), 1);
}

#[tokio::test]
async fn sampling_decision_is_reported_and_reproducible() {
    let rig = emitter_rig(
        ScriptedAck::always(AckResult::accepted()),
        EmitterConfig::default(),
    );
    let mut input = signal_input("trace-42");
    input.sample_rate_bps = Some(10_000);
    let result = rig.emitter.emit_signal_normalized(&input).await.unwrap();

    let expected = compute_signal_sampling_decision("trace-42", "b_sig_sampling_v1", 10_000, false);
    assert_eq!(result.sampling, Some(expected));
    assert_eq!(
        expected,
        compute_signal_sampling_decision("trace-42", "b_sig_sampling_v1", 10_000, false)
    );
    assert_eq!(result.event_or_na["sampleRateBps"], json!(10_000));
}

#[tokio::test]
async fn signal_contract_violation_skips_delivery() {
    let rig = emitter_rig(
        ScriptedAck::always(AckResult::accepted()),
        EmitterConfig::default(),
    );
    let mut input = signal_input("trace-1");
    input.event_contract_version = String::new();
    input.debug_force_sample = true;
    let result = rig.emitter.emit_signal_normalized(&input).await.unwrap();
    assert_eq!(result.reason_code, "b_sig_evt_contract_invalid");
    assert_eq!(rig.ack.calls(), 0);
}

// ---------------------------------------------------------------- archive

struct ArchiveRig {
    builder: ArchiveBuilder,
    scheduler: Arc<ManualScheduler>,
}

fn archive_rig() -> ArchiveRig {
    let clock = ManualClock::new(NOW);
    let scheduler = ManualScheduler::new(clock.clone());
    let builder = ArchiveBuilder::new(Arc::new(MemoryStore::new()), ArchiveConfig::default())
        .with_clock(clock)
        .with_scheduler(scheduler.clone());
    ArchiveRig { builder, scheduler }
}

const DEDUP_KEY: &str = "f_dedup_v1:client_idempotency:app1|abc123XYZ";

#[tokio::test]
async fn archive_batch_is_idempotent_per_payload() {
    let rig = archive_rig();
    let first = rig
        .builder
        .build_archive_records(DEDUP_KEY, &mapping(1_500), &anchors(), NOW)
        .await
        .unwrap();
    assert!(first.ok);
    assert_eq!(first.reason_code, ArchiveReason::RecordNew);
    assert_eq!(first.records.len(), 3);
    assert!(first.records.iter().all(|e| e.status == RecordStatus::New));
    assert_eq!(first.closure_status, Some(ClosureStatus::PartialPending));

    let again = rig
        .builder
        .build_archive_records(DEDUP_KEY, &mapping(1_500), &anchors(), NOW + 1)
        .await
        .unwrap();
    assert!(again.ok);
    assert_eq!(again.reason_code, ArchiveReason::RecordDuplicate);
    assert!(again
        .records
        .iter()
        .all(|e| e.status == RecordStatus::Duplicate));
    let first_keys: Vec<_> = first.records.iter().map(|e| &e.record_key).collect();
    let again_keys: Vec<_> = again.records.iter().map(|e| &e.record_key).collect();
    assert_eq!(first_keys, again_keys);
}

#[tokio::test]
async fn different_fact_on_same_record_key_is_a_mismatch() {
    let rig = archive_rig();
    rig.builder
        .build_archive_records(DEDUP_KEY, &mapping(1_500), &anchors(), NOW)
        .await
        .unwrap();
    let result = rig
        .builder
        .build_archive_records(DEDUP_KEY, &mapping(9_999), &anchors(), NOW + 1)
        .await
        .unwrap();

    assert!(!result.ok);
    assert_eq!(result.reason_code.as_str(), "g_output_recordkey_payload_mismatch");
    let billable = &result.records[1];
    assert_eq!(billable.status, RecordStatus::Conflicted);
    assert_eq!(billable.record.payload["amountMicros"], json!(1_500));
    assert_eq!(result.closure_status, Some(ClosureStatus::PartialPending));
}

#[tokio::test]
async fn missing_version_anchor_rejects_whole_batch() {
    let rig = archive_rig();
    let mut partial = anchors();
    partial.billing_rule_version = None;
    let result = rig
        .builder
        .build_archive_records(DEDUP_KEY, &mapping(1_500), &partial, NOW)
        .await
        .unwrap();
    assert!(!result.ok);
    assert_eq!(result.reason_code.as_str(), "g_output_missing_version_anchor");
    assert!(result.records.is_empty());
    assert!(result
        .detail
        .as_deref()
        .is_some_and(|d| d.contains("billingRuleVersion")));

    let staged = rig
        .builder
        .build_archive_records(DEDUP_KEY, &mapping(1_500), &anchors(), NOW)
        .await
        .unwrap();
    assert_eq!(staged.reason_code, ArchiveReason::RecordNew);
}

#[tokio::test]
async fn compensation_exhausts_after_sixteen_minutes_of_failures() {
    let rig = archive_rig();
    let built = rig
        .builder
        .build_archive_records(DEDUP_KEY, &mapping(1_500), &anchors(), NOW)
        .await
        .unwrap();
    let key = built.records[1].record_key.clone();
    let timeout = SinkOutcome::Failed(SinkFailure::Timeout);

    let mut backoffs = Vec::new();
    for minute in 0..=15 {
        let result = rig
            .builder
            .apply_archive_write_outcome(&key, &timeout, NOW + minute * MINUTE)
            .await
            .unwrap();
        assert_eq!(result.reason_code, ArchiveReason::ArchiveRetryScheduled);
        assert_eq!(result.record_status, Some(RecordStatus::New));
        backoffs.push(result.record.unwrap().retry_state.next_backoff_sec);
    }
    assert_eq!(&backoffs[..5], &[1, 5, 30, 120, 120]);

    let result = rig
        .builder
        .apply_archive_write_outcome(&key, &timeout, NOW + 16 * MINUTE)
        .await
        .unwrap();
    assert_eq!(
        result.reason_code.as_str(),
        "g_output_archive_compensation_exhausted"
    );
    assert_eq!(result.record_status, Some(RecordStatus::Conflicted));

    let record = rig.builder.replay_record(&key).await.unwrap().unwrap();
    assert_eq!(record.record_status, RecordStatus::Conflicted);
    assert_eq!(record.retry_state.first_failure_at_ms, Some(NOW));
    assert_eq!(record.retry_state.failure_count, 17);
    assert_eq!(record.retry_state.last_failure_code.as_deref(), Some("timeout"));

    let keys: Vec<String> = built.records.iter().map(|e| e.record_key.clone()).collect();
    for other in [&keys[0], &keys[2]] {
        rig.builder
            .apply_archive_write_outcome(other, &SinkOutcome::Committed, NOW + 17 * MINUTE)
            .await
            .unwrap();
    }
    assert_eq!(
        rig.builder.batch_closure_status(&keys).await.unwrap(),
        ClosureStatus::PartialTimeout
    );
}

#[tokio::test]
async fn committed_batch_closes_billable_or_non_billable() {
    let rig = archive_rig();
    let built = rig
        .builder
        .build_archive_records(DEDUP_KEY, &mapping(1_500), &anchors(), NOW)
        .await
        .unwrap();
    let keys: Vec<String> = built.records.iter().map(|e| e.record_key.clone()).collect();
    for key in &keys {
        let result = rig
            .builder
            .apply_archive_write_outcome(key, &SinkOutcome::Committed, NOW + 1)
            .await
            .unwrap();
        assert_eq!(result.reason_code.as_str(), "g_output_archive_committed");
    }
    assert_eq!(
        rig.builder.batch_closure_status(&keys).await.unwrap(),
        ClosureStatus::ConsistentCommitted
    );

    let rebuilt = rig
        .builder
        .build_archive_records(DEDUP_KEY, &mapping(1_500), &anchors(), NOW + 2)
        .await
        .unwrap();
    assert_eq!(rebuilt.closure_status, Some(ClosureStatus::ConsistentCommitted));

    let audit_only = MappingResult {
        fact_decision_audit_lite: Some(json!({"sourceEventId": "evt-src-2"})),
        ..MappingResult::default()
    };
    let built = rig
        .builder
        .build_archive_records("f_dedup_v1:computed:beef", &audit_only, &anchors(), NOW)
        .await
        .unwrap();
    let key = built.records[0].record_key.clone();
    rig.builder
        .apply_archive_write_outcome(&key, &SinkOutcome::Committed, NOW + 1)
        .await
        .unwrap();
    assert_eq!(
        rig.builder.batch_closure_status(&[key]).await.unwrap(),
        ClosureStatus::ConsistentNonBillable
    );
}

#[tokio::test]
async fn flush_record_retries_until_sink_commits() {
    let rig = archive_rig();
    let built = rig
        .builder
        .build_archive_records(DEDUP_KEY, &mapping(1_500), &anchors(), NOW)
        .await
        .unwrap();
    let key = built.records[0].record_key.clone();
    let sink = ScriptedSink::new(
        vec![
            SinkOutcome::Failed(SinkFailure::RateLimited),
            SinkOutcome::Failed(SinkFailure::TemporarilyUnavailable),
        ],
        SinkOutcome::Committed,
    );

    let result = rig.builder.flush_record(&key, &sink).await.unwrap();
    assert_eq!(result.reason_code, ArchiveReason::ArchiveCommitted);
    assert_eq!(rig.scheduler.slept(), vec![1_000, 5_000]);
    assert_eq!(sink.writes.load(Ordering::SeqCst), 3);

    let again = rig.builder.flush_record(&key, &sink).await.unwrap();
    assert_eq!(again.reason_code, ArchiveReason::RecordAlreadyTerminal);
    assert_eq!(sink.writes.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn flush_record_gives_up_after_compensation_window() {
    let rig = archive_rig();
    let built = rig
        .builder
        .build_archive_records(DEDUP_KEY, &mapping(1_500), &anchors(), NOW)
        .await
        .unwrap();
    let key = built.records[1].record_key.clone();
    let sink = ScriptedSink::new(Vec::new(), SinkOutcome::Failed(SinkFailure::Timeout));

    let result = rig.builder.flush_record(&key, &sink).await.unwrap();
    assert_eq!(result.reason_code, ArchiveReason::CompensationExhausted);
    assert_eq!(result.record_status, Some(RecordStatus::Conflicted));
    let slept: u64 = rig.scheduler.slept().iter().sum();
    assert!(slept > 15 * 60 * 1_000);
}

#[tokio::test]
async fn stored_archive_records_match_published_schema() {
    let schema = contract_schema("ArchiveRecord").expect("archive record schema embedded");
    let schema: Value = serde_json::from_str(schema.body).unwrap();
    let validator = jsonschema::validator_for(&schema).unwrap();

    let rig = archive_rig();
    let built = rig
        .builder
        .build_archive_records(DEDUP_KEY, &mapping(1_500), &anchors(), NOW)
        .await
        .unwrap();
    let key = built.records[1].record_key.clone();
    rig.builder
        .apply_archive_write_outcome(&key, &SinkOutcome::Failed(SinkFailure::Timeout), NOW + 1)
        .await
        .unwrap();

    for entry in &built.records {
        let stored = rig
            .builder
            .replay_record(&entry.record_key)
            .await
            .unwrap()
            .unwrap();
        let instance = serde_json::to_value(&stored).unwrap();
        assert!(
            validator.is_valid(&instance),
            "record {} does not match schema",
            entry.record_key
        );
    }
}
