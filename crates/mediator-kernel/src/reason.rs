//! Closed reason-code enumerations.
//!
//! The literal strings are part of the external contract: they are logged,
//! persisted in record history and returned to callers. Adding a variant
//! means adding its literal here; there is no fallthrough arm.

use serde::{Deserialize, Serialize, Serializer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GateReason {
    Accepted,
    InflightLocked,
    InflightDuplicate,
    CommittedDuplicate,
    PayloadConflict,
    EventStale,
    EventAtInvalid,
    GlobalUniquenessUnverified,
    InvalidNoFallback,
    CommitWithoutLock,
    LockLost,
}

impl GateReason {
    pub fn as_str(self) -> &'static str {
        match self {
            GateReason::Accepted => "f_dedup_accepted",
            GateReason::InflightLocked => "f_dedup_inflight_locked",
            GateReason::InflightDuplicate => "f_dedup_inflight_duplicate",
            GateReason::CommittedDuplicate => "f_dedup_committed_duplicate",
            GateReason::PayloadConflict => "f_dedup_payload_conflict",
            GateReason::EventStale => "f_event_stale_outside_dedup_window",
            GateReason::EventAtInvalid => "f_event_at_invalid",
            GateReason::GlobalUniquenessUnverified => "f_event_id_global_uniqueness_unverified",
            GateReason::InvalidNoFallback => "f_event_id_invalid_no_fallback",
            GateReason::CommitWithoutLock => "f_dedup_commit_without_lock",
            GateReason::LockLost => "f_dedup_lock_lost",
        }
    }
}

/// Which emitter instantiation produced a reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmitKind {
    OpportunityCreated,
    SignalNormalized,
}

impl EmitKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EmitKind::OpportunityCreated => "opportunity_created",
            EmitKind::SignalNormalized => "signal_normalized",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EmitReason {
    Emitted,
    AckDuplicate,
    DuplicateNoop,
    SampledOut,
    ContractInvalid,
    PayloadConflict,
    AckRejected,
    RetryExhausted,
}

impl EmitReason {
    pub fn code(self, kind: EmitKind) -> &'static str {
        match (kind, self) {
            (EmitKind::OpportunityCreated, EmitReason::Emitted) => "b_opp_evt_emitted",
            (EmitKind::OpportunityCreated, EmitReason::AckDuplicate) => "b_opp_evt_ack_duplicate",
            (EmitKind::OpportunityCreated, EmitReason::DuplicateNoop) => {
                "b_opp_evt_duplicate_noop"
            }
            (EmitKind::OpportunityCreated, EmitReason::SampledOut) => "b_opp_evt_sampled_out",
            (EmitKind::OpportunityCreated, EmitReason::ContractInvalid) => {
                "b_opp_evt_contract_invalid"
            }
            (EmitKind::OpportunityCreated, EmitReason::PayloadConflict) => {
                "b_opp_evt_payload_conflict"
            }
            (EmitKind::OpportunityCreated, EmitReason::AckRejected) => "b_opp_evt_ack_rejected",
            (EmitKind::OpportunityCreated, EmitReason::RetryExhausted) => {
                "b_opp_evt_retry_exhausted"
            }
            (EmitKind::SignalNormalized, EmitReason::Emitted) => "b_sig_evt_emitted",
            (EmitKind::SignalNormalized, EmitReason::AckDuplicate) => "b_sig_evt_ack_duplicate",
            (EmitKind::SignalNormalized, EmitReason::DuplicateNoop) => "b_sig_evt_duplicate_noop",
            (EmitKind::SignalNormalized, EmitReason::SampledOut) => "b_sig_evt_sampled_out",
            (EmitKind::SignalNormalized, EmitReason::ContractInvalid) => {
                "b_sig_evt_contract_invalid"
            }
            (EmitKind::SignalNormalized, EmitReason::PayloadConflict) => {
                "b_sig_evt_payload_conflict"
            }
            (EmitKind::SignalNormalized, EmitReason::AckRejected) => "b_sig_evt_ack_rejected",
            (EmitKind::SignalNormalized, EmitReason::RetryExhausted) => {
                "b_sig_evt_retry_exhausted"
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArchiveReason {
    RecordNew,
    RecordDuplicate,
    RecordKeyPayloadMismatch,
    MissingVersionAnchor,
    PayloadKeyMissing,
    ArchiveCommitted,
    ArchiveRetryScheduled,
    ArchiveWriteRejected,
    CompensationExhausted,
    RecordNotFound,
    RecordAlreadyTerminal,
}

impl ArchiveReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ArchiveReason::RecordNew => "g_output_record_new",
            ArchiveReason::RecordDuplicate => "g_output_record_duplicate",
            ArchiveReason::RecordKeyPayloadMismatch => "g_output_recordkey_payload_mismatch",
            ArchiveReason::MissingVersionAnchor => "g_output_missing_version_anchor",
            ArchiveReason::PayloadKeyMissing => "g_output_payload_key_missing",
            ArchiveReason::ArchiveCommitted => "g_output_archive_committed",
            ArchiveReason::ArchiveRetryScheduled => "g_output_archive_retry_scheduled",
            ArchiveReason::ArchiveWriteRejected => "g_output_archive_write_rejected",
            ArchiveReason::CompensationExhausted => "g_output_archive_compensation_exhausted",
            ArchiveReason::RecordNotFound => "g_output_record_not_found",
            ArchiveReason::RecordAlreadyTerminal => "g_output_record_already_terminal",
        }
    }
}

impl Serialize for GateReason {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl Serialize for ArchiveReason {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}
