use serde::{Deserialize, Serialize};

use crate::sha256_parts_hex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordType {
    DecisionAudit,
    BillableFact,
    AttributionFact,
}

impl RecordType {
    pub fn as_str(self) -> &'static str {
        match self {
            RecordType::DecisionAudit => "decision_audit",
            RecordType::BillableFact => "billable_fact",
            RecordType::AttributionFact => "attribution_fact",
        }
    }

    /// Payload field that carries the record's payload key.
    pub fn payload_key_field(self) -> &'static str {
        match self {
            RecordType::DecisionAudit => "sourceEventId",
            RecordType::BillableFact => "billingKey",
            RecordType::AttributionFact => "attributionKey",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    New,
    Committed,
    Duplicate,
    Conflicted,
    Rejected,
}

impl RecordStatus {
    pub fn is_terminal(self) -> bool {
        match self {
            RecordStatus::Committed | RecordStatus::Conflicted | RecordStatus::Rejected => true,
            RecordStatus::New | RecordStatus::Duplicate => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClosureStatus {
    PartialPending,
    PartialTimeout,
    ConsistentCommitted,
    ConsistentNonBillable,
}

/// Aggregate verdict over the stored statuses of one batch of records.
///
/// Pending wins over timeout so a caller keeps driving writes before it
/// escalates the batch.
pub fn closure_status<I>(records: I) -> ClosureStatus
where
    I: IntoIterator<Item = (RecordType, RecordStatus)>,
{
    let mut any_new = false;
    let mut any_conflicted = false;
    let mut billable_committed = false;
    for (record_type, status) in records {
        match status {
            RecordStatus::New | RecordStatus::Duplicate => any_new = true,
            RecordStatus::Conflicted => any_conflicted = true,
            RecordStatus::Committed => {
                if record_type == RecordType::BillableFact {
                    billable_committed = true;
                }
            }
            RecordStatus::Rejected => {}
        }
    }
    if any_new {
        ClosureStatus::PartialPending
    } else if any_conflicted {
        ClosureStatus::PartialTimeout
    } else if billable_committed {
        ClosureStatus::ConsistentCommitted
    } else {
        ClosureStatus::ConsistentNonBillable
    }
}

pub fn archive_record_key(
    record_type: RecordType,
    payload_key: &str,
    canonical_dedup_key: &str,
    archive_contract_version: &str,
) -> String {
    sha256_parts_hex(&[
        record_type.as_str(),
        payload_key,
        canonical_dedup_key,
        archive_contract_version,
    ])
}
