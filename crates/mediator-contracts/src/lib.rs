use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub const CONTRACT_VERSION: &str = "1.0.0";

/// Placeholder written for optional key components that are genuinely absent.
pub const NOT_APPLICABLE: &str = "NA";

#[derive(Debug, Clone)]
pub struct ContractSchemaManifest {
    pub path: &'static str,
    /// The schema's `title`, unique within the set.
    pub title: &'static str,
    pub sha256: &'static str,
    pub body: &'static str,
}

#[derive(Debug, Clone)]
pub struct ContractsManifest {
    pub contract_version: &'static str,
    pub contracts_set_sha256: &'static str,
    pub generated_at: &'static str,
    pub schemas: Vec<ContractSchemaManifest>,
}

include!(concat!(env!("OUT_DIR"), "/generated_contracts.rs"));

pub fn contracts_manifest_v1() -> ContractsManifest {
    ContractsManifest {
        contract_version: CONTRACT_VERSION,
        contracts_set_sha256: GENERATED_CONTRACTS_SET_SHA256,
        generated_at: GENERATED_AT_RFC3339,
        schemas: GENERATED_CONTRACT_SCHEMAS
            .iter()
            .map(|(path, title, sha256, body)| ContractSchemaManifest {
                path,
                title,
                sha256,
                body,
            })
            .collect(),
    }
}

/// Looks up one embedded schema by its `title`, e.g. `"ArchiveRecord"`.
pub fn contract_schema(title: &str) -> Option<ContractSchemaManifest> {
    contracts_manifest_v1()
        .schemas
        .into_iter()
        .find(|schema| schema.title == title)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    OpportunityCreated,
    AuctionStarted,
    AdFilled,
    Impression,
    Click,
    Interaction,
    Postback,
    Error,
    Failure,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::OpportunityCreated => "opportunity_created",
            EventType::AuctionStarted => "auction_started",
            EventType::AdFilled => "ad_filled",
            EventType::Impression => "impression",
            EventType::Click => "click",
            EventType::Interaction => "interaction",
            EventType::Postback => "postback",
            EventType::Error => "error",
            EventType::Failure => "failure",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventIdScope {
    BatchScoped,
    GlobalUnique,
}

/// One inbound event as delivered by ingestion.
///
/// Type-specific digest fields are optional at the wire level; which of them
/// are load-bearing depends on `event_type`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct EventEnvelope {
    pub event_type: EventType,
    pub event_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opportunity_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub render_attempt_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id_scope: Option<EventIdScope>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_seq: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placement_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auction_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creative_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub click_target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interaction_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postback_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postback_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_code: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, Value>,
}

impl EventEnvelope {
    pub fn new(event_type: EventType, event_at: impl Into<String>) -> Self {
        Self {
            event_type,
            event_at: event_at.into(),
            trace_key: None,
            request_key: None,
            attempt_key: None,
            opportunity_key: None,
            response_reference: None,
            render_attempt_id: None,
            idempotency_key: None,
            event_id: None,
            event_id_scope: None,
            event_seq: None,
            placement_id: None,
            auction_id: None,
            creative_id: None,
            click_target: None,
            interaction_type: None,
            postback_type: None,
            postback_status: None,
            error_code: None,
            failure_code: None,
            attributes: BTreeMap::new(),
        }
    }
}

/// Ingestion request line: one envelope plus its routing context.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct IngestRequest {
    pub app_id: String,
    pub batch_id: String,
    pub event: EventEnvelope,
    #[serde(default)]
    pub global_unique_verified: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    Accepted,
    Duplicate,
    Rejected,
}

impl AckStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AckStatus::Accepted => "accepted",
            AckStatus::Duplicate => "duplicate",
            AckStatus::Rejected => "rejected",
        }
    }
}

/// Answer from the downstream transport for one delivery attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AckResult {
    pub ack_status: AckStatus,
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack_reason_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acked_at: Option<String>,
}

impl AckResult {
    pub fn accepted() -> Self {
        Self {
            ack_status: AckStatus::Accepted,
            retryable: false,
            ack_reason_code: None,
            acked_at: None,
        }
    }

    pub fn rejected(retryable: bool, reason_code: impl Into<String>) -> Self {
        Self {
            ack_status: AckStatus::Rejected,
            retryable,
            ack_reason_code: Some(reason_code.into()),
            acked_at: None,
        }
    }
}

/// Delivery context handed to the ack function on every attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AckContext {
    pub attempt_index: u32,
    pub retry_schedule_ms: Vec<u64>,
    pub max_retry_window_ms: u64,
}

/// Upstream rule and contract versions that produced an output.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VersionAnchors {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_contract_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mapping_rule_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedup_fingerprint_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closure_rule_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub billing_rule_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_contract_version: Option<String>,
}

impl VersionAnchors {
    /// Names of anchors that are absent or blank, in declaration order.
    pub fn missing(&self) -> Vec<&'static str> {
        [
            ("eventContractVersion", &self.event_contract_version),
            ("mappingRuleVersion", &self.mapping_rule_version),
            ("dedupFingerprintVersion", &self.dedup_fingerprint_version),
            ("closureRuleVersion", &self.closure_rule_version),
            ("billingRuleVersion", &self.billing_rule_version),
            ("archiveContractVersion", &self.archive_contract_version),
        ]
        .into_iter()
        .filter(|(_, v)| v.as_deref().map(|s| s.trim().is_empty()).unwrap_or(true))
        .map(|(name, _)| name)
        .collect()
    }
}

/// Output of the business mapping stage that feeds the archive.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingResult {
    #[serde(default)]
    pub fact_decision_audit_lite: Option<Value>,
    #[serde(default)]
    pub billable_facts: Vec<Value>,
    #[serde(default)]
    pub attribution_facts: Vec<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OpportunityCreatedInput {
    pub trace_key: String,
    pub request_key: String,
    pub opportunity_key: String,
    pub app_id: String,
    #[serde(default)]
    pub placement_id: Option<String>,
    pub occurred_at: String,
    pub event_contract_version: String,
    #[serde(default)]
    pub mapping_rule_version: Option<String>,
    #[serde(default)]
    pub context: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SignalNormalizedInput {
    pub trace_key: String,
    pub request_key: String,
    pub opportunity_key: String,
    pub signal_type: String,
    pub normalized_signal: Value,
    pub occurred_at: String,
    pub event_contract_version: String,
    #[serde(default)]
    pub sampling_rule_version: Option<String>,
    #[serde(default)]
    pub sample_rate_bps: Option<u32>,
    #[serde(default)]
    pub debug_force_sample: bool,
}
