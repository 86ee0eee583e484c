use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config failed: {0}")]
    Read(String),
    #[error("parse config failed: {0}")]
    Parse(String),
    #[error("schema load failed: {0}")]
    SchemaLoad(String),
    #[error("schema validation failed: {0}")]
    SchemaValidation(String),
    #[error("unsupported config: {0}")]
    UnsupportedConfig(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub store: Store,
    #[serde(default)]
    pub gate: Gate,
    #[serde(default)]
    pub emitter: Emitter,
    #[serde(default)]
    pub archive: Archive,
    #[serde(default)]
    pub logging: Logging,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Store {
    #[serde(rename = "type")]
    pub kind: String,
    pub sqlite_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Gate {
    #[serde(default = "default_inflight_lock_ttl_ms")]
    pub inflight_lock_ttl_ms: u64,
    #[serde(default = "default_billing_window_ms")]
    pub billing_window_ms: u64,
    #[serde(default = "default_diagnostics_window_ms")]
    pub diagnostics_window_ms: u64,
    #[serde(default = "default_dedup_fingerprint_version")]
    pub dedup_fingerprint_version: String,
}

impl Default for Gate {
    fn default() -> Self {
        Self {
            inflight_lock_ttl_ms: default_inflight_lock_ttl_ms(),
            billing_window_ms: default_billing_window_ms(),
            diagnostics_window_ms: default_diagnostics_window_ms(),
            dedup_fingerprint_version: default_dedup_fingerprint_version(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Emitter {
    #[serde(default = "default_retry_schedule_ms")]
    pub retry_schedule_ms: Vec<u64>,
    #[serde(default = "default_max_retry_window_ms")]
    pub max_retry_window_ms: u64,
    #[serde(default)]
    pub sample_rate_bps: u32,
    #[serde(default = "default_sampling_rule_version")]
    pub sampling_rule_version: String,
}

impl Default for Emitter {
    fn default() -> Self {
        Self {
            retry_schedule_ms: default_retry_schedule_ms(),
            max_retry_window_ms: default_max_retry_window_ms(),
            sample_rate_bps: 0,
            sampling_rule_version: default_sampling_rule_version(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Archive {
    #[serde(default = "default_backoff_schedule_sec")]
    pub backoff_schedule_sec: Vec<u64>,
    #[serde(default = "default_compensation_window_ms")]
    pub compensation_window_ms: u64,
}

impl Default for Archive {
    fn default() -> Self {
        Self {
            backoff_schedule_sec: default_backoff_schedule_sec(),
            compensation_window_ms: default_compensation_window_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Logging {
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            format: default_log_format(),
        }
    }
}

fn default_inflight_lock_ttl_ms() -> u64 {
    120_000
}

fn default_billing_window_ms() -> u64 {
    14 * 24 * 60 * 60 * 1000
}

fn default_diagnostics_window_ms() -> u64 {
    3 * 24 * 60 * 60 * 1000
}

fn default_dedup_fingerprint_version() -> String {
    "f_dedup_v1".to_string()
}

fn default_retry_schedule_ms() -> Vec<u64> {
    vec![1_000, 5_000, 30_000, 120_000]
}

fn default_max_retry_window_ms() -> u64 {
    15 * 60 * 1000
}

fn default_sampling_rule_version() -> String {
    "b_sig_sampling_v1".to_string()
}

fn default_backoff_schedule_sec() -> Vec<u64> {
    vec![1, 5, 30, 120]
}

fn default_compensation_window_ms() -> u64 {
    15 * 60 * 1000
}

fn default_log_format() -> String {
    "pretty".to_string()
}

pub fn load_and_validate(path: &str) -> Result<Config, ConfigError> {
    let config_text =
        std::fs::read_to_string(path).map_err(|e| ConfigError::Read(e.to_string()))?;
    let value: serde_yaml::Value =
        serde_yaml::from_str(&config_text).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let instance = serde_json::to_value(value).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_against_schema(&instance)?;

    let cfg: Config =
        serde_json::from_value(instance).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_runtime_support(&cfg)?;
    Ok(cfg)
}

fn validate_against_schema(instance: &serde_json::Value) -> Result<(), ConfigError> {
    let schema_path = [
        std::path::PathBuf::from("config/config.schema.json"),
        std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .join("config/config.schema.json"),
    ]
    .into_iter()
    .find(|p| p.exists())
    .ok_or_else(|| {
        ConfigError::SchemaLoad(
            "config schema not found at config/config.schema.json or workspace config path"
                .to_string(),
        )
    })?;

    let schema_text =
        std::fs::read_to_string(schema_path).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    let schema: serde_json::Value =
        serde_json::from_str(&schema_text).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;

    let validator =
        jsonschema::validator_for(&schema).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    if let Err(first) = validator.validate(instance) {
        return Err(ConfigError::SchemaValidation(first.to_string()));
    }
    Ok(())
}

fn validate_runtime_support(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.store.kind != "memory" && cfg.store.kind != "sqlite" {
        return Err(ConfigError::UnsupportedConfig(format!(
            "store.type={} is not implemented; supported: memory, sqlite",
            cfg.store.kind
        )));
    }
    if cfg.store.kind == "memory" && cfg.store.sqlite_path.is_some() {
        return Err(ConfigError::UnsupportedConfig(
            "store.sqlite_path is not supported when store.type=memory".to_string(),
        ));
    }
    if cfg.store.kind == "sqlite"
        && cfg
            .store
            .sqlite_path
            .as_ref()
            .map(|v| v.trim().is_empty())
            .unwrap_or(true)
    {
        return Err(ConfigError::UnsupportedConfig(
            "store.sqlite_path is required when store.type=sqlite".to_string(),
        ));
    }
    if cfg.gate.inflight_lock_ttl_ms == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "gate.inflight_lock_ttl_ms must be >= 1".to_string(),
        ));
    }
    if cfg.gate.billing_window_ms == 0 || cfg.gate.diagnostics_window_ms == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "gate dedup windows must be >= 1".to_string(),
        ));
    }
    if cfg.gate.dedup_fingerprint_version.trim().is_empty() {
        return Err(ConfigError::UnsupportedConfig(
            "gate.dedup_fingerprint_version must not be blank".to_string(),
        ));
    }
    if cfg.emitter.retry_schedule_ms.is_empty() {
        return Err(ConfigError::UnsupportedConfig(
            "emitter.retry_schedule_ms must contain at least one delay".to_string(),
        ));
    }
    if cfg.emitter.sample_rate_bps > 10_000 {
        return Err(ConfigError::UnsupportedConfig(format!(
            "emitter.sample_rate_bps={} exceeds 10000",
            cfg.emitter.sample_rate_bps
        )));
    }
    if cfg.archive.backoff_schedule_sec.is_empty() {
        return Err(ConfigError::UnsupportedConfig(
            "archive.backoff_schedule_sec must contain at least one delay".to_string(),
        ));
    }
    if cfg.archive.compensation_window_ms == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "archive.compensation_window_ms must be >= 1".to_string(),
        ));
    }
    if cfg.logging.format != "json" && cfg.logging.format != "pretty" {
        return Err(ConfigError::UnsupportedConfig(format!(
            "logging.format={} is not implemented; supported: json, pretty",
            cfg.logging.format
        )));
    }
    Ok(())
}
