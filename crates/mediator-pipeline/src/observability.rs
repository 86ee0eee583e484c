//! Logging initialization and span helpers.

use std::sync::Once;

use tracing::Span;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INIT: Once = Once::new();

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    #[default]
    Pretty,
}

impl LogFormat {
    /// Maps the `logging.format` config value; unknown values fall back to pretty.
    pub fn from_config(value: &str) -> Self {
        match value {
            "json" => LogFormat::Json,
            _ => LogFormat::Pretty,
        }
    }
}

/// Installs the global subscriber. Later calls are no-ops.
///
/// `RUST_LOG` controls levels, defaulting to `info`.
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        // try_init so a subscriber installed by a test harness is left alone
        let _ = match format {
            LogFormat::Json => tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .try_init(),
            LogFormat::Pretty => tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().pretty().with_writer(std::io::stderr))
                .try_init(),
        };
    });
}

#[must_use]
pub fn gate_span(operation: &str, app_id: &str, batch_id: &str) -> Span {
    tracing::info_span!("gate", op = operation, app_id = app_id, batch_id = batch_id)
}

#[must_use]
pub fn emitter_span(kind: &str, trace_key: &str) -> Span {
    tracing::info_span!("emitter", kind = kind, trace_key = trace_key)
}

#[must_use]
pub fn archive_span(operation: &str) -> Span {
    tracing::info_span!("archive", op = operation)
}
