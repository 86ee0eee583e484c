pub mod archive;
pub mod emitter;
pub mod gate;
pub mod observability;
pub mod runtime;
pub mod store;

use std::sync::Arc;

use mediator_config::Config;
use thiserror::Error;

pub use archive::{
    ArchiveBuildResult, ArchiveBuilder, ArchiveConfig, ArchiveEntry, ArchiveRecord, ArchiveSink,
    SinkFailure, SinkOutcome, WriteOutcomeResult,
};
pub use emitter::{
    AckFn, DeliveryStatus, EmitAction, EmitResult, EmitterConfig, OutboundEventRecord,
    ReliableEmitter,
};
pub use gate::{DedupRecord, DedupState, GateConfig, GateOutcome, IdempotencyGate};
pub use runtime::{
    Clock, EventKeyFactory, Scheduler, SystemClock, TokioScheduler, UuidKeyFactory,
};
pub use store::{CasResult, KvStore, MemoryStore, Precondition, SqliteStore, StoreError, Versioned};

/// Upper bound on re-read/re-classify rounds for one key before giving up.
pub(crate) const MAX_CAS_ATTEMPTS: u32 = 16;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("record serialization failed: {0}")]
    Serialization(String),
    #[error("key {key} still contended after {attempts} compare-and-set attempts")]
    Contention { key: String, attempts: u32 },
}

pub fn open_store(cfg: &Config) -> Result<Arc<dyn KvStore>, PipelineError> {
    if cfg.store.kind == "sqlite" {
        let path = cfg
            .store
            .sqlite_path
            .as_deref()
            .ok_or_else(|| StoreError::Open("store.sqlite_path is required".to_string()))?;
        Ok(Arc::new(SqliteStore::open(path)?))
    } else {
        Ok(Arc::new(MemoryStore::new()))
    }
}

/// The three components wired to one configured store.
pub struct Pipeline {
    pub gate: IdempotencyGate,
    pub emitter: ReliableEmitter,
    pub archive: ArchiveBuilder,
}

impl Pipeline {
    pub fn from_config(cfg: &Config, ack: Arc<dyn AckFn>) -> Result<Self, PipelineError> {
        let store = open_store(cfg)?;
        Ok(Self::with_store(cfg, store, ack))
    }

    pub fn with_store(cfg: &Config, store: Arc<dyn KvStore>, ack: Arc<dyn AckFn>) -> Self {
        Self {
            gate: IdempotencyGate::new(store.clone(), GateConfig::from_config(&cfg.gate)),
            emitter: ReliableEmitter::new(
                store.clone(),
                ack,
                EmitterConfig::from_config(&cfg.emitter),
            ),
            archive: ArchiveBuilder::new(store, ArchiveConfig::from_config(&cfg.archive)),
        }
    }
}
