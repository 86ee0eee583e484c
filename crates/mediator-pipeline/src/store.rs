//! Compare-and-set key-value storage shared by the pipeline components.
//!
//! Every check-then-set in the pipeline is a single [`KvStore::put_if`]
//! call. Backends guarantee that a successful write yields version
//! `previous + 1`, and that the first write of a key yields version 1.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::PipelineError;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store open failed: {0}")]
    Open(String),
    #[error("store backend failed: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    pub value: String,
    pub version: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precondition {
    /// Write only if the key has never been written.
    Absent,
    /// Write only if the stored version still matches.
    Version(u64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasResult {
    Written { version: u64 },
    /// Not an error: the caller lost a race and gets the current value back.
    PreconditionFailed { current: Option<Versioned> },
}

#[async_trait]
pub trait KvStore: Send + Sync + 'static {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Versioned>, StoreError>;

    async fn put_if(
        &self,
        namespace: &str,
        key: &str,
        value: String,
        precondition: Precondition,
    ) -> Result<CasResult, StoreError>;
}

#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<(String, String), Versioned>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Versioned>, StoreError> {
        let entries = self.entries.lock().await;
        Ok(entries
            .get(&(namespace.to_string(), key.to_string()))
            .cloned())
    }

    async fn put_if(
        &self,
        namespace: &str,
        key: &str,
        value: String,
        precondition: Precondition,
    ) -> Result<CasResult, StoreError> {
        let mut entries = self.entries.lock().await;
        let slot = (namespace.to_string(), key.to_string());
        let current = entries.get(&slot).cloned();
        let next_version = match (precondition, &current) {
            (Precondition::Absent, None) => 1,
            (Precondition::Version(expected), Some(existing)) if existing.version == expected => {
                expected + 1
            }
            _ => return Ok(CasResult::PreconditionFailed { current }),
        };
        entries.insert(
            slot,
            Versioned {
                value,
                version: next_version,
            },
        );
        Ok(CasResult::Written {
            version: next_version,
        })
    }
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(|e| StoreError::Open(e.to_string()))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(|e| StoreError::Open(e.to_string()))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS kv (
                namespace TEXT NOT NULL,
                key TEXT NOT NULL,
                version INTEGER NOT NULL,
                value TEXT NOT NULL,
                PRIMARY KEY (namespace, key)
            );
            ",
        )
        .map_err(|e| StoreError::Open(e.to_string()))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn read_row(
    conn: &Connection,
    namespace: &str,
    key: &str,
) -> Result<Option<Versioned>, StoreError> {
    conn.query_row(
        "SELECT value, version FROM kv WHERE namespace = ?1 AND key = ?2",
        params![namespace, key],
        |row| {
            let value: String = row.get(0)?;
            let version: i64 = row.get(1)?;
            Ok(Versioned {
                value,
                version: version as u64,
            })
        },
    )
    .optional()
    .map_err(|e| StoreError::Backend(e.to_string()))
}

#[async_trait]
impl KvStore for SqliteStore {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Versioned>, StoreError> {
        let conn = self.conn.lock().await;
        read_row(&conn, namespace, key)
    }

    async fn put_if(
        &self,
        namespace: &str,
        key: &str,
        value: String,
        precondition: Precondition,
    ) -> Result<CasResult, StoreError> {
        let conn = self.conn.lock().await;
        let (changed, version) = match precondition {
            Precondition::Absent => {
                let changed = conn
                    .execute(
                        "
                        INSERT INTO kv(namespace, key, version, value)
                        VALUES (?1, ?2, 1, ?3)
                        ON CONFLICT(namespace, key) DO NOTHING
                        ",
                        params![namespace, key, value],
                    )
                    .map_err(|e| StoreError::Backend(e.to_string()))?;
                (changed, 1)
            }
            Precondition::Version(expected) => {
                let changed = conn
                    .execute(
                        "
                        UPDATE kv SET value = ?1, version = version + 1
                        WHERE namespace = ?2 AND key = ?3 AND version = ?4
                        ",
                        params![value, namespace, key, expected as i64],
                    )
                    .map_err(|e| StoreError::Backend(e.to_string()))?;
                (changed, expected + 1)
            }
        };
        if changed == 1 {
            return Ok(CasResult::Written { version });
        }
        Ok(CasResult::PreconditionFailed {
            current: read_row(&conn, namespace, key)?,
        })
    }
}

/// Outcome of a typed compare-and-set.
#[derive(Debug)]
pub(crate) enum Cas<T> {
    Written,
    Lost(Option<(T, u64)>),
}

/// Serde view over one namespace of a [`KvStore`].
pub(crate) struct RecordStore<T> {
    store: Arc<dyn KvStore>,
    namespace: &'static str,
    _record: PhantomData<fn() -> T>,
}

impl<T> RecordStore<T>
where
    T: Serialize + DeserializeOwned,
{
    pub(crate) fn new(store: Arc<dyn KvStore>, namespace: &'static str) -> Self {
        Self {
            store,
            namespace,
            _record: PhantomData,
        }
    }

    pub(crate) async fn load(&self, key: &str) -> Result<Option<(T, u64)>, PipelineError> {
        match self.store.get(self.namespace, key).await? {
            Some(raw) => Ok(Some(self.decode(raw)?)),
            None => Ok(None),
        }
    }

    pub(crate) async fn insert_new(&self, key: &str, record: &T) -> Result<Cas<T>, PipelineError> {
        self.put(key, record, Precondition::Absent).await
    }

    pub(crate) async fn replace(
        &self,
        key: &str,
        record: &T,
        version: u64,
    ) -> Result<Cas<T>, PipelineError> {
        self.put(key, record, Precondition::Version(version)).await
    }

    async fn put(
        &self,
        key: &str,
        record: &T,
        precondition: Precondition,
    ) -> Result<Cas<T>, PipelineError> {
        let value =
            serde_json::to_string(record).map_err(|e| PipelineError::Serialization(e.to_string()))?;
        match self
            .store
            .put_if(self.namespace, key, value, precondition)
            .await?
        {
            CasResult::Written { .. } => Ok(Cas::Written),
            CasResult::PreconditionFailed { current } => {
                Ok(Cas::Lost(current.map(|raw| self.decode(raw)).transpose()?))
            }
        }
    }

    fn decode(&self, raw: Versioned) -> Result<(T, u64), PipelineError> {
        let record = serde_json::from_str(&raw.value)
            .map_err(|e| PipelineError::Serialization(e.to_string()))?;
        Ok((record, raw.version))
    }
}
