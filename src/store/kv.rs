//! Versioned key-value buckets.
//!
//! A bucket maps keys to byte values. Every write is stamped with a
//! bucket-wide, strictly increasing revision, and writes can be made
//! conditional on that revision:
//!
//! - [`KvBucket::create`] succeeds only if the key is absent (or deleted, or expired).
//! - [`KvBucket::update`] succeeds only if the key's current revision equals the
//!   revision the caller last saw.
//!
//! Those two primitives are the only coordination mechanism between replicas:
//! a writer holding a stale revision always loses.
//!
//! # Persistence
//!
//! Each bucket is an operation log at `<data>/kv/<BUCKET>.log`. Values are
//! hex-encoded so arbitrary bytes survive the JSON framing. On open the log is
//! replayed and, when most of its records are dead, rewritten with only the
//! live entries.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use super::oplog::{LogError, OpLog};
use crate::retry::{Classify, ErrorKind};

/// Minimum log size before compaction on open is considered.
const COMPACTION_MIN_RECORDS: u64 = 64;

/// Errors returned by bucket operations.
#[derive(Debug, Error)]
pub enum KvError {
    #[error("key not found: {bucket}/{key}")]
    KeyNotFound { bucket: String, key: String },

    #[error("key already exists: {bucket}/{key}")]
    KeyExists { bucket: String, key: String },

    /// The caller's expected revision is stale.
    #[error("wrong last revision for {key}: expected {expected}, current {current:?}")]
    WrongLastRevision {
        key: String,
        expected: u64,
        current: Option<u64>,
    },

    #[error("invalid key: {0:?}")]
    InvalidKey(String),

    #[error("invalid bucket name: {0:?}")]
    InvalidBucket(String),

    #[error("corrupt bucket log: {0}")]
    Corrupt(String),

    #[error("bucket log error: {0}")]
    Log(#[from] LogError),

    #[error("bucket task failed: {0}")]
    Closed(String),
}

impl Classify for KvError {
    fn kind(&self) -> ErrorKind {
        match self {
            KvError::WrongLastRevision { .. } => ErrorKind::Transient,
            KvError::Log(LogError::Io(_)) | KvError::Closed(_) => ErrorKind::Transient,
            _ => ErrorKind::Permanent,
        }
    }
}

/// Result type for bucket operations.
pub type Result<T> = std::result::Result<T, KvError>;

/// Bucket configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvConfig {
    pub bucket: String,
    /// Entries older than this read as absent and are dropped on compaction.
    pub max_age: Option<Duration>,
    /// fsync after every write.
    pub sync_writes: bool,
}

impl KvConfig {
    pub fn new(bucket: impl Into<String>) -> Self {
        KvConfig {
            bucket: bucket.into(),
            max_age: None,
            sync_writes: true,
        }
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    pub fn with_sync_writes(mut self, sync_writes: bool) -> Self {
        self.sync_writes = sync_writes;
        self
    }
}

/// A live key and its value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: String,
    pub value: Vec<u8>,
    pub revision: u64,
    pub created: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum KvOp {
    Put {
        key: String,
        value: String,
        revision: u64,
        created: DateTime<Utc>,
    },
    Delete {
        key: String,
        revision: u64,
    },
    /// Written at the end of a compacted log to preserve the revision counter.
    Checkpoint { revision: u64 },
}

struct KvInner {
    log: OpLog<KvOp>,
    entries: BTreeMap<String, Entry>,
    last_revision: u64,
}

/// A persisted, revisioned key-value bucket.
pub struct KvBucket {
    config: KvConfig,
    inner: Mutex<KvInner>,
}

impl std::fmt::Debug for KvBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvBucket")
            .field("bucket", &self.config.bucket)
            .finish()
    }
}

/// Returns true if `key` is usable as a bucket key.
pub fn is_valid_key(key: &str) -> bool {
    !key.is_empty()
        && !key.starts_with('.')
        && !key.ends_with('.')
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '=' | '.' | '/'))
}

/// Returns true if `name` is usable as a bucket or stream name.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

impl KvBucket {
    /// Opens the bucket stored under `dir`, creating it if needed.
    pub fn open(dir: &Path, config: KvConfig) -> Result<Self> {
        if !is_valid_name(&config.bucket) {
            return Err(KvError::InvalidBucket(config.bucket));
        }

        let path = dir.join(format!("{}.log", config.bucket));
        let (log, records) = OpLog::open(&path, config.sync_writes)?;

        let mut entries = BTreeMap::new();
        let mut last_revision = 0;
        for record in records {
            match record.op {
                KvOp::Put {
                    key,
                    value,
                    revision,
                    created,
                } => {
                    let value = hex::decode(&value)
                        .map_err(|e| KvError::Corrupt(format!("value for {key}: {e}")))?;
                    last_revision = last_revision.max(revision);
                    entries.insert(
                        key.clone(),
                        Entry {
                            key,
                            value,
                            revision,
                            created,
                        },
                    );
                }
                KvOp::Delete { key, revision } => {
                    last_revision = last_revision.max(revision);
                    entries.remove(&key);
                }
                KvOp::Checkpoint { revision } => {
                    last_revision = last_revision.max(revision);
                }
            }
        }

        let bucket = KvBucket {
            config,
            inner: Mutex::new(KvInner {
                log,
                entries,
                last_revision,
            }),
        };
        bucket.compact_if_sparse()?;

        debug!(bucket = %bucket.config.bucket, "Opened bucket");
        Ok(bucket)
    }

    pub fn name(&self) -> &str {
        &self.config.bucket
    }

    pub fn config(&self) -> &KvConfig {
        &self.config
    }

    /// Writes `value` under `key` only if the key holds no live value.
    pub fn create(&self, key: &str, value: &[u8]) -> Result<u64> {
        self.validate_key(key)?;
        let mut inner = self.lock();
        let now = Utc::now();
        if self.live(&inner, key, now).is_some() {
            return Err(KvError::KeyExists {
                bucket: self.config.bucket.clone(),
                key: key.to_string(),
            });
        }
        self.write(&mut inner, key, value, now)
    }

    /// Writes `value` under `key` only if its current revision is `expected`.
    pub fn update(&self, key: &str, value: &[u8], expected: u64) -> Result<u64> {
        self.validate_key(key)?;
        let mut inner = self.lock();
        let now = Utc::now();
        let current = self.live(&inner, key, now).map(|e| e.revision);
        if current != Some(expected) {
            return Err(KvError::WrongLastRevision {
                key: key.to_string(),
                expected,
                current,
            });
        }
        self.write(&mut inner, key, value, now)
    }

    /// Writes `value` under `key` unconditionally.
    pub fn put(&self, key: &str, value: &[u8]) -> Result<u64> {
        self.validate_key(key)?;
        let mut inner = self.lock();
        self.write(&mut inner, key, value, Utc::now())
    }

    /// Returns the live entry for `key`.
    pub fn get(&self, key: &str) -> Result<Entry> {
        self.entry(key)?.ok_or_else(|| KvError::KeyNotFound {
            bucket: self.config.bucket.clone(),
            key: key.to_string(),
        })
    }

    /// Returns the live entry for `key`, if any.
    pub fn entry(&self, key: &str) -> Result<Option<Entry>> {
        self.validate_key(key)?;
        let inner = self.lock();
        Ok(self.live(&inner, key, Utc::now()).cloned())
    }

    /// Removes `key`. Deleting an absent key succeeds.
    pub fn delete(&self, key: &str) -> Result<()> {
        self.validate_key(key)?;
        let mut inner = self.lock();
        if !inner.entries.contains_key(key) {
            return Ok(());
        }
        let revision = inner.last_revision + 1;
        inner.log.append(&KvOp::Delete {
            key: key.to_string(),
            revision,
        })?;
        inner.last_revision = revision;
        inner.entries.remove(key);
        Ok(())
    }

    /// Lists live keys in sorted order.
    pub fn keys(&self) -> Vec<String> {
        let inner = self.lock();
        let now = Utc::now();
        inner
            .entries
            .values()
            .filter(|e| !self.is_expired(e, now))
            .map(|e| e.key.clone())
            .collect()
    }

    /// Runs `op` against the bucket on the blocking pool.
    ///
    /// Writes append (and by default fsync) the bucket log; async callers go
    /// through here instead of calling [`KvBucket::create`] and friends on a
    /// runtime thread.
    pub async fn blocking<T, F>(self: &Arc<Self>, op: F) -> Result<T>
    where
        F: FnOnce(&KvBucket) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let bucket = Arc::clone(self);
        tokio::task::spawn_blocking(move || op(&bucket))
            .await
            .map_err(|e| KvError::Closed(e.to_string()))?
    }

    /// Revision of the most recent write to the bucket.
    pub fn last_revision(&self) -> u64 {
        self.lock().last_revision
    }

    fn write(&self, inner: &mut KvInner, key: &str, value: &[u8], now: DateTime<Utc>) -> Result<u64> {
        let revision = inner.last_revision + 1;
        inner.log.append(&KvOp::Put {
            key: key.to_string(),
            value: hex::encode(value),
            revision,
            created: now,
        })?;
        inner.last_revision = revision;
        inner.entries.insert(
            key.to_string(),
            Entry {
                key: key.to_string(),
                value: value.to_vec(),
                revision,
                created: now,
            },
        );
        Ok(revision)
    }

    fn live<'a>(&self, inner: &'a KvInner, key: &str, now: DateTime<Utc>) -> Option<&'a Entry> {
        inner.entries.get(key).filter(|e| !self.is_expired(e, now))
    }

    fn is_expired(&self, entry: &Entry, now: DateTime<Utc>) -> bool {
        match self.config.max_age {
            Some(max_age) => match chrono::Duration::from_std(max_age) {
                Ok(max_age) => entry.created + max_age < now,
                Err(_) => false,
            },
            None => false,
        }
    }

    fn validate_key(&self, key: &str) -> Result<()> {
        if is_valid_key(key) {
            Ok(())
        } else {
            Err(KvError::InvalidKey(key.to_string()))
        }
    }

    /// Rewrites the log with only live entries when dead records dominate.
    fn compact_if_sparse(&self) -> Result<()> {
        let mut inner = self.lock();
        let now = Utc::now();

        let expired: Vec<String> = inner
            .entries
            .values()
            .filter(|e| self.is_expired(e, now))
            .map(|e| e.key.clone())
            .collect();
        for key in &expired {
            inner.entries.remove(key);
        }

        let live = inner.entries.len() as u64;
        let records = inner.log.records();
        if records < COMPACTION_MIN_RECORDS || records < live * 2 {
            return Ok(());
        }

        let mut ops: Vec<KvOp> = inner
            .entries
            .values()
            .map(|e| KvOp::Put {
                key: e.key.clone(),
                value: hex::encode(&e.value),
                revision: e.revision,
                created: e.created,
            })
            .collect();
        ops.push(KvOp::Checkpoint {
            revision: inner.last_revision,
        });
        inner.log.rewrite(ops.iter())?;

        info!(
            bucket = %self.config.bucket,
            records_before = records,
            live_entries = live,
            expired = expired.len(),
            "Compacted bucket log"
        );
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, KvInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
