//! The run event relay and polling task scheduler.
//!
//! [`Scheduler`] is the one handle callers use. It owns:
//!
//! - the run metadata bucket (`RUN_METADATA`), written once per run;
//! - the run event stream (`RUN_EVENTS`, one subject per provider);
//! - the polling task bucket (`POLLING_TASKS`) and the dispatcher that
//!   promotes due tasks onto the polling stream (`RUN_POLLING`);
//! - the workspace reconciliation bucket (`WORKSPACE_METADATA`).
//!
//! # Delivery
//!
//! Everything is at-least-once. A subscriber callback returning `true` acks
//! its message; `false` naks it for redelivery. Messages that can never be
//! handled (undecodable, or for a run with no metadata) are terminated.
//!
//! # Coordination
//!
//! There are no in-process locks between replicas. Run metadata is created
//! with create-if-absent; polling tasks are only ever written with the
//! revision they were read at, so a stale writer fails instead of clobbering.

mod events;
mod metadata;
pub mod migration;
mod polling;
mod subscription;
pub mod trace;
mod workspace;

#[cfg(test)]
mod tests;

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tracing::{info, warn};

use crate::codec::CodecError;
use crate::retry::{Classify, ErrorKind, RetryConfig};
use crate::store::{
    Broker, KvBucket, KvConfig, KvError, RetentionPolicy, StreamConfig, StreamError,
};
use crate::types::RunId;

pub use migration::{EnsureOutcome, MigrationSettings, ensure_stream};
pub use polling::{DispatchReport, PollingTask, PollingWorkers};
pub use subscription::Subscription;
pub use workspace::WorkspaceStore;

/// Stream holding run status events.
pub const RUN_EVENTS_STREAM: &str = "RUN_EVENTS";
/// Stream holding promoted polling tasks.
pub const RUN_POLLING_STREAM: &str = "RUN_POLLING";
/// Bucket holding run metadata, keyed by run id.
pub const RUN_METADATA_BUCKET: &str = "RUN_METADATA";
/// Bucket holding polling task state, keyed by run id.
pub const POLLING_TASKS_BUCKET: &str = "POLLING_TASKS";
/// Bucket holding fan-out counters, keyed by `<mrID>-<workspace>`.
pub const WORKSPACE_METADATA_BUCKET: &str = "WORKSPACE_METADATA";
/// Durable consumer shared by every polling worker.
pub const POLLING_CONSUMER: &str = "RUN_POLLING_WORKERS";

/// Subject a run event for `token` is published on.
pub fn run_event_subject(token: &str) -> String {
    crate::store::subject::join(RUN_EVENTS_STREAM, token)
}

/// Subject a polling task for `run_id` is published on.
pub fn polling_subject(run_id: &RunId) -> String {
    crate::store::subject::join(RUN_POLLING_STREAM, run_id.as_str())
}

/// Errors returned by the scheduler.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("stream error: {0}")]
    Stream(#[from] StreamError),

    #[error("bucket error: {0}")]
    Kv(#[from] KvError),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("no metadata for run {0}")]
    MetadataNotFound(RunId),

    /// A second create for the same run.
    #[error("metadata for run {0} already exists")]
    DuplicateRun(RunId),

    #[error("polling task for run {0} already scheduled")]
    DuplicateTask(RunId),

    #[error("{0:?} cannot be used as a subject token")]
    InvalidSubjectToken(String),

    #[error("unhealthy: {0}")]
    Unhealthy(String),

    #[error("migration of stream {stream} timed out at step {step}")]
    MigrationTimeout { stream: String, step: u8 },
}

impl Classify for RelayError {
    fn kind(&self) -> ErrorKind {
        match self {
            RelayError::Stream(e) => e.kind(),
            RelayError::Kv(e) => e.kind(),
            RelayError::MetadataNotFound(_)
            | RelayError::Unhealthy(_)
            | RelayError::MigrationTimeout { .. } => ErrorKind::Transient,
            RelayError::Codec(_)
            | RelayError::Json(_)
            | RelayError::DuplicateRun(_)
            | RelayError::DuplicateTask(_)
            | RelayError::InvalidSubjectToken(_) => ErrorKind::Permanent,
        }
    }
}

/// Result type for scheduler operations.
pub type Result<T> = std::result::Result<T, RelayError>;

/// Default interval between dispatcher scans (1 second).
const DEFAULT_DISPATCH_INTERVAL_MS: u64 = 1_000;

/// Default delay between polls of a run (10 seconds).
const DEFAULT_POLL_DELAY_SECS: u64 = 10;

/// Requested delays below this are replaced by the default (1 second).
const DEFAULT_MIN_POLL_DELAY_SECS: u64 = 1;

/// Default visibility timeout for delivered messages (30 seconds).
const DEFAULT_ACK_WAIT_SECS: u64 = 30;

/// Default deliveries of a run event before it is dropped.
const DEFAULT_MAX_DELIVER: u32 = 5;

/// Default cap on concurrently running callbacks per subscription.
const DEFAULT_MAX_IN_FLIGHT: usize = 64;

/// Default messages requested per fetch.
const DEFAULT_FETCH_BATCH: usize = 16;

/// Default sleep when a fetch returns nothing (100 milliseconds).
const DEFAULT_FETCH_IDLE_MS: u64 = 100;

/// Default delay before a nak'd run event is redelivered (1 second).
const DEFAULT_NAK_DELAY_SECS: u64 = 1;

/// Default lifetime of run metadata and idle polling tasks (7 days).
const DEFAULT_METADATA_TTL_HOURS: u64 = 168;

/// Tunables for one [`Scheduler`].
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    /// Interval between dispatcher scans.
    pub dispatch_interval: Duration,

    /// Delay used by reschedules and in place of too-short requested delays.
    pub default_poll_delay: Duration,

    /// Requested delays below this are replaced by `default_poll_delay`.
    pub min_poll_delay: Duration,

    /// Visibility timeout for delivered messages.
    pub ack_wait: Duration,

    /// Deliveries of a run event before it is dropped. Polling tasks are
    /// redelivered without limit.
    pub max_deliver: u32,

    /// Concurrently running callbacks per subscription.
    pub max_in_flight: usize,

    /// Messages requested per fetch.
    pub fetch_batch: usize,

    /// Sleep when a fetch returns nothing.
    pub fetch_idle: Duration,

    /// Delay before a nak'd run event is redelivered.
    pub nak_delay: Duration,

    /// Backoff for reading metadata that may not be visible yet.
    pub metadata_retry: RetryConfig,

    /// Entries in the metadata and polling buckets expire after this.
    pub metadata_ttl: Duration,

    /// Desired retention of the run events stream. Changing it migrates the
    /// stream on the next connect.
    pub events_retention: RetentionPolicy,

    /// fsync every stream and bucket write.
    pub sync_writes: bool,

    pub migration: MigrationSettings,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl SchedulerConfig {
    pub fn new() -> Self {
        SchedulerConfig {
            dispatch_interval: Duration::from_millis(DEFAULT_DISPATCH_INTERVAL_MS),
            default_poll_delay: Duration::from_secs(DEFAULT_POLL_DELAY_SECS),
            min_poll_delay: Duration::from_secs(DEFAULT_MIN_POLL_DELAY_SECS),
            ack_wait: Duration::from_secs(DEFAULT_ACK_WAIT_SECS),
            max_deliver: DEFAULT_MAX_DELIVER,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            fetch_batch: DEFAULT_FETCH_BATCH,
            fetch_idle: Duration::from_millis(DEFAULT_FETCH_IDLE_MS),
            nak_delay: Duration::from_secs(DEFAULT_NAK_DELAY_SECS),
            metadata_retry: RetryConfig::METADATA,
            metadata_ttl: Duration::from_secs(DEFAULT_METADATA_TTL_HOURS * 3600),
            events_retention: RetentionPolicy::WorkQueue,
            sync_writes: true,
            migration: MigrationSettings::default(),
        }
    }

    pub fn with_dispatch_interval(mut self, interval: Duration) -> Self {
        self.dispatch_interval = interval;
        self
    }

    pub fn with_default_poll_delay(mut self, delay: Duration) -> Self {
        self.default_poll_delay = delay;
        self
    }

    pub fn with_ack_wait(mut self, ack_wait: Duration) -> Self {
        self.ack_wait = ack_wait;
        self
    }

    pub fn with_fetch_idle(mut self, idle: Duration) -> Self {
        self.fetch_idle = idle;
        self
    }

    pub fn with_nak_delay(mut self, delay: Duration) -> Self {
        self.nak_delay = delay;
        self
    }

    pub fn with_metadata_retry(mut self, retry: RetryConfig) -> Self {
        self.metadata_retry = retry;
        self
    }

    pub fn with_metadata_ttl(mut self, ttl: Duration) -> Self {
        self.metadata_ttl = ttl;
        self
    }

    pub fn with_events_retention(mut self, retention: RetentionPolicy) -> Self {
        self.events_retention = retention;
        self
    }

    pub fn with_sync_writes(mut self, sync_writes: bool) -> Self {
        self.sync_writes = sync_writes;
        self
    }

    pub fn with_migration(mut self, migration: MigrationSettings) -> Self {
        self.migration = migration;
        self
    }

    /// Desired configuration of the run events stream.
    pub fn events_stream(&self) -> StreamConfig {
        StreamConfig::new(RUN_EVENTS_STREAM, vec![format!("{RUN_EVENTS_STREAM}.*")])
            .with_retention(self.events_retention)
            .with_sync_writes(self.sync_writes)
    }

    /// Desired configuration of the polling stream.
    pub fn polling_stream(&self) -> StreamConfig {
        StreamConfig::new(RUN_POLLING_STREAM, vec![format!("{RUN_POLLING_STREAM}.*")])
            .with_retention(RetentionPolicy::WorkQueue)
            .with_sync_writes(self.sync_writes)
    }

    fn bucket(&self, name: &str, ttl: Option<Duration>) -> KvConfig {
        let config = KvConfig::new(name).with_sync_writes(self.sync_writes);
        match ttl {
            Some(ttl) => config.with_max_age(ttl),
            None => config,
        }
    }
}

struct Inner {
    broker: Arc<Broker>,
    config: SchedulerConfig,
    metadata: Arc<KvBucket>,
    tasks: Arc<KvBucket>,
    workspaces: WorkspaceStore,
    /// Streams this scheduler has subscribed to; each must keep a live consumer.
    expected: Mutex<BTreeSet<String>>,
}

/// Handle to the relay. Cheap to clone.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.inner.config)
            .finish()
    }
}

impl Scheduler {
    /// Ensures the streams and buckets exist, migrating the run events stream
    /// if its retention changed.
    ///
    /// Failure here is fatal: the relay cannot run without its storage.
    pub async fn connect(broker: Arc<Broker>, config: SchedulerConfig) -> Result<Self> {
        let outcome = ensure_stream(&broker, config.events_stream(), &config.migration).await?;
        info!(stream = RUN_EVENTS_STREAM, ?outcome, "Run events stream ready");
        let outcome = ensure_stream(&broker, config.polling_stream(), &config.migration).await?;
        info!(stream = RUN_POLLING_STREAM, ?outcome, "Polling stream ready");

        let ttl = Some(config.metadata_ttl);
        let metadata = broker.create_key_value(config.bucket(RUN_METADATA_BUCKET, ttl))?;
        let tasks = broker.create_key_value(config.bucket(POLLING_TASKS_BUCKET, ttl))?;
        let workspaces =
            WorkspaceStore::new(broker.create_key_value(config.bucket(WORKSPACE_METADATA_BUCKET, None))?);

        Ok(Scheduler {
            inner: Arc::new(Inner {
                broker,
                config,
                metadata,
                tasks,
                workspaces,
                expected: Mutex::new(BTreeSet::new()),
            }),
        })
    }

    pub fn broker(&self) -> &Arc<Broker> {
        &self.inner.broker
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// The workspace reconciliation store.
    pub fn workspaces(&self) -> &WorkspaceStore {
        &self.inner.workspaces
    }

    /// Fails if a managed stream is missing, or if a stream this scheduler
    /// subscribed to has no active consumer.
    pub fn health_check(&self) -> Result<()> {
        let broker = &self.inner.broker;
        for stream in [RUN_EVENTS_STREAM, RUN_POLLING_STREAM] {
            broker
                .stream_info(stream)
                .map_err(|e| RelayError::Unhealthy(e.to_string()))?;
        }

        let expected = self
            .inner
            .expected
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for stream in expected {
            let info = broker
                .stream_info(&stream)
                .map_err(|e| RelayError::Unhealthy(e.to_string()))?;
            if info.state.active_consumers == 0 {
                warn!(stream = %stream, "Stream has no active consumers");
                return Err(RelayError::Unhealthy(format!(
                    "stream {stream} has no active consumers"
                )));
            }
        }
        Ok(())
    }

    fn expect_consumers(&self, stream: &str) {
        self.inner
            .expected
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(stream.to_string());
    }
}
