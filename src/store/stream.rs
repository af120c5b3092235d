//! Durable streams and their pull consumers.
//!
//! A stream is an ordered log of messages, each stamped with a stream-local
//! sequence number. Messages are addressed by subject and read through durable
//! consumers: a consumer remembers which messages it has been handed
//! (pending) and which it has settled (acked or terminated), and redelivers
//! pending messages whose ack deadline has passed.
//!
//! # Retention
//!
//! - `Limits`: messages stay until `max_age` or `max_msgs` evicts them.
//! - `Interest`: a message is removed once every consumer whose filter
//!   matches it has settled it. With no matching consumers it is kept.
//! - `WorkQueue`: a message is removed as soon as any consumer settles it.
//!
//! Limits apply under every policy.
//!
//! # Persistence
//!
//! Each stream is an operation log at `<data>/streams/<NAME>.log`. Pending
//! state is in memory only: after a restart every unsettled message is
//! delivered again.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::fsync::remove_durable;
use super::kv::is_valid_name;
use super::oplog::{LogError, OpLog};
use super::subject;
use crate::retry::{Classify, ErrorKind};

/// Minimum log size before compaction on open is considered.
const COMPACTION_MIN_RECORDS: u64 = 256;

/// Message headers.
pub type Headers = BTreeMap<String, String>;

/// Errors returned by stream and consumer operations.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("stream not found: {0}")]
    StreamNotFound(String),

    #[error("stream name already in use: {0}")]
    StreamNameInUse(String),

    #[error("subjects of {stream} overlap with existing stream {existing}")]
    SubjectOverlap { stream: String, existing: String },

    #[error("no stream accepts subject {0}")]
    NoStreamForSubject(String),

    #[error("consumer {consumer} not found on stream {stream}")]
    ConsumerNotFound { stream: String, consumer: String },

    /// Retention cannot be changed in place; the stream must be migrated.
    #[error("stream {stream} retention cannot change from {from} to {to}")]
    RetentionChange {
        stream: String,
        from: RetentionPolicy,
        to: RetentionPolicy,
    },

    #[error("invalid stream name: {0:?}")]
    InvalidName(String),

    #[error("invalid subject or filter: {0:?}")]
    InvalidSubject(String),

    /// Settling a message the consumer does not hold.
    #[error("message {seq} is not pending on consumer {consumer}")]
    NotPending { consumer: String, seq: u64 },

    #[error("corrupt stream log: {0}")]
    Corrupt(String),

    #[error("stream log error: {0}")]
    Log(#[from] LogError),

    #[error("store task failed: {0}")]
    Closed(String),

    /// Another broker, in this process or another, holds the data directory.
    #[error("store at {0} is locked by another broker")]
    Locked(String),
}

impl Classify for StreamError {
    fn kind(&self) -> ErrorKind {
        match self {
            StreamError::NoStreamForSubject(_)
            | StreamError::StreamNotFound(_)
            | StreamError::Closed(_)
            | StreamError::Log(LogError::Io(_)) => ErrorKind::Transient,
            _ => ErrorKind::Permanent,
        }
    }
}

/// Result type for stream operations.
pub type Result<T> = std::result::Result<T, StreamError>;

/// When a stream gives up its messages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetentionPolicy {
    #[default]
    Limits,
    Interest,
    WorkQueue,
}

impl RetentionPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetentionPolicy::Limits => "limits",
            RetentionPolicy::Interest => "interest",
            RetentionPolicy::WorkQueue => "workqueue",
        }
    }
}

impl fmt::Display for RetentionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown retention policy.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown retention policy: {0}")]
pub struct UnknownRetention(pub String);

impl FromStr for RetentionPolicy {
    type Err = UnknownRetention;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "limits" => Ok(RetentionPolicy::Limits),
            "interest" => Ok(RetentionPolicy::Interest),
            "workqueue" | "work_queue" => Ok(RetentionPolicy::WorkQueue),
            _ => Err(UnknownRetention(s.to_string())),
        }
    }
}

/// Where a source link starts reading its upstream stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartPosition {
    /// Every message the upstream still holds.
    #[default]
    First,
    /// Only messages published after the link is created.
    New,
    /// Messages from this upstream sequence onwards.
    Sequence(u64),
}

/// A link copying messages from another stream into this one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamSource {
    pub name: String,
    #[serde(default)]
    pub start: StartPosition,
}

impl StreamSource {
    pub fn new(name: impl Into<String>, start: StartPosition) -> Self {
        StreamSource {
            name: name.into(),
            start,
        }
    }
}

/// Desired configuration of a stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    pub name: String,
    /// Subjects routed to this stream on publish. May be empty for streams
    /// that only receive sourced messages.
    #[serde(default)]
    pub subjects: Vec<String>,
    #[serde(default)]
    pub retention: RetentionPolicy,
    #[serde(default)]
    pub max_age: Option<Duration>,
    #[serde(default)]
    pub max_msgs: Option<u64>,
    #[serde(default)]
    pub sources: Vec<StreamSource>,
    /// fsync after every write.
    #[serde(default = "default_sync_writes")]
    pub sync_writes: bool,
}

fn default_sync_writes() -> bool {
    true
}

impl StreamConfig {
    pub fn new(name: impl Into<String>, subjects: Vec<String>) -> Self {
        StreamConfig {
            name: name.into(),
            subjects,
            retention: RetentionPolicy::Limits,
            max_age: None,
            max_msgs: None,
            sources: Vec::new(),
            sync_writes: true,
        }
    }

    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    pub fn with_max_msgs(mut self, max_msgs: u64) -> Self {
        self.max_msgs = Some(max_msgs);
        self
    }

    pub fn with_sources(mut self, sources: Vec<StreamSource>) -> Self {
        self.sources = sources;
        self
    }

    pub fn with_sync_writes(mut self, sync_writes: bool) -> Self {
        self.sync_writes = sync_writes;
        self
    }

    /// Checks the name and subjects are well formed.
    pub fn validate(&self) -> Result<()> {
        if !is_valid_name(&self.name) {
            return Err(StreamError::InvalidName(self.name.clone()));
        }
        for filter in &self.subjects {
            if !subject::is_valid_filter(filter) {
                return Err(StreamError::InvalidSubject(filter.clone()));
            }
        }
        for source in &self.sources {
            if !is_valid_name(&source.name) || source.name == self.name {
                return Err(StreamError::InvalidName(source.name.clone()));
            }
        }
        Ok(())
    }

    /// Returns true if a publish to `subject` is routed here.
    pub fn accepts(&self, subject_name: &str) -> bool {
        self.subjects
            .iter()
            .any(|filter| subject::matches(filter, subject_name))
    }
}

/// Configuration of a durable pull consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerConfig {
    pub durable_name: String,
    /// Only messages whose subject matches are delivered. `None` means all.
    #[serde(default)]
    pub filter_subject: Option<String>,
    /// How long a delivered message may stay unsettled before redelivery.
    pub ack_wait: Duration,
    /// Deliveries before a message is given up on. Zero means unlimited.
    pub max_deliver: u32,
    /// Cap on delivered-but-unsettled messages.
    pub max_ack_pending: usize,
}

impl ConsumerConfig {
    pub fn new(durable_name: impl Into<String>) -> Self {
        ConsumerConfig {
            durable_name: durable_name.into(),
            filter_subject: None,
            ack_wait: Duration::from_secs(30),
            max_deliver: 5,
            max_ack_pending: 1_000,
        }
    }

    pub fn with_filter_subject(mut self, filter: impl Into<String>) -> Self {
        self.filter_subject = Some(filter.into());
        self
    }

    pub fn with_ack_wait(mut self, ack_wait: Duration) -> Self {
        self.ack_wait = ack_wait;
        self
    }

    pub fn with_max_deliver(mut self, max_deliver: u32) -> Self {
        self.max_deliver = max_deliver;
        self
    }

    pub fn with_max_ack_pending(mut self, max_ack_pending: usize) -> Self {
        self.max_ack_pending = max_ack_pending;
        self
    }

    fn wants(&self, subject_name: &str) -> bool {
        match &self.filter_subject {
            Some(filter) => subject::matches(filter, subject_name),
            None => true,
        }
    }
}

/// A message held by a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub seq: u64,
    pub subject: String,
    pub payload: Vec<u8>,
    pub headers: Headers,
    pub published: DateTime<Utc>,
}

/// A message handed to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub stream: String,
    pub consumer: String,
    pub seq: u64,
    pub subject: String,
    pub payload: Vec<u8>,
    pub headers: Headers,
    pub published: DateTime<Utc>,
    /// 1 on first delivery.
    pub delivered_count: u32,
}

/// Point-in-time counters for a stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StreamState {
    pub messages: u64,
    pub first_seq: u64,
    pub last_seq: u64,
    pub consumer_count: usize,
    /// Consumers with at least one live subscriber.
    pub active_consumers: usize,
}

/// Replication progress of one source link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceInfo {
    pub name: String,
    /// Last upstream sequence copied.
    pub position: u64,
    /// Upstream messages not yet copied.
    pub lag: u64,
    /// False when the upstream stream does not exist.
    pub active: bool,
}

/// Configuration plus state of a stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamInfo {
    pub config: StreamConfig,
    pub state: StreamState,
    pub sources: Vec<SourceInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum StreamOp {
    Config {
        config: StreamConfig,
    },
    Msg {
        msg_seq: u64,
        subject: String,
        payload: String,
        #[serde(default)]
        headers: Headers,
        published: DateTime<Utc>,
    },
    Remove {
        msg_seq: u64,
    },
    ConsumerAdd {
        config: ConsumerConfig,
    },
    ConsumerDelete {
        name: String,
    },
    Ack {
        consumer: String,
        msg_seq: u64,
    },
    SourcePosition {
        source: String,
        position: u64,
    },
    /// Preserves the sequence counter across compaction.
    Checkpoint {
        last_seq: u64,
    },
}

#[derive(Debug, Clone, Copy)]
struct Pending {
    delivered_count: u32,
    deadline: Instant,
}

#[derive(Debug)]
struct Consumer {
    config: ConsumerConfig,
    /// Highest sequence examined for first delivery.
    cursor: u64,
    pending: BTreeMap<u64, Pending>,
    /// Settled sequences that the stream still holds.
    acked: BTreeSet<u64>,
    /// Live subscribers; in memory only.
    active: usize,
}

impl Consumer {
    fn new(config: ConsumerConfig) -> Self {
        Consumer {
            config,
            cursor: 0,
            pending: BTreeMap::new(),
            acked: BTreeSet::new(),
            active: 0,
        }
    }

    fn pending_mut(&mut self, seq: u64) -> Result<&mut Pending> {
        let consumer = &self.config.durable_name;
        self.pending
            .get_mut(&seq)
            .ok_or_else(|| StreamError::NotPending {
                consumer: consumer.clone(),
                seq,
            })
    }
}

struct StreamInner {
    config: StreamConfig,
    log: OpLog<StreamOp>,
    messages: BTreeMap<u64, StoredMessage>,
    last_seq: u64,
    consumers: BTreeMap<String, Consumer>,
    source_positions: BTreeMap<String, u64>,
}

/// A persisted stream.
pub struct Stream {
    inner: Mutex<StreamInner>,
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream").field("name", &self.name()).finish()
    }
}

/// Path of the log backing stream `name` under `dir`.
pub fn log_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}.log"))
}

impl Stream {
    /// Creates a new stream under `dir`. Fails if its log already exists.
    pub fn create(dir: &Path, config: StreamConfig) -> Result<Self> {
        config.validate()?;
        let path = log_path(dir, &config.name);
        if path.exists() {
            return Err(StreamError::StreamNameInUse(config.name));
        }

        let (mut log, _) = OpLog::open(&path, config.sync_writes)?;
        log.append(&StreamOp::Config {
            config: config.clone(),
        })?;

        info!(stream = %config.name, retention = %config.retention, "Created stream");
        Ok(Stream {
            inner: Mutex::new(StreamInner {
                config,
                log,
                messages: BTreeMap::new(),
                last_seq: 0,
                consumers: BTreeMap::new(),
                source_positions: BTreeMap::new(),
            }),
        })
    }

    /// Opens an existing stream log. Returns `None` for a log that never
    /// recorded a configuration.
    pub fn open(path: &Path) -> Result<Option<Self>> {
        let (log, records) = OpLog::<StreamOp>::open(path, true)?;

        let mut config: Option<StreamConfig> = None;
        let mut messages = BTreeMap::new();
        let mut last_seq = 0;
        let mut consumers: BTreeMap<String, Consumer> = BTreeMap::new();
        let mut source_positions = BTreeMap::new();

        for record in records {
            match record.op {
                StreamOp::Config { config: c } => config = Some(c),
                StreamOp::Msg {
                    msg_seq,
                    subject,
                    payload,
                    headers,
                    published,
                } => {
                    let payload = hex::decode(&payload)
                        .map_err(|e| StreamError::Corrupt(format!("message {msg_seq}: {e}")))?;
                    last_seq = last_seq.max(msg_seq);
                    messages.insert(
                        msg_seq,
                        StoredMessage {
                            seq: msg_seq,
                            subject,
                            payload,
                            headers,
                            published,
                        },
                    );
                }
                StreamOp::Remove { msg_seq } => {
                    messages.remove(&msg_seq);
                    for consumer in consumers.values_mut() {
                        consumer.acked.remove(&msg_seq);
                    }
                }
                StreamOp::ConsumerAdd { config: c } => match consumers.get_mut(&c.durable_name) {
                    Some(existing) => existing.config = c,
                    None => {
                        consumers.insert(c.durable_name.clone(), Consumer::new(c));
                    }
                },
                StreamOp::ConsumerDelete { name } => {
                    consumers.remove(&name);
                }
                StreamOp::Ack { consumer, msg_seq } => {
                    if let Some(c) = consumers.get_mut(&consumer)
                        && messages.contains_key(&msg_seq)
                    {
                        c.acked.insert(msg_seq);
                    }
                }
                StreamOp::SourcePosition { source, position } => {
                    source_positions.insert(source, position);
                }
                StreamOp::Checkpoint { last_seq: seq } => last_seq = last_seq.max(seq),
            }
        }

        let Some(config) = config else {
            warn!(path = %path.display(), "Stream log has no configuration; ignoring");
            return Ok(None);
        };
        let mut log = log;
        log.set_sync_writes(config.sync_writes);
        source_positions.retain(|name, _| config.sources.iter().any(|s| &s.name == name));

        let stream = Stream {
            inner: Mutex::new(StreamInner {
                config,
                log,
                messages,
                last_seq,
                consumers,
                source_positions,
            }),
        };
        stream.compact_if_sparse()?;
        Ok(Some(stream))
    }

    pub fn name(&self) -> String {
        self.lock().config.name.clone()
    }

    pub fn config(&self) -> StreamConfig {
        self.lock().config.clone()
    }

    /// Path of the backing log.
    pub fn path(&self) -> PathBuf {
        self.lock().log.path().to_path_buf()
    }

    /// Replaces the configuration. Retention and name are fixed.
    pub fn update_config(&self, config: StreamConfig) -> Result<()> {
        config.validate()?;
        let mut inner = self.lock();
        if config.name != inner.config.name {
            return Err(StreamError::InvalidName(config.name));
        }
        if config.retention != inner.config.retention {
            return Err(StreamError::RetentionChange {
                stream: config.name,
                from: inner.config.retention,
                to: config.retention,
            });
        }

        inner.log.append(&StreamOp::Config {
            config: config.clone(),
        })?;
        inner
            .source_positions
            .retain(|name, _| config.sources.iter().any(|s| &s.name == name));
        inner.config = config;
        inner.enforce_limits(Utc::now())?;
        Ok(())
    }

    /// Appends a message and returns its sequence number.
    pub fn append(&self, subject_name: &str, payload: &[u8], headers: &Headers) -> Result<u64> {
        self.append_at(subject_name, payload, headers, Utc::now())
    }

    /// Appends a message keeping its original publish time.
    pub fn append_at(
        &self,
        subject_name: &str,
        payload: &[u8],
        headers: &Headers,
        published: DateTime<Utc>,
    ) -> Result<u64> {
        let mut inner = self.lock();
        let seq = inner.append(subject_name, payload, headers, published)?;
        inner.enforce_limits(Utc::now())?;
        Ok(seq)
    }

    /// Copies upstream messages and records the new source position, atomically.
    pub fn append_sourced(&self, source: &str, messages: &[StoredMessage]) -> Result<()> {
        let Some(last) = messages.last() else {
            return Ok(());
        };
        let mut inner = self.lock();
        for msg in messages {
            inner.append(&msg.subject, &msg.payload, &msg.headers, msg.published)?;
        }
        inner.set_source_position(source, last.seq)?;
        inner.enforce_limits(Utc::now())?;
        Ok(())
    }

    /// Records the last upstream sequence copied from `source`.
    pub fn set_source_position(&self, source: &str, position: u64) -> Result<()> {
        self.lock().set_source_position(source, position)
    }

    /// Last upstream sequence copied from `source`, if the link is initialised.
    pub fn source_position(&self, source: &str) -> Option<u64> {
        self.lock().source_positions.get(source).copied()
    }

    /// Up to `limit` messages with sequence greater than `after`.
    pub fn messages_after(&self, after: u64, limit: usize) -> Vec<StoredMessage> {
        let inner = self.lock();
        inner
            .messages
            .range(after + 1..)
            .take(limit)
            .map(|(_, m)| m.clone())
            .collect()
    }

    /// Number of messages with sequence greater than `after`.
    pub fn count_after(&self, after: u64) -> u64 {
        self.lock().messages.range(after + 1..).count() as u64
    }

    pub fn last_seq(&self) -> u64 {
        self.lock().last_seq
    }

    /// The message at `seq`, if still held.
    pub fn get(&self, seq: u64) -> Option<StoredMessage> {
        self.lock().messages.get(&seq).cloned()
    }

    pub fn state(&self) -> StreamState {
        let inner = self.lock();
        StreamState {
            messages: inner.messages.len() as u64,
            first_seq: inner.messages.keys().next().copied().unwrap_or(0),
            last_seq: inner.last_seq,
            consumer_count: inner.consumers.len(),
            active_consumers: inner.consumers.values().filter(|c| c.active > 0).count(),
        }
    }

    /// Creates a durable consumer, or updates its configuration if it exists.
    pub fn add_consumer(&self, config: ConsumerConfig) -> Result<()> {
        if !is_valid_name(&config.durable_name) {
            return Err(StreamError::InvalidName(config.durable_name));
        }
        if let Some(filter) = &config.filter_subject
            && !subject::is_valid_filter(filter)
        {
            return Err(StreamError::InvalidSubject(filter.clone()));
        }

        let mut inner = self.lock();
        if inner
            .consumers
            .get(&config.durable_name)
            .is_some_and(|c| c.config == config)
        {
            return Ok(());
        }

        inner.log.append(&StreamOp::ConsumerAdd {
            config: config.clone(),
        })?;
        debug!(stream = %inner.config.name, consumer = %config.durable_name, "Added consumer");
        match inner.consumers.get_mut(&config.durable_name) {
            Some(existing) => existing.config = config,
            None => {
                inner
                    .consumers
                    .insert(config.durable_name.clone(), Consumer::new(config));
            }
        }
        Ok(())
    }

    pub fn delete_consumer(&self, name: &str) -> Result<()> {
        let mut inner = self.lock();
        if !inner.consumers.contains_key(name) {
            return Err(inner.consumer_not_found(name));
        }
        inner.log.append(&StreamOp::ConsumerDelete {
            name: name.to_string(),
        })?;
        inner.consumers.remove(name);
        Ok(())
    }

    pub fn has_consumer(&self, name: &str) -> bool {
        self.lock().consumers.contains_key(name)
    }

    pub fn consumer_names(&self) -> Vec<String> {
        self.lock().consumers.keys().cloned().collect()
    }

    /// Hands out up to `batch` messages: expired pending ones first, then new ones.
    pub fn fetch(&self, consumer: &str, batch: usize) -> Result<Vec<Delivery>> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        inner.enforce_limits(Utc::now())?;

        let now = Instant::now();
        let stream_name = inner.config.name.clone();
        let c = inner
            .consumers
            .get_mut(consumer)
            .ok_or_else(|| StreamError::ConsumerNotFound {
                stream: stream_name.clone(),
                consumer: consumer.to_string(),
            })?;

        let mut out = Vec::new();
        let mut exhausted = Vec::new();

        let expired: Vec<u64> = c
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(seq, _)| *seq)
            .collect();
        for seq in expired {
            if out.len() >= batch {
                break;
            }
            let Some(msg) = inner.messages.get(&seq) else {
                c.pending.remove(&seq);
                continue;
            };
            let max_deliver = c.config.max_deliver;
            let ack_wait = c.config.ack_wait;
            let Some(pending) = c.pending.get_mut(&seq) else {
                continue;
            };
            if max_deliver > 0 && pending.delivered_count >= max_deliver {
                c.pending.remove(&seq);
                exhausted.push(seq);
                continue;
            }
            pending.delivered_count += 1;
            pending.deadline = now + ack_wait;
            out.push(delivery(&stream_name, consumer, msg, pending.delivered_count));
        }

        for (seq, msg) in inner.messages.range(c.cursor + 1..) {
            if out.len() >= batch || c.pending.len() >= c.config.max_ack_pending {
                break;
            }
            c.cursor = *seq;
            if c.acked.contains(seq) || c.pending.contains_key(seq) || !c.config.wants(&msg.subject) {
                continue;
            }
            c.pending.insert(
                *seq,
                Pending {
                    delivered_count: 1,
                    deadline: now + c.config.ack_wait,
                },
            );
            out.push(delivery(&stream_name, consumer, msg, 1));
        }

        for seq in exhausted {
            warn!(
                stream = %stream_name,
                consumer,
                seq,
                "Message exceeded max deliveries; dropping"
            );
            inner.settle(consumer, seq)?;
        }

        Ok(out)
    }

    /// Settles a delivered message successfully.
    pub fn ack(&self, consumer: &str, seq: u64) -> Result<()> {
        let mut inner = self.lock();
        inner.require_pending(consumer, seq)?;
        inner.settle(consumer, seq)
    }

    /// Settles a delivered message as unprocessable; it is never redelivered.
    pub fn term(&self, consumer: &str, seq: u64) -> Result<()> {
        let mut inner = self.lock();
        inner.require_pending(consumer, seq)?;
        debug!(stream = %inner.config.name, consumer, seq, "Terminated message");
        inner.settle(consumer, seq)
    }

    /// Makes a delivered message eligible for redelivery after `delay`.
    pub fn nak(&self, consumer: &str, seq: u64, delay: Duration) -> Result<()> {
        let mut inner = self.lock();
        let c = inner.consumer_mut(consumer)?;
        c.pending_mut(seq)?.deadline = Instant::now() + delay;
        Ok(())
    }

    /// Pushes back the redelivery deadline of a message still being worked on.
    pub fn in_progress(&self, consumer: &str, seq: u64) -> Result<()> {
        let mut inner = self.lock();
        let c = inner.consumer_mut(consumer)?;
        let ack_wait = c.config.ack_wait;
        c.pending_mut(seq)?.deadline = Instant::now() + ack_wait;
        Ok(())
    }

    /// Registers a live subscriber on `consumer`.
    pub fn activate(&self, consumer: &str) -> Result<()> {
        let mut inner = self.lock();
        inner.consumer_mut(consumer)?.active += 1;
        Ok(())
    }

    /// Unregisters a live subscriber. Missing consumers are ignored.
    pub fn deactivate(&self, consumer: &str) {
        let mut inner = self.lock();
        if let Some(c) = inner.consumers.get_mut(consumer) {
            c.active = c.active.saturating_sub(1);
        }
    }

    /// Removes the backing log.
    pub fn destroy(self) -> Result<()> {
        let inner = self.inner.into_inner().unwrap_or_else(PoisonError::into_inner);
        let path = inner.log.path().to_path_buf();
        drop(inner);
        remove_durable(&path).map_err(LogError::from)?;
        Ok(())
    }

    fn compact_if_sparse(&self) -> Result<()> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        inner.enforce_limits(Utc::now())?;

        let acks: usize = inner.consumers.values().map(|c| c.acked.len()).sum();
        let live = (inner.messages.len() + inner.consumers.len() + acks) as u64;
        let records = inner.log.records();
        if records < COMPACTION_MIN_RECORDS || records < live * 2 {
            return Ok(());
        }

        let mut ops = vec![StreamOp::Config {
            config: inner.config.clone(),
        }];
        ops.extend(inner.consumers.values().map(|c| StreamOp::ConsumerAdd {
            config: c.config.clone(),
        }));
        ops.extend(inner.messages.values().map(|m| StreamOp::Msg {
            msg_seq: m.seq,
            subject: m.subject.clone(),
            payload: hex::encode(&m.payload),
            headers: m.headers.clone(),
            published: m.published,
        }));
        for (name, c) in &inner.consumers {
            ops.extend(c.acked.iter().map(|seq| StreamOp::Ack {
                consumer: name.clone(),
                msg_seq: *seq,
            }));
        }
        ops.extend(
            inner
                .source_positions
                .iter()
                .map(|(source, position)| StreamOp::SourcePosition {
                    source: source.clone(),
                    position: *position,
                }),
        );
        ops.push(StreamOp::Checkpoint {
            last_seq: inner.last_seq,
        });
        inner.log.rewrite(ops.iter())?;

        info!(
            stream = %inner.config.name,
            records_before = records,
            records_after = ops.len(),
            "Compacted stream log"
        );
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, StreamInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn delivery(stream: &str, consumer: &str, msg: &StoredMessage, delivered_count: u32) -> Delivery {
    Delivery {
        stream: stream.to_string(),
        consumer: consumer.to_string(),
        seq: msg.seq,
        subject: msg.subject.clone(),
        payload: msg.payload.clone(),
        headers: msg.headers.clone(),
        published: msg.published,
        delivered_count,
    }
}

impl StreamInner {
    fn append(
        &mut self,
        subject_name: &str,
        payload: &[u8],
        headers: &Headers,
        published: DateTime<Utc>,
    ) -> Result<u64> {
        let seq = self.last_seq + 1;
        self.log.append(&StreamOp::Msg {
            msg_seq: seq,
            subject: subject_name.to_string(),
            payload: hex::encode(payload),
            headers: headers.clone(),
            published,
        })?;
        self.last_seq = seq;
        self.messages.insert(
            seq,
            StoredMessage {
                seq,
                subject: subject_name.to_string(),
                payload: payload.to_vec(),
                headers: headers.clone(),
                published,
            },
        );
        Ok(seq)
    }

    fn set_source_position(&mut self, source: &str, position: u64) -> Result<()> {
        self.log.append(&StreamOp::SourcePosition {
            source: source.to_string(),
            position,
        })?;
        self.source_positions.insert(source.to_string(), position);
        Ok(())
    }

    /// Drops messages past the age and count limits.
    fn enforce_limits(&mut self, now: DateTime<Utc>) -> Result<()> {
        let mut doomed = Vec::new();

        if let Some(max_age) = self.config.max_age
            && let Ok(max_age) = chrono::Duration::from_std(max_age)
        {
            let cutoff = now - max_age;
            doomed.extend(
                self.messages
                    .values()
                    .take_while(|m| m.published < cutoff)
                    .map(|m| m.seq),
            );
        }

        if let Some(max_msgs) = self.config.max_msgs {
            let excess = (self.messages.len() as u64).saturating_sub(max_msgs) as usize;
            doomed.extend(self.messages.keys().take(excess).copied());
        }

        doomed.sort_unstable();
        doomed.dedup();
        for seq in doomed {
            self.remove_message(seq)?;
        }
        Ok(())
    }

    /// Records that `consumer` is done with `seq` and applies retention.
    fn settle(&mut self, consumer: &str, seq: u64) -> Result<()> {
        self.log.append(&StreamOp::Ack {
            consumer: consumer.to_string(),
            msg_seq: seq,
        })?;
        if let Some(c) = self.consumers.get_mut(consumer) {
            c.pending.remove(&seq);
            c.acked.insert(seq);
        }
        if self.retired(seq) {
            self.remove_message(seq)?;
        }
        Ok(())
    }

    fn retired(&self, seq: u64) -> bool {
        let Some(msg) = self.messages.get(&seq) else {
            return false;
        };
        match self.config.retention {
            RetentionPolicy::Limits => false,
            RetentionPolicy::WorkQueue => true,
            RetentionPolicy::Interest => {
                let mut interested = self
                    .consumers
                    .values()
                    .filter(|c| c.config.wants(&msg.subject))
                    .peekable();
                interested.peek().is_some() && interested.all(|c| c.acked.contains(&seq))
            }
        }
    }

    fn remove_message(&mut self, seq: u64) -> Result<()> {
        if self.messages.remove(&seq).is_none() {
            return Ok(());
        }
        self.log.append(&StreamOp::Remove { msg_seq: seq })?;
        for c in self.consumers.values_mut() {
            c.acked.remove(&seq);
            c.pending.remove(&seq);
        }
        Ok(())
    }

    fn require_pending(&self, consumer: &str, seq: u64) -> Result<()> {
        let c = self
            .consumers
            .get(consumer)
            .ok_or_else(|| self.consumer_not_found(consumer))?;
        if c.pending.contains_key(&seq) {
            Ok(())
        } else {
            Err(StreamError::NotPending {
                consumer: consumer.to_string(),
                seq,
            })
        }
    }

    fn consumer_mut(&mut self, consumer: &str) -> Result<&mut Consumer> {
        let stream = self.config.name.clone();
        self.consumers
            .get_mut(consumer)
            .ok_or_else(|| StreamError::ConsumerNotFound {
                stream,
                consumer: consumer.to_string(),
            })
    }

    fn consumer_not_found(&self, consumer: &str) -> StreamError {
        StreamError::ConsumerNotFound {
            stream: self.config.name.clone(),
            consumer: consumer.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::tempdir;

    fn config(retention: RetentionPolicy) -> StreamConfig {
        StreamConfig::new("EVENTS", vec!["EVENTS.>".to_string()])
            .with_retention(retention)
            .with_sync_writes(false)
    }

    fn consumer(name: &str) -> ConsumerConfig {
        ConsumerConfig::new(name).with_ack_wait(Duration::from_secs(30))
    }

    #[test]
    fn sequences_start_at_one_and_increase() {
        let dir = tempdir().unwrap();
        let stream = Stream::create(dir.path(), config(RetentionPolicy::Limits)).unwrap();

        assert_eq!(stream.append("EVENTS.a", b"1", &Headers::new()).unwrap(), 1);
        assert_eq!(stream.append("EVENTS.b", b"2", &Headers::new()).unwrap(), 2);
        let state = stream.state();
        assert_eq!(state.messages, 2);
        assert_eq!(state.first_seq, 1);
        assert_eq!(state.last_seq, 2);
    }

    #[test]
    fn create_twice_fails() {
        let dir = tempdir().unwrap();
        Stream::create(dir.path(), config(RetentionPolicy::Limits)).unwrap();
        assert!(matches!(
            Stream::create(dir.path(), config(RetentionPolicy::Limits)),
            Err(StreamError::StreamNameInUse(_))
        ));
    }

    #[test]
    fn work_queue_removes_on_ack() {
        let dir = tempdir().unwrap();
        let stream = Stream::create(dir.path(), config(RetentionPolicy::WorkQueue)).unwrap();
        stream.add_consumer(consumer("workers")).unwrap();

        stream.append("EVENTS.a", b"job", &Headers::new()).unwrap();
        let batch = stream.fetch("workers", 10).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].delivered_count, 1);

        stream.ack("workers", batch[0].seq).unwrap();
        assert_eq!(stream.state().messages, 0);
        assert!(stream.fetch("workers", 10).unwrap().is_empty());
    }

    #[test]
    fn double_ack_is_rejected() {
        let dir = tempdir().unwrap();
        let stream = Stream::create(dir.path(), config(RetentionPolicy::Limits)).unwrap();
        stream.add_consumer(consumer("c")).unwrap();
        stream.append("EVENTS.a", b"x", &Headers::new()).unwrap();

        let seq = stream.fetch("c", 1).unwrap()[0].seq;
        stream.ack("c", seq).unwrap();
        assert!(matches!(
            stream.ack("c", seq),
            Err(StreamError::NotPending { .. })
        ));
    }

    #[test]
    fn interest_waits_for_every_matching_consumer() {
        let dir = tempdir().unwrap();
        let stream = Stream::create(dir.path(), config(RetentionPolicy::Interest)).unwrap();
        stream.add_consumer(consumer("one")).unwrap();
        stream.add_consumer(consumer("two")).unwrap();
        stream
            .add_consumer(consumer("other").with_filter_subject("EVENTS.other"))
            .unwrap();

        stream.append("EVENTS.a", b"x", &Headers::new()).unwrap();
        assert!(stream.fetch("other", 10).unwrap().is_empty());

        let seq = stream.fetch("one", 1).unwrap()[0].seq;
        stream.ack("one", seq).unwrap();
        assert_eq!(stream.state().messages, 1);

        let seq = stream.fetch("two", 1).unwrap()[0].seq;
        stream.ack("two", seq).unwrap();
        assert_eq!(stream.state().messages, 0);
    }

    #[test]
    fn interest_without_consumers_keeps_messages() {
        let dir = tempdir().unwrap();
        let stream = Stream::create(dir.path(), config(RetentionPolicy::Interest)).unwrap();
        stream.append("EVENTS.a", b"x", &Headers::new()).unwrap();
        assert_eq!(stream.state().messages, 1);
    }

    #[test]
    fn filter_subject_limits_delivery() {
        let dir = tempdir().unwrap();
        let stream = Stream::create(dir.path(), config(RetentionPolicy::Limits)).unwrap();
        stream
            .add_consumer(consumer("gitlab").with_filter_subject("EVENTS.gitlab"))
            .unwrap();

        stream.append("EVENTS.github", b"no", &Headers::new()).unwrap();
        stream.append("EVENTS.gitlab", b"yes", &Headers::new()).unwrap();

        let batch = stream.fetch("gitlab", 10).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].payload, b"yes");
    }

    #[test]
    fn nak_redelivers_and_term_does_not() {
        let dir = tempdir().unwrap();
        let stream = Stream::create(dir.path(), config(RetentionPolicy::WorkQueue)).unwrap();
        stream.add_consumer(consumer("c")).unwrap();
        stream.append("EVENTS.a", b"retry", &Headers::new()).unwrap();
        stream.append("EVENTS.a", b"poison", &Headers::new()).unwrap();

        let batch = stream.fetch("c", 10).unwrap();
        assert_eq!(batch.len(), 2);
        stream.nak("c", batch[0].seq, Duration::ZERO).unwrap();
        stream.term("c", batch[1].seq).unwrap();

        let again = stream.fetch("c", 10).unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].payload, b"retry");
        assert_eq!(again[0].delivered_count, 2);
    }

    #[test]
    fn in_progress_extends_deadline() {
        let dir = tempdir().unwrap();
        let stream = Stream::create(dir.path(), config(RetentionPolicy::WorkQueue)).unwrap();
        stream
            .add_consumer(consumer("c").with_ack_wait(Duration::from_millis(30)))
            .unwrap();
        stream.append("EVENTS.a", b"slow", &Headers::new()).unwrap();

        let seq = stream.fetch("c", 1).unwrap()[0].seq;
        std::thread::sleep(Duration::from_millis(20));
        stream.in_progress("c", seq).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert!(stream.fetch("c", 1).unwrap().is_empty());

        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(stream.fetch("c", 1).unwrap()[0].delivered_count, 2);
    }

    #[test]
    fn max_deliver_gives_up() {
        let dir = tempdir().unwrap();
        let stream = Stream::create(dir.path(), config(RetentionPolicy::WorkQueue)).unwrap();
        stream
            .add_consumer(consumer("c").with_max_deliver(2))
            .unwrap();
        stream.append("EVENTS.a", b"flaky", &Headers::new()).unwrap();

        let seq = stream.fetch("c", 1).unwrap()[0].seq;
        stream.nak("c", seq, Duration::ZERO).unwrap();
        let seq = stream.fetch("c", 1).unwrap()[0].seq;
        stream.nak("c", seq, Duration::ZERO).unwrap();

        assert!(stream.fetch("c", 1).unwrap().is_empty());
        assert_eq!(stream.state().messages, 0);
    }

    #[test]
    fn max_ack_pending_caps_outstanding() {
        let dir = tempdir().unwrap();
        let stream = Stream::create(dir.path(), config(RetentionPolicy::Limits)).unwrap();
        stream
            .add_consumer(consumer("c").with_max_ack_pending(2))
            .unwrap();
        for i in 0..5u8 {
            stream.append("EVENTS.a", &[i], &Headers::new()).unwrap();
        }

        assert_eq!(stream.fetch("c", 10).unwrap().len(), 2);
        assert!(stream.fetch("c", 10).unwrap().is_empty());
    }

    #[test]
    fn limits_evict_oldest() {
        let dir = tempdir().unwrap();
        let stream = Stream::create(
            dir.path(),
            config(RetentionPolicy::Limits).with_max_msgs(2),
        )
        .unwrap();
        for i in 0..4u8 {
            stream.append("EVENTS.a", &[i], &Headers::new()).unwrap();
        }
        let state = stream.state();
        assert_eq!(state.messages, 2);
        assert_eq!(state.first_seq, 3);
    }

    #[test]
    fn unacked_messages_redeliver_after_reopen() {
        let dir = tempdir().unwrap();
        let path = log_path(dir.path(), "EVENTS");
        {
            let stream = Stream::create(dir.path(), config(RetentionPolicy::Limits)).unwrap();
            stream.add_consumer(consumer("c")).unwrap();
            stream.append("EVENTS.a", b"done", &Headers::new()).unwrap();
            stream.append("EVENTS.a", b"lost", &Headers::new()).unwrap();
            let batch = stream.fetch("c", 10).unwrap();
            stream.ack("c", batch[0].seq).unwrap();
        }

        let stream = Stream::open(&path).unwrap().unwrap();
        let batch = stream.fetch("c", 10).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].payload, b"lost");
        assert_eq!(stream.append("EVENTS.a", b"next", &Headers::new()).unwrap(), 3);
    }

    #[test]
    fn retention_cannot_change_in_place() {
        let dir = tempdir().unwrap();
        let stream = Stream::create(dir.path(), config(RetentionPolicy::Limits)).unwrap();

        let err = stream
            .update_config(config(RetentionPolicy::WorkQueue))
            .unwrap_err();
        assert!(matches!(err, StreamError::RetentionChange { .. }));

        stream
            .update_config(config(RetentionPolicy::Limits).with_max_msgs(10))
            .unwrap();
        assert_eq!(stream.config().max_msgs, Some(10));
    }

    #[test]
    fn headers_and_publish_time_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = log_path(dir.path(), "EVENTS");
        let published = Utc::now() - chrono::Duration::minutes(5);
        let mut headers = Headers::new();
        headers.insert("traceparent".to_string(), "00-abc-def-01".to_string());
        {
            let stream = Stream::create(dir.path(), config(RetentionPolicy::Limits)).unwrap();
            stream.append_at("EVENTS.a", b"x", &headers, published).unwrap();
        }

        let stream = Stream::open(&path).unwrap().unwrap();
        let msg = stream.get(1).unwrap();
        assert_eq!(msg.headers, headers);
        assert_eq!(msg.published, published);
    }

    #[test]
    fn retention_parses_from_config_strings() {
        assert_eq!("workqueue".parse::<RetentionPolicy>().unwrap(), RetentionPolicy::WorkQueue);
        assert_eq!("Interest".parse::<RetentionPolicy>().unwrap(), RetentionPolicy::Interest);
        assert!("forever".parse::<RetentionPolicy>().is_err());
    }

    proptest! {
        /// Under work-queue retention every message is delivered until settled,
        /// and settling everything empties the stream.
        #[test]
        fn work_queue_drains(count in 1usize..40, batch in 1usize..8) {
            let dir = tempdir().unwrap();
            let stream = Stream::create(dir.path(), config(RetentionPolicy::WorkQueue)).unwrap();
            stream.add_consumer(consumer("c")).unwrap();
            for i in 0..count {
                stream.append("EVENTS.a", i.to_string().as_bytes(), &Headers::new()).unwrap();
            }

            let mut seen = Vec::new();
            loop {
                let deliveries = stream.fetch("c", batch).unwrap();
                if deliveries.is_empty() {
                    break;
                }
                for d in deliveries {
                    seen.push(d.seq);
                    stream.ack("c", d.seq).unwrap();
                }
            }

            let expected: Vec<u64> = (1..=count as u64).collect();
            prop_assert_eq!(seen, expected);
            prop_assert_eq!(stream.state().messages, 0);
        }
    }
}
