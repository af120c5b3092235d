//! The broker: the set of streams and buckets under one data directory.
//!
//! Publishing routes a message to the one stream whose subjects match, and
//! is bounded by a fixed number of in-flight publishes. Source links between
//! streams are advanced by [`Broker::pump_sources`], which the background
//! task started by [`Broker::spawn_source_pump`] calls on an interval.
//!
//! A data directory belongs to one broker at a time: [`Broker::open`] takes an
//! exclusive lock on `<data>/LOCK` and fails with [`StreamError::Locked`] while
//! another broker holds it. Every write that touches a log runs on the
//! blocking pool.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use fs2::FileExt;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::fsync::remove_durable;
use super::kv::{KvBucket, KvConfig, KvError};
use super::oplog::LogError;
use super::stream::{
    ConsumerConfig, Delivery, Headers, Result, SourceInfo, StartPosition, Stream, StreamConfig,
    StreamError, StreamInfo, log_path,
};
use super::subject;

/// Default cap on concurrent publishes.
pub const DEFAULT_MAX_PENDING_PUBLISHES: usize = 256;

/// Messages copied per source link per pump pass.
const SOURCE_BATCH: usize = 512;

/// Lock file held for the lifetime of a broker.
const LOCK_FILE: &str = "LOCK";

/// Acknowledgement for a stored message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubAck {
    pub stream: String,
    pub seq: u64,
}

/// Handle that keeps a consumer counted as active until dropped.
#[derive(Debug)]
pub struct ActiveGuard {
    stream: Arc<Stream>,
    consumer: String,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.stream.deactivate(&self.consumer);
    }
}

/// Streams and buckets stored under one directory.
#[derive(Debug)]
pub struct Broker {
    streams_dir: PathBuf,
    kv_dir: PathBuf,
    streams: RwLock<BTreeMap<String, Arc<Stream>>>,
    buckets: RwLock<BTreeMap<String, Arc<KvBucket>>>,
    publish_permits: Semaphore,
    /// Serialises pump passes so a batch is never copied twice.
    pump_lock: Mutex<()>,
    /// Exclusive lock on the data directory, released on drop.
    _dir_lock: File,
}

impl Broker {
    /// Opens the broker rooted at `root`, loading every stream found there.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_limits(root, DEFAULT_MAX_PENDING_PUBLISHES)
    }

    pub fn open_with_limits(root: impl AsRef<Path>, max_pending_publishes: usize) -> Result<Self> {
        let root = root.as_ref();
        let streams_dir = root.join("streams");
        let kv_dir = root.join("kv");
        std::fs::create_dir_all(&streams_dir).map_err(LogError::from)?;
        std::fs::create_dir_all(&kv_dir).map_err(LogError::from)?;
        let dir_lock = lock_dir(root)?;

        let mut streams = BTreeMap::new();
        let entries = std::fs::read_dir(&streams_dir).map_err(LogError::from)?;
        for entry in entries {
            let path = entry.map_err(LogError::from)?.path();
            if path.extension().is_none_or(|ext| ext != "log") {
                continue;
            }
            if let Some(stream) = Stream::open(&path)? {
                let name = stream.name();
                debug!(stream = %name, "Loaded stream");
                streams.insert(name, Arc::new(stream));
            }
        }

        info!(
            root = %root.display(),
            streams = streams.len(),
            "Opened broker"
        );
        Ok(Broker {
            streams_dir,
            kv_dir,
            streams: RwLock::new(streams),
            buckets: RwLock::new(BTreeMap::new()),
            publish_permits: Semaphore::new(max_pending_publishes.max(1)),
            pump_lock: Mutex::new(()),
            _dir_lock: dir_lock,
        })
    }

    /// Creates a stream. Its subjects must not overlap any existing stream's.
    pub fn add_stream(&self, config: StreamConfig) -> Result<StreamInfo> {
        config.validate()?;
        let mut streams = self.streams.write().unwrap_or_else(PoisonError::into_inner);
        if streams.contains_key(&config.name) {
            return Err(StreamError::StreamNameInUse(config.name));
        }
        check_overlap(&streams, &config)?;

        let stream = Arc::new(Stream::create(&self.streams_dir, config.clone())?);
        init_source_positions(&streams, &stream, &config)?;
        streams.insert(config.name.clone(), stream.clone());
        Ok(info_for(&streams, &stream))
    }

    /// Applies a new configuration to an existing stream.
    ///
    /// Retention cannot change here; [`StreamError::RetentionChange`] tells
    /// the caller to migrate instead.
    pub fn update_stream(&self, config: StreamConfig) -> Result<StreamInfo> {
        let streams = self.streams.read().unwrap_or_else(PoisonError::into_inner);
        let stream = streams
            .get(&config.name)
            .cloned()
            .ok_or_else(|| StreamError::StreamNotFound(config.name.clone()))?;
        let others: BTreeMap<String, Arc<Stream>> = streams
            .iter()
            .filter(|(name, _)| **name != config.name)
            .map(|(name, s)| (name.clone(), s.clone()))
            .collect();
        check_overlap(&others, &config)?;

        stream.update_config(config.clone())?;
        init_source_positions(&streams, &stream, &config)?;
        info!(stream = %config.name, "Updated stream");
        Ok(info_for(&streams, &stream))
    }

    /// Deletes a stream and its log.
    pub fn delete_stream(&self, name: &str) -> Result<()> {
        let stream = {
            let mut streams = self.streams.write().unwrap_or_else(PoisonError::into_inner);
            streams
                .remove(name)
                .ok_or_else(|| StreamError::StreamNotFound(name.to_string()))?
        };

        // Outstanding handles (subscribers, guards) keep the in-memory stream
        // alive; the log goes now regardless.
        let path = stream.path();
        match Arc::try_unwrap(stream) {
            Ok(stream) => stream.destroy()?,
            Err(_) => {
                remove_durable(&path).map_err(LogError::from)?;
            }
        }
        info!(stream = name, "Deleted stream");
        Ok(())
    }

    pub fn stream(&self, name: &str) -> Result<Arc<Stream>> {
        self.streams
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| StreamError::StreamNotFound(name.to_string()))
    }

    pub fn stream_info(&self, name: &str) -> Result<StreamInfo> {
        let streams = self.streams.read().unwrap_or_else(PoisonError::into_inner);
        let stream = streams
            .get(name)
            .ok_or_else(|| StreamError::StreamNotFound(name.to_string()))?;
        Ok(info_for(&streams, stream))
    }

    pub fn stream_names(&self) -> Vec<String> {
        self.streams
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Path a stream named `name` is stored at.
    pub fn stream_path(&self, name: &str) -> PathBuf {
        log_path(&self.streams_dir, name)
    }

    /// Stores a message on the stream that accepts `subject`.
    pub async fn publish(&self, subject_name: &str, payload: Vec<u8>, headers: Headers) -> Result<PubAck> {
        if !subject::is_valid_subject(subject_name) {
            return Err(StreamError::InvalidSubject(subject_name.to_string()));
        }

        let _permit = self
            .publish_permits
            .acquire()
            .await
            .map_err(|e| StreamError::Closed(e.to_string()))?;

        let stream = self.route(subject_name)?;
        let stream_name = stream.name();
        let subject_owned = subject_name.to_string();
        let seq = blocking(move || stream.append(&subject_owned, &payload, &headers)).await?;

        debug!(stream = %stream_name, subject = subject_name, seq, "Published message");
        Ok(PubAck {
            stream: stream_name,
            seq,
        })
    }

    fn route(&self, subject_name: &str) -> Result<Arc<Stream>> {
        self.streams
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .find(|s| s.config().accepts(subject_name))
            .cloned()
            .ok_or_else(|| StreamError::NoStreamForSubject(subject_name.to_string()))
    }

    /// Creates or updates a durable consumer on `stream`.
    pub fn add_consumer(&self, stream: &str, config: ConsumerConfig) -> Result<()> {
        self.stream(stream)?.add_consumer(config)
    }

    pub fn delete_consumer(&self, stream: &str, consumer: &str) -> Result<()> {
        self.stream(stream)?.delete_consumer(consumer)
    }

    pub async fn fetch(&self, stream: &str, consumer: &str, batch: usize) -> Result<Vec<Delivery>> {
        let stream = self.stream(stream)?;
        let consumer = consumer.to_string();
        blocking(move || stream.fetch(&consumer, batch)).await
    }

    pub async fn ack(&self, delivery: &Delivery) -> Result<()> {
        let (stream, consumer, seq) = self.settling(delivery)?;
        blocking(move || stream.ack(&consumer, seq)).await
    }

    pub async fn nak(&self, delivery: &Delivery, delay: Duration) -> Result<()> {
        let (stream, consumer, seq) = self.settling(delivery)?;
        blocking(move || stream.nak(&consumer, seq, delay)).await
    }

    pub async fn term(&self, delivery: &Delivery) -> Result<()> {
        let (stream, consumer, seq) = self.settling(delivery)?;
        blocking(move || stream.term(&consumer, seq)).await
    }

    pub async fn in_progress(&self, delivery: &Delivery) -> Result<()> {
        let (stream, consumer, seq) = self.settling(delivery)?;
        blocking(move || stream.in_progress(&consumer, seq)).await
    }

    fn settling(&self, delivery: &Delivery) -> Result<(Arc<Stream>, String, u64)> {
        Ok((
            self.stream(&delivery.stream)?,
            delivery.consumer.clone(),
            delivery.seq,
        ))
    }

    /// Counts a live subscriber on `consumer` until the guard is dropped.
    pub fn register_active(&self, stream: &str, consumer: &str) -> Result<ActiveGuard> {
        let stream = self.stream(stream)?;
        stream.activate(consumer)?;
        Ok(ActiveGuard {
            stream,
            consumer: consumer.to_string(),
        })
    }

    /// Copies one batch of pending messages along every source link.
    ///
    /// Returns the number of messages copied.
    pub fn pump_sources(&self) -> Result<usize> {
        let _pass = self.pump_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let streams: Vec<Arc<Stream>> = self
            .streams
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        let mut copied = 0;
        for stream in streams {
            let config = stream.config();
            for source in &config.sources {
                let Ok(upstream) = self.stream(&source.name) else {
                    continue;
                };
                let position = stream.source_position(&source.name).unwrap_or(0);
                let batch = upstream.messages_after(position, SOURCE_BATCH);
                if batch.is_empty() {
                    continue;
                }
                stream.append_sourced(&source.name, &batch)?;
                copied += batch.len();
                debug!(
                    stream = %config.name,
                    source = %source.name,
                    copied = batch.len(),
                    "Pumped source"
                );
            }
        }
        Ok(copied)
    }

    /// Runs [`Broker::pump_sources`] every `interval` until `cancel` fires.
    pub fn spawn_source_pump(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let broker = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(?interval, "Source pump started");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let pass = Arc::clone(&broker);
                        if let Err(e) = blocking(move || pass.pump_sources()).await {
                            error!(error = %e, "Source pump pass failed");
                        }
                    }
                }
            }
            info!("Source pump stopped");
        })
    }

    /// Opens bucket `config.bucket`, creating it if needed.
    pub fn create_key_value(&self, config: KvConfig) -> std::result::Result<Arc<KvBucket>, KvError> {
        let mut buckets = self.buckets.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(bucket) = buckets.get(&config.bucket) {
            if bucket.config() != &config {
                warn!(bucket = %config.bucket, "Bucket already open with different configuration");
            }
            return Ok(bucket.clone());
        }

        let bucket = Arc::new(KvBucket::open(&self.kv_dir, config)?);
        buckets.insert(bucket.name().to_string(), bucket.clone());
        Ok(bucket)
    }

    /// Returns an already opened bucket.
    pub fn key_value(&self, bucket: &str) -> Option<Arc<KvBucket>> {
        self.buckets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(bucket)
            .cloned()
    }
}

/// Takes the exclusive lock on `root`, failing at once if it is held.
fn lock_dir(root: &Path) -> Result<File> {
    let path = root.join(LOCK_FILE);
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(&path)
        .map_err(LogError::from)?;
    if let Err(e) = file.try_lock_exclusive() {
        warn!(path = %path.display(), error = %e, "Data directory is locked");
        return Err(StreamError::Locked(root.display().to_string()));
    }
    Ok(file)
}

/// Runs a log operation on the blocking pool.
async fn blocking<T, F>(op: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(op)
        .await
        .map_err(|e| StreamError::Closed(e.to_string()))?
}

fn check_overlap(streams: &BTreeMap<String, Arc<Stream>>, config: &StreamConfig) -> Result<()> {
    for (name, existing) in streams {
        let existing_config = existing.config();
        let clash = config.subjects.iter().any(|new| {
            existing_config
                .subjects
                .iter()
                .any(|old| subject::overlaps(new, old))
        });
        if clash {
            return Err(StreamError::SubjectOverlap {
                stream: config.name.clone(),
                existing: name.clone(),
            });
        }
    }
    Ok(())
}

/// Records the starting position of every source link not yet initialised.
fn init_source_positions(
    streams: &BTreeMap<String, Arc<Stream>>,
    stream: &Stream,
    config: &StreamConfig,
) -> Result<()> {
    for source in &config.sources {
        if stream.source_position(&source.name).is_some() {
            continue;
        }
        let position = match source.start {
            StartPosition::First => 0,
            StartPosition::New => streams.get(&source.name).map(|s| s.last_seq()).unwrap_or(0),
            StartPosition::Sequence(seq) => seq.saturating_sub(1),
        };
        stream.set_source_position(&source.name, position)?;
    }
    Ok(())
}

fn info_for(streams: &BTreeMap<String, Arc<Stream>>, stream: &Stream) -> StreamInfo {
    let config = stream.config();
    let sources = config
        .sources
        .iter()
        .map(|source| {
            let position = stream.source_position(&source.name).unwrap_or(0);
            match streams.get(&source.name) {
                Some(upstream) => SourceInfo {
                    name: source.name.clone(),
                    position,
                    lag: upstream.count_after(position),
                    active: true,
                },
                None => SourceInfo {
                    name: source.name.clone(),
                    position,
                    lag: 0,
                    active: false,
                },
            }
        })
        .collect();

    StreamInfo {
        state: stream.state(),
        config,
        sources,
    }
}
