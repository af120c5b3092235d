//! Polling tasks and the dispatcher that promotes them.
//!
//! A task moves through:
//!
//! ```text
//! new -> processing -> (rescheduled -> processing)* -> completed (deleted)
//! corrupted -> deleted
//! ```
//!
//! The dispatcher scans the polling bucket every tick. A task that is idle
//! and past its `next_poll` is marked processing with a revision-checked
//! update and then published to `RUN_POLLING.<runID>`. If two dispatchers
//! race, the loser's update fails and it simply moves on; if the publish
//! fails, the processing flag is reverted so the next tick retries.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, instrument, warn};

use super::subscription::{Disposition, PullSettings, spawn_pull};
use super::trace::{self, TRACEPARENT, TraceContext};
use super::{
    POLLING_CONSUMER, RUN_POLLING_STREAM, RelayError, Result, Scheduler, Subscription,
    polling_subject,
};
use crate::codec;
use crate::store::subject::is_valid_token;
use crate::store::{ConsumerConfig, Headers, KvBucket, KvError};
use crate::types::{RunId, RunMetadata, RunPollingTask};

/// A polling task bound to the bucket it lives in.
#[derive(Debug, Clone)]
pub struct PollingTask {
    task: RunPollingTask,
    bucket: Arc<KvBucket>,
    default_delay: Duration,
}

impl PollingTask {
    pub(crate) fn new(task: RunPollingTask, bucket: Arc<KvBucket>, default_delay: Duration) -> Self {
        PollingTask {
            task,
            bucket,
            default_delay,
        }
    }

    pub fn run_id(&self) -> &RunId {
        &self.task.metadata.run_id
    }

    pub fn metadata(&self) -> &RunMetadata {
        &self.task.metadata
    }

    pub fn last_status(&self) -> &str {
        &self.task.last_status
    }

    pub fn set_last_status(&mut self, status: impl Into<String>) {
        self.task.last_status = status.into();
    }

    pub fn next_poll(&self) -> DateTime<Utc> {
        self.task.next_poll
    }

    pub fn processing(&self) -> bool {
        self.task.processing
    }

    pub fn last_update(&self) -> DateTime<Utc> {
        self.task.last_update
    }

    /// Bucket revision this task was last read at or written with.
    pub fn revision(&self) -> u64 {
        self.task.revision
    }

    pub fn task(&self) -> &RunPollingTask {
        &self.task
    }

    /// Stores the task. Fails if the run already has a task.
    #[instrument(skip(self), fields(run_id = %self.run_id()))]
    pub async fn schedule(&mut self) -> Result<()> {
        if !is_valid_token(self.run_id().as_str()) {
            return Err(RelayError::InvalidSubjectToken(self.run_id().to_string()));
        }
        let bytes = codec::encode(&self.task)?;
        let key = self.run_id().to_string();
        let created = self
            .bucket
            .blocking(move |bucket| bucket.create(&key, &bytes))
            .await;
        match created {
            Ok(revision) => {
                self.task.revision = revision;
                debug!(revision, next_poll = %self.task.next_poll, "Scheduled polling task");
                Ok(())
            }
            Err(KvError::KeyExists { .. }) => Err(RelayError::DuplicateTask(self.run_id().clone())),
            Err(e) => Err(e.into()),
        }
    }

    /// Makes the task due again after the default delay.
    ///
    /// Writes with the task's revision; if another writer got there first
    /// this fails with a revision conflict and the caller must re-read.
    #[instrument(skip(self), fields(run_id = %self.run_id(), revision = self.task.revision))]
    pub async fn reschedule(&mut self) -> Result<()> {
        let now = Utc::now();
        let mut next = self.task.clone();
        next.next_poll = now + to_chrono(self.default_delay);
        next.processing = false;
        next.last_update = now;

        let bytes = codec::encode(&next)?;
        let key = self.run_id().to_string();
        let expected = self.task.revision;
        let revision = self
            .bucket
            .blocking(move |bucket| bucket.update(&key, &bytes, expected))
            .await?;
        next.revision = revision;
        self.task = next;
        debug!(revision, next_poll = %self.task.next_poll, "Rescheduled polling task");
        Ok(())
    }

    /// Removes the task. Removing an already removed task succeeds.
    #[instrument(skip(self), fields(run_id = %self.run_id()))]
    pub async fn completed(&self) -> Result<()> {
        let key = self.run_id().to_string();
        self.bucket
            .blocking(move |bucket| bucket.delete(&key))
            .await?;
        debug!("Completed polling task");
        Ok(())
    }
}

/// Longest delay a task can be scheduled out by (100 years).
fn max_delay() -> chrono::Duration {
    chrono::Duration::days(36_500)
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration)
        .unwrap_or_else(|_| max_delay())
        .min(max_delay())
}

/// What one dispatcher scan did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub scanned: usize,
    pub promoted: usize,
    /// Undecodable entries deleted.
    pub corrupted: usize,
    /// Lost a revision race to another writer.
    pub conflicts: usize,
    /// Marked processing but could not be published; reverted.
    pub failed: usize,
}

/// A polling worker subscription and the dispatcher feeding it.
#[derive(Debug)]
pub struct PollingWorkers {
    subscription: Subscription,
    dispatcher: JoinHandle<()>,
    cancel: CancellationToken,
}

impl PollingWorkers {
    /// Stops the dispatcher, then waits for in-flight polls.
    pub async fn close(self) {
        self.cancel.cancel();
        if let Err(e) = self.dispatcher.await {
            error!(error = %e, "Dispatcher task panicked");
        }
        self.subscription.close().await;
    }
}

impl Scheduler {
    /// Builds a task for `metadata` due after `delay`.
    ///
    /// Delays below the configured minimum are replaced by the default poll
    /// delay. The task is not stored until [`PollingTask::schedule`].
    pub fn new_polling_task(&self, metadata: RunMetadata, delay: Duration) -> PollingTask {
        let config = &self.inner.config;
        let delay = if delay < config.min_poll_delay {
            config.default_poll_delay
        } else {
            delay
        };
        let task = RunPollingTask::new(metadata, Utc::now(), to_chrono(delay));
        PollingTask::new(task, self.inner.tasks.clone(), config.default_poll_delay)
    }

    /// Reads the stored task for a run, if any.
    pub fn polling_task(&self, run_id: &RunId) -> Result<Option<PollingTask>> {
        let Some(entry) = self.inner.tasks.entry(run_id.as_str())? else {
            return Ok(None);
        };
        let mut task: RunPollingTask = codec::decode(&entry.value)?;
        task.revision = entry.revision;
        Ok(Some(PollingTask::new(
            task,
            self.inner.tasks.clone(),
            self.inner.config.default_poll_delay,
        )))
    }

    /// Joins the polling worker group.
    ///
    /// `callback` gets each promoted task; `true` acks it, `false` naks it
    /// for another attempt after the default poll delay. Undecodable
    /// messages are terminated.
    pub fn subscribe_polling_tasks<F, Fut>(&self, callback: F) -> Result<Subscription>
    where
        F: Fn(PollingTask) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let config = &self.inner.config;
        let settings = PullSettings {
            stream: RUN_POLLING_STREAM.to_string(),
            consumer: ConsumerConfig::new(POLLING_CONSUMER)
                .with_filter_subject(format!("{RUN_POLLING_STREAM}.*"))
                .with_ack_wait(config.ack_wait)
                // A task stuck in processing is never dispatched again, so
                // its message must not be dropped.
                .with_max_deliver(0)
                .with_max_ack_pending(config.max_in_flight),
            fetch_batch: config.fetch_batch,
            fetch_idle: config.fetch_idle,
            max_in_flight: config.max_in_flight,
        };

        let bucket = self.inner.tasks.clone();
        let broker = self.inner.broker.clone();
        let default_delay = config.default_poll_delay;
        let callback = Arc::new(callback);
        let subscription = spawn_pull(self.inner.broker.clone(), settings, move |delivery| {
            let bucket = bucket.clone();
            let broker = broker.clone();
            let callback = callback.clone();
            async move {
                if let Err(e) = broker.in_progress(&delivery).await {
                    debug!(seq = delivery.seq, error = %e, "Could not extend ack deadline");
                }

                let task: RunPollingTask = match codec::decode(&delivery.payload) {
                    Ok(task) => task,
                    Err(e) => {
                        warn!(seq = delivery.seq, error = %e, "Terminating undecodable polling task");
                        return Disposition::Term;
                    }
                };

                let ctx = delivery
                    .headers
                    .get(TRACEPARENT)
                    .and_then(|v| TraceContext::from_traceparent(v))
                    .unwrap_or_else(TraceContext::new_root);
                let span = info_span!(
                    "polling_task",
                    run_id = %task.metadata.run_id,
                    last_status = %task.last_status,
                    trace_id = %ctx.trace_id_hex(),
                );

                let task = PollingTask::new(task, bucket, default_delay);
                let handled = trace::scope(ctx, callback(task)).instrument(span).await;
                if handled {
                    Disposition::Ack
                } else {
                    Disposition::Nak(default_delay)
                }
            }
        })?;

        self.expect_consumers(RUN_POLLING_STREAM);
        Ok(subscription)
    }

    /// Joins the polling worker group and starts the dispatcher.
    ///
    /// The dispatcher runs only as long as the subscription: it stops when
    /// `cancel` fires or [`PollingWorkers::close`] is called.
    pub fn start_polling<F, Fut>(&self, cancel: &CancellationToken, callback: F) -> Result<PollingWorkers>
    where
        F: Fn(PollingTask) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let subscription = self.subscribe_polling_tasks(callback)?;
        let cancel = cancel.child_token();
        let dispatcher = self.spawn_dispatcher(cancel.clone());
        Ok(PollingWorkers {
            subscription,
            dispatcher,
            cancel,
        })
    }

    /// Scans the polling bucket once, promoting every due task.
    pub async fn dispatch_once(&self) -> DispatchReport {
        let tasks = &self.inner.tasks;
        let mut report = DispatchReport::default();

        for key in tasks.keys() {
            report.scanned += 1;

            let entry = match tasks.entry(&key) {
                Ok(Some(entry)) => entry,
                Ok(None) => continue,
                Err(e) => {
                    warn!(key = %key, error = %e, "Failed to read polling task");
                    continue;
                }
            };

            let mut task: RunPollingTask = match codec::decode(&entry.value) {
                Ok(task) => task,
                Err(e) => {
                    warn!(key = %key, error = %e, "Deleting corrupted polling task");
                    let corrupted = key.clone();
                    if let Err(e) = tasks.blocking(move |bucket| bucket.delete(&corrupted)).await {
                        error!(key = %key, error = %e, "Failed to delete corrupted polling task");
                    }
                    report.corrupted += 1;
                    continue;
                }
            };
            task.revision = entry.revision;

            let now = Utc::now();
            if !task.is_due(now) {
                continue;
            }

            task.processing = true;
            task.last_update = now;
            let bytes = match codec::encode(&task) {
                Ok(bytes) => bytes,
                Err(e) => {
                    error!(key = %key, error = %e, "Failed to encode polling task");
                    continue;
                }
            };
            let claimed = key.clone();
            let expected = entry.revision;
            match tasks
                .blocking(move |bucket| bucket.update(&claimed, &bytes, expected))
                .await
            {
                Ok(revision) => task.revision = revision,
                Err(KvError::WrongLastRevision { .. }) => {
                    debug!(key = %key, "Polling task changed under us; skipping");
                    report.conflicts += 1;
                    continue;
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "Failed to claim polling task");
                    continue;
                }
            }

            match self.publish_task(&task).await {
                Ok(()) => {
                    debug!(run_id = %task.metadata.run_id, revision = task.revision, "Promoted polling task");
                    report.promoted += 1;
                }
                Err(e) => {
                    warn!(run_id = %task.metadata.run_id, error = %e, "Failed to publish polling task; releasing");
                    self.release(&key, task).await;
                    report.failed += 1;
                }
            }
        }

        report
    }

    async fn publish_task(&self, task: &RunPollingTask) -> Result<()> {
        let payload = codec::encode(task)?;
        let mut headers = Headers::new();
        trace::inject(&mut headers);
        self.inner
            .broker
            .publish(&polling_subject(&task.metadata.run_id), payload, headers)
            .await?;
        Ok(())
    }

    /// Clears the processing flag of a task that was claimed but not published.
    async fn release(&self, key: &str, mut task: RunPollingTask) {
        let expected = task.revision;
        task.processing = false;
        let result = match codec::encode(&task) {
            Ok(bytes) => {
                let owned = key.to_string();
                self.inner
                    .tasks
                    .blocking(move |bucket| bucket.update(&owned, &bytes, expected))
                    .await
                    .map(drop)
                    .map_err(RelayError::from)
            }
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            warn!(key, error = %e, "Failed to release polling task");
        }
    }

    /// Runs the dispatcher every `dispatch_interval` until `cancel` fires.
    pub fn spawn_dispatcher(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let scheduler = self.clone();
        let interval = self.inner.config.dispatch_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(?interval, "Dispatcher started");

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("Shutdown signal received, stopping dispatcher");
                        break;
                    }
                    _ = ticker.tick() => {
                        let report = scheduler
                            .dispatch_once()
                            .instrument(info_span!("dispatch"))
                            .await;
                        if report.promoted + report.corrupted + report.failed > 0 {
                            debug!(?report, "Dispatch pass");
                        }
                    }
                }
            }
        })
    }
}
