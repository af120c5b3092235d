//! Publishing and consuming run status events.

use std::future::Future;

use tracing::{Instrument, debug, info_span, instrument, warn};

use super::subscription::{Disposition, PullSettings, spawn_pull};
use super::trace::{self, TRACEPARENT, TraceContext};
use super::{RUN_EVENTS_STREAM, RelayError, Result, Scheduler, Subscription, run_event_subject};
use crate::codec;
use crate::store::kv::is_valid_name;
use crate::store::subject::is_valid_token;
use crate::store::{ConsumerConfig, Headers};
use crate::types::RunEvent;

impl Scheduler {
    /// Publishes a status change for a run.
    ///
    /// The run's metadata decides the subject, so this waits (with backoff)
    /// for the metadata to be visible and fails if it never appears. The
    /// current trace context is injected into the event's carrier.
    #[instrument(skip(self, event), fields(run_id = %event.run_id, status = %event.new_status))]
    pub async fn publish_run_event(&self, event: &RunEvent) -> Result<()> {
        let meta = self.wait_for_run_metadata(&event.run_id).await?;
        let token = meta.subject_token();
        if !is_valid_token(token) {
            return Err(RelayError::InvalidSubjectToken(token.to_string()));
        }

        let mut event = event.clone();
        // Enrichment happens on delivery; never ship a possibly stale copy.
        event.metadata = None;
        trace::inject(&mut event.carrier);

        let payload = codec::encode(&event)?;
        let headers: Headers = event.carrier.clone();
        let ack = self
            .inner
            .broker
            .publish(&run_event_subject(token), payload, headers)
            .await?;

        debug!(stream = %ack.stream, seq = ack.seq, "Published run event");
        Ok(())
    }

    /// Joins consumer group `queue` on the `RUN_EVENTS.<queue>` subject.
    ///
    /// Each event is decoded, enriched with its run metadata, and handed to
    /// `callback` inside the publisher's trace context. `true` acks the
    /// message; `false` naks it for redelivery. Undecodable events and events
    /// for runs without metadata are terminated.
    pub fn subscribe_run_events<F, Fut>(&self, queue: &str, callback: F) -> Result<Subscription>
    where
        F: Fn(RunEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        if !is_valid_token(queue) || !is_valid_name(queue) {
            return Err(RelayError::InvalidSubjectToken(queue.to_string()));
        }

        let config = &self.inner.config;
        let settings = PullSettings {
            stream: RUN_EVENTS_STREAM.to_string(),
            consumer: ConsumerConfig::new(queue)
                .with_filter_subject(run_event_subject(queue))
                .with_ack_wait(config.ack_wait)
                .with_max_deliver(config.max_deliver)
                .with_max_ack_pending(config.max_in_flight),
            fetch_batch: config.fetch_batch,
            fetch_idle: config.fetch_idle,
            max_in_flight: config.max_in_flight,
        };

        let scheduler = self.clone();
        let callback = std::sync::Arc::new(callback);
        let subscription = spawn_pull(self.inner.broker.clone(), settings, move |delivery| {
            let scheduler = scheduler.clone();
            let callback = callback.clone();
            async move {
                if let Err(e) = scheduler.inner.broker.in_progress(&delivery).await {
                    debug!(seq = delivery.seq, error = %e, "Could not extend ack deadline");
                }

                let mut event: RunEvent = match codec::decode(&delivery.payload) {
                    Ok(event) => event,
                    Err(e) => {
                        warn!(seq = delivery.seq, error = %e, "Terminating undecodable run event");
                        return Disposition::Term;
                    }
                };

                let ctx = delivery
                    .headers
                    .get(TRACEPARENT)
                    .and_then(|v| TraceContext::from_traceparent(v))
                    .or_else(|| trace::extract(&event.carrier))
                    .unwrap_or_else(TraceContext::new_root);
                let span = info_span!(
                    "run_event",
                    run_id = %event.run_id,
                    status = %event.new_status,
                    trace_id = %ctx.trace_id_hex(),
                    delivered = delivery.delivered_count,
                );

                async move {
                    match scheduler.wait_for_run_metadata(&event.run_id).await {
                        Ok(meta) => event.metadata = Some(meta),
                        Err(RelayError::MetadataNotFound(_)) => {
                            warn!("Terminating run event without metadata");
                            return Disposition::Term;
                        }
                        Err(e) => {
                            warn!(error = %e, "Metadata lookup failed; redelivering");
                            return Disposition::Nak(scheduler.inner.config.nak_delay);
                        }
                    }

                    if trace::scope(ctx, callback(event)).await {
                        Disposition::Ack
                    } else {
                        Disposition::Nak(scheduler.inner.config.nak_delay)
                    }
                }
                .instrument(span)
                .await
            }
        })?;

        self.expect_consumers(RUN_EVENTS_STREAM);
        Ok(subscription)
    }
}
