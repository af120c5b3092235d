//! Pull loop shared by every subscription.
//!
//! One task per subscription fetches from a durable consumer and spawns a
//! task per delivery, bounded by a semaphore. Each delivery is settled
//! according to the [`Disposition`] its handler returns.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::store::{ActiveGuard, Broker, ConsumerConfig, Delivery, StreamError};

/// How a delivered message is settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Disposition {
    Ack,
    /// Redeliver after the delay.
    Nak(Duration),
    /// Never redeliver.
    Term,
}

/// Pull loop settings.
#[derive(Debug, Clone)]
pub(crate) struct PullSettings {
    pub stream: String,
    pub consumer: ConsumerConfig,
    pub fetch_batch: usize,
    pub fetch_idle: Duration,
    pub max_in_flight: usize,
}

/// A running subscription. Dropping it stops fetching; [`Subscription::close`]
/// also waits for callbacks already running.
#[derive(Debug)]
pub struct Subscription {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl Subscription {
    /// Stops fetching and waits for in-flight callbacks to finish.
    pub async fn close(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take()
            && let Err(e) = handle.await
        {
            error!(error = %e, "Subscription task panicked");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Creates the consumer and starts pulling from it.
pub(crate) fn spawn_pull<H, Fut>(
    broker: Arc<Broker>,
    settings: PullSettings,
    handler: H,
) -> Result<Subscription, StreamError>
where
    H: Fn(Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Disposition> + Send + 'static,
{
    let guard = attach(&broker, &settings)?;
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(run_pull(
        broker,
        settings,
        Arc::new(handler),
        guard,
        cancel.clone(),
    ));
    Ok(Subscription {
        cancel,
        handle: Some(handle),
    })
}

fn attach(broker: &Broker, settings: &PullSettings) -> Result<ActiveGuard, StreamError> {
    broker.add_consumer(&settings.stream, settings.consumer.clone())?;
    broker.register_active(&settings.stream, &settings.consumer.durable_name)
}

async fn run_pull<H, Fut>(
    broker: Arc<Broker>,
    settings: PullSettings,
    handler: Arc<H>,
    guard: ActiveGuard,
    cancel: CancellationToken,
) where
    H: Fn(Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Disposition> + Send + 'static,
{
    let stream = settings.stream.clone();
    let consumer = settings.consumer.durable_name.clone();
    let max_in_flight = settings.max_in_flight.max(1);
    let permits = Arc::new(Semaphore::new(max_in_flight));
    let mut guard = Some(guard);

    info!(stream = %stream, consumer = %consumer, "Subscription started");

    loop {
        if cancel.is_cancelled() {
            break;
        }

        let available = permits.available_permits();
        if available == 0 {
            tokio::select! {
                _ = cancel.cancelled() => break,
                permit = permits.clone().acquire_owned() => drop(permit),
            }
            continue;
        }

        match broker
            .fetch(&stream, &consumer, available.min(settings.fetch_batch))
            .await
        {
            Ok(deliveries) if deliveries.is_empty() => {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(settings.fetch_idle) => {}
                }
            }
            Ok(deliveries) => {
                for delivery in deliveries {
                    let Ok(permit) = permits.clone().acquire_owned().await else {
                        break;
                    };
                    let broker = broker.clone();
                    let handler = handler.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        let disposition = handler(delivery.clone()).await;
                        settle(&broker, &delivery, disposition).await;
                    });
                }
            }
            Err(e @ (StreamError::ConsumerNotFound { .. } | StreamError::StreamNotFound(_))) => {
                warn!(stream = %stream, consumer = %consumer, error = %e, "Consumer lost; recreating");
                guard = None;
                let (retry_broker, retry_settings) = (broker.clone(), settings.clone());
                match tokio::task::spawn_blocking(move || attach(&retry_broker, &retry_settings)).await {
                    Ok(Ok(g)) => guard = Some(g),
                    Ok(Err(e)) => error!(stream = %stream, consumer = %consumer, error = %e, "Failed to recreate consumer"),
                    Err(e) => error!(stream = %stream, consumer = %consumer, error = %e, "Consumer recreation task failed"),
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(settings.fetch_idle) => {}
                }
            }
            Err(e) => {
                error!(stream = %stream, consumer = %consumer, error = %e, "Fetch failed");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(settings.fetch_idle) => {}
                }
            }
        }
    }

    // Wait for running callbacks so close() means nothing is left in flight.
    if let Ok(all) = permits.acquire_many(max_in_flight as u32).await {
        drop(all);
    }
    drop(guard);
    info!(stream = %stream, consumer = %consumer, "Subscription stopped");
}

async fn settle(broker: &Broker, delivery: &Delivery, disposition: Disposition) {
    let result = match disposition {
        Disposition::Ack => broker.ack(delivery).await,
        Disposition::Nak(delay) => broker.nak(delivery, delay).await,
        Disposition::Term => broker.term(delivery).await,
    };
    match result {
        Ok(()) => debug!(
            stream = %delivery.stream,
            seq = delivery.seq,
            ?disposition,
            "Settled message"
        ),
        Err(e) => warn!(
            stream = %delivery.stream,
            seq = delivery.seq,
            ?disposition,
            error = %e,
            "Failed to settle message"
        ),
    }
}
