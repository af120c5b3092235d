//! Delivers run events to an HTTP consumer.
//!
//! The binary joins one run event queue and POSTs each enriched event as JSON
//! to a configured URL. A 2xx response acks the event; anything else naks it
//! for redelivery. With a token configured the body is signed with
//! HMAC-SHA512, hex encoded in `X-Run-Relay-Signature`.

use std::time::Duration;

use hmac::{Hmac, Mac};
use sha2::Sha512;
use thiserror::Error;
use tracing::{debug, warn};

use crate::types::RunEvent;

type HmacSha512 = Hmac<Sha512>;

/// Header carrying the body signature.
pub const HEADER_SIGNATURE: &str = "x-run-relay-signature";

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("invalid signing key")]
    InvalidKey,

    #[error("consumer answered {status}: {body}")]
    Rejected {
        status: reqwest::StatusCode,
        body: String,
    },
}

/// POSTs run events to one consumer URL.
#[derive(Clone)]
pub struct EventForwarder {
    url: String,
    token: Option<Vec<u8>>,
    client: reqwest::Client,
}

impl std::fmt::Debug for EventForwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventForwarder")
            .field("url", &self.url)
            .field("signed", &self.token.is_some())
            .finish_non_exhaustive()
    }
}

impl EventForwarder {
    pub fn new(url: impl Into<String>, token: Option<Vec<u8>>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        EventForwarder {
            url: url.into(),
            token,
            client,
        }
    }

    /// Sends one event.
    pub async fn send(&self, event: &RunEvent) -> Result<(), ForwardError> {
        let body = serde_json::to_vec(event)?;
        let mut request = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json");
        if let Some(token) = &self.token {
            request = request.header(HEADER_SIGNATURE, sign(&body, token)?);
        }

        let response = request.body(body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ForwardError::Rejected { status, body });
        }
        debug!(run_id = %event.run_id, status = %event.new_status, "Forwarded run event");
        Ok(())
    }

    /// Subscription callback: `true` once the consumer accepted the event.
    pub async fn forward(&self, event: RunEvent) -> bool {
        match self.send(&event).await {
            Ok(()) => true,
            Err(e) => {
                warn!(run_id = %event.run_id, error = %e, "Failed to forward run event");
                false
            }
        }
    }
}

fn sign(body: &[u8], token: &[u8]) -> Result<String, ForwardError> {
    let mut mac = HmacSha512::new_from_slice(token).map_err(|_| ForwardError::InvalidKey)?;
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use axum::Router;
    use axum::body::Bytes;
    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;

    use crate::relay::Subscription;
    use crate::server::notification::verify_signature;
    use crate::test_utils::scheduler;
    use crate::types::RunMetadata;

    type Received = Arc<Mutex<Vec<(HeaderMap, Bytes)>>>;

    async fn spawn_consumer(status: StatusCode) -> (String, Received) {
        let received: Received = Arc::default();
        let app = Router::new()
            .route(
                "/events",
                post(
                    move |State(received): State<Received>, headers: HeaderMap, body: Bytes| async move {
                        received.lock().unwrap().push((headers, body));
                        status
                    },
                ),
            )
            .with_state(received.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        (format!("http://{addr}/events"), received)
    }

    #[tokio::test]
    async fn signed_event_reaches_consumer() {
        let (url, received) = spawn_consumer(StatusCode::NO_CONTENT).await;
        let forwarder = EventForwarder::new(url, Some(b"k".to_vec()));

        let event = RunEvent::new("run-1", "o", "w", "applied");
        assert!(forwarder.forward(event.clone()).await);

        let received = received.lock().unwrap();
        let (headers, body) = &received[0];
        let signature = headers.get(HEADER_SIGNATURE).unwrap().to_str().unwrap();
        assert!(verify_signature(body, signature, b"k"));
        let parsed: RunEvent = serde_json::from_slice(body).unwrap();
        assert_eq!(parsed, event);
    }

    #[tokio::test]
    async fn rejected_event_is_not_acked() {
        let (url, _received) = spawn_consumer(StatusCode::SERVICE_UNAVAILABLE).await;
        let forwarder = EventForwarder::new(url, None);

        let err = forwarder
            .send(&RunEvent::new("run-1", "o", "w", "applied"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ForwardError::Rejected {
                status: StatusCode::SERVICE_UNAVAILABLE,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn published_events_are_delivered_over_http() {
        let (_dir, scheduler) = scheduler().await;
        scheduler
            .add_run_meta(&RunMetadata::new("run-9", "o", "w"))
            .await
            .unwrap();
        let (url, received) = spawn_consumer(StatusCode::OK).await;

        let forwarder = Arc::new(EventForwarder::new(url, None));
        let subscription: Subscription = scheduler
            .subscribe_run_events("o", move |event| {
                let forwarder = forwarder.clone();
                async move { forwarder.forward(event).await }
            })
            .unwrap();

        scheduler
            .publish_run_event(&RunEvent::new("run-9", "o", "w", "planned"))
            .await
            .unwrap();

        let delivered = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some((_, body)) = received.lock().unwrap().first().cloned() {
                    break body;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        let event: RunEvent = serde_json::from_slice(&delivered).unwrap();
        assert_eq!(event.new_status, "planned");
        assert_eq!(event.metadata.unwrap().workspace, "w");
        subscription.close().await;
    }
}
