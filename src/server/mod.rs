//! HTTP surface of the relay.
//!
//! # Endpoints
//!
//! - `POST /hooks/tfc/notification` - Run notifications, republished as run events
//! - `GET /api/v1/runs/{run_id}/metadata` - Stored metadata of a run
//! - `GET /health` - 200 while the relay is healthy, 503 otherwise

use std::sync::Arc;

pub mod health;
pub mod notification;
pub mod runs;

pub use health::health_handler;
pub use notification::notification_handler;
pub use runs::run_metadata_handler;

use crate::relay::Scheduler;

/// Shared application state, passed to handlers via Axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    scheduler: Scheduler,

    /// HMAC-SHA512 key for notification signatures. Unsigned notifications
    /// are accepted when this is `None`.
    notification_token: Option<Vec<u8>>,
}

impl AppState {
    pub fn new(scheduler: Scheduler, notification_token: Option<Vec<u8>>) -> Self {
        AppState {
            inner: Arc::new(AppStateInner {
                scheduler,
                notification_token,
            }),
        }
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    pub fn notification_token(&self) -> Option<&[u8]> {
        self.inner.notification_token.as_deref()
    }
}

/// Builds the axum Router with all endpoints.
pub fn build_router(app_state: AppState) -> axum::Router {
    use axum::routing::{get, post};

    axum::Router::new()
        .route("/hooks/tfc/notification", post(notification_handler))
        .route("/api/v1/runs/{run_id}/metadata", get(run_metadata_handler))
        .route("/health", get(health_handler))
        .with_state(app_state)
}
