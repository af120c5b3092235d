//! Health check endpoint for liveness probes.
//!
//! Returns 200 OK while the relay's streams exist and every stream it
//! subscribed to still has a live consumer; 503 with the reason otherwise.

use axum::extract::State;
use axum::http::StatusCode;
use tracing::warn;

use super::AppState;

/// Health check handler.
///
/// # Example
///
/// ```ignore
/// GET /health HTTP/1.1
///
/// HTTP/1.1 503 Service Unavailable
/// Content-Type: text/plain
///
/// unhealthy: stream RUN_POLLING has no active consumers
/// ```
pub async fn health_handler(State(app_state): State<AppState>) -> (StatusCode, String) {
    match app_state.scheduler().health_check() {
        Ok(()) => (StatusCode::OK, "OK".to_string()),
        Err(e) => {
            warn!(error = %e, "Health check failed");
            (StatusCode::SERVICE_UNAVAILABLE, e.to_string())
        }
    }
}
