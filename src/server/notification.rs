//! Run notification endpoint.
//!
//! The execution service POSTs a notification whenever a run changes state.
//! Each status in the payload is republished as a run event. Payloads are
//! signed with HMAC-SHA512 over the raw body, hex encoded in
//! `X-TFE-Notification-Signature`.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha512;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use super::AppState;
use crate::relay::RelayError;
use crate::types::{RunEvent, RunId};

type HmacSha512 = Hmac<Sha512>;

/// Header carrying the payload signature.
const HEADER_SIGNATURE: &str = "x-tfe-notification-signature";

/// Trigger sent when a notification configuration is first saved.
const VERIFICATION_TRIGGER: &str = "verification";

#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("missing required header: {0}")]
    MissingHeader(&'static str),

    #[error("invalid signature")]
    InvalidSignature,

    #[error("invalid JSON body: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("notification has no run id")]
    MissingRunId,

    #[error("failed to publish run event: {0}")]
    Publish(#[from] RelayError),
}

impl IntoResponse for NotificationError {
    fn into_response(self) -> Response {
        let status = match &self {
            NotificationError::MissingHeader(_) | NotificationError::InvalidSignature => {
                StatusCode::UNAUTHORIZED
            }
            NotificationError::InvalidJson(_) | NotificationError::MissingRunId => {
                StatusCode::BAD_REQUEST
            }
            NotificationError::Publish(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

/// Body of a run notification. Fields the relay does not use are ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct NotificationPayload {
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub organization_name: Option<String>,
    #[serde(default)]
    pub workspace_name: Option<String>,
    #[serde(default)]
    pub notifications: Vec<Notification>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Notification {
    #[serde(default)]
    pub trigger: String,
    #[serde(default)]
    pub run_status: Option<String>,
}

impl NotificationPayload {
    fn is_verification(&self) -> bool {
        !self.notifications.is_empty()
            && self
                .notifications
                .iter()
                .all(|n| n.trigger == VERIFICATION_TRIGGER)
    }

    /// One run event per status in the payload.
    fn events(&self) -> Result<Vec<RunEvent>, NotificationError> {
        let run_id = self
            .run_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .ok_or(NotificationError::MissingRunId)?;
        let organization = self.organization_name.clone().unwrap_or_default();
        let workspace = self.workspace_name.clone().unwrap_or_default();

        Ok(self
            .notifications
            .iter()
            .filter_map(|n| n.run_status.as_deref())
            .map(|status| {
                RunEvent::new(
                    RunId::new(run_id),
                    organization.clone(),
                    workspace.clone(),
                    status,
                )
            })
            .collect())
    }
}

/// Verifies a hex HMAC-SHA512 signature in constant time.
pub fn verify_signature(payload: &[u8], signature: &str, token: &[u8]) -> bool {
    let Ok(expected) = hex::decode(signature.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha512::new_from_slice(token) else {
        return false;
    };
    mac.update(payload);
    mac.verify_slice(&expected).is_ok()
}

/// Run notification handler.
///
/// # Response
///
/// - 200 OK: every status was published, or the payload was a verification ping
/// - 400 Bad Request: body is not a notification
/// - 401 Unauthorized: signature missing or wrong
/// - 500 Internal Server Error: publishing failed; the sender retries
#[instrument(skip_all)]
pub async fn notification_handler(
    State(app_state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, &'static str), NotificationError> {
    if let Some(token) = app_state.notification_token() {
        let signature = headers
            .get(HEADER_SIGNATURE)
            .and_then(|v| v.to_str().ok())
            .ok_or(NotificationError::MissingHeader(HEADER_SIGNATURE))?;
        if !verify_signature(&body, signature, token) {
            warn!("Invalid notification signature");
            return Err(NotificationError::InvalidSignature);
        }
    }

    let payload: NotificationPayload = serde_json::from_slice(&body)?;
    if payload.is_verification() {
        info!("Notification configuration verified");
        return Ok((StatusCode::OK, "OK"));
    }

    let events = payload.events()?;
    debug!(run_id = ?payload.run_id, count = events.len(), "Received run notification");
    for event in &events {
        app_state.scheduler().publish_run_event(event).await.map_err(|e| {
            warn!(run_id = %event.run_id, status = %event.new_status, error = %e, "Failed to publish notification");
            e
        })?;
    }
    Ok((StatusCode::OK, "OK"))
}
