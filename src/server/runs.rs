//! Run metadata inspection endpoint.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use super::AppState;
use crate::relay::RelayError;
use crate::types::{RunId, RunMetadata};

#[derive(Debug, Error)]
pub enum RunsError {
    #[error("no metadata for run {0}")]
    NotFound(RunId),

    #[error("{0}")]
    Relay(#[from] RelayError),
}

impl IntoResponse for RunsError {
    fn into_response(self) -> Response {
        let status = match &self {
            RunsError::NotFound(_) => StatusCode::NOT_FOUND,
            RunsError::Relay(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

/// Returns the stored metadata of a run.
///
/// - 200 OK with the `RunMetadata` as JSON
/// - 404 Not Found if the run has no metadata
/// - 500 Internal Server Error if the store cannot be read
pub async fn run_metadata_handler(
    State(app_state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<RunMetadata>, RunsError> {
    let run_id = RunId::new(run_id);
    match app_state.scheduler().get_run_meta(&run_id) {
        Ok(meta) => Ok(Json(meta)),
        Err(RelayError::MetadataNotFound(_)) => Err(RunsError::NotFound(run_id)),
        Err(e) => Err(e.into()),
    }
}
