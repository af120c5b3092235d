//! Minimal client for the execution service's run API.

use std::time::Duration;

use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::poller::{RunSnapshot, RunStatusSource};
use crate::retry::{Classify, ErrorKind};
use crate::types::RunId;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum TfcError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("run {0} not found")]
    NotFound(RunId),

    #[error("unexpected status {status}: {body}")]
    Status { status: StatusCode, body: String },
}

impl Classify for TfcError {
    fn kind(&self) -> ErrorKind {
        match self {
            TfcError::Request(_) => ErrorKind::Transient,
            TfcError::NotFound(_) => ErrorKind::Permanent,
            TfcError::Status { status, .. } if status.is_server_error() => ErrorKind::Transient,
            TfcError::Status { status, .. } if *status == StatusCode::TOO_MANY_REQUESTS => {
                ErrorKind::Transient
            }
            TfcError::Status { .. } => ErrorKind::Permanent,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RunDocument {
    data: RunData,
}

#[derive(Debug, Deserialize)]
struct RunData {
    id: String,
    attributes: RunAttributes,
}

#[derive(Debug, Deserialize)]
struct RunAttributes {
    status: String,
}

/// Reads run status over HTTP with a bearer token.
#[derive(Clone)]
pub struct TfcClient {
    base_url: String,
    token: String,
    client: reqwest::Client,
}

impl std::fmt::Debug for TfcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TfcClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl TfcClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        TfcClient {
            base_url: base_url.into(),
            token: token.into(),
            client,
        }
    }

    fn run_url(&self, run_id: &RunId) -> String {
        format!("{}/api/v2/runs/{}", self.base_url.trim_end_matches('/'), run_id)
    }

    /// Fetches the current status of a run.
    pub async fn run(&self, run_id: &RunId) -> Result<RunSnapshot, TfcError> {
        let response = self
            .client
            .get(self.run_url(run_id))
            .bearer_auth(&self.token)
            .header(reqwest::header::CONTENT_TYPE, "application/vnd.api+json")
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(TfcError::NotFound(run_id.clone()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TfcError::Status { status, body });
        }

        let document: RunDocument = response.json().await?;
        debug!(run_id = %document.data.id, status = %document.data.attributes.status, "Fetched run");
        Ok(RunSnapshot::new(document.data.id, document.data.attributes.status))
    }
}

impl RunStatusSource for TfcClient {
    type Error = TfcError;

    async fn get_run(&self, run_id: &RunId) -> Result<RunSnapshot, TfcError> {
        self.run(run_id).await
    }
}
