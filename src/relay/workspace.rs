//! Fan-out counters for merge requests that trigger several workspaces.

use std::sync::Arc;

use tracing::{debug, instrument};

use super::{RelayError, Result};
use crate::retry::{RetryConfig, retry_with_backoff};
use crate::store::KvBucket;
use crate::types::{WorkspaceMetadata, workspace_key};

/// The `WORKSPACE_METADATA` bucket.
#[derive(Debug, Clone)]
pub struct WorkspaceStore {
    bucket: Arc<KvBucket>,
}

impl WorkspaceStore {
    pub fn new(bucket: Arc<KvBucket>) -> Self {
        WorkspaceStore { bucket }
    }

    /// Creates or overwrites the counters for a merge request's workspace run.
    #[instrument(skip(self, meta))]
    pub async fn set(&self, mr_id: &str, workspace: &str, meta: &WorkspaceMetadata) -> Result<u64> {
        let bytes = serde_json::to_vec(meta)?;
        let key = workspace_key(mr_id, workspace);
        let revision = self
            .bucket
            .blocking(move |bucket| bucket.put(&key, &bytes))
            .await?;
        debug!(revision, executed = meta.executed, total = meta.total, "Stored workspace counters");
        Ok(revision)
    }

    pub fn get(&self, mr_id: &str, workspace: &str) -> Result<Option<WorkspaceMetadata>> {
        match self.bucket.entry(&workspace_key(mr_id, workspace))? {
            Some(entry) => Ok(Some(serde_json::from_slice(&entry.value)?)),
            None => Ok(None),
        }
    }

    /// Counts one more finished workspace and returns the new counters.
    ///
    /// Concurrent callers are serialised through revision-checked updates;
    /// a lost race re-reads and tries again.
    #[instrument(skip(self))]
    pub async fn record_executed(&self, mr_id: &str, workspace: &str) -> Result<WorkspaceMetadata> {
        let key = workspace_key(mr_id, workspace);
        retry_with_backoff(RetryConfig::CONFLICT, || async {
            let entry = self.bucket.get(&key)?;
            let mut meta: WorkspaceMetadata = serde_json::from_slice(&entry.value)?;
            meta.record_executed();
            let bytes = serde_json::to_vec(&meta)?;
            let (owned, expected) = (key.clone(), entry.revision);
            self.bucket
                .blocking(move |bucket| bucket.update(&owned, &bytes, expected))
                .await?;
            Ok::<_, RelayError>(meta)
        })
        .await
        .into_result()
    }

    pub async fn delete(&self, mr_id: &str, workspace: &str) -> Result<()> {
        let key = workspace_key(mr_id, workspace);
        self.bucket
            .blocking(move |bucket| bucket.delete(&key))
            .await?;
        Ok(())
    }
}
