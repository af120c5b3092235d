//! Run metadata: created once, read many times, never updated.

use tracing::{debug, instrument, warn};

use super::{RelayError, Result, Scheduler};
use crate::codec;
use crate::retry::{RetryResult, retry_with_backoff};
use crate::store::KvError;
use crate::types::{RunId, RunMetadata};

impl Scheduler {
    /// Stores metadata for a new run.
    ///
    /// Fails with [`RelayError::DuplicateRun`] if the run already has
    /// metadata, so a redelivered trigger cannot replace the first record.
    #[instrument(skip(self, metadata), fields(run_id = %metadata.run_id))]
    pub async fn add_run_meta(&self, metadata: &RunMetadata) -> Result<()> {
        let bytes = codec::encode(metadata)?;
        let key = metadata.run_id.to_string();
        let created = self
            .inner
            .metadata
            .blocking(move |bucket| bucket.create(&key, &bytes))
            .await;
        match created {
            Ok(revision) => {
                debug!(revision, "Stored run metadata");
                Ok(())
            }
            Err(KvError::KeyExists { .. }) => Err(RelayError::DuplicateRun(metadata.run_id.clone())),
            Err(e) => Err(e.into()),
        }
    }

    /// Reads metadata for a run.
    pub fn get_run_meta(&self, run_id: &RunId) -> Result<RunMetadata> {
        let entry = match self.inner.metadata.get(run_id.as_str()) {
            Ok(entry) => entry,
            Err(KvError::KeyNotFound { .. }) | Err(KvError::InvalidKey(_)) => {
                return Err(RelayError::MetadataNotFound(run_id.clone()));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(codec::decode(&entry.value)?)
    }

    /// Reads metadata for a run, retrying while it is not yet visible.
    ///
    /// The metadata write and the first status notification race each other,
    /// so a miss is retried a few times before it is reported.
    pub(crate) async fn wait_for_run_metadata(&self, run_id: &RunId) -> Result<RunMetadata> {
        let result = retry_with_backoff(self.inner.config.metadata_retry, || async {
            self.get_run_meta(run_id)
        })
        .await;

        match result {
            RetryResult::Success(meta) => Ok(meta),
            RetryResult::ExhaustedRetries {
                last_error,
                attempts,
            } => {
                warn!(run_id = %run_id, attempts, error = %last_error, "Run metadata never became visible");
                Err(last_error)
            }
            RetryResult::PermanentError(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{arb_run_metadata, scheduler};
    use proptest::prelude::*;

    #[tokio::test]
    async fn second_add_for_same_run_fails() {
        let (_dir, scheduler) = scheduler().await;
        let meta = RunMetadata::new("run-1", "o", "w");

        scheduler.add_run_meta(&meta).await.unwrap();
        let mut other = meta.clone();
        other.workspace = "different".to_string();
        assert!(matches!(
            scheduler.add_run_meta(&other).await,
            Err(RelayError::DuplicateRun(_))
        ));
        assert_eq!(scheduler.get_run_meta(&meta.run_id).unwrap().workspace, "w");
    }

    #[tokio::test]
    async fn missing_metadata_is_not_found() {
        let (_dir, scheduler) = scheduler().await;
        assert!(matches!(
            scheduler.get_run_meta(&RunId::new("run-missing")),
            Err(RelayError::MetadataNotFound(_))
        ));
    }

    #[tokio::test]
    async fn wait_sees_metadata_written_during_backoff() {
        let (_dir, scheduler) = scheduler().await;
        let writer = scheduler.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            writer
                .add_run_meta(&RunMetadata::new("run-late", "o", "w"))
                .await
                .unwrap();
        });

        let meta = scheduler
            .wait_for_run_metadata(&RunId::new("run-late"))
            .await
            .unwrap();
        assert_eq!(meta.organization, "o");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn stored_metadata_reads_back(meta in arb_run_metadata()) {
            let rt = tokio::runtime::Runtime::new().unwrap();
            rt.block_on(async {
                let (_dir, scheduler) = scheduler().await;
                scheduler.add_run_meta(&meta).await.unwrap();
                assert_eq!(scheduler.get_run_meta(&meta.run_id).unwrap(), meta.clone());
                assert!(scheduler.add_run_meta(&meta).await.is_err());
            });
        }
    }
}
