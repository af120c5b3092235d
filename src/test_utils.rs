//! Shared test utilities and arbitrary generators for property-based testing.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use proptest::prelude::*;
use tempfile::TempDir;

use crate::relay::{MigrationSettings, Scheduler, SchedulerConfig};
use crate::retry::RetryConfig;
use crate::store::Broker;
use crate::types::{Carrier, RunAction, RunEvent, RunId, RunMetadata, RunPollingTask};

/// Scheduler settings with millisecond-scale timings and no fsync.
pub fn test_config() -> SchedulerConfig {
    SchedulerConfig::new()
        .with_sync_writes(false)
        .with_metadata_retry(RetryConfig::new(
            2,
            Duration::from_millis(10),
            Duration::from_millis(40),
            2.0,
        ))
        .with_fetch_idle(Duration::from_millis(10))
        .with_nak_delay(Duration::from_millis(20))
        .with_dispatch_interval(Duration::from_millis(20))
        .with_migration(MigrationSettings {
            poll_interval: Duration::from_millis(5),
            catch_up_timeout: Duration::from_secs(5),
        })
}

/// Hex HMAC-SHA512 of `payload`, as the notification sender computes it.
pub fn sign_notification(payload: &[u8], token: &[u8]) -> String {
    use hmac::{Hmac, Mac};
    let mut mac = Hmac::<sha2::Sha512>::new_from_slice(token).unwrap();
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

/// A scheduler over a fresh broker in a temporary directory.
pub async fn scheduler() -> (TempDir, Scheduler) {
    let dir = tempfile::tempdir().unwrap();
    let broker = Arc::new(Broker::open(dir.path()).unwrap());
    let scheduler = Scheduler::connect(broker, test_config()).await.unwrap();
    (dir, scheduler)
}

pub fn arb_run_id() -> impl Strategy<Value = RunId> {
    "run-[a-zA-Z0-9]{16}".prop_map(RunId::new)
}

pub fn arb_run_action() -> impl Strategy<Value = RunAction> {
    prop_oneof![Just(RunAction::Plan), Just(RunAction::Apply)]
}

pub fn arb_status() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("pending".to_string()),
        Just("planning".to_string()),
        Just("planned".to_string()),
        Just("applying".to_string()),
        Just("applied".to_string()),
        Just("planned_and_finished".to_string()),
        Just("errored".to_string()),
        "[a-z_]{1,20}",
    ]
}

pub fn arb_carrier() -> impl Strategy<Value = Carrier> {
    prop::collection::btree_map("[a-z-]{1,16}", "[a-zA-Z0-9-]{0,64}", 0..4)
}

pub fn arb_timestamp() -> impl Strategy<Value = DateTime<Utc>> {
    (0i64..4_102_444_800, 0u32..1_000_000_000)
        .prop_map(|(secs, nanos)| DateTime::from_timestamp(secs, nanos).unwrap_or_default())
}

pub fn arb_run_metadata() -> impl Strategy<Value = RunMetadata> {
    (
        arb_run_id(),
        "[a-z][a-z0-9-]{0,20}",
        "[a-z][a-z0-9_-]{0,30}",
        arb_run_action(),
        "[0-9a-f]{40}",
        prop_oneof![Just(String::new()), Just("gitlab".to_string()), Just("github".to_string())],
        "[a-z]{1,10}/[a-z-]{1,20}",
        any::<u64>(),
        "[0-9a-f]{0,40}",
        any::<u64>(),
        any::<bool>(),
    )
        .prop_map(
            |(
                run_id,
                organization,
                workspace,
                action,
                commit_sha,
                source,
                mr_project,
                mr_iid,
                discussion_id,
                root_note_id,
                auto_merge,
            )| RunMetadata {
                run_id,
                organization,
                workspace,
                action,
                commit_sha,
                source,
                mr_project,
                mr_iid,
                discussion_id,
                root_note_id,
                auto_merge,
            },
        )
}

pub fn arb_run_event() -> impl Strategy<Value = RunEvent> {
    (
        arb_run_metadata(),
        arb_status(),
        any::<bool>(),
        arb_carrier(),
    )
        .prop_map(|(meta, new_status, enriched, carrier)| RunEvent {
            run_id: meta.run_id.clone(),
            organization: meta.organization.clone(),
            workspace: meta.workspace.clone(),
            new_status,
            metadata: enriched.then_some(meta),
            carrier,
        })
}

pub fn arb_polling_task() -> impl Strategy<Value = RunPollingTask> {
    (
        arb_run_metadata(),
        arb_status(),
        arb_timestamp(),
        any::<bool>(),
        arb_timestamp(),
        any::<u64>(),
    )
        .prop_map(
            |(metadata, last_status, next_poll, processing, last_update, revision)| {
                RunPollingTask {
                    metadata,
                    last_status,
                    next_poll,
                    processing,
                    last_update,
                    revision,
                }
            },
        )
}
