//! Bringing a stream to its desired configuration.
//!
//! Most configuration changes apply in place. A retention change cannot, so
//! the stream is rebuilt through a temporary mirror named `<NAME>_MIGRATION`:
//!
//! 1. create the mirror, sourcing from the original;
//! 2. wait until the mirror has caught up;
//! 3. delete the original;
//! 4. detach the mirror's source;
//! 5. create the final stream with the desired configuration, sourcing
//!    from the mirror;
//! 6. wait until the final stream has caught up;
//! 7. detach the final stream's source;
//! 8. delete the mirror.
//!
//! Between steps 3 and 5 only the mirror holds the data, and publishes to
//! the stream's subjects fail. A migration interrupted part-way is resumed
//! by the next call from whichever step the leftover mirror implies.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, instrument, warn};

use super::{RelayError, Result};
use crate::store::{
    Broker, RetentionPolicy, StartPosition, StreamConfig, StreamError, StreamSource,
};

/// Default interval between lag checks (1 second).
const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;

/// Default limit on each catch-up wait (5 minutes).
const DEFAULT_CATCH_UP_TIMEOUT_SECS: u64 = 300;

/// Timing of a migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationSettings {
    /// Interval between lag checks.
    pub poll_interval: Duration,
    /// Limit on each catch-up wait.
    pub catch_up_timeout: Duration,
}

impl Default for MigrationSettings {
    fn default() -> Self {
        MigrationSettings {
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            catch_up_timeout: Duration::from_secs(DEFAULT_CATCH_UP_TIMEOUT_SECS),
        }
    }
}

/// What [`ensure_stream`] had to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureOutcome {
    Created,
    Updated,
    Unchanged,
    Migrated {
        from: RetentionPolicy,
        to: RetentionPolicy,
    },
    /// Finished a migration an earlier run left part-way.
    Resumed { to: RetentionPolicy },
}

/// Name of the temporary mirror used to migrate `stream`.
pub fn mirror_name(stream: &str) -> String {
    format!("{stream}_MIGRATION")
}

/// Makes the stream named in `desired` exist with exactly that configuration.
#[instrument(skip(broker, desired, settings), fields(stream = %desired.name))]
pub async fn ensure_stream(
    broker: &Broker,
    desired: StreamConfig,
    settings: &MigrationSettings,
) -> Result<EnsureOutcome> {
    let mirror = mirror_name(&desired.name);

    if broker.stream(&mirror).is_ok()
        && let Some(outcome) = resume(broker, desired.clone(), &mirror, settings).await?
    {
        return Ok(outcome);
    }

    let current = match broker.stream_info(&desired.name) {
        Ok(info) => info.config,
        Err(StreamError::StreamNotFound(_)) => {
            broker.add_stream(desired)?;
            return Ok(EnsureOutcome::Created);
        }
        Err(e) => return Err(e.into()),
    };

    if current == desired {
        return Ok(EnsureOutcome::Unchanged);
    }
    if current.retention == desired.retention {
        broker.update_stream(desired)?;
        return Ok(EnsureOutcome::Updated);
    }

    let from = current.retention;
    let to = desired.retention;
    info!(%from, %to, "Retention changed; migrating stream");

    // 1-2
    let mirror_config = StreamConfig::new(mirror.clone(), Vec::new())
        .with_sync_writes(desired.sync_writes)
        .with_sources(vec![StreamSource::new(
            desired.name.clone(),
            StartPosition::First,
        )]);
    broker.add_stream(mirror_config)?;
    info!(step = 1, mirror = %mirror, "Created migration mirror");
    wait_caught_up(broker, &mirror, 2, settings).await?;

    finish_from_mirror(broker, desired, &mirror, settings).await?;
    Ok(EnsureOutcome::Migrated { from, to })
}

/// Steps 3-8: the mirror holds everything the original held.
async fn finish_from_mirror(
    broker: &Broker,
    desired: StreamConfig,
    mirror: &str,
    settings: &MigrationSettings,
) -> Result<()> {
    let name = desired.name.clone();

    match broker.delete_stream(&name) {
        Ok(()) | Err(StreamError::StreamNotFound(_)) => {}
        Err(e) => return Err(e.into()),
    }
    info!(step = 3, "Deleted original stream");

    detach_sources(broker, mirror)?;
    info!(step = 4, mirror, "Detached mirror");

    let sourced = desired
        .clone()
        .with_sources(vec![StreamSource::new(mirror, StartPosition::First)]);
    broker.add_stream(sourced)?;
    info!(step = 5, "Created final stream from mirror");

    resume_final(broker, desired, mirror, settings).await
}

/// Steps 6-8: the final stream exists and sources from the mirror.
async fn resume_final(
    broker: &Broker,
    desired: StreamConfig,
    mirror: &str,
    settings: &MigrationSettings,
) -> Result<()> {
    wait_caught_up(broker, &desired.name, 6, settings).await?;

    broker.update_stream(desired.clone())?;
    info!(step = 7, "Detached final stream");

    broker.delete_stream(mirror)?;
    info!(step = 8, mirror, "Deleted migration mirror");
    Ok(())
}

/// Continues a migration a previous run left unfinished.
///
/// Returns `None` if the mirror was discarded and the caller should start
/// from scratch.
async fn resume(
    broker: &Broker,
    desired: StreamConfig,
    mirror: &str,
    settings: &MigrationSettings,
) -> Result<Option<EnsureOutcome>> {
    let to = desired.retention;

    match broker.stream_info(&desired.name) {
        Ok(info) if info.config.sources.iter().any(|s| s.name == mirror) => {
            warn!(mirror, "Resuming migration at step 6");
            resume_final(broker, desired, mirror, settings).await?;
        }
        Ok(_) => {
            // Stopped before the original was deleted; the original is
            // still authoritative, so start over.
            warn!(mirror, "Discarding incomplete migration mirror");
            broker.delete_stream(mirror)?;
            return Ok(None);
        }
        Err(StreamError::StreamNotFound(_)) => {
            warn!(mirror, "Resuming migration at step 4");
            finish_from_mirror(broker, desired, mirror, settings).await?;
        }
        Err(e) => return Err(e.into()),
    }
    Ok(Some(EnsureOutcome::Resumed { to }))
}

fn detach_sources(broker: &Broker, stream: &str) -> Result<()> {
    let config = broker.stream_info(stream)?.config;
    if !config.sources.is_empty() {
        broker.update_stream(config.with_sources(Vec::new()))?;
    }
    Ok(())
}

/// Pumps sources until every source link of `stream` reports zero lag.
async fn wait_caught_up(
    broker: &Broker,
    stream: &str,
    step: u8,
    settings: &MigrationSettings,
) -> Result<()> {
    let deadline = Instant::now() + settings.catch_up_timeout;
    loop {
        broker.pump_sources()?;
        let info = broker.stream_info(stream)?;
        let lag: u64 = info.sources.iter().map(|s| s.lag).sum();
        if lag == 0 {
            info!(step, messages = info.state.messages, "Caught up");
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(RelayError::MigrationTimeout {
                stream: stream.to_string(),
                step,
            });
        }
        info!(step, lag, "Waiting for source to catch up");
        tokio::time::sleep(settings.poll_interval).await;
    }
}
