//! Status polling for runs that send no notifications.
//!
//! [`RunPoller`] is the callback behind the polling subscription. Each
//! delivery fetches the run's current status; a change is published as a
//! run event, then the task is rescheduled (run still going) or completed
//! (run finished).

use std::fmt;
use std::future::Future;

use tracing::{debug, info, instrument, warn};

use crate::relay::{PollingTask, Scheduler};
use crate::types::{RunEvent, RunId, RunStatus};

/// Current state of a run as reported by the execution service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSnapshot {
    pub run_id: RunId,
    /// Raw status string, e.g. `planning` or `applied`.
    pub status: String,
}

impl RunSnapshot {
    pub fn new(run_id: impl Into<RunId>, status: impl Into<String>) -> Self {
        RunSnapshot {
            run_id: run_id.into(),
            status: status.into(),
        }
    }
}

/// Where run statuses come from.
pub trait RunStatusSource {
    type Error: fmt::Display;

    fn get_run(
        &self,
        run_id: &RunId,
    ) -> impl Future<Output = Result<RunSnapshot, Self::Error>> + Send;
}

/// Drives polling tasks against a [`RunStatusSource`].
#[derive(Debug, Clone)]
pub struct RunPoller<S> {
    scheduler: Scheduler,
    source: S,
}

impl<S: RunStatusSource> RunPoller<S> {
    pub fn new(scheduler: Scheduler, source: S) -> Self {
        RunPoller { scheduler, source }
    }

    /// Polls one run.
    ///
    /// Returns `false` when the status could not be fetched or a changed
    /// status could not be published; the task message is then redelivered
    /// and the comparison redone. Failing to reschedule or complete the task
    /// is logged but still returns `true`.
    #[instrument(skip(self, task), fields(run_id = %task.run_id(), last_status = %task.last_status()))]
    pub async fn poll(&self, mut task: PollingTask) -> bool {
        let snapshot = match self.source.get_run(task.run_id()).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(error = %e, "Failed to fetch run status");
                return false;
            }
        };

        if snapshot.status != task.last_status() {
            let meta = task.metadata();
            let event = RunEvent::new(
                task.run_id().clone(),
                meta.organization.clone(),
                meta.workspace.clone(),
                snapshot.status.clone(),
            );
            if let Err(e) = self.scheduler.publish_run_event(&event).await {
                warn!(status = %snapshot.status, error = %e, "Failed to publish status change");
                return false;
            }
            info!(from = %task.last_status(), to = %snapshot.status, "Run status changed");
            task.set_last_status(snapshot.status.clone());
        }

        if RunStatus::parse(&snapshot.status).is_terminal() {
            match task.completed().await {
                Ok(()) => debug!(status = %snapshot.status, "Run finished; polling stopped"),
                Err(e) => warn!(error = %e, "Failed to complete polling task"),
            }
        } else if let Err(e) = task.reschedule().await {
            warn!(error = %e, "Failed to reschedule polling task");
        }
        true
    }
}
