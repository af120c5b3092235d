//! Persisted state of a run polling task.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::run::RunMetadata;

/// Status recorded for a task that has not been polled yet.
pub const INITIAL_STATUS: &str = "new";

/// State of an active status poll for a run that emits no notifications.
///
/// `revision` mirrors the KV entry revision the task was last read at or
/// written with. Every write to the polling bucket must present it, so two
/// writers working from the same snapshot cannot both succeed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunPollingTask {
    pub metadata: RunMetadata,
    pub last_status: String,
    pub next_poll: DateTime<Utc>,
    /// True while a dispatch for this task is in flight.
    pub processing: bool,
    pub last_update: DateTime<Utc>,
    #[serde(default)]
    pub revision: u64,
}

impl RunPollingTask {
    /// Creates a task due at `now + delay`.
    pub fn new(metadata: RunMetadata, now: DateTime<Utc>, delay: Duration) -> Self {
        RunPollingTask {
            metadata,
            last_status: INITIAL_STATUS.to_string(),
            next_poll: now + delay,
            processing: false,
            last_update: now,
            revision: 0,
        }
    }

    /// Returns true if the dispatcher may promote this task at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.processing && now > self.next_poll
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task_at(next_poll_offset_secs: i64, processing: bool) -> (RunPollingTask, DateTime<Utc>) {
        let now = Utc::now();
        let mut task = RunPollingTask::new(RunMetadata::new("run-1", "o", "w"), now, Duration::zero());
        task.next_poll = now + Duration::seconds(next_poll_offset_secs);
        task.processing = processing;
        (task, now)
    }

    #[test]
    fn new_task_starts_unprocessed() {
        let now = Utc::now();
        let task = RunPollingTask::new(RunMetadata::new("run-1", "o", "w"), now, Duration::seconds(10));
        assert_eq!(task.last_status, INITIAL_STATUS);
        assert!(!task.processing);
        assert_eq!(task.revision, 0);
        assert_eq!(task.next_poll, now + Duration::seconds(10));
        assert_eq!(task.last_update, now);
    }

    #[test]
    fn due_only_when_idle_and_past_next_poll() {
        let (task, now) = task_at(-5, false);
        assert!(task.is_due(now));

        let (task, now) = task_at(-5, true);
        assert!(!task.is_due(now));

        let (task, now) = task_at(5, false);
        assert!(!task.is_due(now));
    }

    #[test]
    fn missing_revision_defaults_to_zero() {
        let (task, _) = task_at(0, false);
        let mut value = serde_json::to_value(&task).unwrap();
        value.as_object_mut().unwrap().remove("revision");
        let parsed: RunPollingTask = serde_json::from_value(value).unwrap();
        assert_eq!(parsed.revision, 0);
    }
}
