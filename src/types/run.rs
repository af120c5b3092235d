//! Run metadata and run status events.
//!
//! `RunMetadata` is written once when a run is triggered and carries everything
//! needed to route a later status change back to the merge request thread that
//! asked for it. `RunEvent` is the status-change message itself.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::ids::RunId;

/// Opaque string map carrying distributed-tracing context across the stream.
pub type Carrier = BTreeMap<String, String>;

/// The kind of run that was triggered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunAction {
    #[default]
    Plan,
    Apply,
}

impl RunAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunAction::Plan => "plan",
            RunAction::Apply => "apply",
        }
    }
}

impl fmt::Display for RunAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown run action.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown run action: {0}")]
pub struct UnknownRunAction(pub String);

impl FromStr for RunAction {
    type Err = UnknownRunAction;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "plan" => Ok(RunAction::Plan),
            "apply" => Ok(RunAction::Apply),
            _ => Err(UnknownRunAction(s.to_string())),
        }
    }
}

/// Status values reported by the execution service.
///
/// Statuses travel on the wire as plain strings; this enum only classifies
/// them. Anything not recognised is kept verbatim in `Other` and treated as
/// non-terminal, so a new upstream status never stops polling early.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RunStatus {
    Pending,
    PlanQueued,
    Planning,
    Planned,
    CostEstimating,
    CostEstimated,
    PolicyChecking,
    PolicyOverride,
    PolicySoftFailed,
    PolicyChecked,
    Confirmed,
    PostPlanRunning,
    PostPlanCompleted,
    ApplyQueued,
    Applying,
    Applied,
    PlannedAndFinished,
    Discarded,
    Errored,
    Canceled,
    ForceCanceled,
    Other(String),
}

impl RunStatus {
    /// Classifies a status string. Never fails.
    pub fn parse(s: &str) -> Self {
        match s {
            "pending" => RunStatus::Pending,
            "plan_queued" => RunStatus::PlanQueued,
            "planning" => RunStatus::Planning,
            "planned" => RunStatus::Planned,
            "cost_estimating" => RunStatus::CostEstimating,
            "cost_estimated" => RunStatus::CostEstimated,
            "policy_checking" => RunStatus::PolicyChecking,
            "policy_override" => RunStatus::PolicyOverride,
            "policy_soft_failed" => RunStatus::PolicySoftFailed,
            "policy_checked" => RunStatus::PolicyChecked,
            "confirmed" => RunStatus::Confirmed,
            "post_plan_running" => RunStatus::PostPlanRunning,
            "post_plan_completed" => RunStatus::PostPlanCompleted,
            "apply_queued" => RunStatus::ApplyQueued,
            "applying" => RunStatus::Applying,
            "applied" => RunStatus::Applied,
            "planned_and_finished" => RunStatus::PlannedAndFinished,
            "discarded" => RunStatus::Discarded,
            "errored" => RunStatus::Errored,
            "canceled" => RunStatus::Canceled,
            "force_canceled" => RunStatus::ForceCanceled,
            other => RunStatus::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::PlanQueued => "plan_queued",
            RunStatus::Planning => "planning",
            RunStatus::Planned => "planned",
            RunStatus::CostEstimating => "cost_estimating",
            RunStatus::CostEstimated => "cost_estimated",
            RunStatus::PolicyChecking => "policy_checking",
            RunStatus::PolicyOverride => "policy_override",
            RunStatus::PolicySoftFailed => "policy_soft_failed",
            RunStatus::PolicyChecked => "policy_checked",
            RunStatus::Confirmed => "confirmed",
            RunStatus::PostPlanRunning => "post_plan_running",
            RunStatus::PostPlanCompleted => "post_plan_completed",
            RunStatus::ApplyQueued => "apply_queued",
            RunStatus::Applying => "applying",
            RunStatus::Applied => "applied",
            RunStatus::PlannedAndFinished => "planned_and_finished",
            RunStatus::Discarded => "discarded",
            RunStatus::Errored => "errored",
            RunStatus::Canceled => "canceled",
            RunStatus::ForceCanceled => "force_canceled",
            RunStatus::Other(s) => s,
        }
    }

    /// Returns true once the run can no longer change status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Applied
                | RunStatus::PlannedAndFinished
                | RunStatus::Discarded
                | RunStatus::Errored
                | RunStatus::Canceled
                | RunStatus::ForceCanceled
                | RunStatus::PolicySoftFailed
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable routing information for a run.
///
/// Missing fields decode to their defaults so older producers that only sent
/// a subset remain readable; a type mismatch on a known field still fails.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunMetadata {
    /// Identifier assigned by the execution service.
    pub run_id: RunId,
    pub organization: String,
    pub workspace: String,
    pub action: RunAction,
    pub commit_sha: String,
    /// Upstream VCS provider name (e.g. `gitlab`, `github`).
    pub source: String,
    /// Project path (with namespace) that owns the merge request.
    pub mr_project: String,
    /// Project-scoped merge request number.
    pub mr_iid: u64,
    /// Discussion thread the status updates are posted to.
    pub discussion_id: String,
    /// The comment that started the thread.
    pub root_note_id: u64,
    pub auto_merge: bool,
}

impl RunMetadata {
    pub fn new(
        run_id: impl Into<RunId>,
        organization: impl Into<String>,
        workspace: impl Into<String>,
    ) -> Self {
        RunMetadata {
            run_id: run_id.into(),
            organization: organization.into(),
            workspace: workspace.into(),
            ..Default::default()
        }
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn organization(&self) -> &str {
        &self.organization
    }

    pub fn workspace(&self) -> &str {
        &self.workspace
    }

    pub fn action(&self) -> RunAction {
        self.action
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Token naming the provider-scoped run event subject for this run.
    ///
    /// Falls back to the organization when no provider was recorded.
    pub fn subject_token(&self) -> &str {
        if self.source.is_empty() {
            &self.organization
        } else {
            &self.source
        }
    }
}

/// A run status change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunEvent {
    pub run_id: RunId,
    pub organization: String,
    pub workspace: String,
    pub new_status: String,
    /// Filled in on delivery from the metadata store; absent at publish time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<RunMetadata>,
    pub carrier: Carrier,
}

impl RunEvent {
    pub fn new(
        run_id: impl Into<RunId>,
        organization: impl Into<String>,
        workspace: impl Into<String>,
        new_status: impl Into<String>,
    ) -> Self {
        RunEvent {
            run_id: run_id.into(),
            organization: organization.into(),
            workspace: workspace.into(),
            new_status: new_status.into(),
            metadata: None,
            carrier: Carrier::new(),
        }
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn metadata(&self) -> Option<&RunMetadata> {
        self.metadata.as_ref()
    }

    pub fn status(&self) -> RunStatus {
        RunStatus::parse(&self.new_status)
    }
}
