//! Fan-out bookkeeping for merge requests that trigger several workspace runs.

use serde::{Deserialize, Serialize};

/// How many of a merge request's fanned-out workspace runs have finished.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceMetadata {
    /// Workspaces whose runs have completed so far.
    pub executed: u32,
    /// Workspaces the trigger fanned out to.
    pub total: u32,
}

impl WorkspaceMetadata {
    pub fn new(total: u32) -> Self {
        WorkspaceMetadata { executed: 0, total }
    }

    /// Returns true once every sibling run has completed.
    pub fn all_executed(&self) -> bool {
        self.executed >= self.total
    }

    /// Counts one more completed workspace, saturating at `total`.
    pub fn record_executed(&mut self) {
        if self.executed < self.total {
            self.executed += 1;
        }
    }
}

/// Builds the reconciliation key for a merge request and workspace.
pub fn workspace_key(mr_id: &str, workspace: &str) -> String {
    format!("{}-{}", mr_id, workspace)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completes_after_total_executions() {
        let mut meta = WorkspaceMetadata::new(2);
        assert!(!meta.all_executed());
        meta.record_executed();
        assert!(!meta.all_executed());
        meta.record_executed();
        assert!(meta.all_executed());
        meta.record_executed();
        assert_eq!(meta.executed, 2);
    }

    #[test]
    fn key_format() {
        assert_eq!(workspace_key("42", "prod-network"), "42-prod-network");
    }
}
