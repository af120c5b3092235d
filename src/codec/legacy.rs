//! Schema version 1 record shapes.
//!
//! Version 1 bodies carry no `schema_version` field and use PascalCase keys.
//! They are decoded into these structs and then upgraded into the current
//! types; nothing is ever encoded in this shape.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::types::{RunAction, RunEvent, RunId, RunMetadata, RunPollingTask};

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct RunMetadataV1 {
    #[serde(rename = "RunID")]
    pub run_id: String,
    pub organization: String,
    pub workspace: String,
    pub action: String,
    #[serde(rename = "CommitSHA")]
    pub commit_sha: String,
    pub source: String,
    #[serde(rename = "MRProjectNameWithNamespace")]
    pub mr_project: String,
    #[serde(rename = "MRIID")]
    pub mr_iid: u64,
    #[serde(rename = "DiscussionID")]
    pub discussion_id: String,
    #[serde(rename = "RootNoteID")]
    pub root_note_id: u64,
    pub auto_merge: bool,
}

impl From<RunMetadataV1> for RunMetadata {
    fn from(v1: RunMetadataV1) -> Self {
        RunMetadata {
            run_id: RunId::new(v1.run_id),
            organization: v1.organization,
            workspace: v1.workspace,
            // Version 1 wrote an empty action for plans.
            action: v1.action.parse().unwrap_or(RunAction::Plan),
            commit_sha: v1.commit_sha,
            source: v1.source,
            mr_project: v1.mr_project,
            mr_iid: v1.mr_iid,
            discussion_id: v1.discussion_id,
            root_note_id: v1.root_note_id,
            auto_merge: v1.auto_merge,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct RunEventV1 {
    #[serde(rename = "RunID")]
    pub run_id: String,
    pub organization: String,
    pub workspace: String,
    pub new_status: String,
    pub metadata: Option<RunMetadataV1>,
    pub carrier: BTreeMap<String, String>,
}

impl From<RunEventV1> for RunEvent {
    fn from(v1: RunEventV1) -> Self {
        RunEvent {
            run_id: RunId::new(v1.run_id),
            organization: v1.organization,
            workspace: v1.workspace,
            new_status: v1.new_status,
            metadata: v1.metadata.map(RunMetadata::from),
            carrier: v1.carrier,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RunPollingTaskV1 {
    #[serde(default)]
    pub metadata: RunMetadataV1,
    #[serde(default)]
    pub last_status: String,
    pub next_poll: DateTime<Utc>,
    #[serde(default)]
    pub processing: bool,
    pub last_update: DateTime<Utc>,
    #[serde(default)]
    pub revision: u64,
}

impl From<RunPollingTaskV1> for RunPollingTask {
    fn from(v1: RunPollingTaskV1) -> Self {
        RunPollingTask {
            metadata: v1.metadata.into(),
            last_status: v1.last_status,
            next_poll: v1.next_poll,
            processing: v1.processing,
            last_update: v1.last_update,
            revision: v1.revision,
        }
    }
}
