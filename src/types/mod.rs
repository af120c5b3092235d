//! Core domain types for the run relay.
//!
//! These are the records that move through the metadata store, the polling
//! bucket and the run event stream.

pub mod ids;
pub mod run;
pub mod task;
pub mod workspace;

pub use ids::RunId;
pub use run::{Carrier, RunAction, RunEvent, RunMetadata, RunStatus, UnknownRunAction};
pub use task::{INITIAL_STATUS, RunPollingTask};
pub use workspace::{WorkspaceMetadata, workspace_key};
