//! Run Relay - relays infrastructure run status changes to merge-request
//! comment threads.
//!
//! This library provides the run event channel, the polling task scheduler,
//! and the file-backed stream and bucket store they run on.

pub mod codec;
pub mod config;
pub mod forward;
pub mod poller;
pub mod relay;
pub mod retry;
pub mod server;
pub mod store;
pub mod tfc;
pub mod types;

#[cfg(test)]
pub mod test_utils;
