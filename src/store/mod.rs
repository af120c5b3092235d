//! File-backed durable streams and key-value buckets.
//!
//! Everything lives under one data directory:
//!
//! ```text
//! <data>/
//!   streams/<NAME>.log   one operation log per stream
//!   kv/<BUCKET>.log      one operation log per bucket
//! ```
//!
//! Both kinds of log are JSON Lines with monotonic sequence numbers, replayed
//! on open (see [`oplog`]). Streams give at-least-once delivery to durable pull
//! consumers; buckets give create-if-absent and revision-checked updates.

pub mod broker;
pub mod fsync;
pub mod kv;
pub mod oplog;
pub mod stream;
pub mod subject;

pub use broker::{ActiveGuard, Broker, DEFAULT_MAX_PENDING_PUBLISHES, PubAck};
pub use kv::{Entry, KvBucket, KvConfig, KvError};
pub use oplog::LogError;
pub use stream::{
    ConsumerConfig, Delivery, Headers, RetentionPolicy, SourceInfo, StartPosition, StoredMessage,
    StreamConfig, StreamError, StreamInfo, StreamSource, StreamState, UnknownRetention,
};
