//! Process configuration read from `RUN_RELAY_*` environment variables.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::relay::SchedulerConfig;
use crate::store::RetentionPolicy;

const DEFAULT_DATA_DIR: &str = "./data";
const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8080";
const DEFAULT_TFC_URL: &str = "https://app.terraform.io";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var}={value:?} is not valid: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Everything the `run-relay` binary needs to start.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Root of the stream and bucket store.
    pub data_dir: PathBuf,
    pub listen_addr: SocketAddr,
    /// HMAC key for run notifications; unsigned notifications are accepted
    /// when unset.
    pub notification_token: Option<String>,
    pub tfc_url: String,
    /// Without a token neither the polling worker nor the dispatcher runs.
    pub tfc_token: Option<String>,
    /// Where run events are POSTed. Requires `events_queue`.
    pub events_url: Option<String>,
    /// Run event queue the forwarder joins.
    pub events_queue: Option<String>,
    /// HMAC key the forwarder signs event bodies with.
    pub events_token: Option<String>,
    pub scheduler: SchedulerConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayConfig {
    pub fn new() -> Self {
        RelayConfig {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            notification_token: None,
            tfc_url: DEFAULT_TFC_URL.to_string(),
            tfc_token: None,
            events_url: None,
            events_queue: None,
            events_token: None,
            scheduler: SchedulerConfig::new(),
        }
    }

    /// Reads the process environment. Unset variables keep their defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Like [`RelayConfig::from_env`], reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());
        let mut config = Self::new();

        if let Some(dir) = get("RUN_RELAY_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        let addr = get("RUN_RELAY_LISTEN_ADDR").unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string());
        config.listen_addr = parse("RUN_RELAY_LISTEN_ADDR", &addr)?;
        config.notification_token = get("RUN_RELAY_NOTIFICATION_TOKEN");
        if let Some(url) = get("RUN_RELAY_TFC_URL") {
            config.tfc_url = url;
        }
        config.tfc_token = get("RUN_RELAY_TFC_TOKEN");
        config.events_url = get("RUN_RELAY_EVENTS_URL");
        config.events_queue = get("RUN_RELAY_EVENTS_QUEUE");
        config.events_token = get("RUN_RELAY_EVENTS_TOKEN");
        if config.events_url.is_some() && config.events_queue.is_none() {
            return Err(ConfigError::Invalid {
                var: "RUN_RELAY_EVENTS_QUEUE",
                value: String::new(),
                reason: "required when RUN_RELAY_EVENTS_URL is set".to_string(),
            });
        }

        let mut scheduler = config.scheduler;
        if let Some(v) = get("RUN_RELAY_POLL_DELAY_SECS") {
            let secs: u64 = parse("RUN_RELAY_POLL_DELAY_SECS", &v)?;
            scheduler = scheduler.with_default_poll_delay(Duration::from_secs(secs));
        }
        if let Some(v) = get("RUN_RELAY_DISPATCH_INTERVAL_MS") {
            let ms: u64 = parse("RUN_RELAY_DISPATCH_INTERVAL_MS", &v)?;
            scheduler = scheduler.with_dispatch_interval(Duration::from_millis(ms.max(1)));
        }
        if let Some(v) = get("RUN_RELAY_METADATA_TTL_HOURS") {
            let hours: u64 = parse("RUN_RELAY_METADATA_TTL_HOURS", &v)?;
            scheduler = scheduler.with_metadata_ttl(Duration::from_secs(hours.saturating_mul(3600)));
        }
        if let Some(v) = get("RUN_RELAY_EVENTS_RETENTION") {
            let retention: RetentionPolicy = parse("RUN_RELAY_EVENTS_RETENTION", &v)?;
            scheduler = scheduler.with_events_retention(retention);
        }
        config.scheduler = scheduler;

        Ok(config)
    }
}

fn parse<T>(var: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason: e.to_string(),
    })
}
