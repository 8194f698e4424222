pub mod auth;
pub mod cloud;
pub mod config;
pub mod gateway;
pub mod store;
pub mod types;

use chrono::{TimeZone, Utc};

/// Prefix for all keys stored in the persistent store (etcd).
pub const KEY_PREFIX: &str = "/labpool.io/v0";

/// Current unix timestamp, in seconds.
pub fn now_ts() -> i64 {
    Utc::now().timestamp()
}

/// Current ISO 8601 timestamp.
pub fn iso_now() -> String {
    Utc::now().to_rfc3339()
}

/// ISO 8601 rendering of a unix timestamp.
pub fn iso_ts(ts: i64) -> String {
    Utc.timestamp(ts, 0).to_rfc3339()
}
