//! Expiry checks for stored link entries.

use crate::schema::parse_timestamp;
use chrono::{DateTime, Utc};
use serde_json::Value;

/// Field holding an entry's expiry timestamp.
pub const EXPIRY_FIELD: &str = "expiry";

/// The expiry of `entry`, if it has one that parses. Strings use the same
/// timestamp forms as DATE columns; numbers are milliseconds since the epoch.
pub fn expires_at(entry: &Value) -> Option<DateTime<Utc>> {
    match entry.get(EXPIRY_FIELD)? {
        Value::String(s) => parse_timestamp(s),
        Value::Number(n) => n.as_i64().and_then(DateTime::<Utc>::from_timestamp_millis),
        _ => None,
    }
}

/// True when `entry` carries an expiry strictly before `now`. Entries without
/// a usable expiry never expire.
pub fn is_expired(entry: &Value, now: DateTime<Utc>) -> bool {
    expires_at(entry).is_some_and(|at| now > at)
}
