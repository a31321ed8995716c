//! Timestamp encoding shared by the SQLite stores.
//!
//! Timestamps are written as fixed-width RFC 3339 with microseconds and a `Z`
//! suffix, so lexical order in SQL equals chronological order.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};

pub fn encode(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn decode(s: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            // SQLite's datetime('now') has no timezone; treat it as UTC.
            NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").map(|ndt| ndt.and_utc())
        })
}

/// Current time truncated to the stored precision, so a value survives a
/// store round trip unchanged.
pub fn now() -> DateTime<Utc> {
    let now = Utc::now();
    decode(&encode(now)).unwrap_or(now)
}
