//! Timestamp helpers for the SQLite storage format.
//!
//! Timestamps are stored as RFC 3339 text columns; booleans are plain 0/1
//! integers handled inline at the row mappings.

use chrono::{DateTime, Utc};

/// Current time as an RFC 3339 string (the storage format for timestamps).
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

/// Parse an RFC 3339 timestamp column back into a `DateTime<Utc>`.
pub fn parse_rfc3339(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_round_trip() {
        let s = now_rfc3339();
        let parsed = parse_rfc3339(&s).unwrap();
        assert_eq!(parsed.to_rfc3339(), s);
    }

    #[test]
    fn garbage_timestamp_is_none() {
        assert!(parse_rfc3339("not a timestamp").is_none());
        assert!(parse_rfc3339("").is_none());
    }
}
