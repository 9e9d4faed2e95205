//! Conversions between oplog timestamps, wall clock time and the `--oplog-limit` syntax.
use crate::error::{RestoreError, Result};
use chrono::{DateTime, Local, TimeZone};
use mongodb::bson::Timestamp;

/// wall clock time of `ts`, for logs.
pub fn to_datetime(ts: &Timestamp) -> Option<DateTime<Local>> {
    Local.timestamp_opt(ts.time as i64, 0).single()
}

/// Parse `<seconds>[:<ordinal>]` into a timestamp.
pub fn parse_timestamp(value: &str) -> Result<Timestamp> {
    let invalid = || RestoreError::ConfigError(format!("invalid timestamp {:?}, expected <seconds>[:<ordinal>]", value));
    let (time, increment) = match value.split_once(':') {
        Some((time, increment)) => (time, increment),
        None => (value, "0"),
    };
    Ok(Timestamp {
        time: time.trim().parse().map_err(|_| invalid())?,
        increment: increment.trim().parse().map_err(|_| invalid())?,
    })
}

/// Order timestamps by time, then by increment.
pub fn ts_key(ts: &Timestamp) -> (u32, u32) {
    (ts.time, ts.increment)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_timestamp() {
        assert_eq!(
            parse_timestamp("100:3").unwrap(),
            Timestamp {
                time: 100,
                increment: 3
            }
        );
        assert_eq!(
            parse_timestamp("100").unwrap(),
            Timestamp {
                time: 100,
                increment: 0
            }
        );
        assert!(parse_timestamp("abc").is_err());
        assert!(parse_timestamp("1:x").is_err());
        assert!(parse_timestamp("-1").is_err());
    }

    #[test]
    fn test_ts_key_ordering() {
        let a = Timestamp { time: 1, increment: 9 };
        let b = Timestamp { time: 2, increment: 0 };
        assert!(ts_key(&a) < ts_key(&b));
    }
}
