//! Contact-plan timestamps: absolute `yyyy/mm/dd-hh:mm:ss` or relative `+seconds`.
//! Relative times resolve against a reference passed by the caller, never the wall clock.

use time::format_description::FormatItem;
use time::macros::{datetime, format_description};
use time::{Duration, OffsetDateTime, PrimitiveDateTime};

use crate::error::{Error, Result};

const ABSOLUTE: &[FormatItem<'static>] =
    format_description!("[year]/[month]/[day]-[hour]:[minute]:[second]");

pub fn parse_timestamp(text: &str, reference: OffsetDateTime) -> Result<OffsetDateTime> {
    let text = text.trim();
    if let Some(offset) = text.strip_prefix('+') {
        let secs: i64 = offset
            .parse()
            .map_err(|_| Error::InvalidTimestamp(text.to_string()))?;
        return reference
            .checked_add(Duration::seconds(secs))
            .ok_or_else(|| Error::InvalidTimestamp(text.to_string()));
    }
    PrimitiveDateTime::parse(text, ABSOLUTE)
        .map(PrimitiveDateTime::assume_utc)
        .map_err(|_| Error::InvalidTimestamp(text.to_string()))
}

pub fn format_timestamp(t: OffsetDateTime) -> String {
    // Only fails for years outside 0..=9999, which the absolute format cannot express anyway.
    t.format(ABSOLUTE).unwrap_or_else(|_| t.to_string())
}

/// Milliseconds since the DTN epoch (2000-01-01T00:00:00Z).
pub fn dtn_time(instant: &OffsetDateTime) -> u64 {
    (*instant - datetime!(2000-01-01 00:00:00 UTC)).whole_milliseconds() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    const REF: OffsetDateTime = datetime!(2024-03-01 12:00:00 UTC);

    #[test]
    fn relative_uses_reference() {
        assert_eq!(parse_timestamp("+90", REF).unwrap(), datetime!(2024-03-01 12:01:30 UTC));
        assert_eq!(parse_timestamp("+0", REF).unwrap(), REF);
    }

    #[test]
    fn absolute_is_utc() {
        assert_eq!(
            parse_timestamp("2024/12/31-23:59:59", REF).unwrap(),
            datetime!(2024-12-31 23:59:59 UTC)
        );
    }

    #[test]
    fn rejects_garbage() {
        for bad in ["", "+", "+x", "2024-12-31 23:59:59", "2024/13/01-00:00:00", "tomorrow"] {
            assert!(
                matches!(parse_timestamp(bad, REF), Err(Error::InvalidTimestamp(_))),
                "accepted {bad:?}"
            );
        }
    }

    #[test]
    fn format_matches_parse() {
        let t = datetime!(2030-01-02 03:04:05 UTC);
        assert_eq!(format_timestamp(t), "2030/01/02-03:04:05");
    }

    #[test]
    fn dtn_epoch() {
        assert_eq!(dtn_time(&datetime!(2000-01-01 00:00:01 UTC)), 1000);
    }
}
