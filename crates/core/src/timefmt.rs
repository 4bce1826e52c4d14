//! Timestamp parsing and human age rendering.

use chrono::{DateTime, NaiveDateTime, Utc};

/// Parse the fixed-format UTC timestamp the API emits
/// (`YYYY-MM-DDTHH:MM:SSZ`).
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%SZ")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Render the age of a timestamp relative to `now` in the two most
/// significant units, e.g. "3d7h" or "42s".
pub fn age_between(ts: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let secs = (now - ts).num_seconds().max(0);
    let (min, hour, day) = (secs / 60, secs / 3600, secs / 86_400);
    if day >= 365 {
        format!("{}y{}m", day / 365, (day % 365) / 30)
    } else if day >= 30 {
        format!("{}m{}d", day / 30, day % 30)
    } else if day > 0 {
        format!("{}d{}h", day, hour % 24)
    } else if hour > 0 {
        format!("{}h{}m", hour, min % 60)
    } else if min > 0 {
        format!("{}m{}s", min, secs % 60)
    } else {
        format!("{}s", secs)
    }
}

/// Age of a raw `metadata.creationTimestamp` string, or "" when absent or
/// unparseable.
pub fn age_of(ts: &str) -> String {
    parse_timestamp(ts)
        .map(|t| age_between(t, Utc::now()))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_api_timestamps() {
        let t = parse_timestamp("2024-06-01T12:30:45Z").unwrap();
        assert_eq!(t.timestamp(), 1_717_245_045);
    }

    #[test]
    fn rejects_other_formats() {
        assert!(parse_timestamp("2024-06-01 12:30:45").is_none());
        assert!(parse_timestamp("").is_none());
        assert!(parse_timestamp("yesterday").is_none());
    }

    #[test]
    fn age_buckets() {
        let now = parse_timestamp("2024-06-01T00:00:00Z").unwrap();
        let cases = [
            ("2024-05-31T23:59:18Z", "42s"),
            ("2024-05-31T23:54:10Z", "5m50s"),
            ("2024-05-31T20:30:00Z", "3h30m"),
            ("2024-05-28T12:00:00Z", "3d12h"),
            ("2024-03-01T00:00:00Z", "3m2d"),
            ("2022-05-30T00:00:00Z", "2y0m"),
        ];
        for (ts, expect) in cases {
            let t = parse_timestamp(ts).unwrap();
            assert_eq!(age_between(t, now), expect, "for {ts}");
        }
    }

    #[test]
    fn future_timestamps_clamp_to_zero() {
        let now = parse_timestamp("2024-06-01T00:00:00Z").unwrap();
        let later = parse_timestamp("2024-06-02T00:00:00Z").unwrap();
        assert_eq!(age_between(later, now), "0s");
    }
}
