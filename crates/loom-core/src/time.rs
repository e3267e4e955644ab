//! Timestamps at the precision the store keeps.
//!
//! Records are persisted as RFC 3339 with microseconds. Anything handed back
//! to a caller is built from these helpers so it compares equal to its
//! stored form.

use chrono::{DateTime, Duration, DurationRound, Utc};

/// Current time truncated to whole microseconds.
pub fn now() -> DateTime<Utc> {
    truncate_micros(Utc::now())
}

pub fn truncate_micros(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.duration_trunc(Duration::microseconds(1)).unwrap_or(ts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{SecondsFormat, TimeZone, Timelike};

    #[test]
    fn now_has_no_sub_microsecond_part() {
        assert_eq!(now().nanosecond() % 1_000, 0);
    }

    #[test]
    fn truncation_survives_rfc3339_micros() {
        let ts = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
            + Duration::nanoseconds(123_456_789);
        let truncated = truncate_micros(ts);
        assert_eq!(truncated.nanosecond(), 123_456_000);
        let encoded = truncated.to_rfc3339_opts(SecondsFormat::Micros, true);
        let decoded = DateTime::parse_from_rfc3339(&encoded).unwrap().with_timezone(&Utc);
        assert_eq!(decoded, truncated);
    }
}
