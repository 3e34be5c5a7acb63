//! Quota window keys and boundaries.
//!
//! Window keys are pure functions of wall-clock time, so independent server
//! instances agree on which window an event belongs to without any
//! coordination; correctness relies only on roughly synchronized clocks.

use chrono::{DateTime, Datelike, Months, NaiveDate, TimeZone, Utc};
use uuid::Uuid;

/// Window granularity for a quota counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    Minute,
    Day,
    Month,
}

impl Granularity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Minute => "minute",
            Granularity::Day => "day",
            Granularity::Month => "month",
        }
    }
}

/// Per-minute counter key, scoped to one endpoint.
pub fn minute_key(org_id: Uuid, endpoint: &str, now: DateTime<Utc>) -> String {
    format!(
        "quota:{}:{}:minute:{}",
        org_id.simple(),
        endpoint,
        now.format("%Y%m%d%H%M")
    )
}

/// Per-day counter key, org-global.
pub fn day_key(org_id: Uuid, now: DateTime<Utc>) -> String {
    format!("quota:{}:day:{}", org_id.simple(), now.format("%Y%m%d"))
}

/// Per-month counter key, org-global.
pub fn month_key(org_id: Uuid, now: DateTime<Utc>) -> String {
    format!("quota:{}:month:{}", org_id.simple(), now.format("%Y%m"))
}

/// Per-month counter key for video generations.
pub fn video_month_key(org_id: Uuid, now: DateTime<Utc>) -> String {
    format!("quota:{}:video:{}", org_id.simple(), now.format("%Y%m"))
}

/// TTL for a counter created in the window containing `now`. The TTL is the
/// window length, which bounds counter-store memory; enforcement correctness
/// comes from the time-derived keys, not from exact expiry.
pub fn window_ttl_secs(granularity: Granularity, now: DateTime<Utc>) -> i64 {
    match granularity {
        Granularity::Minute => 60,
        Granularity::Day => 86_400,
        Granularity::Month => i64::from(days_in_month(now)) * 86_400,
    }
}

/// Instant at which the window containing `now` resets. Reported to callers
/// so the API layer can set a meaningful Retry-After.
pub fn reset_at(granularity: Granularity, now: DateTime<Utc>) -> DateTime<Utc> {
    match granularity {
        Granularity::Minute => {
            let ts = (now.timestamp().div_euclid(60) + 1) * 60;
            DateTime::from_timestamp(ts, 0).expect("minute boundary is a valid timestamp")
        }
        Granularity::Day => {
            let ts = (now.timestamp().div_euclid(86_400) + 1) * 86_400;
            DateTime::from_timestamp(ts, 0).expect("day boundary is a valid timestamp")
        }
        Granularity::Month => {
            let first = NaiveDate::from_ymd_opt(now.year(), now.month(), 1)
                .expect("first of month is a valid date")
                .checked_add_months(Months::new(1))
                .expect("next month is a valid date");
            Utc.from_utc_datetime(
                &first
                    .and_hms_opt(0, 0, 0)
                    .expect("midnight is a valid time"),
            )
        }
    }
}

fn days_in_month(now: DateTime<Utc>) -> u32 {
    let first = NaiveDate::from_ymd_opt(now.year(), now.month(), 1)
        .expect("first of month is a valid date");
    let next = first
        .checked_add_months(Months::new(1))
        .expect("next month is a valid date");
    next.signed_duration_since(first).num_days() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn keys_are_deterministic_within_a_window() {
        let org = Uuid::new_v4();
        let a = at(2025, 3, 14, 9, 26, 5);
        let b = at(2025, 3, 14, 9, 26, 59);
        assert_eq!(minute_key(org, "chat", a), minute_key(org, "chat", b));
        assert_eq!(day_key(org, a), day_key(org, b));
        assert_eq!(month_key(org, a), month_key(org, b));
    }

    #[test]
    fn keys_change_across_window_boundaries() {
        let org = Uuid::new_v4();
        let a = at(2025, 3, 14, 9, 26, 59);
        let b = at(2025, 3, 14, 9, 27, 0);
        assert_ne!(minute_key(org, "chat", a), minute_key(org, "chat", b));
        assert_eq!(day_key(org, a), day_key(org, b));
    }

    #[test]
    fn minute_keys_are_endpoint_scoped() {
        let org = Uuid::new_v4();
        let now = at(2025, 3, 14, 9, 26, 5);
        assert_ne!(
            minute_key(org, "chat", now),
            minute_key(org, "video/generate", now)
        );
    }

    #[test]
    fn reset_lands_on_the_next_boundary() {
        let now = at(2025, 3, 14, 9, 26, 5);
        assert_eq!(reset_at(Granularity::Minute, now), at(2025, 3, 14, 9, 27, 0));
        assert_eq!(reset_at(Granularity::Day, now), at(2025, 3, 15, 0, 0, 0));
        assert_eq!(reset_at(Granularity::Month, now), at(2025, 4, 1, 0, 0, 0));
    }

    #[test]
    fn month_ttl_tracks_month_length() {
        assert_eq!(
            window_ttl_secs(Granularity::Month, at(2025, 2, 10, 0, 0, 0)),
            28 * 86_400
        );
        assert_eq!(
            window_ttl_secs(Granularity::Month, at(2024, 2, 10, 0, 0, 0)),
            29 * 86_400
        );
        assert_eq!(
            window_ttl_secs(Granularity::Month, at(2025, 1, 10, 0, 0, 0)),
            31 * 86_400
        );
    }
}
