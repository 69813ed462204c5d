//! Calendar-day arithmetic for the task completion cap.
//!
//! The cap counts completions inside the *clinic-local* calendar day, so the
//! UTC timestamps in the completion table are bucketed against day bounds
//! shifted by the configured clinic offset.

use chrono::{DateTime, Duration, FixedOffset, NaiveDateTime, NaiveTime, TimeZone, Utc};

use crate::util::env::{EnvErr, EnvResult, Var};
use crate::var;

/// Fixed clinic-local UTC offset, from `CLINIC_UTC_OFFSET_MINUTES`
pub async fn clinic_offset() -> EnvResult<FixedOffset> {
    let raw = var!(Var::ClinicUtcOffsetMinutes).await?;
    let minutes = raw.parse::<i32>().map_err(|e| {
        EnvErr::InvalidValue("CLINIC_UTC_OFFSET_MINUTES".into(), e.to_string())
    })?;

    FixedOffset::east_opt(minutes * 60).ok_or_else(|| {
        EnvErr::InvalidValue(
            "CLINIC_UTC_OFFSET_MINUTES".into(),
            format!("offset '{minutes}' minutes is out of range"),
        )
    })
}

/// UTC half-open interval `[start, end)` covering the clinic-local calendar
/// day that contains `now`
pub fn day_bounds(now: DateTime<Utc>, offset: FixedOffset) -> (DateTime<Utc>, DateTime<Utc>) {
    let shift = Duration::seconds(i64::from(offset.local_minus_utc()));
    let local_day = (now.naive_utc() + shift).date();

    let start_naive = NaiveDateTime::new(local_day, NaiveTime::MIN) - shift;
    let start = Utc.from_utc_datetime(&start_naive);

    (start, start + Duration::days(1))
}

#[cfg(test)]
mod test {
    use super::*;

    fn utc(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    #[test]
    fn test_day_bounds_utc() {
        let offset = FixedOffset::east_opt(0).unwrap();
        let (start, end) = day_bounds(utc("2025-06-10T15:30:00Z"), offset);

        assert_eq!(start, utc("2025-06-10T00:00:00Z"));
        assert_eq!(end, utc("2025-06-11T00:00:00Z"));
    }

    #[test]
    fn test_day_bounds_cross_date_line_east() {
        // 23:30 UTC is already 09:30 *tomorrow* at UTC+10
        let offset = FixedOffset::east_opt(10 * 3600).unwrap();
        let (start, end) = day_bounds(utc("2025-06-10T23:30:00Z"), offset);

        assert_eq!(start, utc("2025-06-10T14:00:00Z"));
        assert_eq!(end, utc("2025-06-11T14:00:00Z"));
    }

    #[test]
    fn test_day_bounds_negative_offset() {
        // 02:00 UTC is still 21:00 *yesterday* at UTC-5
        let offset = FixedOffset::east_opt(-5 * 3600).unwrap();
        let (start, end) = day_bounds(utc("2025-06-10T02:00:00Z"), offset);

        assert_eq!(start, utc("2025-06-09T05:00:00Z"));
        assert_eq!(end, utc("2025-06-10T05:00:00Z"));
    }

    #[test]
    fn test_bounds_are_half_open() {
        let offset = FixedOffset::east_opt(0).unwrap();
        let (start, end) = day_bounds(utc("2025-06-10T00:00:00Z"), offset);

        assert_eq!(start, utc("2025-06-10T00:00:00Z"));
        assert!(end > start);
        assert_eq!(end - start, Duration::days(1));
    }
}
