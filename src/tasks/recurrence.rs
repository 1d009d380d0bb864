//! When a finished task runs next.

use std::str::FromStr;

use chrono::{DateTime, Duration, FixedOffset, Utc};

use crate::error::RecurrenceError;
use crate::tasks::model::Recurrence;

/// Parse a cron expression.
///
/// Accepts the classic five-field form (`min hour dom month dow`) by pinning
/// seconds to `0`; six- and seven-field forms are passed through.
pub fn parse_schedule(expr: &str) -> Result<cron::Schedule, RecurrenceError> {
    let trimmed = expr.trim();
    let normalized = if trimmed.split_whitespace().count() == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    };
    cron::Schedule::from_str(&normalized).map_err(|e| RecurrenceError::InvalidCron {
        expr: expr.to_string(),
        reason: e.to_string(),
    })
}

/// Parse the optional time zone of a cron rule into a fixed offset.
///
/// `None`, `UTC` and `Z` mean UTC; otherwise `+HH:MM`, `-HH:MM`, `+HHMM` or `+HH`.
pub fn parse_offset(tz: Option<&str>) -> Result<FixedOffset, RecurrenceError> {
    let utc = FixedOffset::east_opt(0).ok_or_else(|| RecurrenceError::InvalidTimeZone("UTC".into()))?;
    let Some(raw) = tz.map(str::trim) else {
        return Ok(utc);
    };
    if raw.is_empty() || raw.eq_ignore_ascii_case("utc") || raw.eq_ignore_ascii_case("z") {
        return Ok(utc);
    }

    let invalid = || RecurrenceError::InvalidTimeZone(raw.to_string());
    let (sign, rest) = match raw.as_bytes().first() {
        Some(b'+') => (1, &raw[1..]),
        Some(b'-') => (-1, &raw[1..]),
        _ => return Err(invalid()),
    };
    let digits: String = rest.chars().filter(|c| *c != ':').collect();
    if !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid());
    }
    let (hours, minutes): (i32, i32) = match digits.len() {
        2 => (digits.parse().map_err(|_| invalid())?, 0),
        4 => (
            digits[..2].parse().map_err(|_| invalid())?,
            digits[2..].parse().map_err(|_| invalid())?,
        ),
        _ => return Err(invalid()),
    };
    if hours > 14 || minutes > 59 {
        return Err(invalid());
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60)).ok_or_else(invalid)
}

/// Convert an `every` interval, rejecting zero and values chrono cannot hold.
pub fn interval(interval_ms: u64) -> Result<Duration, RecurrenceError> {
    if interval_ms == 0 {
        return Err(RecurrenceError::ZeroInterval);
    }
    i64::try_from(interval_ms)
        .ok()
        .and_then(Duration::try_milliseconds)
        .ok_or(RecurrenceError::IntervalOverflow { interval_ms })
}

/// Next eligible run for a finished task, or `None` when it should not recur.
pub fn next_run_after(
    recurrence: &Recurrence,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, RecurrenceError> {
    match recurrence {
        Recurrence::Once => Ok(None),
        Recurrence::Every { interval_ms } => {
            let step = interval(*interval_ms)?;
            now.checked_add_signed(step)
                .map(Some)
                .ok_or(RecurrenceError::IntervalOverflow {
                    interval_ms: *interval_ms,
                })
        }
        Recurrence::Cron { expr, tz } => {
            let schedule = parse_schedule(expr)?;
            let offset = parse_offset(tz.as_deref())?;
            let local_now = now.with_timezone(&offset);
            Ok(schedule
                .after(&local_now)
                .next()
                .map(|dt| dt.with_timezone(&Utc)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};

    #[test]
    fn once_never_recurs() {
        assert_eq!(next_run_after(&Recurrence::Once, Utc::now()).unwrap(), None);
    }

    #[test]
    fn every_adds_interval() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let next = next_run_after(&Recurrence::Every { interval_ms: 90_000 }, now)
            .unwrap()
            .unwrap();
        assert_eq!(next - now, Duration::seconds(90));
    }

    #[test]
    fn every_zero_is_rejected() {
        let result = next_run_after(&Recurrence::Every { interval_ms: 0 }, Utc::now());
        assert!(matches!(result, Err(RecurrenceError::ZeroInterval)));
    }

    #[test]
    fn every_overflow_is_an_error_not_exhaustion() {
        let huge = Recurrence::Every { interval_ms: u64::MAX };
        assert!(matches!(
            next_run_after(&huge, Utc::now()),
            Err(RecurrenceError::IntervalOverflow { .. })
        ));
        assert!(huge.validate().is_err());

        // Representable, but past the end of chrono's calendar.
        let far = Recurrence::Every { interval_ms: i64::MAX as u64 };
        assert!(matches!(
            next_run_after(&far, Utc::now()),
            Err(RecurrenceError::IntervalOverflow { .. })
        ));
    }

    #[test]
    fn five_field_cron_is_accepted() {
        assert!(parse_schedule("30 9 * * *").is_ok());
        assert!(parse_schedule("0 30 9 * * *").is_ok());
        assert!(parse_schedule("every tuesday").is_err());
    }

    #[test]
    fn cron_next_fire_in_utc() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 8, 15, 0).unwrap();
        let rule = Recurrence::Cron {
            expr: "0 9 * * *".into(),
            tz: None,
        };
        let next = next_run_after(&rule, now).unwrap().unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap());
    }

    #[test]
    fn cron_respects_fixed_offset() {
        // 09:00 at +02:00 is 07:00 UTC.
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 6, 0, 0).unwrap();
        let rule = Recurrence::Cron {
            expr: "0 9 * * *".into(),
            tz: Some("+02:00".into()),
        };
        let next = next_run_after(&rule, now).unwrap().unwrap();
        assert_eq!(next.hour(), 7);
        assert_eq!(next.minute(), 0);
    }

    #[test]
    fn offsets_parse() {
        assert_eq!(parse_offset(None).unwrap().local_minus_utc(), 0);
        assert_eq!(parse_offset(Some("UTC")).unwrap().local_minus_utc(), 0);
        assert_eq!(parse_offset(Some("+05:30")).unwrap().local_minus_utc(), 19_800);
        assert_eq!(parse_offset(Some("-0800")).unwrap().local_minus_utc(), -28_800);
        assert_eq!(parse_offset(Some("+03")).unwrap().local_minus_utc(), 10_800);
        assert!(parse_offset(Some("Europe/Paris")).is_err());
        assert!(parse_offset(Some("+25:00")).is_err());
        assert!(parse_offset(Some("+5")).is_err());
    }
}
