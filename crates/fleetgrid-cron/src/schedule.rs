//! Five-field cron expressions evaluated in an IANA timezone.
//!
//! The `cron` crate wants a leading seconds field and numbers weekdays
//! 1–7 from Sunday. Expressions here use the usual
//! `minute hour day-of-month month day-of-week` layout with weekdays 0–7
//! (0 and 7 both Sunday), so the weekday field is rewritten into day names
//! and a `0` seconds field is prepended before handing it over.

use std::collections::BTreeSet;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;

use crate::error::{CronError, CronResult};

const DAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// A parsed expression bound to its timezone.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expression: String,
    schedule: Schedule,
    timezone: Tz,
}

impl CronSchedule {
    pub fn parse(expression: &str, timezone: &str) -> CronResult<Self> {
        let invalid = |reason: String| CronError::InvalidExpression {
            expression: expression.to_string(),
            reason,
        };

        let fields: Vec<&str> = expression.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(invalid(format!(
                "expected 5 fields (minute hour day month weekday), got {}",
                fields.len()
            )));
        }
        let weekday = translate_weekdays(fields[4]).map_err(invalid)?;
        let normalized = format!(
            "0 {} {} {} {} {}",
            fields[0], fields[1], fields[2], fields[3], weekday
        );
        let schedule = Schedule::from_str(&normalized).map_err(|e| invalid(e.to_string()))?;
        let timezone = Tz::from_str(timezone)
            .map_err(|_| CronError::InvalidTimezone(timezone.to_string()))?;

        Ok(Self {
            expression: expression.to_string(),
            schedule,
            timezone,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    /// First firing strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule
            .after(&after.with_timezone(&self.timezone))
            .map(|t| t.with_timezone(&Utc))
            .find(|t| *t > after)
    }

    /// [`next_after`](Self::next_after) on epoch seconds.
    pub fn next_after_epoch(&self, after: u64) -> Option<u64> {
        let after = DateTime::from_timestamp(i64::try_from(after).ok()?, 0)?;
        self.next_after(after)
            .and_then(|t| u64::try_from(t.timestamp()).ok())
    }

    /// The next `count` firings after `after`.
    pub fn upcoming(&self, after: DateTime<Utc>, count: usize) -> Vec<DateTime<Utc>> {
        let mut out = Vec::with_capacity(count);
        let mut cursor = after;
        while out.len() < count {
            let Some(next) = self.next_after(cursor) else {
                break;
            };
            out.push(next);
            cursor = next;
        }
        out
    }
}

/// Rewrite a 0–7 weekday field into a comma-separated list of day names.
fn translate_weekdays(field: &str) -> Result<String, String> {
    if field == "*" || field == "?" {
        return Ok(field.to_string());
    }
    let mut days = BTreeSet::new();
    for item in field.split(',') {
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => {
                let step: u8 = step
                    .parse()
                    .map_err(|_| format!("invalid weekday step {step:?}"))?;
                if step == 0 {
                    return Err("weekday step must be positive".to_string());
                }
                (range, step)
            }
            None => (item, 1),
        };
        let (start, end) = match range {
            "*" => (0, 6),
            _ => match range.split_once('-') {
                Some((a, b)) => (weekday(a)?, weekday(b)?),
                // `a/s` runs from `a` to the end of the week.
                None if item.contains('/') => (weekday(range)?, 6),
                None => {
                    let d = weekday(range)?;
                    (d, d)
                }
            },
        };
        if start > end {
            return Err(format!("weekday range {range:?} runs backwards"));
        }
        for d in (start..=end).step_by(step as usize) {
            days.insert(d % 7);
        }
    }
    if days.is_empty() {
        return Err(format!("weekday field {field:?} selects no days"));
    }
    Ok(days
        .into_iter()
        .map(|d| DAY_NAMES[d as usize])
        .collect::<Vec<_>>()
        .join(","))
}

/// Parse one weekday token: 0–7 or a three-letter name.
fn weekday(token: &str) -> Result<u8, String> {
    if let Ok(n) = token.parse::<u8>() {
        return if n <= 7 {
            Ok(n)
        } else {
            Err(format!("weekday {n} out of range 0-7"))
        };
    }
    DAY_NAMES
        .iter()
        .position(|name| name.eq_ignore_ascii_case(token))
        .map(|i| i as u8)
        .ok_or_else(|| format!("unknown weekday {token:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, TimeZone, Timelike, Weekday};

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn weekday_translation() {
        assert_eq!(translate_weekdays("*").unwrap(), "*");
        assert_eq!(translate_weekdays("0").unwrap(), "SUN");
        assert_eq!(translate_weekdays("7").unwrap(), "SUN");
        assert_eq!(translate_weekdays("1-5").unwrap(), "MON,TUE,WED,THU,FRI");
        assert_eq!(translate_weekdays("5-7").unwrap(), "SUN,FRI,SAT");
        assert_eq!(translate_weekdays("*/2").unwrap(), "SUN,TUE,THU,SAT");
        assert_eq!(translate_weekdays("mon,wed").unwrap(), "MON,WED");
        assert_eq!(translate_weekdays("1/3").unwrap(), "MON,THU");
        assert!(translate_weekdays("8").is_err());
        assert!(translate_weekdays("5-1").is_err());
        assert!(translate_weekdays("*/0").is_err());
        assert!(translate_weekdays("funday").is_err());
    }

    #[test]
    fn rejects_wrong_field_count() {
        for expr in ["* * * *", "0 0 4 * * *", ""] {
            assert!(
                matches!(
                    CronSchedule::parse(expr, "UTC"),
                    Err(CronError::InvalidExpression { .. })
                ),
                "{expr:?} should be rejected"
            );
        }
    }

    #[test]
    fn rejects_bad_fields_and_timezones() {
        assert!(matches!(
            CronSchedule::parse("61 * * * *", "UTC"),
            Err(CronError::InvalidExpression { .. })
        ));
        assert!(matches!(
            CronSchedule::parse("0 4 * * *", "Mars/Olympus"),
            Err(CronError::InvalidTimezone(_))
        ));
    }

    #[test]
    fn next_run_is_strictly_after() {
        let s = CronSchedule::parse("0 4 * * *", "UTC").unwrap();
        let at_four = utc(2026, 3, 10, 4, 0);
        assert_eq!(s.next_after(at_four), Some(utc(2026, 3, 11, 4, 0)));
        assert_eq!(s.next_after(utc(2026, 3, 10, 3, 59)), Some(at_four));

        let every = CronSchedule::parse("* * * * *", "UTC").unwrap();
        let now = utc(2026, 3, 10, 12, 30);
        assert_eq!(every.next_after(now), Some(utc(2026, 3, 10, 12, 31)));
    }

    #[test]
    fn evaluates_in_the_job_timezone() {
        // 04:00 in Berlin during winter time is 03:00 UTC.
        let s = CronSchedule::parse("0 4 * * *", "Europe/Berlin").unwrap();
        let next = s.next_after(utc(2026, 1, 15, 12, 0)).unwrap();
        assert_eq!(next, utc(2026, 1, 16, 3, 0));
        assert_eq!(s.timezone(), chrono_tz::Europe::Berlin);
    }

    #[test]
    fn sunday_as_zero_and_seven() {
        let zero = CronSchedule::parse("30 2 * * 0", "UTC").unwrap();
        let seven = CronSchedule::parse("30 2 * * 7", "UTC").unwrap();
        let from = utc(2026, 3, 10, 0, 0);
        let a = zero.next_after(from).unwrap();
        assert_eq!(a, seven.next_after(from).unwrap());
        assert_eq!(a.weekday(), Weekday::Sun);
        assert_eq!((a.hour(), a.minute()), (2, 30));
    }

    #[test]
    fn upcoming_lists_consecutive_runs() {
        let s = CronSchedule::parse("*/15 * * * *", "UTC").unwrap();
        let runs = s.upcoming(utc(2026, 3, 10, 12, 0), 3);
        assert_eq!(
            runs,
            vec![
                utc(2026, 3, 10, 12, 15),
                utc(2026, 3, 10, 12, 30),
                utc(2026, 3, 10, 12, 45)
            ]
        );
    }

    #[test]
    fn epoch_helpers() {
        let s = CronSchedule::parse("0 * * * *", "UTC").unwrap();
        let base = utc(2026, 3, 10, 12, 0).timestamp() as u64;
        assert_eq!(s.next_after_epoch(base), Some(base + 3600));
        assert_eq!(s.next_after_epoch(base + 1), Some(base + 3600));
    }
}
