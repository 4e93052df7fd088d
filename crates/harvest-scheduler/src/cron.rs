//! Lightweight cron expression parser.
//! Supports: "MIN HOUR DOM MON DOW" (5-field, no seconds, UTC)
//! Per field: `*`, `*/N`, `N`, `A-B`, `A-B/N` and comma-separated lists.
//! Example: "*/15 * * * *" = every quarter hour

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Timelike, Utc};
use harvest_core::error::{HarvestError, Result};

/// Parsed 5-field schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
    minutes: Vec<u32>,
    hours: Vec<u32>,
    days: Vec<u32>,
    months: Vec<u32>,
    weekdays: Vec<u32>,
    days_restricted: bool,
    weekdays_restricted: bool,
}

impl Schedule {
    pub fn parse(expression: &str) -> Result<Self> {
        let parts: Vec<&str> = expression.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(invalid(expression, "need 5 fields: MIN HOUR DOM MON DOW"));
        }
        let field = |i: usize, min: u32, max: u32| {
            parse_field(parts[i], min, max).ok_or_else(|| invalid(expression, &format!("bad field '{}'", parts[i])))
        };
        let mut weekdays = field(4, 0, 7)?;
        // 7 is Sunday too
        for d in weekdays.iter_mut() {
            if *d == 7 {
                *d = 0;
            }
        }
        Ok(Self {
            minutes: field(0, 0, 59)?,
            hours: field(1, 0, 23)?,
            days: field(2, 1, 31)?,
            months: field(3, 1, 12)?,
            weekdays,
            days_restricted: parts[2] != "*",
            weekdays_restricted: parts[4] != "*",
        })
    }

    /// First matching minute strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut t = after.with_second(0)?.with_nanosecond(0)? + Duration::minutes(1);
        // Four years of day skips covers any valid day/month combination.
        for _ in 0..(4 * 366 * 24 * 2) {
            if !self.months.contains(&t.month()) {
                t = start_of_next_month(t)?;
                continue;
            }
            if !self.day_matches(t) {
                t = start_of_day(t)? + Duration::days(1);
                continue;
            }
            if !self.hours.contains(&t.hour()) {
                t = t.with_minute(0)? + Duration::hours(1);
                continue;
            }
            if !self.minutes.contains(&t.minute()) {
                t += Duration::minutes(1);
                continue;
            }
            return Some(t);
        }
        None
    }

    fn day_matches(&self, t: DateTime<Utc>) -> bool {
        let dom = self.days.contains(&t.day());
        let dow = self.weekdays.contains(&t.weekday().num_days_from_sunday());
        match (self.days_restricted, self.weekdays_restricted) {
            // Classic cron: either restricted field may match.
            (true, true) => dom || dow,
            (true, false) => dom,
            (false, true) => dow,
            (false, false) => true,
        }
    }
}

/// Next fire time of `expression` strictly after `after`.
pub fn next_after(expression: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
    Schedule::parse(expression)?
        .next_after(after)
        .ok_or_else(|| invalid(expression, "never fires"))
}

fn invalid(expression: &str, why: &str) -> HarvestError {
    HarvestError::Config(format!("Invalid cron expression '{expression}': {why}"))
}

fn start_of_day(t: DateTime<Utc>) -> Option<DateTime<Utc>> {
    t.with_hour(0)?.with_minute(0)
}

fn start_of_next_month(t: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let (year, month) = if t.month() == 12 { (t.year() + 1, 1) } else { (t.year(), t.month() + 1) };
    let date = NaiveDate::from_ymd_opt(year, month, 1)?;
    Some(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?))
}

/// Parse a cron field into its sorted matching values.
fn parse_field(field: &str, min: u32, max: u32) -> Option<Vec<u32>> {
    let mut values = Vec::new();
    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => (range, step.parse::<u32>().ok().filter(|n| *n > 0)?),
            None => (part, 1),
        };
        let (lo, hi) = if range == "*" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            (a.trim().parse().ok()?, b.trim().parse().ok()?)
        } else {
            let n: u32 = range.trim().parse().ok()?;
            // "N/step" runs from N to the end of the range
            if part.contains('/') { (n, max) } else { (n, n) }
        };
        if lo < min || hi > max || lo > hi {
            return None;
        }
        values.extend((lo..=hi).step_by(step as usize));
    }
    values.sort_unstable();
    values.dedup();
    Some(values)
}
