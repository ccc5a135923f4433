//! Lightweight cron expression evaluator.
//! Supports: "MIN HOUR DOM MON DOW" (5-field, no seconds)
//! Field syntax: *, */N, N, A-B, A-B/N and comma lists of those.
//! Example: "5 0 * * *" = every day at 00:05 local time
//!
//! Expressions are matched against wall-clock time in a fixed UTC offset.

use chrono::{DateTime, Datelike, Duration, FixedOffset, Timelike, Utc};

/// Parsed 5-field expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    minutes: Vec<u32>,
    hours: Vec<u32>,
    days_of_month: Vec<u32>,
    months: Vec<u32>,
    days_of_week: Vec<u32>,
    dom_any: bool,
    dow_any: bool,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Option<Self> {
        let parts: Vec<&str> = expression.split_whitespace().collect();
        if parts.len() != 5 {
            tracing::warn!(
                "Invalid cron expression: '{}' (need 5 fields: MIN HOUR DOM MON DOW)",
                expression
            );
            return None;
        }
        Some(Self {
            minutes: parse_field(parts[0], 0, 59)?,
            hours: parse_field(parts[1], 0, 23)?,
            days_of_month: parse_field(parts[2], 1, 31)?,
            months: parse_field(parts[3], 1, 12)?,
            // 7 is accepted as Sunday.
            days_of_week: parse_field(parts[4], 0, 7)?
                .into_iter()
                .map(|d| d % 7)
                .collect(),
            dom_any: parts[2] == "*",
            dow_any: parts[4] == "*",
        })
    }

    fn matches(&self, local: &DateTime<FixedOffset>) -> bool {
        if !self.minutes.contains(&local.minute())
            || !self.hours.contains(&local.hour())
            || !self.months.contains(&local.month())
        {
            return false;
        }
        let dom = self.days_of_month.contains(&local.day());
        let dow = self
            .days_of_week
            .contains(&local.weekday().num_days_from_sunday());
        // Classic cron: when both day fields are restricted, either may match.
        match (self.dom_any, self.dow_any) {
            (true, true) => true,
            (true, false) => dow,
            (false, true) => dom,
            (false, false) => dom || dow,
        }
    }

    /// First matching minute strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>, offset: FixedOffset) -> Option<DateTime<Utc>> {
        let mut candidate = after.with_timezone(&offset) + Duration::minutes(1);
        candidate = candidate
            .with_second(0)
            .and_then(|c| c.with_nanosecond(0))
            .unwrap_or(candidate);

        // Leap-day schedules need up to four years of lookahead.
        let horizon = 366 * 4 * 24 * 60;
        for _ in 0..horizon {
            if self.matches(&candidate) {
                return Some(candidate.with_timezone(&Utc));
            }
            // Skip whole hours/days that cannot match.
            if !self.hours.contains(&candidate.hour()) {
                candidate = candidate + Duration::minutes(i64::from(60 - candidate.minute()));
                continue;
            }
            candidate += Duration::minutes(1);
        }
        None
    }
}

/// Parse a cron expression and compute the next run time after `after`,
/// evaluated in wall-clock time at `offset`.
pub fn next_run_from_cron(
    expression: &str,
    after: DateTime<Utc>,
    offset: FixedOffset,
) -> Option<DateTime<Utc>> {
    CronSchedule::parse(expression)?.next_after(after, offset)
}

pub fn is_valid(expression: &str) -> bool {
    CronSchedule::parse(expression).is_some()
}

/// Parse a cron field into a sorted list of matching values.
fn parse_field(field: &str, min: u32, max: u32) -> Option<Vec<u32>> {
    let mut values = Vec::new();
    for item in field.split(',') {
        values.extend(parse_item(item.trim(), min, max)?);
    }
    values.sort_unstable();
    values.dedup();
    if values.is_empty() { None } else { Some(values) }
}

fn parse_item(item: &str, min: u32, max: u32) -> Option<Vec<u32>> {
    let (range, step) = match item.split_once('/') {
        Some((range, step)) => {
            let n: u32 = step.parse().ok()?;
            if n == 0 {
                return None;
            }
            (range, n)
        }
        None => (item, 1),
    };

    let (lo, hi) = if range == "*" {
        (min, max)
    } else if let Some((a, b)) = range.split_once('-') {
        (a.parse().ok()?, b.parse().ok()?)
    } else {
        let n: u32 = range.parse().ok()?;
        // "N/S" means from N to max every S.
        if step > 1 { (n, max) } else { (n, n) }
    };

    if lo < min || hi > max || lo > hi {
        return None;
    }
    Some((lo..=hi).step_by(step as usize).collect())
}
