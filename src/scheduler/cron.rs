//! Cron evaluation in a task's own timezone.
//!
//! Accepts standard 5-field expressions (minute hour day-of-month month
//! day-of-week) and 6-field expressions with a leading seconds field. The
//! `cron` crate does the calendar walk; this module normalises the
//! day-of-week field (0-7, Sunday = 0 or 7) to its 1-7 numbering and applies
//! the classic OR rule when both day fields are restricted.

use std::collections::BTreeSet;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule as CronSchedule;

use super::{TaskError, TaskResult};

/// A parsed schedule bound to an IANA timezone.
#[derive(Debug, Clone)]
pub struct CronSpec {
    expression: String,
    timezone: Tz,
    // One schedule, or two when day-of-month and day-of-week are OR-ed.
    schedules: Vec<CronSchedule>,
}

impl CronSpec {
    pub fn parse(expression: &str, timezone: &str) -> TaskResult<Self> {
        let tz = parse_timezone(timezone)?;
        let invalid = |reason: String| TaskError::InvalidCron {
            expr: expression.to_string(),
            reason,
        };

        let fields: Vec<&str> = expression.split_whitespace().collect();
        let (sec, rest) = match fields.len() {
            5 => ("0", &fields[..]),
            6 => (fields[0], &fields[1..]),
            n => return Err(invalid(format!("expected 5 or 6 fields, found {}", n))),
        };
        let (min, hour, dom, month, dow) = (rest[0], rest[1], rest[2], rest[3], rest[4]);

        let dom = if dom == "?" { "*" } else { dom };
        let dow_norm = normalize_day_of_week(dow).map_err(invalid)?;

        let dom_restricted = !dom.starts_with('*');
        let dow_restricted = !dow.starts_with('*') && !dow.starts_with('?');

        let exprs = if dom_restricted && dow_restricted {
            vec![
                format!("{} {} {} {} {} *", sec, min, hour, dom, month),
                format!("{} {} {} * {} {}", sec, min, hour, month, dow_norm),
            ]
        } else {
            vec![format!("{} {} {} {} {} {}", sec, min, hour, dom, month, dow_norm)]
        };

        let schedules = exprs
            .iter()
            .map(|e| CronSchedule::from_str(e).map_err(|err| invalid(err.to_string())))
            .collect::<TaskResult<Vec<_>>>()?;

        Ok(Self {
            expression: expression.to_string(),
            timezone: tz,
            schedules,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// First firing strictly after `after`, or `None` if the expression never fires again.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let local = after.with_timezone(&self.timezone);
        self.schedules
            .iter()
            .filter_map(|s| s.after(&local).next())
            .map(|dt| dt.with_timezone(&Utc))
            .min()
    }

    /// Up to `count` successive firings after `after`.
    pub fn upcoming(&self, after: DateTime<Utc>, count: usize) -> Vec<DateTime<Utc>> {
        let mut out = Vec::with_capacity(count);
        let mut cursor = after;
        while out.len() < count {
            match self.next_after(cursor) {
                Some(next) => {
                    out.push(next);
                    cursor = next;
                }
                None => break,
            }
        }
        out
    }
}

pub fn parse_timezone(timezone: &str) -> TaskResult<Tz> {
    timezone
        .parse::<Tz>()
        .map_err(|_| TaskError::InvalidTimezone(timezone.to_string()))
}

/// Reject a malformed expression or timezone before it is stored.
pub fn validate_schedule(expression: &str, timezone: &str) -> TaskResult<()> {
    CronSpec::parse(expression, timezone).map(|_| ())
}

/// Next firing of `expression` in `timezone` strictly after now.
pub fn next_run_time(expression: &str, timezone: &str) -> TaskResult<Option<DateTime<Utc>>> {
    next_run_after(expression, timezone, Utc::now())
}

pub fn next_run_after(
    expression: &str,
    timezone: &str,
    after: DateTime<Utc>,
) -> TaskResult<Option<DateTime<Utc>>> {
    Ok(CronSpec::parse(expression, timezone)?.next_after(after))
}

/// Rewrite a standard day-of-week field (0-7 or SUN-SAT) as an explicit
/// 1-7 list (Sunday = 1).
fn normalize_day_of_week(field: &str) -> Result<String, String> {
    if field == "*" || field == "?" {
        return Ok("*".to_string());
    }

    let mut days = BTreeSet::new();
    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((r, s)) => {
                let step: u32 = s
                    .parse()
                    .map_err(|_| format!("invalid day-of-week step '{}'", s))?;
                if step == 0 {
                    return Err("day-of-week step must be positive".to_string());
                }
                (r, Some(step))
            }
            None => (part, None),
        };

        let (lo, hi) = if range == "*" {
            (0, 6)
        } else if let Some((a, b)) = range.split_once('-') {
            let (a, b) = (parse_weekday(a)?, parse_weekday(b)?);
            if a > b {
                return Err(format!("descending day-of-week range '{}'", range));
            }
            (a, b)
        } else {
            let a = parse_weekday(range)?;
            // "3/2" means "3 through Saturday, every 2nd day"
            if step.is_some() { (a, 6.max(a)) } else { (a, a) }
        };

        for day in (lo..=hi).step_by(step.unwrap_or(1) as usize) {
            days.insert(day % 7);
        }
    }

    Ok(days
        .iter()
        .map(|d| (d + 1).to_string())
        .collect::<Vec<_>>()
        .join(","))
}

fn parse_weekday(token: &str) -> Result<u32, String> {
    const NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];
    if let Ok(n) = token.parse::<u32>() {
        return if n <= 7 {
            Ok(n)
        } else {
            Err(format!("day-of-week {} out of range 0-7", n))
        };
    }
    let upper = token.to_ascii_uppercase();
    NAMES
        .iter()
        .position(|name| *name == upper)
        .map(|i| i as u32)
        .ok_or_else(|| format!("unknown day-of-week '{}'", token))
}
