//! Cron expressions.
//!
//! Accepts standard 5-field cron (`min hour dom month dow`, day-of-week 0-7
//! with 0 and 7 meaning Sunday), 6/7-field expressions with a leading seconds
//! field, and `@hourly`-style aliases. Expressions are normalized to the
//! seconds-first form of the `cron` crate.
//!
//! When both day-of-month and day-of-week are restricted, a day matches if
//! either field matches. A field starting with `*` (or `?`) is unrestricted.

use std::str::FromStr;

use chrono::{DateTime, FixedOffset, Utc};
use cron::Schedule;

use jobmill_protocols::JobError;

const DAY_NAMES: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];

/// A parsed cron expression bound to a timezone.
#[derive(Debug, Clone)]
pub struct CronExpr {
    source: String,
    /// One schedule, or one per day field when both are restricted.
    schedules: Vec<Schedule>,
    timezone: FixedOffset,
}

impl CronExpr {
    /// Parse an expression evaluated in `timezone` (`UTC` or `+HH:MM`).
    pub fn parse(expr: &str, timezone: &str) -> Result<Self, JobError> {
        let schedules = normalize(expr)?
            .iter()
            .map(|normalized| {
                Schedule::from_str(normalized)
                    .map_err(|e| JobError::InvalidCron(format!("{}: {}", expr, e)))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            source: expr.trim().to_string(),
            schedules,
            timezone: parse_timezone(timezone)?,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn timezone(&self) -> FixedOffset {
        self.timezone
    }

    /// First occurrence strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let local = after.with_timezone(&self.timezone);
        self.schedules
            .iter()
            .filter_map(|schedule| schedule.after(&local).next())
            .min()
            .map(|at| at.with_timezone(&Utc))
    }

    /// Occurrences in `(from, until]`, at most `limit` of them.
    pub fn occurrences_between(
        &self,
        from: DateTime<Utc>,
        until: DateTime<Utc>,
        limit: usize,
    ) -> Vec<DateTime<Utc>> {
        let local = from.with_timezone(&self.timezone);
        let mut hits: Vec<DateTime<Utc>> = self
            .schedules
            .iter()
            .flat_map(|schedule| {
                schedule
                    .after(&local)
                    .map(|at| at.with_timezone(&Utc))
                    .take_while(move |at| *at <= until)
                    .take(limit)
            })
            .collect();
        hits.sort();
        hits.dedup();
        hits.truncate(limit);
        hits
    }
}

/// Parse `UTC`, `Z` or a fixed offset such as `+05:30`, `-0800`, `+02`.
pub fn parse_timezone(timezone: &str) -> Result<FixedOffset, JobError> {
    let tz = timezone.trim();
    let invalid = || JobError::InvalidCron(format!("unsupported timezone: {:?}", timezone));
    if tz.is_empty() || tz.eq_ignore_ascii_case("utc") || tz == "Z" {
        return FixedOffset::east_opt(0).ok_or_else(invalid);
    }
    let tz = tz
        .strip_prefix("UTC")
        .or_else(|| tz.strip_prefix("utc"))
        .unwrap_or(tz);

    let (sign, rest) = match tz.as_bytes().first() {
        Some(b'+') => (1, &tz[1..]),
        Some(b'-') => (-1, &tz[1..]),
        _ => return Err(invalid()),
    };
    let digits: String = rest.chars().filter(|c| *c != ':').collect();
    if !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid());
    }
    let (hours, minutes) = match digits.len() {
        1 | 2 => (digits.parse::<i32>().map_err(|_| invalid())?, 0),
        4 => (
            digits[..2].parse::<i32>().map_err(|_| invalid())?,
            digits[2..].parse::<i32>().map_err(|_| invalid())?,
        ),
        _ => return Err(invalid()),
    };
    if hours > 14 || minutes > 59 {
        return Err(invalid());
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60)).ok_or_else(invalid)
}

/// Normalized `cron` crate sources; two when both day fields are restricted.
fn normalize(expr: &str) -> Result<Vec<String>, JobError> {
    let expr = expr.trim();
    let aliased = match expr.to_ascii_lowercase().as_str() {
        "@yearly" | "@annually" => Some("0 0 1 1 *"),
        "@monthly" => Some("0 0 1 * *"),
        "@weekly" => Some("0 0 * * 0"),
        "@daily" | "@midnight" => Some("0 0 * * *"),
        "@hourly" => Some("0 * * * *"),
        "@minutely" => Some("* * * * *"),
        other if other.starts_with('@') => {
            return Err(JobError::InvalidCron(format!("unknown alias: {}", expr)));
        }
        _ => None,
    };
    let expr = aliased.unwrap_or(expr);

    let mut fields: Vec<String> = expr.split_whitespace().map(str::to_string).collect();
    match fields.len() {
        5 => fields.insert(0, "0".to_string()),
        6 | 7 => {}
        n => {
            return Err(JobError::InvalidCron(format!(
                "expected 5, 6 or 7 fields, got {}: {:?}",
                n, expr
            )));
        }
    }
    let either_day = restricts_days(&fields[3]) && restricts_days(&fields[5]);
    fields[5] = day_of_week(&fields[5])?;
    if !either_day {
        return Ok(vec![fields.join(" ")]);
    }

    let mut by_month_day = fields.clone();
    by_month_day[5] = "*".to_string();
    let mut by_week_day = fields;
    by_week_day[3] = "*".to_string();
    Ok(vec![by_month_day.join(" "), by_week_day.join(" ")])
}

fn restricts_days(field: &str) -> bool {
    !(field.starts_with('*') || field == "?")
}

/// Rewrite numeric day-of-week items as day names.
fn day_of_week(field: &str) -> Result<String, JobError> {
    let mut days: Vec<String> = Vec::new();
    for item in field.split(',') {
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => (range, Some(step)),
            None => (item, None),
        };
        let numeric = range == "*"
            || range
                .split('-')
                .all(|part| !part.is_empty() && part.chars().all(|c| c.is_ascii_digit()));
        if !numeric || (range == "*" && step.is_none()) {
            days.push(item.to_string());
            continue;
        }

        let invalid = || JobError::InvalidCron(format!("bad day-of-week item: {:?}", item));
        let (start, end) = match range {
            "*" => (0, 6),
            _ => match range.split_once('-') {
                Some((a, b)) => (
                    a.parse::<u32>().map_err(|_| invalid())?,
                    b.parse::<u32>().map_err(|_| invalid())?,
                ),
                None => {
                    let day = range.parse::<u32>().map_err(|_| invalid())?;
                    let end = if step.is_some() { 7 } else { day };
                    (day, end)
                }
            },
        };
        let step = match step {
            Some(s) => s.parse::<u32>().map_err(|_| invalid())?,
            None => 1,
        };
        if start > 7 || end > 7 || start > end || step == 0 {
            return Err(invalid());
        }
        for day in (start..=end).step_by(step as usize) {
            let name = DAY_NAMES[(day % 7) as usize].to_string();
            if !days.contains(&name) {
                days.push(name);
            }
        }
    }
    Ok(days.join(","))
}

/// Common cron presets.
pub struct Cron;

impl Cron {
    pub fn minutely() -> String {
        "* * * * *".to_string()
    }

    pub fn hourly() -> String {
        "0 * * * *".to_string()
    }

    pub fn hourly_at(minute: u32) -> String {
        format!("{} * * * *", minute)
    }

    pub fn daily() -> String {
        "0 0 * * *".to_string()
    }

    pub fn daily_at(hour: u32, minute: u32) -> String {
        format!("{} {} * * *", minute, hour)
    }

    pub fn weekly() -> String {
        "0 0 * * 0".to_string()
    }

    pub fn monthly() -> String {
        "0 0 1 * *".to_string()
    }

    pub fn yearly() -> String {
        "0 0 1 1 *".to_string()
    }

    pub fn every_minutes(n: u32) -> String {
        format!("*/{} * * * *", n.max(1))
    }
}
