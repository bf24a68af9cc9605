//! Cron expression parsing and evaluation.
//!
//! Supports six-field expressions (`second minute hour day month weekday`),
//! classic five-field expressions (`minute hour day month weekday`, fired at
//! second zero) and the `@hourly`-style descriptors including `@every <dur>`.

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};

const MONTH_NAMES: [&str; 12] = [
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];
const WEEKDAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// Upper bound on how far ahead `next_after` searches before giving up.
const SEARCH_HORIZON_YEARS: i32 = 5;

/// A parsed cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpression {
    /// Second (0-59).
    second: CronField,
    /// Minute (0-59).
    minute: CronField,
    /// Hour (0-23).
    hour: CronField,
    /// Day of month (1-31).
    day: CronField,
    /// Month (1-12).
    month: CronField,
    /// Day of week (0-6, Sunday = 0).
    weekday: CronField,
}

/// A single field in a cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
enum CronField {
    /// Wildcard (`*` or `?`) - matches all values.
    Any,
    /// Specific value.
    Value(u32),
    /// Range (e.g., 1-5).
    Range(u32, u32),
    /// Stepped range (e.g., `*/5`, `10-40/10`).
    Step { start: u32, end: u32, step: u32 },
    /// List of sub-fields (e.g., 1,3,5 or 1-3,10).
    List(Vec<CronField>),
}

impl CronField {
    /// Check if the field matches the given value.
    fn matches(&self, value: u32) -> bool {
        match self {
            Self::Any => true,
            Self::Value(v) => *v == value,
            Self::Range(start, end) => value >= *start && value <= *end,
            Self::Step { start, end, step } => {
                value >= *start && value <= *end && (value - start) % step == 0
            }
            Self::List(fields) => fields.iter().any(|f| f.matches(value)),
        }
    }

    fn is_any(&self) -> bool {
        matches!(self, Self::Any)
    }
}

/// A schedule: either a calendar expression or a fixed interval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Schedule {
    /// Calendar-based cron expression.
    Cron(CronExpression),
    /// Fixed delay between firings (`@every 30s`).
    Every(Duration),
}

impl Schedule {
    /// Calculate the next firing time strictly after the given time.
    pub fn next_after(&self, after: &DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Cron(expr) => expr.next_after(after),
            Self::Every(interval) => {
                let step = chrono::Duration::from_std(*interval).ok()?;
                after.checked_add_signed(step)
            }
        }
    }
}

/// Cron expression parser.
#[derive(Debug)]
pub struct CronParser;

impl CronParser {
    /// Parse a schedule string.
    ///
    /// # Examples
    ///
    /// - `*/5 * * * * *` - Every 5 seconds
    /// - `0 0 * * *` - Daily at midnight
    /// - `0 9-17 * * MON-FRI` - Every hour 9am-5pm, Monday-Friday
    /// - `@every 1m30s` - Every ninety seconds
    pub fn parse(expr: &str) -> Result<Schedule> {
        let expr = expr.trim();
        if let Some(descriptor) = expr.strip_prefix('@') {
            return Self::parse_descriptor(descriptor);
        }
        Self::parse_expression(expr).map(Schedule::Cron)
    }

    /// Parse a five- or six-field calendar expression.
    pub fn parse_expression(expr: &str) -> Result<CronExpression> {
        let parts: Vec<&str> = expr.split_whitespace().collect();
        let (second, rest) = match parts.len() {
            6 => (
                Self::parse_field(parts[0], 0, 59, &[]).context("Invalid second field")?,
                &parts[1..],
            ),
            5 => (CronField::Value(0), &parts[..]),
            _ => anyhow::bail!("Cron expression must have 5 or 6 fields: {}", expr),
        };

        let weekday =
            Self::parse_field(rest[4], 0, 7, &WEEKDAY_NAMES).context("Invalid weekday field")?;

        Ok(CronExpression {
            second,
            minute: Self::parse_field(rest[0], 0, 59, &[]).context("Invalid minute field")?,
            hour: Self::parse_field(rest[1], 0, 23, &[]).context("Invalid hour field")?,
            day: Self::parse_field(rest[2], 1, 31, &[]).context("Invalid day field")?,
            month: Self::parse_field(rest[3], 1, 12, &MONTH_NAMES).context("Invalid month field")?,
            weekday: fold_sunday(weekday),
        })
    }

    fn parse_descriptor(descriptor: &str) -> Result<Schedule> {
        let expr = match descriptor.to_ascii_lowercase().as_str() {
            "yearly" | "annually" => "0 0 0 1 1 *",
            "monthly" => "0 0 0 1 * *",
            "weekly" => "0 0 0 * * 0",
            "daily" | "midnight" => "0 0 0 * * *",
            "hourly" => "0 0 * * * *",
            other => {
                let Some(interval) = other.strip_prefix("every") else {
                    anyhow::bail!("Unknown schedule descriptor: @{}", descriptor);
                };
                let interval = parse_duration(interval.trim())
                    .with_context(|| format!("Invalid @every interval: {descriptor}"))?;
                return Ok(Schedule::Every(interval));
            }
        };
        Self::parse_expression(expr).map(Schedule::Cron)
    }

    fn parse_field(field: &str, min: u32, max: u32, names: &[&str]) -> Result<CronField> {
        if field.contains(',') {
            let fields = field
                .split(',')
                .map(|part| Self::parse_part(part, min, max, names))
                .collect::<Result<Vec<_>>>()?;
            return Ok(CronField::List(fields));
        }
        Self::parse_part(field, min, max, names)
    }

    fn parse_part(part: &str, min: u32, max: u32, names: &[&str]) -> Result<CronField> {
        if part.is_empty() {
            anyhow::bail!("Empty field value");
        }

        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step.parse().context("Invalid step value")?;
                if step == 0 || step > max {
                    anyhow::bail!("Step value must be 1-{}", max);
                }
                (range, Some(step))
            }
            None => (part, None),
        };

        let (start, end) = if range == "*" || range == "?" {
            if step.is_none() {
                return Ok(CronField::Any);
            }
            (min, max)
        } else if let Some((start, end)) = range.split_once('-') {
            let start = parse_value(start, min, max, names).context("Invalid range start")?;
            let end = parse_value(end, min, max, names).context("Invalid range end")?;
            if start > end {
                anyhow::bail!("Range values must be {}-{} with start <= end", min, max);
            }
            (start, end)
        } else {
            let value = parse_value(range, min, max, names)?;
            match step {
                // `n/step` runs from n to the end of the field.
                Some(_) => (value, max),
                None => return Ok(CronField::Value(value)),
            }
        };

        Ok(match step {
            Some(step) => CronField::Step { start, end, step },
            None => CronField::Range(start, end),
        })
    }
}

fn parse_value(raw: &str, min: u32, max: u32, names: &[&str]) -> Result<u32> {
    let upper = raw.to_ascii_uppercase();
    if let Some(index) = names.iter().position(|name| *name == upper) {
        // Month names are 1-based, weekday names 0-based.
        let offset = if min == 0 { 0 } else { 1 };
        return Ok(u32::try_from(index)? + offset);
    }

    let value: u32 = raw.parse().context("Invalid numeric value")?;
    if value < min || value > max {
        anyhow::bail!("Value must be {}-{}", min, max);
    }
    Ok(value)
}

/// Weekday 7 is an alias for Sunday (0).
fn fold_sunday(field: CronField) -> CronField {
    match field {
        CronField::Value(7) => CronField::Value(0),
        CronField::Range(start, 7) => CronField::List(vec![
            CronField::Range(start, 6),
            CronField::Value(0),
        ]),
        CronField::List(fields) => CronField::List(fields.into_iter().map(fold_sunday).collect()),
        other => other,
    }
}

/// Parse compact durations such as `30s`, `5m`, `1h30m` or `250ms`.
fn parse_duration(raw: &str) -> Result<Duration> {
    if raw.is_empty() {
        anyhow::bail!("Missing duration");
    }

    let mut total = Duration::ZERO;
    let mut digits = String::new();
    let mut chars = raw.chars().peekable();
    while let Some(c) = chars.next() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let amount: u64 = digits.parse().context("Duration unit without amount")?;
        digits.clear();
        let unit = match c {
            'm' if chars.peek() == Some(&'s') => {
                chars.next();
                Some(Duration::from_millis(amount))
            }
            'h' => amount.checked_mul(3600).map(Duration::from_secs),
            'm' => amount.checked_mul(60).map(Duration::from_secs),
            's' => Some(Duration::from_secs(amount)),
            other => anyhow::bail!("Unknown duration unit '{}'", other),
        };
        total = unit
            .and_then(|unit| total.checked_add(unit))
            .with_context(|| format!("Duration too large: {raw}"))?;
    }
    if !digits.is_empty() {
        anyhow::bail!("Duration amount without unit: {}", raw);
    }
    if total.is_zero() {
        anyhow::bail!("Duration must be positive");
    }
    Ok(total)
}

impl CronExpression {
    /// Check if the cron expression matches the given time.
    pub fn matches(&self, time: &DateTime<Utc>) -> bool {
        self.second.matches(time.second())
            && self.minute.matches(time.minute())
            && self.hour.matches(time.hour())
            && self.month.matches(time.month())
            && self.day_matches(time)
    }

    /// When both day fields are restricted, either one matching is enough.
    fn day_matches(&self, time: &DateTime<Utc>) -> bool {
        let day = self.day.matches(time.day());
        let weekday = self.weekday.matches(time.weekday().num_days_from_sunday());
        if self.day.is_any() || self.weekday.is_any() {
            day && weekday
        } else {
            day || weekday
        }
    }

    /// Calculate the next execution time strictly after the given time.
    ///
    /// Walks forward field by field, skipping whole months, days, hours and
    /// minutes that cannot match.
    pub fn next_after(&self, after: &DateTime<Utc>) -> Option<DateTime<Utc>> {
        let horizon = after.year() + SEARCH_HORIZON_YEARS;
        let mut current = after.with_nanosecond(0)? + chrono::Duration::seconds(1);

        while current.year() <= horizon {
            if !self.month.matches(current.month()) {
                current = start_of_next_month(&current)?;
                continue;
            }
            if !self.day_matches(&current) {
                current = start_of_day(&current)? + chrono::Duration::days(1);
                continue;
            }
            if !self.hour.matches(current.hour()) {
                current = current.with_minute(0)?.with_second(0)? + chrono::Duration::hours(1);
                continue;
            }
            if !self.minute.matches(current.minute()) {
                current = current.with_second(0)? + chrono::Duration::minutes(1);
                continue;
            }
            if !self.second.matches(current.second()) {
                current += chrono::Duration::seconds(1);
                continue;
            }
            return Some(current);
        }
        None
    }
}

fn start_of_day(time: &DateTime<Utc>) -> Option<DateTime<Utc>> {
    Utc.with_ymd_and_hms(time.year(), time.month(), time.day(), 0, 0, 0)
        .single()
}

fn start_of_next_month(time: &DateTime<Utc>) -> Option<DateTime<Utc>> {
    let (year, month) = if time.month() == 12 {
        (time.year() + 1, 1)
    } else {
        (time.year(), time.month() + 1)
    };
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).single()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn test_parse_wildcard() {
        let expr = CronParser::parse_expression("* * * * *").unwrap();
        let now = Utc::now().with_second(0).unwrap();
        assert!(expr.matches(&now));
    }

    #[test]
    fn test_parse_daily_midnight() {
        let expr = CronParser::parse_expression("0 0 * * *").unwrap();
        assert!(expr.matches(&at(2024, 3, 10, 0, 0, 0)));
        assert!(!expr.matches(&at(2024, 3, 10, 0, 0, 30)));
    }

    #[test]
    fn test_parse_invalid() {
        assert!(CronParser::parse("invalid").is_err());
        assert!(CronParser::parse("* * *").is_err());
        assert!(CronParser::parse("60 * * * *").is_err());
        assert!(CronParser::parse("*/0 * * * * *").is_err());
        assert!(CronParser::parse("5-1 * * * *").is_err());
        assert!(CronParser::parse("@fortnightly").is_err());
        assert!(CronParser::parse("@every 10").is_err());
        assert!(CronParser::parse("@every 99999999999999999h").is_err());
        assert!(CronParser::parse("@every 18446744073709551615s18446744073709551615s").is_err());
    }

    #[test]
    fn test_every_five_seconds() {
        let schedule = CronParser::parse("*/5 * * * * *").unwrap();
        let next = schedule.next_after(&at(2024, 1, 1, 12, 0, 3)).unwrap();
        assert_eq!(next, at(2024, 1, 1, 12, 0, 5));
        let next = schedule.next_after(&next).unwrap();
        assert_eq!(next, at(2024, 1, 1, 12, 0, 10));
    }

    #[test]
    fn test_five_field_fires_on_minute_boundary() {
        let schedule = CronParser::parse("*/15 * * * *").unwrap();
        let next = schedule.next_after(&at(2024, 1, 1, 12, 1, 0)).unwrap();
        assert_eq!(next, at(2024, 1, 1, 12, 15, 0));
    }

    #[test]
    fn test_next_rolls_over_year() {
        let schedule = CronParser::parse("0 0 0 1 JAN *").unwrap();
        let next = schedule.next_after(&at(2024, 6, 15, 8, 0, 0)).unwrap();
        assert_eq!(next, at(2025, 1, 1, 0, 0, 0));
    }

    #[test]
    fn test_weekday_names_and_sunday_alias() {
        let names = CronParser::parse_expression("0 9 * * MON-FRI").unwrap();
        // 2024-03-09 is a Saturday.
        assert!(!names.matches(&at(2024, 3, 9, 9, 0, 0)));
        assert!(names.matches(&at(2024, 3, 11, 9, 0, 0)));

        let sunday = CronParser::parse_expression("0 0 * * 7").unwrap();
        assert!(sunday.matches(&at(2024, 3, 10, 0, 0, 0)));
    }

    #[test]
    fn test_day_or_weekday_when_both_restricted() {
        // 1st of the month OR any Monday.
        let expr = CronParser::parse_expression("0 0 1 * 1").unwrap();
        assert!(expr.matches(&at(2024, 3, 1, 0, 0, 0)));
        assert!(expr.matches(&at(2024, 3, 4, 0, 0, 0)));
        assert!(!expr.matches(&at(2024, 3, 5, 0, 0, 0)));
    }

    #[test]
    fn test_step_over_range_and_lists() {
        let expr = CronParser::parse_expression("10-40/10,55 * * * *").unwrap();
        for minute in [10, 20, 30, 40, 55] {
            assert!(expr.matches(&at(2024, 1, 1, 0, minute, 0)));
        }
        assert!(!expr.matches(&at(2024, 1, 1, 0, 50, 0)));
    }

    #[test]
    fn test_descriptors() {
        assert_eq!(
            CronParser::parse("@every 1m30s").unwrap(),
            Schedule::Every(Duration::from_secs(90))
        );
        let hourly = CronParser::parse("@hourly").unwrap();
        let next = hourly.next_after(&at(2024, 1, 1, 10, 59, 59)).unwrap();
        assert_eq!(next, at(2024, 1, 1, 11, 0, 0));
    }

    #[test]
    fn test_impossible_date_has_no_next() {
        let expr = CronParser::parse_expression("0 0 31 2 *").unwrap();
        assert!(expr.next_after(&at(2024, 1, 1, 0, 0, 0)).is_none());
    }
}
