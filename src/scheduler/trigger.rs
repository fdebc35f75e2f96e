//! Trigger parsing: five-field crontab expressions and one-shot run times.

use std::collections::BTreeSet;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeZone};
use chrono_tz::Tz;
use cron::Schedule;
use thiserror::Error;

/// Format used for `next_run` and one-shot `run_at` in API responses.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%:z";

const CRON_USAGE: &str = "cron format: 'minute hour day month day_of_week' (e.g. '0 8 * * *')";
const RUN_AT_USAGE: &str = "use 'HH:MM', 'HH:MM:SS', 'YYYY-MM-DD HH:MM' or 'YYYY-MM-DD HH:MM:SS'";
const DAY_NAMES: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("{0}")]
    InvalidCron(String),
    #[error("unsupported time format: '{input}' ({})", RUN_AT_USAGE)]
    InvalidRunAt { input: String },
    #[error("run time is in the past: {0}")]
    RunAtInPast(String),
    #[error("job not found: {0}")]
    NotFound(String),
    #[error("job has no content")]
    NoContent,
}

/// A validated `minute hour day month day_of_week` expression.
#[derive(Debug, Clone)]
pub struct CronSpec {
    fields: [String; 5],
    schedule: Schedule,
}

impl CronSpec {
    pub fn parse(expr: &str) -> Result<Self, SchedulerError> {
        let parts: Vec<&str> = expr.split_whitespace().collect();
        let [minute, hour, day, month, day_of_week] = parts.as_slice() else {
            return Err(SchedulerError::InvalidCron(CRON_USAGE.to_string()));
        };

        let dow = translate_day_of_week(day_of_week)?;
        // The cron crate wants a seconds field first; pin it to 0.
        let full = format!("0 {minute} {hour} {day} {month} {dow}");
        let schedule = Schedule::from_str(&full)
            .map_err(|e| SchedulerError::InvalidCron(format!("invalid cron '{}': {}", expr.trim(), e)))?;

        Ok(Self {
            fields: [minute, hour, day, month, day_of_week].map(|f| f.to_string()),
            schedule,
        })
    }

    /// First fire time strictly after `after`.
    pub fn next_after(&self, after: &DateTime<Tz>) -> Option<DateTime<Tz>> {
        self.schedule.after(after).next()
    }

    /// The expression as given, single-space separated.
    pub fn expression(&self) -> String {
        self.fields.join(" ")
    }

    pub fn describe(&self) -> String {
        let [minute, hour, day, month, day_of_week] = &self.fields;
        format!("cron[minute='{minute}', hour='{hour}', day='{day}', month='{month}', day_of_week='{day_of_week}']")
    }
}

/// Crontab day-of-week (0 or 7 = Sunday, names allowed) to the cron crate's
/// weekday names, which sidesteps its 1 = Sunday numbering.
fn translate_day_of_week(field: &str) -> Result<String, SchedulerError> {
    if field == "*" || field == "?" {
        return Ok(field.to_string());
    }

    let invalid = |why: &str| SchedulerError::InvalidCron(format!("invalid day_of_week '{field}': {why}"));
    let mut days = BTreeSet::new();

    for item in field.split(',') {
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => {
                let step: usize = step.parse().map_err(|_| invalid("bad step"))?;
                if step == 0 {
                    return Err(invalid("step must be positive"));
                }
                (range, step)
            }
            None => (item, 1),
        };

        let (start, end) = if range == "*" {
            (0, 6)
        } else if let Some((a, b)) = range.split_once('-') {
            (day_number(a).ok_or_else(|| invalid("bad range"))?, day_number(b).ok_or_else(|| invalid("bad range"))?)
        } else {
            let day = day_number(range).ok_or_else(|| invalid("unknown day"))?;
            // "5/2" means from Friday to the end of the week
            (day, if step > 1 { 6 } else { day })
        };
        if start > end {
            return Err(invalid("range start after end"));
        }

        for day in (start..=end).step_by(step) {
            days.insert(day % 7);
        }
    }

    if days.len() == 7 {
        return Ok("*".to_string());
    }
    Ok(days.into_iter().map(|d| DAY_NAMES[d]).collect::<Vec<_>>().join(","))
}

/// 0..=7 or a three-letter English name; 7 is kept so `1-7` stays a valid range.
fn day_number(token: &str) -> Option<usize> {
    if let Ok(n) = token.parse::<usize>() {
        return (n <= 7).then_some(n);
    }
    DAY_NAMES.iter().position(|name| name.eq_ignore_ascii_case(token))
}

/// When a job fires.
#[derive(Debug, Clone)]
pub enum JobTrigger {
    Cron(CronSpec),
    Once(DateTime<Tz>),
}

impl JobTrigger {
    /// Next fire time after `now`; a one-shot always reports its run time.
    pub fn next_fire(&self, now: &DateTime<Tz>) -> Option<DateTime<Tz>> {
        match self {
            Self::Cron(spec) => spec.next_after(now),
            Self::Once(at) => Some(*at),
        }
    }

    pub fn is_once(&self) -> bool {
        matches!(self, Self::Once(_))
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Cron(spec) => spec.describe(),
            Self::Once(at) => format!("date[{}]", at.format("%Y-%m-%d %H:%M:%S %Z")),
        }
    }
}

/// Parse a one-shot run time relative to `now` (which also fixes the timezone).
///
/// Accepts `HH:MM[:SS]` for today or `YYYY-MM-DD HH:MM[:SS]`. Times at or
/// before `now` are rejected.
pub fn parse_run_at(input: &str, now: &DateTime<Tz>) -> Result<DateTime<Tz>, SchedulerError> {
    let input = input.trim();
    let invalid = || SchedulerError::InvalidRunAt { input: input.to_string() };

    let naive = if input.contains('-') {
        parse_date_time(input).ok_or_else(invalid)?
    } else {
        let time = parse_time(input).ok_or_else(invalid)?;
        NaiveDateTime::new(now.date_naive(), time)
    };

    let tz = now.timezone();
    // Nonexistent local times (DST gaps) are rejected like any other bad input.
    let run_at = tz.from_local_datetime(&naive).earliest().ok_or_else(invalid)?;
    if run_at <= *now {
        return Err(SchedulerError::RunAtInPast(run_at.format(TIMESTAMP_FORMAT).to_string()));
    }
    Ok(run_at)
}

fn parse_time(input: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(input, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(input, "%H:%M"))
        .ok()
}

fn parse_date_time(input: &str) -> Option<NaiveDateTime> {
    let (date, time) = input.split_once(' ')?;
    let date = NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()?;
    Some(NaiveDateTime::new(date, parse_time(time.trim())?))
}
