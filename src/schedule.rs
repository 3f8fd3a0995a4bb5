// src/schedule.rs

//! Scheduling policies consumed by the job scheduler.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, FixedOffset, NaiveTime, TimeDelta, Utc, Weekday};

use crate::config::model::parse_duration;

/// Decides when a job's next run should happen.
pub trait SchedulerPolicy: Send + Sync + fmt::Debug {
    /// `last_run_time` is the run time of the newest non-manual run, or
    /// `None` when scheduling should ignore history.
    fn next_run_time(&self, last_run_time: Option<DateTime<Utc>>, now: DateTime<Utc>)
    -> DateTime<Utc>;

    /// When true the next run is only scheduled once the current one is done.
    fn schedule_on_complete(&self) -> bool {
        false
    }

    fn describe(&self) -> String;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConstantScheduler;

impl SchedulerPolicy for ConstantScheduler {
    fn next_run_time(&self, _last: Option<DateTime<Utc>>, now: DateTime<Utc>) -> DateTime<Utc> {
        now
    }

    fn schedule_on_complete(&self) -> bool {
        true
    }

    fn describe(&self) -> String {
        "constant".to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntervalScheduler {
    pub interval: Duration,
}

impl SchedulerPolicy for IntervalScheduler {
    fn next_run_time(&self, last: Option<DateTime<Utc>>, now: DateTime<Utc>) -> DateTime<Utc> {
        let delta = TimeDelta::from_std(self.interval).unwrap_or(TimeDelta::MAX);
        let base = last.unwrap_or(now);
        base.checked_add_signed(delta).unwrap_or(base)
    }

    fn describe(&self) -> String {
        format!("interval {}s", self.interval.as_secs())
    }
}

/// Runs at a fixed time of day, optionally restricted to some weekdays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DailyScheduler {
    pub time_of_day: NaiveTime,
    /// Empty means every day.
    pub weekdays: BTreeSet<u32>,
    pub offset: FixedOffset,
}

impl DailyScheduler {
    fn day_allowed(&self, weekday: Weekday) -> bool {
        self.weekdays.is_empty() || self.weekdays.contains(&weekday.num_days_from_monday())
    }
}

impl SchedulerPolicy for DailyScheduler {
    fn next_run_time(&self, last: Option<DateTime<Utc>>, now: DateTime<Utc>) -> DateTime<Utc> {
        let start = last.unwrap_or(now).with_timezone(&self.offset);
        let mut date = start.date_naive();
        // Strictly after `start`; at most one week plus today to look at.
        for _ in 0..8 {
            if self.day_allowed(date.weekday()) {
                let candidate = date.and_time(self.time_of_day);
                if let Some(local) = candidate.and_local_timezone(self.offset).single() {
                    if local > start {
                        return local.with_timezone(&Utc);
                    }
                }
            }
            match date.succ_opt() {
                Some(next) => date = next,
                None => break,
            }
        }
        start.with_timezone(&Utc)
    }

    fn describe(&self) -> String {
        const LETTERS: [char; 7] = ['M', 'T', 'W', 'R', 'F', 'S', 'U'];
        let days: String = self
            .weekdays
            .iter()
            .filter_map(|d| LETTERS.get(*d as usize))
            .collect();
        if days.is_empty() {
            format!("daily {}", self.time_of_day.format("%H:%M:%S"))
        } else {
            format!("daily {} {}", self.time_of_day.format("%H:%M:%S"), days)
        }
    }
}

/// Parsed `schedule` string, independent of time zone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleSpec {
    Constant,
    Interval(Duration),
    Daily {
        time_of_day: NaiveTime,
        weekdays: BTreeSet<u32>,
    },
}

impl ScheduleSpec {
    pub fn build(&self, offset: FixedOffset) -> Arc<dyn SchedulerPolicy> {
        match self {
            ScheduleSpec::Constant => Arc::new(ConstantScheduler),
            ScheduleSpec::Interval(interval) => Arc::new(IntervalScheduler { interval: *interval }),
            ScheduleSpec::Daily {
                time_of_day,
                weekdays,
            } => Arc::new(DailyScheduler {
                time_of_day: *time_of_day,
                weekdays: weekdays.clone(),
                offset,
            }),
        }
    }
}

/// Parse `"constant"`, `"interval 5m"` or `"daily 04:00:00 MTWRF"`.
///
/// Weekday letters are `M T W R F S U` (Monday through Sunday).
pub fn parse_schedule(s: &str) -> Result<ScheduleSpec, String> {
    let mut parts = s.split_whitespace();
    let kind = parts
        .next()
        .ok_or_else(|| "empty schedule".to_string())?
        .to_lowercase();

    let spec = match kind.as_str() {
        "constant" => ScheduleSpec::Constant,
        "interval" => {
            let value = parts
                .next()
                .ok_or_else(|| "interval schedule needs a duration".to_string())?;
            let interval = parse_duration(value)?;
            if interval.is_zero() {
                return Err("interval must be greater than zero".to_string());
            }
            ScheduleSpec::Interval(interval)
        }
        "daily" => {
            let time_str = parts.next().unwrap_or("00:00:00");
            let time_of_day = NaiveTime::parse_from_str(time_str, "%H:%M:%S")
                .or_else(|_| NaiveTime::parse_from_str(time_str, "%H:%M"))
                .map_err(|_| format!("invalid time of day '{time_str}'"))?;
            let weekdays = match parts.next() {
                Some(days) => parse_weekdays(days)?,
                None => BTreeSet::new(),
            };
            ScheduleSpec::Daily {
                time_of_day,
                weekdays,
            }
        }
        other => return Err(format!("unknown schedule type '{other}'")),
    };

    if let Some(extra) = parts.next() {
        return Err(format!("unexpected trailing schedule text '{extra}'"));
    }
    Ok(spec)
}

fn parse_weekdays(days: &str) -> Result<BTreeSet<u32>, String> {
    days.chars()
        .map(|c| match c.to_ascii_uppercase() {
            'M' => Ok(0),
            'T' => Ok(1),
            'W' => Ok(2),
            'R' => Ok(3),
            'F' => Ok(4),
            'S' => Ok(5),
            'U' => Ok(6),
            other => Err(format!("invalid weekday letter '{other}'")),
        })
        .collect()
}
