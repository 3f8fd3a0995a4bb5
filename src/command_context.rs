// src/command_context.rs

//! Command templates and the context chain used to render them.
//!
//! Templates use `%(name)s` placeholders and `%%` for a literal percent
//! sign. Names are resolved through a chain of [`CommandContext`]s, most
//! specific first:
//!
//! ```text
//! ActionRunContext -> JobRunContext -> JobContext -> [command_context]
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Datelike, FixedOffset, Months, TimeDelta};
use regex::Regex;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RenderError {
    #[error("unknown context variable '{0}'")]
    MissingKey(String),
}

/// Something that can answer a context lookup.
pub trait ContextSource: Send + Sync + fmt::Debug {
    fn lookup(&self, name: &str) -> Option<String>;
}

impl ContextSource for BTreeMap<String, String> {
    fn lookup(&self, name: &str) -> Option<String> {
        self.get(name).cloned()
    }
}

impl ContextSource for HashMap<String, String> {
    fn lookup(&self, name: &str) -> Option<String> {
        self.get(name).cloned()
    }
}

/// One link of a read-only lookup chain.
#[derive(Debug, Clone, Default)]
pub struct CommandContext {
    base: Option<Arc<dyn ContextSource>>,
    next: Option<Arc<CommandContext>>,
}

impl CommandContext {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn new(base: impl ContextSource + 'static) -> Self {
        Self {
            base: Some(Arc::new(base)),
            next: None,
        }
    }

    /// A context that consults `base` first and falls back to `next`.
    pub fn chained(base: impl ContextSource + 'static, next: &CommandContext) -> Self {
        Self {
            base: Some(Arc::new(base)),
            next: Some(Arc::new(next.clone())),
        }
    }

    pub fn get(&self, name: &str) -> Option<String> {
        self.base
            .as_ref()
            .and_then(|base| base.lookup(name))
            .or_else(|| self.next.as_ref().and_then(|next| next.get(name)))
    }
}

fn placeholder() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"%\(([^)]*)\)s|%%").expect("placeholder pattern is valid")
    })
}

/// Render `template` against `context`.
///
/// A `%` that is not part of `%(name)s` or `%%` is copied through unchanged.
pub fn render(template: &str, context: &CommandContext) -> Result<String, RenderError> {
    let mut out = String::with_capacity(template.len());
    let mut last = 0;

    for caps in placeholder().captures_iter(template) {
        let Some(whole) = caps.get(0) else { continue };
        out.push_str(&template[last..whole.start()]);
        match caps.get(1) {
            Some(name) => {
                let value = context
                    .get(name.as_str())
                    .ok_or_else(|| RenderError::MissingKey(name.as_str().to_string()))?;
                out.push_str(&value);
            }
            None => out.push('%'),
        }
        last = whole.end();
    }
    out.push_str(&template[last..]);
    Ok(out)
}

fn date_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^([a-z]+)([+-]\d+)?$").expect("date pattern is valid")
    })
}

/// Evaluate a date arithmetic key such as `shortdate-1` or `unixtime+60`
/// against `at`. The unit of the offset follows the key: days for
/// `shortdate`/`day`/`daynumber`, months for `month`, seconds for
/// `unixtime`, and so on. Returns `None` for anything that is not a date key.
pub fn date_arithmetic(key: &str, at: DateTime<FixedOffset>) -> Option<String> {
    let caps = date_pattern().captures(key)?;
    let attr = caps.get(1)?.as_str();
    let delta: i64 = match caps.get(2) {
        Some(m) => m.as_str().parse().ok()?,
        None => 0,
    };

    // Offsets that leave chrono's range are not date keys; the renderer
    // then reports a missing key.
    match attr {
        "shortdate" => Some(add_days(at, delta)?.format("%Y-%m-%d").to_string()),
        "day" => Some(add_days(at, delta)?.format("%d").to_string()),
        "hour" => Some(
            at.checked_add_signed(TimeDelta::try_hours(delta)?)?
                .format("%H")
                .to_string(),
        ),
        "month" => Some(add_months(at, delta)?.format("%m").to_string()),
        "year" => Some(add_months(at, delta.checked_mul(12)?)?.format("%Y").to_string()),
        "unixtime" => Some(at.timestamp().checked_add(delta)?.to_string()),
        "daynumber" => Some(i64::from(at.num_days_from_ce()).checked_add(delta)?.to_string()),
        _ => None,
    }
}

fn add_days(at: DateTime<FixedOffset>, delta: i64) -> Option<DateTime<FixedOffset>> {
    at.checked_add_signed(TimeDelta::try_days(delta)?)
}

// Month arithmetic clamps to the last day of the target month.
fn add_months(at: DateTime<FixedOffset>, delta: i64) -> Option<DateTime<FixedOffset>> {
    let months = Months::new(u32::try_from(delta.unsigned_abs()).ok()?);
    if delta >= 0 {
        at.checked_add_months(months)
    } else {
        at.checked_sub_months(months)
    }
}

/// Root of every job's chain: `name` and `namespace`.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub name: String,
}

impl ContextSource for JobContext {
    fn lookup(&self, name: &str) -> Option<String> {
        match name {
            "name" => Some(self.name.clone()),
            "namespace" => self.name.split('.').next().map(str::to_string),
            _ => None,
        }
    }
}

/// Values that belong to one job run, plus date arithmetic on its
/// `run_time`.
#[derive(Debug, Clone)]
pub struct JobRunContext {
    pub run_id: String,
    pub run_time: DateTime<FixedOffset>,
    pub manual: bool,
    pub cleanup_job_status: String,
}

impl ContextSource for JobRunContext {
    fn lookup(&self, name: &str) -> Option<String> {
        match name {
            "runid" => Some(self.run_id.clone()),
            "manual" => Some(self.manual.to_string()),
            "cleanup_job_status" => Some(self.cleanup_job_status.clone()),
            other => date_arithmetic(other, self.run_time),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ActionRunContext {
    pub run_id: String,
    pub action_name: String,
    pub node: Option<String>,
}

impl ContextSource for ActionRunContext {
    fn lookup(&self, name: &str) -> Option<String> {
        match name {
            "runid" => Some(self.run_id.clone()),
            "actionname" => Some(self.action_name.clone()),
            "node" => self.node.clone(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServiceInstanceContext {
    pub instance_number: u32,
    pub node: String,
    pub name: String,
}

impl ContextSource for ServiceInstanceContext {
    fn lookup(&self, name: &str) -> Option<String> {
        match name {
            "instance_number" => Some(self.instance_number.to_string()),
            "node" => Some(self.node.clone()),
            "name" => Some(self.name.clone()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at() -> DateTime<FixedOffset> {
        FixedOffset::east_opt(0)
            .unwrap()
            .with_ymd_and_hms(2024, 3, 1, 10, 30, 0)
            .unwrap()
    }

    fn base() -> CommandContext {
        let mut vars = BTreeMap::new();
        vars.insert("ROOT".to_string(), "/srv".to_string());
        vars.insert("name".to_string(), "shadowed".to_string());
        CommandContext::new(vars)
    }

    #[test]
    fn renders_placeholders_and_escaped_percent() {
        let ctx = CommandContext::chained(JobContext { name: "etl.daily".into() }, &base());
        let out = render("%(ROOT)s/%(namespace)s/%(name)s 100%% done, 5% left", &ctx).unwrap();
        assert_eq!(out, "/srv/etl/etl.daily 100% done, 5% left");
    }

    #[test]
    fn missing_key_is_reported() {
        let err = render("run %(nope)s", &base()).unwrap_err();
        assert_eq!(err, RenderError::MissingKey("nope".into()));
    }

    #[test]
    fn most_specific_context_wins() {
        let job = CommandContext::chained(JobContext { name: "j".into() }, &base());
        let run = CommandContext::chained(
            JobRunContext {
                run_id: "j.4".into(),
                run_time: at(),
                manual: false,
                cleanup_job_status: "UNKNOWN".into(),
            },
            &job,
        );
        let action = CommandContext::chained(
            ActionRunContext {
                run_id: "j.4.fetch".into(),
                action_name: "fetch".into(),
                node: Some("batch1".into()),
            },
            &run,
        );
        assert_eq!(action.get("runid").as_deref(), Some("j.4.fetch"));
        assert_eq!(run.get("runid").as_deref(), Some("j.4"));
        assert_eq!(action.get("name").as_deref(), Some("j"));
        assert_eq!(action.get("shortdate").as_deref(), Some("2024-03-01"));
    }

    #[test]
    fn date_arithmetic_units_follow_the_key() {
        assert_eq!(date_arithmetic("shortdate-1", at()).as_deref(), Some("2024-02-29"));
        assert_eq!(date_arithmetic("day+1", at()).as_deref(), Some("02"));
        assert_eq!(date_arithmetic("hour-11", at()).as_deref(), Some("23"));
        assert_eq!(date_arithmetic("month+11", at()).as_deref(), Some("02"));
        assert_eq!(date_arithmetic("year-1", at()).as_deref(), Some("2023"));
        assert_eq!(date_arithmetic("unixtime", at()).as_deref(), Some("1709289000"));
        assert_eq!(date_arithmetic("unixtime+60", at()).as_deref(), Some("1709289060"));
        assert_eq!(date_arithmetic("daynumber", at()).as_deref(), Some("738946"));
        assert_eq!(date_arithmetic("weekday", at()), None);
        assert_eq!(date_arithmetic("shortdate+x", at()), None);
    }

    #[test]
    fn out_of_range_offsets_render_as_missing_keys() {
        assert_eq!(date_arithmetic("shortdate+99999999", at()), None);
        assert_eq!(date_arithmetic("hour-999999999999", at()), None);
        assert_eq!(date_arithmetic("unixtime+9223372036854775807", at()), None);

        let run = CommandContext::chained(
            JobRunContext {
                run_id: "j.1".into(),
                run_time: at(),
                manual: false,
                cleanup_job_status: "UNKNOWN".into(),
            },
            &base(),
        );
        let err = render("echo %(shortdate+99999999)s", &run).unwrap_err();
        assert_eq!(err, RenderError::MissingKey("shortdate+99999999".into()));
    }
}
