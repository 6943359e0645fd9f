//! Job data model and period handling.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Default retention period for a job (one day).
const DEFAULT_RETENTION_SECS: i64 = 86_400;

/// Job status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Waiting in a ready queue for dispatch.
    #[default]
    Ready,
    /// Handed to a worker, awaiting completion or timeout.
    Processing,
}

/// One unit of deferred or recurring work.
///
/// A job is identified by `(func, name)`; the store assigns the numeric id
/// on first save. All times are unix seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Primary key, assigned by the store. Zero means unsaved.
    #[serde(rename = "job_id", default)]
    pub id: i64,
    /// Unique within `func`. An empty name marks a tombstone.
    #[serde(default)]
    pub name: String,
    /// Routing key workers subscribe to.
    #[serde(default)]
    pub func: String,
    /// Opaque payload handed to the worker.
    #[serde(rename = "workload", default)]
    pub args: String,
    /// Processing timeout in seconds; zero means no deadline.
    #[serde(default)]
    pub timeout: i64,
    /// Earliest dispatch time.
    #[serde(default)]
    pub sched_at: i64,
    /// Wall time of the last dispatch; zero while ready.
    #[serde(default)]
    pub run_at: i64,
    /// Advisory retry budget, interpreted by workers.
    #[serde(default)]
    pub fail_retry: i64,
    /// Advisory retention period in seconds.
    #[serde(default)]
    pub retention: i64,
    /// Empty for one-shot jobs, else `every_<duration>` or a cron expression.
    #[serde(default)]
    pub period: String,
    /// Run counter, bumped by sched-later.
    #[serde(default)]
    pub counter: i64,
    /// Current status.
    #[serde(default)]
    pub status: Status,
    /// Parsed period, cached at construction.
    #[serde(skip)]
    time_con: Option<Period>,
}

impl Job {
    /// Parses a job from its JSON wire form and initialises derived fields.
    pub fn from_json(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut job: Self = serde_json::from_slice(payload)?;
        job.init()?;
        Ok(job)
    }

    /// Encodes the job to its JSON wire form.
    pub fn to_json(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Fills in defaults and caches the parsed period.
    ///
    /// Must be called after deserialising a job from any source.
    pub fn init(&mut self) -> Result<(), ProtocolError> {
        if self.retention == 0 {
            self.retention = DEFAULT_RETENTION_SECS;
        }
        self.time_con = if self.period.is_empty() {
            None
        } else {
            Some(self.period.parse()?)
        };
        Ok(())
    }

    /// Returns true if the job recurs.
    #[must_use]
    pub fn is_period(&self) -> bool {
        !self.period.is_empty()
    }

    /// Returns true if the job is waiting for dispatch.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.status == Status::Ready
    }

    /// Returns true if the job is in flight.
    #[must_use]
    pub fn is_processing(&self) -> bool {
        self.status == Status::Processing
    }

    /// Marks the job ready.
    pub fn set_ready(&mut self) {
        self.status = Status::Ready;
    }

    /// Marks the job processing.
    pub fn set_processing(&mut self) {
        self.status = Status::Processing;
    }

    /// Deadline after which an in-flight job is reverted to ready.
    ///
    /// Only meaningful when `timeout > 0`.
    #[must_use]
    pub fn deadline(&self) -> i64 {
        self.run_at.max(self.sched_at) + self.timeout
    }

    /// Advances `sched_at` to the next occurrence of the period.
    ///
    /// A `sched_at` already in the future is left unchanged, which makes the
    /// operation idempotent between occurrences.
    pub fn reset_period(&mut self, now: i64) {
        let Some(period) = &self.time_con else {
            return;
        };
        if self.sched_at > now {
            return;
        }
        let base = self.sched_at.max(now);
        self.sched_at = period.next_after(base).unwrap_or(base);
    }
}

/// A parsed job period: fixed interval or cron expression.
#[derive(Debug, Clone)]
pub enum Period {
    /// Fixed interval in seconds, from `every_<duration>`.
    Every(i64),
    /// Cron expression.
    Cron(Box<Schedule>),
}

impl Period {
    /// Returns the first occurrence strictly after `ts` (unix seconds).
    #[must_use]
    pub fn next_after(&self, ts: i64) -> Option<i64> {
        match self {
            Self::Every(secs) => Some(ts + secs),
            Self::Cron(schedule) => {
                let base = DateTime::<Utc>::from_timestamp(ts, 0)?;
                schedule.after(&base).next().map(|dt| dt.timestamp())
            }
        }
    }
}

impl FromStr for Period {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(rest) = s.strip_prefix("every_") {
            return Ok(Self::Every(parse_duration_secs(rest.trim())?));
        }
        parse_cron(s).map(|schedule| Self::Cron(Box::new(schedule)))
    }
}

/// Parses a cron expression, accepting both the 6/7-field form and the
/// classic 5-field form (which gets a zero seconds field prepended).
fn parse_cron(expr: &str) -> Result<Schedule, ProtocolError> {
    match Schedule::from_str(expr) {
        Ok(schedule) => Ok(schedule),
        Err(e) => {
            if expr.split_whitespace().count() == 5 {
                let with_seconds = format!("0 {expr}");
                if let Ok(schedule) = Schedule::from_str(&with_seconds) {
                    return Ok(schedule);
                }
            }
            Err(ProtocolError::InvalidPeriod(format!("{expr}: {e}")))
        }
    }
}

/// Parses a duration string like `90`, `30s`, `5m`, `2h`, `1d` or `1h30m`
/// into seconds.
pub fn parse_duration_secs(s: &str) -> Result<i64, ProtocolError> {
    if s.is_empty() {
        return Err(ProtocolError::InvalidPeriod("empty duration".to_owned()));
    }

    let mut total: i64 = 0;
    let mut digits = String::new();
    let mut saw_unit = false;

    for ch in s.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            continue;
        }
        let scale = match ch {
            's' => 1,
            'm' => 60,
            'h' => 3_600,
            'd' => 86_400,
            other => {
                return Err(ProtocolError::InvalidPeriod(format!(
                    "unknown duration unit '{other}' in {s}"
                )))
            }
        };
        if digits.is_empty() {
            return Err(ProtocolError::InvalidPeriod(format!(
                "missing value before '{ch}' in {s}"
            )));
        }
        let value: i64 = digits
            .parse()
            .map_err(|_| ProtocolError::InvalidPeriod(s.to_owned()))?;
        total += value * scale;
        digits.clear();
        saw_unit = true;
    }

    // Bare trailing digits count as seconds.
    if !digits.is_empty() {
        let value: i64 = digits
            .parse()
            .map_err(|_| ProtocolError::InvalidPeriod(s.to_owned()))?;
        total += value;
    } else if !saw_unit {
        return Err(ProtocolError::InvalidPeriod(s.to_owned()));
    }

    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_job(name: &str, func: &str) -> Job {
        let mut job = Job {
            id: 0,
            name: name.to_owned(),
            func: func.to_owned(),
            args: String::new(),
            timeout: 0,
            sched_at: 0,
            run_at: 0,
            fail_retry: 0,
            retention: 0,
            period: String::new(),
            counter: 0,
            status: Status::Ready,
            time_con: None,
        };
        job.init().unwrap();
        job
    }

    #[test]
    fn json_field_names() {
        let mut job = make_job("backup", "disk");
        job.id = 9;
        job.args = "payload".to_owned();
        let json: serde_json::Value =
            serde_json::from_slice(&job.to_json().unwrap()).unwrap();
        assert_eq!(json["job_id"], 9);
        assert_eq!(json["name"], "backup");
        assert_eq!(json["func"], "disk");
        assert_eq!(json["workload"], "payload");
        assert_eq!(json["status"], "ready");
    }

    #[test]
    fn from_json_defaults() {
        let job = Job::from_json(br#"{"name":"n","func":"f"}"#).unwrap();
        assert_eq!(job.retention, DEFAULT_RETENTION_SECS);
        assert!(job.is_ready());
        assert!(!job.is_period());
    }

    #[test]
    fn from_json_rejects_bad_period() {
        let err = Job::from_json(br#"{"name":"n","func":"f","period":"every_xyz"}"#)
            .unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidPeriod(_)));
    }

    #[test]
    fn duration_parsing() {
        assert_eq!(parse_duration_secs("90").unwrap(), 90);
        assert_eq!(parse_duration_secs("30s").unwrap(), 30);
        assert_eq!(parse_duration_secs("5m").unwrap(), 300);
        assert_eq!(parse_duration_secs("2h").unwrap(), 7_200);
        assert_eq!(parse_duration_secs("1d").unwrap(), 86_400);
        assert_eq!(parse_duration_secs("1h30m").unwrap(), 5_400);
        assert!(parse_duration_secs("").is_err());
        assert!(parse_duration_secs("h").is_err());
        assert!(parse_duration_secs("5w").is_err());
    }

    #[test]
    fn interval_period_advances_from_base() {
        let mut job = make_job("tick", "clock");
        job.period = "every_2s".to_owned();
        job.init().unwrap();

        let now = 1_000;
        job.sched_at = 998;
        job.reset_period(now);
        assert_eq!(job.sched_at, 1_002);
    }

    #[test]
    fn reset_period_idempotent_when_in_future() {
        let mut job = make_job("tick", "clock");
        job.period = "every_10s".to_owned();
        job.init().unwrap();

        let now = 1_000;
        job.sched_at = now;
        job.reset_period(now);
        let first = job.sched_at;
        assert_eq!(first, 1_010);

        // Second application with no time passage must not advance again.
        job.reset_period(now);
        assert_eq!(job.sched_at, first);
    }

    #[test]
    fn cron_period_five_fields_accepted() {
        let period: Period = "*/5 * * * *".parse().unwrap();
        let next = period.next_after(0).unwrap();
        assert!(next > 0);
        assert_eq!(next % 300, 0);
    }

    #[test]
    fn cron_period_next_is_strictly_after() {
        let period: Period = "0 * * * * *".parse().unwrap();
        // 1970-01-01 00:01:00
        let next = period.next_after(60).unwrap();
        assert_eq!(next, 120);
    }

    #[test]
    fn one_shot_reset_period_is_noop() {
        let mut job = make_job("once", "f");
        job.sched_at = 5;
        job.reset_period(100);
        assert_eq!(job.sched_at, 5);
    }

    #[test]
    fn deadline_uses_later_of_run_and_sched() {
        let mut job = make_job("n", "f");
        job.timeout = 10;
        job.sched_at = 100;
        job.run_at = 90;
        assert_eq!(job.deadline(), 110);
        job.run_at = 150;
        assert_eq!(job.deadline(), 160);
    }
}
