//! Trigger strategies: each one answers "when is this job due next?".
//!
//! A trigger is owned by exactly one job. The engine drives it through a small
//! capability set:
//!
//! 1. [`Trigger::activate`] once, when the job enters the registry.
//! 2. [`Trigger::next_due`] whenever the cached next run time must be
//!    recomputed. This is a pure query over trigger state.
//! 3. [`Trigger::mark_fired`] each time the dispatch loop claims a due
//!    occurrence.
//! 4. [`Trigger::on_resume`] when a paused job is resumed.
//!
//! New trigger kinds plug in by implementing the trait. The engine never
//! inspects concrete types.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SchedulerError};

pub mod cron;
pub mod interval;
pub mod one_time;
pub mod timestamp;

pub use self::cron::{CronEvaluator, CronSchedule, CronTrigger};
pub use interval::IntervalTrigger;
pub use one_time::{OneTimeTrigger, RunAt};
pub use timestamp::TimestampTrigger;

/// Reported in status snapshots as `trigger_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Timestamp,
    Interval,
    OneTime,
    Cron,
    /// Any caller-supplied trigger implementation.
    Custom,
}

impl std::fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TriggerKind::Timestamp => "timestamp",
            TriggerKind::Interval => "interval",
            TriggerKind::OneTime => "one_time",
            TriggerKind::Cron => "cron",
            TriggerKind::Custom => "custom",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for TriggerKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "timestamp" => Ok(TriggerKind::Timestamp),
            "interval" => Ok(TriggerKind::Interval),
            "one_time" => Ok(TriggerKind::OneTime),
            "cron" => Ok(TriggerKind::Cron),
            "custom" => Ok(TriggerKind::Custom),
            other => Err(format!("unknown trigger type: {other}")),
        }
    }
}

/// Computes due times for a single job.
///
/// Implementations must keep `next_due` monotonic: for non-decreasing `after`
/// values, with no `mark_fired` in between, the returned instant never moves
/// backwards. Once `next_due` returns `None` it must keep returning `None`.
pub trait Trigger: Send + std::fmt::Debug {
    fn kind(&self) -> TriggerKind;

    /// Called once when the owning job is registered. Triggers whose times are
    /// relative to registration anchor themselves here.
    fn activate(&mut self, _now: DateTime<Utc>) {}

    /// Next due instant given the reference time `after` (`None` = now), or
    /// `None` when the trigger is exhausted.
    ///
    /// The result may lie in the past. The dispatch loop then fires it once
    /// and recomputes from the current time.
    fn next_due(&self, after: Option<DateTime<Utc>>) -> Option<DateTime<Utc>>;

    /// Record that the occurrence returned by `next_due` was dispatched at `at`.
    fn mark_fired(&mut self, at: DateTime<Utc>);

    /// True once no further occurrence can be produced.
    fn is_exhausted(&self) -> bool;

    /// Called when a paused job resumes after having been paused for `paused_for`.
    fn on_resume(&mut self, _now: DateTime<Utc>, _paused_for: Duration) {}
}

/// Convert floating-point epoch seconds into a UTC instant (microsecond precision).
pub(crate) fn datetime_from_epoch(secs: f64) -> Result<DateTime<Utc>> {
    if !secs.is_finite() {
        return Err(SchedulerError::InvalidTrigger(format!(
            "epoch seconds must be finite, got {secs}"
        )));
    }
    DateTime::from_timestamp_micros((secs * 1_000_000.0).round() as i64).ok_or_else(|| {
        SchedulerError::InvalidTrigger(format!("epoch seconds out of range: {secs}"))
    })
}

/// Epoch seconds as reported in status snapshots.
pub(crate) fn epoch_secs(at: DateTime<Utc>) -> f64 {
    at.timestamp_micros() as f64 / 1_000_000.0
}

pub(crate) fn validate_max_runs(max_runs: Option<u32>) -> Result<()> {
    if max_runs == Some(0) {
        return Err(SchedulerError::InvalidTrigger(
            "max_runs must be at least 1".to_string(),
        ));
    }
    Ok(())
}
