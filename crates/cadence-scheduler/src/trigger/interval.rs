use chrono::{DateTime, Duration, Utc};

use super::{datetime_from_epoch, validate_max_runs, Trigger, TriggerKind};
use crate::error::{Result, SchedulerError};

/// Fires on a fixed grid `start + n * period`.
///
/// Without an explicit start the grid is anchored at registration, so the
/// first fire happens one period later. An explicit future start fires at
/// `start` itself. Missed grid points are never replayed: `next_due` always
/// answers with the first grid point strictly after the reference time.
#[derive(Debug, Clone)]
pub struct IntervalTrigger {
    period: Duration,
    max_runs: Option<u32>,
    start: Option<DateTime<Utc>>,
    run_count: u32,
}

impl IntervalTrigger {
    pub fn new(period_secs: f64, max_runs: Option<u32>, start: Option<f64>) -> Result<Self> {
        if !period_secs.is_finite() || period_secs <= 0.0 {
            return Err(SchedulerError::InvalidTrigger(format!(
                "interval must be a positive number of seconds, got {period_secs}"
            )));
        }
        let micros = (period_secs * 1_000_000.0).round();
        if micros < 1.0 || micros > i64::MAX as f64 {
            return Err(SchedulerError::InvalidTrigger(format!(
                "interval out of range: {period_secs}s"
            )));
        }
        validate_max_runs(max_runs)?;
        let start = start.map(datetime_from_epoch).transpose()?;

        Ok(Self {
            period: Duration::microseconds(micros as i64),
            max_runs,
            start,
            run_count: 0,
        })
    }
}

impl Trigger for IntervalTrigger {
    fn kind(&self) -> TriggerKind {
        TriggerKind::Interval
    }

    fn activate(&mut self, now: DateTime<Utc>) {
        self.start.get_or_insert(now);
    }

    fn next_due(&self, after: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
        if self.is_exhausted() {
            return None;
        }
        let after = after.unwrap_or_else(Utc::now);
        let start = self.start.unwrap_or(after);
        if start > after {
            return Some(start);
        }

        // Smallest n with start + n*period > after. A grid point beyond the
        // representable date range means the trigger has nothing left to fire.
        let period_us = self.period.num_microseconds()?;
        let elapsed_us = (after - start).num_microseconds()?;
        let n = elapsed_us / period_us + 1;
        start.checked_add_signed(Duration::microseconds(n.checked_mul(period_us)?))
    }

    fn mark_fired(&mut self, _at: DateTime<Utc>) {
        self.run_count = self.run_count.saturating_add(1);
    }

    fn is_exhausted(&self) -> bool {
        self.max_runs.is_some_and(|max| self.run_count >= max)
    }
}
