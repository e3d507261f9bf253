use chrono::{DateTime, TimeZone, Utc};

use super::{datetime_from_epoch, Trigger, TriggerKind};
use crate::error::Result;

/// When a one-time job should run: raw epoch seconds or a calendar value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RunAt {
    Epoch(f64),
    Calendar(DateTime<Utc>),
}

impl From<f64> for RunAt {
    fn from(secs: f64) -> Self {
        RunAt::Epoch(secs)
    }
}

impl<Tz: TimeZone> From<DateTime<Tz>> for RunAt {
    fn from(at: DateTime<Tz>) -> Self {
        RunAt::Calendar(at.with_timezone(&Utc))
    }
}

impl RunAt {
    fn resolve(self) -> Result<DateTime<Utc>> {
        match self {
            RunAt::Epoch(secs) => datetime_from_epoch(secs),
            RunAt::Calendar(at) => Ok(at),
        }
    }
}

/// Fires exactly once. A run time already in the past fires immediately.
#[derive(Debug, Clone)]
pub struct OneTimeTrigger {
    run_at: DateTime<Utc>,
    fired: bool,
}

impl OneTimeTrigger {
    pub fn new(run_at: impl Into<RunAt>) -> Result<Self> {
        Ok(Self {
            run_at: run_at.into().resolve()?,
            fired: false,
        })
    }

    pub fn run_at(&self) -> DateTime<Utc> {
        self.run_at
    }
}

impl Trigger for OneTimeTrigger {
    fn kind(&self) -> TriggerKind {
        TriggerKind::OneTime
    }

    fn next_due(&self, _after: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
        (!self.fired).then_some(self.run_at)
    }

    fn mark_fired(&mut self, _at: DateTime<Utc>) {
        self.fired = true;
    }

    fn is_exhausted(&self) -> bool {
        self.fired
    }
}
