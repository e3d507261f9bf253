use chrono::{DateTime, Duration, Utc};

use super::{Trigger, TriggerKind};
use crate::error::{Result, SchedulerError};

/// Fires once per entry of an explicit list of millisecond offsets.
///
/// Offsets are measured from the job's activation and count active time only:
/// resuming after a pause shifts the epoch forward by the paused duration.
/// Every entry fires exactly once, in ascending order, even when the
/// dispatch loop observes it late.
#[derive(Debug, Clone)]
pub struct TimestampTrigger {
    offsets_ms: Vec<u64>,
    cursor: usize,
    epoch: Option<DateTime<Utc>>,
}

impl TimestampTrigger {
    pub fn new(mut offsets_ms: Vec<u64>) -> Result<Self> {
        if offsets_ms.is_empty() {
            return Err(SchedulerError::InvalidTrigger(
                "timestamp list must not be empty".to_string(),
            ));
        }
        if offsets_ms.iter().any(|&ms| ms > i64::MAX as u64) {
            return Err(SchedulerError::InvalidTrigger(
                "timestamp offset out of range".to_string(),
            ));
        }
        offsets_ms.sort_unstable();
        Ok(Self {
            offsets_ms,
            cursor: 0,
            epoch: None,
        })
    }
}

impl Trigger for TimestampTrigger {
    fn kind(&self) -> TriggerKind {
        TriggerKind::Timestamp
    }

    fn activate(&mut self, now: DateTime<Utc>) {
        self.epoch.get_or_insert(now);
    }

    fn next_due(&self, after: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
        let offset = *self.offsets_ms.get(self.cursor)?;
        // Not yet activated: treat the reference time as the epoch.
        let epoch = self.epoch.or(after).unwrap_or_else(Utc::now);
        epoch.checked_add_signed(Duration::try_milliseconds(offset as i64)?)
    }

    fn mark_fired(&mut self, _at: DateTime<Utc>) {
        if self.cursor < self.offsets_ms.len() {
            self.cursor += 1;
        }
    }

    fn is_exhausted(&self) -> bool {
        self.cursor >= self.offsets_ms.len()
    }

    fn on_resume(&mut self, _now: DateTime<Utc>, paused_for: Duration) {
        if let Some(epoch) = self.epoch {
            let shifted = epoch.checked_add_signed(paused_for);
            self.epoch = Some(shifted.unwrap_or(DateTime::<Utc>::MAX_UTC));
        }
    }
}
