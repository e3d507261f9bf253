use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use futures_util::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::OverlapPolicy;
use crate::error::{Result, SchedulerError};
use crate::executor::Invocation;
use crate::trigger::{epoch_secs, Trigger, TriggerKind};

/// Error type returned by job callables.
pub type JobError = Box<dyn std::error::Error + Send + Sync>;
pub type JobResult = std::result::Result<(), JobError>;

type BlockingFn = dyn Fn(&JobArgs) -> JobResult + Send + Sync;
type AsyncFn = dyn Fn(JobArgs) -> BoxFuture<'static, JobResult> + Send + Sync;

/// The unit of work a job runs on every fire. The engine never looks inside it.
#[derive(Clone)]
pub enum JobFn {
    /// Runs on tokio's blocking pool.
    Blocking(Arc<BlockingFn>),
    /// Runs as its own tokio task.
    Async(Arc<AsyncFn>),
}

impl JobFn {
    pub fn blocking<F>(f: F) -> Self
    where
        F: Fn(&JobArgs) -> JobResult + Send + Sync + 'static,
    {
        JobFn::Blocking(Arc::new(f))
    }

    pub fn from_async<F, Fut>(f: F) -> Self
    where
        F: Fn(JobArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = JobResult> + Send + 'static,
    {
        JobFn::Async(Arc::new(move |args| f(args).boxed()))
    }
}

impl std::fmt::Debug for JobFn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobFn::Blocking(_) => f.write_str("JobFn::Blocking"),
            JobFn::Async(_) => f.write_str("JobFn::Async"),
        }
    }
}

/// Arguments bound to a job at registration and passed to every invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobArgs {
    #[serde(default)]
    pub positional: Vec<Value>,
    #[serde(default)]
    pub keyword: Map<String, Value>,
}

impl JobArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.positional.push(value.into());
        self
    }

    pub fn kwarg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.keyword.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.positional.get(index)
    }

    pub fn get_kw(&self, key: &str) -> Option<&Value> {
        self.keyword.get(key)
    }
}

/// Lifecycle state of a registered job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Eligible for dispatch, including between fires.
    Running,
    /// Dispatch suspended; the cached next run time is frozen.
    Paused,
    /// Trigger exhausted. Kept in the registry until removed.
    Completed,
    /// Terminal. Only ever seen on the snapshot returned by `remove_job`.
    Removed,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Running => "running",
            JobStatus::Paused => "paused",
            JobStatus::Completed => "completed",
            JobStatus::Removed => "removed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "running" => Ok(JobStatus::Running),
            "paused" => Ok(JobStatus::Paused),
            "completed" => Ok(JobStatus::Completed),
            "removed" => Ok(JobStatus::Removed),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// Point-in-time view of a job, taken under the registry lock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub job_id: String,
    pub status: JobStatus,
    pub trigger_type: TriggerKind,
    pub execution_count: u64,
    /// Active milliseconds since the job was registered, excluding time
    /// spent paused.
    pub elapsed_time_ms: u64,
    /// Epoch seconds of the next due time, if any.
    pub next_run_time: Option<f64>,
    /// Epoch seconds of the most recent dispatch, if any.
    pub last_run_time: Option<f64>,
    /// Total milliseconds spent paused, including an ongoing pause.
    pub paused_time_ms: u64,
    pub is_finished: bool,
}

/// A registered job: identity, trigger, payload and mutable execution state.
///
/// Every mutation happens under the scheduler's registry lock.
#[derive(Debug)]
pub(crate) struct Job {
    id: String,
    /// Registration sequence number: orders listings and tells a re-added job
    /// apart from a removed one with the same ID.
    seq: u64,
    trigger: Box<dyn Trigger>,
    callable: JobFn,
    args: Arc<JobArgs>,
    status: JobStatus,
    execution_count: u64,
    created_at: DateTime<Utc>,
    last_run: Option<DateTime<Utc>>,
    next_run: Option<DateTime<Utc>>,
    paused_at: Option<DateTime<Utc>>,
    paused_total: Duration,
    in_flight: u32,
}

impl Job {
    pub(crate) fn new(
        id: String,
        seq: u64,
        mut trigger: Box<dyn Trigger>,
        callable: JobFn,
        args: JobArgs,
        now: DateTime<Utc>,
    ) -> Self {
        trigger.activate(now);
        let next_run = trigger.next_due(Some(now));
        // A trigger with nothing left to fire is complete from the start.
        let status = if next_run.is_some() {
            JobStatus::Running
        } else {
            JobStatus::Completed
        };

        Self {
            id,
            seq,
            trigger,
            callable,
            args: Arc::new(args),
            status,
            execution_count: 0,
            created_at: now,
            last_run: None,
            next_run,
            paused_at: None,
            paused_total: Duration::zero(),
            in_flight: 0,
        }
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn seq(&self) -> u64 {
        self.seq
    }

    pub(crate) fn status(&self) -> JobStatus {
        self.status
    }

    pub(crate) fn next_run(&self) -> Option<DateTime<Utc>> {
        self.next_run
    }

    pub(crate) fn trigger_kind(&self) -> TriggerKind {
        self.trigger.kind()
    }

    pub(crate) fn pause(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.status != JobStatus::Running {
            return Err(self.invalid("pause"));
        }
        self.status = JobStatus::Paused;
        self.paused_at = Some(now);
        Ok(())
    }

    /// Resume from PAUSED. The next due time is recomputed from `now`, never
    /// from the frozen value.
    pub(crate) fn resume(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.status != JobStatus::Paused {
            return Err(self.invalid("resume"));
        }
        let paused_for = self
            .paused_at
            .take()
            .map_or_else(Duration::zero, |at| (now - at).max(Duration::zero()));
        self.paused_total += paused_for;

        self.trigger.on_resume(now, paused_for);
        self.next_run = self.trigger.next_due(Some(now));
        self.status = if self.next_run.is_some() {
            JobStatus::Running
        } else {
            JobStatus::Completed
        };
        Ok(())
    }

    pub(crate) fn mark_removed(&mut self) {
        self.status = JobStatus::Removed;
    }

    /// When the dispatch loop next needs to look at this job, if ever.
    pub(crate) fn wake_at(&self, overlap: OverlapPolicy) -> Option<DateTime<Utc>> {
        if self.status != JobStatus::Running {
            return None;
        }
        if overlap == OverlapPolicy::Serialize && self.in_flight > 0 {
            // Re-evaluated when the running invocation reports back.
            return None;
        }
        self.next_run
    }

    pub(crate) fn is_due(&self, now: DateTime<Utc>, overlap: OverlapPolicy) -> bool {
        self.wake_at(overlap).is_some_and(|at| at <= now)
    }

    /// Claim the due occurrence: count it, advance the trigger and hand back
    /// the invocation to execute. The next due time is recomputed from `now`
    /// so an overdue job fires once and then resumes its normal cadence.
    pub(crate) fn claim(&mut self, now: DateTime<Utc>) -> Invocation {
        self.execution_count += 1;
        self.last_run = Some(now);
        self.in_flight += 1;

        self.trigger.mark_fired(now);
        self.next_run = if self.trigger.is_exhausted() {
            None
        } else {
            self.trigger.next_due(Some(now))
        };
        if self.next_run.is_none() {
            self.status = JobStatus::Completed;
        }

        Invocation {
            job_id: self.id.clone(),
            seq: self.seq,
            run: self.execution_count,
            callable: self.callable.clone(),
            args: Arc::clone(&self.args),
        }
    }

    pub(crate) fn finish_invocation(&mut self) {
        self.in_flight = self.in_flight.saturating_sub(1);
    }

    pub(crate) fn snapshot(&self, now: DateTime<Utc>) -> JobSnapshot {
        let ongoing_pause = self
            .paused_at
            .map_or_else(Duration::zero, |at| (now - at).max(Duration::zero()));
        let paused = self.paused_total + ongoing_pause;

        JobSnapshot {
            job_id: self.id.clone(),
            status: self.status,
            trigger_type: self.trigger.kind(),
            execution_count: self.execution_count,
            elapsed_time_ms: non_negative_ms(now - self.created_at - paused),
            next_run_time: self.next_run.map(epoch_secs),
            last_run_time: self.last_run.map(epoch_secs),
            paused_time_ms: non_negative_ms(paused),
            is_finished: self.status == JobStatus::Completed,
        }
    }

    fn invalid(&self, action: &'static str) -> SchedulerError {
        SchedulerError::InvalidTransition {
            id: self.id.clone(),
            from: self.status,
            action,
        }
    }
}

fn non_negative_ms(d: Duration) -> u64 {
    u64::try_from(d.num_milliseconds()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trigger::{IntervalTrigger, OneTimeTrigger, TimestampTrigger};
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap()
    }

    fn noop() -> JobFn {
        JobFn::blocking(|_| Ok(()))
    }

    fn interval_job(period: f64, max_runs: Option<u32>) -> Job {
        let trigger = IntervalTrigger::new(period, max_runs, None).unwrap();
        Job::new("job".into(), 1, Box::new(trigger), noop(), JobArgs::new(), t0())
    }

    #[test]
    fn new_job_is_running_with_first_due_time() {
        let job = interval_job(2.0, None);
        assert_eq!(job.status(), JobStatus::Running);
        assert_eq!(job.next_run(), Some(t0() + Duration::seconds(2)));
        assert!(!job.is_due(t0(), OverlapPolicy::Allow));
        assert!(job.is_due(t0() + Duration::seconds(2), OverlapPolicy::Allow));
    }

    #[test]
    fn pause_and_resume_transitions() {
        let mut job = interval_job(1.0, None);

        assert!(job.resume(t0()).is_err());
        job.pause(t0()).unwrap();
        assert_eq!(job.status(), JobStatus::Paused);
        let err = job.pause(t0()).unwrap_err();
        assert_eq!(err.code(), "INVALID_TRANSITION");
        assert!(!job.is_due(t0() + Duration::seconds(5), OverlapPolicy::Allow));

        // Frozen while paused.
        let frozen = job.next_run();
        assert_eq!(frozen, Some(t0() + Duration::seconds(1)));

        let resumed_at = t0() + Duration::milliseconds(7_300);
        job.resume(resumed_at).unwrap();
        assert_eq!(job.status(), JobStatus::Running);
        let next = job.next_run().unwrap();
        assert!(next > resumed_at);
        assert!(next <= resumed_at + Duration::seconds(1));
        assert_eq!(job.snapshot(resumed_at).paused_time_ms, 7_300);
    }

    #[test]
    fn elapsed_time_excludes_paused_time() {
        let mut job = interval_job(1.0, None);
        job.pause(t0() + Duration::seconds(2)).unwrap();

        // An ongoing pause is not counted either.
        let paused = job.snapshot(t0() + Duration::seconds(5));
        assert_eq!(paused.elapsed_time_ms, 2_000);
        assert_eq!(paused.paused_time_ms, 3_000);

        job.resume(t0() + Duration::seconds(6)).unwrap();
        let snap = job.snapshot(t0() + Duration::seconds(10));
        assert_eq!(snap.elapsed_time_ms, 6_000);
        assert_eq!(snap.paused_time_ms, 4_000);
    }

    #[test]
    fn claim_counts_and_completes_on_exhaustion() {
        let mut job = interval_job(1.0, Some(2));

        let first = job.claim(t0() + Duration::seconds(1));
        assert_eq!(first.run, 1);
        assert_eq!(job.status(), JobStatus::Running);
        assert_eq!(job.next_run(), Some(t0() + Duration::seconds(2)));

        let second = job.claim(t0() + Duration::seconds(2));
        assert_eq!(second.run, 2);
        assert_eq!(job.status(), JobStatus::Completed);
        assert_eq!(job.next_run(), None);

        let snap = job.snapshot(t0() + Duration::seconds(3));
        assert!(snap.is_finished);
        assert_eq!(snap.execution_count, 2);
        assert_eq!(snap.elapsed_time_ms, 3_000);
        assert!(job.pause(t0()).is_err());
    }

    #[test]
    fn overdue_claim_does_not_catch_up() {
        let mut job = interval_job(1.0, None);
        let late = t0() + Duration::milliseconds(5_500);
        assert!(job.is_due(late, OverlapPolicy::Allow));
        job.claim(late);
        assert_eq!(job.next_run(), Some(t0() + Duration::seconds(6)));
        assert!(!job.is_due(late, OverlapPolicy::Allow));
    }

    #[test]
    fn serialize_policy_holds_back_while_in_flight() {
        let trigger = TimestampTrigger::new(vec![0, 10]).unwrap();
        let mut job = Job::new("ts".into(), 1, Box::new(trigger), noop(), JobArgs::new(), t0());
        let later = t0() + Duration::seconds(1);

        job.claim(t0());
        assert!(job.is_due(later, OverlapPolicy::Allow));
        assert!(!job.is_due(later, OverlapPolicy::Serialize));

        job.finish_invocation();
        assert!(job.is_due(later, OverlapPolicy::Serialize));
    }

    #[test]
    fn exhausted_trigger_registers_as_completed() {
        let mut trigger = OneTimeTrigger::new(t0()).unwrap();
        trigger.mark_fired(t0());
        let job = Job::new("done".into(), 1, Box::new(trigger), noop(), JobArgs::new(), t0());
        assert_eq!(job.status(), JobStatus::Completed);
        assert!(job.snapshot(t0()).is_finished);
    }

    #[test]
    fn status_strings_round_trip() {
        for status in [JobStatus::Running, JobStatus::Paused, JobStatus::Completed, JobStatus::Removed] {
            assert_eq!(status.to_string().parse::<JobStatus>().unwrap(), status);
        }
    }

    #[test]
    fn args_builder_binds_positional_and_keyword_values() {
        let args = JobArgs::new().arg("hello").arg(3).kwarg("job_id", "x");
        assert_eq!(args.get(0), Some(&Value::from("hello")));
        assert_eq!(args.get(1), Some(&Value::from(3)));
        assert_eq!(args.get_kw("job_id"), Some(&Value::from("x")));
        assert_eq!(args.get_kw("missing"), None);
    }
}
