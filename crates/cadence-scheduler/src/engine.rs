use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::{
    config::{OverlapPolicy, SchedulerConfig},
    error::{Result, SchedulerError},
    executor::{self, Invocation, JobFailure},
    job::{Job, JobArgs, JobFn, JobSnapshot, JobStatus},
    trigger::{CronTrigger, IntervalTrigger, OneTimeTrigger, RunAt, TimestampTrigger, Trigger},
};

/// Job table guarded by the scheduler's single lock.
#[derive(Debug, Default)]
struct Registry {
    jobs: HashMap<String, Job>,
    next_seq: u64,
    /// Set once `shutdown()` starts; rejects further registrations.
    closed: bool,
}

impl Registry {
    fn ordered(&self) -> Vec<&Job> {
        let mut jobs: Vec<&Job> = self.jobs.values().collect();
        jobs.sort_by_key(|job| job.seq());
        jobs
    }
}

struct Inner {
    config: SchedulerConfig,
    registry: Mutex<Registry>,
    /// Wakes the dispatch loop after any mutation that can move the earliest
    /// due time.
    wake: Arc<Notify>,
    shutdown_tx: watch::Sender<bool>,
    shut_down: AtomicBool,
    tracker: TaskTracker,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    failure_tx: Option<mpsc::Sender<JobFailure>>,
}

impl Inner {
    /// Poisoning is recovered: every critical section leaves the registry
    /// consistent, so a panicking holder cannot corrupt it.
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim every due job in one critical section and report when the loop
    /// next needs to look.
    fn collect_due(&self, now: DateTime<Utc>) -> (Vec<Invocation>, Option<DateTime<Utc>>) {
        let overlap = self.config.overlap;
        let mut reg = self.registry();

        let mut batch = Vec::new();
        for job in reg.jobs.values_mut() {
            if !job.is_due(now, overlap) {
                continue;
            }
            let invocation = job.claim(now);
            debug!(
                job_id = %invocation.job_id,
                run = invocation.run,
                trigger = %job.trigger_kind(),
                next_run = ?job.next_run(),
                "job dispatched"
            );
            if job.status() == JobStatus::Completed {
                info!(job_id = %job.id(), runs = invocation.run, "job completed");
            }
            batch.push(invocation);
        }

        let next_wake = reg.jobs.values().filter_map(|job| job.wake_at(overlap)).min();
        (batch, next_wake)
    }

    /// Called by the executor once an invocation has finished.
    fn finish(&self, invocation: Invocation, outcome: std::result::Result<(), String>) {
        if let Err(error) = outcome {
            executor::report_failure(self.failure_tx.as_ref(), &invocation, error);
        } else {
            debug!(job_id = %invocation.job_id, run = invocation.run, "job execution finished");
        }

        let mut reg = self.registry();
        // The job may have been removed, or removed and re-added, meanwhile.
        if let Some(job) = reg.jobs.get_mut(&invocation.job_id) {
            if job.seq() == invocation.seq {
                job.finish_invocation();
            }
        }
        drop(reg);

        if self.config.overlap == OverlapPolicy::Serialize {
            self.wake.notify_one();
        }
    }
}

/// In-process job scheduler.
///
/// Cloning is cheap and every clone drives the same engine. Control operations
/// are synchronous, take the registry lock briefly and may be called from any
/// thread. The dispatch loop and the executor run as tokio tasks on the runtime
/// that created the scheduler.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.inner.config)
            .field("shut_down", &self.is_shut_down())
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Start a scheduler on the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime, like `tokio::spawn`.
    pub fn new(config: SchedulerConfig) -> Self {
        Self::start(config, None)
    }

    /// Start a scheduler whose callable failures are also reported on the
    /// returned channel. Reports are dropped (with a warning) when the
    /// channel is full.
    pub fn with_failure_observer(config: SchedulerConfig) -> (Self, mpsc::Receiver<JobFailure>) {
        let (tx, rx) = mpsc::channel(config.failure_channel_capacity.max(1));
        (Self::start(config, Some(tx)), rx)
    }

    fn start(config: SchedulerConfig, failure_tx: Option<mpsc::Sender<JobFailure>>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (work_tx, work_rx) = mpsc::unbounded_channel();
        let wake = Arc::new(Notify::new());
        let max_sleep = config.max_sleep();

        let inner = Arc::new(Inner {
            config,
            registry: Mutex::new(Registry::default()),
            wake: Arc::clone(&wake),
            shutdown_tx,
            shut_down: AtomicBool::new(false),
            tracker: TaskTracker::new(),
            tasks: Mutex::new(Vec::new()),
            failure_tx,
        });

        // Background tasks hold weak references so dropping every Scheduler
        // handle also stops the engine.
        let weak = Arc::downgrade(&inner);
        let on_done = move |invocation: Invocation, outcome: std::result::Result<(), String>| {
            if let Some(inner) = weak.upgrade() {
                inner.finish(invocation, outcome);
            }
        };
        let executor = tokio::spawn(executor::run_executor(
            work_rx,
            inner.tracker.clone(),
            on_done,
        ));
        let dispatcher = tokio::spawn(run_dispatch_loop(
            Arc::downgrade(&inner),
            wake,
            shutdown_rx,
            work_tx,
            max_sleep,
        ));
        inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend([dispatcher, executor]);

        info!(overlap = ?inner.config.overlap, "scheduler started");
        Self { inner }
    }

    /// Register a job under `job_id` with an already constructed trigger.
    ///
    /// Fails with [`SchedulerError::DuplicateJob`] when the ID is taken, in
    /// which case the existing job is left untouched.
    pub fn add_job(
        &self,
        job_id: impl Into<String>,
        trigger: Box<dyn Trigger>,
        func: JobFn,
        args: JobArgs,
    ) -> Result<()> {
        let job_id = job_id.into();
        let mut reg = self.inner.registry();
        if reg.closed {
            return Err(SchedulerError::ShutDown);
        }
        if reg.jobs.contains_key(&job_id) {
            return Err(SchedulerError::DuplicateJob { id: job_id });
        }

        reg.next_seq += 1;
        let job = Job::new(job_id.clone(), reg.next_seq, trigger, func, args, Utc::now());
        info!(
            job_id = %job_id,
            trigger = %job.trigger_kind(),
            status = %job.status(),
            next_run = ?job.next_run(),
            "job added"
        );
        reg.jobs.insert(job_id, job);
        drop(reg);

        self.inner.wake.notify_one();
        Ok(())
    }

    /// Fire once per offset (milliseconds after registration).
    pub fn add_timestamp_job(
        &self,
        job_id: impl Into<String>,
        timestamps_ms: Vec<u64>,
        func: JobFn,
        args: JobArgs,
    ) -> Result<()> {
        let trigger = TimestampTrigger::new(timestamps_ms)?;
        self.add_job(job_id, Box::new(trigger), func, args)
    }

    /// Fire every `interval_secs`, optionally at most `max_runs` times and
    /// anchored at `start_time` (epoch seconds) instead of registration.
    pub fn add_interval_job(
        &self,
        job_id: impl Into<String>,
        interval_secs: f64,
        max_runs: Option<u32>,
        start_time: Option<f64>,
        func: JobFn,
        args: JobArgs,
    ) -> Result<()> {
        let trigger = IntervalTrigger::new(interval_secs, max_runs, start_time)?;
        self.add_job(job_id, Box::new(trigger), func, args)
    }

    /// Fire once at `run_at`, immediately if it already passed.
    pub fn add_one_time_job(
        &self,
        job_id: impl Into<String>,
        run_at: impl Into<RunAt>,
        func: JobFn,
        args: JobArgs,
    ) -> Result<()> {
        let trigger = OneTimeTrigger::new(run_at)?;
        self.add_job(job_id, Box::new(trigger), func, args)
    }

    /// Fire on every match of `expression` evaluated in `timezone`
    /// (e.g. `"UTC"`, `"Europe/Berlin"`).
    #[allow(clippy::too_many_arguments)]
    pub fn add_cron_job(
        &self,
        job_id: impl Into<String>,
        expression: &str,
        max_runs: Option<u32>,
        timezone: &str,
        start_time: Option<DateTime<Utc>>,
        func: JobFn,
        args: JobArgs,
    ) -> Result<()> {
        let trigger = CronTrigger::new(expression, max_runs, timezone, start_time)?;
        self.add_job(job_id, Box::new(trigger), func, args)
    }

    /// Suspend dispatch of a RUNNING job. Once this returns `Ok`, no new
    /// firing of the job starts until it is resumed.
    pub fn pause_job(&self, job_id: &str) -> Result<()> {
        let mut reg = self.inner.registry();
        let job = reg
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| not_found(job_id))?;
        job.pause(Utc::now())?;
        drop(reg);

        info!(%job_id, "job paused");
        self.inner.wake.notify_one();
        Ok(())
    }

    /// Resume a PAUSED job; its next due time is computed from now.
    pub fn resume_job(&self, job_id: &str) -> Result<()> {
        let mut reg = self.inner.registry();
        let job = reg
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| not_found(job_id))?;
        job.resume(Utc::now())?;
        let next_run = job.next_run();
        let status = job.status();
        drop(reg);

        info!(%job_id, %status, ?next_run, "job resumed");
        self.inner.wake.notify_one();
        Ok(())
    }

    /// Remove a job and return its final snapshot (status `removed`).
    ///
    /// The job disappears from listings immediately. An invocation already
    /// claimed or executing is allowed to finish.
    pub fn remove_job(&self, job_id: &str) -> Result<JobSnapshot> {
        let mut reg = self.inner.registry();
        let mut job = reg.jobs.remove(job_id).ok_or_else(|| not_found(job_id))?;
        drop(reg);

        job.mark_removed();
        let snapshot = job.snapshot(Utc::now());
        info!(%job_id, runs = snapshot.execution_count, "job removed");
        self.inner.wake.notify_one();
        Ok(snapshot)
    }

    pub fn get_job_status(&self, job_id: &str) -> Result<JobSnapshot> {
        let reg = self.inner.registry();
        reg.jobs
            .get(job_id)
            .map(|job| job.snapshot(Utc::now()))
            .ok_or_else(|| not_found(job_id))
    }

    /// IDs of all registered jobs, in registration order.
    pub fn list_jobs(&self) -> Vec<String> {
        let reg = self.inner.registry();
        reg.ordered().into_iter().map(|job| job.id().to_string()).collect()
    }

    /// Snapshots of all registered jobs, in registration order, taken in a
    /// single critical section.
    pub fn get_all_statuses(&self) -> Vec<JobSnapshot> {
        let reg = self.inner.registry();
        let now = Utc::now();
        reg.ordered().into_iter().map(|job| job.snapshot(now)).collect()
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }

    /// Stop dispatching, wait (bounded by `shutdown_grace_ms`) for in-flight
    /// executions and drop every job. Calling it again is a no-op.
    pub async fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            debug!("scheduler already shut down");
            return;
        }
        info!("scheduler shutting down");

        let dropped = {
            let mut reg = self.inner.registry();
            reg.closed = true;
            let count = reg.jobs.len();
            for job in reg.jobs.values_mut() {
                job.mark_removed();
            }
            reg.jobs.clear();
            count
        };

        let _ = self.inner.shutdown_tx.send(true);
        let tasks: Vec<JoinHandle<()>> = self
            .inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            if let Err(e) = task.await {
                error!("scheduler task ended abnormally: {e}");
            }
        }

        // The executor has stopped, so nothing new can enter the tracker.
        self.inner.tracker.close();
        let grace = self.inner.config.shutdown_grace();
        if tokio::time::timeout(grace, self.inner.tracker.wait()).await.is_err() {
            warn!(
                in_flight = self.inner.tracker.len(),
                grace_ms = grace.as_millis() as u64,
                "in-flight jobs still running after shutdown grace period"
            );
        }

        info!(jobs_dropped = dropped, "scheduler shut down");
    }
}

fn not_found(job_id: &str) -> SchedulerError {
    SchedulerError::JobNotFound {
        id: job_id.to_string(),
    }
}

/// Dispatch loop: claim due jobs, hand them to the executor, then sleep until
/// the earliest next due time (capped by `max_sleep`) or until woken by a
/// registry mutation.
async fn run_dispatch_loop(
    inner: Weak<Inner>,
    wake: Arc<Notify>,
    mut shutdown: watch::Receiver<bool>,
    work_tx: mpsc::UnboundedSender<Invocation>,
    max_sleep: Duration,
) {
    info!("dispatch loop started");
    loop {
        let sleep_for = {
            let Some(inner) = inner.upgrade() else {
                break;
            };
            let (batch, next_wake) = inner.collect_due(Utc::now());
            for invocation in batch {
                if let Err(e) = work_tx.send(invocation) {
                    error!(job_id = %e.0.job_id, "executor gone, invocation dropped");
                }
            }
            match next_wake {
                Some(at) => (at - Utc::now()).to_std().unwrap_or(Duration::ZERO).min(max_sleep),
                None => max_sleep,
            }
        };
        debug!(sleep_ms = sleep_for.as_millis() as u64, "dispatch loop idle");

        tokio::select! {
            _ = tokio::time::sleep(sleep_for) => {}
            _ = wake.notified() => {}
            changed = shutdown.changed() => {
                // A closed channel means every Scheduler handle is gone.
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    info!("dispatch loop stopped");
}
