//! `cadence-scheduler`: in-process, tokio-based job scheduling engine.
//!
//! # Overview
//!
//! Callers register jobs (a callable plus bound arguments) together with a
//! [`Trigger`] that decides when the job is due. A background dispatch loop
//! sleeps until the earliest due time, claims every due job under a single
//! registry lock and hands it to the execution unit, which runs the callable
//! on its own task. Failing or slow callables never stall dispatch.
//!
//! # Trigger variants
//!
//! | Variant     | Behaviour                                                  |
//! |-------------|------------------------------------------------------------|
//! | `Timestamp` | Once per millisecond offset after registration            |
//! | `Interval`  | Every N seconds on a fixed grid, optionally `max_runs`     |
//! | `OneTime`   | Single fire at an absolute instant                         |
//! | `Cron`      | Cron expression in an IANA timezone, optionally `max_runs` |
//!
//! # Job lifecycle
//!
//! `running` ⇄ `paused` (pause/resume), `running` → `completed` when the
//! trigger is exhausted, and any state → `removed` on `remove_job`.

pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod job;
pub mod trigger;

pub use config::{OverlapPolicy, SchedulerConfig};
pub use engine::Scheduler;
pub use error::{Result, SchedulerError};
pub use executor::JobFailure;
pub use job::{JobArgs, JobError, JobFn, JobResult, JobSnapshot, JobStatus};
pub use trigger::{
    CronEvaluator, CronSchedule, CronTrigger, IntervalTrigger, OneTimeTrigger, RunAt,
    TimestampTrigger, Trigger, TriggerKind,
};
