//! Execution unit: runs job callables away from the dispatch loop.
//!
//! The dispatch loop pushes claimed [`Invocation`]s onto a work channel. The
//! executor task spawns each one into a [`TaskTracker`] so `shutdown()` can
//! wait for in-flight work. A callable that fails or panics never escapes this
//! module: the failure is logged, optionally forwarded to the failure
//! observer, and the job's schedule is left untouched.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinError;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::job::{JobArgs, JobFn};

/// One claimed firing of a job, ready to execute.
#[derive(Debug)]
pub(crate) struct Invocation {
    pub(crate) job_id: String,
    pub(crate) seq: u64,
    /// Execution number of this firing (1-based).
    pub(crate) run: u64,
    pub(crate) callable: JobFn,
    pub(crate) args: Arc<JobArgs>,
}

/// Reported on the failure observer channel when a callable fails.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobFailure {
    pub job_id: String,
    /// Execution number of the failed firing.
    pub run: u64,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

/// Run the callable to completion, folding errors and panics into `Err`.
pub(crate) async fn invoke(invocation: &Invocation) -> Result<(), String> {
    match &invocation.callable {
        JobFn::Blocking(f) => {
            let f = Arc::clone(f);
            let args = Arc::clone(&invocation.args);
            match tokio::task::spawn_blocking(move || f(&args)).await {
                Ok(result) => result.map_err(|e| e.to_string()),
                Err(join_err) => Err(describe_join_error(join_err)),
            }
        }
        JobFn::Async(f) => {
            let fut = f(JobArgs::clone(&invocation.args));
            // Own task so a panic is caught as a JoinError.
            match tokio::spawn(fut).await {
                Ok(result) => result.map_err(|e| e.to_string()),
                Err(join_err) => Err(describe_join_error(join_err)),
            }
        }
    }
}

fn describe_join_error(err: JoinError) -> String {
    if !err.is_panic() {
        return "job task was cancelled".to_string();
    }
    let panic = err.into_panic();
    let msg = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string());
    format!("job panicked: {msg}")
}

/// Log a callable failure and forward it to the observer, if one is attached.
///
/// Uses `try_send` so a slow observer can never stall job execution.
pub(crate) fn report_failure(
    observer: Option<&mpsc::Sender<JobFailure>>,
    invocation: &Invocation,
    error: String,
) {
    warn!(job_id = %invocation.job_id, run = invocation.run, %error, "job execution failed");

    let Some(tx) = observer else { return };
    let failure = JobFailure {
        job_id: invocation.job_id.clone(),
        run: invocation.run,
        error,
        failed_at: Utc::now(),
    };
    if tx.try_send(failure).is_err() {
        warn!(job_id = %invocation.job_id, "failure channel full or closed, report dropped");
    }
}

/// Executor task: drains the work channel until the dispatch loop drops its
/// sender, spawning every invocation into `tracker`.
///
/// `on_done` runs after each invocation with its outcome.
pub(crate) async fn run_executor<F>(
    mut work_rx: mpsc::UnboundedReceiver<Invocation>,
    tracker: TaskTracker,
    on_done: F,
) where
    F: Fn(Invocation, Result<(), String>) + Clone + Send + Sync + 'static,
{
    debug!("executor started");
    while let Some(invocation) = work_rx.recv().await {
        let on_done = on_done.clone();
        tracker.spawn(async move {
            debug!(job_id = %invocation.job_id, run = invocation.run, "executing job");
            let outcome = invoke(&invocation).await;
            on_done(invocation, outcome);
        });
    }
    info!("executor stopped");
}
