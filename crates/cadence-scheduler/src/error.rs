use thiserror::Error;

use crate::job::JobStatus;

/// Errors surfaced synchronously by the scheduler's control plane.
///
/// Failures raised by job callables never show up here. They are isolated in
/// the execution unit and only reported through the optional failure channel.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// A job with this ID is already registered.
    #[error("Job already exists: {id}")]
    DuplicateJob { id: String },

    /// No job with the given ID exists in the registry.
    #[error("Job not found: {id}")]
    JobNotFound { id: String },

    /// The requested control action is not valid from the job's current state.
    #[error("Cannot {action} job {id} while it is {from}")]
    InvalidTransition {
        id: String,
        from: JobStatus,
        action: &'static str,
    },

    /// Trigger parameters were rejected before the job entered the registry.
    #[error("Invalid trigger: {0}")]
    InvalidTrigger(String),

    /// The cron expression could not be parsed.
    #[error("Invalid cron expression '{expression}': {reason}")]
    InvalidCron { expression: String, reason: String },

    /// The timezone name is not a known IANA zone.
    #[error("Invalid timezone: {0}")]
    InvalidTimezone(String),

    /// Configuration could not be loaded or deserialised.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The scheduler has been shut down and accepts no further work.
    #[error("Scheduler is shut down")]
    ShutDown,
}

impl SchedulerError {
    /// Short, stable error code for callers that map errors onto their own
    /// protocol or status surface.
    pub fn code(&self) -> &'static str {
        match self {
            SchedulerError::DuplicateJob { .. } => "DUPLICATE_JOB",
            SchedulerError::JobNotFound { .. } => "JOB_NOT_FOUND",
            SchedulerError::InvalidTransition { .. } => "INVALID_TRANSITION",
            SchedulerError::InvalidTrigger(_) => "INVALID_TRIGGER",
            SchedulerError::InvalidCron { .. } => "INVALID_CRON",
            SchedulerError::InvalidTimezone(_) => "INVALID_TIMEZONE",
            SchedulerError::Config(_) => "CONFIG_ERROR",
            SchedulerError::ShutDown => "SHUT_DOWN",
        }
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
