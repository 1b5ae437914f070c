use thiserror::Error;

use cronfleet_core::{CronJobKey, DeploymentKey};
use cronfleet_cron::CronError;

/// Errors from the storage layer.
#[derive(Debug, Error)]
pub enum DalError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Cron job not found: {key}")]
    JobNotFound { key: CronJobKey },

    #[error("Deployment not found: {key}")]
    DeploymentNotFound { key: DeploymentKey },

    #[error("Cron job {key} can not be stopped, it isn't running")]
    NotExecuting { key: CronJobKey },

    #[error("Cron job {key} can not be stopped, start time does not match")]
    StartTimeMismatch { key: CronJobKey },

    #[error("Storage lock poisoned")]
    Poisoned,

    /// Failure injected by the in-memory store.
    #[error("Injected failure: {0}")]
    Injected(String),
}

/// Errors from invoking a verb.
#[derive(Debug, Error)]
pub enum VerbError {
    #[error("Transport error: {0}")]
    Transport(String),

    /// The verb ran and reported an error.
    #[error("Verb {verb} failed: {message}")]
    Remote { verb: String, message: String },

    #[error("Verb call timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("Verb call cancelled")]
    Cancelled,
}

/// Errors surfaced by the scheduler service and its tasks.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Dal(#[from] DalError),

    #[error("Invalid schedule: {0}")]
    Cron(#[from] CronError),

    #[error(transparent)]
    Verb(#[from] VerbError),

    /// The event loop is gone, or its queue is full.
    #[error("Job change channel unavailable: {0}")]
    Channel(String),

    #[error("Scheduler already started")]
    AlreadyStarted,

    #[error("Cron service builder is missing {0}")]
    Builder(&'static str),

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<SchedulerError>,
    },
}

impl SchedulerError {
    /// Wrap with a short description of the operation that failed.
    pub fn context(self, context: impl Into<String>) -> Self {
        SchedulerError::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
