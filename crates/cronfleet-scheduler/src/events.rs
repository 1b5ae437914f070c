use tokio::sync::mpsc;
use tracing::warn;

use cronfleet_core::config::JOB_CHANGE_CAPACITY;
use cronfleet_core::{CronJob, DeploymentKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobChangeKind {
    /// Replace the loop's job list.
    ResetJobs,
    /// Merge fresher copies of known jobs.
    FinishedJobs,
    /// Membership changed; responsibilities must be re-evaluated.
    HashRingUpdated,
}

/// Event consumed by the scheduler loop.
#[derive(Debug, Clone)]
pub struct JobChange {
    pub kind: JobChangeKind,
    pub jobs: Vec<CronJob>,
    /// Set on resets caused by a new deployment; starts its grace window.
    pub added_deployment: Option<DeploymentKey>,
}

impl JobChange {
    pub fn reset(jobs: Vec<CronJob>, added_deployment: Option<DeploymentKey>) -> Self {
        Self {
            kind: JobChangeKind::ResetJobs,
            jobs,
            added_deployment,
        }
    }

    pub fn finished(jobs: Vec<CronJob>) -> Self {
        Self {
            kind: JobChangeKind::FinishedJobs,
            jobs,
            added_deployment: None,
        }
    }

    pub fn hash_ring_updated() -> Self {
        Self {
            kind: JobChangeKind::HashRingUpdated,
            jobs: Vec::new(),
            added_deployment: None,
        }
    }
}

/// Publishing side of the job change topic.
///
/// `publish` never waits: a full queue drops the event with a warning, and
/// the next periodic reset brings the loop back in sync.
#[derive(Debug, Clone)]
pub struct JobChangePublisher {
    tx: mpsc::Sender<JobChange>,
}

impl JobChangePublisher {
    /// Create the topic with its single subscriber.
    pub fn channel() -> (Self, mpsc::Receiver<JobChange>) {
        let (tx, rx) = mpsc::channel(JOB_CHANGE_CAPACITY);
        (Self { tx }, rx)
    }

    /// Returns false when the event was dropped.
    pub fn publish(&self, change: JobChange) -> bool {
        match self.tx.try_send(change) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(change)) => {
                warn!(kind = ?change.kind, "job change queue full, dropping event");
                false
            }
            Err(mpsc::error::TrySendError::Closed(change)) => {
                warn!(kind = ?change.kind, "scheduler loop is gone, dropping event");
                false
            }
        }
    }
}
