//! Storage seam for cron jobs, deployments and task leases.
//!
//! Controllers never mutate a job directly: every Idle ⇄ Executing transition
//! goes through [`CronJobDal`], whose implementations must guarantee that at
//! most one concurrent `start_jobs` caller wins a given firing.

pub mod memory;
pub mod sqlite;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use cronfleet_core::{ControllerKey, CronJob, DeploymentKey};

use crate::error::DalError;

pub use memory::InMemoryDal;
pub use sqlite::SqliteDal;

/// Outcome of one job in a `start_jobs` batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptedCronJob {
    /// The job as stored after the attempt.
    pub job: CronJob,
    /// This caller moved the job to Executing.
    pub did_start_execution: bool,
    /// False when the owning deployment is scaled to zero: end the job
    /// instead of dispatching it.
    pub has_min_replicas: bool,
}

#[async_trait]
pub trait CronJobDal: Send + Sync {
    /// Jobs of every deployment that currently has replicas.
    async fn list_jobs(&self) -> Result<Vec<CronJob>, DalError>;

    /// Atomically claim each candidate whose stored `next_execution <= now`
    /// and whose state is Idle. Candidates that no longer exist are omitted.
    async fn start_jobs(&self, candidates: &[CronJob]) -> Result<Vec<AttemptedCronJob>, DalError>;

    /// Return an Executing job to Idle with a new `next_execution`.
    ///
    /// Fails unless the stored job is Executing with the same `start_time`
    /// as `job`, so a stale holder can never end someone else's attempt.
    async fn end_job(
        &self,
        job: &CronJob,
        next_execution: DateTime<Utc>,
    ) -> Result<CronJob, DalError>;

    /// Executing jobs whose `start_time + overrun` is in the past.
    async fn list_stale(&self, overrun: Duration) -> Result<Vec<CronJob>, DalError>;
}

/// Deployment registration, used by the `deploy` path.
#[async_trait]
pub trait DeploymentDal: Send + Sync {
    /// Store a new deployment with zero replicas and its jobs.
    async fn create_deployment(
        &self,
        module: &str,
        jobs: Vec<CronJob>,
    ) -> Result<DeploymentKey, DalError>;

    /// Activate `key` with `min_replicas` and retire every older deployment
    /// of the same module along with its jobs.
    async fn replace_deployment(&self, key: &DeploymentKey, min_replicas: u32)
        -> Result<(), DalError>;

    /// Remove every job owned by `key`. Returns how many were deleted.
    async fn delete_jobs_for_deployment(&self, key: &DeploymentKey) -> Result<usize, DalError>;
}

/// Expiring named leases used to home singleton tasks on one controller.
#[async_trait]
pub trait LeaseDal: Send + Sync {
    /// Take or renew `name` for `holder` until `now + ttl`.
    ///
    /// Returns false while another holder's lease is unexpired.
    async fn try_acquire_lease(
        &self,
        name: &str,
        holder: &ControllerKey,
        ttl: Duration,
    ) -> Result<bool, DalError>;
}

/// `now - overrun`, or `None` when the subtraction leaves the representable range.
pub(crate) fn stale_cutoff(now: DateTime<Utc>, overrun: Duration) -> Option<DateTime<Utc>> {
    now.checked_sub_signed(chrono::Duration::from_std(overrun).ok()?)
}
