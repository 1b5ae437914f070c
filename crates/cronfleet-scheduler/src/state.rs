use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};

use cronfleet_core::config::NEW_JOB_GRACE_WINDOW;
use cronfleet_core::{CronJob, CronJobKey, DeploymentKey};

/// Per-controller view of the job list. Owned by the event loop alone.
#[derive(Debug, Default)]
pub struct SchedulerState {
    pub(crate) jobs: Vec<CronJob>,
    /// Jobs this process claimed and is still dispatching.
    executing: HashSet<CronJobKey>,
    /// Jobs of a freshly created deployment, with the time they were seen.
    new_jobs: HashMap<CronJobKey, DateTime<Utc>>,
    /// No DAL starts before this instant.
    blocked_until: Option<DateTime<Utc>>,
}

impl SchedulerState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn jobs(&self) -> &[CronJob] {
        &self.jobs
    }

    /// Replace the job list. Jobs of `new_deployment` enter the grace window.
    ///
    /// Local executions are kept only for jobs the fresh list still shows as
    /// executing.
    pub fn reset(
        &mut self,
        jobs: Vec<CronJob>,
        new_deployment: Option<&DeploymentKey>,
        now: DateTime<Utc>,
    ) {
        if let Some(deployment) = new_deployment {
            for job in jobs.iter().filter(|j| &j.deployment_key == deployment) {
                self.new_jobs.insert(job.key.clone(), now);
            }
        }
        self.executing
            .retain(|key| jobs.iter().any(|j| &j.key == key && j.is_executing()));
        self.jobs = jobs;
    }

    /// Replace known jobs with fresher copies. Unknown keys are ignored.
    pub fn update_jobs(&mut self, updated: Vec<CronJob>) {
        for job in updated {
            if !job.is_executing() {
                self.executing.remove(&job.key);
            }
            if let Some(slot) = self.jobs.iter_mut().find(|j| j.key == job.key) {
                *slot = job;
            }
        }
    }

    pub fn remove_deployment_key(&mut self, key: &DeploymentKey) {
        self.jobs.retain(|j| &j.deployment_key != key);
    }

    pub fn started_executing(&mut self, job: &CronJob) {
        self.executing.insert(job.key.clone());
    }

    pub fn is_executing_locally(&self, job: &CronJob) -> bool {
        self.executing.contains(&job.key)
    }

    /// Whether `job` is still inside the grace window. Expired entries are
    /// dropped as a side effect.
    pub fn is_too_new_for_ring(&mut self, job: &CronJob, now: DateTime<Utc>) -> bool {
        let Some(&seen) = self.new_jobs.get(&job.key) else {
            return false;
        };
        let within = chrono::Duration::from_std(NEW_JOB_GRACE_WINDOW)
            .map(|window| now - seen < window)
            .unwrap_or(false);
        if !within {
            self.new_jobs.remove(&job.key);
        }
        within
    }

    pub fn blocked_until(&self) -> Option<DateTime<Utc>> {
        self.blocked_until
    }

    /// Push the back-off deadline forward. Earlier deadlines are ignored.
    pub fn block_until(&mut self, until: DateTime<Utc>) {
        if self.blocked_until.map_or(true, |current| until > current) {
            self.blocked_until = Some(until);
        }
    }
}
