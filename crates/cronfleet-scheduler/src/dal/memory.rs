use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use cronfleet_core::{
    saturating_add, Clock, ControllerKey, CronJob, CronJobKey, CronJobState, DeploymentKey,
};

use super::{stale_cutoff, AttemptedCronJob, CronJobDal, DeploymentDal, LeaseDal};
use crate::error::DalError;

/// Process-local store with the same transition rules as [`super::SqliteDal`].
///
/// Every operation takes one lock, which makes each call atomic. Also counts
/// start attempts per job so tests can see which controllers raced for what.
pub struct InMemoryDal {
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    jobs: Vec<CronJob>,
    deployments: HashMap<DeploymentKey, Deployment>,
    attempts: HashMap<CronJobKey, usize>,
    leases: HashMap<String, (ControllerKey, DateTime<Utc>)>,
    failing_starts: usize,
}

struct Deployment {
    module: String,
    min_replicas: u32,
}

impl InMemoryDal {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            inner: Mutex::new(Inner::default()),
        }
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert a job as-is. Its deployment is registered with one replica if unknown.
    pub fn insert_job(&self, job: CronJob) {
        let mut inner = self.inner();
        inner
            .deployments
            .entry(job.deployment_key.clone())
            .or_insert_with(|| Deployment {
                module: job.verb.module.clone(),
                min_replicas: 1,
            });
        inner.jobs.retain(|j| j.key != job.key);
        inner.jobs.push(job);
    }

    pub fn set_min_replicas(&self, key: &DeploymentKey, min_replicas: u32) {
        if let Some(deployment) = self.inner().deployments.get_mut(key) {
            deployment.min_replicas = min_replicas;
        }
    }

    /// Make the next `count` calls to `start_jobs` fail.
    pub fn fail_next_starts(&self, count: usize) {
        self.inner().failing_starts = count;
    }

    /// Snapshot of every stored job, whatever its deployment's replica count.
    pub fn jobs(&self) -> Vec<CronJob> {
        self.inner().jobs.clone()
    }

    pub fn job(&self, key: &CronJobKey) -> Option<CronJob> {
        self.inner().jobs.iter().find(|j| &j.key == key).cloned()
    }

    /// How many times `key` was a `start_jobs` candidate.
    pub fn attempt_count(&self, key: &CronJobKey) -> usize {
        self.inner().attempts.get(key).copied().unwrap_or(0)
    }

    pub fn attempt_counts(&self) -> HashMap<CronJobKey, usize> {
        self.inner().attempts.clone()
    }
}

#[async_trait]
impl CronJobDal for InMemoryDal {
    async fn list_jobs(&self) -> Result<Vec<CronJob>, DalError> {
        let inner = self.inner();
        Ok(inner
            .jobs
            .iter()
            .filter(|job| {
                inner
                    .deployments
                    .get(&job.deployment_key)
                    .is_some_and(|d| d.min_replicas > 0)
            })
            .cloned()
            .collect())
    }

    async fn start_jobs(&self, candidates: &[CronJob]) -> Result<Vec<AttemptedCronJob>, DalError> {
        let now = self.clock.now();
        let mut guard = self.inner();
        let inner = &mut *guard;

        if inner.failing_starts > 0 {
            inner.failing_starts -= 1;
            return Err(DalError::Injected("start_jobs".to_string()));
        }

        let mut attempted = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let Some(job) = inner.jobs.iter_mut().find(|j| j.key == candidate.key) else {
                debug!(job = %candidate.key, "start candidate no longer exists");
                continue;
            };
            *inner.attempts.entry(job.key.clone()).or_default() += 1;

            let did_start = job.next_execution <= now && job.state == CronJobState::Idle;
            if did_start {
                job.state = CronJobState::Executing;
                job.start_time = now;
            }
            let has_min_replicas = inner
                .deployments
                .get(&job.deployment_key)
                .is_some_and(|d| d.min_replicas > 0);
            attempted.push(AttemptedCronJob {
                job: job.clone(),
                did_start_execution: did_start,
                has_min_replicas,
            });
        }
        Ok(attempted)
    }

    async fn end_job(
        &self,
        job: &CronJob,
        next_execution: DateTime<Utc>,
    ) -> Result<CronJob, DalError> {
        let mut inner = self.inner();
        let stored = inner
            .jobs
            .iter_mut()
            .find(|j| j.key == job.key)
            .ok_or_else(|| DalError::JobNotFound {
                key: job.key.clone(),
            })?;
        if stored.state != CronJobState::Executing {
            return Err(DalError::NotExecuting {
                key: job.key.clone(),
            });
        }
        if stored.start_time != job.start_time {
            return Err(DalError::StartTimeMismatch {
                key: job.key.clone(),
            });
        }
        stored.state = CronJobState::Idle;
        stored.next_execution = next_execution;
        Ok(stored.clone())
    }

    async fn list_stale(&self, overrun: Duration) -> Result<Vec<CronJob>, DalError> {
        let Some(cutoff) = stale_cutoff(self.clock.now(), overrun) else {
            return Ok(Vec::new());
        };
        Ok(self
            .inner()
            .jobs
            .iter()
            .filter(|job| job.state == CronJobState::Executing && job.start_time < cutoff)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl DeploymentDal for InMemoryDal {
    async fn create_deployment(
        &self,
        module: &str,
        jobs: Vec<CronJob>,
    ) -> Result<DeploymentKey, DalError> {
        let key = DeploymentKey::new(module);
        let mut inner = self.inner();
        inner.deployments.insert(
            key.clone(),
            Deployment {
                module: module.to_string(),
                min_replicas: 0,
            },
        );
        for mut job in jobs {
            job.deployment_key = key.clone();
            inner.jobs.push(job);
        }
        Ok(key)
    }

    async fn replace_deployment(
        &self,
        key: &DeploymentKey,
        min_replicas: u32,
    ) -> Result<(), DalError> {
        let mut guard = self.inner();
        let inner = &mut *guard;
        let module = match inner.deployments.get_mut(key) {
            Some(deployment) => {
                deployment.min_replicas = min_replicas;
                deployment.module.clone()
            }
            None => return Err(DalError::DeploymentNotFound { key: key.clone() }),
        };

        let mut retired = Vec::new();
        for (other_key, other) in inner.deployments.iter_mut() {
            if other_key != key && other.module == module {
                other.min_replicas = 0;
                retired.push(other_key.clone());
            }
        }
        inner.jobs.retain(|job| !retired.contains(&job.deployment_key));
        Ok(())
    }

    async fn delete_jobs_for_deployment(&self, key: &DeploymentKey) -> Result<usize, DalError> {
        let mut inner = self.inner();
        let before = inner.jobs.len();
        inner.jobs.retain(|job| &job.deployment_key != key);
        Ok(before - inner.jobs.len())
    }
}

#[async_trait]
impl LeaseDal for InMemoryDal {
    async fn try_acquire_lease(
        &self,
        name: &str,
        holder: &ControllerKey,
        ttl: Duration,
    ) -> Result<bool, DalError> {
        let now = self.clock.now();
        let expires_at = saturating_add(now, ttl);
        let mut inner = self.inner();
        match inner.leases.get(name) {
            Some((current, until)) if current != holder && *until > now => Ok(false),
            _ => {
                inner
                    .leases
                    .insert(name.to_string(), (holder.clone(), expires_at));
                Ok(true)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use cronfleet_core::{MockClock, VerbRef};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn job(deployment: &DeploymentKey, verb: &str, next: DateTime<Utc>) -> CronJob {
        CronJob {
            key: CronJobKey::new("echo", verb),
            deployment_key: deployment.clone(),
            verb: VerbRef::new("echo", verb),
            schedule: "*/10 * * * * *".to_string(),
            start_time: t0(),
            next_execution: next,
            state: CronJobState::Idle,
        }
    }

    fn setup() -> (MockClock, InMemoryDal, DeploymentKey) {
        let clock = MockClock::new(t0());
        let dal = InMemoryDal::new(Arc::new(clock.clone()));
        (clock, dal, DeploymentKey::new("echo"))
    }

    #[tokio::test]
    async fn start_only_claims_due_idle_jobs() {
        let (clock, dal, deployment) = setup();
        let due = job(&deployment, "due", t0());
        let later = job(&deployment, "later", t0() + chrono::Duration::seconds(30));
        dal.insert_job(due.clone());
        dal.insert_job(later.clone());

        let attempted = dal.start_jobs(&[due.clone(), later.clone()]).await.unwrap();
        assert!(attempted[0].did_start_execution);
        assert_eq!(attempted[0].job.state, CronJobState::Executing);
        assert_eq!(attempted[0].job.start_time, clock.now());
        assert!(!attempted[1].did_start_execution);

        // Already executing: a second claim loses.
        let again = dal.start_jobs(&[due.clone()]).await.unwrap();
        assert!(!again[0].did_start_execution);
        assert_eq!(dal.attempt_count(&due.key), 2);
    }

    #[tokio::test]
    async fn concurrent_starts_have_one_winner() {
        let (_clock, dal, deployment) = setup();
        let dal = Arc::new(dal);
        let due = job(&deployment, "race", t0());
        dal.insert_job(due.clone());

        let mut handles = Vec::new();
        for _ in 0..8 {
            let dal = dal.clone();
            let due = due.clone();
            handles.push(tokio::spawn(async move {
                dal.start_jobs(&[due]).await.unwrap()
            }));
        }
        let mut winners = 0;
        for handle in handles {
            winners += handle
                .await
                .unwrap()
                .iter()
                .filter(|a| a.did_start_execution)
                .count();
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn end_job_checks_state_and_start_time() {
        let (clock, dal, deployment) = setup();
        let due = job(&deployment, "end", t0());
        dal.insert_job(due.clone());

        let err = dal.end_job(&due, t0()).await.unwrap_err();
        assert!(matches!(err, DalError::NotExecuting { .. }));

        clock.advance(chrono::Duration::seconds(1));
        let started = dal.start_jobs(&[due.clone()]).await.unwrap().remove(0).job;

        let mut stale_view = started.clone();
        stale_view.start_time = t0();
        let err = dal.end_job(&stale_view, t0()).await.unwrap_err();
        assert!(matches!(err, DalError::StartTimeMismatch { .. }));

        let next = t0() + chrono::Duration::seconds(10);
        let ended = dal.end_job(&started, next).await.unwrap();
        assert_eq!(ended.state, CronJobState::Idle);
        assert_eq!(ended.next_execution, next);
    }

    #[tokio::test]
    async fn stale_jobs_are_executing_past_the_overrun() {
        let (clock, dal, deployment) = setup();
        let due = job(&deployment, "slow", t0());
        let idle = job(&deployment, "idle", t0());
        dal.insert_job(due.clone());
        dal.insert_job(idle.clone());
        dal.start_jobs(&[due.clone()]).await.unwrap();

        clock.advance(chrono::Duration::seconds(30));
        assert!(dal.list_stale(Duration::from_secs(60)).await.unwrap().is_empty());

        clock.advance(chrono::Duration::seconds(31));
        let stale = dal.list_stale(Duration::from_secs(60)).await.unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].key, due.key);
    }

    #[tokio::test]
    async fn scaled_down_deployments_are_hidden_and_flagged() {
        let (_clock, dal, deployment) = setup();
        let due = job(&deployment, "scaled", t0());
        dal.insert_job(due.clone());
        assert_eq!(dal.list_jobs().await.unwrap().len(), 1);

        dal.set_min_replicas(&deployment, 0);
        assert!(dal.list_jobs().await.unwrap().is_empty());

        let attempted = dal.start_jobs(&[due]).await.unwrap();
        assert!(attempted[0].did_start_execution);
        assert!(!attempted[0].has_min_replicas);
    }

    #[tokio::test]
    async fn replace_deployment_retires_older_versions() {
        let (_clock, dal, _) = setup();
        let placeholder = DeploymentKey::from("pending");
        let v1 = dal
            .create_deployment("echo", vec![job(&placeholder, "a", t0())])
            .await
            .unwrap();
        assert!(dal.list_jobs().await.unwrap().is_empty());
        dal.replace_deployment(&v1, 1).await.unwrap();
        assert_eq!(dal.list_jobs().await.unwrap()[0].deployment_key, v1);

        let v2 = dal
            .create_deployment("echo", vec![job(&placeholder, "a", t0())])
            .await
            .unwrap();
        dal.replace_deployment(&v2, 2).await.unwrap();
        let jobs = dal.list_jobs().await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].deployment_key, v2);

        assert!(matches!(
            dal.replace_deployment(&DeploymentKey::from("missing"), 1).await,
            Err(DalError::DeploymentNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn leases_exclude_other_holders_until_expiry() {
        let (clock, dal, _) = setup();
        let a = ControllerKey::from("a");
        let b = ControllerKey::from("b");
        let ttl = Duration::from_secs(10);

        assert!(dal.try_acquire_lease("task", &a, ttl).await.unwrap());
        assert!(!dal.try_acquire_lease("task", &b, ttl).await.unwrap());
        assert!(dal.try_acquire_lease("task", &a, ttl).await.unwrap());

        clock.advance(chrono::Duration::seconds(11));
        assert!(dal.try_acquire_lease("task", &b, ttl).await.unwrap());
        assert!(!dal.try_acquire_lease("task", &a, ttl).await.unwrap());
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let (_clock, dal, deployment) = setup();
        let due = job(&deployment, "flaky", t0());
        dal.insert_job(due.clone());
        dal.fail_next_starts(1);
        assert!(dal.start_jobs(&[due.clone()]).await.is_err());
        assert!(dal.start_jobs(&[due]).await.is_ok());
    }
}
