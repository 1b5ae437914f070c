//! The per-controller scheduling loop.
//!
//! Each iteration sorts the known jobs by when this controller should next
//! try to start them, sleeps until the earliest (or until a job change event
//! arrives), then races the other controllers through
//! [`CronJobDal::start_jobs`]. Winners are dispatched on their own tasks and
//! report back through the job change topic.

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use cronfleet_core::config::DAL_BACKOFF;
use cronfleet_core::{saturating_add, CronJob, DeploymentKey};
use cronfleet_cron::{next_after, parse, CronError};

use crate::dal::CronJobDal;
use crate::error::VerbError;
use crate::events::{JobChange, JobChangeKind};
use crate::hashring::HashRingState;
use crate::service::ServiceInner;
use crate::state::SchedulerState;
use crate::verb::{CallRequest, RequestKey};

/// Sleep used when nothing is due.
pub const IDLE_WAIT: Duration = Duration::from_secs(60 * 60);

/// Minimum distance between wake-ups.
pub const MIN_WAIT: Duration = Duration::from_secs(1);

/// Next firing of `schedule` after `after`.
pub(crate) fn next_firing(
    schedule: &str,
    after: DateTime<Utc>,
    inclusive: bool,
) -> Result<DateTime<Utc>, CronError> {
    let pattern = parse(schedule)?;
    next_after(&pattern, after, inclusive)
}

/// `None` ("never") sorts after every instant.
fn cmp_attempt(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.cmp(&b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

pub(crate) struct EventLoop {
    inner: Arc<ServiceInner>,
    state: SchedulerState,
    rx: mpsc::Receiver<JobChange>,
    cancel: CancellationToken,
}

impl EventLoop {
    pub(crate) fn new(
        inner: Arc<ServiceInner>,
        rx: mpsc::Receiver<JobChange>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            inner,
            state: SchedulerState::new(),
            rx,
            cancel,
        }
    }

    pub(crate) async fn run(mut self) {
        info!(controller = %self.inner.key, "cron scheduler loop started");
        loop {
            let now = self.inner.clock.now();
            let ring = self.inner.ring.load();
            let earliest = self.sort_jobs(&ring, now);
            let target = self.pick_target(earliest, now);
            trace!(%target, jobs = self.state.jobs().len(), "waiting for next cron job");

            let clock = Arc::clone(&self.inner.clock);
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                change = self.rx.recv() => match change {
                    Some(change) => self.apply(change),
                    None => {
                        warn!("job change topic closed");
                        break;
                    }
                },
                _ = clock.sleep_until(target) => self.execute_jobs(target).await,
            }
        }
        info!(controller = %self.inner.key, "cron scheduler loop stopped");
    }

    /// When this controller should next try to start `job`, or `None` for
    /// never.
    fn next_attempt(
        &mut self,
        ring: &HashRingState,
        job: &CronJob,
        now: DateTime<Utc>,
        allows_now: bool,
    ) -> Option<DateTime<Utc>> {
        if !ring.is_responsible(&job.key) && !self.state.is_too_new_for_ring(job, now) {
            return None;
        }
        if !job.is_executing() {
            return Some(job.next_execution);
        }
        if self.state.is_executing_locally(job) {
            return None;
        }
        // Executing on another controller: check back at the next firing.
        match next_firing(&job.schedule, now, allows_now) {
            Ok(next) => Some(next),
            Err(e) => {
                debug!(job = %job.key, error = %e, "cannot compute next firing");
                None
            }
        }
    }

    /// Order jobs by next attempt and return the earliest attempt time.
    fn sort_jobs(&mut self, ring: &HashRingState, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let jobs = std::mem::take(&mut self.state.jobs);
        let mut keyed: Vec<(Option<DateTime<Utc>>, CronJob)> = jobs
            .into_iter()
            .map(|job| (self.next_attempt(ring, &job, now, false), job))
            .collect();
        keyed.sort_by(|a, b| cmp_attempt(a.0, b.0));
        let earliest = keyed.first().and_then(|(at, _)| *at);
        self.state.jobs = keyed.into_iter().map(|(_, job)| job).collect();
        earliest
    }

    fn pick_target(&self, earliest: Option<DateTime<Utc>>, now: DateTime<Utc>) -> DateTime<Utc> {
        let mut target = earliest.unwrap_or_else(|| saturating_add(now, IDLE_WAIT));
        if let Some(blocked) = self.state.blocked_until() {
            if target < blocked {
                target = blocked;
            }
        }
        let min = saturating_add(now, MIN_WAIT);
        if target < min {
            target = min;
        }
        target
    }

    fn apply(&mut self, change: JobChange) {
        match change.kind {
            JobChangeKind::ResetJobs => {
                debug!(jobs = change.jobs.len(), deployment = ?change.added_deployment, "resetting jobs");
                let now = self.inner.clock.now();
                self.state
                    .reset(change.jobs, change.added_deployment.as_ref(), now);
            }
            JobChangeKind::FinishedJobs => {
                debug!(jobs = change.jobs.len(), "updating finished jobs");
                self.state.update_jobs(change.jobs);
            }
            JobChangeKind::HashRingUpdated => {
                debug!("hash ring updated");
            }
        }
    }

    /// Start every due job this controller is responsible for.
    async fn execute_jobs(&mut self, target: DateTime<Utc>) {
        let now = self.inner.clock.now();
        let ring = self.inner.ring.load();

        let jobs = std::mem::take(&mut self.state.jobs);
        let mut candidates = Vec::new();
        for job in &jobs {
            if let Some(at) = self.next_attempt(&ring, job, now, true) {
                if at <= now {
                    candidates.push(job.clone());
                }
            }
        }
        self.state.jobs = jobs;
        if candidates.is_empty() {
            return;
        }

        let dal = Arc::clone(&self.inner.dal);
        let attempted = tokio::select! {
            _ = self.cancel.cancelled() => return,
            result = dal.start_jobs(&candidates) => result,
        };
        let attempted = match attempted {
            Ok(attempted) => attempted,
            Err(e) => {
                error!(error = %e, candidates = candidates.len(), "failed to start cron jobs, backing off");
                self.state.block_until(saturating_add(now, DAL_BACKOFF));
                return;
            }
        };

        let mut updated = Vec::with_capacity(attempted.len());
        let mut removed: Vec<DeploymentKey> = Vec::new();
        for attempt in attempted {
            let job = attempt.job;
            if !attempt.did_start_execution {
                trace!(job = %job.key, "cron job not started");
                updated.push(job);
                continue;
            }
            if !attempt.has_min_replicas {
                info!(job = %job.key, deployment = %job.deployment_key, "deployment has no replicas, ending cron job");
                match dal.end_job(&job, target).await {
                    Ok(ended) => updated.push(ended),
                    Err(e) => {
                        error!(job = %job.key, error = %e, "failed to end cron job");
                        updated.push(job.clone());
                    }
                }
                removed.push(job.deployment_key);
                continue;
            }
            self.state.started_executing(&job);
            tokio::spawn(dispatch(
                Arc::clone(&self.inner),
                job.clone(),
                self.cancel.clone(),
            ));
            updated.push(job);
        }

        self.state.update_jobs(updated);
        for key in removed {
            self.state.remove_deployment_key(&key);
        }
    }
}

/// Invoke the verb for a started job, then end the job with its next
/// firing and report it back to the loop.
pub(crate) async fn dispatch(inner: Arc<ServiceInner>, job: CronJob, cancel: CancellationToken) {
    let request = CallRequest::empty(job.verb.clone());
    let request_key = RequestKey::for_cron(&job.verb);
    let deadline = saturating_add(inner.clock.now(), inner.timeout);
    info!(job = %job.key, verb = %job.verb, request_key = %request_key, "executing cron job");

    let outcome = tokio::select! {
        result = inner.caller.call(request, Some(request_key), &inner.origin_host) => result,
        _ = inner.clock.sleep_until(deadline) => Err(VerbError::Timeout {
            secs: inner.timeout.as_secs(),
        }),
        _ = cancel.cancelled() => Err(VerbError::Cancelled),
    };
    match outcome {
        Ok(_) => debug!(job = %job.key, "cron job call succeeded"),
        Err(VerbError::Cancelled) => {
            debug!(job = %job.key, "cron job call cancelled");
            return;
        }
        Err(e) => error!(job = %job.key, verb = %job.verb, error = %e, "cron job call failed"),
    }

    let now = inner.clock.now();
    let next = match next_firing(&job.schedule, now, false) {
        Ok(next) => next,
        Err(e) => {
            error!(job = %job.key, error = %e, "failed to compute next execution");
            return;
        }
    };
    match inner.dal.end_job(&job, next).await {
        Ok(ended) => {
            debug!(job = %ended.key, next = %next, "cron job finished");
            inner.events.publish(JobChange::finished(vec![ended]));
        }
        Err(e) => error!(job = %job.key, error = %e, "failed to end cron job"),
    }
}
