use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use cronfleet_core::config::{DEFAULT_TIMEOUT_SECS, JOB_RESET_INTERVAL, KILL_STALE_PERIOD};
use cronfleet_core::{
    Clock, Controller, ControllerKey, CronJob, CronJobKey, CronJobState, DeploymentKey,
    SystemClock, VerbRef,
};

use crate::dal::CronJobDal;
use crate::engine::{next_firing, EventLoop};
use crate::error::{Result, SchedulerError};
use crate::events::{JobChange, JobChangePublisher};
use crate::hashring::{HashRingState, SharedHashRing};
use crate::schema::Module;
use crate::tasks::{Backoff, TaskJob, TaskScheduler};
use crate::verb::VerbCaller;

/// Handles shared by the event loop, dispatch tasks and housekeeping tasks.
pub(crate) struct ServiceInner {
    pub(crate) key: ControllerKey,
    pub(crate) origin_host: String,
    pub(crate) timeout: Duration,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) dal: Arc<dyn CronJobDal>,
    pub(crate) caller: Arc<dyn VerbCaller>,
    pub(crate) ring: SharedHashRing,
    pub(crate) events: JobChangePublisher,
}

/// One controller's cron scheduler.
///
/// Assemble with [`CronService::builder`], then call [`CronService::start`]
/// once to spawn the event loop and register the housekeeping tasks.
pub struct CronService {
    inner: Arc<ServiceInner>,
    receiver: Mutex<Option<mpsc::Receiver<JobChange>>>,
}

pub struct CronServiceBuilder {
    key: Option<ControllerKey>,
    origin_host: String,
    timeout: Duration,
    clock: Option<Arc<dyn Clock>>,
    dal: Option<Arc<dyn CronJobDal>>,
    caller: Option<Arc<dyn VerbCaller>>,
}

impl Default for CronServiceBuilder {
    fn default() -> Self {
        Self {
            key: None,
            origin_host: "localhost".to_string(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            clock: None,
            dal: None,
            caller: None,
        }
    }
}

impl CronServiceBuilder {
    pub fn key(mut self, key: ControllerKey) -> Self {
        self.key = Some(key);
        self
    }

    /// Host name reported to the verb service as the call origin.
    pub fn origin_host(mut self, host: impl Into<String>) -> Self {
        self.origin_host = host.into();
        self
    }

    /// Deadline for a single verb call.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn dal(mut self, dal: Arc<dyn CronJobDal>) -> Self {
        self.dal = Some(dal);
        self
    }

    pub fn verb_caller(mut self, caller: Arc<dyn VerbCaller>) -> Self {
        self.caller = Some(caller);
        self
    }

    pub fn build(self) -> Result<CronService> {
        let dal = self.dal.ok_or(SchedulerError::Builder("a DAL"))?;
        let caller = self.caller.ok_or(SchedulerError::Builder("a verb caller"))?;
        let (events, receiver) = JobChangePublisher::channel();
        let inner = ServiceInner {
            key: self.key.unwrap_or_default(),
            origin_host: self.origin_host,
            timeout: self.timeout,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            dal,
            caller,
            ring: SharedHashRing::default(),
            events,
        };
        Ok(CronService {
            inner: Arc::new(inner),
            receiver: Mutex::new(Some(receiver)),
        })
    }
}

impl CronService {
    pub fn builder() -> CronServiceBuilder {
        CronServiceBuilder::default()
    }

    pub fn key(&self) -> &ControllerKey {
        &self.inner.key
    }

    /// Current membership snapshot.
    pub fn hash_ring(&self) -> Arc<HashRingState> {
        self.inner.ring.load()
    }

    /// One idle job per verb of `module` carrying a cron directive, first
    /// due at the schedule's next firing after `now`. Verbs with a schedule
    /// that does not parse are skipped.
    pub fn new_jobs_for_module(&self, module: &Module, now: DateTime<Utc>) -> Vec<CronJob> {
        let mut jobs = Vec::new();
        for verb in &module.verbs {
            let Some(schedule) = verb.cron_schedule() else {
                continue;
            };
            let next_execution = match next_firing(schedule, now, false) {
                Ok(next) => next,
                Err(e) => {
                    error!(
                        module = %module.name,
                        verb = %verb.name,
                        %schedule,
                        error = %e,
                        "invalid cron schedule, skipping verb"
                    );
                    continue;
                }
            };
            jobs.push(CronJob {
                key: CronJobKey::new(&module.name, &verb.name),
                deployment_key: DeploymentKey::default(),
                verb: VerbRef::new(&module.name, &verb.name),
                schedule: schedule.to_string(),
                start_time: now,
                next_execution,
                state: CronJobState::Idle,
            });
        }
        jobs
    }

    /// Reload the job list, giving the jobs of `deployment` the grace window.
    pub async fn created_or_replaced_deployment(&self, deployment: DeploymentKey) -> Result<()> {
        let jobs = self
            .inner
            .dal
            .list_jobs()
            .await
            .map_err(|e| SchedulerError::from(e).context("failed to list cron jobs"))?;
        info!(deployment = %deployment, jobs = jobs.len(), "deployment changed, resetting cron jobs");
        if !self.inner.events.publish(JobChange::reset(jobs, Some(deployment))) {
            return Err(SchedulerError::Channel("reset event dropped".to_string()));
        }
        Ok(())
    }

    /// Rebuild the hash ring for a new controller list.
    ///
    /// Returns false, and emits nothing, when the list is unchanged. The
    /// check and the swap are one atomic step, so concurrent callers with the
    /// same list emit a single `HashRingUpdated`.
    pub fn updated_controller_list(&self, controllers: &[Controller]) -> bool {
        let Some(state) = self.inner.ring.replace_if_changed(controllers, &self.inner.key) else {
            trace!("controller list unchanged");
            return false;
        };
        match state.idx() {
            Some(idx) => debug!(controllers = controllers.len(), idx, "hash ring rebuilt"),
            None => trace!(
                controller = %self.inner.key,
                "this controller is not in the controller list, responsible for no jobs"
            ),
        }
        self.inner.events.publish(JobChange::hash_ring_updated());
        true
    }

    /// Spawn the event loop and register the reset and stale-job tasks.
    /// May only be called once.
    pub fn start(
        &self,
        tasks: &dyn TaskScheduler,
        cancel: CancellationToken,
    ) -> Result<JoinHandle<()>> {
        let receiver = self
            .receiver
            .lock()
            .map_err(|_| SchedulerError::AlreadyStarted)?
            .take()
            .ok_or(SchedulerError::AlreadyStarted)?;

        let event_loop = EventLoop::new(Arc::clone(&self.inner), receiver, cancel);
        let handle = tokio::spawn(event_loop.run());

        let inner = Arc::clone(&self.inner);
        let reset: TaskJob = Arc::new(move || {
            let inner = Arc::clone(&inner);
            async move { inner.reset_jobs().await }.boxed()
        });
        tasks.parallel(
            "reset-jobs",
            Backoff::new(Duration::from_secs(1), JOB_RESET_INTERVAL),
            reset,
        );

        let inner = Arc::clone(&self.inner);
        let kill: TaskJob = Arc::new(move || {
            let inner = Arc::clone(&inner);
            async move { inner.kill_stale_jobs().await }.boxed()
        });
        tasks.singleton(
            "kill-stale-jobs",
            Backoff::new(Duration::from_secs(1), KILL_STALE_PERIOD),
            kill,
        );

        info!(controller = %self.inner.key, "cron service started");
        Ok(handle)
    }

    /// List every job and publish a full reset.
    pub async fn reset_jobs(&self) -> Result<Duration> {
        self.inner.reset_jobs().await
    }

    /// End jobs executing past the stale cutoff.
    pub async fn kill_stale_jobs(&self) -> Result<Duration> {
        self.inner.kill_stale_jobs().await
    }
}
