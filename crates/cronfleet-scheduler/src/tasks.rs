//! Periodic background tasks with exponential back-off.
//!
//! A task is a closure returning the delay until its next run. `parallel`
//! tasks run on every controller; `singleton` tasks first take a named lease
//! so that only one controller of the fleet runs them at a time.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use rand::Rng;
use tracing::{debug, info, warn};

use cronfleet_core::config::SINGLETON_LEASE_TTL;
use cronfleet_core::{saturating_add, Clock, ControllerKey};

use crate::dal::LeaseDal;
use crate::error::Result;

/// Upper bound of the random delay before a task's first run.
pub const MAX_START_JITTER: Duration = Duration::from_secs(2);

pub type TaskFuture = BoxFuture<'static, Result<Duration>>;

/// A periodic job. Each call performs one run and yields the next delay.
pub type TaskJob = Arc<dyn Fn() -> TaskFuture + Send + Sync>;

/// Exponential back-off between `min` and `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max: max.max(min),
            attempt: 0,
        }
    }

    /// Delay for the current failure; doubles on each call until `max`.
    pub fn next_delay(&mut self) -> Duration {
        let factor = 2u32.saturating_pow(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        self.min.saturating_mul(factor).min(self.max)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Registers periodic tasks.
pub trait TaskScheduler: Send + Sync {
    /// Run `job` on at most one controller of the fleet at a time.
    fn singleton(&self, name: &str, backoff: Backoff, job: TaskJob);

    /// Run `job` on every controller.
    fn parallel(&self, name: &str, backoff: Backoff, job: TaskJob);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Singleton,
    Parallel,
}

/// Runs tasks as tokio tasks in this process, timed on the injected clock.
/// Singleton leases live in the shared [`LeaseDal`].
pub struct LocalTaskScheduler {
    clock: Arc<dyn Clock>,
    leases: Arc<dyn LeaseDal>,
    holder: ControllerKey,
    cancel: CancellationToken,
}

impl LocalTaskScheduler {
    pub fn new(
        clock: Arc<dyn Clock>,
        leases: Arc<dyn LeaseDal>,
        holder: ControllerKey,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            clock,
            leases,
            holder,
            cancel,
        }
    }

    fn spawn(&self, name: &str, mode: Mode, backoff: Backoff, job: TaskJob) {
        let task = TaskRunner {
            name: name.to_string(),
            mode,
            backoff,
            job,
            clock: Arc::clone(&self.clock),
            leases: Arc::clone(&self.leases),
            holder: self.holder.clone(),
            cancel: self.cancel.clone(),
        };
        info!(task = %name, ?mode, "periodic task registered");
        tokio::spawn(task.run());
    }
}

impl TaskScheduler for LocalTaskScheduler {
    fn singleton(&self, name: &str, backoff: Backoff, job: TaskJob) {
        self.spawn(name, Mode::Singleton, backoff, job);
    }

    fn parallel(&self, name: &str, backoff: Backoff, job: TaskJob) {
        self.spawn(name, Mode::Parallel, backoff, job);
    }
}

fn start_jitter() -> Duration {
    let mut rng = rand::thread_rng();
    Duration::from_millis(rng.gen_range(0..MAX_START_JITTER.as_millis() as u64))
}

struct TaskRunner {
    name: String,
    mode: Mode,
    backoff: Backoff,
    job: TaskJob,
    clock: Arc<dyn Clock>,
    leases: Arc<dyn LeaseDal>,
    holder: ControllerKey,
    cancel: CancellationToken,
}

impl TaskRunner {
    fn lease_name(&self) -> String {
        format!("scheduledtask.{}", self.name)
    }

    /// Take or renew the singleton lease for `ttl`.
    async fn hold_lease(&self, ttl: Duration) -> bool {
        match self
            .leases
            .try_acquire_lease(&self.lease_name(), &self.holder, ttl)
            .await
        {
            Ok(held) => held,
            Err(e) => {
                warn!(task = %self.name, error = %e, "lease acquisition failed");
                false
            }
        }
    }

    async fn run(mut self) {
        let mut delay = start_jitter();
        loop {
            let deadline = saturating_add(self.clock.now(), delay);
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = self.clock.sleep_until(deadline) => {}
            }

            if self.mode == Mode::Singleton && !self.hold_lease(SINGLETON_LEASE_TTL).await {
                debug!(task = %self.name, "singleton lease held elsewhere");
                delay = self.backoff.next_delay();
                continue;
            }

            let result = tokio::select! {
                _ = self.cancel.cancelled() => break,
                r = (self.job)() => r,
            };
            match result {
                Ok(next) => {
                    self.backoff.reset();
                    delay = next;
                    if self.mode == Mode::Singleton {
                        // Keep the lease across the idle period.
                        self.hold_lease(SINGLETON_LEASE_TTL + next).await;
                    }
                }
                Err(e) => {
                    delay = self.backoff.next_delay();
                    warn!(task = %self.name, error = %e, retry_in = ?delay, "periodic task failed");
                }
            }
        }
        debug!(task = %self.name, "periodic task stopped");
    }
}
