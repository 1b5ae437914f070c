use std::time::Duration;

use tracing::{debug, error, info, warn};

use cronfleet_core::config::{JOB_RESET_INTERVAL, KILL_STALE_PERIOD, STALE_OVERRUN_MARGIN};

use crate::engine::next_firing;
use crate::error::{Result, SchedulerError};
use crate::events::JobChange;
use crate::service::ServiceInner;

impl ServiceInner {
    /// Publish the full job list. Runs on every controller.
    pub(crate) async fn reset_jobs(&self) -> Result<Duration> {
        let jobs = self
            .dal
            .list_jobs()
            .await
            .map_err(|e| SchedulerError::from(e).context("failed to list cron jobs"))?;
        debug!(jobs = jobs.len(), "periodic cron job reset");
        self.events.publish(JobChange::reset(jobs, None));
        Ok(JOB_RESET_INTERVAL)
    }

    /// End every job executing longer than the call timeout plus
    /// [`STALE_OVERRUN_MARGIN`], rescheduling it at its next firing.
    pub(crate) async fn kill_stale_jobs(&self) -> Result<Duration> {
        let overrun = self.timeout + STALE_OVERRUN_MARGIN;
        let stale = self
            .dal
            .list_stale(overrun)
            .await
            .map_err(|e| SchedulerError::from(e).context("failed to list stale cron jobs"))?;
        if stale.is_empty() {
            return Ok(KILL_STALE_PERIOD);
        }
        warn!(count = stale.len(), "killing stale cron jobs");

        let now = self.clock.now();
        let mut killed = Vec::with_capacity(stale.len());
        for job in stale {
            let next = match next_firing(&job.schedule, now, false) {
                Ok(next) => next,
                Err(e) => {
                    error!(job = %job.key, error = %e, "cannot reschedule stale cron job");
                    continue;
                }
            };
            match self.dal.end_job(&job, next).await {
                Ok(ended) => {
                    info!(job = %ended.key, started = %job.start_time, next = %next, "killed stale cron job");
                    killed.push(ended);
                }
                Err(e) => error!(job = %job.key, error = %e, "failed to kill stale cron job"),
            }
        }
        if !killed.is_empty() {
            self.events.publish(JobChange::finished(killed));
        }
        Ok(KILL_STALE_PERIOD)
    }
}
