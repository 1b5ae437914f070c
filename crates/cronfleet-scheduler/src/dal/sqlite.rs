use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, types::Type, Connection, OptionalExtension, Row, TransactionBehavior};
use tracing::{debug, info, instrument};

use cronfleet_core::{
    saturating_add, Clock, ControllerKey, CronJob, CronJobKey, CronJobState, DeploymentKey,
    VerbRef,
};

use super::{stale_cutoff, AttemptedCronJob, CronJobDal, DeploymentDal, LeaseDal};
use crate::db::{self, format_time, init_db};
use crate::error::DalError;

const JOB_COLUMNS: &str = "j.key, j.deployment_key, j.module, j.verb, j.schedule,
                           j.start_time, j.next_execution, j.state";

/// SQLite-backed store shared by every controller pointing at the same file.
///
/// Each mutation runs in an `IMMEDIATE` transaction, so the conditional
/// claim in `start_jobs` is serialised across connections and processes.
pub struct SqliteDal {
    conn: Mutex<Connection>,
    clock: Arc<dyn Clock>,
}

impl SqliteDal {
    pub fn new(conn: Connection, clock: Arc<dyn Clock>) -> Result<Self, DalError> {
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            clock,
        })
    }

    pub fn open(path: &str, clock: Arc<dyn Clock>) -> Result<Self, DalError> {
        Self::new(db::open(path)?, clock)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, DalError> {
        self.conn.lock().map_err(|_| DalError::Poisoned)
    }
}

fn conversion_error(
    idx: usize,
    err: impl Into<Box<dyn std::error::Error + Send + Sync>>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, err.into())
}

fn time_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    db::parse_time(&text).map_err(|e| conversion_error(idx, e))
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<CronJob> {
    let state: String = row.get(7)?;
    Ok(CronJob {
        key: CronJobKey(row.get(0)?),
        deployment_key: DeploymentKey(row.get(1)?),
        verb: VerbRef::new(row.get::<_, String>(2)?, row.get::<_, String>(3)?),
        schedule: row.get(4)?,
        start_time: time_column(row, 5)?,
        next_execution: time_column(row, 6)?,
        state: state
            .parse::<CronJobState>()
            .map_err(|e| conversion_error(7, e))?,
    })
}

#[async_trait]
impl CronJobDal for SqliteDal {
    async fn list_jobs(&self) -> Result<Vec<CronJob>, DalError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {JOB_COLUMNS}
             FROM cron_jobs j
             JOIN deployments d ON d.key = j.deployment_key
             WHERE d.min_replicas > 0
             ORDER BY j.next_execution"
        ))?;
        let jobs = stmt
            .query_map([], job_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }

    #[instrument(skip_all, fields(candidates = candidates.len()))]
    async fn start_jobs(&self, candidates: &[CronJob]) -> Result<Vec<AttemptedCronJob>, DalError> {
        let now = format_time(self.clock.now());
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut attempted = Vec::with_capacity(candidates.len());
        {
            let mut claim = tx.prepare(
                "UPDATE cron_jobs SET state = 'executing', start_time = ?1
                 WHERE key = ?2 AND state = 'idle' AND next_execution <= ?1",
            )?;
            let mut fetch = tx.prepare(&format!(
                "SELECT {JOB_COLUMNS}, d.min_replicas
                 FROM cron_jobs j
                 JOIN deployments d ON d.key = j.deployment_key
                 WHERE j.key = ?1"
            ))?;

            for candidate in candidates {
                let did_start = claim.execute(params![now, candidate.key.as_str()])? == 1;
                let stored = fetch
                    .query_row([candidate.key.as_str()], |row| {
                        Ok((job_from_row(row)?, row.get::<_, i64>(8)?))
                    })
                    .optional()?;
                let Some((job, min_replicas)) = stored else {
                    debug!(job = %candidate.key, "start candidate no longer exists");
                    continue;
                };
                attempted.push(AttemptedCronJob {
                    job,
                    did_start_execution: did_start,
                    has_min_replicas: min_replicas > 0,
                });
            }
        }
        tx.commit()?;
        Ok(attempted)
    }

    async fn end_job(
        &self,
        job: &CronJob,
        next_execution: DateTime<Utc>,
    ) -> Result<CronJob, DalError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let stored: Option<(String, String)> = tx
            .query_row(
                "SELECT state, start_time FROM cron_jobs WHERE key = ?1",
                [job.key.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((state, start_time)) = stored else {
            return Err(DalError::JobNotFound {
                key: job.key.clone(),
            });
        };
        if state != CronJobState::Executing.to_string() {
            return Err(DalError::NotExecuting {
                key: job.key.clone(),
            });
        }
        if start_time != format_time(job.start_time) {
            return Err(DalError::StartTimeMismatch {
                key: job.key.clone(),
            });
        }

        tx.execute(
            "UPDATE cron_jobs SET state = 'idle', next_execution = ?1 WHERE key = ?2",
            params![format_time(next_execution), job.key.as_str()],
        )?;
        let ended = tx.query_row(
            &format!("SELECT {JOB_COLUMNS} FROM cron_jobs j WHERE j.key = ?1"),
            [job.key.as_str()],
            job_from_row,
        )?;
        tx.commit()?;
        Ok(ended)
    }

    async fn list_stale(&self, overrun: Duration) -> Result<Vec<CronJob>, DalError> {
        let Some(cutoff) = stale_cutoff(self.clock.now(), overrun) else {
            return Ok(Vec::new());
        };
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {JOB_COLUMNS}
             FROM cron_jobs j
             WHERE j.state = 'executing' AND j.start_time < ?1
             ORDER BY j.start_time"
        ))?;
        let jobs = stmt
            .query_map([format_time(cutoff)], job_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }
}

#[async_trait]
impl DeploymentDal for SqliteDal {
    async fn create_deployment(
        &self,
        module: &str,
        jobs: Vec<CronJob>,
    ) -> Result<DeploymentKey, DalError> {
        let key = DeploymentKey::new(module);
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "INSERT INTO deployments (key, module, min_replicas, created_at)
             VALUES (?1, ?2, 0, ?3)",
            params![key.as_str(), module, format_time(self.clock.now())],
        )?;
        {
            let mut insert = tx.prepare(
                "INSERT INTO cron_jobs
                 (key, deployment_key, module, verb, schedule, start_time, next_execution, state)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?;
            for job in &jobs {
                insert.execute(params![
                    job.key.as_str(),
                    key.as_str(),
                    job.verb.module,
                    job.verb.name,
                    job.schedule,
                    format_time(job.start_time),
                    format_time(job.next_execution),
                    job.state.to_string(),
                ])?;
            }
        }
        tx.commit()?;
        info!(deployment = %key, %module, jobs = jobs.len(), "deployment created");
        Ok(key)
    }

    async fn replace_deployment(
        &self,
        key: &DeploymentKey,
        min_replicas: u32,
    ) -> Result<(), DalError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let module: Option<String> = tx
            .query_row(
                "SELECT module FROM deployments WHERE key = ?1",
                [key.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        let Some(module) = module else {
            return Err(DalError::DeploymentNotFound { key: key.clone() });
        };

        tx.execute(
            "UPDATE deployments SET min_replicas = ?1 WHERE key = ?2",
            params![min_replicas, key.as_str()],
        )?;
        let removed = tx.execute(
            "DELETE FROM cron_jobs WHERE deployment_key IN
                 (SELECT key FROM deployments WHERE module = ?1 AND key != ?2)",
            params![module, key.as_str()],
        )?;
        tx.execute(
            "UPDATE deployments SET min_replicas = 0 WHERE module = ?1 AND key != ?2",
            params![module, key.as_str()],
        )?;
        tx.commit()?;
        info!(deployment = %key, %module, min_replicas, removed_jobs = removed, "deployment replaced");
        Ok(())
    }

    async fn delete_jobs_for_deployment(&self, key: &DeploymentKey) -> Result<usize, DalError> {
        let conn = self.conn()?;
        let n = conn.execute(
            "DELETE FROM cron_jobs WHERE deployment_key = ?1",
            [key.as_str()],
        )?;
        Ok(n)
    }
}

#[async_trait]
impl LeaseDal for SqliteDal {
    async fn try_acquire_lease(
        &self,
        name: &str,
        holder: &ControllerKey,
        ttl: Duration,
    ) -> Result<bool, DalError> {
        let now = self.clock.now();
        let expires_at = saturating_add(now, ttl);
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current: Option<(String, String)> = tx
            .query_row(
                "SELECT holder, expires_at FROM leases WHERE name = ?1",
                [name],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        if let Some((current_holder, until)) = current {
            if current_holder != holder.as_str() && until > format_time(now) {
                return Ok(false);
            }
        }

        tx.execute(
            "INSERT INTO leases (name, holder, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT (name) DO UPDATE SET holder = excluded.holder,
                                              expires_at = excluded.expires_at",
            params![name, holder.as_str(), format_time(expires_at)],
        )?;
        tx.commit()?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use cronfleet_core::MockClock;

    struct TempDb(std::path::PathBuf);

    impl TempDb {
        fn new() -> Self {
            Self(std::env::temp_dir().join(format!(
                "cronfleet-test-{}.db",
                uuid::Uuid::new_v4().simple()
            )))
        }

        fn path(&self) -> &str {
            self.0.to_str().unwrap()
        }
    }

    impl Drop for TempDb {
        fn drop(&mut self) {
            for suffix in ["", "-wal", "-shm"] {
                let _ = std::fs::remove_file(format!("{}{}", self.path(), suffix));
            }
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn new_job(verb: &str, next: DateTime<Utc>) -> CronJob {
        CronJob {
            key: CronJobKey::new("echo", verb),
            deployment_key: DeploymentKey::from("unassigned"),
            verb: VerbRef::new("echo", verb),
            schedule: "*/10 * * * * *".to_string(),
            start_time: t0(),
            next_execution: next,
            state: CronJobState::Idle,
        }
    }

    async fn seeded(db: &TempDb, clock: &MockClock, jobs: Vec<CronJob>) -> SqliteDal {
        let dal = SqliteDal::open(db.path(), Arc::new(clock.clone())).unwrap();
        let key = dal.create_deployment("echo", jobs).await.unwrap();
        dal.replace_deployment(&key, 1).await.unwrap();
        dal
    }

    #[tokio::test]
    async fn claim_and_end_round_trip() {
        let db = TempDb::new();
        let clock = MockClock::new(t0());
        let job = new_job("tick", t0());
        let dal = seeded(&db, &clock, vec![job.clone()]).await;

        let listed = dal.list_jobs().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].key, job.key);

        clock.advance(chrono::Duration::milliseconds(1500));
        let attempted = dal.start_jobs(&listed).await.unwrap();
        assert_eq!(attempted.len(), 1);
        assert!(attempted[0].did_start_execution);
        assert!(attempted[0].has_min_replicas);
        let started = attempted[0].job.clone();
        assert_eq!(started.state, CronJobState::Executing);
        assert_eq!(started.start_time, clock.now());

        let again = dal.start_jobs(&listed).await.unwrap();
        assert!(!again[0].did_start_execution);

        let next = t0() + chrono::Duration::seconds(10);
        let ended = dal.end_job(&started, next).await.unwrap();
        assert_eq!(ended.state, CronJobState::Idle);
        assert_eq!(ended.next_execution, next);

        let err = dal.end_job(&started, next).await.unwrap_err();
        assert!(matches!(err, DalError::NotExecuting { .. }));
    }

    #[tokio::test]
    async fn end_job_rejects_a_different_attempt() {
        let db = TempDb::new();
        let clock = MockClock::new(t0());
        let job = new_job("tick", t0());
        let dal = seeded(&db, &clock, vec![job.clone()]).await;

        let started = dal.start_jobs(&[job.clone()]).await.unwrap().remove(0).job;
        let mut other = started.clone();
        other.start_time = started.start_time - chrono::Duration::seconds(1);
        let err = dal.end_job(&other, t0()).await.unwrap_err();
        assert!(matches!(err, DalError::StartTimeMismatch { .. }));

        let mut missing = started;
        missing.key = CronJobKey::from("crn-missing");
        let err = dal.end_job(&missing, t0()).await.unwrap_err();
        assert!(matches!(err, DalError::JobNotFound { .. }));
    }

    #[tokio::test]
    async fn future_jobs_are_not_claimed() {
        let db = TempDb::new();
        let clock = MockClock::new(t0());
        let job = new_job("later", t0() + chrono::Duration::seconds(30));
        let dal = seeded(&db, &clock, vec![job.clone()]).await;

        let attempted = dal.start_jobs(&[job]).await.unwrap();
        assert!(!attempted[0].did_start_execution);
        assert_eq!(attempted[0].job.state, CronJobState::Idle);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_controllers_have_one_winner() {
        let db = TempDb::new();
        let clock = MockClock::new(t0());
        let job = new_job("race", t0());
        seeded(&db, &clock, vec![job.clone()]).await;

        let mut handles = Vec::new();
        for _ in 0..6 {
            let dal = SqliteDal::open(db.path(), Arc::new(clock.clone())).unwrap();
            let job = job.clone();
            handles.push(tokio::spawn(async move {
                dal.start_jobs(&[job]).await.unwrap()
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
    async fn stale_listing_uses_start_time() {
        let db = TempDb::new();
        let clock = MockClock::new(t0());
        let slow = new_job("slow", t0());
        let idle = new_job("idle", t0() + chrono::Duration::hours(1));
        let dal = seeded(&db, &clock, vec![slow.clone(), idle.clone()]).await;
        dal.start_jobs(&[slow.clone(), idle]).await.unwrap();

        clock.advance(chrono::Duration::minutes(5));
        assert!(dal
            .list_stale(Duration::from_secs(6 * 60))
            .await
            .unwrap()
            .is_empty());

        clock.advance(chrono::Duration::minutes(2));
        let stale = dal.list_stale(Duration::from_secs(6 * 60)).await.unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].key, slow.key);
    }

    #[tokio::test]
    async fn zero_replica_deployments_report_no_min_replicas() {
        let db = TempDb::new();
        let clock = MockClock::new(t0());
        let dal = SqliteDal::open(db.path(), Arc::new(clock.clone())).unwrap();
        let job = new_job("dormant", t0());
        dal.create_deployment("echo", vec![job.clone()]).await.unwrap();

        assert!(dal.list_jobs().await.unwrap().is_empty());
        let attempted = dal.start_jobs(&[job]).await.unwrap();
        assert!(attempted[0].did_start_execution);
        assert!(!attempted[0].has_min_replicas);
    }

    #[tokio::test]
    async fn replacing_a_deployment_removes_old_jobs() {
        let db = TempDb::new();
        let clock = MockClock::new(t0());
        let dal = seeded(&db, &clock, vec![new_job("v1", t0())]).await;

        let v2 = dal
            .create_deployment("echo", vec![new_job("v2", t0())])
            .await
            .unwrap();
        dal.replace_deployment(&v2, 1).await.unwrap();

        let jobs = dal.list_jobs().await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].verb.name, "v2");
        assert_eq!(jobs[0].deployment_key, v2);

        assert_eq!(dal.delete_jobs_for_deployment(&v2).await.unwrap(), 1);
        assert!(dal.list_jobs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn leases_are_exclusive_until_expiry() {
        let db = TempDb::new();
        let clock = MockClock::new(t0());
        let dal = SqliteDal::open(db.path(), Arc::new(clock.clone())).unwrap();
        let a = ControllerKey::from("a");
        let b = ControllerKey::from("b");
        let ttl = Duration::from_secs(10);

        assert!(dal.try_acquire_lease("kill", &a, ttl).await.unwrap());
        assert!(!dal.try_acquire_lease("kill", &b, ttl).await.unwrap());
        assert!(dal.try_acquire_lease("kill", &a, ttl).await.unwrap());

        clock.advance(chrono::Duration::seconds(10));
        assert!(dal.try_acquire_lease("kill", &b, ttl).await.unwrap());
    }
}
