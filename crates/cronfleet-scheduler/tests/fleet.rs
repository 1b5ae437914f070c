//! End-to-end scheduling scenarios: several `CronService`s sharing one store
//! and one mocked clock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio_util::sync::CancellationToken;

use cronfleet_core::config::KILL_STALE_PERIOD;
use cronfleet_core::{
    Controller, ControllerKey, CronJob, CronJobState, DeploymentKey, MockClock, VerbRef,
};
use cronfleet_scheduler::{
    Backoff, CallRequest, CallResponse, CronJobDal, CronService, DeploymentDal, HashRingState,
    InMemoryDal, Module, RequestKey, SqliteDal, TaskJob, TaskScheduler, Verb, VerbCaller,
    VerbError, VerbMetadata,
};

/// Records every call and answers immediately.
#[derive(Default)]
struct RecordingCaller {
    calls: Mutex<Vec<(VerbRef, String)>>,
}

impl RecordingCaller {
    fn count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn per_verb(&self) -> HashMap<VerbRef, usize> {
        let mut counts = HashMap::new();
        for (verb, _) in self.calls.lock().unwrap().iter() {
            *counts.entry(verb.clone()).or_default() += 1;
        }
        counts
    }
}

#[async_trait]
impl VerbCaller for RecordingCaller {
    async fn call(
        &self,
        request: CallRequest,
        request_key: Option<RequestKey>,
        _origin_host: &str,
    ) -> Result<CallResponse, VerbError> {
        let key = request_key.map(|k| k.0).unwrap_or_default();
        assert_eq!(request.body, serde_json::json!({}));
        self.calls.lock().unwrap().push((request.verb, key));
        Ok(CallResponse {
            body: serde_json::Value::Null,
        })
    }
}

/// Counts calls and answers each one with a remote error.
#[derive(Default)]
struct FailingCaller {
    calls: AtomicUsize,
}

#[async_trait]
impl VerbCaller for FailingCaller {
    async fn call(
        &self,
        request: CallRequest,
        _request_key: Option<RequestKey>,
        _origin_host: &str,
    ) -> Result<CallResponse, VerbError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(VerbError::Remote {
            verb: request.verb.to_string(),
            message: "HTTP 500: boom".to_string(),
        })
    }
}

/// Counts calls and never answers.
#[derive(Default)]
struct HangingCaller {
    calls: AtomicUsize,
}

#[async_trait]
impl VerbCaller for HangingCaller {
    async fn call(
        &self,
        _request: CallRequest,
        _request_key: Option<RequestKey>,
        _origin_host: &str,
    ) -> Result<CallResponse, VerbError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::future::pending().await
    }
}

/// Housekeeping is driven by hand in these tests.
struct ManualTasks;

impl TaskScheduler for ManualTasks {
    fn singleton(&self, _name: &str, _backoff: Backoff, _job: TaskJob) {}
    fn parallel(&self, _name: &str, _backoff: Backoff, _job: TaskJob) {}
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

fn secs(n: i64) -> chrono::Duration {
    chrono::Duration::seconds(n)
}

fn module(name: &str, verbs: usize, schedule: &str) -> Module {
    Module {
        name: name.to_string(),
        verbs: (0..verbs)
            .map(|i| Verb {
                name: format!("verb{i}"),
                metadata: vec![VerbMetadata::Cron {
                    schedule: schedule.to_string(),
                }],
            })
            .collect(),
    }
}

fn build<C: VerbCaller + 'static>(
    key: &str,
    clock: &MockClock,
    dal: &Arc<InMemoryDal>,
    caller: &Arc<C>,
) -> CronService {
    CronService::builder()
        .key(ControllerKey::from(key))
        .clock(Arc::new(clock.clone()))
        .dal(dal.clone())
        .verb_caller(caller.clone())
        .timeout(Duration::from_secs(30))
        .build()
        .unwrap()
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn all_idle(dal: &InMemoryDal) -> bool {
    dal.jobs().iter().all(|j| j.state == CronJobState::Idle)
}

/// Register `jobs` as the active deployment of `module`.
async fn deploy(dal: &InMemoryDal, module: &str, jobs: Vec<CronJob>) -> DeploymentKey {
    let key = dal.create_deployment(module, jobs).await.unwrap();
    dal.replace_deployment(&key, 1).await.unwrap();
    key
}

#[tokio::test]
async fn fleet_fires_each_job_once_per_tick() {
    let clock = MockClock::new(t0());
    let dal = Arc::new(InMemoryDal::new(Arc::new(clock.clone())));
    let caller = Arc::new(RecordingCaller::default());
    let cancel = CancellationToken::new();

    let keys: Vec<String> = (0..5).map(|i| format!("ctr-{i}")).collect();
    let fleet: Vec<Controller> = keys.iter().map(|k| Controller::new(k.as_str())).collect();
    let services: Vec<CronService> = keys
        .iter()
        .map(|k| build(k, &clock, &dal, &caller))
        .collect();

    let jobs = services[0].new_jobs_for_module(&module("echo", 20, "*/10 * * * * *"), t0());
    assert_eq!(jobs.len(), 20);
    deploy(&dal, "echo", jobs).await;

    for svc in &services {
        assert!(svc.updated_controller_list(&fleet));
        svc.start(&ManualTasks, cancel.clone()).unwrap();
        svc.reset_jobs().await.unwrap();
    }
    settle().await;

    clock.advance(secs(5));
    settle().await;
    assert_eq!(caller.count(), 0);

    for tick in 1..=3 {
        clock.advance(secs(10));
        wait_for(|| caller.count() == 20 * tick).await;
        wait_for(|| all_idle(&dal)).await;
        settle().await;
    }

    let per_verb = caller.per_verb();
    assert_eq!(per_verb.len(), 20);
    assert!(per_verb.values().all(|&n| n == 3), "{per_verb:?}");
    for (verb, key) in caller.calls.lock().unwrap().iter() {
        assert!(key.starts_with(&format!("cron-{}-{}-", verb.module, verb.name)));
    }

    // Only the two responsible controllers ever raced for a job.
    let ring = HashRingState::new(fleet.clone(), &fleet[0].key);
    for job in dal.jobs() {
        let owners = (0..fleet.len())
            .filter(|&idx| ring.responsible_for(&job.key, idx, 2))
            .count();
        assert_eq!(owners, 2);
        assert!(dal.attempt_count(&job.key) <= 2 * 3);
        assert_eq!(job.next_execution, t0() + secs(40));
    }
    cancel.cancel();
}

/// Pick a job that the ring assigns to controllers other than `fleet[0]`.
fn job_outside_first_controller(svc: &CronService, fleet: &[Controller]) -> CronJob {
    let ring = HashRingState::new(fleet.to_vec(), &fleet[0].key);
    loop {
        let job = svc
            .new_jobs_for_module(&module("fresh", 1, "*/10 * * * * *"), t0())
            .remove(0);
        if !ring.is_responsible(&job.key) {
            return job;
        }
    }
}

#[tokio::test]
async fn new_deployment_bypasses_the_ring_during_grace_window() {
    let clock = MockClock::new(t0());
    let dal = Arc::new(InMemoryDal::new(Arc::new(clock.clone())));
    let caller = Arc::new(RecordingCaller::default());
    let cancel = CancellationToken::new();
    let fleet: Vec<Controller> = ["ctr-x", "ctr-y", "ctr-z"]
        .into_iter()
        .map(Controller::new)
        .collect();

    let x = build("ctr-x", &clock, &dal, &caller);
    x.updated_controller_list(&fleet);
    let job = job_outside_first_controller(&x, &fleet);
    let deployment = deploy(&dal, "fresh", vec![job.clone()]).await;

    x.start(&ManualTasks, cancel.clone()).unwrap();
    x.created_or_replaced_deployment(deployment).await.unwrap();
    settle().await;

    clock.advance(secs(15));
    wait_for(|| caller.count() == 1).await;
    wait_for(|| all_idle(&dal)).await;
    settle().await;

    // Past the 80 s window the ring applies again and X stops attempting.
    clock.set(t0() + secs(95));
    settle().await;
    clock.advance(secs(10));
    settle().await;
    assert_eq!(caller.count(), 1);
    assert_eq!(dal.attempt_count(&job.key), 1);
    cancel.cancel();
}

#[tokio::test]
async fn plain_reset_respects_the_ring() {
    let clock = MockClock::new(t0());
    let dal = Arc::new(InMemoryDal::new(Arc::new(clock.clone())));
    let caller = Arc::new(RecordingCaller::default());
    let cancel = CancellationToken::new();
    let fleet: Vec<Controller> = ["ctr-x", "ctr-y", "ctr-z"]
        .into_iter()
        .map(Controller::new)
        .collect();

    let x = build("ctr-x", &clock, &dal, &caller);
    x.updated_controller_list(&fleet);
    let job = job_outside_first_controller(&x, &fleet);
    deploy(&dal, "fresh", vec![job.clone()]).await;

    x.start(&ManualTasks, cancel.clone()).unwrap();
    x.reset_jobs().await.unwrap();
    settle().await;

    clock.advance(secs(15));
    settle().await;
    assert_eq!(caller.count(), 0);
    assert_eq!(dal.attempt_count(&job.key), 0);
    cancel.cancel();
}

#[tokio::test]
async fn zero_replicas_end_the_job_without_dispatch() {
    let clock = MockClock::new(t0());
    let dal = Arc::new(InMemoryDal::new(Arc::new(clock.clone())));
    let caller = Arc::new(RecordingCaller::default());
    let cancel = CancellationToken::new();

    let svc = build("ctr-a", &clock, &dal, &caller);
    svc.updated_controller_list(&[Controller::new("ctr-a")]);
    let job = svc
        .new_jobs_for_module(&module("idle", 1, "*/10 * * * * *"), t0())
        .remove(0);
    let deployment = deploy(&dal, "idle", vec![job.clone()]).await;

    svc.start(&ManualTasks, cancel.clone()).unwrap();
    svc.reset_jobs().await.unwrap();
    settle().await;

    // Scaled to zero after the loop loaded its jobs.
    dal.set_min_replicas(&deployment, 0);
    clock.advance(secs(15));
    wait_for(|| dal.attempt_count(&job.key) == 1).await;
    wait_for(|| all_idle(&dal)).await;

    let stored = dal.job(&job.key).unwrap();
    assert_eq!(stored.next_execution, t0() + secs(10));
    assert_eq!(caller.count(), 0);

    // The deployment's jobs were dropped from the loop.
    clock.advance(secs(30));
    settle().await;
    assert_eq!(dal.attempt_count(&job.key), 1);
    cancel.cancel();
}

#[tokio::test]
async fn start_failure_blocks_attempts_for_five_seconds() {
    let clock = MockClock::new(t0());
    let dal = Arc::new(InMemoryDal::new(Arc::new(clock.clone())));
    let caller = Arc::new(RecordingCaller::default());
    let cancel = CancellationToken::new();

    let svc = build("ctr-a", &clock, &dal, &caller);
    svc.updated_controller_list(&[Controller::new("ctr-a")]);
    let job = svc
        .new_jobs_for_module(&module("flaky", 1, "*/10 * * * * *"), t0())
        .remove(0);
    deploy(&dal, "flaky", vec![job.clone()]).await;

    svc.start(&ManualTasks, cancel.clone()).unwrap();
    svc.reset_jobs().await.unwrap();
    settle().await;

    dal.fail_next_starts(1);
    clock.advance(secs(10));
    settle().await;
    assert_eq!(dal.attempt_count(&job.key), 0);

    clock.advance(secs(3));
    settle().await;
    assert_eq!(caller.count(), 0);

    clock.advance(secs(2));
    wait_for(|| caller.count() == 1).await;
    assert_eq!(dal.attempt_count(&job.key), 1);
    cancel.cancel();
}

#[tokio::test]
async fn stale_killer_ends_overrun_jobs_with_next_firing() {
    let clock = MockClock::new(t0());
    let dal = Arc::new(InMemoryDal::new(Arc::new(clock.clone())));
    let caller = Arc::new(RecordingCaller::default());

    let svc = build("ctr-a", &clock, &dal, &caller);
    let job = svc
        .new_jobs_for_module(&module("slow", 1, "*/10 * * * * *"), t0())
        .remove(0);
    deploy(&dal, "slow", vec![job.clone()]).await;

    // A controller claimed the job and then vanished.
    clock.advance(secs(10));
    let started = dal.start_jobs(&[job.clone()]).await.unwrap();
    assert!(started[0].did_start_execution);

    // Timeout 30 s + 60 s margin.
    clock.advance(secs(60));
    assert_eq!(svc.kill_stale_jobs().await.unwrap(), KILL_STALE_PERIOD);
    assert_eq!(dal.job(&job.key).unwrap().state, CronJobState::Executing);

    clock.advance(secs(31));
    svc.kill_stale_jobs().await.unwrap();
    let killed = dal.job(&job.key).unwrap();
    assert_eq!(killed.state, CronJobState::Idle);
    assert_eq!(killed.next_execution, t0() + secs(110));
    assert_eq!(caller.count(), 0);
}

#[tokio::test]
async fn failed_call_still_ends_the_job() {
    let clock = MockClock::new(t0());
    let dal = Arc::new(InMemoryDal::new(Arc::new(clock.clone())));
    let caller = Arc::new(FailingCaller::default());
    let cancel = CancellationToken::new();

    let svc = build("ctr-a", &clock, &dal, &caller);
    svc.updated_controller_list(&[Controller::new("ctr-a")]);
    let job = svc
        .new_jobs_for_module(&module("broken", 1, "*/10 * * * * *"), t0())
        .remove(0);
    deploy(&dal, "broken", vec![job.clone()]).await;

    svc.start(&ManualTasks, cancel.clone()).unwrap();
    svc.reset_jobs().await.unwrap();
    settle().await;

    clock.advance(secs(10));
    wait_for(|| caller.calls.load(Ordering::SeqCst) == 1).await;
    wait_for(|| all_idle(&dal)).await;
    let stored = dal.job(&job.key).unwrap();
    assert_eq!(stored.next_execution, t0() + secs(20));
    settle().await;

    // The failure does not stop later firings.
    clock.advance(secs(10));
    wait_for(|| caller.calls.load(Ordering::SeqCst) == 2).await;
    wait_for(|| all_idle(&dal)).await;
    assert_eq!(dal.job(&job.key).unwrap().next_execution, t0() + secs(30));
    cancel.cancel();
}

#[tokio::test]
async fn call_past_the_timeout_is_abandoned_and_ended() {
    let clock = MockClock::new(t0());
    let dal = Arc::new(InMemoryDal::new(Arc::new(clock.clone())));
    let caller = Arc::new(HangingCaller::default());
    let cancel = CancellationToken::new();

    let svc = build("ctr-a", &clock, &dal, &caller);
    svc.updated_controller_list(&[Controller::new("ctr-a")]);
    let job = svc
        .new_jobs_for_module(&module("stuck", 1, "*/10 * * * * *"), t0())
        .remove(0);
    deploy(&dal, "stuck", vec![job.clone()]).await;

    svc.start(&ManualTasks, cancel.clone()).unwrap();
    svc.reset_jobs().await.unwrap();
    settle().await;

    clock.advance(secs(10));
    wait_for(|| caller.calls.load(Ordering::SeqCst) == 1).await;
    settle().await;

    // Still inside the 30 s timeout: the job stays claimed and is not retried.
    clock.advance(secs(20));
    settle().await;
    assert_eq!(dal.job(&job.key).unwrap().state, CronJobState::Executing);
    assert_eq!(caller.calls.load(Ordering::SeqCst), 1);

    clock.advance(secs(10));
    wait_for(|| all_idle(&dal)).await;
    let stored = dal.job(&job.key).unwrap();
    assert_eq!(stored.next_execution, t0() + secs(50));
    assert_eq!(dal.attempt_count(&job.key), 1);
    cancel.cancel();
}

struct TempDb(std::path::PathBuf);

impl TempDb {
    fn new() -> Self {
        Self(std::env::temp_dir().join(format!(
            "cronfleet-fleet-{}.db",
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

#[tokio::test]
async fn controllers_share_a_sqlite_store() {
    let db = TempDb::new();
    let clock = MockClock::new(t0());
    let caller = Arc::new(RecordingCaller::default());
    let cancel = CancellationToken::new();
    let fleet = vec![Controller::new("ctr-a"), Controller::new("ctr-b")];

    let mut services = Vec::new();
    let mut stores = Vec::new();
    for controller in &fleet {
        let dal = Arc::new(SqliteDal::open(db.path(), Arc::new(clock.clone())).unwrap());
        let svc = CronService::builder()
            .key(controller.key.clone())
            .clock(Arc::new(clock.clone()))
            .dal(dal.clone())
            .verb_caller(caller.clone())
            .build()
            .unwrap();
        svc.updated_controller_list(&fleet);
        stores.push(dal);
        services.push(svc);
    }

    let jobs = services[0].new_jobs_for_module(&module("shared", 3, "*/10 * * * * *"), t0());
    let key = stores[0].create_deployment("shared", jobs).await.unwrap();
    stores[0].replace_deployment(&key, 1).await.unwrap();

    for svc in &services {
        svc.start(&ManualTasks, cancel.clone()).unwrap();
        svc.created_or_replaced_deployment(key.clone()).await.unwrap();
    }
    settle().await;

    for tick in 1..=3 {
        clock.advance(secs(10));
        wait_for(|| caller.count() == 3 * tick).await;
        settle().await;
    }
    let per_verb = caller.per_verb();
    assert_eq!(per_verb.len(), 3);
    assert!(per_verb.values().all(|&n| n == 3), "{per_verb:?}");

    let stored = stores[1].list_jobs().await.unwrap();
    assert!(stored.iter().all(|j| j.state == CronJobState::Idle));
    cancel.cancel();
}
