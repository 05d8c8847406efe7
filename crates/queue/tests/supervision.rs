use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use courier_core::ManualClock;
use courier_queue::supervisor::recover_all;
use courier_queue::{
    HealthConfig, HealthMonitor, Heartbeat, HeartbeatConfig, InMemoryBackend, JobContext, JobError, JobHandler,
    JobOptions, JobState, QueueBackend, QueueDefinition, QueueJob, QueueManager, ShutdownOutcome, Supervisor,
    SupervisorConfig, WorkerOptions,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "name", content = "data")]
enum Ping {
    Ping,
}

impl QueueJob for Ping {
    const QUEUE: &'static str = "ping";

    fn name(&self) -> &'static str {
        "Ping"
    }
}

struct Noop;

#[async_trait]
impl JobHandler<Ping> for Noop {
    async fn handle(&self, _job: Ping, _ctx: JobContext) -> Result<(), JobError> {
        Ok(())
    }
}

const LOCK: Duration = Duration::from_secs(120);

async fn manager_with(backend: Arc<InMemoryBackend>) -> Arc<QueueManager> {
    let manager = Arc::new(QueueManager::connect(backend).await.unwrap());
    manager.define(
        QueueDefinition::new(Ping::QUEUE)
            .with_worker(WorkerOptions::default().with_poll_interval(Duration::from_millis(10))),
    );
    manager
}

#[tokio::test]
async fn connect_fails_when_backend_is_down() {
    let backend = Arc::new(InMemoryBackend::new());
    backend.set_available(false);
    assert!(QueueManager::connect(backend).await.is_err());
}

#[tokio::test]
async fn heartbeat_restarts_stopped_workers() {
    let manager = manager_with(Arc::new(InMemoryBackend::new())).await;
    manager.start_worker::<Ping, _>(Arc::new(Noop));

    assert!(manager.stop_worker(Ping::QUEUE));
    for _ in 0..100 {
        if !manager.worker_status()[0].running {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!manager.worker_status()[0].running);

    let heartbeat = Heartbeat::new(manager.clone(), HeartbeatConfig::default());
    let report = heartbeat.tick().await;
    assert!(report.backend_ok);
    assert_eq!(report.restarted, vec![Ping::QUEUE]);
    assert!(manager.worker_status()[0].running);

    manager.shutdown_workers(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn heartbeat_survives_backend_outage() {
    let backend = Arc::new(InMemoryBackend::new());
    let manager = manager_with(backend.clone()).await;
    backend.set_available(false);

    let report = Heartbeat::new(manager, HeartbeatConfig::default()).tick().await;
    assert!(!report.backend_ok);
    assert!(report.restarted.is_empty());
}

#[tokio::test]
async fn health_monitor_prunes_failed_and_requeues_overruns() {
    let clock = ManualClock::arc(Utc::now());
    let backend = Arc::new(InMemoryBackend::with_clock(clock.clone()));
    let manager = manager_with(backend.clone()).await;
    let q = Ping::QUEUE;

    let once = JobOptions::default().with_attempts(1);
    for _ in 0..5 {
        let id = backend.add(q, "Ping", serde_json::Value::Null, once.clone()).await.unwrap();
        let claimed = backend.claim(q, LOCK).await.unwrap().unwrap();
        assert_eq!(claimed.job.id, id);
        backend.fail(q, &id, claimed.token, "boom", false).await.unwrap();
    }

    let mut old = Vec::new();
    for _ in 0..3 {
        backend.add(q, "Ping", serde_json::Value::Null, JobOptions::default()).await.unwrap();
        old.push(backend.claim(q, LOCK).await.unwrap().unwrap());
    }
    clock.advance(chrono::Duration::minutes(6));
    backend.add(q, "Ping", serde_json::Value::Null, JobOptions::default()).await.unwrap();
    let fresh = backend.claim(q, LOCK).await.unwrap().unwrap();

    let config = HealthConfig {
        max_failed: 2,
        max_active: 2,
        ..Default::default()
    };
    let monitor = HealthMonitor::with_clock(manager, config, clock.clone());
    let reports = monitor.check_all().await;

    assert_eq!(reports.len(), 1);
    let health = reports[0].outcome.as_ref().unwrap();
    assert_eq!(health.counts.failed, 5);
    assert_eq!(health.pruned, 3);
    assert_eq!(health.requeued.len(), 3);
    assert!(!health.requeued.contains(&fresh.job.id));

    let counts = backend.counts(q).await.unwrap();
    assert_eq!(counts.failed, 2);
    assert_eq!(counts.active, 1);
    assert_eq!(counts.waiting, 3);

    // The worker whose lease was revoked can no longer settle.
    let stale = &old[0];
    assert!(backend.complete(q, &stale.job.id, stale.token).await.is_err());
    let again = backend.claim(q, LOCK).await.unwrap().unwrap();
    assert_eq!(again.job.state, JobState::Active);
}

#[tokio::test]
async fn health_check_reports_errors_per_queue() {
    let backend = Arc::new(InMemoryBackend::new());
    let manager = manager_with(backend.clone()).await;
    backend.set_available(false);

    let reports = HealthMonitor::new(manager, HealthConfig::default()).check_all().await;
    assert_eq!(reports.len(), 1);
    assert!(reports[0].outcome.is_err());
}

#[tokio::test]
async fn recovery_pass_requeues_lapsed_leases() {
    let clock = ManualClock::arc(Utc::now());
    let backend = Arc::new(InMemoryBackend::with_clock(clock.clone()));
    let manager = manager_with(backend.clone()).await;

    backend.add(Ping::QUEUE, "Ping", serde_json::Value::Null, JobOptions::default()).await.unwrap();
    backend.claim(Ping::QUEUE, Duration::from_secs(1)).await.unwrap().unwrap();
    clock.advance(chrono::Duration::seconds(2));

    assert_eq!(recover_all(&manager).await, 1);
    assert_eq!(backend.counts(Ping::QUEUE).await.unwrap().waiting, 1);
}

#[tokio::test]
async fn supervisor_shuts_down_in_order() {
    let backend = Arc::new(InMemoryBackend::new());
    let manager = manager_with(backend.clone()).await;
    manager.start_worker::<Ping, _>(Arc::new(Noop));

    let mut supervisor = Supervisor::new(manager.clone(), SupervisorConfig::default());
    supervisor.start();

    let flushed = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let flag = flushed.clone();
    let outcome = supervisor
        .shutdown(async move {
            flag.store(true, std::sync::atomic::Ordering::SeqCst);
        })
        .await;

    assert_eq!(outcome, ShutdownOutcome::Completed { aborted_workers: 0 });
    assert!(flushed.load(std::sync::atomic::Ordering::SeqCst));
    assert!(manager.is_shutting_down());
    assert!(backend.ping().await.is_err());
}
