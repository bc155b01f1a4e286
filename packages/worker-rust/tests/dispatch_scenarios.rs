//! End-to-end dispatcher scenarios against the in-memory queue and status
//! store, on a paused clock.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use workq_core::{JobError, JobId, JobStatus, RedrivePolicy, ResolutionReason};
use workq_worker::queue::memory::QueueCall;
use workq_worker::{
    runner_fn, DispatchError, DispatcherConfig, Handling, InMemoryQueue, InMemoryStatusStore,
    JobContext, JobReport, JobRunner, PollOutcome, QueueClient, QueueError, RunExit, ShutdownController,
    WorkDispatcher,
};

fn secs(s: u64) -> Duration {
    Duration::from_secs(s)
}

fn config(visibility_timeout: u64, heartbeat: u64) -> DispatcherConfig {
    DispatcherConfig {
        wait_time: Duration::ZERO,
        visibility_timeout: secs(visibility_timeout),
        heartbeat_interval: secs(heartbeat),
        exit_when_idle: true,
        ..DispatcherConfig::default()
    }
}

struct Harness<R> {
    queue: Arc<InMemoryQueue>,
    status: Arc<InMemoryStatusStore>,
    dispatcher: WorkDispatcher<InMemoryQueue, InMemoryStatusStore, R>,
}

fn harness<R: JobRunner>(queue: InMemoryQueue, runner: R, config: DispatcherConfig) -> Harness<R> {
    let queue = Arc::new(queue);
    let status = Arc::new(InMemoryStatusStore::new());
    let dispatcher = WorkDispatcher::new(Arc::clone(&queue), Arc::clone(&status), Arc::new(runner), config);
    Harness {
        queue,
        status,
        dispatcher,
    }
}

fn status_of(store: &InMemoryStatusStore, job_id: &str) -> Option<JobStatus> {
    store.record(&JobId::from(job_id)).map(|r| r.status)
}

async fn crash() -> Result<(), JobError> {
    panic!("worker process died")
}

fn sleeping_runner(duration: Duration) -> impl JobRunner {
    runner_fn(move |_| async move {
        tokio::time::sleep(duration).await;
        Ok(())
    })
}

fn failing_runner(err: JobError) -> impl JobRunner {
    runner_fn(move |_| {
        let err = err.clone();
        async move { Err(err) }
    })
}

fn single_report(outcome: Result<PollOutcome, DispatchError>) -> JobReport {
    match outcome.unwrap() {
        PollOutcome::Handled(mut reports) => {
            assert_eq!(reports.len(), 1);
            reports.remove(0)
        }
        PollOutcome::Idle => panic!("expected a message"),
    }
}

#[tokio::test(start_paused = true)]
async fn long_job_is_extended_until_it_returns() {
    let h = harness(InMemoryQueue::new(), sleeping_runner(secs(1500)), config(600, 300));
    h.status.insert_ready("1");
    let id = h.queue.send_body("1");
    let start = Instant::now();

    let report = single_report(h.dispatcher.dispatch_once().await);
    assert_eq!(report.handling, Handling::Ran(ResolutionReason::Succeeded));
    assert!(report.lease_resolved);
    assert!(report.extensions >= 4, "only {} extensions", report.extensions);

    let ops = h.queue.ops();
    assert_eq!(ops.first().unwrap().call, QueueCall::Receive);
    let delete = ops.last().unwrap();
    assert_eq!(delete.call, QueueCall::Delete);
    assert!(delete.at >= start + secs(1500));

    let extends: Vec<_> = ops.iter().filter(|op| op.call == QueueCall::Extend).collect();
    assert!(extends.len() >= 4);
    let mut deadline = start + secs(600);
    for op in extends {
        assert!(op.at < deadline);
        assert!(op.at <= delete.at);
        deadline = op.at + secs(600);
    }

    assert!(h.queue.is_deleted(&id));
    assert_eq!(status_of(&h.status, "1"), Some(JobStatus::Finished));
}

#[tokio::test(start_paused = true)]
async fn one_failed_extension_does_not_lose_the_lease() {
    let queue = InMemoryQueue::new();
    queue.inject_fault(QueueCall::Extend, QueueError::Transient("connection reset".to_string()));
    let config = DispatcherConfig {
        wait_time: Duration::ZERO,
        ..DispatcherConfig::default()
    };
    let h = harness(queue, sleeping_runner(secs(1000)), config);
    h.status.insert_ready("1");
    let id = h.queue.send_body("1");

    let report = single_report(h.dispatcher.dispatch_once().await);
    assert_eq!(report.handling, Handling::Ran(ResolutionReason::Succeeded));
    assert!(report.lease_resolved);
    assert!(report.extensions >= 2, "only {} extensions", report.extensions);

    let calls: Vec<_> = h.queue.ops().iter().map(|op| (op.call, op.ok)).collect();
    assert_eq!(calls[..3], [
        (QueueCall::Receive, true),
        (QueueCall::Extend, false),
        (QueueCall::Extend, true),
    ]);
    assert_eq!(calls.last(), Some(&(QueueCall::Delete, true)));
    assert!(h.queue.is_deleted(&id));
    assert_eq!(status_of(&h.status, "1"), Some(JobStatus::Finished));
}

#[tokio::test(start_paused = true)]
async fn extensions_always_land_before_the_deadline() {
    for (timeout, interval) in [(2, 1), (6, 5), (60, 30), (300, 299), (600, 100)] {
        let h = harness(
            InMemoryQueue::new(),
            sleeping_runner(secs(timeout * 7)),
            config(timeout, interval),
        );
        h.status.insert_ready("1");
        h.queue.send_body("1");
        let start = Instant::now();

        h.dispatcher.dispatch_once().await.unwrap();

        let mut deadline = start + secs(timeout);
        for op in h.queue.ops_of(QueueCall::Extend) {
            assert!(op.ok, "extension failed for ({timeout}, {interval})");
            assert!(op.at < deadline, "late extension for ({timeout}, {interval})");
            deadline = op.at + secs(timeout);
        }
        assert_eq!(h.queue.ops().last().unwrap().call, QueueCall::Delete);
    }
}

#[tokio::test(start_paused = true)]
async fn content_error_deletes_and_marks_failed() {
    let h = harness(
        InMemoryQueue::new(),
        failing_runner(JobError::content("row 12: invalid date '2024-13-01'")),
        config(60, 30),
    );
    h.status.insert_ready("1");
    let id = h.queue.send_body("1");

    let report = single_report(h.dispatcher.dispatch_once().await);
    assert_eq!(report.handling, Handling::Ran(ResolutionReason::ContentError));

    assert!(h.queue.is_deleted(&id));
    let record = h.status.record(&JobId::from("1")).unwrap();
    assert_eq!(record.status, JobStatus::Failed);
    assert!(record.error_message.is_some_and(|m| !m.is_empty()));
}

#[tokio::test(start_paused = true)]
async fn transient_error_releases_for_immediate_retry() {
    let h = harness(
        InMemoryQueue::new(),
        failing_runner(JobError::transient("could not obtain lock")),
        config(60, 30),
    );
    h.status.insert_ready("1");
    let id = h.queue.send_body("1");

    let report = single_report(h.dispatcher.dispatch_once().await);
    assert_eq!(report.handling, Handling::Ran(ResolutionReason::TransientRetry));

    let releases = h.queue.ops_of(QueueCall::Release);
    assert_eq!(releases.len(), 1);
    assert_eq!(releases[0].timeout, Some(Duration::ZERO));
    assert!(!h.queue.is_deleted(&id));
    assert_eq!(h.queue.visible_len(), 1);
    assert_eq!(status_of(&h.status, "1"), Some(JobStatus::Running));
}

#[tokio::test(start_paused = true)]
async fn transient_error_on_final_receive_marks_failed() {
    let queue = InMemoryQueue::new().with_redrive(RedrivePolicy { max_receive_count: 2 });
    let h = harness(queue, failing_runner(JobError::transient("connection reset")), config(60, 30));
    h.status.insert_ready("1");
    let id = h.queue.send_body("1");

    assert_eq!(h.dispatcher.run().await.unwrap(), RunExit::Idle);

    let job = JobId::from("1");
    assert_eq!(
        h.status.history(&job),
        vec![
            JobStatus::Ready,
            JobStatus::Running,
            JobStatus::Running,
            JobStatus::Failed
        ]
    );
    assert_eq!(
        h.status.record(&job).unwrap().error_message.as_deref(),
        Some("connection reset")
    );
    assert_eq!(h.queue.dead_letters(), vec![id]);
}

#[tokio::test(start_paused = true)]
async fn crashed_job_is_marked_failed_by_the_dispatcher() {
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&runs);
    let runner = runner_fn(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        crash()
    });
    let h = harness(InMemoryQueue::new(), runner, config(60, 30));
    h.status.insert_ready("1");
    let id = h.queue.send_body("1");

    let err = h.dispatcher.dispatch_once().await.unwrap_err();
    assert!(matches!(err, DispatchError::ExecutionCrashed { .. }));
    assert!(!err.is_fatal());

    let record = h.status.record(&JobId::from("1")).unwrap();
    assert_eq!(record.status, JobStatus::Failed);
    assert!(record.error_message.unwrap().contains("worker process died"));

    // Released, so the next poll sees a terminal job and drops the message.
    assert_eq!(h.dispatcher.run().await.unwrap(), RunExit::Idle);
    assert!(h.queue.is_deleted(&id));
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn duplicate_delivery_runs_the_job_once() {
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&runs);
    let runner = runner_fn(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        async { Ok(()) }
    });
    let h = harness(InMemoryQueue::new(), runner, config(60, 30));
    h.status.insert_ready("1");
    let first = h.queue.send_body("1");
    let second = h.queue.send_body("1");

    assert_eq!(h.dispatcher.run().await.unwrap(), RunExit::Idle);

    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert!(h.queue.is_deleted(&first));
    assert!(h.queue.is_deleted(&second));
    assert_eq!(status_of(&h.status, "1"), Some(JobStatus::Finished));
}

#[tokio::test(start_paused = true)]
async fn graceful_shutdown_finishes_and_resolves_the_running_job() {
    let h = harness(InMemoryQueue::new(), sleeping_runner(secs(100)), config(60, 30));
    h.status.insert_ready("1");
    h.status.insert_ready("2");
    let first = h.queue.send_body("1");
    let second = h.queue.send_body("2");

    let shutdown = h.dispatcher.shutdown_controller();
    tokio::spawn(async move {
        tokio::time::sleep(secs(10)).await;
        shutdown.trigger_shutdown();
    });

    assert_eq!(h.dispatcher.run().await.unwrap(), RunExit::Drained);

    assert!(h.queue.is_deleted(&first));
    assert_eq!(status_of(&h.status, "1"), Some(JobStatus::Finished));
    assert_eq!(h.queue.receive_count(&second), Some(0));
    assert_eq!(status_of(&h.status, "2"), Some(JobStatus::Ready));
}

#[tokio::test(start_paused = true)]
async fn second_signal_abandons_the_lease() {
    let h = harness(InMemoryQueue::new(), sleeping_runner(secs(1000)), config(60, 30));
    h.status.insert_ready("1");
    let id = h.queue.send_body("1");

    let shutdown: Arc<ShutdownController> = h.dispatcher.shutdown_controller();
    tokio::spawn(async move {
        tokio::time::sleep(secs(10)).await;
        shutdown.trigger_shutdown();
        tokio::time::sleep(secs(10)).await;
        shutdown.trigger_immediate();
    });

    assert_eq!(h.dispatcher.run().await.unwrap(), RunExit::Forced);

    assert!(h.queue.ops_of(QueueCall::Delete).is_empty());
    assert!(h.queue.ops_of(QueueCall::Release).is_empty());
    assert!(!h.queue.is_deleted(&id));
    assert_eq!(h.queue.visible_len(), 0);
    assert_eq!(status_of(&h.status, "1"), Some(JobStatus::Running));
}

#[tokio::test(start_paused = true)]
async fn lost_lease_is_flagged_and_final_delete_is_swallowed() {
    let saw_risk = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&saw_risk);
    let runner = runner_fn(move |ctx: JobContext| {
        let flag = Arc::clone(&flag);
        async move {
            tokio::time::sleep(secs(100)).await;
            flag.store(ctx.lease.is_at_risk(), Ordering::SeqCst);
            Ok(())
        }
    });
    let h = harness(InMemoryQueue::new(), runner, config(60, 30));
    h.status.insert_ready("1");
    let id = h.queue.send_body("1");

    // Another worker takes the message over after our lease is cut short.
    let queue = Arc::clone(&h.queue);
    let expired = id.clone();
    tokio::spawn(async move {
        tokio::time::sleep(secs(15)).await;
        queue.expire_lease(&expired);
        queue.receive(Duration::ZERO, secs(600), 1).await.unwrap();
    });

    let report = single_report(h.dispatcher.dispatch_once().await);

    assert!(saw_risk.load(Ordering::SeqCst));
    assert_eq!(report.handling, Handling::Ran(ResolutionReason::Succeeded));
    assert!(!report.lease_resolved);
    assert!(!h.queue.is_deleted(&id));
    let deletes = h.queue.ops_of(QueueCall::Delete);
    assert_eq!(deletes.len(), 1);
    assert!(!deletes[0].ok);
}

