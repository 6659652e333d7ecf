//! Worker lifecycle integration tests: dispatch, outcomes, priority
//! draining, and graceful shutdown.

mod common;

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use common::TestHarness;
use conveyor::{
    ConveyorError, ErrorDescription, ErrorRecord, Job, JobHandler, JobStatus, Queue, Worker,
    WorkerConfig, WorkerState,
};
use test_context::test_context;
use tokio_util::sync::CancellationToken;

/// Records every executed job as `(identifier, tier priority)`, optionally
/// sleeping first to simulate slow work.
#[derive(Default)]
struct RecordingHandler {
    calls: Mutex<Vec<(String, i64)>>,
    delay: Option<Duration>,
}

impl RecordingHandler {
    fn slow(delay: Duration) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            delay: Some(delay),
        }
    }

    fn identifiers(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(identifier, _)| identifier.clone())
            .collect()
    }

    fn priorities(&self) -> Vec<i64> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(_, priority)| *priority)
            .collect()
    }
}

#[async_trait]
impl JobHandler for RecordingHandler {
    async fn execute(&self, job: &Job, queue: &Queue) -> Result<(), ErrorDescription> {
        let identifier = job.identifier().await.expect("job identifier");
        let priority = queue.priority().await.expect("queue priority");
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.calls.lock().unwrap().push((identifier, priority));
        Ok(())
    }
}

/// Always fails the way an application callback would.
struct FailingHandler;

#[async_trait]
impl JobHandler for FailingHandler {
    async fn execute(&self, _job: &Job, _queue: &Queue) -> Result<(), ErrorDescription> {
        Err(ErrorDescription::new("RuntimeError", "boom").with_code("42"))
    }

    async fn additional_error_fields(
        &self,
        _job: &Job,
        _queue: &Queue,
        _description: &ErrorDescription,
    ) -> Vec<(String, String)> {
        vec![("handler".to_string(), "failing".to_string())]
    }
}

fn quick_config(name: &str, max_loops: u64) -> WorkerConfig {
    WorkerConfig::new(name)
        .with_max_loops(max_loops)
        .with_timeout(Duration::from_secs(1))
}

#[test_context(TestHarness)]
#[tokio::test]
async fn test_basic_enqueue_and_execute(ctx: &mut TestHarness) {
    let job = Job::add_job(&ctx.backend, "email:7", "mailer", 0, false, &[])
        .await
        .unwrap();

    let handler = Arc::new(RecordingHandler::default());
    let mut worker = Worker::new(
        ctx.backend.clone(),
        quick_config("mailer", 1),
        handler.clone(),
    )
    .unwrap();
    worker.run().await.unwrap();

    assert_eq!(handler.identifiers(), vec!["email:7"]);
    assert_eq!(job.status().await.unwrap(), Some(JobStatus::Success));

    let queue = Queue::get_queue(&ctx.backend, "mailer", 0, &[]).await.unwrap();
    assert_eq!(queue.success_pks().await.unwrap(), vec![job.pk()]);
    assert!(queue.waiting_pks().await.unwrap().is_empty());

    assert_eq!(worker.state(), Some(WorkerState::Terminated));
    assert_eq!(worker.num_loops(), 1);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn test_promoted_job_dispatches_once_at_new_priority(ctx: &mut TestHarness) {
    Job::add_job(&ctx.backend, "x", "q", 0, false, &[]).await.unwrap();
    Job::add_job(&ctx.backend, "x", "q", 5, false, &[]).await.unwrap();

    let handler = Arc::new(RecordingHandler::default());
    let mut worker =
        Worker::new(ctx.backend.clone(), quick_config("q", 1), handler.clone()).unwrap();
    worker.run().await.unwrap();

    assert_eq!(handler.identifiers(), vec!["x"]);
    assert_eq!(handler.priorities(), vec![5]);

    let tier0 = Queue::get_queue(&ctx.backend, "q", 0, &[]).await.unwrap();
    let tier5 = Queue::get_queue(&ctx.backend, "q", 5, &[]).await.unwrap();
    assert!(tier0.waiting_pks().await.unwrap().is_empty());
    assert!(tier5.waiting_pks().await.unwrap().is_empty());
}

#[test_context(TestHarness)]
#[tokio::test]
async fn test_demotion_attempt_dispatches_at_original_priority(ctx: &mut TestHarness) {
    Job::add_job(&ctx.backend, "x", "q", 5, false, &[]).await.unwrap();
    Job::add_job(&ctx.backend, "x", "q", 0, false, &[]).await.unwrap();

    let handler = Arc::new(RecordingHandler::default());
    let mut worker =
        Worker::new(ctx.backend.clone(), quick_config("q", 1), handler.clone()).unwrap();
    worker.run().await.unwrap();

    assert_eq!(handler.identifiers(), vec!["x"]);
    assert_eq!(handler.priorities(), vec![5]);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn test_prepended_job_runs_first(ctx: &mut TestHarness) {
    Job::add_job(&ctx.backend, "a", "q", 0, false, &[]).await.unwrap();
    Job::add_job(&ctx.backend, "b", "q", 0, false, &[]).await.unwrap();
    Job::add_job(&ctx.backend, "b", "q", 0, true, &[]).await.unwrap();

    let handler = Arc::new(RecordingHandler::default());
    let mut worker =
        Worker::new(ctx.backend.clone(), quick_config("q", 2), handler.clone()).unwrap();
    worker.run().await.unwrap();

    assert_eq!(handler.identifiers(), vec!["b", "a"]);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn test_higher_tiers_drain_first(ctx: &mut TestHarness) {
    Job::add_job(&ctx.backend, "low1", "q", 0, false, &[]).await.unwrap();
    Job::add_job(&ctx.backend, "low2", "q", 0, false, &[]).await.unwrap();
    Job::add_job(&ctx.backend, "high", "q", 9, false, &[]).await.unwrap();

    let handler = Arc::new(RecordingHandler::default());
    let mut worker =
        Worker::new(ctx.backend.clone(), quick_config("q", 3), handler.clone()).unwrap();
    worker.run().await.unwrap();

    assert_eq!(handler.identifiers(), vec!["high", "low1", "low2"]);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn test_failed_job_is_recorded(ctx: &mut TestHarness) {
    let job = Job::add_job(&ctx.backend, "email:7", "mailer", 0, false, &[])
        .await
        .unwrap();

    let mut worker = Worker::new(
        ctx.backend.clone(),
        quick_config("mailer", 1),
        Arc::new(FailingHandler),
    )
    .unwrap();
    worker.run().await.unwrap();

    assert_eq!(job.status().await.unwrap(), Some(JobStatus::Error));

    let queue = Queue::get_queue(&ctx.backend, "mailer", 0, &[]).await.unwrap();
    assert_eq!(queue.errors_pks().await.unwrap(), vec![job.pk()]);
    assert!(queue.success_pks().await.unwrap().is_empty());

    let records = ErrorRecord::for_identifier(&ctx.backend, "email:7").await.unwrap();
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.error_type().await.unwrap().as_deref(), Some("RuntimeError"));
    assert_eq!(record.code().await.unwrap().as_deref(), Some("42"));
    assert_eq!(record.message().await.unwrap().as_deref(), Some("boom"));
    assert_eq!(record.queue_name().await.unwrap().as_deref(), Some("mailer"));

    let extra = ctx
        .backend
        .hash_get("error", record.pk(), "handler")
        .await
        .unwrap();
    assert_eq!(extra.as_deref(), Some("failing"));
}

#[test_context(TestHarness)]
#[tokio::test]
async fn test_save_errors_can_be_disabled(ctx: &mut TestHarness) {
    let job = Job::add_job(&ctx.backend, "email:7", "mailer", 0, false, &[])
        .await
        .unwrap();

    let mut worker = Worker::new(
        ctx.backend.clone(),
        quick_config("mailer", 1).with_save_errors(false),
        Arc::new(FailingHandler),
    )
    .unwrap();
    worker.run().await.unwrap();

    assert_eq!(job.status().await.unwrap(), Some(JobStatus::Error));
    let records = ErrorRecord::for_identifier(&ctx.backend, "email:7").await.unwrap();
    assert!(records.is_empty());
}

#[test_context(TestHarness)]
#[tokio::test]
async fn test_graceful_shutdown_finishes_the_current_job(ctx: &mut TestHarness) {
    let first = Job::add_job(&ctx.backend, "slow:1", "q", 0, false, &[])
        .await
        .unwrap();
    let second = Job::add_job(&ctx.backend, "slow:2", "q", 0, false, &[])
        .await
        .unwrap();

    let handler = Arc::new(RecordingHandler::slow(Duration::from_millis(500)));
    let mut worker =
        Worker::new(ctx.backend.clone(), quick_config("q", 10), handler.clone()).unwrap();
    let token = worker.shutdown_token();

    let run = tokio::spawn(async move {
        let result = worker.run().await;
        (worker, result)
    });

    // let the worker pop the first job, then ask it to stop mid-callback
    tokio::time::sleep(Duration::from_millis(150)).await;
    token.cancel();

    let (worker, result) = run.await.unwrap();
    result.unwrap();

    assert_eq!(worker.state(), Some(WorkerState::Terminated));
    assert_eq!(worker.num_loops(), 1);
    assert_eq!(handler.identifiers(), vec!["slow:1"]);
    assert_eq!(first.status().await.unwrap(), Some(JobStatus::Success));
    assert_eq!(second.status().await.unwrap(), Some(JobStatus::Waiting));

    let queue = Queue::get_queue(&ctx.backend, "q", 0, &[]).await.unwrap();
    assert_eq!(queue.waiting_pks().await.unwrap(), vec![second.pk()]);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn test_canceled_job_is_skipped(ctx: &mut TestHarness) {
    let job = Job::add_job(&ctx.backend, "x", "q", 0, false, &[]).await.unwrap();
    job.set_status(JobStatus::Canceled).await.unwrap();

    let handler = Arc::new(RecordingHandler::default());
    let mut worker =
        Worker::new(ctx.backend.clone(), quick_config("q", 1), handler.clone()).unwrap();
    worker.run().await.unwrap();

    assert!(handler.identifiers().is_empty(), "callback must not run");
    assert_eq!(job.status().await.unwrap(), Some(JobStatus::Canceled));
    assert_eq!(worker.num_loops(), 1);

    let queue = Queue::get_queue(&ctx.backend, "q", 0, &[]).await.unwrap();
    assert!(queue.success_pks().await.unwrap().is_empty());
    assert!(queue.errors_pks().await.unwrap().is_empty());
}

#[test_context(TestHarness)]
#[tokio::test]
async fn test_worker_is_single_use(ctx: &mut TestHarness) {
    Queue::get_queue(&ctx.backend, "q", 0, &[]).await.unwrap();

    let mut worker = Worker::new(
        ctx.backend.clone(),
        quick_config("q", 0),
        Arc::new(RecordingHandler::default()),
    )
    .unwrap();

    worker.run().await.unwrap();
    assert_eq!(worker.state(), Some(WorkerState::Terminated));

    let result = worker.run().await;
    assert!(matches!(result, Err(ConveyorError::Implementation(_))));
    assert_eq!(worker.state(), Some(WorkerState::Aborted));
}

#[test_context(TestHarness)]
#[tokio::test]
async fn test_worker_aborts_without_queues(ctx: &mut TestHarness) {
    let mut worker = Worker::new(
        ctx.backend.clone(),
        quick_config("ghost", 1),
        Arc::new(RecordingHandler::default()),
    )
    .unwrap();

    worker.run().await.unwrap();
    assert_eq!(worker.state(), Some(WorkerState::Aborted));
    assert_eq!(worker.num_loops(), 0);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn test_duration_matches_the_callback_wall_clock(ctx: &mut TestHarness) {
    let job = Job::add_job(&ctx.backend, "slow", "q", 0, false, &[]).await.unwrap();

    let handler = Arc::new(RecordingHandler::slow(Duration::from_millis(300)));
    let mut worker = Worker::new(ctx.backend.clone(), quick_config("q", 1), handler).unwrap();
    worker.run().await.unwrap();

    let duration = job.duration().await.unwrap().expect("start and end are set");
    assert!(duration >= chrono::Duration::milliseconds(300));
    assert!(duration < chrono::Duration::seconds(10));
}

#[test_context(TestHarness)]
#[tokio::test]
async fn test_two_workers_dispatch_each_job_once(ctx: &mut TestHarness) {
    let identifiers: Vec<String> = (0..5).map(|i| format!("job:{i}")).collect();
    for identifier in &identifiers {
        Job::add_job(&ctx.backend, identifier, "q", 0, false, &[])
            .await
            .unwrap();
    }

    let handler = Arc::new(RecordingHandler::default());
    let mut runs = Vec::new();
    let mut tokens: Vec<CancellationToken> = Vec::new();
    for _ in 0..2 {
        let mut worker =
            Worker::new(ctx.backend.clone(), quick_config("q", 5), handler.clone()).unwrap();
        tokens.push(worker.shutdown_token());
        runs.push(tokio::spawn(async move { worker.run().await }));
    }

    // wait for every job to be handled, by either worker
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while handler.identifiers().len() < identifiers.len() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "jobs not drained in time"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    for token in tokens {
        token.cancel();
    }
    for run in runs {
        run.await.unwrap().unwrap();
    }

    let mut handled = handler.identifiers();
    handled.sort();
    assert_eq!(handled, identifiers, "each job ran exactly once");
}
