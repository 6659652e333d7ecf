//! Worker run loop: blocking multi-tier pop, dispatch, outcome bookkeeping,
//! and graceful shutdown.
//!
//! ```text
//! Worker
//!     │
//!     ├─► snapshot waiting-list keys (highest priority first)
//!     ├─► BLPOP across the keys (bounded by `timeout`)
//!     ├─► resolve Queue + Job from the popped (key, pk)
//!     ├─► status still WAITING?  no → skip
//!     │                          yes → handler.execute(job, queue)
//!     └─► record outcome (job status, queue outcome list, error record)
//! ```
//!
//! A worker is bound to one queue name and runs one job at a time;
//! parallelism is N workers over the same name. No runtime failure kills the
//! loop — adapter errors, resolution failures, and handler failures are all
//! logged and the loop proceeds. Only construction errors and re-running a
//! finished worker are surfaced to the caller.
//!
//! Shutdown is cooperative: the worker owns a [`CancellationToken`] that the
//! embedding layer cancels (directly, or via the signal listeners that
//! [`Worker::run_until_shutdown`] installs). The token is checked between
//! iterations; cancellation reaches a blocked pop through the pop timeout,
//! and an in-flight handler always runs to completion. Worst-case shutdown
//! latency is therefore one `timeout` plus the current job.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::backend::RedisBackend;
use crate::error::{ConveyorError, ErrorDescription, Result};
use crate::models::{utc_now_iso, ErrorRecord, Job, Queue};
use crate::status::JobStatus;

/// Application logic executed for each dispatched job.
///
/// Failures are returned as an [`ErrorDescription`] built at the catch site;
/// the worker records it and moves on. `additional_error_fields` can attach
/// extra context to the persisted error record.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Run the job. The job's `status` is `RUNNING` and `start` is set when
    /// this is called.
    async fn execute(
        &self,
        job: &Job,
        queue: &Queue,
    ) -> std::result::Result<(), ErrorDescription>;

    /// Extra fields merged into the error record of a failed execution.
    async fn additional_error_fields(
        &self,
        _job: &Job,
        _queue: &Queue,
        _description: &ErrorDescription,
    ) -> Vec<(String, String)> {
        Vec::new()
    }
}

/// Where a worker is in its lifecycle. `None` before the first `run`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Blocked in the pop, or between jobs.
    Waiting,
    /// A job is being dispatched.
    Running,
    /// The run loop exited normally. Terminal.
    Terminated,
    /// Startup failed, or `run` was called again on a finished worker.
    /// Terminal.
    Aborted,
}

impl WorkerState {
    /// Lowercase display name used in logs.
    pub const fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Waiting => "waiting",
            WorkerState::Running => "running",
            WorkerState::Terminated => "terminated",
            WorkerState::Aborted => "aborted",
        }
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Worker configuration. Every field except `name` has a default.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// The queue name this worker serves. Required.
    pub name: String,
    /// Stop after this many dispatched jobs.
    pub max_loops: u64,
    /// Blocking-pop timeout per iteration.
    pub timeout: Duration,
    /// Honor the cancellation token for graceful shutdown.
    pub terminate_gracefully: bool,
    /// Persist an [`ErrorRecord`] for each failed execution.
    pub save_errors: bool,
    /// Log identity of this worker instance, distinguishing N workers bound
    /// to the same name.
    pub worker_id: String,
}

impl WorkerConfig {
    /// Defaults for a worker bound to `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_loops: 1000,
            timeout: Duration::from_secs(30),
            terminate_gracefully: true,
            save_errors: true,
            worker_id: format!("worker-{}", Uuid::new_v4()),
        }
    }

    /// Override the dispatch limit.
    pub fn with_max_loops(mut self, max_loops: u64) -> Self {
        self.max_loops = max_loops;
        self
    }

    /// Override the blocking-pop timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Ignore the cancellation token (the worker then only stops on
    /// `max_loops` or when no queues exist).
    pub fn with_terminate_gracefully(mut self, terminate_gracefully: bool) -> Self {
        self.terminate_gracefully = terminate_gracefully;
        self
    }

    /// Disable error-record persistence.
    pub fn with_save_errors(mut self, save_errors: bool) -> Self {
        self.save_errors = save_errors;
        self
    }

    /// Override the log identity.
    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }
}

/// A single-consumer run loop bound to one queue name.
///
/// A worker is single-use: once `run` has returned, the worker is
/// `Terminated` (or `Aborted`) and calling `run` again is an implementation
/// error. Start a new worker for a new run.
pub struct Worker {
    backend: RedisBackend,
    config: WorkerConfig,
    handler: Arc<dyn JobHandler>,
    token: CancellationToken,
    keys: Vec<String>,
    num_loops: u64,
    end_forced: bool,
    state: Option<WorkerState>,
}

impl Worker {
    /// Create a worker. Fails when the queue name is empty.
    pub fn new(
        backend: RedisBackend,
        config: WorkerConfig,
        handler: Arc<dyn JobHandler>,
    ) -> Result<Self> {
        if config.name.trim().is_empty() {
            return Err(ConveyorError::Implementation(
                "the name of the worker is not defined".into(),
            ));
        }
        Ok(Self {
            backend,
            config,
            handler,
            token: CancellationToken::new(),
            keys: Vec::new(),
            num_loops: 0,
            end_forced: false,
            state: None,
        })
    }

    /// A handle the embedding layer cancels to request a graceful stop.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Lifecycle state; `None` until `run` is called.
    pub fn state(&self) -> Option<WorkerState> {
        self.state
    }

    /// Number of dispatched jobs so far. Pop timeouts, adapter failures, and
    /// resolution failures do not count.
    pub fn num_loops(&self) -> u64 {
        self.num_loops
    }

    /// The configuration this worker runs with.
    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    fn must_stop(&self) -> bool {
        (self.config.terminate_gracefully && self.token.is_cancelled())
            || self.num_loops >= self.config.max_loops
            || self.end_forced
    }

    /// Run the loop until a stop condition holds.
    ///
    /// Returns `Err` only for implementation errors (re-run of a finished
    /// worker). A startup without any queue tier for the name logs an error
    /// and returns `Ok` with the worker `Aborted`.
    pub async fn run(&mut self) -> Result<()> {
        let span = info_span!(
            "worker",
            name = %self.config.name,
            worker_id = %self.config.worker_id,
        );
        self.run_inner().instrument(span).await
    }

    /// Like [`Worker::run`], with SIGINT/SIGTERM listeners installed that
    /// cancel the shutdown token.
    pub async fn run_until_shutdown(&mut self) -> Result<()> {
        let token = self.token.clone();
        tokio::spawn(async move {
            wait_for_termination_signal().await;
            token.cancel();
        });
        self.run().await
    }

    async fn run_inner(&mut self) -> Result<()> {
        if self.state.is_some() {
            self.state = Some(WorkerState::Aborted);
            return Err(ConveyorError::Implementation(
                "this worker run is already terminated".into(),
            ));
        }

        // tiers created after this snapshot are served by the next worker
        self.keys = Queue::get_waiting_keys(&self.backend, &self.config.name).await?;
        if self.keys.is_empty() {
            error!(queue = %self.config.name, "no queues with this name");
            self.end_forced = true;
            self.state = Some(WorkerState::Aborted);
            return Ok(());
        }

        info!(
            max_loops = self.config.max_loops,
            timeout_secs = self.config.timeout.as_secs(),
            "run started"
        );

        let mut stop_logged = false;
        while !self.must_stop() {
            self.state = Some(WorkerState::Waiting);

            let popped = match self
                .backend
                .blocking_pop_left(&self.keys, self.config.timeout)
                .await
            {
                Ok(popped) => popped,
                Err(e) => {
                    error!("unable to get job: {e}");
                    self.note_termination(false, &mut stop_logged);
                    continue;
                }
            };
            let Some((list_key, raw_pk)) = popped else {
                // pop timed out with every list empty
                self.note_termination(false, &mut stop_logged);
                continue;
            };

            let (queue, job) = match self.resolve(&list_key, &raw_pk).await {
                Ok(pair) => pair,
                Err(e) => {
                    error!(key = %list_key, "unable to resolve popped job: {e}");
                    continue;
                }
            };

            self.num_loops += 1;
            self.state = Some(WorkerState::Running);

            // default identity if the job hash is unreadable
            let mut identifier = format!("pk:{}", job.pk());
            if let Err(e) = self.dispatch(&queue, &job, &mut identifier).await {
                error!("[{identifier}] unexpected error: {e}");
            }

            self.note_termination(true, &mut stop_logged);
        }

        self.state = Some(WorkerState::Terminated);
        info!(num_loops = self.num_loops, "run terminated");
        Ok(())
    }

    /// Log the observed termination request once, with wording that tells
    /// the operator whether a job was still in flight. `error` is the highest
    /// level tracing has.
    fn note_termination(&self, after_job: bool, stop_logged: &mut bool) {
        if *stop_logged || !(self.config.terminate_gracefully && self.token.is_cancelled()) {
            return;
        }
        if after_job {
            error!("termination signal caught: stopping after current job");
        } else {
            error!("termination signal caught: stopping right now");
        }
        *stop_logged = true;
    }

    /// Resolve the popped `(list_key, pk)` pair back to entities.
    async fn resolve(&self, list_key: &str, raw_pk: &str) -> Result<(Queue, Job)> {
        let queue = Queue::from_list_key(&self.backend, list_key).await?;
        let job_pk: i64 = raw_pk
            .parse()
            .map_err(|_| ConveyorError::does_not_exist(Job::MODEL, raw_pk))?;
        let job = Job::get(&self.backend, job_pk).await?;
        Ok((queue, job))
    }

    async fn dispatch(&self, queue: &Queue, job: &Job, identifier: &mut String) -> Result<()> {
        let (id, raw_status) = job.identifier_and_status().await?;
        if let Some(id) = id {
            *identifier = id;
        }

        if raw_status.as_deref() != Some(JobStatus::Waiting.as_str()) {
            self.job_skipped(identifier, raw_status.as_deref());
            return Ok(());
        }

        self.job_started(job, identifier).await?;
        match self.handler.execute(job, queue).await {
            Ok(()) => self.job_success(job, queue, identifier).await,
            Err(description) => self.job_error(job, queue, identifier, description).await,
        }
    }

    async fn job_started(&self, job: &Job, identifier: &str) -> Result<()> {
        job.set_fields(&[
            ("start", utc_now_iso()),
            ("status", JobStatus::Running.as_str().to_string()),
        ])
        .await?;
        info!("[{identifier}] starting");
        Ok(())
    }

    async fn job_success(&self, job: &Job, queue: &Queue, identifier: &str) -> Result<()> {
        job.set_fields(&[
            ("end", utc_now_iso()),
            ("status", JobStatus::Success.as_str().to_string()),
        ])
        .await?;
        queue.push_success(job.pk()).await?;
        match job.duration().await? {
            Some(duration) => {
                let seconds = duration.num_milliseconds() as f64 / 1000.0;
                info!("[{identifier}] success, in {seconds:.3}s");
            }
            None => info!("[{identifier}] success"),
        }
        Ok(())
    }

    async fn job_error(
        &self,
        job: &Job,
        queue: &Queue,
        identifier: &str,
        description: ErrorDescription,
    ) -> Result<()> {
        job.set_fields(&[
            ("end", utc_now_iso()),
            ("status", JobStatus::Error.as_str().to_string()),
        ])
        .await?;
        queue.push_error(job.pk()).await?;

        if self.config.save_errors {
            let additional = self
                .handler
                .additional_error_fields(job, queue, &description)
                .await;
            ErrorRecord::add_error(
                &self.backend,
                &queue.name().await?,
                identifier,
                &description,
                None,
                &additional,
            )
            .await?;
        }

        error!("[{identifier}] error: {description}");
        Ok(())
    }

    fn job_skipped(&self, identifier: &str, raw_status: Option<&str>) {
        let status_name = raw_status
            .and_then(JobStatus::by_value)
            .map(|status| status.as_str())
            .unwrap_or("UNKNOWN");
        warn!("[{identifier}] job skipped (current status: {status_name})");
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("config", &self.config)
            .field("state", &self.state)
            .field("num_loops", &self.num_loops)
            .finish()
    }
}

/// Block until SIGINT or, on unix, SIGTERM is delivered.
async fn wait_for_termination_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(e) => {
                error!("unable to install SIGTERM handler: {e}");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
