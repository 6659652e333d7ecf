//! Job entity and the enqueue protocol.

use super::{parse_iso, Queue};
use crate::backend::RedisBackend;
use crate::error::{ConveyorError, Result};
use crate::status::JobStatus;

/// An intent to perform work, keyed by an application-chosen identifier.
///
/// The identifier is not unique across time — the same unit of work can be
/// enqueued again after it completed — but at most one job with
/// `status = WAITING` exists per identifier at any committed moment.
/// Terminal jobs (`SUCCESS`/`ERROR`) are retained for audit; the core never
/// garbage-collects them.
#[derive(Debug, Clone)]
pub struct Job {
    backend: RedisBackend,
    pk: i64,
}

impl Job {
    pub(crate) const MODEL: &'static str = "job";
    const INDEXED_FIELDS: &'static [&'static str] = &["identifier", "status", "priority"];

    /// Fetch an existing job by pk.
    pub async fn get(backend: &RedisBackend, pk: i64) -> Result<Job> {
        if !backend.exists(Self::MODEL, pk).await? {
            return Err(ConveyorError::does_not_exist(Self::MODEL, pk.to_string()));
        }
        Ok(Job {
            backend: backend.clone(),
            pk,
        })
    }

    /// Place, or re-place, a job in the wanted tier of a queue.
    ///
    /// If no waiting job exists for `identifier`, one is created (with
    /// `fields_if_new` applied) and pushed onto the `(queue_name, priority)`
    /// tier — at the head when `prepend` is set.
    ///
    /// If a waiting job already exists:
    /// - without `prepend`, a job already at `priority` or higher is left
    ///   untouched — enqueueing never demotes;
    /// - otherwise the job is moved atomically from its current tier to the
    ///   wanted one (see [`RedisBackend::requeue_waiting`]). A worker that
    ///   popped the stale list entry in the meantime observes a status other
    ///   than `WAITING` and skips it.
    ///
    /// Returns the waiting job either way.
    pub async fn add_job(
        backend: &RedisBackend,
        identifier: &str,
        queue_name: &str,
        priority: i64,
        prepend: bool,
        fields_if_new: &[(&str, String)],
    ) -> Result<Job> {
        // the tier where we want the job to end up
        let queue = Queue::get_queue(backend, queue_name, priority, &[]).await?;

        let (pk, created) = backend
            .get_or_connect(
                Self::MODEL,
                &[
                    ("identifier", identifier),
                    ("status", JobStatus::Waiting.as_str()),
                ],
            )
            .await?;
        let job = Job {
            backend: backend.clone(),
            pk,
        };

        if created {
            let mut fields: Vec<(&str, String)> = fields_if_new.to_vec();
            fields.push(("priority", priority.to_string()));
            job.set_fields(&fields).await?;
            queue.push_waiting(pk, prepend).await?;
            return Ok(job);
        }

        let current_priority = job.priority().await?;
        // a job at a higher tier stays where it is unless the producer
        // explicitly asks for the head of the new tier
        if !prepend && current_priority >= priority {
            return Ok(job);
        }

        let source = Queue::get_queue(backend, queue_name, current_priority, &[]).await?;
        backend
            .requeue_waiting(
                Self::MODEL,
                pk,
                &source.waiting_key(),
                &queue.waiting_key(),
                current_priority,
                priority,
                prepend,
                JobStatus::Waiting.as_str(),
            )
            .await?;
        Ok(job)
    }

    /// Primary key of this job.
    pub fn pk(&self) -> i64 {
        self.pk
    }

    /// Application identifier of this job.
    pub async fn identifier(&self) -> Result<String> {
        self.backend
            .hash_get(Self::MODEL, self.pk, "identifier")
            .await?
            .ok_or_else(|| ConveyorError::does_not_exist(Self::MODEL, self.pk.to_string()))
    }

    /// Current status, `None` when the stored value is unrecognized.
    pub async fn status(&self) -> Result<Option<JobStatus>> {
        Ok(self
            .backend
            .hash_get(Self::MODEL, self.pk, "status")
            .await?
            .as_deref()
            .and_then(JobStatus::by_value))
    }

    /// One-round-trip read of `(identifier, status)`, as raw stored values.
    ///
    /// The worker snapshots both at dispatch time so later log lines and
    /// error records describe what it actually observed.
    pub async fn identifier_and_status(&self) -> Result<(Option<String>, Option<String>)> {
        let mut values = self
            .backend
            .hash_multi_get(Self::MODEL, self.pk, &["identifier", "status"])
            .await?
            .into_iter();
        Ok((values.next().flatten(), values.next().flatten()))
    }

    /// Priority of the tier the job currently resides in while waiting.
    pub async fn priority(&self) -> Result<i64> {
        Ok(self
            .backend
            .hash_get(Self::MODEL, self.pk, "priority")
            .await?
            .and_then(|value| value.parse().ok())
            .unwrap_or(0))
    }

    /// Execution start timestamp (RFC 3339), set by the worker.
    pub async fn start(&self) -> Result<Option<String>> {
        self.backend.hash_get(Self::MODEL, self.pk, "start").await
    }

    /// Execution end timestamp (RFC 3339), set by the worker.
    pub async fn end(&self) -> Result<Option<String>> {
        self.backend.hash_get(Self::MODEL, self.pk, "end").await
    }

    /// Wall-clock duration of the execution, when both timestamps are set.
    pub async fn duration(&self) -> Result<Option<chrono::Duration>> {
        let values = self
            .backend
            .hash_multi_get(Self::MODEL, self.pk, &["start", "end"])
            .await?;
        let start = parse_iso(values.first().and_then(|v| v.as_deref()));
        let end = parse_iso(values.get(1).and_then(|v| v.as_deref()));
        match (start, end) {
            (Some(start), Some(end)) => Ok(Some(end - start)),
            _ => Ok(None),
        }
    }

    /// Overwrite the status, maintaining the status index.
    ///
    /// Producers use this to withdraw a waiting job: a worker that later pops
    /// its stale list entry will skip it.
    pub async fn set_status(&self, status: JobStatus) -> Result<()> {
        self.set_fields(&[("status", status.as_str().to_string())])
            .await
    }

    /// Multi-field write with index maintenance.
    pub async fn set_fields(&self, fields: &[(&str, String)]) -> Result<()> {
        self.backend
            .update(Self::MODEL, self.pk, fields, Self::INDEXED_FIELDS)
            .await
    }
}
