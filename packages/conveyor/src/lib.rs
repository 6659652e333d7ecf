//! # Conveyor
//!
//! A distributed, priority-ordered job queue backed by Redis.
//!
//! Producers enqueue jobs identified by an application-level string; one or
//! more workers, each bound to a logical queue name, pull jobs in strict
//! priority order, execute application-supplied logic, and record success,
//! error, or skip outcomes durably.
//!
//! ## Architecture
//!
//! ```text
//! Producer
//!     │ Job::add_job("user:42:resize", "images", priority)
//!     ▼
//! ┌──────────────────────────────────────────────────────┐
//! │                       Redis                          │
//! │  Queue(images, 5).waiting ─┐                         │
//! │  Queue(images, 1).waiting ─┼─ scanned in this order  │
//! │  Queue(images, 0).waiting ─┘                         │
//! └──────────────────────────────────────────────────────┘
//!     │ BLPOP (strict priority, at-most-once per pop)
//!     ▼
//! Worker(name = "images")
//!     ├─► handler.execute(job, queue)
//!     ├─► ok   → Job SUCCESS, Queue.success
//!     ├─► err  → Job ERROR, Queue.errors, ErrorRecord
//!     └─► stale → skip (status was no longer WAITING)
//! ```
//!
//! ## Key Properties
//!
//! - **At-most-once dispatch** — the blocking pop hands each list entry to
//!   exactly one worker; delivery guarantees beyond that are expressed
//!   through the job's `status` field, not redelivery.
//! - **Never demote** — re-enqueueing an already-waiting identifier at a
//!   lower priority leaves it where it is; `prepend` overrides.
//! - **Strict priority** — a lower tier is consulted only when every higher
//!   tier is empty at the moment of the pop.
//! - **No built-in retry** — failed jobs stay on the `errors` list; retrying
//!   is a producer decision (enqueue the identifier again).
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use conveyor::{ErrorDescription, Job, JobHandler, Queue, RedisBackend, Worker, WorkerConfig};
//!
//! struct Resizer;
//!
//! #[async_trait::async_trait]
//! impl JobHandler for Resizer {
//!     async fn execute(&self, job: &Job, _queue: &Queue) -> Result<(), ErrorDescription> {
//!         let identifier = job.identifier().await
//!             .map_err(|e| ErrorDescription::new("BackendError", e.to_string()))?;
//!         resize(&identifier).await
//!             .map_err(|e| ErrorDescription::new("ResizeError", e.to_string()))
//!     }
//! }
//!
//! let backend = RedisBackend::from_url("redis://localhost:6379")?;
//! Job::add_job(&backend, "user:42:resize", "images", 0, false, &[]).await?;
//!
//! let mut worker = Worker::new(backend, WorkerConfig::new("images"), Arc::new(Resizer))?;
//! worker.run_until_shutdown().await?;
//! ```

pub mod backend;
pub mod error;
pub mod models;
pub mod status;
pub mod worker;

pub use backend::RedisBackend;
pub use error::{ConveyorError, ErrorDescription, Result};
pub use models::{ErrorRecord, Job, Queue};
pub use status::JobStatus;
pub use worker::{JobHandler, Worker, WorkerConfig, WorkerState};
