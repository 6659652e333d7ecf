//! Persistent entities: queues, jobs, and error records.
//!
//! Entities are thin handles (`backend` + integer pk); all field state lives
//! in Redis. A queue's `waiting` list refers to jobs by pk only — removing a
//! pk from a list never destroys the job, and a job's `status` field remains
//! the source of truth for what a worker may do with it.

mod error_record;
mod job;
mod queue;

pub use error_record::ErrorRecord;
pub use job::Job;
pub use queue::Queue;

use chrono::{DateTime, Utc};

/// Current UTC moment as the RFC 3339 string stored in `start`/`end` fields.
pub(crate) fn utc_now_iso() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

/// Parse a stored RFC 3339 timestamp, `None` when absent or malformed.
pub(crate) fn parse_iso(value: Option<&str>) -> Option<DateTime<Utc>> {
    value
        .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
        .map(|dt| dt.with_timezone(&Utc))
}
