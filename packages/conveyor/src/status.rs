//! Job status constants.
//!
//! Statuses are persisted as stable uppercase strings (`"WAITING"`,
//! `"RUNNING"`, ...) so records written by one version of the library remain
//! readable by another. [`JobStatus::by_value`] is the reverse lookup used
//! when logging a raw stored value.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle status of a [`Job`](crate::models::Job).
///
/// `Waiting` is the only status a worker will execute; everything else makes
/// a popped job a skip. `Success` and `Error` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStatus {
    /// Enqueued, sitting in exactly one queue's waiting list.
    Waiting,
    /// Picked up by a worker; the handler is running.
    Running,
    /// Handler completed without error. Terminal.
    Success,
    /// Handler failed. Terminal; retry is the producer's decision.
    Error,
    /// Withdrawn before execution. A worker that pops a canceled job skips it.
    Canceled,
}

impl JobStatus {
    /// The stable wire value stored in Redis.
    pub const fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Waiting => "WAITING",
            JobStatus::Running => "RUNNING",
            JobStatus::Success => "SUCCESS",
            JobStatus::Error => "ERROR",
            JobStatus::Canceled => "CANCELED",
        }
    }

    /// Reverse lookup from a stored wire value.
    ///
    /// Returns `None` for unrecognized values; callers that only need a
    /// display name fall back to `"UNKNOWN"`.
    pub fn by_value(value: &str) -> Option<JobStatus> {
        match value {
            "WAITING" => Some(JobStatus::Waiting),
            "RUNNING" => Some(JobStatus::Running),
            "SUCCESS" => Some(JobStatus::Success),
            "ERROR" => Some(JobStatus::Error),
            "CANCELED" => Some(JobStatus::Canceled),
            _ => None,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_values_are_stable() {
        assert_eq!(JobStatus::Waiting.as_str(), "WAITING");
        assert_eq!(JobStatus::Running.as_str(), "RUNNING");
        assert_eq!(JobStatus::Success.as_str(), "SUCCESS");
        assert_eq!(JobStatus::Error.as_str(), "ERROR");
        assert_eq!(JobStatus::Canceled.as_str(), "CANCELED");
    }

    #[test]
    fn test_by_value_round_trip() {
        for status in [
            JobStatus::Waiting,
            JobStatus::Running,
            JobStatus::Success,
            JobStatus::Error,
            JobStatus::Canceled,
        ] {
            assert_eq!(JobStatus::by_value(status.as_str()), Some(status));
        }
    }

    #[test]
    fn test_by_value_unknown() {
        assert_eq!(JobStatus::by_value("RETRYING"), None);
        assert_eq!(JobStatus::by_value(""), None);
        assert_eq!(JobStatus::by_value("waiting"), None);
    }

    #[test]
    fn test_display_matches_wire_value() {
        assert_eq!(JobStatus::Canceled.to_string(), "CANCELED");
    }
}
