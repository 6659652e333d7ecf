//! Structured error types for conveyor.
//!
//! [`ConveyorError`] provides pattern-matchable errors instead of a generic
//! boxed error. The disposition of each variant is fixed:
//!
//! - [`ConveyorError::Implementation`] — misuse of the library (empty worker
//!   name, re-running a finished worker). Raised to the caller; a worker never
//!   starts on one of these.
//! - [`ConveyorError::DoesNotExist`] — an entity lookup failed, including the
//!   malformed-list-key case. The worker loop logs these and continues.
//! - [`ConveyorError::Redis`] / [`ConveyorError::Pool`] — transport failures.
//!   The worker loop logs these and continues without counting the iteration.
//!
//! [`ErrorDescription`] is the structured failure record handlers return and
//! error records persist. It is built at the catch site, where the concrete
//! failure kind is known, instead of introspecting an opaque error value.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, ConveyorError>;

/// Structured error type for conveyor operations.
#[derive(Debug, Error)]
pub enum ConveyorError {
    /// The library was used incorrectly; the operation never started.
    #[error("implementation error: {0}")]
    Implementation(String),

    /// An entity lookup failed.
    #[error("{model} does not exist for {key}")]
    DoesNotExist {
        /// Entity kind that was looked up (`"queue"`, `"job"`, `"error"`).
        model: &'static str,
        /// The pk or raw key that failed to resolve.
        key: String,
    },

    /// A Redis command failed.
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Checking out a pooled connection failed.
    #[error("redis pool error: {0}")]
    Pool(#[from] deadpool_redis::PoolError),

    /// Building the connection pool failed.
    #[error("redis pool setup error: {0}")]
    PoolSetup(#[from] deadpool_redis::CreatePoolError),
}

impl ConveyorError {
    /// Shorthand for a [`ConveyorError::DoesNotExist`].
    pub(crate) fn does_not_exist(model: &'static str, key: impl Into<String>) -> Self {
        ConveyorError::DoesNotExist {
            model,
            key: key.into(),
        }
    }
}

/// A structured description of a job failure.
///
/// Handlers return one of these from their `execute` method; the worker
/// persists it as an error record when `save_errors` is enabled. The caller
/// constructs it where the concrete failure is caught, so no dynamic
/// introspection of error values is needed:
///
/// ```ignore
/// match client.send(&payload).await {
///     Ok(_) => Ok(()),
///     Err(e) => Err(ErrorDescription::new("DeliveryError", e.to_string())
///         .with_code(e.status_code().to_string())),
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDescription {
    /// Failure classification, the analogue of an exception class name.
    pub kind: String,
    /// Optional machine-readable code carried by the failure.
    pub code: Option<String>,
    /// Human-readable failure message.
    pub message: String,
}

impl ErrorDescription {
    /// Create a description with a kind and message, no code.
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            code: None,
            message: message.into(),
        }
    }

    /// Attach a machine-readable code.
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

impl fmt::Display for ErrorDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ErrorDescription {}
