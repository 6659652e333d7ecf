//! Append-only error records, one per failed execution.

use chrono::{DateTime, NaiveDateTime, Utc};

use crate::backend::RedisBackend;
use crate::error::{ConveyorError, ErrorDescription, Result};

const DATE_FORMAT: &str = "%Y-%m-%d";
const TIME_FORMAT: &str = "%H:%M:%S%.6f";

/// Audit record for a single failed execution.
///
/// Holds the origin coordinates (`identifier`, `queue_name`), the UTC moment,
/// and the structured failure description. Records hold no references to the
/// job or queue they describe and are never touched again once written.
#[derive(Debug, Clone)]
pub struct ErrorRecord {
    backend: RedisBackend,
    pk: i64,
}

impl ErrorRecord {
    pub(crate) const MODEL: &'static str = "error";
    const INDEXED_FIELDS: &'static [&'static str] =
        &["identifier", "queue_name", "date", "type", "code"];

    /// Fetch an existing record by pk.
    pub async fn get(backend: &RedisBackend, pk: i64) -> Result<ErrorRecord> {
        if !backend.exists(Self::MODEL, pk).await? {
            return Err(ConveyorError::does_not_exist(Self::MODEL, pk.to_string()));
        }
        Ok(ErrorRecord {
            backend: backend.clone(),
            pk,
        })
    }

    /// Persist a new error record.
    ///
    /// `when` defaults to the current UTC moment. `additional_fields` lets a
    /// worker's [`JobHandler`](crate::worker::JobHandler) attach extra
    /// context to the record.
    pub async fn add_error(
        backend: &RedisBackend,
        queue_name: &str,
        identifier: &str,
        description: &ErrorDescription,
        when: Option<DateTime<Utc>>,
        additional_fields: &[(String, String)],
    ) -> Result<ErrorRecord> {
        let when = when.unwrap_or_else(Utc::now);

        let mut fields: Vec<(&str, String)> = vec![
            ("queue_name", queue_name.to_string()),
            ("identifier", identifier.to_string()),
            ("date", when.format(DATE_FORMAT).to_string()),
            ("time", when.format(TIME_FORMAT).to_string()),
            ("type", description.kind.clone()),
            ("message", description.message.clone()),
        ];
        if let Some(code) = &description.code {
            fields.push(("code", code.clone()));
        }
        for (field, value) in additional_fields {
            fields.push((field.as_str(), value.clone()));
        }

        let pk = backend
            .create(Self::MODEL, &fields, Self::INDEXED_FIELDS)
            .await?;
        Ok(ErrorRecord {
            backend: backend.clone(),
            pk,
        })
    }

    /// All records written for a job identifier, oldest first.
    pub async fn for_identifier(
        backend: &RedisBackend,
        identifier: &str,
    ) -> Result<Vec<ErrorRecord>> {
        let mut pks = backend
            .index_members(Self::MODEL, "identifier", identifier)
            .await?;
        pks.sort_unstable();
        Ok(pks
            .into_iter()
            .map(|pk| ErrorRecord {
                backend: backend.clone(),
                pk,
            })
            .collect())
    }

    /// Primary key of this record.
    pub fn pk(&self) -> i64 {
        self.pk
    }

    /// Identifier of the failed job.
    pub async fn identifier(&self) -> Result<Option<String>> {
        self.backend
            .hash_get(Self::MODEL, self.pk, "identifier")
            .await
    }

    /// Name of the queue the failure happened on.
    pub async fn queue_name(&self) -> Result<Option<String>> {
        self.backend
            .hash_get(Self::MODEL, self.pk, "queue_name")
            .await
    }

    /// Failure classification, e.g. the handler-side error kind.
    pub async fn error_type(&self) -> Result<Option<String>> {
        self.backend.hash_get(Self::MODEL, self.pk, "type").await
    }

    /// Machine-readable code, when the failure carried one.
    pub async fn code(&self) -> Result<Option<String>> {
        self.backend.hash_get(Self::MODEL, self.pk, "code").await
    }

    /// Human-readable failure message.
    pub async fn message(&self) -> Result<Option<String>> {
        self.backend.hash_get(Self::MODEL, self.pk, "message").await
    }

    /// The UTC moment of the failure, re-assembled from the stored
    /// `date` and `time` fields.
    pub async fn occurred_at(&self) -> Result<Option<DateTime<Utc>>> {
        let values = self
            .backend
            .hash_multi_get(Self::MODEL, self.pk, &["date", "time"])
            .await?;
        let (date, time) = match (values.first(), values.get(1)) {
            (Some(Some(date)), Some(Some(time))) => (date, time),
            _ => return Ok(None),
        };
        let parsed = NaiveDateTime::parse_from_str(
            &format!("{date} {time}"),
            &format!("{DATE_FORMAT} {TIME_FORMAT}"),
        );
        Ok(parsed.ok().map(|naive| naive.and_utc()))
    }
}
