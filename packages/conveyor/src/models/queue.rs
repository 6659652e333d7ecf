//! Queue entity: one `(name, priority)` tier with its waiting list and
//! outcome lists.

use crate::backend::{pk_from_list_key, RedisBackend};
use crate::error::{ConveyorError, Result};

/// A single priority tier of a logical queue.
///
/// Several tiers can share a `name`; a worker bound to that name drains them
/// in descending priority order. `(name, priority)` is unique — the lookup in
/// [`Queue::get_queue`] is atomic, so at most one entity exists per tier.
/// Tiers are created on first reference and never deleted by the core.
#[derive(Debug, Clone)]
pub struct Queue {
    backend: RedisBackend,
    pk: i64,
}

impl Queue {
    pub(crate) const MODEL: &'static str = "queue";
    const INDEXED_FIELDS: &'static [&'static str] = &["name", "priority"];

    /// Fetch an existing tier by pk.
    pub async fn get(backend: &RedisBackend, pk: i64) -> Result<Queue> {
        if !backend.exists(Self::MODEL, pk).await? {
            return Err(ConveyorError::does_not_exist(Self::MODEL, pk.to_string()));
        }
        Ok(Queue {
            backend: backend.clone(),
            pk,
        })
    }

    /// Resolve a tier from a raw waiting-list key, as returned by the
    /// blocking pop.
    pub async fn from_list_key(backend: &RedisBackend, list_key: &str) -> Result<Queue> {
        let pk = pk_from_list_key(list_key)
            .ok_or_else(|| ConveyorError::does_not_exist(Self::MODEL, list_key))?;
        Self::get(backend, pk).await
    }

    /// Get, or create, the `(name, priority)` tier.
    ///
    /// `fields_if_new` is only applied when this call created the tier.
    pub async fn get_queue(
        backend: &RedisBackend,
        name: &str,
        priority: i64,
        fields_if_new: &[(&str, String)],
    ) -> Result<Queue> {
        let priority_value = priority.to_string();
        let (pk, created) = backend
            .get_or_connect(
                Self::MODEL,
                &[("name", name), ("priority", &priority_value)],
            )
            .await?;
        let queue = Queue {
            backend: backend.clone(),
            pk,
        };
        if created && !fields_if_new.is_empty() {
            queue.set_fields(fields_if_new).await?;
        }
        Ok(queue)
    }

    /// All tier pks registered under a name.
    pub async fn collection(backend: &RedisBackend, name: &str) -> Result<Vec<i64>> {
        backend.index_members(Self::MODEL, "name", name).await
    }

    /// Waiting-list keys of every tier under `name`, highest priority first.
    ///
    /// This is the input to the blocking pop: scanning the keys in this order
    /// is what makes priority draining strict.
    pub async fn get_waiting_keys(backend: &RedisBackend, name: &str) -> Result<Vec<String>> {
        let mut tiers = Vec::new();
        for pk in Self::collection(backend, name).await? {
            let priority = backend
                .hash_get(Self::MODEL, pk, "priority")
                .await?
                .and_then(|value| value.parse::<i64>().ok())
                .unwrap_or(0);
            tiers.push((priority, pk));
        }
        tiers.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        Ok(tiers
            .into_iter()
            .map(|(_, pk)| backend.list_key(Self::MODEL, pk, "waiting"))
            .collect())
    }

    /// Primary key of this tier.
    pub fn pk(&self) -> i64 {
        self.pk
    }

    /// Logical queue name.
    pub async fn name(&self) -> Result<String> {
        self.backend
            .hash_get(Self::MODEL, self.pk, "name")
            .await?
            .ok_or_else(|| ConveyorError::does_not_exist(Self::MODEL, self.pk.to_string()))
    }

    /// Priority of this tier; higher is served first.
    pub async fn priority(&self) -> Result<i64> {
        Ok(self
            .backend
            .hash_get(Self::MODEL, self.pk, "priority")
            .await?
            .and_then(|value| value.parse().ok())
            .unwrap_or(0))
    }

    /// Key of this tier's waiting list.
    pub fn waiting_key(&self) -> String {
        self.backend.list_key(Self::MODEL, self.pk, "waiting")
    }

    /// Job pks currently waiting in this tier, next-to-run first.
    pub async fn waiting_pks(&self) -> Result<Vec<i64>> {
        self.backend.list_range(&self.waiting_key()).await
    }

    /// Job pks that completed successfully out of this tier.
    pub async fn success_pks(&self) -> Result<Vec<i64>> {
        self.backend
            .list_range(&self.backend.list_key(Self::MODEL, self.pk, "success"))
            .await
    }

    /// Job pks that failed out of this tier.
    pub async fn errors_pks(&self) -> Result<Vec<i64>> {
        self.backend
            .list_range(&self.backend.list_key(Self::MODEL, self.pk, "errors"))
            .await
    }

    pub(crate) async fn push_waiting(&self, job_pk: i64, prepend: bool) -> Result<()> {
        let key = self.waiting_key();
        if prepend {
            self.backend.list_push_left(&key, job_pk).await
        } else {
            self.backend.list_push_right(&key, job_pk).await
        }
    }

    pub(crate) async fn push_success(&self, job_pk: i64) -> Result<()> {
        self.backend
            .list_push_right(&self.backend.list_key(Self::MODEL, self.pk, "success"), job_pk)
            .await
    }

    pub(crate) async fn push_error(&self, job_pk: i64) -> Result<()> {
        self.backend
            .list_push_right(&self.backend.list_key(Self::MODEL, self.pk, "errors"), job_pk)
            .await
    }

    /// Multi-field write with index maintenance.
    pub async fn set_fields(&self, fields: &[(&str, String)]) -> Result<()> {
        self.backend
            .update(Self::MODEL, self.pk, fields, Self::INDEXED_FIELDS)
            .await
    }
}
