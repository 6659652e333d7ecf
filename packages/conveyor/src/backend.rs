//! Redis adapter: key naming convention, hash/list/set primitives, and the
//! atomic scripts the entity layer builds on.
//!
//! All persistent state lives in Redis under a single namespace:
//!
//! ```text
//! <ns>:<model>:next_pk              pk sequence (INCR)
//! <ns>:<model>:collection           set of all pks for the model
//! <ns>:<model>:idx:<field>:<value>  secondary index, set of pks
//! <ns>:<model>:<pk>:hash            entity scalar fields
//! <ns>:<model>:<pk>:<field>         entity list fields (waiting, success, ...)
//! ```
//!
//! Two operations are server-side scripts so their invariants hold under
//! concurrent producers:
//! - `get_or_connect` — lookup-by-indexed-fields-or-create; no two callers
//!   can both observe `created = true` for the same tuple.
//! - `requeue_waiting` — move a waiting job between priority tiers; the pk
//!   never appears in two waiting lists at a committed moment.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use deadpool_redis::{Config, Connection, Pool, Runtime};
use redis::Script;
use tracing::debug;

use crate::error::Result;

/// Namespace used when none is given.
pub const DEFAULT_NAMESPACE: &str = "jobs";

/// Lookup-or-create over the secondary indexes of a model.
///
/// KEYS: [1] pk sequence, [2] collection set, [3..] one index set per lookup
/// pair. ARGV: [1] `<ns>:<model>:` key prefix, then the lookup pairs as
/// field, value, field, value, ...
const GET_OR_CONNECT_LUA: &str = r#"
local existing = redis.call('SINTER', unpack(KEYS, 3))
if existing[1] then
    return {tonumber(existing[1]), 0}
end
local pk = redis.call('INCR', KEYS[1])
local hash = ARGV[1] .. pk .. ':hash'
redis.call('SADD', KEYS[2], pk)
for j = 1, (#ARGV - 1) / 2 do
    redis.call('HSET', hash, ARGV[2 * j], ARGV[2 * j + 1])
    redis.call('SADD', KEYS[2 + j], pk)
end
return {pk, 1}
"#;

/// Move a waiting job from one priority tier's waiting list to another.
///
/// KEYS: [1] job hash, [2] source waiting list, [3] target waiting list,
/// [4] old priority index set, [5] new priority index set, [6] waiting-status
/// index set. ARGV: [1] job pk, [2] new priority, [3] "1" to push left,
/// [4] the waiting status wire value.
const REQUEUE_WAITING_LUA: &str = r#"
redis.call('LREM', KEYS[2], 0, ARGV[1])
redis.call('HSET', KEYS[1], 'status', ARGV[4], 'priority', ARGV[2])
redis.call('SREM', KEYS[4], ARGV[1])
redis.call('SADD', KEYS[5], ARGV[1])
redis.call('SADD', KEYS[6], ARGV[1])
if ARGV[3] == '1' then
    redis.call('LPUSH', KEYS[3], ARGV[1])
else
    redis.call('RPUSH', KEYS[3], ARGV[1])
end
return redis.status_reply('OK')
"#;

/// Cloneable handle over the shared Redis pool.
///
/// The embedding application builds the [`Pool`] (or uses [`RedisBackend::from_url`])
/// and hands clones of the backend to producers and workers.
#[derive(Clone)]
pub struct RedisBackend {
    pool: Pool,
    namespace: String,
    get_or_connect_script: Arc<Script>,
    requeue_script: Arc<Script>,
}

impl fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisBackend")
            .field("namespace", &self.namespace)
            .finish()
    }
}

impl RedisBackend {
    /// Wrap an existing pool under the default `jobs` namespace.
    pub fn new(pool: Pool) -> Self {
        Self::with_namespace(pool, DEFAULT_NAMESPACE)
    }

    /// Wrap an existing pool under a custom namespace.
    pub fn with_namespace(pool: Pool, namespace: impl Into<String>) -> Self {
        Self {
            pool,
            namespace: namespace.into(),
            get_or_connect_script: Arc::new(Script::new(GET_OR_CONNECT_LUA)),
            requeue_script: Arc::new(Script::new(REQUEUE_WAITING_LUA)),
        }
    }

    /// Build a pool from a `redis://` URL under the default namespace.
    pub fn from_url(url: &str) -> Result<Self> {
        let pool = Config::from_url(url).create_pool(Some(Runtime::Tokio1))?;
        Ok(Self::new(pool))
    }

    /// Build a pool from a `redis://` URL under a custom namespace.
    pub fn from_url_with_namespace(url: &str, namespace: impl Into<String>) -> Result<Self> {
        let pool = Config::from_url(url).create_pool(Some(Runtime::Tokio1))?;
        Ok(Self::with_namespace(pool, namespace))
    }

    /// The namespace all keys live under.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn conn(&self) -> Result<Connection> {
        Ok(self.pool.get().await?)
    }

    // ------------------------------------------------------------------
    // Key naming
    // ------------------------------------------------------------------

    /// Key of the hash holding an entity's scalar fields.
    pub fn hash_key(&self, model: &str, pk: i64) -> String {
        format!("{}:{}:{}:hash", self.namespace, model, pk)
    }

    /// Key of an entity list field, e.g. a queue's `waiting` list.
    pub fn list_key(&self, model: &str, pk: i64, field: &str) -> String {
        format!("{}:{}:{}:{}", self.namespace, model, pk, field)
    }

    /// Key of the set of all pks of a model.
    pub fn collection_key(&self, model: &str) -> String {
        format!("{}:{}:collection", self.namespace, model)
    }

    /// Key of a secondary-index set for one (field, value) pair.
    pub fn index_key(&self, model: &str, field: &str, value: &str) -> String {
        format!("{}:{}:idx:{}:{}", self.namespace, model, field, value)
    }

    fn next_pk_key(&self, model: &str) -> String {
        format!("{}:{}:next_pk", self.namespace, model)
    }

    fn hash_key_prefix(&self, model: &str) -> String {
        format!("{}:{}:", self.namespace, model)
    }

    // ------------------------------------------------------------------
    // Entity creation and lookup
    // ------------------------------------------------------------------

    /// Atomic lookup-by-indexed-fields-or-create.
    ///
    /// Returns the pk of the matching entity and whether it was created by
    /// this call. The script guarantees that for a given tuple at most one
    /// caller ever observes `created = true`.
    pub async fn get_or_connect(
        &self,
        model: &'static str,
        lookup: &[(&str, &str)],
    ) -> Result<(i64, bool)> {
        let mut conn = self.conn().await?;
        let mut invocation = self.get_or_connect_script.prepare_invoke();
        invocation
            .key(self.next_pk_key(model))
            .key(self.collection_key(model));
        for (field, value) in lookup {
            invocation.key(self.index_key(model, field, value));
        }
        invocation.arg(self.hash_key_prefix(model));
        for (field, value) in lookup {
            invocation.arg(*field).arg(*value);
        }
        let (pk, created): (i64, i64) = invocation.invoke_async(&mut conn).await?;
        debug!(model, pk, created = created == 1, "get_or_connect");
        Ok((pk, created == 1))
    }

    /// Create an append-only entity: allocate a pk, write its fields, and
    /// register it in the collection and index sets.
    pub async fn create(
        &self,
        model: &'static str,
        fields: &[(&str, String)],
        indexed_fields: &[&str],
    ) -> Result<i64> {
        let mut conn = self.conn().await?;
        let pk: i64 = redis::cmd("INCR")
            .arg(self.next_pk_key(model))
            .query_async(&mut conn)
            .await?;

        let mut pipe = redis::pipe();
        pipe.cmd("SADD")
            .arg(self.collection_key(model))
            .arg(pk)
            .ignore();
        let mut hset = redis::cmd("HSET");
        hset.arg(self.hash_key(model, pk));
        for (field, value) in fields {
            hset.arg(*field).arg(value);
            if indexed_fields.contains(field) {
                pipe.cmd("SADD")
                    .arg(self.index_key(model, field, value))
                    .arg(pk)
                    .ignore();
            }
        }
        pipe.add_command(hset).ignore();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(pk)
    }

    /// Whether a pk is a member of the model's collection.
    pub async fn exists(&self, model: &str, pk: i64) -> Result<bool> {
        let mut conn = self.conn().await?;
        let member: bool = redis::cmd("SISMEMBER")
            .arg(self.collection_key(model))
            .arg(pk)
            .query_async(&mut conn)
            .await?;
        Ok(member)
    }

    /// All pks in a secondary-index set.
    pub async fn index_members(&self, model: &str, field: &str, value: &str) -> Result<Vec<i64>> {
        let mut conn = self.conn().await?;
        let members: Vec<i64> = redis::cmd("SMEMBERS")
            .arg(self.index_key(model, field, value))
            .query_async(&mut conn)
            .await?;
        Ok(members)
    }

    // ------------------------------------------------------------------
    // Hash fields
    // ------------------------------------------------------------------

    /// Read one scalar field.
    pub async fn hash_get(&self, model: &str, pk: i64, field: &str) -> Result<Option<String>> {
        let mut conn = self.conn().await?;
        let value: Option<String> = redis::cmd("HGET")
            .arg(self.hash_key(model, pk))
            .arg(field)
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }

    /// Read several scalar fields in one round trip.
    pub async fn hash_multi_get(
        &self,
        model: &str,
        pk: i64,
        fields: &[&str],
    ) -> Result<Vec<Option<String>>> {
        let mut conn = self.conn().await?;
        let mut cmd = redis::cmd("HMGET");
        cmd.arg(self.hash_key(model, pk));
        for field in fields {
            cmd.arg(*field);
        }
        let values: Vec<Option<String>> = cmd.query_async(&mut conn).await?;
        Ok(values)
    }

    /// Multi-field write with secondary-index maintenance.
    ///
    /// Old index memberships are read first, then the removals, additions,
    /// and the hash write go out as one pipelined batch.
    pub async fn update(
        &self,
        model: &str,
        pk: i64,
        pairs: &[(&str, String)],
        indexed_fields: &[&str],
    ) -> Result<()> {
        if pairs.is_empty() {
            return Ok(());
        }

        let indexed: Vec<&(&str, String)> = pairs
            .iter()
            .filter(|(field, _)| indexed_fields.contains(field))
            .collect();

        let old_values = if indexed.is_empty() {
            Vec::new()
        } else {
            let fields: Vec<&str> = indexed.iter().map(|(field, _)| *field).collect();
            self.hash_multi_get(model, pk, &fields).await?
        };

        let mut conn = self.conn().await?;
        let mut pipe = redis::pipe();
        for ((field, new_value), old_value) in indexed.iter().zip(old_values) {
            if old_value.as_deref() == Some(new_value.as_str()) {
                continue;
            }
            if let Some(old) = old_value {
                pipe.cmd("SREM")
                    .arg(self.index_key(model, field, &old))
                    .arg(pk)
                    .ignore();
            }
            pipe.cmd("SADD")
                .arg(self.index_key(model, field, new_value))
                .arg(pk)
                .ignore();
        }
        let mut hset = redis::cmd("HSET");
        hset.arg(self.hash_key(model, pk));
        for (field, value) in pairs {
            hset.arg(*field).arg(value);
        }
        pipe.add_command(hset).ignore();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Lists
    // ------------------------------------------------------------------

    /// LPUSH a pk onto an entity list.
    pub async fn list_push_left(&self, key: &str, value: i64) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: () = redis::cmd("LPUSH")
            .arg(key)
            .arg(value)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    /// RPUSH a pk onto an entity list.
    pub async fn list_push_right(&self, key: &str, value: i64) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: () = redis::cmd("RPUSH")
            .arg(key)
            .arg(value)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Remove every occurrence of a pk from an entity list.
    pub async fn list_remove(&self, key: &str, value: i64) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: () = redis::cmd("LREM")
            .arg(key)
            .arg(0)
            .arg(value)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Full contents of an entity list, head first.
    pub async fn list_range(&self, key: &str) -> Result<Vec<i64>> {
        let mut conn = self.conn().await?;
        let values: Vec<i64> = redis::cmd("LRANGE")
            .arg(key)
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await?;
        Ok(values)
    }

    /// BLPOP across an ordered key list.
    ///
    /// Scans `keys` in order and returns the first available element as
    /// `(list_key, value)`, or `None` once `timeout` elapses with every list
    /// empty. The timeout is rounded up to whole seconds with a minimum of
    /// one (BLPOP treats zero as "block forever"). The call holds one pooled
    /// connection for at most `timeout`, so a blocked worker never stalls
    /// other callers of the pool.
    pub async fn blocking_pop_left(
        &self,
        keys: &[String],
        timeout: Duration,
    ) -> Result<Option<(String, String)>> {
        let mut seconds = timeout.as_secs();
        if timeout.subsec_nanos() > 0 {
            seconds += 1;
        }
        let mut conn = self.conn().await?;
        let popped: Option<(String, String)> = redis::cmd("BLPOP")
            .arg(keys)
            .arg(seconds.max(1))
            .query_async(&mut conn)
            .await?;
        Ok(popped)
    }

    // ------------------------------------------------------------------
    // Scripted operations
    // ------------------------------------------------------------------

    /// Atomically move a waiting job between priority tiers.
    ///
    /// Removes the pk from `src_waiting_key`, rewrites `status`/`priority`
    /// (with index maintenance), and pushes the pk onto `dst_waiting_key` —
    /// left if `prepend`. Because the script is one atomic unit, the pk is
    /// never observable in two waiting lists, and no intermediate status is
    /// observable either.
    #[allow(clippy::too_many_arguments)]
    pub async fn requeue_waiting(
        &self,
        model: &'static str,
        pk: i64,
        src_waiting_key: &str,
        dst_waiting_key: &str,
        old_priority: i64,
        new_priority: i64,
        prepend: bool,
        waiting_status: &str,
    ) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: () = self
            .requeue_script
            .prepare_invoke()
            .key(self.hash_key(model, pk))
            .key(src_waiting_key)
            .key(dst_waiting_key)
            .key(self.index_key(model, "priority", &old_priority.to_string()))
            .key(self.index_key(model, "priority", &new_priority.to_string()))
            .key(self.index_key(model, "status", waiting_status))
            .arg(pk)
            .arg(new_priority)
            .arg(if prepend { "1" } else { "0" })
            .arg(waiting_status)
            .invoke_async(&mut conn)
            .await?;
        debug!(model, pk, old_priority, new_priority, prepend, "requeued");
        Ok(())
    }
}

/// Recover an entity pk from a raw list key.
///
/// List keys have the shape `<ns>:<model>:<pk>:<field>`; the pk is the
/// second-to-last colon-separated segment.
pub fn pk_from_list_key(key: &str) -> Option<i64> {
    let mut segments = key.rsplit(':');
    segments.next()?;
    segments.next()?.parse().ok()
}
