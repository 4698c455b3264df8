//! Coordination-store client: a thin adapter over the external KV store.
//!
//! The store is modeled as a trait so the pipeline and the four stateful
//! engines never talk to `redis` directly — they talk to `CoordinationStore`.
//! Production wires up `RedisStore`; tests wire up the in-memory `FakeStore`
//! below, which implements the same atomicity contracts synchronously.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("coordination store connection error: {0}")]
    Connection(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        StoreError::Connection(e.to_string())
    }
}

/// Snapshot of `circuit:{service}` as defined in the key schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitRecord {
    pub state: String,
    pub failure_count: u64,
    pub last_failure_time: Option<i64>,
}

impl Default for CircuitRecord {
    fn default() -> Self {
        CircuitRecord {
            state: "closed".to_string(),
            failure_count: 0,
            last_failure_time: None,
        }
    }
}

/// The cross-replica coordination surface the four stateful engines share.
///
/// Every method is one round trip (or one pipelined/scripted batch) against
/// the store — no method here implies a multi-round-trip transaction.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Atomically trims `rate_limit:{principal_id}` to the window, reads its
    /// cardinality *before* inserting, inserts `now`, and refreshes the TTL.
    /// Returns the cardinality read before the insert.
    async fn rate_limit_slide(
        &self,
        principal_id: &str,
        now: i64,
        window_secs: i64,
        insert: bool,
    ) -> Result<u64, StoreError>;

    async fn circuit_get(&self, service: &str) -> Result<CircuitRecord, StoreError>;
    async fn circuit_set_closed(&self, service: &str) -> Result<(), StoreError>;
    async fn circuit_set_half_open(&self, service: &str) -> Result<(), StoreError>;
    async fn circuit_set_open(&self, service: &str) -> Result<(), StoreError>;
    /// Increments `failure_count`, stamps `last_failure_time`, and returns
    /// the post-increment count so the caller can decide to open the
    /// circuit.
    async fn circuit_record_failure(&self, service: &str, now: i64) -> Result<u64, StoreError>;

    async fn cache_get(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn cache_put(&self, key: &str, value: &str, ttl_secs: i64) -> Result<(), StoreError>;

    async fn is_revoked(&self, token: &str) -> Result<bool, StoreError>;
    async fn revoke(&self, token: &str, ttl_secs: i64) -> Result<(), StoreError>;

    async fn tier_lookup(&self, principal_id: &str) -> Result<Option<String>, StoreError>;
}

/// Redis-backed implementation. Connects through a `ConnectionManager`,
/// which reconnects transparently and is cheap to clone (it's an `Arc`
/// internally), matching a pooled-client resource model.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(RedisStore { conn })
    }
}

#[async_trait]
impl CoordinationStore for RedisStore {
    async fn rate_limit_slide(
        &self,
        principal_id: &str,
        now: i64,
        window_secs: i64,
        insert: bool,
    ) -> Result<u64, StoreError> {
        let key = format!("rate_limit:{principal_id}");
        let cutoff = now - window_secs;
        let mut conn = self.conn.clone();

        let mut pipe = redis::pipe();
        pipe.atomic()
            .zrembyscore(&key, i64::MIN, cutoff)
            .ignore()
            .zcard(&key);
        if insert {
            pipe.zadd(&key, now.to_string(), now)
                .ignore()
                .expire(&key, window_secs)
                .ignore();
        }

        let results: Vec<u64> = pipe.query_async(&mut conn).await?;
        Ok(*results.first().unwrap_or(&0))
    }

    async fn circuit_get(&self, service: &str) -> Result<CircuitRecord, StoreError> {
        let key = format!("circuit:{service}");
        let mut conn = self.conn.clone();
        let fields: std::collections::HashMap<String, String> = conn.hgetall(&key).await?;

        Ok(CircuitRecord {
            state: fields
                .get("state")
                .cloned()
                .unwrap_or_else(|| "closed".to_string()),
            failure_count: fields
                .get("failure_count")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            last_failure_time: fields.get("last_failure_time").and_then(|v| v.parse().ok()),
        })
    }

    async fn circuit_set_closed(&self, service: &str) -> Result<(), StoreError> {
        let key = format!("circuit:{service}");
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .hset(&key, "state", "closed")
            .ignore()
            .hdel(&key, "failure_count")
            .ignore()
            .hdel(&key, "last_failure_time")
            .ignore();
        let (): () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn circuit_set_half_open(&self, service: &str) -> Result<(), StoreError> {
        let key = format!("circuit:{service}");
        let mut conn = self.conn.clone();
        conn.hset::<_, _, _, ()>(&key, "state", "half_open").await?;
        Ok(())
    }

    async fn circuit_set_open(&self, service: &str) -> Result<(), StoreError> {
        let key = format!("circuit:{service}");
        let mut conn = self.conn.clone();
        conn.hset::<_, _, _, ()>(&key, "state", "open").await?;
        Ok(())
    }

    async fn circuit_record_failure(&self, service: &str, now: i64) -> Result<u64, StoreError> {
        let key = format!("circuit:{service}");
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .hincr(&key, "failure_count", 1)
            .hset(&key, "last_failure_time", now)
            .ignore();
        let results: Vec<u64> = pipe.query_async(&mut conn).await?;
        Ok(*results.first().unwrap_or(&0))
    }

    async fn cache_get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn cache_put(&self, key: &str, value: &str, ttl_secs: i64) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(key, value, ttl_secs.max(1) as u64)
            .await?;
        Ok(())
    }

    async fn is_revoked(&self, token: &str) -> Result<bool, StoreError> {
        let key = format!("revoked:{token}");
        let mut conn = self.conn.clone();
        let exists: bool = conn.exists(&key).await?;
        Ok(exists)
    }

    async fn revoke(&self, token: &str, ttl_secs: i64) -> Result<(), StoreError> {
        let key = format!("revoked:{token}");
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(&key, "1", ttl_secs.max(1) as u64)
            .await?;
        Ok(())
    }

    async fn tier_lookup(&self, principal_id: &str) -> Result<Option<String>, StoreError> {
        let key = format!("user_quota:{principal_id}");
        let mut conn = self.conn.clone();
        let tier: Option<String> = conn.hget(&key, "type").await?;
        Ok(tier)
    }
}

/// In-memory double used across unit and integration tests. Implements the
/// same atomicity contracts as `RedisStore` (single critical section per
/// call, guarded by a `std::sync::Mutex`) without requiring a live Redis.
#[cfg(any(test, feature = "test-util"))]
pub mod fake {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Inner {
        rate_buckets: HashMap<String, Vec<i64>>,
        circuits: HashMap<String, CircuitRecord>,
        cache: HashMap<String, String>,
        revoked: HashSet<String>,
        tiers: HashMap<String, String>,
    }

    #[derive(Default)]
    pub struct FakeStore {
        inner: Mutex<Inner>,
    }

    impl FakeStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set_tier(&self, principal_id: &str, tier: &str) {
            self.inner
                .lock()
                .unwrap()
                .tiers
                .insert(principal_id.to_string(), tier.to_string());
        }
    }

    #[async_trait]
    impl CoordinationStore for FakeStore {
        async fn rate_limit_slide(
            &self,
            principal_id: &str,
            now: i64,
            window_secs: i64,
            insert: bool,
        ) -> Result<u64, StoreError> {
            let mut inner = self.inner.lock().unwrap();
            let cutoff = now - window_secs;
            let bucket = inner
                .rate_buckets
                .entry(principal_id.to_string())
                .or_default();
            bucket.retain(|&ts| ts > cutoff);
            let count = bucket.len() as u64;
            if insert {
                bucket.push(now);
            }
            Ok(count)
        }

        async fn circuit_get(&self, service: &str) -> Result<CircuitRecord, StoreError> {
            Ok(self
                .inner
                .lock()
                .unwrap()
                .circuits
                .get(service)
                .cloned()
                .unwrap_or_default())
        }

        async fn circuit_set_closed(&self, service: &str) -> Result<(), StoreError> {
            self.inner
                .lock()
                .unwrap()
                .circuits
                .insert(service.to_string(), CircuitRecord::default());
            Ok(())
        }

        async fn circuit_set_half_open(&self, service: &str) -> Result<(), StoreError> {
            let mut inner = self.inner.lock().unwrap();
            let record = inner.circuits.entry(service.to_string()).or_default();
            record.state = "half_open".to_string();
            Ok(())
        }

        async fn circuit_set_open(&self, service: &str) -> Result<(), StoreError> {
            let mut inner = self.inner.lock().unwrap();
            let record = inner.circuits.entry(service.to_string()).or_default();
            record.state = "open".to_string();
            Ok(())
        }

        async fn circuit_record_failure(&self, service: &str, now: i64) -> Result<u64, StoreError> {
            let mut inner = self.inner.lock().unwrap();
            let record = inner.circuits.entry(service.to_string()).or_default();
            record.failure_count += 1;
            record.last_failure_time = Some(now);
            Ok(record.failure_count)
        }

        async fn cache_get(&self, key: &str) -> Result<Option<String>, StoreError> {
            Ok(self.inner.lock().unwrap().cache.get(key).cloned())
        }

        async fn cache_put(&self, key: &str, value: &str, _ttl_secs: i64) -> Result<(), StoreError> {
            self.inner
                .lock()
                .unwrap()
                .cache
                .insert(key.to_string(), value.to_string());
            Ok(())
        }

        async fn is_revoked(&self, token: &str) -> Result<bool, StoreError> {
            Ok(self.inner.lock().unwrap().revoked.contains(token))
        }

        async fn revoke(&self, token: &str, _ttl_secs: i64) -> Result<(), StoreError> {
            self.inner.lock().unwrap().revoked.insert(token.to_string());
            Ok(())
        }

        async fn tier_lookup(&self, principal_id: &str) -> Result<Option<String>, StoreError> {
            Ok(self.inner.lock().unwrap().tiers.get(principal_id).cloned())
        }
    }

    /// Always fails. Used to exercise the rate limiter's fail-open and the
    /// circuit breaker's fail-closed policy when the coordination store is
    /// unreachable.
    #[derive(Default)]
    pub struct FailingStore;

    #[async_trait]
    impl CoordinationStore for FailingStore {
        async fn rate_limit_slide(
            &self,
            _principal_id: &str,
            _now: i64,
            _window_secs: i64,
            _insert: bool,
        ) -> Result<u64, StoreError> {
            Err(StoreError::Connection("unreachable".to_string()))
        }

        async fn circuit_get(&self, _service: &str) -> Result<CircuitRecord, StoreError> {
            Err(StoreError::Connection("unreachable".to_string()))
        }

        async fn circuit_set_closed(&self, _service: &str) -> Result<(), StoreError> {
            Err(StoreError::Connection("unreachable".to_string()))
        }

        async fn circuit_set_half_open(&self, _service: &str) -> Result<(), StoreError> {
            Err(StoreError::Connection("unreachable".to_string()))
        }

        async fn circuit_set_open(&self, _service: &str) -> Result<(), StoreError> {
            Err(StoreError::Connection("unreachable".to_string()))
        }

        async fn circuit_record_failure(&self, _service: &str, _now: i64) -> Result<u64, StoreError> {
            Err(StoreError::Connection("unreachable".to_string()))
        }

        async fn cache_get(&self, _key: &str) -> Result<Option<String>, StoreError> {
            Err(StoreError::Connection("unreachable".to_string()))
        }

        async fn cache_put(&self, _key: &str, _value: &str, _ttl_secs: i64) -> Result<(), StoreError> {
            Err(StoreError::Connection("unreachable".to_string()))
        }

        async fn is_revoked(&self, _token: &str) -> Result<bool, StoreError> {
            Err(StoreError::Connection("unreachable".to_string()))
        }

        async fn revoke(&self, _token: &str, _ttl_secs: i64) -> Result<(), StoreError> {
            Err(StoreError::Connection("unreachable".to_string()))
        }

        async fn tier_lookup(&self, _principal_id: &str) -> Result<Option<String>, StoreError> {
            Err(StoreError::Connection("unreachable".to_string()))
        }
    }
}
