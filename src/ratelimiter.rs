//! Rate limiter: sliding-window counter over the coordination store.
//!
//! Trims the window, counts, inserts, and refreshes the TTL
//! (`zremrangebyscore` + `zcard` + `zadd` + `expire`) as a single atomic
//! batch via `CoordinationStore::rate_limit_slide`, so the accept/reject
//! decision is made on a consistent count under contention.

use crate::error::GatewayError;
use crate::store::CoordinationStore;
use crate::util::now_unix;

pub struct RateLimiter<'a> {
    store: &'a dyn CoordinationStore,
    window_secs: u64,
    count_rejected: bool,
}

impl<'a> RateLimiter<'a> {
    pub fn new(store: &'a dyn CoordinationStore, window_secs: u64, count_rejected: bool) -> Self {
        RateLimiter {
            store,
            window_secs,
            count_rejected,
        }
    }

    /// Returns `Ok(())` if `principal_id` is within `limit`, else
    /// `RateLimited`. A coordination-store failure fails open (the request
    /// is allowed) rather than surfacing a 500: a stuck limiter must never
    /// block legitimate traffic during a store outage.
    ///
    /// When `count_rejected` is true, the count-and-insert happens as a
    /// single atomic batch, so a request that turns out to be over the
    /// limit has already consumed a slot. When false, the window is peeked
    /// first (no insert) so a rejected request never consumes a slot; an
    /// accepted request is then recorded with a second call.
    pub async fn check(&self, principal_id: &str, limit: u64) -> Result<(), GatewayError> {
        let now = now_unix();
        let key = format!("user:{principal_id}");
        let window = self.window_secs as i64;

        if self.count_rejected {
            let n = match self.store.rate_limit_slide(&key, now, window, true).await {
                Ok(n) => n,
                Err(err) => {
                    tracing::warn!(error = %err, principal_id, "rate limiter store error, failing open");
                    return Ok(());
                }
            };
            return self.accept_or_reject(n, limit);
        }

        let n = match self.store.rate_limit_slide(&key, now, window, false).await {
            Ok(n) => n,
            Err(err) => {
                tracing::warn!(error = %err, principal_id, "rate limiter store error, failing open");
                return Ok(());
            }
        };
        self.accept_or_reject(n, limit)?;

        if let Err(err) = self.store.rate_limit_slide(&key, now, window, true).await {
            tracing::warn!(error = %err, principal_id, "rate limiter store error recording accepted request");
        }
        Ok(())
    }

    fn accept_or_reject(&self, count: u64, limit: u64) -> Result<(), GatewayError> {
        if count >= limit {
            return Err(GatewayError::RateLimited {
                limit,
                window: self.window_secs,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::fake::FakeStore;

    #[tokio::test]
    async fn allows_up_to_limit_then_rejects() {
        let store = FakeStore::new();
        let limiter = RateLimiter::new(&store, 60, true);

        for _ in 0..3 {
            limiter.check("alice", 3).await.unwrap();
        }
        let result = limiter.check("alice", 3).await;
        assert!(matches!(result, Err(GatewayError::RateLimited { limit: 3, window: 60 })));
    }

    #[tokio::test]
    async fn different_principals_have_independent_buckets() {
        let store = FakeStore::new();
        let limiter = RateLimiter::new(&store, 60, true);

        limiter.check("alice", 1).await.unwrap();
        // bob's bucket is untouched by alice's requests
        limiter.check("bob", 1).await.unwrap();
    }

    #[tokio::test]
    async fn store_errors_fail_open() {
        let store = crate::store::fake::FailingStore;
        let limiter = RateLimiter::new(&store, 60, true);
        assert!(limiter.check("alice", 1).await.is_ok());
    }

    #[tokio::test]
    async fn rejected_requests_are_not_counted_when_flag_disabled() {
        let store = FakeStore::new();
        let limiter = RateLimiter::new(&store, 60, false);

        limiter.check("alice", 1).await.unwrap();
        for _ in 0..5 {
            assert!(limiter.check("alice", 1).await.is_err());
        }

        // None of the 5 rejections should have inserted: the window still
        // shows exactly the one accepted request. "user:alice" mirrors the
        // key format `RateLimiter::check` builds internally.
        let n = store
            .rate_limit_slide("user:alice", now_unix(), 60, false)
            .await
            .unwrap();
        assert_eq!(n, 1);
    }
}
