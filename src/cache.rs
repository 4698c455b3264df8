//! Response cache: fingerprint-keyed cache of upstream JSON responses.
//!
//! Key derivation must be canonical: query parameters are
//! sorted before hashing so semantically equal queries collide.

use md5::{Digest, Md5};

use crate::store::CoordinationStore;

const CACHEABLE_PREFIXES: &[&str] = &["/api/public/", "/api/config/", "/api/health"];

pub struct ResponseCache<'a> {
    store: &'a dyn CoordinationStore,
    default_ttl_secs: i64,
}

impl<'a> ResponseCache<'a> {
    pub fn new(store: &'a dyn CoordinationStore, default_ttl_secs: i64) -> Self {
        ResponseCache {
            store,
            default_ttl_secs,
        }
    }

    /// True only for `GET` against a configured cacheable prefix; paths
    /// under `/api/user/` with more than two segments are never cacheable
    /// even if they happen to share a prefix.
    pub fn eligible(method: &str, path: &str) -> bool {
        if !method.eq_ignore_ascii_case("GET") {
            return false;
        }
        if path.starts_with("/api/user/") && path.matches('/').count() > 2 {
            return false;
        }
        CACHEABLE_PREFIXES.iter().any(|p| path.starts_with(p))
    }

    /// Canonical fingerprint: sorted query parameters so that `?a=1&b=2` and
    /// `?b=2&a=1` collide.
    pub fn key(method: &str, path: &str, query: &str, principal_id: Option<&str>) -> String {
        let mut pairs: Vec<&str> = query.split('&').filter(|s| !s.is_empty()).collect();
        pairs.sort_unstable();
        let canonical_query = pairs.join("&");

        let mut raw = format!("{method}:{path}:{canonical_query}");
        if let Some(id) = principal_id {
            raw.push(':');
            raw.push_str(id);
        }

        let digest = Md5::digest(raw.as_bytes());
        format!("cache:{:x}", digest)
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        self.store.cache_get(key).await.unwrap_or(None)
    }

    /// Writes are best-effort: a store failure here is never surfaced as a
    /// pipeline error.
    pub async fn put(&self, key: &str, body: &str, ttl_secs: Option<i64>) {
        let ttl = ttl_secs.unwrap_or(self.default_ttl_secs);
        if let Err(err) = self.store.cache_put(key, body, ttl).await {
            tracing::debug!(%err, "cache write failed, ignoring");
        }
    }
}
