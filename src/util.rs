//! Small shared helpers that don't belong to any one component.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current Unix time in whole seconds, the single time source shared by the
/// rate limiter, circuit breaker, and token verifier.
pub fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before Unix epoch")
        .as_secs() as i64
}
