//! Circuit breaker: per-upstream state machine backed by the
//! coordination store.
//!
//! The closed/open/half-open vocabulary and the split between "circuit is
//! open" and "inner error" (see `GatewayError::CircuitOpen` vs.
//! `UpstreamTransport`/`UpstreamTimeout`) follow common Tower circuit
//! breaker middleware conventions, adapted here to a store-backed rather
//! than in-process state machine since the breaker must agree across
//! gateway replicas.

use crate::error::GatewayError;
use crate::store::CoordinationStore;
use crate::util::now_unix;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    fn parse(s: &str) -> Self {
        match s {
            "open" => CircuitState::Open,
            "half_open" => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

pub struct CircuitBreaker<'a> {
    store: &'a dyn CoordinationStore,
    failure_threshold: u64,
    recovery_timeout_secs: i64,
}

impl<'a> CircuitBreaker<'a> {
    pub fn new(
        store: &'a dyn CoordinationStore,
        failure_threshold: u64,
        recovery_timeout_secs: i64,
    ) -> Self {
        CircuitBreaker {
            store,
            failure_threshold,
            recovery_timeout_secs,
        }
    }

    /// Returns `Ok(())` if a request may be attempted against `service`,
    /// transitioning `open` -> `half_open` when the recovery window has
    /// elapsed. That transition is written back to the store so it is
    /// observable by concurrent requests.
    ///
    /// A coordination-store failure fails closed: the breaker is treated as
    /// open (request denied) rather than surfacing a 500, since a breaker
    /// that can't be read or written must not be assumed healthy.
    pub async fn can_attempt(&self, service: &str) -> Result<(), GatewayError> {
        let record = match self.store.circuit_get(service).await {
            Ok(record) => record,
            Err(err) => {
                tracing::warn!(error = %err, service, "circuit breaker store error, failing closed");
                return Err(GatewayError::CircuitOpen);
            }
        };
        match CircuitState::parse(&record.state) {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                let elapsed = record
                    .last_failure_time
                    .map(|last| now_unix() - last)
                    .unwrap_or(i64::MAX);
                if elapsed >= self.recovery_timeout_secs {
                    if let Err(err) = self.store.circuit_set_half_open(service).await {
                        tracing::warn!(error = %err, service, "circuit breaker store error, failing closed");
                        return Err(GatewayError::CircuitOpen);
                    }
                    tracing::info!(service, "circuit breaker: open -> half_open");
                    Ok(())
                } else {
                    Err(GatewayError::CircuitOpen)
                }
            }
        }
    }

    /// Best-effort: the upstream call already succeeded by the time this
    /// runs, so a store failure here is logged and swallowed rather than
    /// turned into an error response for an otherwise successful request.
    pub async fn record_success(&self, service: &str) -> Result<(), GatewayError> {
        if let Err(err) = self.store.circuit_set_closed(service).await {
            tracing::warn!(error = %err, service, "circuit breaker store error recording success");
        }
        Ok(())
    }

    /// Records a failed call. A failure during `half_open` is itself the
    /// event that sends the circuit back to `open`; since
    /// a single failure in `half_open` means `failure_count` is already at
    /// or above `failure_threshold` from the run that tripped it, the same
    /// threshold check below covers both cases. Like `record_success`, a
    /// store failure here is logged and swallowed: the upstream call has
    /// already failed and been reported to the client, so this is
    /// best-effort bookkeeping, not a gate.
    pub async fn record_failure(&self, service: &str) -> Result<(), GatewayError> {
        let now = now_unix();
        match self.store.circuit_record_failure(service, now).await {
            Ok(failure_count) if failure_count >= self.failure_threshold => {
                tracing::warn!(service, failure_count, "circuit breaker: -> open");
                if let Err(err) = self.store.circuit_set_open(service).await {
                    tracing::warn!(error = %err, service, "circuit breaker store error recording open state");
                }
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(error = %err, service, "circuit breaker store error recording failure");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::fake::FakeStore;

    #[tokio::test]
    async fn opens_after_threshold_and_rejects_until_recovery() {
        let store = FakeStore::new();
        let breaker = CircuitBreaker::new(&store, 2, 1);

        breaker.can_attempt("svc").await.unwrap();
        breaker.record_failure("svc").await.unwrap();
        breaker.can_attempt("svc").await.unwrap(); // still closed, below threshold
        breaker.record_failure("svc").await.unwrap(); // crosses threshold

        let rec = store.circuit_get("svc").await.unwrap();
        assert_eq!(rec.failure_count, 2);
        assert_eq!(rec.state, "open");

        let result = breaker.can_attempt("svc").await;
        assert!(matches!(result, Err(GatewayError::CircuitOpen)));

        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        breaker.can_attempt("svc").await.unwrap();
        let rec = store.circuit_get("svc").await.unwrap();
        assert_eq!(rec.state, "half_open");
    }

    #[tokio::test]
    async fn success_clears_failure_state() {
        let store = FakeStore::new();
        let breaker = CircuitBreaker::new(&store, 2, 5);
        breaker.record_failure("svc").await.unwrap();
        breaker.record_success("svc").await.unwrap();
        let rec = store.circuit_get("svc").await.unwrap();
        assert_eq!(rec.failure_count, 0);
        assert_eq!(rec.state, "closed");
    }

    #[tokio::test]
    async fn store_errors_fail_closed() {
        let store = crate::store::fake::FailingStore;
        let breaker = CircuitBreaker::new(&store, 2, 60);
        let result = breaker.can_attempt("svc").await;
        assert!(matches!(result, Err(GatewayError::CircuitOpen)));
    }

    #[tokio::test]
    async fn record_success_and_failure_swallow_store_errors() {
        let store = crate::store::fake::FailingStore;
        let breaker = CircuitBreaker::new(&store, 2, 60);
        assert!(breaker.record_success("svc").await.is_ok());
        assert!(breaker.record_failure("svc").await.is_ok());
    }
}
