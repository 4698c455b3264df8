//! Gateway-wide error taxonomy and its HTTP mapping.
//!
//! One variant per failure case: each carries enough context to render a
//! `{"detail": ...}` body and to tell the pipeline whether circuit feedback
//! is owed.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

/// Whether an error, once mapped to an HTTP response, should also feed back
/// into the circuit breaker for the service that was being called.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitFeedback {
    None,
    RecordFailure,
    RecordSuccess,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("IP address not allowed")]
    NotAllowed,

    #[error("payload too large")]
    TooLarge,

    #[error("token has expired")]
    ExpiredToken,

    #[error("invalid token signature")]
    InvalidSignature,

    #[error("malformed token")]
    MalformedToken,

    #[error("token has been revoked")]
    Revoked,

    #[error("identity provider unavailable")]
    ProviderUnavailable,

    #[error("insufficient permissions")]
    Unauthorized,

    #[error("Access denied: resource ownership check failed")]
    OwnershipDenied,

    #[error("rate limit exceeded. Max {limit} requests per {window} seconds")]
    RateLimited { limit: u64, window: u64 },

    #[error("service not found")]
    NotRouted,

    #[error("service unavailable")]
    NoReplica,

    #[error("service temporarily unavailable")]
    CircuitOpen,

    #[error("service request failed: {0}")]
    UpstreamTransport(String),

    #[error("service request timeout")]
    UpstreamTimeout,

    #[error("invalid bearer token")]
    MissingBearer,

    #[error("missing bearer token")]
    RevokeMissingBearer,

    #[error("coordination store error: {0}")]
    Store(#[from] crate::store::StoreError),
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        use GatewayError::*;
        match self {
            NotAllowed => StatusCode::FORBIDDEN,
            TooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ExpiredToken | InvalidSignature | MalformedToken | Revoked | ProviderUnavailable
            | MissingBearer => StatusCode::UNAUTHORIZED,
            RevokeMissingBearer => StatusCode::BAD_REQUEST,
            Unauthorized | OwnershipDenied => StatusCode::FORBIDDEN,
            RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            NotRouted => StatusCode::NOT_FOUND,
            NoReplica => StatusCode::BAD_GATEWAY,
            CircuitOpen => StatusCode::SERVICE_UNAVAILABLE,
            UpstreamTransport(_) => StatusCode::BAD_GATEWAY,
            UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn circuit_feedback(&self) -> CircuitFeedback {
        use GatewayError::*;
        match self {
            UpstreamTransport(_) | UpstreamTimeout => CircuitFeedback::RecordFailure,
            _ => CircuitFeedback::None,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    detail: String,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let mut response = (status, axum::Json(ErrorBody {
            detail: self.to_string(),
        }))
            .into_response();

        if let GatewayError::RateLimited { window, .. } = &self {
            response
                .headers_mut()
                .insert("Retry-After", window.to_string().parse().unwrap());
        }

        response
    }
}
