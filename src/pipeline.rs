//! Request pipeline: the ordered admission -> dispatch -> feedback
//! flow that composes every other component.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::cache::ResponseCache;
use crate::circuitbreaker::CircuitBreaker;
use crate::config::Config;
use crate::error::GatewayError;
use crate::loadbalancer::LoadBalancer;
use crate::ratelimiter::RateLimiter;
use crate::router::Router;
use crate::security;
use crate::store::CoordinationStore;
use crate::verifier::{Principal, TokenVerifier};

/// Everything the pipeline needs, assembled once at startup and shared
/// (via `Arc`) across every request task. Modeled as a constructed registry
/// passed explicitly rather than a process-wide singleton.
pub struct GatewayState {
    pub config: Config,
    pub store: Arc<dyn CoordinationStore>,
    pub verifier: TokenVerifier,
    pub lb: LoadBalancer,
    pub router: Router,
    pub http: reqwest::Client,
}

/// A fully-parsed inbound request, decoupled from axum's `Request` type so
/// the pipeline can be driven directly in tests.
pub struct InboundRequest {
    pub method: String,
    pub path: String,
    pub query_string: String,
    pub query_map: HashMap<String, String>,
    pub headers: axum::http::HeaderMap,
    pub body: Vec<u8>,
    pub client_ip: String,
    pub content_length: Option<u64>,
}

pub struct OutboundResponse {
    pub status: u16,
    pub headers: axum::http::HeaderMap,
    pub body: Value,
}

impl OutboundResponse {
    fn shaped(status: u16, body: Value) -> Self {
        OutboundResponse {
            status,
            headers: security::security_headers(),
            body,
        }
    }
}

/// Runs the full admission -> dispatch -> feedback sequence for one
/// request. Returns `Err` only for the cases that map to an error status;
/// everything else is an `Ok(OutboundResponse)` carrying the upstream
/// status code (step 15).
pub async fn handle_request(
    state: &GatewayState,
    req: InboundRequest,
) -> Result<OutboundResponse, GatewayError> {
    // 1. IP allowlist
    if !state.config.ip_allowed(&req.client_ip) {
        return Err(GatewayError::NotAllowed);
    }

    // 2. Payload size
    if let Some(len) = req.content_length {
        if len > state.config.max_payload_size {
            return Err(GatewayError::TooLarge);
        }
    }

    // 3. Token verification
    let token = extract_bearer(&req.headers)?;
    let principal = state.verifier.verify(state.store.as_ref(), token).await?;

    // 4. Tier lookup, then rate limit
    let tier = state
        .store
        .tier_lookup(&principal.subject)
        .await?
        .unwrap_or_else(|| principal.tier.clone());
    let limiter = RateLimiter::new(
        state.store.as_ref(),
        state.config.rate_limit_window,
        state.config.rate_limit_count_rejected,
    );
    limiter
        .check(&principal.subject, state.config.limit_for(&tier))
        .await?;

    // 5. Router resolves service_name
    let header_service_type = req
        .headers
        .get("x-service-type")
        .and_then(|v| v.to_str().ok());
    let service_name = state
        .router
        .determine_service(&req.path, header_service_type, &req.query_map)
        .ok_or(GatewayError::NotRouted)?;

    // 6. Role check
    check_roles(&req.path, &principal)?;

    // 7. Ownership check
    check_ownership(&req.path, &principal)?;

    // 8. Cache lookup
    let cache = ResponseCache::new(state.store.as_ref(), state.config.cache_ttl);
    let cache_eligible = ResponseCache::eligible(&req.method, &req.path);
    let cache_key = cache_eligible.then(|| {
        ResponseCache::key(
            &req.method,
            &req.path,
            &req.query_string,
            Some(&principal.subject),
        )
    });
    if let Some(key) = &cache_key {
        if let Some(cached_body) = cache.get(key).await {
            let body: Value = serde_json::from_str(&cached_body)
                .unwrap_or_else(|_| Value::String(cached_body));
            return Ok(OutboundResponse::shaped(200, body));
        }
    }

    // 9. Circuit admission
    let breaker = CircuitBreaker::new(
        state.store.as_ref(),
        state.config.circuit_breaker_failure_threshold,
        state.config.circuit_breaker_recovery_timeout,
    );
    breaker.can_attempt(&service_name).await?;

    // 10. Replica selection
    let descriptor = state
        .config
        .services
        .get(&service_name)
        .ok_or(GatewayError::NoReplica)?;
    let replica = state
        .lb
        .select(&service_name, &descriptor.replica_urls)
        .ok_or(GatewayError::NoReplica)?;
    let target_url = Router::target_url(replica, &req.path, &req.query_string);

    // 11. Forward
    let request_id = uuid::Uuid::new_v4().to_string();
    let outbound_headers = security::transform_request_headers(req.headers.clone(), &request_id);
    let method = reqwest::Method::from_bytes(req.method.as_bytes())
        .map_err(|_| GatewayError::NotRouted)?;
    let forward_body = matches!(req.method.as_str(), "POST" | "PUT" | "PATCH").then(|| req.body.clone());

    let mut builder = state
        .http
        .request(method, &target_url)
        .timeout(state.config.upstream_timeout)
        .headers(to_reqwest_headers(&outbound_headers));
    if let Some(body) = forward_body {
        builder = builder.body(body);
    }

    let response = builder.send().await;

    let upstream = match response {
        Ok(resp) => resp,
        Err(err) => {
            breaker.record_failure(&service_name).await?;
            return Err(if err.is_timeout() {
                GatewayError::UpstreamTimeout
            } else {
                GatewayError::UpstreamTransport(err.to_string())
            });
        }
    };

    // 12/13. success feedback and response shaping
    breaker.record_success(&service_name).await?;

    let status = upstream.status().as_u16();
    let content_type = upstream
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let upstream_headers = upstream.headers().clone();
    let raw_body = upstream
        .text()
        .await
        .unwrap_or_default();

    let shaped_body = if content_type.starts_with("application/json") {
        match serde_json::from_str::<Value>(&raw_body) {
            Ok(value) => security::strip_sensitive_fields(value),
            Err(_) => serde_json::json!({"message": "Invalid JSON response"}),
        }
    } else {
        serde_json::json!({"content": raw_body})
    };

    // 14. Cache write
    if let Some(key) = &cache_key {
        if status == 200 {
            cache.put(key, &shaped_body.to_string(), None).await;
        }
    }

    // 15. Return upstream status with shaped body and overlaid headers
    let mut headers = from_reqwest_headers(&upstream_headers);
    for (name, value) in security::security_headers() {
        if let Some(name) = name {
            headers.insert(name, value);
        }
    }

    Ok(OutboundResponse {
        status,
        headers,
        body: shaped_body,
    })
}

pub(crate) fn extract_bearer(headers: &axum::http::HeaderMap) -> Result<&str, GatewayError> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(GatewayError::MissingBearer)
}

/// Role check: `/api/admin` requires `admin`; `/api/user` requires `user`
/// or `admin`.
fn check_roles(path: &str, principal: &Principal) -> Result<(), GatewayError> {
    let required: &[&str] = if path.starts_with("/api/admin") {
        &["admin"]
    } else if path.starts_with("/api/user") {
        &["user", "admin"]
    } else {
        &[]
    };

    if !required.is_empty() && !principal.has_any_role(required) {
        return Err(GatewayError::Unauthorized);
    }
    Ok(())
}

/// Ownership check: `/api/user/{id}/...` (>= 3 segments after `/api`)
/// requires `id == principal.subject`.
fn check_ownership(path: &str, principal: &Principal) -> Result<(), GatewayError> {
    let segments: Vec<&str> = path.trim_start_matches('/').split('/').collect();
    // ["api", "user", "{id}", ...]
    if segments.len() >= 3 && segments[0] == "api" && segments[1] == "user" {
        let resource_id = segments[2];
        if resource_id != principal.subject {
            return Err(GatewayError::OwnershipDenied);
        }
    }
    Ok(())
}

fn to_reqwest_headers(headers: &axum::http::HeaderMap) -> reqwest::header::HeaderMap {
    let mut out = reqwest::header::HeaderMap::new();
    for (name, value) in headers {
        if let (Ok(name), Ok(value)) = (
            reqwest::header::HeaderName::from_bytes(name.as_str().as_bytes()),
            reqwest::header::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            out.insert(name, value);
        }
    }
    out
}

fn from_reqwest_headers(headers: &reqwest::header::HeaderMap) -> axum::http::HeaderMap {
    let mut out = axum::http::HeaderMap::new();
    for (name, value) in headers {
        if let (Ok(name), Ok(value)) = (
            axum::http::HeaderName::from_bytes(name.as_str().as_bytes()),
            axum::http::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            out.insert(name, value);
        }
    }
    out
}
