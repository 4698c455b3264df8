//! HTTP entrypoint: axum router assembly, the exempt endpoints, and the
//! catch-all forwarding handler that drives the pipeline.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{ConnectInfo, OriginalUri, Query, Request, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router as AxumRouter;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::error::GatewayError;
use crate::loadbalancer::{LoadBalancer, Strategy};
use crate::pipeline::{self, GatewayState, InboundRequest};
use crate::router::Router as ServiceRouter;
use crate::store::RedisStore;
use crate::verifier::TokenVerifier;

/// Builds the shared pipeline state from configuration, connecting the
/// coordination store and constructing the pooled outbound HTTP client.
pub async fn build_state(config: Config) -> Result<Arc<GatewayState>, crate::store::StoreError> {
    let store = RedisStore::connect(&config.kv_url).await?;
    let verifier = TokenVerifier::new(
        config.jwks_url.clone(),
        config.jwt_issuer.clone(),
        config.jwt_audience.clone(),
        &config.jwt_algorithm,
    );
    let known_services: Vec<String> = config.services.keys().cloned().collect();
    let lb = LoadBalancer::new(known_services.clone(), Strategy::RoundRobin);
    let router = ServiceRouter::new(known_services);
    let http = reqwest::Client::builder()
        .pool_max_idle_per_host(config.outbound_pool_max_idle)
        .timeout(config.upstream_timeout)
        .build()
        .expect("outbound client configuration is static and always valid");

    Ok(Arc::new(GatewayState {
        config,
        store: Arc::new(store),
        verifier,
        lb,
        router,
        http,
    }))
}

pub fn build_router(state: Arc<GatewayState>) -> AxumRouter {
    let cors = CorsLayer::new()
        .allow_origin(
            state
                .config
                .allowed_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect::<Vec<_>>(),
        )
        .allow_credentials(true)
        .allow_methods(tower_http::cors::AllowMethods::mirror_request())
        .allow_headers(tower_http::cors::AllowHeaders::mirror_request());

    AxumRouter::new()
        .route("/health", get(health))
        .route("/gateway/status", get(gateway_status))
        .route("/auth/revoke", post(revoke_token))
        .fallback(forward)
        .with_state(state)
        .layer(middleware::from_fn(inject_security_headers))
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new().gzip(true))
        .layer(cors)
}

/// Applies the seven security headers to every response,
/// including ones the pipeline never touches like `/health` and error
/// responses produced before the pipeline runs.
async fn inject_security_headers(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    for (name, value) in crate::security::security_headers() {
        if let Some(name) = name {
            response.headers_mut().entry(name).or_insert(value);
        }
    }
    response
}

/// Exempt from the pipeline entirely: no auth, no rate limiting, no
/// circuit admission. A liveness probe only.
async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": crate::util::now_unix(),
    }))
}

/// Read-only snapshot of which upstream services are configured and their
/// known replica counts, for operators.
async fn gateway_status(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    let services: HashMap<&str, usize> = state
        .config
        .services
        .iter()
        .map(|(name, desc)| (name.as_str(), desc.replica_urls.len()))
        .collect();
    Json(serde_json::json!({
        "status": "ok",
        "services": services,
    }))
}

/// Exempt from rate limiting and circuit admission. Revokes whichever token
/// the caller presents via `Authorization: Bearer`, not a token named in the
/// request body: a caller can only ever revoke its own token this way.
/// Missing bearer is a 400 here, unlike the pipeline's 401, since there is
/// no "unauthenticated but otherwise valid request" concept for this route.
async fn revoke_token(State(state): State<Arc<GatewayState>>, headers: HeaderMap) -> Response {
    let token = match pipeline::extract_bearer(&headers) {
        Ok(token) => token,
        Err(_) => return GatewayError::RevokeMissingBearer.into_response(),
    };

    match state.verifier.revoke(state.store.as_ref(), token).await {
        Ok(()) => Json(serde_json::json!({"message": "token revoked"})).into_response(),
        Err(err) => err.into_response(),
    }
}

/// Everything not matched above goes through the full pipeline.
async fn forward(
    State(state): State<Arc<GatewayState>>,
    ConnectInfo(addr): ConnectInfo<std::net::SocketAddr>,
    OriginalUri(uri): OriginalUri,
    method: Method,
    Query(query_map): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let client_ip = addr.ip().to_string();

    let content_length = headers
        .get(axum::http::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok());

    let req = InboundRequest {
        method: method.to_string(),
        path: uri.path().to_string(),
        query_string: uri.query().unwrap_or("").to_string(),
        query_map,
        headers,
        body: body.to_vec(),
        client_ip,
        content_length,
    };

    match pipeline::handle_request(&state, req).await {
        Ok(resp) => {
            let status =
                StatusCode::from_u16(resp.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            let mut response = (status, Json(resp.body)).into_response();
            *response.headers_mut() = resp.headers;
            response
        }
        Err(err) => err.into_response(),
    }
}

/// How long the process waits for in-flight requests to finish on shutdown.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);
