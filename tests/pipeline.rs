//! End-to-end tests driving the assembled gateway over real HTTP: spin up
//! the gateway itself plus a mock JWKS endpoint and a mock upstream, both as
//! real axum servers bound to an ephemeral port, then exercise it with a
//! plain `reqwest` client.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::extract::State;
use axum::response::Json as AxumJson;
use axum::routing::get;
use axum::Router as AxumRouter;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use rsa::pkcs1::EncodeRsaPrivateKey;
use rsa::rand_core::OsRng;
use rsa::traits::PublicKeyParts;
use rsa::RsaPrivateKey;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;

use api_gateway::config::{Config, ServiceDescriptor};
use api_gateway::loadbalancer::{LoadBalancer, Strategy};
use api_gateway::pipeline::GatewayState;
use api_gateway::router::Router as GatewayRouter;
use api_gateway::server;
use api_gateway::store::fake::FakeStore;
use api_gateway::verifier::TokenVerifier;

#[derive(Serialize)]
struct TestClaims<'a> {
    sub: &'a str,
    exp: i64,
    realm_access: RealmAccess<'a>,
}

#[derive(Serialize)]
struct RealmAccess<'a> {
    roles: &'a [&'a str],
}

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64
}

/// Spins up a real JWKS endpoint serving a single freshly generated RSA key,
/// and returns its base URL plus an encoder for minting tokens against that
/// same key.
async fn spawn_jwks() -> (String, RsaPrivateKey) {
    let private_key = RsaPrivateKey::new(&mut OsRng, 2048).unwrap();
    let public_key = private_key.to_public_key();
    let n = URL_SAFE_NO_PAD.encode(public_key.n().to_bytes_be());
    let e = URL_SAFE_NO_PAD.encode(public_key.e().to_bytes_be());

    let jwks_body = json!({
        "keys": [{"kid": "test-key", "kty": "RSA", "n": n, "e": e}]
    });

    let app = AxumRouter::new().route(
        "/jwks.json",
        get(move || {
            let body = jwks_body.clone();
            async move { AxumJson(body) }
        }),
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{addr}/jwks.json"), private_key)
}

fn sign_token(key: &RsaPrivateKey, subject: &str, roles: &[&str]) -> String {
    let pem = key.to_pkcs1_pem(rsa::pkcs1::LineEnding::LF).unwrap();
    let encoding_key = EncodingKey::from_rsa_pem(pem.as_bytes()).unwrap();
    let mut header = Header::new(Algorithm::RS256);
    header.kid = Some("test-key".to_string());
    let claims = TestClaims {
        sub: subject,
        exp: now() + 3600,
        realm_access: RealmAccess { roles },
    };
    encode(&header, &claims, &encoding_key).unwrap()
}

/// A mock upstream that counts hits and always replies with the same JSON
/// body plus a chosen status, used to assert cache hits never re-dispatch.
async fn spawn_upstream(body: Value, status: u16) -> (String, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let state = (hits.clone(), body, status);

    let app = AxumRouter::new().route(
        "/api/public/foo",
        get(move |State((hits, body, status)): State<(Arc<AtomicUsize>, Value, u16)>| async move {
            hits.fetch_add(1, Ordering::SeqCst);
            (
                axum::http::StatusCode::from_u16(status).unwrap(),
                AxumJson(body),
            )
        }),
    )
    .with_state(state);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{addr}"), hits)
}

fn base_config(jwks_url: String, upstream_base: String) -> Config {
    let mut services = HashMap::new();
    services.insert(
        "test-service".to_string(),
        ServiceDescriptor {
            name: "test-service".to_string(),
            replica_urls: vec![upstream_base],
            health_path: "/health".to_string(),
        },
    );

    Config {
        jwks_url,
        jwt_issuer: None,
        jwt_audience: None,
        jwt_algorithm: "RS256".to_string(),
        allowed_origins: vec!["http://localhost:3000".to_string()],
        allowed_ips: vec!["0.0.0.0".to_string()],
        rate_limit_requests: 100,
        rate_limit_window: 60,
        premium_rate_limit: 1000,
        rate_limit_count_rejected: true,
        max_payload_size: 10_485_760,
        kv_url: "redis://127.0.0.1:6379".to_string(),
        cache_ttl: 300,
        circuit_breaker_failure_threshold: 5,
        circuit_breaker_recovery_timeout: 60,
        services,
        bind_addr: "127.0.0.1:0".to_string(),
        outbound_pool_max_idle: 32,
        upstream_timeout: std::time::Duration::from_secs(5),
    }
}

/// Spawns the gateway itself (no live Redis: backed by `FakeStore`) and
/// returns its base URL.
async fn spawn_gateway(config: Config) -> String {
    let store = FakeStore::new();
    let verifier = TokenVerifier::new(
        config.jwks_url.clone(),
        config.jwt_issuer.clone(),
        config.jwt_audience.clone(),
        &config.jwt_algorithm,
    );
    let known_services: Vec<String> = config.services.keys().cloned().collect();
    let lb = LoadBalancer::new(known_services.clone(), Strategy::RoundRobin);
    let router = GatewayRouter::new(known_services);
    let http = reqwest::Client::new();

    let state = Arc::new(GatewayState {
        config,
        store: Arc::new(store),
        verifier,
        lb,
        router,
        http,
    });

    let app = server::build_router(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    format!("http://{addr}")
}

#[tokio::test]
async fn unauthenticated_health_check() {
    let (jwks_url, _key) = spawn_jwks().await;
    let (upstream, _hits) = spawn_upstream(json!({}), 200).await;
    let gateway = spawn_gateway(base_config(jwks_url, upstream)).await;

    let resp = reqwest::get(format!("{gateway}/health")).await.unwrap();
    assert_eq!(resp.status(), 200);
    for header in ["x-frame-options", "strict-transport-security"] {
        assert!(resp.headers().contains_key(header));
    }
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "healthy");
    assert!(body["timestamp"].is_number());
}

#[tokio::test]
async fn ownership_denial_on_mismatched_subject() {
    let (jwks_url, key) = spawn_jwks().await;
    let (upstream, _hits) = spawn_upstream(json!({}), 200).await;
    let gateway = spawn_gateway(base_config(jwks_url, upstream)).await;

    let token = sign_token(&key, "alice", &["user"]);
    let client = reqwest::Client::new();
    let resp = client
        .get(format!("{gateway}/api/user/bob/profile"))
        .bearer_auth(token)
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 403);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(
        body["detail"],
        "Access denied: resource ownership check failed"
    );
}

#[tokio::test]
async fn sensitive_fields_are_stripped_from_upstream_response() {
    let (jwks_url, key) = spawn_jwks().await;
    let upstream_body = json!({
        "name": "a",
        "password": "p",
        "nested": {"api_key": "k", "v": 1},
    });
    let (upstream, _hits) = spawn_upstream(upstream_body, 200).await;
    let gateway = spawn_gateway(base_config(jwks_url, upstream)).await;

    let token = sign_token(&key, "alice", &["user"]);
    let client = reqwest::Client::new();
    let resp = client
        .get(format!("{gateway}/api/public/foo"))
        .header("x-service-type", "test-service")
        .bearer_auth(token)
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body, json!({"name": "a", "nested": {"v": 1}}));
}

#[tokio::test]
async fn cache_hit_avoids_second_upstream_call() {
    let (jwks_url, key) = spawn_jwks().await;
    let (upstream, hits) = spawn_upstream(json!({"ok": true}), 200).await;
    let gateway = spawn_gateway(base_config(jwks_url, upstream)).await;

    let token = sign_token(&key, "alice", &["user"]);
    let client = reqwest::Client::new();

    let first = client
        .get(format!("{gateway}/api/public/foo?b=2&a=1"))
        .header("x-service-type", "test-service")
        .bearer_auth(token.clone())
        .send()
        .await
        .unwrap();
    assert_eq!(first.status(), 200);
    let first_body: Value = first.json().await.unwrap();

    let second = client
        .get(format!("{gateway}/api/public/foo?a=1&b=2"))
        .header("x-service-type", "test-service")
        .bearer_auth(token)
        .send()
        .await
        .unwrap();
    assert_eq!(second.status(), 200);
    let second_body: Value = second.json().await.unwrap();

    assert_eq!(first_body, second_body);
    assert_eq!(hits.load(Ordering::SeqCst), 1, "second call must hit the cache, not the upstream");
}

#[tokio::test]
async fn revoke_endpoint_revokes_the_presented_bearer_token() {
    let (jwks_url, key) = spawn_jwks().await;
    let (upstream, _hits) = spawn_upstream(json!({"ok": true}), 200).await;
    let gateway = spawn_gateway(base_config(jwks_url, upstream)).await;

    let token = sign_token(&key, "dave", &["user"]);
    let client = reqwest::Client::new();

    let revoke_resp = client
        .post(format!("{gateway}/auth/revoke"))
        .bearer_auth(token.clone())
        .send()
        .await
        .unwrap();
    assert_eq!(revoke_resp.status(), 200);

    let after_revoke = client
        .get(format!("{gateway}/api/public/foo"))
        .header("x-service-type", "test-service")
        .bearer_auth(token)
        .send()
        .await
        .unwrap();
    assert_eq!(after_revoke.status(), 401);
    let body: Value = after_revoke.json().await.unwrap();
    assert_eq!(body["detail"], "token has been revoked");
}

#[tokio::test]
async fn revoke_without_bearer_returns_400() {
    let (jwks_url, _key) = spawn_jwks().await;
    let (upstream, _hits) = spawn_upstream(json!({}), 200).await;
    let gateway = spawn_gateway(base_config(jwks_url, upstream)).await;

    let resp = reqwest::Client::new()
        .post(format!("{gateway}/auth/revoke"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn rate_limit_boundary_rejects_the_fourth_request() {
    let (jwks_url, key) = spawn_jwks().await;
    let (upstream, _hits) = spawn_upstream(json!({"ok": true}), 200).await;
    let mut config = base_config(jwks_url, upstream);
    config.rate_limit_requests = 3;
    config.rate_limit_window = 60;
    let gateway = spawn_gateway(config).await;

    let token = sign_token(&key, "carol", &["user"]);
    let client = reqwest::Client::new();

    for _ in 0..3 {
        let resp = client
            .get(format!("{gateway}/api/public/foo"))
            .header("x-service-type", "test-service")
            .bearer_auth(token.clone())
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
    }

    let fourth = client
        .get(format!("{gateway}/api/public/foo"))
        .header("x-service-type", "test-service")
        .bearer_auth(token)
        .send()
        .await
        .unwrap();
    assert_eq!(fourth.status(), 429);
}
