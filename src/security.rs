//! Response shaper: sensitive-field stripping, header transforms, and
//! the seven security response headers.
//!
//! The stripper dispatches on `serde_json::Value`'s own object/array/scalar
//! discriminant and recurses structurally.

use axum::http::{HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;

const DENYLIST: &[&str] = &[
    "password",
    "token_secret",
    "internal_flag",
    "secret_key",
    "private_key",
    "api_key",
    "auth_token",
    "session_id",
];

/// Recursively removes denylisted keys (case-insensitive) from a JSON value
/// at any depth. Non-object/array values pass through unchanged.
pub fn strip_sensitive_fields(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (key, v) in map {
                if DENYLIST.iter().any(|d| d.eq_ignore_ascii_case(&key)) {
                    continue;
                }
                out.insert(key, strip_sensitive_fields(v));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(strip_sensitive_fields).collect()),
        scalar => scalar,
    }
}

const HOP_BY_HOP_AND_SPOOFABLE: &[&str] = &["x-forwarded-for", "x-real-ip"];

/// Strips spoofable/hop-by-hop headers and injects gateway identification
/// headers before forwarding a request upstream.
pub fn transform_request_headers(mut headers: HeaderMap, request_id: &str) -> HeaderMap {
    for name in HOP_BY_HOP_AND_SPOOFABLE {
        headers.remove(*name);
    }
    headers.insert(
        HeaderName::from_static("x-gateway-version"),
        HeaderValue::from_static("1.0"),
    );
    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert(HeaderName::from_static("x-request-id"), value);
    }
    headers
}

/// The seven security headers injected on every client-facing response,
/// including cache hits and error responses.
pub fn security_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert("X-Frame-Options", HeaderValue::from_static("DENY"));
    headers.insert(
        "X-Content-Type-Options",
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(
        "X-XSS-Protection",
        HeaderValue::from_static("1; mode=block"),
    );
    headers.insert(
        "Strict-Transport-Security",
        HeaderValue::from_static("max-age=31536000; includeSubDomains"),
    );
    headers.insert(
        "Referrer-Policy",
        HeaderValue::from_static("strict-origin-when-cross-origin"),
    );
    headers.insert(
        "Content-Security-Policy",
        HeaderValue::from_static("default-src 'self'"),
    );
    headers.insert(
        "Permissions-Policy",
        HeaderValue::from_static("geolocation=(), microphone=(), camera=()"),
    );
    headers
}
