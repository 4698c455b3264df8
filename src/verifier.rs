//! Token verifier: decodes and validates bearer tokens against a JWKS
//! endpoint, consults the revocation set, and exposes the caller's claims.
//!
//! The key cache follows a TTL-with-grace pattern: a hard TTL triggers a
//! refresh attempt, but a failed refresh keeps serving the existing key
//! rather than erasing it. `ProviderUnavailable` is only surfaced when no
//! key is usable at all.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use tokio::sync::Mutex;

use crate::error::GatewayError;
use crate::store::CoordinationStore;

const KEY_CACHE_TTL: Duration = Duration::from_secs(3600);
const REVOCATION_TTL_DEFAULT: i64 = 86_400;

#[derive(Debug, Clone, Deserialize)]
struct RealmAccess {
    #[serde(default)]
    roles: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct Claims {
    sub: String,
    #[serde(default)]
    exp: Option<i64>,
    #[serde(default)]
    realm_access: Option<RealmAccess>,
    #[serde(default)]
    tier: Option<String>,
}

/// The authenticated identity derived from a verified bearer token.
#[derive(Debug, Clone)]
pub struct Principal {
    pub subject: String,
    pub roles: Vec<String>,
    pub tier: String,
    pub token_exp: Option<i64>,
}

impl Principal {
    pub fn has_any_role(&self, roles: &[&str]) -> bool {
        roles.iter().any(|r| self.roles.iter().any(|owned| owned == r))
    }
}

#[derive(Debug, Deserialize)]
struct Jwk {
    kid: Option<String>,
    kty: String,
    n: Option<String>,
    e: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JwkSet {
    keys: Vec<Jwk>,
}

struct KeyCache {
    fetched_at: Instant,
    keys: HashMap<String, DecodingKey>,
}

pub struct TokenVerifier {
    jwks_url: String,
    issuer: Option<String>,
    audience: Option<String>,
    algorithm: Algorithm,
    http: reqwest::Client,
    cache: Mutex<KeyCache>,
}

impl TokenVerifier {
    pub fn new(
        jwks_url: String,
        issuer: Option<String>,
        audience: Option<String>,
        algorithm_name: &str,
    ) -> Self {
        let algorithm = match algorithm_name {
            "RS384" => Algorithm::RS384,
            "RS512" => Algorithm::RS512,
            _ => Algorithm::RS256,
        };
        TokenVerifier {
            jwks_url,
            issuer,
            audience,
            algorithm,
            http: reqwest::Client::new(),
            cache: Mutex::new(KeyCache {
                fetched_at: Instant::now() - KEY_CACHE_TTL - Duration::from_secs(1),
                keys: HashMap::new(),
            }),
        }
    }

    /// Refreshes the key cache if the soft TTL has elapsed. On fetch
    /// failure, the existing cache (possibly empty) is kept as-is.
    async fn refresh_if_needed(&self) {
        let mut cache = self.cache.lock().await;
        if cache.fetched_at.elapsed() < KEY_CACHE_TTL && !cache.keys.is_empty() {
            return;
        }

        match self.fetch_jwks().await {
            Ok(keys) => {
                cache.keys = keys;
                cache.fetched_at = Instant::now();
            }
            Err(err) => {
                tracing::warn!(error = %err, "JWKS refresh failed, serving stale keys");
            }
        }
    }

    async fn fetch_jwks(&self) -> Result<HashMap<String, DecodingKey>, reqwest::Error> {
        let body: JwkSet = self.http.get(&self.jwks_url).send().await?.json().await?;
        let mut keys = HashMap::new();
        for jwk in body.keys {
            if jwk.kty != "RSA" {
                continue;
            }
            let (Some(n), Some(e)) = (jwk.n.as_deref(), jwk.e.as_deref()) else {
                continue;
            };
            if let Ok(key) = DecodingKey::from_rsa_components(n, e) {
                keys.insert(jwk.kid.clone().unwrap_or_default(), key);
            }
        }
        Ok(keys)
    }

    async fn key_for(&self, kid: Option<&str>) -> Option<DecodingKey> {
        self.refresh_if_needed().await;
        let cache = self.cache.lock().await;
        if cache.keys.is_empty() {
            return None;
        }
        match kid {
            Some(kid) => cache.keys.get(kid).cloned(),
            None => cache.keys.values().next().cloned(),
        }
    }

    /// Verifies a bearer token end to end: revocation, signature, issuer,
    /// audience, expiry, then extracts the principal's claims.
    pub async fn verify(
        &self,
        store: &dyn CoordinationStore,
        token: &str,
    ) -> Result<Principal, GatewayError> {
        if store.is_revoked(token).await?{
            return Err(GatewayError::Revoked);
        }

        let header = decode_header(token).map_err(|_| GatewayError::MalformedToken)?;
        let key = self
            .key_for(header.kid.as_deref())
            .await
            .ok_or(GatewayError::ProviderUnavailable)?;

        let mut validation = Validation::new(self.algorithm);
        if let Some(iss) = &self.issuer {
            validation.set_issuer(&[iss]);
        }
        if let Some(aud) = &self.audience {
            validation.set_audience(&[aud]);
        } else {
            validation.validate_aud = false;
        }

        let data = decode::<Claims>(token, &key, &validation).map_err(|e| {
            use jsonwebtoken::errors::ErrorKind;
            match e.kind() {
                ErrorKind::ExpiredSignature => GatewayError::ExpiredToken,
                ErrorKind::InvalidSignature => GatewayError::InvalidSignature,
                _ => GatewayError::MalformedToken,
            }
        })?;

        let claims = data.claims;
        let roles = claims
            .realm_access
            .map(|ra| ra.roles)
            .unwrap_or_default();

        Ok(Principal {
            subject: claims.sub,
            roles,
            tier: claims.tier.unwrap_or_else(|| "regular".to_string()),
            token_exp: claims.exp,
        })
    }

    /// Revokes a token: adds it to the revocation set with a TTL matching
    /// its own `exp` claim when known, falling back to 24h. Idempotent.
    pub async fn revoke(
        &self,
        store: &dyn CoordinationStore,
        token: &str,
    ) -> Result<(), GatewayError> {
        let ttl = decode_exp_unverified(token).map_or(REVOCATION_TTL_DEFAULT, |exp| {
            let now = crate::util::now_unix();
            (exp - now).max(1)
        });
        store.revoke(token, ttl).await?;
        Ok(())
    }
}

/// Best-effort extraction of the `exp` claim without verifying the
/// signature, used only to size the revocation-set TTL.
fn decode_exp_unverified(token: &str) -> Option<i64> {
    #[derive(Deserialize)]
    struct ExpOnly {
        exp: Option<i64>,
    }
    let mut parts = token.split('.');
    let _header = parts.next()?;
    let payload = parts.next()?;
    let decoded = base64::Engine::decode(
        &base64::engine::general_purpose::URL_SAFE_NO_PAD,
        payload,
    )
    .ok()?;
    let claims: ExpOnly = serde_json::from_slice(&decoded).ok()?;
    claims.exp
}
