//! Process configuration, loaded once from the environment at startup.

use std::collections::HashMap;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {name}: {value}")]
    Invalid { name: &'static str, value: String },
}

/// Describes one logical upstream service: its name and replica set.
#[derive(Debug, Clone)]
pub struct ServiceDescriptor {
    pub name: String,
    pub replica_urls: Vec<String>,
    pub health_path: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub jwks_url: String,
    pub jwt_issuer: Option<String>,
    pub jwt_audience: Option<String>,
    pub jwt_algorithm: String,

    pub allowed_origins: Vec<String>,
    pub allowed_ips: Vec<String>,

    pub rate_limit_requests: u64,
    pub rate_limit_window: u64,
    pub premium_rate_limit: u64,
    pub rate_limit_count_rejected: bool,

    pub max_payload_size: u64,

    pub kv_url: String,
    pub cache_ttl: i64,

    pub circuit_breaker_failure_threshold: u64,
    pub circuit_breaker_recovery_timeout: i64,

    pub services: HashMap<String, ServiceDescriptor>,

    pub bind_addr: String,
    pub outbound_pool_max_idle: usize,
    pub upstream_timeout: Duration,
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn parse_u64(name: &'static str, value: String) -> Result<u64, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::Invalid { name, value })
}

fn parse_i64(name: &'static str, value: String) -> Result<i64, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::Invalid { name, value })
}

fn csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

impl Config {
    /// Loads configuration from the process environment.
    ///
    /// Fails fast (non-zero exit, per the gateway's exit-code contract) on
    /// an invalid value; a missing JWKS_URL is the one genuinely required
    /// variable, everything else has a sane default for local development.
    pub fn from_env() -> Result<Self, ConfigError> {
        let jwks_url = std::env::var("JWKS_URL").map_err(|_| ConfigError::Missing("JWKS_URL"))?;

        let rate_limit_requests = parse_u64(
            "RATE_LIMIT_REQUESTS",
            env_or("RATE_LIMIT_REQUESTS", "100"),
        )?;
        let rate_limit_window =
            parse_u64("RATE_LIMIT_WINDOW", env_or("RATE_LIMIT_WINDOW", "60"))?;
        let premium_rate_limit = parse_u64(
            "PREMIUM_RATE_LIMIT",
            env_or("PREMIUM_RATE_LIMIT", "1000"),
        )?;
        let max_payload_size = parse_u64(
            "MAX_PAYLOAD_SIZE",
            env_or("MAX_PAYLOAD_SIZE", "10485760"),
        )?;
        let cache_ttl = parse_i64("CACHE_TTL", env_or("CACHE_TTL", "300"))?;
        let circuit_breaker_failure_threshold = parse_u64(
            "CIRCUIT_BREAKER_FAILURE_THRESHOLD",
            env_or("CIRCUIT_BREAKER_FAILURE_THRESHOLD", "5"),
        )?;
        let circuit_breaker_recovery_timeout = parse_i64(
            "CIRCUIT_BREAKER_RECOVERY_TIMEOUT",
            env_or("CIRCUIT_BREAKER_RECOVERY_TIMEOUT", "60"),
        )?;
        let rate_limit_count_rejected = env_or("RATE_LIMIT_COUNT_REJECTED", "true") == "true";

        let mut services = HashMap::new();
        services.insert(
            "user-service".to_string(),
            ServiceDescriptor {
                name: "user-service".to_string(),
                replica_urls: csv(&env_or(
                    "USER_SERVICE_URLS",
                    "http://localhost:8001,http://localhost:8002",
                )),
                health_path: "/health".to_string(),
            },
        );
        services.insert(
            "order-service".to_string(),
            ServiceDescriptor {
                name: "order-service".to_string(),
                replica_urls: csv(&env_or("ORDER_SERVICE_URLS", "http://localhost:8003")),
                health_path: "/health".to_string(),
            },
        );

        Ok(Config {
            jwks_url,
            jwt_issuer: std::env::var("JWT_ISSUER").ok(),
            jwt_audience: std::env::var("JWT_AUDIENCE").ok(),
            jwt_algorithm: env_or("JWT_ALGORITHM", "RS256"),
            allowed_origins: csv(&env_or("ALLOWED_ORIGINS", "http://localhost:3000")),
            allowed_ips: csv(&env_or("ALLOWED_IPS", "127.0.0.1,::1")),
            rate_limit_requests,
            rate_limit_window,
            premium_rate_limit,
            rate_limit_count_rejected,
            max_payload_size,
            kv_url: env_or("KV_URL", "redis://127.0.0.1:6379"),
            cache_ttl,
            circuit_breaker_failure_threshold,
            circuit_breaker_recovery_timeout,
            services,
            bind_addr: env_or("GATEWAY_BIND_ADDR", "0.0.0.0:8000"),
            outbound_pool_max_idle: parse_u64(
                "OUTBOUND_POOL_MAX_IDLE",
                env_or("OUTBOUND_POOL_MAX_IDLE", "32"),
            )? as usize,
            upstream_timeout: Duration::from_secs(30),
        })
    }

    pub fn limit_for(&self, tier: &str) -> u64 {
        if tier == "premium" {
            self.premium_rate_limit
        } else {
            self.rate_limit_requests
        }
    }

    pub fn ip_allowed(&self, ip: &str) -> bool {
        self.allowed_ips.iter().any(|s| s == "0.0.0.0") || self.allowed_ips.iter().any(|s| s == ip)
    }
}
