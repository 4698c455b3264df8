//! Router: maps an inbound request to a logical service name and,
//! together with the load-balancer, to a concrete upstream URL.
//!
//! Resolution order is fixed (first match wins): path prefix,
//! then header override, then query hint, then no match.

use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct RouteRule {
    pub path_prefix: String,
    pub service_name: String,
}

pub struct Router {
    path_rules: Vec<RouteRule>,
    query_hints: HashMap<(String, String), String>,
    known_services: Vec<String>,
}

impl Router {
    pub fn new(known_services: Vec<String>) -> Self {
        Router {
            path_rules: vec![
                RouteRule {
                    path_prefix: "/api/user".to_string(),
                    service_name: "user-service".to_string(),
                },
                RouteRule {
                    path_prefix: "/api/order".to_string(),
                    service_name: "order-service".to_string(),
                },
            ],
            query_hints: [(("region".to_string(), "us".to_string()), "user-service".to_string())]
                .into_iter()
                .collect(),
            known_services,
        }
    }

    /// Determines which logical service should handle the request.
    pub fn determine_service(
        &self,
        path: &str,
        header_service_type: Option<&str>,
        query: &HashMap<String, String>,
    ) -> Option<String> {
        for rule in &self.path_rules {
            if path.starts_with(&rule.path_prefix) {
                return Some(rule.service_name.clone());
            }
        }

        if let Some(service_type) = header_service_type {
            if self.known_services.iter().any(|s| s == service_type) {
                return Some(service_type.to_string());
            }
        }

        for (key, value) in query {
            if let Some(target) = self.query_hints.get(&(key.clone(), value.clone())) {
                return Some(target.clone());
            }
        }

        None
    }

    /// Joins the selected replica origin with the original path, preserving
    /// it exactly: no normalization, no trailing-slash rewriting.
    pub fn target_url(replica_url: &str, path: &str, query: &str) -> String {
        let base = replica_url.trim_end_matches('/');
        if query.is_empty() {
            format!("{base}{path}")
        } else {
            format!("{base}{path}?{query}")
        }
    }
}
