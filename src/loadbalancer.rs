//! Load-balancer registry: maps a logical service to one replica URL.
//!
//! Cursor state is process-local — no cross-replica
//! coordination is attempted, which is the whole point of round-robin here:
//! the union of many gateway replicas approximates uniform distribution
//! even though no single replica sees a globally consistent cursor.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use rand::Rng;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    RoundRobin,
    Random,
}

pub struct LoadBalancer {
    cursors: HashMap<String, AtomicUsize>,
    strategy: Strategy,
}

impl LoadBalancer {
    pub fn new(service_names: impl IntoIterator<Item = String>, strategy: Strategy) -> Self {
        let cursors = service_names
            .into_iter()
            .map(|name| (name, AtomicUsize::new(0)))
            .collect();
        LoadBalancer { cursors, strategy }
    }

    /// Selects one replica URL for `service_name`. Returns `None` when the
    /// replica list is empty ("no replica available").
    pub fn select<'a>(&self, service_name: &str, replica_urls: &'a [String]) -> Option<&'a str> {
        if replica_urls.is_empty() {
            return None;
        }

        match self.strategy {
            Strategy::Random => {
                let idx = rand::thread_rng().gen_range(0..replica_urls.len());
                Some(replica_urls[idx].as_str())
            }
            Strategy::RoundRobin => {
                let cursor = self.cursors.get(service_name)?;
                let len = replica_urls.len();
                let idx = cursor.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |i| {
                    Some((i + 1) % len)
                });
                let chosen = idx.unwrap_or(0) % len;
                Some(replica_urls[chosen].as_str())
            }
        }
    }
}
