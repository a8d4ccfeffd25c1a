//! Shared mock provider used by the black-box scenario tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use data_source_orchestrator::{CircuitBreakerConfig, FetchError, Provider};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Quote {
    pub symbol: String,
    pub price: f64,
}

/// A provider whose first `fail_count` calls return an error and whose
/// calls thereafter succeed with a fixed price. Tracks how many times
/// `fetch` was actually invoked so tests can assert on fan-out/dedup/
/// circuit-breaker behavior.
pub struct ScriptedProvider {
    pub name: String,
    pub price: f64,
    pub fail_count: u32,
    pub calls: AtomicU32,
    pub batch_size: Option<usize>,
}

impl ScriptedProvider {
    pub fn new(name: impl Into<String>, price: f64, fail_count: u32) -> Arc<dyn Provider<Quote>> {
        Arc::new(Self {
            name: name.into(),
            price,
            fail_count,
            calls: AtomicU32::new(0),
            batch_size: None,
        })
    }

    pub fn always_fails(name: impl Into<String>) -> Arc<dyn Provider<Quote>> {
        Arc::new(Self {
            name: name.into(),
            price: 0.0,
            fail_count: u32::MAX,
            calls: AtomicU32::new(0),
            batch_size: None,
        })
    }

    pub fn batching(name: impl Into<String>, price: f64, batch_size: usize) -> Arc<dyn Provider<Quote>> {
        Arc::new(Self {
            name: name.into(),
            price,
            fail_count: 0,
            calls: AtomicU32::new(0),
            batch_size: Some(batch_size),
        })
    }
}

#[async_trait]
impl Provider<Quote> for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, key: &str) -> Result<Quote, FetchError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.fail_count {
            return Err(FetchError::new("network error calling provider"));
        }
        Ok(Quote {
            symbol: key.to_string(),
            price: self.price,
        })
    }

    fn max_batch_size(&self) -> Option<usize> {
        self.batch_size
    }

    async fn batch_fetch(&self, keys: &[String]) -> Result<HashMap<String, Quote>, FetchError> {
        if self.batch_size.is_none() {
            return Err(FetchError::new("batching not supported"));
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(keys
            .iter()
            .map(|k| {
                (
                    k.clone(),
                    Quote {
                        symbol: k.clone(),
                        price: self.price,
                    },
                )
            })
            .collect())
    }
}

pub fn breaker_configs(names: &[&str]) -> HashMap<String, CircuitBreakerConfig> {
    names
        .iter()
        .map(|n| (n.to_string(), CircuitBreakerConfig::default()))
        .collect()
}

pub fn tight_breaker_configs(names: &[&str], failure_threshold: u32) -> HashMap<String, CircuitBreakerConfig> {
    names
        .iter()
        .map(|n| {
            (
                n.to_string(),
                CircuitBreakerConfig {
                    failure_threshold,
                    reset_timeout: std::time::Duration::from_millis(50),
                    half_open_max_requests: 1,
                },
            )
        })
        .collect()
}
