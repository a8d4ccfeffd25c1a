//! Demo binary: wires an [`Orchestrator`] with a couple of mock quote
//! providers and runs each of the three fetch strategies once.
//!
//! This is not the orchestrator's intended deployment shape — it is
//! embedded as a library inside a host application — but it exercises the
//! public API end to end and doubles as a smoke test for manual runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use data_source_orchestrator::{
    BatchOptions, CacheFacade, CircuitBreakerConfig, FetchError, FetchOptions, InMemoryCacheStore,
    MergeOptions, Orchestrator, OrchestratorConfig, Provider, Settings, Tier, TtlTable,
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct Quote {
    symbol: String,
    price: f64,
}

struct MockProvider {
    name: String,
    price: f64,
    flaky_until: u32,
    calls: AtomicU32,
}

impl MockProvider {
    fn new(name: impl Into<String>, price: f64, flaky_until: u32) -> Self {
        Self {
            name: name.into(),
            price,
            flaky_until,
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl Provider<Quote> for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, key: &str) -> Result<Quote, FetchError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.flaky_until {
            return Err(FetchError::new(format!("{}: network error, retry", self.name)));
        }
        Ok(Quote {
            symbol: key.to_string(),
            price: self.price,
        })
    }

    fn max_batch_size(&self) -> Option<usize> {
        Some(2)
    }

    async fn batch_fetch(&self, keys: &[String]) -> Result<HashMap<String, Quote>, FetchError> {
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

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,data_source_orchestrator=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = Settings::from_env().unwrap_or_default();
    tracing::info!(?settings, "settings loaded");

    let mut breaker_configs = HashMap::new();
    breaker_configs.insert("primary".to_string(), CircuitBreakerConfig::default());
    breaker_configs.insert("backup".to_string(), CircuitBreakerConfig::default());

    let ttl_table = TtlTable::new(settings.default_cache_ttl)
        .with_entry("quote", Tier::Free, Duration::from_secs(5));
    let cache = CacheFacade::new(
        Arc::new(InMemoryCacheStore::default()),
        ttl_table,
    );

    let orchestrator = Orchestrator::new(OrchestratorConfig {
        breaker_configs,
        cache,
        telemetry_ring_capacity: settings.telemetry_ring_capacity,
        extra_telemetry_sinks: Vec::new(),
    });

    let primary = Arc::new(MockProvider::new("primary", 101.5, 1)) as Arc<dyn Provider<Quote>>;
    let backup = Arc::new(MockProvider::new("backup", 101.0, 0)) as Arc<dyn Provider<Quote>>;

    println!();
    println!("=== data source orchestrator demo ===");

    let envelope = orchestrator
        .fetch_with_fallback(
            "AAPL",
            &[primary.clone(), backup.clone()],
            FetchOptions {
                cache_key_prefix: "quote".to_string(),
                resource_kind: "quote".to_string(),
                tier: Tier::Free,
                ..Default::default()
            },
        )
        .await;
    println!("fallback -> {:?}", envelope.data);

    let merged = orchestrator
        .fetch_with_merge(
            "MSFT",
            &[primary.clone(), backup.clone()],
            |values| {
                let avg = values.iter().map(|(_, q)| q.price).sum::<f64>() / values.len() as f64;
                values.first().map(|(_, q)| Quote {
                    symbol: q.symbol.clone(),
                    price: avg,
                })
            },
            MergeOptions {
                cache_key_prefix: "quote".to_string(),
                resource_kind: "quote".to_string(),
                tier: Tier::Free,
                min_providers: 1,
                ..Default::default()
            },
        )
        .await;
    println!("merge -> {:?}", merged.data);

    let batch = orchestrator
        .batch_fetch(
            &["GOOG".to_string(), "AMZN".to_string(), "META".to_string()],
            backup.clone(),
            BatchOptions {
                cache_key_prefix: "quote".to_string(),
                resource_kind: "quote".to_string(),
                tier: Tier::Free,
                ..Default::default()
            },
        )
        .await;
    println!("batch -> {} resolved, {} failed", batch.summary.successful, batch.summary.failed);

    let stats = orchestrator.get_stats();
    println!("cache hit rate: {:.1}%", stats.telemetry.cache_hit_rate);
    println!();
}
