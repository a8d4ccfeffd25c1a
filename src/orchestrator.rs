//! The orchestrator: the three public operations that wire the circuit
//! breaker registry, deduplication registry, cache façade, and telemetry
//! sink together.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Serialize};

use crate::cache::{CacheFacade, Tier};
use crate::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerRegistry, CircuitBreakerStats};
use crate::dedup::{DedupStats, DeduplicationRegistry};
use crate::error::{ErrorCode, ProviderError};
use crate::provider::Provider;
use crate::telemetry::{InMemoryTelemetrySink, TelemetryAggregates, TelemetryEvent, TelemetrySink};

/// A single-resource result. Immutable once constructed.
#[derive(Debug, Clone, Serialize)]
pub struct ResultEnvelope<T> {
    pub data: Option<T>,
    /// `"cache"`, a provider name, or `"merged"`.
    pub source: String,
    pub cached: bool,
    pub timestamp: DateTime<Utc>,
    pub age_ms: u64,
    pub errors: Vec<ProviderError>,
    pub metadata: EnvelopeMetadata,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EnvelopeMetadata {
    pub providers_attempted: Vec<String>,
    pub duration_ms: u64,
    pub circuit_breaker_triggered: bool,
    pub deduplicated: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchResultEnvelope<T> {
    pub results: HashMap<String, ResultEnvelope<T>>,
    pub errors: HashMap<String, Vec<ProviderError>>,
    pub summary: BatchSummary,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchSummary {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub cached: usize,
    pub fresh: usize,
    pub duration_ms: u64,
}

#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub cache_key_prefix: String,
    pub resource_kind: String,
    pub tier: Tier,
    pub ttl_override: Option<Duration>,
    pub skip_cache: bool,
    pub allow_stale: bool,
    pub deduplicate: bool,
    pub timeout: Duration,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            cache_key_prefix: String::new(),
            resource_kind: String::new(),
            tier: Tier::Free,
            ttl_override: None,
            skip_cache: false,
            allow_stale: true,
            deduplicate: true,
            timeout: Duration::from_millis(10_000),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MergeOptions {
    pub cache_key_prefix: String,
    pub resource_kind: String,
    pub tier: Tier,
    pub ttl_override: Option<Duration>,
    pub skip_cache: bool,
    pub min_providers: usize,
    pub timeout: Duration,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            cache_key_prefix: String::new(),
            resource_kind: String::new(),
            tier: Tier::Free,
            ttl_override: None,
            skip_cache: false,
            min_providers: 1,
            timeout: Duration::from_millis(10_000),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub cache_key_prefix: String,
    pub resource_kind: String,
    pub tier: Tier,
    pub ttl_override: Option<Duration>,
    pub skip_cache: bool,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            cache_key_prefix: String::new(),
            resource_kind: String::new(),
            tier: Tier::Free,
            ttl_override: None,
            skip_cache: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorStats {
    pub circuit_breakers: HashMap<String, CircuitBreakerStats>,
    pub deduplication: DedupStatsView,
    pub telemetry: TelemetryAggregates,
}

#[derive(Debug, Clone, Serialize)]
pub struct DedupStatsView {
    pub pending: usize,
    pub oldest_age_ms: u64,
}

impl From<DedupStats> for DedupStatsView {
    fn from(stats: DedupStats) -> Self {
        Self {
            pending: stats.pending,
            oldest_age_ms: stats.oldest_age.as_millis() as u64,
        }
    }
}

/// Wires the four supporting components together. Cheaply `Clone`-able —
/// every field is an `Arc` — so it can be captured into the `'static`
/// futures the dedup registry and parallel fan-out require.
#[derive(Clone)]
pub struct Orchestrator {
    breakers: Arc<CircuitBreakerRegistry>,
    dedup: Arc<DeduplicationRegistry>,
    cache: Arc<CacheFacade>,
    telemetry: Arc<InMemoryTelemetrySink>,
    extra_sinks: Arc<Vec<Arc<dyn TelemetrySink>>>,
}

pub struct OrchestratorConfig {
    pub breaker_configs: HashMap<String, CircuitBreakerConfig>,
    pub cache: CacheFacade,
    pub telemetry_ring_capacity: usize,
    pub extra_telemetry_sinks: Vec<Arc<dyn TelemetrySink>>,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self {
            breakers: Arc::new(CircuitBreakerRegistry::new(config.breaker_configs)),
            dedup: Arc::new(DeduplicationRegistry::new()),
            cache: Arc::new(config.cache),
            telemetry: Arc::new(InMemoryTelemetrySink::new(config.telemetry_ring_capacity)),
            extra_sinks: Arc::new(config.extra_telemetry_sinks),
        }
    }

    fn emit(&self, event: TelemetryEvent) {
        self.telemetry.record(event.clone());
        for sink in self.extra_sinks.iter() {
            sink.record(event.clone());
        }
    }

    pub fn get_stats(&self) -> OrchestratorStats {
        OrchestratorStats {
            circuit_breakers: self.breakers.get_all_stats(),
            deduplication: self.dedup.stats().into(),
            telemetry: self.telemetry.aggregates(),
        }
    }

    /// Sequential fallback through an ordered provider list, cache-backed
    /// and optionally deduplicated. See SPEC_FULL.md §4.5.1.
    pub async fn fetch_with_fallback<T>(
        &self,
        key: &str,
        providers: &[Arc<dyn Provider<T>>],
        options: FetchOptions,
    ) -> ResultEnvelope<T>
    where
        T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        if !options.deduplicate {
            return self.fetch_with_fallback_inner(key, providers, options).await;
        }

        let dedup_key = format!("{}:{}", options.cache_key_prefix, key);
        let this = self.clone();
        let providers = providers.to_vec();
        let key_owned = key.to_string();
        let opts = options.clone();

        let (mut envelope, was_deduplicated) = self
            .dedup
            .deduplicate(&dedup_key, move || async move {
                Ok(this
                    .fetch_with_fallback_inner(&key_owned, &providers, opts)
                    .await)
            })
            .await
            .expect("fetch_with_fallback_inner never returns Err");

        envelope.metadata.deduplicated = was_deduplicated;
        envelope
    }

    async fn fetch_with_fallback_inner<T>(
        &self,
        key: &str,
        providers: &[Arc<dyn Provider<T>>],
        options: FetchOptions,
    ) -> ResultEnvelope<T>
    where
        T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let start = Instant::now();
        let cache_key = format!("{}:{}:v1", options.cache_key_prefix, key);
        let mut errors = Vec::new();
        let mut providers_attempted = Vec::new();
        let mut circuit_breaker_triggered = false;

        if !options.skip_cache {
            if let Some((data, age)) = self.cache.get::<T>(&cache_key).await {
                self.emit(TelemetryEvent::cache_hit(key));
                return ResultEnvelope {
                    data: Some(data),
                    source: "cache".to_string(),
                    cached: true,
                    timestamp: Utc::now(),
                    age_ms: age.as_millis() as u64,
                    errors,
                    metadata: EnvelopeMetadata {
                        providers_attempted,
                        duration_ms: elapsed_ms(start),
                        circuit_breaker_triggered,
                        deduplicated: false,
                    },
                };
            }
            self.emit(TelemetryEvent::cache_miss(key));
        }

        for provider in providers {
            let name = provider.name().to_string();
            providers_attempted.push(name.clone());

            let breaker = match self.breakers.breaker(&name) {
                Ok(breaker) => breaker,
                Err(_) => {
                    errors.push(ProviderError::new(
                        &name,
                        ErrorCode::Unknown,
                        "provider is not registered in the circuit breaker configuration table",
                    ));
                    continue;
                }
            };

            if !breaker.can_execute() {
                errors.push(ProviderError::circuit_open(&name));
                circuit_breaker_triggered = true;
                self.emit(TelemetryEvent::circuit_open(&name, key));
                continue;
            }

            self.emit(TelemetryEvent::provider_attempt(&name, key));
            let attempt_start = Instant::now();

            match tokio::time::timeout(options.timeout, provider.fetch(key)).await {
                Ok(Ok(data)) => {
                    breaker.record_success();
                    let ttl = options
                        .ttl_override
                        .unwrap_or_else(|| self.cache.ttl_for(&options.resource_kind, options.tier));
                    self.cache.set(&cache_key, &data, ttl).await;
                    self.emit(TelemetryEvent::provider_success(
                        &name,
                        key,
                        elapsed_ms(attempt_start),
                    ));
                    return ResultEnvelope {
                        data: Some(data),
                        source: name,
                        cached: false,
                        timestamp: Utc::now(),
                        age_ms: 0,
                        errors,
                        metadata: EnvelopeMetadata {
                            providers_attempted,
                            duration_ms: elapsed_ms(start),
                            circuit_breaker_triggered,
                            deduplicated: false,
                        },
                    };
                }
                Ok(Err(fetch_err)) => {
                    breaker.record_failure();
                    let code = fetch_err.resolve_code();
                    self.emit(TelemetryEvent::provider_failure(
                        &name,
                        key,
                        code,
                        elapsed_ms(attempt_start),
                    ));
                    errors.push(ProviderError::from_fetch_error(&name, fetch_err));
                }
                Err(_elapsed) => {
                    breaker.record_failure();
                    self.emit(TelemetryEvent::provider_failure(
                        &name,
                        key,
                        ErrorCode::Timeout,
                        elapsed_ms(attempt_start),
                    ));
                    errors.push(ProviderError::timeout(&name, options.timeout));
                }
            }
        }

        if options.allow_stale {
            if let Some((data, age)) = self.cache.get_allow_expired::<T>(&cache_key).await {
                self.emit(TelemetryEvent::stale_cache_used(key));
                return ResultEnvelope {
                    data: Some(data),
                    source: "cache".to_string(),
                    cached: true,
                    timestamp: Utc::now(),
                    age_ms: age.as_millis() as u64,
                    errors,
                    metadata: EnvelopeMetadata {
                        providers_attempted,
                        duration_ms: elapsed_ms(start),
                        circuit_breaker_triggered,
                        deduplicated: false,
                    },
                };
            }
        }

        self.emit(TelemetryEvent::all_providers_failed(key));
        ResultEnvelope {
            data: None,
            source: "none".to_string(),
            cached: false,
            timestamp: Utc::now(),
            age_ms: 0,
            errors,
            metadata: EnvelopeMetadata {
                providers_attempted,
                duration_ms: elapsed_ms(start),
                circuit_breaker_triggered,
                deduplicated: false,
            },
        }
    }

    /// Parallel fan-out to an unordered provider set, reconciled by a
    /// caller-supplied merge strategy. See SPEC_FULL.md §4.5.2.
    pub async fn fetch_with_merge<T, F>(
        &self,
        key: &str,
        providers: &[Arc<dyn Provider<T>>],
        merge_strategy: F,
        options: MergeOptions,
    ) -> ResultEnvelope<T>
    where
        T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
        F: Fn(&[(String, T)]) -> Option<T>,
    {
        let start = Instant::now();
        let cache_key = format!("{}:{}:v1", options.cache_key_prefix, key);

        if !options.skip_cache {
            if let Some((data, age)) = self.cache.get::<T>(&cache_key).await {
                self.emit(TelemetryEvent::cache_hit(key));
                return ResultEnvelope {
                    data: Some(data),
                    source: "cache".to_string(),
                    cached: true,
                    timestamp: Utc::now(),
                    age_ms: age.as_millis() as u64,
                    errors: Vec::new(),
                    metadata: EnvelopeMetadata {
                        duration_ms: elapsed_ms(start),
                        ..Default::default()
                    },
                };
            }
            self.emit(TelemetryEvent::cache_miss(key));
        }

        let per_provider_opts = FetchOptions {
            cache_key_prefix: options.cache_key_prefix.clone(),
            resource_kind: options.resource_kind.clone(),
            tier: options.tier,
            ttl_override: options.ttl_override,
            skip_cache: true,
            allow_stale: false,
            deduplicate: false,
            timeout: options.timeout,
        };

        let attempts = providers.iter().map(|provider| {
            let this = self.clone();
            let provider = provider.clone();
            let opts = per_provider_opts.clone();
            let key = key.to_string();
            async move {
                this.fetch_with_fallback_inner(&key, std::slice::from_ref(&provider), opts)
                    .await
            }
        });
        let results = futures::future::join_all(attempts).await;

        let mut collected: Vec<(String, T)> = Vec::new();
        let mut errors = Vec::new();
        let mut providers_attempted = Vec::new();
        let mut circuit_breaker_triggered = false;
        for envelope in &results {
            errors.extend(envelope.errors.iter().cloned());
            providers_attempted.extend(envelope.metadata.providers_attempted.iter().cloned());
            circuit_breaker_triggered |= envelope.metadata.circuit_breaker_triggered;
            if let Some(data) = &envelope.data {
                collected.push((envelope.source.clone(), data.clone()));
            }
        }

        let metadata = EnvelopeMetadata {
            providers_attempted,
            duration_ms: elapsed_ms(start),
            circuit_breaker_triggered,
            deduplicated: false,
        };

        if collected.len() < options.min_providers {
            self.emit(TelemetryEvent::merge_insufficient_providers(key));
            return ResultEnvelope {
                data: None,
                source: "merged".to_string(),
                cached: false,
                timestamp: Utc::now(),
                age_ms: 0,
                errors,
                metadata,
            };
        }

        match merge_strategy(&collected) {
            None => {
                self.emit(TelemetryEvent::merge_failed(key));
                ResultEnvelope {
                    data: None,
                    source: "merged".to_string(),
                    cached: false,
                    timestamp: Utc::now(),
                    age_ms: 0,
                    errors,
                    metadata,
                }
            }
            Some(merged) => {
                let ttl = options
                    .ttl_override
                    .unwrap_or_else(|| self.cache.ttl_for(&options.resource_kind, options.tier));
                self.cache.set(&cache_key, &merged, ttl).await;
                self.emit(TelemetryEvent::merge_success(key, collected.len()));
                ResultEnvelope {
                    data: Some(merged),
                    source: "merged".to_string(),
                    cached: false,
                    timestamp: Utc::now(),
                    age_ms: 0,
                    errors,
                    metadata,
                }
            }
        }
    }

    /// Batched fan-out to a single batch-capable provider. See
    /// SPEC_FULL.md §4.5.3.
    pub async fn batch_fetch<T>(
        &self,
        keys: &[String],
        provider: Arc<dyn Provider<T>>,
        options: BatchOptions,
    ) -> BatchResultEnvelope<T>
    where
        T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let start = Instant::now();
        let name = provider.name().to_string();
        let mut results: HashMap<String, ResultEnvelope<T>> = HashMap::new();
        let mut errors: HashMap<String, Vec<ProviderError>> = HashMap::new();

        let lookups = keys.iter().map(|k| {
            let this = self.clone();
            let prefix = options.cache_key_prefix.clone();
            let k = k.clone();
            async move {
                let cache_key = format!("{}:{}:v1", prefix, k);
                let hit = if options.skip_cache {
                    None
                } else {
                    this.cache.get::<T>(&cache_key).await
                };
                (k, hit)
            }
        });
        let lookup_results = futures::future::join_all(lookups).await;

        let mut uncached = Vec::new();
        for (k, hit) in lookup_results {
            match hit {
                Some((data, age)) => {
                    self.emit(TelemetryEvent::cache_hit(&k));
                    results.insert(
                        k,
                        ResultEnvelope {
                            data: Some(data),
                            source: "cache".to_string(),
                            cached: true,
                            timestamp: Utc::now(),
                            age_ms: age.as_millis() as u64,
                            errors: Vec::new(),
                            metadata: EnvelopeMetadata::default(),
                        },
                    );
                }
                None => {
                    self.emit(TelemetryEvent::cache_miss(&k));
                    uncached.push(k);
                }
            }
        }

        let cached_count = keys.len() - uncached.len();

        if uncached.is_empty() {
            return BatchResultEnvelope {
                results,
                errors,
                summary: BatchSummary {
                    total: keys.len(),
                    successful: keys.len(),
                    failed: 0,
                    cached: cached_count,
                    fresh: 0,
                    duration_ms: elapsed_ms(start),
                },
            };
        }

        let chunk_size = provider.max_batch_size().unwrap_or(uncached.len()).max(1);
        let chunks: Vec<Vec<String>> = uncached.chunks(chunk_size).map(|c| c.to_vec()).collect();

        self.emit(TelemetryEvent::batch_fetch(uncached.len(), chunks.len()));

        let breaker = self.breakers.breaker(&name);
        let ttl = options
            .ttl_override
            .unwrap_or_else(|| self.cache.ttl_for(&options.resource_kind, options.tier));

        let chunk_futures = chunks.into_iter().map(|chunk| {
            let this = self.clone();
            let provider = provider.clone();
            let name = name.clone();
            let breaker = breaker.clone();
            let prefix = options.cache_key_prefix.clone();
            async move {
                let breaker = match breaker {
                    Ok(breaker) => breaker,
                    Err(_) => {
                        return (
                            chunk,
                            Err(ProviderError::new(
                                &name,
                                ErrorCode::Unknown,
                                "provider is not registered in the circuit breaker configuration table",
                            )),
                        );
                    }
                };
                if !breaker.can_execute() {
                    return (chunk, Err(ProviderError::circuit_open(&name)));
                }
                match provider.batch_fetch(&chunk).await {
                    Ok(values) => {
                        breaker.record_success();
                        for (k, v) in &values {
                            let cache_key = format!("{}:{}:v1", prefix, k);
                            this.cache.set(&cache_key, v, ttl).await;
                        }
                        (chunk, Ok(values))
                    }
                    Err(fetch_err) => {
                        breaker.record_failure();
                        (chunk, Err(ProviderError::from_fetch_error(&name, fetch_err)))
                    }
                }
            }
        });
        let chunk_results = futures::future::join_all(chunk_futures).await;

        let mut fresh = 0usize;
        for (chunk, outcome) in chunk_results {
            match outcome {
                Ok(values) => {
                    for k in &chunk {
                        if let Some(v) = values.get(k) {
                            results.insert(
                                k.clone(),
                                ResultEnvelope {
                                    data: Some(v.clone()),
                                    source: name.clone(),
                                    cached: false,
                                    timestamp: Utc::now(),
                                    age_ms: 0,
                                    errors: Vec::new(),
                                    metadata: EnvelopeMetadata::default(),
                                },
                            );
                            fresh += 1;
                        } else {
                            errors.insert(
                                k.clone(),
                                vec![ProviderError::new(
                                    &name,
                                    ErrorCode::NotFound,
                                    "key omitted from batch response",
                                )],
                            );
                        }
                    }
                }
                Err(provider_error) => {
                    for k in &chunk {
                        errors.entry(k.clone()).or_default().push(provider_error.clone());
                    }
                }
            }
        }

        let successful = results.len();
        let failed = errors.len();
        BatchResultEnvelope {
            results,
            errors,
            summary: BatchSummary {
                total: keys.len(),
                successful,
                failed,
                cached: cached_count,
                fresh,
                duration_ms: elapsed_ms(start),
            },
        }
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}
