//! Structured telemetry sink: a closed set of typed events, a bounded ring
//! of recent events, and O(1) aggregate counters.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

use crate::error::ErrorCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    CacheHit,
    CacheMiss,
    StaleCacheUsed,
    ProviderAttempt,
    ProviderSuccess,
    ProviderFailure,
    CircuitOpen,
    MergeSuccess,
    MergeFailed,
    MergeInsufficientProviders,
    BatchFetch,
    AllProvidersFailed,
}

impl EventKind {
    fn as_str(&self) -> &'static str {
        match self {
            EventKind::CacheHit => "cache_hit",
            EventKind::CacheMiss => "cache_miss",
            EventKind::StaleCacheUsed => "stale_cache_used",
            EventKind::ProviderAttempt => "provider_attempt",
            EventKind::ProviderSuccess => "provider_success",
            EventKind::ProviderFailure => "provider_failure",
            EventKind::CircuitOpen => "circuit_open",
            EventKind::MergeSuccess => "merge_success",
            EventKind::MergeFailed => "merge_failed",
            EventKind::MergeInsufficientProviders => "merge_insufficient_providers",
            EventKind::BatchFetch => "batch_fetch",
            EventKind::AllProvidersFailed => "all_providers_failed",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TelemetryEvent {
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    pub provider: Option<String>,
    pub key: Option<String>,
    pub duration_ms: Option<u64>,
    pub error_code: Option<ErrorCode>,
    pub metadata: HashMap<String, String>,
}

impl TelemetryEvent {
    fn bare(kind: EventKind) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
            provider: None,
            key: None,
            duration_ms: None,
            error_code: None,
            metadata: HashMap::new(),
        }
    }

    pub fn cache_hit(key: &str) -> Self {
        Self {
            key: Some(key.to_string()),
            ..Self::bare(EventKind::CacheHit)
        }
    }

    pub fn cache_miss(key: &str) -> Self {
        Self {
            key: Some(key.to_string()),
            ..Self::bare(EventKind::CacheMiss)
        }
    }

    pub fn stale_cache_used(key: &str) -> Self {
        Self {
            key: Some(key.to_string()),
            ..Self::bare(EventKind::StaleCacheUsed)
        }
    }

    pub fn provider_attempt(provider: &str, key: &str) -> Self {
        Self {
            provider: Some(provider.to_string()),
            key: Some(key.to_string()),
            ..Self::bare(EventKind::ProviderAttempt)
        }
    }

    pub fn provider_success(provider: &str, key: &str, duration_ms: u64) -> Self {
        Self {
            provider: Some(provider.to_string()),
            key: Some(key.to_string()),
            duration_ms: Some(duration_ms),
            ..Self::bare(EventKind::ProviderSuccess)
        }
    }

    pub fn provider_failure(provider: &str, key: &str, code: ErrorCode, duration_ms: u64) -> Self {
        Self {
            provider: Some(provider.to_string()),
            key: Some(key.to_string()),
            duration_ms: Some(duration_ms),
            error_code: Some(code),
            ..Self::bare(EventKind::ProviderFailure)
        }
    }

    pub fn circuit_open(provider: &str, key: &str) -> Self {
        Self {
            provider: Some(provider.to_string()),
            key: Some(key.to_string()),
            ..Self::bare(EventKind::CircuitOpen)
        }
    }

    pub fn merge_success(key: &str, provider_count: usize) -> Self {
        let mut metadata = HashMap::new();
        metadata.insert("provider_count".to_string(), provider_count.to_string());
        Self {
            key: Some(key.to_string()),
            metadata,
            ..Self::bare(EventKind::MergeSuccess)
        }
    }

    pub fn merge_failed(key: &str) -> Self {
        Self {
            key: Some(key.to_string()),
            ..Self::bare(EventKind::MergeFailed)
        }
    }

    pub fn merge_insufficient_providers(key: &str) -> Self {
        Self {
            key: Some(key.to_string()),
            ..Self::bare(EventKind::MergeInsufficientProviders)
        }
    }

    pub fn batch_fetch(uncached_count: usize, chunk_count: usize) -> Self {
        let mut metadata = HashMap::new();
        metadata.insert("uncached_count".to_string(), uncached_count.to_string());
        metadata.insert("chunk_count".to_string(), chunk_count.to_string());
        Self { metadata, ..Self::bare(EventKind::BatchFetch) }
    }

    pub fn all_providers_failed(key: &str) -> Self {
        Self {
            key: Some(key.to_string()),
            ..Self::bare(EventKind::AllProvidersFailed)
        }
    }
}

/// Synchronous and infallible by design — emitting telemetry must never be a
/// suspension point on the caller's critical path.
pub trait TelemetrySink: Send + Sync {
    fn record(&self, event: TelemetryEvent);
}

#[derive(Debug, Clone, Serialize)]
pub struct TelemetryAggregates {
    pub total_events: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_hit_rate: f64,
    pub stale_cache_uses: u64,
    pub circuit_open_events: u64,
    pub merge_successes: u64,
    pub merge_failures: u64,
    pub batch_operations: u64,
    pub provider_attempts: HashMap<String, u64>,
    pub provider_successes: HashMap<String, u64>,
    pub provider_errors: HashMap<String, HashMap<ErrorCode, u64>>,
}

/// The bundled sink: a bounded drop-oldest ring plus low-contention
/// per-provider/per-error-code counters.
pub struct InMemoryTelemetrySink {
    ring: Mutex<VecDeque<TelemetryEvent>>,
    ring_capacity: usize,
    total_events: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    stale_cache_uses: AtomicU64,
    circuit_open_events: AtomicU64,
    merge_successes: AtomicU64,
    merge_failures: AtomicU64,
    batch_operations: AtomicU64,
    provider_attempts: DashMap<String, AtomicU64>,
    provider_successes: DashMap<String, AtomicU64>,
    provider_errors: DashMap<String, DashMap<ErrorCode, AtomicU64>>,
}

impl InMemoryTelemetrySink {
    pub fn new(ring_capacity: usize) -> Self {
        Self {
            ring: Mutex::new(VecDeque::with_capacity(ring_capacity.min(4096))),
            ring_capacity,
            total_events: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            stale_cache_uses: AtomicU64::new(0),
            circuit_open_events: AtomicU64::new(0),
            merge_successes: AtomicU64::new(0),
            merge_failures: AtomicU64::new(0),
            batch_operations: AtomicU64::new(0),
            provider_attempts: DashMap::new(),
            provider_successes: DashMap::new(),
            provider_errors: DashMap::new(),
        }
    }

    pub fn cache_hit_rate(&self) -> f64 {
        let hits = self.cache_hits.load(Ordering::Relaxed) as f64;
        let misses = self.cache_misses.load(Ordering::Relaxed) as f64;
        if hits + misses == 0.0 {
            0.0
        } else {
            100.0 * hits / (hits + misses)
        }
    }

    pub fn recent_events(&self, limit: usize) -> Vec<TelemetryEvent> {
        let ring = self.ring.lock().expect("telemetry ring mutex poisoned");
        ring.iter().rev().take(limit).cloned().collect()
    }

    pub fn aggregates(&self) -> TelemetryAggregates {
        TelemetryAggregates {
            total_events: self.total_events.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            cache_hit_rate: self.cache_hit_rate(),
            stale_cache_uses: self.stale_cache_uses.load(Ordering::Relaxed),
            circuit_open_events: self.circuit_open_events.load(Ordering::Relaxed),
            merge_successes: self.merge_successes.load(Ordering::Relaxed),
            merge_failures: self.merge_failures.load(Ordering::Relaxed),
            batch_operations: self.batch_operations.load(Ordering::Relaxed),
            provider_attempts: self
                .provider_attempts
                .iter()
                .map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed)))
                .collect(),
            provider_successes: self
                .provider_successes
                .iter()
                .map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed)))
                .collect(),
            provider_errors: self
                .provider_errors
                .iter()
                .map(|e| {
                    let by_code = e
                        .value()
                        .iter()
                        .map(|c| (*c.key(), c.value().load(Ordering::Relaxed)))
                        .collect();
                    (e.key().clone(), by_code)
                })
                .collect(),
        }
    }
}

impl TelemetrySink for InMemoryTelemetrySink {
    fn record(&self, event: TelemetryEvent) {
        self.total_events.fetch_add(1, Ordering::Relaxed);
        match event.kind {
            EventKind::CacheHit => {
                self.cache_hits.fetch_add(1, Ordering::Relaxed);
            }
            EventKind::CacheMiss => {
                self.cache_misses.fetch_add(1, Ordering::Relaxed);
            }
            EventKind::StaleCacheUsed => {
                self.stale_cache_uses.fetch_add(1, Ordering::Relaxed);
            }
            EventKind::CircuitOpen => {
                self.circuit_open_events.fetch_add(1, Ordering::Relaxed);
            }
            EventKind::MergeSuccess => {
                self.merge_successes.fetch_add(1, Ordering::Relaxed);
            }
            EventKind::MergeFailed | EventKind::MergeInsufficientProviders => {
                self.merge_failures.fetch_add(1, Ordering::Relaxed);
            }
            EventKind::BatchFetch => {
                self.batch_operations.fetch_add(1, Ordering::Relaxed);
            }
            EventKind::ProviderAttempt => {
                if let Some(provider) = &event.provider {
                    self.provider_attempts
                        .entry(provider.clone())
                        .or_insert_with(|| AtomicU64::new(0))
                        .fetch_add(1, Ordering::Relaxed);
                }
            }
            EventKind::ProviderSuccess => {
                if let Some(provider) = &event.provider {
                    self.provider_successes
                        .entry(provider.clone())
                        .or_insert_with(|| AtomicU64::new(0))
                        .fetch_add(1, Ordering::Relaxed);
                }
            }
            EventKind::ProviderFailure => {
                if let Some(provider) = &event.provider {
                    let code = event.error_code.unwrap_or(ErrorCode::Unknown);
                    self.provider_errors
                        .entry(provider.clone())
                        .or_insert_with(DashMap::new)
                        .entry(code)
                        .or_insert_with(|| AtomicU64::new(0))
                        .fetch_add(1, Ordering::Relaxed);
                }
            }
            EventKind::AllProvidersFailed => {}
        }

        let mut ring = self.ring.lock().expect("telemetry ring mutex poisoned");
        if ring.len() >= self.ring_capacity {
            ring.pop_front();
        }
        ring.push_back(event);
    }
}

/// Fans a recorded event out to every attached sink. Used so an orchestrator
/// can emit to the always-present in-memory sink and any optional external
/// sinks (e.g. the Kafka sink behind the `kafka-telemetry` feature) with one
/// call.
pub struct CompositeTelemetrySink {
    sinks: Vec<std::sync::Arc<dyn TelemetrySink>>,
}

impl CompositeTelemetrySink {
    pub fn new(sinks: Vec<std::sync::Arc<dyn TelemetrySink>>) -> Self {
        Self { sinks }
    }
}

impl TelemetrySink for CompositeTelemetrySink {
    fn record(&self, event: TelemetryEvent) {
        for sink in &self.sinks {
            sink.record(event.clone());
        }
    }
}

#[cfg(feature = "kafka-telemetry")]
pub mod kafka_sink {
    //! Optional Kafka-backed sink, adapted from this codebase's own
    //! `kafka/producer.rs` `EventProducer`: same `FutureProducer` /
    //! `zstd` compression setup, but no retry-with-backoff loop — a
    //! telemetry event is disposable, so an unavailable broker should drop
    //! events rather than stall the caller.

    use std::time::Duration;

    use rdkafka::config::ClientConfig;
    use rdkafka::producer::{FutureProducer, FutureRecord};
    use tokio::sync::mpsc;

    use super::{TelemetryEvent, TelemetrySink};
    use crate::error::OrchestratorError;

    pub struct KafkaTelemetrySink {
        tx: mpsc::Sender<TelemetryEvent>,
    }

    impl KafkaTelemetrySink {
        pub fn new(bootstrap_servers: &str, topic: impl Into<String>) -> Result<Self, OrchestratorError> {
            let producer: FutureProducer = ClientConfig::new()
                .set("bootstrap.servers", bootstrap_servers)
                .set("compression.type", "zstd")
                .create()
                .map_err(|e| OrchestratorError::Config(format!("kafka producer: {e}")))?;

            let (tx, mut rx) = mpsc::channel::<TelemetryEvent>(1024);
            let topic = topic.into();
            tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    let Ok(payload) = serde_json::to_vec(&event) else {
                        continue;
                    };
                    let key = event.kind.as_str();
                    let record = FutureRecord::to(&topic).payload(&payload).key(key);
                    if let Err((err, _)) = producer.send(record, Duration::from_secs(1)).await {
                        tracing::warn!(error = %err, "telemetry event dropped, kafka send failed");
                    }
                }
            });

            Ok(Self { tx })
        }
    }

    impl TelemetrySink for KafkaTelemetrySink {
        fn record(&self, event: TelemetryEvent) {
            if self.tx.try_send(event).is_err() {
                tracing::debug!("telemetry channel full, dropping event");
            }
        }
    }
}
