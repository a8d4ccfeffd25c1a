//! Data Source Orchestrator
//!
//! Resolves quote, fundamentals, batch-quote, and news requests through a
//! tiered cache and multi-provider fallback/merge/batch strategies, behind
//! per-provider circuit breakers.

pub mod cache;
pub mod circuit_breaker;
pub mod config;
pub mod dedup;
pub mod error;
pub mod orchestrator;
pub mod provider;
pub mod telemetry;

pub use cache::{CacheFacade, CacheStore, InMemoryCacheStore, Tier, TtlTable};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitBreakerStats, CircuitState,
};
pub use config::Settings;
pub use dedup::DeduplicationRegistry;
pub use error::{ErrorCode, FetchError, OrchestratorError, ProviderError};
pub use orchestrator::{
    BatchOptions, BatchResultEnvelope, BatchSummary, EnvelopeMetadata, FetchOptions, MergeOptions,
    Orchestrator, OrchestratorConfig, OrchestratorStats, ResultEnvelope,
};
pub use provider::Provider;
pub use telemetry::{
    CompositeTelemetrySink, EventKind, InMemoryTelemetrySink, TelemetryAggregates, TelemetryEvent,
    TelemetrySink,
};

#[cfg(feature = "kafka-telemetry")]
pub use telemetry::kafka_sink::KafkaTelemetrySink;

#[cfg(feature = "redis-cache")]
pub use cache::redis_store::RedisCacheStore;
