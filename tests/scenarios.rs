//! Black-box scenarios exercising the orchestrator's three operations end
//! to end, through the public API only.

mod support;

use std::sync::Arc;
use std::time::Duration;

use data_source_orchestrator::{
    BatchOptions, CacheFacade, FetchOptions, InMemoryCacheStore, MergeOptions, Orchestrator,
    OrchestratorConfig, Tier, TtlTable,
};
use support::{breaker_configs, tight_breaker_configs, Quote, ScriptedProvider};

fn orchestrator_with(configs: std::collections::HashMap<String, data_source_orchestrator::CircuitBreakerConfig>) -> Orchestrator {
    let cache = CacheFacade::new(
        Arc::new(InMemoryCacheStore::new(1000, Duration::from_secs(60))),
        TtlTable::new(Duration::from_millis(200)),
    );
    Orchestrator::new(OrchestratorConfig {
        breaker_configs: configs,
        cache,
        telemetry_ring_capacity: 100,
        extra_telemetry_sinks: Vec::new(),
    })
}

fn fetch_opts() -> FetchOptions {
    FetchOptions {
        cache_key_prefix: "quote".to_string(),
        resource_kind: "quote".to_string(),
        tier: Tier::Free,
        ..Default::default()
    }
}

/// S1: a cache hit is served without any provider being attempted.
#[tokio::test]
async fn s1_cache_hit_skips_providers() {
    let orchestrator = orchestrator_with(breaker_configs(&["primary"]));
    let primary = ScriptedProvider::new("primary", 100.0, 0);

    let first = orchestrator
        .fetch_with_fallback("AAPL", &[primary.clone()], fetch_opts())
        .await;
    assert_eq!(first.source, "primary");

    let second = orchestrator
        .fetch_with_fallback("AAPL", &[primary.clone()], fetch_opts())
        .await;
    assert!(second.cached);
    assert_eq!(second.source, "cache");
    assert!(second.metadata.providers_attempted.is_empty());
}

/// S2: the primary provider fails, the fallback succeeds, and the result
/// is cached under the fallback's name.
#[tokio::test]
async fn s2_fallback_recovers_from_primary_failure() {
    let orchestrator = orchestrator_with(breaker_configs(&["primary", "backup"]));
    let primary = ScriptedProvider::always_fails("primary");
    let backup = ScriptedProvider::new("backup", 50.0, 0);

    let envelope = orchestrator
        .fetch_with_fallback("MSFT", &[primary, backup], fetch_opts())
        .await;

    assert_eq!(envelope.source, "backup");
    assert_eq!(envelope.data.unwrap().price, 50.0);
    assert_eq!(envelope.errors.len(), 1);
    assert_eq!(envelope.metadata.providers_attempted, vec!["primary", "backup"]);
}

/// S3: every provider fails, but a stale cache entry within the
/// stale-retention window is served instead of an empty result.
#[tokio::test(start_paused = true)]
async fn s3_stale_cache_rescues_total_provider_failure() {
    let orchestrator = orchestrator_with(breaker_configs(&["flaky"]));
    let warm = ScriptedProvider::new("flaky", 10.0, 0);

    let warmed = orchestrator
        .fetch_with_fallback(
            "GOOG",
            &[warm],
            FetchOptions {
                ttl_override: Some(Duration::from_millis(10)),
                ..fetch_opts()
            },
        )
        .await;
    assert_eq!(warmed.data.as_ref().unwrap().price, 10.0);

    tokio::time::advance(Duration::from_millis(30)).await;

    let dead = ScriptedProvider::always_fails("flaky");
    let rescued = orchestrator
        .fetch_with_fallback("GOOG", &[dead], fetch_opts())
        .await;

    assert!(rescued.cached);
    assert_eq!(rescued.data.unwrap().price, 10.0);
}

/// S4: after enough consecutive failures a breaker opens and subsequent
/// calls are rejected without the provider being invoked again.
#[tokio::test]
async fn s4_circuit_breaker_opens_and_short_circuits() {
    let orchestrator = orchestrator_with(tight_breaker_configs(&["unstable"], 2));
    let provider = ScriptedProvider::always_fails("unstable");

    for _ in 0..2 {
        let envelope = orchestrator
            .fetch_with_fallback("AMZN", &[provider.clone()], fetch_opts())
            .await;
        assert!(!envelope.metadata.circuit_breaker_triggered);
    }

    let tripped = orchestrator
        .fetch_with_fallback("AMZN", &[provider.clone()], fetch_opts())
        .await;
    assert!(tripped.metadata.circuit_breaker_triggered);
    assert_eq!(tripped.errors.last().unwrap().code, data_source_orchestrator::ErrorCode::CircuitOpen);
}

/// S5: concurrent fallback calls for the same key collapse into a single
/// underlying provider invocation via the dedup registry.
#[tokio::test]
async fn s5_concurrent_callers_deduplicate() {
    let orchestrator = orchestrator_with(breaker_configs(&["slow"]));
    let provider = ScriptedProvider::new("slow", 77.0, 0);

    let mut handles = Vec::new();
    for _ in 0..5 {
        let orchestrator = orchestrator.clone();
        let provider = provider.clone();
        handles.push(tokio::spawn(async move {
            orchestrator
                .fetch_with_fallback(
                    "NFLX",
                    &[provider],
                    FetchOptions {
                        skip_cache: true,
                        ..fetch_opts()
                    },
                )
                .await
        }));
    }

    let mut deduplicated_count = 0;
    for handle in handles {
        let envelope = handle.await.unwrap();
        assert_eq!(envelope.data.unwrap().price, 77.0);
        if envelope.metadata.deduplicated {
            deduplicated_count += 1;
        }
    }
    assert!(deduplicated_count >= 1, "at least one caller should have been a dedup follower");
}

/// S6: a merge with fewer successful providers than `min_providers`
/// returns a failed envelope without writing to cache.
#[tokio::test]
async fn s6_merge_with_insufficient_providers_fails_closed() {
    let orchestrator = orchestrator_with(breaker_configs(&["a", "b"]));
    let a = ScriptedProvider::new("a", 10.0, 0);
    let b = ScriptedProvider::always_fails("b");

    let envelope = orchestrator
        .fetch_with_merge(
            "TSLA",
            &[a, b],
            |values| values.first().map(|(_, q)| q.clone()),
            MergeOptions {
                cache_key_prefix: "quote".to_string(),
                resource_kind: "quote".to_string(),
                tier: Tier::Free,
                min_providers: 2,
                ..Default::default()
            },
        )
        .await;

    assert!(envelope.data.is_none());
    assert_eq!(envelope.source, "merged");

    let cached_again = orchestrator
        .fetch_with_merge(
            "TSLA",
            &[ScriptedProvider::always_fails("a"), ScriptedProvider::always_fails("b")],
            |values| values.first().map(|(_, q)| q.clone()),
            MergeOptions {
                cache_key_prefix: "quote".to_string(),
                resource_kind: "quote".to_string(),
                tier: Tier::Free,
                min_providers: 1,
                ..Default::default()
            },
        )
        .await;
    assert!(cached_again.data.is_none(), "an insufficient-providers result must not have been cached");
}

/// A successful merge across every provider writes the merged value to
/// cache and reports the provider count it merged over.
#[tokio::test]
async fn merge_succeeds_and_caches_the_merged_value() {
    let orchestrator = orchestrator_with(breaker_configs(&["a", "b"]));
    let a = ScriptedProvider::new("a", 10.0, 0);
    let b = ScriptedProvider::new("b", 20.0, 0);

    let envelope = orchestrator
        .fetch_with_merge(
            "ORCL",
            &[a, b],
            |values| {
                let avg = values.iter().map(|(_, q)| q.price).sum::<f64>() / values.len() as f64;
                Some(Quote { symbol: "ORCL".to_string(), price: avg })
            },
            MergeOptions {
                cache_key_prefix: "quote".to_string(),
                resource_kind: "quote".to_string(),
                tier: Tier::Free,
                min_providers: 2,
                ..Default::default()
            },
        )
        .await;

    assert_eq!(envelope.data.unwrap().price, 15.0);

    let from_cache = orchestrator
        .fetch_with_fallback(
            "ORCL",
            &[ScriptedProvider::always_fails("a")],
            fetch_opts(),
        )
        .await;
    assert!(from_cache.cached);
    assert_eq!(from_cache.data.unwrap().price, 15.0);
}

/// Batch fetch resolves cached keys without calling the provider and
/// chunks the remainder according to the provider's advertised max size.
#[tokio::test]
async fn batch_fetch_uses_cache_first_then_chunks_the_rest() {
    let orchestrator = orchestrator_with(breaker_configs(&["bulk"]));
    let provider = ScriptedProvider::batching("bulk", 5.0, 2);

    orchestrator
        .fetch_with_fallback(
            "AAA",
            &[provider.clone()],
            FetchOptions { skip_cache: false, ..fetch_opts() },
        )
        .await;

    let keys = vec!["AAA".to_string(), "BBB".to_string(), "CCC".to_string(), "DDD".to_string()];
    let result = orchestrator
        .batch_fetch(
            &keys,
            provider,
            BatchOptions {
                cache_key_prefix: "quote".to_string(),
                resource_kind: "quote".to_string(),
                tier: Tier::Free,
                ..Default::default()
            },
        )
        .await;

    assert_eq!(result.summary.total, 4);
    assert_eq!(result.summary.cached, 1);
    assert_eq!(result.summary.successful, 4);
    assert_eq!(result.summary.failed, 0);
}
