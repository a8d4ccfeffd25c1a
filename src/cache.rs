//! Cache façade: fresh/allow-expired reads, TTL-keyed writes, and an age
//! accessor over a pluggable byte-oriented store.
//!
//! Adapted from this codebase's own `middleware/cache.rs` — same
//! `DashMap`-backed in-memory default, same periodic sweep, same "designed
//! for easy migration to Redis" framing from its doc comment — generalized
//! from response bytes to arbitrary serializable values and extended with
//! the "allow expired" read path a response cache never needed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Free,
    Basic,
    Premium,
}

/// The (resource-kind, tier) → ttl table the orchestrator consults per
/// §4.4. A caller-supplied explicit ttl always overrides this table.
#[derive(Debug, Clone)]
pub struct TtlTable {
    entries: HashMap<(String, Tier), Duration>,
    default_ttl: Duration,
}

impl TtlTable {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            default_ttl,
        }
    }

    pub fn with_entry(mut self, kind: impl Into<String>, tier: Tier, ttl: Duration) -> Self {
        self.entries.insert((kind.into(), tier), ttl);
        self
    }

    pub fn ttl_for(&self, kind: &str, tier: Tier) -> Duration {
        self.entries
            .get(&(kind.to_string(), tier))
            .copied()
            .unwrap_or(self.default_ttl)
    }
}

/// The byte-level contract consumed by the orchestrator (§6). One store
/// implementation serves every payload type `T`; [`CacheFacade`] layers
/// typed helpers on top via `serde_json`.
///
/// Implementations must swallow their own transport errors into `None`/no-op
/// — a cache failure must never abort an orchestrated fetch.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Option<Vec<u8>>;
    async fn get_allow_expired(&self, key: &str) -> Option<Vec<u8>>;
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration);
    async fn get_age(&self, key: &str) -> Option<Duration>;
    async fn clear(&self);
}

struct CacheEntry {
    data: Vec<u8>,
    written_at: Instant,
    expires_at: Instant,
}

impl CacheEntry {
    fn is_fresh(&self) -> bool {
        Instant::now() < self.expires_at
    }

    fn is_within_stale_retention(&self, stale_retention: Duration) -> bool {
        Instant::now() < self.expires_at + stale_retention
    }
}

/// Default in-memory store. Logically-expired entries are retained until a
/// background sweep removes anything past `expiry + stale_retention`, which
/// is how "expired but not yet physically evicted" is represented without a
/// second store.
pub struct InMemoryCacheStore {
    entries: Arc<DashMap<String, CacheEntry>>,
    max_entries: usize,
    stale_retention: Duration,
    hits: Arc<AtomicU64>,
    misses: Arc<AtomicU64>,
}

impl InMemoryCacheStore {
    pub fn new(max_entries: usize, stale_retention: Duration) -> Self {
        let entries: Arc<DashMap<String, CacheEntry>> = Arc::new(DashMap::new());
        let sweep_entries = entries.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                interval.tick().await;
                sweep_entries.retain(|_, entry| entry.is_within_stale_retention(stale_retention));
            }
        });
        Self {
            entries,
            max_entries,
            stale_retention,
            hits: Arc::new(AtomicU64::new(0)),
            misses: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn stats(&self) -> (u64, u64, usize) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
            self.entries.len(),
        )
    }

    fn evict_for_capacity(&self) {
        if self.entries.len() < self.max_entries {
            return;
        }
        let to_remove = (self.max_entries / 10).max(1);
        let mut removed = 0;
        let keys: Vec<String> = self
            .entries
            .iter()
            .take(to_remove)
            .map(|e| e.key().clone())
            .collect();
        for key in keys {
            self.entries.remove(&key);
            removed += 1;
            if removed >= to_remove {
                break;
            }
        }
    }
}

impl Default for InMemoryCacheStore {
    fn default() -> Self {
        Self::new(100_000, Duration::from_secs(24 * 60 * 60))
    }
}

#[async_trait]
impl CacheStore for InMemoryCacheStore {
    async fn get(&self, key: &str) -> Option<Vec<u8>> {
        let entry = self.entries.get(key)?;
        if entry.is_fresh() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            Some(entry.data.clone())
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    async fn get_allow_expired(&self, key: &str) -> Option<Vec<u8>> {
        self.entries.get(key).map(|entry| entry.data.clone())
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) {
        self.evict_for_capacity();
        let now = Instant::now();
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                data: value,
                written_at: now,
                expires_at: now + ttl,
            },
        );
    }

    async fn get_age(&self, key: &str) -> Option<Duration> {
        self.entries
            .get(key)
            .map(|entry| Instant::now().saturating_duration_since(entry.written_at))
    }

    async fn clear(&self) {
        self.entries.clear();
    }
}

/// Wraps a [`CacheStore`] with typed get/set and the TTL table, swallowing
/// (de)serialization failures as a miss.
pub struct CacheFacade {
    store: Arc<dyn CacheStore>,
    ttl_table: TtlTable,
}

impl CacheFacade {
    pub fn new(store: Arc<dyn CacheStore>, ttl_table: TtlTable) -> Self {
        Self { store, ttl_table }
    }

    pub fn ttl_for(&self, kind: &str, tier: Tier) -> Duration {
        self.ttl_table.ttl_for(kind, tier)
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<(T, Duration)> {
        let age = self.store.get_age(key).await?;
        let bytes = self.store.get(key).await?;
        serde_json::from_slice(&bytes).ok().map(|value| (value, age))
    }

    pub async fn get_allow_expired<T: DeserializeOwned>(&self, key: &str) -> Option<(T, Duration)> {
        let age = self.store.get_age(key).await?;
        let bytes = self.store.get_allow_expired(key).await?;
        serde_json::from_slice(&bytes).ok().map(|value| (value, age))
    }

    pub async fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) {
        if let Ok(bytes) = serde_json::to_vec(value) {
            self.store.set(key, bytes, ttl).await;
        }
    }

    pub async fn clear(&self) {
        self.store.clear().await;
    }
}

#[cfg(feature = "redis-cache")]
pub mod redis_store {
    //! Optional Redis-backed [`CacheStore`], adapted from this codebase's
    //! own `middleware/cache.rs` doc comment ("designed for easy migration
    //! to Redis when available"). Redis has no native "expired but not
    //! evicted" read, so `get_allow_expired` is backed by a second,
    //! longer-lived shadow key written alongside the primary on every
    //! `set`, and a companion metadata key carries the write timestamp
    //! `get_age` needs.

    use std::time::Duration;

    use async_trait::async_trait;
    use redis::AsyncCommands;

    use super::CacheStore;
    use crate::error::OrchestratorError;

    pub struct RedisCacheStore {
        client: redis::Client,
        stale_retention: Duration,
    }

    impl RedisCacheStore {
        pub fn new(redis_url: &str, stale_retention: Duration) -> Result<Self, OrchestratorError> {
            let client = redis::Client::open(redis_url)
                .map_err(|e| OrchestratorError::Config(format!("redis client: {e}")))?;
            Ok(Self {
                client,
                stale_retention,
            })
        }

        async fn connection(&self) -> Option<redis::aio::MultiplexedConnection> {
            self.client.get_multiplexed_async_connection().await.ok()
        }

        fn shadow_key(key: &str) -> String {
            format!("{key}:shadow")
        }

        fn meta_key(key: &str) -> String {
            format!("{key}:meta")
        }
    }

    #[async_trait]
    impl CacheStore for RedisCacheStore {
        async fn get(&self, key: &str) -> Option<Vec<u8>> {
            let mut conn = self.connection().await?;
            conn.get::<_, Option<Vec<u8>>>(key).await.ok().flatten()
        }

        async fn get_allow_expired(&self, key: &str) -> Option<Vec<u8>> {
            let mut conn = self.connection().await?;
            conn.get::<_, Option<Vec<u8>>>(Self::shadow_key(key))
                .await
                .ok()
                .flatten()
        }

        async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) {
            let Some(mut conn) = self.connection().await else {
                return;
            };
            let ttl_secs = ttl.as_secs().max(1);
            let shadow_ttl_secs = (ttl + self.stale_retention).as_secs().max(1);
            let written_at = chrono::Utc::now().timestamp_millis();
            let _: redis::RedisResult<()> = redis::pipe()
                .set_ex(key, value.clone(), ttl_secs)
                .set_ex(Self::shadow_key(key), value, shadow_ttl_secs)
                .set_ex(Self::meta_key(key), written_at, shadow_ttl_secs)
                .query_async(&mut conn)
                .await;
        }

        async fn get_age(&self, key: &str) -> Option<Duration> {
            let mut conn = self.connection().await?;
            let written_at: i64 = conn.get(Self::meta_key(key)).await.ok()?;
            let now = chrono::Utc::now().timestamp_millis();
            Some(Duration::from_millis(now.saturating_sub(written_at).max(0) as u64))
        }

        async fn clear(&self) {
            // Deliberately a no-op: a shared Redis instance has no safe
            // "clear just our keys" primitive without a key-pattern scan,
            // and scanning/deleting on every cache clear would be a
            // correctness hazard for a store other callers may share.
        }
    }
}
