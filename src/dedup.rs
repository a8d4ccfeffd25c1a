//! Request deduplication (singleflight) registry.
//!
//! One process-wide registry backs every fallback/merge/batch call
//! regardless of payload type, so its map stores a type-erased, clonable
//! future per key and downcasts on the way out — the type-erasure move
//! Design Note 9 in the specification calls for. Leader/follower roles are
//! decided under `DashMap`'s per-shard lock (the "install-or-find must be
//! atomic" requirement); both roles then simply await their future clone
//! outside that lock.

use std::any::Any;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};

use crate::error::OrchestratorError;

/// Entries older than this are treated as stale and replaced by a fresh
/// in-flight fetch rather than being awaited.
pub const MAX_ENTRY_AGE: Duration = Duration::from_secs(30);
/// Cadence of the background scavenger that prunes stale entries.
pub const SCAVENGE_INTERVAL: Duration = Duration::from_secs(5 * 60);

type TypeErasedResult = Result<Arc<dyn Any + Send + Sync>, Arc<OrchestratorError>>;
type TypeErasedFuture = Shared<BoxFuture<'static, TypeErasedResult>>;

struct DedupEntry {
    shared: TypeErasedFuture,
    created_at: Instant,
}

#[derive(Debug, Clone, Copy)]
pub struct DedupStats {
    pub pending: usize,
    pub oldest_age: Duration,
}

/// Collapses concurrent callers requesting the same key into one in-flight
/// fetch.
pub struct DeduplicationRegistry {
    entries: Arc<DashMap<String, Arc<DedupEntry>>>,
    scavenger: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl DeduplicationRegistry {
    pub fn new() -> Self {
        let entries: Arc<DashMap<String, Arc<DedupEntry>>> = Arc::new(DashMap::new());
        let scavenger_entries = entries.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(SCAVENGE_INTERVAL);
            loop {
                interval.tick().await;
                scavenger_entries.retain(|_, entry| entry.created_at.elapsed() < MAX_ENTRY_AGE);
            }
        });
        Self {
            entries,
            scavenger: Mutex::new(Some(handle)),
        }
    }

    /// Runs `fetch_fn` behind a singleflight gate keyed by `key`.
    ///
    /// Returns `(value, was_deduplicated)`. The leader (the caller that
    /// actually drives `fetch_fn`) gets `was_deduplicated=false`; every
    /// follower sharing that in-flight fetch gets `true`.
    pub async fn deduplicate<T, F, Fut>(
        &self,
        key: &str,
        fetch_fn: F,
    ) -> Result<(T, bool), OrchestratorError>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, OrchestratorError>> + Send + 'static,
    {
        enum Role {
            Leader(TypeErasedFuture),
            Follower(TypeErasedFuture),
        }

        let role = match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let existing = occupied.get().clone();
                if existing.created_at.elapsed() < MAX_ENTRY_AGE {
                    Role::Follower(existing.shared.clone())
                } else {
                    let shared = Self::leader_future(fetch_fn);
                    occupied.insert(Arc::new(DedupEntry {
                        shared: shared.clone(),
                        created_at: Instant::now(),
                    }));
                    Role::Leader(shared)
                }
            }
            Entry::Vacant(vacant) => {
                let shared = Self::leader_future(fetch_fn);
                vacant.insert(Arc::new(DedupEntry {
                    shared: shared.clone(),
                    created_at: Instant::now(),
                }));
                Role::Leader(shared)
            }
        };

        match role {
            Role::Follower(shared) => match shared.await {
                Ok(value) => Ok((downcast::<T>(value), true)),
                Err(err) => Err((*err).clone()),
            },
            Role::Leader(shared) => {
                let result = shared.await;
                self.entries.remove(key);
                match result {
                    Ok(value) => Ok((downcast::<T>(value), false)),
                    Err(err) => Err((*err).clone()),
                }
            }
        }
    }

    fn leader_future<T, F, Fut>(fetch_fn: F) -> TypeErasedFuture
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, OrchestratorError>> + Send + 'static,
    {
        let fut = fetch_fn();
        let erased: BoxFuture<'static, TypeErasedResult> = Box::pin(async move {
            match fut.await {
                Ok(value) => Ok(Arc::new(value) as Arc<dyn Any + Send + Sync>),
                Err(err) => Err(Arc::new(err)),
            }
        });
        erased.shared()
    }

    pub fn stats(&self) -> DedupStats {
        let now = Instant::now();
        let mut pending = 0usize;
        let mut oldest = Duration::ZERO;
        for entry in self.entries.iter() {
            pending += 1;
            let age = now.duration_since(entry.created_at);
            if age > oldest {
                oldest = age;
            }
        }
        DedupStats {
            pending,
            oldest_age: oldest,
        }
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Stops the background scavenger. Intended for tests that want
    /// deterministic control over cleanup rather than waiting on the
    /// 5-minute cadence.
    pub fn stop_cleanup(&self) {
        if let Some(handle) = self.scavenger.lock().expect("scavenger mutex poisoned").take() {
            handle.abort();
        }
    }
}

impl Default for DeduplicationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DeduplicationRegistry {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.scavenger.lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }
}

fn downcast<T: Clone + 'static>(value: Arc<dyn Any + Send + Sync>) -> T {
    value
        .downcast_ref::<T>()
        .expect("dedup registry type mismatch for key: same key reused across different payload types")
        .clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn concurrent_callers_share_a_single_invocation() {
        let registry = Arc::new(DeduplicationRegistry::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let registry = registry.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                registry
                    .deduplicate("quotes:AAPL", move || {
                        let calls = calls.clone();
                        async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            Ok::<_, OrchestratorError>(42u32)
                        }
                    })
                    .await
                    .unwrap()
            }));
        }

        let mut dedup_flags = Vec::new();
        for handle in handles {
            let (value, deduplicated) = handle.await.unwrap();
            assert_eq!(value, 42);
            dedup_flags.push(deduplicated);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(dedup_flags.iter().filter(|d| **d).count(), 4);
    }

    #[tokio::test]
    async fn entry_is_removed_after_settling() {
        let registry = DeduplicationRegistry::new();
        let (_value, deduplicated) = registry
            .deduplicate("k", || async { Ok::<_, OrchestratorError>(1u32) })
            .await
            .unwrap();
        assert!(!deduplicated);
        assert_eq!(registry.stats().pending, 0);
    }

    #[tokio::test]
    async fn errors_propagate_to_followers() {
        let registry = Arc::new(DeduplicationRegistry::new());
        let a = registry.clone();
        let b = registry.clone();

        let fut_a = a.deduplicate("k", || async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Err::<u32, _>(OrchestratorError::Config("boom".to_string()))
        });
        tokio::time::sleep(Duration::from_millis(1)).await;
        let fut_b = b.deduplicate("k", || async { Ok::<_, OrchestratorError>(7u32) });

        let (r_a, r_b) = tokio::join!(fut_a, fut_b);
        assert!(r_a.is_err());
        assert!(r_b.is_err());
    }
}
