//! The provider contract consumed by the orchestrator.
//!
//! Concrete providers (stock-quote APIs, RSS scrapers, regulatory filing
//! feeds) are out of scope here — this module only fixes the shape every
//! provider must satisfy.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::FetchError;

/// A named adapter over one external data source, generic over its payload
/// type `T`.
///
/// Object-safe (`async-trait`-boxed) so an orchestrator call can be handed
/// `&[Arc<dyn Provider<T>>]` for a fallback chain or merge set.
#[async_trait]
pub trait Provider<T>: Send + Sync
where
    T: Send + Sync + 'static,
{
    /// Stable name. The circuit breaker and telemetry counters are
    /// registered under this name.
    fn name(&self) -> &str;

    /// Fetch a single key.
    async fn fetch(&self, key: &str) -> Result<T, FetchError>;

    /// Advertised maximum batch size, if this provider supports batching.
    /// `None` means it does not support [`Provider::batch_fetch`].
    fn max_batch_size(&self) -> Option<usize> {
        None
    }

    /// Fetch many keys in one call. The default implementation reports
    /// batching as unsupported; providers that can batch must override both
    /// this and [`Provider::max_batch_size`].
    async fn batch_fetch(&self, keys: &[String]) -> Result<HashMap<String, T>, FetchError> {
        let _ = keys;
        Err(FetchError::new(format!(
            "provider '{}' does not support batch fetch",
            self.name()
        )))
    }

    /// Optional liveness probe. `None` means the provider does not support
    /// health checks rather than that the check failed.
    async fn health_check(&self) -> Option<bool> {
        None
    }
}
