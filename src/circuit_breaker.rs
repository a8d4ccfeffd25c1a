//! Per-provider circuit breaker and registry.
//!
//! Adapted from this codebase's own `middleware/circuit_breaker.rs`: a
//! `DashMap`-backed registry keyed by provider name, lazily creating one
//! breaker per name. The per-breaker bookkeeping moves from independent
//! atomics to a single `Mutex<Inner>` so that a transition (e.g. half-open's
//! probe-count check-and-increment) is one critical section instead of
//! several atomics that could interleave into an invalid combination.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::error::OrchestratorError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
    pub half_open_max_requests: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            half_open_max_requests: 1,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct CircuitBreakerStats {
    pub provider: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u64,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub half_open_probes: u32,
}

struct Inner {
    state: CircuitState,
    failure_count: u32,
    success_count: u64,
    last_failure_at: Option<DateTime<Utc>>,
    last_success_at: Option<DateTime<Utc>>,
    next_retry_at_monotonic: Option<Instant>,
    next_retry_at: Option<DateTime<Utc>>,
    half_open_probes: u32,
}

impl Inner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_at: None,
            last_success_at: None,
            next_retry_at_monotonic: None,
            next_retry_at: None,
            half_open_probes: 0,
        }
    }
}

/// A single provider's breaker. Cheaply clonable via `Arc` from the
/// registry; every mutating operation takes the same internal lock.
pub struct CircuitBreaker {
    provider: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    fn new(provider: String, config: CircuitBreakerConfig) -> Self {
        Self {
            provider,
            config,
            inner: Mutex::new(Inner::new()),
        }
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Whether a call may proceed right now, possibly advancing the state
    /// machine (open → half-open) as a side effect.
    pub fn can_execute(&self) -> bool {
        let mut inner = self.inner.lock().expect("circuit breaker mutex poisoned");
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let past_retry = inner
                    .next_retry_at_monotonic
                    .map(|retry_at| Instant::now() >= retry_at)
                    .unwrap_or(true);
                if !past_retry {
                    return false;
                }
                inner.state = CircuitState::HalfOpen;
                inner.half_open_probes = 0;
                if self.config.half_open_max_requests == 0 {
                    false
                } else {
                    inner.half_open_probes = 1;
                    true
                }
            }
            CircuitState::HalfOpen => {
                if inner.half_open_probes < self.config.half_open_max_requests {
                    inner.half_open_probes += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("circuit breaker mutex poisoned");
        inner.success_count += 1;
        inner.last_success_at = Some(Utc::now());
        match inner.state {
            CircuitState::Closed => inner.failure_count = 0,
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Closed;
                inner.failure_count = 0;
                inner.half_open_probes = 0;
                inner.next_retry_at_monotonic = None;
                inner.next_retry_at = None;
                tracing::info!(provider = %self.provider, "circuit breaker closed after recovery probe");
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("circuit breaker mutex poisoned");
        inner.failure_count += 1;
        inner.last_failure_at = Some(Utc::now());
        match inner.state {
            CircuitState::Closed => {
                if inner.failure_count >= self.config.failure_threshold {
                    self.open(&mut inner);
                }
            }
            CircuitState::HalfOpen => self.open(&mut inner),
            CircuitState::Open => {}
        }
    }

    fn open(&self, inner: &mut Inner) {
        inner.state = CircuitState::Open;
        inner.next_retry_at_monotonic = Some(Instant::now() + self.config.reset_timeout);
        inner.next_retry_at = Some(
            Utc::now()
                + chrono::Duration::from_std(self.config.reset_timeout).unwrap_or_default(),
        );
        inner.half_open_probes = 0;
        tracing::warn!(provider = %self.provider, failures = inner.failure_count, "circuit breaker opened");
    }

    /// Administrative: force the breaker back to closed.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().expect("circuit breaker mutex poisoned");
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.half_open_probes = 0;
        inner.next_retry_at_monotonic = None;
        inner.next_retry_at = None;
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let inner = self.inner.lock().expect("circuit breaker mutex poisoned");
        CircuitBreakerStats {
            provider: self.provider.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            last_failure_at: inner.last_failure_at,
            last_success_at: inner.last_success_at,
            next_retry_at: inner.next_retry_at,
            half_open_probes: inner.half_open_probes,
        }
    }
}

/// One breaker per provider name, created lazily against a static
/// configuration table supplied at construction.
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    configs: HashMap<String, CircuitBreakerConfig>,
}

impl CircuitBreakerRegistry {
    pub fn new(configs: HashMap<String, CircuitBreakerConfig>) -> Self {
        Self {
            breakers: DashMap::new(),
            configs,
        }
    }

    /// Returns the breaker for `provider`, creating it on first use.
    /// Fails if `provider` has no entry in the configuration table.
    pub fn breaker(&self, provider: &str) -> Result<Arc<CircuitBreaker>, OrchestratorError> {
        if let Some(existing) = self.breakers.get(provider) {
            return Ok(existing.clone());
        }
        let config = self
            .configs
            .get(provider)
            .copied()
            .ok_or_else(|| OrchestratorError::UnknownProvider(provider.to_string()))?;
        let breaker = Arc::new(CircuitBreaker::new(provider.to_string(), config));
        self.breakers
            .insert(provider.to_string(), breaker.clone());
        Ok(breaker)
    }

    pub fn for_each<F: FnMut(&str, &CircuitBreaker)>(&self, mut f: F) {
        for entry in self.breakers.iter() {
            f(entry.key(), entry.value());
        }
    }

    pub fn get_all_stats(&self) -> HashMap<String, CircuitBreakerStats> {
        self.breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().stats()))
            .collect()
    }

    pub fn reset_all(&self) {
        self.for_each(|_, breaker| breaker.reset());
    }

    pub fn clear_all(&self) {
        self.breakers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with(name: &str, config: CircuitBreakerConfig) -> CircuitBreakerRegistry {
        let mut configs = HashMap::new();
        configs.insert(name.to_string(), config);
        CircuitBreakerRegistry::new(configs)
    }

    #[test]
    fn unknown_provider_is_a_configuration_error() {
        let registry = registry_with("p1", CircuitBreakerConfig::default());
        assert!(matches!(
            registry.breaker("p2"),
            Err(OrchestratorError::UnknownProvider(_))
        ));
    }

    #[test]
    fn opens_after_consecutive_failures_and_blocks_until_reset() {
        let config = CircuitBreakerConfig {
            failure_threshold: 3,
            reset_timeout: Duration::from_millis(50),
            half_open_max_requests: 1,
        };
        let registry = registry_with("p1", config);
        let breaker = registry.breaker("p1").unwrap();

        for _ in 0..3 {
            assert!(breaker.can_execute());
            breaker.record_failure();
        }

        assert_eq!(breaker.stats().state, CircuitState::Open);
        assert!(!breaker.can_execute());
    }

    #[test]
    fn half_open_closes_on_first_success() {
        let config = CircuitBreakerConfig {
            failure_threshold: 1,
            reset_timeout: Duration::from_millis(10),
            half_open_max_requests: 2,
        };
        let registry = registry_with("p1", config);
        let breaker = registry.breaker("p1").unwrap();

        breaker.record_failure();
        assert_eq!(breaker.stats().state, CircuitState::Open);

        std::thread::sleep(Duration::from_millis(20));
        assert!(breaker.can_execute());
        assert_eq!(breaker.stats().state, CircuitState::HalfOpen);

        breaker.record_success();
        let stats = breaker.stats();
        assert_eq!(stats.state, CircuitState::Closed);
        assert_eq!(stats.failure_count, 0);
    }

    #[test]
    fn half_open_reopens_on_failure() {
        let config = CircuitBreakerConfig {
            failure_threshold: 1,
            reset_timeout: Duration::from_millis(10),
            half_open_max_requests: 1,
        };
        let registry = registry_with("p1", config);
        let breaker = registry.breaker("p1").unwrap();

        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(20));
        assert!(breaker.can_execute());
        breaker.record_failure();
        assert_eq!(breaker.stats().state, CircuitState::Open);
    }

    #[test]
    fn half_open_probe_count_is_bounded() {
        let config = CircuitBreakerConfig {
            failure_threshold: 1,
            reset_timeout: Duration::from_millis(10),
            half_open_max_requests: 2,
        };
        let registry = registry_with("p1", config);
        let breaker = registry.breaker("p1").unwrap();

        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(20));

        assert!(breaker.can_execute());
        assert!(breaker.can_execute());
        assert!(!breaker.can_execute());
    }
}
