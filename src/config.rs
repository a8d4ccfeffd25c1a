//! Process-level configuration for the data source orchestrator.
//!
//! This covers the ambient knobs of the process (timeouts, ring capacity,
//! optional sink endpoints) loaded from the environment. It is distinct from
//! the per-provider circuit breaker table and the (resource-kind, tier) TTL
//! table in [`crate::orchestrator::OrchestratorConfig`], which are supplied
//! by the embedding application at construction rather than read from the
//! environment — those are the configuration *surface*, not process config.

use std::env;
use std::time::Duration;

/// Process-wide defaults loaded once at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Default per-attempt timeout for a provider call.
    pub default_provider_timeout: Duration,
    /// Default cache TTL used when no (resource-kind, tier) entry matches.
    pub default_cache_ttl: Duration,
    /// Capacity of the telemetry sink's ring buffer.
    pub telemetry_ring_capacity: usize,
    #[cfg(feature = "kafka-telemetry")]
    pub kafka_bootstrap_servers: Option<String>,
    #[cfg(feature = "kafka-telemetry")]
    pub kafka_telemetry_topic: String,
}

impl Settings {
    /// Load settings from the environment, falling back to built-in
    /// defaults for anything absent. `.env` is loaded first if present.
    pub fn from_env() -> Result<Self, SettingsError> {
        dotenvy::dotenv().ok();

        Ok(Self {
            default_provider_timeout: Duration::from_millis(parse_env_or(
                "PROVIDER_TIMEOUT_MS",
                10_000,
            )?),
            default_cache_ttl: Duration::from_millis(parse_env_or(
                "DEFAULT_CACHE_TTL_MS",
                60_000,
            )?),
            telemetry_ring_capacity: parse_env_or("TELEMETRY_RING_CAPACITY", 1000)?,
            #[cfg(feature = "kafka-telemetry")]
            kafka_bootstrap_servers: env::var("KAFKA_BOOTSTRAP_SERVERS").ok(),
            #[cfg(feature = "kafka-telemetry")]
            kafka_telemetry_topic: env::var("KAFKA_TELEMETRY_TOPIC")
                .unwrap_or_else(|_| "orchestrator.telemetry".to_string()),
        })
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            default_provider_timeout: Duration::from_millis(10_000),
            default_cache_ttl: Duration::from_millis(60_000),
            telemetry_ring_capacity: 1000,
            #[cfg(feature = "kafka-telemetry")]
            kafka_bootstrap_servers: None,
            #[cfg(feature = "kafka-telemetry")]
            kafka_telemetry_topic: "orchestrator.telemetry".to_string(),
        }
    }
}

fn parse_env_or<T: std::str::FromStr>(name: &str, default: T) -> Result<T, SettingsError> {
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| SettingsError::InvalidValue(name.to_string())),
        Err(_) => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("invalid value for environment variable: {0}")]
    InvalidValue(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let settings = Settings::default();
        assert_eq!(settings.default_provider_timeout, Duration::from_millis(10_000));
        assert_eq!(settings.telemetry_ring_capacity, 1000);
    }
}
