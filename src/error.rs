//! Error taxonomy for the data source orchestrator.
//!
//! Two error families live side by side and are never confused with one
//! another: [`OrchestratorError`] covers construction/configuration mistakes
//! (an unknown provider name, a malformed [`crate::config::Settings`]), while
//! [`FetchError`]/[`ProviderError`] cover a single provider call going wrong
//! and are recorded into a result envelope rather than propagated as a Rust
//! `Err`.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Closed set of error codes a provider failure is classified into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Timeout,
    RateLimit,
    Authentication,
    NotFound,
    NetworkError,
    InvalidResponse,
    CircuitOpen,
    Unknown,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::RateLimit => "RATE_LIMIT",
            ErrorCode::Authentication => "AUTHENTICATION",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::NetworkError => "NETWORK_ERROR",
            ErrorCode::InvalidResponse => "INVALID_RESPONSE",
            ErrorCode::CircuitOpen => "CIRCUIT_OPEN",
            ErrorCode::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

/// Maps a lowercased error message to an [`ErrorCode`] by substring match.
///
/// Last-resort fallback only — providers that can tag their own failures
/// with a code should do so; this exists for providers that just raise.
pub fn classify_error(message: &str) -> ErrorCode {
    let lower = message.to_lowercase();
    if lower.contains("timeout") {
        ErrorCode::Timeout
    } else if lower.contains("rate limit") || lower.contains("429") {
        ErrorCode::RateLimit
    } else if lower.contains("auth") || lower.contains("401") || lower.contains("403") {
        ErrorCode::Authentication
    } else if lower.contains("not found") || lower.contains("404") {
        ErrorCode::NotFound
    } else if lower.contains("network") || lower.contains("fetch") {
        ErrorCode::NetworkError
    } else {
        ErrorCode::Unknown
    }
}

/// An error a [`crate::provider::Provider`] implementation returns from a
/// single `fetch`/`batch_fetch` attempt.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct FetchError {
    pub code: Option<ErrorCode>,
    pub message: String,
}

impl FetchError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }

    pub fn with_code(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            message: message.into(),
        }
    }

    /// The code this error should be recorded under: the provider's own tag
    /// if it supplied one, otherwise the substring-classification fallback.
    pub fn resolve_code(&self) -> ErrorCode {
        self.code.unwrap_or_else(|| classify_error(&self.message))
    }
}

/// A single failed attempt as recorded on a result envelope.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderError {
    pub provider: String,
    pub code: ErrorCode,
    pub message: String,
}

impl ProviderError {
    pub fn new(provider: impl Into<String>, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            code,
            message: message.into(),
        }
    }

    /// The synthetic error appended when a breaker refuses execution. Does
    /// not count against the provider's own failure counter — the provider
    /// was never called.
    pub fn circuit_open(provider: impl Into<String>) -> Self {
        Self::new(provider, ErrorCode::CircuitOpen, "circuit breaker is open")
    }

    pub fn timeout(provider: impl Into<String>, after: std::time::Duration) -> Self {
        Self::new(
            provider,
            ErrorCode::Timeout,
            format!("timed out after {:?}", after),
        )
    }

    pub fn from_fetch_error(provider: impl Into<String>, err: FetchError) -> Self {
        let code = err.resolve_code();
        Self::new(provider, code, err.message)
    }
}

/// Construction and configuration failures — never placed in an envelope's
/// error list.
#[derive(Debug, Clone, thiserror::Error)]
pub enum OrchestratorError {
    #[error("unknown provider: {0}")]
    UnknownProvider(String),
    #[error("configuration error: {0}")]
    Config(String),
}
