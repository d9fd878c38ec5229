//! Pool error taxonomy
//!
//! Four failure classes with very different consequences:
//! - `Exhausted` is an expected, caller-retryable condition.
//! - `Persistence` must propagate; swallowing it risks double-spending
//!   quota after the next reload.
//! - `UpstreamSync` is infrastructure noise and never counts against a
//!   credential's health.
//! - `Upstream` carries a classified status code; 401/403 is the only
//!   signal that feeds `TokenRecord::record_fail`.

use std::collections::HashMap;

use thiserror::Error;

use crate::storage::StorageError;

/// A classified error from the upstream service.
///
/// Produced wherever an upstream HTTP response is turned into an error,
/// so the retry engine can reason about status codes and wait hints
/// without re-parsing responses.
#[derive(Debug, Clone, Error)]
#[error("upstream error {status}: {message}")]
pub struct UpstreamError {
    /// HTTP status code returned by the upstream
    pub status: u16,
    /// Human-readable message (response excerpt)
    pub message: String,
    /// Explicit wait hint in seconds, if the upstream supplied one
    pub retry_after: Option<f64>,
    /// Selected response headers, lowercase keys
    pub headers: HashMap<String, String>,
}

impl UpstreamError {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            retry_after: None,
            headers: HashMap::new(),
        }
    }

    pub fn with_retry_after(mut self, secs: f64) -> Self {
        self.retry_after = Some(secs);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into().to_lowercase(), value.into());
        self
    }

    /// True for authentication/authorization rejections, the only class of
    /// failure that is evidence against the credential itself.
    pub fn is_auth_rejection(&self) -> bool {
        matches!(self.status, 401 | 403)
    }
}

/// Errors surfaced by the token pool manager.
#[derive(Debug, Error)]
pub enum PoolError {
    /// No available token in the requested tier. Expected under load;
    /// callers typically map this to a 429.
    #[error("no available token in tier '{0}'")]
    Exhausted(String),

    /// The token is not present in any pool.
    #[error("unknown token")]
    UnknownToken,

    /// A durable write failed; the in-memory state may be ahead of storage.
    #[error("persistence failure: {0}")]
    Persistence(#[from] StorageError),

    /// Quota resync against the upstream authority failed. Never increments
    /// a credential's fail count.
    #[error("quota sync failed: {0}")]
    UpstreamSync(String),

    /// A classified upstream failure from an actual request.
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
}

/// Access to retry-relevant classification.
///
/// Errors that are not classified upstream failures report no status, which
/// makes them immediately fatal to the retry driver.
pub trait ClassifiedError {
    fn status(&self) -> Option<u16>;

    fn retry_after_hint(&self) -> Option<f64> {
        None
    }
}

impl ClassifiedError for UpstreamError {
    fn status(&self) -> Option<u16> {
        Some(self.status)
    }

    fn retry_after_hint(&self) -> Option<f64> {
        if let Some(secs) = self.retry_after {
            return Some(secs);
        }
        self.headers
            .get("retry-after")
            .and_then(|v| v.trim().parse::<f64>().ok())
            .filter(|v| *v >= 0.0)
    }
}

impl ClassifiedError for PoolError {
    fn status(&self) -> Option<u16> {
        match self {
            PoolError::Upstream(e) => e.status(),
            _ => None,
        }
    }

    fn retry_after_hint(&self) -> Option<f64> {
        match self {
            PoolError::Upstream(e) => e.retry_after_hint(),
            _ => None,
        }
    }
}
