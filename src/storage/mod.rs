//! Token storage backends
//!
//! The pool manager depends on one interface: load/save the full token
//! map, a named advisory lock for load-merge-save cycles, and the single
//! backend-specific atomic primitive `atomic_consume` (check, decrement,
//! stamp usage in one linearizable step). Backends differ in how they
//! achieve atomicity — in-process mutex, Lua script, or row-level SQL —
//! but present the exact same contract.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{StorageBackend, StorageSettings};
use crate::services::token_pool::record::now_ms;
use crate::services::token_pool::{TokenRecord, TokenStatus};

pub mod local;
pub mod memory;
#[cfg(feature = "redis")]
pub mod redis_store;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use local::LocalStore;
pub use memory::MemoryStore;
#[cfg(feature = "redis")]
pub use redis_store::RedisStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

/// Token map as persisted: tier name -> records.
pub type TokenMap = HashMap<String, Vec<TokenRecord>>;

/// Storage backend errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("could not acquire lock '{name}' within {timeout:?}")]
    LockTimeout { name: String, timeout: Duration },

    #[error("unknown token '{0}'")]
    UnknownToken(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for StorageError {
    fn from(err: redis::RedisError) -> Self {
        StorageError::Backend(err.to_string())
    }
}

#[cfg(feature = "sqlite")]
impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        StorageError::Backend(err.to_string())
    }
}

/// Result state of an atomic quota consumption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsumeState {
    /// Deducted, quota remains
    Ok,
    /// Deducted down to zero; the record is now cooling
    Cooling,
    /// Current quota is smaller than the requested amount; nothing deducted
    Insufficient,
}

/// Outcome of `TokenStore::atomic_consume`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumeOutcome {
    /// Whether the deduction happened
    pub ok: bool,
    /// Quota after the operation (current quota when `Insufficient`)
    pub new_quota: u64,
    pub state: ConsumeState,
}

/// Scoped advisory lock. Released on drop.
pub struct StoreLock {
    _inner: Box<dyn std::any::Any + Send>,
}

impl StoreLock {
    pub(crate) fn new(inner: impl std::any::Any + Send) -> Self {
        Self {
            _inner: Box::new(inner),
        }
    }
}

impl std::fmt::Debug for StoreLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreLock").finish_non_exhaustive()
    }
}

/// Storage contract consumed by the pool manager.
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Load the full token map.
    async fn load_tokens(&self) -> Result<TokenMap, StorageError>;

    /// Persist the full token map, replacing previous contents.
    async fn save_tokens(&self, pools: &TokenMap) -> Result<(), StorageError>;

    /// Acquire the named advisory lock guarding load-merge-save cycles.
    async fn acquire_lock(&self, name: &str, timeout: Duration)
        -> Result<StoreLock, StorageError>;

    /// Atomically deduct `amount` from the token's quota.
    ///
    /// A single linearizable check-decrement-stamp: on success the stored
    /// record's `use_count` and `last_used_at` are updated and the status
    /// flips to cooling when quota reaches zero. Never a read-then-write.
    async fn atomic_consume(
        &self,
        token_id: &str,
        amount: u64,
    ) -> Result<ConsumeOutcome, StorageError>;
}

/// Apply the consume contract to a record held under an exclusive lock.
///
/// This is the reference semantics the scripted backends mirror.
pub(crate) fn apply_consume(record: &mut TokenRecord, amount: u64) -> ConsumeOutcome {
    if record.quota < amount {
        return ConsumeOutcome {
            ok: false,
            new_quota: record.quota,
            state: ConsumeState::Insufficient,
        };
    }

    record.quota -= amount;
    record.use_count += amount;
    record.last_used_at = Some(now_ms());

    if record.quota == 0 {
        // Disabled/Expired take precedence over cooling
        if matches!(record.status, TokenStatus::Active | TokenStatus::Cooling) {
            record.status = TokenStatus::Cooling;
        }
        ConsumeOutcome {
            ok: true,
            new_quota: 0,
            state: ConsumeState::Cooling,
        }
    } else {
        ConsumeOutcome {
            ok: true,
            new_quota: record.quota,
            state: ConsumeState::Ok,
        }
    }
}

/// Build the configured storage backend.
pub async fn build_store(settings: &StorageSettings) -> Result<Arc<dyn TokenStore>, StorageError> {
    match settings.backend {
        StorageBackend::Memory => Ok(Arc::new(MemoryStore::new())),
        StorageBackend::Local => Ok(Arc::new(LocalStore::new(settings.path.clone()))),
        StorageBackend::Redis => {
            #[cfg(feature = "redis")]
            {
                let url = settings
                    .url
                    .as_deref()
                    .ok_or_else(|| StorageError::Backend("redis backend needs a URL".into()))?;
                Ok(Arc::new(RedisStore::connect(url).await?))
            }
            #[cfg(not(feature = "redis"))]
            {
                Err(StorageError::Backend(
                    "redis backend requires the 'redis-store' feature".into(),
                ))
            }
        }
        StorageBackend::Sqlite => {
            #[cfg(feature = "sqlite")]
            {
                let url = settings
                    .url
                    .as_deref()
                    .ok_or_else(|| StorageError::Backend("sqlite backend needs a URL".into()))?;
                Ok(Arc::new(SqliteStore::connect(url).await?))
            }
            #[cfg(not(feature = "sqlite"))]
            {
                Err(StorageError::Backend(
                    "sqlite backend requires the 'sqlite' feature".into(),
                ))
            }
        }
    }
}
