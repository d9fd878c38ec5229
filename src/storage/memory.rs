//! In-process storage backend
//!
//! Keeps the token map behind a tokio mutex; atomicity of quota
//! consumption falls out of exclusive access to the data. State is lost
//! on restart, which makes this the backend of choice for tests and
//! throwaway deployments.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::services::token_pool::TokenRecord;

use super::{apply_consume, ConsumeOutcome, StorageError, StoreLock, TokenMap, TokenStore};

#[derive(Default)]
pub struct MemoryStore {
    data: Mutex<TokenMap>,
    // Named advisory locks, separate from the data mutex so a held
    // advisory lock does not block reads and atomic consumes.
    advisory: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn advisory_handle(&self, name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.advisory.lock().await;
        locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn find_record<'a>(
        data: &'a mut TokenMap,
        token_id: &str,
    ) -> Option<&'a mut TokenRecord> {
        data.values_mut()
            .flat_map(|records| records.iter_mut())
            .find(|r| r.token == token_id)
    }
}

#[async_trait]
impl TokenStore for MemoryStore {
    async fn load_tokens(&self) -> Result<TokenMap, StorageError> {
        Ok(self.data.lock().await.clone())
    }

    async fn save_tokens(&self, pools: &TokenMap) -> Result<(), StorageError> {
        *self.data.lock().await = pools.clone();
        Ok(())
    }

    async fn acquire_lock(
        &self,
        name: &str,
        timeout: Duration,
    ) -> Result<StoreLock, StorageError> {
        let handle = self.advisory_handle(name).await;
        let guard = tokio::time::timeout(timeout, handle.lock_owned())
            .await
            .map_err(|_| StorageError::LockTimeout {
                name: name.to_string(),
                timeout,
            })?;
        Ok(StoreLock::new(guard))
    }

    async fn atomic_consume(
        &self,
        token_id: &str,
        amount: u64,
    ) -> Result<ConsumeOutcome, StorageError> {
        let mut data = self.data.lock().await;
        let record = Self::find_record(&mut data, token_id)
            .ok_or_else(|| StorageError::UnknownToken(token_id.to_string()))?;
        Ok(apply_consume(record, amount))
    }
}
