//! Local JSON file storage backend
//!
//! The default backend: one JSON document holding the full token map.
//! Writes go through a temp file and rename so a crash never leaves a
//! half-written document. All file access is serialized through one
//! mutex, which is what makes `atomic_consume` atomic here.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::services::token_pool::TokenRecord;

use super::{apply_consume, ConsumeOutcome, StorageError, StoreLock, TokenMap, TokenStore};

pub struct LocalStore {
    path: PathBuf,
    io: Mutex<()>,
    advisory: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl LocalStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            io: Mutex::new(()),
            advisory: Mutex::new(HashMap::new()),
        }
    }

    async fn read_map(&self) -> Result<TokenMap, StorageError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(TokenMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_map(&self, map: &TokenMap) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let bytes = serde_json::to_vec_pretty(map)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    async fn advisory_handle(&self, name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.advisory.lock().await;
        locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

#[async_trait]
impl TokenStore for LocalStore {
    async fn load_tokens(&self) -> Result<TokenMap, StorageError> {
        let _io = self.io.lock().await;
        self.read_map().await
    }

    async fn save_tokens(&self, pools: &TokenMap) -> Result<(), StorageError> {
        let _io = self.io.lock().await;
        self.write_map(pools).await
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
        let _io = self.io.lock().await;
        let mut map = self.read_map().await?;

        let record: &mut TokenRecord = map
            .values_mut()
            .flat_map(|records| records.iter_mut())
            .find(|r| r.token == token_id)
            .ok_or_else(|| StorageError::UnknownToken(token_id.to_string()))?;

        let outcome = apply_consume(record, amount);
        if outcome.ok {
            self.write_map(&map).await?;
        }
        Ok(outcome)
    }
}
