//! SQLite storage backend
//!
//! One row per token. Atomicity of quota consumption comes from a
//! conditional `UPDATE ... WHERE quota >= ?`: the database either applies
//! the whole deduction or reports zero affected rows. Advisory locks live
//! in a `locks` table claimed with `INSERT OR IGNORE`.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;

use crate::services::token_pool::record::{now_ms, TokenRecord, TokenStatus};

use super::{ConsumeOutcome, ConsumeState, StorageError, StoreLock, TokenMap, TokenStore};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tokens (
    token TEXT PRIMARY KEY,
    pool TEXT NOT NULL,
    status TEXT NOT NULL,
    quota INTEGER NOT NULL,
    use_count INTEGER NOT NULL,
    fail_count INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    last_used_at INTEGER,
    last_fail_at INTEGER,
    last_sync_at INTEGER,
    last_fail_reason TEXT,
    tags TEXT NOT NULL DEFAULT '[]'
);
CREATE INDEX IF NOT EXISTS idx_tokens_pool ON tokens(pool);
CREATE TABLE IF NOT EXISTS locks (
    name TEXT PRIMARY KEY,
    acquired_at INTEGER NOT NULL
);
"#;

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn connect(url: &str) -> Result<Self, StorageError> {
        // One connection: SQLite serializes writes anyway, and in-memory
        // databases are per-connection.
        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(1)
            .connect(url)
            .await?;
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }

    fn record_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<TokenRecord, StorageError> {
        let status: String = row.try_get("status")?;
        let tags_raw: String = row.try_get("tags")?;
        Ok(TokenRecord {
            token: row.try_get("token")?,
            pool: row.try_get("pool")?,
            status: TokenStatus::parse(&status),
            quota: row.try_get::<i64, _>("quota")?.max(0) as u64,
            use_count: row.try_get::<i64, _>("use_count")?.max(0) as u64,
            fail_count: row.try_get::<i64, _>("fail_count")?.max(0) as u32,
            created_at: row.try_get("created_at")?,
            last_used_at: row.try_get("last_used_at")?,
            last_fail_at: row.try_get("last_fail_at")?,
            last_sync_at: row.try_get("last_sync_at")?,
            last_fail_reason: row.try_get("last_fail_reason")?,
            tags: serde_json::from_str(&tags_raw).unwrap_or_default(),
        })
    }
}

#[async_trait]
impl TokenStore for SqliteStore {
    async fn load_tokens(&self) -> Result<TokenMap, StorageError> {
        let rows = sqlx::query("SELECT * FROM tokens ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?;

        let mut map = TokenMap::new();
        for row in &rows {
            let record = Self::record_from_row(row)?;
            map.entry(record.pool.clone()).or_default().push(record);
        }
        Ok(map)
    }

    async fn save_tokens(&self, pools: &TokenMap) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM tokens").execute(&mut *tx).await?;

        for records in pools.values() {
            for record in records {
                let tags = serde_json::to_string(&record.tags)?;
                sqlx::query(
                    "INSERT INTO tokens \
                     (token, pool, status, quota, use_count, fail_count, created_at, \
                      last_used_at, last_fail_at, last_sync_at, last_fail_reason, tags) \
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(&record.token)
                .bind(&record.pool)
                .bind(record.status.as_str())
                .bind(record.quota as i64)
                .bind(record.use_count as i64)
                .bind(record.fail_count as i64)
                .bind(record.created_at)
                .bind(record.last_used_at)
                .bind(record.last_fail_at)
                .bind(record.last_sync_at)
                .bind(&record.last_fail_reason)
                .bind(tags)
                .execute(&mut *tx)
                .await?;
            }
        }
        tx.commit().await?;
        Ok(())
    }

    async fn acquire_lock(
        &self,
        name: &str,
        timeout: Duration,
    ) -> Result<StoreLock, StorageError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let claimed = sqlx::query(
                "INSERT OR IGNORE INTO locks (name, acquired_at) VALUES (?, ?)",
            )
            .bind(name)
            .bind(now_ms())
            .execute(&self.pool)
            .await?
            .rows_affected();

            if claimed == 1 {
                return Ok(StoreLock::new(SqliteLockGuard {
                    pool: self.pool.clone(),
                    name: name.to_string(),
                }));
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(StorageError::LockTimeout {
                    name: name.to_string(),
                    timeout,
                });
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    async fn atomic_consume(
        &self,
        token_id: &str,
        amount: u64,
    ) -> Result<ConsumeOutcome, StorageError> {
        let now = now_ms();
        // Conditional update: zero affected rows means insufficient quota.
        let affected = sqlx::query(
            "UPDATE tokens SET \
                 quota = quota - ?1, \
                 use_count = use_count + ?1, \
                 last_used_at = ?2, \
                 status = CASE \
                     WHEN quota - ?1 = 0 AND status IN ('active', 'cooling') \
                     THEN 'cooling' ELSE status END \
             WHERE token = ?3 AND quota >= ?1",
        )
        .bind(amount as i64)
        .bind(now)
        .bind(token_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        let row = sqlx::query("SELECT quota FROM tokens WHERE token = ?")
            .bind(token_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::UnknownToken(token_id.to_string()))?;
        let quota = row.try_get::<i64, _>("quota")?.max(0) as u64;

        if affected == 0 {
            return Ok(ConsumeOutcome {
                ok: false,
                new_quota: quota,
                state: ConsumeState::Insufficient,
            });
        }
        Ok(ConsumeOutcome {
            ok: true,
            new_quota: quota,
            state: if quota == 0 {
                ConsumeState::Cooling
            } else {
                ConsumeState::Ok
            },
        })
    }
}

/// Releases the row-based advisory lock when dropped.
struct SqliteLockGuard {
    pool: SqlitePool,
    name: String,
}

impl Drop for SqliteLockGuard {
    fn drop(&mut self) {
        let pool = self.pool.clone();
        let name = self.name.clone();
        tokio::spawn(async move {
            let _ = sqlx::query("DELETE FROM locks WHERE name = ?")
                .bind(name)
                .execute(&pool)
                .await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    async fn store() -> SqliteStore {
        SqliteStore::connect("sqlite::memory:").await.unwrap()
    }

    fn seed(quota: u64) -> TokenMap {
        let mut map = TokenMap::new();
        map.insert(
            "ssoBasic".to_string(),
            vec![TokenRecord::new("token-a", "ssoBasic", quota)],
        );
        map
    }

    #[tokio::test]
    async fn test_round_trip_preserves_records() {
        let store = store().await;
        let mut map = seed(10);
        map.get_mut("ssoBasic").unwrap()[0]
            .tags
            .insert("canary".to_string());
        store.save_tokens(&map).await.unwrap();

        let loaded = store.load_tokens().await.unwrap();
        let record = &loaded.get("ssoBasic").unwrap()[0];
        assert_eq!(record.token, "token-a");
        assert_eq!(record.quota, 10);
        assert!(record.tags.contains("canary"));
    }

    #[tokio::test]
    async fn test_save_is_full_replace() {
        let store = store().await;
        store.save_tokens(&seed(10)).await.unwrap();
        let mut other = TokenMap::new();
        other.insert(
            "ssoSuper".to_string(),
            vec![TokenRecord::new("token-s", "ssoSuper", 400)],
        );
        store.save_tokens(&other).await.unwrap();

        let loaded = store.load_tokens().await.unwrap();
        assert!(loaded.get("ssoBasic").is_none());
        assert_eq!(loaded.get("ssoSuper").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_atomic_consume_success_and_cooling() {
        let store = store().await;
        store.save_tokens(&seed(4)).await.unwrap();

        let first = store.atomic_consume("token-a", 3).await.unwrap();
        assert!(first.ok);
        assert_eq!(first.new_quota, 1);
        assert_eq!(first.state, ConsumeState::Ok);

        let second = store.atomic_consume("token-a", 1).await.unwrap();
        assert_eq!(second.state, ConsumeState::Cooling);

        let loaded = store.load_tokens().await.unwrap();
        let record = &loaded.get("ssoBasic").unwrap()[0];
        assert_eq!(record.status, TokenStatus::Cooling);
        assert_eq!(record.use_count, 4);
    }

    #[tokio::test]
    async fn test_atomic_consume_insufficient() {
        let store = store().await;
        store.save_tokens(&seed(2)).await.unwrap();

        let outcome = store.atomic_consume("token-a", 5).await.unwrap();
        assert!(!outcome.ok);
        assert_eq!(outcome.new_quota, 2);
        assert_eq!(outcome.state, ConsumeState::Insufficient);
    }

    #[tokio::test]
    async fn test_atomic_consume_unknown_token() {
        let store = store().await;
        let err = store.atomic_consume("ghost", 1).await.unwrap_err();
        assert!(matches!(err, StorageError::UnknownToken(_)));
    }

    #[tokio::test]
    async fn test_concurrent_consume_exact_accounting() {
        let store = Arc::new(store().await);
        store.save_tokens(&seed(25)).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..35 {
            let s = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                s.atomic_consume("token-a", 1).await
            }));
        }

        let mut succeeded = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap().ok {
                succeeded += 1;
            }
        }
        assert_eq!(succeeded, 25);

        let loaded = store.load_tokens().await.unwrap();
        assert_eq!(loaded.get("ssoBasic").unwrap()[0].quota, 0);
    }

    #[tokio::test]
    async fn test_lock_blocks_and_times_out() {
        let store = Arc::new(store().await);
        let _guard = store
            .acquire_lock("pool", Duration::from_secs(1))
            .await
            .unwrap();
        let err = store
            .acquire_lock("pool", Duration::from_millis(30))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::LockTimeout { .. }));
    }
}
