//! Redis storage backend
//!
//! Layout: `ssopool:pools` is the set of tier names, `ssopool:pool:{tier}`
//! the set of token ids in a tier, and `ssopool:token:{id}` a hash with
//! one field per record attribute. Quota consumption runs as a single Lua
//! script so check, decrement, and usage stamping are one round trip and
//! one atomic step. Advisory locks are `SET NX PX` keys deleted on drop.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::services::token_pool::record::{now_ms, TokenRecord, TokenStatus};

use super::{ConsumeOutcome, ConsumeState, StorageError, StoreLock, TokenMap, TokenStore};

const POOLS_KEY: &str = "ssopool:pools";
const LOCK_TTL_MS: u64 = 30_000;

const CONSUME_SCRIPT: &str = r#"
local key = KEYS[1]
local amount = tonumber(ARGV[1])
local now = ARGV[2]
if redis.call("EXISTS", key) == 0 then
    return {-1, 0, "unknown"}
end
local quota = tonumber(redis.call("HGET", key, "quota") or "0")
if quota < amount then
    return {0, quota, "insufficient"}
end
local new_quota = quota - amount
redis.call("HSET", key, "quota", new_quota)
redis.call("HINCRBY", key, "use_count", amount)
redis.call("HSET", key, "last_used_at", now)
local state = "ok"
if new_quota == 0 then
    local status = redis.call("HGET", key, "status")
    if status == "active" or status == "cooling" then
        redis.call("HSET", key, "status", "cooling")
    end
    state = "cooling"
end
return {1, new_quota, state}
"#;

fn pool_key(tier: &str) -> String {
    format!("ssopool:pool:{}", tier)
}

fn token_key(token: &str) -> String {
    format!("ssopool:token:{}", token)
}

fn lock_key(name: &str) -> String {
    format!("ssopool:lock:{}", name)
}

fn record_to_fields(record: &TokenRecord) -> Result<Vec<(String, String)>, StorageError> {
    let mut fields = vec![
        ("token".to_string(), record.token.clone()),
        ("pool".to_string(), record.pool.clone()),
        ("status".to_string(), record.status.as_str().to_string()),
        ("quota".to_string(), record.quota.to_string()),
        ("use_count".to_string(), record.use_count.to_string()),
        ("fail_count".to_string(), record.fail_count.to_string()),
        ("created_at".to_string(), record.created_at.to_string()),
        (
            "tags".to_string(),
            serde_json::to_string(&record.tags)?,
        ),
    ];
    if let Some(at) = record.last_used_at {
        fields.push(("last_used_at".to_string(), at.to_string()));
    }
    if let Some(at) = record.last_fail_at {
        fields.push(("last_fail_at".to_string(), at.to_string()));
    }
    if let Some(at) = record.last_sync_at {
        fields.push(("last_sync_at".to_string(), at.to_string()));
    }
    if let Some(reason) = &record.last_fail_reason {
        fields.push(("last_fail_reason".to_string(), reason.clone()));
    }
    Ok(fields)
}

fn record_from_fields(
    fields: &HashMap<String, String>,
) -> Result<TokenRecord, StorageError> {
    let get = |name: &str| fields.get(name).cloned().unwrap_or_default();
    let parse_u64 = |name: &str| get(name).parse::<u64>().unwrap_or(0);
    let parse_opt = |name: &str| fields.get(name).and_then(|v| v.parse::<i64>().ok());

    let token = fields
        .get("token")
        .cloned()
        .ok_or_else(|| StorageError::Backend("token hash missing 'token' field".into()))?;

    Ok(TokenRecord {
        token,
        pool: get("pool"),
        status: TokenStatus::parse(&get("status")),
        quota: parse_u64("quota"),
        use_count: parse_u64("use_count"),
        fail_count: get("fail_count").parse().unwrap_or(0),
        created_at: get("created_at").parse().unwrap_or(0),
        last_used_at: parse_opt("last_used_at"),
        last_fail_at: parse_opt("last_fail_at"),
        last_sync_at: parse_opt("last_sync_at"),
        last_fail_reason: fields.get("last_fail_reason").cloned(),
        tags: fields
            .get("tags")
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default(),
    })
}

pub struct RedisStore {
    conn: ConnectionManager,
    consume: redis::Script,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self, StorageError> {
        let client = redis::Client::open(url)
            .map_err(|e| StorageError::Backend(format!("invalid redis URL: {}", e)))?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self {
            conn,
            consume: redis::Script::new(CONSUME_SCRIPT),
        })
    }

    async fn tier_tokens(
        &self,
        conn: &mut ConnectionManager,
        tier: &str,
    ) -> Result<Vec<TokenRecord>, StorageError> {
        let ids: Vec<String> = conn.smembers(pool_key(tier)).await?;
        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            let fields: HashMap<String, String> = conn.hgetall(token_key(&id)).await?;
            if fields.is_empty() {
                // stale set member; the next save_tokens clears it
                continue;
            }
            records.push(record_from_fields(&fields)?);
        }
        Ok(records)
    }
}

#[async_trait]
impl TokenStore for RedisStore {
    async fn load_tokens(&self) -> Result<TokenMap, StorageError> {
        let mut conn = self.conn.clone();
        let tiers: Vec<String> = conn.smembers(POOLS_KEY).await?;

        let mut map = TokenMap::new();
        for tier in tiers {
            let records = self.tier_tokens(&mut conn, &tier).await?;
            map.insert(tier, records);
        }
        Ok(map)
    }

    async fn save_tokens(&self, pools: &TokenMap) -> Result<(), StorageError> {
        let mut conn = self.conn.clone();

        // Full replace: drop every key we own, then rebuild.
        let old_tiers: Vec<String> = conn.smembers(POOLS_KEY).await?;
        for tier in &old_tiers {
            let ids: Vec<String> = conn.smembers(pool_key(tier)).await?;
            for id in ids {
                let _: () = conn.del(token_key(&id)).await?;
            }
            let _: () = conn.del(pool_key(tier)).await?;
        }
        let _: () = conn.del(POOLS_KEY).await?;

        for (tier, records) in pools {
            let _: () = conn.sadd(POOLS_KEY, tier).await?;
            for record in records {
                let _: () = conn.sadd(pool_key(tier), &record.token).await?;
                let fields = record_to_fields(record)?;
                let _: () = conn.hset_multiple(token_key(&record.token), &fields).await?;
            }
        }
        Ok(())
    }

    async fn acquire_lock(
        &self,
        name: &str,
        timeout: Duration,
    ) -> Result<StoreLock, StorageError> {
        let key = lock_key(name);
        let deadline = tokio::time::Instant::now() + timeout;
        let mut conn = self.conn.clone();

        loop {
            let acquired: bool = redis::cmd("SET")
                .arg(&key)
                .arg("1")
                .arg("NX")
                .arg("PX")
                .arg(LOCK_TTL_MS)
                .query_async(&mut conn)
                .await?;
            if acquired {
                return Ok(StoreLock::new(RedisLockGuard {
                    conn: self.conn.clone(),
                    key,
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
        let mut conn = self.conn.clone();
        let (ok, new_quota, state): (i64, u64, String) = self
            .consume
            .key(token_key(token_id))
            .arg(amount)
            .arg(now_ms())
            .invoke_async(&mut conn)
            .await?;

        match (ok, state.as_str()) {
            (-1, _) => Err(StorageError::UnknownToken(token_id.to_string())),
            (0, _) => Ok(ConsumeOutcome {
                ok: false,
                new_quota,
                state: ConsumeState::Insufficient,
            }),
            (_, "cooling") => Ok(ConsumeOutcome {
                ok: true,
                new_quota,
                state: ConsumeState::Cooling,
            }),
            _ => Ok(ConsumeOutcome {
                ok: true,
                new_quota,
                state: ConsumeState::Ok,
            }),
        }
    }
}

/// Deletes the lock key when dropped. Redis I/O cannot run in `Drop`, so
/// the delete is spawned; the PX TTL covers the case where that task
/// never runs.
struct RedisLockGuard {
    conn: ConnectionManager,
    key: String,
}

impl Drop for RedisLockGuard {
    fn drop(&mut self) {
        let mut conn = self.conn.clone();
        let key = self.key.clone();
        tokio::spawn(async move {
            let _: Result<(), _> = conn.del::<_, ()>(&key).await;
        });
    }
}
