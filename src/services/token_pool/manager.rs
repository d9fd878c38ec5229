//! Token Pool Manager
//!
//! Owns every tier's pool, the storage backend, and the quota authority.
//! All state mutations go through here so that the in-memory view and the
//! persisted view move together: quota consumption runs through the
//! backend's atomic primitive, everything else is a load-mutate-save cycle
//! under the storage advisory lock.

use std::collections::HashMap;
use std::time::Instant;

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::error::PoolError;
use crate::services::quota::QuotaAuthority;
use crate::storage::{ConsumeOutcome, ConsumeState, TokenStore};
use crate::utils::string::mask_token;
use crate::utils::timeout::{with_timeout, TimeoutError};

use super::pool::{TokenPool, TokenPoolStats};
use super::record::{now_ms, EffortType, TokenRecord, TokenStatus};

/// Advisory lock name guarding load-mutate-save cycles.
const POOL_LOCK: &str = "token_pool";

// ============================================================================
// Snapshots
// ============================================================================

/// Externally-safe view of one credential. The token value is masked.
#[derive(Debug, Clone, Serialize)]
pub struct TokenSnapshot {
    pub token: String,
    pub status: TokenStatus,
    pub quota: u64,
    pub use_count: u64,
    pub fail_count: u32,
    pub last_used_at: Option<i64>,
    pub last_sync_at: Option<i64>,
    pub tags: Vec<String>,
}

/// Externally-safe view of one tier's pool.
#[derive(Debug, Clone, Serialize)]
pub struct PoolSnapshot {
    pub name: String,
    pub strategy: String,
    pub stats: TokenPoolStats,
    pub tokens: Vec<TokenSnapshot>,
}

// ============================================================================
// Manager
// ============================================================================

/// Central coordinator for every tier's credential pool.
pub struct TokenPoolManager {
    pools: RwLock<HashMap<String, TokenPool>>,
    store: Arc<dyn TokenStore>,
    authority: Arc<dyn QuotaAuthority>,
    settings: Settings,
    last_reload: RwLock<Option<Instant>>,
}

impl TokenPoolManager {
    pub fn new(
        store: Arc<dyn TokenStore>,
        authority: Arc<dyn QuotaAuthority>,
        settings: Settings,
    ) -> Self {
        Self {
            pools: RwLock::new(HashMap::new()),
            store,
            authority,
            settings,
            last_reload: RwLock::new(None),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    // ------------------------------------------------------------------
    // Loading and reloading
    // ------------------------------------------------------------------

    /// Replace the in-memory pools with the persisted state. The advisory
    /// lock keeps the load-and-replace window clear of concurrent saves.
    pub async fn reload(&self) -> Result<(), PoolError> {
        let _guard = self.lock_store().await?;
        let map = self.store.load_tokens().await?;

        let strategy = self.settings.pool.selection_strategy;
        let mut pools = self.pools.write().await;
        pools.clear();
        for (tier, records) in map {
            pools.insert(
                tier.clone(),
                TokenPool::with_records(tier, strategy, records),
            );
        }
        drop(pools);

        *self.last_reload.write().await = Some(Instant::now());
        debug!("token pools reloaded from storage");
        Ok(())
    }

    /// Reload only when the in-memory view is older than the configured
    /// maximum age. Cheap enough to call on every selection.
    pub async fn reload_if_stale(&self) -> Result<(), PoolError> {
        let max_age = self.settings.pool.reload_max_age();
        let stale = match *self.last_reload.read().await {
            None => true,
            Some(at) => at.elapsed() >= max_age,
        };
        if stale {
            self.reload().await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Selection and consumption
    // ------------------------------------------------------------------

    /// Pick an available credential from the tier, or `None`.
    pub async fn get_token(&self, tier: &str) -> Option<String> {
        let pools = self.pools.read().await;
        pools.get(tier)?.select().map(|r| r.token.clone())
    }

    /// Pick an available credential, refreshing the in-memory view first.
    /// An empty tier surfaces as `Exhausted`.
    pub async fn acquire_token(&self, tier: &str) -> Result<String, PoolError> {
        self.reload_if_stale().await?;
        self.get_token(tier)
            .await
            .ok_or_else(|| PoolError::Exhausted(tier.to_string()))
    }

    /// Deduct the effort's cost from one credential.
    ///
    /// The deduction itself happens in the storage backend's atomic
    /// primitive; the in-memory record is then brought in line with the
    /// returned outcome. When the remaining quota is smaller than the cost
    /// the credential is drained to zero instead of being left with an
    /// unusable remainder.
    pub async fn consume(
        &self,
        token: &str,
        effort: EffortType,
    ) -> Result<ConsumeOutcome, PoolError> {
        let cost = effort.cost(&self.settings.pool.effort);

        let mut outcome = self.store.atomic_consume(token, cost).await?;
        let mut deducted = if outcome.ok { cost } else { 0 };

        if outcome.state == ConsumeState::Insufficient && outcome.new_quota > 0 {
            let remainder = outcome.new_quota;
            outcome = self.store.atomic_consume(token, remainder).await?;
            if outcome.ok {
                deducted = remainder;
            }
        }

        self.sync_record_from_outcome(token, &outcome, deducted)
            .await?;

        debug!(
            token = %mask_token(token),
            effort = ?effort,
            deducted,
            new_quota = outcome.new_quota,
            state = ?outcome.state,
            "quota consumed"
        );
        Ok(outcome)
    }

    /// Bring the in-memory record in line with a storage-side consume.
    async fn sync_record_from_outcome(
        &self,
        token: &str,
        outcome: &ConsumeOutcome,
        deducted: u64,
    ) -> Result<(), PoolError> {
        let mut pools = self.pools.write().await;
        let record = find_record_mut(&mut pools, token).ok_or(PoolError::UnknownToken)?;

        // Outcomes from racing consumes may apply out of order; quota only
        // ever decreases here, so take the minimum.
        record.quota = record.quota.min(outcome.new_quota);
        if outcome.ok {
            record.use_count += deducted;
            record.last_used_at = Some(now_ms());
            if outcome.state == ConsumeState::Cooling
                && matches!(record.status, TokenStatus::Active | TokenStatus::Cooling)
            {
                record.status = TokenStatus::Cooling;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Health reporting
    // ------------------------------------------------------------------

    /// Report an upstream failure observed while using this credential.
    /// Only auth rejections count toward expiry; the change is persisted.
    pub async fn record_fail(
        &self,
        token: &str,
        status_code: u16,
        reason: &str,
    ) -> Result<(), PoolError> {
        let threshold = self.settings.pool.fail_threshold;
        let masked = mask_token(token);
        self.mutate_and_persist(token, |record| {
            record.record_fail(status_code, reason, threshold);
            if record.status == TokenStatus::Expired {
                warn!(token = %masked, fail_count = record.fail_count, "token expired");
            }
        })
        .await
    }

    /// Report a successful upstream call; clears the failure streak.
    pub async fn record_success(&self, token: &str) -> Result<(), PoolError> {
        self.mutate_and_persist(token, |record| record.record_success())
            .await
    }

    // ------------------------------------------------------------------
    // Quota resync
    // ------------------------------------------------------------------

    /// Resync one credential's quota from the upstream authority.
    ///
    /// Infrastructure failures (timeouts, connection errors, 5xx) never
    /// count against the credential. Auth rejections do. When
    /// `consume_on_fail` is set, an unreachable authority costs the
    /// credential one low-effort unit as a conservative estimate instead
    /// of leaving its quota untouched.
    pub async fn sync_usage(&self, token: &str, consume_on_fail: bool) -> Result<u64, PoolError> {
        let timeout = self.settings.pool.sync_timeout();
        let model = self.settings.pool.reference_model.clone();
        let masked = mask_token(token);

        let result = with_timeout(
            timeout,
            self.authority.fetch_remaining_quota(token, &model),
        )
        .await;

        match result {
            Ok(remaining) => {
                self.mutate_and_persist(token, |record| {
                    record.update_quota(remaining as i64);
                    record.last_sync_at = Some(now_ms());
                })
                .await?;
                info!(token = %masked, remaining, "quota synced");
                Ok(remaining)
            }
            Err(TimeoutError::Inner(err)) if err.is_auth_rejection() => {
                let status = err.status;
                let message = err.message.clone();
                self.record_fail(token, status, &message).await?;
                Err(PoolError::Upstream(err))
            }
            Err(err) => {
                warn!(token = %masked, error = %err, "quota sync failed");
                if consume_on_fail {
                    let cost = self.settings.pool.effort.low;
                    // conservative estimate; ignore Insufficient
                    let _ = self.store.atomic_consume(token, cost).await;
                }
                // the load-merge-save picks up any deduction above
                self.mutate_and_persist(token, |record| {
                    record.last_sync_at = Some(now_ms());
                })
                .await?;
                Err(PoolError::UpstreamSync(err.to_string()))
            }
        }
    }

    /// Tokens currently due for a resync, per their tier's interval.
    pub async fn refresh_candidates(&self) -> Vec<String> {
        let pools = self.pools.read().await;
        let mut due = Vec::new();
        for pool in pools.values() {
            let interval = self.settings.pool.refresh_interval_for(&pool.name);
            for record in pool.records() {
                if record.need_refresh(interval) {
                    due.push(record.token.clone());
                }
            }
        }
        due
    }

    // ------------------------------------------------------------------
    // Administration
    // ------------------------------------------------------------------

    /// Add a credential to a tier with the tier's default quota. Replaces
    /// an existing record with the same value.
    pub async fn add_token(&self, tier: &str, token: &str) -> Result<(), PoolError> {
        let quota = self.settings.pool.default_quota_for(tier);
        let strategy = self.settings.pool.selection_strategy;
        let record = TokenRecord::new(token, tier, quota);

        let _guard = self.lock_store().await?;
        let mut map = self.store.load_tokens().await?;
        let records = map.entry(tier.to_string()).or_default();
        match records.iter_mut().find(|r| r.token == token) {
            Some(existing) => *existing = record.clone(),
            None => records.push(record.clone()),
        }
        self.store.save_tokens(&map).await?;

        let mut pools = self.pools.write().await;
        pools
            .entry(tier.to_string())
            .or_insert_with(|| TokenPool::new(tier, strategy))
            .upsert(record);
        drop(pools);

        info!(tier, token = %mask_token(token), quota, "token added");
        Ok(())
    }

    /// Remove a credential from whichever tier holds it.
    pub async fn remove_token(&self, token: &str) -> Result<(), PoolError> {
        let _guard = self.lock_store().await?;
        let mut map = self.store.load_tokens().await?;
        let mut removed = false;
        for records in map.values_mut() {
            if let Some(idx) = records.iter().position(|r| r.token == token) {
                records.remove(idx);
                removed = true;
                break;
            }
        }
        if !removed {
            return Err(PoolError::UnknownToken);
        }
        self.store.save_tokens(&map).await?;

        let mut pools = self.pools.write().await;
        for pool in pools.values_mut() {
            pool.remove(token);
        }
        drop(pools);

        info!(token = %mask_token(token), "token removed");
        Ok(())
    }

    /// Reset a credential to its tier's default quota, active and clean.
    pub async fn reset_token(&self, token: &str) -> Result<(), PoolError> {
        let pool_settings = self.settings.pool.clone();
        self.mutate_and_persist(token, move |record| {
            record.reset(pool_settings.default_quota_for(&record.pool));
        })
        .await
    }

    /// Replace a credential's administrative tags.
    pub async fn set_tags(&self, token: &str, tags: Vec<String>) -> Result<(), PoolError> {
        self.mutate_and_persist(token, |record| {
            record.tags = tags.into_iter().collect();
        })
        .await
    }

    /// Stamp a credential's sync timestamp without touching quota or
    /// status, e.g. to defer its next background resync.
    pub async fn stamp_sync(&self, token: &str) -> Result<(), PoolError> {
        self.mutate_and_persist(token, |record| {
            record.last_sync_at = Some(now_ms());
        })
        .await
    }

    /// Flip a credential's operator switch.
    pub async fn set_disabled(&self, token: &str, disabled: bool) -> Result<(), PoolError> {
        self.mutate_and_persist(token, |record| {
            if disabled {
                record.status = TokenStatus::Disabled;
            } else if record.status == TokenStatus::Disabled {
                record.status = if record.quota > 0 {
                    TokenStatus::Active
                } else {
                    TokenStatus::Cooling
                };
            }
        })
        .await
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    /// Per-tier aggregate counters.
    pub async fn stats(&self) -> Vec<TokenPoolStats> {
        let pools = self.pools.read().await;
        pools.values().map(TokenPool::stats).collect()
    }

    /// Masked snapshot of every pool, safe to expose externally.
    pub async fn export_pools(&self) -> Vec<PoolSnapshot> {
        let pools = self.pools.read().await;
        let mut out: Vec<PoolSnapshot> = pools
            .values()
            .map(|pool| PoolSnapshot {
                name: pool.name.clone(),
                strategy: pool.strategy.to_string(),
                stats: pool.stats(),
                tokens: pool
                    .records()
                    .iter()
                    .map(|r| TokenSnapshot {
                        token: mask_token(&r.token),
                        status: r.status,
                        quota: r.quota,
                        use_count: r.use_count,
                        fail_count: r.fail_count,
                        last_used_at: r.last_used_at,
                        last_sync_at: r.last_sync_at,
                        tags: r.tags.iter().cloned().collect(),
                    })
                    .collect(),
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    /// Apply `mutate` to the named record as a load-merge-save cycle.
    ///
    /// The advisory lock is held across the whole cycle, so the mutation
    /// lands on a fresh copy of the stored map and concurrent cycles
    /// serialize in lock order. Store first, memory second: another
    /// process's writes to sibling records are merged in, never
    /// overwritten, and the in-memory record is replaced by the stored
    /// result.
    async fn mutate_and_persist<F>(&self, token: &str, mutate: F) -> Result<(), PoolError>
    where
        F: FnOnce(&mut TokenRecord),
    {
        let _guard = self.lock_store().await?;
        let mut map = self.store.load_tokens().await?;
        let record = map
            .values_mut()
            .flat_map(|records| records.iter_mut())
            .find(|r| r.token == token)
            .ok_or(PoolError::UnknownToken)?;
        mutate(record);
        let updated = record.clone();
        self.store.save_tokens(&map).await?;

        let mut pools = self.pools.write().await;
        if let Some(in_memory) = find_record_mut(&mut pools, token) {
            *in_memory = updated;
        }
        Ok(())
    }

    async fn lock_store(&self) -> Result<crate::storage::StoreLock, PoolError> {
        Ok(self
            .store
            .acquire_lock(POOL_LOCK, self.settings.storage.lock_timeout())
            .await?)
    }
}

fn find_record_mut<'a>(
    pools: &'a mut HashMap<String, TokenPool>,
    token: &str,
) -> Option<&'a mut TokenRecord> {
    pools.values_mut().find_map(|pool| pool.get_mut(token))
}
