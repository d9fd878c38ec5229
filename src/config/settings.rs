//! Application settings and configuration
//!
//! This module provides configuration management for the pool core,
//! loading settings from environment variables with sensible defaults.

use std::collections::HashMap;
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::services::token_pool::SelectionStrategy;

/// Storage backend selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// JSON file on the local filesystem (default)
    Local,
    /// In-process memory only; state is lost on restart
    Memory,
    /// Redis with Lua-scripted atomic quota consumption
    Redis,
    /// SQLite with row-level conditional updates
    Sqlite,
}

impl Default for StorageBackend {
    fn default() -> Self {
        StorageBackend::Local
    }
}

impl fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageBackend::Local => write!(f, "local"),
            StorageBackend::Memory => write!(f, "memory"),
            StorageBackend::Redis => write!(f, "redis"),
            StorageBackend::Sqlite => write!(f, "sqlite"),
        }
    }
}

impl std::str::FromStr for StorageBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "local" | "file" => Ok(StorageBackend::Local),
            "memory" | "mem" => Ok(StorageBackend::Memory),
            "redis" => Ok(StorageBackend::Redis),
            "sqlite" | "sql" => Ok(StorageBackend::Sqlite),
            _ => anyhow::bail!(
                "Invalid storage backend: {}. Expected: local, memory, redis, or sqlite",
                s
            ),
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageSettings {
    pub backend: StorageBackend,
    /// Connection URL for redis/sqlite backends
    pub url: Option<String>,
    /// Token file path for the local backend
    pub path: PathBuf,
    /// Timeout for acquiring the storage-level lock
    pub lock_timeout_secs: u64,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Local,
            url: None,
            path: PathBuf::from("data/token.json"),
            lock_timeout_secs: 10,
        }
    }
}

impl StorageSettings {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }
}

/// Quota deduction per effort class. These are configuration, not business
/// logic; the defaults mirror the upstream's observed cost model.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct EffortCosts {
    pub low: u64,
    pub high: u64,
}

impl Default for EffortCosts {
    fn default() -> Self {
        Self { low: 1, high: 4 }
    }
}

/// Token pool configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PoolSettings {
    /// Selection strategy applied by every pool
    pub selection_strategy: SelectionStrategy,
    /// Auth rejections before a token is expired
    pub fail_threshold: u32,
    /// Default quota for freshly added / reset basic-tier tokens
    pub basic_default_quota: u64,
    /// Default quota for the super tier
    pub super_default_quota: u64,
    /// Cooling-token resync interval for the basic tier, hours
    pub refresh_interval_hours: u64,
    /// Cooling-token resync interval for the super tier, hours
    pub super_refresh_interval_hours: u64,
    /// Whether the background refresh loop runs
    pub auto_refresh: bool,
    /// Maximum age before `reload_if_stale` re-reads storage, seconds
    pub reload_max_age_secs: u64,
    /// Bounded timeout for one quota resync call, seconds
    pub sync_timeout_secs: u64,
    /// Effort cost table
    pub effort: EffortCosts,
    /// Model name presented to the quota authority when resyncing
    pub reference_model: String,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            selection_strategy: SelectionStrategy::MaxQuota,
            fail_threshold: 5,
            basic_default_quota: 80,
            super_default_quota: 400,
            refresh_interval_hours: 8,
            super_refresh_interval_hours: 2,
            auto_refresh: true,
            reload_max_age_secs: 60,
            sync_timeout_secs: 15,
            effort: EffortCosts::default(),
            reference_model: "grok-3".to_string(),
        }
    }
}

impl PoolSettings {
    /// Default quota for a tier. The super tier carries its own baseline;
    /// every other tier uses the basic default.
    pub fn default_quota_for(&self, tier: &str) -> u64 {
        if tier == "ssoSuper" {
            self.super_default_quota
        } else {
            self.basic_default_quota
        }
    }

    /// Resync interval for a tier.
    pub fn refresh_interval_for(&self, tier: &str) -> Duration {
        let hours = if tier == "ssoSuper" {
            self.super_refresh_interval_hours
        } else {
            self.refresh_interval_hours
        };
        Duration::from_secs(hours * 3600)
    }

    /// Tick interval for the background refresh loop: the minimum of the
    /// per-tier intervals, so the most impatient tier is never starved.
    pub fn min_refresh_interval(&self) -> Duration {
        let hours = self
            .refresh_interval_hours
            .min(self.super_refresh_interval_hours)
            .max(1);
        Duration::from_secs(hours * 3600)
    }

    pub fn reload_max_age(&self) -> Duration {
        Duration::from_secs(self.reload_max_age_secs)
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_secs(self.sync_timeout_secs)
    }
}

/// Retry policy configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetrySettings {
    /// Maximum retry attempts (not counting the initial attempt)
    pub max_retry: u32,
    /// Status codes eligible for retry; everything else is immediately fatal
    pub retry_status_codes: Vec<u16>,
    /// Base backoff, seconds
    pub backoff_base: f64,
    /// Exponential growth factor
    pub backoff_factor: f64,
    /// Upper bound on any single delay, seconds
    pub backoff_max: f64,
    /// Total sleep budget across one logical call, seconds
    pub budget: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retry: 3,
            retry_status_codes: vec![429, 500, 502, 503],
            backoff_base: 0.5,
            backoff_factor: 2.0,
            backoff_max: 30.0,
            budget: 60.0,
        }
    }
}

/// Main application settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Settings {
    // App settings
    pub app_name: String,
    pub app_version: String,
    pub log_level: String,

    // Upstream base URL for the quota authority
    pub upstream_base_url: String,

    // Subsystems
    pub storage: StorageSettings,
    pub pool: PoolSettings,
    pub retry: RetrySettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            app_name: "sso-pool".to_string(),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            log_level: "info".to_string(),
            upstream_base_url: "https://grok.com".to_string(),
            storage: StorageSettings::default(),
            pool: PoolSettings::default(),
            retry: RetrySettings::default(),
        }
    }
}

impl Settings {
    /// Load settings from environment variables with defaults
    pub fn load() -> Result<Self> {
        // Load .env file if it exists (ignored in production typically)
        dotenvy::dotenv().ok();

        let defaults = Self::default();

        let settings = Self {
            app_name: env_or_default("APP_NAME", &defaults.app_name),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            log_level: env_or_default("LOG_LEVEL", &defaults.log_level),

            upstream_base_url: env_or_default("UPSTREAM_BASE_URL", &defaults.upstream_base_url),

            storage: StorageSettings {
                backend: env_or_default("STORAGE_BACKEND", "local")
                    .parse()
                    .context("Invalid STORAGE_BACKEND value")?,
                url: env::var("STORAGE_URL").ok(),
                path: PathBuf::from(env_or_default("TOKEN_FILE", "data/token.json")),
                lock_timeout_secs: parse_env("STORAGE_LOCK_TIMEOUT_SECS", 10)?,
            },

            pool: PoolSettings {
                selection_strategy: SelectionStrategy::parse(&env_or_default(
                    "TOKEN_SELECTION_STRATEGY",
                    "max_quota",
                )),
                fail_threshold: parse_env("TOKEN_FAIL_THRESHOLD", 5)?,
                basic_default_quota: parse_env("TOKEN_BASIC_DEFAULT_QUOTA", 80)?,
                super_default_quota: parse_env("TOKEN_SUPER_DEFAULT_QUOTA", 400)?,
                refresh_interval_hours: parse_env("TOKEN_REFRESH_INTERVAL_HOURS", 8)?,
                super_refresh_interval_hours: parse_env("TOKEN_SUPER_REFRESH_INTERVAL_HOURS", 2)?,
                auto_refresh: parse_env("TOKEN_AUTO_REFRESH", true)?,
                reload_max_age_secs: parse_env("TOKEN_RELOAD_MAX_AGE_SECS", 60)?,
                sync_timeout_secs: parse_env("TOKEN_SYNC_TIMEOUT_SECS", 15)?,
                effort: EffortCosts {
                    low: parse_env("EFFORT_COST_LOW", 1)?,
                    high: parse_env("EFFORT_COST_HIGH", 4)?,
                },
                reference_model: env_or_default("QUOTA_REFERENCE_MODEL", "grok-3"),
            },

            retry: RetrySettings {
                max_retry: parse_env("RETRY_MAX", 3)?,
                retry_status_codes: parse_status_codes(
                    &env_or_default("RETRY_STATUS_CODES", "429,500,502,503"),
                )?,
                backoff_base: parse_env("RETRY_BACKOFF_BASE", 0.5)?,
                backoff_factor: parse_env("RETRY_BACKOFF_FACTOR", 2.0)?,
                backoff_max: parse_env("RETRY_BACKOFF_MAX", 30.0)?,
                budget: parse_env("RETRY_BUDGET", 60.0)?,
            },
        };

        settings.validate()?;

        Ok(settings)
    }

    /// Validate settings
    pub fn validate(&self) -> Result<()> {
        if self.pool.fail_threshold == 0 {
            anyhow::bail!("TOKEN_FAIL_THRESHOLD must be > 0");
        }
        if self.pool.effort.low == 0 || self.pool.effort.high == 0 {
            anyhow::bail!("Effort costs must be > 0");
        }
        if self.pool.effort.high < self.pool.effort.low {
            anyhow::bail!("EFFORT_COST_HIGH must be >= EFFORT_COST_LOW");
        }
        if self.retry.backoff_base < 0.0 || self.retry.backoff_max < self.retry.backoff_base {
            anyhow::bail!("Backoff bounds must satisfy 0 <= base <= max");
        }
        if self.retry.backoff_factor < 1.0 {
            anyhow::bail!("RETRY_BACKOFF_FACTOR must be >= 1.0");
        }
        if self.retry.budget < 0.0 {
            anyhow::bail!("RETRY_BUDGET must be >= 0");
        }
        match self.storage.backend {
            StorageBackend::Redis | StorageBackend::Sqlite => {
                if self.storage.url.is_none() {
                    anyhow::bail!(
                        "STORAGE_URL is required for the {} backend",
                        self.storage.backend
                    );
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Check if running in debug logging mode
    pub fn is_debug(&self) -> bool {
        self.log_level.eq_ignore_ascii_case("debug") || self.log_level.eq_ignore_ascii_case("trace")
    }
}

/// Get an environment variable or return a default value
fn env_or_default(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Parse an environment variable or return a default, failing loudly on
/// malformed values instead of silently reverting.
fn parse_env<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid {} value '{}': {}", key, raw, e)),
        _ => Ok(default),
    }
}

fn parse_status_codes(raw: &str) -> Result<Vec<u16>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<u16>()
                .map_err(|e| anyhow::anyhow!("Invalid status code '{}': {}", s, e))
        })
        .collect()
}
