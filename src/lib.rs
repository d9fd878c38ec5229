//! Credential pool and retry engine for Grok-compatible API gateways

// Public modules
pub mod config;
pub mod error;
pub mod logging;
pub mod services;
pub mod storage;
pub mod utils;

// Re-export commonly used types
pub use config::Settings;
pub use error::{PoolError, UpstreamError};
pub use services::quota::{GrokQuotaClient, QuotaAuthority};
pub use services::token_pool::{
    EffortType, SelectionStrategy, TokenPool, TokenPoolManager, TokenRecord, TokenStatus,
};
pub use storage::{ConsumeOutcome, ConsumeState, TokenStore};
pub use utils::retry::{retry_on_status, retry_on_status_with, RetryPolicy};
