//! Credential pool: records, per-tier pools, the manager that owns them,
//! and the background refresh loop.

pub mod manager;
pub mod pool;
pub mod record;
pub mod refresh;
pub mod strategy;

pub use manager::{PoolSnapshot, TokenPoolManager, TokenSnapshot};
pub use pool::{TokenPool, TokenPoolStats};
pub use record::{EffortType, TokenRecord, TokenStatus};
pub use refresh::{spawn_refresh_loop, start_auto_refresh};
pub use strategy::SelectionStrategy;
