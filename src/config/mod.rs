//! Configuration module
//!
//! Environment-driven application settings.

pub mod settings;

pub use settings::{
    EffortCosts, PoolSettings, RetrySettings, Settings, StorageBackend, StorageSettings,
};
