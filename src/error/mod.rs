//! Error types
//!
//! Contains the pool error taxonomy and the classified upstream error
//! the retry engine consumes.

pub mod types;

pub use types::{ClassifiedError, PoolError, UpstreamError};
