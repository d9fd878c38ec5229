//! Utility modules
//!
//! Contains retry logic, timeout handling, and string helpers.

pub mod retry;
pub mod string;
pub mod timeout;

pub use retry::{retry_on_status, retry_on_status_with, RetryContext, RetryPolicy};
pub use string::{mask_token, truncate_str};
pub use timeout::{with_timeout, TimeoutError};
