//! Logging setup
//!
//! Initializes the global `tracing` subscriber. Library code only emits
//! `tracing` events; the embedding application decides where they go, but
//! this helper covers the common case (env-filtered stdout, optionally
//! JSON-formatted for log shippers).

use tracing_subscriber::{fmt, EnvFilter};

/// Initialize the global tracing subscriber.
///
/// `log_level` is the default directive when `RUST_LOG` is unset, e.g.
/// `"info"` or `"sso_pool=debug"`. Returns quietly if a subscriber is
/// already installed so tests can call this repeatedly.
pub fn init(log_level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    let builder = fmt()
        .with_env_filter(filter)
        .with_target(true);

    let result = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    if result.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init("info", false);
        init("debug", true);
    }
}
