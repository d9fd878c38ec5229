//! Background quota refresh loop
//!
//! Periodically resyncs cooling tokens against the upstream authority.
//! One token's failure never stops the sweep; it is logged and the loop
//! moves on.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::utils::string::mask_token;

use super::manager::TokenPoolManager;

/// Start the refresh loop if enabled in the manager's settings, ticking
/// at the minimum per-tier interval. Returns `None` (and spawns nothing)
/// when auto-refresh is configured off.
pub fn start_auto_refresh(manager: Arc<TokenPoolManager>) -> Option<JoinHandle<()>> {
    let pool = &manager.settings().pool;
    if !pool.auto_refresh {
        info!("auto refresh disabled by configuration");
        return None;
    }
    let interval = pool.min_refresh_interval();
    Some(spawn_refresh_loop(manager, interval))
}

/// Spawn the refresh loop, ticking at the given interval. The first sweep
/// happens after one full interval, not at startup.
pub fn spawn_refresh_loop(
    manager: Arc<TokenPoolManager>,
    interval: Duration,
) -> JoinHandle<()> {
    info!(interval_secs = interval.as_secs(), "refresh loop started");
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await; // first tick fires immediately

        loop {
            ticker.tick().await;
            run_sweep(&manager).await;
        }
    })
}

/// One sweep: collect the due tokens, then resync each in turn. The
/// candidate list is snapshotted first so no pool lock is held across the
/// upstream calls.
pub async fn run_sweep(manager: &TokenPoolManager) {
    if let Err(err) = manager.reload_if_stale().await {
        warn!(error = %err, "refresh sweep could not reload pools");
        return;
    }

    let due = manager.refresh_candidates().await;
    if due.is_empty() {
        debug!("refresh sweep found nothing due");
        return;
    }

    debug!(count = due.len(), "refresh sweep starting");
    for token in due {
        if let Err(err) = manager.sync_usage(&token, false).await {
            warn!(token = %mask_token(&token), error = %err, "token refresh failed");
        }
    }
}
