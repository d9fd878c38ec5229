//! Token record state machine
//!
//! A `TokenRecord` is one upstream credential: its remaining quota, health
//! state, and lifetime counters. Status transitions happen only as side
//! effects of the operations here — callers never assign a status
//! directly.
//!
//! `Cooling` means quota exhaustion and recovers automatically once a
//! resync raises the quota; `Expired` means repeated auth rejection and
//! needs an explicit reset. `Disabled` is an operator switch and wins
//! over everything.

use std::collections::BTreeSet;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::config::EffortCosts;

/// Current unix timestamp in milliseconds, the persisted time unit.
pub(crate) fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Health state of a credential.
///
/// The persisted form is the lowercase string (`"active"`, `"cooling"`,
/// `"expired"`, `"disabled"`); business logic only ever sees this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenStatus {
    #[default]
    Active,
    Cooling,
    Expired,
    Disabled,
}

impl TokenStatus {
    /// Storage string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenStatus::Active => "active",
            TokenStatus::Cooling => "cooling",
            TokenStatus::Expired => "expired",
            TokenStatus::Disabled => "disabled",
        }
    }

    /// Parse the storage string form. Unknown values map to `Disabled` so
    /// a corrupt record is never silently selectable.
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "active" => TokenStatus::Active,
            "cooling" => TokenStatus::Cooling,
            "expired" => TokenStatus::Expired,
            "disabled" => TokenStatus::Disabled,
            _ => TokenStatus::Disabled,
        }
    }
}

impl std::fmt::Display for TokenStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cost classification of an upstream operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EffortType {
    Low,
    High,
}

impl EffortType {
    /// Quota deduction for this effort under the given cost table.
    pub fn cost(&self, costs: &EffortCosts) -> u64 {
        match self {
            EffortType::Low => costs.low,
            EffortType::High => costs.high,
        }
    }
}

/// One upstream credential and its persisted state.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct TokenRecord {
    /// The credential value. Never logged in full.
    pub token: String,
    /// Tier this record belongs to
    #[serde(default)]
    pub pool: String,
    #[serde(default)]
    pub status: TokenStatus,
    /// Remaining spendable cost-units
    #[serde(default)]
    pub quota: u64,
    /// Lifetime cost-units spent
    #[serde(default)]
    pub use_count: u64,
    /// Consecutive auth rejections
    #[serde(default)]
    pub fail_count: u32,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub last_used_at: Option<i64>,
    #[serde(default)]
    pub last_fail_at: Option<i64>,
    #[serde(default)]
    pub last_sync_at: Option<i64>,
    #[serde(default)]
    pub last_fail_reason: Option<String>,
    /// Administrative labels; no effect on selection
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

impl TokenRecord {
    pub fn new(token: impl Into<String>, pool: impl Into<String>, quota: u64) -> Self {
        Self {
            token: token.into(),
            pool: pool.into(),
            status: TokenStatus::Active,
            quota,
            use_count: 0,
            fail_count: 0,
            created_at: now_ms(),
            last_used_at: None,
            last_fail_at: None,
            last_sync_at: None,
            last_fail_reason: None,
            tags: BTreeSet::new(),
        }
    }

    /// Selectable right now: active with quota remaining.
    pub fn is_available(&self) -> bool {
        self.status == TokenStatus::Active && self.quota > 0
    }

    /// Deduct the effort's cost, capped at the remaining quota.
    ///
    /// Returns the amount actually deducted. Reaching zero flips the
    /// record to `Cooling` unless `Disabled`/`Expired` already apply.
    /// Never touches `fail_count`.
    pub fn consume(&mut self, effort: EffortType, costs: &EffortCosts) -> u64 {
        let cost = effort.cost(costs).min(self.quota);
        self.quota -= cost;
        self.use_count += cost;
        self.last_used_at = Some(now_ms());

        if self.quota == 0 && matches!(self.status, TokenStatus::Active | TokenStatus::Cooling) {
            self.status = TokenStatus::Cooling;
        }
        cost
    }

    /// Record an upstream failure against this credential.
    ///
    /// Only auth rejections (401/403) are evidence the credential itself
    /// is bad; any other status is a no-op here. Reaching `threshold`
    /// expires the record unconditionally.
    pub fn record_fail(&mut self, status_code: u16, reason: &str, threshold: u32) {
        if !matches!(status_code, 401 | 403) {
            return;
        }

        self.fail_count += 1;
        self.last_fail_at = Some(now_ms());
        self.last_fail_reason = Some(reason.to_string());

        if self.fail_count >= threshold {
            self.status = TokenStatus::Expired;
        }
    }

    /// Record a successful upstream call: clears the failure state and,
    /// when quota remains, restores `Active`. This is how a record
    /// escapes `Expired` once it genuinely works again.
    pub fn record_success(&mut self) {
        self.fail_count = 0;
        self.last_fail_at = None;
        self.last_fail_reason = None;

        if self.quota > 0 && self.status != TokenStatus::Disabled {
            self.status = TokenStatus::Active;
        }
    }

    /// Apply an authoritative quota value from a resync.
    ///
    /// Zero parks the record in `Cooling`; a positive value lifts
    /// `Cooling`/`Expired` back to `Active`.
    pub fn update_quota(&mut self, new_quota: i64) {
        self.quota = new_quota.max(0) as u64;

        if self.quota == 0 {
            if matches!(self.status, TokenStatus::Active | TokenStatus::Cooling) {
                self.status = TokenStatus::Cooling;
            }
        } else if matches!(self.status, TokenStatus::Cooling | TokenStatus::Expired) {
            self.status = TokenStatus::Active;
        }
    }

    /// Administrative replacement: fresh quota, `Active`, failures wiped.
    pub fn reset(&mut self, default_quota: u64) {
        self.quota = default_quota;
        self.status = TokenStatus::Active;
        self.fail_count = 0;
        self.last_fail_at = None;
        self.last_fail_reason = None;
    }

    /// Whether the background loop should resync this record: cooling and
    /// never synced, or synced longer than `interval` ago.
    pub fn need_refresh(&self, interval: std::time::Duration) -> bool {
        if self.status != TokenStatus::Cooling {
            return false;
        }
        match self.last_sync_at {
            None => true,
            Some(at) => now_ms().saturating_sub(at) >= interval.as_millis() as i64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const THRESHOLD: u32 = 5;

    fn costs() -> EffortCosts {
        EffortCosts::default()
    }

    #[test]
    fn test_defaults() {
        let t = TokenRecord::new("sso_abc", "ssoBasic", 80);
        assert_eq!(t.status, TokenStatus::Active);
        assert_eq!(t.quota, 80);
        assert_eq!(t.fail_count, 0);
        assert!(t.is_available());
    }

    #[test]
    fn test_is_available_respects_status_and_quota() {
        let mut t = TokenRecord::new("t1", "ssoBasic", 10);
        t.status = TokenStatus::Cooling;
        assert!(!t.is_available());

        let t2 = TokenRecord::new("t2", "ssoBasic", 0);
        assert!(!t2.is_available());

        let t3 = TokenRecord::new("t3", "ssoBasic", 1);
        assert!(t3.is_available());
    }

    #[test]
    fn test_consume_low_effort() {
        let mut t = TokenRecord::new("t", "ssoBasic", 10);
        let cost = t.consume(EffortType::Low, &costs());
        assert_eq!(cost, 1);
        assert_eq!(t.quota, 9);
        assert_eq!(t.use_count, 1);
        assert!(t.last_used_at.is_some());
    }

    #[test]
    fn test_consume_high_effort() {
        let mut t = TokenRecord::new("t", "ssoBasic", 10);
        let cost = t.consume(EffortType::High, &costs());
        assert_eq!(cost, 4);
        assert_eq!(t.quota, 6);
    }

    #[test]
    fn test_consume_transitions_to_cooling_on_zero_quota() {
        let mut t = TokenRecord::new("t", "ssoBasic", 1);
        t.consume(EffortType::Low, &costs());
        assert_eq!(t.quota, 0);
        assert_eq!(t.status, TokenStatus::Cooling);
    }

    #[test]
    fn test_consume_caps_at_remaining_quota() {
        let mut t = TokenRecord::new("t", "ssoBasic", 2);
        let cost = t.consume(EffortType::High, &costs());
        assert_eq!(cost, 2);
        assert_eq!(t.quota, 0);
        assert_eq!(t.status, TokenStatus::Cooling);
    }

    #[test]
    fn test_consume_does_not_clear_fail_count() {
        let mut t = TokenRecord::new("t", "ssoBasic", 10);
        t.fail_count = 3;
        t.consume(EffortType::Low, &costs());
        assert_eq!(t.fail_count, 3);
    }

    #[test]
    fn test_consume_keeps_disabled_status() {
        let mut t = TokenRecord::new("t", "ssoBasic", 1);
        t.status = TokenStatus::Disabled;
        t.consume(EffortType::Low, &costs());
        assert_eq!(t.status, TokenStatus::Disabled);
    }

    #[test]
    fn test_record_fail_increments_on_401_and_403() {
        let mut t = TokenRecord::new("t", "ssoBasic", 10);
        t.record_fail(401, "Unauthorized", THRESHOLD);
        assert_eq!(t.fail_count, 1);
        assert_eq!(t.last_fail_reason.as_deref(), Some("Unauthorized"));
        assert_eq!(t.status, TokenStatus::Active);

        t.record_fail(403, "Forbidden", THRESHOLD);
        assert_eq!(t.fail_count, 2);
    }

    #[test]
    fn test_record_fail_ignores_non_auth_status() {
        let mut t = TokenRecord::new("t", "ssoBasic", 10);
        t.record_fail(500, "Server Error", THRESHOLD);
        assert_eq!(t.fail_count, 0);
        assert!(t.last_fail_reason.is_none());
    }

    #[test]
    fn test_record_fail_expires_at_threshold() {
        let mut t = TokenRecord::new("t", "ssoBasic", 10);
        for i in 0..THRESHOLD {
            t.record_fail(401, &format!("fail-{}", i), THRESHOLD);
        }
        assert_eq!(t.status, TokenStatus::Expired);
        assert_eq!(t.fail_count, THRESHOLD);
    }

    #[test]
    fn test_record_fail_expired_overrides_cooling() {
        let mut t = TokenRecord::new("t", "ssoBasic", 10);
        t.status = TokenStatus::Cooling;
        for _ in 0..THRESHOLD {
            t.record_fail(403, "Forbidden", THRESHOLD);
        }
        assert_eq!(t.status, TokenStatus::Expired);
    }

    #[test]
    fn test_record_success_clears_fail_state() {
        let mut t = TokenRecord::new("t", "ssoBasic", 10);
        t.fail_count = 3;
        t.last_fail_at = Some(1);
        t.last_fail_reason = Some("err".to_string());
        t.record_success();
        assert_eq!(t.fail_count, 0);
        assert!(t.last_fail_at.is_none());
        assert!(t.last_fail_reason.is_none());
    }

    #[test]
    fn test_record_success_restores_active_from_expired() {
        let mut t = TokenRecord::new("t", "ssoBasic", 10);
        t.status = TokenStatus::Expired;
        t.record_success();
        assert_eq!(t.status, TokenStatus::Active);
    }

    #[test]
    fn test_record_success_keeps_cooling_if_zero_quota() {
        let mut t = TokenRecord::new("t", "ssoBasic", 0);
        t.status = TokenStatus::Cooling;
        t.record_success();
        assert_eq!(t.status, TokenStatus::Cooling);
    }

    #[test]
    fn test_record_success_never_touches_disabled() {
        let mut t = TokenRecord::new("t", "ssoBasic", 10);
        t.status = TokenStatus::Disabled;
        t.record_success();
        assert_eq!(t.status, TokenStatus::Disabled);
    }

    #[test]
    fn test_update_quota_restores_from_cooling() {
        let mut t = TokenRecord::new("t", "ssoBasic", 0);
        t.status = TokenStatus::Cooling;
        t.update_quota(50);
        assert_eq!(t.quota, 50);
        assert_eq!(t.status, TokenStatus::Active);
    }

    #[test]
    fn test_update_quota_restores_from_expired() {
        let mut t = TokenRecord::new("t", "ssoBasic", 0);
        t.status = TokenStatus::Expired;
        t.update_quota(10);
        assert_eq!(t.status, TokenStatus::Active);
    }

    #[test]
    fn test_update_quota_to_zero_sets_cooling() {
        let mut t = TokenRecord::new("t", "ssoBasic", 50);
        t.update_quota(0);
        assert_eq!(t.quota, 0);
        assert_eq!(t.status, TokenStatus::Cooling);
    }

    #[test]
    fn test_update_quota_negative_clamps_to_zero() {
        let mut t = TokenRecord::new("t", "ssoBasic", 50);
        t.update_quota(-10);
        assert_eq!(t.quota, 0);
        assert_eq!(t.status, TokenStatus::Cooling);
    }

    #[test]
    fn test_update_quota_leaves_disabled_alone() {
        let mut t = TokenRecord::new("t", "ssoBasic", 0);
        t.status = TokenStatus::Disabled;
        t.update_quota(10);
        assert_eq!(t.status, TokenStatus::Disabled);
        assert_eq!(t.quota, 10);
    }

    #[test]
    fn test_reset_restores_defaults() {
        let mut t = TokenRecord::new("t", "ssoBasic", 0);
        t.status = TokenStatus::Expired;
        t.fail_count = 5;
        t.reset(80);
        assert_eq!(t.quota, 80);
        assert_eq!(t.status, TokenStatus::Active);
        assert_eq!(t.fail_count, 0);
    }

    #[test]
    fn test_need_refresh_only_when_cooling() {
        let t = TokenRecord::new("t", "ssoBasic", 10);
        assert!(!t.need_refresh(Duration::from_secs(8 * 3600)));
    }

    #[test]
    fn test_need_refresh_true_when_never_synced() {
        let mut t = TokenRecord::new("t", "ssoBasic", 0);
        t.status = TokenStatus::Cooling;
        assert!(t.need_refresh(Duration::from_secs(8 * 3600)));
    }

    #[test]
    fn test_need_refresh_false_when_recently_synced() {
        let mut t = TokenRecord::new("t", "ssoBasic", 0);
        t.status = TokenStatus::Cooling;
        t.last_sync_at = Some(now_ms());
        assert!(!t.need_refresh(Duration::from_secs(8 * 3600)));
    }

    #[test]
    fn test_status_string_mapping_round_trips() {
        for status in [
            TokenStatus::Active,
            TokenStatus::Cooling,
            TokenStatus::Expired,
            TokenStatus::Disabled,
        ] {
            assert_eq!(TokenStatus::parse(status.as_str()), status);
        }
        assert_eq!(TokenStatus::parse("garbage"), TokenStatus::Disabled);
    }

    #[test]
    fn test_serde_uses_lowercase_status() {
        let t = TokenRecord::new("t", "ssoBasic", 10);
        let json = serde_json::to_string(&t).unwrap();
        assert!(json.contains("\"status\":\"active\""));
        let back: TokenRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, t);
    }
}
