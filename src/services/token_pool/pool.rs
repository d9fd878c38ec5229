//! A single tier's credential pool and its selection logic.

use rand::Rng;
use serde::Serialize;

use super::record::{TokenRecord, TokenStatus};
use super::strategy::SelectionStrategy;

/// All credentials of one tier plus the strategy used to pick among them.
#[derive(Debug, Clone)]
pub struct TokenPool {
    pub name: String,
    pub strategy: SelectionStrategy,
    records: Vec<TokenRecord>,
}

/// Aggregate counters for one pool, safe to expose externally.
#[derive(Debug, Clone, Serialize)]
pub struct TokenPoolStats {
    pub name: String,
    pub total: usize,
    pub active: usize,
    pub cooling: usize,
    pub expired: usize,
    pub disabled: usize,
    pub total_quota: u64,
    pub avg_quota: f64,
    pub total_use_count: u64,
}

impl TokenPool {
    pub fn new(name: impl Into<String>, strategy: SelectionStrategy) -> Self {
        Self {
            name: name.into(),
            strategy,
            records: Vec::new(),
        }
    }

    pub fn with_records(
        name: impl Into<String>,
        strategy: SelectionStrategy,
        records: Vec<TokenRecord>,
    ) -> Self {
        Self {
            name: name.into(),
            strategy,
            records,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[TokenRecord] {
        &self.records
    }

    pub fn get(&self, token: &str) -> Option<&TokenRecord> {
        self.records.iter().find(|r| r.token == token)
    }

    pub fn get_mut(&mut self, token: &str) -> Option<&mut TokenRecord> {
        self.records.iter_mut().find(|r| r.token == token)
    }

    /// Add a record; replaces an existing record with the same token value.
    pub fn upsert(&mut self, record: TokenRecord) {
        match self.records.iter_mut().find(|r| r.token == record.token) {
            Some(existing) => *existing = record,
            None => self.records.push(record),
        }
    }

    /// Remove by token value. Returns the removed record if found.
    pub fn remove(&mut self, token: &str) -> Option<TokenRecord> {
        let idx = self.records.iter().position(|r| r.token == token)?;
        Some(self.records.remove(idx))
    }

    /// Replace the whole record set, keeping name and strategy.
    pub fn replace_records(&mut self, records: Vec<TokenRecord>) {
        self.records = records;
    }

    /// Pick a credential according to the pool's strategy, considering
    /// only available records. Returns `None` when nothing is available.
    pub fn select(&self) -> Option<&TokenRecord> {
        let available: Vec<&TokenRecord> =
            self.records.iter().filter(|r| r.is_available()).collect();
        if available.is_empty() {
            return None;
        }

        let mut rng = rand::thread_rng();
        match self.strategy {
            SelectionStrategy::MaxQuota => {
                // Uniform tie-break among records sharing the top quota so
                // equal credentials wear evenly.
                let max = available.iter().map(|r| r.quota).max()?;
                let top: Vec<&TokenRecord> = available
                    .iter()
                    .copied()
                    .filter(|r| r.quota == max)
                    .collect();
                Some(top[rng.gen_range(0..top.len())])
            }
            SelectionStrategy::Random => Some(available[rng.gen_range(0..available.len())]),
            SelectionStrategy::WeightedRandom => {
                // Weight by remaining quota with a floor of 1 so a nearly
                // drained credential still has a chance.
                let weights: Vec<u64> = available.iter().map(|r| r.quota.max(1)).collect();
                let total: u64 = weights.iter().sum();
                let mut point = rng.gen_range(0..total);
                for (record, weight) in available.iter().copied().zip(&weights) {
                    if point < *weight {
                        return Some(record);
                    }
                    point -= weight;
                }
                available.last().copied()
            }
            SelectionStrategy::Lru => {
                // Never-used records sort oldest; ties break uniformly,
                // same contract as the other strategies.
                let oldest = available
                    .iter()
                    .map(|r| r.last_used_at.unwrap_or(i64::MIN))
                    .min()?;
                let tied: Vec<&TokenRecord> = available
                    .iter()
                    .copied()
                    .filter(|r| r.last_used_at.unwrap_or(i64::MIN) == oldest)
                    .collect();
                Some(tied[rng.gen_range(0..tied.len())])
            }
        }
    }

    /// Aggregate counters, computed in one pass over the records.
    pub fn stats(&self) -> TokenPoolStats {
        let mut stats = TokenPoolStats {
            name: self.name.clone(),
            total: self.records.len(),
            active: 0,
            cooling: 0,
            expired: 0,
            disabled: 0,
            total_quota: 0,
            avg_quota: 0.0,
            total_use_count: 0,
        };
        for record in &self.records {
            match record.status {
                TokenStatus::Active => stats.active += 1,
                TokenStatus::Cooling => stats.cooling += 1,
                TokenStatus::Expired => stats.expired += 1,
                TokenStatus::Disabled => stats.disabled += 1,
            }
            stats.total_quota += record.quota;
            stats.total_use_count += record.use_count;
        }
        if stats.total > 0 {
            stats.avg_quota = stats.total_quota as f64 / stats.total as f64;
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(token: &str, quota: u64) -> TokenRecord {
        TokenRecord::new(token, "ssoBasic", quota)
    }

    fn pool_with(strategy: SelectionStrategy, records: Vec<TokenRecord>) -> TokenPool {
        TokenPool::with_records("ssoBasic", strategy, records)
    }

    #[test]
    fn test_select_empty_pool_returns_none() {
        let pool = pool_with(SelectionStrategy::MaxQuota, vec![]);
        assert!(pool.select().is_none());
    }

    #[test]
    fn test_select_skips_unavailable_records() {
        let mut cooling = record("cooling", 50);
        cooling.status = TokenStatus::Cooling;
        let mut expired = record("expired", 100);
        expired.status = TokenStatus::Expired;
        let pool = pool_with(
            SelectionStrategy::MaxQuota,
            vec![cooling, expired, record("ok", 5)],
        );
        assert_eq!(pool.select().map(|r| r.token.as_str()), Some("ok"));
    }

    #[test]
    fn test_select_all_unavailable_returns_none() {
        let mut a = record("a", 50);
        a.status = TokenStatus::Disabled;
        let b = record("b", 0);
        let pool = pool_with(SelectionStrategy::Random, vec![a, b]);
        assert!(pool.select().is_none());
    }

    #[test]
    fn test_max_quota_picks_highest() {
        let pool = pool_with(
            SelectionStrategy::MaxQuota,
            vec![record("low", 3), record("high", 70), record("mid", 20)],
        );
        assert_eq!(pool.select().map(|r| r.token.as_str()), Some("high"));
    }

    #[test]
    fn test_max_quota_tie_break_covers_all_candidates() {
        let pool = pool_with(
            SelectionStrategy::MaxQuota,
            vec![record("a", 10), record("b", 10), record("c", 1)],
        );
        let mut seen = std::collections::HashSet::new();
        for _ in 0..200 {
            let picked = pool.select().map(|r| r.token.clone()).unwrap();
            assert_ne!(picked, "c");
            seen.insert(picked);
        }
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn test_random_only_picks_available() {
        let mut bad = record("bad", 10);
        bad.status = TokenStatus::Expired;
        let pool = pool_with(SelectionStrategy::Random, vec![bad, record("good", 1)]);
        for _ in 0..50 {
            assert_eq!(pool.select().map(|r| r.token.as_str()), Some("good"));
        }
    }

    #[test]
    fn test_weighted_random_biases_toward_high_quota() {
        let pool = pool_with(
            SelectionStrategy::WeightedRandom,
            vec![record("huge", 1000), record("tiny", 1)],
        );
        let mut huge = 0;
        let mut tiny = 0;
        for _ in 0..200 {
            match pool.select().map(|r| r.token.as_str()) {
                Some("huge") => huge += 1,
                Some("tiny") => tiny += 1,
                other => panic!("unexpected selection: {:?}", other),
            }
        }
        assert!(huge > tiny * 5, "huge={} tiny={}", huge, tiny);
    }

    #[test]
    fn test_weighted_random_treats_zero_quota_weight_as_one() {
        // Availability already excludes quota 0; this covers the floor for
        // mixed low quotas.
        let pool = pool_with(
            SelectionStrategy::WeightedRandom,
            vec![record("a", 1), record("b", 1)],
        );
        assert!(pool.select().is_some());
    }

    #[test]
    fn test_lru_prefers_never_used() {
        let mut used = record("used", 10);
        used.last_used_at = Some(1_700_000_000_000);
        let fresh = record("fresh", 10);
        let pool = pool_with(SelectionStrategy::Lru, vec![used, fresh]);
        assert_eq!(pool.select().map(|r| r.token.as_str()), Some("fresh"));
    }

    #[test]
    fn test_lru_tie_break_covers_all_candidates() {
        let mut a = record("a", 10);
        a.last_used_at = Some(1_000);
        let mut b = record("b", 10);
        b.last_used_at = Some(1_000);
        let mut newer = record("newer", 10);
        newer.last_used_at = Some(2_000);
        let pool = pool_with(SelectionStrategy::Lru, vec![a, b, newer]);

        let mut seen = std::collections::HashSet::new();
        for _ in 0..200 {
            let picked = pool.select().map(|r| r.token.clone()).unwrap();
            assert_ne!(picked, "newer");
            seen.insert(picked);
        }
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn test_lru_picks_oldest_use() {
        let mut older = record("older", 10);
        older.last_used_at = Some(1_000);
        let mut newer = record("newer", 10);
        newer.last_used_at = Some(2_000);
        let pool = pool_with(SelectionStrategy::Lru, vec![newer, older]);
        assert_eq!(pool.select().map(|r| r.token.as_str()), Some("older"));
    }

    #[test]
    fn test_upsert_replaces_existing() {
        let mut pool = pool_with(SelectionStrategy::MaxQuota, vec![record("t", 10)]);
        pool.upsert(record("t", 99));
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.get("t").map(|r| r.quota), Some(99));
    }

    #[test]
    fn test_remove_returns_record() {
        let mut pool = pool_with(SelectionStrategy::MaxQuota, vec![record("t", 10)]);
        assert!(pool.remove("t").is_some());
        assert!(pool.remove("t").is_none());
        assert!(pool.is_empty());
    }

    #[test]
    fn test_stats_counts_by_status() {
        let mut cooling = record("c", 0);
        cooling.status = TokenStatus::Cooling;
        let mut expired = record("e", 5);
        expired.status = TokenStatus::Expired;
        let mut active = record("a", 7);
        active.use_count = 3;
        let pool = pool_with(SelectionStrategy::MaxQuota, vec![cooling, expired, active]);
        let stats = pool.stats();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.active, 1);
        assert_eq!(stats.cooling, 1);
        assert_eq!(stats.expired, 1);
        assert_eq!(stats.disabled, 0);
        assert_eq!(stats.total_quota, 12);
        assert!((stats.avg_quota - 4.0).abs() < f64::EPSILON);
        assert_eq!(stats.total_use_count, 3);
    }
}
