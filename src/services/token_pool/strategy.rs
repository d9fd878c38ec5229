//! Token selection strategies.

use serde::{Deserialize, Serialize};

/// How a pool picks the next credential among the available ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    /// Highest remaining quota wins. The default: spreads load away from
    /// nearly-drained credentials.
    #[default]
    MaxQuota,
    /// Uniform random among available credentials.
    Random,
    /// Random, weighted by remaining quota (minimum weight 1).
    WeightedRandom,
    /// Least recently used; never-used credentials go first.
    Lru,
}

impl SelectionStrategy {
    /// Parse a configuration value. Unknown strings fall back to the
    /// default rather than failing startup.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "max_quota" => SelectionStrategy::MaxQuota,
            "random" => SelectionStrategy::Random,
            "weighted_random" => SelectionStrategy::WeightedRandom,
            "lru" | "least_recent" => SelectionStrategy::Lru,
            _ => SelectionStrategy::default(),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SelectionStrategy::MaxQuota => "max_quota",
            SelectionStrategy::Random => "random",
            SelectionStrategy::WeightedRandom => "weighted_random",
            SelectionStrategy::Lru => "lru",
        }
    }
}

impl std::fmt::Display for SelectionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_known_values() {
        assert_eq!(SelectionStrategy::parse("max_quota"), SelectionStrategy::MaxQuota);
        assert_eq!(SelectionStrategy::parse("random"), SelectionStrategy::Random);
        assert_eq!(
            SelectionStrategy::parse("weighted_random"),
            SelectionStrategy::WeightedRandom
        );
        assert_eq!(SelectionStrategy::parse("lru"), SelectionStrategy::Lru);
        assert_eq!(SelectionStrategy::parse("least_recent"), SelectionStrategy::Lru);
    }

    #[test]
    fn test_parse_is_case_insensitive() {
        assert_eq!(SelectionStrategy::parse("LRU"), SelectionStrategy::Lru);
        assert_eq!(SelectionStrategy::parse(" Random "), SelectionStrategy::Random);
    }

    #[test]
    fn test_parse_unknown_falls_back_to_default() {
        assert_eq!(SelectionStrategy::parse("bogus"), SelectionStrategy::MaxQuota);
        assert_eq!(SelectionStrategy::parse(""), SelectionStrategy::MaxQuota);
    }
}
