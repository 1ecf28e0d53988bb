//! Configuration for the memory hierarchy.
//!
//! Every threshold the pruning engine consults lives here. Defaults match the
//! budgets a chat agent typically runs with (an 8K working window backed by a
//! 128K short-term pool); tests usually shrink them with the `with_*` builders.

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::memory::Tokenizer;

/// Per-tier pruning policy for the two bounded tiers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierPolicy {
    /// Hard token capacity of the tier
    pub capacity_tokens: u64,
    /// Record count that fires a pass (None = no count trigger)
    pub max_records: Option<usize>,
    /// Seconds since the last pass that fire a pass (None = capacity only)
    pub time_threshold_secs: Option<u64>,
    /// Most recent records kept verbatim by a pass
    pub preserve_count: usize,
    /// Contiguous records merged per summary (None = all candidates at once)
    pub compression_batch: Option<usize>,
}

impl TierPolicy {
    /// Policy for the working tier.
    pub fn working() -> Self {
        Self {
            capacity_tokens: 8192,
            max_records: Some(50),
            time_threshold_secs: Some(3600),
            preserve_count: 10,
            compression_batch: None,
        }
    }

    /// Policy for the short-term tier: capacity-only trigger.
    pub fn short_term() -> Self {
        Self {
            capacity_tokens: 128_000,
            max_records: None,
            time_threshold_secs: None,
            preserve_count: 10,
            compression_batch: None,
        }
    }

    /// Time threshold as a chrono duration.
    pub fn time_threshold(&self) -> Option<Duration> {
        self.time_threshold_secs.map(|s| Duration::seconds(s as i64))
    }
}

/// Automatic nexus status from access-based importance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoNexusPolicy {
    /// Importance at or above which a record is protected
    pub threshold: f64,
    /// Windowed accesses at which the frequency term saturates
    pub min_access_count: u32,
    /// Cap on automatic points; explicit marks do not count
    pub max_points: usize,
}

impl Default for AutoNexusPolicy {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            min_access_count: 5,
            max_points: 100,
        }
    }
}

/// Keyword search tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchPolicy {
    /// Hits scoring below this are dropped
    pub min_score: f64,
    pub max_results: usize,
    /// Whether stale records are searched
    pub include_stale: bool,
}

impl Default for SearchPolicy {
    fn default() -> Self {
        Self {
            min_score: 0.3,
            max_results: 10,
            include_stale: true,
        }
    }
}

/// Top-level configuration for a [`MemoryManager`](crate::memory::MemoryManager).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Working tier policy
    pub working: TierPolicy,
    /// Short-term tier policy
    pub short_term: TierPolicy,
    /// Idle seconds after which unprotected long-term records go stale
    pub stale_after_secs: u64,
    /// Prior accesses within the window that trigger auto-promotion
    pub promotion_threshold: u32,
    /// Rolling window for access counting, in seconds
    pub promotion_window_secs: u64,
    /// Seed perturbations tried before giving up on a reference
    pub reference_max_attempts: u32,
    /// Upper bound for cross-reference traversal depth
    pub max_traversal_depth: usize,
    /// Timeout for each persistence call, in milliseconds
    pub persistence_timeout_ms: u64,
    /// Buffer size of the broadcast event channel
    pub event_channel_capacity: usize,
    /// Token counter built when none is injected
    pub tokenizer: Tokenizer,
    pub search: SearchPolicy,
    /// None disables automatic nexus points
    pub auto_nexus: Option<AutoNexusPolicy>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            working: TierPolicy::working(),
            short_term: TierPolicy::short_term(),
            stale_after_secs: 30 * 24 * 3600,
            promotion_threshold: 3,
            promotion_window_secs: 3600,
            reference_max_attempts: 32,
            max_traversal_depth: 4,
            persistence_timeout_ms: 5000,
            event_channel_capacity: 256,
            tokenizer: Tokenizer::Heuristic,
            search: SearchPolicy::default(),
            auto_nexus: None,
        }
    }
}

impl MemoryConfig {
    /// Small budgets for tests and demos: 512-token working window, 2K short-term.
    pub fn compact() -> Self {
        Self {
            working: TierPolicy {
                capacity_tokens: 512,
                max_records: Some(8),
                time_threshold_secs: None,
                preserve_count: 2,
                compression_batch: None,
            },
            short_term: TierPolicy {
                capacity_tokens: 2048,
                preserve_count: 2,
                ..TierPolicy::short_term()
            },
            ..Self::default()
        }
    }

    /// Parse a configuration from JSON; absent fields keep their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for values the engine cannot honor.
    pub fn validate(&self) -> Result<()> {
        for (name, policy) in [("working", &self.working), ("short_term", &self.short_term)] {
            if policy.capacity_tokens == 0 {
                return Err(Error::Config(format!("{} capacity must be positive", name)));
            }
            if policy.compression_batch == Some(0) {
                return Err(Error::Config(format!(
                    "{} compression batch must be positive",
                    name
                )));
            }
        }
        if !(0.0..=1.0).contains(&self.search.min_score) {
            return Err(Error::Config("search min_score must be within [0, 1]".to_string()));
        }
        if let Some(policy) = &self.auto_nexus {
            if !(0.0..=1.0).contains(&policy.threshold) {
                return Err(Error::Config(
                    "auto_nexus threshold must be within [0, 1]".to_string(),
                ));
            }
        }
        if self.reference_max_attempts == 0 {
            return Err(Error::Config(
                "reference_max_attempts must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Set the working tier token capacity.
    pub fn with_working_capacity(mut self, tokens: u64) -> Self {
        self.working.capacity_tokens = tokens;
        self
    }

    /// Set the working tier record-count trigger.
    pub fn with_max_working_records(mut self, max: Option<usize>) -> Self {
        self.working.max_records = max;
        self
    }

    /// Set the working tier time trigger.
    pub fn with_time_threshold_secs(mut self, secs: Option<u64>) -> Self {
        self.working.time_threshold_secs = secs;
        self
    }

    /// Set the preserve window for both bounded tiers.
    pub fn with_preserve_count(mut self, count: usize) -> Self {
        self.working.preserve_count = count;
        self.short_term.preserve_count = count;
        self
    }

    /// Set the working tier compression batch size.
    pub fn with_compression_batch(mut self, batch: Option<usize>) -> Self {
        self.working.compression_batch = batch;
        self
    }

    /// Set the short-term tier token capacity.
    pub fn with_short_term_capacity(mut self, tokens: u64) -> Self {
        self.short_term.capacity_tokens = tokens;
        self
    }

    /// Set the long-term staleness horizon.
    pub fn with_stale_after(mut self, after: Duration) -> Self {
        self.stale_after_secs = after.num_seconds().max(0) as u64;
        self
    }

    /// Set the auto-promotion threshold.
    pub fn with_promotion_threshold(mut self, threshold: u32) -> Self {
        self.promotion_threshold = threshold;
        self
    }

    /// Set the reference retry budget.
    pub fn with_reference_max_attempts(mut self, attempts: u32) -> Self {
        self.reference_max_attempts = attempts;
        self
    }

    /// Set the persistence timeout.
    pub fn with_persistence_timeout_ms(mut self, ms: u64) -> Self {
        self.persistence_timeout_ms = ms;
        self
    }

    pub fn with_event_channel_capacity(mut self, capacity: usize) -> Self {
        self.event_channel_capacity = capacity;
        self
    }

    /// Set the default token counter.
    pub fn with_tokenizer(mut self, tokenizer: Tokenizer) -> Self {
        self.tokenizer = tokenizer;
        self
    }

    pub fn with_search(mut self, search: SearchPolicy) -> Self {
        self.search = search;
        self
    }

    /// Enable automatic nexus points.
    pub fn with_auto_nexus(mut self, policy: AutoNexusPolicy) -> Self {
        self.auto_nexus = Some(policy);
        self
    }

    pub fn stale_after(&self) -> Duration {
        Duration::seconds(self.stale_after_secs as i64)
    }

    pub fn promotion_window(&self) -> Duration {
        Duration::seconds(self.promotion_window_secs as i64)
    }

    pub fn persistence_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.persistence_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let config = MemoryConfig::default();
        assert_eq!(config.working.capacity_tokens, 8192);
        assert_eq!(config.working.max_records, Some(50));
        assert_eq!(config.working.time_threshold_secs, Some(3600));
        assert_eq!(config.working.preserve_count, 10);
        assert_eq!(config.short_term.capacity_tokens, 128_000);
        assert_eq!(config.short_term.time_threshold_secs, None);
        assert_eq!(config.stale_after(), Duration::days(30));
        assert_eq!(config.promotion_threshold, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = MemoryConfig::from_json_str(r#"{"promotion_threshold": 5}"#).unwrap();
        assert_eq!(config.promotion_threshold, 5);
        assert_eq!(config.working, TierPolicy::working());
    }

    #[test]
    fn test_tokenizer_from_json() {
        let config = MemoryConfig::from_json_str(r#"{"tokenizer": {"tiktoken": "cl100k_base"}}"#).unwrap();
        assert_eq!(
            config.tokenizer,
            Tokenizer::Tiktoken(crate::memory::TokenEncoding::Cl100kBase)
        );
        assert_eq!(MemoryConfig::default().tokenizer, Tokenizer::Heuristic);
    }

    #[test]
    fn test_validation_rejects_zero_capacity() {
        let config = MemoryConfig::default().with_working_capacity(0);
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let config = MemoryConfig::default().with_compression_batch(Some(0));
        assert!(config.validate().is_err());

        let config = MemoryConfig::default().with_auto_nexus(AutoNexusPolicy {
            threshold: 1.5,
            ..AutoNexusPolicy::default()
        });
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_auto_nexus_from_json() {
        let config = MemoryConfig::from_json_str(r#"{"auto_nexus": {"max_points": 3}}"#).unwrap();
        let policy = config.auto_nexus.unwrap();
        assert_eq!(policy.max_points, 3);
        assert_eq!(policy.min_access_count, 5);
        assert_eq!(MemoryConfig::default().auto_nexus, None);
        assert_eq!(MemoryConfig::default().search.max_results, 10);
    }

    #[test]
    fn test_builders() {
        let config = MemoryConfig::compact()
            .with_preserve_count(4)
            .with_stale_after(Duration::days(7));
        assert_eq!(config.working.preserve_count, 4);
        assert_eq!(config.short_term.preserve_count, 4);
        assert_eq!(config.stale_after_secs, 7 * 24 * 3600);
    }
}
