//! Core types for the memory hierarchy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::Error;
use crate::memory::reference::Reference;

/// Unique identifier for a memory record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub Uuid);

impl RecordId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RecordId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| Error::not_found(s.to_string()))
    }
}

/// Memory tier, ordered from highest to lowest retrieval priority.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Verbatim recent turns, bounded by the working budget
    #[default]
    Working = 0,
    /// Summaries and relocated protected turns
    ShortTerm = 1,
    /// Overflow from short-term, unbounded
    LongTerm = 2,
    /// Idle long-term records awaiting explicit purge
    Stale = 3,
}

impl Tier {
    pub const ALL: [Tier; 4] = [Tier::Working, Tier::ShortTerm, Tier::LongTerm, Tier::Stale];

    /// Position in the hierarchy.
    pub fn index(self) -> usize {
        self as usize
    }

    /// Tier a pass migrates into.
    pub fn next(self) -> Option<Tier> {
        match self {
            Tier::Working => Some(Tier::ShortTerm),
            Tier::ShortTerm => Some(Tier::LongTerm),
            Tier::LongTerm => Some(Tier::Stale),
            Tier::Stale => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Working => "working",
            Tier::ShortTerm => "short_term",
            Tier::LongTerm => "long_term",
            Tier::Stale => "stale",
        }
    }

    /// Whether a promotion may pull records out of this tier.
    pub fn is_promotable(self) -> bool {
        matches!(self, Tier::LongTerm | Tier::Stale)
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "working" => Ok(Tier::Working),
            "short_term" => Ok(Tier::ShortTerm),
            "long_term" => Ok(Tier::LongTerm),
            "stale" => Ok(Tier::Stale),
            other => Err(Error::Internal(format!("unknown tier: {}", other))),
        }
    }
}

/// Author of a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        };
        f.write_str(s)
    }
}

/// Who flagged a record as significant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignificanceType {
    User,
    Llm,
    System,
}

impl fmt::Display for SignificanceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SignificanceType::User => "user",
            SignificanceType::Llm => "llm",
            SignificanceType::System => "system",
        };
        f.write_str(s)
    }
}

/// One conversation turn or summary held by the hierarchy.
///
/// Content and token count never change after creation; compression produces
/// a new record instead of editing an existing one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: RecordId,
    pub role: Role,
    pub content: String,
    pub tier: Tier,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub access_count: u64,
    pub token_count: u64,
    pub reference: Reference,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
    /// References of the records merged into this summary
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub derived_from: Vec<Reference>,
}

impl MemoryRecord {
    /// Create a working-tier record.
    pub fn new(
        id: RecordId,
        role: Role,
        content: impl Into<String>,
        token_count: u64,
        reference: Reference,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            role,
            content: content.into(),
            tier: Tier::Working,
            created_at: now,
            last_accessed_at: now,
            access_count: 0,
            token_count,
            reference,
            metadata: HashMap::new(),
            derived_from: Vec::new(),
        }
    }

    pub fn with_tier(mut self, tier: Tier) -> Self {
        self.tier = tier;
        self
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_derived_from(mut self, references: Vec<Reference>) -> Self {
        self.derived_from = references;
        self
    }

    /// Whether this record was produced by compression.
    pub fn is_summary(&self) -> bool {
        !self.derived_from.is_empty()
    }

    /// Access bookkeeping on a successful retrieval.
    pub fn record_access(&mut self, now: DateTime<Utc>) {
        self.access_count += 1;
        self.last_accessed_at = now;
    }
}

/// Aggregate for one tier.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PoolStats {
    pub size_tokens: u64,
    pub count: usize,
    pub capacity_tokens: Option<u64>,
}

impl PoolStats {
    /// `size / capacity`, or None for unbounded tiers.
    pub fn utilization(&self) -> Option<f64> {
        self.capacity_tokens
            .map(|cap| self.size_tokens as f64 / cap.max(1) as f64)
    }

    pub fn over_capacity(&self) -> bool {
        self.capacity_tokens
            .map(|cap| self.size_tokens > cap)
            .unwrap_or(false)
    }
}
