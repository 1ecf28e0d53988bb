//! Tiered conversational memory.
//!
//! Records flow through four tiers as they age:
//!
//! - **Working**: the live context window, bounded by tokens and record count
//! - **ShortTerm**: recent history, mostly compression summaries
//! - **LongTerm**: unbounded, verbatim overflow from short-term
//! - **Stale**: long-term records nobody has touched in a while
//!
//! A pruning pass moves records toward colder tiers, compressing runs of
//! unprotected records into summaries. Records marked significant get a
//! nexus point and are only ever moved verbatim. Every record carries a
//! three-word reference that keeps resolving after it has been merged.
//!
//! ## Example
//!
//! ```rust,ignore
//! use nexus_memory::config::MemoryConfig;
//! use nexus_memory::memory::{MemoryManager, Role, SignificanceType};
//! use std::collections::HashMap;
//!
//! let mut memory = MemoryManager::new(MemoryConfig::default())?;
//!
//! let record = memory.ingest(Role::User, "Deploys happen on Fridays", HashMap::new())?;
//! memory.mark_significant(&record.id, SignificanceType::User, "deploy policy")?;
//!
//! // Later, even after compression
//! let found = memory.retrieve(record.reference.as_str())?;
//! ```

mod manager;
mod nexus;
mod proptest;
mod pruning;
mod reference;
mod search;
mod session;
mod stats;
mod store;
mod summarize;
mod tokens;
mod types;
mod words;

pub use manager::{CrossReferences, MemoryManager, MemoryManagerBuilder, MemorySnapshot};
pub use nexus::{AutoProtected, NexusId, NexusPoint, NexusRegistry, SignificanceCounts};
pub use pruning::{PassAction, PassEnv, PassReport, PassTrigger, PruningEngine};
pub use reference::{Reference, ReferenceCodec};
pub use search::SearchHit;
pub use session::{MaintenanceHandle, MemorySession};
pub use stats::{
    BoundedPool, NexusSnapshot, OperationsSnapshot, PoolsSnapshot, Statistics, StatsSnapshot,
    UnboundedPool,
};
pub use store::{TierStore, Tiers};
pub use summarize::{DigestSummarizer, Summarizer};
pub use tokens::{
    HeuristicTokenCounter, TiktokenCounter, TokenCounter, TokenEncoding, Tokenizer, WordTokenCounter,
};
pub use types::{MemoryRecord, PoolStats, RecordId, Role, SignificanceType, Tier};
pub use words::DEFAULT_WORDS;
