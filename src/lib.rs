//! # nexus-memory
//!
//! Hierarchical memory for long-running LLM conversations.
//!
//! Turns are ingested into a bounded working tier and migrate toward colder
//! tiers as pressure builds, with older runs compressed into summaries.
//! Records can be pinned as nexus points so they survive every pass, and each
//! record gets a memorable three-word reference that stays resolvable after
//! compression.
//!
//! ## Core Components
//!
//! - **Memory**: tiers, references, nexus points, pruning and the manager
//! - **Events**: observable feed of migrations, compressions and failures
//! - **Persistence**: load/save contract with JSON and SQLite backends
//! - **Config**: tier policies and thresholds
//!
//! ## Example
//!
//! ```rust,ignore
//! use nexus_memory::{MemoryConfig, MemoryManager, MemorySession, Role};
//! use std::collections::HashMap;
//!
//! let session = MemorySession::new(MemoryManager::new(MemoryConfig::default())?);
//! let record = session.ingest(Role::User, "Ship it behind a flag", HashMap::new()).await?;
//! println!("remember this as {}", record.reference);
//!
//! let stats = session.stats().await;
//! println!("{}", serde_json::to_string_pretty(&stats)?);
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod memory;
pub mod persistence;

// Re-exports for convenience
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{AutoNexusPolicy, MemoryConfig, SearchPolicy, TierPolicy};
pub use error::{Error, Result};
pub use events::{
    BroadcastEmitter, CollectingEmitter, EventEmitter, MemoryEvent, MemoryEventKind, NullEmitter,
    Severity,
};
pub use memory::{
    MemoryManager, MemoryRecord, MemorySession, MemorySnapshot, NexusId, NexusPoint, RecordId,
    Reference, Role, SearchHit, SignificanceType, StatsSnapshot, Tier, Tokenizer,
};
pub use persistence::{JsonFilePersistence, SqlitePersistence, TierPersistence};
