//! Persistence contract for tier contents.
//!
//! The manager is agnostic to storage format: a backend loads and saves the
//! records of one tier at a time. Nexus points are optional; backends that
//! don't store them lose protection across restarts.
//!
//! - [`JsonFilePersistence`]: one JSON document per tier in a directory
//! - [`SqlitePersistence`]: a single SQLite database

mod json;
mod schema;
mod sqlite;

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::memory::{MemoryRecord, NexusPoint, Tier};

pub use json::JsonFilePersistence;
pub use schema::{initialize_schema, is_initialized, SCHEMA_VERSION};
pub use sqlite::SqlitePersistence;

/// Load/save collaborator for a session's tiers.
#[async_trait]
pub trait TierPersistence: Send + Sync {
    /// Load every record of `tier`. A tier never saved loads as empty.
    async fn load(&self, tier: Tier) -> Result<Vec<MemoryRecord>>;

    /// Replace the stored contents of `tier`.
    async fn save(&self, tier: Tier, records: &[MemoryRecord]) -> Result<()>;

    async fn load_nexus(&self) -> Result<Vec<NexusPoint>> {
        Ok(Vec::new())
    }

    async fn save_nexus(&self, _points: &[NexusPoint]) -> Result<()> {
        Ok(())
    }
}

/// Run a persistence call, converting a stall into `Error::Timeout`.
pub async fn with_timeout<T, F>(duration: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(duration, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::timeout(duration.as_millis() as u64)),
    }
}
