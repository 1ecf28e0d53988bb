//! JSON file persistence: `<dir>/<tier>.json` plus `<dir>/nexus.json`.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::TierPersistence;
use crate::error::{Error, Result};
use crate::memory::{MemoryRecord, NexusPoint, Tier};

const NEXUS_FILE: &str = "nexus.json";

/// Stores each tier as a pretty-printed JSON array.
#[derive(Debug, Clone)]
pub struct JsonFilePersistence {
    dir: PathBuf,
}

impl JsonFilePersistence {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn tier_path(&self, tier: Tier) -> PathBuf {
        self.dir.join(format!("{}.json", tier))
    }

    async fn read<T: DeserializeOwned>(&self, path: &Path) -> Result<Vec<T>> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(Error::persistence_with_source(
                    format!("failed to read {}", path.display()),
                    e,
                ))
            }
        };
        serde_json::from_slice(&bytes).map_err(|e| {
            Error::persistence_with_source(format!("corrupt file {}", path.display()), e)
        })
    }

    /// Write through a temporary file so a failed save leaves the old file intact.
    async fn write<T: Serialize>(&self, path: &Path, items: &[T]) -> Result<()> {
        let json = serde_json::to_vec_pretty(items)?;
        tokio::fs::create_dir_all(&self.dir).await.map_err(|e| {
            Error::persistence_with_source(format!("failed to create {}", self.dir.display()), e)
        })?;

        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await.map_err(|e| {
            Error::persistence_with_source(format!("failed to write {}", tmp.display()), e)
        })?;
        tokio::fs::rename(&tmp, path).await.map_err(|e| {
            Error::persistence_with_source(format!("failed to replace {}", path.display()), e)
        })?;
        debug!(path = %path.display(), count = items.len(), "Saved JSON");
        Ok(())
    }
}

#[async_trait]
impl TierPersistence for JsonFilePersistence {
    async fn load(&self, tier: Tier) -> Result<Vec<MemoryRecord>> {
        self.read(&self.tier_path(tier)).await
    }

    async fn save(&self, tier: Tier, records: &[MemoryRecord]) -> Result<()> {
        self.write(&self.tier_path(tier), records).await
    }

    async fn load_nexus(&self) -> Result<Vec<NexusPoint>> {
        self.read(&self.dir.join(NEXUS_FILE)).await
    }

    async fn save_nexus(&self, points: &[NexusPoint]) -> Result<()> {
        self.write(&self.dir.join(NEXUS_FILE), points).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{RecordId, Reference, Role, SignificanceType};
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    fn record(tier: Tier) -> MemoryRecord {
        MemoryRecord::new(
            RecordId::new(),
            Role::Assistant,
            "The cache is invalidated on deploy",
            9,
            Reference::from_words(["maple", "harbor", "quartz"]),
            Utc::now(),
        )
        .with_tier(tier)
    }

    #[tokio::test]
    async fn test_missing_tier_loads_empty() {
        let dir = TempDir::new().unwrap();
        let store = JsonFilePersistence::new(dir.path());
        assert!(store.load(Tier::LongTerm).await.unwrap().is_empty());
        assert!(store.load_nexus().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_save_and_load_tier() {
        let dir = TempDir::new().unwrap();
        let store = JsonFilePersistence::new(dir.path().join("session"));
        let records = vec![record(Tier::ShortTerm), record(Tier::ShortTerm)];

        store.save(Tier::ShortTerm, &records).await.unwrap();
        assert!(dir.path().join("session/short_term.json").exists());
        assert!(!dir.path().join("session/short_term.json.tmp").exists());

        let loaded = store.load(Tier::ShortTerm).await.unwrap();
        assert_eq!(loaded, records);
    }

    #[tokio::test]
    async fn test_save_and_load_nexus() {
        let dir = TempDir::new().unwrap();
        let store = JsonFilePersistence::new(dir.path());
        let points = vec![NexusPoint {
            id: crate::memory::NexusId::new(),
            record_id: RecordId::new(),
            significance: SignificanceType::System,
            related: BTreeSet::new(),
            created_at: Utc::now(),
            description: "config decision".to_string(),
            automatic: false,
        }];

        store.save_nexus(&points).await.unwrap();
        assert_eq!(store.load_nexus().await.unwrap(), points);
    }

    #[tokio::test]
    async fn test_corrupt_file_is_persistence_failure() {
        let dir = TempDir::new().unwrap();
        tokio::fs::write(dir.path().join("working.json"), b"{not json")
            .await
            .unwrap();
        let store = JsonFilePersistence::new(dir.path());

        let err = store.load(Tier::Working).await.unwrap_err();
        assert!(matches!(err, Error::PersistenceFailure { .. }));
    }
}
