//! Shared, serialized access to one conversation's memory.
//!
//! A [`MemorySession`] wraps a [`MemoryManager`] in an async read/write lock.
//! Mutations (including `retrieve`, which does access bookkeeping and may
//! promote) take the write lock; statistics and read-only lookups share the
//! read lock. A pass holds the write lock for its whole duration, so readers
//! never observe a tier mid-migration.
//!
//! Persistence calls run outside the lock and under a timeout. A failed load
//! or save leaves the session usable in memory and flags it degraded.

use futures::future::try_join_all;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::error::{Error, Result};
use crate::events::MemoryEvent;
use crate::memory::manager::{MemoryManager, MemorySnapshot};
use crate::memory::nexus::{NexusId, NexusPoint};
use crate::memory::pruning::PassReport;
use crate::memory::search::SearchHit;
use crate::memory::stats::StatsSnapshot;
use crate::memory::types::{MemoryRecord, PoolStats, RecordId, Role, SignificanceType, Tier};
use crate::persistence::{with_timeout, TierPersistence};

/// One conversation's memory, shareable across tasks.
#[derive(Clone)]
pub struct MemorySession {
    manager: Arc<RwLock<MemoryManager>>,
    persistence: Option<Arc<dyn TierPersistence>>,
    timeout: Duration,
    degraded: Arc<AtomicBool>,
}

impl MemorySession {
    /// In-memory session without persistence.
    pub fn new(manager: MemoryManager) -> Self {
        let timeout = manager.config().persistence_timeout();
        Self {
            manager: Arc::new(RwLock::new(manager)),
            persistence: None,
            timeout,
            degraded: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_persistence(mut self, persistence: Arc<dyn TierPersistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Create a session and load its tiers.
    ///
    /// A load failure is logged and flags the session degraded; the session
    /// still starts, empty.
    pub async fn open(manager: MemoryManager, persistence: Arc<dyn TierPersistence>) -> Self {
        let session = Self::new(manager).with_persistence(persistence);
        if let Err(e) = session.load().await {
            error!(error = %e, "Session load failed, continuing in memory");
        }
        session
    }

    /// Whether a persistence call has failed during this session.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    // ==================== Persistence ====================

    /// Load every tier and the nexus points from the persistence collaborator.
    pub async fn load(&self) -> Result<()> {
        let Some(persistence) = self.persistence.clone() else {
            return Ok(());
        };

        let timeout = self.timeout;
        let loads = Tier::ALL.map(|tier| {
            let p = Arc::clone(&persistence);
            async move { with_timeout(timeout, p.load(tier)).await }
        });
        let loaded = try_join_all(loads).await;
        let loaded = match loaded {
            Ok(loaded) => loaded,
            Err(e) => return Err(self.degrade(e).await),
        };
        let points = match with_timeout(self.timeout, persistence.load_nexus()).await {
            Ok(points) => points,
            Err(e) => return Err(self.degrade(e).await),
        };

        let snapshot = MemorySnapshot {
            tiers: Tier::ALL.into_iter().zip(loaded).collect(),
            nexus: points,
        };
        let mut manager = self.manager.write().await;
        let result = manager.restore(snapshot);
        let restored = match result {
            Ok(restored) => restored,
            Err(e) => {
                drop(manager);
                return Err(self.degrade(e).await);
            }
        };
        info!(
            records = Tier::ALL.iter().map(|t| manager.pool_stats(*t).count).sum::<usize>(),
            nexus_points = restored,
            "Session loaded"
        );
        Ok(())
    }

    /// Save every tier and the nexus points, concurrently.
    pub async fn save(&self) -> Result<()> {
        let Some(persistence) = self.persistence.clone() else {
            return Ok(());
        };

        let snapshot = self.manager.read().await.export();

        let timeout = self.timeout;
        let saves = snapshot.tiers.iter().map(|(tier, records)| {
            let p = Arc::clone(&persistence);
            async move { with_timeout(timeout, p.save(*tier, records)).await }
        });
        let result = match try_join_all(saves).await {
            Ok(_) => with_timeout(self.timeout, persistence.save_nexus(&snapshot.nexus)).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                debug!("Session saved");
                Ok(())
            }
            Err(e) => Err(self.degrade(e).await),
        }
    }

    /// Save, then reset the per-session counters.
    pub async fn close(&self) -> Result<()> {
        let saved = self.save().await;
        self.manager.write().await.reset_statistics();
        saved
    }

    async fn degrade(&self, e: Error) -> Error {
        self.degraded.store(true, Ordering::SeqCst);
        error!(error = %e, "Persistence failed, session degraded");
        let manager = self.manager.read().await;
        let now = manager.now();
        manager.emit(MemoryEvent::persistence_degraded(e.to_string(), now));
        e
    }

    // ==================== Mutations (write lock) ====================

    pub async fn ingest(
        &self,
        role: Role,
        content: impl Into<String>,
        metadata: HashMap<String, serde_json::Value>,
    ) -> Result<MemoryRecord> {
        self.manager.write().await.ingest(role, content, metadata)
    }

    pub async fn ingest_batch<I, S>(&self, turns: I) -> Result<Vec<MemoryRecord>>
    where
        I: IntoIterator<Item = (Role, S)>,
        S: Into<String>,
    {
        self.manager.write().await.ingest_batch(turns)
    }

    pub async fn retrieve(&self, key: &str) -> Result<MemoryRecord> {
        self.manager.write().await.retrieve(key)
    }

    /// Keyword search; hits count as accesses, so this takes the write lock.
    pub async fn search(&self, query: &str) -> Result<Vec<SearchHit>> {
        self.manager.write().await.search(query)
    }

    pub async fn lookup_by_words(&self, words: &[&str]) -> Result<Vec<MemoryRecord>> {
        self.manager.write().await.lookup_by_words(words)
    }

    pub async fn promote(&self, id: &RecordId) -> Result<MemoryRecord> {
        self.manager.write().await.promote(id)
    }

    pub async fn mark_significant(
        &self,
        id: &RecordId,
        significance: SignificanceType,
        description: impl Into<String>,
    ) -> Result<NexusPoint> {
        self.manager
            .write()
            .await
            .mark_significant(id, significance, description)
    }

    pub async fn link(&self, a: NexusId, b: NexusId) -> Result<bool> {
        self.manager.write().await.link(a, b)
    }

    pub async fn run_pass(&self) -> Result<PassReport> {
        self.manager.write().await.run_pass()
    }

    pub async fn tick(&self) -> Result<Option<PassReport>> {
        self.manager.write().await.maybe_prune()
    }

    pub async fn purge_stale(&self) -> Result<usize> {
        self.manager.write().await.purge_stale()
    }

    // ==================== Reads (read lock) ====================

    pub async fn stats(&self) -> StatsSnapshot {
        self.manager.read().await.stats()
    }

    pub async fn pool_stats(&self, tier: Tier) -> PoolStats {
        self.manager.read().await.pool_stats(tier)
    }

    /// Read-only lookup; does not count as an access.
    pub async fn lookup(&self, key: &str) -> Result<MemoryRecord> {
        self.manager.read().await.lookup(key).cloned()
    }

    pub async fn is_protected(&self, id: &RecordId) -> bool {
        self.manager.read().await.is_protected(id)
    }

    pub async fn records(&self, tier: Tier) -> Vec<MemoryRecord> {
        self.manager.read().await.records(tier).cloned().collect()
    }

    pub async fn cross_references(&self, id: &RecordId, depth: usize) -> Result<Vec<MemoryRecord>> {
        let manager = self.manager.read().await;
        let related = manager.resolve_cross_references_within(id, depth)?;
        Ok(related.cloned().collect())
    }

    // ==================== Maintenance ====================

    /// Run time-triggered passes every `period` until stopped.
    pub fn spawn_maintenance(&self, period: Duration) -> MaintenanceHandle {
        let (shutdown, mut stop) = watch::channel(false);
        let session = self.clone();

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        match session.tick().await {
                            Ok(Some(report)) => debug!(generation = report.generation, "Maintenance pass ran"),
                            Ok(None) => {}
                            Err(e) => error!(error = %e, "Maintenance pass failed"),
                        }
                    }
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Maintenance loop stopped");
        });

        MaintenanceHandle { shutdown, task }
    }
}

/// Handle to a running maintenance loop.
pub struct MaintenanceHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl MaintenanceHandle {
    /// Signal the loop to stop and wait for it. An in-flight pass completes first.
    pub async fn stop(self) -> Result<()> {
        let _ = self.shutdown.send(true);
        self.task
            .await
            .map_err(|e| Error::Internal(format!("maintenance task failed: {}", e)))
    }
}
