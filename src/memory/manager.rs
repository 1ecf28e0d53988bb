//! MemoryManager: the public façade over tiers, nexus points and references.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::{MemoryConfig, SearchPolicy};
use crate::error::{Error, Result};
use crate::events::{EventEmitter, MemoryEvent, NullEmitter};
use crate::memory::nexus::{NexusId, NexusPoint, NexusRegistry};
use crate::memory::pruning::{PassAction, PassEnv, PassReport, PassTrigger, PruningEngine};
use crate::memory::reference::ReferenceCodec;
use crate::memory::search::{self, Query, SearchHit};
use crate::memory::stats::{Statistics, StatsSnapshot};
use crate::memory::store::Tiers;
use crate::memory::summarize::{DigestSummarizer, Summarizer};
use crate::memory::tokens::TokenCounter;
use crate::memory::types::{MemoryRecord, PoolStats, RecordId, Role, SignificanceType, Tier};

/// Builder for [`MemoryManager`].
pub struct MemoryManagerBuilder {
    config: MemoryConfig,
    clock: Arc<dyn Clock>,
    counter: Option<Arc<dyn TokenCounter>>,
    summarizer: Arc<dyn Summarizer>,
    emitter: Arc<dyn EventEmitter>,
    words: Option<Vec<String>>,
}

impl MemoryManagerBuilder {
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_token_counter(mut self, counter: Arc<dyn TokenCounter>) -> Self {
        self.counter = Some(counter);
        self
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = summarizer;
        self
    }

    pub fn with_emitter(mut self, emitter: Arc<dyn EventEmitter>) -> Self {
        self.emitter = emitter;
        self
    }

    /// Replace the built-in reference word list.
    pub fn with_words<I, S>(mut self, words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.words = Some(words.into_iter().map(Into::into).collect());
        self
    }

    pub fn build(self) -> Result<MemoryManager> {
        self.config.validate()?;
        let codec = match self.words {
            Some(words) => ReferenceCodec::new(words, self.config.reference_max_attempts)?,
            None => ReferenceCodec::with_default_words(self.config.reference_max_attempts)?,
        };
        let counter = match self.counter {
            Some(counter) => counter,
            None => self.config.tokenizer.counter()?,
        };
        let now = self.clock.now();

        Ok(MemoryManager {
            tiers: Tiers::new(
                self.config.working.capacity_tokens,
                self.config.short_term.capacity_tokens,
            ),
            nexus: NexusRegistry::new(
                self.config.promotion_window(),
                self.config.max_traversal_depth,
            ),
            codec,
            engine: PruningEngine::new(&self.config, self.summarizer, counter.clone(), now),
            stats: Statistics::new(),
            config: self.config,
            clock: self.clock,
            counter,
            emitter: self.emitter,
        })
    }
}

/// Tiered memory for one conversation.
///
/// All mutation goes through `&mut self`; wrap the manager in a
/// [`MemorySession`](crate::memory::MemorySession) to share it across tasks.
pub struct MemoryManager {
    config: MemoryConfig,
    clock: Arc<dyn Clock>,
    counter: Arc<dyn TokenCounter>,
    tiers: Tiers,
    nexus: NexusRegistry,
    codec: ReferenceCodec,
    engine: PruningEngine,
    stats: Statistics,
    emitter: Arc<dyn EventEmitter>,
}

impl MemoryManager {
    /// Create a manager with default collaborators.
    pub fn new(config: MemoryConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    pub fn builder(config: MemoryConfig) -> MemoryManagerBuilder {
        MemoryManagerBuilder {
            config,
            clock: Arc::new(SystemClock),
            counter: None,
            summarizer: Arc::new(DigestSummarizer::default()),
            emitter: Arc::new(NullEmitter),
            words: None,
        }
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    // ==================== Ingestion ====================

    /// Add a turn to working memory, then run a pass if any threshold is exceeded.
    ///
    /// Returns the record as created. When the triggered pass fails the record
    /// still exists and the error is returned.
    pub fn ingest(
        &mut self,
        role: Role,
        content: impl Into<String>,
        metadata: HashMap<String, Value>,
    ) -> Result<MemoryRecord> {
        let record = self.append(role, content.into(), metadata)?;
        self.maybe_prune()?;
        Ok(record)
    }

    /// Add several turns, then run at most one pass.
    ///
    /// Stops at the first failed turn; turns appended before it are kept.
    pub fn ingest_batch<I, S>(&mut self, turns: I) -> Result<Vec<MemoryRecord>>
    where
        I: IntoIterator<Item = (Role, S)>,
        S: Into<String>,
    {
        let mut created = Vec::new();
        let mut failure = None;
        for (role, content) in turns {
            match self.append(role, content.into(), HashMap::new()) {
                Ok(record) => created.push(record),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        self.maybe_prune()?;
        match failure {
            Some(e) => Err(e),
            None => Ok(created),
        }
    }

    fn append(
        &mut self,
        role: Role,
        content: String,
        metadata: HashMap<String, Value>,
    ) -> Result<MemoryRecord> {
        let now = self.clock.now();
        let id = RecordId::new();
        let tokens = self.counter.count(&content);
        let reference = self.codec.reserve(&id)?;

        let record = MemoryRecord::new(id, role, content, tokens, reference.clone(), now)
            .with_metadata(metadata);
        if let Err(e) = self.tiers.insert(record.clone()) {
            self.codec.release(&reference);
            return Err(e);
        }
        self.codec.bind(reference.clone(), id);

        debug!(record_id = %id, %reference, tokens, %role, "Record ingested");
        self.emitter
            .emit(MemoryEvent::record_added(reference, tokens, now));
        Ok(record)
    }

    // ==================== Pruning ====================

    /// Run a pass if a threshold is exceeded. Timer entry point.
    pub fn maybe_prune(&mut self) -> Result<Option<PassReport>> {
        let now = self.clock.now();
        match self.engine.needs_pass(&self.tiers, now) {
            Some(trigger) => self.execute_pass(trigger, now).map(Some),
            None => Ok(None),
        }
    }

    /// Run a pass regardless of thresholds.
    pub fn run_pass(&mut self) -> Result<PassReport> {
        let now = self.clock.now();
        let trigger = self
            .engine
            .needs_pass(&self.tiers, now)
            .unwrap_or(PassTrigger::Forced);
        self.execute_pass(trigger, now)
    }

    fn execute_pass(&mut self, trigger: PassTrigger, now: DateTime<Utc>) -> Result<PassReport> {
        let mut env = PassEnv {
            tiers: &mut self.tiers,
            nexus: &mut self.nexus,
            codec: &mut self.codec,
        };
        let report = self.engine.run_pass(&mut env, trigger, now)?;
        self.stats.apply_pass(&report);
        self.emit_pass(&report, now);

        if let Err(e) = self.engine.verify_capacity(&self.tiers) {
            if let Error::CapacityViolation { tier, .. } = &e {
                self.emit(MemoryEvent::capacity_violation(*tier, e.to_string(), now));
            }
            return Err(e);
        }
        Ok(report)
    }

    fn emit_pass(&self, report: &PassReport, now: DateTime<Utc>) {
        for action in &report.actions {
            let event = match action {
                PassAction::Moved {
                    reference, from, to, ..
                } => MemoryEvent::record_moved(reference.clone(), *from, *to, now),
                PassAction::Compressed {
                    reference,
                    originals,
                    original_tokens,
                    summary_tokens,
                    ..
                } => MemoryEvent::compression_executed(
                    reference.clone(),
                    originals.len(),
                    *original_tokens,
                    *summary_tokens,
                    now,
                ),
            };
            self.emitter.emit(event);
        }
    }

    /// Remove every unprotected stale record. Returns how many were removed.
    pub fn purge_stale(&mut self) -> Result<usize> {
        let purgeable: Vec<RecordId> = self
            .tiers
            .store(Tier::Stale)
            .all()
            .filter(|r| self.nexus.demote_candidate(&r.id))
            .map(|r| r.id)
            .collect();

        for id in &purgeable {
            let record = self.tiers.remove(id)?;
            self.codec.retire(&record.reference);
            for r in &record.derived_from {
                self.codec.retire(r);
            }
            self.nexus.reset_access(id);
        }

        if !purgeable.is_empty() {
            warn!(count = purgeable.len(), "Purged stale records");
            self.emitter
                .emit(MemoryEvent::records_purged(purgeable.len(), self.clock.now()));
        }
        Ok(purgeable.len())
    }

    // ==================== Retrieval ====================

    /// Retrieve by three-word reference or record id, with access bookkeeping.
    ///
    /// A long-term or stale record that already had `promotion_threshold`
    /// accesses within the promotion window is promoted to short-term.
    pub fn retrieve(&mut self, key: &str) -> Result<MemoryRecord> {
        let id = self.resolve_key(key)?;
        self.retrieve_by_id(&id)
    }

    pub fn retrieve_by_id(&mut self, id: &RecordId) -> Result<MemoryRecord> {
        let started = Instant::now();
        let now = self.clock.now();
        self.track_access(id, now)?;
        self.stats
            .record_retrieval(started.elapsed().as_secs_f64() * 1000.0);
        self.tiers.get(id).cloned()
    }

    /// Access bookkeeping shared by every retrieval path.
    fn track_access(&mut self, id: &RecordId, now: DateTime<Utc>) -> Result<()> {
        let tier = self
            .tiers
            .locate(id)
            .ok_or_else(|| Error::not_found(id.to_string()))?;

        let prior = self.nexus.recent_accesses(id, now);
        self.tiers.get_mut(id)?.record_access(now);

        if tier.is_promotable() && prior >= self.config.promotion_threshold as usize {
            debug!(record_id = %id, prior, "Access threshold reached, promoting");
            self.promote_to_short_term(id, tier, now)?;
        } else {
            self.nexus.register_access(*id, now);
        }
        self.evaluate_importance(id, now)
    }

    /// Search every tier for `query` with the configured policy.
    pub fn search(&mut self, query: &str) -> Result<Vec<SearchHit>> {
        let policy = self.config.search.clone();
        self.search_with(query, &policy)
    }

    /// Keyword search, best first. Each hit counts as an access.
    #[instrument(skip(self, policy))]
    pub fn search_with(&mut self, query: &str, policy: &SearchPolicy) -> Result<Vec<SearchHit>> {
        let started = Instant::now();
        let now = self.clock.now();
        let parsed = Query::parse(query)?;

        let mut scored: Vec<(RecordId, f64)> = Tier::ALL
            .into_iter()
            .filter(|tier| policy.include_stale || *tier != Tier::Stale)
            .flat_map(|tier| self.tiers.store(tier).all())
            .filter_map(|r| {
                parsed
                    .score(r, self.nexus.is_protected(&r.id), now)
                    .map(|score| (r.id, score))
            })
            .filter(|(_, score)| *score >= policy.min_score)
            .collect();
        // Stable: ties keep warmer tiers first
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        scored.truncate(policy.max_results);

        let mut hits = Vec::with_capacity(scored.len());
        for (id, score) in scored {
            self.track_access(&id, now)?;
            hits.push(SearchHit {
                record: self.tiers.get(&id)?.clone(),
                score,
            });
        }

        self.stats
            .record_retrieval(started.elapsed().as_secs_f64() * 1000.0);
        debug!(terms = parsed.terms(), hits = hits.len(), "Search complete");
        Ok(hits)
    }

    /// Records whose reference (or a reference merged into them) contains
    /// every fragment within one of its words. Each match counts as an access.
    pub fn lookup_by_words(&mut self, words: &[&str]) -> Result<Vec<MemoryRecord>> {
        let fragments = search::fragments(words)?;
        let now = self.clock.now();

        let matched: Vec<RecordId> = Tier::ALL
            .into_iter()
            .flat_map(|tier| self.tiers.store(tier).all())
            .filter(|r| search::matches_reference(r, &fragments))
            .map(|r| r.id)
            .collect();

        let mut records = Vec::with_capacity(matched.len());
        for id in matched {
            self.track_access(&id, now)?;
            records.push(self.tiers.get(&id)?.clone());
        }
        Ok(records)
    }

    /// Read-only lookup without access bookkeeping.
    pub fn lookup(&self, key: &str) -> Result<&MemoryRecord> {
        let id = self.resolve_key(key)?;
        self.tiers.get(&id)
    }

    fn resolve_key(&self, key: &str) -> Result<RecordId> {
        if let Ok(id) = key.parse::<RecordId>() {
            if self.tiers.locate(&id).is_some() {
                return Ok(id);
            }
        }
        self.codec.resolve(key)
    }

    // ==================== Promotion ====================

    /// Move a record back to short-term.
    ///
    /// Records already in working or short-term stay where they are; their
    /// access window is reset either way.
    pub fn promote(&mut self, id: &RecordId) -> Result<MemoryRecord> {
        let now = self.clock.now();
        let tier = self
            .tiers
            .locate(id)
            .ok_or_else(|| Error::not_found(id.to_string()))?;

        if tier.is_promotable() {
            self.promote_to_short_term(id, tier, now)?;
        } else {
            self.nexus.reset_access(id);
        }
        self.tiers.get(id).cloned()
    }

    fn promote_to_short_term(
        &mut self,
        id: &RecordId,
        from: Tier,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.tiers.relocate(id, Tier::ShortTerm)?;
        self.nexus.reset_access(id);
        self.stats.promotions += 1;

        let reference = self.tiers.get(id)?.reference.clone();
        info!(record_id = %id, %from, %reference, "Record promoted to short_term");
        self.emitter.emit(MemoryEvent::record_promoted(
            reference,
            from,
            Tier::ShortTerm,
            now,
        ));
        Ok(())
    }

    // ==================== Nexus points ====================

    /// Protect a record from eviction and compression.
    pub fn mark_significant(
        &mut self,
        id: &RecordId,
        significance: SignificanceType,
        description: impl Into<String>,
    ) -> Result<NexusPoint> {
        let reference = self.tiers.get(id)?.reference.clone();
        let description = description.into();
        let now = self.clock.now();

        let point = self.nexus.protect(*id, significance, description.clone(), now)?;
        self.emitter
            .emit(MemoryEvent::nexus_created(reference, &description, now));
        Ok(point)
    }

    /// Grant or rotate an automatic nexus point after an access.
    fn evaluate_importance(&mut self, id: &RecordId, now: DateTime<Utc>) -> Result<()> {
        let Some(policy) = self.config.auto_nexus.as_ref() else {
            return Ok(());
        };
        let Some(outcome) = self.nexus.auto_protect(*id, policy, now) else {
            return Ok(());
        };

        if let Some(evicted) = &outcome.evicted {
            if let Ok(record) = self.tiers.get(&evicted.record_id) {
                info!(record_id = %evicted.record_id, "Automatic nexus point released");
                self.emitter
                    .emit(MemoryEvent::nexus_released(record.reference.clone(), now));
            }
        }
        let reference = self.tiers.get(id)?.reference.clone();
        info!(record_id = %id, importance = outcome.importance, "Automatic nexus point created");
        self.emitter.emit(MemoryEvent::nexus_created(
            reference,
            &outcome.point.description,
            now,
        ));
        Ok(())
    }

    /// Link two nexus points. Returns false if they were already linked.
    pub fn link(&mut self, a: NexusId, b: NexusId) -> Result<bool> {
        self.nexus.link(a, b)
    }

    /// Link the nexus points of two protected records.
    pub fn link_records(&mut self, a: &RecordId, b: &RecordId) -> Result<bool> {
        let point_of = |id: &RecordId| {
            self.nexus
                .point_for_record(id)
                .map(|p| p.id)
                .ok_or_else(|| Error::not_found(format!("nexus point for record {}", id)))
        };
        let (a, b) = (point_of(a)?, point_of(b)?);
        self.nexus.link(a, b)
    }

    pub fn nexus_point(&self, id: &RecordId) -> Option<&NexusPoint> {
        self.nexus.point_for_record(id)
    }

    pub fn is_protected(&self, id: &RecordId) -> bool {
        self.nexus.is_protected(id)
    }

    /// Records one hop away from `id` through nexus links.
    pub fn resolve_cross_references(&self, id: &RecordId) -> Result<CrossReferences<'_>> {
        self.resolve_cross_references_within(id, 1)
    }

    /// Records up to `depth` hops away, clamped to `max_traversal_depth`.
    pub fn resolve_cross_references_within(
        &self,
        id: &RecordId,
        depth: usize,
    ) -> Result<CrossReferences<'_>> {
        self.tiers.get(id)?;
        let points = match self.nexus.point_for_record(id) {
            Some(point) => self.nexus.related_points(point.id, depth)?,
            None => Vec::new(),
        };
        Ok(CrossReferences {
            manager: self,
            points,
            pos: 0,
        })
    }

    // ==================== Statistics ====================

    pub fn stats(&self) -> StatsSnapshot {
        StatsSnapshot::build(
            &self.stats,
            self.pool_stats(Tier::Working),
            self.pool_stats(Tier::ShortTerm),
            self.pool_stats(Tier::LongTerm),
            self.nexus.counts(),
        )
    }

    pub fn pool_stats(&self, tier: Tier) -> PoolStats {
        self.tiers.store(tier).pool_stats()
    }

    /// Records of a tier in insertion order.
    pub fn records(&self, tier: Tier) -> impl Iterator<Item = &MemoryRecord> + '_ {
        self.tiers.store(tier).all()
    }

    /// Zero every counter. Called on session teardown.
    pub fn reset_statistics(&mut self) {
        self.stats.reset();
        self.engine.reset(self.clock.now());
    }

    // ==================== Persistence support ====================

    pub fn export_tier(&self, tier: Tier) -> Vec<MemoryRecord> {
        self.tiers.store(tier).snapshot()
    }

    pub fn export_nexus(&self) -> Vec<NexusPoint> {
        let mut points: Vec<_> = self.nexus.points().cloned().collect();
        points.sort_by_key(|p| p.created_at);
        points
    }

    /// Every tier and nexus point, as handed to persistence.
    pub fn export(&self) -> MemorySnapshot {
        MemorySnapshot {
            tiers: Tier::ALL
                .into_iter()
                .map(|tier| (tier, self.export_tier(tier)))
                .collect(),
            nexus: self.export_nexus(),
        }
    }

    /// Replace all tiers and nexus points with `snapshot`.
    ///
    /// The new state is built aside and swapped in only once every record,
    /// reference and point has been accepted; on error the manager is left
    /// as it was. Points whose record is not in the snapshot are dropped.
    /// Returns the number of nexus points restored.
    pub fn restore(&mut self, snapshot: MemorySnapshot) -> Result<usize> {
        let mut tiers = Tiers::new(
            self.config.working.capacity_tokens,
            self.config.short_term.capacity_tokens,
        );
        let mut codec = self.codec.unbound();
        let mut nexus = NexusRegistry::new(
            self.config.promotion_window(),
            self.config.max_traversal_depth,
        );

        for (tier, records) in snapshot.tiers {
            for mut record in records {
                record.tier = tier;
                let (id, reference) = (record.id, record.reference.clone());
                let derived = record.derived_from.clone();
                tiers.insert(record)?;
                codec.restore(reference, id)?;
                for r in derived {
                    codec.restore(r, id)?;
                }
            }
        }

        let mut restored = 0;
        for point in &snapshot.nexus {
            if tiers.locate(&point.record_id).is_none() {
                warn!(record_id = %point.record_id, "Dropping nexus point for missing record");
                continue;
            }
            // Links are re-created once every surviving point is present
            let mut point = point.clone();
            point.related.clear();
            nexus.restore(point)?;
            restored += 1;
        }
        for point in &snapshot.nexus {
            for related in &point.related {
                if let Err(e) = nexus.link(point.id, *related) {
                    debug!(point_id = %point.id, %related, error = %e, "Skipping stale nexus link");
                }
            }
        }

        self.tiers = tiers;
        self.codec = codec;
        self.nexus = nexus;
        debug!(records = self.tiers.len(), nexus_points = restored, "Memory restored");
        Ok(restored)
    }

    pub(crate) fn emit(&self, event: MemoryEvent) {
        if event.severity == crate::events::Severity::Error {
            error!(message = %event.message, "Memory error event");
        }
        self.emitter.emit(event);
    }
}

/// Lazy, restartable sequence of cross-referenced records.
#[derive(Clone)]
pub struct CrossReferences<'a> {
    manager: &'a MemoryManager,
    points: Vec<NexusId>,
    pos: usize,
}

impl<'a> CrossReferences<'a> {
    /// Start again from the first related record.
    pub fn restart(&mut self) {
        self.pos = 0;
    }
}

impl<'a> Iterator for CrossReferences<'a> {
    type Item = &'a MemoryRecord;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(point_id) = self.points.get(self.pos) {
            self.pos += 1;
            let record = self
                .manager
                .nexus
                .point(point_id)
                .ok()
                .and_then(|p| self.manager.tiers.get(&p.record_id).ok());
            if record.is_some() {
                return record;
            }
        }
        None
    }
}

/// Full tier and nexus contents, in tier order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemorySnapshot {
    pub tiers: Vec<(Tier, Vec<MemoryRecord>)>,
    pub nexus: Vec<NexusPoint>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::AutoNexusPolicy;
    use crate::events::{CollectingEmitter, MemoryEventKind};
    use crate::memory::reference::Reference;
    use chrono::Duration;
    use pretty_assertions::assert_eq;

    /// 800 bytes -> 200 heuristic tokens.
    fn turn(i: usize) -> String {
        format!("{:<800}", format!("turn {}", i))
    }

    fn manager(config: MemoryConfig) -> MemoryManager {
        MemoryManager::new(config).unwrap()
    }

    fn manual(config: MemoryConfig) -> (MemoryManager, ManualClock) {
        let clock = ManualClock::default();
        let manager = MemoryManager::builder(config)
            .with_clock(Arc::new(clock.clone()))
            .build()
            .unwrap();
        (manager, clock)
    }

    /// Ingest `n` turns one second apart.
    fn ingest_n(m: &mut MemoryManager, clock: &ManualClock, n: usize) -> Vec<MemoryRecord> {
        (0..n)
            .map(|i| {
                clock.advance(Duration::seconds(1));
                m.ingest(Role::User, turn(i), HashMap::new()).unwrap()
            })
            .collect()
    }

    /// Put a protected record into long-term with a single forced pass.
    fn long_term_record(m: &mut MemoryManager) -> RecordId {
        let record = m.ingest(Role::User, "x".repeat(240), HashMap::new()).unwrap();
        m.mark_significant(&record.id, SignificanceType::User, "pinned")
            .unwrap();
        m.run_pass().unwrap();
        assert_eq!(m.lookup(record.reference.as_str()).unwrap().tier, Tier::LongTerm);
        record.id
    }

    fn cascade_config() -> MemoryConfig {
        MemoryConfig::default()
            .with_working_capacity(100)
            .with_short_term_capacity(50)
            .with_preserve_count(0)
    }

    #[test]
    fn test_ingest_is_immediately_retrievable() {
        let mut m = manager(MemoryConfig::default());
        let record = m
            .ingest(Role::User, "Deploy on Friday", HashMap::new())
            .unwrap();

        let found = m.retrieve(record.reference.as_str()).unwrap();
        assert_eq!(found.id, record.id);
        assert_eq!(found.access_count, 1);
        assert_eq!(found.token_count, 4);

        let by_id = m.retrieve(&record.id.to_string()).unwrap();
        assert_eq!(by_id.access_count, 2);
    }

    #[test]
    fn test_batch_of_sixty_leaves_preserve_window() {
        let mut m = manager(MemoryConfig::default());
        let turns = (0..60).map(|i| (Role::User, turn(i)));
        let created = m.ingest_batch(turns).unwrap();
        assert_eq!(created.len(), 60);
        assert!(created.iter().all(|r| r.token_count == 200));

        let stats = m.stats();
        assert_eq!(stats.pools.working.count, 10);
        assert!(stats.operations.compression_count >= 1);
        assert_eq!(stats.generations, 1);
        assert!(m.records(Tier::ShortTerm).all(|r| r.is_summary()));

        // Preserve window holds the ten most recent turns
        let kept: Vec<_> = m.records(Tier::Working).map(|r| r.id).collect();
        let newest: Vec<_> = created[50..].iter().map(|r| r.id).collect();
        assert_eq!(kept, newest);
    }

    #[test]
    fn test_one_by_one_ingestion_respects_capacity() {
        let (mut m, clock) = manual(MemoryConfig::default());
        ingest_n(&mut m, &clock, 60);

        // Pass at turn 41 (8200 tokens) keeps 10; 19 more arrive below every threshold
        let working = m.pool_stats(Tier::Working);
        assert_eq!(working.count, 29);
        assert!(working.size_tokens <= 8192);
        assert_eq!(m.stats().generations, 1);
    }

    #[test]
    fn test_merged_record_resolves_to_summary() {
        let mut m = manager(MemoryConfig::default());
        let created = m
            .ingest_batch((0..60).map(|i| (Role::Assistant, turn(i))))
            .unwrap();

        let old = &created[0];
        let found = m.retrieve(old.reference.as_str()).unwrap();
        assert!(found.is_summary());
        assert!(found.derived_from.contains(&old.reference));
        assert_eq!(found.tier, Tier::ShortTerm);
    }

    #[test]
    fn test_protected_record_survives_three_passes() {
        let (mut m, clock) = manual(MemoryConfig::default());
        let first = m.ingest(Role::User, turn(0), HashMap::new()).unwrap();
        m.mark_significant(&first.id, SignificanceType::User, "architecture decision")
            .unwrap();

        ingest_n(&mut m, &clock, 130);
        assert!(m.stats().generations >= 3);

        let found = m.retrieve(first.reference.as_str()).unwrap();
        assert_eq!(found.id, first.id);
        assert_eq!(found.content, first.content);
        assert!(found.tier >= Tier::ShortTerm);
        assert_ne!(found.tier, Tier::Stale);
    }

    #[test]
    fn test_fourth_retrieval_promotes() {
        let (mut m, clock) = manual(cascade_config());
        let id = long_term_record(&mut m);

        for _ in 0..3 {
            clock.advance(Duration::minutes(1));
            let r = m.retrieve_by_id(&id).unwrap();
            assert_eq!(r.tier, Tier::LongTerm);
        }
        clock.advance(Duration::minutes(1));
        let r = m.retrieve_by_id(&id).unwrap();
        assert_eq!(r.tier, Tier::ShortTerm);
        assert_eq!(r.access_count, 4);
        assert_eq!(m.stats().operations.promotions, 1);
        assert_eq!(m.stats().operations.retrievals, 4);
    }

    #[test]
    fn test_accesses_outside_window_do_not_promote() {
        let (mut m, clock) = manual(cascade_config());
        let id = long_term_record(&mut m);

        for _ in 0..4 {
            clock.advance(Duration::minutes(90));
            assert_eq!(m.retrieve_by_id(&id).unwrap().tier, Tier::LongTerm);
        }
    }

    #[test]
    fn test_reference_exhaustion() {
        let mut m = MemoryManager::builder(MemoryConfig::default())
            .with_words(["apple", "river", "stone"])
            .build()
            .unwrap();

        let mut last = None;
        for i in 0..6 {
            last = Some(m.ingest(Role::User, format!("turn {}", i), HashMap::new()).unwrap());
        }
        let err = m.ingest(Role::User, "one too many", HashMap::new()).unwrap_err();
        assert!(matches!(err, Error::ReferenceExhausted { .. }));

        let last = last.unwrap();
        assert_eq!(m.retrieve(last.reference.as_str()).unwrap().id, last.id);
        assert_eq!(m.pool_stats(Tier::Working).count, 6);
    }

    #[test]
    fn test_explicit_promote() {
        let (mut m, _clock) = manual(cascade_config());
        let id = long_term_record(&mut m);

        let promoted = m.promote(&id).unwrap();
        assert_eq!(promoted.tier, Tier::ShortTerm);

        // Never promoted into working
        let again = m.promote(&id).unwrap();
        assert_eq!(again.tier, Tier::ShortTerm);
        assert_eq!(m.stats().operations.promotions, 1);

        assert!(matches!(
            m.promote(&RecordId::new()),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_mark_significant_twice() {
        let mut m = manager(MemoryConfig::default());
        let r = m.ingest(Role::User, "keep me", HashMap::new()).unwrap();
        m.mark_significant(&r.id, SignificanceType::Llm, "fact").unwrap();
        let err = m
            .mark_significant(&r.id, SignificanceType::User, "again")
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyProtected { .. }));

        let stats = m.stats();
        assert_eq!(stats.nexus_points.count, 1);
        assert_eq!(stats.nexus_points.types.llm, 1);
        assert!(matches!(
            m.mark_significant(&RecordId::new(), SignificanceType::User, "ghost"),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_cross_references_one_hop_and_restartable() {
        let mut m = manager(MemoryConfig::default());
        let ids: Vec<_> = (0..4)
            .map(|i| {
                let r = m.ingest(Role::User, format!("fact {}", i), HashMap::new()).unwrap();
                m.mark_significant(&r.id, SignificanceType::User, "fact")
                    .unwrap();
                r.id
            })
            .collect();
        m.link_records(&ids[0], &ids[1]).unwrap();
        m.link_records(&ids[0], &ids[2]).unwrap();
        m.link_records(&ids[2], &ids[3]).unwrap();
        assert!(!m.link_records(&ids[1], &ids[0]).unwrap());

        let mut refs = m.resolve_cross_references(&ids[0]).unwrap();
        let mut first: Vec<_> = refs.by_ref().map(|r| r.id).collect();
        first.sort();
        let mut expected = vec![ids[1], ids[2]];
        expected.sort();
        assert_eq!(first, expected);

        refs.restart();
        assert_eq!(refs.count(), 2);

        let deep = m.resolve_cross_references_within(&ids[0], 2).unwrap();
        assert_eq!(deep.count(), 3);

        let unprotected = m.ingest(Role::User, "loose", HashMap::new()).unwrap();
        assert_eq!(m.resolve_cross_references(&unprotected.id).unwrap().count(), 0);
    }

    #[test]
    fn test_stale_and_purge() {
        let (mut m, clock) = manual(cascade_config());
        let pinned = long_term_record(&mut m);

        // An unprotected record cascades to long-term, possibly as a summary
        let loose = m.ingest(Role::User, "x".repeat(240), HashMap::new()).unwrap();
        m.run_pass().unwrap();
        assert_eq!(m.lookup(loose.reference.as_str()).unwrap().tier, Tier::LongTerm);

        clock.advance(Duration::days(31));
        m.run_pass().unwrap();
        assert_eq!(m.lookup(loose.reference.as_str()).unwrap().tier, Tier::Stale);
        assert_eq!(m.lookup(&pinned.to_string()).unwrap().tier, Tier::LongTerm);

        assert_eq!(m.purge_stale().unwrap(), 1);
        assert!(matches!(
            m.retrieve(loose.reference.as_str()),
            Err(Error::NotFound(_))
        ));
        assert_eq!(m.purge_stale().unwrap(), 0);
    }

    #[test]
    fn test_events_emitted() {
        let emitter = CollectingEmitter::new();
        let mut m = MemoryManager::builder(MemoryConfig::default())
            .with_emitter(Arc::new(emitter.clone()))
            .build()
            .unwrap();
        let created = m
            .ingest_batch((0..60).map(|i| (Role::User, turn(i))))
            .unwrap();
        m.mark_significant(&created[59].id, SignificanceType::System, "latest")
            .unwrap();

        let events = emitter.events();
        let added = events
            .iter()
            .filter(|e| matches!(e.kind, MemoryEventKind::RecordAdded { .. }))
            .count();
        assert_eq!(added, 60);
        assert!(events
            .iter()
            .any(|e| matches!(e.kind, MemoryEventKind::CompressionExecuted { merged: 50, .. })));
        let nexus = events
            .iter()
            .find(|e| e.kind == MemoryEventKind::NexusCreated)
            .unwrap();
        assert_eq!(nexus.reference.as_ref(), Some(&created[59].reference));
    }

    #[test]
    fn test_unknown_keys() {
        let mut m = manager(MemoryConfig::default());
        assert!(matches!(m.retrieve("apple.river.stone"), Err(Error::NotFound(_))));
        assert!(matches!(m.retrieve("not a reference"), Err(Error::NotFound(_))));
        assert!(matches!(
            m.retrieve(&RecordId::new().to_string()),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_restore_roundtrip() {
        let mut source = manager(MemoryConfig::default());
        let created = source
            .ingest_batch((0..60).map(|i| (Role::User, turn(i))))
            .unwrap();
        source
            .mark_significant(&created[55].id, SignificanceType::User, "keep")
            .unwrap();

        let mut target = manager(MemoryConfig::default());
        assert_eq!(target.restore(source.export()).unwrap(), 1);

        assert_eq!(target.pool_stats(Tier::Working), source.pool_stats(Tier::Working));
        assert!(target.is_protected(&created[55].id));
        // Forwarded references survive the round-trip
        assert!(target.lookup(created[0].reference.as_str()).unwrap().is_summary());
    }

    #[test]
    fn test_restore_replaces_protected_state() {
        let mut m = manager(MemoryConfig::default());
        let kept = m.ingest(Role::User, "keep me", HashMap::new()).unwrap();
        m.mark_significant(&kept.id, SignificanceType::User, "kept")
            .unwrap();
        let snapshot = m.export();

        let extra = m.ingest(Role::User, "added later", HashMap::new()).unwrap();
        m.mark_significant(&extra.id, SignificanceType::Llm, "later")
            .unwrap();

        // Restoring over points that already exist, twice
        assert_eq!(m.restore(snapshot.clone()).unwrap(), 1);
        assert_eq!(m.restore(snapshot).unwrap(), 1);

        assert!(m.is_protected(&kept.id));
        assert!(!m.is_protected(&extra.id));
        assert!(matches!(
            m.lookup(extra.reference.as_str()),
            Err(Error::NotFound(_))
        ));
        let stats = m.stats();
        assert_eq!(stats.nexus_points.count, 1);
        assert_eq!(stats.nexus_points.types.user, 1);
        assert_eq!(stats.nexus_points.types.llm, 0);
    }

    #[test]
    fn test_failed_restore_leaves_state_untouched() {
        let mut m = manager(MemoryConfig::default());
        let record = m.ingest(Role::User, "original", HashMap::new()).unwrap();
        m.mark_significant(&record.id, SignificanceType::User, "pinned")
            .unwrap();

        // Two records claiming the same reference
        let mut snapshot = m.export();
        let mut clash = snapshot.tiers[0].1[0].clone();
        clash.id = RecordId::new();
        snapshot.tiers[2].1.push(clash);

        assert!(m.restore(snapshot).is_err());
        assert_eq!(m.lookup(record.reference.as_str()).unwrap().id, record.id);
        assert!(m.is_protected(&record.id));
        assert_eq!(m.pool_stats(Tier::Working).count, 1);
        assert_eq!(m.pool_stats(Tier::LongTerm).count, 0);
    }

    #[test]
    fn test_reset_statistics() {
        let mut m = manager(MemoryConfig::default());
        m.ingest_batch((0..60).map(|i| (Role::User, turn(i))))
            .unwrap();
        m.reset_statistics();
        let stats = m.stats();
        assert_eq!(stats.generations, 0);
        assert_eq!(stats.operations.compression_count, 0);
        // Pools reflect live contents, not counters
        assert_eq!(stats.pools.working.count, 10);
    }

    fn record_at(tier: Tier, content: &str, reference: &str, now: DateTime<Utc>) -> MemoryRecord {
        let mut record = MemoryRecord::new(
            RecordId::new(),
            Role::User,
            content,
            10,
            Reference::parse(reference).unwrap(),
            now,
        );
        record.tier = tier;
        record
    }

    /// Replace the manager's contents with records at fixed references.
    fn seed(m: &mut MemoryManager, records: Vec<MemoryRecord>) {
        let mut tiers: Vec<(Tier, Vec<MemoryRecord>)> =
            Tier::ALL.into_iter().map(|t| (t, Vec::new())).collect();
        for record in records {
            tiers[record.tier.index()].1.push(record);
        }
        m.restore(MemorySnapshot {
            tiers,
            nexus: Vec::new(),
        })
        .unwrap();
    }

    #[test]
    fn test_search_ranks_by_relevance() {
        let (mut m, clock) = manual(MemoryConfig::default());
        let now = m.now();
        let deploy = record_at(
            Tier::Working,
            "The deploy pipeline runs on Friday",
            "apple.river.stone",
            now,
        );
        let rollback = record_at(
            Tier::LongTerm,
            "Rollback the deploy if tests fail",
            "maple.harbor.quartz",
            now,
        );
        let lunch = record_at(Tier::Working, "Lunch is at noon", "acorn.badge.cedar", now);
        seed(&mut m, vec![deploy.clone(), rollback.clone(), lunch]);
        clock.advance(Duration::hours(1));

        let hits = m.search("deploy friday").unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].record.id, deploy.id);
        assert_eq!(hits[1].record.id, rollback.id);
        assert!(hits[0].score > hits[1].score);
        assert_eq!(hits[0].record.access_count, 1);
        assert_eq!(hits[0].record.last_accessed_at, m.now());

        let strict = SearchPolicy {
            min_score: 0.5,
            ..SearchPolicy::default()
        };
        assert_eq!(m.search_with("deploy friday", &strict).unwrap().len(), 1);
        let one = SearchPolicy {
            max_results: 1,
            ..SearchPolicy::default()
        };
        assert_eq!(m.search_with("deploy", &one).unwrap().len(), 1);

        assert!(matches!(m.search(" ,. "), Err(Error::InvalidOperation(_))));
    }

    #[test]
    fn test_search_skips_stale_when_excluded() {
        let mut m = manager(MemoryConfig::default());
        let now = m.now();
        seed(
            &mut m,
            vec![record_at(Tier::Stale, "archived billing export", "apple.river.stone", now)],
        );

        let fresh_only = SearchPolicy {
            include_stale: false,
            ..SearchPolicy::default()
        };
        assert!(m.search_with("billing", &fresh_only).unwrap().is_empty());

        let hits = m.search("billing").unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record.tier, Tier::Stale);
    }

    #[test]
    fn test_search_hits_count_toward_promotion() {
        let mut m = manager(MemoryConfig::default());
        let now = m.now();
        let old = record_at(Tier::LongTerm, "quarterly billing export", "apple.river.stone", now);
        seed(&mut m, vec![old.clone()]);

        for _ in 0..3 {
            let hits = m.search("billing export").unwrap();
            assert_eq!(hits[0].record.tier, Tier::LongTerm);
        }
        let hits = m.search("billing export").unwrap();
        assert_eq!(hits[0].record.id, old.id);
        assert_eq!(hits[0].record.tier, Tier::ShortTerm);
        assert_eq!(m.stats().operations.promotions, 1);
    }

    #[test]
    fn test_lookup_by_partial_words() {
        let mut m = manager(MemoryConfig::default());
        let now = m.now();
        let plain = record_at(Tier::Working, "plain", "apple.river.stone", now);
        let mut summary = record_at(Tier::LongTerm, "summary", "maple.harbor.quartz", now);
        summary.derived_from = vec![Reference::parse("amber.bison.cedar").unwrap()];
        seed(&mut m, vec![plain.clone(), summary.clone()]);

        let found = m.lookup_by_words(&["riv"]).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, plain.id);
        assert_eq!(found[0].access_count, 1);

        // Through a merged reference
        let found = m.lookup_by_words(&["bison", "AMB"]).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, summary.id);

        assert!(m.lookup_by_words(&["apple", "quartz"]).unwrap().is_empty());
        assert!(matches!(
            m.lookup_by_words(&[]),
            Err(Error::InvalidReference(_))
        ));
    }

    #[test]
    fn test_repeated_access_grants_automatic_nexus() {
        let emitter = CollectingEmitter::new();
        let clock = ManualClock::default();
        let config = MemoryConfig::default().with_auto_nexus(AutoNexusPolicy {
            max_points: 1,
            ..AutoNexusPolicy::default()
        });
        let mut m = MemoryManager::builder(config)
            .with_clock(Arc::new(clock.clone()))
            .with_emitter(Arc::new(emitter.clone()))
            .build()
            .unwrap();
        let a = m.ingest(Role::User, "alpha", HashMap::new()).unwrap();
        let b = m.ingest(Role::User, "beta", HashMap::new()).unwrap();

        m.retrieve_by_id(&a.id).unwrap();
        m.retrieve_by_id(&a.id).unwrap();
        assert!(!m.is_protected(&a.id));
        m.retrieve_by_id(&a.id).unwrap();
        assert!(m.nexus_point(&a.id).unwrap().automatic);

        // Equal importance does not displace the existing point
        for _ in 0..3 {
            m.retrieve_by_id(&b.id).unwrap();
        }
        assert!(!m.is_protected(&b.id));

        m.retrieve_by_id(&b.id).unwrap();
        assert!(m.is_protected(&b.id));
        assert!(!m.is_protected(&a.id));
        assert_eq!(m.stats().nexus_points.types.system, 1);

        let events = emitter.events();
        let created = events
            .iter()
            .filter(|e| e.kind == MemoryEventKind::NexusCreated)
            .count();
        assert_eq!(created, 2);
        let released: Vec<_> = events
            .iter()
            .filter(|e| e.kind == MemoryEventKind::NexusReleased)
            .collect();
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].reference.as_ref(), Some(&a.reference));
    }

    #[test]
    fn test_automatic_nexus_disabled_by_default() {
        let mut m = manager(MemoryConfig::default());
        let r = m.ingest(Role::User, "alpha", HashMap::new()).unwrap();
        for _ in 0..6 {
            m.retrieve_by_id(&r.id).unwrap();
        }
        assert!(!m.is_protected(&r.id));
    }
}
