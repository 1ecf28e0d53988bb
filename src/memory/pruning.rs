//! Pruning passes: capacity-driven migration and compression.
//!
//! A pass walks the hierarchy top-down:
//!
//! 1. `working -> short_term` when the working tier is over budget, over its
//!    record count, or the time threshold has elapsed.
//! 2. `short_term -> long_term` when short-term is over its token capacity.
//! 3. `long_term -> stale` for unprotected records idle past `stale_after`.
//!
//! Within a bounded tier the newest `preserve_count` records stay put (unless
//! they alone exceed capacity). Protected candidates are relocated verbatim;
//! the rest are merged into summary records in the next tier. A summary that
//! would be larger than its originals is abandoned in favor of verbatim
//! migration, so a pass never increases token volume.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{MemoryConfig, TierPolicy};
use crate::error::{Error, Result};
use crate::memory::nexus::NexusRegistry;
use crate::memory::reference::{Reference, ReferenceCodec};
use crate::memory::store::Tiers;
use crate::memory::summarize::Summarizer;
use crate::memory::tokens::TokenCounter;
use crate::memory::types::{MemoryRecord, RecordId, Role, Tier};

/// Why a pass ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PassTrigger {
    WorkingTokens,
    WorkingCount,
    Elapsed,
    ShortTermTokens,
    Forced,
}

impl PassTrigger {
    fn drains_working(self) -> bool {
        !matches!(self, PassTrigger::ShortTermTokens)
    }
}

/// One change applied by a pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum PassAction {
    /// Record relocated verbatim
    Moved {
        record_id: RecordId,
        reference: Reference,
        from: Tier,
        to: Tier,
    },
    /// Batch merged into a new summary record
    Compressed {
        summary_id: RecordId,
        reference: Reference,
        from: Tier,
        to: Tier,
        originals: Vec<Reference>,
        original_tokens: u64,
        summary_tokens: u64,
    },
}

/// Outcome of a completed pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PassReport {
    pub trigger: Option<PassTrigger>,
    pub generation: u64,
    pub actions: Vec<PassAction>,
    pub demotions: u64,
    pub compressions: u64,
    pub merges: u64,
}

impl PassReport {
    /// Records that went stale during this pass.
    pub fn staled(&self) -> impl Iterator<Item = &RecordId> {
        self.actions.iter().filter_map(|a| match a {
            PassAction::Moved {
                record_id,
                to: Tier::Stale,
                ..
            } => Some(record_id),
            _ => None,
        })
    }
}

/// Mutable state a pass operates on.
pub struct PassEnv<'a> {
    pub tiers: &'a mut Tiers,
    pub nexus: &'a mut NexusRegistry,
    pub codec: &'a mut ReferenceCodec,
}

/// Decides when passes run and performs them.
#[derive(Debug, Clone)]
pub struct PruningEngine {
    working: TierPolicy,
    short_term: TierPolicy,
    stale_after: Duration,
    summarizer: Arc<dyn Summarizer>,
    counter: Arc<dyn TokenCounter>,
    last_pass_at: DateTime<Utc>,
    generation: u64,
}

impl PruningEngine {
    pub fn new(
        config: &MemoryConfig,
        summarizer: Arc<dyn Summarizer>,
        counter: Arc<dyn TokenCounter>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            working: config.working.clone(),
            short_term: config.short_term.clone(),
            stale_after: config.stale_after(),
            summarizer,
            counter,
            last_pass_at: now,
            generation: 0,
        }
    }

    /// Completed passes so far.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn last_pass_at(&self) -> DateTime<Utc> {
        self.last_pass_at
    }

    pub fn reset(&mut self, now: DateTime<Utc>) {
        self.generation = 0;
        self.last_pass_at = now;
    }

    /// First threshold currently exceeded, if any.
    pub fn needs_pass(&self, tiers: &Tiers, now: DateTime<Utc>) -> Option<PassTrigger> {
        let working = tiers.store(Tier::Working).pool_stats();
        if working.size_tokens > self.working.capacity_tokens {
            return Some(PassTrigger::WorkingTokens);
        }
        if self
            .working
            .max_records
            .is_some_and(|max| working.count > max)
        {
            return Some(PassTrigger::WorkingCount);
        }
        if self
            .working
            .time_threshold()
            .is_some_and(|t| now - self.last_pass_at > t)
        {
            return Some(PassTrigger::Elapsed);
        }
        if tiers.store(Tier::ShortTerm).size_tokens() > self.short_term.capacity_tokens {
            return Some(PassTrigger::ShortTermTokens);
        }
        None
    }

    /// Run one complete pass. Runs to completion once started; follow with
    /// [`verify_capacity`](Self::verify_capacity).
    #[instrument(skip(self, env))]
    pub fn run_pass(
        &mut self,
        env: &mut PassEnv<'_>,
        trigger: PassTrigger,
        now: DateTime<Utc>,
    ) -> Result<PassReport> {
        let mut report = PassReport {
            trigger: Some(trigger),
            ..Default::default()
        };

        if trigger.drains_working() {
            let policy = self.working.clone();
            self.drain(env, Tier::Working, &policy, &mut report)?;
        }
        if env.tiers.store(Tier::ShortTerm).size_tokens() > self.short_term.capacity_tokens {
            let policy = self.short_term.clone();
            self.drain(env, Tier::ShortTerm, &policy, &mut report)?;
        }
        self.sweep_stale(env, now, &mut report)?;

        self.generation += 1;
        self.last_pass_at = now;
        report.generation = self.generation;

        info!(
            ?trigger,
            generation = self.generation,
            demotions = report.demotions,
            compressions = report.compressions,
            merges = report.merges,
            "Pruning pass complete"
        );

        Ok(report)
    }

    /// Migrate everything outside the preserve window of `tier` into the next tier.
    fn drain(
        &self,
        env: &mut PassEnv<'_>,
        tier: Tier,
        policy: &TierPolicy,
        report: &mut PassReport,
    ) -> Result<()> {
        let Some(dest) = tier.next() else {
            return Ok(());
        };

        let ids = env.tiers.store(tier).ids_by_created_at();
        let split = ids.len().saturating_sub(policy.preserve_count);
        let mut candidates = ids[..split].to_vec();
        let mut preserve: VecDeque<RecordId> = ids[split..].iter().copied().collect();

        // Capacity outranks the preserve floor: evict the oldest preserved
        // records until the remainder fits.
        let mut preserve_tokens: u64 = preserve
            .iter()
            .map(|id| env.tiers.get(id).map(|r| r.token_count))
            .sum::<Result<u64>>()?;
        while preserve_tokens > policy.capacity_tokens
            || policy.max_records.is_some_and(|max| preserve.len() > max)
        {
            let Some(id) = preserve.pop_front() else {
                break;
            };
            preserve_tokens -= env.tiers.get(&id)?.token_count;
            candidates.push(id);
        }

        if candidates.is_empty() {
            return Ok(());
        }
        debug!(%tier, candidates = candidates.len(), preserved = preserve.len(), "Draining tier");

        let (protected, compressible): (Vec<_>, Vec<_>) = candidates
            .into_iter()
            .partition(|id| !env.nexus.demote_candidate(id));

        for id in &protected {
            self.relocate(env, id, dest, report)?;
        }

        let batch = policy
            .compression_batch
            .unwrap_or(compressible.len())
            .max(1);
        for chunk in compressible.chunks(batch) {
            self.compress(env, chunk, tier, dest, report)?;
        }
        Ok(())
    }

    fn relocate(
        &self,
        env: &mut PassEnv<'_>,
        id: &RecordId,
        to: Tier,
        report: &mut PassReport,
    ) -> Result<()> {
        let from = env.tiers.relocate(id, to)?;
        let reference = env.tiers.get(id)?.reference.clone();
        report.demotions += 1;
        report.actions.push(PassAction::Moved {
            record_id: *id,
            reference,
            from,
            to,
        });
        Ok(())
    }

    /// Merge a contiguous batch into one summary record in `to`.
    fn compress(
        &self,
        env: &mut PassEnv<'_>,
        batch: &[RecordId],
        from: Tier,
        to: Tier,
        report: &mut PassReport,
    ) -> Result<()> {
        let originals: Vec<MemoryRecord> = batch
            .iter()
            .map(|id| env.tiers.get(id).cloned())
            .collect::<Result<_>>()?;
        let original_tokens: u64 = originals.iter().map(|r| r.token_count).sum();

        let content = self.summarizer.summarize(&originals);
        let summary_tokens = self.counter.count(&content);
        if summary_tokens > original_tokens {
            debug!(
                summary_tokens,
                original_tokens, "Summary larger than originals, migrating verbatim"
            );
            return self.relocate_all(env, batch, to, report);
        }

        let summary_id = RecordId::new();
        let reference = match env.codec.reserve(&summary_id) {
            Ok(reference) => reference,
            Err(Error::ReferenceExhausted { attempts }) => {
                warn!(attempts, "No reference for summary, migrating verbatim");
                return self.relocate_all(env, batch, to, report);
            }
            Err(e) => return Err(e),
        };

        // Every reference that resolved to an original now resolves to the summary.
        let mut derived_from = Vec::new();
        for original in &originals {
            derived_from.push(original.reference.clone());
            derived_from.extend(original.derived_from.iter().cloned());
        }

        let created_at = originals
            .iter()
            .map(|r| r.created_at)
            .max()
            .unwrap_or_else(Utc::now);
        let last_accessed_at = originals
            .iter()
            .map(|r| r.last_accessed_at)
            .max()
            .unwrap_or(created_at);

        let mut metadata = HashMap::new();
        metadata.insert("merged_records".to_string(), Value::from(originals.len()));
        metadata.insert("original_tokens".to_string(), Value::from(original_tokens));

        let mut summary = MemoryRecord::new(
            summary_id,
            Role::System,
            content,
            summary_tokens,
            reference.clone(),
            created_at,
        )
        .with_tier(to)
        .with_metadata(metadata)
        .with_derived_from(derived_from.clone());
        summary.last_accessed_at = last_accessed_at;

        if let Err(e) = env.tiers.insert(summary) {
            env.codec.release(&reference);
            return Err(e);
        }
        env.codec.bind(reference.clone(), summary_id);

        for original in &originals {
            env.tiers.remove(&original.id)?;
            env.nexus.reset_access(&original.id);
        }
        for r in &derived_from {
            env.codec.forward(r, summary_id);
        }

        report.compressions += 1;
        report.merges += originals.len() as u64 - 1;
        report.actions.push(PassAction::Compressed {
            summary_id,
            reference,
            from,
            to,
            originals: originals.into_iter().map(|r| r.reference).collect(),
            original_tokens,
            summary_tokens,
        });
        Ok(())
    }

    fn relocate_all(
        &self,
        env: &mut PassEnv<'_>,
        batch: &[RecordId],
        to: Tier,
        report: &mut PassReport,
    ) -> Result<()> {
        for id in batch {
            self.relocate(env, id, to, report)?;
        }
        Ok(())
    }

    /// Move idle, unprotected long-term records to stale.
    fn sweep_stale(
        &self,
        env: &mut PassEnv<'_>,
        now: DateTime<Utc>,
        report: &mut PassReport,
    ) -> Result<()> {
        let idle: Vec<RecordId> = env
            .tiers
            .store(Tier::LongTerm)
            .all()
            .filter(|r| now - r.last_accessed_at > self.stale_after)
            .filter(|r| env.nexus.demote_candidate(&r.id))
            .map(|r| r.id)
            .collect();

        for id in &idle {
            self.relocate(env, id, Tier::Stale, report)?;
        }
        if !idle.is_empty() {
            debug!(count = idle.len(), "Long-term records went stale");
        }
        Ok(())
    }

    /// Fail with `CapacityViolation` if a bounded tier is over its hard capacity.
    pub fn verify_capacity(&self, tiers: &Tiers) -> Result<()> {
        for (tier, policy) in [
            (Tier::Working, &self.working),
            (Tier::ShortTerm, &self.short_term),
        ] {
            let size_tokens = tiers.store(tier).size_tokens();
            if size_tokens > policy.capacity_tokens {
                error!(
                    %tier,
                    size_tokens,
                    capacity = policy.capacity_tokens,
                    "Tier over capacity after pruning pass"
                );
                return Err(Error::CapacityViolation {
                    tier,
                    size_tokens,
                    capacity_tokens: policy.capacity_tokens,
                });
            }
        }
        Ok(())
    }
}
