//! In-memory store for the records of a single tier.

use std::collections::{BTreeMap, HashMap};

use crate::error::{Error, Result};
use crate::memory::types::{MemoryRecord, PoolStats, RecordId, Tier};

/// Records of one tier in insertion order.
///
/// Size and count are tracked on every append/remove so [`TierStore::pool_stats`]
/// never scans.
#[derive(Debug, Clone)]
pub struct TierStore {
    tier: Tier,
    capacity_tokens: Option<u64>,
    order: BTreeMap<u64, RecordId>,
    records: HashMap<RecordId, (u64, MemoryRecord)>,
    next_seq: u64,
    size_tokens: u64,
}

impl TierStore {
    pub fn new(tier: Tier, capacity_tokens: Option<u64>) -> Self {
        Self {
            tier,
            capacity_tokens,
            order: BTreeMap::new(),
            records: HashMap::new(),
            next_seq: 0,
            size_tokens: 0,
        }
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }

    /// Append a record at the end of the insertion order.
    pub fn append(&mut self, record: MemoryRecord) -> Result<()> {
        if record.tier != self.tier {
            return Err(Error::Internal(format!(
                "record {} tagged {} appended to {}",
                record.id, record.tier, self.tier
            )));
        }
        if self.records.contains_key(&record.id) {
            return Err(Error::Internal(format!(
                "record {} already present in {}",
                record.id, self.tier
            )));
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.size_tokens += record.token_count;
        self.order.insert(seq, record.id);
        self.records.insert(record.id, (seq, record));
        Ok(())
    }

    pub fn get(&self, id: &RecordId) -> Result<&MemoryRecord> {
        self.records
            .get(id)
            .map(|(_, r)| r)
            .ok_or_else(|| Error::not_found(id.to_string()))
    }

    /// Mutable access for bookkeeping fields. Token count must not change.
    pub fn get_mut(&mut self, id: &RecordId) -> Result<&mut MemoryRecord> {
        self.records
            .get_mut(id)
            .map(|(_, r)| r)
            .ok_or_else(|| Error::not_found(id.to_string()))
    }

    pub fn contains(&self, id: &RecordId) -> bool {
        self.records.contains_key(id)
    }

    pub fn remove(&mut self, id: &RecordId) -> Result<MemoryRecord> {
        let (seq, record) = self
            .records
            .remove(id)
            .ok_or_else(|| Error::not_found(id.to_string()))?;
        self.order.remove(&seq);
        self.size_tokens -= record.token_count;
        Ok(record)
    }

    /// Records in insertion order.
    pub fn all(&self) -> impl Iterator<Item = &MemoryRecord> + '_ {
        self.order
            .values()
            .filter_map(move |id| self.records.get(id).map(|(_, r)| r))
    }

    /// Ids sorted by creation time, insertion order breaking ties.
    pub fn ids_by_created_at(&self) -> Vec<RecordId> {
        let mut keyed: Vec<_> = self
            .records
            .values()
            .map(|(seq, r)| (r.created_at, *seq, r.id))
            .collect();
        keyed.sort();
        keyed.into_iter().map(|(_, _, id)| id).collect()
    }

    /// Owned copy of the records in insertion order.
    pub fn snapshot(&self) -> Vec<MemoryRecord> {
        self.all().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.records.clear();
        self.size_tokens = 0;
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn size_tokens(&self) -> u64 {
        self.size_tokens
    }

    pub fn capacity_tokens(&self) -> Option<u64> {
        self.capacity_tokens
    }

    pub fn pool_stats(&self) -> PoolStats {
        PoolStats {
            size_tokens: self.size_tokens,
            count: self.records.len(),
            capacity_tokens: self.capacity_tokens,
        }
    }
}

/// The four tier stores plus a record -> tier location index.
#[derive(Debug, Clone)]
pub struct Tiers {
    stores: [TierStore; 4],
    locations: HashMap<RecordId, Tier>,
}

impl Tiers {
    pub fn new(working_capacity: u64, short_term_capacity: u64) -> Self {
        Self {
            stores: [
                TierStore::new(Tier::Working, Some(working_capacity)),
                TierStore::new(Tier::ShortTerm, Some(short_term_capacity)),
                TierStore::new(Tier::LongTerm, None),
                TierStore::new(Tier::Stale, None),
            ],
            locations: HashMap::new(),
        }
    }

    pub fn store(&self, tier: Tier) -> &TierStore {
        &self.stores[tier.index()]
    }

    pub fn locate(&self, id: &RecordId) -> Option<Tier> {
        self.locations.get(id).copied()
    }

    pub fn get(&self, id: &RecordId) -> Result<&MemoryRecord> {
        let tier = self
            .locate(id)
            .ok_or_else(|| Error::not_found(id.to_string()))?;
        self.stores[tier.index()].get(id)
    }

    pub fn get_mut(&mut self, id: &RecordId) -> Result<&mut MemoryRecord> {
        let tier = self
            .locate(id)
            .ok_or_else(|| Error::not_found(id.to_string()))?;
        self.stores[tier.index()].get_mut(id)
    }

    /// Insert a record into the tier it is tagged with.
    pub fn insert(&mut self, record: MemoryRecord) -> Result<()> {
        if let Some(existing) = self.locate(&record.id) {
            return Err(Error::Internal(format!(
                "record {} already present in {}",
                record.id, existing
            )));
        }
        let (id, tier) = (record.id, record.tier);
        self.stores[tier.index()].append(record)?;
        self.locations.insert(id, tier);
        Ok(())
    }

    pub fn remove(&mut self, id: &RecordId) -> Result<MemoryRecord> {
        let tier = self
            .locate(id)
            .ok_or_else(|| Error::not_found(id.to_string()))?;
        let record = self.stores[tier.index()].remove(id)?;
        self.locations.remove(id);
        Ok(record)
    }

    /// Move a record to another tier, keeping its content. Returns the source tier.
    pub fn relocate(&mut self, id: &RecordId, to: Tier) -> Result<Tier> {
        let mut record = self.remove(id)?;
        let from = record.tier;
        record.tier = to;
        self.insert(record)?;
        Ok(from)
    }

    pub fn len(&self) -> usize {
        self.locations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }
}
