//! Nexus points: protection markers and cross-references between records.
//!
//! Links are kept as an adjacency set keyed by point id in both directions,
//! so the relation is symmetric and no point owns another. The registry also
//! owns per-record access history used by the promotion heuristic.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;
use tracing::debug;
use uuid::Uuid;

use crate::config::AutoNexusPolicy;
use crate::error::{Error, Result};
use crate::memory::types::{RecordId, SignificanceType};

/// Unique identifier for a nexus point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NexusId(pub Uuid);

impl NexusId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for NexusId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NexusId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Protection marker attached to one record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NexusPoint {
    pub id: NexusId,
    pub record_id: RecordId,
    pub significance: SignificanceType,
    #[serde(default)]
    pub related: BTreeSet<NexusId>,
    pub created_at: DateTime<Utc>,
    pub description: String,
    /// Created by importance scoring rather than an explicit mark
    #[serde(default)]
    pub automatic: bool,
}

/// Outcome of [`NexusRegistry::auto_protect`].
#[derive(Debug, Clone, PartialEq)]
pub struct AutoProtected {
    pub point: NexusPoint,
    pub importance: f64,
    /// Automatic point released to stay within the cap
    pub evicted: Option<NexusPoint>,
}

/// Nexus point counts by significance type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignificanceCounts {
    pub user: u64,
    pub llm: u64,
    pub system: u64,
}

impl SignificanceCounts {
    fn slot(&mut self, significance: SignificanceType) -> &mut u64 {
        match significance {
            SignificanceType::User => &mut self.user,
            SignificanceType::Llm => &mut self.llm,
            SignificanceType::System => &mut self.system,
        }
    }

    pub fn total(&self) -> u64 {
        self.user + self.llm + self.system
    }
}

/// Registry of protected records.
#[derive(Debug, Clone)]
pub struct NexusRegistry {
    points: HashMap<NexusId, NexusPoint>,
    by_record: HashMap<RecordId, NexusId>,
    counts: SignificanceCounts,
    access: HashMap<RecordId, VecDeque<DateTime<Utc>>>,
    access_window: Duration,
    max_depth: usize,
}

impl NexusRegistry {
    pub fn new(access_window: Duration, max_depth: usize) -> Self {
        Self {
            points: HashMap::new(),
            by_record: HashMap::new(),
            counts: SignificanceCounts::default(),
            access: HashMap::new(),
            access_window,
            max_depth: max_depth.max(1),
        }
    }

    /// Attach a nexus point to a record.
    pub fn protect(
        &mut self,
        record_id: RecordId,
        significance: SignificanceType,
        description: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<NexusPoint> {
        self.create(record_id, significance, description.into(), now, false)
    }

    fn create(
        &mut self,
        record_id: RecordId,
        significance: SignificanceType,
        description: String,
        now: DateTime<Utc>,
        automatic: bool,
    ) -> Result<NexusPoint> {
        if self.by_record.contains_key(&record_id) {
            return Err(Error::already_protected(record_id));
        }

        let point = NexusPoint {
            id: NexusId::new(),
            record_id,
            significance,
            related: BTreeSet::new(),
            created_at: now,
            description,
            automatic,
        };
        self.insert(point.clone());
        debug!(record_id = %record_id, point_id = %point.id, %significance, automatic, "Record protected");
        Ok(point)
    }

    /// Re-insert a point loaded from persistence.
    pub fn restore(&mut self, point: NexusPoint) -> Result<()> {
        if self.by_record.contains_key(&point.record_id) {
            return Err(Error::already_protected(point.record_id));
        }
        self.insert(point);
        Ok(())
    }

    fn insert(&mut self, point: NexusPoint) {
        *self.counts.slot(point.significance) += 1;
        self.by_record.insert(point.record_id, point.id);
        self.points.insert(point.id, point);
    }

    /// Link two points symmetrically. Returns false if they were already linked.
    pub fn link(&mut self, a: NexusId, b: NexusId) -> Result<bool> {
        if a == b {
            return Err(Error::InvalidOperation(format!(
                "cannot link nexus point {} to itself",
                a
            )));
        }
        for id in [a, b] {
            if !self.points.contains_key(&id) {
                return Err(Error::not_found(format!("nexus point {}", id)));
            }
        }

        let mut added = false;
        if let Some(point) = self.points.get_mut(&a) {
            added |= point.related.insert(b);
        }
        if let Some(point) = self.points.get_mut(&b) {
            added |= point.related.insert(a);
        }
        Ok(added)
    }

    /// Remove a record's nexus point and every link to it.
    pub fn release(&mut self, record_id: &RecordId) -> Option<NexusPoint> {
        let point_id = self.by_record.remove(record_id)?;
        let point = self.points.remove(&point_id)?;
        for other in &point.related {
            if let Some(p) = self.points.get_mut(other) {
                p.related.remove(&point_id);
            }
        }
        let slot = self.counts.slot(point.significance);
        *slot = slot.saturating_sub(1);
        Some(point)
    }

    pub fn is_protected(&self, record_id: &RecordId) -> bool {
        self.by_record.contains_key(record_id)
    }

    /// Whether pruning may evict or compress this record.
    pub fn demote_candidate(&self, record_id: &RecordId) -> bool {
        !self.is_protected(record_id)
    }

    pub fn point(&self, id: &NexusId) -> Result<&NexusPoint> {
        self.points
            .get(id)
            .ok_or_else(|| Error::not_found(format!("nexus point {}", id)))
    }

    pub fn point_for_record(&self, record_id: &RecordId) -> Option<&NexusPoint> {
        self.by_record
            .get(record_id)
            .and_then(|id| self.points.get(id))
    }

    /// Points reachable from `start` within `depth` hops, breadth-first.
    ///
    /// `start` itself is excluded and each point is visited once. Depth is
    /// clamped to the registry's traversal bound.
    pub fn related_points(&self, start: NexusId, depth: usize) -> Result<Vec<NexusId>> {
        self.point(&start)?;
        let depth = depth.min(self.max_depth);

        let mut visited: HashSet<NexusId> = HashSet::from([start]);
        let mut frontier = vec![start];
        let mut out = Vec::new();

        for _ in 0..depth {
            let mut next = Vec::new();
            for id in frontier {
                let Some(point) = self.points.get(&id) else {
                    continue;
                };
                for related in &point.related {
                    if visited.insert(*related) {
                        out.push(*related);
                        next.push(*related);
                    }
                }
            }
            if next.is_empty() {
                break;
            }
            frontier = next;
        }
        Ok(out)
    }

    pub fn points(&self) -> impl Iterator<Item = &NexusPoint> {
        self.points.values()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn counts(&self) -> SignificanceCounts {
        self.counts
    }

    // ==================== Importance ====================

    /// Importance of a record in `[0, 1]`.
    ///
    /// Weighted sum of access frequency within the window (saturating at
    /// `min_access_count`), recency of the last access in hours, link count
    /// (saturating at 10) and the significance of an explicit mark.
    pub fn importance(&self, record_id: &RecordId, min_access_count: u32, now: DateTime<Utc>) -> f64 {
        let frequency =
            (self.recent_accesses(record_id, now) as f64 / min_access_count.max(1) as f64).min(1.0);
        let recency = self
            .access
            .get(record_id)
            .and_then(|h| h.back())
            .map(|last| {
                let hours = (now - *last).num_milliseconds().max(0) as f64 / 3_600_000.0;
                1.0 / (1.0 + hours)
            })
            .unwrap_or(0.0);

        let point = self.point_for_record(record_id);
        let links = point.map_or(0.0, |p| (p.related.len() as f64 / 10.0).min(1.0));
        let bonus = match point {
            Some(p) if !p.automatic => match p.significance {
                SignificanceType::System => 0.3,
                SignificanceType::User => 0.2,
                SignificanceType::Llm => 0.1,
            },
            _ => 0.0,
        };

        0.4 * frequency + 0.3 * recency + 0.2 * links + 0.1 * bonus
    }

    /// Protect an unprotected record whose importance reaches the threshold.
    ///
    /// At most `max_points` automatic points exist. At the cap, the least
    /// important automatic point is released if the candidate scores higher.
    /// Explicitly marked points are never released here.
    pub fn auto_protect(
        &mut self,
        record_id: RecordId,
        policy: &AutoNexusPolicy,
        now: DateTime<Utc>,
    ) -> Option<AutoProtected> {
        if self.is_protected(&record_id) || policy.max_points == 0 {
            return None;
        }
        let importance = self.importance(&record_id, policy.min_access_count, now);
        if importance < policy.threshold {
            return None;
        }

        let automatic: Vec<_> = self.points.values().filter(|p| p.automatic).collect();
        let mut evicted = None;
        if automatic.len() >= policy.max_points {
            let (weakest, weakest_score) = automatic
                .iter()
                .map(|p| (p.record_id, self.importance(&p.record_id, policy.min_access_count, now)))
                .min_by(|a, b| a.1.total_cmp(&b.1))?;
            if importance <= weakest_score {
                return None;
            }
            evicted = self.release(&weakest);
        }

        let description = format!("importance {:.2}", importance);
        let point = self
            .create(record_id, SignificanceType::System, description, now, true)
            .ok()?;
        Some(AutoProtected {
            point,
            importance,
            evicted,
        })
    }

    // ==================== Access monitoring ====================

    /// Record one access to `record_id`.
    pub fn register_access(&mut self, record_id: RecordId, now: DateTime<Utc>) {
        let window = self.access_window;
        let history = self.access.entry(record_id).or_default();
        history.push_back(now);
        while history.front().is_some_and(|t| now - *t > window) {
            history.pop_front();
        }
    }

    /// Accesses to `record_id` within the rolling window ending at `now`.
    pub fn recent_accesses(&self, record_id: &RecordId, now: DateTime<Utc>) -> usize {
        self.access
            .get(record_id)
            .map(|h| h.iter().filter(|t| now - **t <= self.access_window).count())
            .unwrap_or(0)
    }

    /// Start a fresh window, e.g. after promotion.
    pub fn reset_access(&mut self, record_id: &RecordId) {
        self.access.remove(record_id);
    }

    /// Drop every nexus point and access history.
    pub fn clear(&mut self) {
        self.points.clear();
        self.by_record.clear();
        self.access.clear();
        self.counts = SignificanceCounts::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn registry() -> NexusRegistry {
        NexusRegistry::new(Duration::hours(1), 4)
    }

    fn protect(reg: &mut NexusRegistry) -> NexusPoint {
        reg.protect(RecordId::new(), SignificanceType::User, "decision", Utc::now())
            .unwrap()
    }

    #[test]
    fn test_protect_once() {
        let mut reg = registry();
        let record_id = RecordId::new();
        reg.protect(record_id, SignificanceType::Llm, "key fact", Utc::now())
            .unwrap();

        assert!(reg.is_protected(&record_id));
        assert!(!reg.demote_candidate(&record_id));
        assert!(reg.demote_candidate(&RecordId::new()));

        let err = reg
            .protect(record_id, SignificanceType::User, "again", Utc::now())
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyProtected { .. }));
        assert_eq!(reg.counts().llm, 1);
        assert_eq!(reg.counts().total(), 1);
    }

    #[test]
    fn test_link_is_symmetric_and_idempotent() {
        let mut reg = registry();
        let a = protect(&mut reg);
        let b = protect(&mut reg);

        assert!(reg.link(a.id, b.id).unwrap());
        let once = reg.point(&a.id).unwrap().related.clone();
        assert!(!reg.link(a.id, b.id).unwrap());
        assert!(!reg.link(b.id, a.id).unwrap());

        assert_eq!(reg.point(&a.id).unwrap().related, once);
        assert!(reg.point(&b.id).unwrap().related.contains(&a.id));
    }

    #[test]
    fn test_link_errors() {
        let mut reg = registry();
        let a = protect(&mut reg);
        assert!(matches!(
            reg.link(a.id, NexusId::new()),
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            reg.link(a.id, a.id),
            Err(Error::InvalidOperation(_))
        ));
    }

    #[test]
    fn test_related_points_bfs_with_cycle() {
        let mut reg = registry();
        let a = protect(&mut reg);
        let b = protect(&mut reg);
        let c = protect(&mut reg);
        let d = protect(&mut reg);
        reg.link(a.id, b.id).unwrap();
        reg.link(b.id, c.id).unwrap();
        reg.link(c.id, a.id).unwrap();
        reg.link(c.id, d.id).unwrap();

        let one_hop: HashSet<_> = reg.related_points(a.id, 1).unwrap().into_iter().collect();
        assert_eq!(one_hop, HashSet::from([b.id, c.id]));

        let two_hops = reg.related_points(a.id, 2).unwrap();
        assert_eq!(two_hops.len(), 3);
        assert!(!two_hops.contains(&a.id));

        // Clamped to the registry bound
        assert_eq!(reg.related_points(a.id, 100).unwrap().len(), 3);
    }

    #[test]
    fn test_release_unlinks() {
        let mut reg = registry();
        let a = protect(&mut reg);
        let b = protect(&mut reg);
        reg.link(a.id, b.id).unwrap();

        let released = reg.release(&a.record_id).unwrap();
        assert_eq!(released.id, a.id);
        assert!(reg.point(&b.id).unwrap().related.is_empty());
        assert!(!reg.is_protected(&a.record_id));
        assert_eq!(reg.counts().user, 1);
    }

    #[test]
    fn test_access_window() {
        let mut reg = registry();
        let id = RecordId::new();
        let t0 = Utc::now();

        reg.register_access(id, t0);
        reg.register_access(id, t0 + Duration::minutes(10));
        assert_eq!(reg.recent_accesses(&id, t0 + Duration::minutes(20)), 2);

        // First access falls out of the one-hour window
        assert_eq!(reg.recent_accesses(&id, t0 + Duration::minutes(65)), 1);

        reg.reset_access(&id);
        assert_eq!(reg.recent_accesses(&id, t0 + Duration::minutes(65)), 0);
    }

    fn policy(max_points: usize) -> AutoNexusPolicy {
        AutoNexusPolicy {
            threshold: 0.5,
            min_access_count: 5,
            max_points,
        }
    }

    fn accessed(reg: &mut NexusRegistry, times: usize, now: DateTime<Utc>) -> RecordId {
        let id = RecordId::new();
        for _ in 0..times {
            reg.register_access(id, now);
        }
        id
    }

    #[test]
    fn test_importance_weights() {
        let mut reg = registry();
        let now = Utc::now();
        assert_eq!(reg.importance(&RecordId::new(), 5, now), 0.0);

        // 5 accesses saturate frequency, access just now gives full recency
        let busy = accessed(&mut reg, 5, now);
        assert!((reg.importance(&busy, 5, now) - 0.7).abs() < 1e-9);

        // One hour later recency halves
        let later = now + Duration::minutes(60);
        assert!((reg.importance(&busy, 5, later) - (0.4 + 0.15)).abs() < 1e-9);

        // An explicit user mark adds its significance bonus
        let marked = accessed(&mut reg, 5, now);
        reg.protect(marked, SignificanceType::User, "pinned", now).unwrap();
        assert!((reg.importance(&marked, 5, now) - 0.72).abs() < 1e-9);
    }

    #[test]
    fn test_auto_protect_threshold() {
        let mut reg = registry();
        let now = Utc::now();

        // 2 accesses: 0.16 + 0.3 < 0.5
        let cold = accessed(&mut reg, 2, now);
        assert!(reg.auto_protect(cold, &policy(10), now).is_none());

        // 3 accesses: 0.24 + 0.3 >= 0.5
        let warm = accessed(&mut reg, 3, now);
        let outcome = reg.auto_protect(warm, &policy(10), now).unwrap();
        assert!(outcome.point.automatic);
        assert_eq!(outcome.point.significance, SignificanceType::System);
        assert!(outcome.evicted.is_none());
        assert!(reg.is_protected(&warm));

        // Already protected
        assert!(reg.auto_protect(warm, &policy(10), now).is_none());
    }

    #[test]
    fn test_auto_protect_cap_replaces_weakest() {
        let mut reg = registry();
        let now = Utc::now();
        let first = accessed(&mut reg, 3, now);
        reg.auto_protect(first, &policy(1), now).unwrap();

        // Same importance does not displace
        let tie = accessed(&mut reg, 3, now);
        assert!(reg.auto_protect(tie, &policy(1), now).is_none());

        let strong = accessed(&mut reg, 5, now);
        let outcome = reg.auto_protect(strong, &policy(1), now).unwrap();
        assert_eq!(outcome.evicted.unwrap().record_id, first);
        assert!(!reg.is_protected(&first));
        assert!(reg.is_protected(&strong));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_auto_protect_never_releases_marked_points() {
        let mut reg = registry();
        let now = Utc::now();
        let marked = protect(&mut reg);

        let strong = accessed(&mut reg, 5, now);
        let outcome = reg.auto_protect(strong, &policy(1), now).unwrap();
        assert!(outcome.evicted.is_none());
        assert!(reg.is_protected(&marked.record_id));
        assert_eq!(reg.len(), 2);
    }
}
