//! Property-based tests for tier migration using proptest.
//!
//! These exercise the manager with arbitrary conversations and check that:
//!
//! - Bounded tiers never finish a pass over capacity
//! - Protected records are never summarized or staled
//! - Every issued reference keeps resolving
//! - Without retrieval, a reference only ever moves toward colder tiers

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use proptest::prelude::*;
    use std::collections::HashMap;
    use std::sync::Arc;

    use crate::clock::ManualClock;
    use crate::config::MemoryConfig;
    use crate::memory::manager::MemoryManager;
    use crate::memory::nexus::NexusRegistry;
    use crate::memory::reference::{Reference, ReferenceCodec};
    use crate::memory::types::{RecordId, Role, SignificanceType, Tier};

    fn manager(config: MemoryConfig) -> (MemoryManager, ManualClock) {
        let clock = ManualClock::default();
        let manager = MemoryManager::builder(config)
            .with_clock(Arc::new(clock.clone()))
            .build()
            .unwrap();
        (manager, clock)
    }

    /// Small tiers so short conversations already cascade to long-term.
    fn tight_config() -> MemoryConfig {
        MemoryConfig::default()
            .with_working_capacity(1500)
            .with_max_working_records(Some(12))
            .with_short_term_capacity(3000)
            .with_preserve_count(3)
    }

    // Turn lengths in characters (1..=500 tokens with the heuristic counter)
    fn turn_lengths() -> impl Strategy<Value = Vec<usize>> {
        prop::collection::vec(1usize..2000, 1..80)
    }

    fn role() -> impl Strategy<Value = Role> {
        prop_oneof![Just(Role::User), Just(Role::Assistant)]
    }

    // =========================================================================
    // Capacity
    // =========================================================================

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        /// Working and short-term stay within capacity after every ingest.
        #[test]
        fn bounded_tiers_stay_within_capacity(
            lengths in turn_lengths(),
            roles in prop::collection::vec(role(), 80),
        ) {
            let config = tight_config();
            let (mut m, clock) = manager(config.clone());

            for (i, len) in lengths.iter().enumerate() {
                clock.advance(Duration::seconds(1));
                m.ingest(roles[i], "x".repeat(*len), HashMap::new()).unwrap();

                let working = m.pool_stats(Tier::Working);
                let short = m.pool_stats(Tier::ShortTerm);
                prop_assert!(working.size_tokens <= config.working.capacity_tokens);
                prop_assert!(working.count <= 12);
                prop_assert!(short.size_tokens <= config.short_term.capacity_tokens);
            }
        }
    }

    // =========================================================================
    // Protection
    // =========================================================================

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        /// A protected record keeps its content and never reaches the stale tier.
        #[test]
        fn protected_records_are_never_summarized_or_staled(
            lengths in turn_lengths(),
            protect in prop::collection::vec(any::<bool>(), 80),
        ) {
            let (mut m, clock) = manager(tight_config());
            let mut protected = Vec::new();

            for (i, len) in lengths.iter().enumerate() {
                clock.advance(Duration::seconds(1));
                let record = m.ingest(Role::User, "y".repeat(*len), HashMap::new()).unwrap();
                if protect[i] && m.lookup(&record.id.to_string()).is_ok() {
                    m.mark_significant(&record.id, SignificanceType::User, "pinned").unwrap();
                    protected.push(record);
                }
            }

            clock.advance(Duration::days(31));
            m.run_pass().unwrap();
            m.purge_stale().unwrap();

            for original in &protected {
                let found = m.lookup(original.reference.as_str()).unwrap();
                prop_assert_eq!(found.id, original.id);
                prop_assert_eq!(&found.content, &original.content);
                prop_assert!(!found.is_summary());
                prop_assert_ne!(found.tier, Tier::Stale);
            }
        }
    }

    // =========================================================================
    // References
    // =========================================================================

    proptest! {
        /// Every reference resolves to the record it was bound to.
        #[test]
        fn references_round_trip(count in 1usize..200, attempts in 1u32..64) {
            let mut codec = ReferenceCodec::with_default_words(attempts).unwrap();
            let mut bound = Vec::new();

            for _ in 0..count {
                let id = RecordId::new();
                let reference = codec.reserve(&id).unwrap();
                codec.bind(reference.clone(), id);
                bound.push((reference, id));
            }

            prop_assert_eq!(codec.issued(), count);
            for (reference, id) in &bound {
                prop_assert_eq!(codec.resolve(reference.as_str()).unwrap(), *id);
                prop_assert_eq!(&Reference::parse(reference.as_str()).unwrap(), reference);

                let words: Vec<&str> = reference.words().collect();
                prop_assert_eq!(words.len(), 3);
                prop_assert!(words[0] != words[1] && words[1] != words[2] && words[0] != words[2]);
            }
        }

        /// Without retrieval, each reference's tier index never decreases.
        #[test]
        fn references_only_move_colder(lengths in turn_lengths()) {
            let (mut m, clock) = manager(tight_config());
            let mut seen: Vec<(Reference, usize)> = Vec::new();

            for len in &lengths {
                clock.advance(Duration::minutes(10));
                let record = m.ingest(Role::Assistant, "z".repeat(*len), HashMap::new()).unwrap();
                seen.push((record.reference, Tier::Working.index()));

                for (reference, tier) in seen.iter_mut() {
                    let now = m.lookup(reference.as_str()).unwrap().tier.index();
                    prop_assert!(now >= *tier, "{} moved from {} back to {}", reference, tier, now);
                    *tier = now;
                }
            }
        }
    }

    // =========================================================================
    // Nexus links
    // =========================================================================

    proptest! {
        /// Linking is symmetric and linking twice changes nothing.
        #[test]
        fn linking_is_symmetric_and_idempotent(n in 2usize..12, pairs in prop::collection::vec((0usize..12, 0usize..12), 1..30)) {
            let now = chrono::Utc::now();
            let mut registry = NexusRegistry::new(Duration::hours(1), 4);
            let points: Vec<_> = (0..n)
                .map(|_| registry.protect(RecordId::new(), SignificanceType::Llm, "p", now).unwrap().id)
                .collect();

            for (a, b) in pairs {
                let (a, b) = (points[a % n], points[b % n]);
                if a == b {
                    prop_assert!(registry.link(a, b).is_err());
                    continue;
                }
                registry.link(a, b).unwrap();
                prop_assert!(!registry.link(a, b).unwrap());
                prop_assert!(!registry.link(b, a).unwrap());
                prop_assert!(registry.point(&a).unwrap().related.contains(&b));
                prop_assert!(registry.point(&b).unwrap().related.contains(&a));
            }

            for id in &points {
                let point = registry.point(id).unwrap();
                prop_assert!(!point.related.contains(id));
                for other in &point.related {
                    prop_assert!(registry.point(other).unwrap().related.contains(id));
                }
            }
        }
    }
}
