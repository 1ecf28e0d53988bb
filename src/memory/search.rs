//! Keyword search and partial reference lookup.
//!
//! Scoring is a weighted heuristic over signals available without an index:
//!
//! | Signal | Weight |
//! |--------|--------|
//! | Fraction of query terms found in the content | 0.5 |
//! | Whole query found verbatim | 0.1 |
//! | Fraction of reference words containing a term | 0.1 |
//! | Record is protected | 0.1 |
//! | Recency, `1 / (1 + age in days)` | 0.1 |
//! | Tier warmth (working 1, short-term 0.5, long-term 0.25, stale 0) | 0.1 |
//!
//! A record with neither a content nor a reference match never scores.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{Error, Result};
use crate::memory::types::{MemoryRecord, Tier};

/// One search result, with the record as it stands after access bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub record: MemoryRecord,
    pub score: f64,
}

/// Lowercase alphanumeric runs, in order.
fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// A parsed search query.
#[derive(Debug, Clone)]
pub(crate) struct Query {
    terms: Vec<String>,
    phrase: String,
}

impl Query {
    pub fn parse(query: &str) -> Result<Self> {
        let mut terms = tokenize(query);
        if terms.is_empty() {
            return Err(Error::InvalidOperation(
                "search query has no terms".to_string(),
            ));
        }
        let phrase = terms.join(" ");
        let mut seen = std::collections::HashSet::new();
        terms.retain(|t| seen.insert(t.clone()));
        Ok(Self { terms, phrase })
    }

    pub fn terms(&self) -> usize {
        self.terms.len()
    }

    /// Relevance of `record`, or None when nothing matches.
    pub fn score(&self, record: &MemoryRecord, protected: bool, now: DateTime<Utc>) -> Option<f64> {
        let content = tokenize(&record.content).join(" ");

        let found = self.terms.iter().filter(|t| content.contains(t.as_str())).count();
        let coverage = found as f64 / self.terms.len() as f64;

        let reference_words: Vec<&str> = record.reference.words().collect();
        let reference = reference_words
            .iter()
            .filter(|w| self.terms.iter().any(|t| w.contains(t.as_str())))
            .count() as f64
            / reference_words.len().max(1) as f64;

        if found == 0 && reference == 0.0 {
            return None;
        }

        let phrase = if content.contains(&self.phrase) { 1.0 } else { 0.0 };
        let nexus = if protected { 1.0 } else { 0.0 };
        let age_days = (now - record.created_at).num_seconds().max(0) as f64 / 86_400.0;
        let recency = 1.0 / (1.0 + age_days);
        let warmth = match record.tier {
            Tier::Working => 1.0,
            Tier::ShortTerm => 0.5,
            Tier::LongTerm => 0.25,
            Tier::Stale => 0.0,
        };

        Some(
            0.5 * coverage
                + 0.1 * phrase
                + 0.1 * reference
                + 0.1 * nexus
                + 0.1 * recency
                + 0.1 * warmth,
        )
    }
}

/// Lowercased, trimmed reference fragments; rejects an empty list or fragment.
pub(crate) fn fragments(words: &[&str]) -> Result<Vec<String>> {
    if words.is_empty() {
        return Err(Error::InvalidReference("no words given".to_string()));
    }
    words
        .iter()
        .map(|w| {
            let w = w.trim().to_lowercase();
            if w.is_empty() {
                Err(Error::InvalidReference("empty word".to_string()))
            } else {
                Ok(w)
            }
        })
        .collect()
}

/// Whether every fragment is part of one word of the record's own reference
/// or of a reference merged into it.
pub(crate) fn matches_reference(record: &MemoryRecord, fragments: &[String]) -> bool {
    std::iter::once(&record.reference)
        .chain(record.derived_from.iter())
        .any(|reference| {
            fragments
                .iter()
                .all(|f| reference.words().any(|w| w.contains(f.as_str())))
        })
}
