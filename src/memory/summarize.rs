//! Summary generation for compressed batches.
//!
//! The pruning engine owns batching and thresholds; the text of a summary is
//! a pluggable strategy so callers can swap in an LLM-backed summarizer.

use std::fmt::Debug;

use crate::memory::types::{MemoryRecord, Role};

/// Produces the content of a summary record for a batch of records.
pub trait Summarizer: Send + Sync + Debug {
    fn summarize(&self, records: &[MemoryRecord]) -> String;
}

/// Extractive summarizer: turn counts plus a truncated excerpt of each turn.
#[derive(Debug, Clone)]
pub struct DigestSummarizer {
    /// Characters kept from each record before the ellipsis
    pub excerpt_chars: usize,
}

impl Default for DigestSummarizer {
    fn default() -> Self {
        Self { excerpt_chars: 97 }
    }
}

impl DigestSummarizer {
    fn excerpt(&self, content: &str) -> String {
        let content = content.trim();
        if content.chars().count() > self.excerpt_chars + 3 {
            let cut: String = content.chars().take(self.excerpt_chars).collect();
            format!("{}...", cut)
        } else {
            content.to_string()
        }
    }

    fn key_points<'a>(&self, records: impl Iterator<Item = &'a MemoryRecord>) -> String {
        records
            .map(|r| self.excerpt(&r.content))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

impl Summarizer for DigestSummarizer {
    fn summarize(&self, records: &[MemoryRecord]) -> String {
        let by_role = |role: Role| records.iter().filter(move |r| r.role == role);
        let users = by_role(Role::User).count();
        let assistants = by_role(Role::Assistant).count();
        let others: Vec<_> = records
            .iter()
            .filter(|r| !matches!(r.role, Role::User | Role::Assistant))
            .collect();

        let mut lines = vec![
            "Previous conversation summary:".to_string(),
            format!(
                "- User made {} requests, focusing on: {}",
                users,
                self.key_points(by_role(Role::User))
            ),
            format!(
                "- Assistant provided {} responses, key points: {}",
                assistants,
                self.key_points(by_role(Role::Assistant))
            ),
        ];
        if !others.is_empty() {
            lines.push(format!(
                "- {} earlier notes: {}",
                others.len(),
                self.key_points(others.into_iter())
            ));
        }
        lines.join("\n")
    }
}
