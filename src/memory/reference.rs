//! Three-word references for records.
//!
//! A reference is an ordered triplet of distinct words (`maple.harbor.quartz`)
//! that aliases a record id. Generation is deterministic for a given
//! (record id, counter) pair:
//!
//! 1. SHA-256 over the id bytes and the codec's counter yields a seed.
//! 2. The seed picks a rank in the space of `n·(n-1)·(n-2)` ordered triplets.
//! 3. The rank is decoded into three words drawn without replacement.
//!
//! On collision the rank is perturbed to the next slot and retried, up to the
//! configured attempt budget.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::borrow::Borrow;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::memory::types::RecordId;
use crate::memory::words::DEFAULT_WORDS;

const SEPARATOR: char = '.';

/// Human-memorable alias for a record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Reference(String);

impl Reference {
    /// Build a reference from three words.
    pub fn from_words(words: [&str; 3]) -> Self {
        Self(words.join("."))
    }

    /// Parse `a.b.c`; each word must be non-empty lowercase ASCII and distinct.
    pub fn parse(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split(SEPARATOR).collect();
        let well_formed = parts.len() == 3
            && parts
                .iter()
                .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_lowercase()))
            && parts[0] != parts[1]
            && parts[1] != parts[2]
            && parts[0] != parts[2];
        if !well_formed {
            return Err(Error::InvalidReference(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn words(&self) -> impl Iterator<Item = &str> {
        self.0.split(SEPARATOR)
    }
}

impl Borrow<str> for Reference {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Generates references and resolves them back to record ids.
#[derive(Debug, Clone)]
pub struct ReferenceCodec {
    words: Arc<[String]>,
    max_attempts: u32,
    counter: u64,
    /// Live reference -> record mapping
    index: HashMap<Reference, RecordId>,
    /// Every reference ever issued, including retired ones
    issued: HashSet<Reference>,
}

impl ReferenceCodec {
    /// Create a codec over a custom word list.
    pub fn new<I, S>(words: I, max_attempts: u32) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let words: Vec<String> = words.into_iter().map(Into::into).collect();
        let unique: HashSet<&String> = words.iter().collect();
        if unique.len() != words.len() {
            return Err(Error::Config("word list contains duplicates".to_string()));
        }
        if words.len() < 3 {
            return Err(Error::Config(format!(
                "word list needs at least 3 words, got {}",
                words.len()
            )));
        }
        if let Some(bad) = words
            .iter()
            .find(|w| w.is_empty() || !w.chars().all(|c| c.is_ascii_lowercase()))
        {
            return Err(Error::Config(format!("invalid reference word: {:?}", bad)));
        }
        if max_attempts == 0 {
            return Err(Error::Config("max_attempts must be positive".to_string()));
        }

        Ok(Self {
            words: words.into(),
            max_attempts,
            counter: 0,
            index: HashMap::new(),
            issued: HashSet::new(),
        })
    }

    /// Create a codec over the built-in word list.
    pub fn with_default_words(max_attempts: u32) -> Result<Self> {
        Self::new(DEFAULT_WORDS.iter().copied(), max_attempts)
    }

    /// Number of distinct ordered triplets.
    pub fn space(&self) -> u64 {
        let n = self.words.len() as u64;
        n * (n - 1) * (n - 2)
    }

    /// Number of references issued so far.
    pub fn issued(&self) -> usize {
        self.issued.len()
    }

    /// Reserve a fresh reference for `id`.
    ///
    /// The reference is not resolvable until [`bind`](Self::bind) is called;
    /// call [`release`](Self::release) if the record is never created.
    pub fn reserve(&mut self, id: &RecordId) -> Result<Reference> {
        let seed = self.seed(id);
        self.counter += 1;
        let space = self.space();
        let start = seed % space;

        for attempt in 0..self.max_attempts {
            let rank = (start + attempt as u64) % space;
            let candidate = self.decode(rank);
            if self.issued.insert(candidate.clone()) {
                if attempt > 0 {
                    debug!(record_id = %id, attempt, reference = %candidate, "Reference collision resolved");
                }
                return Ok(candidate);
            }
        }

        warn!(record_id = %id, attempts = self.max_attempts, "Reference space exhausted");
        Err(Error::ReferenceExhausted {
            attempts: self.max_attempts,
        })
    }

    /// Make a reserved reference resolvable.
    pub fn bind(&mut self, reference: Reference, id: RecordId) {
        self.index.insert(reference, id);
    }

    /// Return a reserved-but-unbound reference to the pool.
    pub fn release(&mut self, reference: &Reference) {
        if !self.index.contains_key(reference) {
            self.issued.remove(reference);
        }
    }

    /// Register an existing reference, e.g. one loaded from persistence.
    pub fn restore(&mut self, reference: Reference, id: RecordId) -> Result<()> {
        if let Some(existing) = self.index.get(&reference) {
            if *existing != id {
                return Err(Error::Internal(format!(
                    "reference {} already bound to {}",
                    reference, existing
                )));
            }
        }
        self.issued.insert(reference.clone());
        self.index.insert(reference, id);
        Ok(())
    }

    /// Re-point a reference at another record (merged original -> summary).
    pub fn forward(&mut self, reference: &Reference, id: RecordId) {
        if let Some(target) = self.index.get_mut(reference) {
            *target = id;
        }
    }

    /// Stop resolving a reference. It stays reserved and is never reissued.
    pub fn retire(&mut self, reference: &Reference) {
        self.index.remove(reference);
    }

    pub fn resolve(&self, reference: &str) -> Result<RecordId> {
        self.index
            .get(reference)
            .copied()
            .ok_or_else(|| Error::not_found(reference.to_string()))
    }

    /// Every live reference currently pointing at `id`.
    pub fn references_to(&self, id: &RecordId) -> Vec<Reference> {
        let mut refs: Vec<_> = self
            .index
            .iter()
            .filter(|(_, target)| *target == id)
            .map(|(r, _)| r.clone())
            .collect();
        refs.sort();
        refs
    }

    /// A copy with nothing bound. References issued so far stay reserved, so a
    /// reload never hands out an alias that was already in use.
    pub fn unbound(&self) -> Self {
        Self {
            words: Arc::clone(&self.words),
            max_attempts: self.max_attempts,
            counter: self.counter,
            index: HashMap::new(),
            issued: self.issued.clone(),
        }
    }

    /// Forget every reference, issued ones included.
    pub fn clear(&mut self) {
        self.index.clear();
        self.issued.clear();
        self.counter = 0;
    }

    fn seed(&self, id: &RecordId) -> u64 {
        let mut hasher = Sha256::new();
        hasher.update(id.as_bytes());
        hasher.update(self.counter.to_le_bytes());
        let digest = hasher.finalize();
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        u64::from_le_bytes(bytes)
    }

    /// Decode a rank into three distinct words.
    fn decode(&self, rank: u64) -> Reference {
        let n = self.words.len() as u64;
        let first = rank / ((n - 1) * (n - 2));
        let rem = rank % ((n - 1) * (n - 2));
        let mut second = rem / (n - 2);
        let mut third = rem % (n - 2);

        if second >= first {
            second += 1;
        }
        let (lo, hi) = if first < second {
            (first, second)
        } else {
            (second, first)
        };
        if third >= lo {
            third += 1;
        }
        if third >= hi {
            third += 1;
        }

        Reference::from_words([
            self.words[first as usize].as_str(),
            self.words[second as usize].as_str(),
            self.words[third as usize].as_str(),
        ])
    }
}
