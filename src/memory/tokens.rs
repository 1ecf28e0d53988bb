//! Token counting for record budgets.
//!
//! The heuristic counter is the default. [`TiktokenCounter`] gives exact BPE
//! counts for OpenAI-style encodings at the cost of loading the rank tables.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug};
use std::sync::Arc;
use tiktoken_rs::CoreBPE;

use crate::error::{Error, Result};

/// Counts tokens for a piece of content.
///
/// Counting happens once per record, at creation.
pub trait TokenCounter: Send + Sync + Debug {
    fn count(&self, text: &str) -> u64;
}

/// Approximation of four bytes per token, rounded up.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeuristicTokenCounter;

impl TokenCounter for HeuristicTokenCounter {
    fn count(&self, text: &str) -> u64 {
        (text.len() as u64 + 3) / 4
    }
}

/// One token per whitespace-separated word.
#[derive(Debug, Default, Clone, Copy)]
pub struct WordTokenCounter;

impl TokenCounter for WordTokenCounter {
    fn count(&self, text: &str) -> u64 {
        text.split_whitespace().count() as u64
    }
}

/// BPE encodings supported by [`TiktokenCounter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenEncoding {
    /// GPT-4, GPT-3.5-turbo, text-embedding-3
    Cl100kBase,
    /// GPT-4o
    O200kBase,
}

/// Exact token counts from a tiktoken BPE encoder.
#[derive(Clone)]
pub struct TiktokenCounter {
    encoding: TokenEncoding,
    bpe: Arc<CoreBPE>,
}

impl TiktokenCounter {
    pub fn new(encoding: TokenEncoding) -> Result<Self> {
        let bpe = match encoding {
            TokenEncoding::Cl100kBase => tiktoken_rs::cl100k_base(),
            TokenEncoding::O200kBase => tiktoken_rs::o200k_base(),
        }
        .map_err(|e| Error::Config(format!("Failed to initialize tokenizer: {}", e)))?;

        Ok(Self {
            encoding,
            bpe: Arc::new(bpe),
        })
    }

    pub fn cl100k() -> Result<Self> {
        Self::new(TokenEncoding::Cl100kBase)
    }

    pub fn encoding(&self) -> TokenEncoding {
        self.encoding
    }
}

impl Debug for TiktokenCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TiktokenCounter")
            .field("encoding", &self.encoding)
            .finish_non_exhaustive()
    }
}

impl TokenCounter for TiktokenCounter {
    fn count(&self, text: &str) -> u64 {
        self.bpe.encode_with_special_tokens(text).len() as u64
    }
}

/// Which counter a manager builds when none is injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tokenizer {
    #[default]
    Heuristic,
    Words,
    Tiktoken(TokenEncoding),
}

impl Tokenizer {
    pub fn counter(self) -> Result<Arc<dyn TokenCounter>> {
        Ok(match self {
            Self::Heuristic => Arc::new(HeuristicTokenCounter),
            Self::Words => Arc::new(WordTokenCounter),
            Self::Tiktoken(encoding) => Arc::new(TiktokenCounter::new(encoding)?),
        })
    }
}
