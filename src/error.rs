//! Error types for nexus-memory.

use thiserror::Error;

use crate::memory::Tier;

/// Result type alias using nexus-memory's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during memory operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Reference, record id or nexus point is not known to any tier
    #[error("Not found: {0}")]
    NotFound(String),

    /// Record already carries a nexus point
    #[error("Record {record_id} is already protected")]
    AlreadyProtected { record_id: String },

    /// Reference generation ran out of attempts
    #[error("Reference space exhausted after {attempts} attempts")]
    ReferenceExhausted { attempts: u32 },

    /// A completed pass left a bounded tier over its capacity
    #[error("Capacity violation in {tier}: {size_tokens} tokens exceeds {capacity_tokens}")]
    CapacityViolation {
        tier: Tier,
        size_tokens: u64,
        capacity_tokens: u64,
    },

    /// Persistence collaborator failed to load or save
    #[error("Persistence failure: {message}")]
    PersistenceFailure {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Timeout during operation
    #[error("Operation timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    /// Malformed three-word reference
    #[error("Invalid reference: {0}")]
    InvalidReference(String),

    /// Operation not allowed in the current state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a not-found error.
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Create an already-protected error.
    pub fn already_protected(record_id: impl ToString) -> Self {
        Self::AlreadyProtected {
            record_id: record_id.to_string(),
        }
    }

    /// Create a persistence failure without a source.
    pub fn persistence(message: impl Into<String>) -> Self {
        Self::PersistenceFailure {
            message: message.into(),
            source: None,
        }
    }

    /// Create a persistence failure wrapping the collaborator's error.
    pub fn persistence_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::PersistenceFailure {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a timeout error.
    pub fn timeout(duration_ms: u64) -> Self {
        Self::Timeout { duration_ms }
    }

    /// Whether the error leaves the session usable but degraded.
    pub fn is_persistence(&self) -> bool {
        matches!(self, Self::PersistenceFailure { .. } | Self::Timeout { .. })
    }
}
