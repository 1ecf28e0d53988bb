//! Event feed for memory operations.
//!
//! Events are emitted synchronously from the manager through an
//! [`EventEmitter`]. A transport layer subscribes to a [`BroadcastEmitter`]
//! and forwards events to its clients; the serialized shape
//! (`id`, `timestamp`, `type`, `message`, `w3w`) is what dashboard
//! consumers already parse.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;

use crate::config::MemoryConfig;
use crate::memory::{Reference, Tier};

/// Severity of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// What happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MemoryEventKind {
    RecordAdded { tier: Tier },
    RecordMoved { from: Tier, to: Tier },
    RecordPromoted { from: Tier, to: Tier },
    NexusCreated,
    NexusReleased,
    CompressionExecuted { merged: usize, tokens_saved: u64 },
    RecordsPurged { count: usize },
    CapacityViolation { tier: Tier },
    PersistenceDegraded,
}

/// One entry of the event feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEvent {
    /// Millisecond timestamp rendered as a string
    pub id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub severity: Severity,
    pub message: String,
    #[serde(rename = "w3w", skip_serializing_if = "Option::is_none")]
    pub reference: Option<Reference>,
    #[serde(flatten)]
    pub kind: MemoryEventKind,
}

impl MemoryEvent {
    pub fn new(
        kind: MemoryEventKind,
        severity: Severity,
        message: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: timestamp.timestamp_millis().to_string(),
            timestamp,
            severity,
            message: message.into(),
            reference: None,
            kind,
        }
    }

    pub fn with_reference(mut self, reference: Reference) -> Self {
        self.reference = Some(reference);
        self
    }

    pub fn record_added(reference: Reference, tokens: u64, at: DateTime<Utc>) -> Self {
        Self::new(
            MemoryEventKind::RecordAdded {
                tier: Tier::Working,
            },
            Severity::Info,
            format!("Added {} tokens to working memory", tokens),
            at,
        )
        .with_reference(reference)
    }

    pub fn record_moved(reference: Reference, from: Tier, to: Tier, at: DateTime<Utc>) -> Self {
        Self::new(
            MemoryEventKind::RecordMoved { from, to },
            Severity::Info,
            format!("Moved record from {} to {}", from, to),
            at,
        )
        .with_reference(reference)
    }

    pub fn record_promoted(
        reference: Reference,
        from: Tier,
        to: Tier,
        at: DateTime<Utc>,
    ) -> Self {
        Self::new(
            MemoryEventKind::RecordPromoted { from, to },
            Severity::Info,
            format!("Promoted record from {} to {}", from, to),
            at,
        )
        .with_reference(reference)
    }

    pub fn nexus_created(reference: Reference, description: &str, at: DateTime<Utc>) -> Self {
        Self::new(
            MemoryEventKind::NexusCreated,
            Severity::Info,
            format!("Nexus point created: {}", description),
            at,
        )
        .with_reference(reference)
    }

    pub fn nexus_released(reference: Reference, at: DateTime<Utc>) -> Self {
        Self::new(
            MemoryEventKind::NexusReleased,
            Severity::Info,
            "Automatic nexus point released",
            at,
        )
        .with_reference(reference)
    }

    pub fn compression_executed(
        reference: Reference,
        merged: usize,
        original_tokens: u64,
        summary_tokens: u64,
        at: DateTime<Utc>,
    ) -> Self {
        let tokens_saved = original_tokens.saturating_sub(summary_tokens);
        Self::new(
            MemoryEventKind::CompressionExecuted {
                merged,
                tokens_saved,
            },
            Severity::Info,
            format!(
                "Compressed {} records ({} -> {} tokens)",
                merged, original_tokens, summary_tokens
            ),
            at,
        )
        .with_reference(reference)
    }

    pub fn records_purged(count: usize, at: DateTime<Utc>) -> Self {
        Self::new(
            MemoryEventKind::RecordsPurged { count },
            Severity::Warning,
            format!("Purged {} stale records", count),
            at,
        )
    }

    pub fn capacity_violation(tier: Tier, message: String, at: DateTime<Utc>) -> Self {
        Self::new(
            MemoryEventKind::CapacityViolation { tier },
            Severity::Error,
            message,
            at,
        )
    }

    pub fn persistence_degraded(message: String, at: DateTime<Utc>) -> Self {
        Self::new(
            MemoryEventKind::PersistenceDegraded,
            Severity::Error,
            message,
            at,
        )
    }

    /// Single-line rendering for logs and CLIs.
    pub fn as_log_line(&self) -> String {
        let level = match self.severity {
            Severity::Info => "INFO",
            Severity::Warning => "WARN",
            Severity::Error => "ERROR",
        };
        match &self.reference {
            Some(r) => format!("[{}] {} ({})", level, self.message, r),
            None => format!("[{}] {}", level, self.message),
        }
    }
}

/// Sink for memory events.
pub trait EventEmitter: Send + Sync {
    fn emit(&self, event: MemoryEvent);
}

/// Broadcast-based event emitter.
pub struct BroadcastEmitter {
    sender: broadcast::Sender<MemoryEvent>,
}

impl BroadcastEmitter {
    /// Create new broadcast emitter with channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Emitter sized by `event_channel_capacity`.
    pub fn from_config(config: &MemoryConfig) -> Self {
        Self::new(config.event_channel_capacity)
    }

    /// Subscribe to memory events.
    pub fn subscribe(&self) -> broadcast::Receiver<MemoryEvent> {
        self.sender.subscribe()
    }

    /// Get number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl EventEmitter for BroadcastEmitter {
    fn emit(&self, event: MemoryEvent) {
        // No subscribers is not an error
        let _ = self.sender.send(event);
    }
}

/// Collecting emitter that stores events in a Vec.
#[derive(Debug, Default, Clone)]
pub struct CollectingEmitter {
    events: Arc<RwLock<Vec<MemoryEvent>>>,
}

impl CollectingEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get collected events.
    pub fn events(&self) -> Vec<MemoryEvent> {
        self.events
            .read()
            .map(|e| e.clone())
            .unwrap_or_default()
    }

    /// Clear collected events.
    pub fn clear(&self) {
        if let Ok(mut events) = self.events.write() {
            events.clear();
        }
    }
}

impl EventEmitter for CollectingEmitter {
    fn emit(&self, event: MemoryEvent) {
        if let Ok(mut events) = self.events.write() {
            events.push(event);
        }
    }
}

/// Null emitter that discards all events.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEmitter;

impl EventEmitter for NullEmitter {
    fn emit(&self, _event: MemoryEvent) {}
}
