//! Operation counters and the dashboard statistics snapshot.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::memory::nexus::SignificanceCounts;
use crate::memory::pruning::PassReport;
use crate::memory::types::PoolStats;

/// Recall latencies kept for the running average.
const RECALL_WINDOW: usize = 100;

/// Counters owned by one manager. Reset on session teardown.
#[derive(Debug, Clone, Default)]
pub struct Statistics {
    pub promotions: u64,
    pub demotions: u64,
    pub merges: u64,
    pub retrievals: u64,
    pub compression_count: u64,
    pub generations: u64,
    recall_ms: VecDeque<f64>,
    recall_sum: f64,
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one retrieval and its latency.
    pub fn record_retrieval(&mut self, latency_ms: f64) {
        self.retrievals += 1;
        self.recall_ms.push_back(latency_ms);
        self.recall_sum += latency_ms;
        if self.recall_ms.len() > RECALL_WINDOW {
            if let Some(old) = self.recall_ms.pop_front() {
                self.recall_sum -= old;
            }
        }
    }

    /// Average latency of the last 100 retrievals, in milliseconds.
    pub fn avg_recall_time(&self) -> f64 {
        if self.recall_ms.is_empty() {
            0.0
        } else {
            self.recall_sum / self.recall_ms.len() as f64
        }
    }

    pub fn apply_pass(&mut self, report: &PassReport) {
        self.demotions += report.demotions;
        self.compression_count += report.compressions;
        self.merges += report.merges;
        self.generations += 1;
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Bounded pool as shown on the dashboard.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundedPool {
    pub size: u64,
    pub count: usize,
    pub limit: u64,
    pub utilization: f64,
}

/// Unbounded pool as shown on the dashboard.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UnboundedPool {
    pub size: u64,
    pub count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PoolsSnapshot {
    pub working: BoundedPool,
    pub short_term: BoundedPool,
    pub long_term: UnboundedPool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OperationsSnapshot {
    pub promotions: u64,
    pub demotions: u64,
    pub merges: u64,
    pub retrievals: u64,
    pub avg_recall_time: f64,
    pub compression_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NexusSnapshot {
    pub count: u64,
    pub types: SignificanceCounts,
}

/// Read-only statistics in the shape dashboard consumers expect.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub pools: PoolsSnapshot,
    pub operations: OperationsSnapshot,
    pub nexus_points: NexusSnapshot,
    pub generations: u64,
    pub total_tokens: u64,
}

impl StatsSnapshot {
    pub fn build(
        stats: &Statistics,
        working: PoolStats,
        short_term: PoolStats,
        long_term: PoolStats,
        nexus: SignificanceCounts,
    ) -> Self {
        let bounded = |pool: PoolStats| BoundedPool {
            size: pool.size_tokens,
            count: pool.count,
            limit: pool.capacity_tokens.unwrap_or(0),
            utilization: pool.utilization().unwrap_or(0.0),
        };

        Self {
            pools: PoolsSnapshot {
                working: bounded(working),
                short_term: bounded(short_term),
                long_term: UnboundedPool {
                    size: long_term.size_tokens,
                    count: long_term.count,
                },
            },
            operations: OperationsSnapshot {
                promotions: stats.promotions,
                demotions: stats.demotions,
                merges: stats.merges,
                retrievals: stats.retrievals,
                avg_recall_time: stats.avg_recall_time(),
                compression_count: stats.compression_count,
            },
            nexus_points: NexusSnapshot {
                count: nexus.total(),
                types: nexus,
            },
            generations: stats.generations,
            total_tokens: working.size_tokens + short_term.size_tokens + long_term.size_tokens,
        }
    }
}
