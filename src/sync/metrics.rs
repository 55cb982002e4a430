//! Metrics tracking for synchronization.
//!
//! This module provides the `MetricsTracker`, which accumulates processing times and conflict
//! counters across sync cycles and derives a `SyncMetrics` snapshot from the current queue
//! contents. The orchestrator recomputes the snapshot after every state transition.

use crate::queue::StatusCounts;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

/// Success rate below which the engine reports itself degraded
const DEGRADED_SUCCESS_RATE: f64 = 0.9;
/// Success rate below which the engine reports itself unhealthy
const UNHEALTHY_SUCCESS_RATE: f64 = 0.5;
/// Share of queue capacity occupied by pending work that counts as a backlog
const BACKLOG_RATIO: f64 = 0.8;

/// Derived snapshot of the engine's state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMetrics {
    pub total_operations: usize,
    pub pending_operations: usize,
    pub processing_operations: usize,
    pub completed_operations: usize,
    /// Failed operations still waiting for a retry
    pub retrying_operations: usize,
    /// Operations that failed terminally
    pub failed_operations: usize,
    pub cancelled_operations: usize,
    /// Running average over completed replays
    pub average_processing_time_ms: f64,
    pub queue_size: usize,
    pub success_rate: f64,
    pub last_processed: Option<DateTime<Utc>>,
    pub conflicts_detected: u64,
    pub conflicts_resolved: u64,
    pub conflicts_pending: usize,
}

/// Coarse health derived from metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl SyncMetrics {
    /// Health relative to a queue of the given capacity
    pub fn health(&self, capacity: usize) -> HealthStatus {
        if self.success_rate < UNHEALTHY_SUCCESS_RATE {
            return HealthStatus::Unhealthy;
        }
        let backlog = capacity > 0 && self.pending_operations as f64 > capacity as f64 * BACKLOG_RATIO;
        if self.success_rate < DEGRADED_SUCCESS_RATE || backlog {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }

    /// Get a human-readable summary of the metrics
    pub fn summary(&self) -> String {
        format!(
            "{} operations: {} pending, {} completed, {} retrying, {} failed, {} cancelled; success rate {:.2}, avg {:.1} ms{}",
            self.total_operations,
            self.pending_operations,
            self.completed_operations,
            self.retrying_operations,
            self.failed_operations,
            self.cancelled_operations,
            self.success_rate,
            self.average_processing_time_ms,
            if self.conflicts_pending == 0 {
                String::new()
            } else {
                format!(" ({} conflicts awaiting resolution)", self.conflicts_pending)
            }
        )
    }
}

/// Accumulates counters that cannot be derived from the queue alone
#[derive(Debug, Clone, Default)]
pub struct MetricsTracker {
    /// Number of completed replays contributing to the average
    samples: u64,
    average_processing_time_ms: f64,
    last_processed: Option<DateTime<Utc>>,
    conflicts_detected: u64,
    conflicts_resolved: u64,
    /// Last snapshot produced by `refresh`
    current: SyncMetrics,
}

impl MetricsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore counters from an exported snapshot
    pub fn from_snapshot(metrics: &SyncMetrics) -> Self {
        Self {
            samples: metrics.completed_operations as u64,
            average_processing_time_ms: metrics.average_processing_time_ms,
            last_processed: metrics.last_processed,
            conflicts_detected: metrics.conflicts_detected,
            conflicts_resolved: metrics.conflicts_resolved,
            current: metrics.clone(),
        }
    }

    /// Record a completed replay and fold its duration into the running average
    pub fn record_success(&mut self, processing_time: Duration) {
        let millis = processing_time.as_secs_f64() * 1000.0;
        self.samples += 1;
        self.average_processing_time_ms +=
            (millis - self.average_processing_time_ms) / self.samples as f64;
        self.last_processed = Some(Utc::now());
    }

    /// Record a failed attempt
    pub fn record_failure(&mut self) {
        self.last_processed = Some(Utc::now());
    }

    pub fn record_conflict(&mut self) {
        self.conflicts_detected += 1;
    }

    pub fn record_resolution(&mut self) {
        self.conflicts_resolved += 1;
    }

    /// Recompute the snapshot from the queue's status counts
    pub fn refresh(
        &mut self,
        counts: &StatusCounts,
        queue_size: usize,
        conflicts_pending: usize,
    ) -> &SyncMetrics {
        let finished = counts.completed + counts.failed;
        let success_rate = if finished == 0 {
            1.0
        } else {
            counts.completed as f64 / finished as f64
        };

        self.current = SyncMetrics {
            total_operations: queue_size,
            pending_operations: counts.pending,
            processing_operations: counts.processing,
            completed_operations: counts.completed,
            retrying_operations: counts.retrying,
            failed_operations: counts.failed,
            cancelled_operations: counts.cancelled,
            average_processing_time_ms: self.average_processing_time_ms,
            queue_size: counts.pending + counts.processing + counts.retrying,
            success_rate,
            last_processed: self.last_processed,
            conflicts_detected: self.conflicts_detected,
            conflicts_resolved: self.conflicts_resolved,
            conflicts_pending,
        };
        &self.current
    }

    pub fn current(&self) -> &SyncMetrics {
        &self.current
    }

    /// Log a summary line
    pub fn log_summary(&self) {
        info!("Sync metrics: {}", self.current.summary());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts(pending: usize, completed: usize, failed: usize) -> StatusCounts {
        StatusCounts {
            pending,
            completed,
            failed,
            ..StatusCounts::default()
        }
    }

    #[test]
    fn test_running_average() {
        let mut tracker = MetricsTracker::new();
        tracker.record_success(Duration::from_millis(100));
        tracker.record_success(Duration::from_millis(300));
        let metrics = tracker.refresh(&counts(0, 2, 0), 2, 0);
        assert!((metrics.average_processing_time_ms - 200.0).abs() < 1e-9);
        assert!(metrics.last_processed.is_some());
    }

    #[test]
    fn test_success_rate_and_health() {
        let mut tracker = MetricsTracker::new();
        assert_eq!(tracker.refresh(&counts(0, 0, 0), 0, 0).success_rate, 1.0);
        assert_eq!(tracker.current().health(100), HealthStatus::Healthy);

        tracker.refresh(&counts(0, 8, 2), 10, 0);
        assert_eq!(tracker.current().success_rate, 0.8);
        assert_eq!(tracker.current().health(100), HealthStatus::Degraded);

        tracker.refresh(&counts(0, 1, 3), 4, 0);
        assert_eq!(tracker.current().health(100), HealthStatus::Unhealthy);

        tracker.refresh(&counts(90, 10, 0), 100, 0);
        assert_eq!(tracker.current().health(100), HealthStatus::Degraded);
    }

    #[test]
    fn test_snapshot_restores_counters() {
        let mut tracker = MetricsTracker::new();
        tracker.record_conflict();
        tracker.record_conflict();
        tracker.record_resolution();
        let snapshot = tracker.refresh(&counts(1, 0, 0), 1, 1).clone();

        let restored = MetricsTracker::from_snapshot(&snapshot);
        assert_eq!(restored.current(), &snapshot);
        assert_eq!(restored.current().conflicts_detected, 2);
        assert_eq!(restored.current().conflicts_pending, 1);
    }
}
