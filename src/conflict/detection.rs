//! Conflict detection
//!
//! A set of independent detectors, each testing a (local, remote) pair for one kind of
//! disagreement. The engine runs all of them and reports the worst severity among those that
//! fired.

use super::types::{ConflictSeverity, Detection};
use crate::queue::{OperationType, SyncOperation};
use crate::utils::{JsonShape, extract_timestamp, extract_version};

use chrono::Duration;
use serde_json::Value;
use tracing::debug;

/// A single conflict test with a fixed severity
pub trait ConflictDetector: Send + Sync {
    fn name(&self) -> &'static str;

    fn severity(&self) -> ConflictSeverity;

    fn detect(&self, local: &Value, remote: &Value, operation: Option<&SyncOperation>) -> bool;
}

/// Both sides carry an explicit version and they differ
pub struct VersionMismatchDetector;

impl ConflictDetector for VersionMismatchDetector {
    fn name(&self) -> &'static str {
        "version_mismatch"
    }

    fn severity(&self) -> ConflictSeverity {
        ConflictSeverity::High
    }

    fn detect(&self, local: &Value, remote: &Value, _operation: Option<&SyncOperation>) -> bool {
        match (extract_version(local), extract_version(remote)) {
            (Some(l), Some(r)) => l != r,
            _ => false,
        }
    }
}

/// Modification timestamps differ by more than a threshold
pub struct TimestampSkewDetector {
    threshold: Duration,
}

impl TimestampSkewDetector {
    pub fn new(threshold: std::time::Duration) -> Self {
        Self {
            threshold: Duration::from_std(threshold).unwrap_or(Duration::seconds(60)),
        }
    }
}

impl Default for TimestampSkewDetector {
    fn default() -> Self {
        Self {
            threshold: Duration::seconds(60),
        }
    }
}

impl ConflictDetector for TimestampSkewDetector {
    fn name(&self) -> &'static str {
        "timestamp_skew"
    }

    fn severity(&self) -> ConflictSeverity {
        ConflictSeverity::Medium
    }

    fn detect(&self, local: &Value, remote: &Value, _operation: Option<&SyncOperation>) -> bool {
        match (extract_timestamp(local), extract_timestamp(remote)) {
            (Some(l), Some(r)) => (l - r).abs() > self.threshold,
            _ => false,
        }
    }
}

/// Local and remote have different JSON shapes, e.g. object vs array
pub struct StructuralMismatchDetector;

impl ConflictDetector for StructuralMismatchDetector {
    fn name(&self) -> &'static str {
        "structural_mismatch"
    }

    fn severity(&self) -> ConflictSeverity {
        ConflictSeverity::High
    }

    fn detect(&self, local: &Value, remote: &Value, _operation: Option<&SyncOperation>) -> bool {
        if local.is_null() || remote.is_null() {
            return false;
        }
        JsonShape::of(local) != JsonShape::of(remote)
    }
}

/// Values differ with no structural or version signal to explain it.
///
/// Equal versions are not a signal: two writers that both started from the same revision still
/// disagree on the content.
pub struct ValueMismatchDetector;

impl ConflictDetector for ValueMismatchDetector {
    fn name(&self) -> &'static str {
        "value_mismatch"
    }

    fn severity(&self) -> ConflictSeverity {
        ConflictSeverity::Low
    }

    fn detect(&self, local: &Value, remote: &Value, _operation: Option<&SyncOperation>) -> bool {
        let version_signal = matches!(
            (extract_version(local), extract_version(remote)),
            (Some(l), Some(r)) if l != r
        );
        JsonShape::of(local) == JsonShape::of(remote) && !version_signal && local != remote
    }
}

/// The queued operation deletes a record the remote still holds
pub struct DeleteConflictDetector;

impl ConflictDetector for DeleteConflictDetector {
    fn name(&self) -> &'static str {
        "delete_conflict"
    }

    fn severity(&self) -> ConflictSeverity {
        ConflictSeverity::Critical
    }

    fn detect(&self, _local: &Value, remote: &Value, operation: Option<&SyncOperation>) -> bool {
        matches!(operation, Some(op) if op.operation_type == OperationType::Delete) && !remote.is_null()
    }
}

/// The remote was modified after the queued operation was created
pub struct ConcurrentModificationDetector;

impl ConflictDetector for ConcurrentModificationDetector {
    fn name(&self) -> &'static str {
        "concurrent_modification"
    }

    fn severity(&self) -> ConflictSeverity {
        ConflictSeverity::High
    }

    fn detect(&self, _local: &Value, remote: &Value, operation: Option<&SyncOperation>) -> bool {
        match (operation, extract_timestamp(remote)) {
            (Some(op), Some(remote_modified)) => remote_modified > op.timestamp,
            _ => false,
        }
    }
}

/// Name and severity reported when the server rejected a write but no detector explains why
pub const SERVER_CONFLICT: &str = "server_conflict";

/// Runs every registered detector over a (local, remote) pair.
pub struct ConflictDetectionEngine {
    detectors: Vec<Box<dyn ConflictDetector>>,
}

impl ConflictDetectionEngine {
    /// Engine with no detectors
    pub fn empty() -> Self {
        Self {
            detectors: Vec::new(),
        }
    }

    /// Engine with the shipped detectors and the given timestamp skew threshold
    pub fn with_skew_threshold(threshold: std::time::Duration) -> Self {
        let mut engine = Self::empty();
        engine.register(Box::new(VersionMismatchDetector));
        engine.register(Box::new(TimestampSkewDetector::new(threshold)));
        engine.register(Box::new(StructuralMismatchDetector));
        engine.register(Box::new(ValueMismatchDetector));
        engine.register(Box::new(DeleteConflictDetector));
        engine.register(Box::new(ConcurrentModificationDetector));
        engine
    }

    pub fn register(&mut self, detector: Box<dyn ConflictDetector>) {
        self.detectors.push(detector);
    }

    pub fn detector_names(&self) -> Vec<&'static str> {
        self.detectors.iter().map(|d| d.name()).collect()
    }

    /// Detect a conflict between the local and remote snapshots.
    ///
    /// Identical snapshots never conflict. Otherwise the reported severity is the maximum among
    /// the detectors that fired, and `None` means the replay is a clean success.
    pub fn detect(
        &self,
        local: &Value,
        remote: &Value,
        operation: Option<&SyncOperation>,
    ) -> Option<Detection> {
        if local == remote {
            return None;
        }

        let fired: Vec<&dyn ConflictDetector> = self
            .detectors
            .iter()
            .map(|d| &**d)
            .filter(|d| d.detect(local, remote, operation))
            .collect();

        // first registered detector wins ties
        let worst = fired.iter().fold(None::<&dyn ConflictDetector>, |worst, d| match worst {
            Some(w) if w.severity() >= d.severity() => Some(w),
            _ => Some(*d),
        })?;

        let detection = Detection {
            conflict_type: worst.name().to_string(),
            severity: worst.severity(),
            fired: fired.iter().map(|d| d.name().to_string()).collect(),
        };

        debug!(
            "Detected {} conflict ({:?}), fired: {:?}",
            detection.conflict_type, detection.severity, detection.fired
        );
        Some(detection)
    }

    /// Classify a conflict the server already reported.
    ///
    /// Only an identical remote copy counts as success. When no detector fires the conflict is
    /// still recorded as `server_conflict` at medium severity so the mutation is never dropped.
    pub fn detect_reported(
        &self,
        local: &Value,
        remote: &Value,
        operation: Option<&SyncOperation>,
    ) -> Option<Detection> {
        if local == remote {
            return None;
        }

        self.detect(local, remote, operation).or_else(|| {
            debug!("No detector fired for a server-reported conflict, recording {}", SERVER_CONFLICT);
            Some(Detection {
                conflict_type: SERVER_CONFLICT.to_string(),
                severity: ConflictSeverity::Medium,
                fired: vec![SERVER_CONFLICT.to_string()],
            })
        })
    }
}

impl Default for ConflictDetectionEngine {
    fn default() -> Self {
        Self::with_skew_threshold(std::time::Duration::from_secs(60))
    }
}
