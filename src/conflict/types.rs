//! Conflict data types
//!
//! Defines the record of a detected disagreement between a queued change and the remote copy,
//! together with severity, status and resolution enums.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// How serious a detected conflict is.
///
/// Ordered from least to most serious so `max()` picks the worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictSeverity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictStatus {
    Pending,
    Resolved,
}

/// Outcome chosen for a conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    /// Keep the queued local change
    Local,
    /// Accept the remote copy
    Remote,
    /// Combine both through a merge strategy
    Merge,
    /// Escalate to a human operator
    Manual,
}

/// Result of running the detectors over a (local, remote) pair.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    /// Name of the detector with the highest severity
    pub conflict_type: String,
    pub severity: ConflictSeverity,
    /// Every detector that fired, in registration order
    pub fired: Vec<String>,
}

/// Record of a detected disagreement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConflict {
    pub id: String,
    pub resource: String,
    #[serde(rename = "resourceId")]
    pub resource_id: String,
    /// Operation whose replay surfaced the conflict
    #[serde(rename = "operationId", skip_serializing_if = "Option::is_none", default)]
    pub operation_id: Option<String>,
    /// Local snapshot at detection time
    #[serde(rename = "localVersion")]
    pub local_version: Value,
    /// Remote snapshot at detection time
    #[serde(rename = "remoteVersion")]
    pub remote_version: Value,
    #[serde(rename = "conflictType")]
    pub conflict_type: String,
    #[serde(rename = "firedDetectors", default)]
    pub fired_detectors: Vec<String>,
    pub severity: ConflictSeverity,
    pub status: ConflictStatus,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub resolution: Option<Resolution>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub confidence: Option<f64>,
    #[serde(rename = "resolvedValue", skip_serializing_if = "Option::is_none", default)]
    pub resolved_value: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

impl SyncConflict {
    pub fn is_resolved(&self) -> bool {
        self.status == ConflictStatus::Resolved
    }
}

/// One entry of the per-resource resolution history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionRecord {
    #[serde(rename = "conflictId")]
    pub conflict_id: String,
    pub resolution: Resolution,
    pub confidence: f64,
    /// Whether an operator supplied the resolution
    pub manual: bool,
    pub timestamp: DateTime<Utc>,
}

/// Error types for conflict handling
#[derive(Debug, thiserror::Error)]
pub enum ConflictError {
    #[error("Conflict not found: {0}")]
    NotFound(String),

    #[error("Conflict {0} is already resolved")]
    AlreadyResolved(String),

    #[error("Manual resolution must be local, remote or merge")]
    InvalidManualResolution,

    #[error("Conflict {0} cannot be recommitted: remote version is at its maximum")]
    VersionOverflow(String),
}
