use crate::cache::CacheError;
use crate::conflict::{ConflictError, ResolutionRecord, SyncConflict};
use crate::queue::{QueueError, SyncOperation};
use crate::remote::RemoteError;
use crate::sync::metrics::SyncMetrics;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Error types for the sync engine
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
	#[error("Queue error: {0}")]
	Queue(#[from] QueueError),

	#[error("Remote error: {0}")]
	Remote(#[from] RemoteError),

	#[error("Conflict error: {0}")]
	Conflict(#[from] ConflictError),

	#[error("Cache error: {0}")]
	Cache(#[from] CacheError),

	#[error("JSON error: {0}")]
	JsonError(#[from] serde_json::Error),

	#[error("Invalid snapshot: {0}")]
	InvalidSnapshot(String),

	#[error("Sync service has stopped")]
	ServiceStopped,
}

/// Portable copy of the engine state, produced by `export_data` and consumed by `import_data`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncSnapshot {
	pub operations: Vec<SyncOperation>,
	pub conflicts: Vec<SyncConflict>,
	pub metrics: SyncMetrics,
	#[serde(rename = "resolutionHistory", default)]
	pub resolution_history: HashMap<String, Vec<ResolutionRecord>>,
	#[serde(rename = "exportedAt")]
	pub exported_at: DateTime<Utc>,
}

/// Summary of one processing cycle
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncReport {
	pub processed: usize,
	pub succeeded: usize,
	pub failed: usize,
	/// Failures scheduled for another attempt
	pub retrying: usize,
	pub conflicts: usize,
	/// Operations returned to pending by the circuit breaker
	pub deferred: usize,
}

impl SyncReport {
	pub fn is_empty(&self) -> bool {
		self.processed == 0 && self.deferred == 0
	}
}
