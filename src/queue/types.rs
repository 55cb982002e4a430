//! Types for the durable operation queue

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kind of mutation a queued operation performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
	Create,
	Update,
	Delete,
}

/// Replay priority of an operation.
///
/// Variants are declared from most to least urgent so that the derived ordering sorts
/// `Critical` first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
	Critical,
	High,
	Medium,
	Low,
}

/// Lifecycle status of an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
	Pending,
	Processing,
	Completed,
	Failed,
	Cancelled,
}

/// One durable unit of pending work awaiting network replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncOperation {
	/// Unique operation ID
	pub id: String,
	/// Type of mutation
	#[serde(rename = "type")]
	pub operation_type: OperationType,
	/// Logical collection name, e.g. "financial" or "user"
	pub resource: String,
	/// Identifier of the record inside the collection
	#[serde(rename = "resourceId")]
	pub resource_id: String,
	/// Opaque domain data
	pub payload: Value,
	pub priority: Priority,
	/// Creation time
	pub timestamp: DateTime<Utc>,
	#[serde(rename = "retryCount")]
	pub retry_count: u32,
	#[serde(rename = "maxRetries")]
	pub max_retries: u32,
	pub status: OperationStatus,
	#[serde(rename = "lastError", skip_serializing_if = "Option::is_none", default)]
	pub last_error: Option<String>,
	#[serde(rename = "completedAt", skip_serializing_if = "Option::is_none", default)]
	pub completed_at: Option<DateTime<Utc>>,
	#[serde(rename = "processingTimeMs", skip_serializing_if = "Option::is_none", default)]
	pub processing_time_ms: Option<u64>,
}

impl SyncOperation {
	/// Whether this operation has reached the end of its lifecycle.
	///
	/// `Failed` only counts as terminal once the retry budget is exhausted.
	pub fn is_terminal(&self) -> bool {
		match self.status {
			OperationStatus::Completed | OperationStatus::Cancelled => true,
			OperationStatus::Failed => self.retry_count >= self.max_retries,
			OperationStatus::Pending | OperationStatus::Processing => false,
		}
	}

	pub fn can_retry(&self) -> bool {
		self.retry_count < self.max_retries
	}
}

/// Parameters for enqueuing a new operation.
#[derive(Debug, Clone)]
pub struct NewOperation {
	pub resource: String,
	pub resource_id: String,
	pub operation_type: OperationType,
	pub payload: Value,
	pub priority: Priority,
	/// Overrides the configured default retry budget when set
	pub max_retries: Option<u32>,
}

impl NewOperation {
	pub fn new(
		resource: impl Into<String>,
		resource_id: impl Into<String>,
		operation_type: OperationType,
		payload: Value,
		priority: Priority,
	) -> Self {
		Self {
			resource: resource.into(),
			resource_id: resource_id.into(),
			operation_type,
			payload,
			priority,
			max_retries: None,
		}
	}

	pub fn with_max_retries(mut self, max_retries: u32) -> Self {
		self.max_retries = Some(max_retries);
		self
	}
}

/// Error types for queue operations
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
	#[error("Queue is full ({size} of {capacity} operations)")]
	QueueFull { size: usize, capacity: usize },

	#[error("Operation not found: {0}")]
	NotFound(String),

	#[error("Persistence error: {0}")]
	Persistence(String),

	#[error("IO error: {0}")]
	IoError(#[from] std::io::Error),

	#[error("JSON error: {0}")]
	JsonError(#[from] serde_json::Error),
}
