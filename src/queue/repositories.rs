use crate::queue::types::{QueueError, SyncOperation};
use backoff::{ExponentialBackoff, future::retry};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Repository for queue persistence
#[async_trait::async_trait]
pub trait QueueRepository: Send + Sync {
	async fn load(&self) -> Result<Vec<SyncOperation>, QueueError>;
	async fn save(&self, operations: &[SyncOperation]) -> Result<(), QueueError>;
}

/// On-disk layout of the persisted queue
#[derive(Debug, Serialize, Deserialize)]
struct QueueDocument {
	#[serde(rename = "savedAt")]
	saved_at: DateTime<Utc>,
	operations: Vec<SyncOperation>,
}

/// File-based implementation of QueueRepository.
///
/// The queue is written to a temporary file and renamed over the previous copy so that a crash
/// mid-write never leaves a truncated queue behind.
pub struct FileQueueRepository {
	data_dir: PathBuf,
}

impl FileQueueRepository {
	pub fn new(data_dir: PathBuf) -> Self {
		Self { data_dir }
	}

	fn get_queue_filename(&self) -> PathBuf {
		self.data_dir.join("sync_queue.json")
	}

	fn get_temp_filename(&self) -> PathBuf {
		self.data_dir.join("sync_queue.json.tmp")
	}
}

#[async_trait::async_trait]
impl QueueRepository for FileQueueRepository {
	async fn load(&self) -> Result<Vec<SyncOperation>, QueueError> {
		let filename = self.get_queue_filename();

		if !filename.exists() {
			return Ok(Vec::new());
		}

		let content = tokio::fs::read_to_string(&filename).await?;
		let document: QueueDocument = serde_json::from_str(&content).map_err(|e| {
			QueueError::Persistence(format!("Failed to parse queue file {:?}: {}", filename, e))
		})?;

		info!(
			"Loaded {} queued operations from {:?} (saved at {})",
			document.operations.len(),
			filename,
			document.saved_at.to_rfc3339()
		);
		Ok(document.operations)
	}

	async fn save(&self, operations: &[SyncOperation]) -> Result<(), QueueError> {
		let document = QueueDocument {
			saved_at: Utc::now(),
			operations: operations.to_vec(),
		};
		let content = serde_json::to_string_pretty(&document)?;

		let data_dir = &self.data_dir;
		let temp_filename = &self.get_temp_filename();
		let filename = &self.get_queue_filename();
		let content = &content;

		// Transient IO failures (locked file, full buffers) are retried briefly
		let policy = ExponentialBackoff {
			max_elapsed_time: Some(Duration::from_secs(2)),
			..ExponentialBackoff::default()
		};

		retry(policy, || async move {
			tokio::fs::create_dir_all(data_dir)
				.await
				.map_err(backoff::Error::transient)?;
			tokio::fs::write(temp_filename, content)
				.await
				.map_err(backoff::Error::transient)?;
			tokio::fs::rename(temp_filename, filename)
				.await
				.map_err(backoff::Error::transient)?;
			Ok::<(), backoff::Error<std::io::Error>>(())
		})
		.await?;

		debug!("Saved {} operations to {:?}", operations.len(), filename);
		Ok(())
	}
}

/// In-memory implementation of QueueRepository for ephemeral hosts and tests
#[derive(Default)]
pub struct InMemoryQueueRepository {
	operations: Mutex<Vec<SyncOperation>>,
	saves: Mutex<usize>,
}

impl InMemoryQueueRepository {
	pub fn new() -> Self {
		Self::default()
	}

	/// Seed the repository, simulating state left behind by a previous process
	pub fn with_operations(operations: Vec<SyncOperation>) -> Self {
		Self {
			operations: Mutex::new(operations),
			saves: Mutex::new(0),
		}
	}

	/// Number of times the queue has been saved
	pub async fn save_count(&self) -> usize {
		*self.saves.lock().await
	}
}

#[async_trait::async_trait]
impl QueueRepository for InMemoryQueueRepository {
	async fn load(&self) -> Result<Vec<SyncOperation>, QueueError> {
		Ok(self.operations.lock().await.clone())
	}

	async fn save(&self, operations: &[SyncOperation]) -> Result<(), QueueError> {
		*self.operations.lock().await = operations.to_vec();
		*self.saves.lock().await += 1;
		Ok(())
	}
}
