//! Durable, priority-ordered queue of pending mutations.
//!
//! The queue keeps every operation it has accepted until it is explicitly cleaned up or removed,
//! and writes its full contents through a [`QueueRepository`] after every mutation. A process that
//! restarts abruptly therefore resumes with the same pending set. Operations that were in flight
//! when the process died are put back to `pending` on load, which makes delivery at-least-once.
//!
//! Batches are drawn strictly by priority (critical, high, medium, low) and FIFO by creation time
//! within a tier.

use crate::queue::repositories::QueueRepository;
use crate::queue::types::{NewOperation, OperationStatus, QueueError, SyncOperation};
use crate::utils::generate_id;

use chrono::Utc;
use itertools::Itertools;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Number of operations per status
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    /// Failed operations still waiting for a retry
    pub retrying: usize,
    /// Failed operations whose retry budget is exhausted
    pub failed: usize,
    pub cancelled: usize,
}

pub struct OperationQueue {
    /// Operations in insertion order
    operations: Vec<SyncOperation>,
    repository: Arc<dyn QueueRepository>,
    capacity: usize,
    default_max_retries: u32,
}

impl OperationQueue {
    /// Create a queue backed by `repository`, restoring whatever it holds.
    pub async fn load(
        repository: Arc<dyn QueueRepository>,
        capacity: usize,
        default_max_retries: u32,
    ) -> Result<Self, QueueError> {
        let operations = repository.load().await?;
        let mut queue = Self {
            operations,
            repository,
            capacity,
            default_max_retries,
        };
        queue.reset_processing().await?;

        info!(
            "Operation queue ready with {} operations ({} pending)",
            queue.len(),
            queue.pending_count()
        );
        Ok(queue)
    }

    /// Return operations left `processing` by an interrupted run to `pending`.
    ///
    /// Replays are at-least-once: an operation may have reached the server before the crash.
    pub async fn reset_processing(&mut self) -> Result<usize, QueueError> {
        let mut recovered = 0;
        for operation in self
            .operations
            .iter_mut()
            .filter(|op| op.status == OperationStatus::Processing)
        {
            operation.status = OperationStatus::Pending;
            recovered += 1;
        }

        if recovered > 0 {
            warn!(
                "Recovered {} operations that were in flight when the queue was last saved",
                recovered
            );
            self.persist().await?;
        }
        Ok(recovered)
    }

    /// Accept a new mutation, returning its operation id.
    pub async fn enqueue(&mut self, new_operation: NewOperation) -> Result<String, QueueError> {
        let size = self.active_len();
        if size >= self.capacity {
            return Err(QueueError::QueueFull {
                size,
                capacity: self.capacity,
            });
        }

        let operation = SyncOperation {
            id: generate_id("op"),
            operation_type: new_operation.operation_type,
            resource: new_operation.resource,
            resource_id: new_operation.resource_id,
            payload: new_operation.payload,
            priority: new_operation.priority,
            timestamp: Utc::now(),
            retry_count: 0,
            max_retries: new_operation
                .max_retries
                .unwrap_or(self.default_max_retries),
            status: OperationStatus::Pending,
            last_error: None,
            completed_at: None,
            processing_time_ms: None,
        };

        let id = operation.id.clone();
        debug!(
            "Enqueued {:?} {} on {}/{} with priority {:?}",
            operation.operation_type, id, operation.resource, operation.resource_id, operation.priority
        );

        self.operations.push(operation);
        self.persist().await?;
        Ok(id)
    }

    /// Cancel an operation that has not started replaying.
    ///
    /// Returns false when the operation is unknown, in flight, or already finished.
    pub async fn cancel(&mut self, id: &str) -> Result<bool, QueueError> {
        let Some(operation) = self.operations.iter_mut().find(|op| op.id == id) else {
            return Ok(false);
        };

        match operation.status {
            OperationStatus::Pending | OperationStatus::Failed => {
                operation.status = OperationStatus::Cancelled;
                info!("Cancelled operation {}", id);
                self.persist().await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Pending operations in replay order, without changing their status.
    pub fn peek_batch(&self, n: usize) -> Vec<SyncOperation> {
        self.ordered_pending_indices()
            .into_iter()
            .take(n)
            .map(|index| self.operations[index].clone())
            .collect()
    }

    /// Take up to `n` pending operations in replay order and mark them `processing`.
    pub async fn dequeue_batch(&mut self, n: usize) -> Result<Vec<SyncOperation>, QueueError> {
        let indices: Vec<usize> = self
            .ordered_pending_indices()
            .into_iter()
            .take(n)
            .collect();

        if indices.is_empty() {
            return Ok(Vec::new());
        }

        let batch = indices
            .into_iter()
            .map(|index| {
                let operation = &mut self.operations[index];
                operation.status = OperationStatus::Processing;
                operation.clone()
            })
            .collect::<Vec<_>>();

        self.persist().await?;
        Ok(batch)
    }

    /// Record a successful replay.
    ///
    /// Late results for operations that are no longer in flight are ignored and `None` is returned.
    pub async fn mark_completed(
        &mut self,
        id: &str,
        processing_time: Duration,
    ) -> Result<Option<SyncOperation>, QueueError> {
        let Some(operation) = self.in_flight_mut(id) else {
            return Ok(None);
        };

        operation.status = OperationStatus::Completed;
        operation.completed_at = Some(Utc::now());
        operation.processing_time_ms = Some(processing_time.as_millis() as u64);
        operation.last_error = None;
        let completed = operation.clone();

        self.persist().await?;
        Ok(Some(completed))
    }

    /// Record a failed replay attempt.
    ///
    /// Every failure consumes one retry. A non-retryable failure exhausts the remaining budget so
    /// the operation becomes terminally failed.
    pub async fn mark_failed(
        &mut self,
        id: &str,
        error: &str,
        retryable: bool,
    ) -> Result<Option<SyncOperation>, QueueError> {
        let Some(operation) = self.in_flight_mut(id) else {
            return Ok(None);
        };

        operation.status = OperationStatus::Failed;
        operation.retry_count = operation.retry_count.saturating_add(1);
        if !retryable {
            operation.retry_count = operation.retry_count.max(operation.max_retries);
        }
        operation.last_error = Some(error.to_string());
        let failed = operation.clone();

        self.persist().await?;
        Ok(Some(failed))
    }

    /// Return in-flight operations to `pending` without consuming a retry.
    pub async fn release(&mut self, ids: &[String]) -> Result<usize, QueueError> {
        let mut released = 0;
        for operation in self
            .operations
            .iter_mut()
            .filter(|op| op.status == OperationStatus::Processing && ids.contains(&op.id))
        {
            operation.status = OperationStatus::Pending;
            released += 1;
        }

        if released > 0 {
            self.persist().await?;
        }
        Ok(released)
    }

    /// Move a failed operation whose backoff has elapsed back to `pending`.
    pub async fn requeue(&mut self, id: &str) -> Result<bool, QueueError> {
        let Some(operation) = self
            .operations
            .iter_mut()
            .find(|op| op.id == id && op.status == OperationStatus::Failed && op.can_retry())
        else {
            return Ok(false);
        };

        operation.status = OperationStatus::Pending;
        self.persist().await?;
        Ok(true)
    }

    /// Give every terminally failed operation a fresh retry budget.
    pub async fn retry_failed(&mut self) -> Result<usize, QueueError> {
        let mut revived = 0;
        for operation in self
            .operations
            .iter_mut()
            .filter(|op| op.status == OperationStatus::Failed && !op.can_retry())
        {
            operation.status = OperationStatus::Pending;
            operation.retry_count = 0;
            revived += 1;
        }

        if revived > 0 {
            info!("Re-queued {} exhausted operations", revived);
            self.persist().await?;
        }
        Ok(revived)
    }

    /// Drop completed and cancelled operations from the queue.
    pub async fn cleanup_completed(&mut self) -> Result<usize, QueueError> {
        let before = self.operations.len();
        self.operations.retain(|op| {
            !matches!(
                op.status,
                OperationStatus::Completed | OperationStatus::Cancelled
            )
        });
        let removed = before - self.operations.len();

        if removed > 0 {
            debug!("Cleaned up {} finished operations", removed);
            self.persist().await?;
        }
        Ok(removed)
    }

    pub async fn remove(&mut self, id: &str) -> Result<SyncOperation, QueueError> {
        let index = self
            .operations
            .iter()
            .position(|op| op.id == id)
            .ok_or_else(|| QueueError::NotFound(id.to_string()))?;

        let removed = self.operations.remove(index);
        self.persist().await?;
        Ok(removed)
    }

    /// Replace the whole queue, e.g. when importing a snapshot.
    pub async fn replace_all(&mut self, operations: Vec<SyncOperation>) -> Result<(), QueueError> {
        self.operations = operations;
        self.persist().await
    }

    pub async fn clear(&mut self) -> Result<(), QueueError> {
        self.operations.clear();
        self.persist().await
    }

    pub fn get(&self, id: &str) -> Option<&SyncOperation> {
        self.operations.iter().find(|op| op.id == id)
    }

    pub fn operations(&self) -> &[SyncOperation] {
        &self.operations
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Operations that still occupy queue capacity
    pub fn active_len(&self) -> usize {
        self.operations.iter().filter(|op| !op.is_terminal()).count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn pending_count(&self) -> usize {
        self.operations
            .iter()
            .filter(|op| op.status == OperationStatus::Pending)
            .count()
    }

    pub fn status_counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for operation in &self.operations {
            match operation.status {
                OperationStatus::Pending => counts.pending += 1,
                OperationStatus::Processing => counts.processing += 1,
                OperationStatus::Completed => counts.completed += 1,
                OperationStatus::Cancelled => counts.cancelled += 1,
                OperationStatus::Failed if operation.can_retry() => counts.retrying += 1,
                OperationStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }

    /// Pending operation counts grouped by resource
    pub fn pending_by_resource(&self) -> HashMap<String, usize> {
        self.operations
            .iter()
            .filter(|op| op.status == OperationStatus::Pending)
            .counts_by(|op| op.resource.clone())
    }

    fn in_flight_mut(&mut self, id: &str) -> Option<&mut SyncOperation> {
        let operation = self.operations.iter_mut().find(|op| op.id == id)?;
        if operation.status != OperationStatus::Processing {
            debug!(
                "Ignoring late result for operation {} in status {:?}",
                id, operation.status
            );
            return None;
        }
        Some(operation)
    }

    fn ordered_pending_indices(&self) -> Vec<usize> {
        self.operations
            .iter()
            .enumerate()
            .filter(|(_, op)| op.status == OperationStatus::Pending)
            .sorted_by_key(|(index, op)| (op.priority, op.timestamp, *index))
            .map(|(index, _)| index)
            .collect()
    }

    async fn persist(&self) -> Result<(), QueueError> {
        self.repository.save(&self.operations).await
    }
}
