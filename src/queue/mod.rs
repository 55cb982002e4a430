//! Durable operation queue
//!
//! This module holds the pending mutations of the sync engine and the repositories that persist
//! them across process restarts.

/// Priority-ordered operation queue
pub mod operation_queue;
/// Persistence backends for the queue
pub mod repositories;
/// Operation, priority and status types
pub mod types;

pub use operation_queue::{OperationQueue, StatusCounts};
pub use repositories::{FileQueueRepository, InMemoryQueueRepository, QueueRepository};
pub use types::*;
