//! Sync Module
//!
//! This module provides the core logic for replaying queued operations against the remote service.
//! It is composed of several submodules, each responsible for a specific aspect of the sync process:
//!
//! - `orchestrator`: The main coordinator. It owns the queue, conflicts and metrics and wires together all other services.
//! - `service`: The control loop that owns the orchestrator and accepts commands over a channel.
//! - `dispatcher`: Partitions a batch by strategy and replays it with bounded concurrency.
//! - `strategies`: Pluggable per-resource replay and retry policies.
//! - `scheduler`: Deadline queue for operations waiting out their backoff.
//! - `events`: Event types and handler traits used for decoupled communication between sync components.
//! - `metrics`: Derived statistics and health.
//!
//! The orchestrator draws a batch from the queue, hands it to the dispatcher, and applies each result: successes
//! complete the operation and invalidate cached reads, conflict signals go through detection and resolution, and
//! failures are either scheduled for another attempt or reported.

/// Batch partitioning and concurrent replay
pub mod dispatcher;
/// Event system for decoupled communication during sync
pub mod events;
/// Metrics and health
pub mod metrics;
/// Main coordinator for the sync process
pub mod orchestrator;
/// Retry deadlines and clocks
pub mod scheduler;
/// Control loop and its command handle
pub mod service;
/// Pluggable replay strategies
pub mod strategies;
/// Errors, reports and snapshots
pub mod types;

pub use events::{EventDispatcher, LoggingEventHandler, SyncEvent, SyncEventHandler};
pub use metrics::{HealthStatus, SyncMetrics};
pub use orchestrator::SyncOrchestrator;
pub use service::{SyncHandle, SyncService};
pub use types::*;
