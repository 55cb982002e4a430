//! Offline-first synchronization engine.
//!
//! Mutations made while disconnected are queued durably, replayed against the host's REST surface
//! once connectivity returns, checked for conflicts with the remote copy, and followed by
//! invalidation of stale cached reads.

/// Rule-based invalidation of cached reads
pub mod cache;
pub mod config;
/// Conflict detection, resolution and merge
pub mod conflict;
/// Durable operation queue
pub mod queue;
/// Replay of queued operations over HTTP
pub mod remote;
pub mod sync;
pub mod utils;

pub use config::SyncEngineConfig;
pub use sync::{SyncError, SyncEvent, SyncHandle, SyncOrchestrator, SyncService};
