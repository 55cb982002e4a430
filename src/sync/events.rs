//! Event system for the sync engine.
//!
//! This module defines the lifecycle events emitted by the orchestrator, the handler trait used to
//! react to them, and the dispatcher that fans each event out to registered handlers and to
//! broadcast subscribers. Handlers let hosts attach logging, UI notifications or persistence
//! without the orchestrator knowing about them.

use crate::conflict::{Resolution, SyncConflict};
use crate::queue::Priority;
use crate::sync::types::SyncError;

use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// Events that occur during synchronization
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// A mutation was accepted into the queue
    OperationQueued {
        operation_id: String,
        resource: String,
        priority: Priority,
    },
    /// A sync cycle drew a batch from the queue
    SyncStarted { batch_size: usize, pending: usize },
    /// A sync cycle finished
    SyncCompleted {
        processed: usize,
        succeeded: usize,
        failed: usize,
        conflicts: usize,
        deferred: usize,
        duration: Duration,
    },
    /// An operation was replayed successfully
    OperationCompleted {
        operation_id: String,
        resource: String,
        processing_time: Duration,
    },
    /// An operation failed permanently or exhausted its retries
    OperationFailed {
        operation_id: String,
        resource: String,
        error: String,
        retry_count: u32,
    },
    /// A replay collided with a remote change
    ConflictDetected { conflict: SyncConflict },
    /// A conflict was closed
    ConflictResolved {
        conflict_id: String,
        resource: String,
        resolution: Resolution,
        confidence: f64,
        manual: bool,
    },
    /// The engine went online or offline
    ConnectivityChanged { online: bool },
    /// Cached entries were evicted
    CacheInvalidated { trigger: String, evicted: Vec<String> },
}

impl SyncEvent {
    /// Stable kebab-case name of the event
    pub fn name(&self) -> &'static str {
        match self {
            SyncEvent::OperationQueued { .. } => "operation-queued",
            SyncEvent::SyncStarted { .. } => "sync-started",
            SyncEvent::SyncCompleted { .. } => "sync-completed",
            SyncEvent::OperationCompleted { .. } => "operation-completed",
            SyncEvent::OperationFailed { .. } => "operation-failed",
            SyncEvent::ConflictDetected { .. } => "conflict-detected",
            SyncEvent::ConflictResolved { .. } => "conflict-resolved",
            SyncEvent::ConnectivityChanged { .. } => "connectivity-changed",
            SyncEvent::CacheInvalidated { .. } => "cache-invalidated",
        }
    }
}

/// Trait for handling sync events.
///
/// Implementors receive all sync events and can perform side effects.
#[async_trait::async_trait]
pub trait SyncEventHandler: Send + Sync {
    /// Handle a sync event.
    async fn handle(&mut self, event: &SyncEvent) -> Result<(), SyncError>;

    /// Get the name of this handler for logging and diagnostics.
    fn name(&self) -> &'static str;
}

/// Event dispatcher that manages handlers and broadcast subscribers.
///
/// Handlers are called in registration order; every event is also sent on a broadcast channel so
/// tasks outside the control loop can observe the engine.
pub struct EventDispatcher {
    handlers: Vec<Box<dyn SyncEventHandler>>,
    sender: broadcast::Sender<SyncEvent>,
}

impl EventDispatcher {
    /// Create a dispatcher whose broadcast channel buffers `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            handlers: Vec::new(),
            sender,
        }
    }

    /// Register a new event handler.
    pub fn register_handler(&mut self, handler: Box<dyn SyncEventHandler>) {
        self.handlers.push(handler);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    /// Sender side of the broadcast channel, for handing out subscriptions elsewhere
    pub fn sender(&self) -> broadcast::Sender<SyncEvent> {
        self.sender.clone()
    }

    /// Dispatch an event to all handlers and subscribers.
    ///
    /// Errors from handlers are logged, but do not stop other handlers from running.
    pub async fn dispatch(&mut self, event: SyncEvent) {
        for handler in &mut self.handlers {
            if let Err(e) = handler.handle(&event).await {
                error!("Handler {} failed to process event: {}", handler.name(), e);
            }
        }
        // no subscribers is not an error
        let _ = self.sender.send(event);
    }
}

/// Handler that writes every event to the log
pub struct LoggingEventHandler;

#[async_trait::async_trait]
impl SyncEventHandler for LoggingEventHandler {
    async fn handle(&mut self, event: &SyncEvent) -> Result<(), SyncError> {
        match event {
            SyncEvent::OperationFailed {
                operation_id,
                resource,
                error,
                retry_count,
            } => warn!(
                "Operation {} on {} failed after {} attempts: {}",
                operation_id, resource, retry_count, error
            ),
            SyncEvent::ConflictDetected { conflict } => warn!(
                "Conflict {} on {}/{} ({}, {:?})",
                conflict.id,
                conflict.resource,
                conflict.resource_id,
                conflict.conflict_type,
                conflict.severity
            ),
            SyncEvent::SyncCompleted {
                processed,
                succeeded,
                failed,
                conflicts,
                deferred,
                duration,
            } => info!(
                "Sync cycle: {} processed, {} succeeded, {} failed, {} conflicts, {} deferred in {:?}",
                processed, succeeded, failed, conflicts, deferred, duration
            ),
            other => info!("Sync event: {}", other.name()),
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "LoggingEventHandler"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct RecordingHandler {
        seen: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait::async_trait]
    impl SyncEventHandler for RecordingHandler {
        async fn handle(&mut self, event: &SyncEvent) -> Result<(), SyncError> {
            self.seen.lock().unwrap().push(event.name());
            Ok(())
        }

        fn name(&self) -> &'static str {
            "RecordingHandler"
        }
    }

    struct FailingHandler;

    #[async_trait::async_trait]
    impl SyncEventHandler for FailingHandler {
        async fn handle(&mut self, _event: &SyncEvent) -> Result<(), SyncError> {
            Err(SyncError::InvalidSnapshot("handler failure".to_string()))
        }

        fn name(&self) -> &'static str {
            "FailingHandler"
        }
    }

    #[tokio::test]
    async fn test_dispatch_reaches_handlers_and_subscribers() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = EventDispatcher::new(8);
        dispatcher.register_handler(Box::new(FailingHandler));
        dispatcher.register_handler(Box::new(RecordingHandler { seen: seen.clone() }));
        let mut receiver = dispatcher.subscribe();

        dispatcher
            .dispatch(SyncEvent::ConnectivityChanged { online: true })
            .await;

        assert_eq!(*seen.lock().unwrap(), vec!["connectivity-changed"]);
        match receiver.recv().await.unwrap() {
            SyncEvent::ConnectivityChanged { online } => assert!(online),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_dispatch_without_subscribers() {
        let mut dispatcher = EventDispatcher::new(1);
        dispatcher
            .dispatch(SyncEvent::SyncStarted {
                batch_size: 1,
                pending: 0,
            })
            .await;
    }
}
