//! Control loop owning the orchestrator.
//!
//! `SyncService` runs on its own task and is the only code that touches the orchestrator once
//! spawned. Callers talk to it through a cloneable `SyncHandle`, which sends commands over an
//! `mpsc` channel and awaits the answer on a `oneshot`. Besides commands, the loop wakes on:
//! - the queue flush interval, to process pending work
//! - the cache poll interval, to sweep stale entries
//! - the cleanup interval, to prune finished operations
//! - the next retry deadline, so backed-off operations run on time

use crate::cache::InvalidationReport;
use crate::conflict::Resolution;
use crate::queue::NewOperation;
use crate::sync::{
    events::SyncEvent,
    metrics::{HealthStatus, SyncMetrics},
    orchestrator::SyncOrchestrator,
    types::{SyncError, SyncReport, SyncSnapshot},
};

use serde_json::Value;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Commands buffered before callers wait for the loop
const COMMAND_BUFFER: usize = 64;

type Reply<T> = oneshot::Sender<Result<T, SyncError>>;

enum Command {
    Enqueue {
        operation: NewOperation,
        reply: Reply<String>,
    },
    Cancel {
        operation_id: String,
        reply: Reply<bool>,
    },
    ProcessNow {
        reply: Reply<SyncReport>,
    },
    ResolveConflict {
        conflict_id: String,
        resolution: Resolution,
        reply: Reply<Option<Value>>,
    },
    SetOnline {
        online: bool,
        reply: Reply<()>,
    },
    DomainEvent {
        event: String,
        data: Option<Value>,
        reply: Reply<InvalidationReport>,
    },
    InvalidatePattern {
        pattern: String,
        reply: Reply<InvalidationReport>,
    },
    InvalidateTags {
        tags: Vec<String>,
        reply: Reply<InvalidationReport>,
    },
    InvalidateVersion {
        version_key: String,
        version: String,
        reply: Reply<InvalidationReport>,
    },
    RetryFailed {
        reply: Reply<usize>,
    },
    CleanupCompleted {
        reply: Reply<usize>,
    },
    Metrics {
        reply: Reply<SyncMetrics>,
    },
    Health {
        reply: Reply<HealthStatus>,
    },
    Export {
        reply: Reply<SyncSnapshot>,
    },
    Import {
        snapshot: Box<SyncSnapshot>,
        reply: Reply<()>,
    },
    Shutdown {
        reply: Reply<()>,
    },
}

/// Cloneable client for a running `SyncService`.
///
/// Every call fails with `SyncError::ServiceStopped` once the loop has exited.
#[derive(Clone)]
pub struct SyncHandle {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<SyncEvent>,
}

impl SyncHandle {
    async fn request<T>(
        &self,
        command: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, SyncError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| SyncError::ServiceStopped)?;
        response.await.map_err(|_| SyncError::ServiceStopped)?
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Queue a mutation; processing starts right away when the engine is online.
    pub async fn enqueue(&self, operation: NewOperation) -> Result<String, SyncError> {
        self.request(|reply| Command::Enqueue { operation, reply })
            .await
    }

    pub async fn cancel(&self, operation_id: &str) -> Result<bool, SyncError> {
        let operation_id = operation_id.to_string();
        self.request(|reply| Command::Cancel {
            operation_id,
            reply,
        })
        .await
    }

    /// Run one processing cycle without waiting for the flush interval
    pub async fn process_now(&self) -> Result<SyncReport, SyncError> {
        self.request(|reply| Command::ProcessNow { reply }).await
    }

    pub async fn resolve_conflict(
        &self,
        conflict_id: &str,
        resolution: Resolution,
    ) -> Result<Option<Value>, SyncError> {
        let conflict_id = conflict_id.to_string();
        self.request(|reply| Command::ResolveConflict {
            conflict_id,
            resolution,
            reply,
        })
        .await
    }

    pub async fn set_online(&self, online: bool) -> Result<(), SyncError> {
        self.request(|reply| Command::SetOnline { online, reply })
            .await
    }

    pub async fn domain_event(
        &self,
        event: &str,
        data: Option<Value>,
    ) -> Result<InvalidationReport, SyncError> {
        let event = event.to_string();
        self.request(|reply| Command::DomainEvent { event, data, reply })
            .await
    }

    pub async fn invalidate_by_pattern(&self, pattern: &str) -> Result<InvalidationReport, SyncError> {
        let pattern = pattern.to_string();
        self.request(|reply| Command::InvalidatePattern { pattern, reply })
            .await
    }

    pub async fn invalidate_by_tags(&self, tags: &[&str]) -> Result<InvalidationReport, SyncError> {
        let tags = tags.iter().map(|tag| tag.to_string()).collect();
        self.request(|reply| Command::InvalidateTags { tags, reply })
            .await
    }

    /// Record a new version for `version_key` and evict entries cached under an older one
    pub async fn invalidate_by_version(
        &self,
        version_key: &str,
        version: &str,
    ) -> Result<InvalidationReport, SyncError> {
        let version_key = version_key.to_string();
        let version = version.to_string();
        self.request(|reply| Command::InvalidateVersion {
            version_key,
            version,
            reply,
        })
        .await
    }

    /// Give terminally failed operations a fresh retry budget
    pub async fn retry_failed(&self) -> Result<usize, SyncError> {
        self.request(|reply| Command::RetryFailed { reply }).await
    }

    /// Drop completed and cancelled operations now instead of waiting for the cleanup interval
    pub async fn cleanup_completed(&self) -> Result<usize, SyncError> {
        self.request(|reply| Command::CleanupCompleted { reply })
            .await
    }

    pub async fn metrics(&self) -> Result<SyncMetrics, SyncError> {
        self.request(|reply| Command::Metrics { reply }).await
    }

    pub async fn health(&self) -> Result<HealthStatus, SyncError> {
        self.request(|reply| Command::Health { reply }).await
    }

    pub async fn export_data(&self) -> Result<SyncSnapshot, SyncError> {
        self.request(|reply| Command::Export { reply }).await
    }

    pub async fn import_data(&self, snapshot: SyncSnapshot) -> Result<(), SyncError> {
        let snapshot = Box::new(snapshot);
        self.request(|reply| Command::Import { snapshot, reply })
            .await
    }

    /// Stop the loop. The orchestrator is returned through the service's join handle.
    pub async fn shutdown(&self) -> Result<(), SyncError> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}

/// Task that owns a `SyncOrchestrator` and drives it
pub struct SyncService {
    orchestrator: SyncOrchestrator,
    commands: mpsc::Receiver<Command>,
}

impl SyncService {
    /// Start the orchestrator and run its control loop on a new task.
    ///
    /// The loop ends on `shutdown` or when every handle has been dropped, and yields the
    /// stopped orchestrator.
    pub fn spawn(mut orchestrator: SyncOrchestrator) -> (SyncHandle, JoinHandle<SyncOrchestrator>) {
        let (sender, commands) = mpsc::channel(COMMAND_BUFFER);
        let handle = SyncHandle {
            commands: sender,
            events: orchestrator.event_sender(),
        };

        orchestrator.start();
        let service = SyncService {
            orchestrator,
            commands,
        };
        (handle, tokio::spawn(service.run()))
    }

    async fn run(mut self) -> SyncOrchestrator {
        let mut flush = tokio::time::interval(self.orchestrator.config().flush_interval);
        flush.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut cache_poll = tokio::time::interval(self.orchestrator.config().cache_poll_interval);
        cache_poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut cleanup = tokio::time::interval(self.orchestrator.config().cleanup_interval);
        cleanup.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "Sync service running (flush every {:?}, cache sweep every {:?}, cleanup every {:?})",
            self.orchestrator.config().flush_interval,
            self.orchestrator.config().cache_poll_interval,
            self.orchestrator.config().cleanup_interval
        );

        loop {
            // due retries are only actionable while the engine can replay
            let retry_in = self
                .orchestrator
                .next_retry_in()
                .filter(|_| self.orchestrator.is_online());

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.orchestrator.stop();
                        let _ = reply.send(Ok(()));
                        break;
                    }
                    Some(command) => self.handle(command).await,
                    None => {
                        debug!("All sync handles dropped");
                        self.orchestrator.stop();
                        break;
                    }
                },
                _ = flush.tick() => self.process().await,
                _ = cache_poll.tick() => match self.orchestrator.sweep_cache().await {
                    Ok(report) if report.evicted_count() > 0 => {
                        debug!("Cache sweep evicted {} entries", report.evicted_count())
                    }
                    Ok(_) => {}
                    Err(e) => warn!("Cache sweep failed: {}", e),
                },
                _ = cleanup.tick() => match self.orchestrator.cleanup_completed().await {
                    Ok(removed) if removed > 0 => info!("Pruned {} finished operations", removed),
                    Ok(_) => {}
                    Err(e) => warn!("Queue cleanup failed: {}", e),
                },
                _ = tokio::time::sleep(retry_in.unwrap_or_default()), if retry_in.is_some() => {
                    self.process().await
                }
            }
        }

        info!("Sync service stopped");
        self.orchestrator
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Enqueue { operation, reply } => {
                let result = self.orchestrator.enqueue(operation).await;
                let queued = result.is_ok();
                let _ = reply.send(result);
                if queued {
                    self.process().await;
                }
            }
            Command::Cancel {
                operation_id,
                reply,
            } => {
                let _ = reply.send(self.orchestrator.cancel(&operation_id).await);
            }
            Command::ProcessNow { reply } => {
                let _ = reply.send(self.orchestrator.process_pending().await);
            }
            Command::ResolveConflict {
                conflict_id,
                resolution,
                reply,
            } => {
                let result = self
                    .orchestrator
                    .resolve_conflict(&conflict_id, resolution)
                    .await;
                let _ = reply.send(result);
            }
            Command::SetOnline { online, reply } => {
                let restored = self.orchestrator.set_online(online).await;
                let _ = reply.send(Ok(()));
                if restored {
                    self.process().await;
                }
            }
            Command::DomainEvent { event, data, reply } => {
                let _ = reply.send(self.orchestrator.handle_domain_event(&event, data).await);
            }
            Command::InvalidatePattern { pattern, reply } => {
                let _ = reply.send(self.orchestrator.invalidate_cache_by_pattern(&pattern).await);
            }
            Command::InvalidateTags { tags, reply } => {
                let tags: Vec<&str> = tags.iter().map(String::as_str).collect();
                let _ = reply.send(self.orchestrator.invalidate_cache_by_tags(&tags).await);
            }
            Command::InvalidateVersion {
                version_key,
                version,
                reply,
            } => {
                let result = self
                    .orchestrator
                    .invalidate_cache_by_version(&version_key, &version)
                    .await;
                let _ = reply.send(result);
            }
            Command::RetryFailed { reply } => {
                let result = self.orchestrator.retry_failed().await;
                let revived = matches!(result, Ok(n) if n > 0);
                let _ = reply.send(result);
                if revived {
                    self.process().await;
                }
            }
            Command::CleanupCompleted { reply } => {
                let _ = reply.send(self.orchestrator.cleanup_completed().await);
            }
            Command::Metrics { reply } => {
                let _ = reply.send(Ok(self.orchestrator.metrics()));
            }
            Command::Health { reply } => {
                let _ = reply.send(Ok(self.orchestrator.health()));
            }
            Command::Export { reply } => {
                let _ = reply.send(Ok(self.orchestrator.export_data()));
            }
            Command::Import { snapshot, reply } => {
                let _ = reply.send(self.orchestrator.import_data(*snapshot).await);
            }
            Command::Shutdown { reply } => {
                let _ = reply.send(Ok(()));
            }
        }
    }

    async fn process(&mut self) {
        match self.orchestrator.process_pending().await {
            Ok(report) if !report.is_empty() => debug!("Sync cycle finished: {:?}", report),
            Ok(_) => {}
            Err(e) => error!("Sync cycle failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::store::CacheStore;
    use crate::cache::{CacheEntry, CacheMetadata, MemoryCacheStore};
    use crate::config::SyncEngineConfig;
    use crate::conflict::ConflictStatus;
    use crate::queue::{InMemoryQueueRepository, OperationType, Priority};
    use crate::remote::testing::{Scripted, ScriptedReplayClient};
    use serde_json::json;
    use std::sync::Arc;

    async fn spawn_with(
        client: ScriptedReplayClient,
    ) -> (SyncHandle, JoinHandle<SyncOrchestrator>, Arc<ScriptedReplayClient>) {
        let config = SyncEngineConfig {
            flush_interval: Duration::from_millis(50),
            ..SyncEngineConfig::default()
        };
        let (handle, task, client, _cache) = spawn_configured(client, config).await;
        (handle, task, client)
    }

    async fn spawn_configured(
        client: ScriptedReplayClient,
        config: SyncEngineConfig,
    ) -> (
        SyncHandle,
        JoinHandle<SyncOrchestrator>,
        Arc<ScriptedReplayClient>,
        Arc<MemoryCacheStore>,
    ) {
        let client = Arc::new(client);
        let cache = Arc::new(MemoryCacheStore::new());
        let orchestrator = SyncOrchestrator::new(
            config,
            Arc::new(InMemoryQueueRepository::new()),
            client.clone(),
            cache.clone(),
        )
        .await
        .unwrap();
        let (handle, task) = SyncService::spawn(orchestrator);
        (handle, task, client, cache)
    }

    fn update(resource: &str, resource_id: &str, payload: Value) -> NewOperation {
        NewOperation::new(resource, resource_id, OperationType::Update, payload, Priority::Medium)
    }

    async fn wait_for(
        events: &mut broadcast::Receiver<SyncEvent>,
        name: &str,
    ) -> SyncEvent {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match events.recv().await {
                    Ok(event) if event.name() == name => return event,
                    Ok(_) => continue,
                    Err(e) => panic!("event channel closed: {}", e),
                }
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_enqueue_is_replayed_immediately() {
        let (handle, task, client) = spawn_with(ScriptedReplayClient::succeeding()).await;
        let mut events = handle.subscribe();

        let id = handle
            .enqueue(update("notes", "n-1", json!({"title": "a"})))
            .await
            .unwrap();
        match wait_for(&mut events, "operation-completed").await {
            SyncEvent::OperationCompleted { operation_id, .. } => assert_eq!(operation_id, id),
            other => panic!("unexpected event {:?}", other),
        }

        let metrics = handle.metrics().await.unwrap();
        assert_eq!(metrics.completed_operations, 1);
        assert_eq!(client.call_count(), 1);

        handle.shutdown().await.unwrap();
        let orchestrator = task.await.unwrap();
        assert!(!orchestrator.is_running());
    }

    #[tokio::test]
    async fn test_reconnect_flushes_queue() {
        let (handle, _task, client) = spawn_with(ScriptedReplayClient::succeeding()).await;
        let mut events = handle.subscribe();

        handle.set_online(false).await.unwrap();
        handle
            .enqueue(update("notes", "n-1", json!({})))
            .await
            .unwrap();
        handle.process_now().await.unwrap();
        assert_eq!(client.call_count(), 0);
        assert_eq!(handle.metrics().await.unwrap().pending_operations, 1);

        handle.set_online(true).await.unwrap();
        wait_for(&mut events, "sync-completed").await;
        assert_eq!(client.call_count(), 1);
        assert_eq!(handle.metrics().await.unwrap().pending_operations, 0);
    }

    #[tokio::test]
    async fn test_backed_off_operation_retries_on_schedule() {
        let client = ScriptedReplayClient::succeeding()
            .script("/api/cache/warm", vec![Scripted::ServerError(503)]);
        let (handle, _task, client) = spawn_with(client).await;
        let mut events = handle.subscribe();

        handle
            .enqueue(update("cache", "warm", json!({"keys": 3})))
            .await
            .unwrap();
        wait_for(&mut events, "operation-completed").await;

        assert_eq!(client.call_count(), 2);
        let metrics = handle.metrics().await.unwrap();
        assert_eq!(metrics.completed_operations, 1);
        assert_eq!(metrics.retrying_operations, 0);
    }

    #[tokio::test]
    async fn test_manual_resolution_through_handle() {
        let client = ScriptedReplayClient::succeeding().script(
            "/api/financial/tx-1",
            vec![Scripted::Conflict(json!({"amount": 30, "version": 2}))],
        );
        let (handle, _task, _client) = spawn_with(client).await;
        let mut events = handle.subscribe();

        handle
            .enqueue(update("financial", "tx-1", json!({"amount": 50, "version": 1})))
            .await
            .unwrap();
        let conflict_id = match wait_for(&mut events, "conflict-detected").await {
            SyncEvent::ConflictDetected { conflict } => conflict.id,
            other => panic!("unexpected event {:?}", other),
        };
        wait_for(&mut events, "sync-completed").await;

        let value = handle
            .resolve_conflict(&conflict_id, Resolution::Remote)
            .await
            .unwrap();
        assert_eq!(value, Some(json!({"amount": 30, "version": 2})));

        let snapshot = handle.export_data().await.unwrap();
        assert_eq!(snapshot.conflicts[0].status, ConflictStatus::Resolved);
        assert_eq!(snapshot.resolution_history["financial"].len(), 1);
    }

    #[tokio::test]
    async fn test_handle_reports_stopped_service() {
        let (handle, task, _client) = spawn_with(ScriptedReplayClient::succeeding()).await;
        handle.shutdown().await.unwrap();
        task.await.unwrap();

        assert!(matches!(
            handle.enqueue(update("notes", "n-1", json!({}))).await,
            Err(SyncError::ServiceStopped)
        ));
        assert!(matches!(handle.health().await, Err(SyncError::ServiceStopped)));
    }

    #[tokio::test]
    async fn test_cache_invalidation_through_handle() {
        let (handle, _task, _client, cache) =
            spawn_configured(ScriptedReplayClient::succeeding(), SyncEngineConfig::default()).await;
        for (key, metadata) in [
            ("api-user/1", CacheMetadata::now()),
            ("misc", CacheMetadata::now().with_tags(["profile"])),
            ("api-financial/a", CacheMetadata::now().with_version("1")),
        ] {
            cache
                .insert(key, CacheEntry::new(json!({}), metadata))
                .await
                .unwrap();
        }
        let mut events = handle.subscribe();

        let report = handle.invalidate_by_pattern("^api-user/").await.unwrap();
        assert_eq!(report.evicted, vec!["api-user/1"]);
        match wait_for(&mut events, "cache-invalidated").await {
            SyncEvent::CacheInvalidated { trigger, .. } => assert_eq!(trigger, "pattern:^api-user/"),
            other => panic!("unexpected event {:?}", other),
        }

        let report = handle.invalidate_by_tags(&["profile"]).await.unwrap();
        assert_eq!(report.evicted, vec!["misc"]);

        let report = handle.invalidate_by_version("financial", "2").await.unwrap();
        assert_eq!(report.evicted, vec!["api-financial/a"]);
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test]
    async fn test_finished_operations_are_pruned() {
        let config = SyncEngineConfig {
            cleanup_interval: Duration::from_millis(100),
            ..SyncEngineConfig::default()
        };
        let (handle, _task, _client, _cache) =
            spawn_configured(ScriptedReplayClient::succeeding(), config).await;
        let mut events = handle.subscribe();

        handle
            .enqueue(update("notes", "n-1", json!({})))
            .await
            .unwrap();
        wait_for(&mut events, "operation-completed").await;

        tokio::time::timeout(Duration::from_secs(5), async {
            while !handle.export_data().await.unwrap().operations.is_empty() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(handle.metrics().await.unwrap().total_operations, 0);
    }

    #[tokio::test]
    async fn test_cleanup_and_retry_through_handle() {
        let client = ScriptedReplayClient::succeeding()
            .script("/api/notes/bad", vec![Scripted::Rejected(422)]);
        let (handle, _task, client) = spawn_with(client).await;
        let mut events = handle.subscribe();

        handle.set_online(false).await.unwrap();
        handle
            .enqueue(update("notes", "ok", json!({})))
            .await
            .unwrap();
        handle
            .enqueue(update("notes", "bad", json!({})))
            .await
            .unwrap();
        handle.set_online(true).await.unwrap();
        wait_for(&mut events, "operation-failed").await;
        wait_for(&mut events, "sync-completed").await;

        assert_eq!(handle.cleanup_completed().await.unwrap(), 1);
        assert_eq!(handle.export_data().await.unwrap().operations.len(), 1);

        // the script is spent, so the revived operation now replays cleanly
        assert_eq!(handle.retry_failed().await.unwrap(), 1);
        wait_for(&mut events, "operation-completed").await;
        assert_eq!(client.call_count(), 3);
        assert_eq!(handle.metrics().await.unwrap().failed_operations, 0);
    }
}
