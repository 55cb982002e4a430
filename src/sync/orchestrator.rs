//! Sync orchestrator and integration point for all sync services.
//!
//! This module defines the `SyncOrchestrator`, which owns the operation queue, the conflict list
//! and the metrics, and coordinates every other component around them:
//! - draws batches from the queue and hands them to the `BatchDispatcher`
//! - applies replay results back to the queue and schedules retries
//! - routes conflict signals through detection, resolution and merge
//! - recommits resolved values as follow-up operations
//! - cascades successful replays into cache invalidation
//! - emits lifecycle events through the `EventDispatcher`
//!
//! The orchestrator is not shared. It is driven from a single control loop (see `service`), so
//! the queue and metrics need no locks.

use crate::cache::{CacheInvalidationManager, CacheStore, InvalidationReport, InvalidationRule, default_rules};
use crate::config::SyncEngineConfig;
use crate::conflict::{
    ConflictDetectionEngine, ConflictDetector, ConflictError, ConflictResolutionEngine,
    ConflictResolver, ConflictStatus, MergeEngine, Resolution, ResolutionOutcome, SyncConflict,
};
use crate::queue::{
    NewOperation, OperationQueue, OperationStatus, OperationType, Priority, QueueError,
    QueueRepository, SyncOperation,
};
use crate::remote::{ReplayClient, RequestBuilder};
use crate::sync::{
    dispatcher::{BatchDispatcher, OperationOutcome},
    events::{EventDispatcher, SyncEvent, SyncEventHandler},
    metrics::{HealthStatus, MetricsTracker, SyncMetrics},
    scheduler::{Clock, RetryScheduler, SystemClock},
    strategies::BatchStrategy,
    types::{SyncError, SyncReport, SyncSnapshot},
};
use crate::utils::{extract_version, generate_id, version_field};

use chrono::Utc;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Resource whose successful replays also count as a completed money movement
const FINANCIAL_RESOURCE: &str = "financial";

/// Main sync orchestrator that coordinates all sync components.
pub struct SyncOrchestrator {
    config: SyncEngineConfig,
    queue: OperationQueue,
    dispatcher: BatchDispatcher,
    scheduler: RetryScheduler,
    detection: ConflictDetectionEngine,
    resolution: ConflictResolutionEngine,
    cache: CacheInvalidationManager,
    conflicts: Vec<SyncConflict>,
    metrics: MetricsTracker,
    events: EventDispatcher,
    online: bool,
    running: bool,
}

impl SyncOrchestrator {
    /// Create an orchestrator, restoring the queue from `repository`.
    ///
    /// The orchestrator starts online but stopped; call [`start`](Self::start) before processing.
    pub async fn new(
        config: SyncEngineConfig,
        repository: Arc<dyn QueueRepository>,
        client: Arc<dyn ReplayClient>,
        cache_store: Arc<dyn CacheStore>,
    ) -> Result<Self, SyncError> {
        let queue =
            OperationQueue::load(repository, config.max_queue_size, config.max_retries).await?;

        let dispatcher = BatchDispatcher::new(
            client,
            RequestBuilder::new(config.api_prefix.clone()),
            config.max_concurrent_batches,
            config.request_timeout,
        );
        let detection = ConflictDetectionEngine::with_skew_threshold(config.skew_threshold);
        let resolution = ConflictResolutionEngine::new(
            MergeEngine::new(config.financial_merge_enabled),
            config.resolution_history_limit,
        );
        let cache = CacheInvalidationManager::with_rules(cache_store, default_rules()?);
        let events = EventDispatcher::new(config.event_buffer);

        let mut orchestrator = Self {
            config,
            queue,
            dispatcher,
            scheduler: RetryScheduler::new(Arc::new(SystemClock)),
            detection,
            resolution,
            cache,
            conflicts: Vec::new(),
            metrics: MetricsTracker::new(),
            events,
            online: true,
            running: false,
        };
        orchestrator.schedule_restored_retries();
        orchestrator.refresh_metrics();
        Ok(orchestrator)
    }

    /// Replace the clock used for retry deadlines.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.scheduler = RetryScheduler::new(clock);
        self.schedule_restored_retries();
        self
    }

    pub fn config(&self) -> &SyncEngineConfig {
        &self.config
    }

    pub fn start(&mut self) {
        if !self.running {
            self.running = true;
            info!(
                "Sync engine started ({} operations queued, {})",
                self.queue.len(),
                if self.online { "online" } else { "offline" }
            );
        }
    }

    pub fn stop(&mut self) {
        if self.running {
            self.running = false;
            info!("Sync engine stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn is_online(&self) -> bool {
        self.online
    }

    pub fn register_handler(&mut self, handler: Box<dyn SyncEventHandler>) {
        self.events.register_handler(handler);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn event_sender(&self) -> broadcast::Sender<SyncEvent> {
        self.events.sender()
    }

    pub fn register_strategy(&mut self, strategy: Box<dyn BatchStrategy>) {
        self.dispatcher.register(strategy);
    }

    pub fn register_detector(&mut self, detector: Box<dyn ConflictDetector>) {
        self.detection.register(detector);
    }

    /// Register a resolver, replacing any shipped resolver with the same name
    pub fn register_resolver(&mut self, resolver: Box<dyn ConflictResolver>) {
        self.resolution.replace(resolver);
    }

    pub fn add_cache_rule(&mut self, rule: InvalidationRule) {
        self.cache.add_rule(rule);
    }

    pub fn cache(&self) -> &CacheInvalidationManager {
        &self.cache
    }

    pub fn queue(&self) -> &OperationQueue {
        &self.queue
    }

    /// Accept a mutation into the queue.
    pub async fn enqueue(&mut self, operation: NewOperation) -> Result<String, SyncError> {
        let resource = operation.resource.clone();
        let priority = operation.priority;

        let operation_id = self.queue.enqueue(operation).await?;
        self.refresh_metrics();
        self.events
            .dispatch(SyncEvent::OperationQueued {
                operation_id: operation_id.clone(),
                resource,
                priority,
            })
            .await;
        Ok(operation_id)
    }

    /// Cancel an operation that has not started replaying.
    pub async fn cancel(&mut self, operation_id: &str) -> Result<bool, SyncError> {
        let cancelled = self.queue.cancel(operation_id).await?;
        if cancelled {
            self.scheduler.cancel(operation_id);
            self.refresh_metrics();
        }
        Ok(cancelled)
    }

    /// Run one processing cycle.
    ///
    /// Does nothing while stopped or offline. Retries whose backoff has elapsed rejoin the queue
    /// first, then one batch is drawn and dispatched.
    pub async fn process_pending(&mut self) -> Result<SyncReport, SyncError> {
        if !self.running || !self.online {
            debug!(
                "Skipping sync cycle (running: {}, online: {})",
                self.running, self.online
            );
            return Ok(SyncReport::default());
        }

        self.requeue_due().await?;

        let batch = self.queue.dequeue_batch(self.config.batch_size).await?;
        if batch.is_empty() {
            return Ok(SyncReport::default());
        }

        let started = Instant::now();
        self.events
            .dispatch(SyncEvent::SyncStarted {
                batch_size: batch.len(),
                pending: self.queue.pending_count(),
            })
            .await;

        let dispatch = self.dispatcher.dispatch(batch).await;
        self.queue.release(&dispatch.deferred).await?;

        let mut report = SyncReport {
            processed: dispatch.results.len(),
            deferred: dispatch.deferred.len(),
            ..SyncReport::default()
        };

        for result in dispatch.results {
            match result.outcome {
                OperationOutcome::Applied { .. } => {
                    if self
                        .complete_operation(&result.operation.id, result.elapsed)
                        .await?
                    {
                        report.succeeded += 1;
                    }
                }
                OperationOutcome::Conflict { remote } => {
                    if self
                        .route_conflict(result.operation, remote, result.elapsed)
                        .await?
                    {
                        report.conflicts += 1;
                    } else {
                        report.succeeded += 1;
                    }
                }
                OperationOutcome::Failed {
                    error,
                    retry,
                    delay,
                } => match self
                    .fail_operation(&result.operation.id, &error, retry, delay)
                    .await?
                {
                    Some(true) => report.retrying += 1,
                    Some(false) => report.failed += 1,
                    None => {}
                },
            }
        }

        self.refresh_metrics();
        self.events
            .dispatch(SyncEvent::SyncCompleted {
                processed: report.processed,
                succeeded: report.succeeded,
                failed: report.failed,
                conflicts: report.conflicts,
                deferred: report.deferred,
                duration: started.elapsed(),
            })
            .await;
        self.metrics.log_summary();

        Ok(report)
    }

    /// Close a pending conflict with an operator-chosen resolution.
    pub async fn resolve_conflict(
        &mut self,
        conflict_id: &str,
        resolution: Resolution,
    ) -> Result<Option<Value>, SyncError> {
        if resolution == Resolution::Manual {
            return Err(ConflictError::InvalidManualResolution.into());
        }
        self.apply_resolution(conflict_id, resolution, 1.0, true)
            .await
    }

    /// Record a connectivity change. Going online fires the `connection-restored` cache event.
    ///
    /// Returns true when the engine just came online and should process its queue.
    pub async fn set_online(&mut self, online: bool) -> bool {
        if self.online == online {
            return false;
        }
        self.online = online;
        info!("Connectivity changed: {}", if online { "online" } else { "offline" });

        self.events
            .dispatch(SyncEvent::ConnectivityChanged { online })
            .await;
        if online {
            self.fire_cache_event("connection-restored").await;
        }
        online
    }

    /// Invalidate cached reads for a named domain event such as `user-logout`.
    pub async fn handle_domain_event(
        &mut self,
        event: &str,
        data: Option<Value>,
    ) -> Result<InvalidationReport, SyncError> {
        let report = self.cache.invalidate_by_event(event, data.as_ref()).await?;
        Ok(self.announce_invalidation(event, report).await)
    }

    /// Evict every cached entry whose key matches a regular expression.
    pub async fn invalidate_cache_by_pattern(
        &mut self,
        pattern: &str,
    ) -> Result<InvalidationReport, SyncError> {
        let report = self.cache.invalidate_by_pattern(pattern).await?;
        Ok(self
            .announce_invalidation(&format!("pattern:{}", pattern), report)
            .await)
    }

    /// Evict cached entries carrying any of the tags.
    pub async fn invalidate_cache_by_tags(
        &mut self,
        tags: &[&str],
    ) -> Result<InvalidationReport, SyncError> {
        let report = self.cache.invalidate_by_tags(tags).await?;
        Ok(self
            .announce_invalidation(&format!("tags:{}", tags.join(",")), report)
            .await)
    }

    /// Record a new version for `version_key` and evict entries cached under an older one.
    pub async fn invalidate_cache_by_version(
        &mut self,
        version_key: &str,
        version: &str,
    ) -> Result<InvalidationReport, SyncError> {
        let report = self.cache.invalidate_by_version(version_key, version).await?;
        Ok(self
            .announce_invalidation(&format!("version:{}", version_key), report)
            .await)
    }

    /// Record the current version for `version_key` without evicting anything yet.
    pub fn set_cache_version(&mut self, version_key: &str, version: impl Into<String>) {
        self.cache.set_version(version_key, version);
    }

    /// Evict every cached entry its governing rule considers stale.
    pub async fn sweep_cache(&mut self) -> Result<InvalidationReport, SyncError> {
        let report = self.cache.sweep().await?;
        Ok(self.announce_invalidation("sweep", report).await)
    }

    /// Give terminally failed operations a fresh retry budget.
    pub async fn retry_failed(&mut self) -> Result<usize, SyncError> {
        let revived = self.queue.retry_failed().await?;
        self.refresh_metrics();
        Ok(revived)
    }

    /// Drop completed and cancelled operations.
    pub async fn cleanup_completed(&mut self) -> Result<usize, SyncError> {
        let removed = self.queue.cleanup_completed().await?;
        self.refresh_metrics();
        Ok(removed)
    }

    pub fn metrics(&self) -> SyncMetrics {
        self.metrics.current().clone()
    }

    pub fn health(&self) -> HealthStatus {
        self.metrics.current().health(self.queue.capacity())
    }

    pub fn conflicts(&self) -> &[SyncConflict] {
        &self.conflicts
    }

    pub fn pending_conflicts(&self) -> Vec<&SyncConflict> {
        self.conflicts
            .iter()
            .filter(|c| c.status == ConflictStatus::Pending)
            .collect()
    }

    /// Time until the next scheduled retry becomes due
    pub fn next_retry_in(&self) -> Option<Duration> {
        self.scheduler.next_due_in()
    }

    /// Portable snapshot of queue, conflicts, metrics and resolution history.
    pub fn export_data(&self) -> SyncSnapshot {
        SyncSnapshot {
            operations: self.queue.operations().to_vec(),
            conflicts: self.conflicts.clone(),
            metrics: self.metrics.current().clone(),
            resolution_history: self.resolution.history().snapshot(),
            exported_at: Utc::now(),
        }
    }

    pub fn export_json(&self) -> Result<String, SyncError> {
        Ok(serde_json::to_string_pretty(&self.export_data())?)
    }

    /// Replace the engine state with a snapshot.
    ///
    /// Operations that were in flight when the snapshot was taken go back to `pending`.
    pub async fn import_data(&mut self, snapshot: SyncSnapshot) -> Result<(), SyncError> {
        let mut seen = HashSet::new();
        if let Some(duplicate) = snapshot
            .operations
            .iter()
            .find(|op| !seen.insert(op.id.as_str()))
        {
            return Err(SyncError::InvalidSnapshot(format!(
                "duplicate operation id {}",
                duplicate.id
            )));
        }

        self.queue.replace_all(snapshot.operations).await?;
        self.queue.reset_processing().await?;
        self.conflicts = snapshot.conflicts;
        self.resolution
            .history_mut()
            .restore(snapshot.resolution_history);
        self.metrics = MetricsTracker::from_snapshot(&snapshot.metrics);
        self.scheduler.clear();
        self.schedule_restored_retries();
        self.refresh_metrics();

        info!(
            "Imported {} operations and {} conflicts",
            self.queue.len(),
            self.conflicts.len()
        );
        Ok(())
    }

    pub async fn import_json(&mut self, json: &str) -> Result<(), SyncError> {
        let snapshot: SyncSnapshot = serde_json::from_str(json)?;
        self.import_data(snapshot).await
    }

    /// Failed operations that still have retries left are due immediately after a restore.
    fn schedule_restored_retries(&mut self) {
        for operation in self.queue.operations() {
            if operation.status == OperationStatus::Failed && operation.can_retry() {
                self.scheduler.schedule(&operation.id, Duration::ZERO);
            }
        }
    }

    async fn requeue_due(&mut self) -> Result<(), SyncError> {
        for operation_id in self.scheduler.due() {
            if self.queue.requeue(&operation_id).await? {
                debug!("Operation {} is due for another attempt", operation_id);
            }
        }
        Ok(())
    }

    /// Returns false when the result arrived for an operation no longer in flight.
    async fn complete_operation(
        &mut self,
        operation_id: &str,
        elapsed: Duration,
    ) -> Result<bool, SyncError> {
        let Some(operation) = self.queue.mark_completed(operation_id, elapsed).await? else {
            return Ok(false);
        };

        self.metrics.record_success(elapsed);
        self.events
            .dispatch(SyncEvent::OperationCompleted {
                operation_id: operation.id.clone(),
                resource: operation.resource.clone(),
                processing_time: elapsed,
            })
            .await;
        self.invalidate_for_resource(&operation.resource).await;
        Ok(true)
    }

    /// Returns `Some(true)` when a retry was scheduled and `Some(false)` on terminal failure.
    async fn fail_operation(
        &mut self,
        operation_id: &str,
        error: &str,
        retry: bool,
        delay: Duration,
    ) -> Result<Option<bool>, SyncError> {
        let Some(operation) = self.queue.mark_failed(operation_id, error, retry).await? else {
            return Ok(None);
        };
        self.metrics.record_failure();

        if !operation.is_terminal() {
            debug!(
                "Retrying operation {} in {:?} (attempt {} of {})",
                operation.id, delay, operation.retry_count, operation.max_retries
            );
            self.scheduler.schedule(&operation.id, delay);
            return Ok(Some(true));
        }

        error!(
            "Operation {} on {}/{} failed permanently after {} attempts: {}",
            operation.id,
            operation.resource,
            operation.resource_id,
            operation.retry_count,
            error
        );
        self.events
            .dispatch(SyncEvent::OperationFailed {
                operation_id: operation.id.clone(),
                resource: operation.resource.clone(),
                error: error.to_string(),
                retry_count: operation.retry_count,
            })
            .await;
        Ok(Some(false))
    }

    /// Run detection on a conflict signal. Returns false only when the remote copy is identical
    /// to the payload and the replay counts as a clean success.
    async fn route_conflict(
        &mut self,
        operation: SyncOperation,
        remote: Value,
        elapsed: Duration,
    ) -> Result<bool, SyncError> {
        let Some(detection) = self
            .detection
            .detect_reported(&operation.payload, &remote, Some(&operation))
        else {
            debug!(
                "Remote copy of {}/{} matches operation {}; treating as applied",
                operation.resource, operation.resource_id, operation.id
            );
            self.complete_operation(&operation.id, elapsed).await?;
            return Ok(false);
        };

        // the conflict carries the payload forward; any recommit is a new operation
        self.queue.mark_completed(&operation.id, elapsed).await?;

        let conflict = SyncConflict {
            id: generate_id("conflict"),
            resource: operation.resource.clone(),
            resource_id: operation.resource_id.clone(),
            operation_id: Some(operation.id.clone()),
            local_version: operation.payload.clone(),
            remote_version: remote,
            conflict_type: detection.conflict_type,
            fired_detectors: detection.fired,
            severity: detection.severity,
            status: ConflictStatus::Pending,
            resolution: None,
            confidence: None,
            resolved_value: None,
            timestamp: Utc::now(),
        };

        warn!(
            "Conflict {} on {}/{}: {} ({:?})",
            conflict.id,
            conflict.resource,
            conflict.resource_id,
            conflict.conflict_type,
            conflict.severity
        );
        self.metrics.record_conflict();
        self.conflicts.push(conflict.clone());
        self.events
            .dispatch(SyncEvent::ConflictDetected {
                conflict: conflict.clone(),
            })
            .await;

        let escalate = match self.resolution.resolve(&conflict) {
            ResolutionOutcome::Resolved {
                resolution,
                confidence,
                resolver,
            } if resolution != Resolution::Manual => {
                debug!(
                    "Resolver {} settles conflict {} as {:?}",
                    resolver, conflict.id, resolution
                );
                match self
                    .apply_resolution(&conflict.id, resolution, confidence, false)
                    .await
                {
                    Ok(_) => None,
                    Err(e) => {
                        warn!(
                            "Automatic {:?} resolution of conflict {} failed: {}",
                            resolution, conflict.id, e
                        );
                        Some(confidence)
                    }
                }
            }
            outcome => Some(outcome.confidence()),
        };

        if let Some(confidence) = escalate {
            info!(
                "Conflict {} on {}/{} requires manual resolution",
                conflict.id, conflict.resource, conflict.resource_id
            );
            if let Some(pending) = self
                .conflicts
                .iter_mut()
                .find(|c| c.id == conflict.id && !c.is_resolved())
            {
                self.resolution
                    .apply(pending, Resolution::Manual, confidence, false)?;
            }
        }

        Ok(true)
    }

    async fn apply_resolution(
        &mut self,
        conflict_id: &str,
        resolution: Resolution,
        confidence: f64,
        manual: bool,
    ) -> Result<Option<Value>, SyncError> {
        let index = self
            .conflicts
            .iter()
            .position(|c| c.id == conflict_id)
            .ok_or_else(|| ConflictError::NotFound(conflict_id.to_string()))?;

        let recommits = matches!(resolution, Resolution::Local | Resolution::Merge);
        if recommits && !self.conflicts[index].is_resolved() {
            if extract_version(&self.conflicts[index].remote_version) == Some(u64::MAX) {
                return Err(ConflictError::VersionOverflow(conflict_id.to_string()).into());
            }
            let size = self.queue.active_len();
            if size >= self.queue.capacity() {
                return Err(QueueError::QueueFull {
                    size,
                    capacity: self.queue.capacity(),
                }
                .into());
            }
        }

        let value = self
            .resolution
            .apply(&mut self.conflicts[index], resolution, confidence, manual)?;
        let conflict = self.conflicts[index].clone();
        self.metrics.record_resolution();

        match (resolution, &value) {
            (Resolution::Local | Resolution::Merge, Some(value)) => {
                self.recommit(&conflict, value.clone()).await?;
            }
            (Resolution::Remote, _) => {
                self.invalidate_for_resource(&conflict.resource).await;
            }
            _ => {}
        }

        self.refresh_metrics();
        self.events
            .dispatch(SyncEvent::ConflictResolved {
                conflict_id: conflict.id.clone(),
                resource: conflict.resource.clone(),
                resolution,
                confidence,
                manual,
            })
            .await;
        Ok(value)
    }

    /// Queue the resolved value as an update that supersedes the remote version.
    async fn recommit(&mut self, conflict: &SyncConflict, mut value: Value) -> Result<String, SyncError> {
        if let (Some(remote_version), Some(object)) =
            (extract_version(&conflict.remote_version), value.as_object_mut())
        {
            let next = remote_version
                .checked_add(1)
                .ok_or_else(|| ConflictError::VersionOverflow(conflict.id.clone()))?;
            let field = version_field(&conflict.remote_version).unwrap_or("version");
            object.insert(field.to_string(), Value::from(next));
        }

        let priority = conflict
            .operation_id
            .as_deref()
            .and_then(|id| self.queue.get(id))
            .map_or(Priority::High, |op| op.priority);

        let operation_id = self
            .enqueue(NewOperation::new(
                conflict.resource.clone(),
                conflict.resource_id.clone(),
                OperationType::Update,
                value,
                priority,
            ))
            .await?;
        debug!(
            "Recommitted conflict {} as operation {}",
            conflict.id, operation_id
        );
        Ok(operation_id)
    }

    /// Fire the cache events tied to a changed resource
    async fn invalidate_for_resource(&mut self, resource: &str) {
        self.fire_cache_event(&format!("{}-updated", resource)).await;
        if resource == FINANCIAL_RESOURCE {
            self.fire_cache_event("transaction-complete").await;
        }
    }

    async fn announce_invalidation(
        &mut self,
        trigger: &str,
        report: InvalidationReport,
    ) -> InvalidationReport {
        if !report.is_clean() {
            warn!(
                "Cache invalidation ({}) left {} entries in place: {:?}",
                trigger,
                report.errors.len(),
                report.errors
            );
        }
        if report.evicted_count() > 0 {
            self.events
                .dispatch(SyncEvent::CacheInvalidated {
                    trigger: trigger.to_string(),
                    evicted: report.evicted.clone(),
                })
                .await;
        }
        report
    }

    async fn fire_cache_event(&mut self, event: &str) {
        if let Err(e) = self.handle_domain_event(event, None).await {
            warn!("Cache invalidation for {} failed: {}", event, e);
        }
    }

    fn refresh_metrics(&mut self) {
        let pending_conflicts = self
            .conflicts
            .iter()
            .filter(|c| c.status == ConflictStatus::Pending)
            .count();
        self.metrics
            .refresh(&self.queue.status_counts(), self.queue.len(), pending_conflicts);
    }
}
