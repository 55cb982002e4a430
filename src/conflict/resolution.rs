//! Conflict resolution
//!
//! Resolvers are tried in descending confidence order and the first one able to handle a conflict
//! supplies the outcome. Resource-class policies that escalate to a human are authoritative and
//! consulted before the confidence-ordered list, so money conflicts are never settled by a
//! heuristic. When nothing applies the outcome is [`ResolutionOutcome::Unresolved`] and the
//! conflict stays pending for an operator.
//!
//! The engine also owns the bounded per-resource resolution history consumed by the learning
//! resolver, and the merge strategies applied when the outcome is `merge`.

use super::merge::MergeEngine;
use super::types::{ConflictError, ConflictStatus, Resolution, ResolutionRecord, SyncConflict};
use crate::utils::{extract_timestamp, extract_version};

use chrono::Utc;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use tracing::{debug, info};

/// Default number of resolutions remembered per resource
pub const DEFAULT_HISTORY_LIMIT: usize = 10;

/// Minimum history needed before the learning resolver trusts it
const LEARNING_MIN_SAMPLES: usize = 3;

/// Bounded per-resource record of past resolutions
#[derive(Debug, Clone)]
pub struct ResolutionHistory {
    entries: HashMap<String, VecDeque<ResolutionRecord>>,
    limit: usize,
}

impl ResolutionHistory {
    pub fn new(limit: usize) -> Self {
        Self {
            entries: HashMap::new(),
            limit,
        }
    }

    pub fn record(&mut self, resource: &str, record: ResolutionRecord) {
        let entries = self.entries.entry(resource.to_string()).or_default();
        entries.push_back(record);
        while entries.len() > self.limit {
            entries.pop_front();
        }
    }

    pub fn for_resource(&self, resource: &str) -> Vec<ResolutionRecord> {
        self.entries
            .get(resource)
            .map(|entries| entries.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self, resource: &str) -> usize {
        self.entries.get(resource).map_or(0, VecDeque::len)
    }

    /// Most frequent past resolution for a resource; ties go to the most recent.
    pub fn most_frequent(&self, resource: &str) -> Option<Resolution> {
        let entries = self.entries.get(resource)?;
        let mut counts: HashMap<Resolution, (usize, usize)> = HashMap::new();
        for (position, record) in entries.iter().enumerate() {
            let entry = counts.entry(record.resolution).or_insert((0, 0));
            entry.0 += 1;
            entry.1 = position;
        }
        counts
            .into_iter()
            .max_by_key(|(_, (count, last_seen))| (*count, *last_seen))
            .map(|(resolution, _)| resolution)
    }

    pub fn snapshot(&self) -> HashMap<String, Vec<ResolutionRecord>> {
        self.entries
            .iter()
            .map(|(resource, entries)| (resource.clone(), entries.iter().cloned().collect()))
            .collect()
    }

    pub fn restore(&mut self, snapshot: HashMap<String, Vec<ResolutionRecord>>) {
        self.entries.clear();
        for (resource, records) in snapshot {
            for record in records {
                self.record(&resource, record);
            }
        }
    }
}

impl Default for ResolutionHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LIMIT)
    }
}

/// A policy that assigns an automatic outcome to a conflict
pub trait ConflictResolver: Send + Sync {
    fn name(&self) -> &'static str;

    fn confidence(&self) -> f64;

    /// Whether this resolver must decide the conflict regardless of confidence order
    fn is_authoritative_for(&self, _conflict: &SyncConflict) -> bool {
        false
    }

    fn can_resolve(&self, conflict: &SyncConflict, history: &ResolutionHistory) -> bool;

    fn resolve(&self, conflict: &SyncConflict, history: &ResolutionHistory) -> Resolution;
}

/// Higher version wins; equal or lower remote version keeps local
pub struct VersionBasedResolver;

impl ConflictResolver for VersionBasedResolver {
    fn name(&self) -> &'static str {
        "version_based"
    }

    fn confidence(&self) -> f64 {
        0.9
    }

    fn can_resolve(&self, conflict: &SyncConflict, _history: &ResolutionHistory) -> bool {
        extract_version(&conflict.local_version).is_some()
            && extract_version(&conflict.remote_version).is_some()
    }

    fn resolve(&self, conflict: &SyncConflict, _history: &ResolutionHistory) -> Resolution {
        match (
            extract_version(&conflict.local_version),
            extract_version(&conflict.remote_version),
        ) {
            (Some(local), Some(remote)) if remote > local => Resolution::Remote,
            _ => Resolution::Local,
        }
    }
}

/// Strictly newer remote timestamp wins
pub struct TimestampBasedResolver;

impl ConflictResolver for TimestampBasedResolver {
    fn name(&self) -> &'static str {
        "timestamp_based"
    }

    fn confidence(&self) -> f64 {
        0.7
    }

    fn can_resolve(&self, conflict: &SyncConflict, _history: &ResolutionHistory) -> bool {
        extract_timestamp(&conflict.local_version).is_some()
            && extract_timestamp(&conflict.remote_version).is_some()
    }

    fn resolve(&self, conflict: &SyncConflict, _history: &ResolutionHistory) -> Resolution {
        match (
            extract_timestamp(&conflict.local_version),
            extract_timestamp(&conflict.remote_version),
        ) {
            (Some(local), Some(remote)) if remote > local => Resolution::Remote,
            _ => Resolution::Local,
        }
    }
}

/// Resource-class policy: financial conflicts escalate, user preferences merge
pub struct PriorityBasedResolver {
    policies: HashMap<String, Resolution>,
}

impl PriorityBasedResolver {
    pub fn new() -> Self {
        let mut policies = HashMap::new();
        policies.insert("financial".to_string(), Resolution::Manual);
        policies.insert("user".to_string(), Resolution::Merge);
        policies.insert("preferences".to_string(), Resolution::Merge);
        Self { policies }
    }

    pub fn with_policy(mut self, resource: &str, resolution: Resolution) -> Self {
        self.policies.insert(resource.to_string(), resolution);
        self
    }
}

impl Default for PriorityBasedResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl ConflictResolver for PriorityBasedResolver {
    fn name(&self) -> &'static str {
        "priority_based"
    }

    fn confidence(&self) -> f64 {
        0.8
    }

    fn is_authoritative_for(&self, conflict: &SyncConflict) -> bool {
        self.policies.get(&conflict.resource) == Some(&Resolution::Manual)
    }

    fn can_resolve(&self, conflict: &SyncConflict, _history: &ResolutionHistory) -> bool {
        self.policies.contains_key(&conflict.resource)
    }

    fn resolve(&self, conflict: &SyncConflict, _history: &ResolutionHistory) -> Resolution {
        self.policies
            .get(&conflict.resource)
            .copied()
            .unwrap_or(Resolution::Manual)
    }
}

/// Size of a blob-like value: a string, or an object wrapping one under `data`/`blob`/`content`
fn blob_size(value: &Value) -> Option<usize> {
    match value {
        Value::String(s) => Some(s.len()),
        Value::Object(object) => ["data", "blob", "content"]
            .iter()
            .find_map(|field| object.get(*field).and_then(Value::as_str))
            .map(str::len),
        _ => None,
    }
}

/// For blob-like values the larger payload wins
pub struct SizeBasedResolver;

impl ConflictResolver for SizeBasedResolver {
    fn name(&self) -> &'static str {
        "size_based"
    }

    fn confidence(&self) -> f64 {
        0.6
    }

    fn can_resolve(&self, conflict: &SyncConflict, _history: &ResolutionHistory) -> bool {
        matches!(
            (blob_size(&conflict.local_version), blob_size(&conflict.remote_version)),
            (Some(local), Some(remote)) if local != remote
        )
    }

    fn resolve(&self, conflict: &SyncConflict, _history: &ResolutionHistory) -> Resolution {
        let local = blob_size(&conflict.local_version).unwrap_or(0);
        let remote = blob_size(&conflict.remote_version).unwrap_or(0);
        if local > remote {
            Resolution::Local
        } else {
            Resolution::Remote
        }
    }
}

/// Most frequent past resolution once enough history exists for the resource
pub struct LearningBasedResolver;

impl ConflictResolver for LearningBasedResolver {
    fn name(&self) -> &'static str {
        "learning_based"
    }

    fn confidence(&self) -> f64 {
        0.5
    }

    fn can_resolve(&self, conflict: &SyncConflict, history: &ResolutionHistory) -> bool {
        history.len(&conflict.resource) >= LEARNING_MIN_SAMPLES
    }

    fn resolve(&self, conflict: &SyncConflict, history: &ResolutionHistory) -> Resolution {
        history
            .most_frequent(&conflict.resource)
            .unwrap_or(Resolution::Manual)
    }
}

/// Outcome of the automatic pipeline
#[derive(Debug, Clone, PartialEq)]
pub enum ResolutionOutcome {
    Resolved {
        resolution: Resolution,
        confidence: f64,
        resolver: &'static str,
    },
    /// No resolver could decide; the conflict waits for an operator
    Unresolved,
}

impl ResolutionOutcome {
    pub fn resolution(&self) -> Resolution {
        match self {
            ResolutionOutcome::Resolved { resolution, .. } => *resolution,
            ResolutionOutcome::Unresolved => Resolution::Manual,
        }
    }

    pub fn confidence(&self) -> f64 {
        match self {
            ResolutionOutcome::Resolved { confidence, .. } => *confidence,
            ResolutionOutcome::Unresolved => 0.0,
        }
    }

    /// Whether the conflict can be closed without an operator
    pub fn is_automatic(&self) -> bool {
        self.resolution() != Resolution::Manual
    }
}

/// Confidence-ordered resolver pipeline plus merge strategies and resolution history
pub struct ConflictResolutionEngine {
    resolvers: Vec<Box<dyn ConflictResolver>>,
    merge_engine: MergeEngine,
    history: ResolutionHistory,
}

impl ConflictResolutionEngine {
    pub fn new(merge_engine: MergeEngine, history_limit: usize) -> Self {
        let mut engine = Self {
            resolvers: Vec::new(),
            merge_engine,
            history: ResolutionHistory::new(history_limit),
        };
        engine.register(Box::new(VersionBasedResolver));
        engine.register(Box::new(TimestampBasedResolver));
        engine.register(Box::new(PriorityBasedResolver::new()));
        engine.register(Box::new(SizeBasedResolver));
        engine.register(Box::new(LearningBasedResolver));
        engine
    }

    /// Add a resolver, keeping the list in descending confidence order
    pub fn register(&mut self, resolver: Box<dyn ConflictResolver>) {
        self.resolvers.push(resolver);
        self.resolvers
            .sort_by(|a, b| b.confidence().total_cmp(&a.confidence()));
    }

    /// Replace a resolver by name
    pub fn replace(&mut self, resolver: Box<dyn ConflictResolver>) {
        self.resolvers.retain(|r| r.name() != resolver.name());
        self.register(resolver);
    }

    pub fn resolver_names(&self) -> Vec<&'static str> {
        self.resolvers.iter().map(|r| r.name()).collect()
    }

    /// Run the automatic pipeline for a conflict
    pub fn resolve(&self, conflict: &SyncConflict) -> ResolutionOutcome {
        let authoritative = self
            .resolvers
            .iter()
            .find(|r| r.is_authoritative_for(conflict));

        let chosen = authoritative.or_else(|| {
            self.resolvers
                .iter()
                .find(|r| r.can_resolve(conflict, &self.history))
        });

        match chosen {
            Some(resolver) => {
                let resolution = resolver.resolve(conflict, &self.history);
                debug!(
                    "Resolver {} chose {:?} for conflict {} (confidence {})",
                    resolver.name(),
                    resolution,
                    conflict.id,
                    resolver.confidence()
                );
                ResolutionOutcome::Resolved {
                    resolution,
                    confidence: resolver.confidence(),
                    resolver: resolver.name(),
                }
            }
            None => {
                debug!("No resolver could decide conflict {}", conflict.id);
                ResolutionOutcome::Unresolved
            }
        }
    }

    /// The value a resolution commits to; `None` for manual escalation
    pub fn resolved_value(&self, conflict: &SyncConflict, resolution: Resolution) -> Option<Value> {
        match resolution {
            Resolution::Local => Some(conflict.local_version.clone()),
            Resolution::Remote => Some(conflict.remote_version.clone()),
            Resolution::Merge => {
                let (strategy, merged) = self
                    .merge_engine
                    .merge(&conflict.local_version, &conflict.remote_version);
                debug!("Merged conflict {} using {}", conflict.id, strategy);
                Some(merged)
            }
            Resolution::Manual => None,
        }
    }

    /// Close a conflict with the given resolution and remember it.
    ///
    /// A `manual` resolution only tags the conflict; it stays pending. Resolved conflicts are
    /// immutable.
    pub fn apply(
        &mut self,
        conflict: &mut SyncConflict,
        resolution: Resolution,
        confidence: f64,
        manual: bool,
    ) -> Result<Option<Value>, ConflictError> {
        if conflict.is_resolved() {
            return Err(ConflictError::AlreadyResolved(conflict.id.clone()));
        }

        conflict.resolution = Some(resolution);
        conflict.confidence = Some(confidence);

        if resolution == Resolution::Manual {
            return Ok(None);
        }

        let value = self.resolved_value(conflict, resolution);
        conflict.resolved_value = value.clone();
        conflict.status = ConflictStatus::Resolved;

        self.history.record(
            &conflict.resource,
            ResolutionRecord {
                conflict_id: conflict.id.clone(),
                resolution,
                confidence,
                manual,
                timestamp: Utc::now(),
            },
        );

        info!(
            "Resolved conflict {} on {}/{} as {:?}{}",
            conflict.id,
            conflict.resource,
            conflict.resource_id,
            resolution,
            if manual { " (operator)" } else { "" }
        );
        Ok(value)
    }

    pub fn history(&self) -> &ResolutionHistory {
        &self.history
    }

    pub fn history_mut(&mut self) -> &mut ResolutionHistory {
        &mut self.history
    }
}

impl Default for ConflictResolutionEngine {
    fn default() -> Self {
        Self::new(MergeEngine::default(), DEFAULT_HISTORY_LIMIT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::types::ConflictSeverity;
    use serde_json::json;

    fn make_conflict(resource: &str, local: Value, remote: Value) -> SyncConflict {
        SyncConflict {
            id: "conflict-1".to_string(),
            resource: resource.to_string(),
            resource_id: "r-1".to_string(),
            operation_id: None,
            local_version: local,
            remote_version: remote,
            conflict_type: "version_mismatch".to_string(),
            fired_detectors: vec![],
            severity: ConflictSeverity::High,
            status: ConflictStatus::Pending,
            resolution: None,
            confidence: None,
            resolved_value: None,
            timestamp: Utc::now(),
        }
    }

    fn record(resolution: Resolution) -> ResolutionRecord {
        ResolutionRecord {
            conflict_id: "c".to_string(),
            resolution,
            confidence: 1.0,
            manual: true,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_resolvers_are_ordered_by_confidence() {
        let engine = ConflictResolutionEngine::default();
        assert_eq!(
            engine.resolver_names(),
            vec!["version_based", "priority_based", "timestamp_based", "size_based", "learning_based"]
        );
    }

    #[test]
    fn test_higher_version_wins_regardless_of_timestamp() {
        let engine = ConflictResolutionEngine::default();
        let cases = [
            (1, 2, "2024-01-02T00:00:00Z", "2024-01-01T00:00:00Z", Resolution::Remote),
            (3, 2, "2024-01-01T00:00:00Z", "2024-01-02T00:00:00Z", Resolution::Local),
            (5, 9, "2024-01-01T00:00:00Z", "2024-01-01T00:00:00Z", Resolution::Remote),
            (4, 4, "2024-01-01T00:00:00Z", "2024-01-03T00:00:00Z", Resolution::Local),
        ];

        for (local_version, remote_version, local_ts, remote_ts, expected) in cases {
            let conflict = make_conflict(
                "analytics",
                json!({"version": local_version, "updatedAt": local_ts}),
                json!({"version": remote_version, "updatedAt": remote_ts}),
            );
            assert_eq!(
                engine.resolve(&conflict),
                ResolutionOutcome::Resolved {
                    resolution: expected,
                    confidence: 0.9,
                    resolver: "version_based",
                }
            );
        }
    }

    #[test]
    fn test_financial_is_always_manual() {
        let engine = ConflictResolutionEngine::default();
        let pairs = [
            (json!({"amount": 50, "version": 1}), json!({"amount": 30, "version": 2})),
            (json!({"amount": 50, "updatedAt": "2024-01-01T00:00:00Z"}), json!({"amount": 30, "updatedAt": "2024-01-02T00:00:00Z"})),
            (json!("short"), json!("a much longer blob")),
            (json!({"amount": 50}), json!({"amount": 30})),
        ];

        for (local, remote) in pairs {
            let outcome = engine.resolve(&make_conflict("financial", local, remote));
            assert_eq!(outcome.resolution(), Resolution::Manual);
            assert!(!outcome.is_automatic());
        }
    }

    #[test]
    fn test_financial_stays_manual_with_learned_history() {
        let mut engine = ConflictResolutionEngine::default();
        for _ in 0..5 {
            engine.history_mut().record("financial", record(Resolution::Remote));
        }
        let outcome = engine.resolve(&make_conflict("financial", json!({"a": 1}), json!({"a": 2})));
        assert_eq!(outcome.resolution(), Resolution::Manual);
    }

    #[test]
    fn test_user_preferences_merge() {
        let engine = ConflictResolutionEngine::default();
        let outcome = engine.resolve(&make_conflict("user", json!({"theme": "dark"}), json!({"lang": "en"})));
        assert_eq!(
            outcome,
            ResolutionOutcome::Resolved {
                resolution: Resolution::Merge,
                confidence: 0.8,
                resolver: "priority_based",
            }
        );
    }

    #[test]
    fn test_timestamp_resolver() {
        let engine = ConflictResolutionEngine::default();
        let conflict = make_conflict(
            "analytics",
            json!({"updatedAt": "2024-01-01T00:00:00Z"}),
            json!({"updatedAt": "2024-01-01T00:05:00Z"}),
        );
        let outcome = engine.resolve(&conflict);
        assert_eq!(outcome.resolution(), Resolution::Remote);
        assert_eq!(outcome.confidence(), 0.7);
    }

    #[test]
    fn test_size_resolver_prefers_larger_blob() {
        let engine = ConflictResolutionEngine::default();
        let conflict = make_conflict("attachments", json!({"data": "aGVsbG8gd29ybGQ="}), json!({"data": "aGk="}));
        let outcome = engine.resolve(&conflict);
        assert_eq!(outcome.resolution(), Resolution::Local);
        assert_eq!(outcome.confidence(), 0.6);
    }

    #[test]
    fn test_learning_resolver_needs_three_samples() {
        let mut engine = ConflictResolutionEngine::default();
        let conflict = make_conflict("categories", json!({"name": "a"}), json!({"name": "b"}));
        assert_eq!(engine.resolve(&conflict), ResolutionOutcome::Unresolved);

        engine.history_mut().record("categories", record(Resolution::Local));
        engine.history_mut().record("categories", record(Resolution::Remote));
        assert_eq!(engine.resolve(&conflict), ResolutionOutcome::Unresolved);

        engine.history_mut().record("categories", record(Resolution::Remote));
        assert_eq!(
            engine.resolve(&conflict),
            ResolutionOutcome::Resolved {
                resolution: Resolution::Remote,
                confidence: 0.5,
                resolver: "learning_based",
            }
        );
    }

    #[test]
    fn test_unresolved_is_manual_with_zero_confidence() {
        let outcome = ResolutionOutcome::Unresolved;
        assert_eq!(outcome.resolution(), Resolution::Manual);
        assert_eq!(outcome.confidence(), 0.0);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut history = ResolutionHistory::new(10);
        for _ in 0..8 {
            history.record("user", record(Resolution::Local));
        }
        for _ in 0..7 {
            history.record("user", record(Resolution::Remote));
        }
        assert_eq!(history.len("user"), 10);
        assert_eq!(history.most_frequent("user"), Some(Resolution::Remote));
    }

    #[test]
    fn test_apply_closes_conflict_and_records_history() {
        let mut engine = ConflictResolutionEngine::default();
        let mut conflict = make_conflict("user", json!({"theme": "dark"}), json!({"lang": "en"}));

        let value = engine.apply(&mut conflict, Resolution::Merge, 0.8, false).unwrap();
        assert_eq!(value, Some(json!({"theme": "dark", "lang": "en"})));
        assert_eq!(conflict.status, ConflictStatus::Resolved);
        assert_eq!(engine.history().len("user"), 1);

        let err = engine.apply(&mut conflict, Resolution::Local, 1.0, true).unwrap_err();
        assert!(matches!(err, ConflictError::AlreadyResolved(_)));
        assert_eq!(conflict.resolution, Some(Resolution::Merge));
    }

    #[test]
    fn test_apply_manual_keeps_conflict_pending() {
        let mut engine = ConflictResolutionEngine::default();
        let mut conflict = make_conflict("financial", json!({"amount": 1}), json!({"amount": 2}));

        let value = engine.apply(&mut conflict, Resolution::Manual, 0.8, false).unwrap();
        assert!(value.is_none());
        assert_eq!(conflict.status, ConflictStatus::Pending);
        assert_eq!(conflict.resolution, Some(Resolution::Manual));
        assert_eq!(engine.history().len("financial"), 0);
    }

    #[test]
    fn test_history_snapshot_round_trip() {
        let mut history = ResolutionHistory::default();
        history.record("user", record(Resolution::Merge));
        let mut restored = ResolutionHistory::default();
        restored.restore(history.snapshot());
        assert_eq!(restored.for_resource("user"), history.for_resource("user"));
    }
}
