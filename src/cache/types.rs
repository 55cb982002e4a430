//! Cache entry, report and error types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Metadata stored alongside a cached value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheMetadata {
    /// When the value was cached
    pub timestamp: DateTime<Utc>,
    /// Version the value was cached under, compared against the rule's version key
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub version: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl CacheMetadata {
    pub fn now() -> Self {
        Self {
            timestamp: Utc::now(),
            version: None,
            tags: Vec::new(),
        }
    }

    pub fn cached_at(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            version: None,
            tags: Vec::new(),
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub value: Value,
    pub metadata: CacheMetadata,
}

impl CacheEntry {
    pub fn new(value: Value, metadata: CacheMetadata) -> Self {
        Self { value, metadata }
    }
}

/// What caused an eviction pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidationTrigger {
    Pattern,
    Tags,
    Event,
    Version,
    Sweep,
}

/// Keys evicted by one invalidation pass plus per-key failures
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InvalidationReport {
    pub evicted: Vec<String>,
    /// `(key, error message)` for keys that could not be read or removed
    pub errors: Vec<(String, String)>,
}

impl InvalidationReport {
    pub fn evicted_count(&self) -> usize {
        self.evicted.len()
    }

    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Eviction counters per trigger
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct InvalidationStats {
    pub rules: usize,
    pub by_pattern: u64,
    pub by_tags: u64,
    pub by_event: u64,
    pub by_version: u64,
    pub by_sweep: u64,
    pub errors: u64,
}

impl InvalidationStats {
    pub fn total_evicted(&self) -> u64 {
        self.by_pattern + self.by_tags + self.by_event + self.by_version + self.by_sweep
    }

    pub(crate) fn record(&mut self, trigger: InvalidationTrigger, report: &InvalidationReport) {
        let evicted = report.evicted.len() as u64;
        match trigger {
            InvalidationTrigger::Pattern => self.by_pattern += evicted,
            InvalidationTrigger::Tags => self.by_tags += evicted,
            InvalidationTrigger::Event => self.by_event += evicted,
            InvalidationTrigger::Version => self.by_version += evicted,
            InvalidationTrigger::Sweep => self.by_sweep += evicted,
        }
        self.errors += report.errors.len() as u64;
    }
}

/// Error types for cache invalidation
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Cache store error: {0}")]
    Store(String),

    #[error("Invalid cache key pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    #[error("Invalidation rule not found: {0}")]
    RuleNotFound(String),
}
