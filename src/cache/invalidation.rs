//! Rule-based cache invalidation
//!
//! The manager keeps an ordered rule table and a table of current versions. The first rule (by
//! descending priority) matching a key governs it. Eviction passes enumerate the store's keys,
//! filter them and remove the survivors of the filter, collecting per-key failures instead of
//! stopping at the first one.

use super::rules::{InvalidationRule, KeyMatcher};
use super::store::CacheStore;
use super::types::{
    CacheEntry, CacheError, CacheMetadata, InvalidationReport, InvalidationStats,
    InvalidationTrigger,
};

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct CacheInvalidationManager {
    store: Arc<dyn CacheStore>,
    rules: Vec<InvalidationRule>,
    versions: HashMap<String, String>,
    stats: InvalidationStats,
}

impl CacheInvalidationManager {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self {
            store,
            rules: Vec::new(),
            versions: HashMap::new(),
            stats: InvalidationStats::default(),
        }
    }

    pub fn with_rules(store: Arc<dyn CacheStore>, rules: Vec<InvalidationRule>) -> Self {
        let mut manager = Self::new(store);
        for rule in rules {
            manager.add_rule(rule);
        }
        manager
    }

    /// Add a rule, replacing any rule with the same name
    pub fn add_rule(&mut self, rule: InvalidationRule) {
        self.rules.retain(|r| r.name != rule.name);
        self.rules.push(rule);
        // stable: equal priorities keep insertion order
        self.rules.sort_by_key(|r| Reverse(r.priority));
    }

    pub fn remove_rule(&mut self, name: &str) -> Result<InvalidationRule, CacheError> {
        let position = self
            .rules
            .iter()
            .position(|r| r.name == name)
            .ok_or_else(|| CacheError::RuleNotFound(name.to_string()))?;
        Ok(self.rules.remove(position))
    }

    pub fn rules(&self) -> &[InvalidationRule] {
        &self.rules
    }

    /// The rule governing a key, if any
    pub fn rule_for(&self, key: &str) -> Option<&InvalidationRule> {
        self.rules.iter().find(|r| r.matches(key))
    }

    pub fn set_version(&mut self, version_key: &str, version: impl Into<String>) {
        self.versions.insert(version_key.to_string(), version.into());
    }

    pub fn current_version(&self, version_key: &str) -> Option<&str> {
        self.versions.get(version_key).map(String::as_str)
    }

    pub fn should_invalidate(&self, key: &str, value: &Value, metadata: &CacheMetadata) -> bool {
        self.should_invalidate_at(key, value, metadata, Utc::now())
    }

    /// Whether the governing rule considers the entry stale at `now`. No rule means keep.
    pub fn should_invalidate_at(
        &self,
        key: &str,
        value: &Value,
        metadata: &CacheMetadata,
        now: DateTime<Utc>,
    ) -> bool {
        let Some(rule) = self.rule_for(key) else {
            return false;
        };

        let expired = rule.max_age.is_some_and(|max_age| {
            chrono::Duration::from_std(max_age)
                .map(|max_age| now - metadata.timestamp > max_age)
                .unwrap_or(false)
        });

        let outdated = rule
            .version_key
            .as_deref()
            .and_then(|version_key| self.current_version(version_key))
            .is_some_and(|current| metadata.version.as_deref() != Some(current));

        let custom = rule
            .predicate
            .as_ref()
            .is_some_and(|predicate| predicate(key, value, metadata));

        if expired || outdated || custom {
            debug!(
                "Rule {} invalidates {} (expired: {}, outdated: {}, custom: {})",
                rule.name, key, expired, outdated, custom
            );
        }
        expired || outdated || custom
    }

    /// Evict every key matching a regular expression
    pub async fn invalidate_by_pattern(
        &mut self,
        pattern: &str,
    ) -> Result<InvalidationReport, CacheError> {
        let matcher = KeyMatcher::regex(pattern)?;
        let report = self
            .evict_where(|key, _| matcher.matches(key))
            .await?;
        Ok(self.finish(InvalidationTrigger::Pattern, pattern, report))
    }

    /// Evict entries carrying any of the tags, or governed by a rule carrying one
    pub async fn invalidate_by_tags(
        &mut self,
        tags: &[&str],
    ) -> Result<InvalidationReport, CacheError> {
        let report = self
            .evict_where(|key, entry| {
                let entry_tagged = entry
                    .metadata
                    .tags
                    .iter()
                    .any(|tag| tags.contains(&tag.as_str()));
                let rule_tagged = self
                    .rule_for(key)
                    .is_some_and(|rule| rule.tags.iter().any(|tag| tags.contains(&tag.as_str())));
                entry_tagged || rule_tagged
            })
            .await?;
        Ok(self.finish(InvalidationTrigger::Tags, &tags.join(","), report))
    }

    /// Evict keys governed by rules listening to a named event
    pub async fn invalidate_by_event(
        &mut self,
        event: &str,
        data: Option<&Value>,
    ) -> Result<InvalidationReport, CacheError> {
        let listening: Vec<&InvalidationRule> =
            self.rules.iter().filter(|r| r.listens_to(event)).collect();
        if listening.is_empty() {
            debug!("No cache rule listens to {}", event);
            return Ok(InvalidationReport::default());
        }
        if let Some(data) = data {
            debug!("Cache event {} with data {}", event, data);
        }

        let report = self
            .evict_where(|key, _| listening.iter().any(|rule| rule.matches(key)))
            .await?;
        Ok(self.finish(InvalidationTrigger::Event, event, report))
    }

    /// Record a new version and evict entries cached under any other version
    pub async fn invalidate_by_version(
        &mut self,
        version_key: &str,
        new_version: &str,
    ) -> Result<InvalidationReport, CacheError> {
        self.set_version(version_key, new_version);

        let report = self
            .evict_where(|key, entry| {
                self.rule_for(key).is_some_and(|rule| {
                    rule.version_key.as_deref() == Some(version_key)
                        && entry.metadata.version.as_deref() != Some(new_version)
                })
            })
            .await?;
        Ok(self.finish(InvalidationTrigger::Version, version_key, report))
    }

    /// Evict every entry its governing rule considers stale
    pub async fn sweep(&mut self) -> Result<InvalidationReport, CacheError> {
        let now = Utc::now();
        let report = self
            .evict_where(|key, entry| {
                self.should_invalidate_at(key, &entry.value, &entry.metadata, now)
            })
            .await?;
        Ok(self.finish(InvalidationTrigger::Sweep, "sweep", report))
    }

    pub fn stats(&self) -> InvalidationStats {
        InvalidationStats {
            rules: self.rules.len(),
            ..self.stats.clone()
        }
    }

    async fn evict_where<F>(&self, filter: F) -> Result<InvalidationReport, CacheError>
    where
        F: Fn(&str, &CacheEntry) -> bool,
    {
        let mut report = InvalidationReport::default();

        for key in self.store.keys().await? {
            let entry = match self.store.get(&key).await {
                Ok(Some(entry)) => entry,
                Ok(None) => continue,
                Err(e) => {
                    report.errors.push((key, e.to_string()));
                    continue;
                }
            };

            if !filter(&key, &entry) {
                continue;
            }

            match self.store.remove(&key).await {
                Ok(_) => report.evicted.push(key),
                Err(e) => report.errors.push((key, e.to_string())),
            }
        }

        Ok(report)
    }

    fn finish(
        &mut self,
        trigger: InvalidationTrigger,
        label: &str,
        report: InvalidationReport,
    ) -> InvalidationReport {
        self.stats.record(trigger, &report);
        if !report.evicted.is_empty() {
            info!(
                "Cache invalidation ({:?} {}) evicted {} entries",
                trigger,
                label,
                report.evicted.len()
            );
        }
        for (key, error) in &report.errors {
            warn!("Failed to invalidate cache key {}: {}", key, error);
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::rules::default_rules;
    use crate::cache::store::MemoryCacheStore;
    use serde_json::json;
    use std::time::Duration;

    async fn seed(store: &MemoryCacheStore, key: &str, metadata: CacheMetadata) {
        store
            .insert(key, CacheEntry::new(json!({"key": key}), metadata))
            .await
            .unwrap();
    }

    fn financial_rule() -> InvalidationRule {
        InvalidationRule::new("financial", KeyMatcher::regex("^api-financial").unwrap())
            .with_priority(100)
            .with_max_age(Duration::from_millis(120_000))
    }

    #[test]
    fn test_max_age_rule() {
        let manager = CacheInvalidationManager::with_rules(
            Arc::new(MemoryCacheStore::new()),
            vec![financial_rule()],
        );
        let now = Utc::now();

        let old = CacheMetadata::cached_at(now - chrono::Duration::seconds(130));
        let fresh = CacheMetadata::cached_at(now - chrono::Duration::seconds(60));

        assert!(manager.should_invalidate_at("api-financial/summary", &json!({}), &old, now));
        assert!(!manager.should_invalidate_at("api-financial/summary", &json!({}), &fresh, now));
        assert!(!manager.should_invalidate_at("api-user/me", &json!({}), &old, now));
    }

    #[test]
    fn test_first_matching_rule_by_priority_governs() {
        let mut manager = CacheInvalidationManager::new(Arc::new(MemoryCacheStore::new()));
        manager.add_rule(
            InvalidationRule::new("broad", KeyMatcher::prefix("api-"))
                .with_priority(1)
                .with_max_age(Duration::from_secs(10)),
        );
        manager.add_rule(
            InvalidationRule::new("specific", KeyMatcher::prefix("api-user"))
                .with_priority(10)
                .with_max_age(Duration::from_secs(3600)),
        );

        let now = Utc::now();
        let metadata = CacheMetadata::cached_at(now - chrono::Duration::seconds(60));
        assert_eq!(manager.rule_for("api-user/me").unwrap().name, "specific");
        assert!(!manager.should_invalidate_at("api-user/me", &json!({}), &metadata, now));
        assert!(manager.should_invalidate_at("api-stats", &json!({}), &metadata, now));
    }

    #[test]
    fn test_version_and_custom_predicate() {
        let mut manager = CacheInvalidationManager::new(Arc::new(MemoryCacheStore::new()));
        manager.add_rule(
            InvalidationRule::new("versioned", KeyMatcher::prefix("api-financial"))
                .with_version_key("financial"),
        );
        manager.add_rule(
            InvalidationRule::new("flagged", KeyMatcher::prefix("api-flags"))
                .with_predicate(|_, value, _| value.get("stale") == Some(&json!(true))),
        );

        let v1 = CacheMetadata::now().with_version("1");
        assert!(!manager.should_invalidate("api-financial/a", &json!({}), &v1));
        manager.set_version("financial", "2");
        assert!(manager.should_invalidate("api-financial/a", &json!({}), &v1));

        let metadata = CacheMetadata::now();
        assert!(manager.should_invalidate("api-flags/x", &json!({"stale": true}), &metadata));
        assert!(!manager.should_invalidate("api-flags/x", &json!({"stale": false}), &metadata));
    }

    #[tokio::test]
    async fn test_sweep_evicts_only_stale_entries() {
        let store = Arc::new(MemoryCacheStore::new());
        let now = Utc::now();
        seed(&store, "api-financial/old", CacheMetadata::cached_at(now - chrono::Duration::seconds(130))).await;
        seed(&store, "api-financial/new", CacheMetadata::cached_at(now - chrono::Duration::seconds(60))).await;
        seed(&store, "unrelated", CacheMetadata::cached_at(now - chrono::Duration::days(30))).await;

        let mut manager = CacheInvalidationManager::with_rules(store.clone(), vec![financial_rule()]);
        let report = manager.sweep().await.unwrap();

        assert_eq!(report.evicted, vec!["api-financial/old"]);
        assert!(store.contains("api-financial/new").await);
        assert!(store.contains("unrelated").await);
        assert_eq!(manager.stats().by_sweep, 1);
    }

    #[tokio::test]
    async fn test_invalidate_by_event_uses_default_rules() {
        let store = Arc::new(MemoryCacheStore::new());
        for key in ["api-financial/balance", "api-analytics/monthly", "api-user/me", "api-categories/all"] {
            seed(&store, key, CacheMetadata::now()).await;
        }

        let mut manager = CacheInvalidationManager::with_rules(store.clone(), default_rules().unwrap());
        let report = manager
            .invalidate_by_event("transaction-complete", Some(&json!({"amount": 12})))
            .await
            .unwrap();

        assert_eq!(report.evicted, vec!["api-analytics/monthly", "api-financial/balance"]);
        assert_eq!(store.len().await, 2);

        let report = manager.invalidate_by_event("user-logout", None).await.unwrap();
        assert_eq!(report.evicted.len(), 2);
        assert_eq!(store.len().await, 0);
        assert_eq!(manager.stats().by_event, 4);

        let report = manager.invalidate_by_event("nobody-listens", None).await.unwrap();
        assert!(report.evicted.is_empty());
    }

    #[tokio::test]
    async fn test_invalidate_by_pattern_and_tags() {
        let store = Arc::new(MemoryCacheStore::new());
        seed(&store, "api-user/1", CacheMetadata::now()).await;
        seed(&store, "api-user/2", CacheMetadata::now().with_tags(["profile"])).await;
        seed(&store, "api-categories/all", CacheMetadata::now()).await;
        seed(&store, "misc", CacheMetadata::now().with_tags(["profile"])).await;

        let mut manager = CacheInvalidationManager::with_rules(store.clone(), default_rules().unwrap());

        let report = manager.invalidate_by_pattern(r"^api-user/1$").await.unwrap();
        assert_eq!(report.evicted, vec!["api-user/1"]);

        let report = manager.invalidate_by_tags(&["profile", "categories"]).await.unwrap();
        assert_eq!(report.evicted, vec!["api-categories/all", "api-user/2", "misc"]);
        assert_eq!(store.len().await, 0);
        assert_eq!(manager.stats().total_evicted(), 4);

        assert!(matches!(
            manager.invalidate_by_pattern("(").await,
            Err(CacheError::InvalidPattern(_))
        ));
    }

    #[tokio::test]
    async fn test_invalidate_by_version() {
        let store = Arc::new(MemoryCacheStore::new());
        seed(&store, "api-financial/a", CacheMetadata::now().with_version("1")).await;
        seed(&store, "api-financial/b", CacheMetadata::now().with_version("2")).await;
        seed(&store, "api-user/me", CacheMetadata::now().with_version("1")).await;

        let mut manager = CacheInvalidationManager::with_rules(store.clone(), default_rules().unwrap());
        let report = manager.invalidate_by_version("financial", "2").await.unwrap();

        assert_eq!(report.evicted, vec!["api-financial/a"]);
        assert_eq!(manager.current_version("financial"), Some("2"));
        assert!(store.contains("api-user/me").await);
    }

    #[test]
    fn test_add_and_remove_rules() {
        let mut manager = CacheInvalidationManager::with_rules(
            Arc::new(MemoryCacheStore::new()),
            default_rules().unwrap(),
        );
        assert_eq!(manager.stats().rules, 4);

        manager.add_rule(InvalidationRule::new("api-user", KeyMatcher::prefix("api-user")).with_priority(1));
        assert_eq!(manager.rules().len(), 4);
        assert_eq!(manager.rules().last().unwrap().name, "api-user");

        manager.remove_rule("api-user").unwrap();
        assert!(manager.rule_for("api-user/me").is_none());
        assert!(matches!(
            manager.remove_rule("missing"),
            Err(CacheError::RuleNotFound(_))
        ));
    }
}
