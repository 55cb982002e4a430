//! Cache invalidation rules
//!
//! A rule matches cache keys by prefix, regular expression or custom predicate, and declares
//! when matching entries are stale: by age, by version, by a custom check, or when one of its
//! events fires.

use super::types::{CacheError, CacheMetadata};
use regex::Regex;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub type KeyPredicate = Arc<dyn Fn(&str) -> bool + Send + Sync>;
pub type EntryPredicate = Arc<dyn Fn(&str, &Value, &CacheMetadata) -> bool + Send + Sync>;

/// How a rule selects cache keys
#[derive(Clone)]
pub enum KeyMatcher {
    Prefix(String),
    Regex(Regex),
    Custom(KeyPredicate),
}

impl KeyMatcher {
    pub fn prefix(prefix: impl Into<String>) -> Self {
        KeyMatcher::Prefix(prefix.into())
    }

    pub fn regex(pattern: &str) -> Result<Self, CacheError> {
        Ok(KeyMatcher::Regex(Regex::new(pattern)?))
    }

    pub fn custom(predicate: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        KeyMatcher::Custom(Arc::new(predicate))
    }

    pub fn matches(&self, key: &str) -> bool {
        match self {
            KeyMatcher::Prefix(prefix) => key.starts_with(prefix.as_str()),
            KeyMatcher::Regex(regex) => regex.is_match(key),
            KeyMatcher::Custom(predicate) => predicate(key),
        }
    }
}

impl fmt::Debug for KeyMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyMatcher::Prefix(prefix) => write!(f, "Prefix({:?})", prefix),
            KeyMatcher::Regex(regex) => write!(f, "Regex({:?})", regex.as_str()),
            KeyMatcher::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

#[derive(Clone)]
pub struct InvalidationRule {
    pub name: String,
    pub matcher: KeyMatcher,
    /// Higher priority rules are evaluated first
    pub priority: i32,
    pub max_age: Option<Duration>,
    pub version_key: Option<String>,
    pub tags: Vec<String>,
    pub invalidate_on_events: Vec<String>,
    pub predicate: Option<EntryPredicate>,
}

impl InvalidationRule {
    pub fn new(name: impl Into<String>, matcher: KeyMatcher) -> Self {
        Self {
            name: name.into(),
            matcher,
            priority: 0,
            max_age: None,
            version_key: None,
            tags: Vec::new(),
            invalidate_on_events: Vec::new(),
            predicate: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    pub fn with_version_key(mut self, version_key: impl Into<String>) -> Self {
        self.version_key = Some(version_key.into());
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

    pub fn on_events<I, S>(mut self, events: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.invalidate_on_events = events.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_predicate(
        mut self,
        predicate: impl Fn(&str, &Value, &CacheMetadata) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    pub fn matches(&self, key: &str) -> bool {
        self.matcher.matches(key)
    }

    pub fn listens_to(&self, event: &str) -> bool {
        self.invalidate_on_events.iter().any(|e| e == event)
    }
}

impl fmt::Debug for InvalidationRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvalidationRule")
            .field("name", &self.name)
            .field("matcher", &self.matcher)
            .field("priority", &self.priority)
            .field("max_age", &self.max_age)
            .field("version_key", &self.version_key)
            .field("tags", &self.tags)
            .field("invalidate_on_events", &self.invalidate_on_events)
            .field("predicate", &self.predicate.as_ref().map(|_| ".."))
            .finish()
    }
}

/// Rules for the personal-finance host's cached API reads
pub fn default_rules() -> Result<Vec<InvalidationRule>, CacheError> {
    Ok(vec![
        InvalidationRule::new("api-financial", KeyMatcher::regex("^api-financial")?)
            .with_priority(100)
            .with_max_age(Duration::from_secs(120))
            .with_version_key("financial")
            .with_tags(["financial", "transactions", "balances"])
            .on_events([
                "transaction-complete",
                "balance-change",
                "financial-updated",
                "user-logout",
            ]),
        InvalidationRule::new("api-user", KeyMatcher::regex("^api-user")?)
            .with_priority(80)
            .with_max_age(Duration::from_secs(5 * 60))
            .with_tags(["user"])
            .on_events(["user-updated", "user-logout"]),
        InvalidationRule::new("api-analytics", KeyMatcher::regex("^api-analytics")?)
            .with_priority(50)
            .with_max_age(Duration::from_secs(15 * 60))
            .with_tags(["analytics", "dashboard"])
            .on_events(["transaction-complete", "analytics-updated", "user-logout"]),
        InvalidationRule::new("api-categories", KeyMatcher::regex("^api-categories")?)
            .with_priority(40)
            .with_max_age(Duration::from_secs(60 * 60))
            .with_tags(["categories"])
            .on_events(["categories-updated", "user-logout", "connection-restored"]),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matchers() {
        assert!(KeyMatcher::prefix("api-user").matches("api-user/42"));
        assert!(!KeyMatcher::prefix("api-user").matches("cached/api-user/42"));

        let regex = KeyMatcher::regex(r"^api-(financial|analytics)/\d+$").unwrap();
        assert!(regex.matches("api-financial/7"));
        assert!(!regex.matches("api-user/7"));

        let custom = KeyMatcher::custom(|key| key.len() > 3);
        assert!(custom.matches("long-key"));
        assert!(!custom.matches("k"));
    }

    #[test]
    fn test_invalid_regex_is_reported() {
        assert!(matches!(
            KeyMatcher::regex("(unclosed"),
            Err(CacheError::InvalidPattern(_))
        ));
    }

    #[test]
    fn test_default_rules() {
        let rules = default_rules().unwrap();
        let names: Vec<&str> = rules.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["api-financial", "api-user", "api-analytics", "api-categories"]);
        assert!(rules[0].listens_to("transaction-complete"));
        assert!(rules.iter().all(|r| r.listens_to("user-logout")));
    }
}
