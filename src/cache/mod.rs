//! Cache invalidation
//!
//! Rule-based eviction of cached reads held in a [`CacheStore`]: by age, version, tag, key
//! pattern or named domain event.

/// Invalidation manager
pub mod invalidation;
/// Key matchers, rules and the default rule set
pub mod rules;
/// Cache store trait and in-memory implementation
pub mod store;
/// Entry, metadata, report and error types
pub mod types;

pub use invalidation::CacheInvalidationManager;
pub use rules::{InvalidationRule, KeyMatcher, default_rules};
pub use store::{CacheStore, MemoryCacheStore};
pub use types::*;
