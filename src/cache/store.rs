use super::types::{CacheEntry, CacheError};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Key/value store holding cached reads.
///
/// The invalidation manager only enumerates, reads and evicts; hosts populate the store.
#[async_trait::async_trait]
pub trait CacheStore: Send + Sync {
	async fn keys(&self) -> Result<Vec<String>, CacheError>;

	async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError>;

	async fn insert(&self, key: &str, entry: CacheEntry) -> Result<(), CacheError>;

	/// Remove a key, returning whether it existed
	async fn remove(&self, key: &str) -> Result<bool, CacheError>;
}

/// In-process cache store
#[derive(Default)]
pub struct MemoryCacheStore {
	entries: RwLock<HashMap<String, CacheEntry>>,
}

impl MemoryCacheStore {
	pub fn new() -> Self {
		Self::default()
	}

	pub async fn len(&self) -> usize {
		self.entries.read().await.len()
	}

	pub async fn contains(&self, key: &str) -> bool {
		self.entries.read().await.contains_key(key)
	}
}

#[async_trait::async_trait]
impl CacheStore for MemoryCacheStore {
	async fn keys(&self) -> Result<Vec<String>, CacheError> {
		let mut keys: Vec<String> = self.entries.read().await.keys().cloned().collect();
		keys.sort();
		Ok(keys)
	}

	async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
		Ok(self.entries.read().await.get(key).cloned())
	}

	async fn insert(&self, key: &str, entry: CacheEntry) -> Result<(), CacheError> {
		self.entries.write().await.insert(key.to_string(), entry);
		Ok(())
	}

	async fn remove(&self, key: &str) -> Result<bool, CacheError> {
		Ok(self.entries.write().await.remove(key).is_some())
	}
}
