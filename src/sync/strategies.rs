use crate::queue::SyncOperation;
use crate::remote::{RemoteError, ReplayClient, ReplayOutcome, RequestBuilder};

use std::time::Duration;

/// Upper bound for exponential backoff delays
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Exponential backoff: `base × 2^retry_count`, capped.
pub fn exponential_delay(base: Duration, retry_count: u32, cap: Duration) -> Duration {
	let factor = 2u32.checked_pow(retry_count).unwrap_or(u32::MAX);
	base.checked_mul(factor).map_or(cap, |delay| delay.min(cap))
}

/// Replay and retry policy for one class of resources
#[async_trait::async_trait]
pub trait BatchStrategy: Send + Sync {
	/// Get the name of this strategy
	fn name(&self) -> &'static str;

	/// Specificity; the dispatcher tries strategies from highest to lowest
	fn priority(&self) -> u32;

	/// Operations replayed per chunk
	fn batch_size(&self) -> usize;

	/// Whether every operation in the slice belongs to this strategy
	fn can_process(&self, operations: &[SyncOperation]) -> bool;

	/// Replay one operation against the remote surface
	async fn process(
		&self,
		operation: &SyncOperation,
		client: &dyn ReplayClient,
		requests: &RequestBuilder,
	) -> Result<ReplayOutcome, RemoteError> {
		client.send(&requests.build(operation)).await
	}

	/// Whether a failed operation gets another attempt.
	///
	/// `operation.retry_count` already includes the failure being judged.
	fn should_retry(&self, operation: &SyncOperation, error: &RemoteError) -> bool;

	/// Delay before the next attempt, from the operation's current retry count
	fn get_delay(&self, operation: &SyncOperation) -> Duration;
}

fn all_resources(operations: &[SyncOperation], resources: &[&str]) -> bool {
	!operations.is_empty()
		&& operations
			.iter()
			.all(|op| resources.contains(&op.resource.as_str()))
}

/// Money movements: small chunks, retried on transient errors with a slow backoff
pub struct FinancialStrategy;

#[async_trait::async_trait]
impl BatchStrategy for FinancialStrategy {
	fn name(&self) -> &'static str {
		"financial"
	}

	fn priority(&self) -> u32 {
		100
	}

	fn batch_size(&self) -> usize {
		5
	}

	fn can_process(&self, operations: &[SyncOperation]) -> bool {
		all_resources(operations, &["financial", "transactions"])
	}

	fn should_retry(&self, operation: &SyncOperation, error: &RemoteError) -> bool {
		error.is_transient() && operation.can_retry()
	}

	fn get_delay(&self, operation: &SyncOperation) -> Duration {
		exponential_delay(Duration::from_millis(1000), operation.retry_count, MAX_BACKOFF)
	}
}

/// Profile and preference writes
pub struct UserStrategy;

#[async_trait::async_trait]
impl BatchStrategy for UserStrategy {
	fn name(&self) -> &'static str {
		"user"
	}

	fn priority(&self) -> u32 {
		80
	}

	fn batch_size(&self) -> usize {
		10
	}

	fn can_process(&self, operations: &[SyncOperation]) -> bool {
		all_resources(operations, &["user", "preferences", "user-preferences"])
	}

	fn should_retry(&self, operation: &SyncOperation, error: &RemoteError) -> bool {
		error.is_transient() && operation.can_retry()
	}

	fn get_delay(&self, operation: &SyncOperation) -> Duration {
		exponential_delay(Duration::from_millis(500), operation.retry_count, MAX_BACKOFF)
	}
}

/// Cache warm-up writes: one quick retry, then give up
pub struct CacheStrategy;

#[async_trait::async_trait]
impl BatchStrategy for CacheStrategy {
	fn name(&self) -> &'static str {
		"cache"
	}

	fn priority(&self) -> u32 {
		60
	}

	fn batch_size(&self) -> usize {
		20
	}

	fn can_process(&self, operations: &[SyncOperation]) -> bool {
		!operations.is_empty()
			&& operations
				.iter()
				.all(|op| op.resource == "cache" || op.resource.starts_with("cache-"))
	}

	fn should_retry(&self, operation: &SyncOperation, error: &RemoteError) -> bool {
		error.is_transient() && operation.retry_count <= 1 && operation.can_retry()
	}

	fn get_delay(&self, _operation: &SyncOperation) -> Duration {
		Duration::from_millis(250)
	}
}

/// Analytics events: large chunks, never retried
pub struct AnalyticsStrategy;

#[async_trait::async_trait]
impl BatchStrategy for AnalyticsStrategy {
	fn name(&self) -> &'static str {
		"analytics"
	}

	fn priority(&self) -> u32 {
		40
	}

	fn batch_size(&self) -> usize {
		50
	}

	fn can_process(&self, operations: &[SyncOperation]) -> bool {
		all_resources(operations, &["analytics"])
	}

	fn should_retry(&self, _operation: &SyncOperation, _error: &RemoteError) -> bool {
		false
	}

	fn get_delay(&self, _operation: &SyncOperation) -> Duration {
		Duration::ZERO
	}
}

/// Catch-all for every other resource
pub struct GeneralStrategy;

#[async_trait::async_trait]
impl BatchStrategy for GeneralStrategy {
	fn name(&self) -> &'static str {
		"general"
	}

	fn priority(&self) -> u32 {
		0
	}

	fn batch_size(&self) -> usize {
		10
	}

	fn can_process(&self, _operations: &[SyncOperation]) -> bool {
		true
	}

	fn should_retry(&self, operation: &SyncOperation, error: &RemoteError) -> bool {
		error.is_transient() && operation.can_retry()
	}

	fn get_delay(&self, operation: &SyncOperation) -> Duration {
		exponential_delay(Duration::from_millis(1000), operation.retry_count, MAX_BACKOFF)
	}
}

/// The shipped strategies, most specific first
pub fn default_strategies() -> Vec<Box<dyn BatchStrategy>> {
	vec![
		Box::new(FinancialStrategy),
		Box::new(UserStrategy),
		Box::new(CacheStrategy),
		Box::new(AnalyticsStrategy),
		Box::new(GeneralStrategy),
	]
}
