//! Batch dispatch
//!
//! The dispatcher splits a batch drawn from the queue into partitions by the first strategy (in
//! descending specificity) able to process each operation, then replays partitions in that
//! order. Inside a partition, operations run concurrently up to `max_concurrent`, one
//! strategy-sized chunk at a time, and each call is bounded by the request timeout. Failures are
//! collected per operation; when a partition fails more than twice as often as it succeeds, the
//! remaining partitions are handed back untouched for the next cycle.
//!
//! The dispatcher never touches the queue. It reports what happened and the orchestrator applies
//! the results.

use crate::queue::SyncOperation;
use crate::remote::{RemoteError, ReplayClient, ReplayOutcome, RequestBuilder};
use crate::sync::strategies::{BatchStrategy, default_strategies};

use futures::stream::{self, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum OperationOutcome {
    Applied { body: Option<Value> },
    /// The server holds a different copy of the record
    Conflict { remote: Value },
    Failed {
        error: String,
        /// Whether the strategy grants another attempt
        retry: bool,
        delay: Duration,
    },
}

#[derive(Debug, Clone)]
pub struct OperationResult {
    /// The operation as it was dispatched
    pub operation: SyncOperation,
    pub strategy: &'static str,
    pub elapsed: Duration,
    pub outcome: OperationOutcome,
}

#[derive(Debug, Clone, Default)]
pub struct DispatchReport {
    pub results: Vec<OperationResult>,
    /// Operations skipped by the circuit breaker
    pub deferred: Vec<String>,
    /// Strategy whose partition tripped the breaker
    pub tripped: Option<&'static str>,
}

impl DispatchReport {
    pub fn count(&self, predicate: impl Fn(&OperationOutcome) -> bool) -> usize {
        self.results.iter().filter(|r| predicate(&r.outcome)).count()
    }
}

pub struct BatchDispatcher {
    strategies: Vec<Box<dyn BatchStrategy>>,
    client: Arc<dyn ReplayClient>,
    requests: RequestBuilder,
    max_concurrent: usize,
    request_timeout: Duration,
}

impl BatchDispatcher {
    pub fn new(
        client: Arc<dyn ReplayClient>,
        requests: RequestBuilder,
        max_concurrent: usize,
        request_timeout: Duration,
    ) -> Self {
        let mut dispatcher = Self {
            strategies: Vec::new(),
            client,
            requests,
            max_concurrent: max_concurrent.max(1),
            request_timeout,
        };
        for strategy in default_strategies() {
            dispatcher.register(strategy);
        }
        dispatcher
    }

    /// Add a strategy, replacing any with the same name
    pub fn register(&mut self, strategy: Box<dyn BatchStrategy>) {
        self.strategies.retain(|s| s.name() != strategy.name());
        self.strategies.push(strategy);
        self.strategies
            .sort_by_key(|s| std::cmp::Reverse(s.priority()));
    }

    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    /// Group operations under the first strategy that accepts them, in strategy order.
    ///
    /// Operations no strategy accepts are returned separately.
    fn partition(
        &self,
        batch: Vec<SyncOperation>,
    ) -> (Vec<(usize, Vec<SyncOperation>)>, Vec<SyncOperation>) {
        let mut groups: Vec<Vec<SyncOperation>> = vec![Vec::new(); self.strategies.len()];
        let mut unmatched = Vec::new();

        for operation in batch {
            match self
                .strategies
                .iter()
                .position(|s| s.can_process(std::slice::from_ref(&operation)))
            {
                Some(index) => groups[index].push(operation),
                None => unmatched.push(operation),
            }
        }

        let partitions = groups
            .into_iter()
            .enumerate()
            .filter(|(_, operations)| !operations.is_empty())
            .collect();
        (partitions, unmatched)
    }

    /// Replay a batch and report the outcome of every operation.
    pub async fn dispatch(&self, batch: Vec<SyncOperation>) -> DispatchReport {
        let (partitions, unmatched) = self.partition(batch);
        let mut report = DispatchReport::default();

        for operation in unmatched {
            warn!(
                "No strategy accepts operation {} on {}",
                operation.id, operation.resource
            );
            report.results.push(OperationResult {
                operation,
                strategy: "none",
                elapsed: Duration::ZERO,
                outcome: OperationOutcome::Failed {
                    error: "No strategy accepts this resource".to_string(),
                    retry: false,
                    delay: Duration::ZERO,
                },
            });
        }

        let mut partitions = partitions.into_iter();
        while let Some((index, operations)) = partitions.next() {
            let strategy = self.strategies[index].as_ref();
            let (mut successes, mut failures) = (0usize, 0usize);

            debug!(
                "Dispatching {} operations with strategy {}",
                operations.len(),
                strategy.name()
            );

            for chunk in operations.chunks(strategy.batch_size().max(1)) {
                let results: Vec<OperationResult> = stream::iter(chunk.iter().cloned())
                    .map(|operation| self.execute(strategy, operation))
                    .buffer_unordered(self.max_concurrent)
                    .collect()
                    .await;

                for result in results {
                    match result.outcome {
                        OperationOutcome::Applied { .. } => successes += 1,
                        OperationOutcome::Failed { .. } => failures += 1,
                        OperationOutcome::Conflict { .. } => {}
                    }
                    report.results.push(result);
                }
            }

            if failures > successes * 2 {
                report.deferred.extend(
                    partitions
                        .by_ref()
                        .flat_map(|(_, operations)| operations.into_iter().map(|op| op.id)),
                );
                warn!(
                    "Strategy {} failed {} of {} operations; deferring {} operations to the next cycle",
                    strategy.name(),
                    failures,
                    successes + failures,
                    report.deferred.len()
                );
                report.tripped = Some(strategy.name());
                break;
            }
        }

        report
    }

    async fn execute(&self, strategy: &dyn BatchStrategy, operation: SyncOperation) -> OperationResult {
        let started = Instant::now();
        let attempt = tokio::time::timeout(
            self.request_timeout,
            strategy.process(&operation, self.client.as_ref(), &self.requests),
        )
        .await;
        let result = attempt.unwrap_or(Err(RemoteError::Timeout(self.request_timeout)));
        let elapsed = started.elapsed();

        let outcome = match result {
            Ok(ReplayOutcome::Applied { body, .. }) => OperationOutcome::Applied { body },
            Ok(ReplayOutcome::Conflict { remote, .. }) => OperationOutcome::Conflict { remote },
            Err(error) => {
                let mut attempted = operation.clone();
                attempted.retry_count = attempted.retry_count.saturating_add(1);
                let retry = strategy.should_retry(&attempted, &error);
                let delay = strategy.get_delay(&attempted);
                debug!(
                    "Operation {} failed (attempt {}, retry: {}): {}",
                    operation.id, attempted.retry_count, retry, error
                );
                OperationOutcome::Failed {
                    error: error.to_string(),
                    retry,
                    delay,
                }
            }
        };

        OperationResult {
            operation,
            strategy: strategy.name(),
            elapsed,
            outcome,
        }
    }
}
