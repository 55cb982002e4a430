use offline_sync::SyncEngineConfig;
use offline_sync::cache::MemoryCacheStore;
use offline_sync::queue::{FileQueueRepository, NewOperation, OperationType, Priority};
use offline_sync::remote::HttpReplayClient;
use offline_sync::sync::{LoggingEventHandler, SyncError, SyncOrchestrator, SyncService};

use serde_json::json;
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main(flavor = "current_thread")]
async fn main() {
	tracing_subscriber::fmt()
		.with_env_filter(
			tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()),
		)
		.with_target(false)
		.with_thread_ids(false)
		.with_thread_names(false)
		.with_file(false)
		.with_line_number(false)
		.with_timer(tracing_subscriber::fmt::time::time())
		.init();

	if let Err(e) = run().await {
		error!("Sync engine failed: {}", e);
		std::process::exit(1);
	}
}

async fn run() -> Result<(), SyncError> {
	let config = SyncEngineConfig::from_env();
	info!("Starting sync engine against {}", config.base_url);

	let repository = Arc::new(FileQueueRepository::new(config.data_dir.clone()));
	let client = Arc::new(HttpReplayClient::new(config.base_url.clone(), config.request_timeout)?);
	let cache = Arc::new(MemoryCacheStore::new());

	let mut orchestrator = SyncOrchestrator::new(config, repository, client, cache).await?;
	orchestrator.register_handler(Box::new(LoggingEventHandler));

	let (handle, task) = SyncService::spawn(orchestrator);

	let demo = [
		NewOperation::new(
			"financial",
			"tx-1001",
			OperationType::Create,
			json!({"amount": -42.5, "category": "groceries", "version": 1}),
			Priority::Critical,
		),
		NewOperation::new(
			"user",
			"me",
			OperationType::Update,
			json!({"displayName": "Demo", "currency": "EUR"}),
			Priority::High,
		),
		NewOperation::new(
			"analytics",
			"page-view",
			OperationType::Create,
			json!({"page": "/dashboard"}),
			Priority::Low,
		),
	];
	for operation in demo {
		let id = handle.enqueue(operation).await?;
		info!("Queued operation {}", id);
	}

	let report = handle.process_now().await?;
	info!(
		"Processed {} operations ({} succeeded, {} retrying, {} failed, {} conflicts)",
		report.processed, report.succeeded, report.retrying, report.failed, report.conflicts
	);

	let metrics = handle.metrics().await?;
	info!("Health: {:?}; {}", handle.health().await?, metrics.summary());

	handle.shutdown().await?;
	if let Err(e) = task.await {
		error!("Sync service task ended abnormally: {}", e);
	}
	Ok(())
}
