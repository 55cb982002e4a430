//! Configuration for the sync engine

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct SyncEngineConfig {
    /// Directory holding the persisted queue
    pub data_dir: PathBuf,
    /// Base URL of the host's REST surface
    pub base_url: String,
    /// Path prefix in front of every resource route
    pub api_prefix: String,
    /// Maximum number of active (non-terminal) operations
    pub max_queue_size: usize,
    /// Operations drawn from the queue per cycle
    pub batch_size: usize,
    /// Default retry budget for new operations
    pub max_retries: u32,
    /// In-flight replays per strategy partition
    pub max_concurrent_batches: usize,
    pub request_timeout: Duration,
    pub flush_interval: Duration,
    pub cache_poll_interval: Duration,
    /// How often completed and cancelled operations are pruned from the queue
    pub cleanup_interval: Duration,
    /// Modification times further apart than this are reported as skew
    pub skew_threshold: Duration,
    pub resolution_history_limit: usize,
    /// Sum the `amount` of conflicting money movements instead of letting remote win
    pub financial_merge_enabled: bool,
    /// Capacity of the event broadcast channel
    pub event_buffer: usize,
}

impl Default for SyncEngineConfig {
    fn default() -> Self {
        SyncEngineConfig {
            data_dir: PathBuf::from("./data"),
            base_url: "http://localhost:3000".to_string(),
            api_prefix: "/api".to_string(),
            max_queue_size: 1000,
            batch_size: 50,
            max_retries: 3,
            max_concurrent_batches: 3,
            request_timeout: Duration::from_secs(10),
            flush_interval: Duration::from_secs(5),
            cache_poll_interval: Duration::from_secs(30),
            cleanup_interval: Duration::from_secs(300),
            skew_threshold: Duration::from_secs(60),
            resolution_history_limit: 10,
            financial_merge_enabled: true,
            event_buffer: 256,
        }
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

fn env_millis(name: &str, default: Duration) -> Duration {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

impl SyncEngineConfig {
    /// Read `SYNC_*` environment variables, keeping defaults for unset or unparsable values.
    pub fn from_env() -> Self {
        let defaults = SyncEngineConfig::default();
        SyncEngineConfig {
            data_dir: env::var("SYNC_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            base_url: env::var("SYNC_BASE_URL").unwrap_or(defaults.base_url),
            api_prefix: env::var("SYNC_API_PREFIX").unwrap_or(defaults.api_prefix),
            max_queue_size: env_or("SYNC_MAX_QUEUE_SIZE", defaults.max_queue_size),
            batch_size: env_or("SYNC_BATCH_SIZE", defaults.batch_size),
            max_retries: env_or("SYNC_MAX_RETRIES", defaults.max_retries),
            max_concurrent_batches: env_or(
                "SYNC_MAX_CONCURRENT_BATCHES",
                defaults.max_concurrent_batches,
            ),
            request_timeout: env_millis("SYNC_REQUEST_TIMEOUT_MS", defaults.request_timeout),
            flush_interval: env_millis("SYNC_FLUSH_INTERVAL_MS", defaults.flush_interval),
            cache_poll_interval: env_millis(
                "SYNC_CACHE_POLL_INTERVAL_MS",
                defaults.cache_poll_interval,
            ),
            cleanup_interval: env_millis("SYNC_CLEANUP_INTERVAL_MS", defaults.cleanup_interval),
            skew_threshold: env_millis("SYNC_SKEW_THRESHOLD_MS", defaults.skew_threshold),
            resolution_history_limit: env_or(
                "SYNC_RESOLUTION_HISTORY_LIMIT",
                defaults.resolution_history_limit,
            ),
            financial_merge_enabled: env_or(
                "SYNC_FINANCIAL_MERGE",
                defaults.financial_merge_enabled,
            ),
            event_buffer: env_or("SYNC_EVENT_BUFFER", defaults.event_buffer),
        }
    }
}
