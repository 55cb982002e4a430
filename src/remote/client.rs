//!
//! HTTP client for replaying queued operations against the host application.
//!
//! The engine does not define a wire format of its own. Each queued operation is replayed as a
//! single request against the CRUD endpoints the host already exposes, and the response status is
//! classified into success, conflict signal, transient failure or permanent failure.

use super::types::*;
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

/// Header carrying the operation id so the server can drop duplicate deliveries
pub const OPERATION_ID_HEADER: &str = "X-Sync-Operation-Id";

/// Transport used by batch strategies to replay operations
#[async_trait::async_trait]
pub trait ReplayClient: Send + Sync {
	/// Send one replay request.
	///
	/// Conflict signals are returned as `Ok(ReplayOutcome::Conflict)`; only genuine failures are
	/// errors.
	async fn send(&self, request: &ReplayRequest) -> Result<ReplayOutcome, RemoteError>;

	/// Get the name of this client for logging and diagnostics.
	fn name(&self) -> &'static str;
}

/// reqwest-backed replay client
#[derive(Clone)]
pub struct HttpReplayClient {
	/// The underlying HTTP client.
	http_client: Client,
	/// Base URL that request paths are appended to.
	base_url: String,
}

impl HttpReplayClient {
	/// Create a new replay client.
	///
	/// # Arguments
	/// * `base_url` - Origin of the host application, e.g. `https://finance.example.com`.
	/// * `timeout` - Upper bound for a single request.
	pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, RemoteError> {
		let http_client = Client::builder().timeout(timeout).build()?;

		Ok(Self {
			http_client,
			base_url: base_url.into().trim_end_matches('/').to_string(),
		})
	}

	pub fn base_url(&self) -> &str {
		&self.base_url
	}

	fn method(method: HttpMethod) -> Method {
		match method {
			HttpMethod::Post => Method::POST,
			HttpMethod::Put => Method::PUT,
			HttpMethod::Delete => Method::DELETE,
		}
	}

	fn parse_body(text: &str) -> Option<Value> {
		if text.trim().is_empty() {
			return None;
		}
		serde_json::from_str(text).ok()
	}
}

#[async_trait::async_trait]
impl ReplayClient for HttpReplayClient {
	async fn send(&self, request: &ReplayRequest) -> Result<ReplayOutcome, RemoteError> {
		let url = format!("{}{}", self.base_url, request.path);
		debug!("Replaying {} {} ({})", request.method.as_str(), url, request.operation_id);

		let mut builder = self
			.http_client
			.request(Self::method(request.method), &url)
			.header(OPERATION_ID_HEADER, &request.operation_id);
		if let Some(body) = &request.body {
			builder = builder.json(body);
		}

		let response = builder.send().await.map_err(|e| {
			if e.is_connect() {
				RemoteError::Connection(e.to_string())
			} else {
				RemoteError::HttpError(e)
			}
		})?;

		let status = response.status();
		let text = response.text().await?;

		if status.is_success() {
			return Ok(ReplayOutcome::Applied {
				status: status.as_u16(),
				body: Self::parse_body(&text),
			});
		}

		if status == StatusCode::CONFLICT || status == StatusCode::PRECONDITION_FAILED {
			let remote = Self::parse_body(&text).unwrap_or(Value::Null);
			debug!(
				"Server reported a conflict for operation {}",
				request.operation_id
			);
			return Ok(ReplayOutcome::Conflict {
				status: status.as_u16(),
				remote,
			});
		}

		warn!(
			"Replay of operation {} failed with status {}",
			request.operation_id, status
		);
		Err(RemoteError::from_status(status.as_u16(), text))
	}

	fn name(&self) -> &'static str {
		"HttpReplayClient"
	}
}
