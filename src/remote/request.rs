use crate::queue::{OperationType, SyncOperation};
use crate::remote::types::{HttpMethod, ReplayRequest};
use tracing::debug;

/// Maps queued operations onto the host's existing CRUD endpoints.
///
/// create → `POST {prefix}/{resource}`, update → `PUT {prefix}/{resource}/{id}`,
/// delete → `DELETE {prefix}/{resource}/{id}`.
#[derive(Debug, Clone)]
pub struct RequestBuilder {
	api_prefix: String,
}

impl RequestBuilder {
	pub fn new(api_prefix: impl Into<String>) -> Self {
		let api_prefix = api_prefix.into().trim_end_matches('/').to_string();
		Self { api_prefix }
	}

	/// Build the replay request for a single operation
	pub fn build(&self, operation: &SyncOperation) -> ReplayRequest {
		let collection = format!("{}/{}", self.api_prefix, operation.resource);
		let (method, path, body) = match operation.operation_type {
			OperationType::Create => (HttpMethod::Post, collection, Some(operation.payload.clone())),
			OperationType::Update => (
				HttpMethod::Put,
				format!("{}/{}", collection, operation.resource_id),
				Some(operation.payload.clone()),
			),
			OperationType::Delete => (
				HttpMethod::Delete,
				format!("{}/{}", collection, operation.resource_id),
				None,
			),
		};

		debug!(
			"Built {} {} for operation {}",
			method.as_str(),
			path,
			operation.id
		);

		ReplayRequest {
			operation_id: operation.id.clone(),
			method,
			path,
			body,
		}
	}
}

impl Default for RequestBuilder {
	fn default() -> Self {
		Self::new("/api")
	}
}
