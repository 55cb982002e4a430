use super::client::ReplayClient;
use super::types::{RemoteError, ReplayOutcome, ReplayRequest};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

/// Canned response for the scripted client
#[derive(Debug, Clone)]
pub enum Scripted {
	Applied,
	Conflict(Value),
	Timeout,
	ServerError(u16),
	Rejected(u16),
	/// Wait before answering, used to exercise request timeouts
	Stall(Duration),
}

/// Replay client answering from per-path scripts; unscripted paths get the default answer.
pub struct ScriptedReplayClient {
	scripts: Mutex<HashMap<String, VecDeque<Scripted>>>,
	default: Scripted,
	calls: Mutex<Vec<ReplayRequest>>,
}

impl ScriptedReplayClient {
	pub fn new(default: Scripted) -> Self {
		Self {
			scripts: Mutex::new(HashMap::new()),
			default,
			calls: Mutex::new(Vec::new()),
		}
	}

	pub fn succeeding() -> Self {
		Self::new(Scripted::Applied)
	}

	pub fn script(self, path: &str, answers: Vec<Scripted>) -> Self {
		self.scripts
			.lock()
			.unwrap()
			.insert(path.to_string(), answers.into());
		self
	}

	pub fn calls(&self) -> Vec<ReplayRequest> {
		self.calls.lock().unwrap().clone()
	}

	pub fn call_count(&self) -> usize {
		self.calls.lock().unwrap().len()
	}
}

#[async_trait::async_trait]
impl ReplayClient for ScriptedReplayClient {
	async fn send(&self, request: &ReplayRequest) -> Result<ReplayOutcome, RemoteError> {
		self.calls.lock().unwrap().push(request.clone());
		let answer = self
			.scripts
			.lock()
			.unwrap()
			.get_mut(&request.path)
			.and_then(|answers| answers.pop_front())
			.unwrap_or_else(|| self.default.clone());

		match answer {
			Scripted::Applied => Ok(ReplayOutcome::Applied {
				status: 200,
				body: request.body.clone(),
			}),
			Scripted::Conflict(remote) => Ok(ReplayOutcome::Conflict {
				status: 409,
				remote,
			}),
			Scripted::Timeout => Err(RemoteError::Timeout(Duration::from_secs(10))),
			Scripted::ServerError(status) => Err(RemoteError::from_status(status, "boom".to_string())),
			Scripted::Rejected(status) => Err(RemoteError::from_status(status, "bad request".to_string())),
			Scripted::Stall(duration) => {
				tokio::time::sleep(duration).await;
				Ok(ReplayOutcome::Applied {
					status: 200,
					body: None,
				})
			}
		}
	}

	fn name(&self) -> &'static str {
		"ScriptedReplayClient"
	}
}
