//! Remote replay integration
//!
//! This module provides the client and types used to replay queued operations as HTTP requests
//! against the host application's existing REST surface.

/// HTTP client and the replay transport trait
mod client;
/// Mapping from queued operations to REST calls
mod request;
/// Scripted transport for tests
#[cfg(test)]
pub mod testing;
/// Request, outcome and error types
mod types;

pub use client::{HttpReplayClient, OPERATION_ID_HEADER, ReplayClient};
pub use request::RequestBuilder;
pub use types::*;
