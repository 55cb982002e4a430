//!
//! Utility module for the sync engine.
//!
//! Re-exports id generation and JSON inspection helpers used throughout the codebase.
/// Identifier generation
pub mod ids;
/// Helpers for reading version, timestamp and shape information out of JSON snapshots
pub mod json;

pub use ids::generate_id;
pub use json::{JsonShape, extract_timestamp, extract_version, version_field};
