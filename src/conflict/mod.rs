//! Conflict handling
//!
//! Detects when a replayed operation collides with a remote change, picks an automatic outcome
//! where one is safe, and merges values when both sides should survive.
//!
//! - `detection`: independent detectors with a fixed severity and the engine that runs them.
//! - `resolution`: the confidence-ordered resolver pipeline and per-resource resolution history.
//! - `merge`: type-specific merge strategies.
//! - `types`: the conflict record and its enums.

/// Conflict detectors
pub mod detection;
/// Merge strategies
pub mod merge;
/// Resolver pipeline and resolution history
pub mod resolution;
/// Conflict record, severity, status and resolution types
pub mod types;

pub use detection::{ConflictDetectionEngine, ConflictDetector, SERVER_CONFLICT};
pub use merge::{MergeEngine, MergeStrategy};
pub use resolution::{ConflictResolutionEngine, ConflictResolver, ResolutionHistory, ResolutionOutcome};
pub use types::*;
