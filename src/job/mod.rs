//! Packaging job lifecycle: state, outcome and the orchestrator that drives it.

pub mod orchestrator;
pub mod state;

pub use orchestrator::JobOrchestrator;
pub use state::{CancelHandle, FailureReason, JobOutcome, JobState, PackagingJob};
