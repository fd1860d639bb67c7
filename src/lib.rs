pub mod catalog;
pub mod config;
pub mod error;
pub mod executor;
pub mod job;
pub mod model;
pub mod packager;
pub mod process;
pub mod scripts;
pub mod traits;
pub mod workspace;

#[cfg(test)]
mod test_support;

// Re-export common types for convenience
pub use catalog::CatalogClient;
pub use config::{ConfigError, Settings};
pub use error::{FailureKind, LaunchError, PackagerError, Result};
pub use executor::*;
pub use job::{CancelHandle, FailureReason, JobOrchestrator, JobOutcome, JobState, PackagingJob};
pub use model::*;
pub use packager::PackagingTool;
pub use process::ProcessRunner;
pub use traits::*;
pub use workspace::{Workspace, WorkspaceManager};
