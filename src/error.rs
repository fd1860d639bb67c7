//! Error taxonomy for packaging jobs.
//!
//! Every variant renders to a message a user can act on without looking
//! anything else up: exit codes and the tail of stderr are carried inline.

use crate::job::JobState;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PackagerError>;

/// The external executable could not be started at all.
#[derive(Error, Debug)]
#[error("failed to launch '{program}': {source}")]
pub struct LaunchError {
    pub program: String,
    #[source]
    pub source: std::io::Error,
}

#[derive(Error, Debug)]
pub enum PackagerError {
    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error("catalog tool unavailable: {reason}")]
    CatalogUnavailable { reason: String },

    #[error("could not parse catalog output: {reason}")]
    CatalogParse { reason: String },

    #[error("download failed with exit code {exit_code}: {stderr}")]
    DownloadFailed { exit_code: i32, stderr: String },

    /// Zero or several candidate installer files appeared after a download.
    #[error("could not determine the installer file (candidates: {candidates:?})")]
    AmbiguousInstaller { candidates: Vec<PathBuf> },

    #[error("failed to create workspace: {0}")]
    WorkspaceCreate(#[source] std::io::Error),

    #[error("failed to write script '{}': {source}", path.display())]
    ScriptWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("output directory '{}' is unusable: {source}", path.display())]
    OutputDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("packaging tool failed with exit code {exit_code}: {stderr}")]
    PackagingFailed { exit_code: i32, stderr: String },

    #[error("packaging tool reported success but '{}' was not created", path.display())]
    ArtifactMissing { path: PathBuf },

    #[error("packaging tool is not configured: {reason}")]
    ToolNotConfigured { reason: String },

    #[error("'{program}' timed out after {timeout_secs}s")]
    TimedOut { program: String, timeout_secs: u64 },

    #[error("job was cancelled")]
    Cancelled,

    #[error("cannot {action} while job is {state:?}")]
    InvalidTransition {
        action: &'static str,
        state: JobState,
    },

    #[error("search query must not be empty")]
    EmptyQuery,

    #[error("'{id}' is not in the current search results")]
    UnknownEntry { id: String },

    #[error("another packaging job is already running")]
    Busy,
}

impl PackagerError {
    pub fn kind(&self) -> FailureKind {
        match self {
            PackagerError::Launch(_) => FailureKind::Launch,
            PackagerError::CatalogUnavailable { .. } => FailureKind::CatalogUnavailable,
            PackagerError::CatalogParse { .. } => FailureKind::CatalogParse,
            PackagerError::DownloadFailed { .. } => FailureKind::DownloadFailed,
            PackagerError::AmbiguousInstaller { .. } => FailureKind::AmbiguousInstaller,
            PackagerError::WorkspaceCreate(_) => FailureKind::WorkspaceCreate,
            PackagerError::ScriptWrite { .. } => FailureKind::ScriptWrite,
            PackagerError::OutputDirectory { .. } => FailureKind::OutputDirectory,
            PackagerError::PackagingFailed { .. } => FailureKind::PackagingFailed,
            PackagerError::ArtifactMissing { .. } => FailureKind::ArtifactMissing,
            PackagerError::ToolNotConfigured { .. } => FailureKind::ToolNotConfigured,
            PackagerError::TimedOut { .. } => FailureKind::TimedOut,
            PackagerError::Cancelled => FailureKind::Cancelled,
            PackagerError::InvalidTransition { .. }
            | PackagerError::EmptyQuery
            | PackagerError::UnknownEntry { .. }
            | PackagerError::Busy => FailureKind::Rejected,
        }
    }

    /// True when the caller should ask for the packaging tool path again
    /// rather than point the user at logs.
    pub fn needs_configuration(&self) -> bool {
        matches!(self, PackagerError::ToolNotConfigured { .. })
    }
}

/// Copyable classification of a [`PackagerError`], kept on failed jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    Launch,
    CatalogUnavailable,
    CatalogParse,
    DownloadFailed,
    AmbiguousInstaller,
    WorkspaceCreate,
    ScriptWrite,
    OutputDirectory,
    PackagingFailed,
    ArtifactMissing,
    ToolNotConfigured,
    TimedOut,
    Cancelled,
    /// The request itself was refused (wrong state, bad selection).
    Rejected,
}
