use crate::error::FailureKind;
use crate::model::{CatalogEntry, Phase};
use crate::workspace::Workspace;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

// ============================================================================
// Job State
// ============================================================================

/// Lifecycle of a packaging job.
///
/// The happy path visits every state in declaration order; `Failed` can be
/// entered from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    Idle,
    Searching,
    ResultsReady,
    EntrySelected,
    WorkspaceReady,
    Downloading,
    Downloaded,
    ScriptsWritten,
    Packaging,
    Succeeded,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed)
    }

    /// Phase that progress events raised in this state belong to.
    pub fn phase(self) -> Phase {
        match self {
            JobState::Idle | JobState::Searching | JobState::ResultsReady => Phase::Searching,
            JobState::EntrySelected | JobState::WorkspaceReady => Phase::Preparing,
            JobState::Downloading | JobState::Downloaded => Phase::Downloading,
            JobState::ScriptsWritten => Phase::GeneratingScripts,
            JobState::Packaging => Phase::Packaging,
            JobState::Succeeded | JobState::Failed => Phase::CleaningUp,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// ============================================================================
// Job Record
// ============================================================================

/// Why a job ended in [`JobState::Failed`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReason {
    /// State the job was in when the failure happened.
    pub step: JobState,
    pub kind: FailureKind,
    pub message: String,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (while {})", self.message, self.step)
    }
}

/// One attempt to turn a catalog entry into a packaged artifact.
#[derive(Debug, Clone)]
pub struct PackagingJob {
    pub id: Uuid,
    pub state: JobState,
    /// Results of the most recent search.
    pub results: Vec<CatalogEntry>,
    pub selected: Option<CatalogEntry>,
    pub workspace: Option<Workspace>,
    pub installer: Option<PathBuf>,
    pub setup_file: Option<String>,
    pub output_dir: Option<PathBuf>,
    pub artifact: Option<PathBuf>,
    pub preserved_workspace: Option<PathBuf>,
    pub failure: Option<FailureReason>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl PackagingJob {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            state: JobState::Idle,
            results: Vec::new(),
            selected: None,
            workspace: None,
            installer: None,
            setup_file: None,
            output_dir: None,
            artifact: None,
            preserved_workspace: None,
            failure: None,
            started_at: None,
            ended_at: None,
        }
    }

    pub fn outcome(&self) -> JobOutcome {
        JobOutcome {
            job_id: self.id,
            state: self.state,
            entry: self.selected.clone(),
            artifact: self.artifact.clone(),
            preserved_workspace: self.preserved_workspace.clone(),
            failure: self.failure.clone(),
            started_at: self.started_at,
            ended_at: self.ended_at,
        }
    }
}

impl Default for PackagingJob {
    fn default() -> Self {
        Self::new()
    }
}

/// Final snapshot of a job, handed to the caller once it is terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOutcome {
    pub job_id: Uuid,
    pub state: JobState,
    pub entry: Option<CatalogEntry>,
    /// Set when the job succeeded.
    pub artifact: Option<PathBuf>,
    /// Set when the job failed after a workspace was created.
    pub preserved_workspace: Option<PathBuf>,
    pub failure: Option<FailureReason>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl JobOutcome {
    pub fn succeeded(&self) -> bool {
        self.state == JobState::Succeeded
    }
}

// ============================================================================
// Cancellation
// ============================================================================

/// Cloneable handle that interrupts a job from another task.
///
/// Cancelling kills whichever external process the job is running and fails
/// the job at its next step boundary.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    token: CancellationToken,
}

impl CancelHandle {
    pub(crate) fn new(token: CancellationToken) -> Self {
        Self { token }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_succeeded_and_failed_are_terminal() {
        let terminal: Vec<JobState> = [
            JobState::Idle,
            JobState::Searching,
            JobState::ResultsReady,
            JobState::EntrySelected,
            JobState::WorkspaceReady,
            JobState::Downloading,
            JobState::Downloaded,
            JobState::ScriptsWritten,
            JobState::Packaging,
            JobState::Succeeded,
            JobState::Failed,
        ]
        .into_iter()
        .filter(|s| s.is_terminal())
        .collect();
        assert_eq!(terminal, vec![JobState::Succeeded, JobState::Failed]);
    }

    #[test]
    fn test_new_job_is_idle_and_empty() {
        let job = PackagingJob::new();
        let outcome = job.outcome();

        assert_eq!(job.state, JobState::Idle);
        assert_eq!(outcome.job_id, job.id);
        assert!(outcome.failure.is_none());
        assert!(!outcome.succeeded());
        assert_ne!(PackagingJob::new().id, job.id);
    }

    #[test]
    fn test_cancel_handle_shares_the_token() {
        let token = CancellationToken::new();
        let handle = CancelHandle::new(token.clone());
        handle.clone().cancel();
        assert!(token.is_cancelled());
        assert!(handle.is_cancelled());
    }
}
