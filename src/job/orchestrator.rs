//! Packaging job state machine.
//!
//! [`JobOrchestrator`] drives a single [`PackagingJob`] through
//! search → select → prepare → download → generate scripts → package, one
//! caller-invoked step at a time. Each step:
//! - checks the job is in the state the step starts from, rejecting the call
//!   without touching the job otherwise
//! - emits a [`ProgressEvent`] before and after its external call, and
//!   forwards the tool's output lines as events while it runs
//! - on error records a [`FailureReason`], moves the job to `Failed` and
//!   keeps the workspace on disk
//!
//! Reaching `Succeeded` removes the workspace.

use crate::catalog::CatalogClient;
use crate::config::Settings;
use crate::error::{PackagerError, Result};
use crate::job::state::{CancelHandle, FailureReason, JobOutcome, JobState, PackagingJob};
use crate::model::{CatalogEntry, EventOrigin, Level, Phase, ProgressEvent};
use crate::packager::PackagingTool;
use crate::scripts::{self, DETECTION_SCRIPT_NAME, UNINSTALL_SCRIPT_NAME};
use crate::traits::{CommandRunner, LineSink, OutputStream};
use crate::workspace::{Workspace, WorkspaceManager};
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

pub struct JobOrchestrator {
    settings: Settings,
    runner: Arc<dyn CommandRunner>,
    events: UnboundedSender<ProgressEvent>,
    job: PackagingJob,
    cancel: CancellationToken,
}

impl JobOrchestrator {
    pub fn new(
        settings: Settings,
        runner: Arc<dyn CommandRunner>,
        events: UnboundedSender<ProgressEvent>,
    ) -> Self {
        Self {
            settings,
            runner,
            events,
            job: PackagingJob::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> JobState {
        self.job.state
    }

    pub fn job(&self) -> &PackagingJob {
        &self.job
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Replaces the settings. Only allowed between jobs.
    pub fn set_settings(&mut self, settings: Settings) -> Result<()> {
        let state = self.job.state;
        if state != JobState::Idle && !state.is_terminal() {
            return Err(PackagerError::InvalidTransition {
                action: "change settings",
                state,
            });
        }
        self.settings = settings;
        Ok(())
    }

    /// Handle for cancelling the current job from another task.
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle::new(self.cancel.clone())
    }

    /// Snapshot of the current job, terminal or not.
    pub fn outcome(&self) -> JobOutcome {
        self.job.outcome()
    }

    /// Returns the outcome of a terminal job and starts a fresh `Idle` one.
    pub fn take_outcome(&mut self) -> Option<JobOutcome> {
        if !self.job.state.is_terminal() {
            return None;
        }
        let outcome = self.job.outcome();
        self.job = PackagingJob::new();
        self.cancel = CancellationToken::new();
        Some(outcome)
    }

    // ========================================================================
    // Steps
    // ========================================================================

    /// Searches the catalog and keeps the results for [`select`](Self::select).
    #[instrument(skip(self), fields(job_id = %self.job.id))]
    pub async fn search(&mut self, query: &str) -> Result<Vec<CatalogEntry>> {
        self.expect_state("search", JobState::Idle)?;
        let query = query.trim();
        if query.is_empty() {
            return Err(PackagerError::EmptyQuery);
        }
        self.check_cancelled(Phase::Searching).await?;

        self.job.started_at = Some(Utc::now());
        self.transition(JobState::Searching);
        self.emit(
            Phase::Searching,
            Level::Info,
            format!("Searching the catalog for '{query}'"),
        );

        let client = self.catalog();
        let sink = self.line_sink(Phase::Searching);
        match client.search(query, self.cancel.clone(), Some(sink)).await {
            Ok(entries) => {
                self.emit(
                    Phase::Searching,
                    Level::Info,
                    format!("Found {} package(s)", entries.len()),
                );
                self.job.results = entries.clone();
                self.transition(JobState::ResultsReady);
                Ok(entries)
            }
            Err(e) => Err(self.fail(Phase::Searching, e).await),
        }
    }

    /// Picks `entry` from the latest search results.
    pub fn select(&mut self, entry: &CatalogEntry) -> Result<()> {
        self.expect_state("select an entry", JobState::ResultsReady)?;
        if !self.job.results.contains(entry) {
            return Err(PackagerError::UnknownEntry {
                id: entry.id.clone(),
            });
        }

        self.job.selected = Some(entry.clone());
        self.transition(JobState::EntrySelected);
        self.emit(Phase::Preparing, Level::Info, format!("Selected {entry}"));
        Ok(())
    }

    /// Picks the search result with catalog id `id`. An exact match wins
    /// over a case-insensitive one.
    pub fn select_id(&mut self, id: &str) -> Result<()> {
        self.expect_state("select an entry", JobState::ResultsReady)?;
        let entry = self
            .job
            .results
            .iter()
            .find(|e| e.id == id)
            .or_else(|| self.job.results.iter().find(|e| e.id.eq_ignore_ascii_case(id)))
            .cloned()
            .ok_or_else(|| PackagerError::UnknownEntry { id: id.to_string() })?;
        self.select(&entry)
    }

    /// Creates the job's workspace.
    #[instrument(skip(self), fields(job_id = %self.job.id))]
    pub async fn prepare(&mut self) -> Result<()> {
        self.expect_state("prepare a workspace", JobState::EntrySelected)?;
        self.check_cancelled(Phase::Preparing).await?;

        self.emit(Phase::Preparing, Level::Info, "Creating workspace");
        let manager = self.workspaces();
        match manager.create().await {
            Ok(workspace) => {
                self.emit(
                    Phase::Preparing,
                    Level::Info,
                    format!("Workspace ready at {}", workspace.path.display()),
                );
                self.job.workspace = Some(workspace);
                self.transition(JobState::WorkspaceReady);
                Ok(())
            }
            Err(e) => Err(self.fail(Phase::Preparing, e).await),
        }
    }

    /// Downloads the selected entry's installer into the workspace.
    #[instrument(skip(self), fields(job_id = %self.job.id))]
    pub async fn download(&mut self) -> Result<PathBuf> {
        self.expect_state("download", JobState::WorkspaceReady)?;
        let (entry, workspace) = self.entry_and_workspace()?;
        self.check_cancelled(Phase::Downloading).await?;

        self.transition(JobState::Downloading);
        self.emit(
            Phase::Downloading,
            Level::Info,
            format!("Downloading installer for {entry}"),
        );

        let client = self.catalog();
        let sink = self.line_sink(Phase::Downloading);
        match client
            .download(&entry, &workspace.path, self.cancel.clone(), Some(sink))
            .await
        {
            Ok(installer) => {
                let name = installer
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| installer.display().to_string());
                self.emit(Phase::Downloading, Level::Info, format!("Downloaded {name}"));
                self.job.installer = Some(installer.clone());
                self.transition(JobState::Downloaded);
                Ok(installer)
            }
            Err(e) => Err(self.fail(Phase::Downloading, e).await),
        }
    }

    /// Writes the install, uninstall and detection scripts into the workspace.
    #[instrument(skip(self), fields(job_id = %self.job.id))]
    pub async fn generate_scripts(&mut self) -> Result<()> {
        self.expect_state("generate scripts", JobState::Downloaded)?;
        let (entry, workspace) = self.entry_and_workspace()?;
        self.check_cancelled(Phase::GeneratingScripts).await?;

        self.emit(
            Phase::GeneratingScripts,
            Level::Info,
            "Writing install, uninstall and detection scripts",
        );
        let setup_file = scripts::setup_file_name(&entry);
        let rendered = [
            (setup_file.clone(), scripts::install_script(&entry)),
            (
                UNINSTALL_SCRIPT_NAME.to_string(),
                scripts::uninstall_script(&entry),
            ),
            (
                DETECTION_SCRIPT_NAME.to_string(),
                scripts::detection_script(&entry),
            ),
        ];

        for (name, body) in rendered {
            if let Err(e) = write_script(&workspace, &name, &body).await {
                return Err(self.fail(Phase::GeneratingScripts, e).await);
            }
        }

        self.emit(
            Phase::GeneratingScripts,
            Level::Info,
            format!("Scripts written, setup file is {setup_file}"),
        );
        self.job.setup_file = Some(setup_file);
        self.transition(JobState::ScriptsWritten);
        Ok(())
    }

    /// Bundles the workspace into `<setup stem>.intunewin` in `output_dir`
    /// and removes the workspace.
    #[instrument(skip(self), fields(job_id = %self.job.id))]
    pub async fn package(&mut self, output_dir: &Path) -> Result<PathBuf> {
        self.expect_state("package", JobState::ScriptsWritten)?;
        let (_, workspace) = self.entry_and_workspace()?;
        let setup_file = self.job.setup_file.clone().ok_or(PackagerError::InvalidTransition {
            action: "package",
            state: self.job.state,
        })?;
        let output_dir = output_dir.to_path_buf();
        self.check_cancelled(Phase::Packaging).await?;

        let executable = match self.settings.packaging_tool() {
            Ok(path) => path,
            Err(e) => return Err(self.fail(Phase::Packaging, e).await),
        };
        if let Err(source) = tokio::fs::create_dir_all(&output_dir).await {
            let e = PackagerError::OutputDirectory {
                path: output_dir,
                source,
            };
            return Err(self.fail(Phase::Packaging, e).await);
        }
        self.job.output_dir = Some(output_dir.clone());

        self.transition(JobState::Packaging);
        self.emit(
            Phase::Packaging,
            Level::Info,
            format!("Packaging into {}", output_dir.display()),
        );

        let tool = PackagingTool::new(self.runner.clone(), executable)
            .with_timeout(self.settings.packaging_timeout());
        let sink = self.line_sink(Phase::Packaging);
        let artifact = match tool
            .package(
                &workspace.path,
                &setup_file,
                &output_dir,
                self.cancel.clone(),
                Some(sink),
            )
            .await
        {
            Ok(artifact) => artifact,
            Err(e) => return Err(self.fail(Phase::Packaging, e).await),
        };

        self.emit(
            Phase::Packaging,
            Level::Info,
            format!("Created {}", artifact.display()),
        );
        self.job.artifact = Some(artifact.clone());
        self.finish(JobState::Succeeded);
        self.emit(Phase::CleaningUp, Level::Info, "Removing workspace");
        self.workspaces().dispose(&workspace, false).await;
        info!(artifact = %artifact.display(), "Job succeeded");
        Ok(artifact)
    }

    // ========================================================================
    // Interruption
    // ========================================================================

    /// Cancels the job: any running process is killed and the job fails with
    /// `Cancelled`. Does nothing once the job is terminal.
    pub async fn cancel(&mut self) {
        if self.job.state.is_terminal() {
            debug!(job_id = %self.job.id, "Ignoring cancel of finished job");
            return;
        }
        self.cancel.cancel();
        let phase = self.job.state.phase();
        self.fail(phase, PackagerError::Cancelled).await;
    }

    /// Fails a non-terminal job with a caller-supplied error.
    pub async fn abort(&mut self, error: PackagerError) {
        if self.job.state.is_terminal() {
            return;
        }
        let phase = self.job.state.phase();
        self.fail(phase, error).await;
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn expect_state(&self, action: &'static str, expected: JobState) -> Result<()> {
        if self.job.state == expected {
            Ok(())
        } else {
            Err(PackagerError::InvalidTransition {
                action,
                state: self.job.state,
            })
        }
    }

    async fn check_cancelled(&mut self, phase: Phase) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(self.fail(phase, PackagerError::Cancelled).await);
        }
        Ok(())
    }

    fn entry_and_workspace(&self) -> Result<(CatalogEntry, Workspace)> {
        match (&self.job.selected, &self.job.workspace) {
            (Some(entry), Some(workspace)) => Ok((entry.clone(), workspace.clone())),
            _ => Err(PackagerError::InvalidTransition {
                action: "continue without a selection and workspace",
                state: self.job.state,
            }),
        }
    }

    fn transition(&mut self, next: JobState) {
        debug!(job_id = %self.job.id, from = %self.job.state, to = %next, "Job transition");
        self.job.state = next;
    }

    fn finish(&mut self, terminal: JobState) {
        self.transition(terminal);
        self.job.ended_at = Some(Utc::now());
    }

    /// Moves the job to `Failed`, keeps the workspace and hands the error
    /// back for the caller to return.
    async fn fail(&mut self, phase: Phase, err: PackagerError) -> PackagerError {
        let step = self.job.state;
        error!(job_id = %self.job.id, step = %step, error = %err, "Job failed");

        self.job.failure = Some(FailureReason {
            step,
            kind: err.kind(),
            message: err.to_string(),
        });
        self.finish(JobState::Failed);
        self.emit(phase, Level::Error, err.to_string());

        if let Some(workspace) = self.job.workspace.clone() {
            self.job.preserved_workspace = self.workspaces().dispose(&workspace, true).await;
            self.emit(
                Phase::CleaningUp,
                Level::Info,
                format!("Workspace kept at {}", workspace.path.display()),
            );
        }
        err
    }

    fn catalog(&self) -> CatalogClient {
        CatalogClient::new(self.runner.clone(), self.settings.catalog_tool.clone()).with_timeouts(
            self.settings.search_timeout(),
            self.settings.download_timeout(),
        )
    }

    fn workspaces(&self) -> WorkspaceManager {
        WorkspaceManager::new(self.settings.scratch_root())
    }

    fn emit(&self, phase: Phase, level: Level, message: impl Into<String>) {
        let event = ProgressEvent::new(
            self.job.id,
            phase,
            level,
            EventOrigin::Orchestrator,
            message,
        );
        if self.events.send(event).is_err() {
            debug!(job_id = %self.job.id, "Progress receiver dropped");
        }
    }

    /// Forwards each line the running tool prints as a progress event.
    fn line_sink(&self, phase: Phase) -> LineSink {
        let events = self.events.clone();
        let job_id = self.job.id;
        Arc::new(move |stream: OutputStream, line: &str| {
            let origin = match stream {
                OutputStream::Stdout => EventOrigin::ToolStdout,
                OutputStream::Stderr => EventOrigin::ToolStderr,
            };
            let _ = events.send(ProgressEvent::new(job_id, phase, Level::Info, origin, line));
        })
    }
}

async fn write_script(workspace: &Workspace, name: &str, body: &str) -> Result<()> {
    let path = workspace.child(name)?;
    tokio::fs::write(&path, body)
        .await
        .map_err(|source| PackagerError::ScriptWrite {
            path: path.clone(),
            source,
        })?;
    debug!(path = %path.display(), bytes = body.len(), "Wrote script");
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
