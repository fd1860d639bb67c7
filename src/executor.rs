use crate::config::Settings;
use crate::error::{PackagerError, Result};
use crate::job::{CancelHandle, JobOrchestrator, JobOutcome};
use crate::model::ProgressEvent;
use crate::traits::CommandRunner;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{info, instrument, Instrument};
use uuid::Uuid;

/// What to package: the catalog id to select and where to put the artifact.
#[derive(Debug, Clone)]
pub struct JobRequest {
    /// Search terms. Defaults to `package_id` when `None`.
    pub query: Option<String>,
    pub package_id: String,
    pub output_dir: PathBuf,
}

/// Handles to a job running in the background.
pub struct JobTicket {
    pub job_id: Uuid,
    pub events: UnboundedReceiver<ProgressEvent>,
    pub cancel: CancelHandle,
    pub handle: JoinHandle<JobOutcome>,
}

/// Runs complete packaging jobs on a background task, one at a time.
pub struct JobExecutor {
    settings: Settings,
    runner: Arc<dyn CommandRunner>,
    semaphore: Arc<Semaphore>,
}

impl JobExecutor {
    pub fn new(settings: Settings, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            settings,
            runner,
            semaphore: Arc::new(Semaphore::new(1)),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn is_busy(&self) -> bool {
        self.semaphore.available_permits() == 0
    }

    /// Replaces the settings used by future jobs. Rejected while one runs.
    pub fn update_settings(&mut self, settings: Settings) -> Result<()> {
        if self.is_busy() {
            return Err(PackagerError::Busy);
        }
        self.settings = settings;
        Ok(())
    }

    /// Starts a job. Fails with [`PackagerError::Busy`] if one is already
    /// running; jobs are never queued.
    #[instrument(skip(self), fields(package_id = %request.package_id))]
    pub fn submit(&self, request: JobRequest) -> Result<JobTicket> {
        let permit = self
            .semaphore
            .clone()
            .try_acquire_owned()
            .map_err(|_| PackagerError::Busy)?;

        let (tx, rx) = unbounded_channel();
        let mut orchestrator =
            JobOrchestrator::new(self.settings.clone(), self.runner.clone(), tx);
        let job_id = orchestrator.job().id;
        let cancel = orchestrator.cancel_handle();
        info!(%job_id, "Submitted packaging job");

        let span = tracing::info_span!("job", %job_id);
        let handle = tokio::spawn(
            async move {
                let _permit = permit;
                if let Err(e) = run_pipeline(&mut orchestrator, &request).await {
                    // Rejections leave the job where it was; end it here.
                    orchestrator.abort(e).await;
                }
                orchestrator.outcome()
            }
            .instrument(span),
        );

        Ok(JobTicket {
            job_id,
            events: rx,
            cancel,
            handle,
        })
    }
}

async fn run_pipeline(
    orchestrator: &mut JobOrchestrator,
    request: &JobRequest,
) -> Result<PathBuf> {
    let query = request.query.as_deref().unwrap_or(&request.package_id);
    orchestrator.search(query).await?;
    orchestrator.select_id(&request.package_id)?;
    orchestrator.prepare().await?;
    orchestrator.download().await?;
    orchestrator.generate_scripts().await?;
    orchestrator.package(&request.output_dir).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;
    use crate::job::JobState;
    use crate::test_support::{Reply, ScriptedRunner};
    use std::path::Path;

    fn settings(dir: &Path) -> Settings {
        let tool = dir.join("IntuneWinAppUtil.exe");
        std::fs::write(&tool, b"stub").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        Settings {
            packaging_tool_path: Some(tool),
            scratch_root: Some(dir.join("scratch")),
            ..Settings::default()
        }
    }

    fn request(dir: &Path, package_id: &str) -> JobRequest {
        JobRequest {
            query: Some("7zip".to_string()),
            package_id: package_id.to_string(),
            output_dir: dir.join("out"),
        }
    }

    #[tokio::test]
    async fn test_submit_runs_whole_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::default());
        let executor = JobExecutor::new(settings(dir.path()), runner);

        let mut ticket = executor.submit(request(dir.path(), "7zip.7zip")).unwrap();
        let outcome = ticket.handle.await.unwrap();

        assert!(outcome.succeeded());
        assert_eq!(outcome.job_id, ticket.job_id);
        assert_eq!(
            outcome.artifact,
            Some(dir.path().join("out").join("7-Zip.intunewin"))
        );
        assert!(ticket.events.recv().await.is_some());
        assert!(!executor.is_busy());
    }

    #[tokio::test]
    async fn test_unknown_id_fails_job() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::default());
        let executor = JobExecutor::new(settings(dir.path()), runner);

        let ticket = executor.submit(request(dir.path(), "not.there")).unwrap();
        let outcome = ticket.handle.await.unwrap();

        assert_eq!(outcome.state, JobState::Failed);
        let failure = outcome.failure.unwrap();
        assert_eq!(failure.kind, FailureKind::Rejected);
        assert_eq!(failure.step, JobState::ResultsReady);
    }

    #[tokio::test]
    async fn test_second_job_is_rejected_until_first_ends() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ScriptedRunner {
            search: Reply::Hang,
            ..ScriptedRunner::default()
        };
        let mut executor = JobExecutor::new(settings(dir.path()), Arc::new(runner));

        let first = executor.submit(request(dir.path(), "7zip.7zip")).unwrap();
        assert!(matches!(
            executor.submit(request(dir.path(), "7zip.7zip")),
            Err(PackagerError::Busy)
        ));
        assert!(matches!(
            executor.update_settings(Settings::default()),
            Err(PackagerError::Busy)
        ));

        first.cancel.cancel();
        let outcome = first.handle.await.unwrap();
        assert_eq!(
            outcome.failure.map(|f| f.kind),
            Some(FailureKind::Cancelled)
        );

        assert!(executor.submit(request(dir.path(), "7zip.7zip")).is_ok());
    }
}
