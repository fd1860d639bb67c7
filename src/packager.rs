use crate::error::{PackagerError, Result};
use crate::traits::{CommandRunner, CommandSpec, LineSink};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

pub const ARTIFACT_EXTENSION: &str = "intunewin";

const STDERR_TAIL_LINES: usize = 20;

/// Wrapper around the packaging executable (`IntuneWinAppUtil.exe`).
///
/// Construct it with a path already validated by
/// [`Settings::packaging_tool`](crate::config::Settings::packaging_tool).
pub struct PackagingTool {
    runner: Arc<dyn CommandRunner>,
    executable: PathBuf,
    timeout: Duration,
}

impl PackagingTool {
    pub fn new(runner: Arc<dyn CommandRunner>, executable: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            executable: executable.into(),
            timeout: Duration::from_secs(1800),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Path the tool writes for `setup_file_name` into `output_dir`.
    pub fn artifact_path(setup_file_name: &str, output_dir: &Path) -> PathBuf {
        let stem = Path::new(setup_file_name)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| setup_file_name.to_string());
        output_dir.join(format!("{stem}.{ARTIFACT_EXTENSION}"))
    }

    /// Bundles `source_dir` with `setup_file_name` as the entry point.
    ///
    /// A clean exit only counts once the artifact exists in `output_dir`.
    #[instrument(skip(self, cancel, on_line), fields(tool = %self.executable.display()))]
    pub async fn package(
        &self,
        source_dir: &Path,
        setup_file_name: &str,
        output_dir: &Path,
        cancel: CancellationToken,
        on_line: Option<LineSink>,
    ) -> Result<PathBuf> {
        let spec = CommandSpec::new(&self.executable)
            .arg("-c")
            .arg(source_dir.as_os_str())
            .arg("-s")
            .arg(setup_file_name)
            .arg("-o")
            .arg(output_dir.as_os_str())
            .arg("-q")
            .working_dir(source_dir)
            .timeout(self.timeout);

        let result = self.runner.run(spec, cancel, on_line).await?;
        if result.cancelled {
            return Err(PackagerError::Cancelled);
        }
        if result.timed_out {
            return Err(PackagerError::TimedOut {
                program: self.executable.display().to_string(),
                timeout_secs: self.timeout.as_secs(),
            });
        }
        if result.exit_code != 0 {
            let mut stderr = result.stderr_tail(STDERR_TAIL_LINES);
            if stderr.is_empty() {
                // The tool writes its diagnostics to stdout more often than not.
                stderr = result.stdout.trim().to_string();
            }
            return Err(PackagerError::PackagingFailed {
                exit_code: result.exit_code,
                stderr,
            });
        }

        let artifact = Self::artifact_path(setup_file_name, output_dir);
        if !tokio::fs::try_exists(&artifact).await.unwrap_or(false) {
            warn!(artifact = %artifact.display(), "Packaging tool exited cleanly but the artifact is missing");
            return Err(PackagerError::ArtifactMissing { path: artifact });
        }
        info!(artifact = %artifact.display(), "Package created");
        Ok(artifact)
    }
}
