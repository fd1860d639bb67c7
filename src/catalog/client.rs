use crate::catalog::parser::parse_search_output;
use crate::error::{PackagerError, Result};
use crate::model::{CatalogEntry, ProcessResult};
use crate::traits::{CommandRunner, CommandSpec, LineSink};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

/// Extensions the catalog tool uses for installers. Anything else it drops
/// next to the installer (manifests, logs) is not a candidate.
const INSTALLER_EXTENSIONS: [&str; 7] = ["exe", "msi", "msix", "msixbundle", "appx", "appxbundle", "zip"];

/// The download sub-command sometimes nests the installer one level down.
const SCAN_DEPTH: usize = 2;

const STDERR_TAIL_LINES: usize = 20;

const NO_RESULTS_MESSAGE: &str = "No package found";

/// Client for the package catalog tool (`winget` by default).
#[derive(Clone)]
pub struct CatalogClient {
    runner: Arc<dyn CommandRunner>,
    tool: PathBuf,
    search_timeout: Duration,
    download_timeout: Duration,
}

impl CatalogClient {
    pub fn new(runner: Arc<dyn CommandRunner>, tool: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            tool: tool.into(),
            search_timeout: Duration::from_secs(120),
            download_timeout: Duration::from_secs(1800),
        }
    }

    pub fn with_timeouts(mut self, search: Duration, download: Duration) -> Self {
        self.search_timeout = search;
        self.download_timeout = download;
        self
    }

    /// Searches the catalog. Zero matches is an empty list, not an error.
    #[instrument(skip(self, cancel, on_line))]
    pub async fn search(
        &self,
        query: &str,
        cancel: CancellationToken,
        on_line: Option<LineSink>,
    ) -> Result<Vec<CatalogEntry>> {
        let spec = CommandSpec::new(&self.tool)
            .args(["search", query, "--accept-source-agreements"])
            .timeout(self.search_timeout);

        let result = self
            .runner
            .run(spec, cancel, on_line)
            .await
            .map_err(|e| PackagerError::CatalogUnavailable {
                reason: e.to_string(),
            })?;
        self.check_interrupted(&result, self.search_timeout)?;

        match parse_search_output(&result.stdout) {
            Ok(entries) if result.exit_code == 0 || (entries.is_empty() && no_results(&result)) => {
                info!(count = entries.len(), "Catalog search finished");
                Ok(entries)
            }
            Ok(_) => Err(self.search_failure(&result)),
            Err(_) if result.exit_code != 0 => Err(self.search_failure(&result)),
            Err(e) => {
                warn!(
                    error = %e,
                    stdout = %result.stdout,
                    stderr = %result.stderr,
                    "Unrecognised catalog search output"
                );
                Err(PackagerError::CatalogParse {
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Downloads `entry`'s installer into `destination` and returns its path.
    #[instrument(skip(self, entry, cancel, on_line), fields(id = %entry.id))]
    pub async fn download(
        &self,
        entry: &CatalogEntry,
        destination: &Path,
        cancel: CancellationToken,
        on_line: Option<LineSink>,
    ) -> Result<PathBuf> {
        let before = snapshot(destination);

        let mut spec = CommandSpec::new(&self.tool).args(["download", "--id", entry.id.as_str()]);
        if entry.pins_version() {
            spec = spec.args(["--version", entry.version.as_str()]);
        }
        let spec = spec
            .arg("--exact")
            .arg("--download-directory")
            .arg(destination.as_os_str())
            .args(["--accept-package-agreements", "--accept-source-agreements"])
            .timeout(self.download_timeout);

        let result = self.runner.run(spec, cancel, on_line).await?;
        self.check_interrupted(&result, self.download_timeout)?;

        if result.exit_code != 0 {
            return Err(PackagerError::DownloadFailed {
                exit_code: result.exit_code,
                stderr: failure_detail(&result),
            });
        }

        let installer = resolve_installer(&before, &snapshot(destination))?;
        info!(installer = %installer.display(), "Installer downloaded");
        Ok(installer)
    }

    fn check_interrupted(&self, result: &ProcessResult, limit: Duration) -> Result<()> {
        if result.cancelled {
            return Err(PackagerError::Cancelled);
        }
        if result.timed_out {
            return Err(PackagerError::TimedOut {
                program: self.tool.display().to_string(),
                timeout_secs: limit.as_secs(),
            });
        }
        Ok(())
    }

    fn search_failure(&self, result: &ProcessResult) -> PackagerError {
        PackagerError::CatalogUnavailable {
            reason: format!(
                "search exited with code {}: {}",
                result.exit_code,
                failure_detail(result)
            ),
        }
    }
}

/// The catalog tool exits non-zero when nothing matches; only its own
/// message tells that apart from a failed search.
fn no_results(result: &ProcessResult) -> bool {
    result.stdout.contains(NO_RESULTS_MESSAGE) || result.stderr.contains(NO_RESULTS_MESSAGE)
}

/// Stderr tail, falling back to stdout: the catalog tool reports most
/// failures on stdout.
fn failure_detail(result: &ProcessResult) -> String {
    let tail = result.stderr_tail(STDERR_TAIL_LINES);
    if !tail.is_empty() {
        return tail;
    }
    let mut lines: Vec<&str> = result
        .stdout
        .lines()
        .rev()
        .filter(|l| !l.trim().is_empty())
        .take(STDERR_TAIL_LINES)
        .collect();
    lines.reverse();
    lines.join("\n")
}

fn snapshot(dir: &Path) -> BTreeSet<PathBuf> {
    WalkDir::new(dir)
        .max_depth(SCAN_DEPTH)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                debug!(error = %e, "Skipping unreadable path");
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .collect()
}

/// Picks the installer among files that appeared during the download.
///
/// New files are narrowed to installer extensions and exactly one must
/// remain. A lone manifest or log is never taken for the installer.
fn resolve_installer(
    before: &BTreeSet<PathBuf>,
    after: &BTreeSet<PathBuf>,
) -> Result<PathBuf> {
    let added: Vec<&PathBuf> = after.difference(before).collect();
    let installers: Vec<&PathBuf> = added
        .iter()
        .copied()
        .filter(|path| is_installer(path))
        .collect();
    match installers.as_slice() {
        [only] => Ok((*only).clone()),
        _ => Err(PackagerError::AmbiguousInstaller {
            candidates: added.into_iter().cloned().collect(),
        }),
    }
}

fn is_installer(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            INSTALLER_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
        .unwrap_or(false)
}
