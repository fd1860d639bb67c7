use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// One searchable record returned by the package catalog.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub name: String,
    pub id: String,      // stable catalog key, e.g. "7zip.7zip"
    pub version: String, // opaque, not necessarily numeric
    pub source: String,  // empty for rows matched against installed software
}

impl CatalogEntry {
    pub fn new(
        name: impl Into<String>,
        id: impl Into<String>,
        version: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            id: id.into(),
            version: version.into(),
            source: source.into(),
        }
    }

    /// Whether the version can be passed to `--version`. The catalog reports
    /// `Unknown` for packages it cannot install by number.
    pub fn pins_version(&self) -> bool {
        !self.version.is_empty() && !self.version.eq_ignore_ascii_case("unknown")
    }
}

impl fmt::Display for CatalogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} {})", self.name, self.id, self.version)
    }
}

/// Outcome of one external process invocation.
///
/// A non-zero `exit_code` is data, not an error: each caller decides what
/// the code means for its tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessResult {
    /// `-1` when the process ended without an exit code (killed by signal).
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    pub timed_out: bool,
    pub cancelled: bool,
}

impl ProcessResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out && !self.cancelled
    }

    /// Last `lines` non-empty lines of stderr, for error messages.
    pub fn stderr_tail(&self, lines: usize) -> String {
        let mut tail: Vec<&str> = self
            .stderr
            .lines()
            .rev()
            .filter(|l| !l.trim().is_empty())
            .take(lines)
            .collect();
        tail.reverse();
        tail.join("\n")
    }
}

/// Pipeline phase a progress event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    Searching,
    Preparing,
    Downloading,
    GeneratingScripts,
    Packaging,
    CleaningUp,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Phase::Searching => "searching",
            Phase::Preparing => "preparing",
            Phase::Downloading => "downloading",
            Phase::GeneratingScripts => "generating-scripts",
            Phase::Packaging => "packaging",
            Phase::CleaningUp => "cleaning-up",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Level {
    Info,
    Warning,
    Error,
}

/// Where a progress event's message came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventOrigin {
    /// Status emitted by the orchestrator itself.
    Orchestrator,
    /// A line of stdout from the external tool currently running.
    ToolStdout,
    /// A line of stderr from the external tool currently running.
    ToolStderr,
}

/// Ephemeral status record streamed to the front-end while a job runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub job_id: Uuid,
    pub phase: Phase,
    pub level: Level,
    pub origin: EventOrigin,
    pub message: String,
}

impl ProgressEvent {
    pub fn new(
        job_id: Uuid,
        phase: Phase,
        level: Level,
        origin: EventOrigin,
        message: impl Into<String>,
    ) -> Self {
        Self {
            job_id,
            phase,
            level,
            origin,
            message: message.into(),
        }
    }

    pub fn from_tool(&self) -> bool {
        self.origin != EventOrigin::Orchestrator
    }
}
