use crate::error::LaunchError;
use crate::model::ProcessResult;
use async_trait::async_trait;
use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ParseError {
    #[error("no result table found in catalog output")]
    MissingHeader,
    #[error("result table header is not followed by a separator line")]
    MissingSeparator,
    #[error("{rows} data rows found but none could be parsed")]
    NoParsableRows { rows: usize },
}

/// Which stream a captured line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Callback receiving each output line as the external process produces it.
pub type LineSink = Arc<dyn Fn(OutputStream, &str) + Send + Sync>;

/// Everything needed to start one external process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub working_dir: Option<PathBuf>,
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            timeout: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Program plus arguments, for logs.
    pub fn display(&self) -> String {
        let mut rendered = self.program.display().to_string();
        for arg in &self.args {
            rendered.push(' ');
            rendered.push_str(&arg.to_string_lossy());
        }
        rendered
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs `spec` to completion, cancellation, or timeout.
    ///
    /// Fails only when the program cannot be spawned; every other outcome,
    /// including a non-zero exit, is reported through [`ProcessResult`].
    async fn run(
        &self,
        spec: CommandSpec,
        cancel: CancellationToken,
        on_line: Option<LineSink>,
    ) -> Result<ProcessResult, LaunchError>;
}
