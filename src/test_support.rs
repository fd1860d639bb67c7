//! Scripted [`CommandRunner`] double shared by the unit tests.
//!
//! It answers the catalog tool's `search` and `download` sub-commands and the
//! packaging tool's `-c/-s/-o` invocation from canned replies, records every
//! spec it receives, and writes the files the real tools would write.

use crate::error::LaunchError;
use crate::model::ProcessResult;
use crate::traits::{CommandRunner, CommandSpec, LineSink, OutputStream};
use async_trait::async_trait;
use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const SEVEN_ZIP_SEARCH: &str = "\
Name                 Id                      Version   Match         Source
-----------------------------------------------------------------------------
7-Zip                7zip.7zip               24.08     Moniker: 7zip winget
7-Zip ZS             mcmilk.7zip-zstd        24.08 ZS  Tag: 7zip     winget
";

#[derive(Debug, Clone)]
pub enum Reply {
    Exit {
        code: i32,
        stdout: String,
        stderr: String,
    },
    LaunchFailure,
    /// Blocks until the cancellation token fires.
    Hang,
    /// Reports the process as killed after hitting its timeout.
    TimedOut,
}

impl Reply {
    pub fn ok(stdout: &str) -> Self {
        Reply::Exit {
            code: 0,
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }

    pub fn fail(code: i32, stderr: &str) -> Self {
        Reply::Exit {
            code,
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }
}

pub struct ScriptedRunner {
    pub search: Reply,
    pub download: Reply,
    /// Files the download writes into `--download-directory` on success.
    pub download_files: Vec<&'static str>,
    pub packaging: Reply,
    /// Whether the packaging reply writes `<setup stem>.intunewin`.
    pub writes_artifact: bool,
    pub(crate) calls: Mutex<Vec<CommandSpec>>,
}

impl Default for ScriptedRunner {
    fn default() -> Self {
        Self {
            search: Reply::ok(SEVEN_ZIP_SEARCH),
            download: Reply::ok("Installer downloaded"),
            download_files: vec!["7-Zip_24.08_Machine_X64_exe_en-US.exe", "7zip.7zip.yaml"],
            packaging: Reply::ok("Done!!!"),
            writes_artifact: true,
            calls: Mutex::new(Vec::new()),
        }
    }
}

impl ScriptedRunner {
    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn flag_value(spec: &CommandSpec, flag: &str) -> Option<PathBuf> {
        let position = spec.args.iter().position(|a| a == flag)?;
        spec.args.get(position + 1).map(PathBuf::from)
    }

    fn side_effects(&self, spec: &CommandSpec) {
        match spec.args.first().and_then(|a| a.to_str()) {
            Some("download") => {
                if let Some(dir) = Self::flag_value(spec, "--download-directory") {
                    for file in &self.download_files {
                        std::fs::write(dir.join(file), b"installer").unwrap();
                    }
                }
            }
            Some("-c") if self.writes_artifact => {
                let output = Self::flag_value(spec, "-o").unwrap();
                let setup = Self::flag_value(spec, "-s").unwrap();
                let stem = setup.file_stem().unwrap().to_string_lossy().to_string();
                std::fs::create_dir_all(&output).unwrap();
                std::fs::write(output.join(format!("{stem}.intunewin")), b"artifact").unwrap();
            }
            _ => {}
        }
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(
        &self,
        spec: CommandSpec,
        cancel: CancellationToken,
        on_line: Option<LineSink>,
    ) -> Result<ProcessResult, LaunchError> {
        self.calls.lock().unwrap().push(spec.clone());

        let sub_command: Option<OsString> = spec.args.first().cloned();
        let reply = match sub_command.as_ref().and_then(|a| a.to_str()) {
            Some("search") => self.search.clone(),
            Some("download") => self.download.clone(),
            _ => self.packaging.clone(),
        };

        match reply {
            Reply::LaunchFailure => Err(LaunchError {
                program: spec.program.display().to_string(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
            }),
            Reply::TimedOut => Ok(ProcessResult {
                exit_code: -1,
                stdout: String::new(),
                stderr: String::new(),
                duration: spec.timeout.unwrap_or_default(),
                timed_out: true,
                cancelled: false,
            }),
            Reply::Hang => {
                cancel.cancelled().await;
                Ok(ProcessResult {
                    exit_code: -1,
                    stdout: String::new(),
                    stderr: String::new(),
                    duration: Duration::from_millis(1),
                    timed_out: false,
                    cancelled: true,
                })
            }
            Reply::Exit {
                code,
                stdout,
                stderr,
            } => {
                if code == 0 {
                    self.side_effects(&spec);
                }
                if let Some(sink) = &on_line {
                    stdout.lines().for_each(|l| sink(OutputStream::Stdout, l));
                    stderr.lines().for_each(|l| sink(OutputStream::Stderr, l));
                }
                Ok(ProcessResult {
                    exit_code: code,
                    stdout,
                    stderr,
                    duration: Duration::from_millis(1),
                    timed_out: false,
                    cancelled: false,
                })
            }
        }
    }
}
