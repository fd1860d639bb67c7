//! Tokio-backed [`CommandRunner`] used against the real catalog and
//! packaging tools.

use crate::error::LaunchError;
use crate::model::ProcessResult;
use crate::traits::{CommandRunner, CommandSpec, LineSink, OutputStream};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

/// How long output readers may keep draining after the child was killed.
/// A grandchild holding the pipe open must not stall the job.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

enum Ending {
    Exited(std::io::Result<std::process::ExitStatus>),
    Cancelled,
    TimedOut,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRunner;

impl ProcessRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    #[instrument(skip_all, fields(program = %spec.program.display()))]
    async fn run(
        &self,
        spec: CommandSpec,
        cancel: CancellationToken,
        on_line: Option<LineSink>,
    ) -> Result<ProcessResult, LaunchError> {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.working_dir {
            command.current_dir(dir);
        }

        debug!(command = %spec.display(), "Spawning process");
        let started = Instant::now();
        let mut child = command.spawn().map_err(|source| LaunchError {
            program: spec.program.display().to_string(),
            source,
        })?;

        let mut stdout_task = tokio::spawn(collect_lines(
            child.stdout.take(),
            OutputStream::Stdout,
            on_line.clone(),
        ));
        let mut stderr_task = tokio::spawn(collect_lines(
            child.stderr.take(),
            OutputStream::Stderr,
            on_line,
        ));

        let ending = tokio::select! {
            status = child.wait() => Ending::Exited(status),
            _ = cancel.cancelled() => Ending::Cancelled,
            _ = deadline(spec.timeout) => Ending::TimedOut,
        };

        let (exit_code, timed_out, cancelled) = match ending {
            Ending::Exited(Ok(status)) => (status.code().unwrap_or(-1), false, false),
            Ending::Exited(Err(e)) => {
                warn!(error = %e, "Failed to wait for process");
                (-1, false, false)
            }
            Ending::Cancelled => {
                terminate(&mut child).await;
                (-1, false, true)
            }
            Ending::TimedOut => {
                warn!(timeout = ?spec.timeout, "Process timed out");
                terminate(&mut child).await;
                (-1, true, false)
            }
        };

        let stdout = drain(&mut stdout_task).await;
        let stderr = drain(&mut stderr_task).await;
        let duration = started.elapsed();

        debug!(
            exit_code,
            timed_out,
            cancelled,
            duration_ms = duration.as_millis() as u64,
            "Process finished"
        );

        Ok(ProcessResult {
            exit_code,
            stdout,
            stderr,
            duration,
            timed_out,
            cancelled,
        })
    }
}

async fn terminate(child: &mut tokio::process::Child) {
    if let Err(e) = child.kill().await {
        warn!(error = %e, "Failed to kill process");
    }
}

async fn deadline(timeout: Option<Duration>) {
    match timeout {
        Some(limit) => tokio::time::sleep(limit).await,
        None => std::future::pending::<()>().await,
    }
}

async fn drain(task: &mut JoinHandle<String>) -> String {
    match tokio::time::timeout(DRAIN_GRACE, &mut *task).await {
        Ok(Ok(collected)) => collected,
        Ok(Err(e)) => {
            warn!(error = %e, "Output reader task failed");
            String::new()
        }
        Err(_) => {
            warn!("Output pipe still open after process ended, abandoning reader");
            task.abort();
            let _ = task.await;
            String::new()
        }
    }
}

/// Reads `reader` line by line, forwarding each line to `sink` and
/// returning everything read. Invalid UTF-8 is replaced, not rejected.
async fn collect_lines<R>(reader: Option<R>, stream: OutputStream, sink: Option<LineSink>) -> String
where
    R: AsyncRead + Unpin,
{
    let Some(reader) = reader else {
        return String::new();
    };
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut collected = String::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let decoded = String::from_utf8_lossy(&buf);
                let line = decoded.trim_end_matches(['\r', '\n']);
                if let Some(sink) = &sink {
                    sink(stream, line);
                }
                collected.push_str(line);
                collected.push('\n');
            }
            Err(e) => {
                warn!(error = %e, ?stream, "Failed to read process output");
                break;
            }
        }
    }

    collected
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new("/bin/sh").arg("-c").arg(script)
    }

    #[tokio::test]
    async fn test_captures_stdout_and_stderr() {
        let result = ProcessRunner::new()
            .run(
                sh("echo hello; echo oops >&2"),
                CancellationToken::new(),
                None,
            )
            .await
            .unwrap();

        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout, "hello\n");
        assert_eq!(result.stderr, "oops\n");
        assert!(result.success());
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_not_an_error() {
        let result = ProcessRunner::new()
            .run(sh("echo broken >&2; exit 3"), CancellationToken::new(), None)
            .await
            .unwrap();

        assert_eq!(result.exit_code, 3);
        assert!(!result.success());
        assert!(!result.timed_out);
        assert!(!result.cancelled);
    }

    #[tokio::test]
    async fn test_missing_program_is_launch_error() {
        let err = ProcessRunner::new()
            .run(
                CommandSpec::new("/nonexistent/definitely-not-a-tool"),
                CancellationToken::new(),
                None,
            )
            .await
            .unwrap_err();

        assert!(err.program.contains("definitely-not-a-tool"));
    }

    #[tokio::test]
    async fn test_working_dir_is_applied() {
        let dir = tempfile::tempdir().unwrap();
        let result = ProcessRunner::new()
            .run(
                sh("pwd").working_dir(dir.path()),
                CancellationToken::new(),
                None,
            )
            .await
            .unwrap();

        let reported = std::fs::canonicalize(result.stdout.trim()).unwrap();
        assert_eq!(reported, std::fs::canonicalize(dir.path()).unwrap());
    }

    #[tokio::test]
    async fn test_timeout_kills_process() {
        let result = ProcessRunner::new()
            .run(
                sh("exec sleep 30").timeout(Duration::from_millis(200)),
                CancellationToken::new(),
                None,
            )
            .await
            .unwrap();

        assert!(result.timed_out);
        assert!(!result.cancelled);
        assert!(result.duration < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_cancellation_kills_process() {
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let result = ProcessRunner::new()
            .run(sh("exec sleep 30"), token, None)
            .await
            .unwrap();

        assert!(result.cancelled);
        assert!(!result.timed_out);
        assert!(!result.success());
    }

    #[tokio::test]
    async fn test_line_sink_sees_every_line() {
        let seen: Arc<Mutex<Vec<(OutputStream, String)>>> = Arc::default();
        let sink_seen = Arc::clone(&seen);
        let sink: LineSink = Arc::new(move |stream, line| {
            sink_seen.lock().unwrap().push((stream, line.to_string()));
        });

        ProcessRunner::new()
            .run(
                sh("echo a; echo b; echo c >&2"),
                CancellationToken::new(),
                Some(sink),
            )
            .await
            .unwrap();

        let seen = seen.lock().unwrap();
        let stdout: Vec<&str> = seen
            .iter()
            .filter(|(s, _)| *s == OutputStream::Stdout)
            .map(|(_, l)| l.as_str())
            .collect();
        assert_eq!(stdout, vec!["a", "b"]);
        assert!(seen
            .iter()
            .any(|(s, l)| *s == OutputStream::Stderr && l == "c"));
    }
}
