//! Tokio-based subprocess runner.
//!
//! This module spawns the provisioning tool, streams its output line by line
//! and supervises cancellation: SIGTERM first, SIGKILL once the grace period
//! has elapsed.

use async_trait::async_trait;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ExecutionError, Result};

use super::{CancelReason, CommandSpec, ProcessOutcome, ProcessRunner};

/// Time allowed for output pipes to drain once a cancelled child has exited.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Which stream a line of output came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

/// A single line of subprocess output, forwarded for live progress.
#[derive(Debug, Clone)]
pub struct OutputLine {
    /// Originating stream.
    pub stream: OutputStream,
    /// Line content without the trailing newline.
    pub line: String,
}

/// Process runner backed by `tokio::process`.
#[derive(Debug, Clone, Default)]
pub struct TokioProcessRunner {
    /// Optional channel receiving every output line as it is read.
    progress: Option<mpsc::UnboundedSender<OutputLine>>,
}

/// What ended the wait on the child.
enum WaitEvent {
    Exited(std::io::Result<ExitStatus>),
    Cancelled(CancelReason),
}

impl TokioProcessRunner {
    /// Creates a runner without progress reporting.
    #[must_use]
    pub const fn new() -> Self {
        Self { progress: None }
    }

    /// Forwards every output line to `sender`.
    #[must_use]
    pub fn with_progress(mut self, sender: mpsc::UnboundedSender<OutputLine>) -> Self {
        self.progress = Some(sender);
        self
    }

    fn spawn_collector<R>(&self, reader: Option<R>, stream: OutputStream) -> Option<JoinHandle<String>>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let progress = self.progress.clone();
        reader.map(|r| tokio::spawn(collect_lines(r, stream, progress)))
    }
}

#[async_trait]
impl ProcessRunner for TokioProcessRunner {
    async fn run(&self, spec: &CommandSpec, cancel: &CancellationToken) -> Result<ProcessOutcome> {
        let started = Instant::now();

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .current_dir(&spec.workdir)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(workdir = %spec.workdir.display(), "Spawning: {}", spec.display());

        let mut child = command.spawn().map_err(|e| ExecutionError::SpawnFailed {
            program: spec.program.clone(),
            message: e.to_string(),
        })?;

        let stdout_task = self.spawn_collector(child.stdout.take(), OutputStream::Stdout);
        let stderr_task = self.spawn_collector(child.stderr.take(), OutputStream::Stderr);

        let deadline = async {
            match spec.timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending::<()>().await,
            }
        };

        let event = tokio::select! {
            status = child.wait() => WaitEvent::Exited(status),
            () = cancel.cancelled() => WaitEvent::Cancelled(CancelReason::Operator),
            () = deadline => WaitEvent::Cancelled(CancelReason::Timeout),
        };

        let (status, cancelled) = match event {
            WaitEvent::Exited(status) => {
                let status = status.map_err(|e| ExecutionError::Supervision {
                    program: spec.program.clone(),
                    message: e.to_string(),
                })?;
                (Some(status), None)
            }
            WaitEvent::Cancelled(reason) => {
                info!("Cancelling {} ({reason})", spec.program);
                let status = terminate(&mut child, spec).await?;
                (status, Some(reason))
            }
        };

        let drain = cancelled.map(|_| DRAIN_TIMEOUT);
        let stdout = join_collector(stdout_task, drain).await;
        let stderr = join_collector(stderr_task, drain).await;

        let outcome = ProcessOutcome {
            exit_code: status.and_then(|s| s.code()),
            cancelled,
            stdout,
            stderr,
            duration: started.elapsed(),
        };

        debug!(
            exit_code = ?outcome.exit_code,
            cancelled = ?outcome.cancelled,
            duration_ms = outcome.duration.as_millis(),
            "{} finished",
            spec.program
        );

        Ok(outcome)
    }
}

/// Sends SIGTERM, waits for the grace period, then kills the child.
async fn terminate(child: &mut Child, spec: &CommandSpec) -> Result<Option<ExitStatus>> {
    send_terminate(child);

    if let Ok(status) = tokio::time::timeout(spec.grace_period, child.wait()).await {
        return Ok(status.ok());
    }

    warn!(
        "{} did not exit within {}s of SIGTERM, killing it",
        spec.program,
        spec.grace_period.as_secs()
    );

    child.kill().await.map_err(|e| ExecutionError::Supervision {
        program: spec.program.clone(),
        message: format!("failed to kill child: {e}"),
    })?;

    Ok(child.wait().await.ok())
}

#[cfg(unix)]
fn send_terminate(child: &mut Child) {
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id().and_then(|id| i32::try_from(id).ok()) else {
        return;
    };

    if let Err(e) = signal::kill(Pid::from_raw(pid), Signal::SIGTERM) {
        debug!("Failed to send SIGTERM to {pid}: {e}");
    }
}

#[cfg(not(unix))]
fn send_terminate(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        debug!("Failed to terminate child: {e}");
    }
}

/// Reads lines until EOF, logging and forwarding each one.
async fn collect_lines<R>(
    reader: R,
    stream: OutputStream,
    progress: Option<mpsc::UnboundedSender<OutputLine>>,
) -> String
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut collected = String::new();
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\n', '\r']);

                debug!(target: "terraplane::tool", stream = ?stream, "{line}");

                if let Some(sender) = &progress {
                    // A dropped receiver only disables live progress.
                    let _ = sender.send(OutputLine {
                        stream,
                        line: line.to_string(),
                    });
                }

                collected.push_str(line);
                collected.push('\n');
            }
            Err(e) => {
                debug!("Stopped reading {stream:?}: {e}");
                break;
            }
        }
    }

    collected
}

/// Awaits a collector, optionally bounded by `drain`.
async fn join_collector(task: Option<JoinHandle<String>>, drain: Option<Duration>) -> String {
    let Some(mut task) = task else {
        return String::new();
    };

    let joined = match drain {
        Some(limit) => match tokio::time::timeout(limit, &mut task).await {
            Ok(joined) => joined,
            Err(_) => {
                task.abort();
                return String::new();
            }
        },
        None => task.await,
    };

    joined.unwrap_or_default()
}
