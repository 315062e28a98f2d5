//! Subprocess execution for the provisioning tool.
//!
//! The orchestrator talks to the provisioning tool exclusively through the
//! [`ProcessRunner`] trait so the pipeline can be driven by a scripted runner
//! in tests instead of spawning real processes.

mod process;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

pub use process::{OutputLine, OutputStream, TokioProcessRunner};

/// Default grace period between SIGTERM and SIGKILL.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Maximum number of stderr lines kept in failure excerpts.
const STDERR_TAIL_LINES: usize = 20;

/// Maximum number of bytes kept in failure excerpts.
const STDERR_TAIL_BYTES: usize = 2048;

/// A fully resolved subprocess invocation.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    /// Program to execute.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<String>,
    /// Working directory of the child.
    pub workdir: PathBuf,
    /// Variables applied on top of the ambient environment, in order.
    pub env: Vec<(String, String)>,
    /// Maximum run time before the child is cancelled.
    pub timeout: Option<Duration>,
    /// Time given to the child to exit after SIGTERM.
    pub grace_period: Duration,
}

/// Why a subprocess was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CancelReason {
    /// The operator interrupted the operation.
    Operator,
    /// The stage ran past its configured timeout.
    Timeout,
}

/// Result of running a subprocess to completion or cancellation.
#[derive(Debug, Clone, Default)]
pub struct ProcessOutcome {
    /// Exit code, if the process exited normally.
    pub exit_code: Option<i32>,
    /// Set when the process was terminated because of cancellation.
    pub cancelled: Option<CancelReason>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
    /// Wall-clock run time.
    pub duration: Duration,
}

/// Executes provisioning tool subprocesses.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Runs a subprocess until it exits, times out, or `cancel` fires.
    ///
    /// A nonzero exit is a normal outcome. Only a failure to spawn the
    /// process is reported as an error.
    async fn run(&self, spec: &CommandSpec, cancel: &CancellationToken) -> Result<ProcessOutcome>;
}

impl CommandSpec {
    /// Creates a spec with no timeout and the default grace period.
    #[must_use]
    pub fn new(program: impl Into<String>, workdir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            workdir: workdir.into(),
            env: Vec::new(),
            timeout: None,
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }

    /// Appends arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Appends environment variables.
    #[must_use]
    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Sets the timeout.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets the grace period.
    #[must_use]
    pub const fn grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// Returns the command line for logging.
    #[must_use]
    pub fn display(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

impl ProcessOutcome {
    /// Creates a normally exited outcome.
    #[must_use]
    pub fn exited(exit_code: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            exit_code: Some(exit_code),
            cancelled: None,
            stdout: stdout.into(),
            stderr: stderr.into(),
            duration: Duration::ZERO,
        }
    }

    /// Creates a cancelled outcome.
    #[must_use]
    pub fn cancelled(reason: CancelReason) -> Self {
        Self {
            cancelled: Some(reason),
            ..Self::default()
        }
    }

    /// Returns true if the process exited with status zero.
    #[must_use]
    pub const fn success(&self) -> bool {
        matches!(self.exit_code, Some(0)) && self.cancelled.is_none()
    }

    /// Exit code to report for a failed run; `-1` when the process was
    /// killed by a signal.
    #[must_use]
    pub fn reported_exit_code(&self) -> i32 {
        self.exit_code.unwrap_or(-1)
    }

    /// Returns a bounded excerpt of the end of stderr.
    ///
    /// Falls back to stdout when stderr is empty, since some tools report
    /// errors as structured diagnostics on stdout.
    #[must_use]
    pub fn stderr_tail(&self) -> String {
        let source = if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        };
        tail(source, STDERR_TAIL_LINES, STDERR_TAIL_BYTES)
    }
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let reason = match self {
            Self::Operator => "operator interrupt",
            Self::Timeout => "timeout",
        };
        write!(f, "{reason}")
    }
}

/// Keeps the last `max_lines` non-empty lines, bounded to `max_bytes`.
fn tail(text: &str, max_lines: usize, max_bytes: usize) -> String {
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(max_lines);
    let joined = lines[start..].join("\n");

    if joined.len() <= max_bytes {
        return joined;
    }

    let mut cut = joined.len() - max_bytes;
    while !joined.is_char_boundary(cut) {
        cut += 1;
    }
    format!("...{}", &joined[cut..])
}
