//! Error types for the Terraplane orchestrator.
//!
//! This module provides the error hierarchy for every layer of the deployment
//! lifecycle: configuration, environment lookup, state tracking, policy,
//! subprocess execution and pipeline stages.

use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;

use crate::orchestrator::Stage;
use crate::runner::CancelReason;

/// Markers in provisioning tool error output that indicate a transient
/// infrastructure problem rather than a configuration mistake.
const TRANSIENT_MARKERS: &[&str] = &[
    "timeout",
    "timed out",
    "connection reset",
    "connection refused",
    "tls handshake",
    "throttling",
    "rate exceeded",
    "too many requests",
    "service unavailable",
    "temporary failure in name resolution",
];

/// The main error type for the Terraplane orchestrator.
#[derive(Debug, Error)]
pub enum TerraplaneError {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The requested environment is not registered.
    #[error("Unknown environment: {environment}")]
    NotFound {
        /// Name that was looked up.
        environment: String,
    },

    /// State tracking and persistence errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Environment policy rejected the operation.
    #[error("Policy violation: {0}")]
    Policy(#[from] PolicyViolation),

    /// The provisioning tool could not be executed.
    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    /// A pipeline stage failed.
    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file was not found.
    #[error("Configuration file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The configuration file could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed.
    #[error("Configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },

    /// Environment variable is missing.
    #[error("Missing environment variable: {name}")]
    MissingEnvVar {
        /// Name of the missing variable.
        name: String,
    },

    /// Two environments share a name.
    #[error("Duplicate environment name: {name}")]
    DuplicateName {
        /// The duplicated name.
        name: String,
    },

    /// An environment's working directory does not exist.
    #[error("Working directory for environment '{environment}' does not exist: {path}")]
    WorkingDirNotFound {
        /// Environment that references the directory.
        environment: String,
        /// The missing directory.
        path: PathBuf,
    },
}

/// State tracking and persistence errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// Another operation currently holds the environment lock.
    #[error("Environment '{environment}' is locked by {holder} (since {since})")]
    LockHeld {
        /// Locked environment.
        environment: String,
        /// Correlation id or process identity of the holder.
        holder: String,
        /// When the lock was acquired.
        since: String,
    },

    /// A persisted lock belongs to an operation that is no longer running.
    #[error(
        "Stale lock on environment '{environment}' held by {holder} (since {since}); \
         run `terraplane state unlock --environment {environment} --force` to release it"
    )]
    StaleLock {
        /// Locked environment.
        environment: String,
        /// Correlation id of the interrupted operation.
        holder: String,
        /// When the lock was acquired.
        since: String,
    },

    /// A persisted lock was taken on another host, so its holder cannot be
    /// checked from here.
    #[error(
        "Environment '{environment}' is locked by {holder} on host {hostname} (since {since}); \
         its liveness cannot be verified from this host. If that host is no longer running it, \
         run `terraplane state unlock --environment {environment} --force`"
    )]
    RemoteLock {
        /// Locked environment.
        environment: String,
        /// Correlation id of the holding operation.
        holder: String,
        /// Host the lock was taken on.
        hostname: String,
        /// When the lock was acquired.
        since: String,
    },

    /// A mutation was attempted without holding the matching lock.
    #[error("Operation does not hold the lock for environment '{environment}'")]
    NotLocked {
        /// Environment whose lock was expected.
        environment: String,
    },

    /// Persisted state is unreadable.
    #[error("State is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// State backend failure (filesystem or S3).
    #[error("State backend error: {message}")]
    Backend {
        /// Description of the backend failure.
        message: String,
    },

    /// Serialization error.
    #[error("State serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },

    /// State version mismatch.
    #[error("State version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Expected state version.
        expected: String,
        /// Found state version.
        found: String,
    },
}

/// Policy violations raised by environment guardrails.
#[derive(Debug, Clone, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PolicyViolation {
    /// Destroy requested on a protected environment.
    #[error("Environment '{environment}' is protected and cannot be destroyed")]
    ProtectedDestroy {
        /// The protected environment.
        environment: String,
    },

    /// Approval is required but could not be obtained interactively.
    #[error("Environment '{environment}' requires approval; re-run interactively or pass --yes")]
    ApprovalRequired {
        /// Environment requiring approval.
        environment: String,
    },

    /// The plan would create more instances than the environment allows.
    #[error("Plan creates {planned} instances in '{environment}' but max_instances is {limit}")]
    InstanceLimitExceeded {
        /// Environment whose limit is exceeded.
        environment: String,
        /// Instances the plan creates.
        planned: usize,
        /// Configured `max_instances`.
        limit: u32,
    },
}

/// Subprocess execution errors.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// The subprocess could not be spawned at all.
    #[error("Failed to spawn '{program}': {message}")]
    SpawnFailed {
        /// Program that was invoked.
        program: String,
        /// Description of the spawn failure.
        message: String,
    },

    /// Waiting on or signalling the subprocess failed.
    #[error("Failed to supervise '{program}': {message}")]
    Supervision {
        /// Program that was invoked.
        program: String,
        /// Description of the failure.
        message: String,
    },
}

/// Failures of individual pipeline stages.
///
/// These are captured in execution results and persisted as the last
/// outcome of an environment, so they are cloneable and serializable.
#[derive(Debug, Clone, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PipelineError {
    /// `init` exited with a nonzero status.
    #[error("init failed with exit code {exit_code}: {stderr_tail}")]
    InitFailed {
        /// Exit code of the subprocess.
        exit_code: i32,
        /// Bounded excerpt of stderr.
        stderr_tail: String,
    },

    /// `validate` exited with a nonzero status.
    #[error("validate failed with exit code {exit_code}: {stderr_tail}")]
    ValidateFailed {
        /// Exit code of the subprocess.
        exit_code: i32,
        /// Bounded excerpt of stderr.
        stderr_tail: String,
    },

    /// `plan` exited with an error status.
    #[error("plan failed with exit code {exit_code}: {stderr_tail}")]
    PlanFailed {
        /// Exit code of the subprocess.
        exit_code: i32,
        /// Bounded excerpt of stderr.
        stderr_tail: String,
    },

    /// `apply` exited with a nonzero status.
    #[error("apply failed with exit code {exit_code}: {stderr_tail}")]
    ApplyFailed {
        /// Exit code of the subprocess.
        exit_code: i32,
        /// Bounded excerpt of stderr.
        stderr_tail: String,
    },

    /// `destroy` exited with a nonzero status.
    #[error("destroy failed with exit code {exit_code}: {stderr_tail}")]
    DestroyFailed {
        /// Exit code of the subprocess.
        exit_code: i32,
        /// Bounded excerpt of stderr.
        stderr_tail: String,
    },

    /// `output` exited with a nonzero status.
    #[error("output failed with exit code {exit_code}: {stderr_tail}")]
    OutputFailed {
        /// Exit code of the subprocess.
        exit_code: i32,
        /// Bounded excerpt of stderr.
        stderr_tail: String,
    },

    /// The provisioning tool could not be spawned for a stage.
    #[error("could not run {program}: {message}")]
    Spawn {
        /// Program that was invoked.
        program: String,
        /// Description of the spawn failure.
        message: String,
    },

    /// The plan output was not well-formed structured data.
    #[error("plan output could not be parsed: {message}")]
    Parse {
        /// Description of the parse failure.
        message: String,
    },

    /// A verification plan differs from the plan that was approved.
    #[error("plan drift detected: approved plan {expected} but verification produced {actual}")]
    DriftDetected {
        /// Fingerprint of the first plan.
        expected: String,
        /// Fingerprint of the verification plan.
        actual: String,
    },

    /// The stage was cancelled by the operator or by its timeout.
    #[error("{stage} cancelled ({reason})")]
    Cancelled {
        /// Stage that was running.
        stage: Stage,
        /// Why it was cancelled.
        reason: CancelReason,
    },
}

/// Result type alias for Terraplane operations.
pub type Result<T> = std::result::Result<T, TerraplaneError>;

impl TerraplaneError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Creates a not-found error for an environment.
    #[must_use]
    pub fn not_found(environment: impl Into<String>) -> Self {
        Self::NotFound {
            environment: environment.into(),
        }
    }

    /// Process exit code the CLI reports for this error.
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::Config(_) | Self::NotFound { .. } | Self::Policy(_) => 2,
            Self::Pipeline(PipelineError::Cancelled {
                reason: CancelReason::Operator,
                ..
            }) => 130,
            _ => 1,
        }
    }

    /// Returns true if this error is worth retrying without operator input.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Pipeline(e) => e.is_retryable(),
            Self::State(StateError::LockHeld { .. } | StateError::Backend { .. }) => true,
            _ => false,
        }
    }
}

impl ConfigError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Creates a validation error without a specific field.
    #[must_use]
    pub fn validation_general(message: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: None,
        }
    }
}

impl StateError {
    /// Creates a backend error with the given message.
    #[must_use]
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }

    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }

    /// Creates a corruption error with the given message.
    #[must_use]
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted {
            message: message.into(),
        }
    }
}

impl PipelineError {
    /// Returns the stage-specific failure for a nonzero exit.
    #[must_use]
    pub fn stage_failed(stage: Stage, exit_code: i32, stderr_tail: String) -> Self {
        match stage {
            Stage::Init => Self::InitFailed { exit_code, stderr_tail },
            Stage::Validate => Self::ValidateFailed { exit_code, stderr_tail },
            Stage::Plan | Stage::VerifyPlan => Self::PlanFailed { exit_code, stderr_tail },
            Stage::Apply => Self::ApplyFailed { exit_code, stderr_tail },
            Stage::Destroy => Self::DestroyFailed { exit_code, stderr_tail },
            Stage::Output => Self::OutputFailed { exit_code, stderr_tail },
        }
    }

    /// Returns true if the failure was an operator or timeout cancellation.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Exit code of the failed subprocess, if one ran to completion.
    #[must_use]
    pub const fn exit_code(&self) -> Option<i32> {
        match self {
            Self::InitFailed { exit_code, .. }
            | Self::ValidateFailed { exit_code, .. }
            | Self::PlanFailed { exit_code, .. }
            | Self::ApplyFailed { exit_code, .. }
            | Self::DestroyFailed { exit_code, .. }
            | Self::OutputFailed { exit_code, .. } => Some(*exit_code),
            _ => None,
        }
    }

    /// Returns true for stage failures caused by transient infrastructure
    /// errors. Cancellations are never retryable.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::InitFailed { stderr_tail, .. }
            | Self::ValidateFailed { stderr_tail, .. }
            | Self::PlanFailed { stderr_tail, .. }
            | Self::ApplyFailed { stderr_tail, .. }
            | Self::DestroyFailed { stderr_tail, .. }
            | Self::OutputFailed { stderr_tail, .. } => {
                let lower = stderr_tail.to_lowercase();
                TRANSIENT_MARKERS.iter().any(|marker| lower.contains(marker))
            }
            Self::Spawn { .. }
            | Self::Parse { .. }
            | Self::DriftDetected { .. }
            | Self::Cancelled { .. } => false,
        }
    }
}
