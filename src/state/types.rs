//! State types for tracking environment lifecycles.
//!
//! One [`EnvironmentState`] record exists per environment. It is the durable
//! view of where the environment is in its lifecycle and how the last
//! operation ended.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::orchestrator::OperationKind;
use crate::plan::ApplyOutputs;

use super::lock::LockInfo;

/// Current version of the state format.
pub const STATE_VERSION: &str = "1.0";

/// Maximum number of transition records kept per environment.
pub const MAX_TRANSITIONS: usize = 100;

/// Lifecycle phase of an environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// No operation in progress.
    #[default]
    Idle,
    /// Running `init`.
    Initializing,
    /// Running `validate`.
    Validating,
    /// Running `plan`.
    Planning,
    /// Waiting for an operator decision.
    AwaitingApproval,
    /// Running `apply`.
    Applying,
    /// Running `destroy`.
    Destroying,
    /// Reading outputs.
    Outputting,
    /// The last mutation failed or was interrupted.
    Failed,
}

/// How an operation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeResult {
    /// All stages succeeded.
    Success,
    /// A stage failed.
    Failure,
    /// A stage was cancelled by the operator or a timeout.
    Cancelled,
    /// The operation stopped at the approval gate or a policy check.
    Aborted,
}

/// Record of the last completed operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastOutcome {
    /// Operation that ran.
    pub operation: OperationKind,
    /// Correlation id of the operation.
    pub correlation_id: String,
    /// How it ended.
    pub result: OutcomeResult,
    /// Exit code of the failing stage, if any.
    #[serde(default)]
    pub exit_code: Option<i32>,
    /// Short error description for failures.
    #[serde(default)]
    pub error_summary: Option<String>,
    /// When the operation finished.
    pub finished_at: DateTime<Utc>,
}

/// A single phase transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRecord {
    /// When the transition happened.
    pub at: DateTime<Utc>,
    /// Phase before.
    pub from: Phase,
    /// Phase after.
    pub to: Phase,
    /// Operation that caused it.
    pub correlation_id: String,
    /// Optional annotation.
    #[serde(default)]
    pub note: Option<String>,
}

/// Persisted state of one environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentState {
    /// State format version.
    pub version: String,
    /// Environment name.
    pub environment: String,
    /// Current phase.
    pub phase: Phase,
    /// Last completed operation.
    #[serde(default)]
    pub last_outcome: Option<LastOutcome>,
    /// Lock held by a running operation.
    #[serde(default)]
    pub lock: Option<LockInfo>,
    /// When the state last changed.
    pub updated_at: DateTime<Utc>,
    /// Outputs captured by the last successful mutation.
    #[serde(default)]
    pub outputs: ApplyOutputs,
    /// Recent transitions, oldest first.
    #[serde(default)]
    pub transitions: Vec<TransitionRecord>,
}

impl Phase {
    /// Returns true for phases an environment rests in between operations.
    #[must_use]
    pub const fn is_resting(self) -> bool {
        matches!(self, Self::Idle | Self::Failed)
    }
}

impl LastOutcome {
    /// Creates an outcome finished now.
    #[must_use]
    pub fn new(operation: OperationKind, correlation_id: impl Into<String>, result: OutcomeResult) -> Self {
        Self {
            operation,
            correlation_id: correlation_id.into(),
            result,
            exit_code: None,
            error_summary: None,
            finished_at: Utc::now(),
        }
    }

    /// Attaches failure details.
    #[must_use]
    pub fn with_error(mut self, exit_code: Option<i32>, summary: impl Into<String>) -> Self {
        self.exit_code = exit_code;
        self.error_summary = Some(summary.into());
        self
    }
}

impl EnvironmentState {
    /// Creates a new idle state.
    #[must_use]
    pub fn new(environment: &str) -> Self {
        Self {
            version: STATE_VERSION.to_string(),
            environment: environment.to_string(),
            phase: Phase::Idle,
            last_outcome: None,
            lock: None,
            updated_at: Utc::now(),
            outputs: ApplyOutputs::default(),
            transitions: Vec::new(),
        }
    }

    /// Moves to `to`, recording the transition.
    pub fn transition(&mut self, to: Phase, correlation_id: &str, note: Option<String>) {
        let now = Utc::now();
        if self.transitions.len() >= MAX_TRANSITIONS {
            self.transitions.remove(0);
        }
        self.transitions.push(TransitionRecord {
            at: now,
            from: self.phase,
            to,
            correlation_id: correlation_id.to_string(),
            note,
        });
        self.phase = to;
        self.updated_at = now;
    }

    /// Returns true when the environment is in the `Failed` phase.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.phase == Phase::Failed
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let phase = match self {
            Self::Idle => "idle",
            Self::Initializing => "initializing",
            Self::Validating => "validating",
            Self::Planning => "planning",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Applying => "applying",
            Self::Destroying => "destroying",
            Self::Outputting => "outputting",
            Self::Failed => "failed",
        };
        write!(f, "{phase}")
    }
}

impl std::fmt::Display for OutcomeResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let result = match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Cancelled => "cancelled",
            Self::Aborted => "aborted",
        };
        write!(f, "{result}")
    }
}
