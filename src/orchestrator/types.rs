//! Request, result and settings types for the deployment pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::config::{EnvironmentRegistry, TimeoutsConfig};
use crate::error::{PipelineError, PolicyViolation};
use crate::plan::{ApplyOutputs, PlanSummary};
use crate::runner::{CancelReason, DEFAULT_GRACE_PERIOD};
use crate::state::{EnvironmentState, LastOutcome, Phase};

/// Operation requested on an environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Initialize the working directory.
    Init,
    /// Initialize and validate.
    Validate,
    /// Compute a plan without applying it.
    Plan,
    /// Plan and apply.
    Apply,
    /// Plan and destroy everything.
    Destroy,
    /// Read current outputs.
    Output,
    /// Report persisted state.
    Status,
}

/// A pipeline stage that runs a subprocess.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// `init`.
    Init,
    /// `validate`.
    Validate,
    /// The first `plan` run.
    Plan,
    /// The second `plan` run compared against the first.
    VerifyPlan,
    /// `apply`.
    Apply,
    /// `destroy`.
    Destroy,
    /// `output`.
    Output,
}

/// A request to run one operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationRequest {
    /// Target environment.
    pub environment: String,
    /// Requested operation.
    pub operation: OperationKind,
    /// Skip interactive confirmation.
    pub pre_approved: bool,
    /// Audit trail identifier.
    pub correlation_id: String,
}

/// Why an operation stopped without running its mutation.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum AbortReason {
    /// The operator declined the plan.
    Rejected,
    /// No decision arrived within the approval timeout.
    ApprovalTimeout,
    /// The operation was cancelled while waiting for approval.
    Cancelled,
    /// A policy check rejected the plan.
    Policy {
        /// The violated policy.
        violation: PolicyViolation,
    },
}

/// Terminal status of an operation.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Every stage succeeded.
    Succeeded,
    /// Stopped intentionally before mutating anything.
    Aborted {
        /// Why the operation stopped.
        #[serde(flatten)]
        reason: AbortReason,
    },
    /// A stage failed or was cancelled.
    Failed,
}

/// Record of one stage run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageOutcome {
    /// Stage that ran.
    pub stage: Stage,
    /// Whether the stage succeeded.
    pub success: bool,
    /// Exit code, absent if the process never exited on its own.
    pub exit_code: Option<i32>,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
    /// Optional annotation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// A stage failure.
#[derive(Debug, Clone, Serialize)]
pub struct Failure {
    /// The error.
    pub error: PipelineError,
    /// Stage it occurred in.
    pub stage: Stage,
    /// Human-readable description.
    pub message: String,
    /// Whether retrying without changes may succeed.
    pub retryable: bool,
}

/// Outcome of one `execute` call.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    /// The request that produced this result.
    pub request: OperationRequest,
    /// Phase the environment rests in afterwards.
    pub final_phase: Phase,
    /// How the operation ended.
    #[serde(flatten)]
    pub status: ExecutionStatus,
    /// The plan, if one was computed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<PlanSummary>,
    /// Captured outputs, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outputs: Option<ApplyOutputs>,
    /// Stages in the order they ran.
    pub stages: Vec<StageOutcome>,
    /// The failure, if the operation failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<Failure>,
    /// Last outcome when the environment was already failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prior_failure: Option<LastOutcome>,
    /// State snapshot, for status requests.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<EnvironmentState>,
    /// When the operation started.
    pub started_at: DateTime<Utc>,
    /// When the operation finished.
    pub finished_at: DateTime<Utc>,
}

/// Tunables for the pipeline.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Provisioning tool executable.
    pub binary: String,
    /// Extra arguments for `init`.
    pub init_args: Vec<String>,
    /// Run `validate` after `init`.
    pub validate: bool,
    /// Run a second plan before mutating and compare fingerprints.
    pub verify_plan: bool,
    /// Per-stage timeouts.
    pub timeouts: TimeoutsConfig,
}

impl OperationKind {
    /// Returns true for operations that change infrastructure.
    #[must_use]
    pub const fn is_mutation(self) -> bool {
        matches!(self, Self::Apply | Self::Destroy)
    }
}

impl OperationRequest {
    /// Creates a request with a fresh correlation id.
    #[must_use]
    pub fn new(environment: impl Into<String>, operation: OperationKind) -> Self {
        Self {
            environment: environment.into(),
            operation,
            pre_approved: false,
            correlation_id: Uuid::new_v4().to_string(),
        }
    }

    /// Sets the pre-approved flag.
    #[must_use]
    pub const fn pre_approved(mut self, pre_approved: bool) -> Self {
        self.pre_approved = pre_approved;
        self
    }

    /// Uses a caller-supplied correlation id.
    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }
}

impl Failure {
    /// Wraps a pipeline error raised in `stage`.
    #[must_use]
    pub fn new(stage: Stage, error: PipelineError) -> Self {
        Self {
            message: error.to_string(),
            retryable: error.is_retryable(),
            error,
            stage,
        }
    }
}

impl ExecutionResult {
    /// Returns true if the operation succeeded.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.status, ExecutionStatus::Succeeded)
    }

    /// Process exit code the CLI reports for this result.
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        match &self.status {
            ExecutionStatus::Succeeded
            | ExecutionStatus::Aborted {
                reason: AbortReason::Rejected | AbortReason::ApprovalTimeout,
            } => 0,
            ExecutionStatus::Aborted {
                reason: AbortReason::Cancelled,
            } => 130,
            ExecutionStatus::Aborted {
                reason: AbortReason::Policy { .. },
            } => 2,
            ExecutionStatus::Failed => match &self.failure {
                Some(Failure {
                    error:
                        PipelineError::Cancelled {
                            reason: CancelReason::Operator,
                            ..
                        },
                    ..
                }) => 130,
                _ => 1,
            },
        }
    }
}

impl OrchestratorSettings {
    /// Builds settings from a loaded registry.
    #[must_use]
    pub fn from_registry(registry: &EnvironmentRegistry) -> Self {
        Self {
            binary: registry.tool().binary.clone(),
            init_args: registry.tool().init_args.clone(),
            validate: true,
            verify_plan: true,
            timeouts: *registry.timeouts(),
        }
    }

    /// Timeout for one run of `stage`.
    #[must_use]
    pub const fn timeout_for(&self, stage: Stage) -> Duration {
        let secs = match stage {
            Stage::Init => self.timeouts.init,
            Stage::Validate => self.timeouts.validate,
            Stage::Plan | Stage::VerifyPlan => self.timeouts.plan,
            Stage::Apply => self.timeouts.apply,
            Stage::Destroy => self.timeouts.destroy,
            Stage::Output => self.timeouts.output,
        };
        Duration::from_secs(secs)
    }

    /// Time between SIGTERM and SIGKILL on cancellation.
    #[must_use]
    pub const fn grace_period(&self) -> Duration {
        if self.timeouts.grace_period == 0 {
            DEFAULT_GRACE_PERIOD
        } else {
            self.timeouts.grace_period()
        }
    }
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            binary: String::from("terraform"),
            init_args: Vec::new(),
            validate: true,
            verify_plan: true,
            timeouts: TimeoutsConfig::default(),
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let op = match self {
            Self::Init => "init",
            Self::Validate => "validate",
            Self::Plan => "plan",
            Self::Apply => "apply",
            Self::Destroy => "destroy",
            Self::Output => "output",
            Self::Status => "status",
        };
        write!(f, "{op}")
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stage = match self {
            Self::Init => "init",
            Self::Validate => "validate",
            Self::Plan => "plan",
            Self::VerifyPlan => "verify-plan",
            Self::Apply => "apply",
            Self::Destroy => "destroy",
            Self::Output => "output",
        };
        write!(f, "{stage}")
    }
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rejected => write!(f, "approval rejected"),
            Self::ApprovalTimeout => write!(f, "approval timed out"),
            Self::Cancelled => write!(f, "cancelled while awaiting approval"),
            Self::Policy { violation } => write!(f, "{violation}"),
        }
    }
}
