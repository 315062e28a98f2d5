//! Deployment orchestration.
//!
//! This module contains:
//! - Operation request and result types
//! - The approval seam
//! - The pipeline state machine that drives one operation per environment

mod approver;
mod pipeline;
mod types;

#[cfg(test)]
pub use approver::MockApprover;
pub use approver::{ApprovalDecision, ApprovalRequest, Approver, NonInteractiveApprover};
pub use pipeline::Orchestrator;
pub use types::{
    AbortReason, ExecutionResult, ExecutionStatus, Failure, OperationKind, OperationRequest,
    OrchestratorSettings, Stage, StageOutcome,
};
