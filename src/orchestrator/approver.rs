//! Approval gate seam.

use async_trait::async_trait;

use super::types::OperationKind;
use crate::plan::PlanSummary;

/// What the approver is asked to confirm.
#[derive(Debug, Clone)]
pub struct ApprovalRequest {
    /// Target environment.
    pub environment: String,
    /// Operation awaiting approval.
    pub operation: OperationKind,
    /// Correlation id of the operation.
    pub correlation_id: String,
    /// The plan to be applied.
    pub plan: PlanSummary,
}

/// An approver's answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalDecision {
    /// Proceed with the mutation.
    Approved,
    /// Do not proceed.
    Rejected,
    /// No one can be asked (e.g. no interactive terminal).
    Unavailable,
}

/// Source of approval decisions for gated operations.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Approver: Send + Sync {
    /// Asks for a decision on `request`.
    ///
    /// The orchestrator bounds the wait with the approval timeout and drops
    /// the future on cancellation.
    async fn request_approval(&self, request: &ApprovalRequest) -> ApprovalDecision;
}

/// Approver that can never ask, so gated operations require `--yes`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NonInteractiveApprover;

#[async_trait]
impl Approver for NonInteractiveApprover {
    async fn request_approval(&self, _request: &ApprovalRequest) -> ApprovalDecision {
        ApprovalDecision::Unavailable
    }
}
