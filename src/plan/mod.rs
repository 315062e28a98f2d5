//! Plan interpretation.
//!
//! Turns the provisioning tool's machine-readable plan and apply output into
//! the normalized types the orchestrator makes policy decisions on.

mod interpreter;
mod outputs;
mod summary;

pub use interpreter::{PlanInterpreter, REDACTED};
pub use outputs::ApplyOutputs;
pub use summary::{ChangeAction, PlanSummary, ResourceChange};
