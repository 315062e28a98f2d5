// ============================================================================
// Strict linting - Dangerous or non-idiomatic practices are forbidden
// ============================================================================

#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![deny(missing_docs)]                // All public items must be documented
#![cfg_attr(test, allow(missing_docs))] // Generated mocks carry no docs
#![warn(dead_code)]                   // Unused code is flagged
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention

// Additional strictness - Leave nothing unchecked
#![warn(unused_imports)]              // Unused imports are flagged
#![warn(unused_variables)]            // Unused variables are flagged
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden
#![forbid(unsafe_op_in_unsafe_fn)]    // Unsafe ops in unsafe fns are forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::nursery)]             // Experimental lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::missing_const_for_fn)] // Force const when possible
#![warn(clippy::unwrap_in_result)]    // unwrap() in Result warning
#![warn(clippy::module_inception)]    // Module with same name as crate warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::shadow_unrelated)]    // Shadowing unrelated variables warning
#![warn(clippy::too_many_arguments)]  // Limit function arguments
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// ============================================================================
// Crate Documentation
// ============================================================================

//! # Terraplane
//!
//! A multi-environment orchestrator for Terraform-compatible infrastructure deployments.
//!
//! ## Overview
//!
//! Terraplane wraps an external provisioning tool (`terraform` or `tofu`) and
//! drives it through a fixed, safety-checked pipeline per environment:
//!
//! - Declare environments, their working directories and policies in one YAML file
//! - Run `init`, `validate`, `plan` and `apply`/`destroy` with structured output parsing
//! - Gate mutations behind approval for protected or destructive plans
//! - Track per-environment state, locks and the last outcome in a local or S3 backend
//!
//! ## Architecture
//!
//! Every operation goes through the same state machine:
//!
//! 1. **Lock**: the environment lock is acquired without waiting
//! 2. **Plan**: the tool's machine-readable plan is parsed into a summary
//! 3. **Gate**: instance limits and the approval policy are enforced
//! 4. **Mutate**: apply or destroy runs only after the gate, then outputs are captured
//!
//! ## Modules
//!
//! - [`config`]: Configuration parsing, validation and the environment registry
//! - [`runner`]: Cancellable subprocess execution
//! - [`plan`]: Plan and apply output interpretation
//! - [`state`]: Environment state, locks and storage backends (local, S3)
//! - [`orchestrator`]: The deployment pipeline
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! project:
//!   name: shop
//!
//! state:
//!   backend: s3
//!   bucket: shop-terraplane-state
//!
//! environments:
//!   - name: dev
//!     working_dir: infra/dev
//!     policy:
//!       auto_approve: true
//!   - name: prod
//!     working_dir: infra/prod
//!     policy:
//!       protected: true
//!       max_instances: 6
//!     variables:
//!       TF_VAR_region: eu-west-1
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod cli;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod plan;
pub mod runner;
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{ConfigParser, ConfigValidator, Environment, EnvironmentRegistry, ProjectFile};
pub use error::{Result, TerraplaneError};
pub use orchestrator::{
    ExecutionResult, ExecutionStatus, OperationKind, OperationRequest, Orchestrator,
};
pub use plan::{PlanInterpreter, PlanSummary};
pub use runner::{ProcessRunner, TokioProcessRunner};
pub use state::{EnvironmentState, LocalStateStore, Phase, S3StateStore, StateStore, StateTracker};
