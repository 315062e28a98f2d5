//! State management module for Terraplane.
//!
//! This module provides the per-environment lifecycle record, the lock
//! table guarding it, and the storage backends it is persisted to.

mod local;
mod lock;
mod s3;
mod store;
mod tracker;
mod types;

pub use local::LocalStateStore;
pub use lock::{HolderStatus, LockInfo, LockToken, generate_holder_id};
pub use s3::S3StateStore;
pub use store::StateStore;
pub use tracker::{StaleLockReport, StateTracker};
pub use types::{
    EnvironmentState, LastOutcome, MAX_TRANSITIONS, OutcomeResult, Phase, STATE_VERSION,
    TransitionRecord,
};
