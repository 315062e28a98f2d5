//! State store trait definition.
//!
//! This module defines the common interface for state storage backends.
//! Every environment is stored as one independent record.

use async_trait::async_trait;

use super::types::EnvironmentState;
use crate::error::Result;

/// Trait for state storage backends.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Loads the state of one environment.
    ///
    /// Returns `None` if no state exists yet.
    async fn load(&self, environment: &str) -> Result<Option<EnvironmentState>>;

    /// Replaces the stored state of `state.environment` atomically.
    async fn save(&self, state: &EnvironmentState) -> Result<()>;

    /// Lists environments with a stored record.
    async fn list(&self) -> Result<Vec<String>>;

    /// Gets the backend type name.
    fn backend_type(&self) -> &'static str;
}
