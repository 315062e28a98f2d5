//! Configuration module for Terraplane.
//!
//! This module handles all configuration-related functionality:
//! - Parsing and deserializing `terraplane.yaml`
//! - `.env` loading and `TERRAPLANE_*` overrides
//! - Validation of configuration values
//! - The environment registry built from a validated configuration

mod parser;
mod registry;
mod spec;
mod validator;

pub use parser::{CONFIG_ENV_VAR, ConfigParser, DEFAULT_CONFIG_FILES, find_config_file};
pub use registry::{Environment, EnvironmentRegistry};
pub use spec::{
    EnvironmentConfig, PolicyConfig, ProjectConfig, ProjectFile, StateBackend, StateConfig,
    TimeoutsConfig, ToolConfig, VariableSet,
};
pub use validator::{ConfigValidator, ValidationError, ValidationResult};
