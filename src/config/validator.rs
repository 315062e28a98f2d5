//! Configuration validation.
//!
//! Validates a parsed project file before any environment is registered,
//! collecting every problem so the operator sees a complete picture.

use crate::error::{ConfigError, Result, TerraplaneError};
use std::collections::HashSet;
use std::path::Path;
use tracing::debug;

use super::spec::{EnvironmentConfig, PolicyConfig, ProjectFile, StateBackend, StateConfig};

/// Validator for project configurations.
#[derive(Debug, Default)]
pub struct ConfigValidator;

/// Validation result containing all errors found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// List of validation errors.
    pub errors: Vec<ValidationError>,
    /// List of warnings (non-fatal issues).
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug)]
pub struct ValidationError {
    /// The field path that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
    /// A dedicated error to report instead of a generic validation error.
    cause: Option<ConfigError>,
}

impl ConfigValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates a project configuration.
    ///
    /// Working directories are resolved against `base_dir`.
    ///
    /// # Errors
    ///
    /// Returns the first error found if validation fails.
    pub fn validate(&self, config: &ProjectFile, base_dir: &Path) -> Result<ValidationResult> {
        let mut result = ValidationResult::default();

        Self::validate_project(config, &mut result);
        Self::validate_state(&config.state, &mut result);
        Self::validate_environments(&config.environments, base_dir, &mut result);

        if result.errors.is_empty() {
            debug!("Configuration validation passed");
            return Ok(result);
        }

        let first = result.errors.swap_remove(0);
        Err(TerraplaneError::Config(first.cause.unwrap_or(
            ConfigError::ValidationError {
                message: first.message,
                field: Some(first.field),
            },
        )))
    }

    fn validate_project(config: &ProjectFile, result: &mut ValidationResult) {
        let name = &config.project.name;
        if name.is_empty() {
            result.push("project.name", "Project name cannot be empty");
        } else if !is_valid_name(name) {
            result.push(
                "project.name",
                format!("Project name '{name}' is invalid. Must be lowercase alphanumeric with hyphens."),
            );
        }

        if config.tool.binary.trim().is_empty() {
            result.push("tool.binary", "Tool binary cannot be empty");
        }
    }

    fn validate_state(state: &StateConfig, result: &mut ValidationResult) {
        match state.backend {
            StateBackend::S3 => {
                if state.bucket.as_ref().is_none_or(String::is_empty) {
                    result.push("state.bucket", "S3 bucket name is required when using S3 backend");
                }
            }
            StateBackend::Local => {
                if state.path.as_deref().is_some_and(str::is_empty) {
                    result.push("state.path", "Local state path cannot be empty");
                }
            }
        }
    }

    fn validate_environments(
        environments: &[EnvironmentConfig],
        base_dir: &Path,
        result: &mut ValidationResult,
    ) {
        if environments.is_empty() {
            result.warnings.push(String::from("No environments defined in configuration"));
            return;
        }

        let mut seen_names = HashSet::new();

        for (i, env) in environments.iter().enumerate() {
            let prefix = format!("environments[{i}]");

            if !seen_names.insert(env.name.as_str()) {
                result.errors.push(ValidationError {
                    field: format!("{prefix}.name"),
                    message: format!("Duplicate environment name: {}", env.name),
                    cause: Some(ConfigError::DuplicateName {
                        name: env.name.clone(),
                    }),
                });
            }

            if !is_valid_name(&env.name) {
                result.push(
                    format!("{prefix}.name"),
                    format!(
                        "Environment name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                        env.name
                    ),
                );
            }

            let dir = base_dir.join(&env.working_dir);
            if !dir.is_dir() {
                result.errors.push(ValidationError {
                    field: format!("{prefix}.working_dir"),
                    message: format!("Working directory does not exist: {}", dir.display()),
                    cause: Some(ConfigError::WorkingDirNotFound {
                        environment: env.name.clone(),
                        path: dir,
                    }),
                });
            }

            Self::validate_policy(&env.name, &env.policy, &prefix, result);
        }
    }

    fn validate_policy(name: &str, policy: &PolicyConfig, prefix: &str, result: &mut ValidationResult) {
        if policy.max_instances == 0 {
            result.push(
                format!("{prefix}.policy.max_instances"),
                "Maximum instances must be at least 1",
            );
        } else if policy.max_instances < policy.desired_capacity {
            result.push(
                format!("{prefix}.policy.max_instances"),
                format!(
                    "max_instances ({}) is below desired_capacity ({})",
                    policy.max_instances, policy.desired_capacity
                ),
            );
        }

        if policy.instance_resource_types.iter().any(|t| t.trim().is_empty()) {
            result.push(
                format!("{prefix}.policy.instance_resource_types"),
                "Instance resource types cannot be empty strings",
            );
        }

        if policy.protected && policy.auto_approve {
            result.warnings.push(format!(
                "Environment '{name}' is protected but has auto_approve enabled"
            ));
        }
    }
}

impl ValidationResult {
    fn push(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ValidationError {
            field: field.into(),
            message: message.into(),
            cause: None,
        });
    }

    /// Returns true if validation passed.
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the number of warnings.
    #[must_use]
    pub const fn warning_count(&self) -> usize {
        self.warnings.len()
    }
}

/// Validates that a name follows the naming convention.
/// Names must be lowercase alphanumeric with hyphens, starting with a letter.
pub(crate) fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();

    let Some(first) = chars.next() else {
        return false;
    };
    if !first.is_ascii_lowercase() {
        return false;
    }

    if !chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-') {
        return false;
    }

    !name.ends_with('-') && !name.contains("--")
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}
