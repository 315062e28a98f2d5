//! Environment registry.
//!
//! The registry is built once from a validated project file and is read-only
//! afterwards, so it can be shared behind an `Arc` across concurrent
//! operations.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::error::{Result, TerraplaneError};

use super::parser::ConfigParser;
use super::spec::{PolicyConfig, ProjectFile, StateConfig, TimeoutsConfig, ToolConfig, VariableSet};
use super::validator::ConfigValidator;

/// A managed deployment target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Environment {
    /// Unique environment name.
    pub name: String,
    /// Resolved infrastructure code directory.
    pub working_dir: PathBuf,
    /// Deployment policy.
    pub policy: PolicyConfig,
    /// Variables passed to the tool, in document order.
    pub variables: VariableSet,
}

/// Validated, immutable set of environments plus project-wide settings.
#[derive(Debug, Clone)]
pub struct EnvironmentRegistry {
    project: String,
    tool: ToolConfig,
    state: StateConfig,
    timeouts: TimeoutsConfig,
    base_dir: PathBuf,
    environments: BTreeMap<String, Environment>,
    warnings: Vec<String>,
}

impl EnvironmentRegistry {
    /// Loads and validates the configuration file at `path`.
    ///
    /// `.env` next to the file and `TERRAPLANE_*` overrides are applied
    /// before validation.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the file cannot be loaded or fails
    /// validation.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let config = ConfigParser::new().load_with_env(path)?;
        let base_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);

        Self::from_config(config, &base_dir)
    }

    /// Builds a registry from an already parsed project file.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if validation fails.
    pub fn from_config(config: ProjectFile, base_dir: &Path) -> Result<Self> {
        let result = ConfigValidator::new().validate(&config, base_dir)?;
        for warning in &result.warnings {
            warn!("{warning}");
        }

        let environments: BTreeMap<String, Environment> = config
            .environments
            .into_iter()
            .map(|env| {
                let environment = Environment {
                    working_dir: base_dir.join(&env.working_dir),
                    name: env.name,
                    policy: env.policy,
                    variables: env.variables,
                };
                (environment.name.clone(), environment)
            })
            .collect();

        info!(
            "Registered {} environment(s) for project {}",
            environments.len(),
            config.project.name
        );

        Ok(Self {
            project: config.project.name,
            tool: config.tool,
            state: config.state,
            timeouts: config.timeouts,
            base_dir: base_dir.to_path_buf(),
            environments,
            warnings: result.warnings,
        })
    }

    /// Looks up an environment by name.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown names.
    pub fn lookup(&self, name: &str) -> Result<&Environment> {
        self.environments
            .get(name)
            .ok_or_else(|| TerraplaneError::not_found(name))
    }

    /// Environments ordered by name.
    pub fn environments(&self) -> impl Iterator<Item = &Environment> {
        self.environments.values()
    }

    /// Environment names ordered by name.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.environments.keys().cloned().collect()
    }

    /// Project name.
    #[must_use]
    pub fn project(&self) -> &str {
        &self.project
    }

    /// Provisioning tool settings.
    #[must_use]
    pub const fn tool(&self) -> &ToolConfig {
        &self.tool
    }

    /// State backend settings.
    #[must_use]
    pub const fn state(&self) -> &StateConfig {
        &self.state
    }

    /// Stage timeouts.
    #[must_use]
    pub const fn timeouts(&self) -> &TimeoutsConfig {
        &self.timeouts
    }

    /// Local state directory resolved against the config file location.
    #[must_use]
    pub fn local_state_dir(&self) -> PathBuf {
        self.base_dir.join(self.state.local_path())
    }

    /// Non-fatal problems found during validation.
    #[must_use]
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r"
project:
  name: platform
environments:
  - name: prod
    working_dir: envs/prod
    policy: { protected: true }
  - name: dev
    working_dir: envs/dev
    policy: { auto_approve: true }
    variables:
      TF_VAR_environment: dev
";

    fn setup() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("envs/dev")).unwrap();
        std::fs::create_dir_all(dir.path().join("envs/prod")).unwrap();
        let path = dir.path().join("terraplane.yaml");
        std::fs::write(&path, CONFIG).unwrap();
        (dir, path)
    }

    #[test]
    fn test_load_and_lookup() {
        let (dir, path) = setup();
        let registry = EnvironmentRegistry::load(&path).unwrap();

        let dev = registry.lookup("dev").unwrap();
        assert!(dev.policy.auto_approve);
        assert_eq!(dev.working_dir, dir.path().join("envs/dev"));
        assert_eq!(dev.variables.get("TF_VAR_environment"), Some("dev"));

        assert_eq!(registry.names(), vec![String::from("dev"), String::from("prod")]);
        assert_eq!(registry.local_state_dir(), dir.path().join(".terraplane"));
    }

    #[test]
    fn test_lookup_unknown_environment() {
        let (_dir, path) = setup();
        let registry = EnvironmentRegistry::load(&path).unwrap();

        let err = registry.lookup("qa").unwrap_err();
        assert!(matches!(err, TerraplaneError::NotFound { ref environment } if environment == "qa"));
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_load_rejects_missing_working_dir() {
        let (dir, path) = setup();
        std::fs::remove_dir(dir.path().join("envs/prod")).unwrap();

        assert!(matches!(
            EnvironmentRegistry::load(&path),
            Err(TerraplaneError::Config(_))
        ));
    }
}
