//! Configuration parser for loading project files.
//!
//! Handles loading configuration from YAML files, `.env` files and
//! `TERRAPLANE_*` environment variables, with proper precedence.

use crate::error::{ConfigError, Result, TerraplaneError};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::spec::ProjectFile;

/// Environment variable naming an explicit configuration file.
pub const CONFIG_ENV_VAR: &str = "TERRAPLANE_CONFIG";

/// Configuration parser for loading project configuration.
#[derive(Debug, Default)]
pub struct ConfigParser {
    /// Base path for resolving `.env`.
    base_path: Option<PathBuf>,
}

impl ConfigParser {
    /// Creates a new configuration parser.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Sets the base path for resolving relative paths.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Loads configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<ProjectFile> {
        let path = path.as_ref();
        info!("Loading configuration from: {}", path.display());

        if !path.exists() {
            return Err(TerraplaneError::Config(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            TerraplaneError::Config(ConfigError::ParseError {
                message: format!("Failed to read file: {e}"),
                location: Some(path.display().to_string()),
            })
        })?;

        self.parse_yaml(&content, Some(path))
    }

    /// Parses configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<ProjectFile> {
        debug!("Parsing YAML configuration");

        let config: ProjectFile = serde_yaml::from_str(content).map_err(|e| {
            let location = source.map(|p| p.display().to_string());
            TerraplaneError::Config(ConfigError::ParseError {
                message: format!("YAML parse error: {e}"),
                location,
            })
        })?;

        debug!(
            "Parsed configuration for project {} with {} environment(s)",
            config.project.name,
            config.environments.len()
        );
        Ok(config)
    }

    /// Loads configuration, then applies `.env` and environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file or the `.env` file cannot be loaded.
    pub fn load_with_env(&self, path: impl AsRef<Path>) -> Result<ProjectFile> {
        let path = path.as_ref();
        let mut config = self.load_file(path)?;

        let base = self
            .base_path
            .clone()
            .or_else(|| path.parent().map(Path::to_path_buf));
        Self { base_path: base }.load_dotenv()?;

        Self::apply_env_overrides(&mut config, |key| std::env::var(key).ok());

        Ok(config)
    }

    /// Applies `TERRAPLANE_*` overrides using the given lookup.
    fn apply_env_overrides(config: &mut ProjectFile, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(binary) = lookup("TERRAPLANE_TOOL_BINARY") {
            debug!("Overriding tool.binary from environment");
            config.tool.binary = binary;
        }

        if let Some(path) = lookup("TERRAPLANE_STATE_PATH") {
            debug!("Overriding state.path from environment");
            config.state.path = Some(path);
        }

        if let Some(bucket) = lookup("TERRAPLANE_STATE_BUCKET") {
            debug!("Overriding state.bucket from environment");
            config.state.bucket = Some(bucket);
        }

        if let Some(prefix) = lookup("TERRAPLANE_STATE_PREFIX") {
            debug!("Overriding state.prefix from environment");
            config.state.prefix = Some(prefix);
        }
    }

    /// Loads the .env file if present.
    ///
    /// Variables already set in the process environment are not replaced.
    ///
    /// # Errors
    ///
    /// Returns an error if the .env file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self
            .base_path
            .as_ref()
            .map_or_else(|| PathBuf::from(".env"), |p| p.join(".env"));

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| {
                TerraplaneError::Config(ConfigError::ParseError {
                    message: format!("Failed to load .env file: {e}"),
                    location: Some(env_path.display().to_string()),
                })
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        Ok(())
    }
}

/// Default configuration file names to search for.
pub const DEFAULT_CONFIG_FILES: &[&str] = &["terraplane.yaml", "terraplane.yml"];

/// Finds the configuration file in the start directory or its parents,
/// falling back to the user configuration directory.
///
/// # Errors
///
/// Returns an error if no configuration file is found.
pub fn find_config_file(start_dir: impl AsRef<Path>) -> Result<PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start.to_path_buf();

    loop {
        if let Some(found) = config_in(&current) {
            return Ok(found);
        }

        if !current.pop() {
            break;
        }
    }

    if let Some(found) = dirs::config_dir().and_then(|dir| config_in(&dir.join("terraplane"))) {
        return Ok(found);
    }

    Err(TerraplaneError::Config(ConfigError::FileNotFound {
        path: start.join(DEFAULT_CONFIG_FILES[0]),
    }))
}

fn config_in(dir: &Path) -> Option<PathBuf> {
    DEFAULT_CONFIG_FILES
        .iter()
        .map(|filename| dir.join(filename))
        .find(|path| path.exists())
        .inspect(|path| info!("Found configuration file: {}", path.display()))
}
