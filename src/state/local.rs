//! Local file-based state storage backend.
//!
//! Stores one `<environment>.json` file per environment in a state directory.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::{Result, StateError, TerraplaneError};

use super::store::StateStore;
use super::types::{EnvironmentState, STATE_VERSION};

/// State file extension.
const STATE_EXTENSION: &str = "json";

/// Local file-based state store.
#[derive(Debug)]
pub struct LocalStateStore {
    /// Directory holding the per-environment state files.
    base_dir: PathBuf,
}

impl LocalStateStore {
    /// Creates a new local state store rooted at `base_dir`.
    #[must_use]
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// State directory.
    #[must_use]
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn state_path(&self, environment: &str) -> PathBuf {
        self.base_dir.join(format!("{environment}.{STATE_EXTENSION}"))
    }

    /// Ensures the state directory exists.
    async fn ensure_dir(&self) -> Result<()> {
        if !self.base_dir.exists() {
            debug!("Creating state directory: {}", self.base_dir.display());
            fs::create_dir_all(&self.base_dir)
                .await
                .map_err(|e| StateError::backend(format!("Failed to create state directory: {e}")))?;
        }
        Ok(())
    }
}

#[async_trait]
impl StateStore for LocalStateStore {
    async fn load(&self, environment: &str) -> Result<Option<EnvironmentState>> {
        let path = self.state_path(environment);
        if !path.exists() {
            debug!("State file does not exist: {}", path.display());
            return Ok(None);
        }

        debug!("Loading state from: {}", path.display());

        let content = fs::read_to_string(&path)
            .await
            .map_err(|e| StateError::corrupted(format!("Failed to read state file: {e}")))?;

        let state: EnvironmentState = serde_json::from_str(&content)
            .map_err(|e| StateError::corrupted(format!("Failed to parse {}: {e}", path.display())))?;

        if state.version != STATE_VERSION {
            return Err(TerraplaneError::State(StateError::VersionMismatch {
                expected: STATE_VERSION.to_string(),
                found: state.version,
            }));
        }

        Ok(Some(state))
    }

    async fn save(&self, state: &EnvironmentState) -> Result<()> {
        self.ensure_dir().await?;

        let path = self.state_path(&state.environment);
        debug!("Saving state to: {}", path.display());

        let content = serde_json::to_string_pretty(state)
            .map_err(|e| StateError::serialization(format!("Failed to serialize state: {e}")))?;

        // Write to a temporary file first, then rename for atomicity
        let temp_path = path.with_extension("tmp");

        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| StateError::backend(format!("Failed to create temp state file: {e}")))?;

        file.write_all(content.as_bytes())
            .await
            .map_err(|e| StateError::backend(format!("Failed to write state file: {e}")))?;

        file.sync_all()
            .await
            .map_err(|e| StateError::backend(format!("Failed to sync state file: {e}")))?;

        fs::rename(&temp_path, &path)
            .await
            .map_err(|e| StateError::backend(format!("Failed to rename state file: {e}")))?;

        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>> {
        if !self.base_dir.exists() {
            return Ok(Vec::new());
        }

        let mut entries = fs::read_dir(&self.base_dir)
            .await
            .map_err(|e| StateError::backend(format!("Failed to read state directory: {e}")))?;

        let mut environments = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StateError::backend(format!("Failed to read state directory: {e}")))?
        {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == STATE_EXTENSION)
                && let Some(stem) = path.file_stem()
            {
                environments.push(stem.to_string_lossy().to_string());
            }
        }

        environments.sort();
        Ok(environments)
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }
}
