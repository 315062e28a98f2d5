//! Configuration file model.
//!
//! This module defines the structs that map to the `terraplane.yaml` file.

use serde::de::{self, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::path::PathBuf;
use std::time::Duration;

/// The root configuration structure for a Terraplane project.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProjectFile {
    /// Project-level configuration.
    pub project: ProjectConfig,
    /// Provisioning tool configuration.
    #[serde(default)]
    pub tool: ToolConfig,
    /// State backend configuration.
    #[serde(default)]
    pub state: StateConfig,
    /// Per-stage timeouts.
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    /// Managed environments.
    #[serde(default)]
    pub environments: Vec<EnvironmentConfig>,
}

/// Project-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectConfig {
    /// Project name.
    pub name: String,
}

/// Provisioning tool configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolConfig {
    /// Tool executable (`terraform` or `tofu`).
    #[serde(default = "default_binary")]
    pub binary: String,
    /// Extra arguments appended to `init`.
    #[serde(default)]
    pub init_args: Vec<String>,
}

/// State backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateConfig {
    /// Backend type (local or s3).
    #[serde(default)]
    pub backend: StateBackend,
    /// Local state directory (for local backend).
    #[serde(default)]
    pub path: Option<String>,
    /// S3 bucket name (required for s3 backend).
    #[serde(default)]
    pub bucket: Option<String>,
    /// S3 key prefix (optional).
    #[serde(default)]
    pub prefix: Option<String>,
    /// S3 region (optional, uses AWS default if not specified).
    #[serde(default)]
    pub region: Option<String>,
}

/// State backend types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// Local file-based state storage.
    #[default]
    Local,
    /// AWS S3-based state storage.
    S3,
}

/// Stage timeouts, in seconds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimeoutsConfig {
    /// Timeout for `init`.
    #[serde(default = "default_init_timeout")]
    pub init: u64,
    /// Timeout for `validate`.
    #[serde(default = "default_validate_timeout")]
    pub validate: u64,
    /// Timeout for each `plan` run.
    #[serde(default = "default_plan_timeout")]
    pub plan: u64,
    /// Timeout for `apply`.
    #[serde(default = "default_mutation_timeout")]
    pub apply: u64,
    /// Timeout for `destroy`.
    #[serde(default = "default_mutation_timeout")]
    pub destroy: u64,
    /// Timeout for `output`.
    #[serde(default = "default_validate_timeout")]
    pub output: u64,
    /// Time to wait for an approval decision.
    #[serde(default = "default_approval_timeout")]
    pub approval: u64,
    /// Time between SIGTERM and SIGKILL when a stage is cancelled.
    #[serde(default = "default_grace_period")]
    pub grace_period: u64,
}

/// Configuration for a single environment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnvironmentConfig {
    /// Unique environment name.
    pub name: String,
    /// Infrastructure code directory, relative to the config file.
    pub working_dir: PathBuf,
    /// Deployment policy.
    #[serde(default)]
    pub policy: PolicyConfig,
    /// Variables passed to the tool, in document order.
    #[serde(default)]
    pub variables: VariableSet,
}

/// Per-environment deployment policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PolicyConfig {
    /// Apply without confirmation when the plan has no destructive changes.
    #[serde(default)]
    pub auto_approve: bool,
    /// Reject destroy operations.
    #[serde(default)]
    pub protected: bool,
    /// Upper bound on planned instance creations.
    #[serde(default = "default_max_instances")]
    pub max_instances: u32,
    /// Expected steady-state instance count.
    #[serde(default = "default_desired_capacity")]
    pub desired_capacity: u32,
    /// Resource types counted against `max_instances`.
    #[serde(default = "default_instance_resource_types")]
    pub instance_resource_types: Vec<String>,
}

/// Ordered key/value variables.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VariableSet(Vec<(String, String)>);

const fn default_init_timeout() -> u64 {
    300
}

const fn default_validate_timeout() -> u64 {
    120
}

const fn default_plan_timeout() -> u64 {
    600
}

const fn default_mutation_timeout() -> u64 {
    3600
}

const fn default_approval_timeout() -> u64 {
    900
}

const fn default_grace_period() -> u64 {
    10
}

const fn default_max_instances() -> u32 {
    10
}

const fn default_desired_capacity() -> u32 {
    1
}

fn default_binary() -> String {
    String::from("terraform")
}

fn default_instance_resource_types() -> Vec<String> {
    vec![String::from("aws_instance")]
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            init_args: Vec::new(),
        }
    }
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            backend: StateBackend::Local,
            path: None,
            bucket: None,
            prefix: None,
            region: None,
        }
    }
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            init: default_init_timeout(),
            validate: default_validate_timeout(),
            plan: default_plan_timeout(),
            apply: default_mutation_timeout(),
            destroy: default_mutation_timeout(),
            output: default_validate_timeout(),
            approval: default_approval_timeout(),
            grace_period: default_grace_period(),
        }
    }
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            auto_approve: false,
            protected: false,
            max_instances: default_max_instances(),
            desired_capacity: default_desired_capacity(),
            instance_resource_types: default_instance_resource_types(),
        }
    }
}

impl TimeoutsConfig {
    /// Approval timeout as a duration.
    #[must_use]
    pub const fn approval(&self) -> Duration {
        Duration::from_secs(self.approval)
    }

    /// Grace period as a duration.
    #[must_use]
    pub const fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period)
    }
}

impl StateConfig {
    /// Local state directory, defaulting to `.terraplane`.
    #[must_use]
    pub fn local_path(&self) -> &str {
        self.path.as_deref().unwrap_or(".terraplane")
    }
}

impl VariableSet {
    /// Creates a variable set from ordered pairs.
    #[must_use]
    pub const fn new(vars: Vec<(String, String)>) -> Self {
        Self(vars)
    }

    /// Returns the variables in document order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Looks up a variable by key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    /// Number of variables.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if there are no variables.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Serialize for VariableSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (key, value) in &self.0 {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for VariableSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct VariableSetVisitor;

        impl<'de> Visitor<'de> for VariableSetVisitor {
            type Value = VariableSet;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("a mapping of variable names to scalar values")
            }

            fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
                Ok(VariableSet::default())
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut vars = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((key, value)) = access.next_entry::<String, serde_yaml::Value>()? {
                    let value = match value {
                        serde_yaml::Value::String(s) => s,
                        serde_yaml::Value::Bool(b) => b.to_string(),
                        serde_yaml::Value::Number(n) => n.to_string(),
                        serde_yaml::Value::Null => String::new(),
                        _ => {
                            return Err(de::Error::custom(format!(
                                "variable '{key}' must be a scalar value"
                            )));
                        }
                    };
                    if vars.iter().any(|(k, _): &(String, String)| *k == key) {
                        return Err(de::Error::custom(format!("duplicate variable '{key}'")));
                    }
                    vars.push((key, value));
                }
                Ok(VariableSet(vars))
            }
        }

        deserializer.deserialize_map(VariableSetVisitor)
    }
}
