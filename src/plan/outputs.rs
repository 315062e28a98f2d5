//! Captured apply outputs.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Resource identifiers and output values captured after a mutation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApplyOutputs {
    /// Provider-assigned identifiers keyed by resource address.
    #[serde(default)]
    pub resources: BTreeMap<String, String>,
    /// Output values keyed by name, with sensitive values redacted.
    #[serde(default)]
    pub values: BTreeMap<String, Value>,
}

impl ApplyOutputs {
    /// Returns true if nothing was captured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty() && self.values.is_empty()
    }

    /// Looks up a single output value.
    #[must_use]
    pub fn value(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }
}
