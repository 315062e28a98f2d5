//! Normalized plan types.
//!
//! A [`PlanSummary`] is the tool-independent view of a plan: which resource
//! addresses change and how. It is produced once per plan run and never
//! mutated afterwards.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Action a plan takes on a single resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeAction {
    /// Resource will be created.
    Create,
    /// Resource will be updated in place.
    Update,
    /// Resource will be destroyed and created again.
    Replace,
    /// Resource will be destroyed.
    Delete,
}

/// A single resource change in a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceChange {
    /// Resource address (e.g. `aws_instance.web[0]`).
    pub address: String,
    /// Planned action.
    pub action: ChangeAction,
    /// True when the change destroys and recreates the resource.
    pub is_destructive: bool,
}

/// Normalized summary of one plan run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanSummary {
    /// Resources to create.
    pub to_add: usize,
    /// Resources to update in place.
    pub to_change: usize,
    /// Resources to replace.
    pub to_replace: usize,
    /// Resources to destroy.
    pub to_destroy: usize,
    /// Changes ordered by address.
    pub changes: Vec<ResourceChange>,
    /// SHA-256 of the raw tool output this summary was parsed from.
    pub raw_checksum: String,
}

impl ChangeAction {
    /// Returns true if the action recreates the resource.
    #[must_use]
    pub const fn is_destructive(self) -> bool {
        matches!(self, Self::Replace)
    }

    /// Short symbol in the style of the provisioning tool's diff output.
    #[must_use]
    pub const fn symbol(self) -> &'static str {
        match self {
            Self::Create => "+",
            Self::Update => "~",
            Self::Replace => "-/+",
            Self::Delete => "-",
        }
    }
}

impl ResourceChange {
    /// Creates a change with destructiveness derived from the action.
    #[must_use]
    pub fn new(address: impl Into<String>, action: ChangeAction) -> Self {
        Self {
            address: address.into(),
            action,
            is_destructive: action.is_destructive(),
        }
    }

    /// Resource type portion of the address, ignoring module prefixes and
    /// instance keys (`module.app.aws_instance.web[0]` → `aws_instance`).
    #[must_use]
    pub fn resource_type(&self) -> &str {
        let mut parts: &[&str] = &self.address.split('.').collect::<Vec<_>>();
        while parts.len() > 2 && parts[0] == "module" {
            parts = &parts[2..];
        }
        let index = usize::from(parts.first() == Some(&"data"));
        parts.get(index).copied().unwrap_or_default()
    }
}

impl PlanSummary {
    /// Builds a summary from a change list, sorting by address and deriving
    /// the counts from the actions.
    #[must_use]
    pub fn from_changes(mut changes: Vec<ResourceChange>, raw_checksum: String) -> Self {
        changes.sort_by(|a, b| a.address.cmp(&b.address));

        let count = |action: ChangeAction| changes.iter().filter(|c| c.action == action).count();

        Self {
            to_add: count(ChangeAction::Create),
            to_change: count(ChangeAction::Update),
            to_replace: count(ChangeAction::Replace),
            to_destroy: count(ChangeAction::Delete),
            raw_checksum,
            changes,
        }
    }

    /// Returns an empty summary for a plan with no changes.
    #[must_use]
    pub fn empty(raw_checksum: String) -> Self {
        Self::from_changes(Vec::new(), raw_checksum)
    }

    /// Returns true if the plan changes anything.
    #[must_use]
    pub const fn has_changes(&self) -> bool {
        !self.changes.is_empty()
    }

    /// Returns true if any change is destructive.
    #[must_use]
    pub fn has_destructive(&self) -> bool {
        self.changes.iter().any(|c| c.is_destructive)
    }

    /// Total number of changes.
    #[must_use]
    pub const fn total(&self) -> usize {
        self.changes.len()
    }

    /// Number of resources of the given types the plan creates.
    ///
    /// Replacements are not counted since they keep the resource count.
    #[must_use]
    pub fn planned_creates_of(&self, resource_types: &[String]) -> usize {
        self.changes
            .iter()
            .filter(|c| c.action == ChangeAction::Create)
            .filter(|c| resource_types.iter().any(|t| t == c.resource_type()))
            .count()
    }

    /// Hash of the normalized change list.
    ///
    /// Unlike `raw_checksum`, this ignores log timestamps and message text,
    /// so two plans computing the same changes share a fingerprint.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for change in &self.changes {
            hasher.update(change.address.as_bytes());
            hasher.update([0u8]);
            hasher.update(change.action.symbol().as_bytes());
            hasher.update([u8::from(change.is_destructive)]);
        }
        hex::encode(hasher.finalize())
    }
}

impl std::fmt::Display for ChangeAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let action = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Replace => "replace",
            Self::Delete => "delete",
        };
        write!(f, "{action}")
    }
}

impl std::fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if !self.has_changes() {
            return write!(f, "No changes");
        }
        write!(
            f,
            "{} to add, {} to change, {} to replace, {} to destroy",
            self.to_add, self.to_change, self.to_replace, self.to_destroy
        )
    }
}
