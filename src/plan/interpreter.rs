//! Plan output interpreter.
//!
//! Parses the provisioning tool's machine-readable output into normalized
//! summaries. Two input shapes are understood:
//!
//! - the newline-delimited JSON UI stream written by `plan -json`
//!   (`planned_change` records), and
//! - a single JSON plan document as written by `show -json`
//!   (`resource_changes`).
//!
//! Unknown record types and fields are ignored so newer tool versions keep
//! working.

use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::error::{PipelineError, Result};

use super::outputs::ApplyOutputs;
use super::summary::{ChangeAction, PlanSummary, ResourceChange};

/// Placeholder stored instead of sensitive output values.
pub const REDACTED: &str = "<sensitive>";

/// Interpreter for plan and apply output.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlanInterpreter;

/// One record of the JSON UI stream.
#[derive(Debug, Deserialize)]
struct UiRecord {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    change: Option<UiChange>,
    #[serde(default)]
    hook: Option<UiHook>,
    #[serde(default)]
    outputs: Option<BTreeMap<String, OutputValue>>,
}

#[derive(Debug, Deserialize)]
struct UiChange {
    resource: UiResource,
    action: String,
}

#[derive(Debug, Deserialize)]
struct UiResource {
    addr: String,
}

#[derive(Debug, Deserialize)]
struct UiHook {
    resource: UiResource,
    #[serde(default)]
    id_value: Option<String>,
}

/// A value from an `outputs` record or `output -json` document.
#[derive(Debug, Deserialize)]
struct OutputValue {
    #[serde(default)]
    sensitive: bool,
    #[serde(default)]
    value: Value,
}

/// Single-document plan representation.
#[derive(Debug, Deserialize)]
struct PlanDocument {
    #[serde(default)]
    resource_changes: Vec<DocumentChange>,
}

#[derive(Debug, Deserialize)]
struct DocumentChange {
    address: String,
    change: DocumentActions,
}

#[derive(Debug, Deserialize)]
struct DocumentActions {
    #[serde(default)]
    actions: Vec<String>,
}

/// Accumulates per-address action flags so that separate delete and create
/// records for one address merge into a replacement.
#[derive(Debug, Default, Clone, Copy)]
struct AddressActions {
    create: bool,
    update: bool,
    delete: bool,
    replace: bool,
}

impl PlanInterpreter {
    /// Creates a new interpreter.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Parses raw plan output into a summary.
    ///
    /// # Errors
    ///
    /// Returns a `Parse` pipeline error when the output is not well-formed
    /// structured data.
    pub fn parse(&self, raw: &str) -> Result<PlanSummary> {
        let checksum = checksum(raw);
        let trimmed = raw.trim();

        if trimmed.is_empty() {
            return Err(parse_error("plan output is empty"));
        }

        let actions = if is_single_document(trimmed) {
            Self::parse_document(trimmed)?
        } else {
            Self::parse_stream(trimmed)?
        };

        let changes: Vec<ResourceChange> = actions
            .into_iter()
            .filter_map(|(address, flags)| flags.resolve().map(|a| ResourceChange::new(address, a)))
            .collect();

        let summary = PlanSummary::from_changes(changes, checksum);
        debug!("Parsed plan: {summary}");
        Ok(summary)
    }

    /// Extracts resource identifiers and output values from apply or
    /// destroy output.
    ///
    /// Malformed lines are skipped: the apply has already happened and the
    /// outputs are informational.
    #[must_use]
    pub fn parse_apply(&self, raw: &str) -> ApplyOutputs {
        let mut outputs = ApplyOutputs::default();

        for (number, line) in raw.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let record: UiRecord = match serde_json::from_str(line) {
                Ok(record) => record,
                Err(e) => {
                    warn!("Skipping unparseable apply output line {}: {e}", number + 1);
                    continue;
                }
            };

            match record.kind.as_str() {
                "apply_complete" => {
                    if let Some(UiHook {
                        resource,
                        id_value: Some(id),
                    }) = record.hook
                    {
                        outputs.resources.insert(resource.addr, id);
                    }
                }
                "outputs" => {
                    if let Some(values) = record.outputs {
                        outputs.values = redact(values);
                    }
                }
                _ => {}
            }
        }

        outputs
    }

    /// Parses an `output -json` document into output values.
    ///
    /// # Errors
    ///
    /// Returns a `Parse` pipeline error when the document is malformed.
    pub fn parse_outputs(&self, raw: &str) -> Result<BTreeMap<String, Value>> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Ok(BTreeMap::new());
        }

        let values: BTreeMap<String, OutputValue> = serde_json::from_str(trimmed)
            .map_err(|e| parse_error(format!("invalid output document: {e}")))?;

        Ok(redact(values))
    }

    fn parse_stream(raw: &str) -> Result<BTreeMap<String, AddressActions>> {
        let mut actions: BTreeMap<String, AddressActions> = BTreeMap::new();

        for (number, line) in raw.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let record: UiRecord = serde_json::from_str(line)
                .map_err(|e| parse_error(format!("line {}: {e}", number + 1)))?;

            if record.kind != "planned_change" {
                continue;
            }

            let Some(change) = record.change else {
                return Err(parse_error(format!(
                    "line {}: planned_change without change",
                    number + 1
                )));
            };

            actions
                .entry(change.resource.addr)
                .or_default()
                .record(&change.action);
        }

        Ok(actions)
    }

    fn parse_document(raw: &str) -> Result<BTreeMap<String, AddressActions>> {
        let document: PlanDocument = serde_json::from_str(raw)
            .map_err(|e| parse_error(format!("invalid plan document: {e}")))?;

        let mut actions: BTreeMap<String, AddressActions> = BTreeMap::new();
        for change in document.resource_changes {
            let entry = actions.entry(change.address).or_default();
            for action in &change.change.actions {
                entry.record(action);
            }
        }

        Ok(actions)
    }
}

impl AddressActions {
    fn record(&mut self, action: &str) {
        match action {
            "create" => self.create = true,
            "update" => self.update = true,
            "delete" => self.delete = true,
            "replace" => self.replace = true,
            // no-op, read, move, import, forget and future actions do not
            // mutate infrastructure.
            _ => {}
        }
    }

    /// Folds the recorded flags into a single action, if any.
    const fn resolve(self) -> Option<ChangeAction> {
        if self.replace || (self.delete && self.create) {
            Some(ChangeAction::Replace)
        } else if self.delete {
            Some(ChangeAction::Delete)
        } else if self.create {
            Some(ChangeAction::Create)
        } else if self.update {
            Some(ChangeAction::Update)
        } else {
            None
        }
    }
}

/// A single document spans the whole input; a stream has one object per
/// line.
fn is_single_document(trimmed: &str) -> bool {
    serde_json::from_str::<Value>(trimmed)
        .ok()
        .and_then(|v| v.as_object().map(|o| o.contains_key("resource_changes") || !o.contains_key("type")))
        .unwrap_or(false)
}

fn redact(values: BTreeMap<String, OutputValue>) -> BTreeMap<String, Value> {
    values
        .into_iter()
        .map(|(name, output)| {
            let value = if output.sensitive {
                Value::String(String::from(REDACTED))
            } else {
                output.value
            };
            (name, value)
        })
        .collect()
}

fn checksum(raw: &str) -> String {
    hex::encode(Sha256::digest(raw.as_bytes()))
}

fn parse_error(message: impl Into<String>) -> crate::error::TerraplaneError {
    PipelineError::Parse {
        message: message.into(),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const STREAM: &str = r#"{"@level":"info","@message":"Terraform 1.7.0","@timestamp":"2026-01-01T00:00:00Z","type":"version","terraform":"1.7.0","ui":"1.2"}
{"@level":"info","@message":"aws_instance.web: Plan to create","type":"planned_change","change":{"resource":{"addr":"aws_instance.web","resource_type":"aws_instance"},"action":"create"}}
{"@level":"info","@message":"aws_s3_bucket.logs: Plan to update","type":"planned_change","change":{"resource":{"addr":"aws_s3_bucket.logs"},"action":"update","extra":"ignored"}}
{"@level":"info","@message":"Plan: 1 to add, 1 to change, 0 to destroy.","type":"change_summary","changes":{"add":1,"change":1,"remove":0,"operation":"plan"}}
"#;

    #[test]
    fn test_parse_stream() {
        let summary = PlanInterpreter::new().parse(STREAM).expect("valid stream");

        assert_eq!(summary.to_add, 1);
        assert_eq!(summary.to_change, 1);
        assert_eq!(summary.to_destroy, 0);
        assert!(!summary.has_destructive());
        assert_eq!(summary.changes[0].address, "aws_instance.web");
    }

    #[test]
    fn test_replace_is_destructive() {
        let raw = r#"{"type":"planned_change","change":{"resource":{"addr":"aws_instance.db"},"action":"replace","reason":"cannot_update"}}"#;
        let summary = PlanInterpreter::new().parse(raw).expect("valid stream");

        assert_eq!(summary.to_replace, 1);
        assert!(summary.changes[0].is_destructive);
    }

    #[test]
    fn test_delete_and_create_merge_into_replace() {
        let raw = r#"{"type":"planned_change","change":{"resource":{"addr":"aws_instance.db"},"action":"delete"}}
{"type":"planned_change","change":{"resource":{"addr":"aws_instance.other"},"action":"delete"}}
{"type":"planned_change","change":{"resource":{"addr":"aws_instance.db"},"action":"create"}}"#;
        let summary = PlanInterpreter::new().parse(raw).expect("valid stream");

        assert_eq!(summary.total(), 2);
        assert_eq!(summary.to_replace, 1);
        assert_eq!(summary.to_destroy, 1);
        assert_eq!(summary.changes[0].address, "aws_instance.db");
        assert!(summary.changes[0].is_destructive);
        assert!(!summary.changes[1].is_destructive);
    }

    #[test]
    fn test_parse_document() {
        let raw = r#"{
  "format_version": "1.2",
  "resource_changes": [
    {"address": "aws_instance.a", "change": {"actions": ["delete", "create"]}},
    {"address": "aws_instance.b", "change": {"actions": ["create", "delete"]}},
    {"address": "aws_vpc.main", "change": {"actions": ["no-op"]}},
    {"address": "data.aws_ami.ubuntu", "change": {"actions": ["read"]}},
    {"address": "aws_subnet.a", "change": {"actions": ["create"]}}
  ]
}"#;
        let summary = PlanInterpreter::new().parse(raw).expect("valid document");

        assert_eq!(summary.to_replace, 2);
        assert_eq!(summary.to_add, 1);
        assert_eq!(summary.total(), 3);
    }

    #[test]
    fn test_empty_document_has_no_changes() {
        let summary = PlanInterpreter::new()
            .parse(r#"{"format_version": "1.2"}"#)
            .expect("valid document");
        assert!(!summary.has_changes());
    }

    #[test]
    fn test_malformed_output_is_parse_error() {
        let raw = "{\"type\":\"version\"}\nnot json at all\n";
        let result = PlanInterpreter::new().parse(raw);

        assert!(matches!(
            result,
            Err(crate::error::TerraplaneError::Pipeline(PipelineError::Parse { .. }))
        ));
    }

    #[test]
    fn test_empty_output_is_parse_error() {
        assert!(PlanInterpreter::new().parse("  \n").is_err());
    }

    #[test]
    fn test_parse_apply_extracts_ids_and_outputs() {
        let raw = r#"{"type":"apply_start","hook":{"resource":{"addr":"aws_instance.web"},"action":"create"}}
{"type":"apply_complete","hook":{"resource":{"addr":"aws_instance.web"},"action":"create","id_key":"id","id_value":"i-0abc","elapsed_seconds":30}}
garbage line
{"type":"outputs","outputs":{"endpoint":{"sensitive":false,"type":"string","value":"web.example.com"},"db_password":{"sensitive":true,"type":"string","value":"hunter2"}}}"#;
        let outputs = PlanInterpreter::new().parse_apply(raw);

        assert_eq!(outputs.resources.get("aws_instance.web").map(String::as_str), Some("i-0abc"));
        assert_eq!(outputs.values["endpoint"], Value::String(String::from("web.example.com")));
        assert_eq!(outputs.values["db_password"], Value::String(String::from(REDACTED)));
    }

    #[test]
    fn test_parse_outputs_document() {
        let raw = r#"{"vpc_id":{"sensitive":false,"type":"string","value":"vpc-123"}}"#;
        let values = PlanInterpreter::new().parse_outputs(raw).expect("valid outputs");
        assert_eq!(values["vpc_id"], Value::String(String::from("vpc-123")));
    }

    fn action_strategy() -> impl Strategy<Value = &'static str> {
        prop::sample::select(vec!["create", "update", "delete", "replace", "no-op", "read"])
    }

    proptest! {
        /// Property: counts always partition the change list.
        #[test]
        fn prop_counts_partition_changes(
            records in prop::collection::vec((0usize..8, action_strategy()), 0..40)
        ) {
            let raw: String = records
                .iter()
                .map(|(addr, action)| format!(
                    "{{\"type\":\"planned_change\",\"change\":{{\"resource\":{{\"addr\":\"aws_instance.r{addr}\"}},\"action\":\"{action}\"}}}}\n"
                ))
                .collect();
            let raw = format!("{{\"type\":\"version\"}}\n{raw}");

            let summary = PlanInterpreter::new().parse(&raw).expect("generated stream is valid");
            let by = |action| summary.changes.iter().filter(|c| c.action == action).count();

            prop_assert_eq!(summary.to_add, by(ChangeAction::Create));
            prop_assert_eq!(summary.to_change, by(ChangeAction::Update));
            prop_assert_eq!(summary.to_replace, by(ChangeAction::Replace));
            prop_assert_eq!(summary.to_destroy, by(ChangeAction::Delete));
            prop_assert_eq!(
                summary.to_add + summary.to_change + summary.to_replace + summary.to_destroy,
                summary.total()
            );
        }

        /// Property: parsing the same output twice yields identical summaries.
        #[test]
        fn prop_parse_is_idempotent(
            records in prop::collection::vec((0usize..8, action_strategy()), 1..20)
        ) {
            let raw: String = records
                .iter()
                .map(|(addr, action)| format!(
                    "{{\"type\":\"planned_change\",\"change\":{{\"resource\":{{\"addr\":\"mod.r{addr}\"}},\"action\":\"{action}\"}}}}\n"
                ))
                .collect();

            let interpreter = PlanInterpreter::new();
            let first = interpreter.parse(&raw).expect("valid");
            let second = interpreter.parse(&raw).expect("valid");

            prop_assert_eq!(first.fingerprint(), second.fingerprint());
            prop_assert_eq!(first, second);
        }
    }
}
