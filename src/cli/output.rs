//! Output formatting for CLI commands.
//!
//! This module provides formatting utilities for displaying
//! information to the user in various formats.

use colored::Colorize;
use serde_json::Value;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::error::TerraplaneError;
use crate::orchestrator::{ExecutionResult, ExecutionStatus, StageOutcome};
use crate::plan::{ApplyOutputs, ChangeAction, PlanSummary};
use crate::runner::{OutputLine, OutputStream};
use crate::state::{EnvironmentState, HolderStatus, LastOutcome, OutcomeResult, Phase, StaleLockReport};

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Planned change row for table display.
#[derive(Tabled)]
struct ChangeRow {
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Resource")]
    resource: String,
}

/// Stage row for table display.
#[derive(Tabled)]
struct StageRow {
    #[tabled(rename = "Stage")]
    stage: String,
    #[tabled(rename = "Result")]
    result: String,
    #[tabled(rename = "Exit")]
    exit_code: String,
    #[tabled(rename = "Duration")]
    duration: String,
}

/// Environment status row for table display.
#[derive(Tabled)]
struct StatusRow {
    #[tabled(rename = "Environment")]
    environment: String,
    #[tabled(rename = "Phase")]
    phase: String,
    #[tabled(rename = "Last operation")]
    last_operation: String,
    #[tabled(rename = "Updated")]
    updated: String,
    #[tabled(rename = "Lock")]
    lock: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// The selected format.
    #[must_use]
    pub const fn format(&self) -> OutputFormat {
        self.format
    }

    /// Formats the result of one operation.
    #[must_use]
    pub fn format_result(&self, result: &ExecutionResult) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(result).unwrap_or_default(),
            OutputFormat::Text => Self::format_result_text(result),
        }
    }

    fn format_result_text(result: &ExecutionResult) -> String {
        let mut output = String::new();

        let _ = write!(
            output,
            "\n{} {} ({})\n",
            result.request.operation.to_string().bold(),
            result.request.environment.bold(),
            result.request.correlation_id.dimmed()
        );

        if let Some(prior) = &result.prior_failure {
            let _ = writeln!(
                output,
                "{} Environment was left failed by {}",
                "⚠".yellow(),
                Self::describe_outcome(prior)
            );
        }

        if let Some(plan) = &result.plan {
            output.push('\n');
            output.push_str(&Self::format_plan_text(plan));
        }

        if !result.stages.is_empty() {
            output.push('\n');
            output.push_str(&Self::format_stages(&result.stages));
            output.push('\n');
        }

        if let Some(outputs) = &result.outputs
            && !outputs.is_empty()
        {
            output.push('\n');
            output.push_str(&Self::format_outputs_text(outputs));
        }

        output.push('\n');
        match &result.status {
            ExecutionStatus::Succeeded => {
                let _ = writeln!(
                    output,
                    "{} {} succeeded, environment is {}",
                    "✓".green(),
                    result.request.operation,
                    Self::format_phase(result.final_phase)
                );
            }
            ExecutionStatus::Aborted { reason } => {
                let _ = writeln!(output, "{} Aborted: {reason}", "⚠".yellow());
            }
            ExecutionStatus::Failed => {
                let _ = writeln!(output, "{} {} failed", "✗".red(), result.request.operation);
                if let Some(failure) = &result.failure {
                    let _ = writeln!(output, "   Stage: {}", failure.stage);
                    let _ = writeln!(output, "   Error: {}", failure.message);
                    if failure.retryable {
                        let _ = writeln!(output, "   This failure may succeed on retry.");
                    }
                }
            }
        }

        output
    }

    /// Formats a plan summary as text.
    fn format_plan_text(plan: &PlanSummary) -> String {
        if !plan.has_changes() {
            return format!("{} No changes. Infrastructure is up to date.\n", "✓".green());
        }

        let mut output = String::new();

        let rows: Vec<ChangeRow> = plan
            .changes
            .iter()
            .map(|c| ChangeRow {
                action: Self::format_action(c.action),
                resource: Self::truncate(&c.address, 60),
            })
            .collect();

        output.push_str(&Table::new(rows).to_string());
        output.push('\n');

        let _ = write!(
            output,
            "\nPlan: {} to add, {} to change, {} to replace, {} to destroy\n",
            plan.to_add.to_string().green(),
            plan.to_change.to_string().yellow(),
            plan.to_replace.to_string().magenta(),
            plan.to_destroy.to_string().red()
        );

        if plan.has_destructive() {
            let _ = writeln!(output, "{} Plan contains destructive changes", "⚠".yellow());
        }

        output
    }

    fn format_stages(stages: &[StageOutcome]) -> String {
        let rows: Vec<StageRow> = stages
            .iter()
            .map(|s| StageRow {
                stage: s.stage.to_string(),
                result: if s.success {
                    "ok".green().to_string()
                } else {
                    s.note.as_deref().unwrap_or("failed").red().to_string()
                },
                exit_code: s.exit_code.map_or_else(|| String::from("-"), |c| c.to_string()),
                duration: format!("{:.1}s", Self::seconds(s.duration_ms)),
            })
            .collect();

        Table::new(rows).to_string()
    }

    /// Renders one line of live tool output, if it is worth showing.
    ///
    /// Structured stdout records are reduced to their `@message` field.
    /// Records without one are skipped.
    #[must_use]
    pub fn progress_line(line: &OutputLine) -> Option<String> {
        let text = line.line.trim();
        if text.is_empty() {
            return None;
        }

        match line.stream {
            OutputStream::Stderr => Some(text.to_string()),
            OutputStream::Stdout => match serde_json::from_str::<Value>(text) {
                Ok(record) => record
                    .get("@message")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                Err(_) => Some(text.to_string()),
            },
        }
    }

    /// Formats the status of several environments.
    #[must_use]
    pub fn format_status(&self, states: &[EnvironmentState]) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(states).unwrap_or_default(),
            OutputFormat::Text => {
                if states.is_empty() {
                    return String::from("   No environments configured.\n");
                }

                let rows: Vec<StatusRow> = states
                    .iter()
                    .map(|s| StatusRow {
                        environment: s.environment.clone(),
                        phase: Self::format_phase(s.phase),
                        last_operation: s
                            .last_outcome
                            .as_ref()
                            .map_or_else(|| String::from("-"), Self::describe_outcome),
                        updated: s.updated_at.format("%Y-%m-%d %H:%M").to_string(),
                        lock: s.lock.as_ref().map_or_else(
                            || String::from("-"),
                            |l| format!("{} ({})", l.operation, Self::truncate(&l.correlation_id, 8)),
                        ),
                    })
                    .collect();

                let mut output = Table::new(rows).to_string();
                output.push('\n');
                output
            }
        }
    }

    /// Formats one persisted state record.
    #[must_use]
    pub fn format_state(&self, state: &EnvironmentState) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(state).unwrap_or_default(),
            OutputFormat::Text => {
                let mut output = String::new();

                let _ = write!(output, "\nState: {}\n\n", state.environment.bold());
                let _ = writeln!(output, "   Version: {}", state.version);
                let _ = writeln!(output, "   Phase: {}", Self::format_phase(state.phase));
                let _ = writeln!(output, "   Last updated: {}", state.updated_at);

                if let Some(outcome) = &state.last_outcome {
                    let _ = writeln!(output, "   Last outcome: {}", Self::describe_outcome(outcome));
                    if let Some(summary) = &outcome.error_summary {
                        let _ = writeln!(output, "     {summary}");
                    }
                }

                if let Some(lock) = &state.lock {
                    let _ = writeln!(
                        output,
                        "   Lock: {} {} held by {} since {}",
                        lock.operation, lock.correlation_id, lock.holder, lock.acquired_at
                    );
                }

                let _ = writeln!(output, "   Resources: {}", state.outputs.resources.len());

                if !state.transitions.is_empty() {
                    let _ = writeln!(output, "\n   Recent transitions ({}):", state.transitions.len());
                    for t in state.transitions.iter().rev().take(5) {
                        let _ = writeln!(
                            output,
                            "     {} {} -> {}{}",
                            t.at.format("%Y-%m-%d %H:%M:%S"),
                            t.from,
                            t.to,
                            t.note.as_deref().map(|n| format!(" ({n})")).unwrap_or_default()
                        );
                    }
                }

                output
            }
        }
    }

    /// Formats captured outputs.
    #[must_use]
    pub fn format_outputs(&self, outputs: &ApplyOutputs) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(outputs).unwrap_or_default(),
            OutputFormat::Text => Self::format_outputs_text(outputs),
        }
    }

    fn format_outputs_text(outputs: &ApplyOutputs) -> String {
        let mut output = String::new();

        if !outputs.values.is_empty() {
            output.push_str("Outputs:\n");
            for (name, value) in &outputs.values {
                let _ = writeln!(output, "   {name} = {}", Self::render_value(value));
            }
        }

        if !outputs.resources.is_empty() {
            output.push_str("Resources:\n");
            for (address, id) in &outputs.resources {
                let _ = writeln!(output, "   {address} -> {id}");
            }
        }

        output
    }

    /// Formats a single output value.
    #[must_use]
    pub fn format_value(&self, value: &Value) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(value).unwrap_or_default(),
            OutputFormat::Text => format!("{}\n", Self::render_value(value)),
        }
    }

    /// Formats warnings for persisted locks found at startup.
    #[must_use]
    pub fn format_stale_locks(reports: &[StaleLockReport]) -> String {
        let mut output = String::new();
        for report in reports {
            let _ = match report.holder {
                HolderStatus::Remote => writeln!(
                    output,
                    "{} Environment '{}' is locked by {} {} on host {} (phase {}). Its liveness cannot be verified from this host; unlock it only once that run is known to be gone.",
                    "⚠".yellow(),
                    report.environment,
                    report.lock.operation,
                    report.lock.correlation_id,
                    report.lock.hostname,
                    report.phase
                ),
                HolderStatus::Exited | HolderStatus::Running => writeln!(
                    output,
                    "{} Environment '{}' has a stale {} lock from {} (phase {}). Run `terraplane state unlock -e {} --force` once it is safe.",
                    "⚠".yellow(),
                    report.environment,
                    report.lock.operation,
                    report.lock.correlation_id,
                    report.phase,
                    report.environment
                ),
            };
        }
        output
    }

    /// Formats a warning for persisted records of unregistered environments.
    #[must_use]
    pub fn format_untracked(names: &[String]) -> String {
        if names.is_empty() {
            return String::new();
        }
        format!(
            "{} State records exist for environments not in the configuration: {}\n",
            "⚠".yellow(),
            names.join(", ")
        )
    }

    /// Formats an error.
    #[must_use]
    pub fn format_error(&self, error: &TerraplaneError) -> String {
        match self.format {
            OutputFormat::Json => {
                let json = serde_json::json!({
                    "status": "error",
                    "exit_code": error.exit_code(),
                    "message": error.to_string(),
                });
                serde_json::to_string_pretty(&json).unwrap_or_default()
            }
            OutputFormat::Text => format!("{} {error}\n", "✗".red()),
        }
    }

    /// Formats a change action with color.
    fn format_action(action: ChangeAction) -> String {
        let label = format!("{}{action}", action.symbol());
        match action {
            ChangeAction::Create => label.green().to_string(),
            ChangeAction::Update => label.yellow().to_string(),
            ChangeAction::Replace => label.magenta().to_string(),
            ChangeAction::Delete => label.red().to_string(),
        }
    }

    /// Formats a phase with color.
    fn format_phase(phase: Phase) -> String {
        match phase {
            Phase::Idle => "idle".green().to_string(),
            Phase::Failed => "failed".red().to_string(),
            Phase::AwaitingApproval => "awaiting approval".yellow().to_string(),
            other => other.to_string().cyan().to_string(),
        }
    }

    fn describe_outcome(outcome: &LastOutcome) -> String {
        let result = match outcome.result {
            OutcomeResult::Success => "succeeded".green(),
            OutcomeResult::Failure => "failed".red(),
            OutcomeResult::Cancelled => "cancelled".red(),
            OutcomeResult::Aborted => "aborted".yellow(),
        };
        format!(
            "{} {result} at {}",
            outcome.operation,
            outcome.finished_at.format("%Y-%m-%d %H:%M")
        )
    }

    fn render_value(value: &Value) -> String {
        match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn seconds(millis: u64) -> f64 {
        millis as f64 / 1000.0
    }

    /// Truncates a string to a maximum number of characters.
    fn truncate(s: &str, max_len: usize) -> String {
        if s.chars().count() <= max_len {
            s.to_string()
        } else {
            let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
            format!("{kept}...")
        }
    }
}
