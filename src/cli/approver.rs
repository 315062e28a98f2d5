//! Interactive approval on the controlling terminal.

use async_trait::async_trait;
use colored::Colorize;
use std::io::{BufRead, Write};
use tracing::warn;

use crate::orchestrator::{ApprovalDecision, ApprovalRequest, Approver, OperationKind};

/// Approver that prompts on stderr and reads the answer from stdin.
///
/// Applies ask `[y/N]`. Destroys require typing `destroy`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalApprover;

#[async_trait]
impl Approver for TerminalApprover {
    async fn request_approval(&self, request: &ApprovalRequest) -> ApprovalDecision {
        let prompt = prompt_for(request);
        let operation = request.operation;

        // Reading stdin blocks; the orchestrator may drop this future on
        // cancellation while the read is still pending.
        let answer = tokio::task::spawn_blocking(move || ask(&prompt)).await;

        match answer {
            Ok(Ok(Some(input))) => decide(operation, &input),
            Ok(Ok(None)) => {
                warn!(environment = %request.environment, "No input available for confirmation");
                ApprovalDecision::Unavailable
            }
            Ok(Err(e)) => {
                warn!(environment = %request.environment, "Could not read confirmation: {e}");
                ApprovalDecision::Unavailable
            }
            Err(e) => {
                warn!(environment = %request.environment, "Confirmation prompt failed: {e}");
                ApprovalDecision::Unavailable
            }
        }
    }
}

fn prompt_for(request: &ApprovalRequest) -> String {
    let mut prompt = format!(
        "\nEnvironment '{}': {}\n",
        request.environment.bold(),
        request.plan
    );

    if request.plan.has_destructive() {
        prompt.push_str(&format!(
            "{} This plan replaces existing resources.\n",
            "⚠".yellow()
        ));
    }

    if request.operation == OperationKind::Destroy {
        prompt.push_str(&format!(
            "\nThis action is IRREVERSIBLE. Type 'destroy' to destroy '{}': ",
            request.environment
        ));
    } else {
        prompt.push_str("Do you want to apply this plan? [y/N]: ");
    }

    prompt
}

/// Prints `prompt` and reads one line. `None` means stdin is closed.
fn ask(prompt: &str) -> std::io::Result<Option<String>> {
    let mut stderr = std::io::stderr().lock();
    stderr.write_all(prompt.as_bytes())?;
    stderr.flush()?;

    let mut input = String::new();
    let read = std::io::stdin().lock().read_line(&mut input)?;
    Ok((read > 0).then_some(input))
}

fn decide(operation: OperationKind, input: &str) -> ApprovalDecision {
    let input = input.trim();
    let approved = if operation == OperationKind::Destroy {
        input == "destroy"
    } else {
        input.eq_ignore_ascii_case("y") || input.eq_ignore_ascii_case("yes")
    };

    if approved {
        ApprovalDecision::Approved
    } else {
        ApprovalDecision::Rejected
    }
}
