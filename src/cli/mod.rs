//! CLI module for the Terraplane deployment tool.
//!
//! This module provides the command-line interface for driving
//! deployments across environments.

mod approver;
mod commands;
mod output;

pub use approver::TerminalApprover;
pub use commands::{Cli, Commands, EnvironmentArg, OutputFormat, StateCommands};
pub use output::OutputFormatter;
