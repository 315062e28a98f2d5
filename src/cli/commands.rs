//! CLI command definitions.
//!
//! This module defines all CLI commands and their arguments using clap.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::config::CONFIG_ENV_VAR;
use crate::orchestrator::OperationKind;

/// Terraplane - multi-environment infrastructure deployment orchestrator.
#[derive(Parser, Debug)]
#[command(name = "terraplane")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, global = true, env = CONFIG_ENV_VAR)]
    pub config: Option<PathBuf>,

    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines on stderr.
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Output format (text, json).
    #[arg(long, global = true, default_value = "text")]
    pub output: OutputFormat,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Environment selector shared by most commands.
#[derive(Args, Debug, Clone)]
pub struct EnvironmentArg {
    /// Target environment.
    #[arg(short, long = "env", visible_alias = "environment", value_name = "ENV")]
    pub environment: String,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize an environment's working directory.
    Init {
        /// Target environment.
        #[command(flatten)]
        env: EnvironmentArg,
    },

    /// Initialize and validate an environment.
    Validate {
        /// Target environment.
        #[command(flatten)]
        env: EnvironmentArg,
    },

    /// Compute and display the plan for an environment.
    Plan {
        /// Target environment.
        #[command(flatten)]
        env: EnvironmentArg,
    },

    /// Plan and apply changes to an environment.
    Deploy {
        /// Target environment.
        #[command(flatten)]
        env: EnvironmentArg,

        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,
    },

    /// Destroy all resources of an environment.
    Destroy {
        /// Target environment.
        #[command(flatten)]
        env: EnvironmentArg,

        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,
    },

    /// Show an environment's outputs.
    Output {
        /// Target environment.
        #[command(flatten)]
        env: EnvironmentArg,

        /// Print only this output value.
        name: Option<String>,
    },

    /// Show environment status.
    Status {
        /// Environment to show (all environments if omitted).
        #[arg(short, long = "env", visible_alias = "environment", value_name = "ENV")]
        environment: Option<String>,
    },

    /// Inspect or repair persisted state.
    State {
        /// State subcommand.
        #[command(subcommand)]
        command: StateCommands,
    },
}

/// State management subcommands.
#[derive(Subcommand, Debug)]
pub enum StateCommands {
    /// Show the persisted state record.
    Show {
        /// Target environment.
        #[command(flatten)]
        env: EnvironmentArg,
    },

    /// Clear a lock left behind by an interrupted operation.
    Unlock {
        /// Target environment.
        #[command(flatten)]
        env: EnvironmentArg,

        /// Confirm the environment is not in use (required).
        #[arg(long)]
        force: bool,

        /// Reason recorded in the environment's last outcome.
        #[arg(long, default_value = "lock cleared by operator")]
        reason: String,
    },
}

/// Output format options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// JSON output for scripting.
    Json,
}

impl Cli {
    /// Parses CLI arguments from the command line.
    #[must_use]
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

impl Commands {
    /// The operation and environment this command runs through the
    /// orchestrator, with its pre-approval flag.
    ///
    /// Returns `None` for commands handled outside the pipeline.
    #[must_use]
    pub fn operation(&self) -> Option<(OperationKind, &str, bool)> {
        match self {
            Self::Init { env } => Some((OperationKind::Init, &env.environment, false)),
            Self::Validate { env } => Some((OperationKind::Validate, &env.environment, false)),
            Self::Plan { env } => Some((OperationKind::Plan, &env.environment, false)),
            Self::Deploy { env, yes } => Some((OperationKind::Apply, &env.environment, *yes)),
            Self::Destroy { env, yes } => Some((OperationKind::Destroy, &env.environment, *yes)),
            Self::Output { env, .. } => Some((OperationKind::Output, &env.environment, false)),
            Self::Status { .. } | Self::State { .. } => None,
        }
    }
}
