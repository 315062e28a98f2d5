//! Terraplane CLI entrypoint.
//!
//! This is the main entrypoint for the terraplane command-line tool.

use std::io::{IsTerminal, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use terraplane::cli::{Cli, Commands, OutputFormat, OutputFormatter, StateCommands, TerminalApprover};
use terraplane::config::{EnvironmentRegistry, StateBackend, find_config_file};
use terraplane::error::{Result, TerraplaneError};
use terraplane::orchestrator::{
    Approver, NonInteractiveApprover, OperationKind, OperationRequest, Orchestrator,
    OrchestratorSettings,
};
use terraplane::runner::{OutputLine, TokioProcessRunner};
use terraplane::state::{LocalStateStore, S3StateStore, StateStore, StateTracker};

use colored::Colorize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse_args();

    // Initialize logging
    init_logging(cli.verbose, cli.log_json);

    // Run async runtime
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    let formatter = OutputFormatter::new(cli.output);
    let code = match runtime.block_on(run(cli, &formatter)) {
        Ok(code) => code,
        Err(e) => {
            error!("{e}");
            let rendered = formatter.format_error(&e);
            if formatter.format() == OutputFormat::Json {
                emit(&rendered);
            } else {
                eprint!("{rendered}");
            }
            e.exit_code()
        }
    };

    // A confirmation prompt may still be blocked on stdin after Ctrl-C.
    runtime.shutdown_background();
    ExitCode::from(code)
}

/// Initializes the logging system.
///
/// `RUST_LOG` is honored unless `--verbose` forces debug output.
fn init_logging(verbose: bool, json: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Main async entry point. Returns the process exit code.
async fn run(cli: Cli, formatter: &OutputFormatter) -> Result<u8> {
    let config_file = resolve_config_path(cli.config.as_ref())?;
    debug!("Loading configuration from: {}", config_file.display());

    let registry = Arc::new(EnvironmentRegistry::load(&config_file)?);
    let store = create_state_store(&registry).await?;
    let tracker = Arc::new(StateTracker::new(store));

    report_stale_locks(&tracker, &registry, formatter).await;

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let orchestrator = build_orchestrator(registry, tracker, cli.output, cli.verbose);

    match &cli.command {
        Commands::Status { environment } => {
            cmd_status(&orchestrator, environment.as_deref(), formatter, &cancel).await
        }
        Commands::State { command } => cmd_state(&orchestrator, command, formatter).await,
        Commands::Output {
            env,
            name: Some(name),
        } => cmd_output_value(&orchestrator, &env.environment, name, formatter, &cancel).await,
        command => {
            let (operation, environment, pre_approved) = command
                .operation()
                .ok_or_else(|| TerraplaneError::internal("command has no pipeline operation"))?;
            cmd_execute(&orchestrator, operation, environment, pre_approved, formatter, &cancel).await
        }
    }
}

/// Runs one operation through the pipeline and prints its result.
async fn cmd_execute(
    orchestrator: &Orchestrator,
    operation: OperationKind,
    environment: &str,
    pre_approved: bool,
    formatter: &OutputFormatter,
    cancel: &CancellationToken,
) -> Result<u8> {
    let request = OperationRequest::new(environment, operation).pre_approved(pre_approved);
    info!(
        environment,
        correlation_id = %request.correlation_id,
        "Requested {operation}"
    );

    let result = orchestrator.execute(request, cancel).await?;
    emit(&formatter.format_result(&result));

    Ok(result.exit_code())
}

/// Prints a single output value.
async fn cmd_output_value(
    orchestrator: &Orchestrator,
    environment: &str,
    name: &str,
    formatter: &OutputFormatter,
    cancel: &CancellationToken,
) -> Result<u8> {
    let request = OperationRequest::new(environment, OperationKind::Output);
    let result = orchestrator.execute(request, cancel).await?;

    if !result.is_success() {
        emit(&formatter.format_result(&result));
        return Ok(result.exit_code());
    }

    let value = result
        .outputs
        .as_ref()
        .and_then(|o| o.value(name))
        .ok_or_else(|| TerraplaneError::internal(format!("output '{name}' not found in {environment}")))?;

    emit(&formatter.format_value(value));
    Ok(0)
}

/// Shows status for one or all environments.
async fn cmd_status(
    orchestrator: &Orchestrator,
    environment: Option<&str>,
    formatter: &OutputFormatter,
    cancel: &CancellationToken,
) -> Result<u8> {
    let names = environment.map_or_else(|| orchestrator.registry().names(), |e| vec![e.to_string()]);

    let mut states = Vec::with_capacity(names.len());
    for name in names {
        let result = orchestrator
            .execute(OperationRequest::new(name, OperationKind::Status), cancel)
            .await?;
        if let Some(state) = result.state {
            states.push(state);
        }
    }

    emit(&formatter.format_status(&states));

    if environment.is_none() {
        let known = orchestrator.registry().names();
        match orchestrator.tracker().untracked_records(&known).await {
            Ok(untracked) if !untracked.is_empty() => {
                warn!(environments = ?untracked, "State records without a configured environment");
                if formatter.format() == OutputFormat::Text {
                    eprint!("{}", OutputFormatter::format_untracked(&untracked));
                }
            }
            Ok(_) => {}
            Err(e) => warn!("Could not list state records: {e}"),
        }
    }
    Ok(0)
}

/// State management commands.
async fn cmd_state(orchestrator: &Orchestrator, command: &StateCommands, formatter: &OutputFormatter) -> Result<u8> {
    match command {
        StateCommands::Show { env } => {
            let environment = orchestrator.registry().lookup(&env.environment)?;
            let state = orchestrator.tracker().load_last(&environment.name).await?;
            emit(&formatter.format_state(&state));
        }
        StateCommands::Unlock { env, force, reason } => {
            let environment = orchestrator.registry().lookup(&env.environment)?;
            if !force {
                eprintln!(
                    "Refusing to clear the lock on '{}' without --force. Make sure no operation is running.",
                    environment.name
                );
                return Ok(1);
            }

            let state = orchestrator.tracker().force_release(&environment.name, reason).await?;
            warn!(environment = %environment.name, "Lock cleared by operator: {reason}");
            eprintln!(
                "{} Lock cleared. '{}' is now {} until the next successful deploy.",
                "✓".green(),
                environment.name,
                state.phase
            );
            emit(&formatter.format_state(&state));
        }
    }

    Ok(0)
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Resolves the configuration file path.
fn resolve_config_path(config_path: Option<&PathBuf>) -> Result<PathBuf> {
    config_path.map_or_else(|| find_config_file("."), |path| Ok(path.clone()))
}

/// Creates the state store selected by the configuration.
async fn create_state_store(registry: &EnvironmentRegistry) -> Result<Arc<dyn StateStore>> {
    let state = registry.state();

    let store: Arc<dyn StateStore> = match state.backend {
        StateBackend::Local => Arc::new(LocalStateStore::with_base_dir(registry.local_state_dir())),
        StateBackend::S3 => {
            let bucket = state
                .bucket
                .as_deref()
                .ok_or_else(|| TerraplaneError::internal("S3 bucket not configured"))?;
            Arc::new(S3StateStore::new(bucket, state.prefix.as_deref(), state.region.as_deref()).await?)
        }
    };

    debug!("Using {} state backend", store.backend_type());
    Ok(store)
}

/// Wires the orchestrator with the runner and approver for this session.
fn build_orchestrator(
    registry: Arc<EnvironmentRegistry>,
    tracker: Arc<StateTracker>,
    format: OutputFormat,
    verbose: bool,
) -> Orchestrator {
    let mut runner = TokioProcessRunner::new();
    // Debug logging already echoes every tool line.
    if format == OutputFormat::Text && !verbose {
        let (tx, rx) = mpsc::unbounded_channel();
        runner = runner.with_progress(tx);
        tokio::spawn(print_progress(rx));
    }

    let approver: Arc<dyn Approver> = if std::io::stdin().is_terminal() {
        Arc::new(TerminalApprover)
    } else {
        Arc::new(NonInteractiveApprover)
    };

    let settings = OrchestratorSettings::from_registry(&registry);
    Orchestrator::new(registry, tracker, Arc::new(runner), approver, settings)
}

/// Echoes live tool progress to stderr.
async fn print_progress(mut rx: mpsc::UnboundedReceiver<OutputLine>) {
    while let Some(line) = rx.recv().await {
        if let Some(text) = OutputFormatter::progress_line(&line) {
            eprintln!("  {}", text.dimmed());
        }
    }
}

/// Warns about locks left behind by crashed operations.
async fn report_stale_locks(tracker: &StateTracker, registry: &EnvironmentRegistry, formatter: &OutputFormatter) {
    match tracker.detect_stale_locks(&registry.names()).await {
        Ok(reports) if !reports.is_empty() => {
            for report in &reports {
                warn!(
                    environment = %report.environment,
                    correlation_id = %report.lock.correlation_id,
                    host = %report.lock.hostname,
                    "Unreleased lock from {} in phase {} ({:?} holder)",
                    report.lock.operation,
                    report.phase,
                    report.holder
                );
            }
            if formatter.format() == OutputFormat::Text {
                eprint!("{}", OutputFormatter::format_stale_locks(&reports));
            }
        }
        Ok(_) => {}
        Err(e) => warn!("Could not check for stale locks: {e}"),
    }
}

/// Cancels `cancel` on Ctrl-C or SIGTERM.
fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        warn!("Interrupt received, cancelling the running operation");
        cancel.cancel();
    });
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(e) => {
            debug!("SIGTERM handler unavailable: {e}");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

/// Writes rendered output to stdout.
fn emit(rendered: &str) {
    if let Err(e) = write_stdout(rendered) {
        // A closed pipe (e.g. `| head`) is not worth failing over.
        debug!("Could not write output: {e}");
    }
}

fn write_stdout(rendered: &str) -> std::io::Result<()> {
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(rendered.as_bytes())?;
    if !rendered.ends_with('\n') {
        stdout.write_all(b"\n")?;
    }
    stdout.flush()
}
