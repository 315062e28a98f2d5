//! The deployment state machine.
//!
//! [`Orchestrator::execute`] drives one operation through the fixed
//! `init → validate → plan → gate → apply|destroy` pipeline for a single
//! environment while holding that environment's lock.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{Environment, EnvironmentRegistry};
use crate::error::{PipelineError, PolicyViolation, Result, TerraplaneError};
use crate::plan::{ApplyOutputs, PlanInterpreter, PlanSummary};
use crate::runner::{CancelReason, CommandSpec, ProcessOutcome, ProcessRunner};
use crate::state::{LastOutcome, LockToken, OutcomeResult, Phase, StateTracker};

use super::approver::{ApprovalDecision, ApprovalRequest, Approver};
use super::types::{
    AbortReason, ExecutionResult, ExecutionStatus, Failure, OperationKind, OperationRequest,
    OrchestratorSettings, Stage, StageOutcome,
};

/// How a pipeline run ended.
#[derive(Debug)]
enum Completion {
    Succeeded,
    Aborted(AbortReason),
    Failed(Failure),
}

/// A pipeline step either yields a value or ends the run.
type Step<T> = std::result::Result<T, Completion>;

/// Unwraps a step, returning early when the step ended the run. The `step`
/// form is for functions that themselves return a [`Step`].
macro_rules! proceed {
    (step $step:expr) => {
        match $step? {
            Ok(value) => value,
            Err(completion) => return Ok(Err(completion)),
        }
    };
    ($step:expr) => {
        match $step? {
            Ok(value) => value,
            Err(completion) => return Ok(completion),
        }
    };
}

/// Mutable bookkeeping for one locked run.
struct Run {
    token: LockToken,
    correlation_id: String,
    stages: Vec<StageOutcome>,
    plan: Option<PlanSummary>,
    outputs: Option<ApplyOutputs>,
}

/// Drives operations against registered environments.
pub struct Orchestrator {
    registry: Arc<EnvironmentRegistry>,
    tracker: Arc<StateTracker>,
    runner: Arc<dyn ProcessRunner>,
    approver: Arc<dyn Approver>,
    interpreter: PlanInterpreter,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    /// Creates an orchestrator from its collaborators.
    #[must_use]
    pub fn new(
        registry: Arc<EnvironmentRegistry>,
        tracker: Arc<StateTracker>,
        runner: Arc<dyn ProcessRunner>,
        approver: Arc<dyn Approver>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            registry,
            tracker,
            runner,
            approver,
            interpreter: PlanInterpreter::new(),
            settings,
        }
    }

    /// The environment registry.
    #[must_use]
    pub fn registry(&self) -> &EnvironmentRegistry {
        &self.registry
    }

    /// The state tracker.
    #[must_use]
    pub fn tracker(&self) -> &StateTracker {
        &self.tracker
    }

    /// Executes one operation.
    ///
    /// Stage failures, aborts and cancellations are reported in the
    /// returned [`ExecutionResult`]. Errors are returned for problems
    /// detected before the pipeline starts (unknown environment, held or
    /// stale lock, protected destroy) and for state backend failures.
    ///
    /// # Errors
    ///
    /// Returns `NotFound`, `Policy`, `State` errors as described above.
    pub async fn execute(
        &self,
        request: OperationRequest,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult> {
        let started_at = Utc::now();
        let environment = self.registry.lookup(&request.environment)?;

        match request.operation {
            OperationKind::Status => return self.status(request, environment, started_at).await,
            OperationKind::Destroy if environment.policy.protected => {
                warn!(
                    environment = %environment.name,
                    correlation_id = %request.correlation_id,
                    "Rejected destroy of protected environment"
                );
                return Err(PolicyViolation::ProtectedDestroy {
                    environment: environment.name.clone(),
                }
                .into());
            }
            OperationKind::Init
            | OperationKind::Validate
            | OperationKind::Plan
            | OperationKind::Apply
            | OperationKind::Destroy
            | OperationKind::Output => {}
        }

        let token = self
            .tracker
            .acquire_lock(&environment.name, &request.correlation_id, request.operation)
            .await?;

        info!(
            environment = %environment.name,
            correlation_id = %request.correlation_id,
            "Starting {}",
            request.operation
        );

        let initial = match self.tracker.current(&token).await {
            Ok(state) => state,
            Err(e) => {
                self.abandon(token, request.operation, &e).await;
                return Err(e);
            }
        };

        let resting = if initial.phase.is_resting() {
            initial.phase
        } else {
            Phase::Failed
        };

        let prior_failure = if initial.is_failed() {
            let last = initial.last_outcome.clone();
            warn!(
                environment = %environment.name,
                correlation_id = %request.correlation_id,
                "Environment is in failed state{}",
                last.as_ref()
                    .and_then(|o| o.error_summary.as_deref())
                    .map(|s| format!(": {s}"))
                    .unwrap_or_default()
            );
            last
        } else {
            None
        };

        let mut run = Run {
            correlation_id: request.correlation_id.clone(),
            token,
            stages: Vec::new(),
            plan: None,
            outputs: None,
        };

        let completion = match self.drive(&request, environment, &mut run, cancel).await {
            Ok(completion) => completion,
            Err(e) => {
                error!(
                    environment = %environment.name,
                    correlation_id = %request.correlation_id,
                    "{} interrupted: {e}",
                    request.operation
                );
                self.abandon(run.token, request.operation, &e).await;
                return Err(e);
            }
        };

        let operation = request.operation;
        let (status, final_phase, result, failure) = match completion {
            Completion::Succeeded => {
                let phase = if operation.is_mutation() { Phase::Idle } else { resting };
                (ExecutionStatus::Succeeded, phase, OutcomeResult::Success, None)
            }
            Completion::Aborted(reason) => {
                (ExecutionStatus::Aborted { reason }, resting, OutcomeResult::Aborted, None)
            }
            Completion::Failed(failure) => {
                let result = if failure.error.is_cancelled() {
                    OutcomeResult::Cancelled
                } else {
                    OutcomeResult::Failure
                };
                (ExecutionStatus::Failed, Phase::Failed, result, Some(failure))
            }
        };

        let mut outcome = LastOutcome::new(operation, &request.correlation_id, result);
        if let Some(failure) = &failure {
            outcome = outcome.with_error(failure.error.exit_code(), failure.message.clone());
        } else if let ExecutionStatus::Aborted { reason } = &status {
            outcome = outcome.with_error(None, reason.to_string());
        }

        // A failed environment keeps its failure record until a newer
        // failure or a successful mutation replaces it. Aborts never do.
        let record = resting == Phase::Idle
            || matches!(result, OutcomeResult::Failure | OutcomeResult::Cancelled)
            || (operation.is_mutation() && result == OutcomeResult::Success);

        let state = self
            .tracker
            .release(run.token, final_phase, record.then_some(outcome))
            .await?;

        info!(
            environment = %environment.name,
            correlation_id = %request.correlation_id,
            "Finished {operation}: {result}, environment {}",
            state.phase
        );

        Ok(ExecutionResult {
            request,
            final_phase: state.phase,
            status,
            plan: run.plan,
            outputs: run.outputs,
            stages: run.stages,
            failure,
            prior_failure,
            state: None,
            started_at,
            finished_at: Utc::now(),
        })
    }

    async fn status(
        &self,
        request: OperationRequest,
        environment: &Environment,
        started_at: DateTime<Utc>,
    ) -> Result<ExecutionResult> {
        let state = self.tracker.load_last(&environment.name).await?;
        debug!(environment = %environment.name, "Status: {}", state.phase);

        let prior_failure = if state.is_failed() {
            state.last_outcome.clone()
        } else {
            None
        };
        let outputs = (!state.outputs.is_empty()).then(|| state.outputs.clone());

        Ok(ExecutionResult {
            request,
            final_phase: state.phase,
            status: ExecutionStatus::Succeeded,
            plan: None,
            outputs,
            stages: Vec::new(),
            failure: None,
            prior_failure,
            state: Some(state),
            started_at,
            finished_at: Utc::now(),
        })
    }

    async fn drive(
        &self,
        request: &OperationRequest,
        env: &Environment,
        run: &mut Run,
        cancel: &CancellationToken,
    ) -> Result<Completion> {
        match request.operation {
            OperationKind::Init => {
                proceed!(self.init(env, run, cancel).await);
            }
            OperationKind::Validate => {
                proceed!(self.init(env, run, cancel).await);
                proceed!(self.validate(env, run, cancel).await);
            }
            OperationKind::Plan => {
                proceed!(self.prepare(env, run, cancel).await);
                let summary = proceed!(self.plan(env, run, Stage::Plan, false, cancel).await);
                info!(environment = %env.name, correlation_id = %run.correlation_id, "Plan: {summary}");
                run.plan = Some(summary);
            }
            OperationKind::Apply | OperationKind::Destroy => {
                return self.mutate(request, env, run, cancel).await;
            }
            OperationKind::Output => {
                proceed!(self.output(env, run, cancel).await);
            }
            OperationKind::Status => {
                return Err(TerraplaneError::internal("status does not run a pipeline"));
            }
        }
        Ok(Completion::Succeeded)
    }

    async fn mutate(
        &self,
        request: &OperationRequest,
        env: &Environment,
        run: &mut Run,
        cancel: &CancellationToken,
    ) -> Result<Completion> {
        let destroy = request.operation == OperationKind::Destroy;

        proceed!(self.prepare(env, run, cancel).await);

        let summary = proceed!(self.plan(env, run, Stage::Plan, destroy, cancel).await);
        info!(environment = %env.name, correlation_id = %run.correlation_id, "Plan: {summary}");
        run.plan = Some(summary.clone());

        if !summary.has_changes() {
            info!(environment = %env.name, "No changes, {} is already up to date", env.name);
            return Ok(Completion::Succeeded);
        }

        proceed!(self.gate(request, env, run, &summary, cancel).await);

        if self.settings.verify_plan {
            let verified = proceed!(self.plan(env, run, Stage::VerifyPlan, destroy, cancel).await);
            let expected = summary.fingerprint();
            let actual = verified.fingerprint();
            if expected != actual {
                error!(
                    environment = %env.name,
                    correlation_id = %run.correlation_id,
                    "Verification plan differs from approved plan ({verified})"
                );
                if let Some(last) = run.stages.last_mut() {
                    last.success = false;
                    last.note = Some(String::from("plan drift"));
                }
                return Ok(Completion::Failed(Failure::new(
                    Stage::VerifyPlan,
                    PipelineError::DriftDetected { expected, actual },
                )));
            }
        }

        let (stage, phase, subcommand) = if destroy {
            (Stage::Destroy, Phase::Destroying, "destroy")
        } else {
            (Stage::Apply, Phase::Applying, "apply")
        };

        self.tracker.transition(&run.token, phase, None).await?;
        let args = vec![subcommand, "-auto-approve", "-input=false", "-json"];
        let outcome = proceed!(self.run_stage(env, run, stage, &args, &[0], cancel).await);

        let outputs = self.interpreter.parse_apply(&outcome.stdout);
        debug!(
            environment = %env.name,
            "Captured {} resource id(s) and {} output(s)",
            outputs.resources.len(),
            outputs.values.len()
        );
        self.tracker.record_outputs(&run.token, outputs.clone()).await?;
        run.outputs = Some(outputs);

        Ok(Completion::Succeeded)
    }

    async fn prepare(&self, env: &Environment, run: &mut Run, cancel: &CancellationToken) -> Result<Step<()>> {
        proceed!(step self.init(env, run, cancel).await);
        if self.settings.validate {
            return self.validate(env, run, cancel).await;
        }
        Ok(Ok(()))
    }

    async fn init(&self, env: &Environment, run: &mut Run, cancel: &CancellationToken) -> Result<Step<()>> {
        self.tracker.transition(&run.token, Phase::Initializing, None).await?;

        let mut args = vec!["init", "-input=false"];
        args.extend(self.settings.init_args.iter().map(String::as_str));

        Ok(self
            .run_stage(env, run, Stage::Init, &args, &[0], cancel)
            .await?
            .map(|_| ()))
    }

    async fn validate(&self, env: &Environment, run: &mut Run, cancel: &CancellationToken) -> Result<Step<()>> {
        self.tracker.transition(&run.token, Phase::Validating, None).await?;

        Ok(self
            .run_stage(env, run, Stage::Validate, &["validate", "-json"], &[0], cancel)
            .await?
            .map(|_| ()))
    }

    /// Runs `plan` with `-detailed-exitcode`: 0 means no changes, 2 means
    /// changes present, anything else is an error.
    async fn plan(
        &self,
        env: &Environment,
        run: &mut Run,
        stage: Stage,
        destroy: bool,
        cancel: &CancellationToken,
    ) -> Result<Step<PlanSummary>> {
        let note = (stage == Stage::VerifyPlan).then(|| String::from("verification"));
        self.tracker.transition(&run.token, Phase::Planning, note).await?;

        let mut args = vec!["plan", "-input=false", "-json", "-detailed-exitcode"];
        if destroy {
            args.push("-destroy");
        }
        let outcome = proceed!(step self.run_stage(env, run, stage, &args, &[0, 2], cancel).await);

        match self.interpreter.parse(&outcome.stdout) {
            Ok(summary) => {
                if outcome.exit_code == Some(0) && summary.has_changes() {
                    warn!(environment = %env.name, "Plan exited 0 but reported {summary}");
                }
                Ok(Ok(summary))
            }
            Err(TerraplaneError::Pipeline(e)) => {
                error!(environment = %env.name, correlation_id = %run.correlation_id, "{e}");
                if let Some(last) = run.stages.last_mut() {
                    last.success = false;
                    last.note = Some(e.to_string());
                }
                Ok(Err(Completion::Failed(Failure::new(stage, e))))
            }
            Err(e) => Err(e),
        }
    }

    /// Applies the instance guardrail and the approval policy.
    async fn gate(
        &self,
        request: &OperationRequest,
        env: &Environment,
        run: &mut Run,
        summary: &PlanSummary,
        cancel: &CancellationToken,
    ) -> Result<Step<()>> {
        let creates = summary.planned_creates_of(&env.policy.instance_resource_types);
        let limit = env.policy.max_instances;
        if creates > usize::try_from(limit).unwrap_or(usize::MAX) {
            warn!(
                environment = %env.name,
                correlation_id = %run.correlation_id,
                "Plan creates {creates} instance(s), limit is {limit}"
            );
            return Ok(Err(Completion::Aborted(AbortReason::Policy {
                violation: PolicyViolation::InstanceLimitExceeded {
                    environment: env.name.clone(),
                    planned: creates,
                    limit,
                },
            })));
        }

        if env.policy.auto_approve && !summary.has_destructive() {
            debug!(environment = %env.name, "Auto-approved");
            return Ok(Ok(()));
        }
        if request.pre_approved {
            info!(environment = %env.name, correlation_id = %run.correlation_id, "Pre-approved");
            return Ok(Ok(()));
        }

        self.tracker
            .transition(&run.token, Phase::AwaitingApproval, None)
            .await?;
        info!(
            environment = %env.name,
            correlation_id = %run.correlation_id,
            "Awaiting approval{}",
            if summary.has_destructive() { " for destructive changes" } else { "" }
        );

        let approval = ApprovalRequest {
            environment: env.name.clone(),
            operation: request.operation,
            correlation_id: run.correlation_id.clone(),
            plan: summary.clone(),
        };

        let decision = tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            decision = tokio::time::timeout(
                self.settings.timeouts.approval(),
                self.approver.request_approval(&approval),
            ) => Some(decision),
        };

        let reason = match decision {
            Some(Ok(ApprovalDecision::Approved)) => {
                info!(environment = %env.name, correlation_id = %run.correlation_id, "Approved");
                return Ok(Ok(()));
            }
            Some(Ok(ApprovalDecision::Rejected)) => AbortReason::Rejected,
            Some(Ok(ApprovalDecision::Unavailable)) => AbortReason::Policy {
                violation: PolicyViolation::ApprovalRequired {
                    environment: env.name.clone(),
                },
            },
            Some(Err(_elapsed)) => AbortReason::ApprovalTimeout,
            None => AbortReason::Cancelled,
        };

        info!(environment = %env.name, correlation_id = %run.correlation_id, "Aborted: {reason}");
        Ok(Err(Completion::Aborted(reason)))
    }

    async fn output(&self, env: &Environment, run: &mut Run, cancel: &CancellationToken) -> Result<Step<()>> {
        self.tracker.transition(&run.token, Phase::Outputting, None).await?;

        let outcome = proceed!(
            step self.run_stage(env, run, Stage::Output, &["output", "-json"], &[0], cancel).await
        );

        let values = match self.interpreter.parse_outputs(&outcome.stdout) {
            Ok(values) => values,
            Err(TerraplaneError::Pipeline(e)) => {
                return Ok(Err(Completion::Failed(Failure::new(Stage::Output, e))));
            }
            Err(e) => return Err(e),
        };

        let resources = self.tracker.current(&run.token).await?.outputs.resources;
        run.outputs = Some(ApplyOutputs { resources, values });
        Ok(Ok(()))
    }

    /// Runs one subprocess stage and records its outcome.
    ///
    /// Exit codes outside `accepted` end the run with the stage-specific
    /// failure.
    async fn run_stage(
        &self,
        env: &Environment,
        run: &mut Run,
        stage: Stage,
        args: &[&str],
        accepted: &[i32],
        cancel: &CancellationToken,
    ) -> Result<Step<ProcessOutcome>> {
        let spec = self.command(env, stage, args);

        if cancel.is_cancelled() {
            run.stages.push(StageOutcome {
                stage,
                success: false,
                exit_code: None,
                duration_ms: 0,
                note: Some(String::from("cancelled before start")),
            });
            return Ok(Err(Completion::Failed(Failure::new(
                stage,
                PipelineError::Cancelled {
                    stage,
                    reason: CancelReason::Operator,
                },
            ))));
        }

        info!(
            environment = %env.name,
            correlation_id = %run.correlation_id,
            stage = %stage,
            "Running {}",
            spec.display()
        );

        let started = Instant::now();
        let result = self.runner.run(&spec, cancel).await;
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(TerraplaneError::Execution(e)) => {
                error!(environment = %env.name, stage = %stage, "{e}");
                run.stages.push(StageOutcome {
                    stage,
                    success: false,
                    exit_code: None,
                    duration_ms,
                    note: Some(e.to_string()),
                });
                return Ok(Err(Completion::Failed(Failure::new(
                    stage,
                    PipelineError::Spawn {
                        program: spec.program,
                        message: e.to_string(),
                    },
                ))));
            }
            Err(e) => return Err(e),
        };

        if let Some(reason) = outcome.cancelled {
            warn!(
                environment = %env.name,
                correlation_id = %run.correlation_id,
                stage = %stage,
                "Stage cancelled: {reason}"
            );
            run.stages.push(StageOutcome {
                stage,
                success: false,
                exit_code: outcome.exit_code,
                duration_ms,
                note: Some(format!("cancelled: {reason}")),
            });
            return Ok(Err(Completion::Failed(Failure::new(
                stage,
                PipelineError::Cancelled { stage, reason },
            ))));
        }

        let success = outcome.exit_code.is_some_and(|code| accepted.contains(&code));
        run.stages.push(StageOutcome {
            stage,
            success,
            exit_code: outcome.exit_code,
            duration_ms,
            note: None,
        });

        if !success {
            let exit_code = outcome.reported_exit_code();
            let stderr_tail = outcome.stderr_tail();
            error!(
                environment = %env.name,
                correlation_id = %run.correlation_id,
                stage = %stage,
                "Stage failed with exit code {exit_code}: {stderr_tail}"
            );
            return Ok(Err(Completion::Failed(Failure::new(
                stage,
                PipelineError::stage_failed(stage, exit_code, stderr_tail),
            ))));
        }

        debug!(stage = %stage, "Stage finished in {duration_ms}ms");
        Ok(Ok(outcome))
    }

    fn command(&self, env: &Environment, stage: Stage, args: &[&str]) -> CommandSpec {
        CommandSpec::new(self.settings.binary.clone(), env.working_dir.clone())
            .args(args.iter().copied())
            .envs(env.variables.iter())
            .envs([("TF_IN_AUTOMATION", "1")])
            .timeout(self.settings.timeout_for(stage))
            .grace_period(self.settings.grace_period())
    }

    /// Releases the lock after an error that stopped the pipeline midway.
    async fn abandon(&self, token: LockToken, operation: OperationKind, cause: &TerraplaneError) {
        let outcome = LastOutcome::new(operation, token.correlation_id(), OutcomeResult::Failure)
            .with_error(None, cause.to_string());
        let environment = token.environment().to_string();

        if let Err(e) = self.tracker.release(token, Phase::Failed, Some(outcome)).await {
            error!(environment = %environment, "Failed to release lock: {e}");
        }
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("settings", &self.settings)
            .field("tracker", &self.tracker)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigParser;
    use crate::error::{ExecutionError, StateError};
    use crate::orchestrator::{MockApprover, NonInteractiveApprover};
    use crate::runner::MockProcessRunner;
    use crate::state::{EnvironmentState, LocalStateStore, LockInfo, StateStore};
    use async_trait::async_trait;
    use proptest::prelude::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    const NO_CHANGES: &str = r#"{"type":"version","terraform":"1.7.0","ui":"1.2"}"#;
    const CREATE_WEB: &str = r#"{"type":"planned_change","change":{"resource":{"addr":"aws_instance.web"},"action":"create"}}"#;
    const REPLACE_DB: &str = r#"{"type":"planned_change","change":{"resource":{"addr":"aws_db_instance.main"},"action":"replace"}}"#;
    const CREATE_THREE: &str = r#"{"type":"planned_change","change":{"resource":{"addr":"aws_instance.a"},"action":"create"}}
{"type":"planned_change","change":{"resource":{"addr":"aws_instance.b"},"action":"create"}}
{"type":"planned_change","change":{"resource":{"addr":"aws_instance.c"},"action":"create"}}"#;
    const APPLIED: &str = r#"{"type":"apply_complete","hook":{"resource":{"addr":"aws_instance.web"},"action":"create","id_key":"id","id_value":"i-0abc"}}
{"type":"outputs","outputs":{"endpoint":{"sensitive":false,"type":"string","value":"web.example.com"}}}"#;
    const OUTPUTS: &str = r#"{"endpoint":{"sensitive":false,"type":"string","value":"web.example.com"}}"#;

    const PROJECT: &str = r"
project:
  name: shop
environments:
  - name: dev
    working_dir: infra/dev
    policy:
      auto_approve: true
    variables:
      TF_VAR_region: eu-west-1
  - name: prod
    working_dir: infra/prod
    policy:
      protected: true
      max_instances: 2
";

    /// Runner that answers each subcommand from a script.
    #[derive(Default)]
    struct ScriptedRunner {
        plans: Mutex<VecDeque<String>>,
        failures: HashMap<&'static str, i32>,
        block_on: Option<&'static str>,
        delay: Option<Duration>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedRunner {
        /// Successive plan runs print these streams; the last one repeats.
        fn with_plans(plans: &[&str]) -> Self {
            Self {
                plans: Mutex::new(plans.iter().map(ToString::to_string).collect()),
                ..Self::default()
            }
        }

        fn failing(mut self, subcommand: &'static str, exit_code: i32) -> Self {
            self.failures.insert(subcommand, exit_code);
            self
        }

        const fn blocking_on(mut self, subcommand: &'static str) -> Self {
            self.block_on = Some(subcommand);
            self
        }

        const fn delayed(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ProcessRunner for ScriptedRunner {
        async fn run(&self, spec: &CommandSpec, cancel: &CancellationToken) -> Result<ProcessOutcome> {
            let subcommand = spec.args.first().cloned().unwrap_or_default();
            self.calls.lock().unwrap().push(subcommand.clone());

            if self.block_on == Some(subcommand.as_str()) {
                cancel.cancelled().await;
                return Ok(ProcessOutcome::cancelled(CancelReason::Operator));
            }
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if let Some(code) = self.failures.get(subcommand.as_str()) {
                return Ok(ProcessOutcome::exited(*code, "", "Error: something broke"));
            }

            Ok(match subcommand.as_str() {
                "plan" => {
                    let stdout = {
                        let mut plans = self.plans.lock().unwrap();
                        if plans.len() > 1 {
                            plans.pop_front()
                        } else {
                            plans.front().cloned()
                        }
                    }
                    .unwrap_or_else(|| NO_CHANGES.to_string());
                    let code = if stdout.contains("planned_change") { 2 } else { 0 };
                    ProcessOutcome::exited(code, stdout, "")
                }
                "apply" | "destroy" => ProcessOutcome::exited(0, APPLIED, ""),
                "output" => ProcessOutcome::exited(0, OUTPUTS, ""),
                _ => ProcessOutcome::exited(0, "", ""),
            })
        }
    }

    /// Approver that never answers.
    struct SilentApprover;

    #[async_trait]
    impl Approver for SilentApprover {
        async fn request_approval(&self, _request: &ApprovalRequest) -> ApprovalDecision {
            std::future::pending().await
        }
    }

    /// Approver that cancels the operation instead of answering.
    struct InterruptingApprover(CancellationToken);

    #[async_trait]
    impl Approver for InterruptingApprover {
        async fn request_approval(&self, _request: &ApprovalRequest) -> ApprovalDecision {
            self.0.cancel();
            std::future::pending().await
        }
    }

    struct Fixture {
        orchestrator: Orchestrator,
        store: Arc<LocalStateStore>,
        _dir: TempDir,
    }

    impl Fixture {
        async fn stored(&self, environment: &str) -> EnvironmentState {
            self.store.load(environment).await.unwrap().unwrap()
        }
    }

    fn fixture_with(
        runner: Arc<dyn ProcessRunner>,
        approver: impl Approver + 'static,
        tune: impl FnOnce(&mut OrchestratorSettings),
    ) -> Fixture {
        fixture_for(PROJECT, runner, approver, tune)
    }

    fn fixture_for(
        project: &str,
        runner: Arc<dyn ProcessRunner>,
        approver: impl Approver + 'static,
        tune: impl FnOnce(&mut OrchestratorSettings),
    ) -> Fixture {
        let dir = TempDir::new().unwrap();
        for env in ["infra/dev", "infra/prod"] {
            std::fs::create_dir_all(dir.path().join(env)).unwrap();
        }

        let config = ConfigParser::new().parse_yaml(project, None).unwrap();
        let registry = EnvironmentRegistry::from_config(config, dir.path()).unwrap();
        let store = Arc::new(LocalStateStore::with_base_dir(dir.path().join(".terraplane")));
        let tracker = Arc::new(StateTracker::new(store.clone()));

        let mut settings = OrchestratorSettings::from_registry(&registry);
        tune(&mut settings);

        Fixture {
            orchestrator: Orchestrator::new(Arc::new(registry), tracker, runner, Arc::new(approver), settings),
            store,
            _dir: dir,
        }
    }

    fn fixture(runner: &Arc<ScriptedRunner>, approver: impl Approver + 'static) -> Fixture {
        fixture_with(runner.clone(), approver, |_| {})
    }

    fn never_asked() -> MockApprover {
        let mut approver = MockApprover::new();
        approver.expect_request_approval().never();
        approver
    }

    fn answering(decision: ApprovalDecision) -> MockApprover {
        let mut approver = MockApprover::new();
        approver
            .expect_request_approval()
            .times(1)
            .returning(move |_| decision);
        approver
    }

    /// Cancels the returned token once the runner has started `subcommand`.
    fn cancel_when_running(runner: &Arc<ScriptedRunner>, subcommand: &'static str) -> CancellationToken {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let runner = runner.clone();
        tokio::spawn(async move {
            while !runner.calls().iter().any(|c| c == subcommand) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            trigger.cancel();
        });
        cancel
    }

    #[tokio::test]
    async fn test_auto_approved_apply_skips_approval() {
        let runner = Arc::new(ScriptedRunner::with_plans(&[CREATE_WEB]));
        let fx = fixture(&runner, never_asked());

        let result = fx
            .orchestrator
            .execute(OperationRequest::new("dev", OperationKind::Apply), &CancellationToken::new())
            .await
            .unwrap();

        assert!(result.is_success());
        assert_eq!(result.final_phase, Phase::Idle);
        assert_eq!(result.exit_code(), 0);
        assert_eq!(runner.calls(), ["init", "validate", "plan", "plan", "apply"]);

        let outputs = result.outputs.unwrap();
        assert_eq!(outputs.resources["aws_instance.web"], "i-0abc");
        assert_eq!(outputs.values["endpoint"], "web.example.com");

        let state = fx.stored("dev").await;
        assert!(state.lock.is_none());
        assert_eq!(state.outputs.resources["aws_instance.web"], "i-0abc");
        assert!(state.transitions.iter().all(|t| t.to != Phase::AwaitingApproval));
        assert_eq!(state.last_outcome.unwrap().result, OutcomeResult::Success);
    }

    #[tokio::test]
    async fn test_stage_commands_carry_environment() {
        let mut runner = MockProcessRunner::new();
        runner
            .expect_run()
            .withf(|spec, _| {
                spec.program == "terraform"
                    && spec.args == ["init", "-input=false"]
                    && spec.workdir.ends_with("infra/dev")
                    && spec.env.contains(&("TF_VAR_region".into(), "eu-west-1".into()))
                    && spec.env.contains(&("TF_IN_AUTOMATION".into(), "1".into()))
                    && spec.timeout == Some(Duration::from_secs(300))
            })
            .times(1)
            .returning(|_, _| Ok(ProcessOutcome::exited(0, "", "")));
        let fx = fixture_with(Arc::new(runner), never_asked(), |_| {});

        let result = fx
            .orchestrator
            .execute(OperationRequest::new("dev", OperationKind::Init), &CancellationToken::new())
            .await
            .unwrap();

        assert!(result.is_success());
        assert_eq!(result.stages.len(), 1);
        assert_eq!(result.stages[0].stage, Stage::Init);
    }

    #[tokio::test]
    async fn test_rejected_approval_aborts_without_mutation() {
        let runner = Arc::new(ScriptedRunner::with_plans(&[CREATE_WEB]));
        let fx = fixture(&runner, answering(ApprovalDecision::Rejected));

        let result = fx
            .orchestrator
            .execute(OperationRequest::new("prod", OperationKind::Apply), &CancellationToken::new())
            .await
            .unwrap();

        assert!(matches!(
            result.status,
            ExecutionStatus::Aborted { reason: AbortReason::Rejected }
        ));
        assert_eq!(result.final_phase, Phase::Idle);
        assert_eq!(result.exit_code(), 0);
        assert!(!runner.calls().contains(&String::from("apply")));

        let state = fx.stored("prod").await;
        assert_eq!(state.phase, Phase::Idle);
        assert!(state.transitions.iter().any(|t| t.to == Phase::AwaitingApproval));
        assert_eq!(state.last_outcome.unwrap().result, OutcomeResult::Aborted);
    }

    #[tokio::test]
    async fn test_pre_approved_skips_approver() {
        let runner = Arc::new(ScriptedRunner::with_plans(&[CREATE_WEB]));
        let fx = fixture(&runner, never_asked());

        let request = OperationRequest::new("prod", OperationKind::Apply).pre_approved(true);
        let result = fx.orchestrator.execute(request, &CancellationToken::new()).await.unwrap();

        assert!(result.is_success());
        assert!(runner.calls().contains(&String::from("apply")));
    }

    #[tokio::test]
    async fn test_destructive_change_needs_approval_even_with_auto_approve() {
        let runner = Arc::new(ScriptedRunner::with_plans(&[REPLACE_DB]));
        let fx = fixture(&runner, answering(ApprovalDecision::Approved));

        let result = fx
            .orchestrator
            .execute(OperationRequest::new("dev", OperationKind::Apply), &CancellationToken::new())
            .await
            .unwrap();

        assert!(result.is_success());
        assert!(result.plan.unwrap().has_destructive());
    }

    #[tokio::test]
    async fn test_unavailable_approver_requires_pre_approval() {
        let runner = Arc::new(ScriptedRunner::with_plans(&[CREATE_WEB]));
        let fx = fixture(&runner, NonInteractiveApprover);

        let result = fx
            .orchestrator
            .execute(OperationRequest::new("prod", OperationKind::Apply), &CancellationToken::new())
            .await
            .unwrap();

        assert!(matches!(
            result.status,
            ExecutionStatus::Aborted {
                reason: AbortReason::Policy {
                    violation: PolicyViolation::ApprovalRequired { .. }
                }
            }
        ));
        assert_eq!(result.exit_code(), 2);
        assert_eq!(result.final_phase, Phase::Idle);
    }

    #[tokio::test]
    async fn test_approval_timeout_aborts() {
        let runner = Arc::new(ScriptedRunner::with_plans(&[CREATE_WEB]));
        let fx = fixture_with(runner.clone(), SilentApprover, |s| s.timeouts.approval = 0);

        let result = fx
            .orchestrator
            .execute(OperationRequest::new("prod", OperationKind::Apply), &CancellationToken::new())
            .await
            .unwrap();

        assert!(matches!(
            result.status,
            ExecutionStatus::Aborted { reason: AbortReason::ApprovalTimeout }
        ));
        assert!(!runner.calls().contains(&String::from("apply")));
    }

    #[tokio::test]
    async fn test_failed_apply_marks_environment_failed() {
        let runner = Arc::new(ScriptedRunner::with_plans(&[CREATE_WEB]).failing("apply", 1));
        let fx = fixture(&runner, never_asked());

        let result = fx
            .orchestrator
            .execute(OperationRequest::new("dev", OperationKind::Apply), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.final_phase, Phase::Failed);
        assert_eq!(result.exit_code(), 1);
        let failure = result.failure.unwrap();
        assert_eq!(failure.stage, Stage::Apply);
        assert!(matches!(
            failure.error,
            PipelineError::ApplyFailed { exit_code: 1, ref stderr_tail } if stderr_tail.contains("something broke")
        ));
        assert!(fx.stored("dev").await.lock.is_none());

        // Read-only operations still run and leave the failure on record.
        let plan = fx
            .orchestrator
            .execute(OperationRequest::new("dev", OperationKind::Plan), &CancellationToken::new())
            .await
            .unwrap();
        assert!(plan.is_success());
        assert_eq!(plan.final_phase, Phase::Failed);
        assert!(plan.prior_failure.is_some());
        assert_eq!(fx.stored("dev").await.last_outcome.unwrap().operation, OperationKind::Apply);

        let retry = fx
            .orchestrator
            .execute(OperationRequest::new("dev", OperationKind::Apply), &CancellationToken::new())
            .await
            .unwrap();
        let prior = retry.prior_failure.unwrap();
        assert_eq!(prior.operation, OperationKind::Apply);
        assert_eq!(prior.result, OutcomeResult::Failure);
    }

    #[tokio::test]
    async fn test_aborted_retry_keeps_failure_record() {
        let runner = Arc::new(ScriptedRunner::with_plans(&[CREATE_WEB]).failing("apply", 1));
        let fx = fixture(&runner, answering(ApprovalDecision::Rejected));

        let failed = fx
            .orchestrator
            .execute(
                OperationRequest::new("prod", OperationKind::Apply).pre_approved(true),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(failed.final_phase, Phase::Failed);

        let rejected = fx
            .orchestrator
            .execute(OperationRequest::new("prod", OperationKind::Apply), &CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(
            rejected.status,
            ExecutionStatus::Aborted { reason: AbortReason::Rejected }
        ));
        assert_eq!(rejected.final_phase, Phase::Failed);

        let state = fx.stored("prod").await;
        assert_eq!(state.phase, Phase::Failed);
        let outcome = state.last_outcome.unwrap();
        assert_eq!(outcome.result, OutcomeResult::Failure);
        assert!(outcome.error_summary.unwrap().contains("something broke"));

        let plan = fx
            .orchestrator
            .execute(OperationRequest::new("prod", OperationKind::Plan), &CancellationToken::new())
            .await
            .unwrap();
        let prior = plan.prior_failure.unwrap();
        assert_eq!(prior.correlation_id, failed.request.correlation_id);
        assert_eq!(prior.result, OutcomeResult::Failure);
    }

    #[tokio::test]
    async fn test_plan_drift_blocks_apply() {
        let runner = Arc::new(ScriptedRunner::with_plans(&[CREATE_WEB, REPLACE_DB]));
        let fx = fixture(&runner, answering(ApprovalDecision::Approved));

        let request = OperationRequest::new("prod", OperationKind::Apply);
        let result = fx.orchestrator.execute(request, &CancellationToken::new()).await.unwrap();

        let failure = result.failure.unwrap();
        assert_eq!(failure.stage, Stage::VerifyPlan);
        assert!(matches!(failure.error, PipelineError::DriftDetected { .. }));
        assert_eq!(result.final_phase, Phase::Failed);
        assert!(!runner.calls().contains(&String::from("apply")));
    }

    #[tokio::test]
    async fn test_cancel_during_apply() {
        let runner = Arc::new(ScriptedRunner::with_plans(&[CREATE_WEB]).blocking_on("apply"));
        let fx = fixture(&runner, never_asked());

        let cancel = cancel_when_running(&runner, "apply");
        let result = fx
            .orchestrator
            .execute(OperationRequest::new("dev", OperationKind::Apply), &cancel)
            .await
            .unwrap();

        assert!(matches!(
            result.failure.as_ref().map(|f| &f.error),
            Some(PipelineError::Cancelled { stage: Stage::Apply, reason: CancelReason::Operator })
        ));
        assert_eq!(result.exit_code(), 130);

        let state = fx.stored("dev").await;
        assert_eq!(state.phase, Phase::Failed);
        assert!(state.lock.is_none());
        assert_eq!(state.last_outcome.unwrap().result, OutcomeResult::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_during_approval_aborts() {
        let runner = Arc::new(ScriptedRunner::with_plans(&[CREATE_WEB]));
        let cancel = CancellationToken::new();
        let fx = fixture(&runner, InterruptingApprover(cancel.clone()));

        let result = fx
            .orchestrator
            .execute(OperationRequest::new("prod", OperationKind::Apply), &cancel)
            .await
            .unwrap();

        assert!(matches!(
            result.status,
            ExecutionStatus::Aborted { reason: AbortReason::Cancelled }
        ));
        assert_eq!(result.final_phase, Phase::Idle);
        assert_eq!(result.exit_code(), 130);
        assert!(!runner.calls().contains(&String::from("apply")));
    }

    #[tokio::test]
    async fn test_concurrent_operations_on_one_environment() {
        let runner = Arc::new(ScriptedRunner::with_plans(&[NO_CHANGES]).delayed(Duration::from_millis(100)));
        let fx = fixture(&runner, never_asked());
        let cancel = CancellationToken::new();

        let (first, second) = tokio::join!(
            fx.orchestrator.execute(OperationRequest::new("dev", OperationKind::Plan), &cancel),
            fx.orchestrator.execute(OperationRequest::new("dev", OperationKind::Plan), &cancel),
        );

        assert_ne!(first.is_ok(), second.is_ok());
        let err = first.err().or(second.err()).unwrap();
        assert!(matches!(err, TerraplaneError::State(StateError::LockHeld { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stale_lock_blocks_until_forced() {
        let runner = Arc::new(ScriptedRunner::with_plans(&[NO_CHANGES]));
        let fx = fixture(&runner, never_asked());

        let mut child = std::process::Command::new("true").spawn().unwrap();
        child.wait().unwrap();
        let mut lock = LockInfo::new("crashed-op", OperationKind::Apply);
        lock.pid = child.id();
        let mut state = EnvironmentState::new("dev");
        state.transition(Phase::Applying, "crashed-op", None);
        state.lock = Some(lock);
        fx.store.save(&state).await.unwrap();

        let err = fx
            .orchestrator
            .execute(OperationRequest::new("dev", OperationKind::Plan), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TerraplaneError::State(StateError::StaleLock { ref holder, .. }) if holder == "crashed-op"));
        assert!(runner.calls().is_empty());

        fx.orchestrator.tracker().force_release("dev", "host rebooted").await.unwrap();

        let result = fx
            .orchestrator
            .execute(OperationRequest::new("dev", OperationKind::Plan), &CancellationToken::new())
            .await
            .unwrap();
        assert!(result.is_success());
        assert!(result.prior_failure.unwrap().error_summary.unwrap().contains("crashed-op"));
    }

    #[tokio::test]
    async fn test_empty_plan_skips_mutation() {
        let runner = Arc::new(ScriptedRunner::with_plans(&[NO_CHANGES]));
        let fx = fixture(&runner, never_asked());

        let result = fx
            .orchestrator
            .execute(OperationRequest::new("prod", OperationKind::Apply), &CancellationToken::new())
            .await
            .unwrap();

        assert!(result.is_success());
        assert_eq!(result.final_phase, Phase::Idle);
        assert_eq!(runner.calls(), ["init", "validate", "plan"]);
        assert!(!result.plan.unwrap().has_changes());
    }

    #[tokio::test]
    async fn test_instance_limit_aborts_before_approval() {
        let runner = Arc::new(ScriptedRunner::with_plans(&[CREATE_THREE]));
        let fx = fixture(&runner, never_asked());

        let result = fx
            .orchestrator
            .execute(OperationRequest::new("prod", OperationKind::Apply), &CancellationToken::new())
            .await
            .unwrap();

        assert!(matches!(
            result.status,
            ExecutionStatus::Aborted {
                reason: AbortReason::Policy {
                    violation: PolicyViolation::InstanceLimitExceeded { planned: 3, limit: 2, .. }
                }
            }
        ));
        assert_eq!(result.exit_code(), 2);
        assert!(!runner.calls().contains(&String::from("apply")));
    }

    #[tokio::test]
    async fn test_spawn_failure_fails_stage() {
        let mut runner = MockProcessRunner::new();
        runner.expect_run().times(1).returning(|spec, _| {
            Err(ExecutionError::SpawnFailed {
                program: spec.program.clone(),
                message: String::from("No such file or directory"),
            }
            .into())
        });
        let fx = fixture_with(Arc::new(runner), never_asked(), |_| {});

        let result = fx
            .orchestrator
            .execute(OperationRequest::new("dev", OperationKind::Plan), &CancellationToken::new())
            .await
            .unwrap();

        let failure = result.failure.unwrap();
        assert_eq!(failure.stage, Stage::Init);
        assert!(matches!(failure.error, PipelineError::Spawn { ref program, .. } if program == "terraform"));
        assert_eq!(result.final_phase, Phase::Failed);
    }

    #[tokio::test]
    async fn test_output_merges_stored_resources() {
        let runner = Arc::new(ScriptedRunner::with_plans(&[CREATE_WEB]));
        let fx = fixture(&runner, never_asked());
        let cancel = CancellationToken::new();

        fx.orchestrator
            .execute(OperationRequest::new("dev", OperationKind::Apply), &cancel)
            .await
            .unwrap();
        let result = fx
            .orchestrator
            .execute(OperationRequest::new("dev", OperationKind::Output), &cancel)
            .await
            .unwrap();

        let outputs = result.outputs.unwrap();
        assert_eq!(outputs.resources["aws_instance.web"], "i-0abc");
        assert_eq!(outputs.values["endpoint"], "web.example.com");
        assert_eq!(result.final_phase, Phase::Idle);
        assert_eq!(runner.calls().last().map(String::as_str), Some("output"));
    }

    #[tokio::test]
    async fn test_status_reports_without_running_tool() {
        let runner = Arc::new(ScriptedRunner::with_plans(&[CREATE_WEB]).failing("apply", 1));
        let fx = fixture(&runner, never_asked());
        let cancel = CancellationToken::new();

        fx.orchestrator
            .execute(OperationRequest::new("dev", OperationKind::Apply), &cancel)
            .await
            .unwrap();
        let calls = runner.calls().len();

        let status = fx
            .orchestrator
            .execute(OperationRequest::new("dev", OperationKind::Status), &cancel)
            .await
            .unwrap();

        assert_eq!(runner.calls().len(), calls);
        assert_eq!(status.final_phase, Phase::Failed);
        assert!(status.prior_failure.is_some());
        assert_eq!(status.state.unwrap().phase, Phase::Failed);
    }

    #[tokio::test]
    async fn test_unknown_environment() {
        let runner = Arc::new(ScriptedRunner::default());
        let fx = fixture(&runner, never_asked());

        let err = fx
            .orchestrator
            .execute(OperationRequest::new("qa", OperationKind::Plan), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, TerraplaneError::NotFound { ref environment } if environment == "qa"));
    }

    const OPERATIONS: [OperationKind; 7] = [
        OperationKind::Init,
        OperationKind::Validate,
        OperationKind::Plan,
        OperationKind::Apply,
        OperationKind::Destroy,
        OperationKind::Output,
        OperationKind::Status,
    ];

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        /// Property: only a destroy of a protected environment is refused
        /// before the tool runs, whatever the rest of the policy says.
        #[test]
        fn prop_protected_destroy_never_runs_tool(
            auto_approve in any::<bool>(),
            protected in any::<bool>(),
            max_instances in 1u32..8,
            operation in prop::sample::select(OPERATIONS.to_vec()),
            pre_approved in any::<bool>(),
            correlation_id in "[a-z0-9-]{1,16}",
        ) {
            let project = format!(
                "project:\n  name: shop\nenvironments:\n  - name: target\n    working_dir: infra/prod\n    policy:\n      auto_approve: {auto_approve}\n      protected: {protected}\n      max_instances: {max_instances}\n      desired_capacity: 1\n"
            );
            let refused = protected && operation == OperationKind::Destroy;

            let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            runtime.block_on(async {
                let runner = Arc::new(ScriptedRunner::default());
                let fx = fixture_for(&project, runner.clone(), NonInteractiveApprover, |_| {});

                let request = OperationRequest::new("target", operation)
                    .pre_approved(pre_approved)
                    .with_correlation_id(correlation_id);
                let result = fx.orchestrator.execute(request, &CancellationToken::new()).await;

                if refused {
                    let err = result.unwrap_err();
                    assert!(matches!(err, TerraplaneError::Policy(PolicyViolation::ProtectedDestroy { .. })));
                    assert!(runner.calls().is_empty());
                    assert!(fx.store.load("target").await.unwrap().is_none());
                } else {
                    assert!(result.unwrap().is_success());
                    assert_eq!(runner.calls().is_empty(), operation == OperationKind::Status);
                }
            });
        }
    }
}
