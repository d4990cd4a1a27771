//! Apply engine - runs planned steps in order, halting on the first failure

use crate::context::ProgressCallback;
use crate::planner::{ApplyPlan, PlannedStep, StepKind};
use remotekit::{ExecContext, InstanceRef, Interpreter, RemoteExecutor};
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// A step that ran to completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepReport {
    pub id: String,
    pub kind: StepKind,
    pub description: String,
    pub subjects: Vec<String>,
    pub duration_ms: u64,
}

impl StepReport {
    fn new(step: &PlannedStep, started: Instant) -> Self {
        Self {
            id: step.id.clone(),
            kind: step.kind,
            description: step.description.clone(),
            subjects: step.subjects.clone(),
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        }
    }
}

/// The step that stopped the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedStep {
    pub id: String,
    pub kind: StepKind,
    pub description: String,
    /// Exit code, when the script ran
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub stderr: String,
    /// Transport error, when the script could not be run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of running a plan.
#[derive(Debug, Clone, Default)]
pub struct ApplyOutcome {
    /// Steps that completed, in order
    pub applied: Vec<StepReport>,
    pub failed: Option<FailedStep>,
    /// The run stopped between steps because the caller cancelled
    pub cancelled: bool,
}

impl ApplyOutcome {
    pub fn succeeded(&self) -> bool {
        self.failed.is_none() && !self.cancelled
    }
}

/// Runs [`ApplyPlan`]s through a [`RemoteExecutor`].
pub struct ApplyEngine<'a> {
    executor: &'a dyn RemoteExecutor,
}

impl<'a> ApplyEngine<'a> {
    pub fn new(executor: &'a dyn RemoteExecutor) -> Self {
        Self { executor }
    }

    /// Run every step of `plan` in order.
    ///
    /// Scripts run detached from `ctx` so an in-flight script is never
    /// killed; cancellation is honored between steps.
    pub fn run(
        &self,
        ctx: &ExecContext,
        instance: &InstanceRef,
        plan: &ApplyPlan,
        progress: &mut dyn ProgressCallback,
    ) -> ApplyOutcome {
        let detached = ctx.detached();
        let mut outcome = ApplyOutcome::default();
        let total = plan.steps.len();

        for (index, step) in plan.steps.iter().enumerate() {
            if ctx.is_cancelled() {
                log::warn!(
                    "{instance}: cancelled after {} of {total} steps",
                    outcome.applied.len()
                );
                outcome.cancelled = true;
                break;
            }

            progress.on_step_start(step, index, total);
            log::debug!("{instance}: running step {}", step.id);
            let started = Instant::now();

            let failure = match self.executor.execute_script(
                &detached,
                instance,
                &step.script,
                Interpreter::Bash,
            ) {
                Ok(out) if out.success() => None,
                Ok(out) => Some(FailedStep {
                    id: step.id.clone(),
                    kind: step.kind,
                    description: step.description.clone(),
                    exit_code: Some(out.exit_code),
                    stderr: out.stderr,
                    error: None,
                }),
                Err(e) => Some(FailedStep {
                    id: step.id.clone(),
                    kind: step.kind,
                    description: step.description.clone(),
                    exit_code: None,
                    stderr: String::new(),
                    error: Some(e.to_string()),
                }),
            };

            progress.on_step_complete(step, failure.is_none());
            if let Some(failed) = failure {
                log::warn!(
                    "{instance}: step {} failed ({})",
                    failed.id,
                    failed
                        .exit_code
                        .map_or_else(|| failed.error.clone().unwrap_or_default(), |c| format!("exit {c}"))
                );
                outcome.failed = Some(failed);
                break;
            }
            outcome.applied.push(StepReport::new(step, started));
        }
        outcome
    }
}
