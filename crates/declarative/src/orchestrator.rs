//! Application orchestrator
//!
//! Drives one operation against one instance through the state machine:
//!
//! ```text
//! Idle -> Inspecting -> Diffing -> {ConflictBlocked | ReadyToApply}
//!      -> CheckpointCapturing -> Applying -> {Applied | RollingBack}
//!      -> {RolledBack | RollbackFailed}
//! ```
//!
//! The per-instance lease is taken on entry to `Inspecting` and released on
//! every exit path. Nothing is mutated before a checkpoint is persisted, and
//! every mutating run leaves a record in the instance's history.

use crate::checkpoint::{
    Checkpoint, CheckpointManager, CheckpointRequest, CheckpointSummary, RollbackReport,
    RollbackStepKind, RollbackStepReport, RollbackStepStatus,
};
use crate::context::{ConfirmCallback, NoProgress, PortOpener, ProgressCallback, ReportOnly};
use crate::diff::{ConflictCategory, Diff, compute_diff};
use crate::error::{Error, Result};
use crate::executor::{ApplyEngine, ApplyOutcome, FailedStep, StepReport};
use crate::history::{ApplicationRecord, HistoryStore, RecordStatus};
use crate::inspector::{Inspector, Targets};
use crate::lease::{LeaseGuard, LeaseStore, MemoryLeaseStore, default_owner};
use crate::managers::ManagerRegistry;
use crate::planner::{PlannedStep, StepKind, build_plan};
use crate::settings::EngineSettings;
use crate::template::DesiredTemplate;
use crate::types::InstanceState;
use chrono::Utc;
use remotekit::{ExecContext, InstanceRef, RemoteExecutor};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

/// Orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Idle,
    Inspecting,
    Diffing,
    ConflictBlocked,
    ReadyToApply,
    CheckpointCapturing,
    Applying,
    RollingBack,
    Applied,
    RolledBack,
    RollbackFailed,
}

impl Phase {
    /// Whether `next` may follow `self`.
    ///
    /// `ReadyToApply -> Applied` covers a diff with nothing to execute;
    /// `Idle -> RollingBack` is a manual rollback.
    pub fn can_advance_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Idle, Self::Inspecting | Self::RollingBack)
                | (Self::Inspecting, Self::Diffing)
                | (Self::Diffing, Self::ConflictBlocked | Self::ReadyToApply)
                | (Self::ConflictBlocked, Self::ReadyToApply)
                | (Self::ReadyToApply, Self::CheckpointCapturing | Self::Applied)
                | (Self::CheckpointCapturing, Self::Applying)
                | (Self::Applying, Self::Applied | Self::RollingBack)
                | (Self::RollingBack, Self::RolledBack | Self::RollbackFailed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Applied | Self::RolledBack | Self::RollbackFailed)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Final status of an apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApplyStatus {
    Applied,
    /// A step failed and the instance was restored to the checkpoint
    RolledBack,
    /// A step failed and so did part of the restore
    RollbackFailed,
    ConflictBlocked,
    DryRun,
    /// The confirmation callback said no
    Declined,
}

impl ApplyStatus {
    /// Applied, previewed, or deliberately not applied.
    pub fn is_success(self) -> bool {
        matches!(self, Self::Applied | Self::DryRun | Self::Declined)
    }

    fn record_status(self) -> RecordStatus {
        match self {
            Self::RolledBack => RecordStatus::RolledBack,
            Self::RollbackFailed => RecordStatus::RollbackFailed,
            _ => RecordStatus::Applied,
        }
    }
}

impl fmt::Display for ApplyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// What to apply, and how.
#[derive(Debug, Clone)]
pub struct ApplyRequest {
    pub instance: InstanceRef,
    pub template: DesiredTemplate,
    /// Stop after diffing; no checkpoint, no mutation
    pub dry_run: bool,
    /// Conflict categories the caller accepts
    pub overrides: BTreeSet<ConflictCategory>,
    /// Execute removals the template declares
    pub force_remove: bool,
}

impl ApplyRequest {
    pub fn new(instance: InstanceRef, template: DesiredTemplate) -> Self {
        Self {
            instance,
            template,
            dry_run: false,
            overrides: BTreeSet::new(),
            force_remove: false,
        }
    }
}

/// Structured report of one apply.
#[derive(Debug, Clone, Serialize)]
pub struct ApplyResult {
    pub instance: String,
    pub status: ApplyStatus,
    pub diff: Diff,
    /// Checkpoint taken before mutation, if the run got that far
    pub checkpoint_id: Option<u64>,
    pub applied_steps: Vec<StepReport>,
    pub failed_step: Option<FailedStep>,
    pub rollback_steps: Vec<RollbackStepReport>,
    /// Completed (or partially run) steps the rollback could not undo
    pub unreverted_steps: Vec<String>,
    /// Declared removals left alone because `force_remove` was off
    pub skipped_removals: Vec<String>,
    pub ports_to_open: Vec<u16>,
    pub warnings: Vec<String>,
    /// Overridden categories that actually had conflicts
    pub overrides: Vec<ConflictCategory>,
    pub transitions: Vec<Phase>,
}

impl ApplyResult {
    fn new(instance: &InstanceRef, diff: Diff) -> Self {
        Self {
            instance: instance.name.clone(),
            status: ApplyStatus::DryRun,
            ports_to_open: diff.ports_to_open.clone(),
            diff,
            checkpoint_id: None,
            applied_steps: Vec::new(),
            failed_step: None,
            rollback_steps: Vec::new(),
            unreverted_steps: Vec::new(),
            skipped_removals: Vec::new(),
            warnings: Vec::new(),
            overrides: Vec::new(),
            transitions: Vec::new(),
        }
    }
}

impl fmt::Display for ApplyResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}: {}", self.instance, self.status)?;
        for step in &self.applied_steps {
            writeln!(f, "  applied: {}", step.description)?;
        }
        if let Some(failed) = &self.failed_step {
            let why = failed
                .exit_code
                .map_or_else(|| failed.error.clone().unwrap_or_default(), |c| format!("exit {c}"));
            writeln!(f, "  failed: {} ({why})", failed.id)?;
        }
        let (done, not_done): (Vec<_>, Vec<_>) = self
            .rollback_steps
            .iter()
            .partition(|s| s.status == RollbackStepStatus::Completed);
        if !done.is_empty() {
            let kinds: Vec<String> = done.iter().map(|s| s.kind.to_string()).collect();
            writeln!(f, "  rolled back: {}", kinds.join(", "))?;
        }
        for step in not_done {
            writeln!(f, "  rollback {}: {:?} ({})", step.kind, step.status, step.detail)?;
        }
        if !self.unreverted_steps.is_empty() {
            writeln!(f, "  not reverted: {}", self.unreverted_steps.join(", "))?;
        }
        for conflict in &self.diff.conflicts {
            writeln!(f, "  conflict ({}): {}", conflict.category, conflict.description)?;
        }
        if !self.skipped_removals.is_empty() {
            writeln!(f, "  not removed: {}", self.skipped_removals.join(", "))?;
        }
        if !self.ports_to_open.is_empty() {
            let ports: Vec<String> = self.ports_to_open.iter().map(u16::to_string).collect();
            writeln!(f, "  ports to open: {}", ports.join(", "))?;
        }
        for warning in &self.warnings {
            writeln!(f, "  warning: {warning}")?;
        }

        let checkpoint = self
            .checkpoint_id
            .map_or_else(String::new, |id| format!(" #{id}"));
        let last = match self.status {
            ApplyStatus::Applied if self.applied_steps.is_empty() => "nothing to change".to_string(),
            ApplyStatus::Applied => format!(
                "{}@{} applied (checkpoint{checkpoint})",
                self.diff.template_id, self.diff.template_version
            ),
            ApplyStatus::RolledBack => format!("reverted to checkpoint{checkpoint}"),
            ApplyStatus::RollbackFailed => {
                format!("partially reverted to checkpoint{checkpoint}; manual remediation required")
            }
            ApplyStatus::ConflictBlocked => "blocked by conflicts; nothing changed".to_string(),
            ApplyStatus::DryRun => format!("dry run: {}", self.diff.summary()),
            ApplyStatus::Declined => "declined; nothing changed".to_string(),
        };
        write!(f, "  final state: {last}")
    }
}

/// Report of a manual rollback.
#[derive(Debug, Clone, Serialize)]
pub struct RollbackResult {
    pub instance: String,
    pub status: ApplyStatus,
    pub report: RollbackReport,
    /// Newer checkpoints discarded after the restore
    pub dropped: Vec<u64>,
    pub warnings: Vec<String>,
    pub transitions: Vec<Phase>,
}

impl fmt::Display for RollbackResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{}: {} to checkpoint #{}",
            self.instance, self.status, self.report.checkpoint_id
        )?;
        for step in &self.report.steps {
            writeln!(f, "  {}: {:?} ({})", step.kind, step.status, step.detail)?;
        }
        if !self.dropped.is_empty() {
            let ids: Vec<String> = self.dropped.iter().map(|id| format!("#{id}")).collect();
            writeln!(f, "  dropped checkpoints: {}", ids.join(", "))?;
        }
        for warning in self.report.warnings.iter().chain(&self.warnings) {
            writeln!(f, "  warning: {warning}")?;
        }
        Ok(())
    }
}

/// Phase bookkeeping for one run.
struct Run<'a> {
    instance: &'a InstanceRef,
    phase: Phase,
    transitions: Vec<Phase>,
    progress: &'a mut dyn ProgressCallback,
}

impl<'a> Run<'a> {
    fn new(instance: &'a InstanceRef, progress: &'a mut dyn ProgressCallback) -> Self {
        Self {
            instance,
            phase: Phase::Idle,
            transitions: vec![Phase::Idle],
            progress,
        }
    }

    fn advance(&mut self, next: Phase) -> Result<()> {
        if !self.phase.can_advance_to(next) {
            return Err(Error::InvalidTransition {
                from: self.phase.to_string(),
                to: next.to_string(),
            });
        }
        log::debug!("{}: {} -> {next}", self.instance, self.phase);
        self.phase = next;
        self.transitions.push(next);
        self.progress.on_phase(self.instance, next);
        Ok(())
    }
}

fn cancelled(ctx: &ExecContext) -> Result<()> {
    if ctx.is_cancelled() {
        return Err(Error::Cancelled);
    }
    Ok(())
}

/// Rollback steps that must complete for an apply step to count as undone.
fn undone_by(kind: StepKind) -> &'static [RollbackStepKind] {
    match kind {
        StepKind::Packages => &[RollbackStepKind::RemovePackages],
        StepKind::Users => &[RollbackStepKind::RestoreConfigFiles],
        StepKind::ServiceConfigure => &[
            RollbackStepKind::RestoreConfigFiles,
            RollbackStepKind::RestoreServices,
        ],
        StepKind::ServiceStart | StepKind::ServiceRestart => &[RollbackStepKind::RestoreServices],
    }
}

/// Applied steps, and the failed one, that the rollback did not undo.
fn unreverted_steps(outcome: &ApplyOutcome, report: &RollbackReport) -> Vec<String> {
    outcome
        .applied
        .iter()
        .map(|s| (s.id.as_str(), s.kind))
        .chain(outcome.failed.iter().map(|s| (s.id.as_str(), s.kind)))
        .filter(|(_, kind)| {
            !undone_by(*kind)
                .iter()
                .all(|k| report.status_of(*k) == Some(RollbackStepStatus::Completed))
        })
        .map(|(id, _)| id.to_string())
        .collect()
}

/// Coordinates inspection, diffing, checkpointing, apply and rollback.
pub struct Orchestrator {
    executor: Arc<dyn RemoteExecutor>,
    registry: ManagerRegistry,
    settings: EngineSettings,
    leases: Arc<dyn LeaseStore>,
    ports: Arc<dyn PortOpener>,
    owner: String,
}

impl Orchestrator {
    /// Orchestrator with the builtin managers, an in-process lease store,
    /// and a port opener that only logs.
    pub fn new(executor: Arc<dyn RemoteExecutor>, settings: EngineSettings) -> Self {
        Self {
            executor,
            registry: ManagerRegistry::builtin(),
            settings,
            leases: Arc::new(MemoryLeaseStore::new()),
            ports: Arc::new(ReportOnly),
            owner: default_owner(),
        }
    }

    #[must_use]
    pub fn with_registry(mut self, registry: ManagerRegistry) -> Self {
        self.registry = registry;
        self
    }

    #[must_use]
    pub fn with_lease_store(mut self, leases: Arc<dyn LeaseStore>) -> Self {
        self.leases = leases;
        self
    }

    #[must_use]
    pub fn with_port_opener(mut self, ports: Arc<dyn PortOpener>) -> Self {
        self.ports = ports;
        self
    }

    #[must_use]
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    fn lease(&self, instance: &InstanceRef) -> Result<LeaseGuard> {
        LeaseGuard::acquire(
            Arc::clone(&self.leases),
            &instance.name,
            &self.owner,
            self.settings.lease_ttl(),
        )
    }

    fn renew(&self, lease: &mut LeaseGuard, warnings: &mut Vec<String>) {
        renew_lease(lease, self.settings.lease_ttl(), warnings);
    }

    fn checkpoints_mgr(&self) -> CheckpointManager<'_> {
        CheckpointManager::new(self.executor.as_ref(), &self.registry, &self.settings)
    }

    fn history_store(&self) -> HistoryStore<'_> {
        HistoryStore::new(self.executor.as_ref(), &self.settings.history_path)
    }

    /// Apply a template.
    ///
    /// Errors are returned only for failures that happen before any mutation
    /// (inspection, bad template, lease, checkpoint, cancellation). Once the
    /// first step has run, every outcome is reported through [`ApplyResult`].
    pub fn apply(
        &self,
        ctx: &ExecContext,
        request: &ApplyRequest,
        progress: &mut dyn ProgressCallback,
        confirm: &mut dyn ConfirmCallback,
    ) -> Result<ApplyResult> {
        let instance = &request.instance;
        let mut run = Run::new(instance, progress);
        cancelled(ctx)?;

        run.advance(Phase::Inspecting)?;
        let mut lease = self.lease(instance)?;
        let targets = request.template.targets();
        let state = Inspector::new(self.executor.as_ref(), &self.registry, &self.settings)
            .inspect(ctx, instance, &targets)?;
        cancelled(ctx)?;

        run.advance(Phase::Diffing)?;
        let diff = compute_diff(&state, &request.template, &self.registry, &self.settings)?;
        let mut result = ApplyResult::new(instance, diff);
        result.warnings.extend(state.warnings.iter().cloned());

        let blocking = result.diff.blocking_conflicts(&request.overrides).len();
        if !result.diff.conflicts.is_empty() {
            run.advance(Phase::ConflictBlocked)?;
        }
        if blocking > 0 {
            log::warn!("{instance}: {blocking} blocking conflict(s)");
            result.status = ApplyStatus::ConflictBlocked;
            result.transitions = run.transitions;
            return Ok(result);
        }
        let overridden: BTreeSet<ConflictCategory> =
            result.diff.conflicts.iter().map(|c| c.category).collect();
        for category in &overridden {
            log::warn!("{instance}: overriding {category} conflicts");
        }
        result.overrides = overridden.into_iter().collect();

        run.advance(Phase::ReadyToApply)?;
        let plan = build_plan(
            &result.diff,
            &self.registry,
            &self.settings,
            request.force_remove,
        )?;
        result.skipped_removals.clone_from(&plan.skipped_removals);
        result.warnings.extend(plan.warnings.iter().cloned());

        if request.dry_run {
            result.status = ApplyStatus::DryRun;
            result.transitions = run.transitions;
            return Ok(result);
        }

        if plan.is_empty() {
            self.open_ports(instance, &result.ports_to_open, &mut result.warnings);
            run.advance(Phase::Applied)?;
            result.status = ApplyStatus::Applied;
            result.transitions = run.transitions;
            return Ok(result);
        }

        if !confirm.confirm(instance, &result.diff)? {
            log::info!("{instance}: apply declined");
            result.status = ApplyStatus::Declined;
            result.transitions = run.transitions;
            return Ok(result);
        }
        cancelled(ctx)?;

        self.renew(&mut lease, &mut result.warnings);
        run.advance(Phase::CheckpointCapturing)?;
        let checkpoint = self.checkpoints_mgr().create(
            ctx,
            instance,
            CheckpointRequest {
                state: &state,
                template_id: Some(&request.template.id),
                targets,
                services: touched_services(&result.diff),
            },
        )?;
        result.checkpoint_id = Some(checkpoint.id);
        cancelled(ctx)?;

        run.advance(Phase::Applying)?;
        let outcome = {
            let mut renewing = RenewingProgress {
                inner: &mut *run.progress,
                lease: &mut lease,
                ttl: self.settings.lease_ttl(),
                warnings: &mut result.warnings,
            };
            ApplyEngine::new(self.executor.as_ref()).run(ctx, instance, &plan, &mut renewing)
        };
        result.applied_steps.clone_from(&outcome.applied);
        result.failed_step.clone_from(&outcome.failed);

        if outcome.succeeded() {
            run.advance(Phase::Applied)?;
            result.status = ApplyStatus::Applied;
            self.record(&ctx.detached(), instance, &checkpoint, &mut result);
            self.open_ports(instance, &result.ports_to_open, &mut result.warnings);
            log::info!("{instance}: applied {}", result.diff.summary());
            result.transitions = run.transitions;
            return Ok(result);
        }

        run.advance(Phase::RollingBack)?;
        // A cancelled apply still has to be undone, so its rollback ignores the token
        let rollback_ctx = if outcome.cancelled {
            result.warnings.push(format!(
                "cancelled during apply; restoring checkpoint #{}",
                checkpoint.id
            ));
            ctx.detached()
        } else {
            ctx.clone()
        };
        let report = self.checkpoints_mgr().restore(&rollback_ctx, instance, &checkpoint);
        let restored = report.succeeded();
        result.unreverted_steps = unreverted_steps(&outcome, &report);
        result.warnings.extend(report.warnings.iter().cloned());
        result.rollback_steps = report.steps;

        if !restored {
            run.advance(Phase::RollbackFailed)?;
            result.status = ApplyStatus::RollbackFailed;
            log::error!(
                "{instance}: rollback to checkpoint #{} incomplete; not reverted: {}",
                checkpoint.id,
                result.unreverted_steps.join(", ")
            );
        } else {
            run.advance(Phase::RolledBack)?;
            result.status = ApplyStatus::RolledBack;
            log::warn!("{instance}: apply failed, restored checkpoint #{}", checkpoint.id);
        }
        self.record(&rollback_ctx.detached(), instance, &checkpoint, &mut result);
        result.transitions = run.transitions;
        Ok(result)
    }

    /// Diff a template against the instance without changing anything.
    pub fn preview(
        &self,
        ctx: &ExecContext,
        instance: &InstanceRef,
        template: &DesiredTemplate,
    ) -> Result<ApplyResult> {
        let mut request = ApplyRequest::new(instance.clone(), template.clone());
        request.dry_run = true;
        self.apply(ctx, &request, &mut NoProgress, &mut crate::context::AutoDecline)
    }

    /// Fresh snapshot of the instance. Read-only, so no lease is taken.
    pub fn inspect(
        &self,
        ctx: &ExecContext,
        instance: &InstanceRef,
        targets: &Targets,
    ) -> Result<InstanceState> {
        Inspector::new(self.executor.as_ref(), &self.registry, &self.settings)
            .inspect(ctx, instance, targets)
    }

    /// Restore a checkpoint (the latest when `checkpoint_id` is `None`).
    ///
    /// On success, checkpoints newer than the target are discarded.
    pub fn rollback(
        &self,
        ctx: &ExecContext,
        instance: &InstanceRef,
        checkpoint_id: Option<u64>,
        progress: &mut dyn ProgressCallback,
    ) -> Result<RollbackResult> {
        let mut run = Run::new(instance, progress);
        cancelled(ctx)?;
        let _lease = self.lease(instance)?;

        let manager = self.checkpoints_mgr();
        let checkpoint = match checkpoint_id {
            Some(id) => manager.load(ctx, instance, id)?,
            None => manager
                .latest(ctx, instance)?
                .ok_or_else(|| Error::checkpoint(format!("{instance} has no checkpoints")))?,
        };

        run.advance(Phase::RollingBack)?;
        let report = manager.restore(ctx, instance, &checkpoint);
        let mut warnings = Vec::new();
        let mut dropped = Vec::new();

        let status = if report.succeeded() {
            run.advance(Phase::RolledBack)?;
            match manager.drop_after(&ctx.detached(), instance, checkpoint.id) {
                Ok(ids) => dropped = ids,
                Err(e) => warnings.push(format!("could not discard newer checkpoints: {e}")),
            }
            ApplyStatus::RolledBack
        } else {
            run.advance(Phase::RollbackFailed)?;
            ApplyStatus::RollbackFailed
        };

        let record = self.rollback_record(&ctx.detached(), instance, &checkpoint, status);
        if let Err(e) = self.history_store().append(&ctx.detached(), instance, record) {
            warnings.push(format!("history not updated: {e}"));
        }

        Ok(RollbackResult {
            instance: instance.name.clone(),
            status,
            report,
            dropped,
            warnings,
            transitions: run.transitions,
        })
    }

    /// Checkpoints recorded on the instance, oldest first.
    pub fn checkpoints(&self, ctx: &ExecContext, instance: &InstanceRef) -> Result<Vec<CheckpointSummary>> {
        self.checkpoints_mgr().list(ctx, instance)
    }

    /// Application history of the instance, plus a warning if it was malformed.
    pub fn history(
        &self,
        ctx: &ExecContext,
        instance: &InstanceRef,
    ) -> Result<(Vec<ApplicationRecord>, Option<String>)> {
        self.history_store().load(ctx, instance)
    }

    fn open_ports(&self, instance: &InstanceRef, ports: &[u16], warnings: &mut Vec<String>) {
        if ports.is_empty() {
            return;
        }
        if let Err(e) = self.ports.open_ports(instance, ports) {
            log::warn!("{instance}: opening ports failed: {e}");
            warnings.push(format!("ports {ports:?} were not opened: {e}"));
        }
    }

    fn record(
        &self,
        ctx: &ExecContext,
        instance: &InstanceRef,
        checkpoint: &Checkpoint,
        result: &mut ApplyResult,
    ) {
        let record = ApplicationRecord {
            template_id: result.diff.template_id.clone(),
            template_version: result.diff.template_version.clone(),
            applied_at: Utc::now(),
            checkpoint_id: checkpoint.id,
            status: result.status.record_status(),
            overrides: result.overrides.clone(),
            diff_summary: Some(result.diff.summary()),
        };
        if let Err(e) = self.history_store().append(ctx, instance, record) {
            log::warn!("{instance}: history not updated: {e}");
            result.warnings.push(format!("history not updated: {e}"));
        }
    }

    fn rollback_record(
        &self,
        ctx: &ExecContext,
        instance: &InstanceRef,
        checkpoint: &Checkpoint,
        status: ApplyStatus,
    ) -> ApplicationRecord {
        // The version comes from the apply that took this checkpoint
        let version = self
            .history_store()
            .load(ctx, instance)
            .ok()
            .and_then(|(records, _)| {
                records
                    .into_iter()
                    .rev()
                    .find(|r| r.checkpoint_id == checkpoint.id)
                    .map(|r| r.template_version)
            })
            .unwrap_or_default();
        ApplicationRecord {
            template_id: checkpoint.template_id.clone().unwrap_or_default(),
            template_version: version,
            applied_at: Utc::now(),
            checkpoint_id: checkpoint.id,
            status: status.record_status(),
            overrides: Vec::new(),
            diff_summary: Some(format!("manual rollback to checkpoint #{}", checkpoint.id)),
        }
    }
}

fn renew_lease(lease: &mut LeaseGuard, ttl: std::time::Duration, warnings: &mut Vec<String>) {
    if let Err(e) = lease.renew(ttl) {
        let instance = &lease.lease().instance;
        log::warn!("{instance}: lease not renewed: {e}");
        warnings.push(format!("lease not renewed: {e}"));
    }
}

/// Renews the run's lease before each step so long applies keep it.
struct RenewingProgress<'a, 'p> {
    inner: &'a mut (dyn ProgressCallback + 'p),
    lease: &'a mut LeaseGuard,
    ttl: std::time::Duration,
    warnings: &'a mut Vec<String>,
}

impl ProgressCallback for RenewingProgress<'_, '_> {
    fn on_phase(&mut self, instance: &InstanceRef, phase: Phase) {
        self.inner.on_phase(instance, phase);
    }

    fn on_step_start(&mut self, step: &PlannedStep, index: usize, total: usize) {
        renew_lease(self.lease, self.ttl, self.warnings);
        self.inner.on_step_start(step, index, total);
    }

    fn on_step_complete(&mut self, step: &PlannedStep, success: bool) {
        self.inner.on_step_complete(step, success);
    }
}

/// Services the diff configures, starts, or restarts.
fn touched_services(diff: &Diff) -> Vec<String> {
    let mut seen = BTreeSet::new();
    diff.services_to_configure
        .iter()
        .map(|c| &c.name)
        .chain(&diff.services_to_start)
        .chain(&diff.services_to_restart)
        .filter(|name| seen.insert(name.as_str()))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{AutoConfirm, AutoDecline};
    use crate::history;
    use crate::planner::STEP_MARKER;
    use crate::template::{PackageSet, UserSpec};
    use crate::testing::{GROUP, PASSWD, fresh_instance, instance, template};
    use remotekit::{CallKind, ExecOutput, ScriptedExecutor};
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    const HISTORY: &str = "/var/lib/retrofit/history.json";

    fn orchestrator(exec: &Arc<ScriptedExecutor>) -> Orchestrator {
        let executor: Arc<dyn RemoteExecutor> = exec.clone();
        Orchestrator::new(executor, EngineSettings::default()).with_owner("test")
    }

    fn apply(orch: &Orchestrator, request: &ApplyRequest) -> Result<ApplyResult> {
        orch.apply(&ExecContext::default(), request, &mut NoProgress, &mut AutoConfirm)
    }

    fn history_of(exec: &ScriptedExecutor) -> Vec<ApplicationRecord> {
        exec.remote_file(HISTORY)
            .map(|bytes| history::parse(&bytes).unwrap())
            .unwrap_or_default()
    }

    /// Make the fake instance look like `template()` was applied.
    fn converge(exec: &ScriptedExecutor) {
        exec.on_command(
            "conda list --json",
            r#"[{"name":"numpy","version":"1.26.4"},{"name":"pandas","version":"2.2.0"},{"name":"scipy","version":"1.12.0"}]"#,
        )
        .on_command(
            "list-units",
            "ssh.service loaded active running S\njupyter.service loaded active running J\n",
        )
        .on_command(
            "list-unit-files",
            "ssh.service enabled enabled\njupyter.service enabled enabled\n",
        )
        .on_command(
            "for f in /etc/systemd/system",
            "### /etc/systemd/system/jupyter.service.d/retrofit.conf\n[Service]\nEnvironment=JUPYTER_PORT=8888\n\n",
        )
        .on_command(
            "getent passwd",
            &format!("{PASSWD}researcher:x:5000:5000::/home/researcher:/bin/bash\n"),
        )
        .on_command(
            "getent group",
            &format!("{GROUP}researcher:x:5000:\nresearch:x:5001:researcher\n"),
        )
        .on_command(
            "ss -H -tlnp",
            "LISTEN 0 128 0.0.0.0:22 0.0.0.0:* users:((\"sshd\",pid=812,fd=3))\n\
             LISTEN 0 128 0.0.0.0:8888 0.0.0.0:* users:((\"jupyter\",pid=901,fd=5))\n",
        );
    }

    #[test]
    fn test_transition_table() {
        assert!(Phase::Idle.can_advance_to(Phase::Inspecting));
        assert!(Phase::ConflictBlocked.can_advance_to(Phase::ReadyToApply));
        assert!(Phase::Applying.can_advance_to(Phase::RollingBack));
        assert!(!Phase::Inspecting.can_advance_to(Phase::Applying));
        assert!(!Phase::ReadyToApply.can_advance_to(Phase::Applying));
        assert!(!Phase::Applied.can_advance_to(Phase::RollingBack));
        assert!(Phase::RollbackFailed.is_terminal());

        let target = instance();
        let mut progress = NoProgress;
        let mut run = Run::new(&target, &mut progress);
        let err = run.advance(Phase::Applying).unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { ref from, ref to } if from == "Idle" && to == "Applying"));
    }

    #[test]
    fn test_scenario_a_install_into_absent_manager() {
        let exec = Arc::new(fresh_instance());
        exec.on_command_output("conda list --json", ExecOutput::failed(127, ""));
        let mut packages = BTreeMap::new();
        packages.insert(
            "conda".to_string(),
            PackageSet {
                target: None,
                install: vec!["numpy".into()],
                remove: vec![],
            },
        );
        let template = DesiredTemplate {
            id: "numpy-only".into(),
            version: "1.0.0".into(),
            packages,
            services: vec![],
            users: vec![],
            ports: vec![],
        };

        let result = apply(&orchestrator(&exec), &ApplyRequest::new(instance(), template)).unwrap();
        assert_eq!(result.status, ApplyStatus::Applied, "{result}");
        assert!(result.diff.conflicts.is_empty());
        assert_eq!(result.diff.packages["conda"].install[0].name, "numpy");
        assert_eq!(result.checkpoint_id, Some(1));
        assert_eq!(exec.scripts_containing("conda install -y numpy").len(), 1);

        let records = history_of(&exec);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, RecordStatus::Applied);
        assert_eq!(records[0].checkpoint_id, 1);
        assert_eq!(records[0].template_id, "numpy-only");
    }

    #[test]
    fn test_scenario_b_system_account_collision_blocks() {
        let exec = Arc::new(fresh_instance());
        exec.on_command(
            "getent passwd",
            &format!("{PASSWD}alice:x:200:200::/home/alice:/bin/bash\n"),
        );
        let mut template = template();
        template.users = vec![UserSpec {
            name: "alice".into(),
            uid: Some(5001),
            groups: vec![],
            shell: None,
        }];

        let result = apply(&orchestrator(&exec), &ApplyRequest::new(instance(), template)).unwrap();
        assert_eq!(result.status, ApplyStatus::ConflictBlocked);
        assert_eq!(result.diff.conflicts.len(), 1);
        assert_eq!(result.diff.conflicts[0].category, ConflictCategory::User);
        assert_eq!(result.checkpoint_id, None);
        assert_eq!(result.transitions.last(), Some(&Phase::ConflictBlocked));
        assert!(exec.mutating_calls().is_empty());
        assert!(history_of(&exec).is_empty());
    }

    #[test]
    fn test_override_is_recorded() {
        let exec = Arc::new(fresh_instance());
        exec.on_command(
            "getent passwd",
            &format!("{PASSWD}alice:x:200:200::/home/alice:/bin/bash\n"),
        );
        let mut tpl = template();
        tpl.users = vec![UserSpec {
            name: "alice".into(),
            uid: None,
            groups: vec!["research".into()],
            shell: None,
        }];
        let mut request = ApplyRequest::new(instance(), tpl);
        request.overrides.insert(ConflictCategory::User);

        let result = apply(&orchestrator(&exec), &request).unwrap();
        assert_eq!(result.status, ApplyStatus::Applied, "{result}");
        assert_eq!(result.overrides, vec![ConflictCategory::User]);
        assert!(result.transitions.contains(&Phase::ConflictBlocked));
        // Only additive group membership for the pre-existing account
        let users = exec.scripts_containing("usermod -a -G research alice");
        assert_eq!(users.len(), 1);
        assert!(!users[0].contains("useradd"));
        assert_eq!(history_of(&exec)[0].overrides, vec![ConflictCategory::User]);

        // Re-applying once alice is in research changes nothing
        converge(&exec);
        exec.on_command(
            "getent passwd",
            &format!("{PASSWD}alice:x:200:200::/home/alice:/bin/bash
"),
        )
        .on_command(
            "getent group",
            &format!("{GROUP}alice:x:200:
research:x:5001:alice
"),
        );
        let before = exec.mutating_calls().len();
        let again = apply(&orchestrator(&exec), &request).unwrap();
        assert_eq!(again.status, ApplyStatus::Applied, "{again}");
        assert!(!again.diff.has_changes(), "{}", again.diff.summary());
        assert_eq!(again.checkpoint_id, None);
        assert_eq!(exec.mutating_calls().len(), before);
        assert_eq!(history_of(&exec).len(), 1);
    }

    #[test]
    fn test_scenario_c_service_start_failure_rolls_back() {
        let exec = Arc::new(fresh_instance());
        exec.on_script("systemctl start jupyter", ExecOutput::failed(1, "Job for jupyter.service failed.\n"));
        let mut tpl = template();
        tpl.users.clear();

        let result = apply(&orchestrator(&exec), &ApplyRequest::new(instance(), tpl)).unwrap();
        assert_eq!(result.status, ApplyStatus::RolledBack, "{result}");
        assert_eq!(result.applied_steps[0].id, "packages:conda");
        assert_eq!(result.applied_steps[0].subjects, vec!["numpy", "pandas", "scipy"]);
        let failed = result.failed_step.as_ref().unwrap();
        assert_eq!(failed.id, "service-start:jupyter");
        assert_eq!(failed.exit_code, Some(1));
        assert!(result.rollback_steps.iter().all(|s| s.status == RollbackStepStatus::Completed));
        assert!(result.unreverted_steps.is_empty());

        let report = result.to_string();
        assert!(report.contains("failed: service-start:jupyter (exit 1)"));
        assert!(report.contains("final state: reverted to checkpoint #1"));

        let records = history_of(&exec);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, RecordStatus::RolledBack);
        assert_eq!(
            result.transitions[result.transitions.len() - 3..],
            [Phase::Applying, Phase::RollingBack, Phase::RolledBack]
        );
    }

    #[test]
    fn test_failed_rollback_lists_unreverted_steps() {
        let exec = Arc::new(fresh_instance());
        exec.on_script("systemctl start jupyter", ExecOutput::failed(1, "failed"));
        // Service restore fails: the rollback cannot re-read unit state
        exec.transport_error("list-units", "connection reset", None);
        let orch = orchestrator(&exec);
        let mut tpl = template();
        tpl.users.clear();

        let result = apply(&orch, &ApplyRequest::new(instance(), tpl));
        // list-units failing only degrades inspection to a warning
        let result = result.unwrap();
        assert_eq!(result.status, ApplyStatus::RollbackFailed, "{result}");
        assert_eq!(
            result.unreverted_steps,
            vec!["services:configure", "service-start:jupyter"]
        );
        assert!(result.to_string().contains("manual remediation required"));
        assert_eq!(history_of(&exec)[0].status, RecordStatus::RollbackFailed);
    }

    #[test]
    fn test_idempotent_second_apply() {
        let exec = Arc::new(fresh_instance());
        let orch = orchestrator(&exec);
        let first = apply(&orch, &ApplyRequest::new(instance(), template())).unwrap();
        assert_eq!(first.status, ApplyStatus::Applied, "{first}");
        assert_eq!(first.ports_to_open, vec![8888]);

        converge(&exec);
        let second = orch.preview(&ExecContext::default(), &instance(), &template()).unwrap();
        assert!(second.diff.is_empty(), "{}", second.diff.summary());

        let before = exec.mutating_calls().len();
        let third = apply(&orch, &ApplyRequest::new(instance(), template())).unwrap();
        assert_eq!(third.status, ApplyStatus::Applied);
        assert_eq!(third.checkpoint_id, None);
        assert_eq!(exec.mutating_calls().len(), before);
        assert_eq!(history_of(&exec).len(), 1);
    }

    #[test]
    fn test_declared_removal_needs_force() {
        let exec = Arc::new(fresh_instance());
        exec.on_command("conda list --json", r#"[{"name":"tensorflow","version":"2.15.0"}]"#);
        let mut tpl = template();
        tpl.packages.get_mut("conda").unwrap().remove = vec!["tensorflow".into()];
        let orch = orchestrator(&exec);

        let result = apply(&orch, &ApplyRequest::new(instance(), tpl.clone())).unwrap();
        assert_eq!(result.skipped_removals, vec!["conda:tensorflow"]);
        assert!(exec.scripts_containing("conda remove").is_empty());

        let mut forced = ApplyRequest::new(instance(), tpl);
        forced.force_remove = true;
        apply(&orch, &forced).unwrap();
        assert_eq!(exec.scripts_containing("conda remove -y tensorflow").len(), 1);
    }

    #[test]
    fn test_checkpoint_precedes_first_mutation() {
        let exec = Arc::new(fresh_instance());
        apply(&orchestrator(&exec), &ApplyRequest::new(instance(), template())).unwrap();

        let calls = exec.mutating_calls();
        let index_upload = calls
            .iter()
            .position(|c| c.kind == CallKind::Upload && c.body.ends_with("checkpoints/index.json"))
            .unwrap();
        let first_step = calls
            .iter()
            .position(|c| c.kind == CallKind::Script && c.body.contains(STEP_MARKER))
            .unwrap();
        assert!(index_upload < first_step);
        assert!(calls[..index_upload]
            .iter()
            .all(|c| c.kind == CallKind::Upload && c.body.starts_with("/var/lib/retrofit/checkpoints/1/")));
    }

    #[test]
    fn test_rollback_restores_config_and_services() {
        struct GrowGroupFile<'a>(&'a ScriptedExecutor);
        impl ProgressCallback for GrowGroupFile<'_> {
            fn on_phase(&mut self, _: &InstanceRef, _: Phase) {}
            fn on_step_start(&mut self, _: &PlannedStep, _: usize, _: usize) {}
            fn on_step_complete(&mut self, step: &PlannedStep, _: bool) {
                if step.id == "users" {
                    self.0
                        .put_remote_file("/etc/group", format!("{GROUP}research:x:5001:researcher\n"));
                }
            }
        }

        let exec = Arc::new(fresh_instance());
        exec.on_script("systemctl start jupyter", ExecOutput::failed(1, "failed"));
        let orch = orchestrator(&exec);
        let mut progress = GrowGroupFile(&exec);
        let result = orch
            .apply(
                &ExecContext::default(),
                &ApplyRequest::new(instance(), template()),
                &mut progress,
                &mut AutoConfirm,
            )
            .unwrap();

        assert_eq!(result.status, ApplyStatus::RolledBack, "{result}");
        assert_eq!(exec.remote_file("/etc/group").unwrap(), GROUP.as_bytes());
        assert_eq!(
            exec.scripts_containing("rm -f -- /etc/systemd/system/jupyter.service.d/retrofit.conf")
                .len(),
            1
        );
    }

    #[test]
    fn test_lease_is_exclusive() {
        let exec = Arc::new(fresh_instance());
        let leases: Arc<dyn LeaseStore> = Arc::new(MemoryLeaseStore::new());
        let held = leases
            .acquire("lab-1", "someone-else", std::time::Duration::from_secs(60))
            .unwrap();
        let orch = orchestrator(&exec).with_lease_store(Arc::clone(&leases));

        let err = apply(&orch, &ApplyRequest::new(instance(), template())).unwrap_err();
        assert!(matches!(err, Error::LeaseHeld { ref owner, .. } if owner == "someone-else"));
        assert!(exec.calls().is_empty());

        leases.release(&held).unwrap();
        assert!(apply(&orch, &ApplyRequest::new(instance(), template())).is_ok());
        // Released again once the run is over
        assert!(leases.acquire("lab-1", "next", std::time::Duration::from_secs(60)).is_ok());
    }

    #[test]
    fn test_dry_run_has_no_side_effects() {
        let exec = Arc::new(fresh_instance());
        let result = orchestrator(&exec)
            .preview(&ExecContext::default(), &instance(), &template())
            .unwrap();
        assert_eq!(result.status, ApplyStatus::DryRun);
        assert!(result.diff.has_changes());
        assert_eq!(result.transitions.last(), Some(&Phase::ReadyToApply));
        assert!(exec.mutating_calls().is_empty());
    }

    #[test]
    fn test_declined_confirmation_changes_nothing() {
        let exec = Arc::new(fresh_instance());
        let result = orchestrator(&exec)
            .apply(
                &ExecContext::default(),
                &ApplyRequest::new(instance(), template()),
                &mut NoProgress,
                &mut AutoDecline,
            )
            .unwrap();
        assert_eq!(result.status, ApplyStatus::Declined);
        assert!(result.status.is_success());
        assert!(exec.mutating_calls().is_empty());
    }

    #[test]
    fn test_cancelled_before_apply() {
        let exec = Arc::new(fresh_instance());
        let ctx = ExecContext::default();
        ctx.token().cancel();
        let err = orchestrator(&exec)
            .apply(&ctx, &ApplyRequest::new(instance(), template()), &mut NoProgress, &mut AutoConfirm)
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Cancelled);
        assert!(exec.mutating_calls().is_empty());
    }

    #[test]
    fn test_cancel_during_apply_rolls_back() {
        struct CancelAfterPackages(remotekit::CancelToken);
        impl ProgressCallback for CancelAfterPackages {
            fn on_phase(&mut self, _: &InstanceRef, _: Phase) {}
            fn on_step_start(&mut self, _: &PlannedStep, _: usize, _: usize) {}
            fn on_step_complete(&mut self, _: &PlannedStep, _: bool) {
                self.0.cancel();
            }
        }

        let exec = Arc::new(fresh_instance());
        let ctx = ExecContext::default();
        let mut progress = CancelAfterPackages(ctx.token().clone());
        let result = orchestrator(&exec)
            .apply(&ctx, &ApplyRequest::new(instance(), template()), &mut progress, &mut AutoConfirm)
            .unwrap();

        assert_eq!(result.status, ApplyStatus::RolledBack, "{result}");
        assert_eq!(result.applied_steps.len(), 1);
        assert!(result.failed_step.is_none());
        assert!(result.warnings.iter().any(|w| w.contains("cancelled during apply")));
    }

    #[test]
    fn test_cancel_during_last_step_still_records_history() {
        struct CancelOnLastStep(remotekit::CancelToken);
        impl ProgressCallback for CancelOnLastStep {
            fn on_phase(&mut self, _: &InstanceRef, _: Phase) {}
            fn on_step_start(&mut self, _: &PlannedStep, index: usize, total: usize) {
                if index + 1 == total {
                    self.0.cancel();
                }
            }
            fn on_step_complete(&mut self, _: &PlannedStep, _: bool) {}
        }

        let exec = Arc::new(fresh_instance());
        let ctx = ExecContext::default();
        let mut progress = CancelOnLastStep(ctx.token().clone());
        let result = orchestrator(&exec)
            .apply(&ctx, &ApplyRequest::new(instance(), template()), &mut progress, &mut AutoConfirm)
            .unwrap();

        assert_eq!(result.status, ApplyStatus::Applied, "{result}");
        assert!(!result.warnings.iter().any(|w| w.contains("history")), "{result}");
        let records = history_of(&exec);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, RecordStatus::Applied);
        assert_eq!(records[0].checkpoint_id, 1);
    }

    #[test]
    fn test_lease_is_renewed_between_steps() {
        struct CountingLeases {
            inner: MemoryLeaseStore,
            renewals: Mutex<usize>,
        }
        impl LeaseStore for CountingLeases {
            fn acquire(&self, instance: &str, owner: &str, ttl: std::time::Duration) -> Result<crate::Lease> {
                self.inner.acquire(instance, owner, ttl)
            }
            fn renew(&self, lease: &crate::Lease, ttl: std::time::Duration) -> Result<crate::Lease> {
                *self.renewals.lock().unwrap() += 1;
                self.inner.renew(lease, ttl)
            }
            fn release(&self, lease: &crate::Lease) -> Result<()> {
                self.inner.release(lease)
            }
        }

        let exec = Arc::new(fresh_instance());
        let leases = Arc::new(CountingLeases {
            inner: MemoryLeaseStore::new(),
            renewals: Mutex::new(0),
        });
        let store: Arc<dyn LeaseStore> = leases.clone();
        let orch = orchestrator(&exec).with_lease_store(store);

        let result = apply(&orch, &ApplyRequest::new(instance(), template())).unwrap();
        assert_eq!(result.status, ApplyStatus::Applied, "{result}");
        // Once before the checkpoint, then before every step
        assert_eq!(*leases.renewals.lock().unwrap(), result.applied_steps.len() + 1);
        assert!(leases.inner.acquire("lab-1", "next", std::time::Duration::from_secs(60)).is_ok());
    }

    #[test]
    fn test_checkpoint_failure_prevents_mutation() {
        let exec = Arc::new(fresh_instance());
        exec.transport_error("/etc/shadow", "permission denied", None);
        let err = apply(&orchestrator(&exec), &ApplyRequest::new(instance(), template())).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::CheckpointFailure);
        assert!(exec.mutating_calls().is_empty());
        assert!(exec.scripts_containing(STEP_MARKER).is_empty());
    }

    #[test]
    fn test_inspection_failure_is_fatal() {
        let exec = Arc::new(ScriptedExecutor::new());
        exec.transport_error("", "no route to host", None);
        let err = apply(&orchestrator(&exec), &ApplyRequest::new(instance(), template())).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InspectionFailure);
        assert!(exec.mutating_calls().is_empty());
    }

    #[test]
    fn test_manual_rollback_drops_newer_checkpoints() {
        let exec = Arc::new(fresh_instance());
        let orch = orchestrator(&exec);
        let phases = Arc::new(Mutex::new(Vec::new()));

        struct Phases(Arc<Mutex<Vec<Phase>>>);
        impl ProgressCallback for Phases {
            fn on_phase(&mut self, _: &InstanceRef, phase: Phase) {
                self.0.lock().unwrap().push(phase);
            }
            fn on_step_start(&mut self, _: &PlannedStep, _: usize, _: usize) {}
            fn on_step_complete(&mut self, _: &PlannedStep, _: bool) {}
        }

        apply(&orch, &ApplyRequest::new(instance(), template())).unwrap();
        let mut tpl = template();
        tpl.version = "1.3.0".into();
        tpl.packages.get_mut("conda").unwrap().install.push("torch".into());
        apply(&orch, &ApplyRequest::new(instance(), tpl)).unwrap();
        assert_eq!(orch.checkpoints(&ExecContext::default(), &instance()).unwrap().len(), 2);

        let result = orch
            .rollback(&ExecContext::default(), &instance(), Some(1), &mut Phases(Arc::clone(&phases)))
            .unwrap();
        assert_eq!(result.status, ApplyStatus::RolledBack, "{result}");
        assert_eq!(result.dropped, vec![2]);
        assert_eq!(*phases.lock().unwrap(), vec![Phase::RollingBack, Phase::RolledBack]);

        let (records, warning) = orch.history(&ExecContext::default(), &instance()).unwrap();
        assert!(warning.is_none());
        assert_eq!(records.len(), 3);
        assert_eq!(records[2].status, RecordStatus::RolledBack);
        assert_eq!(records[2].template_version, "1.2.0");
        assert_eq!(orch.checkpoints(&ExecContext::default(), &instance()).unwrap().len(), 1);
    }

    #[test]
    fn test_cancelled_manual_rollback_keeps_record_version() {
        struct CancelWhenRestored(remotekit::CancelToken);
        impl ProgressCallback for CancelWhenRestored {
            fn on_phase(&mut self, _: &InstanceRef, phase: Phase) {
                if phase == Phase::RolledBack {
                    self.0.cancel();
                }
            }
            fn on_step_start(&mut self, _: &PlannedStep, _: usize, _: usize) {}
            fn on_step_complete(&mut self, _: &PlannedStep, _: bool) {}
        }

        let exec = Arc::new(fresh_instance());
        let orch = orchestrator(&exec);
        apply(&orch, &ApplyRequest::new(instance(), template())).unwrap();

        let ctx = ExecContext::default();
        let mut progress = CancelWhenRestored(ctx.token().clone());
        let result = orch.rollback(&ctx, &instance(), None, &mut progress).unwrap();
        assert_eq!(result.status, ApplyStatus::RolledBack, "{result}");
        assert!(result.warnings.is_empty(), "{result}");

        let records = history_of(&exec);
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].status, RecordStatus::RolledBack);
        assert_eq!(records[1].template_version, "1.2.0");
    }

    #[test]
    fn test_rollback_without_checkpoints() {
        let exec = Arc::new(fresh_instance());
        let err = orchestrator(&exec)
            .rollback(&ExecContext::default(), &instance(), None, &mut NoProgress)
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::CheckpointFailure);
    }

    #[test]
    fn test_port_opener_failure_is_a_warning() {
        struct Refuse;
        impl PortOpener for Refuse {
            fn open_ports(&self, _: &InstanceRef, _: &[u16]) -> std::result::Result<(), String> {
                Err("quota exceeded".to_string())
            }
        }

        let exec = Arc::new(fresh_instance());
        let orch = orchestrator(&exec).with_port_opener(Arc::new(Refuse));
        let result = apply(&orch, &ApplyRequest::new(instance(), template())).unwrap();
        assert_eq!(result.status, ApplyStatus::Applied);
        assert!(result.warnings.iter().any(|w| w.contains("quota exceeded")));
    }
}
