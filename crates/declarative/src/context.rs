//! Provider traits for the orchestrator
//!
//! These traits let the engine report progress, ask for confirmation, and
//! hand ports to a network collaborator without depending on a terminal UI
//! or a cloud SDK.

use crate::diff::Diff;
use crate::error::Result;
use crate::orchestrator::Phase;
use crate::planner::PlannedStep;
use remotekit::InstanceRef;

/// Progress callback for apply and rollback.
///
/// Implement this trait to receive progress updates during an operation.
pub trait ProgressCallback: Send {
    /// Called on every state machine transition
    fn on_phase(&mut self, instance: &InstanceRef, phase: Phase);

    /// Called before a remote step starts (`index` is zero-based)
    fn on_step_start(&mut self, step: &PlannedStep, index: usize, total: usize);

    /// Called after a remote step finished, successfully or not
    fn on_step_complete(&mut self, step: &PlannedStep, success: bool);
}

/// Confirmation callback, asked once a non-empty, unblocked diff is known.
pub trait ConfirmCallback: Send {
    /// Return `true` to go ahead with checkpoint and apply.
    fn confirm(&mut self, instance: &InstanceRef, diff: &Diff) -> Result<bool>;
}

/// External collaborator that opens network ports.
///
/// The engine never changes firewall or security-group rules itself.
pub trait PortOpener: Send + Sync {
    fn open_ports(&self, instance: &InstanceRef, ports: &[u16]) -> std::result::Result<(), String>;
}

/// No-op progress callback
pub struct NoProgress;

impl ProgressCallback for NoProgress {
    fn on_phase(&mut self, _instance: &InstanceRef, _phase: Phase) {}
    fn on_step_start(&mut self, _step: &PlannedStep, _index: usize, _total: usize) {}
    fn on_step_complete(&mut self, _step: &PlannedStep, _success: bool) {}
}

/// Auto-confirm callback (always returns true)
pub struct AutoConfirm;

impl ConfirmCallback for AutoConfirm {
    fn confirm(&mut self, _instance: &InstanceRef, _diff: &Diff) -> Result<bool> {
        Ok(true)
    }
}

/// Auto-decline callback (always returns false)
pub struct AutoDecline;

impl ConfirmCallback for AutoDecline {
    fn confirm(&mut self, _instance: &InstanceRef, _diff: &Diff) -> Result<bool> {
        Ok(false)
    }
}

/// Port opener that only logs what would need opening.
pub struct ReportOnly;

impl PortOpener for ReportOnly {
    fn open_ports(&self, instance: &InstanceRef, ports: &[u16]) -> std::result::Result<(), String> {
        if !ports.is_empty() {
            log::info!("{instance}: ports to open externally: {ports:?}");
        }
        Ok(())
    }
}
