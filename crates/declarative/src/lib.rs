//! # Declarative
//!
//! Template application for running instances: inspect what is there, diff
//! it against a declarative template, apply the difference incrementally, and
//! roll back to a checkpoint when a step fails.
//!
//! ## Core Concepts
//!
//! - **InstanceState**: fresh snapshot of packages, services, accounts, ports, and history
//! - **DesiredTemplate**: fully-resolved target configuration, produced elsewhere
//! - **Diff**: what would change, plus conflicts that block the apply
//! - **ApplyPlan**: ordered, idempotent remote scripts built from a diff
//! - **Checkpoint**: state snapshot and file backups taken before any mutation
//! - **Orchestrator**: the state machine tying it all together
//!
//! ## Example
//!
//! ```ignore
//! use declarative::{ApplyRequest, AutoConfirm, EngineSettings, NoProgress, Orchestrator};
//! use remotekit::{ExecContext, InstanceRef, SshExecutor};
//! use std::sync::Arc;
//!
//! let orchestrator = Orchestrator::new(Arc::new(SshExecutor::new()), EngineSettings::default());
//! let request = ApplyRequest::new(InstanceRef::new("lab-1").with_address("10.0.0.7"), template);
//!
//! let result = orchestrator.apply(
//!     &ExecContext::default(),
//!     &request,
//!     &mut NoProgress,
//!     &mut AutoConfirm,
//! )?;
//! println!("{result}");
//! ```
//!
//! ## Provider Traits
//!
//! The crate uses traits for dependency injection:
//!
//! - [`RemoteExecutor`](remotekit::RemoteExecutor): how commands reach the instance
//! - [`PackageManager`]: one entry per supported package manager
//! - [`LeaseStore`]: per-instance mutual exclusion
//! - [`PortOpener`]: the network collaborator that opens ports
//! - [`ProgressCallback`]: Receives progress updates
//! - [`ConfirmCallback`]: Handles user confirmations
//!
//! This allows the crate to be used without hard dependencies on a
//! terminal UI, a cloud SDK, or a particular lock service.

pub mod checkpoint;
pub mod context;
pub mod diff;
pub mod error;
pub mod executor;
pub mod history;
pub mod inspector;
pub mod lease;
pub mod managers;
pub mod orchestrator;
pub mod planner;
pub mod settings;
pub mod template;
pub mod types;
pub mod version;

#[cfg(test)]
mod testing;

pub use checkpoint::{
    Checkpoint, CheckpointManager, CheckpointSummary, RollbackReport, RollbackStepKind,
    RollbackStepStatus,
};
pub use context::{
    AutoConfirm, AutoDecline, ConfirmCallback, NoProgress, PortOpener, ProgressCallback,
    ReportOnly,
};
pub use diff::{Conflict, ConflictCategory, Diff, compute_diff};
pub use error::{Error, ErrorKind, Result};
pub use executor::{ApplyEngine, ApplyOutcome, FailedStep, StepReport};
pub use history::{ApplicationRecord, RecordStatus};
pub use inspector::{Inspector, Targets};
pub use lease::{FileLeaseStore, Lease, LeaseGuard, LeaseStore, MemoryLeaseStore};
pub use managers::{ManagerRegistry, PackageManager};
pub use orchestrator::{ApplyRequest, ApplyResult, ApplyStatus, Orchestrator, Phase, RollbackResult};
pub use planner::{ApplyPlan, PlannedStep, StepKind, build_plan};
pub use settings::EngineSettings;
pub use template::DesiredTemplate;
pub use types::InstanceState;
