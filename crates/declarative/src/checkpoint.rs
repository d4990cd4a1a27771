//! Checkpoint capture and restore
//!
//! A checkpoint is written to the instance before any mutating apply:
//!
//! ```text
//! {checkpoint_dir}/index.json            {"checkpoints":[{"id":1,"createdAt":..,"templateID":..}]}
//! {checkpoint_dir}/{id}/checkpoint.json  manifest: state snapshot, file metadata, environment
//! {checkpoint_dir}/{id}/files/{n}        verbatim backup of the n-th managed file
//! ```
//!
//! Backups and the manifest are uploaded first; the index update is the
//! commit point. A checkpoint missing from the index does not exist.
//!
//! Restore is an undo log, not a transaction. Package removal is best effort
//! because dependency cascades are outside our control, and ports are never
//! touched.

use crate::error::{Error, Result};
use crate::inspector::{Inspector, Targets};
use crate::managers::ManagerRegistry;
use crate::settings::EngineSettings;
use crate::types::InstanceState;
use chrono::{DateTime, Utc};
use remotekit::{ExecContext, InstanceRef, Interpreter, RemoteExecutor, shell_quote};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

/// Metadata and digest of one backed-up file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileBackup {
    pub path: String,
    /// Whether the file existed when the checkpoint was taken
    pub present: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    #[serde(default)]
    pub size: u64,
    /// Octal permission bits from `stat`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
}

/// Captured pre-apply state of an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub id: u64,
    pub instance: String,
    pub created_at: DateTime<Utc>,
    #[serde(rename = "templateID", default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,
    /// Package manager targets the snapshot was inspected with
    #[serde(default)]
    pub targets: Targets,
    /// Services the apply was going to touch
    #[serde(default)]
    pub services: Vec<String>,
    pub state: InstanceState,
    pub files: Vec<FileBackup>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

/// Entry of the on-instance checkpoint index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointSummary {
    pub id: u64,
    pub created_at: DateTime<Utc>,
    #[serde(rename = "templateID", default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CheckpointIndex {
    #[serde(default)]
    checkpoints: Vec<CheckpointSummary>,
}

/// What to capture.
#[derive(Debug, Clone)]
pub struct CheckpointRequest<'a> {
    pub state: &'a InstanceState,
    pub template_id: Option<&'a str>,
    pub targets: Targets,
    /// Services whose drop-ins are backed up alongside the managed files
    pub services: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RollbackStepKind {
    RestoreConfigFiles,
    RemovePackages,
    RestoreServices,
    VerifyEnvironment,
}

impl fmt::Display for RollbackStepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::RestoreConfigFiles => "restore config files",
            Self::RemovePackages => "remove packages",
            Self::RestoreServices => "restore services",
            Self::VerifyEnvironment => "verify environment",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RollbackStepStatus {
    Completed,
    Failed,
    /// Failed, but the step is allowed to fail
    BestEffortFailed,
    /// Not attempted because the rollback was cancelled
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackStepReport {
    pub kind: RollbackStepKind,
    pub status: RollbackStepStatus,
    pub detail: String,
}

/// Outcome of restoring a checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackReport {
    pub checkpoint_id: u64,
    pub steps: Vec<RollbackStepReport>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub cancelled: bool,
}

impl RollbackReport {
    /// Every required step completed.
    pub fn succeeded(&self) -> bool {
        self.steps.iter().all(|s| {
            matches!(
                s.status,
                RollbackStepStatus::Completed | RollbackStepStatus::BestEffortFailed
            )
        })
    }

    /// Status of one step, if it was recorded.
    pub fn status_of(&self, kind: RollbackStepKind) -> Option<RollbackStepStatus> {
        self.steps.iter().find(|s| s.kind == kind).map(|s| s.status)
    }
}

fn capture_error(what: &str, err: remotekit::Error) -> Error {
    match err {
        remotekit::Error::Cancelled => Error::Cancelled,
        other => Error::checkpoint(format!("{what}: {other}")),
    }
}

fn parse_env(stdout: &str, allowlist: &[String]) -> BTreeMap<String, String> {
    stdout
        .lines()
        .filter_map(|line| line.split_once('='))
        .filter(|(k, _)| allowlist.iter().any(|a| a.as_str() == *k))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Parse `stat -c '%n|%a|%U|%G'` output.
fn parse_stat(stdout: &str) -> BTreeMap<String, (String, String, String)> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut parts = line.rsplitn(4, '|');
            let group = parts.next()?;
            let owner = parts.next()?;
            let mode = parts.next()?;
            let path = parts.next()?;
            mode.bytes()
                .all(|b| (b'0'..=b'7').contains(&b))
                .then(|| (path.to_string(), (mode.to_string(), owner.to_string(), group.to_string())))
        })
        .collect()
}

/// Creates, lists, loads, and restores checkpoints on an instance.
pub struct CheckpointManager<'a> {
    executor: &'a dyn RemoteExecutor,
    registry: &'a ManagerRegistry,
    settings: &'a EngineSettings,
}

impl<'a> CheckpointManager<'a> {
    pub fn new(
        executor: &'a dyn RemoteExecutor,
        registry: &'a ManagerRegistry,
        settings: &'a EngineSettings,
    ) -> Self {
        Self {
            executor,
            registry,
            settings,
        }
    }

    fn dir(&self) -> &str {
        self.settings.checkpoint_dir.trim_end_matches('/')
    }

    fn index_path(&self) -> String {
        format!("{}/index.json", self.dir())
    }

    fn manifest_path(&self, id: u64) -> String {
        format!("{}/{id}/checkpoint.json", self.dir())
    }

    fn backup_path(&self, id: u64, n: usize) -> String {
        format!("{}/{id}/files/{n}", self.dir())
    }

    fn read_index(&self, ctx: &ExecContext, instance: &InstanceRef) -> Result<CheckpointIndex> {
        let staging = TempDir::new()?;
        let local = staging.path().join("index.json");
        match self.executor.get_file(ctx, instance, &local, &self.index_path()) {
            Ok(()) => {}
            Err(e) if e.is_not_found() => return Ok(CheckpointIndex::default()),
            Err(e) => return Err(capture_error("reading checkpoint index", e)),
        }
        serde_json::from_slice(&fs::read(&local)?)
            .map_err(|e| Error::checkpoint(format!("checkpoint index is malformed: {e}")))
    }

    fn write_index(
        &self,
        ctx: &ExecContext,
        instance: &InstanceRef,
        index: &CheckpointIndex,
        staging: &Path,
    ) -> Result<()> {
        let local = staging.join("index.json");
        fs::write(&local, serde_json::to_vec_pretty(index)?)?;
        self.executor
            .copy_file(ctx, instance, &local, &self.index_path())
            .map_err(|e| capture_error("writing checkpoint index", e))
    }

    /// Checkpoints recorded on the instance, oldest first.
    pub fn list(&self, ctx: &ExecContext, instance: &InstanceRef) -> Result<Vec<CheckpointSummary>> {
        let mut entries = self.read_index(ctx, instance)?.checkpoints;
        entries.sort_by_key(|e| e.id);
        Ok(entries)
    }

    /// Capture and persist a new checkpoint.
    ///
    /// Any failure leaves the index untouched, so the checkpoint does not
    /// exist and the caller must not mutate the instance.
    pub fn create(
        &self,
        ctx: &ExecContext,
        instance: &InstanceRef,
        request: CheckpointRequest<'_>,
    ) -> Result<Checkpoint> {
        ctx.check().map_err(|e| capture_error("checkpoint", e))?;
        let mut index = self.read_index(ctx, instance)?;
        let id = index.checkpoints.iter().map(|c| c.id).max().unwrap_or(0) + 1;

        let staging = TempDir::new()?;
        let files_dir = staging.path().join("files");
        fs::create_dir_all(&files_dir)?;

        let mut paths: Vec<String> = Vec::new();
        let mut seen = BTreeSet::new();
        let dropins = request.services.iter().map(|s| self.settings.dropin_path(s));
        for path in self.settings.managed_config_files.iter().cloned().chain(dropins) {
            if seen.insert(path.clone()) {
                paths.push(path);
            }
        }

        let mut files = Vec::with_capacity(paths.len());
        for (n, path) in paths.iter().enumerate() {
            let local = files_dir.join(n.to_string());
            match self.executor.get_file(ctx, instance, &local, path) {
                Ok(()) => {
                    let bytes = fs::read(&local)?;
                    files.push(FileBackup {
                        path: path.clone(),
                        present: true,
                        digest: Some(blake3::hash(&bytes).to_hex().to_string()),
                        size: bytes.len() as u64,
                        mode: None,
                        owner: None,
                        group: None,
                    });
                }
                Err(e) if e.is_not_found() => files.push(FileBackup {
                    path: path.clone(),
                    present: false,
                    digest: None,
                    size: 0,
                    mode: None,
                    owner: None,
                    group: None,
                }),
                Err(e) => return Err(capture_error(&format!("backing up {path}"), e)),
            }
        }

        let present: Vec<&str> = files
            .iter()
            .filter(|f| f.present)
            .map(|f| f.path.as_str())
            .collect();
        if !present.is_empty() {
            let quoted: Vec<String> = present.iter().map(|p| shell_quote(p)).collect();
            let cmd = format!("stat -c '%n|%a|%U|%G' -- {}", quoted.join(" "));
            let out = self
                .executor
                .execute(ctx, instance, &cmd)
                .map_err(|e| capture_error("reading file metadata", e))?;
            let meta = parse_stat(&out.stdout);
            for file in &mut files {
                if let Some((mode, owner, group)) = meta.get(&file.path) {
                    file.mode = Some(mode.clone());
                    file.owner = Some(owner.clone());
                    file.group = Some(group.clone());
                }
            }
        }

        let env_out = self
            .executor
            .execute(ctx, instance, "printenv")
            .map_err(|e| capture_error("reading environment", e))?;
        let environment = parse_env(&env_out.stdout, &self.settings.env_allowlist);

        let checkpoint = Checkpoint {
            id,
            instance: instance.name.clone(),
            created_at: Utc::now(),
            template_id: request.template_id.map(String::from),
            targets: request.targets,
            services: request.services,
            state: request.state.clone(),
            files,
            environment,
        };

        for (n, file) in checkpoint.files.iter().enumerate() {
            if file.present {
                self.executor
                    .copy_file(ctx, instance, &files_dir.join(n.to_string()), &self.backup_path(id, n))
                    .map_err(|e| capture_error(&format!("storing backup of {}", file.path), e))?;
            }
        }

        let manifest = staging.path().join("checkpoint.json");
        fs::write(&manifest, serde_json::to_vec_pretty(&checkpoint)?)?;
        self.executor
            .copy_file(ctx, instance, &manifest, &self.manifest_path(id))
            .map_err(|e| capture_error("storing checkpoint manifest", e))?;

        index.checkpoints.push(CheckpointSummary {
            id,
            created_at: checkpoint.created_at,
            template_id: checkpoint.template_id.clone(),
        });
        self.write_index(ctx, instance, &index, staging.path())?;

        log::info!(
            "{instance}: checkpoint #{id} captured ({} files, {} env vars)",
            checkpoint.files.len(),
            checkpoint.environment.len()
        );
        Ok(checkpoint)
    }

    /// Load a checkpoint by id.
    pub fn load(&self, ctx: &ExecContext, instance: &InstanceRef, id: u64) -> Result<Checkpoint> {
        let not_found = || Error::CheckpointNotFound {
            instance: instance.name.clone(),
            id,
        };
        if !self.list(ctx, instance)?.iter().any(|c| c.id == id) {
            return Err(not_found());
        }

        let staging = TempDir::new()?;
        let local = staging.path().join("checkpoint.json");
        match self
            .executor
            .get_file(ctx, instance, &local, &self.manifest_path(id))
        {
            Ok(()) => {}
            Err(e) if e.is_not_found() => return Err(not_found()),
            Err(e) => return Err(capture_error(&format!("loading checkpoint #{id}"), e)),
        }
        serde_json::from_slice(&fs::read(&local)?)
            .map_err(|e| Error::checkpoint(format!("checkpoint #{id} manifest is malformed: {e}")))
    }

    /// The most recent checkpoint, if any.
    pub fn latest(&self, ctx: &ExecContext, instance: &InstanceRef) -> Result<Option<Checkpoint>> {
        match self.list(ctx, instance)?.last() {
            Some(entry) => self.load(ctx, instance, entry.id).map(Some),
            None => Ok(None),
        }
    }

    /// Drop checkpoints newer than `id` from the index and delete their data.
    ///
    /// Returns the ids that were dropped.
    pub fn drop_after(&self, ctx: &ExecContext, instance: &InstanceRef, id: u64) -> Result<Vec<u64>> {
        let mut index = self.read_index(ctx, instance)?;
        let dropped: Vec<u64> = index
            .checkpoints
            .iter()
            .filter(|c| c.id > id)
            .map(|c| c.id)
            .collect();
        if dropped.is_empty() {
            return Ok(dropped);
        }

        index.checkpoints.retain(|c| c.id <= id);
        let staging = TempDir::new()?;
        self.write_index(ctx, instance, &index, staging.path())?;

        let dirs: Vec<String> = dropped
            .iter()
            .map(|d| shell_quote(&format!("{}/{d}", self.dir())))
            .collect();
        let script = format!("#!/bin/bash\nset -euo pipefail\nrm -rf -- {}\n", dirs.join(" "));
        let out = self
            .executor
            .execute_script(ctx, instance, &script, Interpreter::Bash)?;
        if !out.success() {
            log::warn!(
                "{instance}: could not delete data of dropped checkpoints: {}",
                out.stderr_tail()
            );
        }
        Ok(dropped)
    }

    /// Restore `checkpoint` onto the instance.
    ///
    /// Remote calls run detached; `ctx` cancellation is honored between
    /// steps, and the remaining steps are reported as skipped.
    pub fn restore(
        &self,
        ctx: &ExecContext,
        instance: &InstanceRef,
        checkpoint: &Checkpoint,
    ) -> RollbackReport {
        let detached = ctx.detached();
        let mut report = RollbackReport {
            checkpoint_id: checkpoint.id,
            steps: Vec::new(),
            warnings: Vec::new(),
            cancelled: false,
        };

        let kinds = [
            RollbackStepKind::RestoreConfigFiles,
            RollbackStepKind::RemovePackages,
            RollbackStepKind::RestoreServices,
            RollbackStepKind::VerifyEnvironment,
        ];
        for kind in kinds {
            if ctx.is_cancelled() {
                report.cancelled = true;
                report.steps.push(RollbackStepReport {
                    kind,
                    status: RollbackStepStatus::Skipped,
                    detail: "cancelled".to_string(),
                });
                continue;
            }
            let (status, detail) = match kind {
                RollbackStepKind::RestoreConfigFiles => self.restore_files(&detached, instance, checkpoint),
                RollbackStepKind::RemovePackages => {
                    self.remove_packages(&detached, instance, checkpoint, &mut report.warnings)
                }
                RollbackStepKind::RestoreServices => {
                    self.restore_services(&detached, instance, checkpoint)
                }
                RollbackStepKind::VerifyEnvironment => {
                    self.verify_environment(&detached, instance, checkpoint, &mut report.warnings)
                }
            };
            match status {
                RollbackStepStatus::Failed => log::warn!("{instance}: rollback step '{kind}' failed: {detail}"),
                RollbackStepStatus::BestEffortFailed => {
                    log::warn!("{instance}: rollback step '{kind}' incomplete: {detail}");
                }
                _ => log::debug!("{instance}: rollback step '{kind}': {detail}"),
            }
            report.steps.push(RollbackStepReport { kind, status, detail });
        }
        report
    }

    fn restore_files(
        &self,
        ctx: &ExecContext,
        instance: &InstanceRef,
        checkpoint: &Checkpoint,
    ) -> (RollbackStepStatus, String) {
        let staging = match TempDir::new() {
            Ok(dir) => dir,
            Err(e) => return (RollbackStepStatus::Failed, format!("staging directory: {e}")),
        };
        let mut errors = Vec::new();
        let mut restored = 0usize;
        let mut lines = Vec::new();

        for (n, file) in checkpoint.files.iter().enumerate() {
            let path = shell_quote(&file.path);
            if !file.present {
                lines.push(format!("rm -f -- {path}"));
                continue;
            }
            let local = staging.path().join(n.to_string());
            if let Err(e) = self.restore_one(ctx, instance, checkpoint.id, n, file, &local) {
                errors.push(format!("{}: {e}", file.path));
                continue;
            }
            restored += 1;
            if let Some(mode) = &file.mode {
                lines.push(format!("chmod {mode} -- {path}"));
            }
            if let (Some(owner), Some(group)) = (&file.owner, &file.group) {
                lines.push(format!("chown {} -- {path}", shell_quote(&format!("{owner}:{group}"))));
            }
        }

        if !lines.is_empty() {
            let script = format!("#!/bin/bash\nset -euo pipefail\n{}\n", lines.join("\n"));
            match self.executor.execute_script(ctx, instance, &script, Interpreter::Bash) {
                Ok(out) if out.success() => {}
                Ok(out) => errors.push(format!(
                    "permissions/cleanup exited {}: {}",
                    out.exit_code,
                    out.stderr_tail()
                )),
                Err(e) => errors.push(format!("permissions/cleanup: {e}")),
            }
        }

        if errors.is_empty() {
            (
                RollbackStepStatus::Completed,
                format!("restored {restored} files"),
            )
        } else {
            (RollbackStepStatus::Failed, errors.join("; "))
        }
    }

    fn restore_one(
        &self,
        ctx: &ExecContext,
        instance: &InstanceRef,
        id: u64,
        n: usize,
        file: &FileBackup,
        local: &Path,
    ) -> std::result::Result<(), String> {
        self.executor
            .get_file(ctx, instance, local, &self.backup_path(id, n))
            .map_err(|e| format!("fetching backup: {e}"))?;
        let bytes = fs::read(local).map_err(|e| e.to_string())?;
        let digest = blake3::hash(&bytes).to_hex().to_string();
        if file.digest.as_deref() != Some(digest.as_str()) {
            return Err("backup digest mismatch".to_string());
        }
        self.executor
            .copy_file(ctx, instance, local, &file.path)
            .map_err(|e| format!("writing: {e}"))
    }

    fn remove_packages(
        &self,
        ctx: &ExecContext,
        instance: &InstanceRef,
        checkpoint: &Checkpoint,
        warnings: &mut Vec<String>,
    ) -> (RollbackStepStatus, String) {
        let inspector = Inspector::new(self.executor, self.registry, self.settings);
        let (current, _) = match inspector.inspect_packages(ctx, instance, &checkpoint.targets) {
            Ok(found) => found,
            Err(e) => {
                warnings.push(format!("package removal skipped: {e}"));
                return (RollbackStepStatus::BestEffortFailed, e.to_string());
            }
        };

        let mut removed = Vec::new();
        let mut failures = Vec::new();
        for (name, installed) in &current {
            let Some(snapshot) = checkpoint.state.packages.get(name) else {
                if checkpoint.targets.contains_key(name) {
                    warnings.push(format!(
                        "{name} was not present at checkpoint #{}; its packages were left in place",
                        checkpoint.id
                    ));
                }
                continue;
            };
            let extras: Vec<String> = installed
                .keys()
                .filter(|k| !snapshot.contains_key(*k))
                .cloned()
                .collect();
            if extras.is_empty() {
                continue;
            }
            let Some(manager) = self.registry.get(name) else {
                continue;
            };
            let target = checkpoint.targets.get(name).and_then(Option::as_deref);
            let body = manager.render_remove(&extras, target, true);
            let script = format!("#!/bin/bash\nset -uo pipefail\n{}\n", body.join("\n"));
            match self.executor.execute_script(ctx, instance, &script, Interpreter::Bash) {
                Ok(out) if out.success() && !out.stderr.contains("warning: could not remove") => {
                    removed.extend(extras.iter().map(|e| format!("{name}:{e}")));
                }
                Ok(out) => {
                    let msg = format!("{name}: {}", out.stderr_tail());
                    warnings.push(format!("package removal incomplete: {msg}"));
                    failures.push(msg);
                }
                Err(e) => {
                    let msg = format!("{name}: {e}");
                    warnings.push(format!("package removal failed: {msg}"));
                    failures.push(msg);
                }
            }
        }

        if failures.is_empty() {
            let detail = if removed.is_empty() {
                "nothing to remove".to_string()
            } else {
                format!("removed {}", removed.join(", "))
            };
            (RollbackStepStatus::Completed, detail)
        } else {
            (RollbackStepStatus::BestEffortFailed, failures.join("; "))
        }
    }

    fn restore_services(
        &self,
        ctx: &ExecContext,
        instance: &InstanceRef,
        checkpoint: &Checkpoint,
    ) -> (RollbackStepStatus, String) {
        let inspector = Inspector::new(self.executor, self.registry, self.settings);
        let current = match inspector.inspect_services(ctx, instance) {
            Ok(services) => services,
            Err(e) => return (RollbackStepStatus::Failed, format!("inspecting services: {e}")),
        };

        let mut lines = vec!["systemctl daemon-reload".to_string()];
        let mut touched = Vec::new();
        for (name, before) in &checkpoint.state.services {
            let now = current.get(name).cloned().unwrap_or_default();
            let unit = shell_quote(name);
            if before.enabled != now.enabled {
                let verb = if before.enabled { "enable" } else { "disable" };
                lines.push(format!("systemctl {verb} {unit}"));
                touched.push(format!("{verb} {name}"));
            }
            if before.active != now.active {
                let verb = if before.active { "start" } else { "stop" };
                lines.push(format!("systemctl {verb} {unit}"));
                touched.push(format!("{verb} {name}"));
            } else if before.active && checkpoint.services.contains(name) {
                lines.push(format!("systemctl restart {unit}"));
                touched.push(format!("restart {name}"));
            }
        }
        // Only services the apply touched; anything else was not ours to start
        for name in &checkpoint.services {
            if checkpoint.state.services.contains_key(name) {
                continue;
            }
            if let Some(now) = current.get(name)
                && (now.active || now.enabled)
            {
                lines.push(format!(
                    "systemctl disable --now {} || echo \"warning: could not disable {name}\" >&2",
                    shell_quote(name)
                ));
                touched.push(format!("disable {name}"));
            }
        }

        let script = format!("#!/bin/bash\nset -euo pipefail\n{}\n", lines.join("\n"));
        match self.executor.execute_script(ctx, instance, &script, Interpreter::Bash) {
            Ok(out) if out.success() => {
                let detail = if touched.is_empty() {
                    "services already match".to_string()
                } else {
                    touched.join(", ")
                };
                (RollbackStepStatus::Completed, detail)
            }
            Ok(out) => (
                RollbackStepStatus::Failed,
                format!("exit {}: {}", out.exit_code, out.stderr_tail()),
            ),
            Err(e) => (RollbackStepStatus::Failed, e.to_string()),
        }
    }

    fn verify_environment(
        &self,
        ctx: &ExecContext,
        instance: &InstanceRef,
        checkpoint: &Checkpoint,
        warnings: &mut Vec<String>,
    ) -> (RollbackStepStatus, String) {
        let out = match self.executor.execute(ctx, instance, "printenv") {
            Ok(out) => out,
            Err(e) => {
                warnings.push(format!("environment not verified: {e}"));
                return (RollbackStepStatus::BestEffortFailed, e.to_string());
            }
        };
        let now = parse_env(&out.stdout, &self.settings.env_allowlist);
        let mut drift = Vec::new();
        for key in &self.settings.env_allowlist {
            if checkpoint.environment.get(key) != now.get(key) {
                drift.push(key.clone());
            }
        }
        if drift.is_empty() {
            (RollbackStepStatus::Completed, "environment matches".to_string())
        } else {
            warnings.push(format!("environment drift after rollback: {}", drift.join(", ")));
            (
                RollbackStepStatus::Completed,
                format!("drift in {}", drift.join(", ")),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{GROUP, fresh_instance, instance};
    use crate::types::ServiceState;
    use remotekit::{CallKind, ExecOutput, ScriptedExecutor};

    fn manager<'a>(
        exec: &'a ScriptedExecutor,
        registry: &'a ManagerRegistry,
        settings: &'a EngineSettings,
    ) -> CheckpointManager<'a> {
        CheckpointManager::new(exec, registry, settings)
    }

    fn request(state: &InstanceState) -> CheckpointRequest<'_> {
        CheckpointRequest {
            state,
            template_id: Some("ml-research"),
            targets: Targets::new(),
            services: vec!["jupyter".into()],
        }
    }

    #[test]
    fn test_parse_stat_and_env() {
        let meta = parse_stat("/etc/group|644|root|root\n/etc/shadow|640|root|shadow\ngarbage\n");
        assert_eq!(meta["/etc/shadow"], ("640".into(), "root".into(), "shadow".into()));
        assert_eq!(meta.len(), 2);

        let env = parse_env(
            "PATH=/usr/bin:/bin\nHOME=/root\nPYTHONPATH=\n",
            &EngineSettings::default().env_allowlist,
        );
        assert_eq!(env.len(), 2);
        assert_eq!(env["PATH"], "/usr/bin:/bin");
    }

    #[test]
    fn test_create_persists_backups_then_index() {
        let exec = fresh_instance();
        exec.on_command("stat -c", "/etc/group|644|root|root\n/etc/passwd|644|root|root\n")
            .on_command("printenv", "PATH=/usr/bin\nSECRET=x\n");
        let registry = ManagerRegistry::builtin();
        let settings = EngineSettings::default();
        let state = InstanceState::default();
        let ctx = ExecContext::default();

        let cp = manager(&exec, &registry, &settings)
            .create(&ctx, &instance(), request(&state))
            .unwrap();
        assert_eq!(cp.id, 1);
        assert_eq!(cp.environment.len(), 1);

        let group = cp.files.iter().find(|f| f.path == "/etc/group").unwrap();
        assert!(group.present);
        assert_eq!(group.mode.as_deref(), Some("644"));
        let dropin = cp.files.iter().find(|f| f.path.contains("jupyter")).unwrap();
        assert!(!dropin.present);

        let uploads: Vec<String> = exec
            .calls()
            .into_iter()
            .filter(|c| c.kind == CallKind::Upload)
            .map(|c| c.body)
            .collect();
        assert_eq!(uploads.last().unwrap(), "/var/lib/retrofit/checkpoints/index.json");
        assert!(uploads.iter().any(|u| u.ends_with("/1/checkpoint.json")));

        let group_index = cp.files.iter().position(|f| f.path == "/etc/group").unwrap();
        assert_eq!(
            exec.remote_file(&format!("/var/lib/retrofit/checkpoints/1/files/{group_index}"))
                .unwrap(),
            GROUP.as_bytes()
        );
    }

    #[test]
    fn test_ids_are_monotonic() {
        let exec = fresh_instance();
        let registry = ManagerRegistry::builtin();
        let settings = EngineSettings::default();
        let state = InstanceState::default();
        let ctx = ExecContext::default();
        let mgr = manager(&exec, &registry, &settings);

        let first = mgr.create(&ctx, &instance(), request(&state)).unwrap();
        let second = mgr.create(&ctx, &instance(), request(&state)).unwrap();
        assert_eq!((first.id, second.id), (1, 2));

        let ids: Vec<u64> = mgr.list(&ctx, &instance()).unwrap().iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(mgr.latest(&ctx, &instance()).unwrap().unwrap().id, 2);
        assert_eq!(mgr.load(&ctx, &instance(), 1).unwrap().template_id.as_deref(), Some("ml-research"));
    }

    #[test]
    fn test_failed_backup_leaves_no_checkpoint() {
        let exec = fresh_instance();
        exec.transport_error("/etc/shadow", "permission denied", None);
        let registry = ManagerRegistry::builtin();
        let settings = EngineSettings::default();
        let state = InstanceState::default();
        let ctx = ExecContext::default();
        let mgr = manager(&exec, &registry, &settings);

        let err = mgr.create(&ctx, &instance(), request(&state)).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::CheckpointFailure);
        assert!(mgr.list(&ctx, &instance()).unwrap().is_empty());
        assert!(exec.mutating_calls().is_empty());
    }

    #[test]
    fn test_load_unknown_id() {
        let exec = fresh_instance();
        let registry = ManagerRegistry::builtin();
        let settings = EngineSettings::default();
        let err = manager(&exec, &registry, &settings)
            .load(&ExecContext::default(), &instance(), 9)
            .unwrap_err();
        assert!(matches!(err, Error::CheckpointNotFound { id: 9, .. }));
    }

    #[test]
    fn test_restore_files_and_services() {
        let exec = fresh_instance();
        exec.on_command("stat -c", "/etc/group|644|root|root\n");
        let registry = ManagerRegistry::builtin();
        let settings = EngineSettings::default();
        let ctx = ExecContext::default();
        let mut state = InstanceState::default();
        state.services.insert(
            "ssh".into(),
            ServiceState {
                active: true,
                enabled: true,
                config_digest: None,
            },
        );
        let mgr = manager(&exec, &registry, &settings);
        let cp = mgr.create(&ctx, &instance(), request(&state)).unwrap();

        // Simulate the apply: /etc/group grew and jupyter is now running
        exec.put_remote_file("/etc/group", format!("{GROUP}research:x:5100:researcher\n"));
        exec.on_command("list-units", "ssh.service loaded active running S\njupyter.service loaded active running J\n")
            .on_command("list-unit-files", "ssh.service enabled enabled\njupyter.service enabled enabled\n");

        let report = mgr.restore(&ctx, &instance(), &cp);
        assert!(report.succeeded(), "{report:?}");
        assert_eq!(exec.remote_file("/etc/group").unwrap(), GROUP.as_bytes());

        let cleanup = exec.scripts_containing("rm -f -- /etc/systemd/system/jupyter.service.d/retrofit.conf");
        assert_eq!(cleanup.len(), 1);
        assert!(cleanup[0].contains("chmod 644 -- /etc/group"));
        assert!(cleanup[0].contains("chown root:root -- /etc/group"));

        let services = exec.scripts_containing("daemon-reload");
        assert!(services[0].contains("systemctl disable --now jupyter"));
        assert!(!services[0].contains("systemctl stop ssh"));
    }

    #[test]
    fn test_restore_removes_new_packages_best_effort() {
        let exec = fresh_instance();
        let registry = ManagerRegistry::builtin();
        let settings = EngineSettings::default();
        let ctx = ExecContext::default();
        let mut state = InstanceState::default();
        state
            .packages
            .entry("conda".into())
            .or_default()
            .insert("python".into(), "3.11.7".into());
        let mgr = manager(&exec, &registry, &settings);
        let cp = mgr.create(&ctx, &instance(), request(&state)).unwrap();

        exec.on_command(
            "conda list --json",
            r#"[{"name":"python","version":"3.11.7"},{"name":"numpy","version":"1.26.4"}]"#,
        )
        .on_script("conda remove", ExecOutput::failed(1, "PackagesNotFoundError"));

        let report = mgr.restore(&ctx, &instance(), &cp);
        assert_eq!(
            report.status_of(RollbackStepKind::RemovePackages),
            Some(RollbackStepStatus::BestEffortFailed)
        );
        assert!(report.succeeded());
        let removal = exec.scripts_containing("conda remove");
        assert!(removal[0].contains("conda remove -y numpy ||"));
        assert!(!removal[0].contains("python"));
    }

    #[test]
    fn test_corrupt_backup_fails_file_restore() {
        let exec = fresh_instance();
        let registry = ManagerRegistry::builtin();
        let settings = EngineSettings::default();
        let ctx = ExecContext::default();
        let state = InstanceState::default();
        let mgr = manager(&exec, &registry, &settings);
        let cp = mgr.create(&ctx, &instance(), request(&state)).unwrap();

        let n = cp.files.iter().position(|f| f.path == "/etc/group").unwrap();
        exec.put_remote_file(&format!("/var/lib/retrofit/checkpoints/1/files/{n}"), "tampered");

        let report = mgr.restore(&ctx, &instance(), &cp);
        assert_eq!(
            report.status_of(RollbackStepKind::RestoreConfigFiles),
            Some(RollbackStepStatus::Failed)
        );
        assert!(!report.succeeded());
    }

    #[test]
    fn test_cancelled_restore_skips_steps() {
        let exec = fresh_instance();
        let registry = ManagerRegistry::builtin();
        let settings = EngineSettings::default();
        let state = InstanceState::default();
        let mgr = manager(&exec, &registry, &settings);
        let cp = mgr
            .create(&ExecContext::default(), &instance(), request(&state))
            .unwrap();

        let ctx = ExecContext::default();
        ctx.token().cancel();
        let report = mgr.restore(&ctx, &instance(), &cp);
        assert!(report.cancelled);
        assert!(report.steps.iter().all(|s| s.status == RollbackStepStatus::Skipped));
        assert!(!report.succeeded());
    }

    #[test]
    fn test_drop_after() {
        let exec = fresh_instance();
        let registry = ManagerRegistry::builtin();
        let settings = EngineSettings::default();
        let state = InstanceState::default();
        let ctx = ExecContext::default();
        let mgr = manager(&exec, &registry, &settings);
        for _ in 0..3 {
            mgr.create(&ctx, &instance(), request(&state)).unwrap();
        }

        let dropped = mgr.drop_after(&ctx, &instance(), 1).unwrap();
        assert_eq!(dropped, vec![2, 3]);
        assert_eq!(mgr.list(&ctx, &instance()).unwrap().len(), 1);
        assert_eq!(
            exec.scripts_containing("rm -rf -- /var/lib/retrofit/checkpoints/2 /var/lib/retrofit/checkpoints/3")
                .len(),
            1
        );
    }
}
