pub mod apply;
pub mod checkpoints;
pub mod diff;
pub mod history;
pub mod inspect;
pub mod rollback;

use anyhow::{Context as _, Result, bail};
use colored::Colorize;
use declarative::{ApplyStatus, ConfirmCallback, Diff, FileLeaseStore, Orchestrator};
use dialoguer::Confirm;
use remotekit::{ExecContext, InstanceRef};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::{Context, paths, ui};

/// An orchestrator wired to one instance's transport.
pub struct Session {
    pub orchestrator: Orchestrator,
    pub instance: InstanceRef,
}

impl Session {
    pub fn open(ctx: &Context, instance: &str) -> Result<Self> {
        let (instance, transport) = ctx.config.resolve_instance(instance);
        log::debug!("{instance} via {transport:?} ({})", instance.target());
        let executor = ctx.config.executor(transport)?;
        let leases = FileLeaseStore::new(paths::lease_dir()?);
        let orchestrator = Orchestrator::new(executor, ctx.config.engine.clone())
            .with_lease_store(Arc::new(leases));
        Ok(Self {
            orchestrator,
            instance,
        })
    }
}

/// Execution context driven by the Ctrl-C token.
pub fn exec_context(ctx: &Context, timeout: Option<u64>) -> ExecContext {
    let exec = ExecContext::new(ctx.cancel.clone());
    match timeout {
        Some(secs) => exec.with_timeout(Duration::from_secs(secs)),
        None => exec,
    }
}

/// A mutating run needs `--yes` when `--json` leaves no room for a prompt.
pub fn require_consent(yes: bool, json: bool, mutates: bool) -> Result<()> {
    if json && mutates && !yes {
        bail!("--json does not prompt for confirmation; pass --yes to make changes or --dry-run to preview");
    }
    Ok(())
}

pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
    println!("{json}");
    Ok(())
}

/// Process exit code for a final apply status.
pub fn exit_code(status: ApplyStatus) -> i32 {
    match status {
        ApplyStatus::Applied | ApplyStatus::DryRun | ApplyStatus::Declined => 0,
        ApplyStatus::ConflictBlocked => 2,
        ApplyStatus::RolledBack => 3,
        ApplyStatus::RollbackFailed => 4,
    }
}

fn version_change(current: Option<&str>, target: Option<&str>) -> String {
    match (current, target) {
        (Some(from), Some(to)) => format!(" {from} → {to}"),
        (None, Some(to)) => format!(" {to}"),
        (Some(from), None) => format!(" {from}"),
        (None, None) => String::new(),
    }
}

/// Print a diff as a change list.
pub fn render_diff(diff: &Diff) {
    ui::header(&format!(
        "{} {}",
        diff.template_id,
        diff.template_version.dimmed()
    ));

    for (manager, changes) in &diff.packages {
        if changes.is_empty() {
            continue;
        }
        let target = changes
            .target
            .as_deref()
            .map_or_else(String::new, |t| format!(" ({t})"));
        ui::section(&format!("Packages: {manager}{target}"));
        for c in &changes.install {
            ui::item("+", &format!("{}{}", c.name, version_change(None, c.target_version.as_deref())));
        }
        for c in &changes.upgrade {
            let versions =
                version_change(c.current_version.as_deref(), c.target_version.as_deref());
            ui::item("~", &format!("{}{versions}", c.name));
        }
        for c in &changes.remove {
            ui::item("-", &format!("{}{}", c.name, version_change(c.current_version.as_deref(), None)));
        }
    }

    if !diff.groups_to_create.is_empty() || !diff.users_to_create.is_empty() || !diff.users_to_modify.is_empty() {
        ui::section("Accounts");
        for group in &diff.groups_to_create {
            ui::item("+", &format!("group {group}"));
        }
        for user in &diff.users_to_create {
            let uid = user.uid.map_or_else(String::new, |u| format!(" (uid {u})"));
            ui::item("+", &format!("user {}{uid}", user.name));
        }
        for user in &diff.users_to_modify {
            ui::item("~", &format!("user {} +groups {}", user.name, user.add_groups.join(",")));
        }
    }

    if !diff.services_to_configure.is_empty()
        || !diff.services_to_start.is_empty()
        || !diff.services_to_restart.is_empty()
    {
        ui::section("Services");
        for service in &diff.services_to_configure {
            ui::item("~", &format!("configure {}", service.name));
        }
        for name in &diff.services_to_start {
            ui::item("+", &format!("start {name}"));
        }
        for name in &diff.services_to_restart {
            ui::item("~", &format!("restart {name}"));
        }
    }

    if !diff.ports_to_open.is_empty() {
        let ports: Vec<String> = diff.ports_to_open.iter().map(u16::to_string).collect();
        ui::section("Ports (opened externally)");
        ui::dim(&ports.join(", "));
    }

    if !diff.conflicts.is_empty() {
        ui::section("Conflicts");
        for conflict in &diff.conflicts {
            ui::item("!", &format!("[{}] {}", conflict.category, conflict.description));
        }
    }

    if !diff.has_changes() {
        println!();
        ui::dim("No changes.");
    }
}

/// Shows the diff and asks before any mutation.
pub struct PromptConfirm;

impl ConfirmCallback for PromptConfirm {
    fn confirm(&mut self, instance: &InstanceRef, diff: &Diff) -> declarative::Result<bool> {
        render_diff(diff);
        println!();
        Confirm::new()
            .with_prompt(format!("Apply to {instance}?"))
            .default(true)
            .interact()
            .map_err(|e| declarative::Error::Io(std::io::Error::other(e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::{Cli, Command};
    use clap::Parser;

    fn consent(argv: &[&str]) -> Result<()> {
        match Cli::try_parse_from(argv.iter().copied()).unwrap().command {
            Command::Apply(a) => require_consent(a.yes, a.json, !a.dry_run),
            Command::Rollback(a) => require_consent(a.yes, a.json, true),
            _ => panic!("expected apply or rollback"),
        }
    }

    #[test]
    fn test_json_needs_yes_to_mutate() {
        let err = consent(&["retrofit", "apply", "lab-1", "-t", "t.json", "--json"]).unwrap_err();
        assert!(err.to_string().contains("--yes"));
        assert!(consent(&["retrofit", "rollback", "lab-1", "--json"]).is_err());

        assert!(consent(&["retrofit", "apply", "lab-1", "-t", "t.json", "--json", "-y"]).is_ok());
        assert!(consent(&["retrofit", "apply", "lab-1", "-t", "t.json", "--json", "--dry-run"]).is_ok());
        assert!(consent(&["retrofit", "apply", "lab-1", "-t", "t.json"]).is_ok());
        assert!(consent(&["retrofit", "rollback", "lab-1", "--json", "--yes"]).is_ok());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(exit_code(ApplyStatus::Applied), 0);
        assert_eq!(exit_code(ApplyStatus::DryRun), 0);
        assert_eq!(exit_code(ApplyStatus::Declined), 0);
        for status in [
            ApplyStatus::ConflictBlocked,
            ApplyStatus::RolledBack,
            ApplyStatus::RollbackFailed,
        ] {
            assert_ne!(exit_code(status), 0);
            assert!(!status.is_success());
        }
    }

    #[test]
    fn test_version_change() {
        assert_eq!(version_change(Some("1.0"), Some("2.0")), " 1.0 → 2.0");
        assert_eq!(version_change(None, Some("2.0")), " 2.0");
        assert_eq!(version_change(None, None), "");
    }
}
