//! Apply planner - turns a diff into ordered remote scripts
//!
//! Order is fixed: packages (one batch per manager), accounts, service
//! configuration, then service start/restart. Every rendered script is safe
//! to re-run.

use crate::diff::{Diff, UserChange};
use crate::error::{Error, Result};
use crate::managers::{InstallRequest, ManagerRegistry};
use crate::settings::EngineSettings;
use crate::template::HEREDOC_MARKER;
use remotekit::shell_quote;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Prefix of the marker line identifying a step inside its script.
pub const STEP_MARKER: &str = "# retrofit step: ";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepKind {
    Packages,
    Users,
    ServiceConfigure,
    ServiceStart,
    ServiceRestart,
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Packages => "packages",
            Self::Users => "users",
            Self::ServiceConfigure => "service configuration",
            Self::ServiceStart => "service start",
            Self::ServiceRestart => "service restart",
        };
        f.write_str(s)
    }
}

/// One remote script in an apply plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedStep {
    /// Stable id, e.g. `packages:conda` or `service-start:jupyter`
    pub id: String,
    pub kind: StepKind,
    pub description: String,
    /// Packages, accounts, or services the step touches
    pub subjects: Vec<String>,
    #[serde(skip)]
    pub script: String,
}

/// Ordered steps plus what was deliberately left out.
#[derive(Debug, Clone, Default)]
pub struct ApplyPlan {
    pub steps: Vec<PlannedStep>,
    /// Declared removals not executed because `force_remove` was off
    pub skipped_removals: Vec<String>,
    pub warnings: Vec<String>,
}

impl ApplyPlan {
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

fn render_script(id: &str, lines: &[String]) -> String {
    let mut script = format!("#!/bin/bash\nset -euo pipefail\n{STEP_MARKER}{id}\n");
    for line in lines {
        script.push_str(line);
        script.push('\n');
    }
    script
}

fn step(id: String, kind: StepKind, description: String, subjects: Vec<String>, lines: &[String]) -> PlannedStep {
    PlannedStep {
        script: render_script(&id, lines),
        id,
        kind,
        description,
        subjects,
    }
}

/// Build the apply plan for `diff`.
///
/// Removals run only with `force_remove`; otherwise they are reported in
/// [`ApplyPlan::skipped_removals`].
pub fn build_plan(
    diff: &Diff,
    registry: &ManagerRegistry,
    settings: &EngineSettings,
    force_remove: bool,
) -> Result<ApplyPlan> {
    let mut plan = ApplyPlan::default();

    for (name, changes) in &diff.packages {
        let manager = registry
            .get(name)
            .ok_or_else(|| Error::template(format!("unknown package manager '{name}'")))?;
        let target = changes.target.as_deref();

        let requests: Vec<InstallRequest> = changes
            .install
            .iter()
            .chain(&changes.upgrade)
            .map(|c| InstallRequest {
                name: c.name.clone(),
                version: c.target_version.clone(),
            })
            .collect();
        let mut subjects: Vec<String> = requests.iter().map(|r| r.name.clone()).collect();

        let mut lines = Vec::new();
        if !requests.is_empty() {
            lines.extend(manager.render_install(&requests, target));
        }

        let removals: Vec<String> = changes.remove.iter().map(|c| c.name.clone()).collect();
        if !removals.is_empty() {
            if force_remove {
                lines.extend(manager.render_remove(&removals, target, false));
                subjects.extend(removals.iter().map(|r| format!("-{r}")));
            } else {
                plan.warnings.push(format!(
                    "{name}: not removing {} without force-remove",
                    removals.join(", ")
                ));
                plan.skipped_removals
                    .extend(removals.iter().map(|r| format!("{name}:{r}")));
            }
        }

        if lines.is_empty() {
            continue;
        }
        plan.steps.push(step(
            format!("packages:{name}"),
            StepKind::Packages,
            format!("{name}: {}", subjects.join(", ")),
            subjects,
            &lines,
        ));
    }

    if let Some(users) = users_step(diff, settings) {
        plan.steps.push(users);
    }

    if !diff.services_to_configure.is_empty() {
        let mut lines = Vec::new();
        for change in &diff.services_to_configure {
            if change.config.is_empty() {
                continue;
            }
            let path = settings.dropin_path(&change.name);
            let dir = path.rsplit_once('/').map_or("/", |(d, _)| d);
            lines.push(format!("mkdir -p {}", shell_quote(dir)));
            lines.push(format!("cat > {} <<'{HEREDOC_MARKER}'", shell_quote(&path)));
            lines.extend(change.config.iter().cloned());
            lines.push(HEREDOC_MARKER.to_string());
        }
        lines.push("systemctl daemon-reload".to_string());
        for change in diff.services_to_configure.iter().filter(|c| c.enable) {
            lines.push(format!("systemctl enable {}", shell_quote(&change.name)));
        }
        let subjects: Vec<String> = diff
            .services_to_configure
            .iter()
            .map(|c| c.name.clone())
            .collect();
        plan.steps.push(step(
            "services:configure".to_string(),
            StepKind::ServiceConfigure,
            format!("configure {}", subjects.join(", ")),
            subjects,
            &lines,
        ));
    }

    for name in &diff.services_to_start {
        plan.steps.push(step(
            format!("service-start:{name}"),
            StepKind::ServiceStart,
            format!("start {name}"),
            vec![name.clone()],
            &[format!("systemctl start {}", shell_quote(name))],
        ));
    }
    for name in &diff.services_to_restart {
        plan.steps.push(step(
            format!("service-restart:{name}"),
            StepKind::ServiceRestart,
            format!("restart {name}"),
            vec![name.clone()],
            &[format!("systemctl restart {}", shell_quote(name))],
        ));
    }

    log::debug!(
        "planned {} steps for {} ({} removals skipped)",
        plan.steps.len(),
        diff.template_id,
        plan.skipped_removals.len()
    );
    Ok(plan)
}

fn users_step(diff: &Diff, settings: &EngineSettings) -> Option<PlannedStep> {
    if diff.groups_to_create.is_empty()
        && diff.users_to_create.is_empty()
        && diff.users_to_modify.is_empty()
    {
        return None;
    }

    let mut lines = Vec::new();
    let mut subjects = Vec::new();

    for group in &diff.groups_to_create {
        let g = shell_quote(group);
        lines.push(format!("getent group {g} >/dev/null || groupadd {g}"));
        subjects.push(format!("group {group}"));
    }
    for user in &diff.users_to_create {
        lines.push(useradd_line(user, settings));
        subjects.push(user.name.clone());
    }
    for user in &diff.users_to_modify {
        if user.add_groups.is_empty() {
            continue;
        }
        lines.push(format!(
            "usermod -a -G {} {}",
            shell_quote(&user.add_groups.join(",")),
            shell_quote(&user.name)
        ));
        subjects.push(user.name.clone());
    }

    Some(step(
        "users".to_string(),
        StepKind::Users,
        format!("accounts: {}", subjects.join(", ")),
        subjects,
        &lines,
    ))
}

fn useradd_line(user: &UserChange, settings: &EngineSettings) -> String {
    let name = shell_quote(&user.name);
    let shell = user.shell.as_deref().unwrap_or(&settings.default_shell);
    let mut cmd = format!("useradd -m -s {}", shell_quote(shell));
    if let Some(uid) = user.uid {
        cmd.push_str(&format!(" -u {uid}"));
    }
    if !user.add_groups.is_empty() {
        cmd.push_str(&format!(" -G {}", shell_quote(&user.add_groups.join(","))));
    }
    format!("id -u {name} >/dev/null 2>&1 || {cmd} {name}")
}
