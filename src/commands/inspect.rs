use anyhow::{Context as _, Result, bail};
use colored::Colorize;
use declarative::{InstanceState, Targets};

use super::{Session, exec_context, print_json};
use crate::cli::InspectArgs;
use crate::{Context, ui};

pub fn run(ctx: &Context, args: InspectArgs) -> Result<i32> {
    let targets = parse_targets(&args.targets)?;
    let session = Session::open(ctx, &args.instance)?;

    let state = session
        .orchestrator
        .inspect(&exec_context(ctx, None), &session.instance, &targets)
        .with_context(|| format!("Could not inspect {}", session.instance))?;

    if args.json {
        print_json(&state)?;
    } else {
        show(&session.instance.name, &state, ctx.verbose > 0);
    }
    Ok(0)
}

/// Parse `manager=target` pairs; a bare `manager` inspects its default target.
fn parse_targets(raw: &[String]) -> Result<Targets> {
    let mut targets = Targets::new();
    for entry in raw {
        let (manager, target) = match entry.split_once('=') {
            Some((m, t)) => (m.trim(), Some(t.trim().to_string())),
            None => (entry.trim(), None),
        };
        if manager.is_empty() {
            bail!("invalid target '{entry}' (expected MANAGER=TARGET)");
        }
        targets.insert(manager.to_string(), target.filter(|t| !t.is_empty()));
    }
    Ok(targets)
}

fn show(name: &str, state: &InstanceState, verbose: bool) {
    ui::header(name);
    ui::kv("inspected", &state.inspected_at.to_rfc3339());

    ui::section("Packages");
    if state.packages.is_empty() {
        ui::dim("no supported package manager found");
    }
    for (manager, packages) in &state.packages {
        ui::kv(manager, &format!("{} installed", packages.len()));
        if verbose {
            for (pkg, version) in packages {
                ui::dim(&format!("  {pkg} {version}"));
            }
        }
    }

    ui::section("Services");
    for (service, s) in &state.services {
        if !verbose && s.config_digest.is_none() && !s.active {
            continue;
        }
        let active = if s.active { "active".green() } else { "inactive".dimmed() };
        let enabled = if s.enabled { "enabled" } else { "disabled" };
        let managed = if s.config_digest.is_some() { " (managed)" } else { "" };
        println!("  {service}: {active}, {enabled}{managed}");
    }

    ui::section("Users");
    if state.users.is_empty() {
        ui::dim("no managed accounts");
    }
    for user in state.users.values() {
        let groups: Vec<&str> = user.groups.iter().map(String::as_str).collect();
        ui::kv(&user.name, &format!("uid {} [{}] {}", user.uid, groups.join(","), user.shell));
    }

    ui::section("Listening ports");
    for (port, owner) in &state.ports {
        ui::kv(&port.to_string(), owner.as_deref().unwrap_or("?"));
    }

    ui::section("History");
    if state.history.is_empty() {
        ui::dim("no templates applied");
    }
    for record in &state.history {
        ui::kv(
            &record.applied_at.format("%Y-%m-%d %H:%M").to_string(),
            &format!(
                "{}@{} {} (checkpoint #{})",
                record.template_id, record.template_version, record.status, record.checkpoint_id
            ),
        );
    }

    for warning in &state.warnings {
        ui::warn(warning);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_targets() {
        let targets = parse_targets(&[
            "conda=ml".to_string(),
            "pip=/opt/venv".to_string(),
            "spack".to_string(),
        ])
        .unwrap();
        assert_eq!(targets["conda"].as_deref(), Some("ml"));
        assert_eq!(targets["pip"].as_deref(), Some("/opt/venv"));
        assert_eq!(targets["spack"], None);
    }

    #[test]
    fn test_parse_targets_rejects_empty_manager() {
        assert!(parse_targets(&["=ml".to_string()]).is_err());
    }
}
