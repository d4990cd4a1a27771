use anyhow::{Context as _, Result, bail};
use declarative::{ApplyStatus, RollbackStepStatus};
use dialoguer::Confirm;

use super::{Session, exec_context, print_json, require_consent};
use crate::cli::RollbackArgs;
use crate::progress::TerminalProgress;
use crate::{Context, ui};

pub fn run(ctx: &Context, args: RollbackArgs) -> Result<i32> {
    require_consent(args.yes, args.json, true)?;
    let session = Session::open(ctx, &args.instance)?;
    let exec = exec_context(ctx, None);

    let checkpoints = session
        .orchestrator
        .checkpoints(&exec, &session.instance)
        .with_context(|| format!("Could not list checkpoints on {}", session.instance))?;
    let target = match args.checkpoint {
        Some(id) => checkpoints.iter().find(|c| c.id == id),
        None => checkpoints.last(),
    };
    let Some(target) = target else {
        match args.checkpoint {
            Some(id) => bail!("{} has no checkpoint #{id}", session.instance),
            None => bail!("{} has no checkpoints", session.instance),
        }
    };

    let newer = checkpoints.iter().filter(|c| c.id > target.id).count();
    if !args.yes {
        ui::info(&format!(
            "Restoring {} to checkpoint #{} ({}, {})",
            session.instance,
            target.id,
            target.created_at.format("%Y-%m-%d %H:%M"),
            target.template_id.as_deref().unwrap_or("no template")
        ));
        if newer > 0 {
            ui::warn(&format!("{newer} newer checkpoint(s) will be discarded"));
        }
        let confirmed = Confirm::new()
            .with_prompt("Continue?")
            .default(false)
            .interact()
            .context("Failed to read confirmation")?;
        if !confirmed {
            ui::info("Cancelled");
            return Ok(0);
        }
    }

    let mut progress = TerminalProgress::new(ctx.quiet || args.json);
    let result = session
        .orchestrator
        .rollback(&exec, &session.instance, Some(target.id), &mut progress)
        .with_context(|| format!("Rollback of {} failed", session.instance))?;
    drop(progress);

    if args.json {
        print_json(&result)?;
    } else if result.status == ApplyStatus::RolledBack {
        ui::success(&result.to_string());
    } else {
        ui::error(&result.to_string());
        let failed = result
            .report
            .steps
            .iter()
            .filter(|s| s.status == RollbackStepStatus::Failed)
            .count();
        ui::dim(&format!("{failed} required step(s) failed; manual remediation required"));
    }

    Ok(if result.status == ApplyStatus::RolledBack { 0 } else { 4 })
}
