use anyhow::{Context as _, Result};
use declarative::{ApplyRequest, ApplyResult, ApplyStatus, AutoConfirm, ConfirmCallback, ManagerRegistry};

use super::{
    PromptConfirm, Session, exec_context, exit_code, print_json, render_diff, require_consent,
};
use crate::cli::ApplyArgs;
use crate::progress::TerminalProgress;
use crate::{Context, config, ui};

pub fn run(ctx: &Context, args: ApplyArgs) -> Result<i32> {
    require_consent(args.yes, args.json, !args.dry_run)?;
    let template = config::load_template(&args.template)?;
    template
        .validate(&ManagerRegistry::builtin())
        .with_context(|| format!("Invalid template {}", args.template.display()))?;

    let session = Session::open(ctx, &args.instance)?;
    let mut request = ApplyRequest::new(session.instance.clone(), template);
    request.dry_run = args.dry_run;
    request.overrides = args.overrides.into_iter().collect();
    request.force_remove = args.force_remove;

    let exec = exec_context(ctx, args.timeout);
    let quiet = ctx.quiet || args.json;
    let mut progress = TerminalProgress::new(quiet);
    let mut auto = AutoConfirm;
    let mut prompt = PromptConfirm;
    let confirm: &mut dyn ConfirmCallback = if args.yes {
        &mut auto
    } else {
        &mut prompt
    };

    let result = session
        .orchestrator
        .apply(&exec, &request, &mut progress, confirm)
        .with_context(|| format!("Apply to {} failed", session.instance))?;
    drop(progress);

    if args.json {
        print_json(&result)?;
    } else {
        report(ctx, &result);
    }
    Ok(exit_code(result.status))
}

fn report(ctx: &Context, result: &ApplyResult) {
    match result.status {
        ApplyStatus::DryRun | ApplyStatus::ConflictBlocked => render_diff(&result.diff),
        _ => {}
    }
    println!();
    match result.status {
        ApplyStatus::Applied => ui::success(&result.to_string()),
        ApplyStatus::DryRun | ApplyStatus::Declined => ui::info(&result.to_string()),
        ApplyStatus::ConflictBlocked => {
            ui::warn(&result.to_string());
            if !ctx.quiet {
                ui::dim("Re-run with --override <category> to accept a conflict category.");
            }
        }
        ApplyStatus::RolledBack => ui::warn(&result.to_string()),
        ApplyStatus::RollbackFailed => ui::error(&result.to_string()),
    }
}
