use anyhow::{Context as _, Result};

use super::{Session, exec_context, print_json, render_diff};
use crate::cli::DiffArgs;
use crate::{Context, config, ui};

pub fn run(ctx: &Context, args: DiffArgs) -> Result<i32> {
    let template = config::load_template(&args.template)?;
    let session = Session::open(ctx, &args.instance)?;

    let result = session
        .orchestrator
        .preview(&exec_context(ctx, None), &session.instance, &template)
        .with_context(|| format!("Could not diff {}", session.instance))?;

    if args.json {
        print_json(&result.diff)?;
        return Ok(0);
    }

    render_diff(&result.diff);
    for warning in &result.warnings {
        ui::warn(warning);
    }
    if !result.skipped_removals.is_empty() {
        ui::dim(&format!(
            "Removals need --force-remove: {}",
            result.skipped_removals.join(", ")
        ));
    }
    println!();
    ui::kv("summary", &result.diff.summary());
    Ok(0)
}
