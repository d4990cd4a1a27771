use anyhow::{Context as _, Result};

use super::{Session, exec_context, print_json};
use crate::cli::InstanceArgs;
use crate::{Context, ui};

pub fn run(ctx: &Context, args: InstanceArgs) -> Result<i32> {
    let session = Session::open(ctx, &args.instance)?;
    let checkpoints = session
        .orchestrator
        .checkpoints(&exec_context(ctx, None), &session.instance)
        .with_context(|| format!("Could not list checkpoints on {}", session.instance))?;

    if args.json {
        print_json(&checkpoints)?;
        return Ok(0);
    }

    ui::header(&format!("Checkpoints on {}", session.instance));
    if checkpoints.is_empty() {
        ui::dim("none");
        return Ok(0);
    }
    for checkpoint in &checkpoints {
        ui::kv(
            &format!("#{}", checkpoint.id),
            &format!(
                "{}  {}  {}",
                checkpoint.created_at.format("%Y-%m-%d %H:%M:%S"),
                ui::age(checkpoint.created_at),
                checkpoint.template_id.as_deref().unwrap_or("-")
            ),
        );
    }
    Ok(0)
}
