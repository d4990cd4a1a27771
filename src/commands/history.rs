use anyhow::{Context as _, Result};
use colored::Colorize;
use declarative::RecordStatus;

use super::{Session, exec_context, print_json};
use crate::cli::InstanceArgs;
use crate::{Context, ui};

pub fn run(ctx: &Context, args: InstanceArgs) -> Result<i32> {
    let session = Session::open(ctx, &args.instance)?;
    let (records, warning) = session
        .orchestrator
        .history(&exec_context(ctx, None), &session.instance)
        .with_context(|| format!("Could not read history of {}", session.instance))?;

    if let Some(warning) = &warning {
        log::warn!("{}: {warning}", session.instance);
    }
    if args.json {
        print_json(&records)?;
        return Ok(0);
    }

    ui::header(&format!("History of {}", session.instance));
    if let Some(warning) = warning {
        ui::warn(&warning);
    }
    if records.is_empty() {
        ui::dim("no templates applied");
        return Ok(0);
    }
    for record in &records {
        let status = match &record.status {
            RecordStatus::Applied => record.status.to_string().green(),
            RecordStatus::RolledBack => record.status.to_string().yellow(),
            RecordStatus::RollbackFailed => record.status.to_string().red(),
            RecordStatus::Other(s) => s.normal(),
        };
        println!(
            "  {} ({})  {}@{}  {status}  checkpoint #{}",
            record.applied_at.format("%Y-%m-%d %H:%M"),
            ui::age(record.applied_at),
            record.template_id,
            record.template_version,
            record.checkpoint_id
        );
        if !record.overrides.is_empty() {
            let overrides: Vec<&str> = record.overrides.iter().map(|c| c.as_str()).collect();
            ui::dim(&format!("  overrides: {}", overrides.join(", ")));
        }
        if let Some(summary) = &record.diff_summary {
            ui::dim(&format!("  {summary}"));
        }
    }
    Ok(0)
}
