use clap::{Args, Parser, Subcommand};
use clap_complete::Shell;
use declarative::ConflictCategory;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "retrofit")]
#[command(author = "Alberto Cavalcante")]
#[command(version)]
#[command(about = "Evolve running instances toward a template, with checkpoints and rollback", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Config file (default: <config dir>/config.toml)
    #[arg(long, global = true, env = "RETROFIT_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Apply a template to an instance
    Apply(ApplyArgs),

    /// Show what applying a template would change
    Diff(DiffArgs),

    /// Show the current state of an instance
    Inspect(InspectArgs),

    /// Restore an instance to a checkpoint
    Rollback(RollbackArgs),

    /// List checkpoints stored on an instance
    Checkpoints(InstanceArgs),

    /// Show the application history of an instance
    History(InstanceArgs),

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Args)]
pub struct InstanceArgs {
    /// Instance name from the config, or user@host
    pub instance: String,

    /// Output JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Args)]
pub struct ApplyArgs {
    /// Instance name from the config, or user@host
    pub instance: String,

    /// Resolved template file (.json or .toml)
    #[arg(short, long)]
    pub template: PathBuf,

    /// Compute the diff but change nothing
    #[arg(long)]
    pub dry_run: bool,

    /// Accept conflicts of a category (repeatable)
    #[arg(long = "override", value_name = "CATEGORY")]
    pub overrides: Vec<ConflictCategory>,

    /// Execute package removals declared by the template
    #[arg(long)]
    pub force_remove: bool,

    /// Skip the confirmation prompt
    #[arg(short, long)]
    pub yes: bool,

    /// Output JSON
    #[arg(long)]
    pub json: bool,

    /// Give up on remote calls after this many seconds
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,
}

#[derive(Args)]
pub struct DiffArgs {
    /// Instance name from the config, or user@host
    pub instance: String,

    /// Resolved template file (.json or .toml)
    #[arg(short, long)]
    pub template: PathBuf,

    /// Output JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Args)]
pub struct InspectArgs {
    /// Instance name from the config, or user@host
    pub instance: String,

    /// Also inspect packages for these managers' targets (manager=target)
    #[arg(long = "target", value_name = "MANAGER=TARGET")]
    pub targets: Vec<String>,

    /// Output JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Args)]
pub struct RollbackArgs {
    /// Instance name from the config, or user@host
    pub instance: String,

    /// Checkpoint id (default: the latest)
    #[arg(long)]
    pub checkpoint: Option<u64>,

    /// Skip the confirmation prompt
    #[arg(short, long)]
    pub yes: bool,

    /// Output JSON
    #[arg(long)]
    pub json: bool,
}
