mod cli;
mod commands;
mod config;
mod paths;
mod progress;
mod ui;

use anyhow::{Context as _, Result};
use clap::{CommandFactory, Parser};
use clap_complete::generate;
use cli::{Cli, Command};
use config::Config;
use remotekit::CancelToken;
use std::io;

/// Global context for the application
pub struct Context {
    pub verbose: u8,
    pub quiet: bool,
    pub config: Config,
    /// Flipped by Ctrl-C; checked by the engine between phases and steps
    pub cancel: CancelToken,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    let log_level = match cli.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    env_logger::Builder::new()
        .filter_level(if cli.quiet {
            log::LevelFilter::Error
        } else {
            log_level
        })
        .format_timestamp(None)
        .init();

    if let Command::Completions { shell } = cli.command {
        generate(shell, &mut Cli::command(), "retrofit", &mut io::stdout());
        return Ok(());
    }

    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        ctrlc::set_handler(move || {
            if cancel.is_cancelled() {
                // Second Ctrl-C: give up on waiting for the current step
                std::process::exit(130);
            }
            eprintln!("Interrupt received, finishing the current step...");
            cancel.cancel();
        })
        .context("Failed to install Ctrl-C handler")?;
    }

    let ctx = Context {
        verbose: cli.verbose,
        quiet: cli.quiet,
        config: Config::load(cli.config.as_deref())?,
        cancel,
    };

    let code = match cli.command {
        Command::Apply(args) => commands::apply::run(&ctx, args),
        Command::Diff(args) => commands::diff::run(&ctx, args),
        Command::Inspect(args) => commands::inspect::run(&ctx, args),
        Command::Rollback(args) => commands::rollback::run(&ctx, args),
        Command::Checkpoints(args) => commands::checkpoints::run(&ctx, args),
        Command::History(args) => commands::history::run(&ctx, args),
        Command::Completions { .. } => Ok(0),
    };

    match code {
        Ok(0) => Ok(()),
        Ok(code) => std::process::exit(code),
        Err(e) => {
            ui::error(&format!("{e:#}"));
            if let Some(engine) = e.downcast_ref::<declarative::Error>() {
                ui::dim(engine.kind().advice());
            }
            std::process::exit(1);
        }
    }
}
