mod artifact;
mod audit_script;
mod cli;
mod commands;
mod config;
mod enforcement;
mod error;
mod executor;
mod kandji;
mod mapping;
mod notify;
mod paths;
mod resolver;
mod secrets;
mod ui;
mod version;

use anyhow::Result;
use clap::{CommandFactory, Parser};
use clap_complete::generate;
use cli::{Cli, Command};
use std::io;

/// Global context for the application
pub struct Context {
    pub verbose: u8,
    pub quiet: bool,
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

    let ctx = Context {
        verbose: cli.verbose,
        quiet: cli.quiet,
    };

    match cli.command {
        Command::Push(args) => commands::push::run(&ctx, args),
        Command::Audit(args) => {
            // The audit's exit code is its contract with the MDM: zero
            // passes, non-zero triggers the install mechanism.
            let code = commands::audit::run(&ctx, args)?;
            std::process::exit(code);
        }
        Command::Completions { shell } => {
            let mut cmd = Cli::command();
            generate(shell, &mut cmd, "kustom", &mut io::stdout());
            Ok(())
        }
    }
}
