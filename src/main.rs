mod cli;
mod commands;
mod config;
mod paths;
mod progress;
mod ui;

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

/// Log level handed down by a parent converge run, `warn` otherwise
fn env_log_level() -> log::LevelFilter {
    std::env::var(declarative::manifest::ENV_LOG)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(log::LevelFilter::Warn)
}

fn main() -> Result<()> {
    // Started under a type name from a manifest
    let mut argv = std::env::args();
    let argv0 = argv.next().unwrap_or_default();
    if let Some(type_name) = declarative::type_name_from_argv0(&argv0) {
        let level = env_log_level();
        env_logger::Builder::new()
            .filter_level(level)
            .format_timestamp(None)
            .init();
        return commands::emulate::run(type_name, argv.collect());
    }

    let cli = Cli::parse();

    // Initialize logging based on verbosity
    let log_level = match cli.verbose {
        0 => env_log_level(),
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
    log::debug!("converge {} (verbosity {})", env!("CARGO_PKG_VERSION"), ctx.verbose);

    match cli.command {
        Command::Config(args) => commands::config::run(&ctx, args),
        Command::Types(args) => commands::types::run(&ctx, args),
        Command::Inventory(cmd) => commands::inventory::run(&ctx, cmd),
        Command::Completions { shell } => {
            generate(shell, &mut Cli::command(), "converge", &mut io::stdout());
            Ok(())
        }
    }
}
