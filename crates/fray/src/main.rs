//! `fray`: run a set of fault-injecting TCP proxies from the command line.
//!
//! Logs go to stderr. Verbosity comes from `-v` flags, or from `FRAY_LOG`
//! when set (any `tracing_subscriber::EnvFilter` directive, e.g.
//! `FRAY_LOG=fray_proxy=debug`).

mod cli;
mod commands;
mod error;

use clap::Parser;
use cli::{Cli, Command};
use error::CliError;

/// Crates whose events `-v` turns up; dependencies stay at `warn`.
const FRAY_TARGETS: [&str; 3] = ["fray", "fray_proxy", "fray_settings"];

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    setup_tracing(cli.verbose);

    if let Err(e) = dispatch(cli).await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn dispatch(cli: Cli) -> Result<(), CliError> {
    // Relative config paths and the project `.fray/` resolve against cwd.
    let cwd = std::env::current_dir()?;
    match cli.command {
        // Blocks until Ctrl-C; every proxy is stopped before returning.
        Command::Run(args) => commands::run::run(args, cwd).await,
        Command::Check => commands::check::check(cwd).await,
        Command::Config(args) => commands::config::config(args, cwd).await,
    }
}

fn setup_tracing(verbose: u8) {
    let filter = std::env::var("FRAY_LOG").unwrap_or_else(|_| verbosity_filter(verbose));

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();
}

fn verbosity_filter(verbose: u8) -> String {
    let level = match verbose {
        0 => return "warn".to_string(),
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let mut directives = vec!["warn".to_string()];
    directives.extend(FRAY_TARGETS.iter().map(|target| format!("{target}={level}")));
    directives.join(",")
}
