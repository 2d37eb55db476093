use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use fray_proxy::ProxySpec;

#[derive(Parser)]
#[command(name = "fray", about = "Fault-injecting TCP proxy for resilience testing")]
pub struct Cli {
    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the configured proxies and relay until Ctrl-C
    Run(RunArgs),
    /// Relay a payload through a local proxy and verify it comes back intact
    Check,
    /// Manage fray configuration
    Config(ConfigArgs),
}

#[derive(Args)]
pub struct RunArgs {
    /// Load an additional config file on top of the global and project files
    #[arg(long = "config", value_name = "PATH")]
    pub extra_config: Option<PathBuf>,

    /// Ignore the global and project config files
    #[arg(long)]
    pub no_config: bool,

    /// Add a proxy (repeatable; replaces a configured proxy of the same name)
    #[arg(long = "proxy", value_name = "NAME=LISTEN=UPSTREAM", value_parser = parse_proxy)]
    pub proxies: Vec<ProxySpec>,

    /// JSON file of toxics to attach: [{"name": PROXY, "toxics": [...]}]
    #[arg(long, value_name = "FILE")]
    pub toxics: Option<PathBuf>,
}

fn parse_proxy(value: &str) -> Result<ProxySpec, String> {
    let mut parts = value.splitn(3, '=');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(name), Some(listen), Some(upstream))
            if !name.is_empty() && !listen.is_empty() && !upstream.is_empty() =>
        {
            Ok(ProxySpec::new(name, listen, upstream))
        }
        _ => Err(format!("expected NAME=LISTEN=UPSTREAM, got {value:?}")),
    }
}

#[derive(Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub subcommand: ConfigSubcommand,
}

#[derive(Subcommand)]
pub enum ConfigSubcommand {
    /// Write a starter config file
    Init {
        #[arg(long)]
        global: bool,
    },
    /// Print the effective merged configuration
    Show {
        #[arg(long, value_enum, default_value = "toml")]
        format: OutputFormat,
    },
}

#[derive(ValueEnum, Clone, Copy)]
pub enum OutputFormat {
    Toml,
    Json,
}
