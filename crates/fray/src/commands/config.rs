use std::path::{Path, PathBuf};

use fray_settings::{ConfigLoader, FrayConfig};

use crate::cli::{ConfigArgs, ConfigSubcommand, OutputFormat};
use crate::error::CliError;

pub async fn config(args: ConfigArgs, cwd: PathBuf) -> Result<(), CliError> {
    match args.subcommand {
        ConfigSubcommand::Init { global } => init(global, &cwd),
        ConfigSubcommand::Show { format } => show(format, &cwd),
    }
}

fn init(global: bool, cwd: &Path) -> Result<(), CliError> {
    let path = if global {
        ConfigLoader::global_config_path().ok_or(CliError::NoConfigDir)?
    } else {
        ConfigLoader::project_config_path(cwd)
    };

    if path.exists() {
        return Err(CliError::ConfigExists { path });
    }

    FrayConfig::starter().save(&path)?;
    println!("Created config: {}", path.display());
    Ok(())
}

fn show(format: OutputFormat, cwd: &Path) -> Result<(), CliError> {
    let config = ConfigLoader::load(cwd)?;
    match format {
        OutputFormat::Toml => {
            let toml = config.to_toml()?;
            print!("{toml}");
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(&config)?;
            println!("{json}");
        }
    }
    Ok(())
}
