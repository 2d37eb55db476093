use std::path::{Path, PathBuf};

use fray_proxy::{ProxyToxics, Registry};
use fray_settings::{ConfigLoader, FrayConfig, ProxyEntry};
use tracing::{info, warn};

use crate::cli::RunArgs;
use crate::error::CliError;

pub async fn run(args: RunArgs, cwd: PathBuf) -> Result<(), CliError> {
    // 1. Load and merge config.
    // --no-config skips global/project config files but --config <extra> still applies.
    let mut config = if args.no_config {
        FrayConfig::default()
    } else {
        ConfigLoader::load(&cwd)?
    };
    if let Some(ref extra) = args.extra_config {
        config = config.merge(FrayConfig::load(extra)?);
    }

    // 2. --proxy flags win over files
    config = config.merge(FrayConfig {
        proxies: args.proxies.into_iter().map(ProxyEntry::from).collect(),
        ..FrayConfig::default()
    });

    // 3. Serve until Ctrl-C, then tear everything down whatever happened.
    let registry = Registry::new(config.runtime.proxy_options());
    let result = serve(&registry, &config, args.toxics.as_deref()).await;
    registry.clear_all().await;
    result
}

async fn serve(
    registry: &Registry,
    config: &FrayConfig,
    toxics_file: Option<&Path>,
) -> Result<(), CliError> {
    registry.populate(config.proxy_specs()).await?;
    registry.populate_toxics(config.proxy_toxics()).await?;
    if let Some(path) = toxics_file {
        let contents = std::fs::read_to_string(path)?;
        let entries: Vec<ProxyToxics> =
            serde_json::from_str(&contents).map_err(|source| CliError::ToxicsFile {
                path: path.to_path_buf(),
                source,
            })?;
        registry.populate_toxics(entries).await?;
    }

    let proxies = registry.list().await;
    if proxies.is_empty() {
        warn!("No proxies configured; use --proxy or a fray.toml");
    }
    for (name, proxy) in &proxies {
        let state = if proxy.is_enabled() { "" } else { " (disabled)" };
        println!(
            "{name}: {} -> {}{state}",
            proxy.listen_addr(),
            proxy.upstream()
        );
    }

    tokio::signal::ctrl_c().await?;
    info!("Interrupted, stopping proxies");
    Ok(())
}
