use std::path::PathBuf;

/// Everything a `fray` subcommand can fail with. Printed once by `main`.
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("{0}")]
    Settings(#[from] fray_settings::SettingsError),

    #[error("{0}")]
    Proxy(#[from] fray_proxy::ProxyError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// `--toxics` file that is not a list of `{ name, toxics }` entries.
    #[error("Invalid JSON in toxics file {}: {source}", path.display())]
    ToxicsFile {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Config file already exists: {}", path.display())]
    ConfigExists { path: PathBuf },

    #[error("Cannot determine global config path: no config directory available")]
    NoConfigDir,

    #[error("{failed} check(s) failed")]
    ChecksFailed { failed: usize },

    #[error("{0}")]
    Other(String),
}
