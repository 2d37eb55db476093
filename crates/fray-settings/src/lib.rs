//! Layered TOML configuration for fray.
//!
//! Configuration is loaded from:
//! - Global config: `~/.config/fray/fray.toml`
//! - Project config: `<workspace>/.fray/fray.toml`
//!
//! Project values take precedence for runtime scalars; proxies are merged
//! by name.
//!
//! # Example
//!
//! ```no_run
//! use fray_settings::ConfigLoader;
//!
//! let config = ConfigLoader::load(std::path::Path::new(".")).unwrap();
//! for proxy in &config.proxies {
//!     println!("{} -> {}", proxy.listen, proxy.upstream);
//! }
//! ```

mod loader;

pub use loader::ConfigLoader;

use fray_proxy::{ProxyOptions, ProxySpec, ProxyToxics, ToxicSpec};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Errors from settings operations.
#[derive(Error, Debug)]
pub enum SettingsError {
    /// TOML deserialization failed.
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// TOML serialization failed.
    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),

    /// I/O error reading or writing a config file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A config file could not be loaded.
    #[error("{path}: {source}")]
    File {
        path: String,
        #[source]
        source: Box<SettingsError>,
    },
}

/// TOML `[runtime]` section. Unset fields keep the [`ProxyOptions`] default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeSettings {
    /// Upstream dial timeout in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_timeout_ms: Option<u64>,

    /// Grace period for draining links on stop, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drain_timeout_ms: Option<u64>,

    /// Socket read size in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_buffer_size: Option<usize>,

    /// Channel capacity between toxic stages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_buffer: Option<usize>,
}

impl RuntimeSettings {
    /// Proxy options with these settings applied over the defaults.
    pub fn proxy_options(&self) -> ProxyOptions {
        let mut options = ProxyOptions::default();
        if let Some(ms) = self.connect_timeout_ms {
            options.connect_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = self.drain_timeout_ms {
            options.drain_timeout = Duration::from_millis(ms);
        }
        if let Some(size) = self.read_buffer_size {
            options.read_buffer_size = size;
        }
        if let Some(capacity) = self.stage_buffer {
            options.stage_buffer = capacity;
        }
        options
    }
}

/// One `[[proxies]]` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyEntry {
    pub name: String,

    /// Default: "127.0.0.1:0"
    #[serde(default = "default_listen")]
    pub listen: String,

    pub upstream: String,

    /// Default: true
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,

    /// Toxics attached once the proxy exists.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub toxics: Vec<ToxicSpec>,
}

fn default_listen() -> String {
    "127.0.0.1:0".to_string()
}

impl ProxyEntry {
    /// The proxy record for the registry.
    pub fn spec(&self) -> ProxySpec {
        ProxySpec {
            name: self.name.clone(),
            listen: self.listen.clone(),
            upstream: self.upstream.clone(),
            enabled: self.enabled,
        }
    }
}

impl From<ProxySpec> for ProxyEntry {
    fn from(spec: ProxySpec) -> Self {
        Self {
            name: spec.name,
            listen: spec.listen,
            upstream: spec.upstream,
            enabled: spec.enabled,
            toxics: Vec::new(),
        }
    }
}

/// Top-level fray configuration, corresponding to `fray.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FrayConfig {
    #[serde(default)]
    pub runtime: RuntimeSettings,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub proxies: Vec<ProxyEntry>,
}

impl FrayConfig {
    /// Parse a `FrayConfig` from a TOML string.
    ///
    /// # Errors
    /// Returns `SettingsError::ParseError` if the TOML is malformed or does
    /// not match the schema.
    pub fn parse(toml: &str) -> Result<Self, SettingsError> {
        toml::from_str(toml).map_err(SettingsError::ParseError)
    }

    /// Load a `FrayConfig` from a file on disk.
    ///
    /// # Errors
    /// Returns `SettingsError::Io` on read failure, or
    /// `SettingsError::ParseError` if the file content is not valid TOML.
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Serialize this config to a TOML string.
    ///
    /// # Errors
    /// Returns `SettingsError::SerializeError` if serialization fails.
    pub fn to_toml(&self) -> Result<String, SettingsError> {
        toml::to_string_pretty(self).map_err(SettingsError::SerializeError)
    }

    /// Save this config to a file, creating parent directories as needed.
    ///
    /// # Errors
    /// Returns `SettingsError::Io` on write failure, or
    /// `SettingsError::SerializeError` if serialization fails.
    pub fn save(&self, path: &Path) -> Result<(), SettingsError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = self.to_toml()?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Merge `other` (project-level) on top of `self` (global-level).
    ///
    /// - Runtime scalars: `other` wins when explicitly set (`Some`).
    /// - Proxies: an entry in `other` replaces the entry of the same name
    ///   in place; new names are appended in `other`'s order.
    #[must_use]
    pub fn merge(mut self, other: FrayConfig) -> FrayConfig {
        let runtime = other.runtime;
        if runtime.connect_timeout_ms.is_some() {
            self.runtime.connect_timeout_ms = runtime.connect_timeout_ms;
        }
        if runtime.drain_timeout_ms.is_some() {
            self.runtime.drain_timeout_ms = runtime.drain_timeout_ms;
        }
        if runtime.read_buffer_size.is_some() {
            self.runtime.read_buffer_size = runtime.read_buffer_size;
        }
        if runtime.stage_buffer.is_some() {
            self.runtime.stage_buffer = runtime.stage_buffer;
        }

        for entry in other.proxies {
            match self.proxies.iter_mut().find(|p| p.name == entry.name) {
                Some(existing) => *existing = entry,
                None => self.proxies.push(entry),
            }
        }
        self
    }

    /// Proxy records in file order.
    pub fn proxy_specs(&self) -> Vec<ProxySpec> {
        self.proxies.iter().map(ProxyEntry::spec).collect()
    }

    /// Toxics per proxy, for entries that declare any.
    pub fn proxy_toxics(&self) -> Vec<ProxyToxics> {
        self.proxies
            .iter()
            .filter(|p| !p.toxics.is_empty())
            .map(|p| ProxyToxics {
                name: p.name.clone(),
                toxics: p.toxics.clone(),
            })
            .collect()
    }

    /// Starter configuration written by `fray config init`.
    pub fn starter() -> Self {
        let defaults = ProxyOptions::default();
        Self {
            runtime: RuntimeSettings {
                connect_timeout_ms: Some(millis(defaults.connect_timeout)),
                drain_timeout_ms: Some(millis(defaults.drain_timeout)),
                read_buffer_size: None,
                stage_buffer: None,
            },
            proxies: Vec::new(),
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
