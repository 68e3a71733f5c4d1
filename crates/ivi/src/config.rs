//! Application Configuration
//!
//! Layered with figment: built-in defaults, then a TOML file, then `IVI_`
//! environment variables (`__` separates nested keys).
//!
//! ```toml
//! plugin_dir = "./plugins"
//! remote_init_timeout_ms = 3000
//!
//! [features.climate]
//! discovery_mode = "SimulationOnly"
//! preferred_backends = ["*_simulator"]
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use ivi_core::{ConfigurationManager, FeatureSettings};
use ivi_remote::RemoteConfig;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Default config file, relative to the working directory
pub const DEFAULT_CONFIG_FILE: &str = "ivi.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Directory scanned for `ivi-plugin.json` manifests
    pub plugin_dir: PathBuf,
    /// Register the in-process simulators next to discovered plugins
    pub builtin_simulators: bool,
    /// Remote endpoint file; falls back to `SERVER_CONF_PATH` / `./server.conf`
    pub server_conf: Option<PathBuf>,
    /// Url used for every remote module without an explicit entry
    pub default_server_url: Option<String>,
    pub remote_init_timeout_ms: u64,
    /// Delay before a served simulation resolves a seek
    pub simulation_seek_delay_ms: u64,
    /// Settings keyed by configuration id
    pub features: HashMap<String, FeatureSettings>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            plugin_dir: PathBuf::from("./plugins"),
            builtin_simulators: true,
            server_conf: None,
            default_server_url: None,
            remote_init_timeout_ms: 3000,
            simulation_seek_delay_ms: 500,
            features: HashMap::new(),
        }
    }
}

impl AppConfig {
    fn defaults() -> Figment {
        Figment::from(Serialized::defaults(AppConfig::default()))
    }

    /// Load from `path` (or [`DEFAULT_CONFIG_FILE`]) and the environment.
    /// A missing file is not an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));
        tracing::debug!(path = %path.display(), "Loading configuration");

        let config = Self::defaults()
            .merge(Toml::file(path))
            .merge(Env::prefixed("IVI_").split("__"))
            .extract()?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(Self::defaults().merge(Toml::string(content)).extract()?)
    }

    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_init_timeout_ms)
    }

    pub fn seek_delay(&self) -> Duration {
        Duration::from_millis(self.simulation_seek_delay_ms)
    }

    pub fn configuration_manager(&self) -> ConfigurationManager {
        ConfigurationManager::from_entries(self.features.clone())
    }

    pub fn remote_config(&self) -> Result<RemoteConfig> {
        let mut remote = match &self.server_conf {
            Some(path) => RemoteConfig::load(path)?,
            None => RemoteConfig::parse_legacy_config_file()?,
        };
        if let Some(url) = &self.default_server_url {
            remote.set_default_server_url(url.clone());
        }
        Ok(remote)
    }
}
