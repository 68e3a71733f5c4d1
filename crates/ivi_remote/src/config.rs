//! Remote Endpoint Configuration
//!
//! Resolves which url a remote backend connects to (or a source listens on).
//! The configuration file groups settings by module and by
//! `module/interface`:
//!
//! ```text
//! Registry = "tcp://10.0.0.2:9999"          # deprecated
//!
//! ["ivi.tuner"]
//! connectionUrl = "tcp://127.0.0.1:9999"
//!
//! ["ivi.tuner/ivi.AmFmTuner"]
//! connectionUrl = "local:tuner"
//! ```

use std::fmt;
use std::path::{Path, PathBuf};

use toml::Table;

use crate::error::{RemoteError, RemoteResult};

/// Environment variable overriding the location of the legacy config file
pub const SERVER_CONF_PATH_ENV: &str = "SERVER_CONF_PATH";

/// Default location of the legacy config file
pub const DEFAULT_SERVER_CONF: &str = "./server.conf";

const CONNECTION_URL_KEY: &str = "connectionUrl";
const REGISTRY_KEY: &str = "Registry";

// ─────────────────────────────────────────────────────────────────────────────
// Endpoint
// ─────────────────────────────────────────────────────────────────────────────

/// A parsed connection url
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// `tcp://host:port`
    Tcp(String),
    /// `local:name`, a socket in the temp directory
    Local(PathBuf),
}

impl Endpoint {
    pub fn parse(url: &str) -> RemoteResult<Self> {
        if let Some(addr) = url.strip_prefix("tcp://") {
            if addr.is_empty() || !addr.contains(':') {
                return Err(RemoteError::InvalidUrl(url.to_string()));
            }
            return Ok(Endpoint::Tcp(addr.to_string()));
        }
        if let Some(name) = url.strip_prefix("local:") {
            if name.is_empty() {
                return Err(RemoteError::InvalidUrl(url.to_string()));
            }
            let path = Path::new(name);
            if path.is_absolute() {
                return Ok(Endpoint::Local(path.to_path_buf()));
            }
            return Ok(Endpoint::Local(std::env::temp_dir().join(name)));
        }
        Err(RemoteError::InvalidUrl(url.to_string()))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp(addr) => write!(f, "tcp://{}", addr),
            Endpoint::Local(path) => write!(f, "local:{}", path.display()),
        }
    }
}

/// `local:<last module segment, lowercased>`
pub fn build_default_url(module: &str) -> String {
    let name = module.rsplit('.').next().unwrap_or(module).to_lowercase();
    format!("local:{}", name)
}

// ─────────────────────────────────────────────────────────────────────────────
// Config
// ─────────────────────────────────────────────────────────────────────────────

/// Connection settings for remote modules
#[derive(Debug, Clone, Default)]
pub struct RemoteConfig {
    table: Table,
    default_server: Option<String>,
}

impl RemoteConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(content: &str) -> RemoteResult<Self> {
        Ok(Self {
            table: content.parse::<Table>()?,
            default_server: None,
        })
    }

    pub fn load(path: &Path) -> RemoteResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Read the legacy `server.conf` (or the file named by `SERVER_CONF_PATH`).
    /// A missing file yields an empty configuration.
    pub fn parse_legacy_config_file() -> RemoteResult<Self> {
        let path = legacy_config_path(std::env::var(SERVER_CONF_PATH_ENV).ok());
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No remote config file");
            return Ok(Self::new());
        }
        tracing::debug!(path = %path.display(), "Loading remote config file");
        Self::load(&path)
    }

    pub fn with_default_server_url(mut self, url: impl Into<String>) -> Self {
        self.default_server = Some(url.into());
        self
    }

    pub fn set_default_server_url(&mut self, url: impl Into<String>) {
        self.default_server = Some(url.into());
    }

    fn group_value(&self, group: &str, key: &str) -> Option<String> {
        self.table
            .get(group)?
            .as_table()?
            .get(key)?
            .as_str()
            .map(str::to_string)
    }

    /// Resolve the url for `interface` of `module`.
    ///
    /// Checked in order: `[module/interface] connectionUrl`,
    /// `[module] connectionUrl`, the deprecated `Registry` keys, the default
    /// server url, `fallback`, and finally `local:<module>`. Urls that do not
    /// parse are skipped with a warning.
    pub fn resolve_url(&self, module: &str, interface: Option<&str>, fallback: Option<&str>) -> String {
        if let Some(interface) = interface {
            let group = format!("{}/{}", module, interface);
            if let Some(url) = valid(self.group_value(&group, CONNECTION_URL_KEY), &group) {
                tracing::debug!(module, interface, %url, "Using interface connection url");
                return url;
            }
        }

        if let Some(url) = valid(self.group_value(module, CONNECTION_URL_KEY), module) {
            tracing::debug!(module, %url, "Using module connection url");
            return url;
        }

        let registry = self.group_value(module, REGISTRY_KEY).or_else(|| {
            self.table
                .get(REGISTRY_KEY)
                .and_then(|v| v.as_str())
                .map(str::to_string)
        });
        if let Some(url) = valid(registry, REGISTRY_KEY) {
            tracing::info!(
                module,
                %url,
                "The Registry key is deprecated, use connectionUrl instead"
            );
            return url;
        }

        if let Some(url) = valid(self.default_server.clone(), "default server") {
            return url;
        }
        if let Some(url) = valid(fallback.map(str::to_string), "fallback") {
            return url;
        }
        build_default_url(module)
    }

    pub fn resolve_endpoint(
        &self,
        module: &str,
        interface: Option<&str>,
        fallback: Option<&str>,
    ) -> RemoteResult<Endpoint> {
        Endpoint::parse(&self.resolve_url(module, interface, fallback))
    }
}

/// `url` if it parses as an [`Endpoint`]
fn valid(url: Option<String>, source: &str) -> Option<String> {
    let url = url?;
    match Endpoint::parse(&url) {
        Ok(_) => Some(url),
        Err(_) => {
            tracing::warn!(source, %url, "Ignoring invalid connection url");
            None
        }
    }
}

/// Path of the legacy config file given the value of `SERVER_CONF_PATH`
pub fn legacy_config_path(env_value: Option<String>) -> PathBuf {
    match env_value {
        Some(path) if !path.is_empty() => PathBuf::from(path),
        _ => PathBuf::from(DEFAULT_SERVER_CONF),
    }
}
