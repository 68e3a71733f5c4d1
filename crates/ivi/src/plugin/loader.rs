// Plugin Loader - Discovers backend manifests in a directory

use std::path::{Path, PathBuf};

use ivi_core::{BackendDescriptor, ServiceRegistry};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

use super::factories::BackendFactories;

/// File name of a plugin manifest
pub const MANIFEST_FILE: &str = "ivi-plugin.json";

/// Contents of an `ivi-plugin.json` file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginManifest {
    /// Backend name
    pub name: String,
    /// Key of the built-in factory constructing the backend
    pub factory: String,
    #[serde(default)]
    pub interfaces: Vec<String>,
    #[serde(default)]
    pub simulation: bool,
    #[serde(default)]
    pub configuration_id: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// Discovered plugin ready for registration
#[derive(Debug, Clone)]
pub struct DiscoveredPlugin {
    /// Path to the manifest file
    pub manifest_path: PathBuf,
    /// Name of the directory holding the manifest
    pub file_name: String,
    /// Parsed manifest
    pub manifest: PluginManifest,
}

impl DiscoveredPlugin {
    pub fn descriptor(&self) -> BackendDescriptor {
        let manifest = &self.manifest;
        let mut descriptor = BackendDescriptor::new(&manifest.name)
            .with_file_name(&self.file_name)
            .simulation(manifest.simulation);
        descriptor.interfaces = manifest.interfaces.clone();
        descriptor.configuration_id = manifest.configuration_id.clone();
        descriptor.metadata = manifest.metadata.clone();
        descriptor
    }
}

/// Scan a directory for backend plugins
///
/// Looks for `ivi-plugin.json` manifest files in immediate subdirectories,
/// in file name order.
///
/// # Example
/// ```text
/// plugins/
/// ├── climate_simulator/
/// │   └── ivi-plugin.json  <- Found
/// └── tuner_remote/
///     └── ivi-plugin.json  <- Found
/// ```
pub async fn discover_plugins(plugins_dir: &Path) -> Result<Vec<DiscoveredPlugin>> {
    let mut discovered = Vec::new();

    if !plugins_dir.exists() {
        tracing::debug!("Plugins directory does not exist: {}", plugins_dir.display());
        return Ok(discovered);
    }

    let mut directories = Vec::new();
    let mut entries = tokio::fs::read_dir(plugins_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.is_dir() {
            directories.push(path);
        }
    }
    directories.sort();

    for path in directories {
        let manifest_path = path.join(MANIFEST_FILE);
        if !manifest_path.exists() {
            continue;
        }

        match load_manifest(&manifest_path).await {
            Ok(manifest) => {
                tracing::debug!("Discovered plugin: {} at {}", manifest.name, path.display());
                let file_name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                discovered.push(DiscoveredPlugin {
                    manifest_path,
                    file_name,
                    manifest,
                });
            }
            Err(e) => {
                tracing::warn!(
                    "Failed to load plugin manifest at {}: {}",
                    manifest_path.display(),
                    e
                );
            }
        }
    }

    Ok(discovered)
}

/// Load a plugin manifest from a file
pub async fn load_manifest(path: &Path) -> Result<PluginManifest> {
    let content = tokio::fs::read_to_string(path).await?;

    serde_json::from_str(&content).map_err(|e| Error::Manifest {
        path: path.display().to_string(),
        reason: e.to_string(),
    })
}

/// Register discovered plugins with `registry`
///
/// Plugins naming an unknown factory or carrying malformed metadata are
/// skipped. Returns how many backends were registered.
pub fn register_plugins(
    registry: &ServiceRegistry,
    plugins: &[DiscoveredPlugin],
    factories: &BackendFactories,
) -> usize {
    let mut registered = 0;

    for plugin in plugins {
        let factory = match factories.get(&plugin.manifest.factory) {
            Ok(factory) => factory,
            Err(e) => {
                tracing::warn!(plugin = %plugin.manifest.name, "{}", e);
                continue;
            }
        };

        match registry.register_backend(plugin.descriptor(), move || (*factory)()) {
            Ok(true) => {
                tracing::info!(
                    "Registered plugin: {} ({})",
                    plugin.manifest.name,
                    plugin.manifest.interfaces.join(", ")
                );
                registered += 1;
            }
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(plugin = %plugin.manifest.name, "Skipping plugin: {}", e);
            }
        }
    }

    registered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::climate::CLIMATE_CONTROL_INTERFACE;
    use crate::tuner::AMFM_TUNER_INTERFACE;
    use ivi_core::{BackendType, SearchFlags};
    use std::io::Write;
    use tempfile::TempDir;

    fn write_manifest(root: &Path, dir: &str, manifest: &str) {
        let plugin_dir = root.join(dir);
        std::fs::create_dir(&plugin_dir).unwrap();
        let mut file = std::fs::File::create(plugin_dir.join(MANIFEST_FILE)).unwrap();
        file.write_all(manifest.as_bytes()).unwrap();
    }

    #[tokio::test]
    async fn test_discover_plugins_empty_dir() {
        let temp = TempDir::new().unwrap();
        let discovered = discover_plugins(temp.path()).await.unwrap();
        assert!(discovered.is_empty());
    }

    #[tokio::test]
    async fn test_discover_plugins_missing_dir() {
        let temp = TempDir::new().unwrap();
        let discovered = discover_plugins(&temp.path().join("nope")).await.unwrap();
        assert!(discovered.is_empty());
    }

    #[tokio::test]
    async fn test_discover_plugins_with_manifest() {
        let temp = TempDir::new().unwrap();
        write_manifest(
            temp.path(),
            "climate_simulator",
            r#"{
                "name": "climate",
                "factory": "climate_simulator",
                "interfaces": ["ivi.ClimateControl"],
                "configurationId": "climate",
                "metadata": { "vendor": "example" }
            }"#,
        );

        let discovered = discover_plugins(temp.path()).await.unwrap();
        assert_eq!(discovered.len(), 1);
        let plugin = &discovered[0];
        assert_eq!(plugin.manifest.name, "climate");
        assert_eq!(plugin.file_name, "climate_simulator");

        let descriptor = plugin.descriptor();
        assert!(descriptor.is_simulation());
        assert_eq!(descriptor.configuration_id.as_deref(), Some("climate"));
        assert_eq!(descriptor.metadata["vendor"], "example");
    }

    #[tokio::test]
    async fn test_discover_plugins_skips_invalid() {
        let temp = TempDir::new().unwrap();
        write_manifest(temp.path(), "broken", "{ not json");
        write_manifest(temp.path(), "no_factory", r#"{ "name": "x" }"#);
        std::fs::create_dir(temp.path().join("empty")).unwrap();

        let discovered = discover_plugins(temp.path()).await.unwrap();
        assert!(discovered.is_empty());
    }

    #[tokio::test]
    async fn test_register_plugins() {
        let temp = TempDir::new().unwrap();
        write_manifest(
            temp.path(),
            "a_climate_simulator",
            r#"{ "name": "climate", "factory": "climate_simulator", "interfaces": ["ivi.ClimateControl"] }"#,
        );
        write_manifest(
            temp.path(),
            "b_tuner",
            r#"{ "name": "tuner", "factory": "tuner_simulator", "interfaces": ["ivi.AmFmTuner"] }"#,
        );
        write_manifest(
            temp.path(),
            "c_unknown",
            r#"{ "name": "mystery", "factory": "does_not_exist", "interfaces": ["ivi.Mystery"] }"#,
        );
        write_manifest(
            temp.path(),
            "d_no_interfaces",
            r#"{ "name": "empty", "factory": "tuner_simulator" }"#,
        );

        let registry = ServiceRegistry::new();
        let plugins = discover_plugins(temp.path()).await.unwrap();
        assert_eq!(plugins.len(), 4);

        let factories = BackendFactories::builtin();
        assert_eq!(register_plugins(&registry, &plugins, &factories), 2);
        assert_eq!(register_plugins(&registry, &plugins, &factories), 0);
        assert_eq!(registry.len(), 2);

        let climate =
            registry.find_service_by_interface(CLIMATE_CONTROL_INTERFACE, SearchFlags::ALL, &[]);
        assert_eq!(climate.len(), 1);
        assert_eq!(climate[0].backend_type(), BackendType::Simulation);

        let tuner = registry.find_service_by_interface(AMFM_TUNER_INTERFACE, SearchFlags::ALL, &[]);
        assert_eq!(tuner[0].backend_type(), BackendType::Production);
        assert!(registry.load(&tuner[0]).is_some());
    }
}
