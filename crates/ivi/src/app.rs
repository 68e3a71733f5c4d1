//! Application bootstrap
//!
//! Turns an [`AppConfig`] into a [`ServiceRegistry`] holding every discovered
//! plugin, plus the built-in simulators unless disabled.

use std::sync::Arc;

use ivi_core::{BackendDescriptor, ServiceBackend, ServiceRegistry};

use crate::climate::{CLIMATE_CONTROL_INTERFACE, ClimateControl, ClimateSimulationPlugin};
use crate::config::AppConfig;
use crate::error::Result;
use crate::plugin::{
    BackendFactories, CLIMATE_SIMULATOR_FACTORY, TUNER_SIMULATOR_FACTORY, discover_plugins,
    register_plugins,
};
use crate::tuner::{AMFM_TUNER_INTERFACE, AmFmTuner, TunerSimulationPlugin};

pub struct App {
    config: AppConfig,
    registry: ServiceRegistry,
}

impl App {
    pub async fn load(config: AppConfig) -> Result<Self> {
        let registry = ServiceRegistry::with_configuration(config.configuration_manager());
        let factories = BackendFactories::with_remote(config.remote_config()?, config.init_timeout());

        let plugins = discover_plugins(&config.plugin_dir).await?;
        let registered = register_plugins(&registry, &plugins, &factories);
        tracing::info!(
            plugins = registered,
            dir = %config.plugin_dir.display(),
            "Plugin discovery finished"
        );

        if config.builtin_simulators {
            register_builtin_simulators(&registry)?;
        }

        Ok(Self { config, registry })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    pub fn climate(&self) -> ClimateControl {
        ClimateControl::new(self.registry.clone())
    }

    pub fn tuner(&self) -> AmFmTuner {
        AmFmTuner::new(self.registry.clone())
    }
}

/// Register the simulators under their factory names. Names already taken by a
/// plugin are left alone.
pub fn register_builtin_simulators(registry: &ServiceRegistry) -> Result<usize> {
    let taken: Vec<String> = registry.descriptors().into_iter().map(|d| d.name).collect();
    let mut registered = 0;

    let mut register = |name: &str, interface: &str, factory: fn() -> Arc<dyn ServiceBackend>| {
        if taken.iter().any(|t| t == name) {
            tracing::debug!(backend = name, "Built-in simulator replaced by a plugin");
            return Ok(());
        }
        let descriptor = BackendDescriptor::new(name)
            .with_interface(interface)
            .simulation(true);
        if registry.register_backend(descriptor, move || Ok(factory()))? {
            registered += 1;
        }
        Ok::<_, ivi_core::Error>(())
    };

    register(CLIMATE_SIMULATOR_FACTORY, CLIMATE_CONTROL_INTERFACE, || {
        Arc::new(ClimateSimulationPlugin::new()) as Arc<dyn ServiceBackend>
    })?;
    register(TUNER_SIMULATOR_FACTORY, AMFM_TUNER_INTERFACE, || {
        Arc::new(TunerSimulationPlugin::new()) as Arc<dyn ServiceBackend>
    })?;

    Ok(registered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ivi_core::{DiscoveryMode, DiscoveryResult, FeatureSettings};
    use tempfile::TempDir;

    fn config(plugin_dir: &std::path::Path) -> AppConfig {
        let server_conf = plugin_dir.join("server.conf");
        std::fs::write(&server_conf, "").unwrap();
        AppConfig {
            plugin_dir: plugin_dir.to_path_buf(),
            server_conf: Some(server_conf),
            ..AppConfig::default()
        }
    }

    #[tokio::test]
    async fn test_builtin_simulators_bind() {
        let dir = TempDir::new().unwrap();
        let app = App::load(config(dir.path())).await.unwrap();
        assert_eq!(app.registry().len(), 2);

        let climate = app.climate();
        assert_eq!(climate.start_auto_discovery(), DiscoveryResult::SimulationBackendLoaded);
        assert_eq!(climate.target_temperature("FrontLeft"), Some(20));

        let tuner = app.tuner();
        assert_eq!(tuner.start_auto_discovery(), DiscoveryResult::SimulationBackendLoaded);
        assert_eq!(tuner.frequency(), Some(87_500_000));
    }

    #[tokio::test]
    async fn test_plugin_takes_precedence_over_builtin() {
        let dir = TempDir::new().unwrap();
        let plugin = dir.path().join("climate");
        std::fs::create_dir(&plugin).unwrap();
        std::fs::write(
            plugin.join("ivi-plugin.json"),
            r#"{"name": "climate_simulator", "factory": "climate_simulator", "interfaces": ["ivi.ClimateControl"]}"#,
        )
        .unwrap();

        let app = App::load(config(dir.path())).await.unwrap();
        assert_eq!(app.registry().len(), 2);

        let climate = app.climate();
        assert_eq!(climate.start_auto_discovery(), DiscoveryResult::ProductionBackendLoaded);
    }

    #[tokio::test]
    async fn test_feature_settings_applied() {
        let dir = TempDir::new().unwrap();
        let mut config = config(dir.path());
        config.builtin_simulators = false;
        config.features.insert(
            "tuner".to_string(),
            FeatureSettings {
                discovery_mode: Some(DiscoveryMode::Disabled),
                ..FeatureSettings::default()
            },
        );

        let app = App::load(config).await.unwrap();
        assert!(app.registry().is_empty());
        assert!(app.registry().configuration().unwrap().settings("tuner").is_some());

        let tuner = app.tuner();
        tuner.set_configuration_id(Some("tuner".to_string()));
        assert_eq!(tuner.discovery_mode(), DiscoveryMode::Disabled);
        assert_eq!(tuner.start_auto_discovery(), DiscoveryResult::NoResult);
    }
}
