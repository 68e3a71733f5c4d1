//! Built-in backend constructors, selected by a manifest's `factory` key

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use ivi_core::{BackendFactory, ServiceBackend};
use ivi_remote::{RemoteConfig, RemotePagingModelBackend};

use crate::climate::ClimateSimulationPlugin;
use crate::error::{Error, Result};
use crate::tuner::{
    AMFM_TUNER_INTERFACE, RemoteTunerBackend, RemoteTunerPlugin, STATION_LIST_SOURCE,
    TunerSimulationPlugin,
};

pub const CLIMATE_SIMULATOR_FACTORY: &str = "climate_simulator";
pub const TUNER_SIMULATOR_FACTORY: &str = "tuner_simulator";
pub const TUNER_REMOTE_FACTORY: &str = "tuner_remote";

/// Module name used to look up media connection urls
pub const MEDIA_MODULE: &str = "ivi.media";

const DEFAULT_INIT_TIMEOUT: Duration = Duration::from_millis(3000);

/// Factory key → constructor
#[derive(Clone, Default)]
pub struct BackendFactories {
    table: HashMap<String, BackendFactory>,
}

impl std::fmt::Debug for BackendFactories {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendFactories")
            .field("keys", &self.keys())
            .finish()
    }
}

impl BackendFactories {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulators plus a remote tuner resolved from an empty remote config
    pub fn builtin() -> Self {
        Self::with_remote(RemoteConfig::new(), DEFAULT_INIT_TIMEOUT)
    }

    pub fn with_remote(remote: RemoteConfig, init_timeout: Duration) -> Self {
        let mut factories = Self::new();

        factories.insert(CLIMATE_SIMULATOR_FACTORY, || {
            Ok(Arc::new(ClimateSimulationPlugin::new()) as Arc<dyn ServiceBackend>)
        });
        factories.insert(TUNER_SIMULATOR_FACTORY, || {
            Ok(Arc::new(TunerSimulationPlugin::new()) as Arc<dyn ServiceBackend>)
        });
        factories.insert(TUNER_REMOTE_FACTORY, move || {
            let load_error = |e: ivi_remote::RemoteError| ivi_core::Error::BackendLoad(e.to_string());
            let endpoint = remote
                .resolve_endpoint(MEDIA_MODULE, Some(AMFM_TUNER_INTERFACE), None)
                .map_err(load_error)?;
            let backend =
                RemoteTunerBackend::connect(endpoint.clone(), init_timeout).map_err(load_error)?;
            let stations =
                RemotePagingModelBackend::connect(STATION_LIST_SOURCE, endpoint, init_timeout)
                    .map_err(load_error)?;
            Ok(Arc::new(RemoteTunerPlugin::new(backend).with_stations(stations)) as Arc<dyn ServiceBackend>)
        });

        factories
    }

    pub fn insert<F>(&mut self, key: impl Into<String>, factory: F)
    where
        F: Fn() -> ivi_core::Result<Arc<dyn ServiceBackend>> + Send + Sync + 'static,
    {
        self.table.insert(key.into(), Arc::new(factory));
    }

    pub fn get(&self, key: &str) -> Result<BackendFactory> {
        self.table
            .get(key)
            .cloned()
            .ok_or_else(|| Error::UnknownFactory(key.to_string()))
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.table.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ivi_core::PAGING_MODEL_INTERFACE;

    #[test]
    fn test_builtin_keys() {
        let factories = BackendFactories::builtin();
        assert_eq!(
            factories.keys(),
            vec![CLIMATE_SIMULATOR_FACTORY, TUNER_REMOTE_FACTORY, TUNER_SIMULATOR_FACTORY]
        );
        assert!(matches!(factories.get("nope"), Err(Error::UnknownFactory(_))));
    }

    #[test]
    fn test_simulator_factory_builds_backend() {
        let factories = BackendFactories::builtin();
        let backend = (*factories.get(TUNER_SIMULATOR_FACTORY).unwrap())().unwrap();
        assert_eq!(backend.interfaces(), vec![AMFM_TUNER_INTERFACE, PAGING_MODEL_INTERFACE]);
        assert!(backend.interface_instance(AMFM_TUNER_INTERFACE).is_some());
        assert!(backend.interface_instance(PAGING_MODEL_INTERFACE).is_some());
    }

    #[test]
    fn test_remote_factory_needs_runtime() {
        let factories = BackendFactories::builtin();
        let result = (*factories.get(TUNER_REMOTE_FACTORY).unwrap())();
        assert!(matches!(result, Err(ivi_core::Error::BackendLoad(_))));
    }
}
