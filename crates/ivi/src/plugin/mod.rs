//! Plugins
//!
//! Backends are described by `ivi-plugin.json` manifests. A manifest names a
//! built-in factory that constructs the backend the first time a feature
//! needs it.

mod factories;
mod loader;

pub use factories::{
    BackendFactories, CLIMATE_SIMULATOR_FACTORY, MEDIA_MODULE, TUNER_REMOTE_FACTORY,
    TUNER_SIMULATOR_FACTORY,
};
pub use loader::{
    DiscoveredPlugin, MANIFEST_FILE, PluginManifest, discover_plugins, load_manifest,
    register_plugins,
};
