//! Feature Configuration
//!
//! Settings grouped by configuration id. Features that carry a configuration
//! id pick up discovery mode, preferred backends and the backend-updates flag;
//! backend handles with a matching id receive the service settings.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::backend::BackendHandle;
use crate::feature::DiscoveryMode;

/// Settings for one configuration id. Unset fields leave the target alone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct FeatureSettings {
    #[serde(default)]
    pub discovery_mode: Option<DiscoveryMode>,
    #[serde(default)]
    pub preferred_backends: Option<Vec<String>>,
    #[serde(default)]
    pub backend_updates_enabled: Option<bool>,
    #[serde(default)]
    pub service_settings: Option<Value>,
}

/// Returns false once its target is gone
type Applier = Box<dyn Fn(&FeatureSettings) -> bool + Send + Sync>;

/// Registration returned by [`ConfigurationManager::watch`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchId(u64);

struct Watcher {
    token: WatchId,
    id: String,
    applier: Arc<Applier>,
}

#[derive(Default)]
struct ConfigurationInner {
    entries: RwLock<HashMap<String, FeatureSettings>>,
    watchers: Mutex<Vec<Watcher>>,
    next_watch: AtomicU64,
    /// Loaded backends by configuration id
    service_objects: Mutex<Vec<(String, Weak<BackendHandle>)>>,
}

/// Shared table of [`FeatureSettings`] keyed by configuration id
#[derive(Clone, Default)]
pub struct ConfigurationManager {
    inner: Arc<ConfigurationInner>,
}

impl std::fmt::Debug for ConfigurationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigurationManager")
            .field("entries", &*self.inner.entries.read())
            .finish()
    }
}

impl ConfigurationManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: HashMap<String, FeatureSettings>) -> Self {
        let manager = Self::new();
        *manager.inner.entries.write() = entries;
        manager
    }

    pub fn settings(&self, id: &str) -> Option<FeatureSettings> {
        self.inner.entries.read().get(id).cloned()
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.entries.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Replace the settings for `id`. Watchers of `id` pick up the feature
    /// part; loaded backends with that configuration id receive the service
    /// settings.
    pub fn set(&self, id: impl Into<String>, settings: FeatureSettings) {
        let id = id.into();
        self.inner.entries.write().insert(id.clone(), settings.clone());

        let appliers: Vec<(WatchId, Arc<Applier>)> = self
            .inner
            .watchers
            .lock()
            .iter()
            .filter(|w| w.id == id)
            .map(|w| (w.token, Arc::clone(&w.applier)))
            .collect();

        let mut stale = Vec::new();
        for (token, applier) in appliers {
            if !applier(&settings) {
                stale.push(token);
            }
        }
        if !stale.is_empty() {
            self.inner.watchers.lock().retain(|w| !stale.contains(&w.token));
        }

        if let Some(service_settings) = &settings.service_settings {
            for handle in self.service_objects(&id) {
                tracing::debug!(backend = %handle.name(), configuration_id = %id, "Updating service settings");
                handle.update_service_settings(service_settings);
            }
        }
    }

    /// Apply the settings for `id` now and whenever they change. Returns
    /// `None` when the applier already reported its target gone.
    pub fn watch<F>(&self, id: impl Into<String>, applier: F) -> Option<WatchId>
    where
        F: Fn(&FeatureSettings) -> bool + Send + Sync + 'static,
    {
        let id = id.into();
        let applier: Arc<Applier> = Arc::new(Box::new(applier));
        let current = self.settings(&id);
        if let Some(settings) = current {
            if !applier(&settings) {
                return None;
            }
        }
        let token = WatchId(self.inner.next_watch.fetch_add(1, Ordering::Relaxed));
        self.inner.watchers.lock().push(Watcher { token, id, applier });
        Some(token)
    }

    pub fn unwatch(&self, token: WatchId) {
        self.inner.watchers.lock().retain(|w| w.token != token);
    }

    /// Forward service settings to a freshly loaded backend and keep track of
    /// it for later updates
    pub fn configure_service_object(&self, handle: &Arc<BackendHandle>) {
        let Some(id) = handle.configuration_id() else {
            return;
        };
        {
            let mut tracked = self.inner.service_objects.lock();
            tracked.retain(|(_, weak)| weak.upgrade().is_some_and(|h| !h.is_invalidated()));
            if !tracked.iter().any(|(_, weak)| weak.as_ptr() == Arc::as_ptr(handle)) {
                tracked.push((id.to_string(), Arc::downgrade(handle)));
            }
        }

        let settings = self.settings(id).and_then(|s| s.service_settings);
        if let Some(settings) = settings {
            tracing::debug!(backend = %handle.name(), configuration_id = id, "Applying service settings");
            handle.update_service_settings(&settings);
        }
    }

    /// Live backends loaded under configuration `id`
    pub fn service_objects(&self, id: &str) -> Vec<Arc<BackendHandle>> {
        self.inner
            .service_objects
            .lock()
            .iter()
            .filter(|(tracked, _)| tracked == id)
            .filter_map(|(_, weak)| weak.upgrade())
            .filter(|handle| !handle.is_invalidated())
            .collect()
    }

    pub fn watcher_count(&self) -> usize {
        self.inner.watchers.lock().len()
    }
}
