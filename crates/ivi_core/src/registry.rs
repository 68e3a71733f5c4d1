//! Service Registry
//!
//! Catalog of backends known to the process. Backends are registered either
//! as a descriptor plus factory (instantiated lazily the first time a feature
//! tries them) or as an already built [`BackendHandle`]. Lookups preserve
//! registration order, which features rely on as their tie-break.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use wildmatch::WildMatch;

use crate::backend::{BackendHandle, ServiceBackend};
use crate::config::ConfigurationManager;
use crate::error::{Error, Result};
use crate::signal::Signal;

// ─────────────────────────────────────────────────────────────────────────────
// Descriptors
// ─────────────────────────────────────────────────────────────────────────────

/// Static description of a backend, known before it is loaded
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendDescriptor {
    pub name: String,
    #[serde(default)]
    pub interfaces: Vec<String>,
    #[serde(default)]
    pub configuration_id: Option<String>,
    #[serde(default)]
    pub simulation: bool,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl BackendDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_interface(mut self, interface: impl Into<String>) -> Self {
        self.interfaces.push(interface.into());
        self
    }

    pub fn with_configuration_id(mut self, id: impl Into<String>) -> Self {
        self.configuration_id = Some(id.into());
        self
    }

    pub fn with_file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = Some(file_name.into());
        self
    }

    pub fn simulation(mut self, simulation: bool) -> Self {
        self.simulation = simulation;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// A backend counts as simulation when flagged explicitly, through its
    /// metadata, or by a `_simulation`/`_simulator` file name.
    pub fn is_simulation(&self) -> bool {
        if self.simulation {
            return true;
        }
        if self.metadata.get("simulation").and_then(Value::as_bool) == Some(true) {
            return true;
        }
        self.file_name
            .as_deref()
            .is_some_and(|f| f.contains("_simulation") || f.contains("_simulator"))
    }

    pub fn backend_type(&self) -> BackendType {
        if self.is_simulation() {
            BackendType::Simulation
        } else {
            BackendType::Production
        }
    }

    /// Name matched against preferred-backend wildcards
    pub fn identifier(&self) -> &str {
        self.file_name.as_deref().unwrap_or(&self.name)
    }

    pub fn implements(&self, interface: &str) -> bool {
        self.interfaces.iter().any(|i| i == interface)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendType {
    Production,
    Simulation,
}

/// Which kinds of backends a lookup returns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchFlags {
    pub production: bool,
    pub simulation: bool,
}

impl SearchFlags {
    pub const PRODUCTION: SearchFlags = SearchFlags {
        production: true,
        simulation: false,
    };
    pub const SIMULATION: SearchFlags = SearchFlags {
        production: false,
        simulation: true,
    };
    pub const ALL: SearchFlags = SearchFlags {
        production: true,
        simulation: true,
    };

    pub fn includes(&self, backend_type: BackendType) -> bool {
        match backend_type {
            BackendType::Production => self.production,
            BackendType::Simulation => self.simulation,
        }
    }
}

impl Default for SearchFlags {
    fn default() -> Self {
        SearchFlags::ALL
    }
}

/// Factory producing a backend on first use
pub type BackendFactory = Arc<dyn Fn() -> Result<Arc<dyn ServiceBackend>> + Send + Sync>;

/// Row-range notifications for list-style observers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryEvent {
    Inserted { first: usize, last: usize },
    Removed { first: usize, last: usize },
}

/// A backend returned by a lookup, not necessarily loaded yet
#[derive(Debug, Clone)]
pub struct ServiceCandidate {
    id: u64,
    pub descriptor: BackendDescriptor,
}

impl ServiceCandidate {
    pub fn backend_type(&self) -> BackendType {
        self.descriptor.backend_type()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Registry
// ─────────────────────────────────────────────────────────────────────────────

struct Entry {
    id: u64,
    descriptor: BackendDescriptor,
    factory: Option<BackendFactory>,
    handle: Option<Arc<BackendHandle>>,
}

#[derive(Default)]
struct RegistryState {
    next_id: u64,
    entries: Vec<Entry>,
}

struct RegistryInner {
    state: Mutex<RegistryState>,
    events: Signal<RegistryEvent>,
    configuration: Option<ConfigurationManager>,
}

/// Process catalog of backends. Cloning yields another handle to the same
/// catalog.
#[derive(Clone)]
pub struct ServiceRegistry {
    inner: Arc<RegistryInner>,
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("backends", &self.len())
            .finish()
    }
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Registry whose backends and features pick up settings from `configuration`
    pub fn with_configuration(configuration: ConfigurationManager) -> Self {
        Self::build(Some(configuration))
    }

    fn build(configuration: Option<ConfigurationManager>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                state: Mutex::new(RegistryState::default()),
                events: Signal::new(),
                configuration,
            }),
        }
    }

    pub fn configuration(&self) -> Option<&ConfigurationManager> {
        self.inner.configuration.as_ref()
    }

    pub fn events(&self) -> &Signal<RegistryEvent> {
        &self.inner.events
    }

    /// Register a backend to be created by `factory` on first use.
    ///
    /// Returns `Ok(false)` when the same file was already registered under
    /// the same name.
    pub fn register_backend<F>(&self, descriptor: BackendDescriptor, factory: F) -> Result<bool>
    where
        F: Fn() -> Result<Arc<dyn ServiceBackend>> + Send + Sync + 'static,
    {
        self.insert(descriptor, Some(Arc::new(factory)), None)
    }

    /// Register an already constructed handle
    pub fn register_instance(
        &self,
        handle: BackendHandle,
        backend_type: BackendType,
    ) -> Result<Arc<BackendHandle>> {
        let mut descriptor = BackendDescriptor::new(handle.name())
            .simulation(backend_type == BackendType::Simulation);
        descriptor.interfaces = handle.interfaces().to_vec();
        descriptor.configuration_id = handle.configuration_id().map(str::to_string);

        let handle = Arc::new(handle);
        self.insert(descriptor, None, Some(Arc::clone(&handle)))?;
        if let Some(configuration) = self.configuration() {
            configuration.configure_service_object(&handle);
        }
        Ok(handle)
    }

    fn insert(
        &self,
        descriptor: BackendDescriptor,
        factory: Option<BackendFactory>,
        handle: Option<Arc<BackendHandle>>,
    ) -> Result<bool> {
        if descriptor.interfaces.is_empty() {
            tracing::warn!(backend = %descriptor.name, "Backend metadata declares no interfaces");
            return Err(Error::MalformedMetadata(format!(
                "backend '{}' declares no interfaces",
                descriptor.name
            )));
        }

        let row = {
            let mut state = self.inner.state.lock();

            if let Some(file_name) = &descriptor.file_name {
                let duplicate = state.entries.iter().any(|e| {
                    e.descriptor.file_name.as_ref() == Some(file_name)
                        && e.descriptor.name == descriptor.name
                });
                if duplicate {
                    tracing::debug!(
                        backend = %descriptor.name,
                        file = %file_name,
                        "Skipping backend, it was already registered"
                    );
                    return Ok(false);
                }
            }

            state.next_id += 1;
            let id = state.next_id;
            tracing::debug!(
                backend = %descriptor.name,
                interfaces = ?descriptor.interfaces,
                simulation = descriptor.is_simulation(),
                "Registered backend"
            );
            state.entries.push(Entry {
                id,
                descriptor,
                factory,
                handle,
            });
            state.entries.len() - 1
        };

        self.inner.events.emit(&RegistryEvent::Inserted {
            first: row,
            last: row,
        });
        Ok(true)
    }

    /// Remove every backend registered under `name`. Returns how many were removed.
    pub fn unregister_backend(&self, name: &str) -> usize {
        let mut removed_rows = Vec::new();
        let mut dropped = Vec::new();
        {
            let mut state = self.inner.state.lock();
            let mut row = 0;
            state.entries.retain_mut(|entry| {
                let keep = entry.descriptor.name != name;
                if !keep {
                    removed_rows.push(row + removed_rows.len());
                    dropped.extend(entry.handle.take());
                } else {
                    row += 1;
                }
                keep
            });
        }

        // Notify bottom-up so each range refers to the rows still present.
        for row in removed_rows.iter().rev() {
            self.inner.events.emit(&RegistryEvent::Removed {
                first: *row,
                last: *row,
            });
        }
        // Outside the lock; bound features react to `destroyed`.
        for handle in dropped {
            handle.invalidate();
        }
        removed_rows.len()
    }

    /// Backends implementing `interface`, filtered by type and narrowed by the
    /// first `preferred` wildcard that matches any of them.
    pub fn find_service_by_interface(
        &self,
        interface: &str,
        flags: SearchFlags,
        preferred: &[String],
    ) -> Vec<ServiceCandidate> {
        let candidates: Vec<ServiceCandidate> = {
            let state = self.inner.state.lock();
            state
                .entries
                .iter()
                .filter(|e| e.descriptor.implements(interface))
                .filter(|e| flags.includes(e.descriptor.backend_type()))
                .map(|e| ServiceCandidate {
                    id: e.id,
                    descriptor: e.descriptor.clone(),
                })
                .collect()
        };

        for wildcard in preferred {
            let pattern = WildMatch::new(wildcard);
            let matching: Vec<ServiceCandidate> = candidates
                .iter()
                .filter(|c| pattern.matches(c.descriptor.identifier()))
                .cloned()
                .collect();
            if !matching.is_empty() {
                return matching;
            }
        }

        candidates
    }

    /// Loaded handles of every backend implementing `interface`, in
    /// registration order. Backends that fail to load are skipped.
    pub fn find_by_interface(&self, interface: &str) -> Vec<Arc<BackendHandle>> {
        self.find_service_by_interface(interface, SearchFlags::ALL, &[])
            .iter()
            .filter_map(|candidate| self.load(candidate))
            .collect()
    }

    /// Instantiate `candidate` if needed and return its handle
    pub fn load(&self, candidate: &ServiceCandidate) -> Option<Arc<BackendHandle>> {
        let factory = {
            let state = self.inner.state.lock();
            let entry = state.entries.iter().find(|e| e.id == candidate.id)?;
            if let Some(handle) = &entry.handle {
                return Some(Arc::clone(handle));
            }
            entry.factory.clone()?
        };

        let name = &candidate.descriptor.name;
        let backend = match factory() {
            Ok(backend) => backend,
            Err(e) => {
                tracing::warn!(backend = %name, error = %e, "Failed to load backend");
                return None;
            }
        };

        let mut handle = BackendHandle::from_backend(name.clone(), backend);
        if handle.configuration_id().is_none() {
            if let Some(id) = &candidate.descriptor.configuration_id {
                handle = handle.with_configuration_id(id.clone());
            }
        }
        let handle = Arc::new(handle);

        let stored = {
            let mut state = self.inner.state.lock();
            let entry = state.entries.iter_mut().find(|e| e.id == candidate.id)?;
            match &entry.handle {
                Some(existing) => Arc::clone(existing),
                None => {
                    entry.handle = Some(Arc::clone(&handle));
                    handle
                }
            }
        };

        tracing::info!(backend = %name, "Loaded backend");
        if let Some(configuration) = self.configuration() {
            configuration.configure_service_object(&stored);
        }
        Some(stored)
    }

    /// Destroy every loaded backend and clear the catalog. Handles still held
    /// elsewhere are invalidated, so bound features detach regardless.
    pub fn unload_all(&self) {
        let (count, handles) = {
            let mut state = self.inner.state.lock();
            let count = state.entries.len();
            let handles: Vec<Arc<BackendHandle>> = state
                .entries
                .drain(..)
                .filter_map(|mut e| e.handle.take())
                .collect();
            (count, handles)
        };

        if count > 0 {
            self.inner.events.emit(&RegistryEvent::Removed {
                first: 0,
                last: count - 1,
            });
        }
        tracing::debug!(count, "Unloaded all backends");
        for handle in handles {
            handle.invalidate();
        }
    }

    /// All registered descriptors, in registration order
    pub fn descriptors(&self) -> Vec<BackendDescriptor> {
        let state = self.inner.state.lock();
        state.entries.iter().map(|e| e.descriptor.clone()).collect()
    }

    /// Every interface name any backend declares, deduplicated
    pub fn interfaces(&self) -> Vec<String> {
        let state = self.inner.state.lock();
        let mut names: Vec<String> = Vec::new();
        for entry in &state.entries {
            for interface in &entry.descriptor.interfaces {
                if !names.contains(interface) {
                    names.push(interface.clone());
                }
            }
        }
        names
    }

    pub fn has_interface(&self, interface: &str) -> bool {
        let state = self.inner.state.lock();
        state.entries.iter().any(|e| e.descriptor.implements(interface))
    }

    pub fn is_loaded(&self, candidate: &ServiceCandidate) -> bool {
        let state = self.inner.state.lock();
        state
            .entries
            .iter()
            .any(|e| e.id == candidate.id && e.handle.is_some())
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Capability;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct EmptyBackend {
        interfaces: Vec<String>,
    }

    impl ServiceBackend for EmptyBackend {
        fn interfaces(&self) -> Vec<String> {
            self.interfaces.clone()
        }

        fn interface_instance(&self, _interface: &str) -> Option<Capability> {
            None
        }
    }

    fn factory(interface: &'static str) -> impl Fn() -> Result<Arc<dyn ServiceBackend>> + Send + Sync {
        move || {
            Ok(Arc::new(EmptyBackend {
                interfaces: vec![interface.to_string()],
            }) as Arc<dyn ServiceBackend>)
        }
    }

    fn names(candidates: &[ServiceCandidate]) -> Vec<String> {
        candidates.iter().map(|c| c.descriptor.name.clone()).collect()
    }

    #[test]
    fn test_lookup_preserves_registration_order() {
        let registry = ServiceRegistry::new();
        for name in ["b", "a", "c"] {
            registry
                .register_backend(BackendDescriptor::new(name).with_interface("tuner"), factory("tuner"))
                .unwrap();
        }
        registry
            .register_backend(BackendDescriptor::new("other").with_interface("climate"), factory("climate"))
            .unwrap();

        let found = registry.find_service_by_interface("tuner", SearchFlags::ALL, &[]);
        assert_eq!(names(&found), vec!["b", "a", "c"]);

        let handles = registry.find_by_interface("tuner");
        let loaded: Vec<&str> = handles.iter().map(|h| h.name()).collect();
        assert_eq!(loaded, vec!["b", "a", "c"]);
    }

    #[test]
    fn test_empty_interfaces_rejected() {
        let registry = ServiceRegistry::new();
        let result = registry.register_backend(BackendDescriptor::new("broken"), factory("x"));
        assert!(matches!(result, Err(Error::MalformedMetadata(_))));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_duplicate_file_skipped() {
        let registry = ServiceRegistry::new();
        let descriptor = BackendDescriptor::new("tuner")
            .with_interface("tuner")
            .with_file_name("libtuner.so");
        assert!(registry.register_backend(descriptor.clone(), factory("tuner")).unwrap());
        assert!(!registry.register_backend(descriptor, factory("tuner")).unwrap());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_simulation_detection() {
        assert!(BackendDescriptor::new("x").simulation(true).is_simulation());
        assert!(BackendDescriptor::new("x").with_file_name("libclimate_simulator.so").is_simulation());
        assert!(BackendDescriptor::new("x").with_file_name("tuner_simulation").is_simulation());
        assert!(
            BackendDescriptor::new("x")
                .with_metadata("simulation", Value::Bool(true))
                .is_simulation()
        );
        assert!(!BackendDescriptor::new("x").with_file_name("libclimate.so").is_simulation());
    }

    #[test]
    fn test_search_flags() {
        let registry = ServiceRegistry::new();
        registry
            .register_backend(BackendDescriptor::new("sim").with_interface("tuner").simulation(true), factory("tuner"))
            .unwrap();
        registry
            .register_backend(BackendDescriptor::new("prod").with_interface("tuner"), factory("tuner"))
            .unwrap();

        let production = registry.find_service_by_interface("tuner", SearchFlags::PRODUCTION, &[]);
        assert_eq!(names(&production), vec!["prod"]);
        let simulation = registry.find_service_by_interface("tuner", SearchFlags::SIMULATION, &[]);
        assert_eq!(names(&simulation), vec!["sim"]);
    }

    #[test]
    fn test_preferred_backends() {
        let registry = ServiceRegistry::new();
        for file in ["libtuner_vendor_a.so", "libtuner_vendor_b.so", "libtuner_simulation.so"] {
            registry
                .register_backend(
                    BackendDescriptor::new(file).with_interface("tuner").with_file_name(file),
                    factory("tuner"),
                )
                .unwrap();
        }

        let preferred = vec!["*_vendor_c*".to_string(), "*_vendor_b*".to_string(), "*".to_string()];
        let found = registry.find_service_by_interface("tuner", SearchFlags::ALL, &preferred);
        assert_eq!(names(&found), vec!["libtuner_vendor_b.so"]);

        let nothing_matches = vec!["*dab*".to_string()];
        let found = registry.find_service_by_interface("tuner", SearchFlags::ALL, &nothing_matches);
        assert_eq!(found.len(), 3);
    }

    #[test]
    fn test_lazy_loading_happens_once() {
        let registry = ServiceRegistry::new();
        let created = Arc::new(AtomicUsize::new(0));
        let c = created.clone();
        registry
            .register_backend(BackendDescriptor::new("lazy").with_interface("tuner"), move || {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(Arc::new(EmptyBackend {
                    interfaces: vec!["tuner".to_string()],
                }) as Arc<dyn ServiceBackend>)
            })
            .unwrap();

        let candidate = registry.find_service_by_interface("tuner", SearchFlags::ALL, &[]).remove(0);
        assert!(!registry.is_loaded(&candidate));
        assert_eq!(created.load(Ordering::SeqCst), 0);

        let first = registry.load(&candidate).unwrap();
        let second = registry.load(&candidate).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(created.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failing_factory_is_skipped() {
        let registry = ServiceRegistry::new();
        registry
            .register_backend(BackendDescriptor::new("broken").with_interface("tuner"), || {
                Err(Error::BackendLoad("device missing".to_string()))
            })
            .unwrap();
        registry
            .register_backend(BackendDescriptor::new("ok").with_interface("tuner"), factory("tuner"))
            .unwrap();

        let handles = registry.find_by_interface("tuner");
        assert_eq!(handles.len(), 1);
        assert_eq!(handles[0].name(), "ok");
    }

    #[test]
    fn test_events_and_unload_all() {
        let registry = ServiceRegistry::new();
        let events = Arc::new(Mutex::new(Vec::new()));
        let e = events.clone();
        registry.events().connect(move |event| e.lock().push(*event));

        registry
            .register_backend(BackendDescriptor::new("a").with_interface("tuner"), factory("tuner"))
            .unwrap();
        registry
            .register_backend(BackendDescriptor::new("b").with_interface("tuner"), factory("tuner"))
            .unwrap();

        let handle = registry.find_by_interface("tuner").remove(0);
        let destroyed = Arc::new(AtomicUsize::new(0));
        let d = destroyed.clone();
        handle.destroyed().connect(move |_| {
            d.fetch_add(1, Ordering::SeqCst);
        });
        drop(handle);

        registry.unload_all();
        assert!(registry.is_empty());
        assert_eq!(destroyed.load(Ordering::SeqCst), 1);
        assert_eq!(
            *events.lock(),
            vec![
                RegistryEvent::Inserted { first: 0, last: 0 },
                RegistryEvent::Inserted { first: 1, last: 1 },
                RegistryEvent::Removed { first: 0, last: 1 },
            ]
        );
    }

    #[test]
    fn test_unregister_backend() {
        let registry = ServiceRegistry::new();
        for name in ["a", "b", "a"] {
            registry
                .register_backend(BackendDescriptor::new(name).with_interface("tuner"), factory("tuner"))
                .unwrap();
        }
        assert_eq!(registry.unregister_backend("a"), 2);
        assert_eq!(registry.unregister_backend("missing"), 0);
        assert_eq!(names(&registry.find_service_by_interface("tuner", SearchFlags::ALL, &[])), vec!["b"]);
    }

    #[test]
    fn test_register_instance() {
        let registry = ServiceRegistry::new();
        let handle = registry
            .register_instance(
                BackendHandle::from_backend(
                    "direct",
                    Arc::new(EmptyBackend {
                        interfaces: vec!["climate".to_string()],
                    }),
                ),
                BackendType::Simulation,
            )
            .unwrap();

        let found = registry.find_by_interface("climate");
        assert!(Arc::ptr_eq(&found[0], &handle));
        let candidates = registry.find_service_by_interface("climate", SearchFlags::SIMULATION, &[]);
        assert_eq!(candidates.len(), 1);
        assert_eq!(registry.interfaces(), vec!["climate".to_string()]);
        assert!(registry.has_interface("climate"));
    }
}
