//! Features
//!
//! A [`Feature`] is the client-facing end of one interface. It asks the
//! [`ServiceRegistry`] for backends implementing its interface, binds to one
//! of them and forwards the backend's notifications. Interface-specific
//! behavior is supplied by a [`FeatureBinding`], whose hooks run whenever the
//! feature attaches to or detaches from a backend.
//!
//! The feature holds only a weak reference to its backend. When the backend
//! handle is destroyed the feature falls back to the unbound state and emits
//! the same change notifications as a manual unbind.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::backend::{BackendHandle, Capability};
use crate::config::{FeatureSettings, WatchId};
use crate::error::FeatureError;
use crate::registry::{SearchFlags, ServiceRegistry};
use crate::signal::{Connection, ConnectionSet, Signal};

// ─────────────────────────────────────────────────────────────────────────────
// Discovery
// ─────────────────────────────────────────────────────────────────────────────

/// Which backends automatic discovery may pick
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DiscoveryMode {
    /// Discovery is off; backends must be set manually
    Disabled,
    /// Production backends first, simulation as fallback
    #[default]
    Auto,
    ProductionOnly,
    SimulationOnly,
}

/// Outcome of the last discovery attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DiscoveryResult {
    #[default]
    NoResult,
    ErrorWhileLoading,
    ProductionBackendLoaded,
    SimulationBackendLoaded,
}

// ─────────────────────────────────────────────────────────────────────────────
// Binding hooks
// ─────────────────────────────────────────────────────────────────────────────

/// Interface-specific part of a feature
pub trait FeatureBinding: Send + Sync + 'static {
    /// Decide whether `handle` can serve this feature
    fn accept_service_object(&self, ctx: &FeatureContext, handle: &BackendHandle) -> bool {
        handle.has_interface(ctx.interface_name())
    }

    /// Wire the backend's interface-specific signals. Every connection made
    /// here must be pushed into `connections`.
    fn connect_to_service_object(
        &self,
        _ctx: &FeatureContext,
        _handle: &Arc<BackendHandle>,
        _connections: &mut ConnectionSet,
    ) {
    }

    /// Called before the feature's connections to `handle` are dropped
    fn disconnect_from_service_object(&self, _ctx: &FeatureContext, _handle: &Arc<BackendHandle>) {}

    /// Reset cached state to defaults
    fn clear_service_object(&self, _ctx: &FeatureContext) {}
}

impl FeatureBinding for () {}

/// Weak handle a binding can use to report back into its feature
#[derive(Clone)]
pub struct FeatureContext {
    interface: Arc<str>,
    core: Weak<FeatureCore>,
}

impl std::fmt::Debug for FeatureContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeatureContext")
            .field("interface", &self.interface)
            .finish()
    }
}

impl FeatureContext {
    pub fn interface_name(&self) -> &str {
        &self.interface
    }

    pub fn set_error(&self, code: FeatureError, message: &str) {
        if let Some(core) = self.core.upgrade() {
            core.set_error(code, message);
        }
    }

    pub fn is_alive(&self) -> bool {
        self.core.strong_count() > 0
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// State
// ─────────────────────────────────────────────────────────────────────────────

/// Change notifications of a feature
#[derive(Debug, Default)]
pub struct FeatureSignals {
    pub service_object_changed: Signal<()>,
    pub is_valid_changed: Signal<bool>,
    pub is_initialized_changed: Signal<bool>,
    pub discovery_mode_changed: Signal<DiscoveryMode>,
    pub discovery_result_changed: Signal<DiscoveryResult>,
    /// `(code, formatted message)`
    pub error_changed: Signal<(FeatureError, String)>,
    pub preferred_backends_changed: Signal<Vec<String>>,
    pub backend_updates_enabled_changed: Signal<bool>,
    pub configuration_id_changed: Signal<Option<String>>,
}

struct FeatureState {
    service_object: Option<Weak<BackendHandle>>,
    destroyed_connection: Option<Connection>,
    backend_connections: ConnectionSet,
    connected: bool,
    initialized: bool,
    discovery_mode: DiscoveryMode,
    discovery_result: DiscoveryResult,
    error: FeatureError,
    error_message: String,
    backend_updates_enabled: bool,
    preferred_backends: Vec<String>,
    configuration_id: Option<String>,
    configuration_watch: Option<WatchId>,
}

impl Default for FeatureState {
    fn default() -> Self {
        Self {
            service_object: None,
            destroyed_connection: None,
            backend_connections: ConnectionSet::new(),
            connected: false,
            initialized: false,
            discovery_mode: DiscoveryMode::default(),
            discovery_result: DiscoveryResult::default(),
            error: FeatureError::NoError,
            error_message: String::new(),
            backend_updates_enabled: true,
            preferred_backends: Vec::new(),
            configuration_id: None,
            configuration_watch: None,
        }
    }
}

/// Binding-independent part of a feature
pub struct FeatureCore {
    interface: Arc<str>,
    registry: ServiceRegistry,
    state: Mutex<FeatureState>,
    signals: FeatureSignals,
}

impl FeatureCore {
    fn set_error(&self, code: FeatureError, message: &str) {
        let text = code.describe(message);
        {
            let mut state = self.state.lock();
            state.error = code;
            state.error_message = text.clone();
        }
        if code.is_error() {
            tracing::debug!(interface = %self.interface, error = %code, detail = message, "Feature error");
        }
        self.signals.error_changed.emit(&(code, text));
    }

    fn on_initialization_done(&self) {
        let changed = {
            let mut state = self.state.lock();
            !std::mem::replace(&mut state.initialized, true)
        };
        if changed {
            self.signals.is_initialized_changed.emit(&true);
        }
    }
}

struct FeatureInner<B> {
    core: Arc<FeatureCore>,
    binding: B,
}

impl<B> Drop for FeatureInner<B> {
    fn drop(&mut self) {
        let (destroyed, mut connections, watch) = {
            let mut state = self.core.state.lock();
            (
                state.destroyed_connection.take(),
                std::mem::take(&mut state.backend_connections),
                state.configuration_watch.take(),
            )
        };
        if let Some(connection) = destroyed {
            connection.disconnect();
        }
        connections.disconnect_all();
        if let (Some(watch), Some(configuration)) = (watch, self.core.registry.configuration()) {
            configuration.unwatch(watch);
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Feature
// ─────────────────────────────────────────────────────────────────────────────

/// Client-facing binding point for one interface. Clones share state.
pub struct Feature<B: FeatureBinding> {
    inner: Arc<FeatureInner<B>>,
}

impl<B: FeatureBinding> Clone for Feature<B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: FeatureBinding> std::fmt::Debug for Feature<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Feature")
            .field("interface", &self.interface_name())
            .field("valid", &self.is_valid())
            .field("discovery_mode", &self.discovery_mode())
            .field("discovery_result", &self.discovery_result())
            .finish()
    }
}

impl<B: FeatureBinding> Feature<B> {
    pub fn new(interface: impl Into<String>, registry: ServiceRegistry, binding: B) -> Self {
        let interface: String = interface.into();
        Self {
            inner: Arc::new(FeatureInner {
                core: Arc::new(FeatureCore {
                    interface: Arc::from(interface),
                    registry,
                    state: Mutex::new(FeatureState::default()),
                    signals: FeatureSignals::default(),
                }),
                binding,
            }),
        }
    }

    fn core(&self) -> &FeatureCore {
        &self.inner.core
    }

    fn downgrade(&self) -> Weak<FeatureInner<B>> {
        Arc::downgrade(&self.inner)
    }

    fn upgrade(weak: &Weak<FeatureInner<B>>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    pub fn binding(&self) -> &B {
        &self.inner.binding
    }

    pub fn context(&self) -> FeatureContext {
        FeatureContext {
            interface: Arc::clone(&self.inner.core.interface),
            core: Arc::downgrade(&self.inner.core),
        }
    }

    pub fn signals(&self) -> &FeatureSignals {
        &self.core().signals
    }

    pub fn interface_name(&self) -> &str {
        &self.core().interface
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.core().registry
    }

    pub fn service_object(&self) -> Option<Arc<BackendHandle>> {
        self.core()
            .state
            .lock()
            .service_object
            .as_ref()
            .and_then(Weak::upgrade)
    }

    /// The bound backend's implementation of this feature's interface
    pub fn capability(&self) -> Option<Capability> {
        self.service_object()?.interface_instance(self.interface_name())
    }

    /// Typed view of the bound backend, e.g. `feature.backend::<dyn ClimateControlBackend>()`
    pub fn backend<T>(&self) -> Option<Arc<T>>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.capability()?.get::<T>()
    }

    pub fn is_valid(&self) -> bool {
        self.service_object().is_some()
    }

    pub fn is_initialized(&self) -> bool {
        self.core().state.lock().initialized
    }

    pub fn discovery_mode(&self) -> DiscoveryMode {
        self.core().state.lock().discovery_mode
    }

    pub fn set_discovery_mode(&self, mode: DiscoveryMode) {
        let changed = {
            let mut state = self.core().state.lock();
            std::mem::replace(&mut state.discovery_mode, mode) != mode
        };
        if changed {
            self.signals().discovery_mode_changed.emit(&mode);
        }
    }

    pub fn discovery_result(&self) -> DiscoveryResult {
        self.core().state.lock().discovery_result
    }

    fn set_discovery_result(&self, result: DiscoveryResult) {
        let changed = {
            let mut state = self.core().state.lock();
            std::mem::replace(&mut state.discovery_result, result) != result
        };
        if changed {
            self.signals().discovery_result_changed.emit(&result);
        }
    }

    pub fn error(&self) -> FeatureError {
        self.core().state.lock().error
    }

    /// `"<Code> <message>"`, empty while there is no error
    pub fn error_message(&self) -> String {
        self.core().state.lock().error_message.clone()
    }

    /// Name of the current error code, empty while there is no error
    pub fn error_text(&self) -> &'static str {
        match self.error() {
            FeatureError::NoError => "",
            code => code.as_str(),
        }
    }

    /// Record an error and emit `error_changed`, even if the code is unchanged
    pub fn set_error(&self, code: FeatureError, message: &str) {
        self.core().set_error(code, message);
    }

    pub fn preferred_backends(&self) -> Vec<String> {
        self.core().state.lock().preferred_backends.clone()
    }

    pub fn set_preferred_backends(&self, backends: Vec<String>) {
        let changed = {
            let mut state = self.core().state.lock();
            if state.preferred_backends == backends {
                false
            } else {
                state.preferred_backends = backends.clone();
                true
            }
        };
        if changed {
            self.signals().preferred_backends_changed.emit(&backends);
        }
    }

    pub fn backend_updates_enabled(&self) -> bool {
        self.core().state.lock().backend_updates_enabled
    }

    /// Disabling detaches from the backend's notifications while keeping the
    /// backend bound; enabling reattaches.
    pub fn set_backend_updates_enabled(&self, enabled: bool) {
        let changed = {
            let mut state = self.core().state.lock();
            std::mem::replace(&mut state.backend_updates_enabled, enabled) != enabled
        };
        if !changed {
            return;
        }

        if let Some(handle) = self.service_object() {
            if enabled {
                self.connect_backend(&handle);
            } else {
                self.disconnect_backend(&handle);
            }
        }
        self.signals().backend_updates_enabled_changed.emit(&enabled);
    }

    pub fn configuration_id(&self) -> Option<String> {
        self.core().state.lock().configuration_id.clone()
    }

    /// Attach this feature to the settings stored under `id`
    pub fn set_configuration_id(&self, id: Option<String>) {
        let previous_watch = {
            let mut state = self.core().state.lock();
            if state.configuration_id == id {
                return;
            }
            state.configuration_id = id.clone();
            state.configuration_watch.take()
        };
        if let (Some(watch), Some(configuration)) = (previous_watch, self.registry().configuration()) {
            configuration.unwatch(watch);
        }
        self.signals().configuration_id_changed.emit(&id);

        let (Some(id), Some(configuration)) = (id, self.registry().configuration()) else {
            return;
        };
        let weak = self.downgrade();
        let watched = id.clone();
        let watched_id = id.clone();
        let watch = configuration.watch(id, move |settings| {
            let Some(feature) = Self::upgrade(&weak) else {
                return false;
            };
            if feature.configuration_id().as_deref() != Some(watched.as_str()) {
                return false;
            }
            feature.apply_settings(settings);
            true
        });

        let mut state = self.core().state.lock();
        if state.configuration_id.as_deref() == Some(watched_id.as_str()) {
            state.configuration_watch = watch;
        } else if let Some(watch) = watch {
            drop(state);
            configuration.unwatch(watch);
        }
    }

    fn apply_settings(&self, settings: &FeatureSettings) {
        if let Some(mode) = settings.discovery_mode {
            self.set_discovery_mode(mode);
        }
        if let Some(preferred) = &settings.preferred_backends {
            self.set_preferred_backends(preferred.clone());
        }
        if let Some(enabled) = settings.backend_updates_enabled {
            self.set_backend_updates_enabled(enabled);
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Discovery & binding
    // ─────────────────────────────────────────────────────────────────────────

    /// Look up a backend for this feature's interface and bind to it.
    ///
    /// Does nothing and reports `NoResult` when already bound or when
    /// discovery is disabled.
    pub fn start_auto_discovery(&self) -> DiscoveryResult {
        let (mode, preferred) = {
            let state = self.core().state.lock();
            (state.discovery_mode, state.preferred_backends.clone())
        };

        if self.is_valid() || mode == DiscoveryMode::Disabled {
            self.set_discovery_result(DiscoveryResult::NoResult);
            return DiscoveryResult::NoResult;
        }

        let interface = self.interface_name().to_string();
        let mut result = DiscoveryResult::NoResult;

        if matches!(mode, DiscoveryMode::Auto | DiscoveryMode::ProductionOnly) {
            if self.bind_first_candidate(SearchFlags::PRODUCTION, &preferred) {
                result = DiscoveryResult::ProductionBackendLoaded;
            } else {
                tracing::warn!("There is no production backend implementing {}", interface);
            }
        }

        if result == DiscoveryResult::NoResult
            && matches!(mode, DiscoveryMode::Auto | DiscoveryMode::SimulationOnly)
        {
            if self.bind_first_candidate(SearchFlags::SIMULATION, &preferred) {
                result = DiscoveryResult::SimulationBackendLoaded;
            } else {
                tracing::warn!("There is no simulation backend implementing {}", interface);
            }
        }

        if result == DiscoveryResult::NoResult {
            tracing::warn!(interface = %interface, "No suitable backend found");
            self.set_error(
                FeatureError::Unknown,
                &format!("no backend implementing {}", interface),
            );
            result = DiscoveryResult::ErrorWhileLoading;
        }

        self.set_discovery_result(result);
        result
    }

    fn bind_first_candidate(&self, flags: SearchFlags, preferred: &[String]) -> bool {
        let registry = self.registry().clone();
        let candidates = registry.find_service_by_interface(self.interface_name(), flags, preferred);

        for candidate in &candidates {
            let Some(handle) = registry.load(candidate) else {
                continue;
            };
            if self.set_service_object(Some(handle)) {
                if candidates.len() > 1 {
                    tracing::warn!(
                        backend = %candidate.descriptor.name,
                        "There is more than one backend implementing {}. Using the first one",
                        self.interface_name()
                    );
                }
                return true;
            }
        }
        false
    }

    /// Bind to `handle`, or unbind with `None`.
    ///
    /// Returns false if `handle` is already bound, was unloaded, or was
    /// rejected by `accept_service_object`.
    pub fn set_service_object(&self, handle: Option<Arc<BackendHandle>>) -> bool {
        if let Some(h) = handle.as_ref().filter(|h| h.is_invalidated()) {
            tracing::warn!(backend = %h.name(), "Refusing to bind an unloaded backend");
            return false;
        }
        let current = self.service_object();
        let unchanged = match (&current, &handle) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        };
        if unchanged {
            return false;
        }

        let had_previous = current.is_some();
        if let Some(old) = &current {
            self.disconnect_backend(old);
            let destroyed = self.core().state.lock().destroyed_connection.take();
            if let Some(connection) = destroyed {
                connection.disconnect();
            }
        }
        self.core().state.lock().service_object = None;
        drop(current);

        let ctx = self.context();
        let Some(handle) = handle else {
            self.binding().clear_service_object(&ctx);
            self.signals().service_object_changed.notify();
            self.signals().is_valid_changed.emit(&false);
            return true;
        };

        if !self.binding().accept_service_object(&ctx, &handle) {
            tracing::warn!(
                interface = %self.interface_name(),
                backend = %handle.name(),
                "Backend is not accepted"
            );
            self.binding().clear_service_object(&ctx);
            if had_previous {
                self.signals().service_object_changed.notify();
                self.signals().is_valid_changed.emit(&false);
            }
            return false;
        }

        let weak = self.downgrade();
        let destroyed = handle.destroyed().connect(move |_| {
            if let Some(feature) = Self::upgrade(&weak) {
                feature.on_service_object_destroyed();
            }
        });
        let updates_enabled = {
            let mut state = self.core().state.lock();
            state.service_object = Some(Arc::downgrade(&handle));
            state.destroyed_connection = Some(destroyed);
            state.backend_updates_enabled
        };

        if updates_enabled {
            self.connect_backend(&handle);
        }

        tracing::debug!(interface = %self.interface_name(), backend = %handle.name(), "Bound backend");
        self.signals().service_object_changed.notify();
        self.signals().is_valid_changed.emit(&true);
        true
    }

    fn connect_backend(&self, handle: &Arc<BackendHandle>) {
        if self.core().state.lock().connected {
            return;
        }

        let ctx = self.context();
        let mut connections = ConnectionSet::new();
        self.binding()
            .connect_to_service_object(&ctx, handle, &mut connections);

        let capability = handle.interface_instance(self.interface_name());
        if let Some(capability) = &capability {
            let signals = capability.backend().signals();

            let core = Arc::downgrade(&self.inner.core);
            connections.push(signals.error_changed.connect(move |(code, message)| {
                if let Some(core) = core.upgrade() {
                    core.set_error(*code, message);
                }
            }));

            let core = Arc::downgrade(&self.inner.core);
            connections.push(signals.initialization_done.connect(move |_| {
                if let Some(core) = core.upgrade() {
                    core.on_initialization_done();
                }
            }));
        }

        let previous = {
            let mut state = self.core().state.lock();
            state.connected = true;
            std::mem::replace(&mut state.backend_connections, connections)
        };
        drop(previous);

        if let Some(capability) = capability {
            capability.backend().initialize();
        }
    }

    fn disconnect_backend(&self, handle: &Arc<BackendHandle>) {
        if !self.core().state.lock().connected {
            return;
        }

        self.binding()
            .disconnect_from_service_object(&self.context(), handle);

        let (mut connections, was_initialized) = {
            let mut state = self.core().state.lock();
            state.connected = false;
            (
                std::mem::take(&mut state.backend_connections),
                std::mem::replace(&mut state.initialized, false),
            )
        };
        connections.disconnect_all();
        if was_initialized {
            self.signals().is_initialized_changed.emit(&false);
        }
    }

    fn on_service_object_destroyed(&self) {
        tracing::debug!(interface = %self.interface_name(), "Bound backend was destroyed");

        let (mut connections, was_initialized) = {
            let mut state = self.core().state.lock();
            state.service_object = None;
            state.destroyed_connection = None;
            state.connected = false;
            (
                std::mem::take(&mut state.backend_connections),
                std::mem::replace(&mut state.initialized, false),
            )
        };
        connections.disconnect_all();

        if was_initialized {
            self.signals().is_initialized_changed.emit(&false);
        }
        self.binding().clear_service_object(&self.context());
        self.signals().service_object_changed.notify();
        self.signals().is_valid_changed.emit(&false);
    }
}
