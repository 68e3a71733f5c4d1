//! Backends
//!
//! A backend is loaded as a [`ServiceBackend`], which names the interfaces it
//! implements and hands out one [`Capability`] per interface. The
//! [`BackendHandle`] wrapping it resolves that capability table once, at
//! construction, so features never query the backend at use time.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde_json::Value;

use crate::error::FeatureError;
use crate::signal::Signal;

// ─────────────────────────────────────────────────────────────────────────────
// Feature Backend
// ─────────────────────────────────────────────────────────────────────────────

/// Signals every interface implementation carries
#[derive(Debug, Default)]
pub struct BackendSignals {
    /// `(code, message)` reported by the backend
    pub error_changed: Signal<(FeatureError, String)>,
    /// Emitted once the backend has pushed its initial state
    pub initialization_done: Signal<()>,
}

impl BackendSignals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn report_error(&self, code: FeatureError, message: impl Into<String>) {
        self.error_changed.emit(&(code, message.into()));
    }
}

/// Common contract of a single interface implementation
pub trait FeatureBackend: Send + Sync {
    /// Push the current state through the backend's signals and finish with
    /// `initialization_done`. Called every time a feature connects.
    fn initialize(&self);

    fn signals(&self) -> &BackendSignals;
}

/// One interface implementation, usable both through the common
/// [`FeatureBackend`] contract and through its interface-specific trait.
#[derive(Clone)]
pub struct Capability {
    base: Arc<dyn FeatureBackend>,
    typed: Arc<dyn Any + Send + Sync>,
}

impl std::fmt::Debug for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Capability").finish_non_exhaustive()
    }
}

impl Capability {
    /// Pair the common view of an implementation with its typed view.
    ///
    /// ```text
    /// Capability::new::<dyn ClimateControlBackend>(backend.clone(), backend)
    /// ```
    pub fn new<T>(base: Arc<dyn FeatureBackend>, typed: Arc<T>) -> Self
    where
        T: ?Sized + Send + Sync + 'static,
    {
        Self {
            base,
            typed: Arc::new(typed),
        }
    }

    pub fn backend(&self) -> &Arc<dyn FeatureBackend> {
        &self.base
    }

    /// The typed view, if this capability was built for `T`
    pub fn get<T>(&self) -> Option<Arc<T>>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.typed.downcast_ref::<Arc<T>>().cloned()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Service Backend
// ─────────────────────────────────────────────────────────────────────────────

/// A loaded backend offering one or more interfaces
pub trait ServiceBackend: Send + Sync {
    fn interfaces(&self) -> Vec<String>;

    fn interface_instance(&self, interface: &str) -> Option<Capability>;

    fn configuration_id(&self) -> Option<String> {
        None
    }

    fn update_service_settings(&self, _settings: &Value) {}
}

// ─────────────────────────────────────────────────────────────────────────────
// Backend Handle
// ─────────────────────────────────────────────────────────────────────────────

/// Handle to one loaded backend.
///
/// Features keep only a weak reference. [`BackendHandle::destroyed`] fires once,
/// either when the registry unloads the handle through
/// [`BackendHandle::invalidate`] or when the last strong reference goes away.
pub struct BackendHandle {
    name: String,
    interfaces: Vec<String>,
    capabilities: HashMap<String, Capability>,
    backend: Option<Arc<dyn ServiceBackend>>,
    configuration_id: Option<String>,
    service_settings: Mutex<Value>,
    invalidated: AtomicBool,
    destroyed: Signal<()>,
}

impl std::fmt::Debug for BackendHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendHandle")
            .field("name", &self.name)
            .field("interfaces", &self.interfaces)
            .field("configuration_id", &self.configuration_id)
            .finish()
    }
}

impl BackendHandle {
    /// Wrap an in-process backend
    pub fn from_backend(name: impl Into<String>, backend: Arc<dyn ServiceBackend>) -> Self {
        let name = name.into();
        let interfaces = backend.interfaces();
        let mut capabilities = HashMap::new();

        for interface in &interfaces {
            match backend.interface_instance(interface) {
                Some(capability) => {
                    capabilities.insert(interface.clone(), capability);
                }
                None => {
                    tracing::warn!(
                        backend = %name,
                        interface = %interface,
                        "Backend declares an interface it does not provide"
                    );
                }
            }
        }

        Self {
            name,
            interfaces,
            capabilities,
            configuration_id: backend.configuration_id(),
            backend: Some(backend),
            service_settings: Mutex::new(Value::Null),
            invalidated: AtomicBool::new(false),
            destroyed: Signal::new(),
        }
    }

    /// Build a handle from an explicit interface → capability table
    pub fn from_capabilities<I, S>(name: impl Into<String>, capabilities: I) -> Self
    where
        I: IntoIterator<Item = (S, Capability)>,
        S: Into<String>,
    {
        let mut interfaces = Vec::new();
        let mut table = HashMap::new();
        for (interface, capability) in capabilities {
            let interface = interface.into();
            if table.insert(interface.clone(), capability).is_none() {
                interfaces.push(interface);
            }
        }

        Self {
            name: name.into(),
            interfaces,
            capabilities: table,
            backend: None,
            configuration_id: None,
            service_settings: Mutex::new(Value::Null),
            invalidated: AtomicBool::new(false),
            destroyed: Signal::new(),
        }
    }

    pub fn with_configuration_id(mut self, id: impl Into<String>) -> Self {
        self.configuration_id = Some(id.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn interfaces(&self) -> &[String] {
        &self.interfaces
    }

    pub fn has_interface(&self, interface: &str) -> bool {
        self.interfaces.iter().any(|i| i == interface)
    }

    pub fn interface_instance(&self, interface: &str) -> Option<Capability> {
        self.capabilities.get(interface).cloned()
    }

    pub fn configuration_id(&self) -> Option<&str> {
        self.configuration_id.as_deref()
    }

    pub fn service_settings(&self) -> Value {
        self.service_settings.lock().clone()
    }

    pub fn update_service_settings(&self, settings: &Value) {
        *self.service_settings.lock() = settings.clone();
        if let Some(backend) = &self.backend {
            backend.update_service_settings(settings);
        }
    }

    pub fn destroyed(&self) -> &Signal<()> {
        &self.destroyed
    }

    /// Mark the handle as unloaded and emit `destroyed`, even while other
    /// strong references are still around. Later calls and the final drop do
    /// nothing.
    pub fn invalidate(&self) {
        if self.invalidated.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!(backend = %self.name, "Backend handle destroyed");
        self.destroyed.notify();
    }

    pub fn is_invalidated(&self) -> bool {
        self.invalidated.load(Ordering::SeqCst)
    }
}

impl Drop for BackendHandle {
    fn drop(&mut self) {
        self.invalidate();
    }
}
