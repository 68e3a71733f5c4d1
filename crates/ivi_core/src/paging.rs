//! Paged Models
//!
//! A [`PagingModel`] presents a possibly long list that its backend delivers
//! in chunks. Each model registers with the backend under a random
//! identifier. Notifications carrying another model's identifier are ignored;
//! notifications without one apply to every model.
//!
//! With [`LoadingType::FetchMore`] the next chunk is appended once a read gets
//! within `fetch_more_threshold` rows of the end. [`LoadingType::DataChanged`]
//! needs a backend that reports the final count: the model is filled with
//! empty rows and a chunk is requested the first time one of its rows is read.
//!
//! Paging models do not discover backends. They are usually bound to the
//! service object of another feature.

use std::ops::{BitOr, Deref, Range};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::backend::{BackendHandle, FeatureBackend};
use crate::feature::{DiscoveryMode, Feature, FeatureBinding, FeatureContext};
use crate::registry::ServiceRegistry;
use crate::signal::{Connection, ConnectionSet, Signal};

/// Interface name of paged list backends
pub const PAGING_MODEL_INTERFACE: &str = "ivi.PagingModel";

pub const DEFAULT_CHUNK_SIZE: usize = 30;
pub const DEFAULT_FETCH_MORE_THRESHOLD: usize = 10;

/// What a backend supports for one model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelCapabilities(u32);

impl ModelCapabilities {
    pub const NO_EXTRAS: Self = Self(0);
    /// The backend reports the final item count through `count_changed`
    pub const SUPPORTS_GET_SIZE: Self = Self(1);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn bits(self) -> u32 {
        self.0
    }
}

impl BitOr for ModelCapabilities {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LoadingType {
    #[default]
    FetchMore,
    DataChanged,
}

// ─────────────────────────────────────────────────────────────────────────────
// Backend contract
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilitiesChanged {
    pub identifier: Option<Uuid>,
    pub capabilities: ModelCapabilities,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CountChanged {
    pub identifier: Option<Uuid>,
    pub count: usize,
}

/// Answer to [`PagingModelBackend::fetch_data`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataFetched {
    pub identifier: Option<Uuid>,
    pub items: Vec<Value>,
    pub start: usize,
    pub more_available: bool,
}

/// `count` rows from `start` were replaced by `data`. Rows are inserted or
/// removed when the lengths differ.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataChanged {
    pub identifier: Option<Uuid>,
    pub data: Vec<Value>,
    pub start: usize,
    pub count: usize,
}

#[derive(Debug, Default)]
pub struct PagingSignals {
    pub supported_capabilities_changed: Signal<CapabilitiesChanged>,
    pub count_changed: Signal<CountChanged>,
    pub data_fetched: Signal<DataFetched>,
    pub data_changed: Signal<DataChanged>,
}

/// Backend contract of [`PAGING_MODEL_INTERFACE`]
pub trait PagingModelBackend: FeatureBackend {
    fn register_instance(&self, identifier: Uuid);

    fn unregister_instance(&self, identifier: Uuid);

    /// Request up to `count` items from `start`. The items arrive through
    /// `data_fetched`, possibly later.
    fn fetch_data(&self, identifier: Uuid, start: usize, count: usize);

    fn paging_signals(&self) -> &PagingSignals;
}

fn addresses(identifier: Option<Uuid>, own: Uuid) -> bool {
    identifier.is_none_or(|id| id == own)
}

// ─────────────────────────────────────────────────────────────────────────────
// Model state
// ─────────────────────────────────────────────────────────────────────────────

/// Change notifications of a [`PagingModel`]. Row ranges are half open.
#[derive(Debug, Default)]
pub struct PagingModelSignals {
    pub capabilities_changed: Signal<ModelCapabilities>,
    pub chunk_size_changed: Signal<usize>,
    pub fetch_more_threshold_changed: Signal<usize>,
    pub loading_type_changed: Signal<LoadingType>,
    pub count_changed: Signal<usize>,
    pub rows_inserted: Signal<Range<usize>>,
    pub rows_removed: Signal<Range<usize>>,
    pub data_changed: Signal<Range<usize>>,
    pub model_reset: Signal<()>,
    pub fetch_more_threshold_reached: Signal<()>,
}

#[derive(Debug)]
struct ModelState {
    identifier: Uuid,
    registered: bool,
    capabilities: ModelCapabilities,
    chunk_size: usize,
    fetch_more_threshold: usize,
    loading_type: LoadingType,
    /// `None` rows are placeholders waiting for their chunk
    items: Vec<Option<Value>>,
    available_chunks: Vec<bool>,
    fetched_data_count: usize,
    more_available: bool,
}

impl Default for ModelState {
    fn default() -> Self {
        Self {
            identifier: Uuid::new_v4(),
            registered: false,
            capabilities: ModelCapabilities::NO_EXTRAS,
            chunk_size: DEFAULT_CHUNK_SIZE,
            fetch_more_threshold: DEFAULT_FETCH_MORE_THRESHOLD,
            loading_type: LoadingType::FetchMore,
            items: Vec::new(),
            available_chunks: Vec::new(),
            fetched_data_count: 0,
            more_available: false,
        }
    }
}

fn mark_available(chunks: &mut [bool], index: usize) {
    if let Some(chunk) = chunks.get_mut(index) {
        *chunk = true;
    }
}

enum RowDelta {
    Inserted(Range<usize>),
    Removed(Range<usize>),
}

enum Fetched {
    /// Rows appended, and the new count
    Appended(RowDelta, usize),
    /// Placeholder rows filled in
    Filled(Range<usize>),
}

#[derive(Default)]
struct ModelCore {
    state: Mutex<ModelState>,
    backend: Mutex<Option<Weak<dyn PagingModelBackend>>>,
    signals: PagingModelSignals,
}

impl ModelCore {
    fn backend(&self) -> Option<Arc<dyn PagingModelBackend>> {
        self.backend.lock().as_ref().and_then(Weak::upgrade)
    }

    fn emit_delta(&self, delta: RowDelta, count: usize) {
        match delta {
            RowDelta::Inserted(rows) => self.signals.rows_inserted.emit(&rows),
            RowDelta::Removed(rows) => self.signals.rows_removed.emit(&rows),
        }
        self.signals.count_changed.emit(&count);
    }

    fn on_initialization_done(&self) {
        let Some(backend) = self.backend() else {
            return;
        };
        let identifier = {
            let mut state = self.state.lock();
            if std::mem::replace(&mut state.registered, true) {
                return;
            }
            state.identifier
        };
        tracing::debug!(%identifier, "Registering paging model instance");
        backend.register_instance(identifier);
        self.reset_model();
    }

    fn on_capabilities_changed(&self, change: &CapabilitiesChanged) {
        {
            let mut state = self.state.lock();
            if !addresses(change.identifier, state.identifier) || state.capabilities == change.capabilities {
                return;
            }
            state.capabilities = change.capabilities;
        }
        self.signals.capabilities_changed.emit(&change.capabilities);
    }

    fn on_data_fetched(&self, fetched: &DataFetched) {
        let outcome = {
            let mut state = self.state.lock();
            if fetched.items.is_empty() || !addresses(fetched.identifier, state.identifier) {
                return;
            }
            if fetched.items.len() > state.chunk_size {
                tracing::warn!(
                    received = fetched.items.len(),
                    chunk_size = state.chunk_size,
                    "Backend delivered more items than one chunk"
                );
            }
            state.more_available = fetched.more_available;

            match state.loading_type {
                LoadingType::FetchMore => {
                    let first = state.items.len();
                    state.items.extend(fetched.items.iter().cloned().map(Some));
                    state.fetched_data_count = state.items.len();
                    Fetched::Appended(RowDelta::Inserted(first..state.items.len()), state.items.len())
                }
                LoadingType::DataChanged => {
                    let end = fetched.start + fetched.items.len();
                    if state.items.len() < end {
                        tracing::warn!(
                            start = fetched.start,
                            count = state.items.len(),
                            "count_changed needs to be emitted before data_fetched"
                        );
                        return;
                    }
                    state.fetched_data_count = end;
                    for (row, item) in state.items[fetched.start..end].iter_mut().zip(&fetched.items) {
                        *row = Some(item.clone());
                    }
                    let chunk = fetched.start / state.chunk_size;
                    mark_available(&mut state.available_chunks, chunk);
                    Fetched::Filled(fetched.start..end)
                }
            }
        };

        match outcome {
            Fetched::Appended(delta, count) => self.emit_delta(delta, count),
            Fetched::Filled(rows) => self.signals.data_changed.emit(&rows),
        }
    }

    fn on_count_changed(&self, change: &CountChanged) {
        let (previous, count) = {
            let mut state = self.state.lock();
            if state.loading_type != LoadingType::DataChanged
                || !addresses(change.identifier, state.identifier)
                || state.items.len() == change.count
            {
                return;
            }
            let previous = state.items.len();
            state.items.resize(change.count, None);
            let chunks = change.count / state.chunk_size + 1;
            state.available_chunks.resize(chunks, false);
            state.fetched_data_count = state.fetched_data_count.min(change.count);
            (previous, change.count)
        };

        let delta = if count > previous {
            RowDelta::Inserted(previous..count)
        } else {
            RowDelta::Removed(count..previous)
        };
        self.emit_delta(delta, count);
    }

    fn on_data_changed(&self, change: &DataChanged) {
        let (updated, structural) = {
            let mut state = self.state.lock();
            if !addresses(change.identifier, state.identifier) {
                return;
            }
            let len = state.items.len();
            if change.start > len || change.count > len - change.start {
                if state.loading_type == LoadingType::DataChanged {
                    tracing::warn!(
                        start = change.start,
                        count = change.count,
                        len,
                        "Changed range is out of bounds, count_changed needs to be emitted first"
                    );
                }
                return;
            }

            let updates = change.data.len().min(change.count);
            let tail = change.start + updates;
            for (row, item) in state.items[change.start..tail].iter_mut().zip(&change.data) {
                *row = Some(item.clone());
            }

            let structural = if change.data.len() > change.count {
                let rest = state.items.split_off(tail);
                state.items.extend(change.data[updates..].iter().cloned().map(Some));
                state.items.extend(rest);
                Some(RowDelta::Inserted(tail..tail + change.data.len() - change.count))
            } else if change.data.len() < change.count {
                let end = change.start + change.count;
                state.items.drain(tail..end);
                Some(RowDelta::Removed(tail..end))
            } else {
                None
            };
            if state.loading_type == LoadingType::FetchMore {
                state.fetched_data_count = state.items.len();
            }

            let updated = (updates > 0).then_some(change.start..tail);
            (updated, structural.map(|delta| (delta, state.items.len())))
        };

        if let Some(rows) = updated {
            self.signals.data_changed.emit(&rows);
        }
        if let Some((delta, count)) = structural {
            self.emit_delta(delta, count);
        }
    }

    fn reset_model(&self) {
        {
            let mut state = self.state.lock();
            state.items.clear();
            state.available_chunks.clear();
            state.fetched_data_count = 0;
            // Allows the first fetch
            state.more_available = true;
        }
        self.signals.model_reset.notify();
        self.signals.count_changed.emit(&0);
        self.fetch_more();
    }

    fn fetch_more(&self) {
        if self.backend().is_none() || !self.state.lock().more_available {
            return;
        }
        self.fetch_data(None);
    }

    /// Request the chunk at `start`, or the one after the fetched rows
    fn fetch_data(&self, start: Option<usize>) {
        let Some(backend) = self.backend() else {
            return;
        };
        let (identifier, start, count) = {
            let mut state = self.state.lock();
            state.more_available = false;
            let start = start.unwrap_or(state.fetched_data_count);
            let chunk = start / state.chunk_size;
            mark_available(&mut state.available_chunks, chunk);
            (state.identifier, start, state.chunk_size)
        };
        tracing::trace!(%identifier, start, count, "Fetching data");
        backend.fetch_data(identifier, start, count);
    }

    fn at(&self, row: usize) -> Option<Value> {
        let (item, near_end) = {
            let state = self.state.lock();
            if row >= state.items.len() {
                return None;
            }
            let chunk = row / state.chunk_size;
            let available = state.available_chunks.get(chunk).copied().unwrap_or(false);
            if state.loading_type == LoadingType::DataChanged && !available {
                let start = chunk * state.chunk_size;
                drop(state);
                self.fetch_data(Some(start));
                return None;
            }
            let near_end = row + state.fetch_more_threshold >= state.fetched_data_count && state.more_available;
            (state.items[row].clone(), near_end)
        };

        if near_end {
            self.signals.fetch_more_threshold_reached.notify();
            self.fetch_more();
        }
        item
    }

    fn clear_to_defaults(&self) {
        *self.backend.lock() = None;
        let (previous, current) = {
            let mut state = self.state.lock();
            let previous = std::mem::take(&mut *state);
            let current = (state.chunk_size, state.fetch_more_threshold, state.loading_type, state.capabilities);
            (previous, current)
        };
        let (chunk_size, threshold, loading_type, capabilities) = current;

        if previous.chunk_size != chunk_size {
            self.signals.chunk_size_changed.emit(&chunk_size);
        }
        if previous.fetch_more_threshold != threshold {
            self.signals.fetch_more_threshold_changed.emit(&threshold);
        }
        if previous.loading_type != loading_type {
            self.signals.loading_type_changed.emit(&loading_type);
        }
        if previous.capabilities != capabilities {
            self.signals.capabilities_changed.emit(&capabilities);
        }
        self.reset_model();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Binding
// ─────────────────────────────────────────────────────────────────────────────

fn route<T: 'static>(signal: &Signal<T>, core: &Arc<ModelCore>, handler: fn(&ModelCore, &T)) -> Connection {
    let core = Arc::downgrade(core);
    signal.connect(move |value| {
        if let Some(core) = core.upgrade() {
            handler(&core, value);
        }
    })
}

/// Paging specific part of the feature
#[derive(Default)]
pub struct PagingBinding {
    core: Arc<ModelCore>,
}

impl FeatureBinding for PagingBinding {
    fn connect_to_service_object(
        &self,
        ctx: &FeatureContext,
        handle: &Arc<BackendHandle>,
        connections: &mut ConnectionSet,
    ) {
        let Some(capability) = handle.interface_instance(ctx.interface_name()) else {
            return;
        };
        let Some(backend) = capability.get::<dyn PagingModelBackend>() else {
            tracing::warn!(backend = %handle.name(), "Backend offers no paging capability");
            return;
        };
        *self.core.backend.lock() = Some(Arc::downgrade(&backend));

        let signals = backend.paging_signals();
        connections.push(route(
            &signals.supported_capabilities_changed,
            &self.core,
            ModelCore::on_capabilities_changed,
        ));
        connections.push(route(&signals.data_fetched, &self.core, ModelCore::on_data_fetched));
        connections.push(route(&signals.count_changed, &self.core, ModelCore::on_count_changed));
        connections.push(route(&signals.data_changed, &self.core, ModelCore::on_data_changed));
        connections.push(route(
            &capability.backend().signals().initialization_done,
            &self.core,
            |core, _| core.on_initialization_done(),
        ));
    }

    fn disconnect_from_service_object(&self, _ctx: &FeatureContext, _handle: &Arc<BackendHandle>) {
        let registered = {
            let mut state = self.core.state.lock();
            std::mem::replace(&mut state.registered, false).then_some(state.identifier)
        };
        if let (Some(identifier), Some(backend)) = (registered, self.core.backend()) {
            backend.unregister_instance(identifier);
        }
        *self.core.backend.lock() = None;
    }

    fn clear_service_object(&self, _ctx: &FeatureContext) {
        self.core.clear_to_defaults();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Feature
// ─────────────────────────────────────────────────────────────────────────────

/// Generic list loaded from a [`PagingModelBackend`] in chunks
#[derive(Clone, Debug)]
pub struct PagingModel(Feature<PagingBinding>);

impl Deref for PagingModel {
    type Target = Feature<PagingBinding>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl PagingModel {
    pub fn new(registry: ServiceRegistry) -> Self {
        let feature = Feature::new(PAGING_MODEL_INTERFACE, registry, PagingBinding::default());
        feature.set_discovery_mode(DiscoveryMode::Disabled);
        Self(feature)
    }

    /// A model bound to `handle`, typically another feature's service object
    pub fn with_service_object(registry: ServiceRegistry, handle: Arc<BackendHandle>) -> Self {
        let model = Self::new(registry);
        model.set_service_object(Some(handle));
        model
    }

    fn core(&self) -> &ModelCore {
        &self.binding().core
    }

    pub fn model_signals(&self) -> &PagingModelSignals {
        &self.core().signals
    }

    /// Identifier this model is registered under
    pub fn identifier(&self) -> Uuid {
        self.core().state.lock().identifier
    }

    pub fn capabilities(&self) -> ModelCapabilities {
        self.core().state.lock().capabilities
    }

    pub fn chunk_size(&self) -> usize {
        self.core().state.lock().chunk_size
    }

    /// Rows requested per fetch. Zero is rejected.
    pub fn set_chunk_size(&self, chunk_size: usize) {
        if chunk_size == 0 {
            tracing::warn!("Chunk size must be at least one row");
            return;
        }
        {
            let mut state = self.core().state.lock();
            if std::mem::replace(&mut state.chunk_size, chunk_size) == chunk_size {
                return;
            }
        }
        self.model_signals().chunk_size_changed.emit(&chunk_size);
    }

    pub fn fetch_more_threshold(&self) -> usize {
        self.core().state.lock().fetch_more_threshold
    }

    pub fn set_fetch_more_threshold(&self, threshold: usize) {
        {
            let mut state = self.core().state.lock();
            if std::mem::replace(&mut state.fetch_more_threshold, threshold) == threshold {
                return;
            }
        }
        self.model_signals().fetch_more_threshold_changed.emit(&threshold);
    }

    pub fn loading_type(&self) -> LoadingType {
        self.core().state.lock().loading_type
    }

    /// Switch the loading type and reload. `DataChanged` is refused unless
    /// the backend supports getting the size.
    pub fn set_loading_type(&self, loading_type: LoadingType) -> bool {
        {
            let mut state = self.core().state.lock();
            if state.loading_type == loading_type {
                return false;
            }
            if loading_type == LoadingType::DataChanged
                && !state.capabilities.contains(ModelCapabilities::SUPPORTS_GET_SIZE)
            {
                tracing::warn!("The backend doesn't support the DataChanged loading type. This call will have no effect");
                return false;
            }
            state.loading_type = loading_type;
        }
        self.model_signals().loading_type_changed.emit(&loading_type);
        self.core().reset_model();
        true
    }

    /// Rows currently in the model, placeholders included
    pub fn row_count(&self) -> usize {
        self.core().state.lock().items.len()
    }

    /// Item at `row`. Reading near the end fetches the next chunk; reading a
    /// placeholder requests its chunk and returns `None`.
    pub fn at(&self, row: usize) -> Option<Value> {
        self.core().at(row)
    }

    /// Typed view of [`PagingModel::at`]
    pub fn get<T: serde::de::DeserializeOwned>(&self, row: usize) -> Option<T> {
        let value = self.at(row)?;
        match serde_json::from_value(value) {
            Ok(item) => Some(item),
            Err(e) => {
                tracing::warn!(row, error = %e, "Item has an unexpected shape");
                None
            }
        }
    }

    /// Loaded rows without triggering any fetch
    pub fn items(&self) -> Vec<Option<Value>> {
        self.core().state.lock().items.clone()
    }

    pub fn can_fetch_more(&self) -> bool {
        self.core().state.lock().more_available
    }

    pub fn fetch_more(&self) {
        self.core().fetch_more();
    }

    /// Drop every row and fetch from the start
    pub fn reload(&self) {
        self.core().reset_model();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendSignals, Capability, ServiceBackend};
    use crate::registry::BackendType;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ListBackend {
        signals: BackendSignals,
        paging: PagingSignals,
        items: Mutex<Vec<Value>>,
        capabilities: ModelCapabilities,
        deferred: bool,
        instances: Mutex<Vec<Uuid>>,
        requests: Mutex<Vec<(Uuid, usize, usize)>>,
    }

    impl ListBackend {
        fn new(len: usize, capabilities: ModelCapabilities) -> Arc<Self> {
            Self::build(len, capabilities, false)
        }

        /// Records requests without answering them
        fn deferred(len: usize) -> Arc<Self> {
            Self::build(len, ModelCapabilities::NO_EXTRAS, true)
        }

        fn build(len: usize, capabilities: ModelCapabilities, deferred: bool) -> Arc<Self> {
            Arc::new(Self {
                signals: BackendSignals::new(),
                paging: PagingSignals::default(),
                items: Mutex::new((0..len).map(|i| json!(format!("item {}", i))).collect()),
                capabilities,
                deferred,
                instances: Mutex::new(Vec::new()),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn answer(&self, identifier: Uuid, start: usize, count: usize) {
            let items = self.items.lock().clone();
            if self.capabilities.contains(ModelCapabilities::SUPPORTS_GET_SIZE) {
                self.paging.count_changed.emit(&CountChanged {
                    identifier: Some(identifier),
                    count: items.len(),
                });
            }
            let end = (start + count).min(items.len());
            self.paging.data_fetched.emit(&DataFetched {
                identifier: Some(identifier),
                items: items.get(start..end).unwrap_or_default().to_vec(),
                start,
                more_available: end < items.len(),
            });
        }
    }

    impl FeatureBackend for ListBackend {
        fn initialize(&self) {
            self.signals.initialization_done.notify();
        }

        fn signals(&self) -> &BackendSignals {
            &self.signals
        }
    }

    impl PagingModelBackend for ListBackend {
        fn register_instance(&self, identifier: Uuid) {
            self.instances.lock().push(identifier);
            self.paging.supported_capabilities_changed.emit(&CapabilitiesChanged {
                identifier: Some(identifier),
                capabilities: self.capabilities,
            });
        }

        fn unregister_instance(&self, identifier: Uuid) {
            self.instances.lock().retain(|id| *id != identifier);
        }

        fn fetch_data(&self, identifier: Uuid, start: usize, count: usize) {
            self.requests.lock().push((identifier, start, count));
            if !self.deferred {
                self.answer(identifier, start, count);
            }
        }

        fn paging_signals(&self) -> &PagingSignals {
            &self.paging
        }
    }

    struct ListPlugin(Arc<ListBackend>);

    impl ServiceBackend for ListPlugin {
        fn interfaces(&self) -> Vec<String> {
            vec![PAGING_MODEL_INTERFACE.to_string()]
        }

        fn interface_instance(&self, interface: &str) -> Option<Capability> {
            (interface == PAGING_MODEL_INTERFACE)
                .then(|| Capability::new::<dyn PagingModelBackend>(self.0.clone(), self.0.clone()))
        }
    }

    fn bound(backend: &Arc<ListBackend>) -> (ServiceRegistry, Arc<BackendHandle>) {
        let registry = ServiceRegistry::new();
        let handle = registry
            .register_instance(
                BackendHandle::from_backend("list", Arc::new(ListPlugin(backend.clone()))),
                BackendType::Simulation,
            )
            .unwrap();
        (registry, handle)
    }

    fn model(backend: &Arc<ListBackend>) -> PagingModel {
        let (registry, handle) = bound(backend);
        PagingModel::with_service_object(registry, handle)
    }

    fn counter<T: 'static>(signal: &Signal<T>) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        signal.connect(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        count
    }

    #[test]
    fn test_no_auto_discovery() {
        let backend = ListBackend::new(5, ModelCapabilities::NO_EXTRAS);
        let (registry, _handle) = bound(&backend);
        let model = PagingModel::new(registry);
        assert_eq!(model.discovery_mode(), DiscoveryMode::Disabled);
        model.start_auto_discovery();
        assert!(!model.is_valid());
        assert_eq!(model.row_count(), 0);
    }

    #[test]
    fn test_first_chunk_on_bind() {
        let backend = ListBackend::new(100, ModelCapabilities::NO_EXTRAS);
        let model = model(&backend);

        assert!(model.is_initialized());
        assert_eq!(*backend.instances.lock(), vec![model.identifier()]);
        assert_eq!(*backend.requests.lock(), vec![(model.identifier(), 0, DEFAULT_CHUNK_SIZE)]);
        assert_eq!(model.row_count(), 30);
        assert!(model.can_fetch_more());
        assert_eq!(model.at(30), None);
        assert_eq!(model.at(0), Some(json!("item 0")));
        assert_eq!(model.get::<String>(19).as_deref(), Some("item 19"));
        assert_eq!(backend.requests.lock().len(), 1);
    }

    #[test]
    fn test_fetch_more_threshold() {
        let backend = ListBackend::new(45, ModelCapabilities::NO_EXTRAS);
        let model = model(&backend);
        let reached = counter(&model.model_signals().fetch_more_threshold_reached);
        let inserted = Arc::new(Mutex::new(Vec::new()));
        let i = inserted.clone();
        model.model_signals().rows_inserted.connect(move |rows| i.lock().push(rows.clone()));

        model.at(19);
        assert_eq!(reached.load(Ordering::SeqCst), 0);
        assert_eq!(model.row_count(), 30);

        assert_eq!(model.at(20), Some(json!("item 20")));
        assert_eq!(reached.load(Ordering::SeqCst), 1);
        assert_eq!(model.row_count(), 45);
        assert_eq!(*inserted.lock(), vec![30..45]);
        assert!(!model.can_fetch_more());

        model.at(44);
        assert_eq!(backend.requests.lock().len(), 2);
        assert_eq!(backend.requests.lock()[1].1, 30);
    }

    #[test]
    fn test_pending_fetch_is_not_repeated() {
        let backend = ListBackend::deferred(100);
        let model = model(&backend);
        assert_eq!(backend.requests.lock().len(), 1);
        assert_eq!(model.row_count(), 0);

        model.fetch_more();
        assert_eq!(backend.requests.lock().len(), 1);

        backend.answer(model.identifier(), 0, 30);
        assert_eq!(model.row_count(), 30);
        model.at(25);
        model.at(26);
        assert_eq!(backend.requests.lock().len(), 2);
    }

    #[test]
    fn test_data_changed_loading() {
        let backend = ListBackend::new(100, ModelCapabilities::SUPPORTS_GET_SIZE);
        let model = model(&backend);
        assert!(model.capabilities().contains(ModelCapabilities::SUPPORTS_GET_SIZE));

        assert!(model.set_loading_type(LoadingType::DataChanged));
        assert_eq!(model.loading_type(), LoadingType::DataChanged);
        assert_eq!(model.row_count(), 100);
        assert_eq!(model.at(10), Some(json!("item 10")));

        let changed = Arc::new(Mutex::new(Vec::new()));
        let c = changed.clone();
        model.model_signals().data_changed.connect(move |rows| c.lock().push(rows.clone()));

        assert_eq!(model.items()[75], None);
        assert_eq!(model.at(75), None);
        assert_eq!(backend.requests.lock().last().map(|r| r.1), Some(60));
        assert_eq!(*changed.lock(), vec![60..90]);
        assert_eq!(model.at(75), Some(json!("item 75")));

        model.at(99);
        assert_eq!(model.at(99), Some(json!("item 99")));
    }

    #[test]
    fn test_loading_type_requires_get_size() {
        let backend = ListBackend::new(10, ModelCapabilities::NO_EXTRAS);
        let model = model(&backend);
        assert!(!model.set_loading_type(LoadingType::DataChanged));
        assert_eq!(model.loading_type(), LoadingType::FetchMore);
        assert_eq!(backend.requests.lock().len(), 1);
    }

    #[test]
    fn test_identifier_filter() {
        let backend = ListBackend::deferred(100);
        let model = model(&backend);

        backend.paging.data_fetched.emit(&DataFetched {
            identifier: Some(Uuid::new_v4()),
            items: vec![json!("foreign")],
            start: 0,
            more_available: false,
        });
        assert_eq!(model.row_count(), 0);

        backend.paging.data_fetched.emit(&DataFetched {
            identifier: None,
            items: vec![json!("everyone")],
            start: 0,
            more_available: true,
        });
        assert_eq!(model.at(0), Some(json!("everyone")));
    }

    #[test]
    fn test_two_models_share_a_backend() {
        let backend = ListBackend::new(40, ModelCapabilities::NO_EXTRAS);
        let (registry, handle) = bound(&backend);
        let first = PagingModel::with_service_object(registry.clone(), handle.clone());
        let second = PagingModel::with_service_object(registry, handle);
        assert_ne!(first.identifier(), second.identifier());
        assert_eq!(backend.instances.lock().len(), 2);

        first.set_chunk_size(10);
        first.reload();
        assert_eq!(first.row_count(), 10);
        assert_eq!(second.row_count(), 30);
    }

    #[test]
    fn test_data_changed_edits_rows() {
        let backend = ListBackend::new(5, ModelCapabilities::NO_EXTRAS);
        let model = model(&backend);
        let id = Some(model.identifier());
        let removed = Arc::new(Mutex::new(Vec::new()));
        let r = removed.clone();
        model.model_signals().rows_removed.connect(move |rows| r.lock().push(rows.clone()));

        backend.paging.data_changed.emit(&DataChanged {
            identifier: id,
            data: vec![json!("a"), json!("b"), json!("c")],
            start: 1,
            count: 1,
        });
        assert_eq!(model.row_count(), 7);
        assert_eq!(model.at(1), Some(json!("a")));
        assert_eq!(model.at(3), Some(json!("c")));
        assert_eq!(model.at(4), Some(json!("item 2")));

        backend.paging.data_changed.emit(&DataChanged {
            identifier: id,
            data: vec![json!("z")],
            start: 0,
            count: 3,
        });
        assert_eq!(model.row_count(), 5);
        assert_eq!(model.at(0), Some(json!("z")));
        assert_eq!(model.at(1), Some(json!("c")));
        assert_eq!(*removed.lock(), vec![1..3]);

        backend.paging.data_changed.emit(&DataChanged {
            identifier: id,
            data: vec![],
            start: 4,
            count: 2,
        });
        assert_eq!(model.row_count(), 5);
    }

    #[test]
    fn test_unbind_unregisters_and_clears() {
        let backend = ListBackend::new(100, ModelCapabilities::SUPPORTS_GET_SIZE);
        let model = model(&backend);
        model.set_chunk_size(20);
        let identifier = model.identifier();
        let capabilities = Arc::new(Mutex::new(Vec::new()));
        let c = capabilities.clone();
        model.model_signals().capabilities_changed.connect(move |caps| c.lock().push(*caps));

        assert!(model.set_service_object(None));
        assert!(backend.instances.lock().is_empty());
        assert_eq!(model.row_count(), 0);
        assert_eq!(model.chunk_size(), DEFAULT_CHUNK_SIZE);
        assert_ne!(model.identifier(), identifier);
        assert_eq!(*capabilities.lock(), vec![ModelCapabilities::NO_EXTRAS]);
        assert_eq!(model.at(0), None);
    }

    #[test]
    fn test_unloaded_backend_clears_model() {
        let backend = ListBackend::new(10, ModelCapabilities::NO_EXTRAS);
        let (registry, handle) = bound(&backend);
        let model = PagingModel::with_service_object(registry.clone(), handle);
        assert_eq!(model.row_count(), 10);

        registry.unload_all();
        assert!(!model.is_valid());
        assert_eq!(model.row_count(), 0);
    }
}
