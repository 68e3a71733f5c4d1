//! Remote Paging Models
//!
//! [`PagingModelSource`] serves a [`PagingModelBackend`] under a lookup name;
//! [`RemotePagingModelBackend`] is its replica. Backend notifications travel
//! as remote signals and every model filters them by its own identifier, so
//! one source can feed models in several processes.

use std::sync::Arc;
use std::time::Duration;

use ivi_core::{
    BackendSignals, CapabilitiesChanged, Capability, Connection, ConnectionSet, CountChanged,
    DataChanged, DataFetched, FeatureBackend, PagingModelBackend, PagingSignals,
    PendingReplyBase, Signal,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use uuid::Uuid;

use crate::config::Endpoint;
use crate::error::{RemoteError, RemoteResult};
use crate::protocol::RemoteSignal;
use crate::replica::ReplicaNode;
use crate::source::{RemoteSource, SourceEvent};

/// Interface revision exchanged in the handshake
pub const PAGING_MODEL_SIGNATURE: &str = "ivi.PagingModel/1.0";

const CAPABILITIES_CHANGED: &str = "supportedCapabilitiesChanged";
const COUNT_CHANGED: &str = "countChanged";
const DATA_FETCHED: &str = "dataFetched";
const DATA_CHANGED: &str = "dataChanged";

// ─────────────────────────────────────────────────────────────────────────────
// Source
// ─────────────────────────────────────────────────────────────────────────────

/// Serves a paging backend to remote models
pub struct PagingModelSource {
    name: String,
    backend: Arc<dyn PagingModelBackend>,
    events: Signal<SourceEvent>,
    _connections: ConnectionSet,
}

fn relay<T: Serialize + 'static>(signal: &Signal<T>, name: &'static str, events: &Signal<SourceEvent>) -> Connection {
    let events = events.clone();
    signal.connect(move |value| match serde_json::to_value(value) {
        Ok(args) => events.emit(&SourceEvent::Signal {
            name: name.to_string(),
            args,
        }),
        Err(e) => tracing::warn!(signal = name, error = %e, "Failed to serialize paging notification"),
    })
}

fn argument<T: DeserializeOwned>(method: &str, args: &[Value], index: usize) -> RemoteResult<T> {
    let invalid = |reason: String| RemoteError::InvalidArguments {
        method: method.to_string(),
        reason,
    };
    let value = args
        .get(index)
        .cloned()
        .ok_or_else(|| invalid(format!("missing argument {}", index)))?;
    serde_json::from_value(value).map_err(|e| invalid(e.to_string()))
}

impl PagingModelSource {
    /// Serve `backend` to replicas acquiring `name`
    pub fn new(name: impl Into<String>, backend: Arc<dyn PagingModelBackend>) -> Arc<Self> {
        let events = Signal::new();
        let signals = backend.paging_signals();

        let mut connections = ConnectionSet::new();
        connections.push(relay(&signals.supported_capabilities_changed, CAPABILITIES_CHANGED, &events));
        connections.push(relay(&signals.count_changed, COUNT_CHANGED, &events));
        connections.push(relay(&signals.data_fetched, DATA_FETCHED, &events));
        connections.push(relay(&signals.data_changed, DATA_CHANGED, &events));

        backend.initialize();

        Arc::new(Self {
            name: name.into(),
            backend,
            events,
            _connections: connections,
        })
    }
}

impl RemoteSource for PagingModelSource {
    fn signature(&self) -> String {
        PAGING_MODEL_SIGNATURE.to_string()
    }

    fn name(&self) -> String {
        self.name.clone()
    }

    fn properties(&self) -> Map<String, Value> {
        Map::new()
    }

    fn invoke(&self, method: &str, args: &[Value]) -> RemoteResult<PendingReplyBase> {
        tracing::debug!(method, source = %self.name, "Paging model call");
        match method {
            "registerInstance" => self.backend.register_instance(argument(method, args, 0)?),
            "unregisterInstance" => self.backend.unregister_instance(argument(method, args, 0)?),
            "fetchData" => self.backend.fetch_data(
                argument(method, args, 0)?,
                argument(method, args, 1)?,
                argument(method, args, 2)?,
            ),
            other => return Err(RemoteError::UnknownMethod(other.to_string())),
        }
        let reply = PendingReplyBase::new();
        reply.set_success(Value::Null);
        Ok(reply)
    }

    fn events(&self) -> &Signal<SourceEvent> {
        &self.events
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Replica backend
// ─────────────────────────────────────────────────────────────────────────────

fn dispatch(signals: &PagingSignals, signal: &RemoteSignal) {
    fn parse<T: DeserializeOwned>(signal: &RemoteSignal) -> Option<T> {
        match serde_json::from_value(signal.args.clone()) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                tracing::warn!(signal = %signal.name, error = %e, "Ignoring malformed paging notification");
                None
            }
        }
    }

    match signal.name.as_str() {
        CAPABILITIES_CHANGED => {
            if let Some(change) = parse::<CapabilitiesChanged>(signal) {
                signals.supported_capabilities_changed.emit(&change);
            }
        }
        COUNT_CHANGED => {
            if let Some(change) = parse::<CountChanged>(signal) {
                signals.count_changed.emit(&change);
            }
        }
        DATA_FETCHED => {
            if let Some(fetched) = parse::<DataFetched>(signal) {
                signals.data_fetched.emit(&fetched);
            }
        }
        DATA_CHANGED => {
            if let Some(change) = parse::<DataChanged>(signal) {
                signals.data_changed.emit(&change);
            }
        }
        other => tracing::debug!(signal = other, "Unknown paging notification"),
    }
}

/// Paging backend mirroring a remote [`PagingModelSource`]
pub struct RemotePagingModelBackend {
    node: ReplicaNode,
    signals: BackendSignals,
    paging: Arc<PagingSignals>,
    _connections: ConnectionSet,
}

impl RemotePagingModelBackend {
    /// Connect to the source served as `name` on `endpoint`. Must be called
    /// inside a tokio runtime.
    pub fn connect(name: &str, endpoint: Endpoint, init_timeout: Duration) -> RemoteResult<Arc<Self>> {
        let backend = Self::new(name);
        backend.node.connect(endpoint.clone())?;
        backend.node.watch_initialization(endpoint, init_timeout);
        Ok(Arc::new(backend))
    }

    /// A backend whose connection is established later through
    /// [`RemotePagingModelBackend::node`]
    pub fn new(name: &str) -> Self {
        let signals = BackendSignals::new();
        let node = ReplicaNode::with_name(name, PAGING_MODEL_SIGNATURE, signals.error_changed.clone());
        let paging = Arc::new(PagingSignals::default());

        let mut connections = ConnectionSet::new();
        let forwarded = Arc::clone(&paging);
        connections.push(
            node.signals()
                .remote_signal
                .connect(move |signal| dispatch(&forwarded, signal)),
        );
        let done = signals.initialization_done.clone();
        connections.push(node.signals().initialized.connect(move |_| done.notify()));

        Self {
            node,
            signals,
            paging,
            _connections: connections,
        }
    }

    pub fn node(&self) -> &ReplicaNode {
        &self.node
    }

    /// Capability for a plugin's interface table
    pub fn capability(self: &Arc<Self>) -> Capability {
        Capability::new::<dyn PagingModelBackend>(self.clone(), self.clone())
    }
}

impl Drop for RemotePagingModelBackend {
    fn drop(&mut self) {
        self.node.disconnect();
    }
}

impl FeatureBackend for RemotePagingModelBackend {
    fn initialize(&self) {
        if self.node.is_initialized() {
            self.signals.initialization_done.notify();
        }
    }

    fn signals(&self) -> &BackendSignals {
        &self.signals
    }
}

impl PagingModelBackend for RemotePagingModelBackend {
    fn register_instance(&self, identifier: Uuid) {
        self.node.call("registerInstance", vec![json!(identifier)]);
    }

    fn unregister_instance(&self, identifier: Uuid) {
        self.node.call("unregisterInstance", vec![json!(identifier)]);
    }

    fn fetch_data(&self, identifier: Uuid, start: usize, count: usize) {
        self.node
            .call("fetchData", vec![json!(identifier), json!(start), json!(count)]);
    }

    fn paging_signals(&self) -> &PagingSignals {
        &self.paging
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{ProxyTransportAdapter, SourceRegistry, serve_connection};
    use ivi_core::{
        BackendHandle, BackendType, PAGING_MODEL_INTERFACE, PagingModel, ServiceBackend,
        ServiceRegistry,
    };
    use parking_lot::Mutex;

    const STATIONS: &str = "test.Stations";

    #[derive(Default)]
    struct Numbers {
        signals: BackendSignals,
        paging: PagingSignals,
        instances: Mutex<Vec<Uuid>>,
    }

    const TOTAL: usize = 45;

    impl FeatureBackend for Numbers {
        fn initialize(&self) {
            self.signals.initialization_done.notify();
        }

        fn signals(&self) -> &BackendSignals {
            &self.signals
        }
    }

    impl PagingModelBackend for Numbers {
        fn register_instance(&self, identifier: Uuid) {
            self.instances.lock().push(identifier);
        }

        fn unregister_instance(&self, identifier: Uuid) {
            self.instances.lock().retain(|id| *id != identifier);
        }

        fn fetch_data(&self, identifier: Uuid, start: usize, count: usize) {
            let end = (start + count).min(TOTAL);
            self.paging.data_fetched.emit(&DataFetched {
                identifier: Some(identifier),
                items: (start..end).map(|i| json!(i)).collect(),
                start,
                more_available: end < TOTAL,
            });
        }

        fn paging_signals(&self) -> &PagingSignals {
            &self.paging
        }
    }

    struct Plugin(Arc<RemotePagingModelBackend>);

    impl ServiceBackend for Plugin {
        fn interfaces(&self) -> Vec<String> {
            vec![PAGING_MODEL_INTERFACE.to_string()]
        }

        fn interface_instance(&self, interface: &str) -> Option<Capability> {
            (interface == PAGING_MODEL_INTERFACE).then(|| self.0.capability())
        }
    }

    async fn wait_until(condition: impl Fn() -> bool) {
        for _ in 0..400 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[test]
    fn test_invalid_arguments() {
        let source = PagingModelSource::new(STATIONS, Arc::new(Numbers::default()));
        assert_eq!(source.name(), STATIONS);
        assert!(matches!(
            source.invoke("fetchData", &[json!(Uuid::new_v4()), json!(0)]),
            Err(RemoteError::InvalidArguments { .. })
        ));
        assert!(matches!(
            source.invoke("registerInstance", &[json!("not a uuid")]),
            Err(RemoteError::InvalidArguments { .. })
        ));
        assert!(matches!(source.invoke("sort", &[]), Err(RemoteError::UnknownMethod(_))));
    }

    #[tokio::test]
    async fn test_model_over_duplex() {
        let numbers = Arc::new(Numbers::default());
        let sources = SourceRegistry::new();
        sources.enable_remoting(Arc::new(ProxyTransportAdapter::new(PagingModelSource::new(
            STATIONS,
            numbers.clone(),
        ))));
        let (client, server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(serve_connection(sources, server));

        let backend = Arc::new(RemotePagingModelBackend::new(STATIONS));
        let registry = ServiceRegistry::new();
        let handle = registry
            .register_instance(
                BackendHandle::from_backend("stations", Arc::new(Plugin(backend.clone()))),
                BackendType::Production,
            )
            .unwrap();
        let model = PagingModel::with_service_object(registry, handle);
        assert!(model.is_valid());
        assert_eq!(model.row_count(), 0);

        backend.node().attach(client).unwrap();
        wait_until(|| model.row_count() == 30).await;
        assert!(model.is_initialized());
        assert_eq!(*numbers.instances.lock(), vec![model.identifier()]);
        assert_eq!(model.get::<usize>(7), Some(7));

        model.at(25);
        wait_until(|| model.row_count() == TOTAL).await;
        assert!(!model.can_fetch_more());
        assert_eq!(model.get::<usize>(44), Some(44));

        numbers.paging.data_changed.emit(&DataChanged {
            identifier: None,
            data: vec![json!("first")],
            start: 0,
            count: 1,
        });
        wait_until(|| model.at(0) == Some(json!("first"))).await;

        assert!(model.set_service_object(None));
        wait_until(|| numbers.instances.lock().is_empty()).await;
    }
}
