//! Out-of-process tuner
//!
//! [`TunerSource`] serves any [`AmFmTunerBackend`] to remote replicas.
//! [`RemoteTunerBackend`] is the client side: a production backend that
//! mirrors a served tuner through a [`ReplicaNode`].

use std::sync::Arc;
use std::time::Duration;

use ivi_core::{
    BackendSignals, Capability, Connection, ConnectionSet, FeatureBackend, PAGING_MODEL_INTERFACE,
    PendingReply, PendingReplyBase, ServiceBackend, Signal,
};
use ivi_remote::{
    Endpoint, RemoteError, RemotePagingModelBackend, RemoteResult, RemoteSource, ReplicaNode,
    SourceEvent,
};
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};

use super::{AMFM_TUNER_INTERFACE, AmFmTunerBackend, Band, BandInfo, Station, TunerSignals};

/// Interface revision exchanged in the handshake
pub const TUNER_SIGNATURE: &str = "ivi.AmFmTuner/1.0";

const BAND: &str = "band";
const FREQUENCY: &str = "frequency";
const STATION: &str = "station";
const SCAN_RUNNING: &str = "scanRunning";

// ─────────────────────────────────────────────────────────────────────────────
// Source
// ─────────────────────────────────────────────────────────────────────────────

/// Publishes a tuner backend's state and accepts calls for it
pub struct TunerSource {
    backend: Arc<dyn AmFmTunerBackend>,
    properties: Arc<Mutex<Map<String, Value>>>,
    events: Signal<SourceEvent>,
    _connections: ConnectionSet,
}

fn track<T>(
    signal: &Signal<T>,
    name: &'static str,
    properties: &Arc<Mutex<Map<String, Value>>>,
    events: &Signal<SourceEvent>,
) -> Connection
where
    T: Serialize + 'static,
{
    let properties = Arc::clone(properties);
    let events = events.clone();
    signal.connect(move |value| {
        let value = match serde_json::to_value(value) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(property = name, error = %e, "Failed to serialize tuner property");
                return;
            }
        };
        let previous = properties.lock().insert(name.to_string(), value.clone());
        if previous.as_ref() != Some(&value) {
            events.emit(&SourceEvent::PropertyChanged {
                name: name.to_string(),
                value,
            });
        }
    })
}

fn argument<T: DeserializeOwned>(method: &str, args: &[Value]) -> RemoteResult<T> {
    let invalid = |reason: String| RemoteError::InvalidArguments {
        method: method.to_string(),
        reason,
    };
    let value = args
        .first()
        .cloned()
        .ok_or_else(|| invalid("missing argument".to_string()))?;
    serde_json::from_value(value).map_err(|e| invalid(e.to_string()))
}

fn done() -> PendingReplyBase {
    let reply = PendingReplyBase::new();
    reply.set_success(Value::Null);
    reply
}

impl TunerSource {
    pub fn new(backend: Arc<dyn AmFmTunerBackend>) -> Arc<Self> {
        let properties = Arc::new(Mutex::new(Map::new()));
        let events = Signal::new();

        let signals = backend.tuner_signals();
        let mut connections = ConnectionSet::new();
        connections.push(track(&signals.band_changed, BAND, &properties, &events));
        connections.push(track(&signals.frequency_changed, FREQUENCY, &properties, &events));
        connections.push(track(&signals.station_changed, STATION, &properties, &events));
        connections.push(track(&signals.scan_status_changed, SCAN_RUNNING, &properties, &events));

        backend.initialize();

        Arc::new(Self {
            backend,
            properties,
            events,
            _connections: connections,
        })
    }
}

impl RemoteSource for TunerSource {
    fn signature(&self) -> String {
        TUNER_SIGNATURE.to_string()
    }

    fn properties(&self) -> Map<String, Value> {
        self.properties.lock().clone()
    }

    fn invoke(&self, method: &str, args: &[Value]) -> RemoteResult<PendingReplyBase> {
        tracing::debug!(method, "Tuner call");
        let reply = match method {
            "setFrequency" => {
                self.backend.set_frequency(argument(method, args)?);
                done()
            }
            "setBand" => {
                self.backend.set_band(argument(method, args)?);
                done()
            }
            "stepUp" => {
                self.backend.step_up();
                done()
            }
            "stepDown" => {
                self.backend.step_down();
                done()
            }
            "seekUp" => self.backend.seek_up().into_base(),
            "seekDown" => self.backend.seek_down().into_base(),
            "startScan" => {
                self.backend.start_scan();
                done()
            }
            "stopScan" => {
                self.backend.stop_scan();
                done()
            }
            other => return Err(RemoteError::UnknownMethod(other.to_string())),
        };
        Ok(reply)
    }

    fn events(&self) -> &Signal<SourceEvent> {
        &self.events
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Replica backend
// ─────────────────────────────────────────────────────────────────────────────

fn emit_property(signals: &TunerSignals, name: &str, value: &Value) {
    fn parse<T: DeserializeOwned>(name: &str, value: &Value) -> Option<T> {
        match serde_json::from_value(value.clone()) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                tracing::warn!(property = name, error = %e, "Ignoring malformed tuner property");
                None
            }
        }
    }

    match name {
        BAND => {
            if let Some(info) = parse::<BandInfo>(name, value) {
                signals.band_changed.emit(&info);
            }
        }
        FREQUENCY => {
            if let Some(frequency) = parse::<u32>(name, value) {
                signals.frequency_changed.emit(&frequency);
            }
        }
        STATION => {
            if let Some(station) = parse::<Station>(name, value) {
                signals.station_changed.emit(&station);
            }
        }
        SCAN_RUNNING => {
            if let Some(running) = parse::<bool>(name, value) {
                signals.scan_status_changed.emit(&running);
            }
        }
        other => tracing::debug!(property = other, "Unknown tuner property"),
    }
}

fn push_state(properties: &Map<String, Value>, signals: &TunerSignals, done: &Signal<()>) {
    for name in [BAND, FREQUENCY, STATION, SCAN_RUNNING] {
        if let Some(value) = properties.get(name) {
            emit_property(signals, name, value);
        }
    }
    done.notify();
}

/// Production tuner backed by a remote [`TunerSource`]
pub struct RemoteTunerBackend {
    node: ReplicaNode,
    signals: BackendSignals,
    tuner_signals: Arc<TunerSignals>,
    _connections: ConnectionSet,
}

impl RemoteTunerBackend {
    /// Connect to `endpoint`. Must be called inside a tokio runtime.
    ///
    /// If the source has not answered within `init_timeout` an error is
    /// logged; the connection is not retried.
    pub fn connect(endpoint: Endpoint, init_timeout: Duration) -> RemoteResult<Arc<Self>> {
        let backend = Self::new();
        backend.node.connect(endpoint.clone())?;
        backend.node.watch_initialization(endpoint, init_timeout);
        Ok(Arc::new(backend))
    }

    /// A backend whose connection is established later, e.g. with
    /// [`RemoteTunerBackend::node`] and [`ReplicaNode::attach`]
    pub fn new() -> Self {
        let signals = BackendSignals::new();
        let node = ReplicaNode::new(TUNER_SIGNATURE, signals.error_changed.clone());
        let tuner_signals = Arc::new(TunerSignals::default());

        let mut connections = ConnectionSet::new();
        let forwarded = Arc::clone(&tuner_signals);
        connections.push(
            node.signals()
                .property_changed
                .connect(move |change| emit_property(&forwarded, &change.name, &change.value)),
        );
        let forwarded = Arc::clone(&tuner_signals);
        let done = signals.initialization_done.clone();
        connections.push(
            node.signals()
                .initialized
                .connect(move |properties| push_state(properties, &forwarded, &done)),
        );

        Self {
            node,
            signals,
            tuner_signals,
            _connections: connections,
        }
    }

    pub fn node(&self) -> &ReplicaNode {
        &self.node
    }
}

impl Default for RemoteTunerBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RemoteTunerBackend {
    fn drop(&mut self) {
        self.node.disconnect();
    }
}

impl FeatureBackend for RemoteTunerBackend {
    fn initialize(&self) {
        if self.node.is_initialized() {
            push_state(
                &self.node.properties(),
                &self.tuner_signals,
                &self.signals.initialization_done,
            );
        }
    }

    fn signals(&self) -> &BackendSignals {
        &self.signals
    }
}

impl AmFmTunerBackend for RemoteTunerBackend {
    fn set_frequency(&self, frequency: u32) {
        self.node.call("setFrequency", vec![json!(frequency)]);
    }

    fn set_band(&self, band: Band) {
        self.node.call("setBand", vec![json!(band)]);
    }

    fn step_up(&self) {
        self.node.call("stepUp", Vec::new());
    }

    fn step_down(&self) {
        self.node.call("stepDown", Vec::new());
    }

    fn seek_up(&self) -> PendingReply<Station> {
        self.node.call_typed("seekUp", Vec::new())
    }

    fn seek_down(&self) -> PendingReply<Station> {
        self.node.call_typed("seekDown", Vec::new())
    }

    fn start_scan(&self) {
        self.node.call("startScan", Vec::new());
    }

    fn stop_scan(&self) {
        self.node.call("stopScan", Vec::new());
    }

    fn tuner_signals(&self) -> &TunerSignals {
        &self.tuner_signals
    }
}

/// Plugin entry exposing a [`RemoteTunerBackend`] and, when connected, the
/// remote station list
pub struct RemoteTunerPlugin {
    backend: Arc<RemoteTunerBackend>,
    stations: Option<Arc<RemotePagingModelBackend>>,
}

impl RemoteTunerPlugin {
    pub fn new(backend: Arc<RemoteTunerBackend>) -> Self {
        Self {
            backend,
            stations: None,
        }
    }

    pub fn with_stations(mut self, stations: Arc<RemotePagingModelBackend>) -> Self {
        self.stations = Some(stations);
        self
    }

    pub fn backend(&self) -> &Arc<RemoteTunerBackend> {
        &self.backend
    }
}

impl ServiceBackend for RemoteTunerPlugin {
    fn interfaces(&self) -> Vec<String> {
        let mut interfaces = vec![AMFM_TUNER_INTERFACE.to_string()];
        if self.stations.is_some() {
            interfaces.push(PAGING_MODEL_INTERFACE.to_string());
        }
        interfaces
    }

    fn interface_instance(&self, interface: &str) -> Option<Capability> {
        match interface {
            AMFM_TUNER_INTERFACE => Some(Capability::new::<dyn AmFmTunerBackend>(
                self.backend.clone(),
                self.backend.clone(),
            )),
            PAGING_MODEL_INTERFACE => self.stations.as_ref().map(|s| s.capability()),
            _ => None,
        }
    }
}
