//! AM/FM Tuner
//!
//! A non-zoned feature with asynchronous operations: seeking returns a
//! [`PendingReply`] that resolves with the station the tuner settled on.
//! Known stations are browsable as a paged list over the same service object.

mod remote;
mod simulation;
mod stations;

pub use remote::{RemoteTunerBackend, RemoteTunerPlugin, TUNER_SIGNATURE, TunerSource};
pub use simulation::{TunerSimulation, TunerSimulationPlugin};
pub use stations::{STATION_LIST_SOURCE, StationListSimulation};

use std::ops::Deref;
use std::sync::Arc;

use ivi_core::{
    BackendHandle, ConnectionSet, Feature, FeatureBackend, FeatureBinding, FeatureContext,
    PendingReply, ServiceRegistry, Signal,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Interface name of the tuner feature
pub const AMFM_TUNER_INTERFACE: &str = "ivi.AmFmTuner";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Band {
    AmBand,
    #[default]
    FmBand,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Station {
    pub id: String,
    pub name: String,
    /// Hz
    pub frequency: u32,
    pub band: Band,
}

/// Frequency range of the active band
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BandInfo {
    pub band: Band,
    pub minimum_frequency: u32,
    pub maximum_frequency: u32,
    pub step_size: u32,
}

#[derive(Debug, Default)]
pub struct TunerSignals {
    pub band_changed: Signal<BandInfo>,
    pub frequency_changed: Signal<u32>,
    pub station_changed: Signal<Station>,
    pub scan_status_changed: Signal<bool>,
}

/// Backend contract of [`AMFM_TUNER_INTERFACE`]
pub trait AmFmTunerBackend: FeatureBackend {
    fn set_frequency(&self, frequency: u32);

    fn set_band(&self, band: Band);

    fn step_up(&self);

    fn step_down(&self);

    /// Tune to the next known station
    fn seek_up(&self) -> PendingReply<Station>;

    fn seek_down(&self) -> PendingReply<Station>;

    fn start_scan(&self);

    fn stop_scan(&self);

    fn tuner_signals(&self) -> &TunerSignals;
}

// ─────────────────────────────────────────────────────────────────────────────
// Binding
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Clone)]
struct TunerState {
    band: Option<BandInfo>,
    frequency: Option<u32>,
    station: Option<Station>,
    scan_running: bool,
}

/// Tuner specific part of the feature
#[derive(Default)]
pub struct TunerBinding {
    state: Arc<Mutex<TunerState>>,
    signals: Arc<TunerSignals>,
}

/// Cache `value` through `store`, forwarding it when it changed
fn forward<T, F>(
    source: &Signal<T>,
    state: &Arc<Mutex<TunerState>>,
    target: impl Fn(&TunerSignals) -> &Signal<T> + Send + Sync + 'static,
    signals: &Arc<TunerSignals>,
    store: F,
) -> ivi_core::Connection
where
    T: Clone + PartialEq + Send + Sync + 'static,
    F: Fn(&mut TunerState, &T) -> bool + Send + Sync + 'static,
{
    let state = Arc::clone(state);
    let signals = Arc::clone(signals);
    source.connect(move |value| {
        let changed = store(&mut state.lock(), value);
        if changed {
            target(&signals).emit(value);
        }
    })
}

impl FeatureBinding for TunerBinding {
    fn connect_to_service_object(
        &self,
        ctx: &FeatureContext,
        handle: &Arc<BackendHandle>,
        connections: &mut ConnectionSet,
    ) {
        let Some(backend) = handle
            .interface_instance(ctx.interface_name())
            .and_then(|c| c.get::<dyn AmFmTunerBackend>())
        else {
            tracing::warn!(backend = %handle.name(), "Backend offers no tuner capability");
            return;
        };
        let source = backend.tuner_signals();

        connections.push(forward(
            &source.band_changed,
            &self.state,
            |s| &s.band_changed,
            &self.signals,
            |state, info| state.band.replace(*info) != Some(*info),
        ));
        connections.push(forward(
            &source.frequency_changed,
            &self.state,
            |s| &s.frequency_changed,
            &self.signals,
            |state, frequency| state.frequency.replace(*frequency) != Some(*frequency),
        ));
        connections.push(forward(
            &source.station_changed,
            &self.state,
            |s| &s.station_changed,
            &self.signals,
            |state, station| state.station.replace(station.clone()).as_ref() != Some(station),
        ));
        connections.push(forward(
            &source.scan_status_changed,
            &self.state,
            |s| &s.scan_status_changed,
            &self.signals,
            |state, running| std::mem::replace(&mut state.scan_running, *running) != *running,
        ));
    }

    fn clear_service_object(&self, _ctx: &FeatureContext) {
        *self.state.lock() = TunerState::default();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Feature
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct AmFmTuner(Feature<TunerBinding>);

impl Deref for AmFmTuner {
    type Target = Feature<TunerBinding>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl AmFmTuner {
    pub fn new(registry: ServiceRegistry) -> Self {
        Self(Feature::new(
            AMFM_TUNER_INTERFACE,
            registry,
            TunerBinding::default(),
        ))
    }

    pub fn tuner_signals(&self) -> &TunerSignals {
        &self.binding().signals
    }

    pub fn band(&self) -> Option<BandInfo> {
        self.binding().state.lock().band
    }

    pub fn frequency(&self) -> Option<u32> {
        self.binding().state.lock().frequency
    }

    pub fn station(&self) -> Option<Station> {
        self.binding().state.lock().station.clone()
    }

    pub fn is_scan_running(&self) -> bool {
        self.binding().state.lock().scan_running
    }

    fn tuner(&self) -> Option<Arc<dyn AmFmTunerBackend>> {
        let backend = self.backend::<dyn AmFmTunerBackend>();
        if backend.is_none() {
            tracing::warn!("Tuner is not bound to a backend");
        }
        backend
    }

    pub fn set_frequency(&self, frequency: u32) {
        if let Some(tuner) = self.tuner() {
            tuner.set_frequency(frequency);
        }
    }

    pub fn set_band(&self, band: Band) {
        if let Some(tuner) = self.tuner() {
            tuner.set_band(band);
        }
    }

    pub fn step_up(&self) {
        if let Some(tuner) = self.tuner() {
            tuner.step_up();
        }
    }

    pub fn step_down(&self) {
        if let Some(tuner) = self.tuner() {
            tuner.step_down();
        }
    }

    /// Fails immediately when unbound
    pub fn seek_up(&self) -> PendingReply<Station> {
        match self.tuner() {
            Some(tuner) => tuner.seek_up(),
            None => PendingReply::create_failed_reply(),
        }
    }

    pub fn seek_down(&self) -> PendingReply<Station> {
        match self.tuner() {
            Some(tuner) => tuner.seek_down(),
            None => PendingReply::create_failed_reply(),
        }
    }

    pub fn start_scan(&self) {
        if let Some(tuner) = self.tuner() {
            tuner.start_scan();
        }
    }

    pub fn stop_scan(&self) {
        if let Some(tuner) = self.tuner() {
            tuner.stop_scan();
        }
    }
}
