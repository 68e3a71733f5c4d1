//! Simulated tuner backend
//!
//! Two bands, two FM stations. Seeking can be delayed to exercise deferred
//! replies; scanning seeks upward on a fixed interval until stopped.

use std::sync::Arc;
use std::time::Duration;

use ivi_core::{
    BackendSignals, Capability, FeatureBackend, PAGING_MODEL_INTERFACE, PagingModelBackend,
    PendingReply, ServiceBackend,
};
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use super::stations::StationListSimulation;
use super::{AMFM_TUNER_INTERFACE, AmFmTunerBackend, Band, BandInfo, Station, TunerSignals};

const SCAN_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
struct BandData {
    frequency: u32,
    minimum_frequency: u32,
    maximum_frequency: u32,
    step_size: u32,
    stations: Vec<Station>,
}

impl BandData {
    fn station_index(&self, frequency: u32) -> Option<usize> {
        self.stations.iter().position(|s| s.frequency == frequency)
    }

    fn station_at(&self, frequency: u32) -> Station {
        self.station_index(frequency)
            .map(|i| self.stations[i].clone())
            .unwrap_or_default()
    }
}

struct TunerState {
    band: Band,
    fm: BandData,
    am: BandData,
}

impl TunerState {
    fn new() -> Self {
        let fm_station = |id: &str, name: &str, frequency| Station {
            id: id.to_string(),
            name: name.to_string(),
            frequency,
            band: Band::FmBand,
        };

        Self {
            band: Band::FmBand,
            fm: BandData {
                frequency: 87_500_000,
                minimum_frequency: 87_500_000,
                maximum_frequency: 108_000_000,
                step_size: 100_000,
                stations: vec![
                    fm_station("0", "Radio Qt", 87_500_000),
                    fm_station("1", "Qt Rocks non-stop", 102_500_000),
                ],
            },
            am: BandData {
                frequency: 535_000,
                minimum_frequency: 535_000,
                maximum_frequency: 1_700_000,
                step_size: 10_000,
                stations: Vec::new(),
            },
        }
    }

    fn current(&self) -> &BandData {
        match self.band {
            Band::AmBand => &self.am,
            Band::FmBand => &self.fm,
        }
    }

    fn current_mut(&mut self) -> &mut BandData {
        match self.band {
            Band::AmBand => &mut self.am,
            Band::FmBand => &mut self.fm,
        }
    }

    fn info(&self) -> BandInfo {
        let data = self.current();
        BandInfo {
            band: self.band,
            minimum_frequency: data.minimum_frequency,
            maximum_frequency: data.maximum_frequency,
            step_size: data.step_size,
        }
    }

    /// Next or previous station relative to the current frequency, wrapping around
    fn neighbour(&self, forward: bool) -> Option<Station> {
        let data = self.current();
        let count = data.stations.len();
        if count == 0 {
            return None;
        }
        let index = match data.station_index(data.frequency) {
            Some(i) if forward => (i + 1) % count,
            Some(i) => (i + count - 1) % count,
            None if forward => 0,
            None => count - 1,
        };
        Some(data.stations[index].clone())
    }
}

struct Inner {
    state: Mutex<TunerState>,
    scan: Mutex<Option<JoinHandle<()>>>,
    seek_delay: Duration,
    signals: BackendSignals,
    tuner_signals: TunerSignals,
}

impl Inner {
    fn set_frequency(&self, frequency: u32) {
        let station = {
            let mut state = self.state.lock();
            let data = state.current_mut();
            if data.frequency == frequency {
                return;
            }
            if frequency < data.minimum_frequency || frequency > data.maximum_frequency {
                tracing::warn!(frequency, "SIMULATION Frequency out of range");
                return;
            }
            data.frequency = frequency;
            data.station_at(frequency)
        };

        tracing::info!(frequency, "SIMULATION Frequency changed");
        self.tuner_signals.frequency_changed.emit(&frequency);
        self.tuner_signals.station_changed.emit(&station);
    }

    fn tune_to(&self, station: &Station) {
        self.state.lock().current_mut().frequency = station.frequency;
        tracing::info!(station = %station.name, frequency = station.frequency, "SIMULATION Station changed");
        self.tuner_signals.frequency_changed.emit(&station.frequency);
        self.tuner_signals.station_changed.emit(station);
    }

    fn seek(self: &Arc<Self>, forward: bool) -> PendingReply<Station> {
        let next = self.state.lock().neighbour(forward);
        let Some(station) = next else {
            tracing::warn!("SIMULATION No stations available to seek to");
            return PendingReply::create_failed_reply();
        };

        let runtime = tokio::runtime::Handle::try_current().ok();
        match runtime {
            Some(runtime) if !self.seek_delay.is_zero() => {
                let reply = PendingReply::new();
                let pending = reply.clone();
                let inner = Arc::clone(self);
                runtime.spawn(async move {
                    tokio::time::sleep(inner.seek_delay).await;
                    inner.tune_to(&station);
                    pending.set_success(station);
                });
                reply
            }
            _ => {
                self.tune_to(&station);
                PendingReply::ready(station)
            }
        }
    }

    fn stop_scan(&self) -> bool {
        match self.scan.lock().take() {
            Some(task) => {
                task.abort();
                true
            }
            None => false,
        }
    }
}

/// In-process AM/FM tuner
#[derive(Clone)]
pub struct TunerSimulation {
    inner: Arc<Inner>,
}

impl Default for TunerSimulation {
    fn default() -> Self {
        Self::new()
    }
}

impl TunerSimulation {
    pub fn new() -> Self {
        Self::with_seek_delay(Duration::ZERO)
    }

    /// Resolve seeks after `delay` when running inside a tokio runtime
    pub fn with_seek_delay(delay: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(TunerState::new()),
                scan: Mutex::new(None),
                seek_delay: delay,
                signals: BackendSignals::new(),
                tuner_signals: TunerSignals::default(),
            }),
        }
    }

    /// Known stations of both bands, FM first
    pub fn stations(&self) -> Vec<Station> {
        let state = self.inner.state.lock();
        state.fm.stations.iter().chain(&state.am.stations).cloned().collect()
    }
}

impl FeatureBackend for TunerSimulation {
    fn initialize(&self) {
        let (info, frequency, station) = {
            let state = self.inner.state.lock();
            let data = state.current();
            (state.info(), data.frequency, data.station_at(data.frequency))
        };
        let scanning = self.inner.scan.lock().is_some();

        let signals = &self.inner.tuner_signals;
        signals.band_changed.emit(&info);
        signals.frequency_changed.emit(&frequency);
        signals.station_changed.emit(&station);
        signals.scan_status_changed.emit(&scanning);
        self.inner.signals.initialization_done.notify();
    }

    fn signals(&self) -> &BackendSignals {
        &self.inner.signals
    }
}

impl AmFmTunerBackend for TunerSimulation {
    fn set_frequency(&self, frequency: u32) {
        self.inner.set_frequency(frequency);
    }

    fn set_band(&self, band: Band) {
        let (info, frequency, station) = {
            let mut state = self.inner.state.lock();
            if state.band == band {
                return;
            }
            state.band = band;
            let data = state.current();
            (state.info(), data.frequency, data.station_at(data.frequency))
        };

        tracing::info!(?band, "SIMULATION Band changed");
        let signals = &self.inner.tuner_signals;
        signals.band_changed.emit(&info);
        signals.frequency_changed.emit(&frequency);
        signals.station_changed.emit(&station);
    }

    fn step_up(&self) {
        let next = {
            let state = self.inner.state.lock();
            let data = state.current();
            match data.frequency.saturating_add(data.step_size) {
                f if f > data.maximum_frequency => data.minimum_frequency,
                f => f,
            }
        };
        self.inner.set_frequency(next);
    }

    fn step_down(&self) {
        let next = {
            let state = self.inner.state.lock();
            let data = state.current();
            match data.frequency.checked_sub(data.step_size) {
                Some(f) if f >= data.minimum_frequency => f,
                _ => data.maximum_frequency,
            }
        };
        self.inner.set_frequency(next);
    }

    fn seek_up(&self) -> PendingReply<Station> {
        self.inner.seek(true)
    }

    fn seek_down(&self) -> PendingReply<Station> {
        self.inner.seek(false)
    }

    fn start_scan(&self) {
        if self.inner.scan.lock().is_some() {
            tracing::warn!("SIMULATION a scan is already in progress");
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("SIMULATION scanning needs a running tokio runtime");
            return;
        };

        tracing::info!("SIMULATION Scan started");
        self.inner.tuner_signals.scan_status_changed.emit(&true);
        self.inner.seek(true);

        let inner = Arc::downgrade(&self.inner);
        let task = runtime.spawn(async move {
            let mut interval = tokio::time::interval(SCAN_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                inner.seek(true);
            }
        });
        *self.inner.scan.lock() = Some(task);
    }

    fn stop_scan(&self) {
        if !self.inner.stop_scan() {
            tracing::warn!("SIMULATION no scan is currently in progress");
            return;
        }
        tracing::info!("SIMULATION Scan stopped");
        self.inner.tuner_signals.scan_status_changed.emit(&false);
    }

    fn tuner_signals(&self) -> &TunerSignals {
        &self.inner.tuner_signals
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.stop_scan();
    }
}

/// Plugin entry exposing a [`TunerSimulation`] and its station list
pub struct TunerSimulationPlugin {
    backend: Arc<TunerSimulation>,
    stations: Arc<StationListSimulation>,
}

impl Default for TunerSimulationPlugin {
    fn default() -> Self {
        Self::with_backend(TunerSimulation::new())
    }
}

impl TunerSimulationPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_seek_delay(delay: Duration) -> Self {
        Self::with_backend(TunerSimulation::with_seek_delay(delay))
    }

    fn with_backend(backend: TunerSimulation) -> Self {
        let stations = Arc::new(StationListSimulation::new(&backend.stations()));
        Self {
            backend: Arc::new(backend),
            stations,
        }
    }

    pub fn backend(&self) -> &Arc<TunerSimulation> {
        &self.backend
    }

    pub fn stations(&self) -> &Arc<StationListSimulation> {
        &self.stations
    }
}

impl ServiceBackend for TunerSimulationPlugin {
    fn interfaces(&self) -> Vec<String> {
        vec![
            AMFM_TUNER_INTERFACE.to_string(),
            PAGING_MODEL_INTERFACE.to_string(),
        ]
    }

    fn interface_instance(&self, interface: &str) -> Option<Capability> {
        match interface {
            AMFM_TUNER_INTERFACE => Some(Capability::new::<dyn AmFmTunerBackend>(
                self.backend.clone(),
                self.backend.clone(),
            )),
            PAGING_MODEL_INTERFACE => Some(Capability::new::<dyn PagingModelBackend>(
                self.stations.clone(),
                self.stations.clone(),
            )),
            _ => None,
        }
    }
}
