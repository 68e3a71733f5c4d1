//! Station list
//!
//! The tuner backends also offer their known stations as a paged list. Bind a
//! [`ivi_core::PagingModel`] to the tuner's service object to browse it.

use ivi_core::{
    BackendSignals, CapabilitiesChanged, CountChanged, DataFetched, FeatureBackend,
    ModelCapabilities, PagingModelBackend, PagingSignals,
};
use serde_json::Value;
use uuid::Uuid;

use super::Station;

/// Lookup name of the station list on a remote host
pub const STATION_LIST_SOURCE: &str = "ivi.AmFmTuner.StationList";

/// Fixed station list answering fetches immediately
pub struct StationListSimulation {
    stations: Vec<Value>,
    signals: BackendSignals,
    paging: PagingSignals,
}

impl StationListSimulation {
    pub fn new(stations: &[Station]) -> Self {
        let stations = stations
            .iter()
            .filter_map(|station| match serde_json::to_value(station) {
                Ok(value) => Some(value),
                Err(e) => {
                    tracing::warn!(station = %station.name, error = %e, "SIMULATION Skipping station");
                    None
                }
            })
            .collect();

        Self {
            stations,
            signals: BackendSignals::new(),
            paging: PagingSignals::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.stations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stations.is_empty()
    }
}

impl FeatureBackend for StationListSimulation {
    fn initialize(&self) {
        self.signals.initialization_done.notify();
    }

    fn signals(&self) -> &BackendSignals {
        &self.signals
    }
}

impl PagingModelBackend for StationListSimulation {
    fn register_instance(&self, identifier: Uuid) {
        tracing::debug!(%identifier, "SIMULATION Station list instance registered");
        self.paging.supported_capabilities_changed.emit(&CapabilitiesChanged {
            identifier: Some(identifier),
            capabilities: ModelCapabilities::SUPPORTS_GET_SIZE,
        });
    }

    fn unregister_instance(&self, identifier: Uuid) {
        tracing::debug!(%identifier, "SIMULATION Station list instance unregistered");
    }

    fn fetch_data(&self, identifier: Uuid, start: usize, count: usize) {
        let total = self.stations.len();
        let end = start.saturating_add(count).min(total);
        tracing::info!(start, count, "SIMULATION Fetching stations");

        self.paging.count_changed.emit(&CountChanged {
            identifier: Some(identifier),
            count: total,
        });
        self.paging.data_fetched.emit(&DataFetched {
            identifier: Some(identifier),
            items: self.stations.get(start..end).unwrap_or_default().to_vec(),
            start,
            more_available: end < total,
        });
    }

    fn paging_signals(&self) -> &PagingSignals {
        &self.paging
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuner::{AmFmTuner, Band, TunerSimulationPlugin};
    use ivi_core::{
        BackendDescriptor, DiscoveryResult, LoadingType, PagingModel, ServiceBackend, ServiceRegistry,
    };
    use std::sync::Arc;

    fn tuner() -> AmFmTuner {
        let registry = ServiceRegistry::new();
        registry
            .register_backend(
                BackendDescriptor::new("tuner_simulator").with_interface(crate::tuner::AMFM_TUNER_INTERFACE),
                || Ok(Arc::new(TunerSimulationPlugin::new()) as Arc<dyn ServiceBackend>),
            )
            .unwrap();
        let tuner = AmFmTuner::new(registry);
        assert_eq!(tuner.start_auto_discovery(), DiscoveryResult::ProductionBackendLoaded);
        tuner
    }

    #[test]
    fn test_station_list_through_tuner_service_object() {
        let tuner = tuner();
        let stations = PagingModel::with_service_object(tuner.registry().clone(), tuner.service_object().unwrap());

        assert!(stations.is_valid());
        assert_eq!(stations.row_count(), 2);
        assert!(!stations.can_fetch_more());
        let first: Station = stations.get(0).unwrap();
        assert_eq!(first.name, "Radio Qt");
        assert_eq!(first.band, Band::FmBand);
        assert_eq!(stations.get::<Station>(1).unwrap().frequency, 102_500_000);
    }

    #[test]
    fn test_station_list_supports_data_changed() {
        let tuner = tuner();
        let stations = PagingModel::with_service_object(tuner.registry().clone(), tuner.service_object().unwrap());
        stations.set_chunk_size(1);
        assert!(stations.set_loading_type(LoadingType::DataChanged));

        assert_eq!(stations.row_count(), 2);
        assert_eq!(stations.items()[1], None);
        assert_eq!(stations.at(1), None);
        assert_eq!(stations.get::<Station>(1).unwrap().name, "Qt Rocks non-stop");
    }

    #[test]
    fn test_fetch_past_the_end() {
        let list = StationListSimulation::new(&[Station::default()]);
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let s = seen.clone();
        list.paging_signals().data_fetched.connect(move |fetched| s.lock().push(fetched.clone()));

        list.fetch_data(Uuid::new_v4(), 5, 10);
        assert_eq!(list.len(), 1);
        assert!(seen.lock()[0].items.is_empty());
        assert!(!seen.lock()[0].more_available);
    }
}
