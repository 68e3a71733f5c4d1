//! Climate Control
//!
//! A zoned feature. Seat heating, seat cooling and the target temperature are
//! kept per zone; the fan and the on/off switches are generic values stored
//! under the empty zone key.
//!
//! The feature only forwards writes. The backend validates the zone and the
//! value range and answers with change notifications, which the feature caches.

mod simulation;

pub use simulation::{ClimateSimulation, ClimateSimulationPlugin};

use std::ops::Deref;
use std::sync::Arc;

use ivi_core::{
    BackendHandle, ConnectionSet, Feature, FeatureBinding, FeatureContext, GENERIC_ZONE,
    Property, PropertyScope, ServiceRegistry, Signal, ZoneTracker, ZonedFeatureBackend,
    ZonedValues,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Interface name of the climate feature
pub const CLIMATE_CONTROL_INTERFACE: &str = "ivi.ClimateControl";

// ─────────────────────────────────────────────────────────────────────────────
// Properties
// ─────────────────────────────────────────────────────────────────────────────

/// Integer valued climate properties
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ClimateLevel {
    TargetTemperature,
    SeatHeater,
    SeatCooler,
    FanSpeedLevel,
    SteeringWheelHeater,
}

impl ClimateLevel {
    pub const ALL: [ClimateLevel; 5] = [
        ClimateLevel::TargetTemperature,
        ClimateLevel::SeatHeater,
        ClimateLevel::SeatCooler,
        ClimateLevel::FanSpeedLevel,
        ClimateLevel::SteeringWheelHeater,
    ];

    pub fn scope(&self) -> PropertyScope {
        match self {
            ClimateLevel::TargetTemperature | ClimateLevel::SeatHeater | ClimateLevel::SeatCooler => {
                PropertyScope::Zoned
            }
            ClimateLevel::FanSpeedLevel | ClimateLevel::SteeringWheelHeater => PropertyScope::Generic,
        }
    }
}

/// On/off climate properties, all generic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ClimateSwitch {
    AirConditioning,
    Heater,
    AirRecirculation,
    Defrost,
}

impl ClimateSwitch {
    pub const ALL: [ClimateSwitch; 4] = [
        ClimateSwitch::AirConditioning,
        ClimateSwitch::Heater,
        ClimateSwitch::AirRecirculation,
        ClimateSwitch::Defrost,
    ];
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LevelChange {
    pub level: ClimateLevel,
    pub zone: String,
    pub property: Property<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwitchChange {
    pub switch: ClimateSwitch,
    pub property: Property<bool>,
}

/// Change notifications of a climate backend, mirrored by [`ClimateControl`]
#[derive(Debug, Default)]
pub struct ClimateSignals {
    pub level_changed: Signal<LevelChange>,
    pub switch_changed: Signal<SwitchChange>,
}

/// Backend contract of [`CLIMATE_CONTROL_INTERFACE`]
pub trait ClimateControlBackend: ZonedFeatureBackend {
    fn set_level(&self, level: ClimateLevel, value: i32, zone: &str);

    fn set_enabled(&self, switch: ClimateSwitch, enabled: bool, zone: &str);

    fn climate_signals(&self) -> &ClimateSignals;
}

// ─────────────────────────────────────────────────────────────────────────────
// Binding
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct ClimateCache {
    levels: Vec<(ClimateLevel, ZonedValues<Property<i32>>)>,
    switches: Vec<(ClimateSwitch, Property<bool>)>,
}

impl ClimateCache {
    fn store_level(&mut self, change: &LevelChange) -> bool {
        let index = match self.levels.iter().position(|(l, _)| *l == change.level) {
            Some(index) => index,
            None => {
                self.levels
                    .push((change.level, ZonedValues::empty(change.level.scope())));
                self.levels.len() - 1
            }
        };
        self.levels[index].1.store(&change.zone, change.property.clone())
    }

    fn store_switch(&mut self, change: &SwitchChange) -> bool {
        match self.switches.iter_mut().find(|(s, _)| *s == change.switch) {
            Some((_, current)) if *current == change.property => false,
            Some((_, current)) => {
                *current = change.property.clone();
                true
            }
            None => {
                self.switches.push((change.switch, change.property.clone()));
                true
            }
        }
    }

    fn level(&self, level: ClimateLevel, zone: &str) -> Option<Property<i32>> {
        self.levels
            .iter()
            .find(|(l, _)| *l == level)
            .and_then(|(_, values)| values.read(zone).cloned())
    }

    fn switch(&self, switch: ClimateSwitch) -> Option<Property<bool>> {
        self.switches
            .iter()
            .find(|(s, _)| *s == switch)
            .map(|(_, property)| property.clone())
    }
}

/// Climate specific part of the feature: zone list and property cache
#[derive(Default)]
pub struct ClimateBinding {
    zones: ZoneTracker,
    cache: Arc<Mutex<ClimateCache>>,
    signals: Arc<ClimateSignals>,
}

impl FeatureBinding for ClimateBinding {
    fn connect_to_service_object(
        &self,
        ctx: &FeatureContext,
        handle: &Arc<BackendHandle>,
        connections: &mut ConnectionSet,
    ) {
        let Some(backend) = handle
            .interface_instance(ctx.interface_name())
            .and_then(|c| c.get::<dyn ClimateControlBackend>())
        else {
            tracing::warn!(backend = %handle.name(), "Backend offers no climate control capability");
            return;
        };

        self.zones.attach(&*backend, connections);

        let cache = Arc::clone(&self.cache);
        let signals = Arc::clone(&self.signals);
        connections.push(backend.climate_signals().level_changed.connect(move |change| {
            let changed = cache.lock().store_level(change);
            if changed {
                signals.level_changed.emit(change);
            }
        }));

        let cache = Arc::clone(&self.cache);
        let signals = Arc::clone(&self.signals);
        connections.push(backend.climate_signals().switch_changed.connect(move |change| {
            let changed = cache.lock().store_switch(change);
            if changed {
                signals.switch_changed.emit(change);
            }
        }));
    }

    fn clear_service_object(&self, _ctx: &FeatureContext) {
        *self.cache.lock() = ClimateCache::default();
        self.zones.clear();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Feature
// ─────────────────────────────────────────────────────────────────────────────

/// Zoned climate control feature
#[derive(Clone, Debug)]
pub struct ClimateControl(Feature<ClimateBinding>);

impl Deref for ClimateControl {
    type Target = Feature<ClimateBinding>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl ClimateControl {
    pub fn new(registry: ServiceRegistry) -> Self {
        Self(Feature::new(
            CLIMATE_CONTROL_INTERFACE,
            registry,
            ClimateBinding::default(),
        ))
    }

    pub fn climate_signals(&self) -> &ClimateSignals {
        &self.binding().signals
    }

    pub fn available_zones(&self) -> Vec<String> {
        self.binding().zones.zones()
    }

    pub fn available_zones_changed(&self) -> &Signal<Vec<String>> {
        self.binding().zones.available_zones_changed()
    }

    /// Cached value and attribute of `level` in `zone`
    pub fn level(&self, level: ClimateLevel, zone: &str) -> Option<Property<i32>> {
        self.binding().cache.lock().level(level, zone)
    }

    pub fn switch(&self, switch: ClimateSwitch) -> Option<Property<bool>> {
        self.binding().cache.lock().switch(switch)
    }

    /// Ask the backend to change `level` in `zone`.
    pub fn set_level(&self, level: ClimateLevel, zone: &str, value: i32) {
        match self.backend::<dyn ClimateControlBackend>() {
            Some(backend) => backend.set_level(level, value, zone),
            None => tracing::warn!(?level, zone, "Climate control is not bound to a backend"),
        }
    }

    pub fn set_enabled(&self, switch: ClimateSwitch, enabled: bool) {
        match self.backend::<dyn ClimateControlBackend>() {
            Some(backend) => backend.set_enabled(switch, enabled, GENERIC_ZONE),
            None => tracing::warn!(?switch, "Climate control is not bound to a backend"),
        }
    }

    pub fn target_temperature(&self, zone: &str) -> Option<i32> {
        self.level(ClimateLevel::TargetTemperature, zone).map(|p| p.value)
    }

    pub fn set_target_temperature(&self, zone: &str, value: i32) {
        self.set_level(ClimateLevel::TargetTemperature, zone, value);
    }

    pub fn seat_heater(&self, zone: &str) -> Option<i32> {
        self.level(ClimateLevel::SeatHeater, zone).map(|p| p.value)
    }

    pub fn set_seat_heater(&self, zone: &str, value: i32) {
        self.set_level(ClimateLevel::SeatHeater, zone, value);
    }

    pub fn fan_speed_level(&self) -> Option<i32> {
        self.level(ClimateLevel::FanSpeedLevel, GENERIC_ZONE).map(|p| p.value)
    }

    pub fn set_fan_speed_level(&self, value: i32) {
        self.set_level(ClimateLevel::FanSpeedLevel, GENERIC_ZONE, value);
    }

    pub fn is_air_conditioning_enabled(&self) -> bool {
        self.switch(ClimateSwitch::AirConditioning)
            .is_some_and(|p| p.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ivi_core::{
        BackendDescriptor, DiscoveryMode, DiscoveryResult, FeatureError, PropertyAttribute,
        ServiceBackend,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn registry() -> ServiceRegistry {
        let registry = ServiceRegistry::new();
        registry
            .register_backend(
                BackendDescriptor::new("climate_simulator")
                    .with_interface(CLIMATE_CONTROL_INTERFACE)
                    .simulation(true),
                || Ok(Arc::new(ClimateSimulationPlugin::new()) as Arc<dyn ServiceBackend>),
            )
            .unwrap();
        registry
    }

    fn bound() -> ClimateControl {
        let climate = ClimateControl::new(registry());
        assert_eq!(climate.start_auto_discovery(), DiscoveryResult::SimulationBackendLoaded);
        climate
    }

    fn errors(climate: &ClimateControl) -> Arc<Mutex<Vec<FeatureError>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        climate
            .signals()
            .error_changed
            .connect(move |(code, _)| s.lock().push(*code));
        seen
    }

    #[test]
    fn test_initial_state_after_binding() {
        let climate = bound();
        assert!(climate.is_valid());
        assert!(climate.is_initialized());

        let mut zones = climate.available_zones();
        zones.sort();
        assert_eq!(zones, vec!["FrontLeft", "FrontRight", "Rear"]);

        assert_eq!(climate.target_temperature("FrontLeft"), Some(20));
        assert_eq!(climate.target_temperature("Rear"), Some(10));
        assert_eq!(climate.seat_heater("FrontLeft"), Some(10));
        assert_eq!(climate.fan_speed_level(), Some(2));
        assert!(climate.is_air_conditioning_enabled());
        assert_eq!(
            climate.level(ClimateLevel::SeatHeater, "Rear").unwrap().attribute,
            PropertyAttribute::Unavailable
        );
    }

    #[test]
    fn test_zoned_write() {
        let climate = bound();
        let changes = Arc::new(Mutex::new(Vec::new()));
        let c = changes.clone();
        climate
            .climate_signals()
            .level_changed
            .connect(move |change| c.lock().push(change.clone()));

        climate.set_target_temperature("FrontRight", 23);
        assert_eq!(climate.target_temperature("FrontRight"), Some(23));
        assert_eq!(climate.target_temperature("FrontLeft"), Some(20));

        let changes = changes.lock();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].zone, "FrontRight");
        assert_eq!(changes[0].property.value, 23);
    }

    #[test]
    fn test_invalid_zone_reports_once_without_mutation() {
        let climate = bound();
        let seen = errors(&climate);
        let changes = Arc::new(AtomicUsize::new(0));
        let c = changes.clone();
        climate
            .climate_signals()
            .level_changed
            .connect(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            });

        climate.set_target_temperature("Trunk", 22);

        assert_eq!(*seen.lock(), vec![FeatureError::InvalidZone]);
        assert_eq!(climate.error(), FeatureError::InvalidZone);
        assert_eq!(changes.load(Ordering::SeqCst), 0);
        assert_eq!(climate.target_temperature("FrontLeft"), Some(20));
        assert_eq!(climate.target_temperature("Trunk"), None);
    }

    #[test]
    fn test_generic_value_rejects_zone() {
        let climate = bound();
        let seen = errors(&climate);

        climate.set_level(ClimateLevel::FanSpeedLevel, "FrontLeft", 5);
        assert_eq!(*seen.lock(), vec![FeatureError::InvalidZone]);
        assert_eq!(climate.fan_speed_level(), Some(2));

        climate.set_fan_speed_level(5);
        assert_eq!(climate.fan_speed_level(), Some(5));
    }

    #[test]
    fn test_out_of_range_keeps_value() {
        let climate = bound();
        let seen = errors(&climate);

        climate.set_fan_speed_level(11);
        climate.set_seat_heater("Rear", 3);

        assert_eq!(climate.fan_speed_level(), Some(2));
        assert_eq!(climate.seat_heater("Rear"), Some(0));
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn test_switches() {
        let climate = bound();
        climate.set_enabled(ClimateSwitch::AirConditioning, false);
        assert!(!climate.is_air_conditioning_enabled());
        assert_eq!(climate.switch(ClimateSwitch::Defrost).map(|p| p.value), Some(false));
    }

    #[test]
    fn test_unbinding_clears_cache() {
        let climate = bound();
        let zone_changes = Arc::new(AtomicUsize::new(0));
        let z = zone_changes.clone();
        climate.available_zones_changed().connect(move |_| {
            z.fetch_add(1, Ordering::SeqCst);
        });

        assert!(climate.set_service_object(None));
        assert!(!climate.is_valid());
        assert!(climate.available_zones().is_empty());
        assert_eq!(climate.target_temperature("FrontLeft"), None);
        assert_eq!(zone_changes.load(Ordering::SeqCst), 1);

        climate.set_target_temperature("FrontLeft", 21);
        assert_eq!(climate.target_temperature("FrontLeft"), None);
    }

    #[test]
    fn test_production_only_finds_nothing() {
        let climate = ClimateControl::new(registry());
        climate.set_discovery_mode(DiscoveryMode::ProductionOnly);
        assert_eq!(climate.start_auto_discovery(), DiscoveryResult::ErrorWhileLoading);
        assert!(climate.available_zones().is_empty());
    }
}
