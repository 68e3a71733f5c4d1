//! Simulated climate backend

use std::sync::Arc;

use ivi_core::{
    BackendSignals, Capability, FeatureBackend, FeatureError, GENERIC_ZONE, Property,
    PropertyAttribute, ServiceBackend, ZoneSignals, ZonedFeatureBackend, ZonedValues,
};
use parking_lot::Mutex;

use super::{
    CLIMATE_CONTROL_INTERFACE, ClimateControlBackend, ClimateLevel, ClimateSignals, ClimateSwitch,
    LevelChange, SwitchChange,
};

struct SimulationState {
    levels: Vec<(ClimateLevel, ZonedValues<Property<i32>>)>,
    switches: Vec<(ClimateSwitch, Property<bool>)>,
}

impl SimulationState {
    fn new() -> Self {
        let seat = || PropertyAttribute::range(0, 10);
        let temperature = || PropertyAttribute::range(0, 40);

        let levels = vec![
            (
                ClimateLevel::TargetTemperature,
                ZonedValues::zoned([
                    ("FrontLeft", Property::new(20, temperature())),
                    ("FrontRight", Property::new(20, temperature())),
                    ("Rear", Property::new(10, temperature())),
                ]),
            ),
            (
                ClimateLevel::SeatHeater,
                ZonedValues::zoned([
                    ("FrontLeft", Property::new(10, seat())),
                    ("FrontRight", Property::new(0, seat())),
                    ("Rear", Property::new(0, PropertyAttribute::Unavailable)),
                ]),
            ),
            (
                ClimateLevel::SeatCooler,
                ZonedValues::zoned([
                    ("FrontLeft", Property::new(10, seat())),
                    ("FrontRight", Property::new(5, seat())),
                    ("Rear", Property::new(0, PropertyAttribute::Unavailable)),
                ]),
            ),
            (
                ClimateLevel::FanSpeedLevel,
                ZonedValues::generic(Property::new(2, PropertyAttribute::range(0, 10))),
            ),
            (
                ClimateLevel::SteeringWheelHeater,
                ZonedValues::generic(Property::new(0, PropertyAttribute::Unavailable)),
            ),
        ];

        let switches = vec![
            (ClimateSwitch::AirConditioning, Property::unconstrained(true)),
            (ClimateSwitch::Heater, Property::unconstrained(true)),
            (ClimateSwitch::AirRecirculation, Property::unconstrained(false)),
            (ClimateSwitch::Defrost, Property::unconstrained(false)),
        ];

        Self { levels, switches }
    }

    fn values(&mut self, level: ClimateLevel) -> Option<&mut ZonedValues<Property<i32>>> {
        self.levels
            .iter_mut()
            .find(|(l, _)| *l == level)
            .map(|(_, values)| values)
    }
}

/// In-process climate backend with three zones
pub struct ClimateSimulation {
    state: Mutex<SimulationState>,
    signals: BackendSignals,
    zone_signals: ZoneSignals,
    climate_signals: ClimateSignals,
}

impl Default for ClimateSimulation {
    fn default() -> Self {
        Self::new()
    }
}

impl ClimateSimulation {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimulationState::new()),
            signals: BackendSignals::new(),
            zone_signals: ZoneSignals::default(),
            climate_signals: ClimateSignals::default(),
        }
    }

    /// Expose this backend for [`CLIMATE_CONTROL_INTERFACE`]
    pub fn capability(self: &Arc<Self>) -> Capability {
        Capability::new::<dyn ClimateControlBackend>(self.clone(), self.clone())
    }
}

impl FeatureBackend for ClimateSimulation {
    fn initialize(&self) {
        let (levels, switches) = {
            let state = self.state.lock();
            let levels: Vec<LevelChange> = state
                .levels
                .iter()
                .flat_map(|(level, values)| {
                    values.iter().map(|(zone, property)| LevelChange {
                        level: *level,
                        zone: zone.to_string(),
                        property: property.clone(),
                    })
                })
                .collect();
            let switches: Vec<SwitchChange> = state
                .switches
                .iter()
                .map(|(switch, property)| SwitchChange {
                    switch: *switch,
                    property: property.clone(),
                })
                .collect();
            (levels, switches)
        };

        self.zone_signals
            .available_zones_changed
            .emit(&self.available_zones());
        for change in &levels {
            self.climate_signals.level_changed.emit(change);
        }
        for change in &switches {
            self.climate_signals.switch_changed.emit(change);
        }
        self.signals.initialization_done.notify();
    }

    fn signals(&self) -> &BackendSignals {
        &self.signals
    }
}

impl ZonedFeatureBackend for ClimateSimulation {
    fn available_zones(&self) -> Vec<String> {
        let state = self.state.lock();
        state
            .levels
            .iter()
            .find(|(l, _)| *l == ClimateLevel::TargetTemperature)
            .map(|(_, values)| values.zones())
            .unwrap_or_default()
    }

    fn zone_signals(&self) -> &ZoneSignals {
        &self.zone_signals
    }
}

impl ClimateControlBackend for ClimateSimulation {
    fn set_level(&self, level: ClimateLevel, value: i32, zone: &str) {
        let outcome = {
            let mut state = self.state.lock();
            let Some(values) = state.values(level) else {
                return;
            };
            match values.check(zone) {
                Err(code) => Err(code),
                Ok(()) => {
                    let Some(current) = values.read(zone).cloned() else {
                        return;
                    };
                    if current.value == value {
                        return;
                    }
                    let mut updated = current.clone();
                    if updated.try_set(value) {
                        values.store(zone, updated.clone());
                        Ok((updated, true))
                    } else {
                        Ok((current, false))
                    }
                }
            }
        };

        match outcome {
            Err(code) => {
                tracing::warn!(?level, zone, "SIMULATION rejected write to an unknown zone");
                self.signals
                    .report_error(code, format!("zone '{}' is not available for {:?}", zone, level));
            }
            Ok((property, accepted)) => {
                if accepted {
                    tracing::info!(?level, zone, value, "SIMULATION value changed");
                } else {
                    tracing::warn!(?level, zone, value, "SIMULATION value out of range");
                }
                self.climate_signals.level_changed.emit(&LevelChange {
                    level,
                    zone: zone.to_string(),
                    property,
                });
            }
        }
    }

    fn set_enabled(&self, switch: ClimateSwitch, enabled: bool, zone: &str) {
        if zone != GENERIC_ZONE {
            self.signals
                .report_error(FeatureError::InvalidZone, format!("{:?} is not zoned", switch));
            return;
        }

        let property = {
            let mut state = self.state.lock();
            let Some((_, property)) = state.switches.iter_mut().find(|(s, _)| *s == switch) else {
                return;
            };
            if property.value == enabled || !property.try_set(enabled) {
                return;
            }
            property.clone()
        };

        tracing::info!(?switch, enabled, "SIMULATION switch changed");
        self.climate_signals
            .switch_changed
            .emit(&SwitchChange { switch, property });
    }

    fn climate_signals(&self) -> &ClimateSignals {
        &self.climate_signals
    }
}

/// Plugin entry exposing a [`ClimateSimulation`]
#[derive(Default)]
pub struct ClimateSimulationPlugin {
    backend: Arc<ClimateSimulation>,
}

impl ClimateSimulationPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn backend(&self) -> &Arc<ClimateSimulation> {
        &self.backend
    }
}

impl ServiceBackend for ClimateSimulationPlugin {
    fn interfaces(&self) -> Vec<String> {
        vec![CLIMATE_CONTROL_INTERFACE.to_string()]
    }

    fn interface_instance(&self, interface: &str) -> Option<Capability> {
        (interface == CLIMATE_CONTROL_INTERFACE).then(|| self.backend.capability())
    }
}
