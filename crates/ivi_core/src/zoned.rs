//! Zoned Features
//!
//! Properties of a zoned feature are addressed by a zone key such as
//! `"FrontLeft"`. The empty key is reserved for generic values that are not
//! bound to a zone.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::backend::FeatureBackend;
use crate::error::FeatureError;
use crate::signal::{ConnectionSet, Signal};

/// Zone key of generic values
pub const GENERIC_ZONE: &str = "";

/// Signals a zoned backend adds to [`crate::backend::BackendSignals`]
#[derive(Debug, Default)]
pub struct ZoneSignals {
    pub available_zones_changed: Signal<Vec<String>>,
}

/// Backend contract of a zoned interface
pub trait ZonedFeatureBackend: FeatureBackend {
    fn available_zones(&self) -> Vec<String>;

    fn zone_signals(&self) -> &ZoneSignals;
}

/// Whether a property exists once per zone or once for the whole feature
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyScope {
    Generic,
    Zoned,
}

/// Check `zone` against `zones` for a property of the given scope
pub fn check_zone(zones: &[String], scope: PropertyScope, zone: &str) -> Result<(), FeatureError> {
    match scope {
        PropertyScope::Generic if zone == GENERIC_ZONE => Ok(()),
        PropertyScope::Zoned if zone != GENERIC_ZONE && zones.iter().any(|z| z == zone) => Ok(()),
        _ => Err(FeatureError::InvalidZone),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Zoned values
// ─────────────────────────────────────────────────────────────────────────────

/// Values of one property keyed by zone
#[derive(Debug, Clone, PartialEq)]
pub struct ZonedValues<T> {
    scope: PropertyScope,
    values: Vec<(String, T)>,
}

impl<T: Clone + PartialEq> ZonedValues<T> {
    pub fn empty(scope: PropertyScope) -> Self {
        Self {
            scope,
            values: Vec::new(),
        }
    }

    pub fn generic(value: T) -> Self {
        Self {
            scope: PropertyScope::Generic,
            values: vec![(GENERIC_ZONE.to_string(), value)],
        }
    }

    pub fn zoned<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = (S, T)>,
        S: Into<String>,
    {
        Self {
            scope: PropertyScope::Zoned,
            values: values.into_iter().map(|(z, v)| (z.into(), v)).collect(),
        }
    }

    pub fn scope(&self) -> PropertyScope {
        self.scope
    }

    pub fn zones(&self) -> Vec<String> {
        self.values
            .iter()
            .filter(|(zone, _)| zone != GENERIC_ZONE)
            .map(|(zone, _)| zone.clone())
            .collect()
    }

    pub fn read(&self, zone: &str) -> Option<&T> {
        self.values.iter().find(|(z, _)| z == zone).map(|(_, v)| v)
    }

    pub fn check(&self, zone: &str) -> Result<(), FeatureError> {
        match self.scope {
            PropertyScope::Generic => check_zone(&[], self.scope, zone),
            PropertyScope::Zoned => check_zone(&self.zones(), self.scope, zone),
        }
    }

    /// Update a known zone. Unknown zones are rejected without touching any
    /// value. Returns whether the value changed.
    pub fn write(&mut self, zone: &str, value: T) -> Result<bool, FeatureError> {
        self.check(zone)?;
        Ok(self.store(zone, value))
    }

    /// Record a value without validation, adding the zone if needed
    pub fn store(&mut self, zone: &str, value: T) -> bool {
        match self.values.iter_mut().find(|(z, _)| z == zone) {
            Some((_, current)) if *current == value => false,
            Some((_, current)) => {
                *current = value;
                true
            }
            None => {
                self.values.push((zone.to_string(), value));
                true
            }
        }
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &T)> {
        self.values.iter().map(|(z, v)| (z.as_str(), v))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Zone tracker
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct ZoneTrackerInner {
    zones: Mutex<Vec<String>>,
    available_zones_changed: Signal<Vec<String>>,
}

/// Feature-side copy of the bound backend's zone list
#[derive(Debug, Clone, Default)]
pub struct ZoneTracker {
    inner: Arc<ZoneTrackerInner>,
}

impl ZoneTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read the backend's zones and follow its zone-list changes
    pub fn attach<B>(&self, backend: &B, connections: &mut ConnectionSet)
    where
        B: ZonedFeatureBackend + ?Sized,
    {
        self.update(backend.available_zones());
        let tracker = self.clone();
        connections.push(
            backend
                .zone_signals()
                .available_zones_changed
                .connect(move |zones| tracker.update(zones.clone())),
        );
    }

    pub fn clear(&self) {
        self.update(Vec::new());
    }

    fn update(&self, zones: Vec<String>) {
        let changed = {
            let mut current = self.inner.zones.lock();
            if *current == zones {
                false
            } else {
                *current = zones.clone();
                true
            }
        };
        if changed {
            self.inner.available_zones_changed.emit(&zones);
        }
    }

    pub fn zones(&self) -> Vec<String> {
        self.inner.zones.lock().clone()
    }

    pub fn check(&self, scope: PropertyScope, zone: &str) -> Result<(), FeatureError> {
        check_zone(&self.inner.zones.lock(), scope, zone)
    }

    pub fn available_zones_changed(&self) -> &Signal<Vec<String>> {
        &self.inner.available_zones_changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendSignals;

    fn seats() -> ZonedValues<i32> {
        ZonedValues::zoned([("FrontLeft", 20), ("FrontRight", 22), ("Rear", 10)])
    }

    #[test]
    fn test_write_known_zone() {
        let mut values = seats();
        assert_eq!(values.write("Rear", 15), Ok(true));
        assert_eq!(values.write("Rear", 15), Ok(false));
        assert_eq!(values.read("Rear"), Some(&15));
    }

    #[test]
    fn test_unknown_zone_leaves_values_untouched() {
        let mut values = seats();
        let before = values.clone();
        assert_eq!(values.write("Trunk", 30), Err(FeatureError::InvalidZone));
        assert_eq!(values.write(GENERIC_ZONE, 30), Err(FeatureError::InvalidZone));
        assert_eq!(values, before);
    }

    #[test]
    fn test_generic_property() {
        let mut fan = ZonedValues::generic(2);
        assert_eq!(fan.write("", 5), Ok(true));
        assert_eq!(fan.write("FrontLeft", 7), Err(FeatureError::InvalidZone));
        assert_eq!(fan.read(""), Some(&5));
        assert!(fan.zones().is_empty());
    }

    #[derive(Default)]
    struct Zones {
        signals: BackendSignals,
        zone_signals: ZoneSignals,
    }

    impl FeatureBackend for Zones {
        fn initialize(&self) {}

        fn signals(&self) -> &BackendSignals {
            &self.signals
        }
    }

    impl ZonedFeatureBackend for Zones {
        fn available_zones(&self) -> Vec<String> {
            vec!["Left".to_string(), "Right".to_string()]
        }

        fn zone_signals(&self) -> &ZoneSignals {
            &self.zone_signals
        }
    }

    #[test]
    fn test_tracker_follows_backend() {
        let backend = Zones::default();
        let tracker = ZoneTracker::new();
        let changes = Arc::new(Mutex::new(Vec::new()));
        let c = changes.clone();
        tracker.available_zones_changed().connect(move |z| c.lock().push(z.clone()));

        let mut connections = ConnectionSet::new();
        tracker.attach(&backend, &mut connections);
        assert_eq!(tracker.zones(), vec!["Left", "Right"]);
        assert!(tracker.check(PropertyScope::Zoned, "Left").is_ok());
        assert_eq!(tracker.check(PropertyScope::Zoned, "Middle"), Err(FeatureError::InvalidZone));

        backend
            .zone_signals
            .available_zones_changed
            .emit(&vec!["Middle".to_string()]);
        assert!(tracker.check(PropertyScope::Zoned, "Middle").is_ok());

        connections.disconnect_all();
        tracker.clear();
        assert!(tracker.zones().is_empty());
        assert_eq!(changes.lock().len(), 3);
    }
}
