//! IVI Core
//!
//! Transport independent service discovery and backend binding: a registry of
//! backends, features that bind to them, zoned properties, paged list models
//! and pending replies.

pub mod backend;
pub mod config;
pub mod error;
pub mod feature;
pub mod paging;
pub mod pending_reply;
pub mod property;
pub mod registry;
pub mod signal;
pub mod zoned;

pub use backend::{BackendHandle, BackendSignals, Capability, FeatureBackend, ServiceBackend};
pub use config::{ConfigurationManager, FeatureSettings, WatchId};
pub use error::{Error, FeatureError, Result};
pub use feature::{
    DiscoveryMode, DiscoveryResult, Feature, FeatureBinding, FeatureContext, FeatureSignals,
};
pub use paging::{
    CapabilitiesChanged, CountChanged, DataChanged, DataFetched, LoadingType, ModelCapabilities,
    PAGING_MODEL_INTERFACE, PagingModel, PagingModelBackend, PagingModelSignals, PagingSignals,
};
pub use pending_reply::{PendingReply, PendingReplyBase, PendingReplyWatcher};
pub use property::{Property, PropertyAttribute};
pub use registry::{
    BackendDescriptor, BackendFactory, BackendType, RegistryEvent, SearchFlags, ServiceCandidate,
    ServiceRegistry,
};
pub use signal::{Connection, ConnectionSet, Signal};
pub use zoned::{
    GENERIC_ZONE, PropertyScope, ZoneSignals, ZoneTracker, ZonedFeatureBackend, ZonedValues,
    check_zone,
};
