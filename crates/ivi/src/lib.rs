//! IVI
//!
//! Vehicle features built on `ivi_core`: climate control and an AM/FM tuner,
//! their simulation backends, a remote tuner backend and plugin discovery.

pub mod app;
pub mod climate;
pub mod config;
pub mod error;
pub mod plugin;
pub mod tuner;

pub use app::{App, register_builtin_simulators};
pub use config::AppConfig;
pub use error::{Error, Result};
