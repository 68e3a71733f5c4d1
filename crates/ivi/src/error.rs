//! Application Errors

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid plugin manifest {path}: {reason}")]
    Manifest { path: String, reason: String },

    #[error("Unknown backend factory: {0}")]
    UnknownFactory(String),

    #[error(transparent)]
    Core(#[from] ivi_core::Error),

    #[error(transparent)]
    Remote(#[from] ivi_remote::RemoteError),
}

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Error::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
