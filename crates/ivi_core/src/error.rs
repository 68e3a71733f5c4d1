//! Error Types
//!
//! Two layers of errors live here. [`FeatureError`] is the code a feature
//! reports through its error signal; it never travels as an `Err`. [`Error`]
//! covers failures of the framework plumbing itself (registration, config,
//! resolved-as-failed replies).

use serde::{Deserialize, Serialize};

/// Error code reported by features and backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum FeatureError {
    #[default]
    NoError,
    PermissionDenied,
    InvalidOperation,
    Timeout,
    InvalidZone,
    Unknown,
}

impl FeatureError {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeatureError::NoError => "NoError",
            FeatureError::PermissionDenied => "PermissionDenied",
            FeatureError::InvalidOperation => "InvalidOperation",
            FeatureError::Timeout => "Timeout",
            FeatureError::InvalidZone => "InvalidZone",
            FeatureError::Unknown => "Unknown",
        }
    }

    pub fn is_error(&self) -> bool {
        *self != FeatureError::NoError
    }

    /// Format the user-facing message for this code: `"<Code> <message>"`,
    /// or an empty string for `NoError`.
    pub fn describe(&self, message: &str) -> String {
        match self {
            FeatureError::NoError => String::new(),
            code if message.is_empty() => code.as_str().to_string(),
            code => format!("{} {}", code.as_str(), message),
        }
    }
}

impl std::fmt::Display for FeatureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Framework errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Malformed backend metadata: {0}")]
    MalformedMetadata(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Backend failed to load: {0}")]
    BackendLoad(String),

    #[error("Reply failed")]
    ReplyFailed,

    #[error("Reply dropped before it was resolved")]
    ReplyDropped,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe() {
        assert_eq!(FeatureError::NoError.describe("ignored"), "");
        assert_eq!(
            FeatureError::InvalidZone.describe("zone 'Trunk' is unknown"),
            "InvalidZone zone 'Trunk' is unknown"
        );
        assert_eq!(FeatureError::Timeout.describe(""), "Timeout");
    }

    #[test]
    fn test_default_is_no_error() {
        assert_eq!(FeatureError::default(), FeatureError::NoError);
        assert!(!FeatureError::default().is_error());
        assert!(FeatureError::Unknown.is_error());
    }
}
