//! Error types for the clipscript core library.
//!
//! Uses `thiserror` for public API error types covering configuration and the
//! transcript collector.

use std::path::PathBuf;

/// Top-level error type for the clipscript core library.
#[derive(Debug, thiserror::Error)]
pub enum ClipError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Collector error: {0}")]
    Collector(#[from] CollectorError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors from loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("Config file not found: {path}")]
    NotFound { path: PathBuf },

    #[error("Invalid value for '{field}': {reason}")]
    Invalid { field: String, reason: String },
}

impl ConfigError {
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Errors from the research API transcript collector.
#[derive(Debug, thiserror::Error)]
pub enum CollectorError {
    #[error("Authentication failed (HTTP {status}): {body}")]
    Auth { status: u16, body: String },

    #[error("Video query for '{handle}' failed (HTTP {status}): {body}")]
    Query {
        handle: String,
        status: u16,
        body: String,
    },

    #[error("Malformed response from {endpoint}: {message}")]
    MalformedResponse { endpoint: String, message: String },

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Failed to write {path}: {source}")]
    Output {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Convenience type alias for core results.
pub type Result<T> = std::result::Result<T, ClipError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::invalid("collector.max_count", "must be between 1 and 100");
        assert_eq!(
            err.to_string(),
            "Invalid value for 'collector.max_count': must be between 1 and 100"
        );
    }

    #[test]
    fn test_collector_error_wraps_into_clip_error() {
        let err: ClipError = CollectorError::Auth {
            status: 401,
            body: "invalid client".into(),
        }
        .into();
        assert!(err.to_string().contains("HTTP 401"));
        assert!(err.to_string().starts_with("Collector error"));
    }
}
