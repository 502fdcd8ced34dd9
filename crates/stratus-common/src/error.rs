//! Error types shared across Stratus crates
//!
//! Variants carry the cluster or context they relate to so that a failed
//! workflow description can be read without digging through logs.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for shared Stratus operations
#[derive(Debug, Error)]
pub enum Error {
    /// A snapshot or manifest is inconsistent
    #[error("validation error for {cluster}: {message}")]
    Validation {
        /// Cluster the invalid data belongs to
        cluster: String,
        /// What is invalid
        message: String,
    },

    /// Encoding or decoding failed
    #[error("serialization error: {message}")]
    Serialization {
        /// What failed
        message: String,
        /// What was being (de)serialized, if known
        kind: Option<String>,
    },

    /// Filesystem access failed
    #[error("io error at {path}: {source}")]
    Io {
        /// Path being accessed
        path: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    /// Create a validation error without cluster context
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            cluster: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
        }
    }

    /// Create a serialization error naming what was being processed
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Wrap an io error with the path it happened on
    pub fn io(path: impl AsRef<std::path::Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().display().to_string(),
            source,
        }
    }

    /// Whether retrying the failed operation may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::serialization_for_kind("json", e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Self::serialization_for_kind("yaml", e.to_string())
    }
}
