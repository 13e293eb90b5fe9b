//! State store error types

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during state store operations
#[derive(Debug, Error)]
pub enum StateError {
    #[error("Key not found: {key}")]
    KeyNotFound { key: String },

    #[error("State file {path} is corrupt: {reason}")]
    Corruption { path: PathBuf, reason: String },

    #[error("Timed out after {timeout:?} waiting for lock on {path}")]
    LockTimeout { path: PathBuf, timeout: Duration },

    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StateError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StateError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn corruption(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        StateError::Corruption {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Check if this is a missing key
    pub fn is_not_found(&self) -> bool {
        matches!(self, StateError::KeyNotFound { .. })
    }

    /// Check if retrying the same call could succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            StateError::LockTimeout { .. } => true,
            StateError::KeyNotFound { .. } => false,
            StateError::Corruption { .. } => false,
            StateError::Io { .. } => false,
        }
    }
}

/// Result alias for state store operations
pub type Result<T> = std::result::Result<T, StateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_timeout_message() {
        let err = StateError::LockTimeout {
            path: PathBuf::from("/tmp/state.json"),
            timeout: Duration::from_millis(250),
        };

        let msg = err.to_string();
        assert!(msg.contains("/tmp/state.json"));
        assert!(msg.contains("250ms"));
    }

    #[test]
    fn test_is_retryable() {
        assert!(
            StateError::LockTimeout {
                path: PathBuf::from("state.json"),
                timeout: Duration::from_secs(1),
            }
            .is_retryable()
        );

        assert!(!StateError::corruption("state.json", "expected value at line 1 column 1").is_retryable());
        assert!(
            !StateError::KeyNotFound {
                key: "demo".to_string()
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_io_keeps_source() {
        let err = StateError::io("state.json", std::io::Error::other("disk full"));
        let source = std::error::Error::source(&err).expect("io error should carry its source");
        assert_eq!(source.to_string(), "disk full");
    }

    #[test]
    fn test_is_not_found() {
        let err = StateError::KeyNotFound { key: "x".to_string() };
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "Key not found: x");
    }
}
