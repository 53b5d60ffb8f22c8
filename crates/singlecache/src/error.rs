//! Error types for the coalescing group.
//!
//! A coalesced operation's own error is never wrapped: it reaches every
//! caller verbatim inside [`CallResult`](crate::CallResult). These types
//! cover the failures the group itself can hit.

use thiserror::Error;

/// Group error types
#[derive(Error, Debug)]
pub enum GroupError {
    /// The OS refused to start the worker thread for a channel call.
    ///
    /// The call was unregistered before this error was returned; nobody can
    /// have joined it.
    #[error("Group {group}: failed to spawn worker thread: {source}")]
    Spawn {
        group: String,
        #[source]
        source: std::io::Error,
    },
}

/// Result type alias for group operations
pub type GroupResult<T> = std::result::Result<T, GroupError>;

/// Configuration error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable held a value that could not be parsed.
    #[error("Invalid {key}: {value:?} ({reason})")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: &'static str,
    },
}

impl ConfigError {
    /// Create an invalid value error
    pub fn invalid(key: &'static str, value: impl Into<String>, reason: &'static str) -> Self {
        Self::InvalidValue {
            key,
            value: value.into(),
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn spawn_error_display_and_source() {
        let err = GroupError::Spawn {
            group: "users".into(),
            source: std::io::Error::other("no threads left"),
        };
        assert_eq!(
            err.to_string(),
            "Group users: failed to spawn worker thread: no threads left"
        );
        assert!(err.source().is_some());
    }

    #[test]
    fn config_error_display() {
        let err = ConfigError::invalid("SINGLECACHE_METRICS", "maybe", "expected a boolean");
        assert_eq!(
            err.to_string(),
            "Invalid SINGLECACHE_METRICS: \"maybe\" (expected a boolean)"
        );
    }
}
