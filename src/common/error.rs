//! Driver-level error types
//!
//! # Design Principles (KISS)
//! - Each layer owns its error enum (source, metadata, decode, publish)
//! - `DriverError` is what lifecycle transitions and requests return
//! - Use thiserror for ergonomic error handling

use thiserror::Error;

use super::command::{LifecycleState, Transition};
use crate::config::ConfigError;
use crate::publisher::PublishError;
use crate::sensor::{MetadataError, SourceError};

/// Errors surfaced by lifecycle transitions and request handlers
#[derive(Error, Debug)]
pub enum DriverError {
    /// Transition not allowed from the current state
    #[error("Cannot {transition} from {state} state")]
    InvalidTransition {
        transition: Transition,
        state: LifecycleState,
    },

    /// Request requires the Active state
    #[error("Driver is not active (state: {0})")]
    NotActive(LifecycleState),

    /// No metadata cached
    #[error("Sensor metadata not available")]
    NotAvailable,

    /// Sensor could not be reached after all retries
    #[error("Failed to connect to sensor after {attempts} attempts: {source}")]
    Connect {
        attempts: u32,
        #[source]
        source: SourceError,
    },

    /// Metadata fetch failed
    #[error("Metadata error: {0}")]
    Metadata(#[from] MetadataError),

    /// Packet source failure
    #[error("Packet source error: {0}")]
    Source(#[from] SourceError),

    /// Output channel failure
    #[error("Publish error: {0}")]
    Publish(#[from] PublishError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl DriverError {
    /// Whether this error should move the driver into ErrorProcessing
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DriverError::Connect { .. }
                | DriverError::Metadata(_)
                | DriverError::Source(SourceError::Closed)
                | DriverError::Source(SourceError::Io(_))
        )
    }
}

/// Result type alias using DriverError
pub type DriverResult<T> = Result<T, DriverError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_transition_message() {
        let err = DriverError::InvalidTransition {
            transition: Transition::Activate,
            state: LifecycleState::Unconfigured,
        };
        assert_eq!(err.to_string(), "Cannot activate from Unconfigured state");
    }

    #[test]
    fn test_not_active_message() {
        let err = DriverError::NotActive(LifecycleState::Inactive);
        assert!(err.to_string().contains("Inactive"));
    }

    #[test]
    fn test_fatal_classification() {
        assert!(DriverError::Source(SourceError::Closed).is_fatal());
        assert!(DriverError::Metadata(MetadataError::Timeout).is_fatal());
        assert!(!DriverError::Source(SourceError::Timeout).is_fatal());
        assert!(!DriverError::NotAvailable.is_fatal());
    }

    #[test]
    fn test_source_error_from() {
        let err: DriverError = SourceError::Closed.into();
        assert!(err.to_string().contains("Packet source error"));
    }
}
