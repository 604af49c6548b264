//! Unified error handling for Superfan
//!
//! This crate provides a single error type used across all Superfan components.
//! Transport failures are the only retryable class; see [`SuperfanError::is_transient`].

use std::io;
use std::path::PathBuf;

/// Result type alias using SuperfanError
pub type Result<T> = std::result::Result<T, SuperfanError>;

/// Unified error type for all Superfan operations
#[derive(thiserror::Error, Debug)]
pub enum SuperfanError {
    // ============================================================================
    // I/O and File System Errors
    // ============================================================================
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to read file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: io::Error,
    },

    #[error("Failed to write file {path}: {source}")]
    FileWrite {
        path: PathBuf,
        source: io::Error,
    },

    // ============================================================================
    // Transport Errors (retryable)
    // ============================================================================
    #[error("Management interface transport failed: {0}")]
    Transport(String),

    #[error("Management controller busy: {0}")]
    TransportBusy(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    // ============================================================================
    // Validation Errors (never retried)
    // ============================================================================
    #[error("Command rejected: {0}")]
    Rejected(String),

    #[error("Malformed response to {command}: {reason}")]
    MalformedResponse {
        command: String,
        reason: String,
    },

    #[error("Command {command} failed: {reason}")]
    CommandFailed {
        command: String,
        reason: String,
    },

    #[error("Invalid percentage: {value} (must be 0-100)")]
    InvalidPercentage {
        value: f64,
    },

    #[error("Curve validation failed: {0}")]
    InvalidCurve(String),

    // ============================================================================
    // Control Errors
    // ============================================================================
    #[error("Speed verification failed for {zone} zone: requested {requested}%, observed {observed}%")]
    VerificationFailed {
        zone: String,
        requested: u8,
        observed: u8,
    },

    #[error("Fan mode verification failed: requested 0x{requested:02x}, observed 0x{observed:02x}")]
    ModeVerificationFailed {
        requested: u8,
        observed: u8,
    },

    #[error("Invalid sensor data: {0}")]
    SensorInvalid(String),

    #[error("Board generation could not be identified")]
    BoardUnknown,

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Learning aborted (last stable speed {last_stable}%): {source}")]
    LearningAborted {
        last_stable: u8,
        source: Box<SuperfanError>,
    },

    // ============================================================================
    // Configuration Errors
    // ============================================================================
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("Invalid configuration value for {field}: {reason}")]
    InvalidConfig {
        field: String,
        reason: String,
    },

    // ============================================================================
    // Generic Errors
    // ============================================================================
    #[error("{0}")]
    Generic(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),
}

impl SuperfanError {
    /// Create a generic error from a string
    pub fn generic(msg: impl Into<String>) -> Self {
        Self::Generic(msg.into())
    }

    /// Create a config error from a string
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an invalid config error for a named field
    pub fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create a rejected-command error
    pub fn rejected(msg: impl Into<String>) -> Self {
        Self::Rejected(msg.into())
    }

    /// Create a malformed response error
    pub fn malformed(command: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedResponse {
            command: command.into(),
            reason: reason.into(),
        }
    }

    /// Whether a retry of the same operation may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::TransportBusy(_) | Self::Timeout(_)
        )
    }
}

// Allow converting from String to SuperfanError
impl From<String> for SuperfanError {
    fn from(s: String) -> Self {
        Self::Generic(s)
    }
}

// Allow converting from &str to SuperfanError
impl From<&str> for SuperfanError {
    fn from(s: &str) -> Self {
        Self::Generic(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(SuperfanError::TransportBusy("busy".into()).is_transient());
        assert!(SuperfanError::Timeout("ipmitool".into()).is_transient());
        assert!(SuperfanError::Transport("open session".into()).is_transient());
        assert!(!SuperfanError::malformed("mode get", "empty").is_transient());
        assert!(!SuperfanError::rejected("blacklisted").is_transient());
        assert!(!SuperfanError::BoardUnknown.is_transient());
    }

    #[test]
    fn test_verification_message() {
        let err = SuperfanError::VerificationFailed {
            zone: "cpu".into(),
            requested: 40,
            observed: 25,
        };
        assert_eq!(
            err.to_string(),
            "Speed verification failed for cpu zone: requested 40%, observed 25%"
        );
    }

    #[test]
    fn test_learning_aborted_wraps_source() {
        let err = SuperfanError::LearningAborted {
            last_stable: 22,
            source: Box::new(SuperfanError::Timeout("raw".into())),
        };
        let msg = err.to_string();
        assert!(msg.contains("22%"));
        assert!(msg.contains("timed out"));
    }
}
