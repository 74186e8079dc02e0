//! Error handling for the ECG pipeline
//!
//! Every error the pipeline core can raise is locally recoverable: a stage
//! reports it, drops the offending unit of work and keeps running.

use std::fmt;

/// Result type alias for ECG pipeline operations
pub type EcgResult<T> = Result<T, EcgError>;

/// Error type shared by all pipeline crates
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum EcgError {
    /// Invalid configuration value
    InvalidConfig {
        /// Description of the configuration error
        reason: String,
    },

    /// Packet payload does not have the fixed wire size
    MalformedPacket {
        /// Expected payload length in bytes
        expected: usize,
        /// Payload length actually received
        actual: usize,
    },

    /// Window does not have the length the cascade was designed for
    WindowLength {
        /// Required number of samples
        expected: usize,
        /// Number of samples provided
        actual: usize,
    },

    /// Filter coefficients could not be designed
    FilterDesign {
        /// Filter stage name
        filter: &'static str,
        /// Description of the design failure
        reason: String,
    },

    /// A designed filter could not be applied to a window
    FilterApply {
        /// Filter stage name
        filter: &'static str,
        /// Description of the failure
        reason: String,
    },

    /// NaN or infinity found in a stage output
    NonFiniteOutput {
        /// Stage that produced the value
        stage: &'static str,
        /// Index of the first offending sample
        index: usize,
    },

    /// Serialization/deserialization error
    Serialization {
        /// Serializer error description
        reason: String,
    },

    /// A pipeline channel was closed by its peer
    ChannelClosed {
        /// Channel name
        channel: &'static str,
    },

    /// A pipeline task panicked or could not be joined
    StageFailed {
        /// Stage name
        stage: &'static str,
        /// Failure description
        reason: String,
    },
}

impl fmt::Display for EcgError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EcgError::InvalidConfig { reason } => {
                write!(f, "Invalid configuration: {}", reason)
            }
            EcgError::MalformedPacket { expected, actual } => {
                write!(f, "Malformed packet: expected {} payload bytes, got {}",
                       expected, actual)
            }
            EcgError::WindowLength { expected, actual } => {
                write!(f, "Window length mismatch: expected {} samples, got {}",
                       expected, actual)
            }
            EcgError::FilterDesign { filter, reason } => {
                write!(f, "Filter design failed for {}: {}", filter, reason)
            }
            EcgError::FilterApply { filter, reason } => {
                write!(f, "Filter {} could not be applied: {}", filter, reason)
            }
            EcgError::NonFiniteOutput { stage, index } => {
                write!(f, "Non-finite value produced by {} at sample {}", stage, index)
            }
            EcgError::Serialization { reason } => {
                write!(f, "Serialization error: {}", reason)
            }
            EcgError::ChannelClosed { channel } => {
                write!(f, "Channel closed: {}", channel)
            }
            EcgError::StageFailed { stage, reason } => {
                write!(f, "Stage {} failed: {}", stage, reason)
            }
        }
    }
}

impl std::error::Error for EcgError {}

/// Convenience macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::error::EcgError::InvalidConfig {
            reason: format!($($arg)*),
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = EcgError::MalformedPacket {
            expected: 1536,
            actual: 1200,
        };
        let display = format!("{}", error);
        assert!(display.contains("Malformed packet"));
        assert!(display.contains("1536"));
        assert!(display.contains("1200"));
    }

    #[test]
    fn test_config_error_macro() {
        let error = config_error!("queue capacity must be positive, got {}", 0);
        assert_eq!(
            error,
            EcgError::InvalidConfig {
                reason: "queue capacity must be positive, got 0".to_string()
            }
        );
    }
}
