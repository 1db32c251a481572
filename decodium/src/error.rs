//! Error types for decodium

use thiserror::Error;

/// Result type alias using decodium's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for decoding operations.
///
/// Configuration, shape and resource errors are raised at setup or
/// allocation time. Per-step numeric degeneracies (fully masked rows, zero
/// accepted draft tokens) are never reported through this type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid decoding mode: {0}")]
    InvalidDecodingMode(String),

    #[error("Invalid sampling config: {0}")]
    InvalidConfig(String),

    #[error("{name} has {got} values, expected 1 or {batch_size}")]
    BroadcastLength {
        name: &'static str,
        got: usize,
        batch_size: usize,
    },

    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("Invalid shape: {0}")]
    InvalidShape(String),

    #[error("Dtype mismatch: expected {expected}, got {got}")]
    DtypeMismatch { expected: String, got: String },

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Batch slot {slot} out of range (max batch size {max_batch_size})")]
    SlotOutOfRange { slot: usize, max_batch_size: usize },

    #[error("Collective error: {0}")]
    Collective(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether the error belongs to the setup-time configuration class.
    #[must_use]
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidDecodingMode(_)
                | Self::InvalidConfig(_)
                | Self::BroadcastLength { .. }
                | Self::InvalidShape(_)
                | Self::ShapeMismatch { .. }
                | Self::DtypeMismatch { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_length_message() {
        let err = Error::BroadcastLength {
            name: "temperature",
            got: 3,
            batch_size: 4,
        };
        assert_eq!(err.to_string(), "temperature has 3 values, expected 1 or 4");
        assert!(err.is_config_error());
    }

    #[test]
    fn resource_errors_are_not_config_errors() {
        assert!(!Error::ResourceExhausted("workspace".into()).is_config_error());
        assert!(!Error::Collective("rank mismatch".into()).is_config_error());
    }
}
