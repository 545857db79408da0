//! Error types for consent-relay.
//!
//! All errors are strongly typed using thiserror. Component errors
//! (storage, bus, publisher, cursor) convert into the umbrella
//! [`RelayError`], whose variants follow the failure taxonomy the pipeline
//! and the HTTP layer act on.

use thiserror::Error;

use crate::cursor::FeedPosition;

/// Validation errors for untrusted input.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// A required field is absent or empty.
    #[error("Required field '{field}' is missing")]
    MissingField {
        field: String,
    },

    /// A field exceeds its maximum length.
    #[error("Field '{field}' exceeds maximum length of {max_length}")]
    FieldTooLong {
        field: String,
        max_length: usize,
    },

    /// A field holds characters outside its alphabet.
    #[error("Field '{field}' contains invalid characters: {value:?}")]
    InvalidCharacters {
        field: String,
        value: String,
    },

    /// A configuration value is out of range.
    #[error("Invalid configuration value for '{field}': {reason}")]
    InvalidSetting {
        field: String,
        reason: String,
    },
}

/// Top-level error type for consent-relay.
///
/// Pipeline code handles these locally (retry, skip, backoff); the HTTP
/// layer maps them to status codes via [`RelayError::status_code`].
#[derive(Debug, Error)]
pub enum RelayError {
    /// Store or bus unreachable. Retried with backoff.
    #[error("Transient infrastructure failure in {component}: {message}")]
    TransientInfra {
        component: &'static str,
        message: String,
    },

    /// The addressed record does not exist.
    #[error("{kind} not found: {id}")]
    RecordNotFound {
        kind: &'static str,
        id: String,
    },

    /// The caller may not perform the request.
    #[error("Unauthorized: {reason}")]
    Unauthorized {
        reason: String,
    },

    /// Request input failed validation.
    #[error("Malformed input: {0}")]
    MalformedInput(#[from] ValidationError),

    /// A single feed item could not be decoded. Skipped, never propagated
    /// out of the pipeline.
    #[error("Corrupt change at feed position {position}: {reason}")]
    DecodeCorruption {
        position: FeedPosition,
        reason: String,
    },

    /// Configuration is unusable.
    #[error("Configuration error: {message}")]
    Config {
        message: String,
    },

    /// Bug or unexpected failure.
    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl RelayError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Creates a configuration error.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a transient infrastructure error.
    #[must_use]
    pub fn transient(component: &'static str, message: impl Into<String>) -> Self {
        Self::TransientInfra {
            component,
            message: message.into(),
        }
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientInfra { .. })
    }

    /// Returns true if this is a configuration error.
    #[must_use]
    pub const fn is_config(&self) -> bool {
        matches!(self, Self::Config { .. })
    }

    /// HTTP status code for this error.
    #[must_use]
    pub const fn status_code(&self) -> u16 {
        match self {
            Self::MalformedInput(_) => 400,
            Self::Unauthorized { .. } => 401,
            Self::RecordNotFound { .. } => 404,
            Self::TransientInfra { .. }
            | Self::DecodeCorruption { .. }
            | Self::Config { .. }
            | Self::Internal { .. } => 500,
        }
    }
}

/// Result type alias for consent-relay operations.
pub type RelayResult<T> = Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_missing_field() {
        let err = ValidationError::MissingField {
            field: "id".to_string(),
        };
        assert!(err.to_string().contains("'id'"));
    }

    #[test]
    fn test_status_codes() {
        let missing: RelayError = ValidationError::MissingField {
            field: "id".to_string(),
        }
        .into();
        assert_eq!(missing.status_code(), 400);

        let unauthorized = RelayError::Unauthorized {
            reason: "identifier mismatch".to_string(),
        };
        assert_eq!(unauthorized.status_code(), 401);

        let not_found = RelayError::RecordNotFound {
            kind: "Subject",
            id: "u1".to_string(),
        };
        assert_eq!(not_found.status_code(), 404);
        assert!(not_found.to_string().contains("Subject not found: u1"));

        assert_eq!(RelayError::transient("bus", "refused").status_code(), 500);
        assert_eq!(RelayError::internal("boom").status_code(), 500);
    }

    #[test]
    fn test_retryable() {
        assert!(RelayError::transient("store", "connection reset").is_retryable());
        assert!(!RelayError::internal("unexpected state").is_retryable());
        assert!(!RelayError::DecodeCorruption {
            position: FeedPosition::new(7),
            reason: "bad json".to_string(),
        }
        .is_retryable());
    }

    #[test]
    fn test_config_error() {
        let err = RelayError::config("queue cap must be positive");
        assert!(err.is_config());
        assert!(err.to_string().contains("queue cap"));
    }
}
