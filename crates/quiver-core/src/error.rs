use thiserror::Error;

/// Canonical error type for index construction and search.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Invalid build or search parameters.
    #[error("invalid configuration: {message}")]
    Config {
        /// Human-readable explanation of the rejected parameter.
        message: String,
    },

    /// I/O error while creating, mapping or writing index files.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An internal invariant was violated; the build must be abandoned.
    #[error("invariant violation: {message}")]
    InvariantViolation {
        /// Human-readable description of the broken invariant.
        message: String,
    },

    /// The requested entity does not exist (e.g. query before build).
    #[error("not found: {message}")]
    NotFound {
        /// Human-readable description of what was missing.
        message: String,
    },
}

impl CoreError {
    /// Creates a `Config` variant.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates an `InvariantViolation` variant.
    #[must_use]
    pub fn invariant(message: impl Into<String>) -> Self {
        Self::InvariantViolation {
            message: message.into(),
        }
    }

    /// Creates a `NotFound` variant.
    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }
}

/// Convenient result alias for index operations.
pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CoreError::config("beam width must be positive");
        assert_eq!(
            err.to_string(),
            "invalid configuration: beam width must be positive"
        );

        let err = CoreError::not_found("index was not built");
        assert!(err.to_string().contains("index was not built"));
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: CoreError = io.into();
        assert!(matches!(err, CoreError::Io(_)));
    }
}
