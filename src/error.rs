//! Error types for the fetch layer.

use std::fmt;

/// Result type for fetch operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the fetch layer.
///
/// Errors are `Clone` because one settled operation hands the same outcome to
/// every caller that joined it.
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// Retryable failure of the underlying operation.
    ///
    /// Common causes:
    /// - Network failure or connection reset
    /// - 5xx-equivalent response from the data source
    /// - Database connection lost
    Transient(String),

    /// Failure that retrying cannot fix.
    ///
    /// Common causes:
    /// - 4xx-equivalent response
    /// - Malformed response body
    ///
    /// Surfaced immediately, never retried.
    Permanent(String),

    /// The operation was cancelled by its caller.
    ///
    /// Never published as a caller-visible error and never written to the
    /// cache. Does not count against the retry budget.
    Aborted,

    /// Every allowed attempt failed with a transient error.
    ExhaustedRetries {
        /// Number of attempts made
        attempts: u32,
        /// The last underlying error
        source: Box<Error>,
    },

    /// Invalid options or configuration.
    ConfigError(String),

    /// Serialization failed while estimating or exporting cached values.
    SerializationError(String),

    /// Generic error with custom message.
    Other(String),
}

impl Error {
    /// Whether the retry policy may try again after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transient(_) | Error::Other(_))
    }

    /// Whether this error was produced by cancellation.
    pub fn is_aborted(&self) -> bool {
        matches!(self, Error::Aborted)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Transient(msg) => write!(f, "Transient error: {}", msg),
            Error::Permanent(msg) => write!(f, "Permanent error: {}", msg),
            Error::Aborted => write!(f, "Operation aborted"),
            Error::ExhaustedRetries { attempts, source } => {
                write!(f, "Retries exhausted after {} attempts: {}", attempts, source)
            }
            Error::ConfigError(msg) => write!(f, "Config error: {}", msg),
            Error::SerializationError(msg) => write!(f, "Serialization error: {}", msg),
            Error::Other(msg) => write!(f, "Error: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::ExhaustedRetries { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}

// ============================================================================
// Conversions from other error types
// ============================================================================

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        if e.is_io() {
            Error::Transient(e.to_string())
        } else {
            Error::SerializationError(e.to_string())
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Transient(e.to_string())
    }
}

impl From<String> for Error {
    fn from(e: String) -> Self {
        Error::Other(e)
    }
}

impl From<&str> for Error {
    fn from(e: &str) -> Self {
        Error::Other(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Permanent("bad request".to_string());
        assert_eq!(err.to_string(), "Permanent error: bad request");
    }

    #[test]
    fn test_error_from_string() {
        let err: Error = "test error".into();
        assert!(matches!(err, Error::Other(_)));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(Error::Transient("timeout".into()).is_retryable());
        assert!(!Error::Permanent("404".into()).is_retryable());
        assert!(!Error::Aborted.is_retryable());
        assert!(Error::Aborted.is_aborted());
    }

    #[test]
    fn test_exhausted_retries_exposes_source() {
        use std::error::Error as _;

        let err = Error::ExhaustedRetries {
            attempts: 3,
            source: Box::new(Error::Transient("connection reset".into())),
        };
        assert_eq!(
            err.to_string(),
            "Retries exhausted after 3 attempts: Transient error: connection reset"
        );
        assert!(err.source().is_some());
    }
}
