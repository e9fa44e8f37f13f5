//! Error types for the remote task runner.

/// The result type used throughout strata-runner.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in task-runner operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A coordination-store operation failed.
    #[error("store error: {message}")]
    Store {
        /// Description of the store failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A serialization or deserialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// A configuration value failed validation.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the configuration failure.
        message: String,
    },

    /// An HTTP request to a worker failed.
    #[error("http error: {message}")]
    Http {
        /// Description of the HTTP failure.
        message: String,
    },

    /// A task was not found in the live work-item table.
    #[error("task not found: {task_id}")]
    TaskNotFound {
        /// The task ID that was looked up.
        task_id: String,
    },

    /// An internal error occurred that should not happen in normal operation.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl Error {
    /// Creates a new store error.
    #[must_use]
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new store error with a source cause.
    #[must_use]
    pub fn store_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Store {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a new serialization error.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Creates a new configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates a new HTTP error.
    #[must_use]
    pub fn http(message: impl Into<String>) -> Self {
        Self::Http {
            message: message.into(),
        }
    }

    /// Creates a new internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as StdError;

    #[test]
    fn store_error_display() {
        let err = Error::store("connection refused");
        assert!(err.to_string().contains("store error"));
        assert!(err.to_string().contains("connection refused"));
    }

    #[test]
    fn store_error_with_source() {
        let source = std::io::Error::new(std::io::ErrorKind::TimedOut, "timed out");
        let err = Error::store_with_source("write failed", source);
        assert!(StdError::source(&err).is_some());
    }

    #[test]
    fn task_not_found_display() {
        let err = Error::TaskNotFound {
            task_id: "t1".into(),
        };
        assert!(err.to_string().contains("task not found: t1"));
    }
}
