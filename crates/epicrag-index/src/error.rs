//! Indexing and question-answering error types.

/// Errors from the embedding, vector store and chat layers.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    /// The model API answered with a non-retryable error status.
    #[error("{service} API error (HTTP {status}): {body}")]
    Api {
        /// Which API failed ("embeddings" or "chat").
        service: &'static str,
        /// HTTP status.
        status: u16,
        /// Response body.
        body: String,
    },

    /// The model API stayed unreachable or overloaded through every retry.
    #[error("{service} API unavailable after {attempts} attempt(s): {message}")]
    Unavailable {
        /// Which API failed.
        service: &'static str,
        /// Number of attempts made.
        attempts: u32,
        /// Description of the last failure.
        message: String,
    },

    /// The model API answered 2xx with an unexpected body.
    #[error("Invalid {service} response: {message}")]
    InvalidResponse {
        /// Which API answered.
        service: &'static str,
        /// What was wrong.
        message: String,
    },

    /// An embedding does not have the collection's dimension.
    #[error("Embedding dimension mismatch: collection has {expected}, got {actual}")]
    DimensionMismatch {
        /// Dimension of vectors already stored.
        expected: usize,
        /// Dimension of the offending vector.
        actual: usize,
    },

    /// The vector store could not be read or written.
    #[error("Vector store error: {message}")]
    Store {
        /// Description of the failure.
        message: String,
    },

    /// The caller passed something unusable (e.g. an empty question).
    #[error("Invalid input: {message}")]
    InvalidInput {
        /// Description of the problem.
        message: String,
    },

    /// A client could not be set up.
    #[error("Configuration error: {message}")]
    Configuration {
        /// Description of the configuration problem.
        message: String,
    },
}

impl IndexError {
    /// Creates a new `Api` error.
    #[must_use]
    pub fn api(service: &'static str, status: u16, body: impl Into<String>) -> Self {
        Self::Api {
            service,
            status,
            body: body.into(),
        }
    }

    /// Creates a new `Unavailable` error.
    #[must_use]
    pub fn unavailable(service: &'static str, attempts: u32, message: impl Into<String>) -> Self {
        Self::Unavailable {
            service,
            attempts,
            message: message.into(),
        }
    }

    /// Creates a new `InvalidResponse` error.
    #[must_use]
    pub fn invalid_response(service: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidResponse {
            service,
            message: message.into(),
        }
    }

    /// Creates a new `Store` error.
    #[must_use]
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store {
            message: message.into(),
        }
    }

    /// Creates a new `InvalidInput` error.
    #[must_use]
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Creates a new `Configuration` error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Returns `true` if retrying later might succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            IndexError::api("embeddings", 401, "invalid api key").to_string(),
            "embeddings API error (HTTP 401): invalid api key"
        );
        assert_eq!(
            IndexError::DimensionMismatch {
                expected: 1536,
                actual: 3
            }
            .to_string(),
            "Embedding dimension mismatch: collection has 1536, got 3"
        );
    }

    #[test]
    fn test_retryable() {
        assert!(IndexError::unavailable("chat", 3, "HTTP 503").is_retryable());
        assert!(!IndexError::api("chat", 400, "").is_retryable());
        assert!(!IndexError::store("disk full").is_retryable());
    }
}
