//! Authentication error types.
//!
//! This module defines the errors that can occur while loading the signing
//! key, building client assertions and exchanging them for access tokens.

use std::fmt;

/// Errors that can occur while authenticating against the authorization server.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// The authorization server rejected the credentials or scope (4xx).
    ///
    /// Never retried automatically.
    #[error("Authorization rejected (HTTP {status}): {body}")]
    AuthRejected {
        /// HTTP status returned by the server.
        status: u16,
        /// Response body, for operator diagnostics.
        body: String,
    },

    /// The authorization server could not be reached or returned 5xx after
    /// all retry attempts were exhausted.
    #[error("Authorization server unavailable after {attempts} attempt(s): {message}")]
    AuthServerUnavailable {
        /// Number of attempts made before giving up.
        attempts: u32,
        /// Description of the last failure.
        message: String,
    },

    /// The token endpoint returned a response that could not be parsed.
    #[error("Failed to parse token response: {message}")]
    TokenParse {
        /// Description of the parse failure.
        message: String,
    },

    /// The private signing key could not be loaded.
    #[error("Failed to load signing key: {message}")]
    KeyLoad {
        /// Description of why the key could not be loaded.
        message: String,
    },

    /// The client assertion could not be signed.
    #[error("Failed to sign client assertion: {message}")]
    Signing {
        /// Description of the signing failure.
        message: String,
    },

    /// The credentials or client settings are invalid.
    #[error("Configuration error: {message}")]
    Configuration {
        /// Description of the configuration problem.
        message: String,
    },
}

impl AuthError {
    /// Creates a new `AuthRejected` error.
    #[must_use]
    pub fn rejected(status: u16, body: impl Into<String>) -> Self {
        Self::AuthRejected {
            status,
            body: body.into(),
        }
    }

    /// Creates a new `AuthServerUnavailable` error.
    #[must_use]
    pub fn server_unavailable(attempts: u32, message: impl Into<String>) -> Self {
        Self::AuthServerUnavailable {
            attempts,
            message: message.into(),
        }
    }

    /// Creates a new `TokenParse` error.
    #[must_use]
    pub fn token_parse(message: impl Into<String>) -> Self {
        Self::TokenParse {
            message: message.into(),
        }
    }

    /// Creates a new `KeyLoad` error.
    #[must_use]
    pub fn key_load(message: impl Into<String>) -> Self {
        Self::KeyLoad {
            message: message.into(),
        }
    }

    /// Creates a new `Signing` error.
    #[must_use]
    pub fn signing(message: impl Into<String>) -> Self {
        Self::Signing {
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

    /// Returns `true` if a later attempt could succeed without operator action.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::AuthServerUnavailable { .. })
    }

    /// Returns `true` if the process cannot continue without fixing its setup.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::KeyLoad { .. } | Self::Signing { .. } | Self::Configuration { .. }
        )
    }

    /// Returns the error category for logging purposes.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::AuthRejected { .. } => ErrorCategory::Rejected,
            Self::AuthServerUnavailable { .. } => ErrorCategory::Transient,
            Self::TokenParse { .. } => ErrorCategory::Protocol,
            Self::KeyLoad { .. } | Self::Signing { .. } => ErrorCategory::Key,
            Self::Configuration { .. } => ErrorCategory::Configuration,
        }
    }
}

/// Categories of authentication errors for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// The server refused the credentials or scope.
    Rejected,
    /// Network failure or server outage.
    Transient,
    /// The server spoke, but not in the expected format.
    Protocol,
    /// Signing key problems.
    Key,
    /// Invalid local configuration.
    Configuration,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rejected => write!(f, "rejected"),
            Self::Transient => write!(f, "transient"),
            Self::Protocol => write!(f, "protocol"),
            Self::Key => write!(f, "key"),
            Self::Configuration => write!(f, "configuration"),
        }
    }
}
