//! FHIR fetch error types.

use epicrag_auth::AuthError;
use serde_json::Value;

/// Errors that can occur while fetching resources from the FHIR server.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// Token acquisition failed, or the server rejected a freshly refreshed
    /// token.
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// The server kept answering 429 until the retry budget was spent.
    #[error("Rate limit exceeded after {attempts} attempt(s)")]
    RateLimitExceeded {
        /// Number of attempts made.
        attempts: u32,
    },

    /// The server answered with a non-success status that is not retried,
    /// or kept answering 5xx until the retry budget was spent.
    #[error("FHIR request failed (HTTP {status}): {}", describe_body(.body))]
    FhirRequest {
        /// HTTP status.
        status: u16,
        /// Response body as received.
        body: String,
    },

    /// The server could not be reached.
    #[error("FHIR server unreachable after {attempts} attempt(s): {message}")]
    Transport {
        /// Number of attempts made.
        attempts: u32,
        /// Description of the last failure.
        message: String,
    },

    /// A success response whose body is not the expected FHIR JSON.
    #[error("Invalid FHIR response: {message}")]
    InvalidResponse {
        /// What was wrong with the body.
        message: String,
    },

    /// The fetcher could not be set up.
    #[error("Configuration error: {message}")]
    Configuration {
        /// Description of the configuration problem.
        message: String,
    },
}

impl FetchError {
    /// Creates a new `FhirRequest` error.
    #[must_use]
    pub fn fhir_request(status: u16, body: impl Into<String>) -> Self {
        Self::FhirRequest {
            status,
            body: body.into(),
        }
    }

    /// Creates a new `Transport` error.
    #[must_use]
    pub fn transport(attempts: u32, message: impl Into<String>) -> Self {
        Self::Transport {
            attempts,
            message: message.into(),
        }
    }

    /// Creates a new `InvalidResponse` error.
    #[must_use]
    pub fn invalid_response(message: impl Into<String>) -> Self {
        Self::InvalidResponse {
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

    /// HTTP status of the failed request, if there was one.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::FhirRequest { status, .. } => Some(*status),
            Self::Auth(AuthError::AuthRejected { status, .. }) => Some(*status),
            Self::RateLimitExceeded { .. } => Some(429),
            _ => None,
        }
    }

    /// Returns `true` if a later run might succeed without any change on
    /// the client side.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Auth(e) => e.is_transient(),
            Self::RateLimitExceeded { .. } | Self::Transport { .. } => true,
            Self::FhirRequest { status, .. } => *status >= 500,
            Self::InvalidResponse { .. } | Self::Configuration { .. } => false,
        }
    }
}

/// Shortens an error body to the OperationOutcome diagnostics when the server
/// sent one.
fn describe_body(body: &str) -> String {
    if let Ok(json) = serde_json::from_str::<Value>(body)
        && json.get("resourceType").and_then(Value::as_str) == Some("OperationOutcome")
        && let Some(issues) = json.get("issue").and_then(Value::as_array)
    {
        let msgs: Vec<&str> = issues
            .iter()
            .filter_map(|i| {
                i.get("diagnostics")
                    .or_else(|| i.get("details").and_then(|d| d.get("text")))
                    .and_then(Value::as_str)
            })
            .collect();
        if !msgs.is_empty() {
            return msgs.join("; ");
        }
    }
    body.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_outcome_is_summarized() {
        let body = r#"{"resourceType":"OperationOutcome","issue":[
            {"severity":"error","code":"invalid","diagnostics":"Invalid patient id"},
            {"severity":"error","code":"invalid","details":{"text":"Missing category"}}
        ]}"#;
        let err = FetchError::fhir_request(400, body);
        assert_eq!(
            err.to_string(),
            "FHIR request failed (HTTP 400): Invalid patient id; Missing category"
        );
    }

    #[test]
    fn test_plain_body_kept() {
        let err = FetchError::fhir_request(404, "not here");
        assert_eq!(err.to_string(), "FHIR request failed (HTTP 404): not here");
        assert_eq!(err.status(), Some(404));
    }

    #[test]
    fn test_retryable() {
        assert!(FetchError::RateLimitExceeded { attempts: 3 }.is_retryable());
        assert!(FetchError::fhir_request(503, "").is_retryable());
        assert!(!FetchError::fhir_request(400, "").is_retryable());
        assert!(!FetchError::invalid_response("not a bundle").is_retryable());
        assert!(!FetchError::from(AuthError::rejected(401, "")).is_retryable());
    }

    #[test]
    fn test_auth_error_is_transparent() {
        let err: FetchError = AuthError::rejected(401, "expired").into();
        assert_eq!(err.to_string(), "Authorization rejected (HTTP 401): expired");
        assert_eq!(err.status(), Some(401));
    }
}
