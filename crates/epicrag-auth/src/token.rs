//! Access tokens and the token endpoint client.

use std::fmt;
use std::time::Duration;

use serde::Deserialize;
use time::OffsetDateTime;

use crate::AuthResult;
use crate::assertion::{AssertionSigner, CLIENT_ASSERTION_TYPE};
use crate::error::AuthError;
use crate::retry::RetryPolicy;

/// Lifetime assumed when the token response omits `expires_in`.
pub const DEFAULT_EXPIRES_IN_SECS: u64 = 3600;

/// Longest `expires_in` accepted from the token endpoint (one day).
pub const MAX_EXPIRES_IN_SECS: i64 = 86_400;

/// Default HTTP timeout for token requests.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// A bearer token together with its absolute expiry.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
    token: String,
    scope: Option<String>,
    issued_at: OffsetDateTime,
    lifetime: Duration,
}

impl AccessToken {
    /// Creates a token issued at `issued_at` that lives for `lifetime`.
    ///
    /// Lifetimes beyond [`MAX_EXPIRES_IN_SECS`] are clamped to it.
    #[must_use]
    pub fn new(
        token: impl Into<String>,
        scope: Option<String>,
        issued_at: OffsetDateTime,
        lifetime: Duration,
    ) -> Self {
        Self {
            token: token.into(),
            scope,
            issued_at,
            lifetime: lifetime.min(Duration::from_secs(MAX_EXPIRES_IN_SECS.unsigned_abs())),
        }
    }

    /// The raw bearer value. Do not log it.
    #[must_use]
    pub fn secret(&self) -> &str {
        &self.token
    }

    /// Granted scope, if the server reported one.
    #[must_use]
    pub fn scope(&self) -> Option<&str> {
        self.scope.as_deref()
    }

    /// Absolute expiry.
    #[must_use]
    pub fn expires_at(&self) -> OffsetDateTime {
        self.issued_at + self.lifetime
    }

    /// Total lifetime granted by the server.
    #[must_use]
    pub fn lifetime(&self) -> Duration {
        self.lifetime
    }

    /// Safety margin actually applied to this token.
    ///
    /// A token that lives shorter than the configured margin would never be
    /// usable, so the margin is capped at half the token's lifetime.
    #[must_use]
    pub fn effective_margin(&self, margin: Duration) -> Duration {
        margin.min(self.lifetime / 2)
    }

    /// Returns `true` if `margin` is larger than this token allows, i.e.
    /// [`effective_margin`](Self::effective_margin) is smaller than `margin`.
    #[must_use]
    pub fn margin_is_capped(&self, margin: Duration) -> bool {
        self.effective_margin(margin) < margin
    }

    /// Returns `true` while `now < expires_at - margin`.
    #[must_use]
    pub fn is_usable_at(&self, now: OffsetDateTime, margin: Duration) -> bool {
        now < self.expires_at() - self.effective_margin(margin)
    }

    /// Returns `true` if the token is usable right now.
    #[must_use]
    pub fn is_usable(&self, margin: Duration) -> bool {
        self.is_usable_at(OffsetDateTime::now_utc(), margin)
    }

    /// A redacted preview suitable for display.
    #[must_use]
    pub fn preview(&self) -> String {
        let token = &self.token;
        if token.len() > 20 && token.is_ascii() {
            format!("{}...{}", &token[..8], &token[token.len() - 8..])
        } else {
            "********".to_string()
        }
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &self.preview())
            .field("scope", &self.scope)
            .field("expires_at", &self.expires_at())
            .finish()
    }
}

/// Token endpoint response body.
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    /// The issued bearer token.
    pub access_token: String,

    /// Lifetime in seconds.
    #[serde(default)]
    pub expires_in: Option<i64>,

    /// Granted scope.
    #[serde(default)]
    pub scope: Option<String>,

    /// Token type, expected to be "bearer".
    #[serde(default)]
    pub token_type: Option<String>,
}

impl TokenResponse {
    /// Parses a token endpoint body.
    ///
    /// # Errors
    /// Returns [`AuthError::TokenParse`] for malformed JSON, an empty token,
    /// a non-bearer token type, or an `expires_in` that is not within
    /// `1..=MAX_EXPIRES_IN_SECS`.
    pub fn parse(body: &str) -> AuthResult<Self> {
        let response: Self =
            serde_json::from_str(body).map_err(|e| AuthError::token_parse(e.to_string()))?;

        if response.access_token.trim().is_empty() {
            return Err(AuthError::token_parse("access_token is empty"));
        }
        if let Some(token_type) = &response.token_type
            && !token_type.eq_ignore_ascii_case("bearer")
        {
            return Err(AuthError::token_parse(format!(
                "unsupported token_type '{token_type}'"
            )));
        }
        if let Some(expires_in) = response.expires_in
            && !(1..=MAX_EXPIRES_IN_SECS).contains(&expires_in)
        {
            return Err(AuthError::token_parse(format!(
                "expires_in must be within 1..={MAX_EXPIRES_IN_SECS}, got {expires_in}"
            )));
        }
        Ok(response)
    }

    /// Converts the response into a token issued at `issued_at`.
    #[must_use]
    pub fn into_access_token(self, issued_at: OffsetDateTime) -> AccessToken {
        let lifetime = self
            .expires_in
            .map_or(DEFAULT_EXPIRES_IN_SECS, |secs| secs.unsigned_abs());
        AccessToken::new(
            self.access_token,
            self.scope,
            issued_at,
            Duration::from_secs(lifetime),
        )
    }
}

/// Exchanges signed client assertions for access tokens.
#[derive(Debug, Clone)]
pub struct AuthClient {
    http: reqwest::Client,
    signer: AssertionSigner,
    retry: RetryPolicy,
}

impl AuthClient {
    /// Creates a client with its own HTTP connection pool.
    ///
    /// # Errors
    /// Returns [`AuthError::Configuration`] if the HTTP client cannot be built.
    pub fn new(signer: AssertionSigner, retry: RetryPolicy) -> AuthResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .build()
            .map_err(|e| AuthError::configuration(format!("failed to build HTTP client: {e}")))?;
        Ok(Self::with_http_client(http, signer, retry))
    }

    /// Creates a client that shares an existing HTTP client.
    #[must_use]
    pub fn with_http_client(
        http: reqwest::Client,
        signer: AssertionSigner,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            http,
            signer,
            retry,
        }
    }

    /// Requests a new access token.
    ///
    /// A fresh assertion is signed for every attempt. 5xx responses and
    /// network failures are retried according to the retry policy; 4xx
    /// responses are returned immediately.
    ///
    /// # Errors
    /// - [`AuthError::AuthRejected`] for 4xx responses
    /// - [`AuthError::AuthServerUnavailable`] once retries are exhausted
    /// - [`AuthError::TokenParse`] for malformed success responses
    /// - [`AuthError::Signing`] if the assertion cannot be signed
    pub async fn request_token(&self) -> AuthResult<AccessToken> {
        let credentials = self.signer.credentials();
        let token_endpoint = credentials.token_endpoint().as_str();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let assertion = self.signer.sign()?;

            let mut form = vec![
                ("grant_type", "client_credentials"),
                ("client_assertion_type", CLIENT_ASSERTION_TYPE),
                ("client_assertion", assertion.as_str()),
            ];
            if let Some(scope) = credentials.scope() {
                form.push(("scope", scope));
            }

            tracing::debug!(attempt, endpoint = token_endpoint, "Requesting access token");

            let failure = match self.http.post(token_endpoint).form(&form).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let issued_at = OffsetDateTime::now_utc();
                        let body = response
                            .text()
                            .await
                            .map_err(|e| AuthError::token_parse(e.to_string()))?;
                        let token = TokenResponse::parse(&body)?.into_access_token(issued_at);
                        tracing::info!(
                            expires_in = token.lifetime().as_secs(),
                            scope = token.scope().unwrap_or(""),
                            "Access token obtained"
                        );
                        return Ok(token);
                    }

                    let body = response.text().await.unwrap_or_default();
                    if !status.is_server_error() {
                        tracing::error!(status = status.as_u16(), "Token request rejected");
                        return Err(AuthError::rejected(status.as_u16(), body));
                    }
                    format!("HTTP {status}: {body}")
                }
                Err(e) => format!("request failed: {e}"),
            };

            if !self.retry.should_retry(attempt) {
                tracing::error!(attempts = attempt, "Token endpoint unavailable: {}", failure);
                return Err(AuthError::server_unavailable(attempt, failure));
            }

            let delay = self.retry.delay_for(attempt - 1);
            tracing::warn!(
                "Token request attempt {} failed ({}), retrying in {:?}",
                attempt,
                failure,
                delay
            );
            tokio::time::sleep(delay).await;
        }
    }
}
