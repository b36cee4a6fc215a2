//! Minimal HTTP client for OpenAI-compatible APIs.
//!
//! Shared by the embedding and chat clients. Requests are JSON POSTs with a
//! bearer API key. 429, 5xx and connection failures are retried with the
//! shared [`RetryPolicy`]; any other error status fails immediately.

use std::fmt;
use std::time::Duration;

use epicrag_auth::RetryPolicy;
use reqwest::StatusCode;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::IndexResult;
use crate::error::IndexError;

/// Public OpenAI API root.
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Default HTTP timeout for model calls.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Connection settings for an OpenAI-compatible API.
#[derive(Clone)]
pub struct OpenAiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    retry: RetryPolicy,
}

impl OpenAiClient {
    /// Creates a client for `base_url` (e.g. `https://api.openai.com/v1`).
    ///
    /// # Errors
    /// Returns [`IndexError::Configuration`] if the key is empty or the HTTP
    /// client cannot be built.
    pub fn new(base_url: &str, api_key: impl Into<String>, retry: RetryPolicy) -> IndexResult<Self> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(IndexError::configuration("OpenAI API key is empty"));
        }
        let http = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| IndexError::configuration(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            retry,
        })
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// POSTs `body` to `{base_url}/{path}` and decodes the JSON response.
    pub(crate) async fn post_json<B, R>(&self, service: &'static str, path: &str, body: &B) -> IndexResult<R>
    where
        B: Serialize + Sync,
        R: DeserializeOwned,
    {
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        let mut attempt = 0;

        loop {
            attempt += 1;
            tracing::debug!(service, attempt, url = %url, "Calling model API");

            let failure = match self
                .http
                .post(&url)
                .bearer_auth(&self.api_key)
                .json(body)
                .send()
                .await
            {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return response
                            .json::<R>()
                            .await
                            .map_err(|e| IndexError::invalid_response(service, e.to_string()));
                    }

                    let body = response.text().await.unwrap_or_default();
                    if !is_retryable_status(status) {
                        tracing::error!(service, status = status.as_u16(), "Model API request failed");
                        return Err(IndexError::api(service, status.as_u16(), body));
                    }
                    format!("HTTP {status}: {body}")
                }
                Err(e) if is_retryable_error(&e) => format!("request failed: {e}"),
                Err(e) => return Err(IndexError::unavailable(service, attempt, e.to_string())),
            };

            if !self.retry.should_retry(attempt) {
                tracing::error!(service, attempts = attempt, "Model API unavailable: {}", failure);
                return Err(IndexError::unavailable(service, attempt, failure));
            }

            let delay = self.retry.delay_for(attempt - 1);
            tracing::warn!(
                "{} API attempt {} failed ({}), retrying in {:?}",
                service,
                attempt,
                failure,
                delay
            );
            tokio::time::sleep(delay).await;
        }
    }
}

impl fmt::Debug for OpenAiClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenAiClient")
            .field("base_url", &self.base_url)
            .field("api_key", &"********")
            .field("retry", &self.retry)
            .finish()
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_connect() || err.is_timeout() || err.is_request()
}
