//! Authenticated, paginated FHIR search client.
//!
//! Every request carries the current bearer token from a [`TokenProvider`].
//! Searches are exposed as streams of resources: pages are requested lazily
//! as the consumer pulls, following the Bundle `next` link until the server
//! stops sending one.
//!
//! Failure handling per request:
//!
//! - 429: wait for `Retry-After` (or the policy backoff) and retry
//! - 5xx and network errors: policy backoff and retry
//! - 401: refresh the token once and repeat the same request
//! - anything else: fail immediately

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use epicrag_auth::{AccessToken, AuthError, RetryPolicy, TokenProvider};
use futures_util::stream::{self, Stream, TryStreamExt};
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, RETRY_AFTER};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::FetchResult;
use crate::error::FetchError;
use crate::query::{FhirPage, FhirQuery, ResourceType};
use crate::resources::PatientRecord;

/// Media type for FHIR JSON.
pub const FHIR_JSON: &str = "application/fhir+json";

/// Observation category applied when a search names none.
pub const DEFAULT_OBSERVATION_CATEGORY: &str = "vital-signs";

/// Fetcher settings.
#[derive(Debug, Clone)]
pub struct FetcherConfig {
    /// `_count` sent on the first page of every search.
    pub page_size: u32,

    /// Minimum spacing between two requests.
    pub min_request_interval: Duration,

    /// Category sent for Observation searches that specify none.
    ///
    /// `None` searches all categories.
    pub default_observation_category: Option<String>,

    /// Retry policy for 429, 5xx and network failures.
    pub retry: RetryPolicy,

    /// Per-request timeout.
    pub request_timeout: Duration,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            page_size: 50,
            min_request_interval: Duration::from_millis(100),
            default_observation_category: Some(DEFAULT_OBSERVATION_CATEGORY.to_string()),
            retry: RetryPolicy::default(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl FetcherConfig {
    /// Sets `_count`. Values below 1 become 1.
    ///
    /// ```
    /// use epicrag_fhir::FetcherConfig;
    ///
    /// assert_eq!(FetcherConfig::default().with_page_size(0).page_size, 1);
    /// assert_eq!(FetcherConfig::default().with_page_size(200).page_size, 200);
    /// ```
    #[must_use]
    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Sets the minimum spacing between requests.
    #[must_use]
    pub fn with_min_request_interval(mut self, interval: Duration) -> Self {
        self.min_request_interval = interval;
        self
    }

    /// Sets the category used for Observation searches that name none.
    ///
    /// `None` or a blank category disables the default.
    #[must_use]
    pub fn with_default_observation_category(mut self, category: Option<String>) -> Self {
        self.default_observation_category = category.filter(|c| !c.trim().is_empty());
        self
    }

    /// Retry policy for 429, 5xx and transport failures.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Per-request timeout.
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// Where the next page comes from.
enum Cursor {
    First(FhirQuery),
    Next(String),
    Done,
}

/// A single GET: a URL and the query string to append to it.
struct PageRequest<'a> {
    url: &'a str,
    params: &'a [(String, String)],
}

/// FHIR R4 client for one server.
///
/// Requests are spaced by `min_request_interval` across all streams sharing
/// the fetcher. Pagination only follows `next` links under `base_url`, and
/// stops with an error if a link repeats.
pub struct FhirFetcher {
    http: reqwest::Client,
    base_url: String,
    tokens: Arc<dyn TokenProvider>,
    config: FetcherConfig,
    last_request: Mutex<Option<Instant>>,
}

impl FhirFetcher {
    /// Creates a fetcher for the FHIR server at `base_url`.
    ///
    /// # Errors
    /// Returns [`FetchError::Configuration`] if the HTTP client cannot be built.
    pub fn new(
        base_url: &str,
        tokens: Arc<dyn TokenProvider>,
        config: FetcherConfig,
    ) -> FetchResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| FetchError::configuration(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            tokens,
            config,
            last_request: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    #[must_use]
    pub fn config(&self) -> &FetcherConfig {
        &self.config
    }

    /// Streams every resource matching `query`, page by page, in server order.
    ///
    /// Nothing is requested until the stream is polled. An error ends the
    /// stream; re-invoke to start over.
    pub fn fetch_resource(&self, query: FhirQuery) -> impl Stream<Item = FetchResult<Value>> + '_ {
        self.pages(query)
            .map_ok(|page| stream::iter(page.entries.into_iter().map(Ok::<Value, FetchError>)))
            .try_flatten()
    }

    /// Streams the raw pages of `query`.
    pub fn pages(&self, query: FhirQuery) -> impl Stream<Item = FetchResult<FhirPage>> + '_ {
        let query = self.apply_defaults(query);
        let cursor = match query.page_cursor() {
            Some(url) => Cursor::Next(url.to_string()),
            None => Cursor::First(query),
        };
        let state = (cursor, 0_u32, HashSet::<String>::new());

        stream::try_unfold(state, move |(cursor, page_number, mut visited)| async move {
            let page_number = page_number + 1;
            let page = match cursor {
                Cursor::Done => return Ok::<_, FetchError>(None),
                Cursor::First(query) => {
                    let url = format!("{}/{}", self.base_url, query.resource_type());
                    let params = query.search_params(self.config.page_size);
                    tracing::debug!(
                        resource_type = %query.resource_type(),
                        patient_id = query.patient_id(),
                        "Fetching first page"
                    );
                    self.get_page(PageRequest {
                        url: &url,
                        params: &params,
                    })
                    .await?
                }
                Cursor::Next(url) => {
                    self.check_next_link(&url)?;
                    if !visited.insert(url.clone()) {
                        tracing::error!(url = %url, page = page_number, "Pagination loop detected");
                        return Err(FetchError::invalid_response(format!(
                            "next link repeats an earlier page: {url}"
                        )));
                    }
                    tracing::debug!(page = page_number, "Fetching next page");
                    self.get_page(PageRequest {
                        url: &url,
                        params: &[],
                    })
                    .await?
                }
            };

            tracing::debug!(
                page = page_number,
                entries = page.entries.len(),
                has_next = page.next.is_some(),
                "Received page"
            );

            let next = match &page.next {
                Some(url) => Cursor::Next(url.clone()),
                None => Cursor::Done,
            };
            Ok::<_, FetchError>(Some((page, (next, page_number, visited))))
        })
    }

    /// Collects every resource matching `query`.
    ///
    /// # Errors
    /// Fails if any page fails; partial results are discarded.
    pub async fn fetch_all(&self, query: FhirQuery) -> FetchResult<Vec<Value>> {
        let resource_type = query.resource_type();
        let resources: Vec<Value> = self.fetch_resource(query).try_collect().await?;
        tracing::info!(
            resource_type = %resource_type,
            count = resources.len(),
            "Fetched resources"
        );
        Ok(resources)
    }

    /// Reads a Patient by id.
    ///
    /// # Errors
    /// Returns [`FetchError::FhirRequest`] for 404 and other failures, or
    /// [`FetchError::InvalidResponse`] if the body is not a Patient.
    pub async fn read_patient(&self, patient_id: &str) -> FetchResult<Value> {
        let url = format!("{}/{}/{}", self.base_url, ResourceType::Patient, patient_id);
        let body = self
            .get_with_retries(PageRequest {
                url: &url,
                params: &[],
            })
            .await?;

        let patient: Value = serde_json::from_str(&body)
            .map_err(|e| FetchError::invalid_response(format!("body is not JSON: {e}")))?;
        match patient.get("resourceType").and_then(Value::as_str) {
            Some("Patient") => Ok(patient),
            other => Err(FetchError::invalid_response(format!(
                "expected Patient, got {}",
                other.unwrap_or("no resourceType")
            ))),
        }
    }

    /// Fetches the Patient, Conditions, MedicationRequests and Observations.
    ///
    /// # Errors
    /// Fails if any of the four fetches fails.
    pub async fn fetch_all_patient_data(&self, patient_id: &str) -> FetchResult<PatientRecord> {
        tracing::info!(patient_id, "Fetching all data for patient");

        let patient = self.read_patient(patient_id).await?;
        let conditions = self
            .fetch_all(FhirQuery::new(ResourceType::Condition, patient_id))
            .await?;
        let medications = self
            .fetch_all(FhirQuery::new(ResourceType::MedicationRequest, patient_id))
            .await?;
        let observations = self
            .fetch_all(FhirQuery::new(ResourceType::Observation, patient_id))
            .await?;

        let record = PatientRecord {
            patient_id: patient_id.to_string(),
            patient,
            conditions,
            medications,
            observations,
        };
        tracing::info!(
            patient_id,
            conditions = record.conditions.len(),
            medications = record.medications.len(),
            observations = record.observations.len(),
            "Patient data fetch complete"
        );
        Ok(record)
    }

    fn apply_defaults(&self, query: FhirQuery) -> FhirQuery {
        if query.resource_type() != ResourceType::Observation
            || query.category().is_some()
            || query.page_cursor().is_some()
        {
            return query;
        }
        match &self.config.default_observation_category {
            Some(category) => {
                tracing::warn!(
                    patient_id = query.patient_id(),
                    category = category.as_str(),
                    "Observation search without category, restricting to default category; \
                     observations in other categories are not retrieved"
                );
                query.with_category(category.clone())
            }
            None => query,
        }
    }

    /// Rejects cursor URLs outside this server's base URL so the bearer
    /// token is never sent to another host.
    fn check_next_link(&self, url: &str) -> FetchResult<()> {
        let on_base = url.strip_prefix(self.base_url.as_str()).is_some_and(|rest| {
            rest.is_empty() || rest.starts_with('/') || rest.starts_with('?')
        });
        if on_base {
            return Ok(());
        }
        tracing::error!(url, base_url = %self.base_url, "Next link points outside the FHIR base URL");
        Err(FetchError::invalid_response(format!(
            "next link {url} is outside {}",
            self.base_url
        )))
    }

    async fn get_page(&self, request: PageRequest<'_>) -> FetchResult<FhirPage> {
        let body = self.get_with_retries(request).await?;
        FhirPage::parse(&body)
    }

    async fn get_with_retries(&self, request: PageRequest<'_>) -> FetchResult<String> {
        let retry = &self.config.retry;
        let mut token = self.tokens.valid_token().await?;
        let mut refreshed = false;
        let mut attempt = 0;

        loop {
            attempt += 1;
            self.throttle().await;

            let response = self.send(&request, &token).await;
            let (failure, hint) = match response {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return response.text().await.map_err(|e| {
                            FetchError::invalid_response(format!("failed to read body: {e}"))
                        });
                    }

                    let hint = retry_after(&response);
                    let body = response.text().await.unwrap_or_default();

                    if status == StatusCode::UNAUTHORIZED {
                        if refreshed {
                            tracing::error!(url = request.url, "Refreshed token rejected");
                            return Err(AuthError::rejected(status.as_u16(), body).into());
                        }
                        tracing::warn!(url = request.url, "Token rejected, refreshing once");
                        token = self.refresh(&token).await?;
                        refreshed = true;
                        attempt -= 1;
                        continue;
                    }

                    if status == StatusCode::TOO_MANY_REQUESTS {
                        if !retry.should_retry(attempt) {
                            tracing::error!(attempts = attempt, url = request.url, "Rate limit exceeded");
                            return Err(FetchError::RateLimitExceeded { attempts: attempt });
                        }
                        (format!("HTTP {status}"), hint)
                    } else if status.is_server_error() {
                        if !retry.should_retry(attempt) {
                            return Err(FetchError::fhir_request(status.as_u16(), body));
                        }
                        (format!("HTTP {status}"), None)
                    } else {
                        tracing::error!(status = status.as_u16(), url = request.url, "FHIR request failed");
                        return Err(FetchError::fhir_request(status.as_u16(), body));
                    }
                }
                Err(e) => {
                    if !retry.should_retry(attempt) {
                        return Err(FetchError::transport(attempt, e.to_string()));
                    }
                    (e.to_string(), None)
                }
            };

            let delay = retry.delay_with_hint(attempt - 1, hint);
            tracing::warn!(
                "FHIR request attempt {} failed ({}), retrying in {:?}",
                attempt,
                failure,
                delay
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn send(
        &self,
        request: &PageRequest<'_>,
        token: &AccessToken,
    ) -> Result<reqwest::Response, reqwest::Error> {
        let mut builder = self
            .http
            .get(request.url)
            .bearer_auth(token.secret())
            .header(ACCEPT, FHIR_JSON);
        if !request.params.is_empty() {
            builder = builder.query(request.params);
        }
        builder.send().await
    }

    async fn refresh(&self, stale: &AccessToken) -> FetchResult<AccessToken> {
        Ok(self.tokens.refresh_rejected(stale).await?)
    }

    /// Waits until `min_request_interval` has passed since the last request.
    async fn throttle(&self) {
        let interval = self.config.min_request_interval;
        let mut last = self.last_request.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < interval {
                tokio::time::sleep(interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

/// Parses a delta-seconds `Retry-After` header.
fn retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}
