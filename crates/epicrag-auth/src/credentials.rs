//! Backend Services client credentials.

use std::fmt;

use url::Url;

use crate::AuthResult;
use crate::error::AuthError;
use crate::keys::SigningKey;

/// Everything needed to authenticate as a registered backend client.
///
/// Loaded once at startup and never mutated afterwards.
#[derive(Clone)]
pub struct Credentials {
    client_id: String,
    key_id: String,
    token_endpoint: Url,
    fhir_base_url: Url,
    scope: Option<String>,
    signing_key: SigningKey,
}

impl Credentials {
    /// Builds and validates a credential set.
    ///
    /// # Errors
    /// Returns [`AuthError::Configuration`] if an identifier is empty or a URL
    /// does not parse.
    pub fn new(
        client_id: impl Into<String>,
        key_id: impl Into<String>,
        token_endpoint: &str,
        fhir_base_url: &str,
        signing_key: SigningKey,
    ) -> AuthResult<Self> {
        let client_id = client_id.into();
        let key_id = key_id.into();

        if client_id.trim().is_empty() {
            return Err(AuthError::configuration("client_id must not be empty"));
        }
        if key_id.trim().is_empty() {
            return Err(AuthError::configuration("key_id must not be empty"));
        }

        let token_endpoint = Url::parse(token_endpoint).map_err(|e| {
            AuthError::configuration(format!("invalid token endpoint '{token_endpoint}': {e}"))
        })?;
        let fhir_base_url = Url::parse(fhir_base_url.trim_end_matches('/')).map_err(|e| {
            AuthError::configuration(format!("invalid FHIR base URL '{fhir_base_url}': {e}"))
        })?;

        Ok(Self {
            client_id,
            key_id,
            token_endpoint,
            fhir_base_url,
            scope: None,
            signing_key,
        })
    }

    /// Sets the scope requested at the token endpoint.
    #[must_use]
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        let scope = scope.into();
        self.scope = (!scope.trim().is_empty()).then_some(scope);
        self
    }

    /// OAuth client id (also the assertion issuer and subject).
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Key id of the registered public key.
    #[must_use]
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// Token endpoint URL (also the assertion audience).
    #[must_use]
    pub fn token_endpoint(&self) -> &Url {
        &self.token_endpoint
    }

    /// FHIR server root, without a trailing slash.
    #[must_use]
    pub fn fhir_base_url(&self) -> &str {
        self.fhir_base_url.as_str().trim_end_matches('/')
    }

    /// Scope requested at the token endpoint, if any.
    #[must_use]
    pub fn scope(&self) -> Option<&str> {
        self.scope.as_deref()
    }

    /// The private key used for signing assertions.
    #[must_use]
    pub fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("client_id", &self.client_id)
            .field("key_id", &self.key_id)
            .field("token_endpoint", &self.token_endpoint.as_str())
            .field("fhir_base_url", &self.fhir_base_url())
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}
