//! JWT client assertions for the Backend Services token request.
//!
//! Implements the client side of RFC 7523 (JSON Web Token Bearer Assertion):
//!
//! - `iss` and `sub`: the client_id
//! - `aud`: the token endpoint URL
//! - `jti`: a fresh random identifier, so two assertions minted in the same
//!   second are still distinct and cannot be replayed
//! - `iat` / `exp`: issue time and a lifetime of at most 5 minutes
//!
//! Assertions are signed with RS384 and carry the registered `kid` in the
//! header so the server can pick the matching key from the client's JWKS.

use std::sync::Arc;

use jsonwebtoken::Header;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::AuthResult;
use crate::credentials::Credentials;
use crate::error::AuthError;
use crate::keys::ASSERTION_ALGORITHM;

/// Maximum assertion lifetime accepted by the authorization server.
pub const MAX_ASSERTION_LIFETIME_SECS: i64 = 300;

/// `client_assertion_type` value for JWT bearer assertions.
pub const CLIENT_ASSERTION_TYPE: &str = "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";

/// Claims of a client assertion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientAssertionClaims {
    /// Issuer: the client_id.
    pub iss: String,
    /// Subject: the client_id.
    pub sub: String,
    /// Audience: the token endpoint URL.
    pub aud: String,
    /// Unique assertion id.
    pub jti: String,
    /// Issued at (Unix timestamp).
    pub iat: i64,
    /// Expiration (Unix timestamp).
    pub exp: i64,
}

/// Builds and signs client assertions.
#[derive(Debug, Clone)]
pub struct AssertionSigner {
    credentials: Arc<Credentials>,
    lifetime_secs: i64,
}

impl AssertionSigner {
    /// Creates a signer with the maximum allowed lifetime.
    #[must_use]
    pub fn new(credentials: Arc<Credentials>) -> Self {
        Self {
            credentials,
            lifetime_secs: MAX_ASSERTION_LIFETIME_SECS,
        }
    }

    /// Sets the assertion lifetime, clamped to `1..=300` seconds.
    #[must_use]
    pub fn with_lifetime_secs(mut self, seconds: i64) -> Self {
        self.lifetime_secs = seconds.clamp(1, MAX_ASSERTION_LIFETIME_SECS);
        self
    }

    /// The credentials this signer signs for.
    #[must_use]
    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Builds the claims for a new assertion.
    #[must_use]
    pub fn claims(&self) -> ClientAssertionClaims {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let client_id = self.credentials.client_id().to_string();
        ClientAssertionClaims {
            iss: client_id.clone(),
            sub: client_id,
            aud: self.credentials.token_endpoint().to_string(),
            jti: uuid::Uuid::new_v4().to_string(),
            iat: now,
            exp: now + self.lifetime_secs,
        }
    }

    /// Signs a new assertion.
    ///
    /// # Errors
    /// Returns [`AuthError::Signing`] if the JWT cannot be encoded.
    pub fn sign(&self) -> AuthResult<String> {
        let claims = self.claims();

        let mut header = Header::new(ASSERTION_ALGORITHM);
        header.kid = Some(self.credentials.key_id().to_string());
        header.typ = Some("JWT".to_string());

        let assertion = jsonwebtoken::encode(
            &header,
            &claims,
            self.credentials.signing_key().encoding_key(),
        )
        .map_err(|e| AuthError::signing(e.to_string()))?;

        tracing::trace!(jti = %claims.jti, exp = claims.exp, "Signed client assertion");
        Ok(assertion)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::SigningKey;
    use jsonwebtoken::{Validation, decode, decode_header};

    const TEST_KEY: &str = include_str!("../tests/fixtures/test_key.pem");
    const TOKEN_URL: &str = "https://fhir.example.org/oauth2/token";

    fn signer() -> AssertionSigner {
        let key = SigningKey::from_pem(TEST_KEY).unwrap();
        let creds = Credentials::new(
            "client-123",
            "kid-abc",
            TOKEN_URL,
            "https://fhir.example.org/api/FHIR/R4",
            key,
        )
        .unwrap();
        AssertionSigner::new(Arc::new(creds))
    }

    fn verify(signer: &AssertionSigner, assertion: &str) -> ClientAssertionClaims {
        let key = signer.credentials().signing_key().decoding_key().unwrap();
        let mut validation = Validation::new(ASSERTION_ALGORITHM);
        validation.set_audience(&[TOKEN_URL]);
        validation.set_issuer(&["client-123"]);
        decode::<ClientAssertionClaims>(assertion, &key, &validation)
            .unwrap()
            .claims
    }

    #[test]
    fn test_assertion_is_verifiable() {
        let signer = signer();
        let assertion = signer.sign().unwrap();

        let header = decode_header(&assertion).unwrap();
        assert_eq!(header.alg, ASSERTION_ALGORITHM);
        assert_eq!(header.kid.as_deref(), Some("kid-abc"));
        assert_eq!(header.typ.as_deref(), Some("JWT"));

        let claims = verify(&signer, &assertion);
        assert_eq!(claims.iss, "client-123");
        assert_eq!(claims.sub, "client-123");
        assert_eq!(claims.aud, TOKEN_URL);
        assert!(claims.exp - claims.iat <= MAX_ASSERTION_LIFETIME_SECS);
        assert!(claims.exp > claims.iat);
    }

    #[test]
    fn test_repeated_assertions_are_distinct() {
        let signer = signer();
        let first = verify(&signer, &signer.sign().unwrap());
        let second = verify(&signer, &signer.sign().unwrap());

        assert_ne!(first.jti, second.jti);
        assert_eq!(first.iss, second.iss);
        assert_eq!(first.sub, second.sub);
        assert_eq!(first.aud, second.aud);
    }

    #[test]
    fn test_lifetime_is_clamped() {
        let signer = signer().with_lifetime_secs(3600);
        let claims = signer.claims();
        assert_eq!(claims.exp - claims.iat, MAX_ASSERTION_LIFETIME_SECS);

        let claims = signer.with_lifetime_secs(0).claims();
        assert_eq!(claims.exp - claims.iat, 1);
    }
}
