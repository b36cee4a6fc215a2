//! # epicrag-auth
//!
//! SMART Backend Services authentication for Epic FHIR.
//!
//! This crate provides:
//! - Loading of the RSA signing key and generation of new key pairs + JWKS
//! - RFC 7523 client assertions signed with RS384
//! - The token endpoint client (client-credentials grant) with bounded retries
//! - A token cache that reuses tokens until they near expiry
//!
//! ## Modules
//!
//! - [`credentials`] - Client identity and endpoints
//! - [`keys`] - Signing keys and JWKS export
//! - [`assertion`] - Client assertion claims and signing
//! - [`token`] - Access tokens and the token endpoint client
//! - [`cache`] - Token cache and the [`TokenProvider`] seam
//! - [`retry`] - Backoff policy shared with the FHIR fetcher

pub mod assertion;
pub mod cache;
pub mod credentials;
pub mod error;
pub mod keys;
pub mod retry;
pub mod token;

pub use assertion::{AssertionSigner, CLIENT_ASSERTION_TYPE, ClientAssertionClaims};
pub use cache::{DEFAULT_SAFETY_MARGIN, StaticToken, TokenCache, TokenProvider};
pub use credentials::Credentials;
pub use error::{AuthError, ErrorCategory};
pub use keys::{GeneratedKeyPair, Jwk, Jwks, SigningKey};
pub use retry::RetryPolicy;
pub use token::{AccessToken, AuthClient, TokenResponse};

/// Type alias for authentication results.
pub type AuthResult<T> = Result<T, AuthError>;
