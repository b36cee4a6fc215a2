//! Cached access token with serialized refresh.
//!
//! The cache hands out the current token while it is outside the safety
//! margin and otherwise exchanges a new assertion for a new token. Refreshes
//! are serialized behind an async mutex and the cache is re-checked after
//! the mutex is acquired, so concurrent callers that all observed an expired
//! token trigger one exchange and all receive its result.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};

use crate::AuthResult;
use crate::token::{AccessToken, AuthClient};

/// Default safety margin before expiry.
pub const DEFAULT_SAFETY_MARGIN: Duration = Duration::from_secs(60);

/// Source of bearer tokens for authenticated requests.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Returns a token that is usable right now.
    async fn valid_token(&self) -> AuthResult<AccessToken>;

    /// Called after the resource server rejected `stale`.
    ///
    /// Returns a replacement token, refreshing only if no other caller has
    /// already replaced `stale`.
    async fn refresh_rejected(&self, stale: &AccessToken) -> AuthResult<AccessToken>;
}

/// In-memory token cache backed by an [`AuthClient`].
pub struct TokenCache {
    client: AuthClient,
    margin: Duration,
    current: RwLock<Option<AccessToken>>,
    refresh_lock: Mutex<()>,
    exchanges: AtomicU64,
}

impl TokenCache {
    /// Creates an empty cache with the default safety margin.
    #[must_use]
    pub fn new(client: AuthClient) -> Self {
        Self::with_margin(client, DEFAULT_SAFETY_MARGIN)
    }

    /// Creates an empty cache with a custom safety margin.
    #[must_use]
    pub fn with_margin(client: AuthClient, margin: Duration) -> Self {
        Self {
            client,
            margin,
            current: RwLock::new(None),
            refresh_lock: Mutex::new(()),
            exchanges: AtomicU64::new(0),
        }
    }

    /// Configured safety margin.
    #[must_use]
    pub fn margin(&self) -> Duration {
        self.margin
    }

    /// Number of token exchanges performed so far.
    #[must_use]
    pub fn exchange_count(&self) -> u64 {
        self.exchanges.load(Ordering::Relaxed)
    }

    /// Returns a usable token, refreshing if absent or about to expire.
    ///
    /// # Errors
    /// Propagates the [`AuthClient`] error if a refresh was needed and failed.
    pub async fn get_valid_token(&self) -> AuthResult<AccessToken> {
        if let Some(token) = self.usable_cached().await {
            tracing::trace!("Using cached access token");
            return Ok(token);
        }

        let _guard = self.refresh_lock.lock().await;
        if let Some(token) = self.usable_cached().await {
            return Ok(token);
        }
        self.refresh_locked().await
    }

    /// Replaces `stale` with a freshly issued token.
    ///
    /// If another caller already replaced `stale` with a usable token, that
    /// token is returned without a new exchange.
    ///
    /// # Errors
    /// Propagates the [`AuthClient`] error if the refresh fails.
    pub async fn force_refresh(&self, stale: &AccessToken) -> AuthResult<AccessToken> {
        let _guard = self.refresh_lock.lock().await;
        if let Some(token) = self.usable_cached().await
            && token != *stale
        {
            return Ok(token);
        }
        self.refresh_locked().await
    }

    /// Drops the cached token.
    pub async fn invalidate(&self) {
        self.current.write().await.take();
    }

    /// Returns the cached token without checking or refreshing it.
    pub async fn peek(&self) -> Option<AccessToken> {
        self.current.read().await.clone()
    }

    async fn usable_cached(&self) -> Option<AccessToken> {
        self.current
            .read()
            .await
            .as_ref()
            .filter(|token| token.is_usable(self.margin))
            .cloned()
    }

    // Caller must hold `refresh_lock`.
    async fn refresh_locked(&self) -> AuthResult<AccessToken> {
        tracing::info!("Requesting new access token");
        self.exchanges.fetch_add(1, Ordering::Relaxed);
        let token = self.client.request_token().await?;
        if token.margin_is_capped(self.margin) {
            tracing::warn!(
                lifetime_secs = token.lifetime().as_secs(),
                margin_secs = self.margin.as_secs(),
                effective_margin_secs = token.effective_margin(self.margin).as_secs(),
                "Token lifetime is shorter than twice the safety margin; using a reduced margin"
            );
        }
        *self.current.write().await = Some(token.clone());
        Ok(token)
    }
}

#[async_trait]
impl TokenProvider for TokenCache {
    async fn valid_token(&self) -> AuthResult<AccessToken> {
        self.get_valid_token().await
    }

    async fn refresh_rejected(&self, stale: &AccessToken) -> AuthResult<AccessToken> {
        self.force_refresh(stale).await
    }
}

/// A provider that always returns the same token.
///
/// Useful for servers that accept a pre-issued token and for tests.
#[derive(Debug, Clone)]
pub struct StaticToken(pub AccessToken);

#[async_trait]
impl TokenProvider for StaticToken {
    async fn valid_token(&self) -> AuthResult<AccessToken> {
        Ok(self.0.clone())
    }

    async fn refresh_rejected(&self, _stale: &AccessToken) -> AuthResult<AccessToken> {
        Ok(self.0.clone())
    }
}
