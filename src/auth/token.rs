//! Token record and durable token store

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::classify;
use crate::error::Result;
use crate::runtime::Clock;
use crate::storage::{KeyValueStore, StorageKeys};

/// OAuth token set, replaced as a whole on exchange or refresh
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthTokens {
    /// Access token for API calls
    pub access_token: String,

    /// Refresh token for obtaining new access tokens
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,

    /// Token type (usually "Bearer")
    pub token_type: String,

    /// Scopes granted to this token
    #[serde(default)]
    pub scope: String,

    /// Lifetime in seconds, counted from `issued_at`
    pub expires_in: u64,

    /// Unix milliseconds when the token was issued
    pub issued_at: u64,
}

// Tokens stay out of logs even at trace level.
impl std::fmt::Debug for OAuthTokens {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthTokens")
            .field("token_type", &self.token_type)
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("scope", &self.scope)
            .field("expires_in", &self.expires_in)
            .field("issued_at", &self.issued_at)
            .finish_non_exhaustive()
    }
}

impl OAuthTokens {
    /// Unix milliseconds when the access token stops being valid
    #[must_use]
    pub fn expires_at_ms(&self) -> u64 {
        self.issued_at
            .saturating_add(self.expires_in.saturating_mul(1000))
    }

    /// Get the Authorization header value
    ///
    /// The scheme is always `Bearer`; providers report the type in varying
    /// case (`bearer`, `Bearer`).
    #[must_use]
    pub fn authorization_header(&self) -> String {
        format!("Bearer {}", self.access_token)
    }

    /// Get remaining validity at `now_ms`, if any
    #[must_use]
    pub fn remaining_validity(&self, now_ms: u64) -> Option<Duration> {
        let expires_at = self.expires_at_ms();
        (expires_at > now_ms).then(|| Duration::from_millis(expires_at - now_ms))
    }
}

/// Durable token store over a [`KeyValueStore`]
///
/// Expiry is enforced lazily: [`TokenStore::load`] treats an expired record
/// as absent and deletes it. There is no background sweep.
#[derive(Clone)]
pub struct TokenStore {
    store: Arc<dyn KeyValueStore>,
    key: String,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for TokenStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenStore")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

impl TokenStore {
    /// Create a token store
    pub fn new(store: Arc<dyn KeyValueStore>, keys: &StorageKeys, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            key: keys.tokens(),
            clock,
        }
    }

    /// Persist `tokens`, replacing any previous record
    ///
    /// # Errors
    /// Returns a non-recoverable error if the record cannot be written.
    pub fn save(&self, tokens: &OAuthTokens) -> Result<()> {
        let record =
            serde_json::to_string(tokens).map_err(|e| classify::storage_failure(&e.into()))?;
        self.store
            .set(&self.key, &record)
            .map_err(|e| classify::storage_failure(&e))
    }

    /// Load the current tokens, evicting expired or corrupt records
    #[must_use]
    pub fn load(&self) -> Option<OAuthTokens> {
        let record = match self.store.get(&self.key) {
            Ok(record) => record?,
            Err(e) => {
                tracing::warn!(error = %e, "Could not read token record");
                return None;
            }
        };

        let tokens = match serde_json::from_str::<OAuthTokens>(&record) {
            Ok(tokens) => tokens,
            Err(e) => {
                tracing::warn!(error = %e, "Discarding corrupt token record");
                self.clear();
                return None;
            }
        };

        if self.is_expired(&tokens, 0) {
            tracing::debug!("Stored token expired; evicting");
            self.clear();
            return None;
        }

        Some(tokens)
    }

    /// Delete the token record
    pub fn clear(&self) {
        if let Err(e) = self.store.remove(&self.key) {
            tracing::warn!(error = %e, "Could not clear token record");
        }
    }

    /// Whether `tokens` expire within `skew_secs` from now
    #[must_use]
    pub fn is_expired(&self, tokens: &OAuthTokens, skew_secs: u64) -> bool {
        let horizon = self
            .clock
            .now_millis()
            .saturating_add(skew_secs.saturating_mul(1000));
        horizon >= tokens.expires_at_ms()
    }
}
