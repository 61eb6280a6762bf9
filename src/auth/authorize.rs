//! Authorization request construction

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use url::Url;

use super::classify;
use super::pkce::{CHALLENGE_METHOD, PkceChallenge, RandomSource, generate_state};
use crate::config::OAuthConfig;
use crate::error::Result;
use crate::runtime::Clock;
use crate::storage::{KeyValueStore, StorageKeys};

/// Flow-correlation secrets persisted across the authorization redirect
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationAttempt {
    /// Opaque CSRF token round-tripped through the provider
    pub state: String,
    /// PKCE verifier matching the challenge that was sent
    pub code_verifier: String,
    /// Unix milliseconds when the attempt started
    pub created_at: u64,
}

/// Builds authorization URLs and records the pending attempt
pub struct AuthorizationRequestBuilder {
    config: Arc<OAuthConfig>,
    store: Arc<dyn KeyValueStore>,
    keys: StorageKeys,
    random: Arc<dyn RandomSource>,
    clock: Arc<dyn Clock>,
    verifier_length: usize,
}

impl std::fmt::Debug for AuthorizationRequestBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthorizationRequestBuilder")
            .field("authorize_url", &self.config.authorize_url)
            .field("verifier_length", &self.verifier_length)
            .finish_non_exhaustive()
    }
}

impl AuthorizationRequestBuilder {
    /// Create a builder over the given ports
    pub fn new(
        config: Arc<OAuthConfig>,
        store: Arc<dyn KeyValueStore>,
        random: Arc<dyn RandomSource>,
        clock: Arc<dyn Clock>,
        verifier_length: usize,
    ) -> Self {
        let keys = StorageKeys::new(config.storage_namespace.clone());
        Self {
            config,
            store,
            keys,
            random,
            clock,
            verifier_length,
        }
    }

    /// Start a new authorization attempt and return the URL to navigate to
    ///
    /// Any previous pending attempt is replaced.
    ///
    /// # Errors
    /// Fails if secure randomness is unavailable, the configured authorize
    /// URL does not parse, or the attempt cannot be persisted.
    pub fn start_flow(&self) -> Result<String> {
        let mut url = Url::parse(&self.config.authorize_url)
            .map_err(|e| classify::invalid_request(format!("invalid authorize URL: {e}")))?;
        let pkce = PkceChallenge::generate(self.random.as_ref(), self.verifier_length)?;
        let state = generate_state(self.random.as_ref())?;

        let attempt = AuthorizationAttempt {
            state: state.clone(),
            code_verifier: pkce.code_verifier,
            created_at: self.clock.now_millis(),
        };
        let record = serde_json::to_string(&attempt)
            .map_err(|e| classify::storage_failure(&e.into()))?;
        self.store
            .set(&self.keys.pending_authorization(), &record)
            .map_err(|e| classify::storage_failure(&e))?;

        tracing::debug!("Started authorization attempt");
        self.append_auth_params(&mut url, &state, &pkce.code_challenge);
        Ok(url.into())
    }

    /// Add the PKCE authorization parameters to `url`
    fn append_auth_params(&self, url: &mut Url, state: &str, code_challenge: &str) {
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.config.client_id)
            .append_pair("redirect_uri", &self.config.redirect_uri)
            .append_pair("scope", &self.config.scopes)
            .append_pair("state", state)
            .append_pair("code_challenge", code_challenge)
            .append_pair("code_challenge_method", CHALLENGE_METHOD)
            .extend_pairs(&self.config.extra_authorize_params);
    }
}
