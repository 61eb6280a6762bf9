//! Authorization callback validation
//!
//! Runs before any network call. The gates are applied in order and each
//! one is final:
//!
//! 1. a pending [`AuthorizationAttempt`] must exist (and be younger than
//!    the attempt TTL)
//! 2. the returned `state` must equal the stored one (CSRF defense)
//! 3. the `code` must look like an authorization code
//!
//! A state mismatch leaves the pending attempt in place so a forged
//! callback cannot cancel a legitimate sign-in. Success consumes it.

use std::sync::Arc;
use std::time::Duration;

use url::form_urlencoded;

use super::authorize::AuthorizationAttempt;
use super::classify;
use super::pkce::constant_time_eq;
use crate::error::Result;
use crate::runtime::Clock;
use crate::storage::{KeyValueStore, StorageKeys};

/// Shortest authorization code accepted
pub const MIN_CODE_LEN: usize = 6;
const MAX_CODE_LEN: usize = 4096;

/// Code and verifier ready for token exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedCallback {
    /// Authorization code from the provider
    pub code: String,
    /// Verifier of the attempt the code belongs to
    pub code_verifier: String,
}

/// Parameters carried by the redirect back from the provider
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RedirectParams {
    /// `code` parameter
    pub code: Option<String>,
    /// `state` parameter
    pub state: Option<String>,
    /// `error` parameter
    pub error: Option<String>,
    /// `error_description` parameter
    pub error_description: Option<String>,
}

impl RedirectParams {
    /// Parse a redirect query string (`?code=…&state=…` or `?error=…`)
    #[must_use]
    pub fn parse(query: &str) -> Self {
        let query = query.split_once('?').map_or(query, |(_, q)| q);
        let query = query.split_once('#').map_or(query, |(q, _)| q);
        let mut params = Self::default();
        for (key, value) in form_urlencoded::parse(query.as_bytes()) {
            let slot = match &*key {
                "code" => &mut params.code,
                "state" => &mut params.state,
                "error" => &mut params.error,
                "error_description" => &mut params.error_description,
                _ => continue,
            };
            *slot = Some(value.into_owned());
        }
        params
    }

    /// Parse the `code#state` text shown by the hosted callback page
    #[must_use]
    pub fn from_pasted(input: &str) -> Self {
        let input = input.trim();
        match input.split_once('#') {
            Some((code, state)) => Self {
                code: Some(code.to_string()),
                state: Some(state.to_string()),
                ..Self::default()
            },
            None => Self {
                code: Some(input.to_string()),
                ..Self::default()
            },
        }
    }
}

/// Validates redirects against the pending authorization attempt
pub struct CallbackValidator {
    store: Arc<dyn KeyValueStore>,
    keys: StorageKeys,
    clock: Arc<dyn Clock>,
    attempt_ttl: Duration,
}

impl std::fmt::Debug for CallbackValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackValidator")
            .field("keys", &self.keys)
            .field("attempt_ttl", &self.attempt_ttl)
            .finish_non_exhaustive()
    }
}

impl CallbackValidator {
    /// Create a validator over the given store
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        keys: StorageKeys,
        clock: Arc<dyn Clock>,
        attempt_ttl: Duration,
    ) -> Self {
        Self {
            store,
            keys,
            clock,
            attempt_ttl,
        }
    }

    /// Current pending attempt, discarding expired or corrupt records
    #[must_use]
    pub fn pending(&self) -> Option<AuthorizationAttempt> {
        let key = self.keys.pending_authorization();
        let record = match self.store.get(&key) {
            Ok(record) => record?,
            Err(e) => {
                tracing::warn!(error = %e, "Could not read pending authorization");
                return None;
            }
        };

        let attempt = match serde_json::from_str::<AuthorizationAttempt>(&record) {
            Ok(attempt) => attempt,
            Err(e) => {
                tracing::warn!(error = %e, "Discarding corrupt pending authorization");
                self.discard();
                return None;
            }
        };

        let age = self.clock.now_millis().saturating_sub(attempt.created_at);
        if age > self.attempt_ttl.as_millis() as u64 {
            tracing::debug!(age_ms = age, "Discarding stale pending authorization");
            self.discard();
            return None;
        }

        Some(attempt)
    }

    /// Validate a callback and consume the pending attempt
    ///
    /// # Errors
    /// Returns `invalid_request` if there is no pending attempt, the state
    /// does not match, or the code is implausible.
    pub fn validate(&self, code: &str, state: &str) -> Result<ValidatedCallback> {
        let Some(attempt) = self.pending() else {
            return Err(classify::invalid_request(
                "callback received without a pending authorization attempt",
            ));
        };

        if !constant_time_eq(attempt.state.as_bytes(), state.as_bytes()) {
            tracing::warn!("Rejected callback with mismatched state");
            return Err(classify::invalid_request("state parameter mismatch"));
        }

        let code = code.trim();
        if code.len() < MIN_CODE_LEN
            || code.len() > MAX_CODE_LEN
            || code.chars().any(char::is_whitespace)
        {
            return Err(classify::invalid_request(format!(
                "implausible authorization code ({} chars)",
                code.len()
            )));
        }

        self.discard();
        Ok(ValidatedCallback {
            code: code.to_string(),
            code_verifier: attempt.code_verifier,
        })
    }

    /// Forget the pending attempt (abandoned flow)
    pub fn discard(&self) {
        if let Err(e) = self.store.remove(&self.keys.pending_authorization()) {
            tracing::warn!(error = %e, "Could not clear pending authorization");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OAuthErrorKind;
    use crate::runtime::ManualClock;
    use crate::storage::MemoryStore;

    fn setup(state: &str, created_at: u64) -> (CallbackValidator, Arc<dyn KeyValueStore>, ManualClock) {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new().context());
        let clock = ManualClock::new(created_at);
        let attempt = AuthorizationAttempt {
            state: state.to_string(),
            code_verifier: "v".repeat(64),
            created_at,
        };
        store
            .set(
                &StorageKeys::default().pending_authorization(),
                &serde_json::to_string(&attempt).unwrap(),
            )
            .unwrap();
        let validator = CallbackValidator::new(
            Arc::clone(&store),
            StorageKeys::default(),
            Arc::new(clock.clone()),
            Duration::from_secs(600),
        );
        (validator, store, clock)
    }

    #[test]
    fn test_valid_callback_consumes_attempt() {
        let (validator, _store, _clock) = setup("state-123", 0);

        let validated = validator.validate("abc123valid", "state-123").unwrap();
        assert_eq!(validated.code, "abc123valid");
        assert_eq!(validated.code_verifier, "v".repeat(64));

        let replay = validator.validate("abc123valid", "state-123").unwrap_err();
        assert_eq!(replay.kind(), OAuthErrorKind::InvalidRequest);
    }

    #[test]
    fn test_state_mismatch_keeps_attempt() {
        let (validator, _store, _clock) = setup("state-123", 0);

        let err = validator.validate("abc123valid", "state-999").unwrap_err();
        assert_eq!(err.kind(), OAuthErrorKind::InvalidRequest);
        assert!(validator.pending().is_some());

        assert!(validator.validate("abc123valid", "state-123").is_ok());
    }

    #[test]
    fn test_rejects_implausible_codes() {
        let (validator, _store, _clock) = setup("s", 0);
        for code in ["", "abc", "has space inside"] {
            let err = validator.validate(code, "s").unwrap_err();
            assert_eq!(err.kind(), OAuthErrorKind::InvalidRequest, "code {code:?}");
        }
    }

    #[test]
    fn test_no_pending_attempt() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new().context());
        let validator = CallbackValidator::new(
            store,
            StorageKeys::default(),
            Arc::new(ManualClock::new(0)),
            Duration::from_secs(600),
        );
        let err = validator.validate("abc123valid", "s").unwrap_err();
        assert_eq!(err.kind(), OAuthErrorKind::InvalidRequest);
    }

    #[test]
    fn test_stale_attempt_is_discarded() {
        let (validator, store, clock) = setup("s", 1_000);
        clock.advance(Duration::from_secs(601));

        assert!(validator.validate("abc123valid", "s").is_err());
        assert!(
            store
                .get(&StorageKeys::default().pending_authorization())
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn test_redirect_params_parse() {
        let params = RedirectParams::parse("https://app.example/cb?code=abc%2B1&state=xyz");
        assert_eq!(params.code.as_deref(), Some("abc+1"));
        assert_eq!(params.state.as_deref(), Some("xyz"));
        assert!(params.error.is_none());

        let params = RedirectParams::parse("?error=access_denied&error_description=User+denied");
        assert_eq!(params.error.as_deref(), Some("access_denied"));
        assert_eq!(params.error_description.as_deref(), Some("User denied"));
    }

    #[test]
    fn test_redirect_params_decode_utf8_and_ignore_fragment() {
        let params = RedirectParams::parse(
            "https://app.example/cb?error=access_denied&error_description=Zugriff%20verweigert%20%E2%9C%8B#frag",
        );
        assert_eq!(
            params.error_description.as_deref(),
            Some("Zugriff verweigert \u{270b}")
        );
        assert!(params.code.is_none());
    }

    #[test]
    fn test_redirect_params_from_pasted() {
        let params = RedirectParams::from_pasted("  code123#state456\n");
        assert_eq!(params.code.as_deref(), Some("code123"));
        assert_eq!(params.state.as_deref(), Some("state456"));
    }
}
