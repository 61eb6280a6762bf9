//! Integration tests for security properties: PKCE generation, CSRF
//! defense and one-shot attempts
//!
//! These tests drive the public API only and check the guarantees hold
//! for every generated value, not just one sample.

mod common;

use std::collections::HashSet;
use std::sync::Arc;

use anthropic_oauth_session::auth::pkce::{MAX_VERIFIER_LEN, MIN_VERIFIER_LEN, RandomSource};
use anthropic_oauth_session::auth::{AuthorizationAttempt, AuthorizationRequestBuilder, OsRandom};
use anthropic_oauth_session::runtime::{ManualClock, SystemClock};
use anthropic_oauth_session::storage::StorageKeys;
use anthropic_oauth_session::{KeyValueStore, MemoryStore, OAuthConfig, OAuthErrorKind, SessionConfig};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use sha2::{Digest, Sha256};

use common::{open_context, scheduler, token_body, url_param};

const FLOWS: usize = 25;

fn is_unreserved(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | '~')
}

fn builder(store: Arc<dyn KeyValueStore>, verifier_length: usize) -> AuthorizationRequestBuilder {
    AuthorizationRequestBuilder::new(
        Arc::new(OAuthConfig::default()),
        store,
        Arc::new(OsRandom),
        Arc::new(SystemClock),
        verifier_length,
    )
}

fn pending_attempt(store: &dyn KeyValueStore) -> AuthorizationAttempt {
    let record = store
        .get(&StorageKeys::default().pending_authorization())
        .unwrap()
        .expect("pending attempt stored");
    serde_json::from_str(&record).unwrap()
}

// ============================================================================
// PKCE Generation
// ============================================================================

#[test]
fn test_flows_are_pairwise_unique() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new().context());
    let builder = builder(Arc::clone(&store), 64);

    let mut states = HashSet::new();
    let mut challenges = HashSet::new();
    let mut verifiers = HashSet::new();
    for _ in 0..FLOWS {
        let url = builder.start_flow().unwrap();
        let attempt = pending_attempt(store.as_ref());

        assert_eq!(attempt.code_verifier.len(), 64);
        assert!(attempt.code_verifier.chars().all(is_unreserved));

        states.insert(url_param(&url, "state").unwrap());
        challenges.insert(url_param(&url, "code_challenge").unwrap());
        verifiers.insert(attempt.code_verifier);
    }

    assert_eq!(states.len(), FLOWS);
    assert_eq!(challenges.len(), FLOWS);
    assert_eq!(verifiers.len(), FLOWS);
}

#[test]
fn test_challenge_matches_independent_hash() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new().context());

    for len in [MIN_VERIFIER_LEN, 64, MAX_VERIFIER_LEN] {
        let builder = builder(Arc::clone(&store), len);
        for _ in 0..5 {
            let url = builder.start_flow().unwrap();
            let attempt = pending_attempt(store.as_ref());
            assert_eq!(attempt.code_verifier.len(), len);

            let expected = URL_SAFE_NO_PAD.encode(Sha256::digest(attempt.code_verifier.as_bytes()));
            assert_eq!(url_param(&url, "code_challenge").unwrap(), expected);
            assert_eq!(
                url_param(&url, "code_challenge_method").as_deref(),
                Some("S256")
            );
        }
    }
}

#[test]
fn test_state_carries_at_least_128_bits() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new().context());
    let url = builder(store, 64).start_flow().unwrap();
    let state = url_param(&url, "state").unwrap();

    let raw = URL_SAFE_NO_PAD.decode(state.as_bytes()).unwrap();
    assert!(raw.len() * 8 >= 128, "state has only {} bits", raw.len() * 8);
}

#[test]
fn test_missing_randomness_is_fatal() {
    struct Broken;
    impl RandomSource for Broken {
        fn fill(&self, _dest: &mut [u8]) -> Result<(), String> {
            Err("entropy source unavailable".to_string())
        }
    }

    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new().context());
    let builder = AuthorizationRequestBuilder::new(
        Arc::new(OAuthConfig::default()),
        Arc::clone(&store),
        Arc::new(Broken),
        Arc::new(ManualClock::new(0)),
        64,
    );

    let err = builder.start_flow().unwrap_err();
    assert!(!err.is_recoverable());
    assert!(
        store
            .get(&StorageKeys::default().pending_authorization())
            .unwrap()
            .is_none()
    );
}

// ============================================================================
// CSRF and one-shot attempts
// ============================================================================

#[tokio::test]
async fn test_wrong_state_is_always_rejected() {
    let backend = MemoryStore::new();
    let ctx = open_context(&backend, &scheduler(), SessionConfig::default());
    let url = ctx.client.start_flow().unwrap();
    let state = url_param(&url, "state").unwrap();

    let mut tampered = state.clone();
    tampered.pop();
    let wrong_states = [
        String::new(),
        "attacker-state".to_string(),
        tampered,
        format!("{state}x"),
        state.to_uppercase(),
    ];

    for wrong in wrong_states.iter().filter(|w| **w != state) {
        let err = ctx
            .client
            .handle_callback("abc123valid", wrong)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), OAuthErrorKind::InvalidRequest);
    }

    assert_eq!(ctx.transport.request_count(), 0);
    assert!(!ctx.client.is_authenticated());

    // The genuine redirect still completes.
    ctx.transport.push_json(200, &token_body("tok", None));
    ctx.client
        .handle_callback("abc123valid", &state)
        .await
        .unwrap();
    assert!(ctx.client.is_authenticated());
}

#[tokio::test]
async fn test_callback_is_one_shot() {
    let backend = MemoryStore::new();
    let ctx = open_context(&backend, &scheduler(), SessionConfig::default());
    let url = ctx.client.start_flow().unwrap();
    let state = url_param(&url, "state").unwrap();

    ctx.transport.push_json(200, &token_body("tok", None));
    ctx.client
        .handle_callback("abc123valid", &state)
        .await
        .unwrap();

    let err = ctx
        .client
        .handle_callback("abc123valid", &state)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), OAuthErrorKind::InvalidRequest);
    assert_eq!(ctx.transport.request_count(), 1);
}

#[tokio::test]
async fn test_new_flow_invalidates_previous_attempt() {
    let backend = MemoryStore::new();
    let ctx = open_context(&backend, &scheduler(), SessionConfig::default());
    let first = url_param(&ctx.client.start_flow().unwrap(), "state").unwrap();
    let _second = ctx.client.start_flow().unwrap();

    let err = ctx
        .client
        .handle_callback("abc123valid", &first)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), OAuthErrorKind::InvalidRequest);
    assert_eq!(ctx.transport.request_count(), 0);
}

#[tokio::test]
async fn test_implausible_code_never_reaches_token_endpoint() {
    let backend = MemoryStore::new();
    let ctx = open_context(&backend, &scheduler(), SessionConfig::default());
    let state = url_param(&ctx.client.start_flow().unwrap(), "state").unwrap();

    for code in ["", "abc", "has space", &"x".repeat(5000)] {
        let err = ctx.client.handle_callback(code, &state).await.unwrap_err();
        assert_eq!(err.kind(), OAuthErrorKind::InvalidRequest);
    }
    assert_eq!(ctx.transport.request_count(), 0);
}
