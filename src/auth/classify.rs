//! Error classifier
//!
//! Maps HTTP statuses, transport failures and provider error codes onto
//! [`OAuthErrorKind`]. This is the only place [`OAuthError`] values are
//! built, so the `recoverable` flag always agrees with the kind.
//!
//! Status mapping for the token endpoint:
//!
//! | status        | kind                      |
//! |---------------|---------------------------|
//! | 400           | `invalid_request` (or the provider's `error` code) |
//! | 401           | `unauthorized_client`     |
//! | 403           | `access_denied`           |
//! | 404           | `invalid_request`         |
//! | 429           | `rate_limit_exceeded`     |
//! | 502, 503, 504 | `temporarily_unavailable` |
//! | other 5xx     | `server_error`            |
//! | other 4xx     | `invalid_request`         |
//!
//! Resource calls use the same table except that 401 means the access
//! token itself was rejected (`token_expired`).

use std::time::Duration;

use serde::Deserialize;

use crate::error::{OAuthError, OAuthErrorKind, StorageError};
use crate::transport::TransportError;
use crate::utils::truncate_for_display;

const MAX_LOGGED_BODY: usize = 256;

/// Error body returned by OAuth endpoints
#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Kind for a token-endpoint status
#[must_use]
pub fn kind_for_token_status(status: u16) -> OAuthErrorKind {
    match status {
        401 => OAuthErrorKind::UnauthorizedClient,
        403 => OAuthErrorKind::AccessDenied,
        // Kept as invalid_request for parity with the existing client even
        // though providers usually mean a misconfigured endpoint here.
        404 => OAuthErrorKind::InvalidRequest,
        429 => OAuthErrorKind::RateLimitExceeded,
        502..=504 => OAuthErrorKind::TemporarilyUnavailable,
        s if s >= 500 => OAuthErrorKind::ServerError,
        _ => OAuthErrorKind::InvalidRequest,
    }
}

/// Kind for a protected-resource status
#[must_use]
pub fn kind_for_resource_status(status: u16) -> OAuthErrorKind {
    match status {
        401 => OAuthErrorKind::TokenExpired,
        s => kind_for_token_status(s),
    }
}

/// Map an OAuth `error` code from a provider body or redirect
#[must_use]
pub fn kind_for_provider_code(code: &str) -> Option<OAuthErrorKind> {
    match code {
        "invalid_client" => Some(OAuthErrorKind::UnauthorizedClient),
        "invalid_grant" | "unsupported_grant_type" | "unsupported_response_type" => {
            Some(OAuthErrorKind::InvalidRequest)
        }
        other => OAuthErrorKind::from_code(other),
    }
}

/// Parse a `Retry-After` header given in delta-seconds
///
/// HTTP-date values are not supported and yield `None`, which makes the
/// retry loop fall back to exponential back-off.
#[must_use]
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

fn status_error(kind: OAuthErrorKind, status: u16, retry_after: Option<&str>, body: &str) -> OAuthError {
    let retry_after = if kind == OAuthErrorKind::RateLimitExceeded {
        retry_after.and_then(parse_retry_after)
    } else {
        None
    };
    OAuthError::new(kind)
        .with_retry_after(retry_after)
        .with_detail(format!(
            "HTTP {status}: {}",
            truncate_for_display(body, MAX_LOGGED_BODY)
        ))
}

/// Classify a non-success response from the token endpoint
#[must_use]
pub fn from_token_status(status: u16, retry_after: Option<&str>, body: &str) -> OAuthError {
    let mut kind = kind_for_token_status(status);
    let Ok(provider) = serde_json::from_str::<ErrorResponse>(body) else {
        return status_error(kind, status, retry_after, body);
    };
    if status == 400 {
        if let Some(code_kind) = kind_for_provider_code(&provider.error) {
            kind = code_kind;
        }
    }
    let summary = match provider.error_description {
        Some(description) => format!("{}: {description}", provider.error),
        None => provider.error,
    };
    status_error(kind, status, retry_after, &summary)
}

/// Classify a non-success response from a protected resource
#[must_use]
pub fn from_resource_status(status: u16, retry_after: Option<&str>, body: &str) -> OAuthError {
    status_error(kind_for_resource_status(status), status, retry_after, body)
}

/// Classify a failure where no response was received
#[must_use]
pub fn from_transport(error: &TransportError) -> OAuthError {
    network_failure(error.to_string())
}

/// Network failure with a diagnostic detail
#[must_use]
pub fn network_failure(detail: impl Into<String>) -> OAuthError {
    OAuthError::new(OAuthErrorKind::NetworkError).with_detail(detail)
}

/// Classify an `?error=` redirect from the authorization endpoint
#[must_use]
pub fn from_provider_redirect(error: &str, description: Option<&str>) -> OAuthError {
    let kind = kind_for_provider_code(error).unwrap_or(OAuthErrorKind::InvalidRequest);
    let detail = match description {
        Some(description) => format!("provider redirect error {error}: {description}"),
        None => format!("provider redirect error {error}"),
    };
    OAuthError::new(kind).with_detail(detail)
}

/// A request or callback failed local validation
#[must_use]
pub fn invalid_request(reason: impl Into<String>) -> OAuthError {
    OAuthError::new(OAuthErrorKind::InvalidRequest).with_detail(reason)
}

/// A token is missing or structurally unusable
#[must_use]
pub fn invalid_token(reason: impl Into<String>) -> OAuthError {
    OAuthError::new(OAuthErrorKind::InvalidToken).with_detail(reason)
}

/// The access token has expired or was rejected
#[must_use]
pub fn token_expired(reason: impl Into<String>) -> OAuthError {
    OAuthError::new(OAuthErrorKind::TokenExpired).with_detail(reason)
}

/// A 2xx token response that lacks required fields
#[must_use]
pub fn malformed_token_response(detail: impl Into<String>) -> OAuthError {
    OAuthError::new(OAuthErrorKind::ServerError)
        .with_message("The sign-in service returned an unexpected response. Please try again.")
        .with_detail(detail)
}

/// The secure random source failed; PKCE guarantees cannot be met
#[must_use]
pub fn randomness_unavailable(detail: impl Into<String>) -> OAuthError {
    OAuthError::new(OAuthErrorKind::ServerError)
        .with_message("Secure sign-in is not available on this device.")
        .with_detail(detail)
        .fatal()
}

/// An exchange or refresh is already running for this session
#[must_use]
pub fn operation_in_flight(operation: &str) -> OAuthError {
    OAuthError::new(OAuthErrorKind::TemporarilyUnavailable)
        .with_message("Sign-in is already in progress. Please wait a moment.")
        .with_detail(format!("{operation} rejected: token operation in flight"))
}

/// Durable storage failed while an operation depended on it
#[must_use]
pub fn storage_failure(error: &StorageError) -> OAuthError {
    OAuthError::new(OAuthErrorKind::ServerError)
        .with_message("Your sign-in could not be saved on this device.")
        .with_detail(error.to_string())
        .fatal()
}
