//! Error types for OAuth authentication and session management
//!
//! Every failure that reaches a caller is an [`OAuthError`]: a closed
//! [`OAuthErrorKind`], a message suitable for direct display, and a
//! `recoverable` flag that tells UI code whether a "try again" affordance
//! makes sense. Errors are only constructed through [`crate::auth::classify`],
//! so the kind/recoverable pairing stays consistent across the crate.
//!
//! Infrastructure failures from the storage port ([`StorageError`]) and the
//! HTTP port ([`crate::transport::TransportError`]) are converted into the
//! taxonomy at the boundary where an operation has to fail.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Closed taxonomy of authentication failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OAuthErrorKind {
    /// Malformed request, bad callback, or rejected grant
    InvalidRequest,
    /// Client identity was rejected by the provider
    UnauthorizedClient,
    /// User or provider denied access
    AccessDenied,
    /// Requested scope is not allowed
    InvalidScope,
    /// Provider failed or returned something unusable
    ServerError,
    /// Provider is temporarily overloaded or in maintenance
    TemporarilyUnavailable,
    /// No response was received
    NetworkError,
    /// The access token is no longer accepted
    TokenExpired,
    /// The token is structurally invalid or missing
    InvalidToken,
    /// Provider asked us to slow down
    RateLimitExceeded,
}

impl OAuthErrorKind {
    /// All kinds, in declaration order
    pub const ALL: [Self; 10] = [
        Self::InvalidRequest,
        Self::UnauthorizedClient,
        Self::AccessDenied,
        Self::InvalidScope,
        Self::ServerError,
        Self::TemporarilyUnavailable,
        Self::NetworkError,
        Self::TokenExpired,
        Self::InvalidToken,
        Self::RateLimitExceeded,
    ];

    /// Wire name of the kind (`snake_case`)
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidRequest => "invalid_request",
            Self::UnauthorizedClient => "unauthorized_client",
            Self::AccessDenied => "access_denied",
            Self::InvalidScope => "invalid_scope",
            Self::ServerError => "server_error",
            Self::TemporarilyUnavailable => "temporarily_unavailable",
            Self::NetworkError => "network_error",
            Self::TokenExpired => "token_expired",
            Self::InvalidToken => "invalid_token",
            Self::RateLimitExceeded => "rate_limit_exceeded",
        }
    }

    /// Parse a wire name back into a kind
    #[must_use]
    pub fn from_code(code: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == code)
    }

    /// Whether an operation failing with this kind may succeed if retried
    #[must_use]
    pub fn is_recoverable(self) -> bool {
        matches!(
            self,
            Self::ServerError
                | Self::TemporarilyUnavailable
                | Self::NetworkError
                | Self::RateLimitExceeded
        )
    }

    /// Whether this kind invalidates the current credentials
    #[must_use]
    pub fn is_token_related(self) -> bool {
        matches!(self, Self::TokenExpired | Self::InvalidToken)
    }

    /// Default user-facing message for this kind
    #[must_use]
    pub fn default_message(self) -> &'static str {
        match self {
            Self::InvalidRequest => "The sign-in request was invalid. Please start again.",
            Self::UnauthorizedClient => "This application is not authorized to sign you in.",
            Self::AccessDenied => "Access was denied. Please approve the request to continue.",
            Self::InvalidScope => "The requested permissions are not available for your account.",
            Self::ServerError => "The service had a problem. Please try again.",
            Self::TemporarilyUnavailable => {
                "The service is temporarily unavailable. Please try again shortly."
            }
            Self::NetworkError => "Could not reach the service. Check your connection.",
            Self::TokenExpired => "Your session has expired. Please sign in again.",
            Self::InvalidToken => "Your credentials are no longer valid. Please sign in again.",
            Self::RateLimitExceeded => "Too many requests. Please wait a moment and try again.",
        }
    }
}

impl fmt::Display for OAuthErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classified authentication error
///
/// `Display` renders only the user message; diagnostic detail (status
/// codes, provider bodies) is available through [`OAuthError::detail`] for
/// logging and is never shown to end users.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{user_message}")]
pub struct OAuthError {
    kind: OAuthErrorKind,
    user_message: String,
    recoverable: bool,
    retry_after: Option<Duration>,
    detail: Option<String>,
}

impl OAuthError {
    pub(crate) fn new(kind: OAuthErrorKind) -> Self {
        Self {
            kind,
            user_message: kind.default_message().to_string(),
            recoverable: kind.is_recoverable(),
            retry_after: None,
            detail: None,
        }
    }

    pub(crate) fn with_message(mut self, message: impl Into<String>) -> Self {
        self.user_message = message.into();
        self
    }

    pub(crate) fn with_retry_after(mut self, retry_after: Option<Duration>) -> Self {
        self.retry_after = retry_after;
        self
    }

    pub(crate) fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub(crate) fn fatal(mut self) -> Self {
        self.recoverable = false;
        self
    }

    /// Error kind
    #[must_use]
    pub fn kind(&self) -> OAuthErrorKind {
        self.kind
    }

    /// Message suitable for direct display
    #[must_use]
    pub fn user_message(&self) -> &str {
        &self.user_message
    }

    /// Whether retrying the operation may succeed
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        self.recoverable
    }

    /// Server-requested cooldown, if any
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }

    /// Diagnostic detail for logs
    #[must_use]
    pub fn detail(&self) -> Option<&str> {
        self.detail.as_deref()
    }
}

/// Errors raised by [`crate::storage::KeyValueStore`] implementations
#[derive(Debug, Error)]
pub enum StorageError {
    /// I/O error during storage operations
    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Storage backend could not be reached
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

/// Result type alias for authentication operations
pub type Result<T> = std::result::Result<T, OAuthError>;
